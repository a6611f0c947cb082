//! # chain-runner
//!
//! Resolve dependências entre operações de API e executa a cadeia
//! resultante, passando campos das respostas para os requests seguintes.
//!
//! Fluxo:
//!
//! ```text
//! relations + catalog ──> planner ──> runner (context + bindings) ──> aggregator
//!                                 └──> codegen (artefato pytest)
//! ```

pub mod aggregator;
pub mod bindings;
pub mod catalog;
pub mod codegen;
pub mod config;
pub mod context;
pub mod errors;
pub mod executors;
pub mod limits;
pub mod loader;
pub mod planner;
pub mod protocol;
pub mod relations;
pub mod retry;
pub mod runner;
pub mod telemetry;

pub use catalog::OperationCatalog;
pub use config::RunConfig;
pub use errors::ChainError;
pub use planner::ExecutionPlan;
pub use relations::RelationSet;
pub use runner::ChainExecutor;
