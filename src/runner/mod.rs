//! # Executor de Cadeia
//!
//! Percorre o plano ordenado e executa cada operação com a máquina de
//! estados abaixo:
//!
//! ```text
//! Build ──> Dispatch ──> Capture ──> Verify
//!   │          │                       │
//!   └─ falha   └─ falha                └─ status fora do esperado
//!      (step)     (step)                  (step)
//! ```
//!
//! - **Build**: template da operação + bindings de todas as arestas de
//!   entrada, lidos do contexto.
//! - **Dispatch**: chamada HTTP pelo `HttpDispatcher`.
//! - **Capture**: o body da resposta vai para o contexto, mesmo quando o
//!   status não é o esperado.
//! - **Verify**: compara o status com os declarados na operação.
//!
//! Falhas de step ficam registradas no resultado e a cadeia continua. Um
//! step que não capturou resposta faz seus dependentes falharem com
//! `UpstreamFieldMissing`; os demais seguem normalmente.
//!
//! Timeout total e cancelamento são verificados entre steps. O
//! cancelamento nunca interrompe uma chamada em andamento; o timeout total
//! abandona a chamada em curso e encerra a execução.

pub mod parallel;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::{self, RunMetadata};
use crate::bindings;
use crate::catalog::OperationCatalog;
use crate::config::RunConfig;
use crate::context::ExecutionContext;
use crate::errors::ChainError;
use crate::executors::HttpDispatcher;
use crate::planner::ExecutionPlan;
use crate::protocol::{ChainRunSummary, ChainStepResult, OperationDefinition, StepStatus};

/// Executa planos contra uma API através de um dispatcher.
///
/// Não guarda estado entre execuções: cada `run` cria seu próprio contexto.
#[derive(Clone)]
pub struct ChainExecutor {
    config: RunConfig,
    dispatcher: Arc<dyn HttpDispatcher>,
}

impl ChainExecutor {
    pub fn new(config: RunConfig, dispatcher: Arc<dyn HttpDispatcher>) -> Self {
        Self { config, dispatcher }
    }

    /// Executor com o dispatcher reqwest configurado a partir de `config`.
    pub fn with_reqwest(config: RunConfig) -> Self {
        let dispatcher = Arc::new(config.dispatcher());
        Self::new(config, dispatcher)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Executa o plano até o fim, sem cancelamento externo.
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        catalog: &OperationCatalog,
    ) -> Result<ChainRunSummary, ChainError> {
        self.run_with_cancel(plan, catalog, &CancellationToken::new())
            .await
    }

    /// Executa o plano, parando entre steps se `cancel` for acionado.
    ///
    /// `Err` só acontece antes de qualquer chamada HTTP (operação ausente do
    /// catálogo). Falhas durante a execução ficam no resumo.
    #[tracing::instrument(name = "chain_run", skip_all, fields(operations = plan.len()))]
    pub async fn run_with_cancel(
        &self,
        plan: &ExecutionPlan,
        catalog: &OperationCatalog,
        cancel: &CancellationToken,
    ) -> Result<ChainRunSummary, ChainError> {
        let definitions = plan
            .order()
            .iter()
            .map(|id| catalog.get(id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut meta = RunMetadata::new(plan.fingerprint(), plan.len());
        let started = Instant::now();
        let run_timeout = self.config.limits.run_timeout;
        // Orçamento grande demais para o relógio vira execução sem prazo.
        let deadline = tokio::time::Instant::now().checked_add(run_timeout);

        info!(run_id = %meta.run_id, fingerprint = %meta.plan_fingerprint, "Iniciando execução da cadeia");

        let mut context = ExecutionContext::new();
        let mut results = Vec::with_capacity(definitions.len());
        let mut run_error = None;

        for definition in definitions {
            if cancel.is_cancelled() {
                warn!(operation_id = %definition.id, "Execução cancelada antes do step");
                run_error = Some(ChainError::RunCancelled);
                break;
            }

            let step = self.execute_step(definition, plan, &mut context);
            let outcome = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, step).await,
                None => Ok(step.await),
            };
            match outcome {
                Ok(result) => results.push(result),
                Err(_) => {
                    warn!(operation_id = %definition.id, "Tempo total da execução esgotado");
                    run_error = Some(ChainError::RunTimeout {
                        budget_ms: run_timeout.as_millis() as u64,
                    });
                    break;
                }
            }
        }

        meta.finished_at = Utc::now();
        meta.duration_ms = started.elapsed().as_millis() as u64;

        let summary = aggregator::summarize_run(results, meta, run_error);
        info!(
            run_id = %summary.run_id,
            status = %summary.status,
            passed = summary.passed,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "Execução da cadeia finalizada"
        );
        Ok(summary)
    }

    async fn execute_step(
        &self,
        definition: &OperationDefinition,
        plan: &ExecutionPlan,
        context: &mut ExecutionContext,
    ) -> ChainStepResult {
        let start_time = Instant::now();
        let mut result = ChainStepResult {
            operation_id: definition.id.clone(),
            status: StepStatus::Failed,
            request: None,
            response: None,
            duration_ms: 0,
            error: None,
        };

        // Build
        let request = match bindings::build_request(definition, plan.incoming(&definition.id), context) {
            Ok(request) => request,
            Err(e) => {
                warn!(operation_id = %definition.id, error = %e, "Falha ao montar request");
                result.error = Some(e);
                result.duration_ms = start_time.elapsed().as_millis() as u64;
                return result;
            }
        };

        // Dispatch
        let outcome = self.dispatcher.dispatch(&request).await;
        result.request = Some(request);
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(operation_id = %definition.id, error = %e, "Falha de transporte");
                result.error = Some(e);
                result.duration_ms = start_time.elapsed().as_millis() as u64;
                return result;
            }
        };

        // Capture
        context.store(definition.id.clone(), response.body.clone());

        // Verify
        let status = response.status;
        if definition.expects_status(status) {
            result.status = StepStatus::Passed;
        } else {
            result.error = Some(ChainError::AssertionFailure {
                expected: definition.success_statuses.clone(),
                actual: status,
            });
        }
        result.response = Some(response);
        result.duration_ms = start_time.elapsed().as_millis() as u64;

        info!(
            operation_id = %definition.id,
            status,
            passed = result.passed(),
            duration_ms = result.duration_ms,
            "Step finalizado"
        );
        result
    }
}
