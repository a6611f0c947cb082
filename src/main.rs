use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use chain_runner::aggregator::{PytestReportParser, ReportParser};
use chain_runner::codegen::{self, ChainRenderer, PytestRenderer};
use chain_runner::config::{self, RunConfig};
use chain_runner::executors::HttpDispatcher;
use chain_runner::limits::{ExecutionLimits, RetryCounter};
use chain_runner::protocol::RelationEdge;
use chain_runner::retry::{RetryPolicy, RetryingDispatcher};
use chain_runner::runner::parallel;
use chain_runner::telemetry::{self, TelemetryConfig};
use chain_runner::{planner, ChainError, ChainExecutor, ExecutionPlan, OperationCatalog, RelationSet};

#[derive(Parser)]
#[command(name = "chain-runner")]
#[command(about = "Resolves API dependency chains and executes them", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PlanInput {
    /// Relation descriptor (JSON or YAML)
    #[arg(short, long)]
    relations: PathBuf,

    /// Directory with one definition file per operation
    #[arg(long)]
    operations: PathBuf,

    /// Active condition for conditional relations (repeatable)
    #[arg(long = "condition")]
    conditions: Vec<String>,

    /// Limits preset; replaces CHAIN_* limits, explicit flags still win
    #[arg(long, value_enum)]
    limits: Option<LimitsPreset>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LimitsPreset {
    Default,
    Strict,
    Relaxed,
}

impl PlanInput {
    /// Configuração do ambiente com preset e condições da linha de comando.
    fn config(&self) -> Result<RunConfig> {
        let mut config = RunConfig::from_env()?;
        if let Some(preset) = self.limits {
            config.limits = match preset {
                LimitsPreset::Default => ExecutionLimits::default(),
                LimitsPreset::Strict => ExecutionLimits::strict(),
                LimitsPreset::Relaxed => ExecutionLimits::relaxed(),
            };
        }
        config.active_conditions.extend(self.conditions.iter().cloned());
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Builds the plan and executes the chain
    Execute {
        #[command(flatten)]
        input: PlanInput,

        /// Base URL of the API under test
        #[arg(long)]
        base_url: Option<String>,

        /// Path to the output report file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Default header as 'Name: value' (repeatable, supports ${ENV_NAME})
        #[arg(long = "header")]
        headers: Vec<String>,

        #[arg(long)]
        request_timeout_ms: Option<u64>,

        #[arg(long)]
        run_timeout_secs: Option<u64>,

        /// Runs disconnected components concurrently
        #[arg(long)]
        parallel: bool,

        /// Attempts per call on transport errors
        #[arg(long, default_value_t = 1)]
        retries: u32,
    },

    /// Prints the execution order without calling the API
    Plan {
        #[command(flatten)]
        input: PlanInput,
    },

    /// Writes the chain as a pytest module
    Generate {
        #[command(flatten)]
        input: PlanInput,

        /// Path to the generated file
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long)]
        base_url: Option<String>,

        /// Default header as 'Name: value' (repeatable, supports ${ENV_NAME})
        #[arg(long = "header")]
        headers: Vec<String>,
    },

    /// Parses an external test runner report
    ParseReport {
        /// Path to the report text file
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[derive(Serialize)]
struct PlanView<'a> {
    fingerprint: String,
    order: &'a [String],
    components: Vec<Vec<String>>,
    edges: &'a [RelationEdge],
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init_telemetry(TelemetryConfig::from_env()) {
        eprintln!("⚠️  Telemetry disabled: {:#}", e);
    }

    let code = match dispatch_command(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            // Erros da cadeia saem também em JSON para quem consome o stdout.
            if let Some(chain_error) = e.downcast_ref::<ChainError>() {
                if let Ok(json) = serde_json::to_string_pretty(chain_error) {
                    println!("{}", json);
                }
            }
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    };

    telemetry::shutdown_telemetry();
    code
}

async fn dispatch_command(command: Commands) -> Result<bool> {
    match command {
        Commands::Execute {
            input,
            base_url,
            output,
            headers,
            request_timeout_ms,
            run_timeout_secs,
            parallel,
            retries,
        } => {
            let mut config = input.config()?;
            if let Some(url) = base_url {
                config.base_url = url;
            }
            if let Some(ms) = request_timeout_ms {
                config.limits.request_timeout = Duration::from_millis(ms);
            }
            if let Some(secs) = run_timeout_secs {
                config.limits.run_timeout = Duration::from_secs(secs);
            }
            config = apply_headers(config, &headers)?;

            execute(&input, config, output.as_deref(), parallel, retries).await
        }
        Commands::Plan { input } => {
            let config = input.config()?;

            let (plan, _) = load_plan(&input, &config)?;
            let view = PlanView {
                fingerprint: plan.fingerprint(),
                order: plan.order(),
                components: plan
                    .components()
                    .iter()
                    .map(|c| c.order().to_vec())
                    .collect(),
                edges: plan.edges(),
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(true)
        }
        Commands::Generate {
            input,
            output,
            base_url,
            headers,
        } => {
            let mut config = input.config()?;
            if let Some(url) = base_url {
                config.base_url = url;
            }
            config = apply_headers(config, &headers)?;

            let (plan, catalog) = load_plan(&input, &config)?;
            let renderer = PytestRenderer::new(
                config.base_url.clone(),
                config.limits.request_timeout.as_secs_f64(),
            )
            .with_default_headers(config.default_headers.clone());
            let code = renderer.render(&plan, &catalog)?;
            codegen::write_artifact(&output, &code)?;

            eprintln!("📄 Chain test written to: {:?}", output);
            Ok(true)
        }
        Commands::ParseReport { file } => {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read report: {}", file.display()))?;
            let report = PytestReportParser.parse(&content);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.failed == 0 && report.errors == 0)
        }
    }
}

fn apply_headers(mut config: RunConfig, headers: &[String]) -> Result<RunConfig> {
    for raw in headers {
        let (name, value) = config::parse_header(raw)?;
        config = config.with_header(name, &value)?;
    }
    Ok(config)
}

fn load_plan(input: &PlanInput, config: &RunConfig) -> Result<(ExecutionPlan, OperationCatalog)> {
    let descriptor = fs::read_to_string(&input.relations).with_context(|| {
        format!(
            "Failed to read relation descriptor: {}",
            input.relations.display()
        )
    })?;
    let relations = RelationSet::load(&descriptor)?;
    let catalog = OperationCatalog::load_dir(&input.operations)?;

    let plan = planner::prepare(
        &relations,
        &catalog,
        &config.active_conditions,
        &config.limits,
    )?;
    eprintln!("📋 Plan built: {} operations", plan.len());
    Ok((plan, catalog))
}

async fn execute(
    input: &PlanInput,
    config: RunConfig,
    output: Option<&Path>,
    parallel: bool,
    retries: u32,
) -> Result<bool> {
    let (plan, catalog) = load_plan(input, &config)?;

    let dispatcher: Arc<dyn HttpDispatcher> = if retries > 1 {
        let budget = Arc::new(RetryCounter::new(config.limits.max_retries_total));
        Arc::new(
            RetryingDispatcher::new(config.dispatcher(), RetryPolicy::with_attempts(retries))
                .with_budget(budget),
        )
    } else {
        Arc::new(config.dispatcher())
    };
    let executor = ChainExecutor::new(config, dispatcher);

    // Ctrl+C para a cadeia entre steps; o resumo parcial ainda é emitido.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    eprintln!("▶️  Starting execution...");
    let (json, success) = if parallel {
        let summaries =
            parallel::run_components(&executor, &plan, Arc::new(catalog), &cancel).await?;
        let success = summaries.iter().all(|s| s.is_success());
        (serde_json::to_string_pretty(&summaries)?, success)
    } else {
        let summary = executor.run_with_cancel(&plan, &catalog, &cancel).await?;
        eprintln!(
            "🏁 Execution finished: {}/{} passed ({}ms)",
            summary.passed, summary.planned, summary.duration_ms
        );
        (serde_json::to_string_pretty(&summary)?, summary.is_success())
    };

    match output {
        Some(path) => {
            fs::write(path, json)
                .with_context(|| format!("Failed to write report: {}", path.display()))?;
            eprintln!("📄 Report saved to: {:?}", path);
        }
        None => println!("{}", json),
    }

    Ok(success)
}
