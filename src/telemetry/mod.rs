//! # Módulo de Telemetria
//!
//! Inicializa o `tracing` do processo: logs no console e, quando existe um
//! coletor configurado, exportação de spans via OpenTelemetry (OTLP/gRPC).
//!
//! Os spans principais são `chain_run` (uma execução de cadeia) e
//! `http_dispatch` (uma chamada HTTP), com os campos `operation_id`,
//! `status` e `duration_ms` nos eventos.
//!
//! ## Configuração via variáveis de ambiente:
//!
//! - `RUST_LOG`: filtro de log (tem prioridade sobre `log_level`)
//! - `OTEL_SERVICE_NAME`: Nome do serviço
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: URL do coletor OTLP
//! - `OTEL_TRACES_SAMPLER_ARG`: Taxa de sampling (0.0-1.0)
//!
//! ```ignore
//! init_telemetry(TelemetryConfig::from_env())?;
//! // ... executar cadeias ...
//! shutdown_telemetry(); // Flush dos spans pendentes
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_SERVICE_NAME: &str = "chain-runner";

/// Configuração do sistema de telemetria.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Nome do serviço nos traces.
    pub service_name: String,

    /// Endpoint OTLP, ex.: "http://localhost:4317". Se None, só console.
    pub otlp_endpoint: Option<String>,

    /// Taxa de sampling (0.0 a 1.0).
    pub sampling_ratio: f64,

    pub enable_console_logging: bool,

    /// Nível mínimo quando `RUST_LOG` não está definido.
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.is_empty()) {
            config.otlp_endpoint = Some(endpoint);
        }

        if let Some(r) = lookup("OTEL_TRACES_SAMPLER_ARG").and_then(|v| v.parse::<f64>().ok()) {
            config.sampling_ratio = r.clamp(0.0, 1.0);
        }

        config
    }

    /// Mantém só avisos e erros no console (ex.: saída JSON no stdout).
    pub fn quiet(mut self) -> Self {
        self.log_level = Level::WARN;
        self
    }
}

/// Instala o subscriber global.
///
/// - `Ok(Some(Tracer))`: OTLP configurado
/// - `Ok(None)`: apenas console
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    // Logs vão para stderr; stdout fica livre para os relatórios JSON.
    fn console_layer<S>(enabled: bool) -> Option<impl tracing_subscriber::Layer<S>>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        enabled.then(|| {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
        })
    }

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;

        tracing_subscriber::registry()
            .with(env_filter)
            .with(OpenTelemetryLayer::new(tracer.clone()))
            .with(console_layer(config.enable_console_logging))
            .try_init()?;

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "Telemetria OTEL inicializada"
        );
        Ok(Some(tracer))
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer(config.enable_console_logging))
            .try_init()?;

        tracing::debug!("Telemetria inicializada (apenas console, sem OTLP)");
        Ok(None)
    }
}

fn init_otlp_tracer(
    service_name: &str,
    endpoint: &str,
    sampling_ratio: f64,
) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}

/// Flush dos spans pendentes. Chamar antes de encerrar o processo.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "chain-runner");
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
        assert!(config.enable_console_logging);
    }

    #[test]
    fn test_config_from_lookup() {
        let config = TelemetryConfig::from_lookup(|key| match key {
            "OTEL_SERVICE_NAME" => Some("chains-ci".to_string()),
            "OTEL_EXPORTER_OTLP_ENDPOINT" => Some("http://collector:4317".to_string()),
            "OTEL_TRACES_SAMPLER_ARG" => Some("7".to_string()),
            _ => None,
        });

        assert_eq!(config.service_name, "chains-ci");
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4317"));
        assert_eq!(config.sampling_ratio, 1.0);
    }

    #[test]
    fn test_quiet_raises_level() {
        assert_eq!(TelemetryConfig::default().quiet().log_level, Level::WARN);
    }
}
