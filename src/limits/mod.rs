//! # Módulo de Limites de Execução
//!
//! Define os limites que protegem a execução contra descritores gigantes
//! ou APIs que não respondem.
//!
//! ## Limites configuráveis:
//!
//! | Limite             | Padrão | Descrição                                  |
//! |--------------------|--------|--------------------------------------------|
//! | max_operations     | 200    | Máximo de operações em um plano            |
//! | max_parallel       | 4      | Máximo de componentes rodando em paralelo  |
//! | max_retries_total  | 50     | Máximo de retries somando toda a execução  |
//! | request_timeout    | 30s    | Timeout de cada chamada HTTP               |
//! | run_timeout        | 300s   | Orçamento total de tempo da execução       |

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ChainError;

// ============================================================================
// LIMITES PADRÃO (CONSTANTES)
// ============================================================================

pub const DEFAULT_MAX_OPERATIONS: usize = 200;

pub const DEFAULT_MAX_PARALLEL: usize = 4;

pub const DEFAULT_MAX_RETRIES_TOTAL: u32 = 50;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300; // 5 minutos

// ============================================================================
// ESTRUTURA DE LIMITES
// ============================================================================

/// Configuração de limites de execução.
///
/// Todos os campos têm valores padrão seguros.
///
/// ```rust,ignore
/// let limits = ExecutionLimits {
///     run_timeout: Duration::from_secs(60),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Número máximo de operações no plano.
    /// Se excedido, o plano é rejeitado antes de qualquer chamada.
    pub max_operations: usize,

    /// Número máximo de componentes independentes rodando ao mesmo tempo.
    pub max_parallel: usize,

    /// Número máximo de retries somando todos os steps.
    pub max_retries_total: u32,

    /// Timeout de cada chamada HTTP.
    pub request_timeout: Duration,

    /// Orçamento total de tempo de uma execução.
    /// Ao estourar, nenhum step novo é iniciado.
    pub run_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_retries_total: DEFAULT_MAX_RETRIES_TOTAL,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
        }
    }
}

impl ExecutionLimits {
    /// Cria limites a partir de variáveis de ambiente.
    ///
    /// Variáveis suportadas:
    /// - `CHAIN_MAX_OPERATIONS`
    /// - `CHAIN_MAX_PARALLEL`
    /// - `CHAIN_MAX_RETRIES`
    /// - `CHAIN_REQUEST_TIMEOUT_MS`
    /// - `CHAIN_RUN_TIMEOUT_SECS`
    ///
    /// Valores que não parseiam são ignorados.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Mesma lógica de `from_env`, com a fonte de variáveis injetada.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut limits = Self::default();

        if let Some(n) = lookup("CHAIN_MAX_OPERATIONS").and_then(|v| v.parse().ok()) {
            limits.max_operations = n;
        }

        if let Some(n) = lookup("CHAIN_MAX_PARALLEL").and_then(|v| v.parse().ok()) {
            limits.max_parallel = n;
        }

        if let Some(n) = lookup("CHAIN_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            limits.max_retries_total = n;
        }

        if let Some(n) = lookup("CHAIN_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            limits.request_timeout = Duration::from_millis(n);
        }

        if let Some(n) = lookup("CHAIN_RUN_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            limits.run_timeout = Duration::from_secs(n);
        }

        limits
    }

    /// Limites restritivos para testes.
    pub fn strict() -> Self {
        Self {
            max_operations: 20,
            max_parallel: 1,
            max_retries_total: 5,
            request_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(30),
        }
    }

    /// Limites permissivos para desenvolvimento.
    pub fn relaxed() -> Self {
        Self {
            max_operations: 2_000,
            max_parallel: 32,
            max_retries_total: 500,
            request_timeout: Duration::from_secs(120),
            run_timeout: Duration::from_secs(3600), // 1 hora
        }
    }
}

// ============================================================================
// VALIDAÇÃO DE LIMITES
// ============================================================================

/// Valida o tamanho do plano contra os limites.
pub fn validate_limits(operation_count: usize, limits: &ExecutionLimits) -> Result<(), ChainError> {
    if operation_count > limits.max_operations {
        return Err(ChainError::LimitExceeded {
            limit: "max_operations".to_string(),
            max: limits.max_operations,
            actual: operation_count,
        });
    }
    Ok(())
}

// ============================================================================
// CONTADOR DE RETRIES (RUNTIME)
// ============================================================================

/// Orçamento de retries compartilhado por uma execução.
#[derive(Debug, Default)]
pub struct RetryCounter {
    count: AtomicU32,
    limit: u32,
}

impl RetryCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            limit,
        }
    }

    /// Consome um retry. `false` quando o orçamento acabou.
    pub fn try_increment(&self) -> bool {
        let current = self.count.fetch_add(1, Ordering::SeqCst);
        current < self.limit
    }

    pub fn current(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}
