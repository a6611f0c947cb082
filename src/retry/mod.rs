//! Módulo de Retry.
//!
//! O executor de cadeia nunca repete chamadas. Quem quiser retry embrulha o
//! dispatcher com `RetryingDispatcher`, que repete apenas timeouts e falhas
//! de conexão, com backoff exponencial e jitter.
//!
//! Respostas com status inesperado não são repetidas: elas chegaram ao
//! servidor e a verificação de status é responsabilidade do executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::errors::ChainError;
use crate::executors::HttpDispatcher;
use crate::limits::RetryCounter;
use crate::protocol::{CapturedResponse, ResolvedRequest};

/// Política de retry com backoff exponencial.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total de tentativas, incluindo a primeira. `1` desliga o retry.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
    /// Soma até metade do backoff, sorteado a cada espera.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 200,
            backoff_factor: 2.0,
            max_backoff_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Espera antes da tentativa `attempt + 1`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = (self.backoff_ms as f64 * self.backoff_factor.powi(exponent))
            .min(self.max_backoff_ms as f64) as u64;

        let jitter = if self.jitter && base > 0 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Executa `operation` repetindo enquanto `should_retry` aprovar o erro.
    ///
    /// `budget`, quando presente, limita os retries somando todas as
    /// operações que compartilham o contador.
    pub async fn execute<T, E, F, Fut, P>(
        &self,
        label: &str,
        budget: Option<&RetryCounter>,
        should_retry: P,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(label = %label, attempt, "Retry bem sucedido");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if attempt >= self.max_attempts || !should_retry(&e) {
                        return Err(e);
                    }
                    if let Some(counter) = budget {
                        if !counter.try_increment() {
                            warn!(label = %label, limit = counter.limit(), "Orçamento de retries esgotado");
                            return Err(e);
                        }
                    }

                    let backoff = self.backoff_for(attempt);
                    warn!(
                        label = %label,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Tentativa falhou, aguardando retry"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Dispatcher que repete falhas de transporte do dispatcher interno.
pub struct RetryingDispatcher<D> {
    inner: D,
    policy: RetryPolicy,
    budget: Option<Arc<RetryCounter>>,
}

impl<D: HttpDispatcher> RetryingDispatcher<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            budget: None,
        }
    }

    /// Compartilha um orçamento total de retries (ver `max_retries_total`).
    pub fn with_budget(mut self, budget: Arc<RetryCounter>) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// Só timeout e falha de conexão. Erros de montagem do request (método ou
/// header inválido) falhariam igual em toda tentativa.
fn is_transport_error(error: &ChainError) -> bool {
    matches!(
        error,
        ChainError::HttpRequest { timeout: true, .. } | ChainError::HttpRequest { connect: true, .. }
    )
}

#[async_trait]
impl<D: HttpDispatcher> HttpDispatcher for RetryingDispatcher<D> {
    async fn dispatch(&self, request: &ResolvedRequest) -> Result<CapturedResponse, ChainError> {
        let label = format!("{} {}", request.method, request.path);
        self.policy
            .execute(&label, self.budget.as_deref(), is_transport_error, || {
                self.inner.dispatch(request)
            })
            .await
    }
}
