// Module: Executors
// Transport seam between the chain executor and the API under test.

pub mod http;

use async_trait::async_trait;

use crate::errors::ChainError;
use crate::protocol::{CapturedResponse, ResolvedRequest};

pub use http::ReqwestDispatcher;

/// Performs one HTTP call for a fully resolved request.
///
/// A response with any status code is `Ok`; only transport failures
/// (connection refused, timeout, unreadable body) are errors.
///
/// The trait requires Send + Sync so components can run on spawned tasks.
#[async_trait]
pub trait HttpDispatcher: Send + Sync {
    async fn dispatch(&self, request: &ResolvedRequest) -> Result<CapturedResponse, ChainError>;
}

#[cfg(test)]
pub mod testing {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::Value;

    use super::*;

    type Script = dyn Fn(&ResolvedRequest) -> Result<CapturedResponse, ChainError> + Send + Sync;

    /// Dispatcher driven by a closure. Records every request it receives.
    pub struct ScriptedDispatcher {
        script: Box<Script>,
        delay: Option<Duration>,
        calls: Mutex<Vec<ResolvedRequest>>,
    }

    impl ScriptedDispatcher {
        pub fn new<F>(script: F) -> Self
        where
            F: Fn(&ResolvedRequest) -> Result<CapturedResponse, ChainError> + Send + Sync + 'static,
        {
            Self {
                script: Box::new(script),
                delay: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Sleeps before answering each call.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> Vec<ResolvedRequest> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_paths(&self) -> Vec<String> {
            self.calls().into_iter().map(|r| r.path).collect()
        }
    }

    #[async_trait]
    impl HttpDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, request: &ResolvedRequest) -> Result<CapturedResponse, ChainError> {
            self.calls.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.script)(request)
        }
    }

    pub fn respond(status: u16, body: Value) -> Result<CapturedResponse, ChainError> {
        Ok(CapturedResponse {
            status,
            body,
            headers: BTreeMap::new(),
        })
    }

    pub fn connection_refused(request: &ResolvedRequest) -> Result<CapturedResponse, ChainError> {
        Err(ChainError::HttpRequest {
            method: request.method.clone(),
            url: request.path.clone(),
            message: "connection refused".into(),
            timeout: false,
            connect: true,
        })
    }
}
