// Module: Context
// Per-run cache of captured responses, keyed by operation id.

use std::collections::HashMap;

use serde_json::Value;

use crate::bindings;
use crate::errors::ChainError;

/// Response cache of one chain run.
///
/// Created fresh for every run and dropped when the run ends. It is owned
/// by a single executor call, never shared between concurrent runs.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    responses: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Creates a new empty context.
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
        }
    }

    /// Stores the response body of an operation. A re-run overwrites it.
    pub fn store(&mut self, operation_id: impl Into<String>, body: Value) {
        self.responses.insert(operation_id.into(), body);
    }

    pub fn get(&self, operation_id: &str) -> Option<&Value> {
        self.responses.get(operation_id)
    }

    pub fn contains(&self, operation_id: &str) -> bool {
        self.responses.contains_key(operation_id)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Reads a dotted field from a captured response.
    ///
    /// An operation that never captured anything behaves like a response
    /// without the field, so dependents fail with the same error kind.
    pub fn extract(&self, source_id: &str, path: &str) -> Result<Value, ChainError> {
        match self.responses.get(source_id) {
            Some(body) => bindings::extract(body, path).map_err(|missing| missing.into_error(source_id)),
            None => Err(ChainError::UpstreamFieldMissing {
                source_id: source_id.to_string(),
                path: path.to_string(),
                available_keys: Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_and_overwrite() {
        let mut ctx = ExecutionContext::new();
        ctx.store("login", json!({"token": "a"}));
        ctx.store("login", json!({"token": "b"}));

        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get("login"), Some(&json!({"token": "b"})));
    }

    #[test]
    fn test_extract_from_captured_response() {
        let mut ctx = ExecutionContext::new();
        ctx.store("create_user", json!({"data": {"id": 42}}));

        assert_eq!(ctx.extract("create_user", "data.id").unwrap(), json!(42));
    }

    #[test]
    fn test_extract_from_missing_operation() {
        let ctx = ExecutionContext::new();
        let err = ctx.extract("never_ran", "data.id").unwrap_err();

        assert_eq!(
            err,
            ChainError::UpstreamFieldMissing {
                source_id: "never_ran".into(),
                path: "data.id".into(),
                available_keys: vec![],
            }
        );
    }

    #[test]
    fn test_extract_missing_field_names_source() {
        let mut ctx = ExecutionContext::new();
        ctx.store("login", json!({"data": {"user": "ana"}}));

        match ctx.extract("login", "data.token").unwrap_err() {
            ChainError::UpstreamFieldMissing {
                source_id,
                path,
                available_keys,
            } => {
                assert_eq!(source_id, "login");
                assert_eq!(path, "data.token");
                assert_eq!(available_keys, vec!["user"]);
            }
            other => panic!("erro inesperado: {:?}", other),
        }
    }
}
