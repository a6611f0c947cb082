// Module: Protocol
// Data model shared by the catalog, the planner, the executor and the reports.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ChainError;

// ============================================================================
// OPERATION DEFINITIONS
// ============================================================================

/// Where a request parameter lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Body,
    Header,
}

impl ParamLocation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "body" => Some(Self::Body),
            "header" => Some(Self::Header),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Body => "body",
            Self::Header => "header",
        }
    }
}

impl fmt::Display for ParamLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parameter declared by an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpec {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    /// Example or default value declared for the parameter, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
}

/// One API operation, immutable once loaded into the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationDefinition {
    pub id: String,
    pub method: String,
    pub path: String,
    pub parameters: Vec<ParameterSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_template: Option<Value>,
    pub success_statuses: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl OperationDefinition {
    /// Builds a fresh request from the template.
    ///
    /// The body is deep-copied on every call so no invocation can leak state
    /// into another one. Query and header parameters that declare an example
    /// are pre-filled; path placeholders are left for the binding resolver.
    pub fn request_template(&self) -> ResolvedRequest {
        let mut request = ResolvedRequest {
            method: self.method.clone(),
            path: self.path.clone(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: self.body_template.clone(),
        };

        for param in &self.parameters {
            let Some(example) = &param.example else {
                continue;
            };
            match param.location {
                ParamLocation::Query => {
                    request
                        .query
                        .insert(param.name.clone(), value_to_text(example));
                }
                ParamLocation::Header => {
                    request
                        .headers
                        .insert(param.name.clone(), value_to_text(example));
                }
                ParamLocation::Path | ParamLocation::Body => {}
            }
        }

        request
    }

    /// Declared example for a path parameter, used for placeholders no
    /// binding filled.
    pub fn path_example(&self, name: &str) -> Option<&Value> {
        self.parameters
            .iter()
            .find(|p| p.location == ParamLocation::Path && p.name == name)
            .and_then(|p| p.example.as_ref())
    }

    pub fn expects_status(&self, status: u16) -> bool {
        self.success_statuses.contains(&status)
    }
}

/// Canonical text form of a JSON value for path, query and header slots.
///
/// Strings are used verbatim; numbers and booleans use their literal form;
/// anything else falls back to compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ============================================================================
// RELATIONS
// ============================================================================

/// Whether a binding always applies or only under a caller-evaluated trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RelationKind {
    Global,
    Conditional { condition: String },
}

/// Copies one field of the source response into one target parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub source_field: String,
    pub target_param: String,
    pub param_location: ParamLocation,
    pub relation_kind: RelationKind,
}

/// Directed dependency `source_id -> target_id` with at least one binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationEdge {
    pub source_id: String,
    pub target_id: String,
    pub bindings: Vec<Binding>,
}

// ============================================================================
// REQUESTS & RESPONSES
// ============================================================================

/// Request after template resolution and binding application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedRequest {
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Raw response of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedResponse {
    pub status: u16,
    pub body: Value,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStepResult {
    pub operation_id: String,
    pub status: StepStatus,
    /// Absent when the step failed before the request was fully built.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<ResolvedRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CapturedResponse>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ChainError>,
}

impl ChainStepResult {
    pub fn passed(&self) -> bool {
        self.status == StepStatus::Passed
    }
}

/// Immutable report of one chain run.
#[derive(Debug, Clone, Serialize)]
pub struct ChainRunSummary {
    pub run_id: String,
    pub status: String, // "passed" | "failed"
    pub plan_fingerprint: String,
    pub started_at: String,
    pub finished_at: String,
    /// Operations in the plan; `total` may be lower when the run stopped early.
    pub planned: usize,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub steps: Vec<ChainStepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_error: Option<ChainError>,
}

impl ChainRunSummary {
    pub fn is_success(&self) -> bool {
        self.status == "passed"
    }

    pub fn step(&self, operation_id: &str) -> Option<&ChainStepResult> {
        self.steps.iter().find(|s| s.operation_id == operation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> OperationDefinition {
        OperationDefinition {
            id: "list_users".into(),
            method: "GET".into(),
            path: "/users/{org}".into(),
            parameters: vec![
                ParameterSpec {
                    name: "org".into(),
                    location: ParamLocation::Path,
                    required: true,
                    example: Some(json!("acme")),
                },
                ParameterSpec {
                    name: "limit".into(),
                    location: ParamLocation::Query,
                    required: false,
                    example: Some(json!(10)),
                },
                ParameterSpec {
                    name: "X-Trace".into(),
                    location: ParamLocation::Header,
                    required: false,
                    example: None,
                },
            ],
            body_template: Some(json!({"filters": {"active": true}})),
            success_statuses: vec![200],
            summary: None,
        }
    }

    #[test]
    fn test_param_location_parse() {
        assert_eq!(ParamLocation::parse("PATH"), Some(ParamLocation::Path));
        assert_eq!(ParamLocation::parse(" header "), Some(ParamLocation::Header));
        assert_eq!(ParamLocation::parse("cookie"), None);
    }

    #[test]
    fn test_request_template_prefills_query_examples() {
        let request = definition().request_template();

        assert_eq!(request.path, "/users/{org}");
        assert_eq!(request.query.get("limit").map(String::as_str), Some("10"));
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_request_template_is_a_fresh_copy() {
        let def = definition();
        let mut first = def.request_template();
        first
            .body
            .as_mut()
            .unwrap()
            .as_object_mut()
            .unwrap()
            .insert("leak".into(), json!(1));

        let second = def.request_template();
        assert!(second.body.unwrap().get("leak").is_none());
        assert!(def.body_template.unwrap().get("leak").is_none());
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&json!("abc")), "abc");
        assert_eq!(value_to_text(&json!(42)), "42");
        assert_eq!(value_to_text(&json!(true)), "true");
        assert_eq!(value_to_text(&json!([1, 2])), "[1,2]");
    }
}
