//! # Módulo de Geração de Artefatos
//!
//! Materializa um plano como um arquivo de testes executável, para revisão
//! humana ou para rodar em CI fora deste processo.
//!
//! O artefato gerado reproduz a mesma sequência do executor:
//! Build → Dispatch → Capture → Verify, na ordem do plano, com o mesmo
//! fingerprint no cabeçalho. O relatório do runner externo volta para o
//! sistema pelo `aggregator::PytestReportParser`.
//!
//! Valores vindos das definições são embutidos como `json.loads("...")`, o
//! que evita qualquer tradução de tipos entre JSON e Python.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde_json::Value;

use crate::catalog::OperationCatalog;
use crate::errors::ChainError;
use crate::planner::ExecutionPlan;
use crate::protocol::{ParamLocation, ResolvedRequest};

/// Renderiza um plano como código.
pub trait ChainRenderer {
    fn render(&self, plan: &ExecutionPlan, catalog: &OperationCatalog) -> Result<String, ChainError>;

    fn file_extension(&self) -> &'static str;
}

/// Gera um módulo pytest com um teste por operação.
#[derive(Debug, Clone)]
pub struct PytestRenderer {
    pub base_url: String,
    pub request_timeout_secs: f64,
    /// Enviados em toda chamada; headers do request têm prioridade.
    pub default_headers: BTreeMap<String, String>,
}

impl PytestRenderer {
    pub fn new(base_url: impl Into<String>, request_timeout_secs: f64) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout_secs,
            default_headers: BTreeMap::new(),
        }
    }

    pub fn with_default_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.default_headers = headers;
        self
    }
}

const PYTHON_HELPERS: &str = r#"import json
import os
import re
from urllib.parse import quote

import requests

CONTEXT = {}


def _text(value):
    if value is None:
        return ""
    if isinstance(value, bool):
        return "true" if value else "false"
    if isinstance(value, (dict, list)):
        return json.dumps(value, separators=(",", ":"))
    return str(value)


def _extract(source_id, path):
    if source_id not in CONTEXT:
        raise AssertionError(f"UpstreamFieldMissing: {source_id} has no captured response")
    current = CONTEXT[source_id]
    for segment in [s for s in re.split(r"\.|\[|\]", path.removeprefix("$.")) if s]:
        if isinstance(current, dict) and segment in current:
            current = current[segment]
        elif isinstance(current, list) and segment.isdigit() and int(segment) < len(current):
            current = current[int(segment)]
        else:
            raise AssertionError(f"UpstreamFieldMissing: {source_id}.{path}")
    return current


def _apply(request, param, location, value):
    if location == "path":
        placeholder = "{" + param + "}"
        if placeholder not in request["path"]:
            raise AssertionError(f"PlaceholderMissing: {param} in {request['path']}")
        request["path"] = request["path"].replace(placeholder, quote(_text(value), safe=""))
    elif location == "query":
        request["query"][param] = _text(value)
    elif location == "header":
        request["headers"][param] = _text(value)
    else:
        if request["body"] is None:
            request["body"] = {}
        target = request["body"]
        *parents, last = param.split(".")
        for key in parents:
            if not isinstance(target, dict):
                raise AssertionError(f"BodyShapeMismatch: {param}")
            if target.get(key) is None:
                target[key] = {}
            target = target[key]
        if not isinstance(target, dict):
            raise AssertionError(f"BodyShapeMismatch: {param}")
        target[last] = value
    return request


def _call(operation_id, request, expected):
    unresolved = re.search(r"\{[^{}/]+\}", request["path"])
    if unresolved:
        raise AssertionError(f"UnresolvedPathParameter: {unresolved.group(0)} in {request['path']}")
    headers = dict(DEFAULT_HEADERS)
    headers.update(request["headers"])
    response = requests.request(
        request["method"],
        BASE_URL.rstrip("/") + request["path"],
        params=request["query"],
        headers=headers,
        json=request["body"],
        timeout=TIMEOUT,
    )
    try:
        CONTEXT[operation_id] = response.json()
    except ValueError:
        CONTEXT[operation_id] = response.text or None
    assert response.status_code in expected, f"{response.status_code} not in {expected}"
    return response
"#;

impl ChainRenderer for PytestRenderer {
    fn render(&self, plan: &ExecutionPlan, catalog: &OperationCatalog) -> Result<String, ChainError> {
        let mut out: Vec<String> = Vec::new();

        out.push("# Generated chain test. Do not edit by hand.".to_string());
        out.push(format!("# plan fingerprint: {}", plan.fingerprint()));
        out.push(format!("# order: {}", plan.order().join(" -> ")));
        out.push(String::new());
        out.push(PYTHON_HELPERS.to_string());
        out.push(format!(
            "BASE_URL = os.environ.get(\"CHAIN_BASE_URL\", {})",
            py_json(&Value::String(self.base_url.clone()))
        ));
        out.push(format!("TIMEOUT = {:.3}", self.request_timeout_secs));
        out.push(format!(
            "DEFAULT_HEADERS = {}",
            py_json(&Value::from(serde_json::Map::from_iter(
                self.default_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            )))
        ));

        for (index, id) in plan.order().iter().enumerate() {
            let definition = catalog.get(id)?;
            let template = definition.request_template();

            out.push(String::new());
            out.push(String::new());
            out.push(format!("def test_{:02}_{}():", index + 1, python_ident(id)));
            if let Some(summary) = &definition.summary {
                out.push(format!("    {}", py_str(summary)));
            }
            out.push(format!("    request = {}", py_json(&request_value(&template))));

            for edge in plan.incoming(id) {
                for binding in &edge.bindings {
                    out.push(format!(
                        "    request = _apply(request, {}, {}, _extract({}, {}))",
                        py_str(&binding.target_param),
                        py_str(binding.param_location.as_str()),
                        py_str(&edge.source_id),
                        py_str(&binding.source_field),
                    ));
                }
            }

            for param in &definition.parameters {
                if let (ParamLocation::Path, Some(example)) = (param.location, &param.example) {
                    out.push(format!(
                        "    if {} in request[\"path\"]:",
                        py_str(&format!("{{{}}}", param.name))
                    ));
                    out.push(format!(
                        "        request = _apply(request, {}, \"path\", {})",
                        py_str(&param.name),
                        py_json(example)
                    ));
                }
            }

            out.push(format!(
                "    _call({}, request, {})",
                py_str(id),
                py_json(&Value::from(definition.success_statuses.clone()))
            ));
        }

        out.push(String::new());
        Ok(out.join("\n"))
    }

    fn file_extension(&self) -> &'static str {
        "py"
    }
}

/// Grava o artefato, criando diretórios intermediários.
pub fn write_artifact<P: AsRef<Path>>(path: P, content: &str) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write artifact: {}", path.display()))
}

fn request_value(request: &ResolvedRequest) -> Value {
    serde_json::json!({
        "method": request.method,
        "path": request.path,
        "query": request.query,
        "headers": request.headers,
        "body": request.body,
    })
}

/// Literal Python que produz `value`.
fn py_json(value: &Value) -> String {
    format!("json.loads({})", py_str(&value.to_string()))
}

/// Literal de string Python. O escape JSON é um subconjunto válido.
fn py_str(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

fn python_ident(id: &str) -> String {
    let ident: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    ident.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner;
    use crate::protocol::{Binding, OperationDefinition, ParameterSpec, RelationEdge, RelationKind};
    use serde_json::json;

    fn catalog() -> OperationCatalog {
        let mut catalog = OperationCatalog::new();
        catalog.insert(OperationDefinition {
            id: "create-user".into(),
            method: "POST".into(),
            path: "/users".into(),
            parameters: Vec::new(),
            body_template: Some(json!({"name": "O'Brien \"quoted\""})),
            success_statuses: vec![200, 201],
            summary: Some("Create user".into()),
        });
        catalog.insert(OperationDefinition {
            id: "get_user".into(),
            method: "GET".into(),
            path: "/orgs/{org}/users/{id}".into(),
            parameters: vec![ParameterSpec {
                name: "org".into(),
                location: ParamLocation::Path,
                required: true,
                example: Some(json!("acme")),
            }],
            body_template: None,
            success_statuses: vec![200],
            summary: None,
        });
        catalog
    }

    fn plan() -> ExecutionPlan {
        planner::build(
            &[],
            vec![RelationEdge {
                source_id: "create-user".into(),
                target_id: "get_user".into(),
                bindings: vec![Binding {
                    source_field: "data.id".into(),
                    target_param: "id".into(),
                    param_location: ParamLocation::Path,
                    relation_kind: RelationKind::Global,
                }],
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_render_follows_plan_order() {
        let plan = plan();
        let code = PytestRenderer::new("http://api.local", 30.0)
            .render(&plan, &catalog())
            .unwrap();

        assert!(code.contains(&format!("# plan fingerprint: {}", plan.fingerprint())));
        assert!(code.contains("# order: create-user -> get_user"));

        let first = code.find("def test_01_create_user():").unwrap();
        let second = code.find("def test_02_get_user():").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_render_binds_and_verifies() {
        let code = PytestRenderer::new("http://api.local", 30.0)
            .render(&plan(), &catalog())
            .unwrap();

        assert!(code.contains(
            r#"request = _apply(request, "id", "path", _extract("create-user", "data.id"))"#
        ));
        assert!(code.contains(r#"request = _apply(request, "org", "path", json.loads("\"acme\""))"#));
        assert!(code.contains(r#"_call("create-user", request, json.loads("[200,201]"))"#));
        assert!(code.contains("TIMEOUT = 30.000"));
    }

    #[test]
    fn test_render_carries_default_headers() {
        let headers = BTreeMap::from([("Authorization".to_string(), "Bearer abc".to_string())]);
        let code = PytestRenderer::new("http://api.local", 30.0)
            .with_default_headers(headers)
            .render(&plan(), &catalog())
            .unwrap();

        assert!(code.contains(
            r#"DEFAULT_HEADERS = json.loads("{\"Authorization\":\"Bearer abc\"}")"#
        ));
        // Headers do request sobrescrevem os padrões, como no dispatcher.
        let merge = code.find("headers = dict(DEFAULT_HEADERS)").unwrap();
        let update = code.find(r#"headers.update(request["headers"])"#).unwrap();
        assert!(merge < update);
        assert!(code.contains("headers=headers,"));
    }

    #[test]
    fn test_render_without_default_headers_emits_empty_map() {
        let code = PytestRenderer::new("http://api.local", 30.0)
            .render(&plan(), &catalog())
            .unwrap();

        assert!(code.contains(r#"DEFAULT_HEADERS = json.loads("{}")"#));
    }

    #[test]
    fn test_render_guards_unresolved_path_before_call() {
        let code = PytestRenderer::new("http://api.local", 30.0)
            .render(&plan(), &catalog())
            .unwrap();

        let guard = code
            .find(r#"unresolved = re.search(r"\{[^{}/]+\}", request["path"])"#)
            .unwrap();
        let raise = code.find("raise AssertionError(f\"UnresolvedPathParameter").unwrap();
        let send = code.find("response = requests.request(").unwrap();
        assert!(guard < raise && raise < send);
    }

    #[test]
    fn test_render_body_helper_rejects_non_object_targets() {
        let code = PytestRenderer::new("http://api.local", 30.0)
            .render(&plan(), &catalog())
            .unwrap();

        assert!(code.contains(r#"raise AssertionError(f"BodyShapeMismatch: {param}")"#));
        assert!(!code.contains(r#"if not isinstance(request["body"], dict):"#));
    }

    #[test]
    fn test_render_escapes_embedded_values() {
        let code = PytestRenderer::new("http://api.local", 1.0)
            .render(&plan(), &catalog())
            .unwrap();

        // O body vira JSON dentro de uma string Python com aspas escapadas.
        assert!(code.contains(r#"O'Brien \\\"quoted\\\""#));
    }

    #[test]
    fn test_render_unknown_operation_fails() {
        let plan = planner::build(&["ghost".to_string()], Vec::new()).unwrap();
        let err = PytestRenderer::new("http://x", 1.0)
            .render(&plan, &catalog())
            .unwrap_err();

        assert_eq!(err, ChainError::UnknownOperation { id: "ghost".into() });
    }

    #[test]
    fn test_write_artifact_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generated").join("test_chain.py");

        write_artifact(&path, "print('ok')\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "print('ok')\n");
    }

    #[test]
    fn test_python_ident() {
        assert_eq!(python_ident("Create-User.v2"), "create_user_v2");
    }
}
