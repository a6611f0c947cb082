//! # Módulo de Bindings - Encadeamento de Dados entre Operações
//!
//! Este módulo lê campos das respostas capturadas e injeta esses valores
//! nos requests das operações seguintes.
//!
//! ## Para todos entenderem:
//!
//! Imagine que você cria um usuário e a API devolve o `id` dele. A próxima
//! operação precisa desse `id` na URL. Um binding faz exatamente isso:
//!
//! 1. **Lê** o campo da resposta de origem (`data.id`)
//! 2. **Converte** para texto quando o destino exige (path, query, header)
//! 3. **Aplica** no request de destino, no local declarado
//!
//! ## Exemplo de Fluxo:
//!
//! ```text
//! Operação A: POST /users
//! Resposta:   { "data": { "id": 42 } }
//! Binding:    A.data.id -> B.path.id
//!
//! Operação B: GET /users/{id}
//! Resolvido:  GET /users/42
//! ```
//!
//! ## Locais suportados:
//!
//! | Local    | Comportamento                                        |
//! |----------|------------------------------------------------------|
//! | `path`   | Substitui `{param}` no template (percent-encoded)    |
//! | `query`  | Adiciona ou sobrescreve a chave                      |
//! | `header` | Adiciona ou sobrescreve o header                     |
//! | `body`   | Define campo de topo ou caminho com pontos (`a.b`)   |

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::context::ExecutionContext;
use crate::errors::ChainError;
use crate::protocol::{value_to_text, OperationDefinition, ParamLocation, RelationEdge, ResolvedRequest};

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}/]+)\}").expect("valid placeholder regex"));

// ============================================================================
// EXTRAÇÃO
// ============================================================================

/// Campo ausente em uma resposta.
///
/// Ainda não sabe de qual operação veio a resposta; o contexto completa
/// essa informação com `into_error`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMissing {
    pub path: String,
    /// Chaves disponíveis no nível onde a navegação parou.
    pub available_keys: Vec<String>,
}

impl FieldMissing {
    pub fn into_error(self, source_id: &str) -> ChainError {
        ChainError::UpstreamFieldMissing {
            source_id: source_id.to_string(),
            path: self.path,
            available_keys: self.available_keys,
        }
    }
}

/// Lê um campo de uma resposta seguindo um caminho com pontos.
///
/// ## Formatos de path suportados:
/// - `data.token` → campos aninhados
/// - `users[0].id` ou `users.0.id` → índice de array
/// - `$.data.token` → prefixo JSONPath é aceito e ignorado
/// - `""` → a resposta inteira
///
/// Um campo presente com valor `null` conta como encontrado.
pub fn extract(response: &Value, path: &str) -> Result<Value, FieldMissing> {
    let clean_path = path.strip_prefix("$.").unwrap_or(path);
    let clean_path = if clean_path == "$" { "" } else { clean_path };

    let mut current = response;
    for segment in split_path(clean_path) {
        current = navigate_segment(current, &segment).ok_or_else(|| FieldMissing {
            path: path.to_string(),
            available_keys: available_keys(current),
        })?;
    }

    Ok(current.clone())
}

/// Divide um path em segmentos, respeitando índices de array.
///
/// Exemplo: "users[0].name" → ["users", "[0]", "name"]
fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();

    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                current.push('[');
                for next in chars.by_ref() {
                    current.push(next);
                    if next == ']' {
                        break;
                    }
                }
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

fn navigate_segment<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    let bracketed = segment
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'));

    match (value, bracketed) {
        (Value::Array(items), Some(index)) => index.trim().parse::<usize>().ok().and_then(|i| items.get(i)),
        (Value::Array(items), None) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        (Value::Object(map), None) => map.get(segment),
        _ => None,
    }
}

fn available_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) => (0..items.len()).map(|i| format!("[{}]", i)).collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// APLICAÇÃO
// ============================================================================

/// Injeta `value` no request, no local indicado.
///
/// Path, query e header recebem a forma textual canônica do valor; o body
/// recebe o valor sem conversão.
pub fn apply(
    mut request: ResolvedRequest,
    target_param: &str,
    location: ParamLocation,
    value: &Value,
) -> Result<ResolvedRequest, ChainError> {
    match location {
        ParamLocation::Path => {
            let placeholder = format!("{{{}}}", target_param);
            if !request.path.contains(&placeholder) {
                return Err(ChainError::PlaceholderMissing {
                    param: target_param.to_string(),
                    template: request.path,
                });
            }
            let encoded = urlencoding::encode(&value_to_text(value)).into_owned();
            request.path = request.path.replace(&placeholder, &encoded);
        }
        ParamLocation::Query => {
            request
                .query
                .insert(target_param.to_string(), value_to_text(value));
        }
        ParamLocation::Header => {
            request
                .headers
                .insert(target_param.to_string(), value_to_text(value));
        }
        ParamLocation::Body => {
            let body = request.body.get_or_insert(Value::Null);
            set_dotted(body, target_param, value.clone())?;
        }
    }

    Ok(request)
}

/// Define um campo do body, criando objetos intermediários onde não há nada
/// (`null` ou chave ausente). Arrays e escalares no caminho são erro: o
/// template não é reescrito.
fn set_dotted(root: &mut Value, dotted: &str, value: Value) -> Result<(), ChainError> {
    let mut segments: Vec<&str> = dotted.split('.').filter(|s| !s.is_empty()).collect();
    let Some(last) = segments.pop() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    let mut walked = String::from("$");
    for segment in segments {
        current = as_object(current, dotted, &walked)?
            .entry(segment.to_string())
            .or_insert(Value::Null);
        walked.push('.');
        walked.push_str(segment);
    }
    as_object(current, dotted, &walked)?.insert(last.to_string(), value);
    Ok(())
}

fn as_object<'v>(
    value: &'v mut Value,
    param: &str,
    at: &str,
) -> Result<&'v mut Map<String, Value>, ChainError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ChainError::BodyShapeMismatch {
            param: param.to_string(),
            at: at.to_string(),
            found: json_type(other).to_string(),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// PLACEHOLDERS
// ============================================================================

/// Nomes dos placeholders `{param}` ainda presentes no path.
pub fn placeholders(path: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(path)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Preenche placeholders restantes com os exemplos declarados da operação.
///
/// Placeholders sem binding nem exemplo tornam o request impossível de enviar.
pub fn fill_path_defaults(
    mut request: ResolvedRequest,
    definition: &OperationDefinition,
) -> Result<ResolvedRequest, ChainError> {
    let mut unresolved = Vec::new();

    let mut names = placeholders(&request.path);
    names.dedup();

    for name in names {
        if unresolved.contains(&name) || !request.path.contains(&format!("{{{}}}", name)) {
            continue;
        }
        match definition.path_example(&name) {
            Some(example) => request = apply(request, &name, ParamLocation::Path, example)?,
            None => unresolved.push(name),
        }
    }

    if !unresolved.is_empty() {
        return Err(ChainError::UnresolvedPathParameter {
            path: request.path,
            params: unresolved,
        });
    }

    Ok(request)
}

/// Fase Build de um step: template + bindings de todas as arestas de entrada.
///
/// Falha no primeiro binding cujo campo de origem não existe no contexto.
pub fn build_request<'a>(
    definition: &OperationDefinition,
    incoming: impl IntoIterator<Item = &'a RelationEdge>,
    context: &ExecutionContext,
) -> Result<ResolvedRequest, ChainError> {
    let mut request = definition.request_template();

    for edge in incoming {
        for binding in &edge.bindings {
            let value = context.extract(&edge.source_id, &binding.source_field)?;
            request = apply(request, &binding.target_param, binding.param_location, &value)?;
        }
    }

    fill_path_defaults(request, definition)
}

// ============================================================================
// TESTES
// ============================================================================
