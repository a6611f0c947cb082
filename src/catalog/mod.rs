//! # Catálogo de Operações
//!
//! Carrega as definições de operação (método, path, parâmetros, template de
//! body, status de sucesso) e as expõe por id.
//!
//! ## Formatos aceitos
//!
//! | Formato       | Reconhecido por                 | Observação                          |
//! |---------------|---------------------------------|-------------------------------------|
//! | OpenAPI 3     | `openapi` + `paths`             | primeiro par path+método do arquivo |
//! | Swagger 2     | `swagger` + `paths`             | body vem do parâmetro `in: body`    |
//! | Definição     | `method` + `path` no topo       | formato direto, sem schema          |
//!
//! O id de cada operação é o nome do arquivo sem extensão, o mesmo
//! identificador que o descritor de relações usa.
//!
//! ## Imutabilidade
//!
//! Depois de carregado o catálogo não muda. Quem monta requisições recebe
//! uma cópia nova do template a cada chamada
//! ([`OperationDefinition::request_template`]).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::errors::ChainError;
use crate::loader;
use crate::protocol::{OperationDefinition, ParamLocation, ParameterSpec};

/// Métodos HTTP aceitos, conforme RFC 7231 e RFC 5789.
const VALID_HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Limite de profundidade ao seguir `$ref` e schemas aninhados.
const MAX_SCHEMA_DEPTH: usize = 8;

/// Origem de uma definição: o documento já parseado e o id sugerido
/// (normalmente o nome do arquivo).
#[derive(Debug, Clone)]
pub struct DefinitionSource {
    pub id_hint: Option<String>,
    pub document: Value,
}

impl DefinitionSource {
    pub fn new(id_hint: impl Into<String>, document: Value) -> Self {
        Self {
            id_hint: Some(id_hint.into()),
            document,
        }
    }

    pub fn anonymous(document: Value) -> Self {
        Self {
            id_hint: None,
            document,
        }
    }

    fn name(&self) -> String {
        self.id_hint.clone().unwrap_or_else(|| "<anônimo>".to_string())
    }
}

/// Catálogo de operações indexado por id.
#[derive(Debug, Default)]
pub struct OperationCatalog {
    operations: HashMap<String, OperationDefinition>,
    order: Vec<String>,
}

impl OperationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Carrega todos os arquivos `.json`/`.yaml`/`.yml` de um diretório.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut catalog = Self::new();
        for file in loader::list_definition_files(dir.as_ref())? {
            catalog.load_file(&file)?;
        }
        info!(operations = catalog.len(), dir = ?dir.as_ref(), "Catálogo carregado");
        Ok(catalog)
    }

    /// Carrega um único arquivo de definição, usando o nome como id.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<&OperationDefinition> {
        let path_ref = path.as_ref();
        let document = loader::load_document_from_file(path_ref)?;
        let file_name = path_ref
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let id = loader::operation_id_from_file(file_name);

        self.load(DefinitionSource::new(id, document))
            .with_context(|| format!("Failed to load operation definition {:?}", path_ref))
    }

    /// Parseia uma definição e registra no catálogo.
    ///
    /// Um id repetido substitui a definição anterior.
    pub fn load(&mut self, source: DefinitionSource) -> Result<&OperationDefinition, ChainError> {
        let definition = parse_definition(&source)?;
        debug!(
            operation_id = %definition.id,
            method = %definition.method,
            path = %definition.path,
            "Operação registrada"
        );
        self.insert(definition);
        let id = self.order.last().cloned().unwrap_or_default();
        self.get(&id)
    }

    pub fn insert(&mut self, definition: OperationDefinition) {
        let id = definition.id.clone();
        if self.operations.insert(id.clone(), definition).is_some() {
            self.order.retain(|existing| existing != &id);
        }
        self.order.push(id);
    }

    /// Busca uma operação. Id desconhecido é fatal para a construção do plano.
    pub fn get(&self, id: &str) -> Result<&OperationDefinition, ChainError> {
        self.operations
            .get(id)
            .ok_or_else(|| ChainError::UnknownOperation { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    /// Ids na ordem de carregamento.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

// ============================================================================
// PARSING
// ============================================================================

fn invalid(source: &DefinitionSource, reason: impl Into<String>) -> ChainError {
    ChainError::InvalidDefinition {
        source_name: source.name(),
        reason: reason.into(),
    }
}

fn parse_definition(source: &DefinitionSource) -> Result<OperationDefinition, ChainError> {
    let document = source
        .document
        .as_object()
        .ok_or_else(|| invalid(source, "documento não é um objeto"))?;

    if document.contains_key("paths") {
        parse_openapi(source, document)
    } else if document.contains_key("method") && document.contains_key("path") {
        parse_plain(source)
    } else {
        Err(invalid(
            source,
            "esperado documento OpenAPI (paths) ou definição com method e path",
        ))
    }
}

fn normalize_method(source: &DefinitionSource, raw: &str) -> Result<String, ChainError> {
    let method = raw.trim().to_uppercase();
    if VALID_HTTP_METHODS.contains(&method.as_str()) {
        Ok(method)
    } else {
        Err(invalid(source, format!("método HTTP '{}' inválido", raw)))
    }
}

fn normalize_path(source: &DefinitionSource, raw: &str) -> Result<String, ChainError> {
    let path = raw.trim();
    if path.is_empty() {
        return Err(invalid(source, "path vazio"));
    }
    if path.starts_with('/') || path.starts_with("http") {
        Ok(path.to_string())
    } else {
        Ok(format!("/{}", path))
    }
}

/// Id final: o nome do arquivo tem prioridade, depois o nome declarado,
/// por fim `método_path`.
fn resolve_id(source: &DefinitionSource, declared: Option<&str>, method: &str, path: &str) -> String {
    if let Some(hint) = source.id_hint.as_deref().filter(|h| !h.trim().is_empty()) {
        return hint.trim().to_string();
    }
    if let Some(name) = declared.filter(|d| !d.trim().is_empty()) {
        return name.trim().to_string();
    }
    let slug: String = path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}", method.to_lowercase(), slug.trim_end_matches('_'))
}

// ----------------------------------------------------------------------------
// Definição direta
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PlainDefinition {
    #[serde(default)]
    id: Option<String>,
    method: String,
    path: String,
    #[serde(default)]
    parameters: Vec<PlainParameter>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    success_status: Option<StatusSpec>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlainParameter {
    name: String,
    #[serde(rename = "in", alias = "location")]
    location: String,
    #[serde(default)]
    required: bool,
    #[serde(default, alias = "default")]
    example: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusSpec {
    One(u16),
    Many(Vec<u16>),
}

fn parse_plain(source: &DefinitionSource) -> Result<OperationDefinition, ChainError> {
    let plain: PlainDefinition = serde_json::from_value(source.document.clone())
        .map_err(|e| invalid(source, e.to_string()))?;

    let method = normalize_method(source, &plain.method)?;
    let path = normalize_path(source, &plain.path)?;

    if let (Some(hint), Some(declared)) = (source.id_hint.as_deref(), plain.id.as_deref()) {
        if hint != declared {
            return Err(invalid(
                source,
                format!("id declarado '{}' difere do nome do arquivo '{}'", declared, hint),
            ));
        }
    }

    let mut parameters = Vec::with_capacity(plain.parameters.len());
    for param in plain.parameters {
        let location = ParamLocation::parse(&param.location).ok_or_else(|| {
            invalid(
                source,
                format!("parâmetro '{}' com local '{}' inválido", param.name, param.location),
            )
        })?;
        parameters.push(ParameterSpec {
            required: param.required || location == ParamLocation::Path,
            name: param.name,
            location,
            example: param.example,
        });
    }

    let success_statuses = match plain.success_status {
        Some(StatusSpec::One(code)) => vec![code],
        Some(StatusSpec::Many(codes)) if !codes.is_empty() => codes,
        _ => vec![200],
    };

    Ok(OperationDefinition {
        id: resolve_id(source, plain.id.as_deref(), &method, &path),
        method,
        path,
        parameters,
        body_template: plain.body,
        success_statuses,
        summary: plain.summary,
    })
}

// ----------------------------------------------------------------------------
// OpenAPI / Swagger
// ----------------------------------------------------------------------------

fn parse_openapi(
    source: &DefinitionSource,
    document: &Map<String, Value>,
) -> Result<OperationDefinition, ChainError> {
    let paths = document
        .get("paths")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid(source, "'paths' não é um objeto"))?;

    // Primeiro par path+método, na ordem do documento.
    let (raw_path, path_item, raw_method, operation) = paths
        .iter()
        .filter_map(|(path, item)| item.as_object().map(|item| (path, item)))
        .find_map(|(path, item)| {
            item.iter()
                .find(|(key, value)| {
                    VALID_HTTP_METHODS.contains(&key.to_uppercase().as_str()) && value.is_object()
                })
                .map(|(method, operation)| (path, item, method, operation))
        })
        .ok_or_else(|| invalid(source, "nenhum par path+método encontrado em 'paths'"))?;

    let method = normalize_method(source, raw_method)?;
    let path = normalize_path(source, raw_path)?;
    let resolver = SchemaResolver { root: &source.document };

    // Parâmetros do path item valem para todas as operações; os da operação
    // sobrescrevem pelo par (nome, local).
    let mut parameters: Vec<ParameterSpec> = Vec::new();
    let mut swagger_body: Option<Value> = None;
    let declared = path_item
        .get("parameters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .chain(operation.get("parameters").and_then(Value::as_array).into_iter().flatten());

    for raw in declared {
        let param = resolver.deref(raw, 0);
        let Some(name) = param.get("name").and_then(Value::as_str) else {
            continue;
        };
        let location = param.get("in").and_then(Value::as_str).unwrap_or_default();

        if location == "body" {
            // Swagger 2: o schema do body vem como parâmetro.
            if let Some(schema) = param.get("schema") {
                swagger_body = Some(resolver.sample(schema, 0));
            }
            continue;
        }

        let Some(location) = ParamLocation::parse(location) else {
            continue;
        };
        let example = param
            .get("example")
            .cloned()
            .or_else(|| param.get("default").cloned())
            .or_else(|| {
                param
                    .get("schema")
                    .and_then(|schema| resolver.declared_value(schema, 0))
            });

        let spec = ParameterSpec {
            name: name.to_string(),
            location,
            required: param.get("required").and_then(Value::as_bool).unwrap_or(false)
                || location == ParamLocation::Path,
            example,
        };
        parameters.retain(|p| !(p.name == spec.name && p.location == spec.location));
        parameters.push(spec);
    }

    let body_template = operation
        .get("requestBody")
        .map(|body| resolver.deref(body, 0))
        .and_then(|body| request_body_sample(&resolver, &body))
        .or(swagger_body);

    let mut success_statuses: Vec<u16> = operation
        .get("responses")
        .and_then(Value::as_object)
        .map(|responses| {
            responses
                .keys()
                .filter_map(|code| code.parse::<u16>().ok())
                .filter(|code| (200..300).contains(code))
                .collect()
        })
        .unwrap_or_default();
    if success_statuses.is_empty() {
        success_statuses.push(200);
    }

    let summary = operation
        .get("summary")
        .or_else(|| operation.get("description"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(OperationDefinition {
        id: resolve_id(
            source,
            operation.get("operationId").and_then(Value::as_str),
            &method,
            &path,
        ),
        method,
        path,
        parameters,
        body_template,
        success_statuses,
        summary,
    })
}

/// Template de body para `requestBody` (OpenAPI 3), preferindo JSON.
fn request_body_sample(resolver: &SchemaResolver<'_>, body: &Value) -> Option<Value> {
    let content = body.get("content")?.as_object()?;
    let media = content
        .get("application/json")
        .or_else(|| content.iter().find(|(k, _)| k.contains("json")).map(|(_, v)| v))
        .or_else(|| content.values().next())?;

    if let Some(example) = media.get("example") {
        return Some(example.clone());
    }
    if let Some(first) = media
        .get("examples")
        .and_then(Value::as_object)
        .and_then(|examples| examples.values().next())
    {
        let first = resolver.deref(first, 0);
        if let Some(value) = first.get("value") {
            return Some(value.clone());
        }
    }
    media.get("schema").map(|schema| resolver.sample(schema, 0))
}

/// Resolve `$ref` locais e sintetiza valores a partir de JSON Schema.
struct SchemaResolver<'a> {
    root: &'a Value,
}

impl<'a> SchemaResolver<'a> {
    /// Segue `$ref` locais (`#/components/...`, `#/definitions/...`).
    fn deref(&self, value: &Value, depth: usize) -> Value {
        let Some(reference) = value.get("$ref").and_then(Value::as_str) else {
            return value.clone();
        };
        if depth >= MAX_SCHEMA_DEPTH {
            return Value::Null;
        }
        match reference
            .strip_prefix('#')
            .and_then(|pointer| self.root.pointer(pointer))
        {
            Some(target) => self.deref(target, depth + 1),
            None => Value::Null,
        }
    }

    /// Valor declarado explicitamente no schema (example, default, enum).
    fn declared_value(&self, schema: &Value, depth: usize) -> Option<Value> {
        let schema = self.deref(schema, depth);
        schema
            .get("example")
            .cloned()
            .or_else(|| schema.get("default").cloned())
            .or_else(|| {
                schema
                    .get("enum")
                    .and_then(Value::as_array)
                    .and_then(|values| values.first().cloned())
            })
    }

    /// Gera um valor de exemplo para o schema.
    fn sample(&self, schema: &Value, depth: usize) -> Value {
        if depth >= MAX_SCHEMA_DEPTH {
            return Value::Null;
        }
        if let Some(value) = self.declared_value(schema, depth) {
            return value;
        }
        let schema = self.deref(schema, depth);

        for combinator in ["allOf", "oneOf", "anyOf"] {
            if let Some(parts) = schema.get(combinator).and_then(Value::as_array) {
                if combinator == "allOf" {
                    let mut merged = Map::new();
                    for part in parts {
                        if let Value::Object(fields) = self.sample(part, depth + 1) {
                            merged.extend(fields);
                        }
                    }
                    return Value::Object(merged);
                }
                if let Some(first) = parts.first() {
                    return self.sample(first, depth + 1);
                }
            }
        }

        let kind = schema.get("type").and_then(Value::as_str).unwrap_or_else(|| {
            if schema.get("properties").is_some() {
                "object"
            } else {
                ""
            }
        });

        match kind {
            "object" => {
                let mut object = Map::new();
                if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                    for (name, property) in properties {
                        object.insert(name.clone(), self.sample(property, depth + 1));
                    }
                }
                Value::Object(object)
            }
            "array" => match schema.get("items") {
                Some(items) => Value::Array(vec![self.sample(items, depth + 1)]),
                None => Value::Array(Vec::new()),
            },
            "string" => Value::String(string_placeholder(&schema)),
            "integer" => Value::from(0),
            "number" => Value::from(0.0),
            "boolean" => Value::Bool(false),
            _ => Value::Null,
        }
    }
}

fn string_placeholder(schema: &Value) -> String {
    match schema.get("format").and_then(Value::as_str) {
        Some("date-time") => "1970-01-01T00:00:00Z".to_string(),
        Some("date") => "1970-01-01".to_string(),
        Some("email") => "user@example.com".to_string(),
        Some("uuid") => "00000000-0000-0000-0000-000000000000".to_string(),
        Some("uri") | Some("url") => "https://example.com".to_string(),
        _ => "string".to_string(),
    }
}
