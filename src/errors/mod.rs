//! # Módulo de Erros da Cadeia
//!
//! Define a taxonomia de erros do motor de cadeias e os códigos
//! estruturados usados em relatórios e integrações (CI/CD, endpoints HTTP).
//!
//! ## Para todos entenderem:
//!
//! Um erro pode acontecer em três momentos diferentes:
//!
//! | Momento           | Efeito                                   | Exemplos                          |
//! |-------------------|------------------------------------------|-----------------------------------|
//! | Construção        | Aborta tudo, nenhuma chamada HTTP        | operação desconhecida, ciclo      |
//! | Step              | Marca só aquele step como falho          | campo ausente, status inesperado  |
//! | Execução inteira  | Para de iniciar novos steps              | timeout global, cancelamento      |
//!
//! ## Faixas de código
//!
//! | Faixa  | Categoria   |
//! |--------|-------------|
//! | E1xxx  | Construção  |
//! | E2xxx  | Transporte  |
//! | E3xxx  | Step        |
//! | E4xxx  | Execução    |
//!
//! Todo erro serializa como `{kind, code, message, ...detalhe}`, então quem
//! chama (CLI, endpoint HTTP) consegue renderizar sem reinterpretar a causa.

use std::fmt;

use serde::ser::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

// ============================================================================
// CÓDIGO DE ERRO
// ============================================================================

/// Código de erro estruturado: primeiro dígito é a categoria,
/// os três últimos identificam o erro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // E1xxx: construção do plano. Nenhuma chamada HTTP foi feita.

    /// Aresta ou plano referencia operação ausente do catálogo.
    pub const UNKNOWN_OPERATION: Self = Self(1001);

    /// Aresta ou binding malformado no descritor de relações.
    pub const INVALID_RELATION: Self = Self(1002);

    /// Grafo de dependências contém ciclo.
    pub const CYCLE_DETECTED: Self = Self(1003);

    /// Arquivo de definição de operação inválido.
    pub const INVALID_DEFINITION: Self = Self(1004);

    /// Plano excede os limites configurados.
    pub const LIMIT_EXCEEDED: Self = Self(1005);

    // E2xxx: transporte HTTP.

    /// Requisição não respondeu dentro do timeout por chamada.
    pub const HTTP_TIMEOUT: Self = Self(2001);

    /// Falha de conexão (DNS, conexão recusada).
    pub const HTTP_CONNECTION_ERROR: Self = Self(2002);

    /// Qualquer outra falha de transporte.
    pub const HTTP_REQUEST_ERROR: Self = Self(2003);

    // E3xxx: erros com escopo de um step.

    /// Status da resposta diferente do declarado.
    pub const ASSERTION_STATUS_CODE: Self = Self(3001);

    /// Campo de origem de um binding ausente na resposta capturada.
    pub const UPSTREAM_FIELD_MISSING: Self = Self(3002);

    /// Placeholder `{param}` ausente do template de path.
    pub const PLACEHOLDER_MISSING: Self = Self(3003);

    /// Path ainda contém placeholders após aplicar bindings.
    pub const UNRESOLVED_PATH_PARAMETER: Self = Self(3004);

    /// Binding de body sobre um valor que não é objeto.
    pub const BODY_SHAPE_MISMATCH: Self = Self(3005);

    // E4xxx: erros com escopo da execução inteira.

    /// Orçamento total de tempo esgotado.
    pub const RUN_TIMEOUT: Self = Self(4001);

    /// Execução cancelada pelo chamador.
    pub const RUN_CANCELLED: Self = Self(4002);

    /// Retorna o código numérico.
    pub fn code(&self) -> u16 {
        self.0
    }

    /// Código com prefixo "E". Exemplo: `E1003`.
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Build,
            2 => ErrorCategory::Transport,
            3 => ErrorCategory::Step,
            4 => ErrorCategory::Run,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Descrição curta, útil em logs.
    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "Operação desconhecida",
            1002 => "Relação inválida",
            1003 => "Dependência circular",
            1004 => "Definição de operação inválida",
            1005 => "Limite excedido",
            2001 => "Timeout HTTP",
            2002 => "Erro de conexão",
            2003 => "Erro de requisição HTTP",
            3001 => "Status HTTP inesperado",
            3002 => "Campo de origem ausente",
            3003 => "Placeholder ausente no path",
            3004 => "Parâmetro de path não resolvido",
            3005 => "Body incompatível com o binding",
            4001 => "Timeout da execução",
            4002 => "Execução cancelada",
            _ => "Erro desconhecido",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

/// Categoria derivada do primeiro dígito do código.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Erros de construção do plano (E1xxx). Fatais para a execução.
    Build,
    /// Erros de transporte HTTP (E2xxx). Escopo de um step.
    Transport,
    /// Erros de binding/verificação (E3xxx). Escopo de um step.
    Step,
    /// Erros da execução inteira (E4xxx).
    Run,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "Construção"),
            Self::Transport => write!(f, "Transporte"),
            Self::Step => write!(f, "Step"),
            Self::Run => write!(f, "Execução"),
            Self::Unknown => write!(f, "Desconhecido"),
        }
    }
}

// ============================================================================
// ERRO DA CADEIA
// ============================================================================

/// Todos os modos de falha do motor de cadeias.
///
/// Variantes de construção (`UnknownOperation`, `InvalidRelation`,
/// `CycleDetected`, `InvalidDefinition`, `LimitExceeded`) são levantadas antes
/// de qualquer chamada de rede. As demais são registradas no resultado do
/// step ou da execução.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainError {
    #[error("Operação '{id}' não existe no catálogo")]
    UnknownOperation { id: String },

    #[error("Relação inválida{}: {reason}", pair_label(.pair_index))]
    InvalidRelation {
        pair_index: Option<usize>,
        reason: String,
    },

    #[error("Dependência circular entre as operações: {}", .nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("Definição de operação '{source_name}' inválida: {reason}")]
    InvalidDefinition { source_name: String, reason: String },

    #[error("Limite '{limit}' excedido: {actual} (máximo {max})")]
    LimitExceeded {
        limit: String,
        max: usize,
        actual: usize,
    },

    #[error("Campo '{path}' não encontrado na resposta de '{source_id}' (chaves disponíveis: [{}])", .available_keys.join(", "))]
    UpstreamFieldMissing {
        source_id: String,
        path: String,
        available_keys: Vec<String>,
    },

    #[error("Placeholder '{{{param}}}' não existe no path '{template}'")]
    PlaceholderMissing { param: String, template: String },

    #[error("Path '{path}' tem parâmetros sem valor: {}", .params.join(", "))]
    UnresolvedPathParameter { path: String, params: Vec<String> },

    #[error("Campo de body '{param}' exige objeto, mas o template tem {found} em '{at}'")]
    BodyShapeMismatch {
        param: String,
        at: String,
        found: String,
    },

    #[error("Falha HTTP em {method} {url}: {message}")]
    HttpRequest {
        method: String,
        url: String,
        message: String,
        timeout: bool,
        connect: bool,
    },

    #[error("Status {actual} não corresponde ao esperado {expected:?}")]
    AssertionFailure { expected: Vec<u16>, actual: u16 },

    #[error("Execução excedeu o orçamento de {budget_ms}ms")]
    RunTimeout { budget_ms: u64 },

    #[error("Execução cancelada")]
    RunCancelled,
}

fn pair_label(index: &Option<usize>) -> String {
    index
        .map(|i| format!(" (related_pairs[{}])", i))
        .unwrap_or_default()
}

impl ChainError {
    /// Nome estável do tipo de erro, em snake_case.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownOperation { .. } => "unknown_operation",
            Self::InvalidRelation { .. } => "invalid_relation",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::InvalidDefinition { .. } => "invalid_definition",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::UpstreamFieldMissing { .. } => "upstream_field_missing",
            Self::PlaceholderMissing { .. } => "placeholder_missing",
            Self::UnresolvedPathParameter { .. } => "unresolved_path_parameter",
            Self::BodyShapeMismatch { .. } => "body_shape_mismatch",
            Self::HttpRequest { .. } => "http_request",
            Self::AssertionFailure { .. } => "assertion_failure",
            Self::RunTimeout { .. } => "run_timeout",
            Self::RunCancelled => "run_cancelled",
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownOperation { .. } => ErrorCode::UNKNOWN_OPERATION,
            Self::InvalidRelation { .. } => ErrorCode::INVALID_RELATION,
            Self::CycleDetected { .. } => ErrorCode::CYCLE_DETECTED,
            Self::InvalidDefinition { .. } => ErrorCode::INVALID_DEFINITION,
            Self::LimitExceeded { .. } => ErrorCode::LIMIT_EXCEEDED,
            Self::UpstreamFieldMissing { .. } => ErrorCode::UPSTREAM_FIELD_MISSING,
            Self::PlaceholderMissing { .. } => ErrorCode::PLACEHOLDER_MISSING,
            Self::UnresolvedPathParameter { .. } => ErrorCode::UNRESOLVED_PATH_PARAMETER,
            Self::BodyShapeMismatch { .. } => ErrorCode::BODY_SHAPE_MISMATCH,
            Self::HttpRequest { timeout: true, .. } => ErrorCode::HTTP_TIMEOUT,
            Self::HttpRequest { connect: true, .. } => ErrorCode::HTTP_CONNECTION_ERROR,
            Self::HttpRequest { .. } => ErrorCode::HTTP_REQUEST_ERROR,
            Self::AssertionFailure { .. } => ErrorCode::ASSERTION_STATUS_CODE,
            Self::RunTimeout { .. } => ErrorCode::RUN_TIMEOUT,
            Self::RunCancelled => ErrorCode::RUN_CANCELLED,
        }
    }

    /// Erros de construção abortam a execução antes de qualquer chamada.
    pub fn is_build_error(&self) -> bool {
        self.code().category() == ErrorCategory::Build
    }

    /// Campos contextuais do erro, sem a mensagem.
    fn detail(&self) -> Value {
        match self {
            Self::UnknownOperation { id } => json!({ "id": id }),
            Self::InvalidRelation { pair_index, reason } => {
                json!({ "pair_index": pair_index, "reason": reason })
            }
            Self::CycleDetected { nodes } => json!({ "nodes": nodes }),
            Self::InvalidDefinition { source_name, reason } => {
                json!({ "source": source_name, "reason": reason })
            }
            Self::LimitExceeded { limit, max, actual } => {
                json!({ "limit": limit, "max": max, "actual": actual })
            }
            Self::UpstreamFieldMissing {
                source_id,
                path,
                available_keys,
            } => json!({
                "source_id": source_id,
                "path": path,
                "available_keys": available_keys,
            }),
            Self::PlaceholderMissing { param, template } => {
                json!({ "param": param, "template": template })
            }
            Self::UnresolvedPathParameter { path, params } => {
                json!({ "path": path, "params": params })
            }
            Self::BodyShapeMismatch { param, at, found } => {
                json!({ "param": param, "at": at, "found": found })
            }
            Self::HttpRequest {
                method,
                url,
                timeout,
                connect,
                ..
            } => json!({
                "method": method,
                "url": url,
                "timeout": timeout,
                "connect": connect,
            }),
            Self::AssertionFailure { expected, actual } => {
                json!({ "expected": expected, "actual": actual })
            }
            Self::RunTimeout { budget_ms } => json!({ "budget_ms": budget_ms }),
            Self::RunCancelled => json!({}),
        }
    }
}

impl Serialize for ChainError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = Map::new();
        map.insert("kind".to_string(), Value::from(self.kind()));
        map.insert("code".to_string(), Value::from(self.code().formatted()));
        map.insert("message".to_string(), Value::from(self.to_string()));
        if let Value::Object(detail) = self.detail() {
            map.extend(detail);
        }
        map.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::UNKNOWN_OPERATION.formatted(), "E1001");
        assert_eq!(ErrorCode::HTTP_TIMEOUT.formatted(), "E2001");
        assert_eq!(ErrorCode::UPSTREAM_FIELD_MISSING.formatted(), "E3002");
        assert_eq!(ErrorCode::RUN_CANCELLED.to_string(), "E4002");
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::CYCLE_DETECTED.category(), ErrorCategory::Build);
        assert_eq!(ErrorCode::HTTP_CONNECTION_ERROR.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::ASSERTION_STATUS_CODE.category(), ErrorCategory::Step);
        assert_eq!(ErrorCode::RUN_TIMEOUT.category(), ErrorCategory::Run);
    }

    #[test]
    fn test_http_error_code_depends_on_flags() {
        let timeout = ChainError::HttpRequest {
            method: "GET".into(),
            url: "http://localhost/x".into(),
            message: "timed out".into(),
            timeout: true,
            connect: false,
        };
        let refused = ChainError::HttpRequest {
            method: "GET".into(),
            url: "http://localhost/x".into(),
            message: "refused".into(),
            timeout: false,
            connect: true,
        };
        assert_eq!(timeout.code(), ErrorCode::HTTP_TIMEOUT);
        assert_eq!(refused.code(), ErrorCode::HTTP_CONNECTION_ERROR);
        assert!(!timeout.is_build_error());
    }

    #[test]
    fn test_serialized_error_is_machine_readable() {
        let err = ChainError::UpstreamFieldMissing {
            source_id: "create_user".into(),
            path: "data.token".into(),
            available_keys: vec!["id".into(), "name".into()],
        };

        let value = serde_json::to_value(&err).unwrap();

        assert_eq!(value["kind"], "upstream_field_missing");
        assert_eq!(value["code"], "E3002");
        assert_eq!(value["path"], "data.token");
        assert_eq!(value["available_keys"], json!(["id", "name"]));
        assert!(value["message"].as_str().unwrap().contains("data.token"));
    }

    #[test]
    fn test_cycle_message_names_nodes() {
        let err = ChainError::CycleDetected {
            nodes: vec!["A".into(), "B".into()],
        };
        assert!(err.is_build_error());
        assert!(err.to_string().contains("A, B"));
    }

    #[test]
    fn test_invalid_relation_message_includes_pair() {
        let err = ChainError::InvalidRelation {
            pair_index: Some(2),
            reason: "relation_params vazio".into(),
        };
        assert!(err.to_string().contains("related_pairs[2]"));
    }
}
