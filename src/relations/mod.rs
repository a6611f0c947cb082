//! # Carregador do Grafo de Relações
//!
//! Converte o descritor de relações (gerado externamente) em arestas tipadas.
//!
//! ## Formato do descritor
//!
//! ```json
//! {
//!   "related_pairs": [
//!     {
//!       "source_openapi_file": "create_user.yaml",
//!       "target_openapi_file": "get_user.yaml",
//!       "relation_params": [
//!         { "source_param": "data.id", "target_param": "id", "param_location": "path" }
//!       ]
//!     }
//!   ],
//!   "unrelated_files": ["health.yaml"]
//! }
//! ```
//!
//! Nomes de arquivo viram ids de operação (sem extensão). Cada binding pode
//! declarar `relation_kind` (`global`, padrão, ou `conditional` com um
//! `condition`).
//!
//! ## Validação
//!
//! Tudo é validado aqui, uma vez só. Aresta sem ids, sem bindings ou com
//! binding malformado gera `InvalidRelation`: nada é ignorado em silêncio.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::ChainError;
use crate::loader::{self, DocumentFormat};
use crate::protocol::{Binding, ParamLocation, RelationEdge, RelationKind};

// ============================================================================
// FORMATO BRUTO
// ============================================================================
// Campos ausentes viram vazios para que a validação produza um erro
// específico em vez de um erro genérico de desserialização.

#[derive(Debug, Default, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    related_pairs: Vec<RawPair>,
    #[serde(default)]
    unrelated_files: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPair {
    #[serde(default, alias = "source")]
    source_openapi_file: String,
    #[serde(default, alias = "target")]
    target_openapi_file: String,
    #[serde(default)]
    relation_params: Option<Vec<RawParam>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawParam {
    #[serde(default)]
    source_param: String,
    #[serde(default)]
    target_param: String,
    #[serde(default)]
    param_location: String,
    #[serde(default, alias = "relation_type")]
    relation_kind: Option<String>,
    #[serde(default, alias = "trigger")]
    condition: Option<String>,
}

// ============================================================================
// CONJUNTO DE RELAÇÕES
// ============================================================================

/// Resultado validado do descritor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationSet {
    pub edges: Vec<RelationEdge>,
    /// Operações sem relações, em ordem de inserção.
    pub isolated: Vec<String>,
    /// Todos os ids: extremidades das arestas em ordem de aparição,
    /// depois as operações isoladas.
    nodes: Vec<String>,
}

impl RelationSet {
    /// Parseia e valida o descritor (JSON ou YAML).
    pub fn load(relation_source: &str) -> Result<Self, ChainError> {
        let format = DocumentFormat::sniff(relation_source);
        let document = loader::parse_document(relation_source, format).map_err(|e| {
            ChainError::InvalidRelation {
                pair_index: None,
                reason: format!("{:#}", e),
            }
        })?;
        Self::from_value(document)
    }

    /// Valida um descritor já parseado.
    pub fn from_value(document: Value) -> Result<Self, ChainError> {
        if !document.is_object() {
            return Err(ChainError::InvalidRelation {
                pair_index: None,
                reason: "descritor deve ser um objeto".to_string(),
            });
        }
        let raw: RawDescriptor =
            serde_json::from_value(document).map_err(|e| ChainError::InvalidRelation {
                pair_index: None,
                reason: e.to_string(),
            })?;

        let mut edges = Vec::with_capacity(raw.related_pairs.len());
        for (index, pair) in raw.related_pairs.into_iter().enumerate() {
            edges.push(validate_pair(index, pair)?);
        }

        let mut isolated: Vec<String> = Vec::new();
        for file in &raw.unrelated_files {
            let id = loader::operation_id_from_file(file);
            if id.is_empty() {
                return Err(ChainError::InvalidRelation {
                    pair_index: None,
                    reason: "unrelated_files contém nome vazio".to_string(),
                });
            }
            if !isolated.contains(&id) {
                isolated.push(id);
            }
        }

        let nodes = collect_nodes(&edges, &isolated);
        info!(edges = edges.len(), isolated = isolated.len(), "Relações carregadas");
        Ok(Self {
            edges,
            isolated,
            nodes,
        })
    }

    /// Avalia relações condicionais antes da construção do grafo.
    ///
    /// Bindings condicionais cuja condição não está em `active` são
    /// descartados. Uma aresta que fica sem bindings é removida, mas suas
    /// operações continuam no conjunto de nós.
    pub fn select(&self, active: &BTreeSet<String>) -> Self {
        let mut edges = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            let bindings: Vec<Binding> = edge
                .bindings
                .iter()
                .filter(|binding| match &binding.relation_kind {
                    RelationKind::Global => true,
                    RelationKind::Conditional { condition } => active.contains(condition),
                })
                .cloned()
                .collect();

            if bindings.is_empty() {
                debug!(
                    source = %edge.source_id,
                    target = %edge.target_id,
                    "Aresta condicional inativa removida"
                );
                continue;
            }
            edges.push(RelationEdge {
                source_id: edge.source_id.clone(),
                target_id: edge.target_id.clone(),
                bindings,
            });
        }

        Self {
            edges,
            isolated: self.isolated.clone(),
            nodes: self.nodes.clone(),
        }
    }

    pub fn node_ids(&self) -> &[String] {
        &self.nodes
    }
}

fn collect_nodes(edges: &[RelationEdge], isolated: &[String]) -> Vec<String> {
    let mut nodes: Vec<String> = Vec::new();
    let endpoints = edges
        .iter()
        .flat_map(|e| [e.source_id.as_str(), e.target_id.as_str()]);
    for id in endpoints.chain(isolated.iter().map(String::as_str)) {
        if !nodes.iter().any(|n| n == id) {
            nodes.push(id.to_string());
        }
    }
    nodes
}

fn validate_pair(index: usize, pair: RawPair) -> Result<RelationEdge, ChainError> {
    let invalid = |reason: String| ChainError::InvalidRelation {
        pair_index: Some(index),
        reason,
    };

    let source_id = loader::operation_id_from_file(&pair.source_openapi_file);
    let target_id = loader::operation_id_from_file(&pair.target_openapi_file);
    if source_id.is_empty() {
        return Err(invalid("source_openapi_file vazio".to_string()));
    }
    if target_id.is_empty() {
        return Err(invalid("target_openapi_file vazio".to_string()));
    }

    let params = pair.relation_params.unwrap_or_default();
    if params.is_empty() {
        return Err(invalid(format!(
            "aresta {} -> {} sem relation_params",
            source_id, target_id
        )));
    }

    let mut bindings = Vec::with_capacity(params.len());
    for (param_index, param) in params.into_iter().enumerate() {
        let source_field = param.source_param.trim().to_string();
        let target_param = param.target_param.trim().to_string();
        if source_field.is_empty() || target_param.is_empty() {
            return Err(invalid(format!(
                "relation_params[{}]: source_param e target_param são obrigatórios",
                param_index
            )));
        }
        if source_field.split('.').any(str::is_empty) {
            return Err(invalid(format!(
                "relation_params[{}]: caminho '{}' malformado",
                param_index, source_field
            )));
        }

        let param_location = ParamLocation::parse(&param.param_location).ok_or_else(|| {
            invalid(format!(
                "relation_params[{}]: param_location '{}' inválido (use path, query, body ou header)",
                param_index, param.param_location
            ))
        })?;

        let relation_kind = match param
            .relation_kind
            .as_deref()
            .map(|k| k.trim().to_lowercase())
            .as_deref()
        {
            None | Some("") | Some("global") => RelationKind::Global,
            Some("conditional") => {
                let condition = param
                    .condition
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        invalid(format!(
                            "relation_params[{}]: relação condicional sem 'condition'",
                            param_index
                        ))
                    })?;
                RelationKind::Conditional {
                    condition: condition.to_string(),
                }
            }
            Some(other) => {
                return Err(invalid(format!(
                    "relation_params[{}]: relation_kind '{}' desconhecido",
                    param_index, other
                )))
            }
        };

        bindings.push(Binding {
            source_field,
            target_param,
            param_location,
            relation_kind,
        });
    }

    Ok(RelationEdge {
        source_id,
        target_id,
        bindings,
    })
}
