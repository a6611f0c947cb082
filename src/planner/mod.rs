//! # Módulo de Planejamento (DAG)
//!
//! Constrói o grafo de dependências entre operações e produz a ordem de
//! execução da cadeia.
//!
//! ## Para todos entenderem:
//!
//! Se a operação B precisa do `id` que a operação A devolve, A tem que rodar
//! antes de B. O planner recebe todas essas relações e devolve uma fila
//! única em que cada origem aparece antes dos seus destinos.
//!
//! ```text
//!     [create_user]      [health]     <- Raízes (sem dependências)
//!          |
//!          v
//!     [get_user]                      <- Depende de create_user
//!          |
//!          v
//!     [delete_user]                   <- Depende de get_user
//!
//! Plano: create_user, health, get_user, delete_user
//! ```
//!
//! ## Algoritmo: Kahn
//!
//! 1. Calcula o grau de entrada de cada nó
//! 2. Coloca na fila de prontos todos os nós com grau zero
//! 3. Retira o pronto de menor posição de inserção, adiciona ao plano e
//!    decrementa o grau dos sucessores
//! 4. Se sobrarem nós fora do plano, existe ciclo entre eles
//!
//! O desempate pela posição de inserção garante que a mesma entrada sempre
//! produz o mesmo plano (testes gerados reprodutíveis).

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::catalog::OperationCatalog;
use crate::errors::ChainError;
use crate::limits::{validate_limits, ExecutionLimits};
use crate::protocol::RelationEdge;
use crate::relations::RelationSet;

// ============================================================================
// GRAFO
// ============================================================================

/// Grafo de execução: nós em ordem de inserção + arestas.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: Vec<String>,
    edges: Vec<RelationEdge>,
}

impl ExecutionGraph {
    /// Monta o grafo. Nós citados só pelas arestas entram depois dos
    /// informados, na ordem em que aparecem.
    pub fn new(nodes: &[String], edges: Vec<RelationEdge>) -> Self {
        let mut all: Vec<String> = Vec::with_capacity(nodes.len());
        let mentioned = nodes.iter().map(String::as_str).chain(
            edges
                .iter()
                .flat_map(|e| [e.source_id.as_str(), e.target_id.as_str()]),
        );
        for id in mentioned {
            if !all.iter().any(|n| n == id) {
                all.push(id.to_string());
            }
        }
        Self { nodes: all, edges }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn edges(&self) -> &[RelationEdge] {
        &self.edges
    }

    /// Ordenação topológica (Kahn) com desempate estável.
    ///
    /// Retorna `CycleDetected` com os nós que ficaram fora do plano.
    /// Não existe plano parcial.
    pub fn sort(&self) -> Result<ExecutionPlan, ChainError> {
        let position: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for edge in &self.edges {
            let (Some(&from), Some(&to)) = (
                position.get(edge.source_id.as_str()),
                position.get(edge.target_id.as_str()),
            ) else {
                continue;
            };
            successors[from].push(to);
            in_degree[to] += 1;
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(self.nodes[node].clone());
            for &next in &successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < self.nodes.len() {
            let unresolved: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, degree)| **degree > 0)
                .map(|(i, _)| self.nodes[i].clone())
                .collect();
            warn!(nodes = ?unresolved, "Ciclo detectado no grafo de relações");
            return Err(ChainError::CycleDetected { nodes: unresolved });
        }

        info!(operations = order.len(), edges = self.edges.len(), "Plano de execução construído");
        Ok(ExecutionPlan {
            order,
            edges: self.edges.clone(),
        })
    }
}

/// Constrói o plano a partir de nós e arestas.
pub fn build(nodes: &[String], edges: Vec<RelationEdge>) -> Result<ExecutionPlan, ChainError> {
    ExecutionGraph::new(nodes, edges).sort()
}

/// Prepara o plano completo de uma execução.
///
/// Avalia as relações condicionais, ordena o grafo, confere que toda
/// operação existe no catálogo e aplica os limites. Qualquer falha aqui é
/// fatal e acontece antes de qualquer chamada HTTP.
pub fn prepare(
    relations: &RelationSet,
    catalog: &OperationCatalog,
    active_conditions: &BTreeSet<String>,
    limits: &ExecutionLimits,
) -> Result<ExecutionPlan, ChainError> {
    let selected = relations.select(active_conditions);
    let plan = build(selected.node_ids(), selected.edges.clone())?;

    for id in plan.order() {
        catalog.get(id)?;
    }

    validate_limits(plan.len(), limits)?;
    Ok(plan)
}

// ============================================================================
// PLANO
// ============================================================================

/// Ordem total dos nós, consistente com todas as arestas.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    order: Vec<String>,
    edges: Vec<RelationEdge>,
}

impl ExecutionPlan {
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn edges(&self) -> &[RelationEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|n| n == id)
    }

    /// Arestas que chegam em `target_id`, na ordem do descritor.
    pub fn incoming<'a>(&'a self, target_id: &'a str) -> impl Iterator<Item = &'a RelationEdge> + 'a {
        self.edges.iter().filter(move |e| e.target_id == target_id)
    }

    /// SHA-256 da ordem e das arestas, em hexadecimal.
    ///
    /// Dois planos com o mesmo fingerprint geram exatamente as mesmas
    /// requisições na mesma ordem.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for id in &self.order {
            hasher.update(b"node:");
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        for edge in &self.edges {
            hasher.update(format!("edge:{}->{}\n", edge.source_id, edge.target_id).as_bytes());
            for binding in &edge.bindings {
                hasher.update(
                    format!(
                        "  {}={}@{}\n",
                        binding.source_field, binding.target_param, binding.param_location
                    )
                    .as_bytes(),
                );
            }
        }
        format!("{:x}", hasher.finalize())
    }

    /// Divide o plano em componentes desconexos.
    ///
    /// Componentes não trocam dados entre si e podem rodar em paralelo,
    /// cada um com o seu próprio contexto. A ordem relativa dentro de cada
    /// componente é a do plano original; os componentes são ordenados pela
    /// posição do primeiro nó.
    pub fn components(&self) -> Vec<ExecutionPlan> {
        let index: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut parent: Vec<usize> = (0..self.order.len()).collect();
        fn find(parent: &mut [usize], mut node: usize) -> usize {
            while parent[node] != node {
                parent[node] = parent[parent[node]];
                node = parent[node];
            }
            node
        }

        for edge in &self.edges {
            if let (Some(&a), Some(&b)) = (
                index.get(edge.source_id.as_str()),
                index.get(edge.target_id.as_str()),
            ) {
                let (root_a, root_b) = (find(&mut parent, a), find(&mut parent, b));
                if root_a != root_b {
                    parent[root_a.max(root_b)] = root_a.min(root_b);
                }
            }
        }

        let mut groups: Vec<(usize, Vec<String>)> = Vec::new();
        for (i, id) in self.order.iter().enumerate() {
            let root = find(&mut parent, i);
            match groups.iter_mut().find(|(r, _)| *r == root) {
                Some((_, members)) => members.push(id.clone()),
                None => groups.push((root, vec![id.clone()])),
            }
        }

        groups
            .into_iter()
            .map(|(_, order)| {
                let edges = self
                    .edges
                    .iter()
                    .filter(|e| order.contains(&e.source_id))
                    .cloned()
                    .collect();
                ExecutionPlan { order, edges }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DefinitionSource;
    use crate::protocol::{Binding, ParamLocation, RelationKind};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn edge(source: &str, target: &str) -> RelationEdge {
        RelationEdge {
            source_id: source.to_string(),
            target_id: target.to_string(),
            bindings: vec![Binding {
                source_field: "data.id".to_string(),
                target_param: "id".to_string(),
                param_location: ParamLocation::Path,
                relation_kind: RelationKind::Global,
            }],
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn assert_topological(plan: &ExecutionPlan, nodes: &[String], edges: &[RelationEdge]) {
        assert_eq!(plan.len(), nodes.len());
        for node in nodes {
            assert_eq!(plan.order().iter().filter(|n| *n == node).count(), 1);
        }
        for e in edges {
            let from = plan.position(&e.source_id).unwrap();
            let to = plan.position(&e.target_id).unwrap();
            assert!(from < to, "{} deve vir antes de {}", e.source_id, e.target_id);
        }
    }

    #[test]
    fn test_linear_chain() {
        let edges = vec![edge("A", "B"), edge("B", "C")];
        let plan = build(&[], edges).unwrap();
        assert_eq!(plan.order(), ["A", "B", "C"]);
    }

    #[test]
    fn test_diamond_respects_edges() {
        let edges = vec![edge("A", "B"), edge("A", "C"), edge("B", "D"), edge("C", "D")];
        let plan = build(&[], edges.clone()).unwrap();
        assert_eq!(plan.order(), ["A", "B", "C", "D"]);
        assert_topological(&plan, &ids(&["A", "B", "C", "D"]), &edges);
    }

    #[test]
    fn test_ties_broken_by_insertion_order() {
        let nodes = ids(&["Z", "Y", "X"]);
        let plan = build(&nodes, vec![edge("X", "W")]).unwrap();
        assert_eq!(plan.order(), ["Z", "Y", "X", "W"]);
    }

    #[test]
    fn test_isolated_nodes_keep_insertion_order() {
        let set = RelationSet::from_value(json!({
            "related_pairs": [{
                "source_openapi_file": "A.yaml", "target_openapi_file": "B.yaml",
                "relation_params": [{"source_param": "data.id", "target_param": "id", "param_location": "path"}]
            }],
            "unrelated_files": ["D.yaml", "C.yaml"]
        }))
        .unwrap();

        let plan = build(set.node_ids(), set.edges.clone()).unwrap();

        assert_eq!(plan.order(), ["A", "B", "D", "C"]);
        assert_eq!(plan.order().iter().filter(|n| *n == "D").count(), 1);
        assert_eq!(plan.incoming("D").count(), 0);
    }

    #[test]
    fn test_two_node_cycle_is_detected() {
        let err = build(&[], vec![edge("A", "B"), edge("B", "A")]).unwrap_err();
        assert_eq!(err, ChainError::CycleDetected { nodes: ids(&["A", "B"]) });
    }

    #[test]
    fn test_cycle_reports_only_unresolved_nodes() {
        let edges = vec![edge("root", "A"), edge("A", "B"), edge("B", "C"), edge("C", "A")];
        let nodes = ids(&["free"]);
        let err = build(&nodes, edges).unwrap_err();
        match err {
            ChainError::CycleDetected { nodes } => assert_eq!(nodes, ids(&["A", "B", "C"])),
            other => panic!("esperado ciclo, obtido {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let err = build(&[], vec![edge("A", "A")]).unwrap_err();
        assert_eq!(err.kind(), "cycle_detected");
    }

    #[test]
    fn test_sort_is_deterministic() {
        let edges = vec![edge("A", "C"), edge("B", "C"), edge("C", "D"), edge("E", "D")];
        let first = build(&[], edges.clone()).unwrap();
        for _ in 0..10 {
            assert_eq!(build(&[], edges.clone()).unwrap(), first);
        }
        assert_eq!(first.fingerprint(), build(&[], edges).unwrap().fingerprint());
    }

    #[test]
    fn test_random_dags_are_sorted_topologically() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let size = rng.gen_range(1..15);
            let nodes: Vec<String> = (0..size).map(|i| format!("op{}", i)).collect();
            // Arestas só de índice menor para maior: sempre acíclico.
            let mut edges = Vec::new();
            for i in 0..size {
                for j in (i + 1)..size {
                    if rng.gen_bool(0.3) {
                        edges.push(edge(&nodes[i], &nodes[j]));
                    }
                }
            }
            // Embaralha a ordem de inserção dos nós.
            let mut shuffled = nodes.clone();
            for i in (1..shuffled.len()).rev() {
                let j = rng.gen_range(0..=i);
                shuffled.swap(i, j);
            }

            let plan = build(&shuffled, edges.clone()).unwrap();
            assert_topological(&plan, &nodes, &edges);
        }
    }

    #[test]
    fn test_random_graphs_with_back_edge_always_fail() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..30 {
            let size = rng.gen_range(2..10);
            let nodes: Vec<String> = (0..size).map(|i| format!("op{}", i)).collect();
            let mut edges: Vec<RelationEdge> = (0..size - 1)
                .map(|i| edge(&nodes[i], &nodes[i + 1]))
                .collect();
            let from = rng.gen_range(1..size);
            let to = rng.gen_range(0..from);
            edges.push(edge(&nodes[from], &nodes[to]));

            assert!(matches!(
                build(&nodes, edges),
                Err(ChainError::CycleDetected { .. })
            ));
        }
    }

    #[test]
    fn test_components_split_disconnected_chains() {
        let edges = vec![edge("A", "B"), edge("C", "D"), edge("B", "E")];
        let plan = build(&ids(&["F"]), edges).unwrap();

        let components = plan.components();

        assert_eq!(components.len(), 3);
        assert_eq!(components[0].order(), ["F"]);
        assert_eq!(components[1].order(), ["A", "B", "E"]);
        assert_eq!(components[1].edges().len(), 2);
        assert_eq!(components[2].order(), ["C", "D"]);
    }

    #[test]
    fn test_prepare_rejects_unknown_operation() {
        let set = RelationSet::from_value(json!({
            "related_pairs": [{
                "source_openapi_file": "A", "target_openapi_file": "B",
                "relation_params": [{"source_param": "id", "target_param": "id", "param_location": "path"}]
            }]
        }))
        .unwrap();

        let mut catalog = OperationCatalog::new();
        catalog
            .load(DefinitionSource::new("A", json!({"method": "GET", "path": "/a"})))
            .unwrap();

        let err = prepare(&set, &catalog, &BTreeSet::new(), &ExecutionLimits::default()).unwrap_err();
        assert_eq!(err, ChainError::UnknownOperation { id: "B".into() });
    }

    #[test]
    fn test_prepare_enforces_operation_limit() {
        let set = RelationSet::from_value(json!({"unrelated_files": ["A", "B", "C"]})).unwrap();
        let mut catalog = OperationCatalog::new();
        for id in ["A", "B", "C"] {
            catalog
                .load(DefinitionSource::new(id, json!({"method": "GET", "path": "/x"})))
                .unwrap();
        }
        let limits = ExecutionLimits {
            max_operations: 2,
            ..ExecutionLimits::default()
        };

        let err = prepare(&set, &catalog, &BTreeSet::new(), &limits).unwrap_err();
        assert_eq!(err.kind(), "limit_exceeded");
    }
}
