//! Execução paralela de componentes independentes.
//!
//! Componentes desconexos do plano não trocam dados entre si. Cada um roda
//! numa task própria, com um `ExecutionContext` novo, limitado por
//! `max_parallel` execuções simultâneas.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ChainExecutor;
use crate::catalog::OperationCatalog;
use crate::planner::ExecutionPlan;
use crate::protocol::ChainRunSummary;

/// Roda cada componente do plano como uma cadeia separada.
///
/// Os resumos voltam na ordem dos componentes (posição do primeiro nó no
/// plano), não na ordem de término. Operações ausentes do catálogo são
/// detectadas antes de qualquer task ser criada.
pub async fn run_components(
    executor: &ChainExecutor,
    plan: &ExecutionPlan,
    catalog: Arc<OperationCatalog>,
    cancel: &CancellationToken,
) -> Result<Vec<ChainRunSummary>> {
    for id in plan.order() {
        catalog.get(id)?;
    }

    let components = plan.components();
    let max_parallel = executor.config().limits.max_parallel.max(1);
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    info!(
        components = components.len(),
        max_parallel, "Executando componentes em paralelo"
    );

    let mut tasks = JoinSet::new();
    for (index, component) in components.into_iter().enumerate() {
        let executor = executor.clone();
        let catalog = Arc::clone(&catalog);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            let summary = executor
                .run_with_cancel(&component, &catalog, &cancel)
                .await?;
            Ok::<_, anyhow::Error>((index, summary))
        });
    }

    let mut summaries = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        let (index, summary) = joined.map_err(|e| anyhow!("Component task failed: {}", e))??;
        summaries.push((index, summary));
    }

    summaries.sort_by_key(|(index, _)| *index);
    Ok(summaries.into_iter().map(|(_, summary)| summary).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::errors::ChainError;
    use crate::executors::testing::{respond, ScriptedDispatcher};
    use crate::limits::ExecutionLimits;
    use crate::planner;
    use crate::protocol::{Binding, OperationDefinition, ParamLocation, RelationEdge, RelationKind};
    use serde_json::json;
    use std::time::Duration;

    fn operation(id: &str) -> OperationDefinition {
        OperationDefinition {
            id: id.into(),
            method: "GET".into(),
            path: format!("/{}", id.to_lowercase()),
            parameters: Vec::new(),
            body_template: None,
            success_statuses: vec![200],
            summary: None,
        }
    }

    fn edge(source: &str, target: &str) -> RelationEdge {
        RelationEdge {
            source_id: source.into(),
            target_id: target.into(),
            bindings: vec![Binding {
                source_field: "value".into(),
                target_param: "from".into(),
                param_location: ParamLocation::Query,
                relation_kind: RelationKind::Global,
            }],
        }
    }

    fn catalog(ids: &[&str]) -> Arc<OperationCatalog> {
        let mut catalog = OperationCatalog::new();
        for id in ids {
            catalog.insert(operation(id));
        }
        Arc::new(catalog)
    }

    fn executor(dispatcher: Arc<ScriptedDispatcher>, max_parallel: usize) -> ChainExecutor {
        let config = RunConfig::default().with_limits(ExecutionLimits {
            max_parallel,
            ..Default::default()
        });
        ChainExecutor::new(config, dispatcher)
    }

    #[tokio::test]
    async fn test_components_run_with_isolated_contexts() {
        // A -> B e C -> D: B só pode ver o valor de A, D só o de C.
        let dispatcher = Arc::new(ScriptedDispatcher::new(|req| {
            respond(200, json!({"value": req.path.trim_start_matches('/')}))
        }));
        let plan = planner::build(&[], vec![edge("A", "B"), edge("C", "D")]).unwrap();

        let summaries = run_components(
            &executor(dispatcher.clone(), 2),
            &plan,
            catalog(&["A", "B", "C", "D"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].step("A").unwrap().operation_id, "A");
        assert!(summaries[0].step("C").is_none());
        assert!(summaries.iter().all(|s| s.is_success()));

        let b = summaries[0].step("B").unwrap();
        let d = summaries[1].step("D").unwrap();
        assert_eq!(b.request.as_ref().unwrap().query.get("from").map(String::as_str), Some("a"));
        assert_eq!(d.request.as_ref().unwrap().query.get("from").map(String::as_str), Some("c"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_components_keep_plan_order_regardless_of_finish_time() {
        let dispatcher = Arc::new(ScriptedDispatcher::new(|req| {
            if req.path == "/slow" {
                std::thread::sleep(Duration::from_millis(30));
            }
            respond(200, json!({}))
        }));
        let plan = planner::build(&["slow".to_string(), "fast".to_string()], Vec::new()).unwrap();

        let summaries = run_components(
            &executor(dispatcher, 4),
            &plan,
            catalog(&["slow", "fast"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summaries[0].steps[0].operation_id, "slow");
        assert_eq!(summaries[1].steps[0].operation_id, "fast");
    }

    #[tokio::test]
    async fn test_unknown_operation_fails_before_spawning() {
        let dispatcher = Arc::new(ScriptedDispatcher::new(|_| respond(200, json!({}))));
        let plan = planner::build(&["A".to_string(), "ghost".to_string()], Vec::new()).unwrap();

        let err = run_components(
            &executor(dispatcher.clone(), 2),
            &plan,
            catalog(&["A"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(
            err.downcast_ref::<ChainError>(),
            Some(&ChainError::UnknownOperation { id: "ghost".into() })
        );
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_components_stop_before_first_step() {
        let dispatcher = Arc::new(ScriptedDispatcher::new(|_| respond(200, json!({}))));
        let plan = planner::build(&["A".to_string(), "B".to_string()], Vec::new()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summaries = run_components(&executor(dispatcher.clone(), 1), &plan, catalog(&["A", "B"]), &cancel)
            .await
            .unwrap();

        assert!(summaries
            .iter()
            .all(|s| s.total == 0 && s.run_error == Some(ChainError::RunCancelled)));
        assert!(dispatcher.calls().is_empty());
    }
}
