//! Shard execution and cross-shard result merging
//!
//! A plan is executed by running the query on every planned shard
//! concurrently and waiting for all of them. Results are merged in ascending
//! shard order regardless of which shard finished first, and only when every
//! shard returned the same row description.

use crate::error::RouterError;
use crate::plugin::schema::{Intercept, Query, Row, RowDescription};
use crate::shard::DispatchPlan;
use crate::state::Metrics;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rows returned by one shard, or by all of them after merging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub row_description: RowDescription,
    pub rows: Vec<Row>,
}

impl From<Intercept> for ResultSet {
    fn from(intercept: Intercept) -> Self {
        Self {
            row_description: intercept.row_description,
            rows: intercept.rows,
        }
    }
}

/// Backend collaborator running a query on one shard
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    async fn execute(&self, shard: usize, query: &Query) -> Result<ResultSet, RouterError>;
}

/// Executes dispatch plans
#[derive(Default)]
pub struct FanOut {
    metrics: Option<Arc<Metrics>>,
}

impl FanOut {
    pub fn new(metrics: Option<Arc<Metrics>>) -> Self {
        Self { metrics }
    }

    /// Run `query` on every shard of `plan` and merge the results.
    ///
    /// The first shard failure, or `cancel` firing, drops every outstanding
    /// shard execution; no partial result is returned in either case.
    pub async fn execute(
        &self,
        plan: &DispatchPlan,
        query: &Query,
        executor: &dyn ShardExecutor,
        cancel: &CancellationToken,
    ) -> Result<ResultSet, RouterError> {
        let shards = plan.shards();
        if plan.is_fan_out() {
            debug!("fanning out to {} shard(s)", shards.len());
            if let Some(metrics) = &self.metrics {
                metrics.record_fan_out(shards.len());
            }
        }

        let executions = shards.into_iter().map(|shard| async move {
            executor
                .execute(shard, query)
                .await
                .map(|result| (shard, result))
        });

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("query cancelled during shard execution");
                return Err(RouterError::Cancelled);
            }
            results = try_join_all(executions) => results?,
        };

        merge(results)
    }
}

/// Concatenate per-shard results in ascending shard order.
///
/// Every row description must equal the lowest shard's, column names and
/// type OIDs alike.
pub fn merge(mut results: Vec<(usize, ResultSet)>) -> Result<ResultSet, RouterError> {
    results.sort_by_key(|(shard, _)| *shard);

    let mut results = results.into_iter();
    let Some((_, mut merged)) = results.next() else {
        return Ok(ResultSet::default());
    };

    for (shard, result) in results {
        if let Some(reason) = mismatch(&merged.row_description, &result.row_description) {
            return Err(RouterError::Merge { shard, reason });
        }
        merged.rows.extend(result.rows);
    }

    Ok(merged)
}

fn mismatch(expected: &RowDescription, actual: &RowDescription) -> Option<String> {
    if expected.len() != actual.len() {
        return Some(format!(
            "expected {} column(s), got {}",
            expected.len(),
            actual.len()
        ));
    }

    expected
        .columns
        .iter()
        .zip(actual.columns.iter())
        .enumerate()
        .find(|(_, (expected, actual))| expected != actual)
        .map(|(index, (expected, actual))| {
            format!(
                "column {} is \"{}\" (oid {}), expected \"{}\" (oid {})",
                index, actual.name, actual.oid, expected.name, expected.oid
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::schema::{RowColumn, RowDescriptionColumn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn description(names: &[&str]) -> RowDescription {
        RowDescription::new(
            names
                .iter()
                .map(|name| RowDescriptionColumn::new(*name, 25))
                .collect(),
        )
    }

    fn result(shard: usize) -> ResultSet {
        ResultSet {
            row_description: description(&["id"]),
            rows: vec![Row::new(vec![RowColumn::value(shard.to_string())])],
        }
    }

    #[test]
    fn test_merge_orders_by_shard() {
        let merged = merge(vec![(2, result(2)), (0, result(0)), (1, result(1))]).unwrap();
        assert_eq!(
            merged.rows,
            vec![result(0).rows[0].clone(), result(1).rows[0].clone(), result(2).rows[0].clone()]
        );
    }

    #[test]
    fn test_merge_rejects_different_shapes() {
        let mut other = result(2);
        other.row_description = description(&["id", "name"]);

        let err = merge(vec![(0, result(0)), (1, result(1)), (2, other)]).unwrap_err();
        assert!(matches!(err, RouterError::Merge { shard: 2, .. }));
    }

    #[test]
    fn test_merge_rejects_different_types() {
        let mut other = result(1);
        other.row_description.columns[0].oid = 20;

        let err = merge(vec![(0, result(0)), (1, other)]).unwrap_err();
        match err {
            RouterError::Merge { shard, reason } => {
                assert_eq!(shard, 1);
                assert!(reason.contains("oid 20"));
            }
            other => panic!("Expected merge fault, got {other:?}"),
        }
    }

    /// Finishes later the lower its shard index is.
    struct Staggered;

    #[async_trait]
    impl ShardExecutor for Staggered {
        async fn execute(&self, shard: usize, _query: &Query) -> Result<ResultSet, RouterError> {
            tokio::time::sleep(Duration::from_millis(10 * (4 - shard as u64))).await;
            Ok(result(shard))
        }
    }

    #[tokio::test]
    async fn test_fan_out_ignores_completion_order() {
        let merged = FanOut::default()
            .execute(
                &DispatchPlan::All(4),
                &Query::new("SELECT id FROM t"),
                &Staggered,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let expected: Vec<Row> = (0..4).flat_map(|shard| result(shard).rows).collect();
        assert_eq!(merged.rows, expected);
    }

    #[tokio::test]
    async fn test_single_shard_plan() {
        let mut executor = MockShardExecutor::new();
        executor
            .expect_execute()
            .withf(|shard, _| *shard == 1)
            .times(1)
            .returning(|shard, _| Ok(result(shard)));

        let merged = FanOut::default()
            .execute(
                &DispatchPlan::Single(1),
                &Query::new("SELECT 1"),
                &executor,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(merged, result(1));
    }

    #[tokio::test]
    async fn test_shard_failure_fails_query() {
        let mut executor = MockShardExecutor::new();
        executor.expect_execute().returning(|shard, _| {
            if shard == 1 {
                Err(RouterError::Backend {
                    shard,
                    reason: "connection reset".to_string(),
                })
            } else {
                Ok(result(shard))
            }
        });

        let err = FanOut::default()
            .execute(
                &DispatchPlan::All(3),
                &Query::new("SELECT 1"),
                &executor,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Backend { shard: 1, .. }));
    }

    /// Never finishes; counts how many executions were dropped.
    struct Hanging {
        dropped: Arc<AtomicUsize>,
    }

    struct DropGuard(Arc<AtomicUsize>);

    impl Drop for DropGuard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ShardExecutor for Hanging {
        async fn execute(&self, _shard: usize, _query: &Query) -> Result<ResultSet, RouterError> {
            let _guard = DropGuard(self.dropped.clone());
            futures::future::pending::<()>().await;
            Ok(ResultSet::default())
        }
    }

    #[tokio::test]
    async fn test_cancellation_drops_outstanding_shards() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let executor = Hanging {
            dropped: dropped.clone(),
        };
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = FanOut::default()
            .execute(&DispatchPlan::All(3), &Query::new("SELECT 1"), &executor, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, RouterError::Cancelled);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }
}
