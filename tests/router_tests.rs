//! End-to-end routing tests: chain decision, shard resolution, execution and
//! the messages the client ends up receiving.

use async_trait::async_trait;
use pg_plugin_router::error::RouterError;
use pg_plugin_router::intercept::BackendMessage;
use pg_plugin_router::plugin::config::{PluginAssignment, PluginConfig};
use pg_plugin_router::plugin::manager::PluginManager;
use pg_plugin_router::plugin::schema::{
    ClusterConfig, DatabaseConfig, Input, Intercept, Output, PluginError, Query, Role, Route,
    Row, RowColumn, RowDescription, RowDescriptionColumn, Shard,
};
use pg_plugin_router::plugin::RoutingPlugin;
use pg_plugin_router::shard::{ResultSet, Session, ShardExecutor};
use pg_plugin_router::state::Metrics;
use pg_plugin_router::{RoutePlan, Router};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixed(Output);

#[async_trait]
impl RoutingPlugin for Fixed {
    async fn route(&self, _input: &Input) -> Result<Output, PluginError> {
        Ok(self.0.clone())
    }
}

/// Backend double; shard N answers after a delay that shrinks with N
struct Backend {
    calls: AtomicUsize,
    description: fn(usize) -> RowDescription,
}

impl Backend {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            description: |_| id_description(),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShardExecutor for Backend {
    async fn execute(&self, shard: usize, _query: &Query) -> Result<ResultSet, RouterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5 * (3 - shard as u64))).await;

        Ok(ResultSet {
            row_description: (self.description)(shard),
            rows: vec![
                Row::new(vec![RowColumn::value(format!("{shard}-a"))]),
                Row::new(vec![RowColumn::value(format!("{shard}-b"))]),
            ],
        })
    }
}

fn id_description() -> RowDescription {
    RowDescription::new(vec![RowDescriptionColumn::new("id", 25)])
}

fn cluster() -> ClusterConfig {
    ClusterConfig {
        name: "orders".to_string(),
        databases: (0..3)
            .map(|shard| DatabaseConfig {
                shard,
                role: Role::Primary,
                host: format!("shard-{shard}"),
                port: 5432,
            })
            .collect(),
    }
}

async fn router(output: Output, metrics: Arc<Metrics>) -> Router {
    let config = PluginConfig {
        plugins: vec![PluginAssignment::named("fixed", 0)],
        ..Default::default()
    };
    let mut manager = PluginManager::new(config);
    manager.set_metrics(metrics);
    manager.register("fixed", Arc::new(Fixed(output))).unwrap();
    manager.init().await.unwrap();

    Router::new(cluster(), Arc::new(manager)).unwrap()
}

fn data_rows(messages: &[BackendMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| match message {
            BackendMessage::DataRow(row) => row.columns[0]
                .0
                .as_ref()
                .map(|data| String::from_utf8_lossy(data).into_owned()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_all_shards_merged_in_shard_order() {
    let router = router(
        Output::Forward(Route::read(Shard::All)),
        Arc::new(Metrics::new()),
    )
    .await;
    let backend = Backend::new();

    let messages = router
        .handle(
            Query::new("SELECT id FROM orders"),
            &mut Session::default(),
            &backend,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(backend.calls(), 3);
    assert_eq!(
        data_rows(&messages),
        vec!["0-a", "0-b", "1-a", "1-b", "2-a", "2-b"]
    );
    assert_eq!(
        messages.last(),
        Some(&BackendMessage::CommandComplete("SELECT 6".to_string()))
    );
}

#[tokio::test]
async fn test_mismatched_shapes_expose_no_rows() {
    let router = router(
        Output::Forward(Route::read(Shard::All)),
        Arc::new(Metrics::new()),
    )
    .await;
    let backend = Backend {
        calls: AtomicUsize::new(0),
        description: |shard| {
            if shard == 1 {
                RowDescription::new(vec![
                    RowDescriptionColumn::new("id", 25),
                    RowDescriptionColumn::new("total", 1700),
                ])
            } else {
                id_description()
            }
        },
    };

    let messages = router
        .handle(
            Query::new("SELECT * FROM orders"),
            &mut Session::default(),
            &backend,
            &CancellationToken::new(),
        )
        .await;

    match messages.as_slice() {
        [BackendMessage::ErrorResponse(error)] => {
            assert_eq!(error.severity, "ERROR");
            assert_eq!(error.code, "XX000");
            assert_eq!(error.detail, "shard 1");
        }
        other => panic!("Expected a single error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_out_of_range_shard_never_dispatched() {
    let metrics = Arc::new(Metrics::new());
    let router = router(
        Output::Forward(Route::write(Shard::Concrete(3))),
        metrics.clone(),
    )
    .await;
    let backend = Backend::new();

    let err = router
        .route(Query::new("INSERT INTO orders VALUES (1)"), &mut Session::default())
        .await
        .unwrap_err();
    assert_eq!(err, RouterError::Routing { shard: 3, shards: 3 });

    let messages = router
        .handle(
            Query::new("INSERT INTO orders VALUES (1)"),
            &mut Session::default(),
            &backend,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(backend.calls(), 0);
    assert_eq!(
        messages,
        vec![BackendMessage::ErrorResponse(err.to_error_response())]
    );
    assert!(metrics
        .gather_text()
        .contains("pg_router_routing_faults_total{kind=\"routing\"} 2"));
}

#[tokio::test]
async fn test_intercept_with_bad_second_row() {
    let intercept = Intercept {
        row_description: RowDescription::new(vec![
            RowDescriptionColumn::new("name", 25),
            RowDescriptionColumn::new("setting", 25),
        ]),
        rows: vec![
            Row::new(vec![RowColumn::value("pool_size"), RowColumn::value("10")]),
            Row::new(vec![RowColumn::value("pool_mode")]),
        ],
    };
    let router = router(Output::Intercept(intercept), Arc::new(Metrics::new())).await;
    let backend = Backend::new();

    let messages = router
        .handle(
            Query::new("SHOW pool_settings"),
            &mut Session::default(),
            &backend,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(backend.calls(), 0);
    match messages.as_slice() {
        [BackendMessage::ErrorResponse(error)] => {
            assert_eq!(error.code, "XX000");
            assert_eq!(error.detail, "synthesized row 1");
        }
        other => panic!("Expected a single error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_intercept_answers_without_backend() {
    let intercept = Intercept {
        row_description: RowDescription::new(vec![RowDescriptionColumn::new("now", 25)]),
        rows: vec![Row::new(vec![RowColumn::value("2024-01-01")])],
    };
    let metrics = Arc::new(Metrics::new());
    let router = router(Output::Intercept(intercept), metrics.clone()).await;
    let backend = Backend::new();

    let plan = router
        .route(Query::new("SELECT now()"), &mut Session::default())
        .await
        .unwrap();
    assert!(matches!(plan, RoutePlan::Respond(_)));

    let messages = router
        .execute(&plan, &backend, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(backend.calls(), 0);
    assert_eq!(data_rows(&messages), vec!["2024-01-01"]);
    assert!(metrics.gather_text().contains("pg_router_intercepts_total 1"));
}

#[tokio::test]
async fn test_cancelled_fan_out() {
    let router = router(
        Output::Forward(Route::read(Shard::All)),
        Arc::new(Metrics::new()),
    )
    .await;
    let backend = Backend::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let plan = router
        .route(Query::new("SELECT id FROM orders"), &mut Session::default())
        .await
        .unwrap();
    let err = router.execute(&plan, &backend, &cancel).await.unwrap_err();

    assert_eq!(err, RouterError::Cancelled);
    assert_eq!(err.to_error_response().code, "57014");
}

#[tokio::test]
async fn test_cancelled_query_answers_with_error_only() {
    let router = router(
        Output::Forward(Route::read(Shard::All)),
        Arc::new(Metrics::new()),
    )
    .await;
    let backend = Backend::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut session = Session::default();
    let messages = router
        .handle(
            Query::new("SELECT id FROM orders"),
            &mut session,
            &backend,
            &cancel,
        )
        .await;

    match messages.as_slice() {
        [BackendMessage::ErrorResponse(error)] => {
            assert_eq!(error.code, "57014");
            assert_eq!(error.message, "query cancelled");
        }
        other => panic!("Expected only a cancellation error, got {other:?}"),
    }
}
