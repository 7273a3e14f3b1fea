//! Process plugins speaking line-delimited JSON over stdin/stdout
#![cfg(unix)]

use bytes::Bytes;
use pg_plugin_router::plugin::chain::PluginChain;
use pg_plugin_router::plugin::config::{PluginAssignment, PluginConfig};
use pg_plugin_router::plugin::manager::PluginManager;
use pg_plugin_router::plugin::schema::{
    Affinity, ClusterConfig, DatabaseConfig, Format, Input, Output, Parameter, Query, Role,
    Route, Shard,
};
use pg_plugin_router::shard::{DispatchPlan, Session};
use pg_plugin_router::{RoutePlan, Router};
use std::path::PathBuf;
use std::sync::Arc;

fn cluster() -> ClusterConfig {
    ClusterConfig {
        name: "orders".to_string(),
        databases: vec![
            DatabaseConfig {
                shard: 0,
                role: Role::Primary,
                host: "127.0.0.1".to_string(),
                port: 5432,
            },
            DatabaseConfig {
                shard: 1,
                role: Role::Primary,
                host: "127.0.0.1".to_string(),
                port: 5433,
            },
        ],
    }
}

fn shell_plugin(name: &str, order: u32, script: &str) -> PluginAssignment {
    PluginAssignment {
        command: Some(PathBuf::from("sh")),
        args: vec!["-c".to_string(), script.to_string()],
        ..PluginAssignment::named(name, order)
    }
}

async fn manager(plugins: Vec<PluginAssignment>) -> Arc<PluginManager> {
    let config = PluginConfig {
        plugins,
        pool_size_per_plugin: 2,
        ..Default::default()
    };
    let manager = PluginManager::new(config);
    manager.load_from_config().expect("Failed to load plugins");
    manager.init().await.expect("Failed to init plugins");
    Arc::new(manager)
}

const DECLINE: &str = r#"while read line; do echo '{"decision":"no_decision"}'; done"#;
const FORWARD_READ_1: &str = r#"while read line; do echo '{"decision":"forward","route":{"affinity":1,"shard":1}}'; done"#;

/// Answers every query with a rewrite carrying the query it was sent
const ECHO_REWRITE: &str = r#"while IFS= read -r line; do printf '%s\n' "$line" | sed 's/.*"query":\(.*\)}$/{"decision":"rewrite","query":\1}/'; done"#;

#[tokio::test]
async fn test_process_chain_routes_query() {
    let manager = manager(vec![
        shell_plugin("decline", 0, DECLINE),
        shell_plugin("forward", 1, FORWARD_READ_1),
    ])
    .await;
    let router = Router::new(cluster(), manager.clone()).unwrap();

    let plan = router
        .route(Query::new("SELECT * FROM users"), &mut Session::default())
        .await
        .unwrap();

    assert_eq!(
        plan,
        RoutePlan::Execute {
            query: Query::new("SELECT * FROM users"),
            affinity: Affinity::Read,
            plan: DispatchPlan::Single(1),
            decided_by: Some("forward".to_string()),
        }
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_binary_parameters_cross_process_boundary() {
    let manager = manager(vec![shell_plugin("echo", 0, ECHO_REWRITE)]).await;
    let binary = Bytes::from_static(&[0x00, 0x01, 0xfe, 0xff, 0x00]);
    let query = Query::new("SELECT $1::bytea, $2")
        .with_parameter(Parameter::binary(binary.clone()))
        .with_parameter(Parameter::text("hello"));

    let outcome = PluginChain::new(manager.clone())
        .dispatch(Input::routing(Arc::new(cluster()), query.clone()))
        .await
        .unwrap();

    match outcome.output() {
        Some(Output::Rewrite(echoed)) => {
            assert_eq!(echoed, &query);
            assert_eq!(echoed.parameters[0].data, binary);
            assert_eq!(echoed.parameters[0].format, Format::Binary);
        }
        other => panic!("Expected the echoed query, got {other:?}"),
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_malformed_output_degrades() {
    // Forward without a route is rejected and the next plugin decides
    let manager = manager(vec![
        shell_plugin(
            "broken",
            0,
            r#"while read line; do echo '{"decision":"forward"}'; done"#,
        ),
        shell_plugin("forward", 1, FORWARD_READ_1),
    ])
    .await;

    let outcome = PluginChain::new(manager.clone())
        .dispatch(Input::routing(Arc::new(cluster()), Query::new("SELECT 1")))
        .await
        .unwrap();

    assert_eq!(
        outcome.output(),
        Some(&Output::Forward(Route::new(Shard::Concrete(1), Affinity::Read)))
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exiting_process_degrades() {
    let manager = manager(vec![
        shell_plugin("exits", 0, "read line; exit 0"),
        shell_plugin("decline", 1, DECLINE),
    ])
    .await;

    let outcome = PluginChain::new(manager.clone())
        .dispatch(Input::routing(Arc::new(cluster()), Query::new("SELECT 1")))
        .await
        .unwrap();
    assert!(outcome.is_exhausted());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_missing_executable_skipped_on_init() {
    let config = PluginConfig {
        plugins: vec![PluginAssignment {
            command: Some(PathBuf::from("/nonexistent/routing-plugin")),
            ..PluginAssignment::named("missing", 0)
        }],
        ..Default::default()
    };
    let manager = PluginManager::new(config);
    manager.load_from_config().unwrap();
    manager.init().await.unwrap();

    assert!(!manager.contains("missing"));
}
