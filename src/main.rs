use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use pg_plugin_router::config::{self, Config};
use pg_plugin_router::logging;
use pg_plugin_router::plugin::schema::{Parameter, Query};
use pg_plugin_router::plugin::PluginManager;
use pg_plugin_router::shard::Session;
use pg_plugin_router::state::Metrics;
use pg_plugin_router::Router;

#[derive(Parser, Debug)]
#[command(name = "pg-plugin-router")]
#[command(about = "Routes PostgreSQL queries through a chain of routing plugins", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Validate configuration and initialize every plugin
    Check,
    /// Route one query and print the resulting plan
    Route {
        /// Query text
        #[arg(short, long)]
        query: String,

        /// Text-format bind parameters, in order
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Print plugin metrics after routing
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_from_path(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file()
            .await
            .context("Failed to load configuration")?,
    };
    config.logging.json |= args.json_logs;

    let _guard = logging::init(&config.logging, args.debug)?;
    info!(
        "Loaded cluster \"{}\" with {} shard(s) and {} plugin(s)",
        config.cluster.name,
        config.cluster.shards(),
        config.plugins.chain().len()
    );

    match args.command {
        Command::Check => run_check(config).await,
        Command::Route {
            query,
            params,
            metrics,
        } => run_route(config, query, params, metrics).await,
    }
}

async fn start(config: &Config, metrics: Arc<Metrics>) -> anyhow::Result<Arc<PluginManager>> {
    let mut manager = PluginManager::new(config.plugins.clone());
    manager.set_metrics(metrics);

    let loaded = manager.load_from_config()?;
    info!("Registered {} process plugin(s)", loaded);

    manager.init().await.context("Failed to initialize plugins")?;
    Ok(Arc::new(manager))
}

async fn run_check(config: Config) -> anyhow::Result<()> {
    let manager = start(&config, Arc::new(Metrics::new())).await?;

    for assignment in config.plugins.chain() {
        if manager.contains(&assignment.name) {
            println!("✓ {} (order {})", assignment.name, assignment.order);
        } else {
            println!("✗ {} (order {}) not loaded", assignment.name, assignment.order);
        }
    }
    println!(
        "{} of {} plugin(s) ready, {} shard(s)",
        manager.plugin_count(),
        config.plugins.chain().len(),
        config.cluster.shards()
    );

    manager.shutdown().await;
    Ok(())
}

async fn run_route(
    config: Config,
    text: String,
    params: Vec<String>,
    print_metrics: bool,
) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new());
    let manager = start(&config, metrics.clone()).await?;
    let router = Router::new(config.cluster.clone(), manager.clone())?;

    let query = params
        .into_iter()
        .fold(Query::new(text), |query, param| {
            query.with_parameter(Parameter::text(param))
        });

    let result = router.route(query, &mut Session::default()).await;
    manager.shutdown().await;

    match result {
        Ok(plan) => println!("{}", serde_json::to_string_pretty(&plan.summary())?),
        Err(e) => {
            error!("Routing failed: {}", e);
            let response = e.to_error_response();
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    if print_metrics {
        print!("{}", metrics.gather_text());
    }

    Ok(())
}
