use crate::config::LoggingConfig;
use anyhow::{anyhow, Context};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` still applies; `debug` raises this crate to debug level. Keep
/// the returned guard alive for as long as logs should be flushed.
pub fn init(config: &LoggingConfig, debug: bool) -> anyhow::Result<WorkerGuard> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::from_default_env().add_directive(
        format!("pg_plugin_router={level}")
            .parse()
            .with_context(|| format!("invalid log level \"{level}\""))?,
    );

    let (writer, guard) = match &config.directory {
        Some(directory) => tracing_appender::non_blocking(tracing_appender::rolling::daily(
            directory,
            &config.file_prefix,
        )),
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.directory.is_none());

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;

    Ok(guard)
}
