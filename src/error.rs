use crate::plugin::schema::{ErrorResponse, PluginError};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Routing error: {0}")]
    Router(#[from] RouterError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Reasons a query cannot be routed or answered.
///
/// Everything except [`RouterError::Plugin`] reaches the client; plugin faults
/// only surface when the chain is configured to treat them as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("plugin \"{plugin}\" failed: {source}")]
    Plugin {
        plugin: String,
        #[source]
        source: PluginError,
    },

    #[error("shard {shard} is out of range, cluster has {shards} shard(s)")]
    Routing { shard: usize, shards: usize },

    #[error("cannot merge results from shard {shard}: {reason}")]
    Merge { shard: usize, reason: String },

    #[error("row {row} has {actual} column(s) but the row description has {expected}")]
    Shape {
        row: usize,
        expected: usize,
        actual: usize,
    },

    /// A count or length that does not fit its field in the wire format
    #[error("{what} of {size} exceeds the wire limit of {limit}")]
    Oversized {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("query denied by plugin \"{plugin}\": {}", error.message)]
    Denied { plugin: String, error: ErrorResponse },

    #[error("query rewritten more than {passes} times")]
    RewriteLoop { passes: u32 },

    #[error("shard {shard} failed: {reason}")]
    Backend { shard: usize, reason: String },

    #[error("query cancelled")]
    Cancelled,
}

impl RouterError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::Plugin { .. } => "plugin",
            RouterError::Routing { .. } => "routing",
            RouterError::Merge { .. } => "merge",
            RouterError::Shape { .. } | RouterError::Oversized { .. } => "shape",
            RouterError::Denied { .. } => "denied",
            RouterError::RewriteLoop { .. } => "rewrite_loop",
            RouterError::Backend { .. } => "backend",
            RouterError::Cancelled => "cancelled",
        }
    }

    /// Error sent to the client. Plugin-issued errors are forwarded verbatim.
    pub fn to_error_response(&self) -> ErrorResponse {
        let code = match self {
            RouterError::Denied { error, .. } => return error.clone(),
            RouterError::Plugin { .. } | RouterError::Backend { .. } => "58000",
            RouterError::Routing { .. }
            | RouterError::Merge { .. }
            | RouterError::Shape { .. }
            | RouterError::Oversized { .. } => "XX000",
            RouterError::RewriteLoop { .. } => "54001",
            RouterError::Cancelled => "57014",
        };

        let detail = match self {
            RouterError::Plugin { source, .. } => format!("plugin fault: {}", source.kind()),
            RouterError::Routing { shard, shards } => {
                format!("valid shards are 0..{shards}, got {shard}")
            }
            RouterError::Merge { shard, .. } => format!("shard {shard}"),
            RouterError::Shape { row, .. } => format!("synthesized row {row}"),
            _ => String::new(),
        };

        ErrorResponse::error(code, self.to_string()).with_detail(detail)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_is_verbatim() {
        let error = ErrorResponse::error("42501", "tenant_id required").with_detail("orders");
        let err = RouterError::Denied {
            plugin: "tenancy".to_string(),
            error: error.clone(),
        };
        assert_eq!(err.to_error_response(), error);
    }

    #[test]
    fn test_routing_fault_response() {
        let response = RouterError::Routing {
            shard: 4,
            shards: 2,
        }
        .to_error_response();
        assert_eq!(response.severity, "ERROR");
        assert_eq!(response.code, "XX000");
        assert!(response.message.contains("shard 4"));
        assert_eq!(response.detail, "valid shards are 0..2, got 4");
    }
}
