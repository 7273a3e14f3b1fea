//! Routing Plugin System
//!
//! Routing plugins decide, per query, whether the proxy should forward it to a
//! shard, rewrite it, answer it with synthesized rows, or reject it. Plugins are
//! consulted in a fixed order and the first one that decides wins.
//!
//! # Architecture
//!
//! - **Boundary types**: every value crossing the plugin boundary is owned and
//!   moved; nothing a plugin returns borrows from the plugin
//! - **Degrade on fault**: a plugin that crashes, hangs or returns a malformed
//!   answer is treated as if it made no decision (configurable)
//! - **Process plugins**: external executables speaking line-delimited JSON,
//!   backed by a pool of warm processes
//! - **Concurrency control**: global semaphore bounding in-flight invocations
//!
//! # Modules
//!
//! - `schema`: boundary data model and its JSON wire form
//! - `manager`: registry, init/fini lifecycle and single-plugin invocation
//! - `process`: process plugins and process pooling
//! - `chain`: ordered dispatch over the configured plugins
//! - `config`: plugin configuration parsing and validation

pub mod chain;
pub mod config;
pub mod manager;
pub mod process;
pub mod schema;

use async_trait::async_trait;

pub use chain::{ChainOutcome, PluginChain};
pub use config::{FaultPolicy, PluginAssignment, PluginConfig, RewritePolicy};
pub use manager::PluginManager;
pub use process::{PluginProcess, ProcessPlugin, ProcessPool};
pub use schema::{Input, Output, PluginError};

/// A routing plugin.
///
/// `init` and `fini` are called exactly once each by [`PluginManager`], before
/// the first and after the last call to `route`. `route` may be called
/// concurrently for different queries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoutingPlugin: Send + Sync {
    /// One-time setup.
    async fn init(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// One-time teardown.
    async fn fini(&self) {}

    /// Decide how `input` should be handled.
    async fn route(&self, input: &Input) -> Result<Output, PluginError>;
}
