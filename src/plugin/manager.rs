//! Plugin lifecycle management and concurrency control
//!
//! This module owns the plugin registry, runs the one-time `init`/`fini`
//! hooks and performs single-plugin invocations.

use crate::plugin::config::{FaultPolicy, PluginAssignment, PluginConfig};
use crate::plugin::process::{ProcessPlugin, ProcessSpec};
use crate::plugin::schema::{Input, Output, PluginError};
use crate::plugin::RoutingPlugin;
use crate::state::Metrics;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OnceCell, Semaphore};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn, Instrument};

/// Manages plugin lifecycle and concurrency
pub struct PluginManager {
    /// Chain configuration
    config: PluginConfig,
    /// Registered plugins indexed by name
    plugins: DashMap<String, Arc<dyn RoutingPlugin>>,
    /// Global concurrency semaphore
    semaphore: Arc<Semaphore>,
    /// Set once every plugin's `init` has run
    initialized: OnceCell<()>,
    /// Set once every plugin's `fini` has run
    shut_down: AtomicBool,
    /// Metrics for observability
    metrics: Option<Arc<Metrics>>,
}

impl PluginManager {
    /// Create a new plugin manager
    pub fn new(config: PluginConfig) -> Self {
        let max_concurrent = config.max_concurrent_executions as usize;

        Self {
            config,
            plugins: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            initialized: OnceCell::new(),
            shut_down: AtomicBool::new(false),
            metrics: None,
        }
    }

    /// Set metrics for plugin invocation tracking
    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Register an in-process plugin under `name`.
    ///
    /// Registration is only possible before [`PluginManager::init`].
    pub fn register(
        &self,
        name: impl Into<String>,
        plugin: Arc<dyn RoutingPlugin>,
    ) -> Result<(), PluginError> {
        if self.initialized.initialized() {
            return Err(PluginError::ConfigError {
                reason: "plugins cannot be registered after init".to_string(),
            });
        }

        self.plugins.insert(name.into(), plugin);
        Ok(())
    }

    /// Register a process plugin for every assignment that names a command.
    pub fn load_from_config(&self) -> Result<usize, PluginError> {
        let mut count = 0;

        for assignment in self.config.chain() {
            let Some(command) = &assignment.command else {
                continue;
            };

            let spec = ProcessSpec {
                command: command.clone(),
                args: assignment.args.clone(),
                env: assignment.env.clone(),
            };
            let plugin = ProcessPlugin::new(spec, self.config.pool_size_per_plugin as usize);
            self.register(assignment.name.clone(), Arc::new(plugin))?;
            count += 1;
        }

        Ok(count)
    }

    /// Run every plugin's `init` exactly once.
    ///
    /// Concurrent callers wait for the first one to finish. Under
    /// [`FaultPolicy::Degrade`] a plugin that fails to initialize, or a chain
    /// entry with no registered plugin, is logged and left out; under
    /// [`FaultPolicy::Fatal`] it fails initialization.
    pub async fn init(&self) -> Result<(), PluginError> {
        self.initialized
            .get_or_try_init(|| async {
                for assignment in self.config.chain() {
                    if !self.plugins.contains_key(&assignment.name) {
                        let err = PluginError::NotFound {
                            name: assignment.name.clone(),
                        };
                        self.init_failed(&assignment.name, err)?;
                    }
                }

                let registered: Vec<(String, Arc<dyn RoutingPlugin>)> = self
                    .plugins
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect();

                for (name, plugin) in registered {
                    let now = Instant::now();
                    match plugin.init().await {
                        Ok(()) => info!(
                            "loaded \"{}\" plugin [{:.4}ms]",
                            name,
                            now.elapsed().as_secs_f64() * 1000.0
                        ),
                        Err(e) => {
                            self.plugins.remove(&name);
                            self.init_failed(&name, e)?;
                        }
                    }
                }

                Ok::<(), PluginError>(())
            })
            .await
            .map(|_| ())
    }

    fn init_failed(&self, name: &str, e: PluginError) -> Result<(), PluginError> {
        match self.config.fault_policy {
            FaultPolicy::Degrade => {
                warn!("plugin \"{}\" unavailable, skipping: {}", name, e);
                Ok(())
            }
            FaultPolicy::Fatal => {
                error!("plugin \"{}\" failed to initialize: {}", name, e);
                Err(e)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Run every plugin's `fini` exactly once. Later invocations fail with
    /// [`PluginError::ShutDown`].
    pub async fn shutdown(&self) {
        if !self.is_initialized() || self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let registered: Vec<(String, Arc<dyn RoutingPlugin>)> = self
            .plugins
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (name, plugin) in registered {
            plugin.fini().await;
            debug!("plugin \"{}\" shut down", name);
        }
    }

    /// Invoke one plugin with concurrency control and timeout.
    ///
    /// Panics inside the plugin are caught and reported as
    /// [`PluginError::Crashed`].
    pub async fn invoke(
        &self,
        plugin_name: &str,
        input: &Input,
        timeout_ms: u64,
    ) -> Result<Output, PluginError> {
        if !self.is_initialized() {
            return Err(PluginError::NotInitialized);
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PluginError::ShutDown);
        }

        let plugin = self
            .plugins
            .get(plugin_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PluginError::NotFound {
                name: plugin_name.to_string(),
            })?;

        let span = tracing::info_span!(
            "plugin_invocation",
            plugin = %plugin_name,
            database = %input.config.name,
            query_bytes = input.query().len(),
        );

        async {
            // Acquire semaphore permit (blocks if at max concurrency)
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| PluginError::PoolExhausted)?;

            let start = Instant::now();
            let call = AssertUnwindSafe(plugin.route(input)).catch_unwind();
            let result = timeout(Duration::from_millis(timeout_ms), call).await;
            let duration = start.elapsed();

            if let Some(metrics) = &self.metrics {
                metrics.record_plugin_invocation(plugin_name, duration);
            }

            let result = match result {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(PluginError::Crashed {
                    reason: panic_message(panic.as_ref()),
                }),
                Err(_) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_plugin_timeout();
                    }
                    Err(PluginError::Timeout { timeout_ms })
                }
            };

            match &result {
                Ok(output) => debug!(
                    duration_ms = duration.as_millis() as u64,
                    decision = %output.decision(),
                    "Plugin invocation succeeded"
                ),
                Err(e) => {
                    warn!(
                        duration_ms = duration.as_millis() as u64,
                        error = %e,
                        "Plugin invocation failed"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_plugin_fault(plugin_name, e.kind());
                    }
                }
            }

            result
        }
        .instrument(span)
        .await
    }

    /// Invoke a plugin assignment (with config-specific timeout)
    pub async fn invoke_assignment(
        &self,
        assignment: &PluginAssignment,
        input: &Input,
    ) -> Result<Output, PluginError> {
        let timeout_ms = self.config.get_plugin_timeout(assignment);
        self.invoke(&assignment.name, input, timeout_ms).await
    }

    /// Get plugin count
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "plugin panicked".to_string()
    }
}
