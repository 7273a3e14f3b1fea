//! Plugin chain dispatch
//!
//! Plugins are consulted one at a time in configured order. The first plugin
//! that returns anything other than [`Output::NoDecision`] decides for the
//! whole chain and later plugins are not invoked. When nobody decides the
//! chain is [`ChainOutcome::Exhausted`], which is kept distinct from an
//! explicit forward so the host can apply its own default.
//!
//! The chain never reinterprets a decision. In particular a forward with
//! [`Affinity::Unknown`](crate::plugin::schema::Affinity::Unknown) is passed up
//! unchanged; backend selection resolves it with
//! [`Affinity::fail_safe`](crate::plugin::schema::Affinity::fail_safe).

use crate::error::RouterError;
use crate::plugin::config::{FaultPolicy, PluginAssignment, RewritePolicy};
use crate::plugin::manager::PluginManager;
use crate::plugin::schema::{Input, Output, Query};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Terminal state of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// `plugin` decided; later plugins were not consulted
    Decided {
        plugin: String,
        output: Output,
        /// Query the deciding pass routed (the rewritten one after re-runs)
        query: Query,
    },
    /// Every plugin declined or faulted
    Exhausted { query: Query },
}

impl ChainOutcome {
    pub fn query(&self) -> &Query {
        match self {
            ChainOutcome::Decided { query, .. } | ChainOutcome::Exhausted { query } => query,
        }
    }

    pub fn output(&self) -> Option<&Output> {
        match self {
            ChainOutcome::Decided { output, .. } => Some(output),
            ChainOutcome::Exhausted { .. } => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, ChainOutcome::Exhausted { .. })
    }
}

/// Ordered sequence of routing plugins
pub struct PluginChain {
    manager: Arc<PluginManager>,
    /// Enabled plugins, in call order
    assignments: Vec<PluginAssignment>,
    rewrite_policy: RewritePolicy,
    fault_policy: FaultPolicy,
    max_rewrite_passes: u32,
}

impl PluginChain {
    /// Create a chain from the manager's configuration
    pub fn new(manager: Arc<PluginManager>) -> Self {
        let config = manager.config();
        let assignments = config.chain();
        let rewrite_policy = config.rewrite_policy;
        let fault_policy = config.fault_policy;
        let max_rewrite_passes = config.max_rewrite_passes;

        Self {
            manager,
            assignments,
            rewrite_policy,
            fault_policy,
            max_rewrite_passes,
        }
    }

    /// Override the rewrite policy of this chain
    pub fn with_rewrite_policy(mut self, policy: RewritePolicy) -> Self {
        self.rewrite_policy = policy;
        self
    }

    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.assignments.iter().map(|a| a.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Route one query through the chain
    pub async fn dispatch(&self, input: Input) -> Result<ChainOutcome, RouterError> {
        let span = tracing::info_span!("dispatch", id = %Uuid::new_v4());
        self.dispatch_inner(input).instrument(span).await
    }

    async fn dispatch_inner(&self, mut input: Input) -> Result<ChainOutcome, RouterError> {
        let metrics = self.manager.metrics().cloned();
        let mut rewrites = 0;

        loop {
            let Some((plugin, output)) = self.run_pass(&input).await? else {
                debug!("no plugin decided for {} plugin(s)", self.assignments.len());
                if let Some(metrics) = &metrics {
                    metrics.record_exhausted();
                }
                return Ok(ChainOutcome::Exhausted {
                    query: input.query().clone(),
                });
            };

            let output = match output {
                Output::Rewrite(rewritten) => {
                    Output::Rewrite(rewritten.rewritten_from(input.query()))
                }
                decided => decided,
            };

            if let (Output::Rewrite(rewritten), RewritePolicy::Rerun) =
                (&output, self.rewrite_policy)
            {
                rewrites += 1;
                if rewrites > self.max_rewrite_passes {
                    return Err(RouterError::RewriteLoop {
                        passes: self.max_rewrite_passes,
                    });
                }

                debug!(
                    "plugin \"{}\" rewrote query, restarting chain (pass {})",
                    plugin,
                    rewrites + 1
                );
                if let Some(metrics) = &metrics {
                    metrics.record_rewrite_pass();
                }
                input = Input::routing(input.config.clone(), rewritten.clone());
                continue;
            }

            info!("plugin \"{}\" decided: {}", plugin, output.decision());
            if let Some(metrics) = &metrics {
                metrics.record_decision(output.decision().as_str());
            }

            return Ok(ChainOutcome::Decided {
                plugin,
                output,
                query: input.query().clone(),
            });
        }
    }

    /// One pass over the chain; `None` when nobody decided.
    async fn run_pass(&self, input: &Input) -> Result<Option<(String, Output)>, RouterError> {
        for (index, assignment) in self.assignments.iter().enumerate() {
            debug!(
                "Invoking plugin {}/{}: '{}'",
                index + 1,
                self.assignments.len(),
                assignment.name
            );

            match self.manager.invoke_assignment(assignment, input).await {
                Ok(Output::NoDecision) => continue,
                Ok(output) => return Ok(Some((assignment.name.clone(), output))),
                Err(e) => match self.fault_policy {
                    FaultPolicy::Degrade => {
                        warn!(
                            "plugin \"{}\" faulted, treating as no decision: {}",
                            assignment.name, e
                        );
                    }
                    FaultPolicy::Fatal => {
                        return Err(RouterError::Plugin {
                            plugin: assignment.name.clone(),
                            source: e,
                        });
                    }
                },
            }
        }

        Ok(None)
    }
}
