//! Query routing
//!
//! The router is the host side of the plugin boundary. It sends each query
//! through the plugin chain and turns the outcome into a [`RoutePlan`]: either
//! the shards to execute on, or the messages to answer the client with
//! directly.

use crate::error::{ConfigError, Result as ProxyResult, RouterError};
use crate::intercept::{self, BackendMessage};
use crate::plugin::chain::{ChainOutcome, PluginChain};
use crate::plugin::manager::PluginManager;
use crate::plugin::schema::{Affinity, ClusterConfig, Input, Output, Query, Route, Shard};
use crate::shard::{self, DispatchPlan, FanOut, Session, ShardExecutor, ShardSelector, Sticky};
use crate::state::Metrics;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePlan {
    /// Run `query` on the planned shards
    Execute {
        query: Query,
        /// As decided; resolve with [`Affinity::fail_safe`] before picking a backend
        affinity: Affinity,
        plan: DispatchPlan,
        /// Plugin that decided, `None` when the default route was used
        decided_by: Option<String>,
    },
    /// Answer the client without contacting a backend
    Respond(Vec<BackendMessage>),
}

impl RoutePlan {
    pub fn is_respond(&self) -> bool {
        matches!(self, RoutePlan::Respond(_))
    }

    /// Summary suitable for printing.
    pub fn summary(&self) -> PlanSummary {
        match self {
            RoutePlan::Execute {
                query,
                affinity,
                plan,
                decided_by,
            } => PlanSummary::Execute {
                query: query.text_lossy().into_owned(),
                parameters: query.parameters.len(),
                affinity: affinity.to_string(),
                backend_affinity: affinity.fail_safe().to_string(),
                shards: plan.shards(),
                decided_by: decided_by.clone(),
            },
            RoutePlan::Respond(messages) => PlanSummary::Respond {
                messages: messages
                    .iter()
                    .map(|message| char::from(message.code()).to_string())
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanSummary {
    #[serde(rename_all = "camelCase")]
    Execute {
        query: String,
        parameters: usize,
        affinity: String,
        backend_affinity: String,
        shards: Vec<usize>,
        decided_by: Option<String>,
    },
    Respond { messages: Vec<String> },
}

/// Routes queries for one cluster
pub struct Router {
    cluster: ArcSwap<ClusterConfig>,
    chain: PluginChain,
    selector: Box<dyn ShardSelector>,
    fan_out: FanOut,
    metrics: Option<Arc<Metrics>>,
}

impl Router {
    /// Create a router dispatching through `manager`'s configured chain.
    ///
    /// ANY is resolved with [`Sticky`] unless another selector is set. A
    /// topology with a missing shard or primary is rejected.
    pub fn new(cluster: ClusterConfig, manager: Arc<PluginManager>) -> ProxyResult<Self> {
        cluster.validate().map_err(ConfigError::Validation)?;
        let metrics = manager.metrics().cloned();

        Ok(Self {
            cluster: ArcSwap::from_pointee(cluster),
            chain: PluginChain::new(manager),
            selector: Box::new(Sticky::round_robin()),
            fan_out: FanOut::new(metrics.clone()),
            metrics,
        })
    }

    pub fn with_selector(mut self, selector: impl ShardSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    pub fn chain(&self) -> &PluginChain {
        &self.chain
    }

    /// Cluster queries are currently routed against
    pub fn cluster(&self) -> Arc<ClusterConfig> {
        self.cluster.load_full()
    }

    /// Replace the cluster. Queries already dispatched keep the old one.
    ///
    /// An invalid topology is rejected and the current cluster stays in place.
    pub fn reload_cluster(&self, cluster: ClusterConfig) -> ProxyResult<()> {
        if let Err(e) = cluster.validate() {
            warn!("rejected cluster reload: {}", e);
            return Err(ConfigError::Validation(e).into());
        }

        info!(
            "reloading cluster \"{}\" with {} shard(s)",
            cluster.name,
            cluster.shards()
        );
        self.cluster.store(Arc::new(cluster));
        Ok(())
    }

    /// Decide how to run `query`.
    ///
    /// Transaction boundaries update `session` so that later ANY queries of
    /// the same transaction stay on one shard.
    pub async fn route(&self, query: Query, session: &mut Session) -> Result<RoutePlan, RouterError> {
        let result = self.route_inner(query, session).await;
        if let Err(e) = &result {
            self.record_fault(e);
        }
        result
    }

    async fn route_inner(
        &self,
        query: Query,
        session: &mut Session,
    ) -> Result<RoutePlan, RouterError> {
        let cluster = self.cluster.load_full();
        let shards = cluster.shards();

        let (plugin, output, query) = match self.chain.dispatch(Input::routing(cluster, query)).await? {
            ChainOutcome::Exhausted { query } => {
                debug!("no plugin decided, using default route");
                (None, Output::NoDecision, query)
            }
            ChainOutcome::Decided {
                plugin,
                output,
                query,
            } => (Some(plugin), output, query),
        };

        let (route, query) = match output {
            Output::Forward(route) => (route, query),
            // Executed as rewritten; routing it again is left to the rerun policy
            Output::Rewrite(rewritten) => (Self::default_route(), rewritten),
            Output::Error(error) => {
                return Err(RouterError::Denied {
                    plugin: plugin.unwrap_or_default(),
                    error,
                });
            }
            Output::Intercept(intercept) => {
                let messages = intercept::synthesize(intercept)?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_intercept();
                }
                return Ok(RoutePlan::Respond(messages));
            }
            Output::NoDecision => (Self::default_route(), query),
        };

        let plan = shard::resolve(route.shard, shards, self.selector.as_ref(), session)?;

        match (route.affinity, &plan) {
            (Affinity::TransactionStart, DispatchPlan::Single(shard)) => {
                debug!("transaction pinned to shard {}", shard);
                session.transaction_shard = Some(*shard);
            }
            (Affinity::TransactionEnd, _) => session.transaction_shard = None,
            _ => (),
        }

        Ok(RoutePlan::Execute {
            query,
            affinity: route.affinity,
            plan,
            decided_by: plugin,
        })
    }

    /// Run a plan and return what the client should receive.
    ///
    /// Once `cancel` fires the result is [`RouterError::Cancelled`], never a
    /// partial or complete result set.
    pub async fn execute(
        &self,
        plan: &RoutePlan,
        executor: &dyn ShardExecutor,
        cancel: &CancellationToken,
    ) -> Result<Vec<BackendMessage>, RouterError> {
        match plan {
            RoutePlan::Respond(messages) => Ok(messages.clone()),
            RoutePlan::Execute { query, plan, .. } => {
                match self.fan_out.execute(plan, query, executor, cancel).await {
                    Ok(result) => Ok(intercept::result_messages(result)),
                    Err(e) => {
                        self.record_fault(&e);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Route and execute `query`; every failure becomes an error message.
    ///
    /// A cancelled query answers with a single ErrorResponse carrying SQLSTATE
    /// 57014 (`query_canceled`). No rows and no CommandComplete are sent.
    pub async fn handle(
        &self,
        query: Query,
        session: &mut Session,
        executor: &dyn ShardExecutor,
        cancel: &CancellationToken,
    ) -> Vec<BackendMessage> {
        let result = match self.route(query, session).await {
            Ok(plan) => self.execute(&plan, executor, cancel).await,
            Err(e) => Err(e),
        };

        result.unwrap_or_else(|e| {
            // The transaction is aborted; the pin goes with it.
            session.transaction_shard = None;
            vec![BackendMessage::ErrorResponse(e.to_error_response())]
        })
    }

    fn default_route() -> Route {
        Route::write(Shard::Any)
    }

    fn record_fault(&self, error: &RouterError) {
        warn!("query failed: {}", error);
        if let Some(metrics) = &self.metrics {
            metrics.record_routing_fault(error.kind());
        }
    }
}
