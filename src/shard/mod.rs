//! Shard resolution
//!
//! Turns the shard of a resolved [`Route`](crate::plugin::schema::Route) into a
//! dispatch plan. Concrete shards are range-checked, ANY becomes exactly one
//! concrete shard chosen by a [`ShardSelector`], and ALL becomes every shard of
//! the cluster.

pub mod fanout;

use crate::error::RouterError;
use crate::plugin::schema::Shard;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use fanout::{merge, FanOut, ResultSet, ShardExecutor};

#[cfg(test)]
pub use fanout::MockShardExecutor;

/// Physical shards a query will be executed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPlan {
    /// Exactly one shard
    Single(usize),
    /// Every shard, results merged in ascending shard order
    All(usize),
}

impl DispatchPlan {
    /// Shard indexes in execution and merge order.
    pub fn shards(&self) -> Vec<usize> {
        match self {
            DispatchPlan::Single(shard) => vec![*shard],
            DispatchPlan::All(shards) => (0..*shards).collect(),
        }
    }

    pub fn is_fan_out(&self) -> bool {
        matches!(self, DispatchPlan::All(_))
    }
}

/// Per-connection routing state consulted when resolving ANY
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Shard the open transaction is pinned to
    pub transaction_shard: Option<usize>,
}

/// Host policy choosing one shard for [`Shard::Any`]
pub trait ShardSelector: Send + Sync {
    /// Pick a shard in `0..shards`. `shards` is never zero.
    fn select(&self, shards: usize, session: &Session) -> usize;
}

/// Cycles through shards
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl ShardSelector for RoundRobin {
    fn select(&self, shards: usize, _session: &Session) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % shards
    }
}

/// Keeps a transaction on its shard, otherwise defers to `fallback`
#[derive(Debug, Default)]
pub struct Sticky<S = RoundRobin> {
    fallback: S,
}

impl<S: ShardSelector> Sticky<S> {
    pub fn new(fallback: S) -> Self {
        Self { fallback }
    }
}

impl Sticky<RoundRobin> {
    /// Sticky selection falling back to round robin.
    pub fn round_robin() -> Self {
        Self::new(RoundRobin::default())
    }
}

impl<S: ShardSelector> ShardSelector for Sticky<S> {
    fn select(&self, shards: usize, session: &Session) -> usize {
        match session.transaction_shard {
            Some(shard) if shard < shards => shard,
            _ => self.fallback.select(shards, session),
        }
    }
}

/// Resolve `shard` against a cluster of `shards` shards.
///
/// Out-of-range shards are rejected, never clamped.
pub fn resolve(
    shard: Shard,
    shards: usize,
    selector: &dyn ShardSelector,
    session: &Session,
) -> Result<DispatchPlan, RouterError> {
    let out_of_range = |shard| RouterError::Routing { shard, shards };

    match shard {
        Shard::Concrete(shard) if shard < shards => Ok(DispatchPlan::Single(shard)),
        Shard::Concrete(shard) => Err(out_of_range(shard)),
        _ if shards == 0 => Err(out_of_range(0)),
        Shard::Any => {
            let shard = selector.select(shards, session);
            if shard < shards {
                Ok(DispatchPlan::Single(shard))
            } else {
                Err(out_of_range(shard))
            }
        }
        Shard::All => Ok(DispatchPlan::All(shards)),
    }
}
