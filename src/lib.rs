pub mod config;
pub mod error;
pub mod intercept;
pub mod logging;
pub mod plugin;
pub mod router;
pub mod shard;
pub mod state;

pub use router::{RoutePlan, Router};
