//! Shared configuration, error types, IDs, memory accounting and metrics for nlq crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`NlqError`] / [`Result`] contracts
//! - hosts the per-job memory accounting used by job collect contexts
//! - hosts the prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{NlqError, Result};
pub use ids::*;
pub use memory::{NodeMemoryBudget, RamAccounting, RamAccountingContext};
pub use metrics::{MetricsRegistry, global_metrics};
