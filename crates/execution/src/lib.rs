#![deny(missing_docs)]

//! Execution-layer lifecycle of per-job resources.
//!
//! Architecture role:
//! - one [`JobCollectContext`] per job and node owning every open sub-context
//! - node-wide [`JobContextService`] handing those contexts out
//! - shard search contexts whose close wakes the scanning task
//!
//! Key modules:
//! - [`job_context`]
//! - [`service`]
//! - [`search_context`]

pub mod job_context;
pub mod search_context;
pub mod service;

pub use job_context::{CompletionCallback, JobCollectContext, JobContextState, SubContext};
pub use search_context::{CancellationSignal, ShardSearchContext};
pub use service::JobContextService;
