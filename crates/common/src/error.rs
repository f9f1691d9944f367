use thiserror::Error;

use crate::ids::{JobId, SubContextId};

/// Canonical error taxonomy used across nlq crates.
///
/// Classification guidance:
/// - [`NlqError::Validation`]: statement is legal SQL but illegal for the chosen planner;
///   surfaced to the user as-is
/// - [`NlqError::Planning`]: planner contract violations discovered before execution
/// - [`NlqError::Execution`]: runtime failures after planning succeeded
/// - [`NlqError::DuplicateContext`] / [`NlqError::ContextClosed`]: executor scheduling bugs
///   detected by a job collect context
/// - [`NlqError::Cancelled`]: delivered to completion callbacks of killed jobs
#[derive(Debug, Error)]
pub enum NlqError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - a `NLQ_*` environment override that is not a number
    /// - a zero default select limit
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Statement shape rejected by a planner.
    ///
    /// Examples:
    /// - `GROUP BY` or aggregates on a cross join
    /// - sub-queries as cross join sources
    #[error("{0}")]
    Validation(String),

    /// Planner contract failures.
    ///
    /// Examples:
    /// - unknown table/column while materializing references
    /// - a join symbol that was not collected by a source
    /// - a projection chain whose input columns do not line up
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime execution failures.
    #[error("execution error: {0}")]
    Execution(String),

    /// A sub-context id was registered twice on one job collect context.
    #[error("job {job_id}: sub-context {context_id} is already registered")]
    DuplicateContext {
        /// Owning job.
        job_id: JobId,
        /// Offending sub-context id.
        context_id: SubContextId,
    },

    /// Registration attempted on a context that is already closed or killed.
    #[error("job {job_id}: collect context is already closed")]
    ContextClosed {
        /// Owning job.
        job_id: JobId,
    },

    /// The job was killed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Memory accounting rejected a charge.
    #[error("circuit breaking: {0}")]
    CircuitBreaking(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl NlqError {
    /// `true` for deliberate cancellation, so callers can suppress secondary error reports.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, NlqError::Cancelled(_))
    }
}

/// Standard nlq result alias.
pub type Result<T> = std::result::Result<T, NlqError>;
