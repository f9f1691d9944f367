use serde::{Deserialize, Serialize};

use crate::error::{NlqError, Result};

/// Engine-wide knobs shared by planner and runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Limit applied to statements without an explicit `LIMIT`.
    pub default_select_limit: usize,
    /// Rows per fetch request when hydrating rows by id.
    pub fetch_page_size: usize,
    /// Memory budget shared by all jobs on one node.
    pub node_memory_budget_bytes: u64,
    /// Memory limit for a single job on one node.
    pub job_memory_limit_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_select_limit: 10_000,
            fetch_page_size: 10_000,
            node_memory_budget_bytes: 512 * 1024 * 1024,
            job_memory_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `NLQ_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values returned from `lookup`.
    ///
    /// Recognized keys: `NLQ_DEFAULT_SELECT_LIMIT`, `NLQ_FETCH_PAGE_SIZE`,
    /// `NLQ_NODE_MEMORY_BUDGET_BYTES`, `NLQ_JOB_MEMORY_LIMIT_BYTES`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = parse_var(&lookup, "NLQ_DEFAULT_SELECT_LIMIT")? {
            cfg.default_select_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "NLQ_FETCH_PAGE_SIZE")? {
            cfg.fetch_page_size = v;
        }
        if let Some(v) = parse_var(&lookup, "NLQ_NODE_MEMORY_BUDGET_BYTES")? {
            cfg.node_memory_budget_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "NLQ_JOB_MEMORY_LIMIT_BYTES")? {
            cfg.job_memory_limit_bytes = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the planner cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.default_select_limit == 0 {
            return Err(NlqError::InvalidConfig(
                "default_select_limit must be > 0".to_string(),
            ));
        }
        if self.fetch_page_size == 0 {
            return Err(NlqError::InvalidConfig(
                "fetch_page_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| NlqError::InvalidConfig(format!("{key} must be a number, got '{raw}'"))),
    }
}
