//! Per-job memory accounting against a shared node budget.
//!
//! A node owns one [`NodeMemoryBudget`]. Every job running on the node gets a
//! [`RamAccountingContext`] which charges bytes against both the job limit and
//! the node budget. Closing the context hands everything it still holds back
//! to the node budget.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

use crate::error::{NlqError, Result};

/// Handle used by a job collect context to track the bytes a job holds.
///
/// The job collect context never implements accounting itself; it only owns
/// the handle and closes it exactly once during teardown.
pub trait RamAccounting: Send + Sync + fmt::Debug {
    /// Charge `bytes`; fails when a limit would be exceeded.
    fn add_bytes(&self, bytes: u64) -> Result<()>;
    /// Give back `bytes` previously charged.
    fn release_bytes(&self, bytes: u64);
    /// Bytes currently charged.
    fn total_bytes(&self) -> u64;
    /// Release everything and refuse further charges.
    fn close(&self);
}

/// Shared node-level budget.
#[derive(Debug)]
pub struct NodeMemoryBudget {
    budget_bytes: u64,
    in_use_bytes: AtomicU64,
}

impl NodeMemoryBudget {
    /// Create a budget; `u64::MAX` disables the node-level check.
    #[must_use]
    pub fn new(budget_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            budget_bytes,
            in_use_bytes: AtomicU64::new(0),
        })
    }

    /// Bytes currently charged by all jobs.
    pub fn in_use_bytes(&self) -> u64 {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// Open a job-scoped accounting context limited to `job_limit_bytes`.
    #[must_use]
    pub fn job_context(
        self: &Arc<Self>,
        label: impl Into<String>,
        job_limit_bytes: u64,
    ) -> RamAccountingContext {
        RamAccountingContext {
            label: label.into(),
            budget: Arc::clone(self),
            limit_bytes: job_limit_bytes,
            used_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        if self.budget_bytes == u64::MAX {
            self.in_use_bytes.fetch_add(bytes, Ordering::AcqRel);
            return true;
        }
        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(bytes);
            if next > self.budget_bytes {
                return false;
            }
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self, bytes: u64) {
        if bytes > 0 {
            self.in_use_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }
}

/// Job-scoped accounting handle backed by a [`NodeMemoryBudget`].
#[derive(Debug)]
pub struct RamAccountingContext {
    label: String,
    budget: Arc<NodeMemoryBudget>,
    limit_bytes: u64,
    used_bytes: AtomicU64,
    closed: AtomicBool,
}

impl RamAccountingContext {
    /// Human-readable label, e.g. `job-42`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// `true` once [`RamAccounting::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl RamAccounting for RamAccountingContext {
    fn add_bytes(&self, bytes: u64) -> Result<()> {
        if self.is_closed() {
            return Err(NlqError::CircuitBreaking(format!(
                "[{}] accounting context is closed",
                self.label
            )));
        }
        loop {
            let current = self.used_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(bytes);
            if next > self.limit_bytes {
                return Err(NlqError::CircuitBreaking(format!(
                    "[{}] charging {bytes} bytes would exceed job limit of {} bytes ({current} in use)",
                    self.label, self.limit_bytes
                )));
            }
            if self
                .used_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        if !self.budget.try_reserve(bytes) {
            self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
            return Err(NlqError::CircuitBreaking(format!(
                "[{}] node memory budget exhausted while charging {bytes} bytes",
                self.label
            )));
        }
        Ok(())
    }

    fn release_bytes(&self, bytes: u64) {
        let mut current = self.used_bytes.load(Ordering::Acquire);
        loop {
            let released = bytes.min(current);
            match self.used_bytes.compare_exchange(
                current,
                current - released,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.budget.release(released);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn total_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let held = self.used_bytes.swap(0, Ordering::AcqRel);
        self.budget.release(held);
        debug!(label = %self.label, released_bytes = held, "ram accounting context closed");
    }
}

impl Drop for RamAccountingContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_releases_budget() {
        let budget = NodeMemoryBudget::new(100);
        let job = budget.job_context("job-1", 80);
        job.add_bytes(60).expect("charge");
        assert_eq!(budget.in_use_bytes(), 60);
        job.release_bytes(10);
        assert_eq!(job.total_bytes(), 50);
        job.close();
        assert_eq!(budget.in_use_bytes(), 0);
        assert!(job.add_bytes(1).is_err());
    }

    #[test]
    fn job_limit_and_node_budget_both_apply() {
        let budget = NodeMemoryBudget::new(100);
        let a = budget.job_context("job-a", 80);
        let b = budget.job_context("job-b", 80);
        a.add_bytes(70).expect("a");
        let err = a.add_bytes(20).expect_err("job limit");
        assert!(matches!(err, NlqError::CircuitBreaking(_)));
        let err = b.add_bytes(40).expect_err("node budget");
        assert!(err.to_string().contains("node memory budget"));
        assert_eq!(b.total_bytes(), 0);
        b.add_bytes(30).expect("fits");
        assert_eq!(budget.in_use_bytes(), 100);
    }

    #[test]
    fn dropping_an_unclosed_context_returns_bytes() {
        let budget = NodeMemoryBudget::new(u64::MAX);
        {
            let job = budget.job_context("job-2", 1024);
            job.add_bytes(512).expect("charge");
            assert_eq!(budget.in_use_bytes(), 512);
        }
        assert_eq!(budget.in_use_bytes(), 0);
    }
}
