//! Per-job, per-node registry of open sub-contexts.
//!
//! Executors register one sub-context per shard they work on before doing
//! any blocking I/O. The job collect context owns those sub-contexts and the
//! job's memory accounting handle until the job is closed or killed; the
//! first of the two wins and tears everything down exactly once.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;

use nlq_common::{JobId, NlqError, NodeId, RamAccounting, Result, SubContextId, global_metrics};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

/// A closable resource owned by a job collect context.
pub trait SubContext: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Release the resource. Called exactly once by the owning job context.
    fn close(&mut self) -> Result<()>;
}

/// Completion listener; receives the teardown error (`None` on close) and
/// the bytes the job held when it finished.
pub type CompletionCallback = Box<dyn FnOnce(Option<&NlqError>, u64) + Send>;

/// Lifecycle state of a [`JobCollectContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobContextState {
    /// Accepting sub-contexts and callbacks.
    Open,
    /// Finished normally.
    Closed,
    /// Cancelled.
    Killed,
}

impl JobContextState {
    /// `true` for `Closed` and `Killed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobContextState::Open)
    }

    /// Lowercase label used for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            JobContextState::Open => "open",
            JobContextState::Closed => "closed",
            JobContextState::Killed => "killed",
        }
    }
}

struct Inner {
    state: JobContextState,
    sub_contexts: BTreeMap<SubContextId, Box<dyn SubContext>>,
    callbacks: Vec<CompletionCallback>,
    accounting: Option<Box<dyn RamAccounting>>,
    final_bytes: u64,
}

/// Registry of the sub-contexts one job has open on one node.
pub struct JobCollectContext {
    job_id: JobId,
    node_id: NodeId,
    inner: Mutex<Inner>,
}

impl JobCollectContext {
    /// Open a context that exclusively owns `accounting` until teardown.
    pub fn new(job_id: JobId, node_id: NodeId, accounting: Box<dyn RamAccounting>) -> Self {
        global_metrics().inc_job_contexts_opened(&node_id.0);
        debug!(job_id = %job_id, node_id = %node_id, "job collect context opened");
        Self {
            job_id,
            node_id,
            inner: Mutex::new(Inner {
                state: JobContextState::Open,
                sub_contexts: BTreeMap::new(),
                callbacks: Vec::new(),
                accounting: Some(accounting),
                final_bytes: 0,
            }),
        }
    }

    /// Job this context belongs to.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Node this context lives on.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobContextState {
        self.inner.lock().state
    }

    /// Number of registered sub-contexts.
    pub fn num_contexts(&self) -> usize {
        self.inner.lock().sub_contexts.len()
    }

    /// Register `context` under `id`.
    ///
    /// On a duplicate id both the registered and the offered context are
    /// closed and the id is freed. After teardown the offered context is
    /// closed and rejected.
    pub fn add_context(&self, id: SubContextId, context: Box<dyn SubContext>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            let state = inner.state;
            drop(inner);
            debug!(
                job_id = %self.job_id,
                context_id = %id,
                state = state.as_str(),
                "rejecting sub-context for finished job"
            );
            self.close_sub_context(id, context);
            return Err(NlqError::ContextClosed {
                job_id: self.job_id,
            });
        }
        if let Some(existing) = inner.sub_contexts.remove(&id) {
            drop(inner);
            error!(
                job_id = %self.job_id,
                node_id = %self.node_id,
                context_id = %id,
                "sub-context registered twice; closing both"
            );
            global_metrics().inc_sub_context_duplicates(&self.node_id.0);
            self.close_sub_context(id, existing);
            self.close_sub_context(id, context);
            return Err(NlqError::DuplicateContext {
                job_id: self.job_id,
                context_id: id,
            });
        }
        inner.sub_contexts.insert(id, context);
        drop(inner);
        global_metrics().inc_sub_contexts_registered(&self.node_id.0);
        Ok(())
    }

    /// Register a completion callback; fails once the context is terminal.
    pub fn add_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Option<&NlqError>, u64) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(NlqError::ContextClosed {
                job_id: self.job_id,
            });
        }
        inner.callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Charge `bytes` to the job's accounting handle.
    pub fn charge(&self, bytes: u64) -> Result<()> {
        let inner = self.inner.lock();
        match (&inner.accounting, inner.state) {
            (Some(accounting), JobContextState::Open) => accounting.add_bytes(bytes),
            _ => Err(NlqError::ContextClosed {
                job_id: self.job_id,
            }),
        }
    }

    /// Give back `bytes`; ignored after teardown.
    pub fn release(&self, bytes: u64) {
        if let Some(accounting) = &self.inner.lock().accounting {
            accounting.release_bytes(bytes);
        }
    }

    /// Bytes currently held, or held at teardown once terminal.
    pub fn bytes_used(&self) -> u64 {
        let inner = self.inner.lock();
        match &inner.accounting {
            Some(accounting) => accounting.total_bytes(),
            None => inner.final_bytes,
        }
    }

    /// Finish the job normally. Returns `true` if this call performed the teardown.
    pub fn close(&self) -> bool {
        self.finish(JobContextState::Closed)
    }

    /// Cancel the job; callbacks receive [`NlqError::Cancelled`].
    /// Returns `true` if this call performed the teardown.
    pub fn kill(&self) -> bool {
        self.finish(JobContextState::Killed)
    }

    fn finish(&self, target: JobContextState) -> bool {
        let (sub_contexts, callbacks, accounting, bytes) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = target;
            let accounting = inner.accounting.take();
            let bytes = accounting.as_ref().map_or(0, |a| a.total_bytes());
            inner.final_bytes = bytes;
            (
                mem::take(&mut inner.sub_contexts),
                mem::take(&mut inner.callbacks),
                accounting,
                bytes,
            )
        };

        let num_contexts = sub_contexts.len();
        for (id, context) in sub_contexts {
            self.close_sub_context(id, context);
        }
        if let Some(accounting) = accounting {
            accounting.close();
        }

        let error = match target {
            JobContextState::Killed => Some(NlqError::Cancelled(format!(
                "job {} was killed on node {}",
                self.job_id, self.node_id
            ))),
            _ => None,
        };
        for callback in callbacks {
            callback(error.as_ref(), bytes);
        }

        global_metrics().inc_job_contexts_finished(&self.node_id.0, target.as_str());
        debug!(
            job_id = %self.job_id,
            node_id = %self.node_id,
            outcome = target.as_str(),
            sub_contexts = num_contexts,
            bytes_used = bytes,
            "job collect context finished"
        );
        true
    }

    fn close_sub_context(&self, id: SubContextId, mut context: Box<dyn SubContext>) {
        if let Err(e) = context.close() {
            global_metrics().inc_sub_context_close_failures(&self.node_id.0);
            warn!(
                job_id = %self.job_id,
                context_id = %id,
                sub_context = context.name(),
                error = %e,
                "closing sub-context failed"
            );
        }
    }
}

impl fmt::Debug for JobCollectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("JobCollectContext")
            .field("job_id", &self.job_id)
            .field("node_id", &self.node_id)
            .field("state", &inner.state)
            .field("sub_contexts", &inner.sub_contexts.keys().collect::<Vec<_>>())
            .field("callbacks", &inner.callbacks.len())
            .finish()
    }
}
