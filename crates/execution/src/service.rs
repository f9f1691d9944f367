//! Node-local directory of job collect contexts.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use nlq_common::{EngineConfig, JobId, NodeId, NodeMemoryBudget, Result};
use parking_lot::Mutex;
use tracing::info;

use crate::job_context::JobCollectContext;

type Registry = Arc<Mutex<BTreeMap<JobId, Arc<JobCollectContext>>>>;

/// Hands out exactly one [`JobCollectContext`] per job on this node.
///
/// Contexts leave the service as soon as they are closed or killed.
#[derive(Debug)]
pub struct JobContextService {
    node_id: NodeId,
    budget: Arc<NodeMemoryBudget>,
    job_limit_bytes: u64,
    contexts: Registry,
}

impl JobContextService {
    /// Service for `node_id` with memory limits taken from `config`.
    pub fn new(node_id: NodeId, config: &EngineConfig) -> Self {
        Self {
            node_id,
            budget: NodeMemoryBudget::new(config.node_memory_budget_bytes),
            job_limit_bytes: config.job_memory_limit_bytes,
            contexts: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Node this service runs on.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Memory budget shared by all jobs of this node.
    pub fn budget(&self) -> &Arc<NodeMemoryBudget> {
        &self.budget
    }

    /// Context of `job_id`, created on first use.
    pub fn get_or_create(&self, job_id: JobId) -> Result<Arc<JobCollectContext>> {
        let mut contexts = self.contexts.lock();
        if let Some(ctx) = contexts.get(&job_id) {
            if !ctx.state().is_terminal() {
                return Ok(Arc::clone(ctx));
            }
        }

        let accounting = self
            .budget
            .job_context(format!("job-{job_id}"), self.job_limit_bytes);
        let ctx = Arc::new(JobCollectContext::new(
            job_id,
            self.node_id.clone(),
            Box::new(accounting),
        ));
        let registry = Arc::clone(&self.contexts);
        let this = Arc::downgrade(&ctx);
        ctx.add_callback(move |_, _| remove_if_current(&registry, job_id, &this))?;
        contexts.insert(job_id, Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Context of `job_id` if one is open.
    pub fn get(&self, job_id: JobId) -> Option<Arc<JobCollectContext>> {
        self.contexts.lock().get(&job_id).cloned()
    }

    /// Close the job's context; `false` if there is none or it already finished.
    pub fn close_job(&self, job_id: JobId) -> bool {
        self.get(job_id).is_some_and(|ctx| ctx.close())
    }

    /// Kill the job's context; `false` if there is none or it already finished.
    pub fn kill_job(&self, job_id: JobId) -> bool {
        self.get(job_id).is_some_and(|ctx| ctx.kill())
    }

    /// Kill every open context and return how many this call tore down.
    pub fn kill_all(&self) -> usize {
        let open: Vec<Arc<JobCollectContext>> = self.contexts.lock().values().cloned().collect();
        let killed = open.iter().filter(|ctx| ctx.kill()).count();
        info!(node_id = %self.node_id, killed, "killed all job collect contexts");
        killed
    }

    /// Number of contexts currently registered.
    pub fn active_jobs(&self) -> usize {
        self.contexts.lock().len()
    }
}

fn remove_if_current(registry: &Registry, job_id: JobId, ctx: &Weak<JobCollectContext>) {
    let mut contexts = registry.lock();
    if contexts
        .get(&job_id)
        .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), ctx.as_ptr()))
    {
        contexts.remove(&job_id);
    }
}
