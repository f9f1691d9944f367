//! Turns physical plans into per-node stage assignments.

pub mod stage;

use std::collections::BTreeMap;

use nlq_common::{ExecutionNodeId, NodeId, Result};
use nlq_planner::PhysicalPlan;
use tracing::debug;

pub use stage::{StageDag, StageKind, StageNode, build_stage_dag};

#[derive(Debug, Default)]
pub struct DistributedRuntime;

impl DistributedRuntime {
    pub fn build_stage_dag(&self, plan: &PhysicalPlan) -> Result<StageDag> {
        let dag = stage::build_stage_dag(plan)?;
        debug!(
            plan = plan.kind(),
            stages = dag.stages.len(),
            root = ?dag.root_id(),
            "stage dag built"
        );
        Ok(dag)
    }

    /// Stages every participating node runs, keyed by node.
    pub fn node_assignments(
        &self,
        plan: &PhysicalPlan,
    ) -> Result<BTreeMap<NodeId, Vec<ExecutionNodeId>>> {
        let dag = self.build_stage_dag(plan)?;
        let mut out: BTreeMap<NodeId, Vec<ExecutionNodeId>> = BTreeMap::new();
        for stage in &dag.stages {
            for node in &stage.nodes {
                out.entry(node.clone()).or_default().push(stage.id);
            }
        }
        Ok(out)
    }
}
