use std::collections::BTreeMap;

use nlq_common::{ExecutionNodeId, NlqError, NodeId, Result};
use nlq_planner::{CollectStage, Downstream, MergeStage, PhysicalPlan};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageKind {
    Collect,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageNode {
    pub id: ExecutionNodeId,
    pub kind: StageKind,
    pub name: String,
    pub nodes: Vec<NodeId>,
    pub operators: Vec<String>,
    /// Stage consuming this stage's rows.
    pub parents: Vec<ExecutionNodeId>,
    /// Stages feeding this one.
    pub children: Vec<ExecutionNodeId>,
    pub downstream: Downstream,
}

/// Collect and merge stages of one plan in post-order (upstream stages first).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDag {
    pub stages: Vec<StageNode>,
}

impl StageDag {
    pub fn new() -> Self {
        Self { stages: vec![] }
    }

    /// Last stage delivering rows to the handler.
    pub fn root_id(&self) -> Option<ExecutionNodeId> {
        self.stages
            .iter()
            .rev()
            .find(|s| matches!(s.downstream, Downstream::Handler { .. }))
            .map(|s| s.id)
    }

    pub fn stage(&self, id: ExecutionNodeId) -> Option<&StageNode> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Stages `node` has to run, in dependency order.
    pub fn stages_for_node(&self, node: &NodeId) -> Vec<ExecutionNodeId> {
        self.stages
            .iter()
            .filter(|s| s.nodes.contains(node))
            .map(|s| s.id)
            .collect()
    }
}

/// Flatten `plan` into its stages and check that every stage routes to an
/// existing stage on the nodes that stage runs on.
pub fn build_stage_dag(plan: &PhysicalPlan) -> Result<StageDag> {
    let mut dag = StageDag::new();
    visit_plan(plan, &mut dag)?;
    link_stages(&mut dag)?;
    Ok(dag)
}

fn visit_plan(plan: &PhysicalPlan, dag: &mut StageDag) -> Result<()> {
    match plan {
        PhysicalPlan::CollectThenFetch(x) => {
            add_collect(dag, &x.collect);
            if let Some(merge) = &x.merge {
                add_merge(dag, merge)?;
            }
        }
        PhysicalPlan::NestedLoop(x) => {
            visit_plan(&x.left, dag)?;
            visit_plan(&x.right, dag)?;
            add_merge(dag, &x.merge)?;
        }
        PhysicalPlan::Iterable(x) => {
            for p in &x.plans {
                visit_plan(p, dag)?;
            }
        }
        PhysicalPlan::TableGet(_) | PhysicalPlan::NoOp(_) => {}
    }
    Ok(())
}

fn add_collect(dag: &mut StageDag, stage: &CollectStage) {
    dag.stages.push(StageNode {
        id: stage.id,
        kind: StageKind::Collect,
        name: stage.name.clone(),
        nodes: stage.execution_nodes(),
        operators: vec![format!("Collect({})", stage.table)],
        parents: Vec::new(),
        children: Vec::new(),
        downstream: stage.downstream.clone(),
    });
}

fn add_merge(dag: &mut StageDag, stage: &MergeStage) -> Result<()> {
    stage.validate()?;
    dag.stages.push(StageNode {
        id: stage.id,
        kind: StageKind::Merge,
        name: stage.name.clone(),
        nodes: stage.execution_nodes.clone(),
        operators: stage
            .projections
            .iter()
            .map(|p| p.name().to_string())
            .collect(),
        parents: Vec::new(),
        children: Vec::new(),
        downstream: stage.downstream.clone(),
    });
    Ok(())
}

fn link_stages(dag: &mut StageDag) -> Result<()> {
    let mut positions = BTreeMap::new();
    for (pos, stage) in dag.stages.iter().enumerate() {
        if positions.insert(stage.id, pos).is_some() {
            return Err(NlqError::Planning(format!(
                "execution node id {} is used by more than one stage",
                stage.id
            )));
        }
    }

    let mut edges = Vec::new();
    for (pos, stage) in dag.stages.iter().enumerate() {
        let Downstream::Stage {
            nodes,
            execution_node_id,
        } = &stage.downstream
        else {
            continue;
        };
        let target = *positions.get(execution_node_id).ok_or_else(|| {
            NlqError::Planning(format!(
                "stage {} routes to unknown stage {execution_node_id}",
                stage.id
            ))
        })?;
        if dag.stages[target].nodes != *nodes {
            return Err(NlqError::Planning(format!(
                "stage {} sends rows to {:?} but stage {execution_node_id} runs on {:?}",
                stage.id, nodes, dag.stages[target].nodes
            )));
        }
        edges.push((target, pos));
    }

    for (parent, child) in edges {
        let (parent_id, child_id) = (dag.stages[parent].id, dag.stages[child].id);
        dag.stages[parent].children.push(child_id);
        dag.stages[child].parents.push(parent_id);
    }
    Ok(())
}
