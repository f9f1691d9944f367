//! Planning-time state shared by the join planner and single relation planners.

use std::collections::BTreeMap;

use nlq_common::{EngineConfig, ExecutionNodeId, JobId, NodeId, Result, SubContextId};
use serde::{Deserialize, Serialize};

use crate::physical_plan::{PhysicalPlan, Routing};
use crate::projection::ShardLocation;
use crate::relation::QueriedTable;
use crate::symbol::TableIdent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Limit applied to statements without an explicit `LIMIT`.
    pub default_select_limit: usize,
    /// Rows per fetch request.
    pub fetch_page_size: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for PlannerConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            default_select_limit: cfg.default_select_limit,
            fetch_page_size: cfg.fetch_page_size,
        }
    }
}

/// Cluster membership and shard placement.
pub trait ClusterRouting {
    /// Node planning the statement; receives the final rows.
    fn local_node_id(&self) -> NodeId;
    fn routing(&self, table: &TableIdent) -> Result<Routing>;
}

/// Plans a single base-table relation.
///
/// Returning `Ok(None)` means the relation cannot be planned yet.
pub trait RelationPlanner {
    fn plan_relation(
        &self,
        relation: &QueriedTable,
        ctx: &mut PlannerContext<'_>,
    ) -> Result<Option<PhysicalPlan>>;
}

/// Id allocation and routing bookkeeping for one statement.
pub struct PlannerContext<'a> {
    cluster: &'a dyn ClusterRouting,
    config: PlannerConfig,
    job_id: JobId,
    next_execution_node_id: i32,
    next_sub_context_id: i32,
    sub_contexts: BTreeMap<SubContextId, ShardLocation>,
}

impl<'a> PlannerContext<'a> {
    pub fn new(cluster: &'a dyn ClusterRouting, config: PlannerConfig, job_id: JobId) -> Self {
        Self {
            cluster,
            config,
            job_id,
            next_execution_node_id: 0,
            next_sub_context_id: 0,
            sub_contexts: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn handler_node(&self) -> NodeId {
        self.cluster.local_node_id()
    }

    pub fn routing(&self, table: &TableIdent) -> Result<Routing> {
        self.cluster.routing(table)
    }

    pub fn next_execution_node_id(&mut self) -> ExecutionNodeId {
        let id = ExecutionNodeId(self.next_execution_node_id);
        self.next_execution_node_id += 1;
        id
    }

    /// Allocate one search context id per shard of `routing`, opened by `collect_stage`.
    pub fn allocate_sub_contexts(
        &mut self,
        routing: &Routing,
        collect_stage: ExecutionNodeId,
    ) -> Vec<SubContextId> {
        let mut ids = Vec::new();
        for (node, index, shard) in routing.shards() {
            let id = SubContextId(self.next_sub_context_id);
            self.next_sub_context_id += 1;
            self.sub_contexts.insert(
                id,
                ShardLocation {
                    node: node.clone(),
                    index: index.to_string(),
                    shard,
                    collect_stage,
                },
            );
            ids.push(id);
        }
        ids
    }

    pub fn sub_contexts(&self) -> &BTreeMap<SubContextId, ShardLocation> {
        &self.sub_contexts
    }

    /// Search contexts opened by `collect_stage`.
    pub fn sub_contexts_of(
        &self,
        collect_stage: ExecutionNodeId,
    ) -> BTreeMap<SubContextId, ShardLocation> {
        self.sub_contexts
            .iter()
            .filter(|(_, loc)| loc.collect_stage == collect_stage)
            .map(|(id, loc)| (*id, loc.clone()))
            .collect()
    }
}
