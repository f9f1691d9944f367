use std::collections::BTreeMap;

use arrow_schema::DataType;
use nlq_common::{ExecutionNodeId, NlqError, NodeId, Result};
use serde::{Deserialize, Serialize};

use crate::projection::Projection;
use crate::query_spec::{DocKeys, OrderBy, WhereClause};
use crate::symbol::{Reference, RelationName, Symbol, TableIdent};

/// The physical operator graph.
///
/// Every node owns its children; output types are derivable without
/// executing anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhysicalPlan {
    /// Primary key lookup executed on the handler.
    TableGet(TableGetPlan),
    /// Distributed scan, merge and optional row hydration.
    CollectThenFetch(CollectThenFetchPlan),
    /// Binary nested loop join.
    NestedLoop(NestedLoopPlan),
    /// Plan producing zero rows.
    NoOp(NoOpPlan),
    /// Plans executed one after another; the last one produces the result.
    Iterable(IterablePlan),
}

impl PhysicalPlan {
    /// Returns direct child plans.
    pub fn children(&self) -> Vec<&PhysicalPlan> {
        match self {
            PhysicalPlan::TableGet(_) | PhysicalPlan::CollectThenFetch(_) | PhysicalPlan::NoOp(_) => {
                vec![]
            }
            PhysicalPlan::NestedLoop(x) => vec![x.left.as_ref(), x.right.as_ref()],
            PhysicalPlan::Iterable(x) => x.plans.iter().collect(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PhysicalPlan::TableGet(_) => "TableGet",
            PhysicalPlan::CollectThenFetch(_) => "CollectThenFetch",
            PhysicalPlan::NestedLoop(_) => "NestedLoop",
            PhysicalPlan::NoOp(_) => "NoOp",
            PhysicalPlan::Iterable(_) => "Iterable",
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, PhysicalPlan::NoOp(_))
    }

    /// Types of the rows this plan emits before its result merge stage runs.
    pub fn output_types(&self) -> Vec<DataType> {
        match self {
            PhysicalPlan::TableGet(x) => types_of(&x.outputs),
            PhysicalPlan::CollectThenFetch(x) => x.collect.output_types(),
            PhysicalPlan::NestedLoop(x) => {
                let mut types = x.left.output_types();
                types.extend(x.right.output_types());
                types
            }
            PhysicalPlan::NoOp(x) => x.output_types.clone(),
            PhysicalPlan::Iterable(x) => x
                .plans
                .last()
                .map(PhysicalPlan::output_types)
                .unwrap_or_default(),
        }
    }

    /// Symbols behind [`Self::output_types`]; `None` for plans without symbols.
    pub fn output_symbols(&self) -> Option<Vec<Symbol>> {
        match self {
            PhysicalPlan::TableGet(x) => Some(x.outputs.clone()),
            PhysicalPlan::CollectThenFetch(x) => Some(x.collect.outputs.clone()),
            PhysicalPlan::NestedLoop(x) => {
                let mut symbols = x.left.output_symbols()?;
                symbols.extend(x.right.output_symbols()?);
                Some(symbols)
            }
            PhysicalPlan::NoOp(_) => None,
            PhysicalPlan::Iterable(x) => x.plans.last().and_then(PhysicalPlan::output_symbols),
        }
    }

    /// Merge stage whose output is the result of this plan, if any.
    pub fn result_stage(&self) -> Option<&MergeStage> {
        match self {
            PhysicalPlan::CollectThenFetch(x) => x.merge.as_ref(),
            PhysicalPlan::NestedLoop(x) => Some(&x.merge),
            PhysicalPlan::Iterable(x) => x.plans.last().and_then(PhysicalPlan::result_stage),
            PhysicalPlan::TableGet(_) | PhysicalPlan::NoOp(_) => None,
        }
    }

    pub fn result_stage_mut(&mut self) -> Option<&mut MergeStage> {
        match self {
            PhysicalPlan::CollectThenFetch(x) => x.merge.as_mut(),
            PhysicalPlan::NestedLoop(x) => Some(&mut x.merge),
            PhysicalPlan::Iterable(x) => x
                .plans
                .last_mut()
                .and_then(PhysicalPlan::result_stage_mut),
            PhysicalPlan::TableGet(_) | PhysicalPlan::NoOp(_) => None,
        }
    }

    /// Types received by the consumer of this plan.
    pub fn result_types(&self) -> Vec<DataType> {
        match (self, self.result_stage()) {
            (PhysicalPlan::NoOp(x), _) => x.output_types.clone(),
            (_, Some(stage)) => stage.output_types(),
            (_, None) => self.output_types(),
        }
    }
}

fn types_of(symbols: &[Symbol]) -> Vec<DataType> {
    symbols.iter().map(|s| s.value_type().clone()).collect()
}

/// Shards of one table grouped by node and index.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Routing {
    pub locations: BTreeMap<NodeId, BTreeMap<String, Vec<u32>>>,
}

impl Routing {
    pub fn nodes(&self) -> Vec<NodeId> {
        self.locations.keys().cloned().collect()
    }

    /// `(node, index, shard)` triples in node/index/shard order.
    pub fn shards(&self) -> Vec<(&NodeId, &str, u32)> {
        let mut out = Vec::new();
        for (node, indices) in &self.locations {
            for (index, shards) in indices {
                for shard in shards {
                    out.push((node, index.as_str(), *shard));
                }
            }
        }
        out
    }
}

/// Where a stage sends its rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Downstream {
    /// The node that issued the query.
    Handler { node: NodeId },
    /// Another stage of the same job.
    Stage {
        nodes: Vec<NodeId>,
        execution_node_id: ExecutionNodeId,
    },
}

/// Distributed scan executed on every node of `routing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectStage {
    pub id: ExecutionNodeId,
    pub name: String,
    pub table: TableIdent,
    pub routing: Routing,
    /// Collected symbols, in emitted order.
    pub outputs: Vec<Symbol>,
    pub where_clause: WhereClause,
    pub limit: Option<usize>,
    pub order_by: Option<OrderBy>,
    pub downstream: Downstream,
}

impl CollectStage {
    pub fn output_types(&self) -> Vec<DataType> {
        types_of(&self.outputs)
    }

    pub fn execution_nodes(&self) -> Vec<NodeId> {
        self.routing.nodes()
    }
}

/// Combines rows of `num_upstreams` upstream stages and runs `projections` on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeStage {
    pub id: ExecutionNodeId,
    pub name: String,
    pub execution_nodes: Vec<NodeId>,
    pub input_types: Vec<DataType>,
    pub num_upstreams: usize,
    pub projections: Vec<Projection>,
    /// Upstream rows arrive sorted by these input columns.
    pub sort: Option<OrderBy>,
    pub downstream: Downstream,
}

impl MergeStage {
    pub fn output_types(&self) -> Vec<DataType> {
        self.projections
            .iter()
            .fold(self.input_types.clone(), |types, p| p.output_types(&types))
    }

    /// Check the projection chain: each input column must exist in the rows
    /// produced by the previous projection with a matching type, and a fetch
    /// can only be last.
    pub fn validate(&self) -> Result<()> {
        let mut types = self.input_types.clone();
        for (pos, projection) in self.projections.iter().enumerate() {
            if matches!(projection, Projection::Fetch(_)) && pos + 1 != self.projections.len() {
                return Err(NlqError::Planning(format!(
                    "merge stage {}: Fetch must be the last projection",
                    self.name
                )));
            }
            for ic in projection.input_columns() {
                match types.get(ic.index) {
                    None => {
                        return Err(NlqError::Planning(format!(
                            "merge stage {}: {} reads input column {} of a {}-column row",
                            self.name,
                            projection.name(),
                            ic.index,
                            types.len()
                        )));
                    }
                    Some(t) if *t != ic.value_type => {
                        return Err(NlqError::Planning(format!(
                            "merge stage {}: {} expects {:?} at input column {}, found {:?}",
                            self.name,
                            projection.name(),
                            ic.value_type,
                            ic.index,
                            t
                        )));
                    }
                    Some(_) => {}
                }
            }
            types = projection.output_types(&types);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableGetPlan {
    pub table: TableIdent,
    pub relation: RelationName,
    pub outputs: Vec<Symbol>,
    pub doc_keys: DocKeys,
    pub limit: Option<usize>,
}

/// Columns a single relation plan would hydrate after collecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchPhase {
    pub outputs: Vec<Symbol>,
    pub partition_columns: Vec<Reference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectThenFetchPlan {
    pub collect: CollectStage,
    pub merge: Option<MergeStage>,
    pub fetch: Option<FetchPhase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedLoopPlan {
    pub left: Box<PhysicalPlan>,
    pub right: Box<PhysicalPlan>,
    /// The left side drives the outer loop.
    pub left_outer_loop: bool,
    /// Stage running the join and every projection on the joined row.
    pub merge: MergeStage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoOpPlan {
    pub output_types: Vec<DataType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterablePlan {
    pub plans: Vec<PhysicalPlan>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{FilterProjection, NestedLoopMergeProjection, TopNProjection};

    fn merge(projections: Vec<Projection>) -> MergeStage {
        MergeStage {
            id: ExecutionNodeId(1),
            name: "merge".to_string(),
            execution_nodes: vec![NodeId::new("n1")],
            input_types: vec![DataType::Int64, DataType::Utf8],
            num_upstreams: 2,
            projections,
            sort: None,
            downstream: Downstream::Handler {
                node: NodeId::new("n1"),
            },
        }
    }

    #[test]
    fn validate_checks_ranges_and_types() {
        let ok = merge(vec![
            Projection::NestedLoopMerge(NestedLoopMergeProjection {
                outputs: vec![Symbol::input(1, DataType::Utf8)],
            }),
            Projection::Filter(FilterProjection {
                query: Symbol::eq(Symbol::input(0, DataType::Utf8), Symbol::lit_str("x")),
            }),
        ]);
        ok.validate().expect("valid chain");
        assert_eq!(ok.output_types(), vec![DataType::Utf8]);

        let out_of_range = merge(vec![
            Projection::NestedLoopMerge(NestedLoopMergeProjection {
                outputs: vec![Symbol::input(0, DataType::Int64)],
            }),
            Projection::TopN(TopNProjection {
                limit: 1,
                offset: 0,
                order_by: None,
                outputs: vec![Symbol::input(1, DataType::Utf8)],
            }),
        ]);
        let err = out_of_range.validate().expect_err("index out of range");
        assert!(err.to_string().contains("input column 1"));

        let wrong_type = merge(vec![Projection::Filter(FilterProjection {
            query: Symbol::eq(Symbol::input(0, DataType::Utf8), Symbol::lit_str("x")),
        })]);
        assert!(wrong_type.validate().is_err());
    }

    #[test]
    fn noop_result_types_are_declared_types() {
        let plan = PhysicalPlan::NoOp(NoOpPlan {
            output_types: vec![DataType::Int64],
        });
        assert_eq!(plan.result_types(), vec![DataType::Int64]);
        assert!(plan.output_symbols().is_none());
        assert!(plan.children().is_empty());
    }

    #[test]
    fn routing_lists_shards_in_order() {
        let mut routing = Routing::default();
        routing.locations.insert(
            NodeId::new("n2"),
            BTreeMap::from([("users".to_string(), vec![1])]),
        );
        routing.locations.insert(
            NodeId::new("n1"),
            BTreeMap::from([("users".to_string(), vec![0, 2])]),
        );
        let shards: Vec<_> = routing
            .shards()
            .into_iter()
            .map(|(n, i, s)| (n.0.clone(), i.to_string(), s))
            .collect();
        assert_eq!(
            shards,
            vec![
                ("n1".to_string(), "users".to_string(), 0),
                ("n1".to_string(), "users".to_string(), 2),
                ("n2".to_string(), "users".to_string(), 1),
            ]
        );
    }
}
