//! Row stream transformations executed inside merge stages.

use std::collections::BTreeMap;

use arrow_schema::DataType;
use nlq_common::{ExecutionNodeId, NodeId, SubContextId};
use serde::{Deserialize, Serialize};

use crate::query_spec::OrderBy;
use crate::symbol::{InputColumn, Reference, RelationName, Symbol};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// Drop rows not matching `query`; the row shape is unchanged.
    Filter(FilterProjection),
    /// Sort (optional), then apply offset and limit.
    TopN(TopNProjection),
    /// Hydrate rows by row id.
    Fetch(FetchProjection),
    /// Emit the joined row; first projection of every nested loop merge.
    NestedLoopMerge(NestedLoopMergeProjection),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterProjection {
    pub query: Symbol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopNProjection {
    pub limit: usize,
    pub offset: usize,
    pub order_by: Option<OrderBy>,
    pub outputs: Vec<Symbol>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedLoopMergeProjection {
    pub outputs: Vec<Symbol>,
}

/// Where a job search context lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLocation {
    pub node: NodeId,
    pub index: String,
    pub shard: u32,
    /// Collect stage that opened the search context.
    pub collect_stage: ExecutionNodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchProjection {
    /// Row id column of every fetched relation, positional in the input row.
    pub doc_id_columns: Vec<(RelationName, InputColumn)>,
    pub input_types: Vec<DataType>,
    /// Columns to read from storage per relation.
    pub fetch_columns: Vec<(RelationName, Vec<Reference>)>,
    /// Input columns and references left for hydration.
    pub outputs: Vec<Symbol>,
    pub partition_columns: Vec<(RelationName, Vec<Reference>)>,
    /// Nodes running each collect stage whose rows get hydrated.
    pub execution_nodes: BTreeMap<ExecutionNodeId, Vec<NodeId>>,
    /// Search contexts opened per shard at collect time.
    pub sub_contexts: BTreeMap<SubContextId, ShardLocation>,
    /// Rows per fetch request; `None` fetches everything at once.
    pub bulk_size: Option<usize>,
}

impl Projection {
    pub fn name(&self) -> &'static str {
        match self {
            Projection::Filter(_) => "Filter",
            Projection::TopN(_) => "TopN",
            Projection::Fetch(_) => "Fetch",
            Projection::NestedLoopMerge(_) => "NestedLoopMerge",
        }
    }

    /// Row types produced for an input row of `input` types.
    pub fn output_types(&self, input: &[DataType]) -> Vec<DataType> {
        match self {
            Projection::Filter(_) => input.to_vec(),
            Projection::TopN(p) => types_of(&p.outputs),
            Projection::Fetch(p) => types_of(&p.outputs),
            Projection::NestedLoopMerge(p) => types_of(&p.outputs),
        }
    }

    /// Every input column this projection reads.
    pub fn input_columns(&self) -> Vec<&InputColumn> {
        match self {
            Projection::Filter(p) => p.query.input_columns(),
            Projection::TopN(p) => {
                let mut out: Vec<&InputColumn> =
                    p.outputs.iter().flat_map(Symbol::input_columns).collect();
                if let Some(ob) = &p.order_by {
                    out.extend(ob.symbols.iter().flat_map(Symbol::input_columns));
                }
                out
            }
            Projection::Fetch(p) => {
                let mut out: Vec<&InputColumn> =
                    p.doc_id_columns.iter().map(|(_, c)| c).collect();
                out.extend(p.outputs.iter().flat_map(Symbol::input_columns));
                out
            }
            Projection::NestedLoopMerge(p) => {
                p.outputs.iter().flat_map(Symbol::input_columns).collect()
            }
        }
    }
}

/// Pass-through outputs `IC(0)..IC(n)` for a row of `types`.
pub fn pass_through(types: &[DataType]) -> Vec<Symbol> {
    types
        .iter()
        .enumerate()
        .map(|(i, t)| Symbol::input(i, t.clone()))
        .collect()
}

fn types_of(symbols: &[Symbol]) -> Vec<DataType> {
    symbols.iter().map(|s| s.value_type().clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_keeps_shape_and_top_n_reshapes() {
        let input = vec![DataType::Int64, DataType::Utf8];
        let filter = Projection::Filter(FilterProjection {
            query: Symbol::eq(Symbol::input(0, DataType::Int64), Symbol::lit_i64(1)),
        });
        assert_eq!(filter.output_types(&input), input);
        assert_eq!(filter.input_columns().len(), 1);

        let top_n = Projection::TopN(TopNProjection {
            limit: 10,
            offset: 0,
            order_by: Some(OrderBy::asc(vec![Symbol::input(0, DataType::Int64)])),
            outputs: vec![Symbol::input(1, DataType::Utf8)],
        });
        assert_eq!(top_n.output_types(&input), vec![DataType::Utf8]);
        let indices: Vec<usize> = top_n.input_columns().iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 0]);
    }

    #[test]
    fn pass_through_covers_every_column() {
        let outputs = pass_through(&[DataType::Int64, DataType::Boolean]);
        assert_eq!(
            outputs,
            vec![
                Symbol::input(0, DataType::Int64),
                Symbol::input(1, DataType::Boolean)
            ]
        );
    }
}
