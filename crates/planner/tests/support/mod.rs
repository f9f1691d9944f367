#![allow(dead_code)]

use std::collections::BTreeMap;

use arrow_schema::DataType;
use nlq_common::{JobId, NlqError, NodeId, Result};
use nlq_planner::{
    Catalog, ClusterRouting, CollectStage, CollectThenFetchPlan, ColumnInfo, Downstream,
    FetchPhase, MergeStage, OrderBy, PhysicalPlan, PlannerConfig, PlannerContext, QueriedTable,
    Reference, RelationName, RelationPlanner, Routing, Symbol, TableIdent, TableInfo,
    TableRelation, replace_with_input_columns,
};

pub const HANDLER: &str = "handler";

pub struct TestCatalog {
    tables: BTreeMap<TableIdent, TableInfo>,
}

impl TestCatalog {
    pub fn new() -> Self {
        let mut tables = BTreeMap::new();
        for info in [
            table(
                "users",
                &[("id", DataType::Int64), ("name", DataType::Utf8), ("awesome", DataType::Boolean)],
                &[],
            ),
            table(
                "characters",
                &[("id", DataType::Int64), ("name", DataType::Utf8), ("female", DataType::Boolean)],
                &[],
            ),
            table(
                "parted",
                &[("id", DataType::Int64), ("name", DataType::Utf8), ("date", DataType::Int64)],
                &["date"],
            ),
        ] {
            tables.insert(info.ident.clone(), info);
        }
        Self { tables }
    }

    pub fn relation(&self, table: &str, alias: &str) -> TableRelation {
        TableRelation::resolve(self, &TableIdent::new("doc", table), Some(alias))
            .expect("known test table")
    }
}

impl Catalog for TestCatalog {
    fn table_info(&self, ident: &TableIdent) -> Result<TableInfo> {
        self.tables
            .get(ident)
            .cloned()
            .ok_or_else(|| NlqError::Planning(format!("unknown table {ident}")))
    }
}

fn table(name: &str, columns: &[(&str, DataType)], partitioned_by: &[&str]) -> TableInfo {
    TableInfo {
        ident: TableIdent::new("doc", name),
        columns: columns
            .iter()
            .map(|(n, t)| ColumnInfo::new(*n, t.clone()))
            .collect(),
        partitioned_by: partitioned_by.iter().map(|s| s.to_string()).collect(),
        primary_key: vec!["id".to_string()],
    }
}

/// `users` on n1 (shards 0, 1) and n2 (shard 2), everything else on n2.
pub struct StaticRouting;

impl ClusterRouting for StaticRouting {
    fn local_node_id(&self) -> NodeId {
        NodeId::new(HANDLER)
    }

    fn routing(&self, table: &TableIdent) -> Result<Routing> {
        let mut routing = Routing::default();
        let placement: Vec<(&str, Vec<u32>)> = match table.name.as_str() {
            "users" => vec![("n1", vec![0, 1]), ("n2", vec![2])],
            _ => vec![("n2", vec![0])],
        };
        for (node, shards) in placement {
            routing
                .locations
                .entry(NodeId::new(node))
                .or_default()
                .insert(table.name.clone(), shards);
        }
        Ok(routing)
    }
}

/// Single relation planner producing a collect stage plus a handler-side merge.
///
/// With `fetch` it collects only the row id and the symbols the join needs,
/// leaving the statement outputs for a fetch phase.
#[derive(Default)]
pub struct FakeRelationPlanner {
    pub fetch: bool,
    pub declined: Vec<RelationName>,
}

impl FakeRelationPlanner {
    pub fn collecting() -> Self {
        Self::default()
    }

    pub fn fetching() -> Self {
        Self {
            fetch: true,
            ..Self::default()
        }
    }

    pub fn declining(relation: &str) -> Self {
        Self {
            declined: vec![RelationName::new(relation)],
            ..Self::default()
        }
    }
}

impl RelationPlanner for FakeRelationPlanner {
    fn plan_relation(
        &self,
        relation: &QueriedTable,
        ctx: &mut PlannerContext<'_>,
    ) -> Result<Option<PhysicalPlan>> {
        if self.declined.contains(relation.name()) {
            return Ok(None);
        }
        let spec = &relation.query_spec;
        let routing = ctx.routing(relation.table_ident())?;
        let collect_id = ctx.next_execution_node_id();
        let merge_id = ctx.next_execution_node_id();
        let handler = ctx.handler_node();

        let mut outputs: Vec<Symbol> = Vec::new();
        if self.fetch {
            outputs.push(Symbol::Reference(relation.table.doc_id()));
        } else {
            outputs.extend(spec.outputs.iter().cloned());
        }
        let order_symbols = spec.order_by.iter().flat_map(|ob| ob.symbols.iter());
        for s in relation.join_outputs.iter().chain(order_symbols) {
            if !outputs.contains(s) {
                outputs.push(s.clone());
            }
        }

        if self.fetch {
            ctx.allocate_sub_contexts(&routing, collect_id);
        }

        let input_types: Vec<DataType> = outputs.iter().map(|s| s.value_type().clone()).collect();
        let sort = spec
            .order_by
            .as_ref()
            .map(|ob: &OrderBy| ob.map_symbols(|s| replace_with_input_columns(s, &outputs)));
        let merge = MergeStage {
            id: merge_id,
            name: "local-merge".to_string(),
            execution_nodes: vec![handler.clone()],
            input_types,
            num_upstreams: routing.nodes().len(),
            projections: vec![],
            sort,
            downstream: Downstream::Handler {
                node: handler.clone(),
            },
        };
        let collect = CollectStage {
            id: collect_id,
            name: "collect".to_string(),
            table: relation.table_ident().clone(),
            routing,
            outputs,
            where_clause: spec.where_clause.clone(),
            limit: spec.limit,
            order_by: spec.order_by.clone(),
            downstream: Downstream::Stage {
                nodes: vec![handler],
                execution_node_id: merge_id,
            },
        };
        let fetch = self.fetch.then(|| FetchPhase {
            outputs: spec.outputs.clone(),
            partition_columns: spec
                .outputs
                .iter()
                .flat_map(Symbol::references)
                .filter(|r| r.partitioned)
                .cloned()
                .collect::<Vec<Reference>>(),
        });
        Ok(Some(PhysicalPlan::CollectThenFetch(CollectThenFetchPlan {
            collect,
            merge: Some(merge),
            fetch,
        })))
    }
}

pub fn context(routing: &StaticRouting) -> PlannerContext<'_> {
    PlannerContext::new(routing, PlannerConfig::default(), JobId(1))
}

pub fn context_with(routing: &StaticRouting, config: PlannerConfig) -> PlannerContext<'_> {
    PlannerContext::new(routing, config, JobId(1))
}

pub fn col(relation: &TableRelation, column: &str) -> Symbol {
    relation.reference(column).expect("known column")
}

/// Leaf plans of a nested loop tree, left to right.
pub fn leaves(plan: &PhysicalPlan) -> Vec<&PhysicalPlan> {
    match plan {
        PhysicalPlan::NestedLoop(nl) => {
            let mut out = leaves(&nl.left);
            out.extend(leaves(&nl.right));
            out
        }
        other => vec![other],
    }
}

pub fn collect_stage(plan: &PhysicalPlan) -> &CollectStage {
    match plan {
        PhysicalPlan::CollectThenFetch(p) => &p.collect,
        other => panic!("expected CollectThenFetch, got {}", other.kind()),
    }
}
