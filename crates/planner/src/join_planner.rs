//! Planner for statements selecting from several base tables without a join
//! condition usable by anything but a nested loop.

use arrow_schema::DataType;
use nlq_common::{ExecutionNodeId, NlqError, NodeId, Result, global_metrics};
use tracing::debug;

use crate::context::{PlannerContext, RelationPlanner};
use crate::physical_plan::{Downstream, MergeStage, NestedLoopPlan, NoOpPlan, PhysicalPlan};
use crate::projection::{
    FetchProjection, FilterProjection, NestedLoopMergeProjection, Projection, TopNProjection,
    pass_through,
};
use crate::query_spec::QuerySpec;
use crate::relation::{AnalyzedRelation, MultiSourceSelect};
use crate::rewriter::replace_with_input_columns;
use crate::splitter::{SplitSelect, split_select};
use crate::symbol::{InputColumn, Reference, RelationName, Symbol};

const PLANNER: &str = "cross_join";

/// Outcome of [`CrossJoinPlanner::plan`].
#[derive(Debug, Clone, PartialEq)]
pub enum JoinPlan {
    Planned(PhysicalPlan),
    /// The statement cannot be planned yet; not an error.
    NotApplicable,
}

impl JoinPlan {
    pub fn into_plan(self) -> Option<PhysicalPlan> {
        match self {
            JoinPlan::Planned(p) => Some(p),
            JoinPlan::NotApplicable => None,
        }
    }
}

pub struct CrossJoinPlanner<'a> {
    relation_planner: &'a dyn RelationPlanner,
}

impl<'a> CrossJoinPlanner<'a> {
    pub fn new(relation_planner: &'a dyn RelationPlanner) -> Self {
        Self { relation_planner }
    }

    /// Plan `statement` as a left-deep tree of nested loops.
    pub fn plan(
        &self,
        statement: &MultiSourceSelect,
        ctx: &mut PlannerContext<'_>,
    ) -> Result<JoinPlan> {
        if statement.sources.len() < 2 {
            return Ok(self.not_applicable(ctx, "fewer than two sources"));
        }
        validate(statement)?;

        let spec = &statement.query_spec;
        if spec.where_clause.is_statically_false() {
            return Ok(self.planned(ctx, noop(spec)));
        }

        let split = split_select(statement, ctx.config())?;
        let inner = self.plan_sources(statement, &split, ctx)?;

        let mut plans = Vec::with_capacity(inner.sources.len());
        for (name, relation) in inner.sources {
            match relation {
                AnalyzedRelation::Planned(plan) => plans.push((name, *plan)),
                other => {
                    debug!(
                        job_id = %ctx.job_id(),
                        relation = %name,
                        kind = other.kind(),
                        "relation not planned yet"
                    );
                    return Ok(self.not_applicable(ctx, "relation not planned"));
                }
            }
        }
        if plans.iter().any(|(_, p)| p.is_noop()) {
            return Ok(self.planned(ctx, noop(spec)));
        }

        let plan = build_nested_loops(spec, &split, plans, ctx)?;
        Ok(self.planned(ctx, plan))
    }

    /// Plan every base table source on its own.
    ///
    /// Returns a new statement where planned sources are `Planned` and
    /// sources the relation planner declined are their `Queried` rewrite.
    pub fn plan_inner_relations(
        &self,
        statement: &MultiSourceSelect,
        ctx: &mut PlannerContext<'_>,
    ) -> Result<MultiSourceSelect> {
        validate(statement)?;
        let split = split_select(statement, ctx.config())?;
        self.plan_sources(statement, &split, ctx)
    }

    fn plan_sources(
        &self,
        statement: &MultiSourceSelect,
        split: &SplitSelect,
        ctx: &mut PlannerContext<'_>,
    ) -> Result<MultiSourceSelect> {
        let mut sources = Vec::with_capacity(statement.sources.len());
        for ((name, relation), queried) in statement.sources.iter().zip(&split.relations) {
            let next = match (relation, queried) {
                (AnalyzedRelation::Planned(plan), _) => AnalyzedRelation::Planned(plan.clone()),
                (_, Some(queried)) => match self.relation_planner.plan_relation(queried, ctx)? {
                    Some(plan) => AnalyzedRelation::Planned(Box::new(plan)),
                    None => AnalyzedRelation::Queried(queried.clone()),
                },
                (other, None) => other.clone(),
            };
            sources.push((name.clone(), next));
        }
        Ok(MultiSourceSelect::new(sources, statement.query_spec.clone()))
    }

    fn planned(&self, ctx: &PlannerContext<'_>, plan: PhysicalPlan) -> JoinPlan {
        global_metrics().inc_plans_built(PLANNER, plan.kind());
        debug!(
            job_id = %ctx.job_id(),
            planner = PLANNER,
            kind = plan.kind(),
            output_columns = plan.result_types().len(),
            "cross join planned"
        );
        JoinPlan::Planned(plan)
    }

    fn not_applicable(&self, ctx: &PlannerContext<'_>, reason: &str) -> JoinPlan {
        global_metrics().inc_planner_not_applicable(PLANNER);
        debug!(job_id = %ctx.job_id(), planner = PLANNER, reason, "cross join not applicable");
        JoinPlan::NotApplicable
    }
}

fn validate(statement: &MultiSourceSelect) -> Result<()> {
    let spec = &statement.query_spec;
    if !spec.group_by.is_empty() {
        return Err(NlqError::Validation(
            "GROUP BY on CROSS JOIN is not supported".to_string(),
        ));
    }
    if spec.has_aggregates() {
        return Err(NlqError::Validation(
            "AGGREGATIONS on CROSS JOIN is not supported".to_string(),
        ));
    }
    if statement
        .sources
        .iter()
        .any(|(_, r)| matches!(r, AnalyzedRelation::SubQuery(_)))
    {
        return Err(NlqError::Validation(
            "CROSS JOIN with sub queries is not supported".to_string(),
        ));
    }
    Ok(())
}

fn noop(spec: &QuerySpec) -> PhysicalPlan {
    PhysicalPlan::NoOp(NoOpPlan {
        output_types: spec.output_types(),
    })
}

/// Source indices ordered by their first order by position; ties and
/// unordered sources keep declaration order.
fn join_order(first_order_by_index: &[Option<usize>]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..first_order_by_index.len()).collect();
    order.sort_by_key(|&i| first_order_by_index[i].unwrap_or(usize::MAX));
    order
}

struct Leaf {
    relation: RelationName,
    /// Collect stage id and its nodes, for plans that scan.
    collect: Option<(ExecutionNodeId, Vec<NodeId>)>,
}

fn build_nested_loops(
    spec: &QuerySpec,
    split: &SplitSelect,
    plans: Vec<(RelationName, PhysicalPlan)>,
    ctx: &mut PlannerContext<'_>,
) -> Result<PhysicalPlan> {
    let mut slots: Vec<Option<(RelationName, PhysicalPlan)>> = plans.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(slots.len());
    for i in join_order(&split.first_order_by_index) {
        if let Some(entry) = slots[i].take() {
            ordered.push(entry);
        }
    }

    let mut upstream: Vec<Symbol> = Vec::new();
    let mut leaves = Vec::with_capacity(ordered.len());
    for (relation, plan) in &ordered {
        let symbols = plan.output_symbols().ok_or_else(|| {
            NlqError::Planning(format!("plan of relation {relation} has no output symbols"))
        })?;
        if plan.result_types() != plan.output_types() {
            return Err(NlqError::Planning(format!(
                "plan of relation {relation} changes its row shape in its merge stage"
            )));
        }
        upstream.extend(symbols);
        leaves.push(Leaf {
            relation: relation.clone(),
            collect: match plan {
                PhysicalPlan::CollectThenFetch(p) => {
                    Some((p.collect.id, p.collect.execution_nodes()))
                }
                _ => None,
            },
        });
    }

    let handler = ctx.handler_node();
    let mut ordered = ordered.into_iter().map(|(_, plan)| plan);
    let first = ordered
        .next()
        .ok_or_else(|| NlqError::Planning("cross join without sources".to_string()))?;
    let mut root = ordered.fold(first, |left, right| nested_loop(left, right, &handler, ctx));

    let PhysicalPlan::NestedLoop(nl) = &mut root else {
        return Err(NlqError::Planning(
            "cross join needs at least two planned sources".to_string(),
        ));
    };
    let projections = result_projections(spec, split, &upstream, &leaves, ctx)?;
    nl.merge.projections.extend(projections);
    nl.merge.validate()?;
    Ok(root)
}

fn nested_loop(
    mut left: PhysicalPlan,
    mut right: PhysicalPlan,
    handler: &NodeId,
    ctx: &mut PlannerContext<'_>,
) -> PhysicalPlan {
    let execution_nodes = left
        .result_stage()
        .map(|s| s.execution_nodes.clone())
        .unwrap_or_else(|| vec![handler.clone()]);
    let id = ctx.next_execution_node_id();
    let downstream = Downstream::Stage {
        nodes: execution_nodes.clone(),
        execution_node_id: id,
    };
    route_result(&mut left, &downstream);
    route_result(&mut right, &downstream);

    let mut input_types: Vec<DataType> = left.output_types();
    input_types.extend(right.output_types());
    let merge = MergeStage {
        id,
        name: "nested-loop".to_string(),
        execution_nodes,
        projections: vec![Projection::NestedLoopMerge(NestedLoopMergeProjection {
            outputs: pass_through(&input_types),
        })],
        input_types,
        num_upstreams: 2,
        sort: None,
        downstream: Downstream::Handler {
            node: handler.clone(),
        },
    };
    PhysicalPlan::NestedLoop(NestedLoopPlan {
        left: Box::new(left),
        right: Box::new(right),
        left_outer_loop: true,
        merge,
    })
}

fn route_result(plan: &mut PhysicalPlan, downstream: &Downstream) {
    if let Some(stage) = plan.result_stage_mut() {
        stage.downstream = downstream.clone();
    } else if let PhysicalPlan::CollectThenFetch(p) = plan {
        p.collect.downstream = downstream.clone();
    }
}

/// Projections run on the joined row `upstream` after the nested loop merge.
fn result_projections(
    spec: &QuerySpec,
    split: &SplitSelect,
    upstream: &[Symbol],
    leaves: &[Leaf],
    ctx: &PlannerContext<'_>,
) -> Result<Vec<Projection>> {
    let mut projections = Vec::new();
    if let Some(query) = &split.remaining_query {
        projections.push(Projection::Filter(FilterProjection {
            query: rewrite_resolved(query, upstream, "join condition")?,
        }));
    }

    let order_by = match &split.remaining_order_by {
        Some(ob) => {
            let symbols = ob
                .symbols
                .iter()
                .map(|s| rewrite_resolved(s, upstream, "order by"))
                .collect::<Result<Vec<_>>>()?;
            let mut rewritten = ob.clone();
            rewritten.symbols = symbols;
            Some(rewritten)
        }
        None => None,
    };

    let outputs: Vec<Symbol> = spec
        .outputs
        .iter()
        .map(|s| replace_with_input_columns(s, upstream))
        .collect();
    let needs_fetch = outputs.iter().any(|s| !s.references().is_empty());
    let upstream_types: Vec<DataType> = upstream.iter().map(|s| s.value_type().clone()).collect();

    projections.push(Projection::TopN(TopNProjection {
        limit: split.effective_limit,
        offset: spec.offset,
        order_by,
        outputs: if needs_fetch {
            pass_through(&upstream_types)
        } else {
            outputs.clone()
        },
    }));

    if needs_fetch {
        projections.push(Projection::Fetch(fetch_projection(
            outputs,
            upstream,
            upstream_types,
            leaves,
            split.effective_limit,
            ctx,
        )?));
    }
    Ok(projections)
}

fn rewrite_resolved(symbol: &Symbol, upstream: &[Symbol], what: &str) -> Result<Symbol> {
    let rewritten = replace_with_input_columns(symbol, upstream);
    if let Some(r) = rewritten.references().first() {
        return Err(NlqError::Planning(format!(
            "{what} uses {}.{} which no relation plan collected",
            r.relation, r.column
        )));
    }
    Ok(rewritten)
}

fn fetch_projection(
    outputs: Vec<Symbol>,
    upstream: &[Symbol],
    input_types: Vec<DataType>,
    leaves: &[Leaf],
    effective_limit: usize,
    ctx: &PlannerContext<'_>,
) -> Result<FetchProjection> {
    let mut fetch = FetchProjection {
        doc_id_columns: Vec::new(),
        input_types,
        fetch_columns: Vec::new(),
        outputs: Vec::new(),
        partition_columns: Vec::new(),
        execution_nodes: Default::default(),
        sub_contexts: Default::default(),
        bulk_size: None,
    };

    for leaf in leaves {
        let mut columns: Vec<Reference> = Vec::new();
        for r in outputs.iter().flat_map(Symbol::references) {
            if r.relation == leaf.relation && !columns.contains(r) {
                columns.push(r.clone());
            }
        }
        let Some(first) = columns.first() else {
            continue;
        };

        let doc_id = upstream
            .iter()
            .position(|s| {
                s.as_reference()
                    .is_some_and(|r| r.relation == leaf.relation && r.is_doc_id())
            })
            .ok_or_else(|| {
                NlqError::Planning(format!(
                    "relation {} must collect {} to fetch {}",
                    leaf.relation,
                    Reference::DOC_ID,
                    first.column
                ))
            })?;
        let (collect_id, nodes) = leaf.collect.clone().ok_or_else(|| {
            NlqError::Planning(format!(
                "relation {} has no collect stage to fetch from",
                leaf.relation
            ))
        })?;

        let (partitioned, regular): (Vec<Reference>, Vec<Reference>) =
            columns.into_iter().partition(|r| r.partitioned);
        fetch.doc_id_columns.push((
            leaf.relation.clone(),
            InputColumn::new(doc_id, upstream[doc_id].value_type().clone()),
        ));
        fetch.fetch_columns.push((leaf.relation.clone(), regular));
        if !partitioned.is_empty() {
            fetch
                .partition_columns
                .push((leaf.relation.clone(), partitioned));
        }
        fetch.execution_nodes.insert(collect_id, nodes);
        fetch.sub_contexts.extend(ctx.sub_contexts_of(collect_id));
    }

    let page_size = ctx.config().fetch_page_size;
    fetch.bulk_size = (effective_limit > page_size).then_some(page_size);
    fetch.outputs = outputs;
    Ok(fetch)
}
