use crate::physical_plan::{CollectStage, Downstream, MergeStage, PhysicalPlan};
use crate::projection::Projection;
use crate::query_spec::OrderBy;
use crate::symbol::Symbol;

/// Render a physical plan as human-readable multiline text.
pub fn explain_physical(plan: &PhysicalPlan) -> String {
    let mut s = String::new();
    fmt_plan(plan, 0, &mut s);
    s
}

fn fmt_plan(plan: &PhysicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        PhysicalPlan::TableGet(x) => {
            out.push_str(&format!(
                "{pad}TableGet table={} relation={} keys={} limit={:?}\n",
                x.table,
                x.relation,
                x.doc_keys.keys.len(),
                x.limit
            ));
            out.push_str(&format!("{pad}  outputs=[{}]\n", fmt_symbols(&x.outputs)));
        }
        PhysicalPlan::CollectThenFetch(x) => {
            out.push_str(&format!("{pad}CollectThenFetch\n"));
            fmt_collect(&x.collect, indent + 1, out);
            if let Some(merge) = &x.merge {
                fmt_merge(merge, indent + 1, out);
            }
            if let Some(fetch) = &x.fetch {
                out.push_str(&format!(
                    "{pad}  fetch outputs=[{}] partition_columns={}\n",
                    fmt_symbols(&fetch.outputs),
                    fetch.partition_columns.len()
                ));
            }
        }
        PhysicalPlan::NestedLoop(x) => {
            out.push_str(&format!(
                "{pad}NestedLoop left_outer_loop={}\n",
                x.left_outer_loop
            ));
            fmt_merge(&x.merge, indent + 1, out);
            out.push_str(&format!("{pad}  left:\n"));
            fmt_plan(&x.left, indent + 2, out);
            out.push_str(&format!("{pad}  right:\n"));
            fmt_plan(&x.right, indent + 2, out);
        }
        PhysicalPlan::NoOp(x) => {
            out.push_str(&format!("{pad}NoOp types={:?}\n", x.output_types));
        }
        PhysicalPlan::Iterable(x) => {
            out.push_str(&format!("{pad}Iterable plans={}\n", x.plans.len()));
            for p in &x.plans {
                fmt_plan(p, indent + 1, out);
            }
        }
    }
}

fn fmt_collect(stage: &CollectStage, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    out.push_str(&format!(
        "{pad}Collect id={} table={} nodes={} limit={:?} -> {}\n",
        stage.id,
        stage.table,
        stage.routing.nodes().len(),
        stage.limit,
        fmt_downstream(&stage.downstream)
    ));
    out.push_str(&format!("{pad}  outputs=[{}]\n", fmt_symbols(&stage.outputs)));
    if let Some(q) = &stage.where_clause.query {
        out.push_str(&format!("{pad}  where={q}\n"));
    }
    if let Some(ob) = &stage.order_by {
        out.push_str(&format!("{pad}  order_by={}\n", fmt_order_by(ob)));
    }
}

fn fmt_merge(stage: &MergeStage, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    let nodes: Vec<&str> = stage.execution_nodes.iter().map(|n| n.0.as_str()).collect();
    out.push_str(&format!(
        "{pad}Merge id={} name={} nodes=[{}] upstreams={} -> {}\n",
        stage.id,
        stage.name,
        nodes.join(", "),
        stage.num_upstreams,
        fmt_downstream(&stage.downstream)
    ));
    for p in &stage.projections {
        out.push_str(&format!("{pad}  {}\n", fmt_projection(p)));
    }
}

fn fmt_projection(p: &Projection) -> String {
    match p {
        Projection::Filter(x) => format!("Filter {}", x.query),
        Projection::TopN(x) => {
            let order = x
                .order_by
                .as_ref()
                .map(|ob| format!(" order_by={}", fmt_order_by(ob)))
                .unwrap_or_default();
            format!(
                "TopN limit={} offset={}{order} outputs=[{}]",
                x.limit,
                x.offset,
                fmt_symbols(&x.outputs)
            )
        }
        Projection::Fetch(x) => format!(
            "Fetch relations={} bulk_size={:?} outputs=[{}]",
            x.doc_id_columns.len(),
            x.bulk_size,
            fmt_symbols(&x.outputs)
        ),
        Projection::NestedLoopMerge(x) => {
            format!("NestedLoopMerge outputs=[{}]", fmt_symbols(&x.outputs))
        }
    }
}

fn fmt_downstream(d: &Downstream) -> String {
    match d {
        Downstream::Handler { node } => format!("handler({node})"),
        Downstream::Stage {
            execution_node_id, ..
        } => format!("stage({execution_node_id})"),
    }
}

fn fmt_order_by(ob: &OrderBy) -> String {
    ob.symbols
        .iter()
        .zip(&ob.reverse_flags)
        .map(|(s, rev)| if *rev { format!("{s} DESC") } else { s.to_string() })
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_symbols(symbols: &[Symbol]) -> String {
    symbols
        .iter()
        .map(Symbol::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;

    use super::*;
    use crate::physical_plan::NoOpPlan;

    #[test]
    fn explains_noop() {
        let plan = PhysicalPlan::NoOp(NoOpPlan {
            output_types: vec![DataType::Int64],
        });
        assert_eq!(explain_physical(&plan), "NoOp types=[Int64]\n");
    }
}
