//! Splits a multi-source statement into one query per base table.

use nlq_common::{NlqError, Result};

use crate::context::PlannerConfig;
use crate::query_spec::{OrderBy, QuerySpec, WhereClause};
use crate::relation::{AnalyzedRelation, MultiSourceSelect, QueriedTable, TableRelation};
use crate::symbol::{RelationName, Symbol, combine_conjuncts, fold_constants, split_conjuncts};

/// Result of splitting a statement, index-aligned with its declared sources.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitSelect {
    /// Rewrite per source; `None` for sources that are already planned.
    pub relations: Vec<Option<QueriedTable>>,
    /// Predicate spanning several sources, evaluated on the joined row.
    pub remaining_query: Option<Symbol>,
    /// Order by spanning several sources; when set it is the full statement order by.
    pub remaining_order_by: Option<OrderBy>,
    /// Per source, the position of the first order by symbol that belongs only to it.
    pub first_order_by_index: Vec<Option<usize>>,
    /// Statement limit or the configured default.
    pub effective_limit: usize,
}

impl SplitSelect {
    pub fn pushes_down_limit(&self) -> bool {
        self.remaining_query.is_none() && self.remaining_order_by.is_none()
    }
}

struct SourceParts {
    outputs: Vec<Symbol>,
    conjuncts: Vec<Symbol>,
    order_by_indices: Vec<usize>,
    join_outputs: Vec<Symbol>,
}

/// Split `statement` per source.
///
/// Sources must be base tables (`Table` or an earlier `Queried` rewrite) or
/// already planned; anything else is a planning contract violation.
pub fn split_select(statement: &MultiSourceSelect, config: &PlannerConfig) -> Result<SplitSelect> {
    let spec = &statement.query_spec;
    let tables: Vec<Option<&TableRelation>> = statement
        .sources
        .iter()
        .map(|(name, relation)| match relation {
            AnalyzedRelation::Table(t) => Ok(Some(t)),
            AnalyzedRelation::Queried(q) => Ok(Some(&q.table)),
            AnalyzedRelation::Planned(_) => Ok(None),
            AnalyzedRelation::SubQuery(_) => Err(NlqError::Planning(format!(
                "source {name} is a sub query and cannot be split"
            ))),
        })
        .collect::<Result<_>>()?;

    let position_of = |name: &RelationName| statement.position(name);
    let splittable = |name: &RelationName| position_of(name).filter(|&i| tables[i].is_some());

    let mut parts: Vec<SourceParts> = statement
        .sources
        .iter()
        .map(|_| SourceParts {
            outputs: Vec::new(),
            conjuncts: Vec::new(),
            order_by_indices: Vec::new(),
            join_outputs: Vec::new(),
        })
        .collect();

    // where clause
    let mut remaining_conjuncts = Vec::new();
    if let Some(query) = &spec.where_clause.query {
        for conjunct in split_conjuncts(fold_constants(query.clone())) {
            let target = single_relation(&conjunct).and_then(splittable);
            match target {
                Some(i) => parts[i].conjuncts.push(conjunct),
                None if conjunct.relations().is_empty() && is_true(&conjunct) => {}
                None => remaining_conjuncts.push(conjunct),
            }
        }
    }
    let remaining_query = combine_conjuncts(remaining_conjuncts);

    // outputs
    for output in &spec.outputs {
        let mut found = Vec::new();
        single_source_parts(output, &mut found);
        for (name, part) in found {
            if let Some(i) = splittable(&name) {
                push_unique(&mut parts[i].outputs, part);
            }
        }
    }

    // order by
    let mut first_order_by_index = vec![None; statement.sources.len()];
    let mut remaining_order_by = None;
    if let Some(order_by) = &spec.order_by {
        order_by.validate()?;
        let mut spans_sources = false;
        let mut previous = None;
        for (idx, symbol) in order_by.symbols.iter().enumerate() {
            match single_relation(symbol).and_then(position_of) {
                Some(i) => {
                    if first_order_by_index[i].is_none() {
                        first_order_by_index[i] = Some(idx);
                    } else if previous != Some(i) {
                        // keys of one source interleaved with another's
                        spans_sources = true;
                    }
                    previous = Some(i);
                    if tables[i].is_some() {
                        parts[i].order_by_indices.push(idx);
                    } else {
                        spans_sources = true;
                    }
                }
                None => spans_sources = true,
            }
        }
        if spans_sources {
            remaining_order_by = Some(order_by.clone());
            for symbol in &order_by.symbols {
                let mut found = Vec::new();
                single_source_parts(symbol, &mut found);
                for (name, part) in found {
                    if let Some(i) = splittable(&name) {
                        push_unique(&mut parts[i].join_outputs, part);
                    }
                }
            }
        }
    }

    if let Some(query) = &remaining_query {
        let mut found = Vec::new();
        single_source_parts(query, &mut found);
        for (name, part) in found {
            if let Some(i) = splittable(&name) {
                push_unique(&mut parts[i].join_outputs, part);
            }
        }
    }

    let effective_limit = spec.limit.unwrap_or(config.default_select_limit);
    let push_down_limit = remaining_query.is_none() && remaining_order_by.is_none();
    let source_limit = push_down_limit.then(|| effective_limit.saturating_add(spec.offset));

    let relations = tables
        .iter()
        .zip(parts)
        .map(|(table, parts)| {
            table.map(|table| {
                let order_by = match (&spec.order_by, &remaining_order_by) {
                    (Some(ob), None) if !parts.order_by_indices.is_empty() => {
                        Some(ob.subset(&parts.order_by_indices))
                    }
                    _ => None,
                };
                QueriedTable {
                    table: table.clone(),
                    query_spec: QuerySpec {
                        outputs: parts.outputs,
                        where_clause: match combine_conjuncts(parts.conjuncts) {
                            Some(q) => WhereClause::new(q),
                            None => WhereClause::match_all(),
                        },
                        group_by: Vec::new(),
                        order_by,
                        limit: source_limit,
                        offset: 0,
                    },
                    join_outputs: parts.join_outputs,
                }
            })
        })
        .collect();

    Ok(SplitSelect {
        relations,
        remaining_query,
        remaining_order_by,
        first_order_by_index,
        effective_limit,
    })
}

fn single_relation(symbol: &Symbol) -> Option<&RelationName> {
    let rels = symbol.relations();
    if rels.len() == 1 {
        rels.into_iter().next()
    } else {
        None
    }
}

/// Maximal sub-expressions of `symbol` that reference exactly one relation.
fn single_source_parts(symbol: &Symbol, out: &mut Vec<(RelationName, Symbol)>) {
    if let Some(name) = single_relation(symbol) {
        out.push((name.clone(), symbol.clone()));
        return;
    }
    if let Symbol::Function(f) = symbol {
        for arg in &f.arguments {
            single_source_parts(arg, out);
        }
    }
}

fn push_unique(symbols: &mut Vec<Symbol>, symbol: Symbol) {
    if !symbols.contains(&symbol) {
        symbols.push(symbol);
    }
}

fn is_true(symbol: &Symbol) -> bool {
    *symbol == Symbol::lit_bool(true)
}
