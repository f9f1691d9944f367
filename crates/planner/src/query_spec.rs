use nlq_common::{NlqError, Result};
use serde::{Deserialize, Serialize};

use crate::symbol::{Symbol, fold_constants, split_conjuncts};

/// Primary key values a statement filters on (`where id = 1 or id = 2`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocKeys {
    pub keys: Vec<Vec<Symbol>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WhereClause {
    pub query: Option<Symbol>,
    /// Set by analysis when the predicate is known to match nothing.
    pub no_match: bool,
    pub doc_keys: Option<DocKeys>,
}

impl WhereClause {
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn no_match() -> Self {
        Self {
            query: None,
            no_match: true,
            doc_keys: None,
        }
    }

    pub fn new(query: Symbol) -> Self {
        Self {
            query: Some(query),
            no_match: false,
            doc_keys: None,
        }
    }

    pub fn has_query(&self) -> bool {
        self.query.is_some()
    }

    /// `true` when the clause can never match: either flagged as such or one
    /// of its conjuncts folds to `false`/`NULL`.
    pub fn is_statically_false(&self) -> bool {
        if self.no_match {
            return true;
        }
        match &self.query {
            Some(q) => split_conjuncts(fold_constants(q.clone()))
                .iter()
                .any(|c| matches!(c, Symbol::Literal(l) if l.is_false_or_null())),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub symbols: Vec<Symbol>,
    pub reverse_flags: Vec<bool>,
    pub nulls_first: Vec<Option<bool>>,
}

impl OrderBy {
    /// Ascending order with default null placement.
    pub fn asc(symbols: Vec<Symbol>) -> Self {
        let n = symbols.len();
        Self {
            symbols,
            reverse_flags: vec![false; n],
            nulls_first: vec![None; n],
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Every symbol needs its own direction and null placement.
    pub fn validate(&self) -> Result<()> {
        let n = self.symbols.len();
        if self.reverse_flags.len() != n || self.nulls_first.len() != n {
            return Err(NlqError::Planning(format!(
                "order by has {n} symbols but {} directions and {} null placements",
                self.reverse_flags.len(),
                self.nulls_first.len()
            )));
        }
        Ok(())
    }

    /// Keep only the entries at `indices`, preserving the per-entry flags.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            symbols: indices.iter().map(|&i| self.symbols[i].clone()).collect(),
            reverse_flags: indices.iter().map(|&i| self.reverse_flags[i]).collect(),
            nulls_first: indices.iter().map(|&i| self.nulls_first[i]).collect(),
        }
    }

    pub fn map_symbols(&self, f: impl FnMut(&Symbol) -> Symbol) -> Self {
        Self {
            symbols: self.symbols.iter().map(f).collect(),
            reverse_flags: self.reverse_flags.clone(),
            nulls_first: self.nulls_first.clone(),
        }
    }
}

/// Analyzed select clause of one statement or one source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    pub outputs: Vec<Symbol>,
    pub where_clause: WhereClause,
    pub group_by: Vec<Symbol>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl QuerySpec {
    pub fn new(outputs: Vec<Symbol>) -> Self {
        Self {
            outputs,
            ..Self::default()
        }
    }

    pub fn with_where(mut self, where_clause: WhereClause) -> Self {
        self.where_clause = where_clause;
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn with_group_by(mut self, group_by: Vec<Symbol>) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn has_aggregates(&self) -> bool {
        self.outputs.iter().any(Symbol::has_aggregates)
    }

    pub fn output_types(&self) -> Vec<arrow_schema::DataType> {
        self.outputs.iter().map(|s| s.value_type().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statically_false_where_clauses() {
        assert!(WhereClause::no_match().is_statically_false());
        assert!(!WhereClause::match_all().is_statically_false());
        assert!(
            WhereClause::new(Symbol::eq(Symbol::lit_i64(1), Symbol::lit_i64(2)))
                .is_statically_false()
        );
        assert!(WhereClause::new(Symbol::null()).is_statically_false());
        let with_null = Symbol::and(
            Symbol::eq(Symbol::input(0, arrow_schema::DataType::Int64), Symbol::lit_i64(1)),
            Symbol::null(),
        );
        assert!(WhereClause::new(with_null).is_statically_false());
        assert!(
            !WhereClause::new(Symbol::eq(Symbol::lit_i64(2), Symbol::lit_i64(2)))
                .is_statically_false()
        );
    }

    #[test]
    fn order_by_subset_keeps_flags() {
        let mut ob = OrderBy::asc(vec![Symbol::lit_i64(1), Symbol::lit_i64(2), Symbol::lit_i64(3)]);
        ob.reverse_flags[2] = true;
        ob.nulls_first[2] = Some(true);
        let sub = ob.subset(&[2, 0]);
        assert_eq!(sub.symbols, vec![Symbol::lit_i64(3), Symbol::lit_i64(1)]);
        assert_eq!(sub.reverse_flags, vec![true, false]);
        assert_eq!(sub.nulls_first, vec![Some(true), None]);
    }

    #[test]
    fn order_by_flags_must_match_symbols() {
        let mut ob = OrderBy::asc(vec![Symbol::lit_i64(1), Symbol::lit_i64(2)]);
        assert!(ob.validate().is_ok());
        ob.nulls_first.push(None);
        let err = ob.validate().expect_err("too many null placements");
        assert!(matches!(err, NlqError::Planning(_)));
    }
}
