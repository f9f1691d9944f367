use crate::symbol::{Function, Symbol};

/// Replace every sub-expression of `symbol` that equals an entry of
/// `upstream` with an input column pointing at that entry.
///
/// The first structurally equal upstream entry wins. Functions without a
/// match are rebuilt from rewritten arguments; literals and unmatched
/// references are returned unchanged.
pub fn replace_with_input_columns(symbol: &Symbol, upstream: &[Symbol]) -> Symbol {
    if !matches!(symbol, Symbol::Literal(_)) {
        if let Some(index) = upstream.iter().position(|u| u == symbol) {
            return Symbol::input(index, symbol.value_type().clone());
        }
    }
    match symbol {
        Symbol::Function(f) => Symbol::Function(Function {
            info: f.info.clone(),
            arguments: f
                .arguments
                .iter()
                .map(|a| replace_with_input_columns(a, upstream))
                .collect(),
        }),
        other => other.clone(),
    }
}

/// `true` when `symbol` has no reference left after rewriting against `upstream`.
pub fn resolves_against(symbol: &Symbol, upstream: &[Symbol]) -> bool {
    replace_with_input_columns(symbol, upstream)
        .references()
        .is_empty()
}

#[cfg(test)]
mod tests {
    use arrow_schema::DataType;

    use super::*;
    use crate::symbol::{Reference, RelationName, TableIdent};

    fn col(relation: &str, column: &str, value_type: DataType) -> Symbol {
        Symbol::Reference(Reference {
            relation: RelationName::new(relation),
            table: TableIdent::new("doc", relation),
            column: column.to_string(),
            value_type,
            partitioned: false,
        })
    }

    #[test]
    fn whole_subtree_match_wins_over_children() {
        let id = col("t1", "id", DataType::Int64);
        let plus = Symbol::scalar("add", DataType::Int64, vec![id.clone(), Symbol::lit_i64(2)]);
        let upstream = vec![id.clone(), plus.clone()];
        assert_eq!(
            replace_with_input_columns(&plus, &upstream),
            Symbol::input(1, DataType::Int64)
        );
    }

    #[test]
    fn first_match_wins_and_functions_recurse() {
        let a = col("t1", "id", DataType::Int64);
        let b = col("t2", "name", DataType::Utf8);
        let upstream = vec![a.clone(), b.clone(), a.clone()];
        let f = Symbol::scalar("concat", DataType::Utf8, vec![b.clone(), a.clone()]);
        assert_eq!(
            replace_with_input_columns(&f, &upstream),
            Symbol::scalar(
                "concat",
                DataType::Utf8,
                vec![Symbol::input(1, DataType::Utf8), Symbol::input(0, DataType::Int64)]
            )
        );
    }

    #[test]
    fn literals_and_unmatched_references_stay() {
        let lit = Symbol::lit_i64(1);
        let upstream = vec![lit.clone()];
        assert_eq!(replace_with_input_columns(&lit, &upstream), lit);

        let other = col("t3", "x", DataType::Int64);
        assert_eq!(replace_with_input_columns(&other, &upstream), other);
        assert!(!resolves_against(&other, &upstream));
        assert!(resolves_against(&other, &[other.clone()]));
    }
}
