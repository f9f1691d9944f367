//! Expression trees shared by relations, stages and projections.
//!
//! Symbols are immutable values with structural equality. Rewrites always
//! build new trees.

use std::collections::BTreeSet;
use std::fmt;

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

/// Names of the operators the planner understands when folding constants
/// and splitting predicates.
pub mod operators {
    pub const AND: &str = "op_and";
    pub const OR: &str = "op_or";
    pub const NOT: &str = "op_not";
    pub const EQ: &str = "op_=";
    pub const NOT_EQ: &str = "op_<>";
    pub const LT: &str = "op_<";
    pub const LT_EQ: &str = "op_<=";
    pub const GT: &str = "op_>";
    pub const GT_EQ: &str = "op_>=";
}

/// Name a relation is known by inside one statement (table alias or table name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationName(pub String);

impl RelationName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableIdent {
    pub schema: String,
    pub name: String,
}

impl TableIdent {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

/// Column of a base relation.
///
/// `relation` attributes the column to one source of the statement; two
/// aliases of the same table produce distinct references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub relation: RelationName,
    pub table: TableIdent,
    pub column: String,
    pub value_type: DataType,
    /// Column is a partition column (its value lives in the partition, not the row).
    pub partitioned: bool,
}

impl Reference {
    /// Internal row id column used to hydrate rows in a fetch phase.
    pub const DOC_ID: &'static str = "_docid";

    pub fn doc_id(relation: RelationName, table: TableIdent) -> Self {
        Self {
            relation,
            table,
            column: Self::DOC_ID.to_string(),
            value_type: DataType::Utf8,
            partitioned: false,
        }
    }

    pub fn is_doc_id(&self) -> bool {
        self.column == Self::DOC_ID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionKind {
    Scalar,
    Operator,
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub kind: FunctionKind,
    pub return_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub info: FunctionInfo,
    pub arguments: Vec<Symbol>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Literal {
    pub value: LiteralValue,
    pub value_type: DataType,
}

impl Literal {
    pub fn is_false_or_null(&self) -> bool {
        matches!(
            self.value,
            LiteralValue::Boolean(false) | LiteralValue::Null
        )
    }
}

/// Positional reference into an upstream concatenated row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputColumn {
    pub index: usize,
    pub value_type: DataType,
}

impl InputColumn {
    pub fn new(index: usize, value_type: DataType) -> Self {
        Self { index, value_type }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Symbol {
    Reference(Reference),
    Function(Function),
    Literal(Literal),
    InputColumn(InputColumn),
}

impl Symbol {
    pub fn value_type(&self) -> &DataType {
        match self {
            Symbol::Reference(r) => &r.value_type,
            Symbol::Function(f) => &f.info.return_type,
            Symbol::Literal(l) => &l.value_type,
            Symbol::InputColumn(c) => &c.value_type,
        }
    }

    pub fn function(
        name: impl Into<String>,
        kind: FunctionKind,
        return_type: DataType,
        arguments: Vec<Symbol>,
    ) -> Self {
        Symbol::Function(Function {
            info: FunctionInfo {
                name: name.into(),
                kind,
                return_type,
            },
            arguments,
        })
    }

    pub fn scalar(name: impl Into<String>, return_type: DataType, arguments: Vec<Symbol>) -> Self {
        Self::function(name, FunctionKind::Scalar, return_type, arguments)
    }

    pub fn aggregate(name: impl Into<String>, return_type: DataType, arguments: Vec<Symbol>) -> Self {
        Self::function(name, FunctionKind::Aggregate, return_type, arguments)
    }

    fn boolean_op(name: &str, arguments: Vec<Symbol>) -> Self {
        Self::function(name, FunctionKind::Operator, DataType::Boolean, arguments)
    }

    pub fn eq(left: Symbol, right: Symbol) -> Self {
        Self::boolean_op(operators::EQ, vec![left, right])
    }

    pub fn and(left: Symbol, right: Symbol) -> Self {
        Self::boolean_op(operators::AND, vec![left, right])
    }

    pub fn or(left: Symbol, right: Symbol) -> Self {
        Self::boolean_op(operators::OR, vec![left, right])
    }

    pub fn not(arg: Symbol) -> Self {
        Self::boolean_op(operators::NOT, vec![arg])
    }

    pub fn lit_i64(v: i64) -> Self {
        Symbol::Literal(Literal {
            value: LiteralValue::Int64(v),
            value_type: DataType::Int64,
        })
    }

    pub fn lit_bool(v: bool) -> Self {
        Symbol::Literal(Literal {
            value: LiteralValue::Boolean(v),
            value_type: DataType::Boolean,
        })
    }

    pub fn lit_str(v: impl Into<String>) -> Self {
        Symbol::Literal(Literal {
            value: LiteralValue::Utf8(v.into()),
            value_type: DataType::Utf8,
        })
    }

    pub fn null() -> Self {
        Symbol::Literal(Literal {
            value: LiteralValue::Null,
            value_type: DataType::Null,
        })
    }

    pub fn input(index: usize, value_type: DataType) -> Self {
        Symbol::InputColumn(InputColumn::new(index, value_type))
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Symbol::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_input_column(&self) -> Option<&InputColumn> {
        match self {
            Symbol::InputColumn(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Symbol::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Names of all relations referenced anywhere in this tree, ordered.
    pub fn relations(&self) -> BTreeSet<&RelationName> {
        let mut out = BTreeSet::new();
        self.collect_relations(&mut out);
        out
    }

    fn collect_relations<'a>(&'a self, out: &mut BTreeSet<&'a RelationName>) {
        match self {
            Symbol::Reference(r) => {
                out.insert(&r.relation);
            }
            Symbol::Function(f) => {
                for arg in &f.arguments {
                    arg.collect_relations(out);
                }
            }
            Symbol::Literal(_) | Symbol::InputColumn(_) => {}
        }
    }

    /// `true` when every reference in the tree belongs to `relation` and there is at least one.
    pub fn belongs_only_to(&self, relation: &RelationName) -> bool {
        let rels = self.relations();
        rels.len() == 1 && rels.contains(relation)
    }

    pub fn has_aggregates(&self) -> bool {
        match self {
            Symbol::Function(f) => {
                f.info.kind == FunctionKind::Aggregate
                    || f.arguments.iter().any(Symbol::has_aggregates)
            }
            _ => false,
        }
    }

    /// Leaf references in depth-first, left-to-right order (duplicates kept).
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.visit(&mut |s| {
            if let Symbol::Reference(r) = s {
                out.push(r);
            }
        });
        out
    }

    /// Input columns in depth-first, left-to-right order (duplicates kept).
    pub fn input_columns(&self) -> Vec<&InputColumn> {
        let mut out = Vec::new();
        self.visit(&mut |s| {
            if let Symbol::InputColumn(c) = s {
                out.push(c);
            }
        });
        out
    }

    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Symbol)) {
        f(self);
        if let Symbol::Function(func) = self {
            for arg in &func.arguments {
                arg.visit(f);
            }
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Reference(r) => write!(f, "{}.{}", r.relation, r.column),
            Symbol::Function(func) => {
                write!(f, "{}(", func.info.name)?;
                for (i, arg) in func.arguments.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Symbol::Literal(l) => match &l.value {
                LiteralValue::Int64(v) => write!(f, "{v}"),
                LiteralValue::Float64(v) => write!(f, "{v}"),
                LiteralValue::Utf8(v) => write!(f, "'{v}'"),
                LiteralValue::Boolean(v) => write!(f, "{v}"),
                LiteralValue::Null => f.write_str("NULL"),
            },
            Symbol::InputColumn(c) => write!(f, "IC({})", c.index),
        }
    }
}

/// Split a predicate into its top-level AND conjuncts.
pub fn split_conjuncts(symbol: Symbol) -> Vec<Symbol> {
    match symbol {
        Symbol::Function(f) if f.info.name == operators::AND => f
            .arguments
            .into_iter()
            .flat_map(split_conjuncts)
            .collect(),
        other => vec![other],
    }
}

/// Combine conjuncts back into one predicate; `None` for an empty list.
pub fn combine_conjuncts(conjuncts: Vec<Symbol>) -> Option<Symbol> {
    conjuncts.into_iter().reduce(Symbol::and)
}

// -----------------------------
// Constant folding
// -----------------------------

/// Fold operator calls whose arguments are all literals.
///
/// Only boolean connectives and comparisons are evaluated; other functions
/// keep their shape with folded arguments.
pub fn fold_constants(symbol: Symbol) -> Symbol {
    let Symbol::Function(func) = symbol else {
        return symbol;
    };
    let arguments: Vec<Symbol> = func.arguments.into_iter().map(fold_constants).collect();
    let name = func.info.name.clone();

    match name.as_str() {
        operators::AND => {
            if arguments.iter().any(is_false) {
                return Symbol::lit_bool(false);
            }
            let rest: Vec<Symbol> = arguments.into_iter().filter(|a| !is_true(a)).collect();
            match rest.len() {
                0 => Symbol::lit_bool(true),
                1 => rest.into_iter().next().unwrap_or_else(|| Symbol::lit_bool(true)),
                _ => rebuild(func.info, rest),
            }
        }
        operators::OR => {
            if arguments.iter().any(is_true) {
                return Symbol::lit_bool(true);
            }
            let rest: Vec<Symbol> = arguments.into_iter().filter(|a| !is_false(a)).collect();
            match rest.len() {
                0 => Symbol::lit_bool(false),
                1 => rest.into_iter().next().unwrap_or_else(|| Symbol::lit_bool(false)),
                _ => rebuild(func.info, rest),
            }
        }
        operators::NOT => {
            let folded = match arguments.as_slice() {
                [Symbol::Literal(Literal {
                    value: LiteralValue::Boolean(b),
                    ..
                })] => Some(Symbol::lit_bool(!b)),
                [Symbol::Literal(Literal {
                    value: LiteralValue::Null,
                    ..
                })] => Some(Symbol::null()),
                _ => None,
            };
            folded.unwrap_or_else(|| rebuild(func.info, arguments))
        }
        op @ (operators::EQ
        | operators::NOT_EQ
        | operators::LT
        | operators::LT_EQ
        | operators::GT
        | operators::GT_EQ) => {
            let folded = match arguments.as_slice() {
                [Symbol::Literal(l), Symbol::Literal(r)] => match compare(&l.value, &r.value) {
                    Comparison::Null => Some(Symbol::null()),
                    Comparison::Ordered(ord) => Some(Symbol::lit_bool(match op {
                        operators::EQ => ord.is_eq(),
                        operators::NOT_EQ => ord.is_ne(),
                        operators::LT => ord.is_lt(),
                        operators::LT_EQ => ord.is_le(),
                        operators::GT => ord.is_gt(),
                        _ => ord.is_ge(),
                    })),
                    Comparison::Incomparable => None,
                },
                _ => None,
            };
            folded.unwrap_or_else(|| rebuild(func.info, arguments))
        }
        _ => rebuild(func.info, arguments),
    }
}

fn rebuild(info: FunctionInfo, arguments: Vec<Symbol>) -> Symbol {
    Symbol::Function(Function { info, arguments })
}

fn is_true(s: &Symbol) -> bool {
    matches!(
        s,
        Symbol::Literal(Literal {
            value: LiteralValue::Boolean(true),
            ..
        })
    )
}

fn is_false(s: &Symbol) -> bool {
    matches!(
        s,
        Symbol::Literal(Literal {
            value: LiteralValue::Boolean(false),
            ..
        })
    )
}

enum Comparison {
    Null,
    Ordered(std::cmp::Ordering),
    Incomparable,
}

fn compare(l: &LiteralValue, r: &LiteralValue) -> Comparison {
    use LiteralValue::*;
    let ord = match (l, r) {
        (Null, _) | (_, Null) => return Comparison::Null,
        (Int64(a), Int64(b)) => Some(a.cmp(b)),
        (Float64(a), Float64(b)) => a.partial_cmp(b),
        (Int64(a), Float64(b)) => (*a as f64).partial_cmp(b),
        (Float64(a), Int64(b)) => a.partial_cmp(&(*b as f64)),
        (Utf8(a), Utf8(b)) => Some(a.cmp(b)),
        (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match ord {
        Some(o) => Comparison::Ordered(o),
        None => Comparison::Incomparable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(relation: &str, column: &str) -> Symbol {
        Symbol::Reference(Reference {
            relation: RelationName::new(relation),
            table: TableIdent::new("doc", "users"),
            column: column.to_string(),
            value_type: DataType::Int64,
            partitioned: false,
        })
    }

    #[test]
    fn folds_literal_comparisons() {
        assert_eq!(
            fold_constants(Symbol::eq(Symbol::lit_i64(1), Symbol::lit_i64(2))),
            Symbol::lit_bool(false)
        );
        assert_eq!(
            fold_constants(Symbol::not(Symbol::eq(Symbol::lit_i64(1), Symbol::lit_i64(1)))),
            Symbol::lit_bool(false)
        );
        assert_eq!(
            fold_constants(Symbol::eq(Symbol::null(), Symbol::lit_i64(1))),
            Symbol::null()
        );
    }

    #[test]
    fn folds_connectives_around_columns() {
        let pred = Symbol::and(
            Symbol::eq(col("t1", "id"), Symbol::lit_i64(1)),
            Symbol::eq(Symbol::lit_i64(1), Symbol::lit_i64(2)),
        );
        assert_eq!(fold_constants(pred), Symbol::lit_bool(false));

        let pred = Symbol::or(
            Symbol::eq(Symbol::lit_i64(1), Symbol::lit_i64(2)),
            Symbol::eq(col("t1", "id"), Symbol::lit_i64(1)),
        );
        assert_eq!(
            fold_constants(pred),
            Symbol::eq(col("t1", "id"), Symbol::lit_i64(1))
        );
    }

    #[test]
    fn relations_and_aggregates() {
        let s = Symbol::scalar(
            "add",
            DataType::Int64,
            vec![col("t2", "id"), col("t1", "id")],
        );
        let rels: Vec<_> = s.relations().into_iter().map(|r| r.0.as_str()).collect();
        assert_eq!(rels, vec!["t1", "t2"]);
        assert!(!s.belongs_only_to(&RelationName::new("t1")));
        assert!(!s.has_aggregates());
        let agg = Symbol::aggregate("count", DataType::Int64, vec![s]);
        assert!(agg.has_aggregates());
        assert_eq!(agg.to_string(), "count(add(t2.id, t1.id))");
    }

    #[test]
    fn splits_nested_conjunctions() {
        let a = Symbol::eq(col("t1", "id"), Symbol::lit_i64(1));
        let b = Symbol::eq(col("t2", "id"), Symbol::lit_i64(2));
        let c = Symbol::or(a.clone(), b.clone());
        let parts = split_conjuncts(Symbol::and(Symbol::and(a.clone(), b.clone()), c.clone()));
        assert_eq!(parts, vec![a.clone(), b.clone(), c]);
        assert_eq!(
            combine_conjuncts(vec![a.clone(), b.clone()]),
            Some(Symbol::and(a, b))
        );
        assert_eq!(combine_conjuncts(vec![]), None);
    }
}
