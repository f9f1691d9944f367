//! Analyzed relations handed to the planner.

use arrow_schema::DataType;
use nlq_common::{NlqError, Result};
use serde::{Deserialize, Serialize};

use crate::physical_plan::PhysicalPlan;
use crate::query_spec::QuerySpec;
use crate::symbol::{Reference, RelationName, Symbol, TableIdent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Catalog view of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub ident: TableIdent,
    pub columns: Vec<ColumnInfo>,
    /// Names of partition columns, empty for unpartitioned tables.
    pub partitioned_by: Vec<String>,
    pub primary_key: Vec<String>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partitioned_by.is_empty()
    }
}

/// Resolves table identifiers to their schema.
pub trait Catalog {
    fn table_info(&self, ident: &TableIdent) -> Result<TableInfo>;
}

/// A base table participating in a statement under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRelation {
    pub name: RelationName,
    pub table_info: TableInfo,
}

impl TableRelation {
    /// Look `ident` up in the catalog; `alias` defaults to the table name.
    pub fn resolve(catalog: &dyn Catalog, ident: &TableIdent, alias: Option<&str>) -> Result<Self> {
        let table_info = catalog.table_info(ident)?;
        let name = RelationName::new(alias.unwrap_or(&ident.name));
        Ok(Self { name, table_info })
    }

    /// Materialize a column of this relation as a [`Symbol::Reference`].
    pub fn reference(&self, column: &str) -> Result<Symbol> {
        if column == Reference::DOC_ID {
            return Ok(Symbol::Reference(self.doc_id()));
        }
        let info = self.table_info.column(column).ok_or_else(|| {
            NlqError::Planning(format!(
                "column '{column}' does not exist in table {}",
                self.table_info.ident
            ))
        })?;
        Ok(Symbol::Reference(Reference {
            relation: self.name.clone(),
            table: self.table_info.ident.clone(),
            column: info.name.clone(),
            value_type: info.data_type.clone(),
            partitioned: self.table_info.partitioned_by.contains(&info.name),
        }))
    }

    /// References to all declared columns, in declaration order (`select *`).
    pub fn all_columns(&self) -> Vec<Symbol> {
        self.table_info
            .columns
            .iter()
            .map(|c| {
                Symbol::Reference(Reference {
                    relation: self.name.clone(),
                    table: self.table_info.ident.clone(),
                    column: c.name.clone(),
                    value_type: c.data_type.clone(),
                    partitioned: self.table_info.partitioned_by.contains(&c.name),
                })
            })
            .collect()
    }

    pub fn doc_id(&self) -> Reference {
        Reference::doc_id(self.name.clone(), self.table_info.ident.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQueryRelation {
    pub name: RelationName,
    pub query_spec: QuerySpec,
}

/// Per-source rewrite of a base table produced while splitting a multi-source statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueriedTable {
    pub table: TableRelation,
    pub query_spec: QuerySpec,
    /// Symbols needed by the join itself (remaining predicate or order by);
    /// these must be collected directly and never deferred to a fetch phase.
    pub join_outputs: Vec<Symbol>,
}

impl QueriedTable {
    pub fn name(&self) -> &RelationName {
        &self.table.name
    }

    pub fn table_ident(&self) -> &TableIdent {
        &self.table.table_info.ident
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnalyzedRelation {
    Table(TableRelation),
    SubQuery(SubQueryRelation),
    Queried(QueriedTable),
    Planned(Box<PhysicalPlan>),
}

impl AnalyzedRelation {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalyzedRelation::Table(_) => "Table",
            AnalyzedRelation::SubQuery(_) => "SubQuery",
            AnalyzedRelation::Queried(_) => "Queried",
            AnalyzedRelation::Planned(_) => "Planned",
        }
    }

    pub fn as_planned(&self) -> Option<&PhysicalPlan> {
        match self {
            AnalyzedRelation::Planned(p) => Some(p),
            _ => None,
        }
    }
}

/// Statement selecting from two or more sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSourceSelect {
    /// Sources in declaration order.
    pub sources: Vec<(RelationName, AnalyzedRelation)>,
    pub query_spec: QuerySpec,
}

impl MultiSourceSelect {
    pub fn new(sources: Vec<(RelationName, AnalyzedRelation)>, query_spec: QuerySpec) -> Self {
        Self {
            sources,
            query_spec,
        }
    }

    /// Convenience constructor for a cross join over base tables.
    pub fn from_tables(tables: Vec<TableRelation>, query_spec: QuerySpec) -> Self {
        let sources = tables
            .into_iter()
            .map(|t| (t.name.clone(), AnalyzedRelation::Table(t)))
            .collect();
        Self::new(sources, query_spec)
    }

    pub fn position(&self, name: &RelationName) -> Option<usize> {
        self.sources.iter().position(|(n, _)| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneTable;

    impl Catalog for OneTable {
        fn table_info(&self, ident: &TableIdent) -> Result<TableInfo> {
            if ident.name != "parted" {
                return Err(NlqError::Planning(format!("unknown table {ident}")));
            }
            Ok(TableInfo {
                ident: ident.clone(),
                columns: vec![
                    ColumnInfo::new("id", DataType::Int64),
                    ColumnInfo::new("date", DataType::Int64),
                ],
                partitioned_by: vec!["date".to_string()],
                primary_key: vec!["id".to_string()],
            })
        }
    }

    #[test]
    fn resolves_aliases_and_partition_columns() {
        let rel = TableRelation::resolve(&OneTable, &TableIdent::new("doc", "parted"), Some("p"))
            .expect("resolve");
        assert_eq!(rel.name, RelationName::new("p"));
        let date = rel.reference("date").expect("date");
        let r = date.as_reference().expect("reference");
        assert!(r.partitioned);
        assert_eq!(r.relation, RelationName::new("p"));
        assert!(rel.reference("missing").is_err());
        assert_eq!(rel.all_columns().len(), 2);

        let err = TableRelation::resolve(&OneTable, &TableIdent::new("doc", "nope"), None)
            .expect_err("unknown table");
        assert!(err.to_string().contains("unknown table"));
    }
}
