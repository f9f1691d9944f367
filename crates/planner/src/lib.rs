//! Physical planning of multi-relation statements.
//!
//! Analyzed statements come in as [`MultiSourceSelect`]; the
//! [`CrossJoinPlanner`] splits them per source, lets a [`RelationPlanner`]
//! plan every base table, and combines the results into a left-deep tree of
//! nested loops whose merge stages run positional [`Projection`]s.

pub mod context;
pub mod explain;
pub mod join_planner;
pub mod physical_plan;
pub mod projection;
pub mod query_spec;
pub mod relation;
pub mod rewriter;
pub mod splitter;
pub mod symbol;

pub use context::*;
pub use explain::*;
pub use join_planner::*;
pub use physical_plan::*;
pub use projection::*;
pub use query_spec::*;
pub use relation::*;
pub use rewriter::*;
pub use splitter::*;
pub use symbol::*;
