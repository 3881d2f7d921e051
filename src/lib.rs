//! # Fishery data extraction engine
//!
//! Materializes fishing trip data into multi-sheet exports (TR, HH, SL, HL,
//! ST, RL...) under named, versioned formats such as RDB, COST or FREE1.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use extraction::prelude::*;
//!
//! let store = SqlStore::connect("postgres://localhost/sumaris", 5).await?;
//! let registry = extraction::builtin::registry()?;
//! let pipeline = Pipeline::new(&store, &registry, extraction::builtin::templates());
//!
//! let mut ctx = ExtractionContext::now();
//! pipeline.run(&mut ctx, &ExtractionFilter::new(), &FormatKey::new("RDB", "1.3")).await?;
//! // => sheets TR, HH, SL, HL registered in ctx
//! ```
//!
//! ## Template markup
//!
//! | Markup                         | Function                              |
//! |--------------------------------|---------------------------------------|
//! | `[[group:NAME]]...[[/group]]`  | Toggle-able fragment                  |
//! | `off`, `columns=a,b`           | Group disabled by default, its columns|
//! | `[[anchor:NAME]]`              | Injection point                       |
//! | `[[distinct]]`                 | `DISTINCT`, flags the sheet           |
//! | `&name`                        | Literal bind                          |

pub mod ast;
pub mod builtin;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod filter;
pub mod format;
pub mod loader;
pub mod parser;
pub mod pipeline;
pub mod template;
pub mod transpiler;

pub mod prelude {
    pub use crate::config::ExtractConfig;
    pub use crate::context::{ExtractionContext, SheetTable, StepReport, StepState};
    pub use crate::engine::{ColumnCatalog, SqlStore, StatementExecutor};
    pub use crate::error::*;
    pub use crate::filter::{
        ColumnMetadata, CriterionOperator, ExtractionFilter, FilterCriterion, LogicalOp, SqlType,
        TripFilter,
    };
    pub use crate::format::{FormatKey, FormatRegistry, FormatSpec};
    pub use crate::loader::{DirectoryLoader, MemoryLoader, TemplateLoader};
    pub use crate::pipeline::{CancelFlag, Pipeline, Planner};
    pub use crate::template::{CompiledQuery, Compiler, TemplateQuery};
    pub use crate::transpiler::ToSql;
}

/// Render the WHERE clause of `filter` for a table, as ` WHERE ...` or an
/// empty string.
///
/// # Example
///
/// ```
/// use extraction::prelude::*;
///
/// let columns = vec![
///     ColumnMetadata::new("id", SqlType::Integer),
///     ColumnMetadata::new("sex", SqlType::Varchar),
/// ];
/// let filter = ExtractionFilter::new()
///     .criterion(FilterCriterion::new("id", CriterionOperator::GreaterThanOrEquals).value("10"));
/// assert_eq!(extraction::where_clause(&columns, &filter, None).unwrap(), " WHERE id >= 10");
/// ```
pub fn where_clause(
    columns: &[filter::ColumnMetadata],
    filter: &filter::ExtractionFilter,
    sheet: Option<&str>,
) -> error::ExtractionResult<String> {
    transpiler::where_clause(columns, filter, sheet, None)
}
