// SPDX-License-Identifier: Apache-2.0

//! Concrete datasource adapters.
//!
//! Each backend implements [`crate::engine::traits::DatasourceAdapter`] and
//! must pass the conformance suite before the pipeline will dispatch to it.

pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use mssql::SqlServerAdapter;
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

use sqlparser::dialect::Dialect;
use sqlparser::parser::Parser;

use crate::engine::error::{EngineError, EngineResult};

/// Round-trips a statement through the backend dialect's parser.
///
/// The printed form is the normalized statement dry-run reports; a parse
/// failure here is a syntax error before the backend ever sees the text.
pub(crate) fn normalize_sql(dialect: &dyn Dialect, sql: &str) -> EngineResult<String> {
    let statements =
        Parser::parse_sql(dialect, sql).map_err(|e| EngineError::syntax_error(e.to_string()))?;
    if statements.is_empty() {
        return Err(EngineError::syntax_error("empty statement"));
    }
    Ok(statements
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("; "))
}
