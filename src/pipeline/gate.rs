// SPDX-License-Identifier: Apache-2.0

//! Security gate: read-only enforcement over the statement AST.
//!
//! Every generated statement passes through here before execution. The gate
//! fails safe: anything the parser cannot prove to be a single read-only
//! query is rejected, including statements that do not parse at all.

use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::warn;

use super::error::{ErrorCode, PipelineError};

const NODE: &str = "security_gate";

/// Rejects anything that is not a single read-only query.
pub fn enforce_read_only(sql: &str) -> Result<(), PipelineError> {
    let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            warn!(error = %e, "unparseable statement rejected");
            return Err(violation(format!("statement does not parse: {e}")));
        }
    };

    match statements.as_slice() {
        [] => Err(violation("empty statement")),
        [stmt] => check_statement(stmt),
        _ => Err(violation("multiple statements in one submission")),
    }
}

fn check_statement(stmt: &Statement) -> Result<(), PipelineError> {
    match stmt {
        Statement::Query(query) => check_query(query),
        other => Err(violation(format!(
            "write or DDL statement rejected: {}",
            statement_kind(other)
        ))),
    }
}

fn check_query(query: &Query) -> Result<(), PipelineError> {
    if let Some(ref with) = query.with {
        for cte in &with.cte_tables {
            check_query(&cte.query)?;
        }
    }
    check_set_expr(&query.body)
}

fn check_set_expr(body: &SetExpr) -> Result<(), PipelineError> {
    match body {
        SetExpr::Select(select) => {
            // SELECT ... INTO writes a new table.
            if select.into.is_some() {
                return Err(violation("SELECT INTO rejected"));
            }
            Ok(())
        }
        SetExpr::Query(inner) => check_query(inner),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left)?;
            check_set_expr(right)
        }
        // VALUES, embedded INSERT/UPDATE/DELETE, and any body shape added by
        // future parser versions are all rejected unseen.
        _ => Err(violation("non-SELECT query body rejected")),
    }
}

fn statement_kind(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        _ => "non-query statement",
    }
}

fn violation(message: impl Into<String>) -> PipelineError {
    PipelineError::new(NODE, ErrorCode::SecurityViolation, message)
}
