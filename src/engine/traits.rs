// SPDX-License-Identifier: Apache-2.0

//! DatasourceAdapter trait definition
//!
//! This is the core abstraction every database backend implements. The
//! pipeline only ever talks to a backend through this surface, and the
//! conformance suite in [`crate::engine::conformance`] is the acceptance bar
//! any new implementation must pass.
//!
//! ## Connection model
//!
//! `connect` establishes the backing pool once at registration time. Every
//! subsequent call acquires its own scoped connection from that pool and
//! releases it on all exit paths; callers must never assume the adapter is
//! holding a connection open between calls.

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::engine::types::{
    Capability, ConnectionConfig, DryRunResult, QueryResult, SchemaInfo,
};

/// Core trait that all datasource adapters must implement
#[async_trait]
pub trait DatasourceAdapter: Send + Sync {
    /// Returns the datasource id this adapter instance is registered under
    fn adapter_id(&self) -> &str;

    /// Returns a human-readable backend name (e.g. "PostgreSQL")
    fn adapter_name(&self) -> &'static str;

    /// Static capability declaration used by the executor registry
    fn capabilities(&self) -> &[Capability];

    /// Establishes backend connectivity (creates the connection pool).
    ///
    /// Fails with a connection-class error on an unreachable or unauthorized
    /// backend.
    async fn connect(&self, config: &ConnectionConfig) -> EngineResult<()>;

    /// Closes the pool and releases associated resources
    async fn disconnect(&self) -> EngineResult<()>;

    /// Runs a statement on a scoped connection and returns the result.
    ///
    /// The statement is forwarded verbatim; the adapter never rewrites it.
    async fn execute(&self, sql: &str) -> EngineResult<QueryResult>;

    /// Validates a statement without executing it, returning the normalized
    /// statement plus a planner cost estimate.
    async fn dry_run(&self, sql: &str) -> EngineResult<DryRunResult>;

    /// Reports tables, columns, and relationships for schema retrieval
    async fn introspect_schema(&self) -> EngineResult<SchemaInfo>;
}
