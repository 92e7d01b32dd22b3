// SPDX-License-Identifier: Apache-2.0

//! Datasource engine: adapter protocol, registry, and backend drivers.

pub mod adapters;
pub mod conformance;
pub mod error;
pub mod registry;
pub mod traits;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use registry::AdapterRegistry;
pub use traits::DatasourceAdapter;
pub use types::{
    AdapterProfile, Capability, ColumnInfo, ConnectionConfig, CostEstimate, DryRunResult,
    QueryResult, Row, SchemaInfo, Value,
};
