// SPDX-License-Identifier: Apache-2.0

//! Per-request identity and cancellation.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Travels with a request through every stage. The trace id tags all log
/// events for the request; the token aborts in-flight stage work when the
/// caller gives up.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub tenant_id: String,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Requests cooperative shutdown of all work running under this context.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
