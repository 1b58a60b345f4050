//! Structured span definitions for tracing.

use std::time::Instant;

use tracing::{Level, Span, field, span};
use uuid::Uuid;

use crate::backend::PoolKey;

/// Span covering one façade call, with outcome fields filled on completion.
pub struct ExecuteSpan {
    span: Span,
    request_id: Uuid,
    start: Instant,
}

impl ExecuteSpan {
    pub fn new(tenant_id: &str, tier: &str, key: &PoolKey) -> Self {
        let request_id = Uuid::new_v4();
        let span = span!(
            Level::INFO,
            "governance.execute",
            request_id = %request_id,
            tenant_id = tenant_id,
            tier = tier,
            pool_key = %key,
            backend = key.backend.as_str(),
            outcome = field::Empty,
            duration_ms = field::Empty,
        );
        Self {
            span,
            request_id,
            start: Instant::now(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn finish(&self, outcome: &str) {
        self.span.record("outcome", outcome);
        self.span
            .record("duration_ms", self.start.elapsed().as_millis() as u64);
    }
}

/// Span for a background sweep pass.
pub fn sweep_span() -> Span {
    span!(
        Level::DEBUG,
        "governance.sweep",
        pools_evicted = field::Empty,
        pools_reaped = field::Empty,
        breakers_reaped = field::Empty,
    )
}
