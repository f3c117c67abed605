//! Trace records, spans, and the execution-context store.

pub mod context;
pub mod span;

use crate::ids::{self, TraceId};

/// A logical end-to-end operation: a trace id plus the sampling decision
/// made at its root. Immutable after creation and inherited by every span
/// in the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub trace_id: TraceId,
    pub sampled: bool,
}

impl Trace {
    /// Create a trace, generating the id when `trace_id` is absent or
    /// malformed and drawing the sampling decision from the active
    /// configuration when `sampled` is not supplied by an upstream caller.
    ///
    /// An explicit `sampled` flag, in either direction, is honored
    /// verbatim; there is no downstream re-sampling.
    pub fn new(trace_id: Option<&str>, sampled: Option<bool>) -> Self {
        Self::with_sample_rate(trace_id, sampled, crate::active_config().sample_rate)
    }

    /// As [`Trace::new`] with an explicit sample rate.
    pub fn with_sample_rate(
        trace_id: Option<&str>,
        sampled: Option<bool>,
        sample_rate: f64,
    ) -> Self {
        let trace_id = trace_id
            .and_then(TraceId::from_hex)
            .unwrap_or_else(TraceId::random);
        let sampled = sampled.unwrap_or_else(|| ids::random_unit() < sample_rate);
        Trace { trace_id, sampled }
    }
}
