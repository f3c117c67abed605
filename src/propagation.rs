//! W3C Trace Context propagation.
//!
//! Extraction parses the `traceparent` header (version `00` only) from an
//! incoming carrier; injection writes the current trace context onto an
//! outgoing one. Other W3C fields such as `tracestate` are ignored but not
//! rejected.

use crate::ids::{SpanId, TraceId};
use crate::trace::context;
use std::collections::HashMap;

/// The canonical header name, written lowercase on injection.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Header key spellings accepted on extraction, covering common
/// host-framework conventions.
const EXTRACT_KEYS: &[&str] = &["traceparent", "Traceparent", "HTTP_TRACEPARENT"];

const SUPPORTED_VERSION: &str = "00";

/// Trace-context metadata key on job payloads: the trace id.
pub const JOB_TRACE_ID_KEY: &str = "_miniapm_trace_id";
/// Trace-context metadata key on job payloads: the enqueuing span's id.
pub const JOB_PARENT_SPAN_ID_KEY: &str = "_miniapm_parent_span_id";
/// Trace-context metadata key on job payloads: the sampling decision.
pub const JOB_SAMPLED_KEY: &str = "_miniapm_sampled";

/// Read access to a propagation carrier (typically request headers).
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
}

/// Write access to a propagation carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(|v| v.as_str())
    }
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

/// A successfully extracted upstream trace context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: TraceId,
    pub parent_span_id: SpanId,
    pub sampled: bool,
}

/// Extract a W3C trace context from the carrier. Any malformation
/// (unsupported version, wrong field count, invalid ids or flags) yields
/// `None`.
pub fn extract(carrier: &dyn Extractor) -> Option<TraceParent> {
    let header = EXTRACT_KEYS.iter().find_map(|key| carrier.get(key))?;
    parse_traceparent(header.trim())
}

fn parse_traceparent(header: &str) -> Option<TraceParent> {
    let parts: Vec<&str> = header.split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    if parts[0] != SUPPORTED_VERSION {
        return None;
    }
    let trace_id = TraceId::from_hex(parts[1])?;
    let parent_span_id = SpanId::from_hex(parts[2])?;
    if parts[3].len() != 2 {
        return None;
    }
    let flags = u8::from_str_radix(parts[3], 16).ok()?;
    Some(TraceParent {
        trace_id,
        parent_span_id,
        sampled: flags & 0x01 != 0,
    })
}

/// Render a `traceparent` value for the given context.
pub fn format_traceparent(trace_id: TraceId, span_id: SpanId, sampled: bool) -> String {
    format!(
        "{}-{}-{}-{}",
        SUPPORTED_VERSION,
        trace_id,
        span_id,
        if sampled { "01" } else { "00" }
    )
}

/// Inject the current trace context into the carrier under the lowercase
/// `traceparent` key. Without a current trace and span, the carrier is
/// left unchanged.
pub fn inject(carrier: &mut dyn Injector) {
    let Some(trace) = context::current_trace() else {
        return;
    };
    let Some(span_id) = context::current_span_id() else {
        return;
    };
    carrier.set(
        TRACEPARENT_HEADER,
        format_traceparent(trace.trace_id, span_id, trace.sampled),
    );
}
