//! The span model: a timed unit of work within a trace.
//!
//! Spans are created with their start time set, mutated through attribute,
//! event, and status operations, finished, and finally serialized into the
//! OTLP-JSON span object the collector ingests. Every cap is enforced at
//! mutation time; offending writes are dropped or truncated, never errors.

use crate::error_event::ErrorReport;
use crate::ids::{SpanId, TraceId};
use crate::semconv;
use crate::trace::{context, Trace};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum number of attributes per span.
pub const MAX_ATTRIBUTES_PER_SPAN: usize = 128;
/// Maximum number of events per span.
pub const MAX_EVENTS_PER_SPAN: usize = 128;
/// Maximum number of attributes per event.
pub const MAX_ATTRIBUTES_PER_EVENT: usize = 32;
/// Maximum attribute key length in characters.
pub const MAX_KEY_LEN: usize = 128;
/// Maximum string attribute value length in characters.
pub const MAX_VALUE_LEN: usize = 4096;
/// Maximum array attribute length.
pub const MAX_ARRAY_LEN: usize = 32;
/// Maximum span name length in characters.
pub const MAX_NAME_LEN: usize = 256;
/// Backtrace lines recorded on an exception event.
const EXCEPTION_STACKTRACE_LINES: usize = 30;

/// Wall-clock nanoseconds since the Unix epoch.
pub(crate) fn now_unix_nano() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// The broad category of work a span represents. Unknown category names
/// parse as [`SpanCategory::Internal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanCategory {
    HttpServer,
    HttpClient,
    Db,
    View,
    Search,
    Job,
    Rake,
    Cache,
    Internal,
}

impl SpanCategory {
    pub fn parse(s: &str) -> Self {
        match s {
            "http_server" => SpanCategory::HttpServer,
            "http_client" => SpanCategory::HttpClient,
            "db" => SpanCategory::Db,
            "view" => SpanCategory::View,
            "search" => SpanCategory::Search,
            "job" => SpanCategory::Job,
            "rake" => SpanCategory::Rake,
            "cache" => SpanCategory::Cache,
            _ => SpanCategory::Internal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpanCategory::HttpServer => "http_server",
            SpanCategory::HttpClient => "http_client",
            SpanCategory::Db => "db",
            SpanCategory::View => "view",
            SpanCategory::Search => "search",
            SpanCategory::Job => "job",
            SpanCategory::Rake => "rake",
            SpanCategory::Cache => "cache",
            SpanCategory::Internal => "internal",
        }
    }

    /// The OTLP span kind this category maps to.
    pub fn kind(&self) -> SpanKind {
        match self {
            SpanCategory::HttpServer => SpanKind::Server,
            SpanCategory::HttpClient | SpanCategory::Db | SpanCategory::Search => SpanKind::Client,
            SpanCategory::Job => SpanKind::Consumer,
            SpanCategory::View
            | SpanCategory::Cache
            | SpanCategory::Rake
            | SpanCategory::Internal => SpanKind::Internal,
        }
    }
}

/// OTLP span kind with its protocol-level numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SpanKind {
    Internal = 1,
    Server = 2,
    Client = 3,
    Consumer = 5,
}

/// Span status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum StatusCode {
    #[default]
    Unset = 0,
    Ok = 1,
    Error = 2,
}

/// An attribute value: a tagged scalar, an array, or null. Mappings and
/// other shapes are stringified on conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    I64(i64),
    F64(f64),
    Bool(bool),
    Array(Vec<Value>),
    Null,
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I64(v as i64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::I64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Array(values.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::I64(i)
                } else if let Some(f) = n.as_f64() {
                    Value::F64(f)
                } else {
                    Value::String(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            object @ serde_json::Value::Object(_) => Value::String(object.to_string()),
        }
    }
}

/// A key/value attribute pair.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A timestamped event recorded on a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nano: u64,
    pub attributes: Vec<KeyValue>,
}

/// Single operation within a trace.
#[derive(Debug, Clone)]
pub struct Span {
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    name: String,
    category: SpanCategory,
    start_time_unix_nano: u64,
    end_time_unix_nano: Option<u64>,
    attributes: Vec<KeyValue>,
    events: Vec<SpanEvent>,
    status: StatusCode,
    status_message: Option<String>,
    dropped_attributes: u32,
    dropped_events: u32,
}

impl Span {
    /// Core constructor with already-validated identifiers.
    pub fn start(
        name: &str,
        category: SpanCategory,
        trace_id: TraceId,
        parent_span_id: Option<SpanId>,
        attributes: Vec<KeyValue>,
    ) -> Self {
        let mut span = Span {
            trace_id,
            span_id: SpanId::random(),
            parent_span_id,
            name: truncate_chars(name, MAX_NAME_LEN),
            category,
            start_time_unix_nano: now_unix_nano(),
            end_time_unix_nano: None,
            attributes: Vec::new(),
            events: Vec::new(),
            status: StatusCode::Unset,
            status_message: None,
            dropped_attributes: 0,
            dropped_events: 0,
        };
        for kv in attributes {
            span.add_attribute(kv.key, kv.value);
        }
        span
    }

    /// Validating constructor over raw identifier strings: a malformed
    /// parent id becomes absent, a malformed or missing trace id is
    /// regenerated, and an unknown category falls back to `internal`.
    pub fn build(
        name: &str,
        category: &str,
        trace_id: Option<&str>,
        parent_span_id: Option<&str>,
        attributes: Vec<KeyValue>,
    ) -> Self {
        let trace_id = trace_id
            .and_then(TraceId::from_hex)
            .unwrap_or_else(TraceId::random);
        let parent = parent_span_id.and_then(SpanId::from_hex);
        Span::start(name, SpanCategory::parse(category), trace_id, parent, attributes)
    }

    /// Start a root span under a fresh trace and make that trace current.
    /// Used when no incoming context exists.
    pub fn new_root(name: &str, category: SpanCategory, attributes: Vec<KeyValue>) -> Self {
        let trace = Trace::new(None, None);
        let trace_id = trace.trace_id;
        context::set_current_trace(trace);
        Span::start(name, category, trace_id, None, attributes)
    }

    /// Start a child of this span.
    pub fn child(&self, name: &str, category: SpanCategory, attributes: Vec<KeyValue>) -> Self {
        Span::start(name, category, self.trace_id, Some(self.span_id), attributes)
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> SpanCategory {
        self.category
    }

    pub fn kind(&self) -> SpanKind {
        self.category.kind()
    }

    pub fn start_time_unix_nano(&self) -> u64 {
        self.start_time_unix_nano
    }

    pub fn end_time_unix_nano(&self) -> Option<u64> {
        self.end_time_unix_nano
    }

    pub fn attributes(&self) -> &[KeyValue] {
        &self.attributes
    }

    pub fn events(&self) -> &[SpanEvent] {
        &self.events
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Attributes rejected by the per-span cap.
    pub fn dropped_attributes(&self) -> u32 {
        self.dropped_attributes
    }

    /// Events rejected by the per-span cap.
    pub fn dropped_events(&self) -> u32 {
        self.dropped_events
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.status == StatusCode::Error
    }

    pub fn is_finished(&self) -> bool {
        self.end_time_unix_nano.is_some()
    }

    /// Stamp the end time. Idempotent: the first finish wins, and the end
    /// time never precedes the start time.
    pub fn finish(&mut self) {
        if self.end_time_unix_nano.is_none() {
            self.end_time_unix_nano = Some(now_unix_nano().max(self.start_time_unix_nano));
        }
    }

    /// Set an attribute, replacing an existing value under the same key.
    /// Writes beyond the attribute cap are silently dropped; keys and
    /// values are truncated to their limits.
    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = truncate_chars(&key.into(), MAX_KEY_LEN);
        let value = sanitize_value(value.into());
        if let Some(existing) = self.attributes.iter_mut().find(|kv| kv.key == key) {
            existing.value = value;
        } else if self.attributes.len() < MAX_ATTRIBUTES_PER_SPAN {
            self.attributes.push(KeyValue { key, value });
        } else {
            self.dropped_attributes += 1;
        }
    }

    /// Record an event at the current time, obeying the event and
    /// event-attribute caps.
    pub fn add_event(&mut self, name: &str, attributes: Vec<KeyValue>) {
        if self.events.len() >= MAX_EVENTS_PER_SPAN {
            self.dropped_events += 1;
            return;
        }
        let attributes = attributes
            .into_iter()
            .take(MAX_ATTRIBUTES_PER_EVENT)
            .map(|kv| KeyValue {
                key: truncate_chars(&kv.key, MAX_KEY_LEN),
                value: sanitize_value(kv.value),
            })
            .collect();
        self.events.push(SpanEvent {
            name: truncate_chars(name, MAX_NAME_LEN),
            time_unix_nano: now_unix_nano(),
            attributes,
        });
    }

    /// Mark the span failed with the exception's message and record an
    /// `exception` event carrying type, message, and the leading backtrace.
    pub fn record_exception(&mut self, report: &ErrorReport) {
        self.set_error(Some(&report.message));
        let stacktrace = report
            .backtrace
            .iter()
            .take(EXCEPTION_STACKTRACE_LINES)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        self.add_event(
            "exception",
            vec![
                KeyValue::new(semconv::EXCEPTION_TYPE, report.exception_class.as_str()),
                KeyValue::new(semconv::EXCEPTION_MESSAGE, report.message.as_str()),
                KeyValue::new(semconv::EXCEPTION_STACKTRACE, stacktrace),
            ],
        );
    }

    /// Set the status to ERROR with an optional message.
    pub fn set_error(&mut self, message: Option<&str>) {
        self.status = StatusCode::Error;
        self.status_message = message.map(|m| truncate_chars(m, MAX_VALUE_LEN));
    }

    /// Set the status to OK, clearing any status message.
    pub fn set_ok(&mut self) {
        self.status = StatusCode::Ok;
        self.status_message = None;
    }

    /// Serialize into the OTLP-JSON span object. An unfinished span
    /// reports its start time as the end time.
    pub fn to_otlp(&self) -> OtlpSpan {
        OtlpSpan {
            trace_id: self.trace_id.to_string(),
            span_id: self.span_id.to_string(),
            parent_span_id: self.parent_span_id.map(|id| id.to_string()),
            name: self.name.clone(),
            kind: self.kind() as i32,
            start_time_unix_nano: self.start_time_unix_nano.to_string(),
            end_time_unix_nano: self
                .end_time_unix_nano
                .unwrap_or(self.start_time_unix_nano)
                .to_string(),
            attributes: self.attributes.iter().map(OtlpKeyValue::from).collect(),
            events: self.events.iter().map(OtlpEvent::from).collect(),
            status: OtlpStatus {
                code: self.status as i32,
                message: self.status_message.clone(),
            },
        }
    }
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_chars(&s, MAX_VALUE_LEN)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .take(MAX_ARRAY_LEN)
                .map(sanitize_value)
                .collect(),
        ),
        other => other,
    }
}

// OTLP/HTTP JSON wire types, matching the protobuf JSON mapping the
// collector deserializes.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpSpan {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: i32,
    pub start_time_unix_nano: String,
    pub end_time_unix_nano: String,
    pub attributes: Vec<OtlpKeyValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<OtlpEvent>,
    pub status: OtlpStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtlpKeyValue {
    pub key: String,
    pub value: OtlpValue,
}

impl From<&KeyValue> for OtlpKeyValue {
    fn from(kv: &KeyValue) -> Self {
        OtlpKeyValue {
            key: kv.key.clone(),
            value: OtlpValue::from(&kv.value),
        }
    }
}

impl OtlpKeyValue {
    pub fn string(key: &str, value: impl Into<String>) -> Self {
        OtlpKeyValue {
            key: key.to_string(),
            value: OtlpValue {
                string_value: Some(value.into()),
                ..OtlpValue::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub int_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub double_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array_value: Option<OtlpArrayValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtlpArrayValue {
    pub values: Vec<OtlpValue>,
}

impl From<&Value> for OtlpValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => OtlpValue {
                string_value: Some(s.clone()),
                ..OtlpValue::default()
            },
            Value::I64(i) => OtlpValue {
                int_value: Some(i.to_string()),
                ..OtlpValue::default()
            },
            Value::F64(f) => OtlpValue {
                double_value: Some(*f),
                ..OtlpValue::default()
            },
            Value::Bool(b) => OtlpValue {
                bool_value: Some(*b),
                ..OtlpValue::default()
            },
            Value::Array(items) => OtlpValue {
                array_value: Some(OtlpArrayValue {
                    values: items.iter().map(OtlpValue::from).collect(),
                }),
                ..OtlpValue::default()
            },
            Value::Null => OtlpValue {
                string_value: Some(String::new()),
                ..OtlpValue::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpEvent {
    pub name: String,
    pub time_unix_nano: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<OtlpKeyValue>,
}

impl From<&SpanEvent> for OtlpEvent {
    fn from(event: &SpanEvent) -> Self {
        OtlpEvent {
            name: event.name.clone(),
            time_unix_nano: event.time_unix_nano.to_string(),
            attributes: event.attributes.iter().map(OtlpKeyValue::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OtlpStatus {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
