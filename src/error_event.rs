//! Error reports: capture, fingerprinting, and serialization.
//!
//! An [`ErrorReport`] is the raw material a caller hands over; an
//! [`ErrorEvent`] is the immutable snapshot that gets exported. The
//! fingerprint identifies "the same" error across varying dynamic details:
//! ids, UUIDs, and quoted fragments in the message are normalized away
//! before hashing.

use crate::filter::{self, FilterPattern};
use crate::trace::span::truncate_chars;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Maximum stored message length; longer messages get a `...` suffix.
pub const MAX_MESSAGE_LEN: usize = 10_000;
/// Maximum number of stored backtrace entries.
pub const MAX_BACKTRACE_LINES: usize = 50;
/// Normalized-message length used for fingerprinting.
const FINGERPRINT_MESSAGE_LEN: usize = 200;
/// Hex characters kept from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 32;

static UUID_RE: OnceLock<Regex> = OnceLock::new();
static DIGITS_RE: OnceLock<Regex> = OnceLock::new();
static SINGLE_QUOTED_RE: OnceLock<Regex> = OnceLock::new();
static DOUBLE_QUOTED_RE: OnceLock<Regex> = OnceLock::new();

fn uuid_re() -> &'static Regex {
    UUID_RE.get_or_init(|| {
        Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
            .expect("uuid regex")
    })
}

fn digits_re() -> &'static Regex {
    DIGITS_RE.get_or_init(|| Regex::new(r"\d+").expect("digits regex"))
}

fn single_quoted_re() -> &'static Regex {
    SINGLE_QUOTED_RE.get_or_init(|| Regex::new(r"'[^']*'").expect("single-quote regex"))
}

fn double_quoted_re() -> &'static Regex {
    DOUBLE_QUOTED_RE.get_or_init(|| Regex::new(r#""[^"]*""#).expect("double-quote regex"))
}

/// Raw error material submitted by a caller or an instrumentation adapter.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub exception_class: String,
    pub message: String,
    pub backtrace: Vec<String>,
    /// Free-form context; `request_id`, `user_id`, and `params` keys are
    /// given dedicated treatment, the rest is carried verbatim.
    pub context: Map<String, Value>,
}

impl ErrorReport {
    pub fn new(exception_class: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorReport {
            exception_class: exception_class.into(),
            message: message.into(),
            backtrace: Vec::new(),
            context: Map::new(),
        }
    }

    /// Build a report from a typed error, using the type's name as the
    /// exception class.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let class = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error");
        ErrorReport::new(class, error.to_string())
    }

    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// An immutable error snapshot, ready for export.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub exception_class: String,
    pub message: String,
    pub backtrace: Vec<String>,
    pub fingerprint: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

fn serialize_timestamp<S: serde::Serializer>(
    timestamp: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
}

impl ErrorEvent {
    /// Construct an event from a report, applying message truncation, the
    /// backtrace cap, fingerprinting, and parameter filtering.
    pub fn new(report: ErrorReport, filters: &[FilterPattern]) -> Self {
        let ErrorReport {
            exception_class,
            message,
            backtrace,
            mut context,
        } = report;

        let truncated_message = if message.chars().count() > MAX_MESSAGE_LEN {
            format!("{}...", truncate_chars(&message, MAX_MESSAGE_LEN))
        } else {
            message.clone()
        };
        let backtrace: Vec<String> = backtrace.into_iter().take(MAX_BACKTRACE_LINES).collect();
        let fingerprint = compute_fingerprint(&exception_class, &message, &backtrace);

        let request_id = match context.remove("request_id") {
            Some(Value::String(s)) => Some(s),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let user_id = match context.remove("user_id") {
            Some(Value::String(s)) => Some(s),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let params = context
            .remove("params")
            .and_then(|p| filter::filter_params(&p, filters));

        ErrorEvent {
            exception_class,
            message: truncated_message,
            backtrace,
            fingerprint,
            timestamp: Utc::now(),
            request_id,
            user_id,
            params,
            context,
        }
    }
}

/// Derive the grouping fingerprint: SHA-256 over the exception class, the
/// normalized message, and the first application backtrace frame, cut to
/// 32 hex characters.
pub fn compute_fingerprint(exception_class: &str, message: &str, backtrace: &[String]) -> String {
    let mut parts = vec![exception_class.to_string(), normalize_message(message)];
    if let Some(frame) = app_frame(backtrace) {
        parts.push(frame.to_string());
    }
    let digest = Sha256::digest(parts.join("\n").as_bytes());
    let mut hex = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Strip dynamic details from a message so equivalent errors hash alike.
/// UUIDs are collapsed before digit runs so their hex segments do not
/// decay into `N` placeholders first.
fn normalize_message(message: &str) -> String {
    let normalized = uuid_re().replace_all(message, "UUID");
    let normalized = digits_re().replace_all(&normalized, "N");
    let normalized = single_quoted_re().replace_all(&normalized, "'X'");
    let normalized = double_quoted_re().replace_all(&normalized, "\"X\"");
    truncate_chars(&normalized, FINGERPRINT_MESSAGE_LEN)
}

/// The first backtrace entry that points at application code rather than
/// runtime or dependency internals.
fn app_frame(backtrace: &[String]) -> Option<&String> {
    backtrace.iter().find(|line| {
        !line.contains("/gems/")
            && !line.contains("/ruby/")
            && !line.contains("/vendor/")
            && !line.starts_with('<')
    })
}
