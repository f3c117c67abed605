//! # miniapm
//!
//! Embeddable APM client: web applications and background workers use it to
//! emit distributed traces and error reports to a miniapm collector.
//!
//! The crate provides four cooperating pieces: execution-context-local
//! trace propagation (W3C `traceparent`), a span model with OTLP-JSON
//! serialization, an error-event model with fingerprinting and parameter
//! filtering, and an asynchronous batching transport. Telemetry is enqueued
//! and shipped in the background; the caller's critical path never blocks
//! on the network, and telemetry failures are never raised into the host
//! application.
//!
//! ```no_run
//! use miniapm::{SpanCategory, KeyValue};
//!
//! miniapm::configure(|config| {
//!     config.endpoint = "http://collector:3000".to_string();
//!     config.api_key = Some("secret".to_string());
//!     config.service_name = "checkout".to_string();
//! });
//! miniapm::start().expect("valid configuration");
//!
//! let total = miniapm::span(
//!     "GET /cart",
//!     SpanCategory::HttpServer,
//!     vec![KeyValue::new("http.method", "GET")],
//!     || 42,
//! );
//! # let _ = total;
//!
//! miniapm::stop();
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod error_event;
pub mod export;
pub mod filter;
mod ids;
pub mod propagation;
pub mod semconv;
pub mod trace;

pub use batch::{KindStats, Stats};
pub use config::Config;
pub use error::Error;
pub use error_event::{ErrorEvent, ErrorReport};
pub use export::DeployEvent;
pub use filter::FilterPattern;
pub use ids::{SpanId, TraceId};
pub use trace::span::{KeyValue, Span, SpanCategory, SpanKind, StatusCode, Value};
pub use trace::Trace;

use crate::batch::BatchSender;
use crate::export::{ErrorExporter, HttpTransport, OtlpExporter};
use crate::trace::context;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::warn;

struct Client {
    config: Arc<Config>,
    sender: BatchSender,
    transport: Arc<HttpTransport>,
}

fn config_cell() -> &'static RwLock<Arc<Config>> {
    static CELL: OnceLock<RwLock<Arc<Config>>> = OnceLock::new();
    CELL.get_or_init(|| RwLock::new(Arc::new(Config::default())))
}

fn client_cell() -> &'static RwLock<Option<Arc<Client>>> {
    static CELL: OnceLock<RwLock<Option<Arc<Client>>>> = OnceLock::new();
    CELL.get_or_init(|| RwLock::new(None))
}

fn current_client() -> Option<Arc<Client>> {
    client_cell()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Snapshot of the active configuration: the running client's if started,
/// the pending one otherwise.
pub(crate) fn active_config() -> Arc<Config> {
    if let Some(client) = current_client() {
        return Arc::clone(&client.config);
    }
    config_cell()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Mutate the pending configuration. Takes effect at the next [`start`].
pub fn configure(f: impl FnOnce(&mut Config)) {
    let mut guard = config_cell().write().unwrap_or_else(|e| e.into_inner());
    let mut config = (**guard).clone();
    f(&mut config);
    *guard = Arc::new(config);
}

/// Validate the configuration and start the background sender. Idempotent;
/// a second call while started is a no-op.
pub fn start() -> Result<(), Error> {
    let mut slot = client_cell().write().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return Ok(());
    }

    let config = config_cell()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    config.validate()?;

    let transport = Arc::new(HttpTransport::new()?);
    let sender = BatchSender::start(
        &config,
        OtlpExporter::new(&config, Arc::clone(&transport)),
        ErrorExporter::new(&config, Arc::clone(&transport)),
    );
    *slot = Some(Arc::new(Client {
        config,
        sender,
        transport,
    }));
    Ok(())
}

/// Stop the background sender, flushing queued telemetry first.
/// Idempotent.
pub fn stop() {
    let client = client_cell()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(client) = client {
        client.sender.stop();
    }
}

/// Whether the client is started and not globally disabled.
pub fn enabled() -> bool {
    current_client().map(|c| c.config.enabled).unwrap_or(false)
}

/// Run `f` inside a span.
///
/// Creates a child of the current span, or a root span (allocating a
/// trace if none is current). When the client is not started, disabled, or
/// the current trace is unsampled, `f` runs untouched with no span
/// overhead. The span is finished and enqueued when `f` returns; if `f`
/// unwinds, the context stack is restored and the panic resumes.
pub fn span<T>(
    name: &str,
    category: SpanCategory,
    attributes: Vec<KeyValue>,
    f: impl FnOnce() -> T,
) -> T {
    let Some(client) = current_client() else {
        return f();
    };
    if !client.config.enabled {
        return f();
    }

    let trace = match context::current_trace() {
        Some(trace) => trace,
        None => {
            let trace = Trace::new(None, None);
            context::set_current_trace(trace.clone());
            trace
        }
    };
    if !trace.sampled {
        return f();
    }

    let span = Span::start(
        name,
        category,
        trace.trace_id,
        context::current_span_id(),
        attributes,
    );
    let (span, value) = context::with_span(span, f);
    if let Some(mut span) = span {
        span.finish();
        client.submit(span);
    }
    value
}

/// Submit an externally constructed span, finishing it if needed.
pub fn record_span(mut span: Span) {
    let Some(client) = current_client() else {
        return;
    };
    if !client.config.enabled {
        return;
    }
    span.finish();
    client.submit(span);
}

/// Submit an error report. Classes listed in `ignored_exceptions` are
/// skipped; parameters are filtered before the event is enqueued.
pub fn record_error(report: ErrorReport) {
    let Some(client) = current_client() else {
        return;
    };
    if !client.config.enabled {
        return;
    }
    if client
        .config
        .ignored_exceptions
        .contains(&report.exception_class)
    {
        return;
    }
    let event = ErrorEvent::new(report, &client.config.filter_parameters);
    client.sender.enqueue_error(event);
}

/// The current trace id as lowercase hex, if a trace is active.
pub fn current_trace_id() -> Option<String> {
    context::current_trace_id().map(|id| id.to_string())
}

/// The innermost active span's id as lowercase hex.
pub fn current_span_id() -> Option<String> {
    context::current_span_id().map(|id| id.to_string())
}

/// Flush queued telemetry, blocking up to five seconds.
pub fn flush() {
    if let Some(client) = current_client() {
        client.sender.flush();
    }
}

/// Counter snapshot from the running sender.
pub fn stats() -> Option<Stats> {
    current_client().map(|c| c.sender.stats())
}

/// Probe the collector's health endpoint with the configured credentials.
/// Blocks for at most the transport timeouts.
pub fn healthy() -> bool {
    let Some(client) = current_client() else {
        return false;
    };
    let url = format!("{}/health", client.config.endpoint_base());
    let headers: Vec<(&str, String)> = client
        .config
        .api_key
        .iter()
        .map(|key| ("Authorization", format!("Bearer {key}")))
        .collect();
    client
        .transport
        .post_raw(&url, String::new(), &headers)
        .success
}

/// Report a deploy marker to the collector. Returns whether the collector
/// accepted it.
pub fn notify_deploy(deploy: DeployEvent) -> bool {
    let Some(client) = current_client() else {
        return false;
    };
    ErrorExporter::new(&client.config, Arc::clone(&client.transport))
        .notify_deploy(&deploy)
        .map(|r| r.success)
        .unwrap_or(false)
}

impl Client {
    /// Apply `before_send` and enqueue. Hook panics are caught and logged;
    /// the original span proceeds. A hook returning `None` drops the span.
    fn submit(&self, span: Span) {
        let span = match &self.config.before_send {
            Some(hook) => {
                let candidate = span.clone();
                match catch_unwind(AssertUnwindSafe(|| hook(candidate))) {
                    Ok(Some(mutated)) => mutated,
                    Ok(None) => return,
                    Err(_) => {
                        warn!("before_send hook panicked; using original span");
                        span
                    }
                }
            }
            None => span,
        };
        self.sender.enqueue_span(span);
    }
}
