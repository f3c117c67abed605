//! End-to-end tests of the global façade. These share process-wide state,
//! so each one holds the façade lock and tears the client down on exit.

mod common;

use common::{facade_lock, MockCollector};
use miniapm::error_event::ErrorReport;
use miniapm::trace::context;
use miniapm::{KeyValue, SpanCategory};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn configure_for(collector: &MockCollector, tweak: impl FnOnce(&mut miniapm::Config)) {
    miniapm::configure(|config| {
        *config = miniapm::Config {
            endpoint: collector.url(),
            api_key: Some("k".to_string()),
            service_name: "svc".to_string(),
            environment: "test".to_string(),
            batch_size: 1,
            flush_interval: Duration::from_millis(100),
            ..miniapm::Config::default()
        };
    });
    miniapm::configure(tweak);
}

#[test]
fn span_flows_through_global_pipeline() {
    let _guard = facade_lock();
    context::clear();
    let collector = MockCollector::start();
    configure_for(&collector, |_| {});
    miniapm::start().unwrap();
    assert!(miniapm::enabled());

    let mut observed_ids = None;
    let result = miniapm::span(
        "GET /cart",
        SpanCategory::HttpServer,
        vec![KeyValue::new("http.method", "GET")],
        || {
            observed_ids = Some((
                miniapm::current_trace_id().unwrap(),
                miniapm::current_span_id().unwrap(),
            ));
            "done"
        },
    );
    assert_eq!(result, "done");
    let (trace_id, span_id) = observed_ids.unwrap();
    assert_eq!(trace_id.len(), 32);
    assert_eq!(span_id.len(), 16);
    // The span is popped once the body returns.
    assert!(miniapm::current_span_id().is_none());

    miniapm::flush();
    let stats = miniapm::stats().unwrap();
    assert_eq!(stats.spans.enqueued, 1);
    assert_eq!(stats.spans.sent, 1);

    let requests = collector.requests();
    let request = &requests[0];
    assert_eq!(request.path, "/ingest/v1/traces");
    let body = request.json();
    let span_body = &body["resourceSpans"][0]["scopeSpans"][0]["spans"][0];
    assert_eq!(span_body["traceId"], trace_id);
    assert_eq!(span_body["spanId"], span_id);

    miniapm::stop();
    context::clear();
}

#[test]
fn nested_spans_share_trace_and_link_parents() {
    let _guard = facade_lock();
    context::clear();
    let collector = MockCollector::start();
    configure_for(&collector, |config| config.batch_size = 10);
    miniapm::start().unwrap();

    miniapm::span("GET /orders", SpanCategory::HttpServer, Vec::new(), || {
        miniapm::span("SELECT orders", SpanCategory::Db, Vec::new(), || {});
        miniapm::span("render", SpanCategory::View, Vec::new(), || {});
    });
    miniapm::flush();
    miniapm::stop();

    let mut spans = Vec::new();
    for request in collector.requests() {
        let body = request.json();
        for span in body["resourceSpans"][0]["scopeSpans"][0]["spans"]
            .as_array()
            .unwrap()
        {
            spans.push(span.clone());
        }
    }
    assert_eq!(spans.len(), 3);

    let trace_id = spans[0]["traceId"].as_str().unwrap();
    assert!(spans.iter().all(|s| s["traceId"] == trace_id));

    let root = spans
        .iter()
        .find(|s| s.get("parentSpanId").is_none())
        .expect("one root span");
    let children: Vec<_> = spans
        .iter()
        .filter(|s| s.get("parentSpanId").is_some())
        .collect();
    assert_eq!(children.len(), 2);
    for child in children {
        assert_eq!(child["parentSpanId"], root["spanId"]);
    }
    context::clear();
}

#[test]
fn unsampled_trace_bypasses_span_machinery() {
    let _guard = facade_lock();
    context::clear();
    let collector = MockCollector::start();
    configure_for(&collector, |config| config.sample_rate = 0.0);
    miniapm::start().unwrap();

    let ran = miniapm::span("GET /skip", SpanCategory::HttpServer, Vec::new(), || true);
    assert!(ran);
    assert!(miniapm::current_span_id().is_none());

    miniapm::flush();
    assert_eq!(miniapm::stats().unwrap().spans.enqueued, 0);
    assert_eq!(collector.hits(), 0);

    miniapm::stop();
    context::clear();
}

#[test]
fn before_send_can_drop_and_survives_panics() {
    let _guard = facade_lock();
    context::clear();
    let collector = MockCollector::start();
    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);
    configure_for(&collector, move |config| {
        config.before_send = Some(Arc::new(move |span: miniapm::Span| {
            let n = hook_calls.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => None,            // drop the first span
                1 => panic!("hook"),  // panic on the second; original proceeds
                _ => Some(span),
            }
        }));
    });
    miniapm::start().unwrap();

    miniapm::span("dropped", SpanCategory::Internal, Vec::new(), || {});
    context::clear();
    miniapm::span("panicked", SpanCategory::Internal, Vec::new(), || {});
    context::clear();
    miniapm::span("kept", SpanCategory::Internal, Vec::new(), || {});
    miniapm::flush();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let stats = miniapm::stats().unwrap();
    assert_eq!(stats.spans.enqueued, 2, "dropped span never enqueued");

    miniapm::stop();
    context::clear();
}

#[test]
fn record_error_respects_ignore_list_and_filters() {
    let _guard = facade_lock();
    context::clear();
    let collector = MockCollector::start();
    configure_for(&collector, |config| {
        config.ignored_exceptions.insert("Boring".to_string());
    });
    miniapm::start().unwrap();

    miniapm::record_error(ErrorReport::new("Boring", "ignored"));
    miniapm::record_error(
        ErrorReport::new("PaymentFailed", "card declined")
            .with_context("request_id", "req-9")
            .with_context("params", json!({"card": "4111", "password": "pw"})),
    );
    miniapm::flush();
    miniapm::stop();

    let requests = collector.requests();
    assert_eq!(requests.len(), 1);
    let body = requests[0].json();
    assert_eq!(requests[0].path, "/ingest/errors");
    assert_eq!(body["exception_class"], "PaymentFailed");
    assert_eq!(body["request_id"], "req-9");
    assert_eq!(body["params"]["password"], "[FILTERED]");
    assert_eq!(body["params"]["card"], "4111");
    context::clear();
}

#[test]
fn record_span_submits_externally_built_spans() {
    let _guard = facade_lock();
    context::clear();
    let collector = MockCollector::start();
    configure_for(&collector, |_| {});
    miniapm::start().unwrap();

    let span = miniapm::Span::build(
        "imported",
        "rake",
        Some("4bf92f3577b34da6a3ce929d0e0e4736"),
        None,
        Vec::new(),
    );
    miniapm::record_span(span);
    miniapm::flush();

    assert_eq!(miniapm::stats().unwrap().spans.sent, 1);
    let body = collector.requests()[0].json();
    let span_body = &body["resourceSpans"][0]["scopeSpans"][0]["spans"][0];
    assert_eq!(span_body["traceId"], "4bf92f3577b34da6a3ce929d0e0e4736");
    assert_eq!(span_body["kind"], 1);
    // record_span finishes unfinished spans before enqueueing.
    assert_ne!(span_body["endTimeUnixNano"], "0");

    miniapm::stop();
    context::clear();
}

#[test]
fn healthy_probes_health_endpoint() {
    let _guard = facade_lock();
    context::clear();
    let collector = MockCollector::start();
    configure_for(&collector, |_| {});
    miniapm::start().unwrap();

    assert!(miniapm::healthy());
    let requests = collector.requests();
    let request = &requests[0];
    assert_eq!(request.path, "/health");
    assert_eq!(request.method, "POST");
    assert_eq!(request.header("authorization"), Some("Bearer k"));

    assert!(miniapm::notify_deploy(miniapm::DeployEvent::new("deadbeef")));
    assert_eq!(collector.requests()[1].path, "/ingest/deploys");

    miniapm::stop();
    assert!(!miniapm::healthy(), "stopped client reports unhealthy");
    context::clear();
}

#[test]
fn start_rejects_invalid_configuration() {
    let _guard = facade_lock();
    miniapm::stop();
    miniapm::configure(|config| {
        *config = miniapm::Config {
            sample_rate: 7.0,
            ..miniapm::Config::default()
        };
    });
    let result = miniapm::start();
    assert!(matches!(result, Err(miniapm::Error::Config(_))));
    assert!(!miniapm::enabled());

    miniapm::configure(|config| config.sample_rate = 1.0);
}

#[test]
fn remote_unsampled_decision_is_honored() {
    let _guard = facade_lock();
    context::clear();
    let collector = MockCollector::start();
    configure_for(&collector, |config| config.sample_rate = 1.0);
    miniapm::start().unwrap();

    // Upstream said unsampled; local sample_rate must not override it.
    let trace = miniapm::Trace::with_sample_rate(None, Some(false), 1.0);
    context::with_trace(trace, || {
        miniapm::span("GET /downstream", SpanCategory::HttpServer, Vec::new(), || {});
    });
    miniapm::flush();
    assert_eq!(miniapm::stats().unwrap().spans.enqueued, 0);

    miniapm::stop();
    context::clear();
}
