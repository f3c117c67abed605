//! OTLP-JSON trace exporter.
//!
//! Wraps a span batch in the `resourceSpans` envelope the collector's
//! `/ingest/v1/traces` route deserializes, stamping the configured resource
//! attributes and the instrumentation scope.

use crate::config::Config;
use crate::export::http::{HttpTransport, TransportResponse};
use crate::semconv;
use crate::trace::span::{OtlpKeyValue, OtlpSpan, Span};
use serde::Serialize;
use std::sync::Arc;

pub(crate) const SCOPE_NAME: &str = "miniapm-rust";
pub(crate) const SCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceRequest {
    resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans {
    resource: Resource,
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Serialize)]
struct Resource {
    attributes: Vec<OtlpKeyValue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScopeSpans {
    scope: Scope,
    spans: Vec<OtlpSpan>,
}

#[derive(Debug, Serialize)]
struct Scope {
    name: &'static str,
    version: &'static str,
}

/// Exports span batches to the collector's trace-ingest endpoint.
#[derive(Debug)]
pub struct OtlpExporter {
    transport: Arc<HttpTransport>,
    url: String,
    api_key: Option<String>,
    resource: Vec<OtlpKeyValue>,
}

impl OtlpExporter {
    pub fn new(config: &Config, transport: Arc<HttpTransport>) -> Self {
        OtlpExporter {
            transport,
            url: format!("{}/ingest/v1/traces", config.endpoint_base()),
            api_key: config.api_key.clone(),
            resource: resource_attributes(config),
        }
    }

    /// POST a batch. Returns `None` without doing anything when no API key
    /// is configured or the batch is empty.
    pub fn export(&self, spans: &[Span]) -> Option<TransportResponse> {
        let api_key = self.api_key.as_ref()?;
        if spans.is_empty() {
            return None;
        }

        let request = TraceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Resource {
                    attributes: self.resource.clone(),
                },
                scope_spans: vec![ScopeSpans {
                    scope: Scope {
                        name: SCOPE_NAME,
                        version: SCOPE_VERSION,
                    },
                    spans: spans.iter().map(Span::to_otlp).collect(),
                }],
            }],
        };

        let auth = ("Authorization", format!("Bearer {api_key}"));
        Some(self.transport.post_json(&self.url, &request, &[auth]))
    }
}

/// Resource attributes reported with every batch. All values are encoded
/// as strings.
fn resource_attributes(config: &Config) -> Vec<OtlpKeyValue> {
    let mut attributes = vec![
        OtlpKeyValue::string(semconv::SERVICE_NAME, config.service_name.clone()),
        OtlpKeyValue::string(semconv::DEPLOYMENT_ENVIRONMENT, config.environment.clone()),
        OtlpKeyValue::string(semconv::TELEMETRY_SDK_NAME, "miniapm"),
        OtlpKeyValue::string(semconv::TELEMETRY_SDK_VERSION, SCOPE_VERSION),
        OtlpKeyValue::string(semconv::TELEMETRY_SDK_LANGUAGE, "rust"),
    ];
    if let Some(version) = &config.service_version {
        attributes.push(OtlpKeyValue::string(semconv::SERVICE_VERSION, version.clone()));
    }
    if let Some(host) = &config.host {
        attributes.push(OtlpKeyValue::string(semconv::HOST_NAME, host.clone()));
    }
    if let Some(git_sha) = &config.git_sha {
        attributes.push(OtlpKeyValue::string(semconv::GIT_SHA, git_sha.clone()));
    }
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::span::SpanCategory;
    use crate::ids::TraceId;

    fn config() -> Config {
        Config {
            endpoint: "http://collector:3000/".to_string(),
            api_key: Some("k".to_string()),
            service_name: "svc".to_string(),
            environment: "test".to_string(),
            git_sha: Some("abc123".to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn no_api_key_means_no_export() {
        let mut config = config();
        config.api_key = None;
        let exporter = OtlpExporter::new(&config, Arc::new(HttpTransport::new().unwrap()));
        let span = Span::start("op", SpanCategory::Db, TraceId::random(), None, Vec::new());
        assert!(exporter.export(&[span]).is_none());
    }

    #[test]
    fn empty_batch_is_not_exported() {
        let exporter = OtlpExporter::new(&config(), Arc::new(HttpTransport::new().unwrap()));
        assert!(exporter.export(&[]).is_none());
    }

    #[test]
    fn endpoint_trailing_slash_is_normalized() {
        let exporter = OtlpExporter::new(&config(), Arc::new(HttpTransport::new().unwrap()));
        assert_eq!(exporter.url, "http://collector:3000/ingest/v1/traces");
    }

    #[test]
    fn envelope_shape() {
        let config = config();
        let mut span = Span::start(
            "GET /a",
            SpanCategory::HttpServer,
            TraceId::random(),
            None,
            Vec::new(),
        );
        span.finish();

        let request = TraceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Resource {
                    attributes: resource_attributes(&config),
                },
                scope_spans: vec![ScopeSpans {
                    scope: Scope {
                        name: SCOPE_NAME,
                        version: SCOPE_VERSION,
                    },
                    spans: vec![span.to_otlp()],
                }],
            }],
        };
        let value = serde_json::to_value(&request).unwrap();

        let resource = &value["resourceSpans"][0]["resource"]["attributes"];
        let find = |key: &str| {
            resource
                .as_array()
                .unwrap()
                .iter()
                .find(|kv| kv["key"] == key)
                .map(|kv| kv["value"]["stringValue"].clone())
        };
        assert_eq!(find("service.name").unwrap(), "svc");
        assert_eq!(find("deployment.environment").unwrap(), "test");
        assert_eq!(find("telemetry.sdk.language").unwrap(), "rust");
        assert_eq!(find("git.sha").unwrap(), "abc123");
        assert!(find("host.name").is_none());

        let scope = &value["resourceSpans"][0]["scopeSpans"][0]["scope"];
        assert_eq!(scope["name"], "miniapm-rust");
        assert_eq!(
            value["resourceSpans"][0]["scopeSpans"][0]["spans"][0]["kind"],
            2
        );
    }
}
