//! Error-report and deploy exporters.
//!
//! The collector ingests errors one JSON body per event; a batch is sent
//! as a sequence of individual POSTs whose outcomes are aggregated.

use crate::config::Config;
use crate::error_event::ErrorEvent;
use crate::export::http::{HttpTransport, TransportResponse};
use serde::Serialize;
use std::sync::Arc;

/// Aggregate outcome of exporting a batch of error events.
#[derive(Debug, Clone, Default)]
pub struct ErrorBatchResult {
    /// True when at least one event was accepted.
    pub success: bool,
    pub sent: usize,
    pub failed: usize,
    /// Status of the last POST.
    pub status: u16,
}

/// A deploy marker for the collector's deploy timeline.
#[derive(Debug, Clone, Serialize)]
pub struct DeployEvent {
    pub git_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl DeployEvent {
    pub fn new(git_sha: impl Into<String>) -> Self {
        DeployEvent {
            git_sha: git_sha.into(),
            version: None,
            env: None,
            description: None,
            deployer: None,
            timestamp: None,
        }
    }
}

/// Exports error events and deploy markers.
#[derive(Debug)]
pub struct ErrorExporter {
    transport: Arc<HttpTransport>,
    errors_url: String,
    deploys_url: String,
    api_key: Option<String>,
}

impl ErrorExporter {
    pub fn new(config: &Config, transport: Arc<HttpTransport>) -> Self {
        ErrorExporter {
            transport,
            errors_url: format!("{}/ingest/errors", config.endpoint_base()),
            deploys_url: format!("{}/ingest/deploys", config.endpoint_base()),
            api_key: config.api_key.clone(),
        }
    }

    fn auth_header(&self) -> Option<(&'static str, String)> {
        self.api_key
            .as_ref()
            .map(|key| ("Authorization", format!("Bearer {key}")))
    }

    /// POST one error event. `None` when no API key is configured.
    pub fn export(&self, event: &ErrorEvent) -> Option<TransportResponse> {
        let auth = self.auth_header()?;
        Some(self.transport.post_json(&self.errors_url, event, &[auth]))
    }

    /// POST each event individually, returning one response per event.
    /// `None` when no API key is configured.
    pub fn export_each(&self, events: &[ErrorEvent]) -> Option<Vec<TransportResponse>> {
        let headers = [self.auth_header()?];
        Some(
            events
                .iter()
                .map(|event| self.transport.post_json(&self.errors_url, event, &headers))
                .collect(),
        )
    }

    /// POST a batch one event at a time, aggregating the outcomes.
    pub fn export_batch(&self, events: &[ErrorEvent]) -> Option<ErrorBatchResult> {
        let responses = self.export_each(events)?;
        let mut result = ErrorBatchResult::default();
        for response in &responses {
            if response.success {
                result.sent += 1;
            } else {
                result.failed += 1;
            }
            result.status = response.status;
        }
        result.success = result.sent > 0;
        Some(result)
    }

    /// POST a deploy marker. `None` when no API key is configured.
    pub fn notify_deploy(&self, deploy: &DeployEvent) -> Option<TransportResponse> {
        let auth = self.auth_header()?;
        Some(self.transport.post_json(&self.deploys_url, deploy, &[auth]))
    }
}
