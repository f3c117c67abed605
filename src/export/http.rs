//! Thin HTTP POST helper.
//!
//! Wraps a blocking reqwest client with the crate's timeouts and identity
//! headers, and folds every failure mode into a structured result; the
//! transport never propagates an error to its caller.

use crate::error::Error;
use serde::Serialize;
use std::time::Duration;

/// Connection-establishment timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Whole-request (read/write) timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const USER_AGENT: &str = concat!("miniapm-rust/", env!("CARGO_PKG_VERSION"));

/// Outcome of a POST. `status` is 0 when the request never produced an
/// HTTP response (connect failure, timeout, serialization error).
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
    pub success: bool,
    pub error: Option<String>,
}

impl TransportResponse {
    fn failure(error: impl std::fmt::Display) -> Self {
        TransportResponse {
            status: 0,
            body: String::new(),
            success: false,
            error: Some(error.to_string()),
        }
    }

    /// Permanent client-side rejection; not worth retrying.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

/// Shared blocking HTTP client. Safe for concurrent use by the send
/// workers; reqwest clients pool connections internally.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(HttpTransport { client })
    }

    /// Serialize `payload` as JSON and POST it.
    pub fn post_json<T: Serialize>(
        &self,
        url: &str,
        payload: &T,
        headers: &[(&str, String)],
    ) -> TransportResponse {
        match serde_json::to_string(payload) {
            Ok(body) => self.post_raw(url, body, headers),
            Err(e) => TransportResponse::failure(format!("payload serialization failed: {e}")),
        }
    }

    /// POST a pre-serialized body.
    pub fn post_raw(&self, url: &str, body: String, headers: &[(&str, String)]) -> TransportResponse {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        match request.send() {
            Ok(response) => {
                let status = response.status().as_u16();
                let success = response.status().is_success();
                let body = response.text().unwrap_or_default();
                TransportResponse {
                    status,
                    body,
                    success,
                    error: None,
                }
            }
            Err(e) => TransportResponse::failure(e),
        }
    }
}
