//! Client configuration.

use crate::error::Error;
use crate::filter::{self, FilterPattern};
use crate::trace::span::Span;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hook invoked with each finished span before it is enqueued.
///
/// Returning `None` drops the span. A panicking hook is caught and logged;
/// the original span proceeds.
pub type BeforeSend = Arc<dyn Fn(Span) -> Option<Span> + Send + Sync>;

/// Client configuration, mutated through [`configure`](crate::configure)
/// before [`start`](crate::start).
#[derive(Clone)]
pub struct Config {
    /// Base URL of the collector; all export paths are joined onto it.
    pub endpoint: String,
    /// Bearer token for the collector. Absent means exports are no-ops.
    pub api_key: Option<String>,
    /// Global kill switch.
    pub enabled: bool,
    /// Probability in `[0, 1]` that a new trace is sampled.
    pub sample_rate: f64,
    /// Maximum spans or errors per export batch.
    pub batch_size: usize,
    /// Maximum age of a pending batch before it is flushed.
    pub flush_interval: Duration,
    /// Producer-queue capacity per telemetry kind; overflow drops.
    pub max_queue_size: usize,
    /// Number of parallel send workers.
    pub max_concurrent_sends: usize,
    /// Reported as the `service.name` resource attribute.
    pub service_name: String,
    /// Reported as the `deployment.environment` resource attribute.
    pub environment: String,
    /// Optional `service.version` resource attribute.
    pub service_version: Option<String>,
    /// Optional `host.name` resource attribute.
    pub host: Option<String>,
    /// Optional `git.sha` resource attribute.
    pub git_sha: Option<String>,
    /// Exception class names that never produce error reports.
    pub ignored_exceptions: HashSet<String>,
    /// Key patterns scrubbed from error-report parameters.
    pub filter_parameters: Vec<FilterPattern>,
    /// Optional hook applied to spans before enqueue.
    pub before_send: Option<BeforeSend>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: "http://localhost:3000".to_string(),
            api_key: None,
            enabled: true,
            sample_rate: 1.0,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_queue_size: 10_000,
            max_concurrent_sends: 4,
            service_name: "unknown_service".to_string(),
            environment: "development".to_string(),
            service_version: None,
            host: None,
            git_sha: None,
            ignored_exceptions: HashSet::new(),
            filter_parameters: filter::default_filters(),
            before_send: None,
        }
    }
}

impl Config {
    /// Validate the configuration; called from `start`.
    pub fn validate(&self) -> Result<(), Error> {
        if reqwest::Url::parse(&self.endpoint).is_err() {
            return Err(Error::Config(format!(
                "endpoint is not a valid URL: {:?}",
                self.endpoint
            )));
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(Error::Config(format!(
                "sample_rate must be within [0, 1], got {}",
                self.sample_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        if self.max_queue_size == 0 {
            return Err(Error::Config("max_queue_size must be positive".to_string()));
        }
        if self.max_concurrent_sends == 0 {
            return Err(Error::Config(
                "max_concurrent_sends must be positive".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("flush_interval must be positive".to_string()));
        }
        Ok(())
    }

    /// Endpoint without a trailing slash, ready for path joining.
    pub(crate) fn endpoint_base(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("enabled", &self.enabled)
            .field("sample_rate", &self.sample_rate)
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("max_queue_size", &self.max_queue_size)
            .field("max_concurrent_sends", &self.max_concurrent_sends)
            .field("service_name", &self.service_name)
            .field("environment", &self.environment)
            .field("service_version", &self.service_version)
            .field("host", &self.host)
            .field("git_sha", &self.git_sha)
            .field("ignored_exceptions", &self.ignored_exceptions)
            .field("filter_parameters", &self.filter_parameters)
            .field("before_send", &self.before_send.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
