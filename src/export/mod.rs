//! Export: the HTTP transport and the per-payload-kind exporters.

pub mod error;
pub mod http;
pub mod otlp;

pub use error::{DeployEvent, ErrorBatchResult, ErrorExporter};
pub use http::{HttpTransport, TransportResponse};
pub use otlp::OtlpExporter;
