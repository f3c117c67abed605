//! Attribute keys of the embedding contract.
//!
//! Request, outbound-HTTP, and job adapters attach these well-known keys;
//! keeping them in one place spares each adapter its own string literals.

pub const HTTP_METHOD: &str = "http.method";
pub const HTTP_URL: &str = "http.url";
pub const HTTP_SCHEME: &str = "http.scheme";
pub const HTTP_HOST: &str = "http.host";
pub const HTTP_TARGET: &str = "http.target";
pub const HTTP_USER_AGENT: &str = "http.user_agent";
pub const HTTP_REQUEST_ID: &str = "http.request_id";
pub const HTTP_QUERY_PARAMS: &str = "http.query_params";
pub const HTTP_CLIENT_IP: &str = "http.client_ip";
pub const HTTP_STATUS_CODE: &str = "http.status_code";

pub const NET_PEER_NAME: &str = "net.peer.name";
pub const NET_PEER_PORT: &str = "net.peer.port";

pub const EXCEPTION_TYPE: &str = "exception.type";
pub const EXCEPTION_MESSAGE: &str = "exception.message";
pub const EXCEPTION_STACKTRACE: &str = "exception.stacktrace";

pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_VERSION: &str = "service.version";
pub const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";
pub const HOST_NAME: &str = "host.name";
pub const GIT_SHA: &str = "git.sha";

pub const TELEMETRY_SDK_NAME: &str = "telemetry.sdk.name";
pub const TELEMETRY_SDK_VERSION: &str = "telemetry.sdk.version";
pub const TELEMETRY_SDK_LANGUAGE: &str = "telemetry.sdk.language";
