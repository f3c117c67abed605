use thiserror::Error;

/// Errors surfaced to the host application.
///
/// Only configuration and startup problems are ever returned to callers;
/// transport and export failures are captured as data and accounted in
/// [`Stats`](crate::batch::Stats).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Configuration validation failed at `start`.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The HTTP transport could not be initialized.
    #[error("failed to initialize http transport: {0}")]
    Transport(String),
}
