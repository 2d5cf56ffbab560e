//! Error types for auth backend lifecycle operations.

use thiserror::Error;

/// Errors raised while loading, instantiating or unloading a backend.
///
/// Per-request problems never surface here; they are folded into a
/// [`Verdict`](crate::Verdict) plus diagnostics.
#[derive(Debug, Error)]
pub enum AuthBackendError {
    /// The backend configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backend cannot serve requests in the current context.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Teardown was requested while dependent resources are still alive.
    #[error("backend busy: {0}")]
    Busy(String),
}
