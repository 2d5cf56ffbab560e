//! Domain errors for the IMAP `AuthN` plugin.

use std::sync::Arc;

use auth_backend_sdk::{DiagnosticLevel, Verdict};

use crate::infra::DispatchError;
use crate::infra::transport::TlsInitError;

/// Reasons `authenticate` ends without consulting the remote service.
#[derive(thiserror::Error, Debug)]
pub enum DomainError {
    #[error("username required")]
    MissingUsername,

    #[error("password required")]
    MissingPassword,

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("invalid {field}: {reason}")]
    InvalidCredential { field: &'static str, reason: String },

    /// Shared by every request of a worker whose TLS material failed to load.
    #[error("TLS configuration error: {0}")]
    TlsConfiguration(#[source] Arc<TlsInitError>),

    #[error("malformed login attempt: {0}")]
    MalformedAttempt(String),

    #[error("resource error: {0}")]
    Resource(String),
}

impl DomainError {
    /// Pipeline verdict this error resolves to.
    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        match self {
            Self::MissingUsername
            | Self::MissingPassword
            | Self::EmptyPassword
            | Self::InvalidCredential { .. }
            | Self::TlsConfiguration(_)
            | Self::MalformedAttempt(_) => Verdict::Invalid,
            Self::Resource(_) => Verdict::Fail,
        }
    }

    /// Severity used when reporting the error to the host.
    #[must_use]
    pub const fn level(&self) -> DiagnosticLevel {
        match self {
            Self::MissingUsername
            | Self::MissingPassword
            | Self::EmptyPassword
            | Self::InvalidCredential { .. } => DiagnosticLevel::Info,
            Self::MalformedAttempt(_) => DiagnosticLevel::Warn,
            Self::TlsConfiguration(_) | Self::Resource(_) => DiagnosticLevel::Error,
        }
    }
}

impl From<TlsInitError> for DomainError {
    fn from(e: TlsInitError) -> Self {
        Self::TlsConfiguration(Arc::new(e))
    }
}

impl From<DispatchError> for DomainError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Malformed(reason) => Self::MalformedAttempt(reason),
            DispatchError::QueueFull { .. } | DispatchError::Detached | DispatchError::NoRuntime => {
                Self::Resource(e.to_string())
            }
        }
    }
}
