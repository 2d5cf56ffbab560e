//! Login attempt descriptor and the outcomes it can produce.

use std::sync::Arc;
use std::time::Duration;

use auth_backend_sdk::CertAttribute;
use parking_lot::Mutex;
use rustls::ClientConfig;
use rustls::pki_types::{CertificateDer, ServerName};
use secrecy::SecretString;

use crate::config::ImapTarget;

/// Everything the transport needs to perform one login.
///
/// Immutable once built. The dispatcher owns it for the lifetime of the
/// attempt and drops it after the completion was delivered.
#[derive(Debug)]
pub struct LoginAttempt {
    pub target: ImapTarget,
    pub username: String,
    pub password: SecretString,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub tls: TlsPolicy,
    pub verbose: bool,
}

/// TLS material initialised for a single attempt.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    pub client_config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
    pub verification: VerificationProbe,
    pub extract_cert_attrs: bool,
}

/// Shared slot the certificate verifier writes its verdict into.
///
/// Stays empty when no handshake reached certificate verification.
#[derive(Debug, Clone, Default)]
pub struct VerificationProbe(Arc<Mutex<Option<bool>>>);

impl VerificationProbe {
    pub fn record(&self, verified: bool) {
        *self.0.lock() = Some(verified);
    }

    #[must_use]
    pub fn outcome(&self) -> Option<bool> {
        *self.0.lock()
    }
}

/// Why an attempt did not complete the protocol exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: &'static str, after: Duration },

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection closed by remote service")]
    Closed,

    #[error("attempt cancelled: {0}")]
    Cancelled(&'static str),

    #[error("transport fault: {0}")]
    Internal(String),
}

/// Terminal status of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
    /// The server accepted the login.
    Success,
    /// The server answered, but refused the login or misbehaved.
    ProtocolFailure { reason: String },
    /// The exchange never reached a server decision.
    TransportFailure(TransportFailure),
}

impl AttemptStatus {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// TLS facts observed during the attempt.
#[derive(Debug, Clone, Default)]
pub struct TlsSessionInfo {
    /// `None` when verification never ran.
    pub verified: Option<bool>,
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// Raw completion handed from the transport back to the dispatcher.
#[derive(Debug, Clone)]
pub struct CompletedAttempt {
    pub status: AttemptStatus,
    /// `None` for attempts that never started a TLS handshake.
    pub tls: Option<TlsSessionInfo>,
}

impl CompletedAttempt {
    #[must_use]
    pub fn success(tls: Option<TlsSessionInfo>) -> Self {
        Self {
            status: AttemptStatus::Success,
            tls,
        }
    }

    #[must_use]
    pub fn transport_failure(failure: TransportFailure) -> Self {
        Self {
            status: AttemptStatus::TransportFailure(failure),
            tls: None,
        }
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::transport_failure(TransportFailure::Cancelled("worker detached"))
    }
}

/// Outcome of the peer certificate check as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    NotVerified,
    Unknown,
}

/// Inspected result consumed by the resume step.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub status: AttemptStatus,
    pub verification: Verification,
    pub cert_attrs: Option<Vec<CertAttribute>>,
}
