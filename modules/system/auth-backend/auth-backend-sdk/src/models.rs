//! Domain models shared between the host and auth backends.

use std::fmt;

use serde::Serialize;

/// Result of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The backend has nothing to say about this request.
    Noop,
    /// The backend claimed the request and will authenticate it.
    Proceed,
    /// Credentials are valid.
    Accept,
    /// Credentials were checked and refused.
    Reject,
    /// The backend could not make a decision from the supplied input.
    Invalid,
    /// An operational problem prevented a decision.
    Fail,
}

impl Verdict {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Proceed => "proceed",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Invalid => "invalid",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential fields a backend may request from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialField {
    UserName,
    UserPassword,
}

impl CredentialField {
    #[must_use]
    pub const fn attribute_name(self) -> &'static str {
        match self {
            Self::UserName => "User-Name",
            Self::UserPassword => "User-Password",
        }
    }
}

/// Attribute derived from a peer certificate.
///
/// `depth` is the position in the presented chain, `0` being the leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertAttribute {
    pub depth: usize,
    pub name: &'static str,
    pub value: String,
}

impl CertAttribute {
    #[must_use]
    pub fn new(depth: usize, name: &'static str, value: impl Into<String>) -> Self {
        Self {
            depth,
            name,
            value: value.into(),
        }
    }
}

/// Severity of a request diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Message a backend records against a request for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(level: DiagnosticLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}
