//! Host capabilities exposed for a single inbound request.

use crate::models::{CertAttribute, CredentialField, Diagnostic};

/// View of one inbound request owned by the host.
///
/// Backends never own requests; they borrow them for the duration of a
/// stage. Implementations must be `Send` because a stage may be resumed on
/// a different poll than the one that suspended it.
pub trait AuthRequest: Send {
    /// Look up a credential field supplied with the request.
    ///
    /// Returns `None` when the field is absent. An empty value is returned
    /// as `Some("")` so backends can tell "absent" from "empty".
    fn credential(&self, field: CredentialField) -> Option<&str>;

    /// Claim the request for the backend identified by `auth_type`.
    ///
    /// Returns `false` when another backend already claimed it.
    fn claim_auth_type(&mut self, auth_type: &str) -> bool;

    /// Attach attributes produced by the backend to the request.
    fn attach_attributes(&mut self, attributes: Vec<CertAttribute>);

    /// Record a diagnostic message against the request.
    fn report(&mut self, diagnostic: Diagnostic);
}
