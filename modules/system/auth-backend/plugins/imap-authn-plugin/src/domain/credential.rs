//! Username/password pair extracted from a request.

use auth_backend_sdk::{AuthRequest, CredentialField};
use secrecy::{ExposeSecret, SecretString};

use super::error::DomainError;
use crate::infra::transport::protocol::check_login_field;

/// Credentials presented by a request. The password never leaves a
/// [`SecretString`] until it is written to the wire.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: SecretString,
}

impl Credential {
    /// Validate a username/password pair.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EmptyPassword` for an empty password and
    /// `DomainError::InvalidCredential` when either field cannot be carried
    /// by a `LOGIN` command.
    pub fn new(username: &str, password: SecretString) -> Result<Self, DomainError> {
        if password.expose_secret().is_empty() {
            return Err(DomainError::EmptyPassword);
        }
        check_login_field(username).map_err(|e| DomainError::InvalidCredential {
            field: CredentialField::UserName.attribute_name(),
            reason: e.to_string(),
        })?;
        check_login_field(password.expose_secret()).map_err(|e| {
            DomainError::InvalidCredential {
                field: CredentialField::UserPassword.attribute_name(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            username: username.to_owned(),
            password,
        })
    }

    /// Extract the credential from `request`.
    ///
    /// # Errors
    ///
    /// Returns the input error that prevents a login attempt.
    pub fn from_request(request: &dyn AuthRequest) -> Result<Self, DomainError> {
        let username = request
            .credential(CredentialField::UserName)
            .ok_or(DomainError::MissingUsername)?;
        let password = request
            .credential(CredentialField::UserPassword)
            .ok_or(DomainError::MissingPassword)?;

        Self::new(username, SecretString::from(password.to_owned()))
    }
}
