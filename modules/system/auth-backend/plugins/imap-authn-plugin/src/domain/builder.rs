//! Turns a credential into a login attempt for the configured target.

use std::sync::Arc;

use tracing::{debug, error};

use super::attempt::LoginAttempt;
use super::credential::Credential;
use super::error::DomainError;
use crate::config::InstanceConfig;
use crate::infra::engine::TransportEngine;
use crate::infra::transport::{TlsInitError, TlsMaterial, policy_for};

/// Builds login attempts against one instance's target.
///
/// TLS material is read when the builder is created. A load failure is kept
/// and returned by every `build`, so requests still resolve to Invalid
/// without any network activity.
#[derive(Debug, Clone)]
pub struct LoginAttemptBuilder {
    config: Arc<InstanceConfig>,
    tls: Result<Arc<TlsMaterial>, Arc<TlsInitError>>,
}

impl LoginAttemptBuilder {
    #[must_use]
    pub fn new(config: Arc<InstanceConfig>, engine: &TransportEngine) -> Self {
        let tls = match TlsMaterial::load(&config.tls, engine) {
            Ok(material) => Ok(Arc::new(material)),
            Err(e) => {
                error!(instance = %config.name, error = %e, "failed to load TLS material");
                Err(Arc::new(e))
            }
        };
        Self { config, tls }
    }

    /// Compose the attempt for `credential`.
    ///
    /// The target's scheme and port come from the validated instance
    /// configuration, never from anything the request carries. TLS material
    /// is required even for plaintext targets.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TlsConfiguration` when the TLS material could not
    /// be loaded or the per-attempt context cannot be initialised.
    pub fn build(&self, credential: Credential) -> Result<LoginAttempt, DomainError> {
        let material = self
            .tls
            .as_ref()
            .map_err(|e| DomainError::TlsConfiguration(Arc::clone(e)))?;
        let tls = policy_for(material, &self.config.target)?;

        debug!(
            target = %self.config.target.authority(),
            security = ?self.config.target.security,
            connect_timeout = ?self.config.connect_timeout,
            total_timeout = ?self.config.total_timeout,
            "login attempt built"
        );

        Ok(LoginAttempt {
            target: self.config.target.clone(),
            username: credential.username,
            password: credential.password,
            connect_timeout: self.config.connect_timeout,
            total_timeout: self.config.total_timeout,
            tls,
            verbose: self.config.verbose,
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use secrecy::{ExposeSecret, SecretString};

    use super::*;
    use crate::config::ImapAuthNPluginConfig;

    fn builder(cfg: &ImapAuthNPluginConfig) -> LoginAttemptBuilder {
        let config = InstanceConfig::from_config(cfg).unwrap();
        LoginAttemptBuilder::new(Arc::new(config), &TransportEngine::acquire())
    }

    fn alice() -> Credential {
        Credential::new("alice", SecretString::from("secret".to_owned())).unwrap()
    }

    #[test]
    fn timeouts_share_one_value_by_default() {
        let cfg = ImapAuthNPluginConfig {
            imap_uri: "mail.example.com".to_owned(),
            timeout: Duration::from_secs(7),
            tls: crate::config::TlsConfig {
                check_cert: false,
                ..crate::config::TlsConfig::default()
            },
            ..ImapAuthNPluginConfig::default()
        };

        let attempt = builder(&cfg).build(alice()).unwrap();
        assert_eq!(attempt.connect_timeout, Duration::from_secs(7));
        assert_eq!(attempt.total_timeout, Duration::from_secs(7));
        assert_eq!(attempt.target.port, 143);
        assert_eq!(attempt.username, "alice");
        assert_eq!(attempt.password.expose_secret(), "secret");
    }

    #[test]
    fn malformed_trust_material_fails_the_build() {
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(b"-----BEGIN CERTIFICATE-----\nnot base64\n").unwrap();
        let cfg = ImapAuthNPluginConfig {
            imap_uri: "imaps://mail.example.com".to_owned(),
            tls: crate::config::TlsConfig {
                ca_file: Some(ca.path().to_path_buf()),
                ..crate::config::TlsConfig::default()
            },
            ..ImapAuthNPluginConfig::default()
        };

        let err = builder(&cfg).build(alice()).unwrap_err();
        assert!(matches!(err, DomainError::TlsConfiguration(_)), "{err}");
    }

    #[test]
    fn trust_material_is_read_once_per_builder() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(certified.cert.pem().as_bytes()).unwrap();
        let cfg = ImapAuthNPluginConfig {
            imap_uri: "imaps://localhost".to_owned(),
            tls: crate::config::TlsConfig {
                ca_file: Some(ca.path().to_path_buf()),
                ..crate::config::TlsConfig::default()
            },
            ..ImapAuthNPluginConfig::default()
        };
        let builder = builder(&cfg);
        ca.close().unwrap();

        for _ in 0..3 {
            assert!(builder.build(alice()).is_ok());
        }
    }

    #[test]
    fn load_failure_is_reported_by_every_build() {
        let cfg = ImapAuthNPluginConfig {
            imap_uri: "imaps://localhost".to_owned(),
            tls: crate::config::TlsConfig {
                ca_path: Some("/nonexistent/ca.d".into()),
                ..crate::config::TlsConfig::default()
            },
            ..ImapAuthNPluginConfig::default()
        };
        let builder = builder(&cfg);

        for _ in 0..2 {
            let err = builder.build(alice()).unwrap_err();
            assert!(err.to_string().starts_with("TLS configuration error: failed to read"), "{err}");
        }
    }
}
