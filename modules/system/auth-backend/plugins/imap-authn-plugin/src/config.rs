//! Configuration for the IMAP `AuthN` plugin.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::Deserialize;
use url::Url;

/// Environment prefix merged over the configuration file.
pub const ENV_PREFIX: &str = "IMAP_AUTHN_";

/// Upper bound for a credential field sent in a `LOGIN` command.
pub const MAX_CREDENTIAL_LEN: usize = 1024;

const IMAP_PORT: u16 = 143;
const IMAPS_PORT: u16 = 993;

/// Plugin configuration.
///
/// ```yaml
/// name: imap
/// imap_uri: imaps://mail.example.com
/// timeout: 5s
/// tls:
///   ca_file: /etc/ssl/certs/mail-ca.pem
///   extract_cert_attrs: true
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImapAuthNPluginConfig {
    /// Instance name, also the auth-type label claimed during `authorize`.
    pub name: String,

    /// IMAP service URI. `imap://` is assumed when the scheme is omitted.
    pub imap_uri: String,

    /// Budget for the whole login attempt.
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub timeout: Duration,

    /// Budget for the connection phase. Falls back to `timeout`.
    #[serde(deserialize_with = "duration_str::deserialize_opt")]
    pub connect_timeout: Option<Duration>,

    /// Attempts a single worker may have in flight.
    pub max_in_flight: usize,

    /// Log the IMAP conversation (credentials redacted).
    pub verbose: bool,

    pub tls: TlsConfig,
}

impl Default for ImapAuthNPluginConfig {
    fn default() -> Self {
        Self {
            name: "imap".to_owned(),
            imap_uri: String::new(),
            timeout: Duration::from_secs(5),
            connect_timeout: None,
            max_in_flight: 64,
            verbose: false,
            tls: TlsConfig::default(),
        }
    }
}

/// TLS policy for outbound connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM bundle of trust anchors.
    pub ca_file: Option<PathBuf>,

    /// Directory of PEM trust anchors.
    pub ca_path: Option<PathBuf>,

    /// Client certificate chain (PEM).
    pub certificate_file: Option<PathBuf>,

    /// Client private key (PEM).
    pub private_key_file: Option<PathBuf>,

    /// Abort the handshake when the peer certificate does not verify.
    pub check_cert: bool,

    /// Require the peer certificate to match the target host name.
    pub check_cert_cn: bool,

    /// Attach peer certificate attributes to accepted requests.
    pub extract_cert_attrs: bool,

    /// STARTTLS policy for `imap://` targets.
    pub starttls: StartTlsMode,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_file: None,
            ca_path: None,
            certificate_file: None,
            private_key_file: None,
            check_cert: true,
            check_cert_cn: true,
            extract_cert_attrs: false,
            starttls: StartTlsMode::Off,
        }
    }
}

/// STARTTLS behaviour on plaintext targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartTlsMode {
    /// Stay in plaintext.
    #[default]
    Off,
    /// Upgrade when the server accepts, continue in plaintext otherwise.
    Try,
    /// Fail the attempt unless the upgrade succeeds.
    Required,
}

/// Configuration errors detected at load time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("imap_uri is required")]
    MissingUri,

    #[error("invalid imap_uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported scheme '{0}', expected imap or imaps")]
    UnsupportedScheme(String),

    #[error("imap_uri must not embed credentials")]
    CredentialsInUri,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("tls.certificate_file and tls.private_key_file must be set together")]
    IncompleteClientCertificate,
}

impl ImapAuthNPluginConfig {
    /// Load from a YAML file merged with `IMAP_AUTHN_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Load` when the file cannot be read or does not
    /// match the schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Yaml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Extract from an already assembled figment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Load` when extraction fails.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Connection-phase timeout, defaulting to the total timeout.
    #[must_use]
    pub fn effective_connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(self.timeout)
    }
}

/// Where and how to reach the IMAP service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapTarget {
    pub host: String,
    pub port: u16,
    pub security: Security,
}

/// Transport security of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// `imaps://`: TLS from the first byte.
    ImplicitTls,
    /// `imap://`: plaintext, optionally upgraded with STARTTLS.
    StartTls(StartTlsMode),
}

impl ImapTarget {
    /// Parse an IMAP URI, forcing the `imap` scheme when none is given.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for empty, malformed or non-IMAP URIs.
    pub fn parse(uri: &str, starttls: StartTlsMode) -> Result<Self, ConfigError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(ConfigError::MissingUri);
        }

        let normalized = if uri.contains("://") {
            uri.to_owned()
        } else {
            format!("imap://{uri}")
        };
        let url = Url::parse(&normalized).map_err(|e| ConfigError::InvalidUri {
            uri: uri.to_owned(),
            reason: e.to_string(),
        })?;

        let (security, default_port) = match url.scheme() {
            "imap" => (Security::StartTls(starttls), IMAP_PORT),
            "imaps" => (Security::ImplicitTls, IMAPS_PORT),
            other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
        };

        if !url.username().is_empty() || url.password().is_some() {
            return Err(ConfigError::CredentialsInUri);
        }

        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_owned(),
            Some(url::Host::Ipv4(addr)) => addr.to_string(),
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(ConfigError::InvalidUri {
                    uri: uri.to_owned(),
                    reason: "missing host".to_owned(),
                });
            }
        };

        if !matches!(url.path(), "" | "/") || url.query().is_some() {
            tracing::warn!(uri, "ignoring mailbox path and query of imap_uri");
        }

        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            security,
        })
    }

    /// `host:port` form accepted by socket address resolution.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Validated, read-only configuration shared by every worker.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub target: ImapTarget,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub max_in_flight: usize,
    pub verbose: bool,
    pub tls: TlsConfig,
}

impl InstanceConfig {
    /// Validate the raw configuration.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found.
    pub fn from_config(cfg: &ImapAuthNPluginConfig) -> Result<Self, ConfigError> {
        let target = ImapTarget::parse(&cfg.imap_uri, cfg.tls.starttls)?;

        if cfg.timeout.is_zero() {
            return Err(ConfigError::Zero("timeout"));
        }
        let connect_timeout = cfg.effective_connect_timeout();
        if connect_timeout.is_zero() {
            return Err(ConfigError::Zero("connect_timeout"));
        }
        if cfg.max_in_flight == 0 {
            return Err(ConfigError::Zero("max_in_flight"));
        }
        if cfg.tls.certificate_file.is_some() != cfg.tls.private_key_file.is_some() {
            return Err(ConfigError::IncompleteClientCertificate);
        }

        let name = if cfg.name.trim().is_empty() {
            "imap".to_owned()
        } else {
            cfg.name.trim().to_owned()
        };

        Ok(Self {
            name,
            target,
            connect_timeout,
            total_timeout: cfg.timeout,
            max_in_flight: cfg.max_in_flight,
            verbose: cfg.verbose,
            tls: cfg.tls.clone(),
        })
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    fn convert<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(E::custom),
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        convert(Raw::deserialize(deserializer)?)
    }

    pub(super) fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<Raw>::deserialize(deserializer)?
            .map(convert)
            .transpose()
    }
}
