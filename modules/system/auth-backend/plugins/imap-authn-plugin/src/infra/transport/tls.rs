//! TLS context initialisation for login attempts.
//!
//! PEM material is loaded once into a [`TlsMaterial`]. Every attempt still
//! gets its own `ClientConfig` because the certificate verifier records its
//! verdict into a per-attempt [`VerificationProbe`].

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::config::{ImapTarget, TlsConfig};
use crate::domain::attempt::{TlsPolicy, VerificationProbe};
use crate::infra::engine::TransportEngine;

/// TLS material could not be turned into a client context.
#[derive(Debug, thiserror::Error)]
pub enum TlsInitError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no usable trust anchors in {0}")]
    NoTrustAnchors(String),

    #[error("no certificates found in {0}")]
    EmptyCertChain(String),

    #[error("no private key found in {0}")]
    MissingPrivateKey(String),

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("certificate verifier: {0}")]
    Verifier(String),

    #[error("client configuration: {0}")]
    Config(#[from] rustls::Error),
}

impl TlsInitError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// TLS material read from disk once and shared by every attempt of a worker.
///
/// Only the certificate verifier wrapper and the `ClientConfig` are built per
/// attempt, so a login never touches the file system.
pub struct TlsMaterial {
    provider: Arc<CryptoProvider>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    client_auth: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    check_cert: bool,
    check_cert_cn: bool,
    extract_cert_attrs: bool,
}

impl TlsMaterial {
    /// Read trust anchors and client credentials named by `cfg`.
    ///
    /// # Errors
    ///
    /// Returns `TlsInitError` when trust anchors or the client certificate
    /// cannot be loaded.
    pub fn load(cfg: &TlsConfig, engine: &TransportEngine) -> Result<Self, TlsInitError> {
        let provider = Arc::clone(engine.provider());
        let roots = trust_anchors(cfg, engine)?;

        let webpki = if roots.is_empty() {
            if cfg.check_cert {
                return Err(TlsInitError::NoTrustAnchors("system trust store".to_owned()));
            }
            None
        } else {
            let verifier = WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(&provider))
                .build()
                .map_err(|e| TlsInitError::Verifier(e.to_string()))?;
            Some(verifier)
        };

        let client_auth = match (&cfg.certificate_file, &cfg.private_key_file) {
            (Some(cert), Some(key)) => Some((load_cert_chain(cert)?, load_private_key(key)?)),
            _ => None,
        };

        Ok(Self {
            provider,
            webpki,
            client_auth,
            check_cert: cfg.check_cert,
            check_cert_cn: cfg.check_cert_cn,
            extract_cert_attrs: cfg.extract_cert_attrs,
        })
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("custom_roots", &self.webpki.is_some())
            .field("client_auth", &self.client_auth.is_some())
            .field("check_cert", &self.check_cert)
            .field("check_cert_cn", &self.check_cert_cn)
            .field("extract_cert_attrs", &self.extract_cert_attrs)
            .finish_non_exhaustive()
    }
}

/// Build the TLS policy for one attempt against `target`.
///
/// # Errors
///
/// Returns `TlsInitError` when the server name or the client certificate
/// cannot be used.
pub fn policy_for(material: &TlsMaterial, target: &ImapTarget) -> Result<TlsPolicy, TlsInitError> {
    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|_| TlsInitError::InvalidServerName(target.host.clone()))?;

    let verification = VerificationProbe::default();
    let verifier = Arc::new(RecordingVerifier {
        inner: material.webpki.clone(),
        provider: Arc::clone(&material.provider),
        check_cert: material.check_cert,
        check_cert_cn: material.check_cert_cn,
        probe: verification.clone(),
    });

    let builder = ClientConfig::builder_with_provider(Arc::clone(&material.provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let client_config = match &material.client_auth {
        Some((chain, key)) => builder.with_client_auth_cert(chain.clone(), key.clone_key())?,
        None => builder.with_no_client_auth(),
    };

    Ok(TlsPolicy {
        client_config: Arc::new(client_config),
        server_name,
        verification,
        extract_cert_attrs: material.extract_cert_attrs,
    })
}

fn trust_anchors(
    cfg: &TlsConfig,
    engine: &TransportEngine,
) -> Result<Arc<RootCertStore>, TlsInitError> {
    if cfg.ca_file.is_none() && cfg.ca_path.is_none() {
        return Ok(Arc::clone(engine.system_roots()));
    }

    let mut roots = RootCertStore::empty();
    if let Some(file) = &cfg.ca_file {
        let (added, ignored) = roots.add_parsable_certificates(read_certificates(file)?);
        if added == 0 {
            return Err(TlsInitError::NoTrustAnchors(file.display().to_string()));
        }
        debug!(path = %file.display(), added, ignored, "loaded ca_file");
    }

    if let Some(dir) = &cfg.ca_path {
        let entries = std::fs::read_dir(dir).map_err(|e| TlsInitError::io(dir, e))?;
        let mut added = 0;
        for entry in entries {
            let path = entry.map_err(|e| TlsInitError::io(dir, e))?.path();
            if !path.is_file() {
                continue;
            }
            let (ok, ignored) = roots.add_parsable_certificates(read_certificates(&path)?);
            if ignored > 0 {
                warn!(path = %path.display(), ignored, "ignored unparsable certificates");
            }
            added += ok;
        }
        if added == 0 {
            return Err(TlsInitError::NoTrustAnchors(dir.display().to_string()));
        }
        debug!(path = %dir.display(), added, "loaded ca_path");
    }

    Ok(Arc::new(roots))
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsInitError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsInitError::io(path, e))?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsInitError::io(path, e))
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsInitError> {
    let chain = read_certificates(path)?;
    if chain.is_empty() {
        return Err(TlsInitError::EmptyCertChain(path.display().to_string()));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsInitError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsInitError::io(path, e))?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsInitError::io(path, e))?
        .ok_or_else(|| TlsInitError::MissingPrivateKey(path.display().to_string()))
}

/// Runs WebPKI verification and records the verdict.
///
/// With `check_cert` off the handshake continues whatever the verdict; with
/// `check_cert_cn` off a host name mismatch alone is tolerated.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    check_cert: bool,
    check_cert_cn: bool,
    probe: VerificationProbe,
}

fn is_name_mismatch(error: &rustls::Error) -> bool {
    matches!(
        error,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let Some(inner) = &self.inner else {
            self.probe.record(false);
            return Ok(ServerCertVerified::assertion());
        };

        match inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Ok(verified) => {
                self.probe.record(true);
                Ok(verified)
            }
            // The chain verifies before the name is checked.
            Err(e) if !self.check_cert_cn && is_name_mismatch(&e) => {
                debug!(error = %e, "tolerating host name mismatch");
                self.probe.record(true);
                Ok(ServerCertVerified::assertion())
            }
            Err(e) if !self.check_cert => {
                self.probe.record(false);
                warn!(error = %e, "peer certificate not verified, continuing");
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => {
                self.probe.record(false);
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
