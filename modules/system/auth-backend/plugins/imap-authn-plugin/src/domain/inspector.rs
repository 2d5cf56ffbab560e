//! Post-completion inspection of an attempt's TLS session.

use auth_backend_sdk::CertAttribute;
use rustls::pki_types::CertificateDer;
use tracing::{debug, warn};
use x509_parser::parse_x509_certificate;
use x509_parser::prelude::{GeneralName, X509Certificate};

use super::attempt::{AttemptResult, CompletedAttempt, Verification};

pub const CERT_SERIAL: &str = "TLS-Cert-Serial";
pub const CERT_SUBJECT: &str = "TLS-Cert-Subject";
pub const CERT_ISSUER: &str = "TLS-Cert-Issuer";
pub const CERT_COMMON_NAME: &str = "TLS-Cert-Common-Name";
pub const CERT_VALID_SINCE: &str = "TLS-Cert-Valid-Since";
pub const CERT_EXPIRATION: &str = "TLS-Cert-Expiration";
pub const CERT_SAN_DNS: &str = "TLS-Cert-Subject-Alt-Name-Dns";

/// Derive the verification outcome and, for successful attempts with
/// extraction enabled, the peer certificate attributes.
///
/// A missing verification result yields [`Verification::Unknown`]; it never
/// affects the status of the attempt.
#[must_use]
pub fn inspect(completed: CompletedAttempt, extract_cert_attrs: bool) -> AttemptResult {
    let verification = match completed.tls.as_ref().and_then(|tls| tls.verified) {
        Some(true) => Verification::Verified,
        Some(false) => Verification::NotVerified,
        None => Verification::Unknown,
    };

    let cert_attrs = match (&completed.tls, extract_cert_attrs && completed.status.is_success()) {
        (Some(tls), true) => Some(chain_attributes(&tls.peer_certificates)),
        _ => None,
    };

    AttemptResult {
        status: completed.status,
        verification,
        cert_attrs,
    }
}

/// Attributes for every certificate of `chain` that parses.
#[must_use]
pub fn chain_attributes(chain: &[CertificateDer<'_>]) -> Vec<CertAttribute> {
    let mut attrs = Vec::new();
    for (depth, der) in chain.iter().enumerate() {
        match parse_x509_certificate(der.as_ref()) {
            Ok((_, cert)) => certificate_attributes(depth, &cert, &mut attrs),
            Err(e) => warn!(depth, error = %e, "skipping unparsable peer certificate"),
        }
    }
    debug!(count = attrs.len(), "extracted certificate attributes");
    attrs
}

fn certificate_attributes(depth: usize, cert: &X509Certificate<'_>, out: &mut Vec<CertAttribute>) {
    out.push(CertAttribute::new(depth, CERT_SERIAL, cert.raw_serial_as_string()));
    out.push(CertAttribute::new(depth, CERT_SUBJECT, cert.subject().to_string()));
    out.push(CertAttribute::new(depth, CERT_ISSUER, cert.issuer().to_string()));

    for cn in cert.subject().iter_common_name() {
        match cn.as_str() {
            Ok(cn) => out.push(CertAttribute::new(depth, CERT_COMMON_NAME, cn)),
            Err(e) => debug!(depth, error = %e, "common name is not a string"),
        }
    }

    let validity = cert.validity();
    out.push(CertAttribute::new(depth, CERT_VALID_SINCE, validity.not_before.to_string()));
    out.push(CertAttribute::new(depth, CERT_EXPIRATION, validity.not_after.to_string()));

    match cert.subject_alternative_name() {
        Ok(Some(san)) => {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    out.push(CertAttribute::new(depth, CERT_SAN_DNS, *dns));
                }
            }
        }
        Ok(None) => {}
        Err(e) => warn!(depth, error = %e, "malformed subjectAltName extension"),
    }
}
