//! Per-worker orchestration of the authorize and authenticate stages.

use std::sync::Arc;

use auth_backend_sdk::{AuthRequest, CredentialField, Diagnostic, DiagnosticLevel, Verdict};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::attempt::{AttemptStatus, CompletedAttempt, Verification};
use super::builder::LoginAttemptBuilder;
use super::credential::Credential;
use super::error::DomainError;
use super::inspector::inspect;
use crate::config::InstanceConfig;
use crate::infra::{DetachMode, DetachReport, PendingAttempt, WorkerHandle};
use crate::module::WorkerLease;

/// IMAP login backend bound to one worker.
///
/// Owns the worker's dispatcher; the instance configuration is shared
/// read-only with every other worker.
#[derive(Debug)]
pub struct Service {
    config: Arc<InstanceConfig>,
    builder: LoginAttemptBuilder,
    worker: WorkerHandle,
    lease: Mutex<Option<WorkerLease>>,
}

impl Service {
    pub(crate) fn new(
        config: Arc<InstanceConfig>,
        builder: LoginAttemptBuilder,
        worker: WorkerHandle,
        lease: WorkerLease,
    ) -> Self {
        Self {
            config,
            builder,
            worker,
            lease: Mutex::new(Some(lease)),
        }
    }

    /// Auth-type label of the instance.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub const fn worker(&self) -> usize {
        self.worker.worker()
    }

    /// Attempts this worker is waiting on.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.worker.in_flight()
    }

    /// Claim requests carrying both credential fields. No network activity.
    pub fn authorize(&self, request: &mut dyn AuthRequest) -> Verdict {
        if request.credential(CredentialField::UserName).is_none()
            || request.credential(CredentialField::UserPassword).is_none()
        {
            debug!(instance = %self.config.name, "username or password absent, deferring");
            return Verdict::Noop;
        }

        if !request.claim_auth_type(&self.config.name) {
            debug!(instance = %self.config.name, "auth type already claimed, deferring");
            return Verdict::Noop;
        }

        Verdict::Proceed
    }

    /// Validate the credentials with a login against the remote service.
    ///
    /// The future stays pending while the attempt is in flight on this
    /// worker's dispatcher.
    #[tracing::instrument(skip_all, fields(instance = %self.config.name, worker = self.worker.worker()))]
    pub async fn authenticate(&self, request: &mut dyn AuthRequest) -> Verdict {
        let pending = match self.dispatch(&*request) {
            Ok(pending) => pending,
            Err(e) => {
                report(request, e.level(), e.to_string());
                return e.verdict();
            }
        };

        let token = pending.token();
        debug!(%token, "suspended on login attempt");
        let completed = pending.resume().await;
        self.resume(request, completed)
    }

    fn dispatch(&self, request: &dyn AuthRequest) -> Result<PendingAttempt, DomainError> {
        let credential = Credential::from_request(request)?;
        let attempt = self.builder.build(credential)?;
        Ok(self.worker.enqueue(attempt)?)
    }

    fn resume(&self, request: &mut dyn AuthRequest, completed: CompletedAttempt) -> Verdict {
        let result = inspect(completed, self.config.tls.extract_cert_attrs);

        match result.verification {
            Verification::Verified => debug!("TLS peer certificate verified"),
            Verification::NotVerified => warn!("TLS peer certificate not verified"),
            Verification::Unknown => debug!("TLS verification result unavailable"),
        }

        match result.status {
            AttemptStatus::Success => {
                if let Some(attrs) = result.cert_attrs.filter(|attrs| !attrs.is_empty()) {
                    debug!(count = attrs.len(), "attaching certificate attributes");
                    request.attach_attributes(attrs);
                }
                info!("login accepted");
                Verdict::Accept
            }
            AttemptStatus::ProtocolFailure { reason } => {
                report(
                    request,
                    DiagnosticLevel::Info,
                    format!("login rejected by remote service: {reason}"),
                );
                Verdict::Reject
            }
            AttemptStatus::TransportFailure(failure) => {
                report(
                    request,
                    DiagnosticLevel::Warn,
                    format!("transport failure: {failure}"),
                );
                Verdict::Reject
            }
        }
    }

    /// Detach the worker, settling every outstanding attempt.
    ///
    /// Suspended `authenticate` calls resume with a cancellation (Reject);
    /// later calls fail with a resource error. The worker stops counting as
    /// attached once this returns.
    pub async fn detach(&self, mode: DetachMode) -> DetachReport {
        let report = self.worker.detach(mode).await;
        drop(self.lease.lock().take());
        report
    }
}

fn report(request: &mut dyn AuthRequest, level: DiagnosticLevel, message: String) {
    match level {
        DiagnosticLevel::Debug => debug!(%message, "authentication diagnostic"),
        DiagnosticLevel::Info => info!(%message, "authentication diagnostic"),
        DiagnosticLevel::Warn => warn!(%message, "authentication diagnostic"),
        DiagnosticLevel::Error => error!(%message, "authentication diagnostic"),
    }
    request.report(Diagnostic::new(level, message));
}
