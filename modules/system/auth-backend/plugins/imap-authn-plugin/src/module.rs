//! IMAP `AuthN` plugin lifecycle.
//!
//! - `load` validates the configuration and acquires the process-wide
//!   transport engine
//! - `instantiate_worker` starts one dispatcher per host worker
//! - `unload` releases the engine once every worker has detached

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use auth_backend_sdk::AuthBackendError;
use tracing::{info, warn};

use crate::config::{ImapAuthNPluginConfig, InstanceConfig};
use crate::domain::builder::LoginAttemptBuilder;
use crate::domain::transport::Transport;
use crate::domain::Service;
use crate::infra::transport::ImapTransport;
use crate::infra::{TransportEngine, WorkerHandle};

/// One configured instance of the IMAP backend.
pub struct ImapAuthNPlugin {
    config: Arc<InstanceConfig>,
    builder: LoginAttemptBuilder,
    transport: Arc<dyn Transport>,
    attached: Arc<AtomicUsize>,
    next_worker: AtomicUsize,
    engine: Arc<TransportEngine>,
}

impl ImapAuthNPlugin {
    /// Load an instance that logs in over the network.
    ///
    /// # Errors
    ///
    /// Returns `AuthBackendError::Configuration` for an invalid configuration.
    pub fn load(cfg: &ImapAuthNPluginConfig) -> Result<Self, AuthBackendError> {
        Self::with_transport(cfg, Arc::new(ImapTransport))
    }

    /// Load an instance driving `transport` instead of the network.
    ///
    /// # Errors
    ///
    /// Returns `AuthBackendError::Configuration` for an invalid configuration.
    #[tracing::instrument(skip_all, fields(name = %cfg.name))]
    pub fn with_transport(
        cfg: &ImapAuthNPluginConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, AuthBackendError> {
        let config = InstanceConfig::from_config(cfg)
            .map_err(|e| AuthBackendError::Configuration(e.to_string()))?;
        let engine = TransportEngine::acquire();

        info!(
            target = %config.target.authority(),
            security = ?config.target.security,
            timeout = ?config.total_timeout,
            connect_timeout = ?config.connect_timeout,
            max_in_flight = config.max_in_flight,
            extract_cert_attrs = config.tls.extract_cert_attrs,
            "IMAP authn plugin loaded"
        );
        if !config.tls.check_cert {
            warn!("peer certificate verification is disabled");
        }

        let config = Arc::new(config);
        let builder = LoginAttemptBuilder::new(Arc::clone(&config), &engine);

        Ok(Self {
            config,
            builder,
            transport,
            attached: Arc::new(AtomicUsize::new(0)),
            next_worker: AtomicUsize::new(0),
            engine,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn instance(&self) -> &InstanceConfig {
        &self.config
    }

    /// Workers instantiated and not yet dropped or detached.
    #[must_use]
    pub fn attached_workers(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    /// Start the dispatcher for a new worker on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `AuthBackendError::ServiceUnavailable` when the dispatcher
    /// cannot be started.
    pub fn instantiate_worker(&self) -> Result<Service, AuthBackendError> {
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let handle = WorkerHandle::spawn(
            worker,
            Arc::clone(&self.transport),
            Arc::clone(&self.engine),
            self.config.max_in_flight,
        )
        .map_err(|e| AuthBackendError::ServiceUnavailable(e.to_string()))?;

        Ok(Service::new(
            Arc::clone(&self.config),
            self.builder.clone(),
            handle,
            WorkerLease::new(&self.attached),
        ))
    }

    /// Release the instance.
    ///
    /// # Errors
    ///
    /// Hands the plugin back with `AuthBackendError::Busy` while workers are
    /// still attached.
    pub fn unload(self) -> Result<(), (Self, AuthBackendError)> {
        let attached = self.attached_workers();
        if attached > 0 {
            let err = AuthBackendError::Busy(format!("{attached} workers still attached"));
            return Err((self, err));
        }

        info!(
            name = %self.config.name,
            engine_holders = TransportEngine::holders(&self.engine),
            "IMAP authn plugin unloaded"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ImapAuthNPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapAuthNPlugin")
            .field("config", &self.config)
            .field("attached", &self.attached_workers())
            .finish_non_exhaustive()
    }
}

/// Counts a worker as attached for as long as it lives.
#[derive(Debug)]
pub struct WorkerLease(Arc<AtomicUsize>);

impl WorkerLease {
    fn new(attached: &Arc<AtomicUsize>) -> Self {
        attached.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(attached))
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::infra::DetachMode;

    fn cfg() -> ImapAuthNPluginConfig {
        ImapAuthNPluginConfig {
            imap_uri: "imap://127.0.0.1:1".to_owned(),
            ..ImapAuthNPluginConfig::default()
        }
    }

    #[test]
    fn invalid_configuration_is_refused() {
        let err = ImapAuthNPlugin::load(&ImapAuthNPluginConfig::default()).unwrap_err();
        assert!(matches!(err, AuthBackendError::Configuration(_)));
    }

    #[tokio::test]
    async fn unload_waits_for_workers_to_detach() {
        let plugin = ImapAuthNPlugin::load(&cfg()).unwrap();
        let worker = plugin.instantiate_worker().unwrap();
        assert_eq!(plugin.attached_workers(), 1);

        let (plugin, err) = plugin.unload().unwrap_err();
        assert!(matches!(err, AuthBackendError::Busy(_)));

        worker.detach(DetachMode::Cancel).await;
        assert_eq!(plugin.attached_workers(), 0);
        plugin.unload().unwrap();
    }

    #[tokio::test]
    async fn workers_get_distinct_ids() {
        let plugin = ImapAuthNPlugin::load(&cfg()).unwrap();
        let first = plugin.instantiate_worker().unwrap();
        let second = plugin.instantiate_worker().unwrap();
        assert_ne!(first.worker(), second.worker());
        assert_eq!(first.name(), "imap");
    }
}
