//! Process-wide transport engine.
//!
//! Holds the state every worker shares: the crypto provider and the system
//! trust store. The engine is created by the first [`TransportEngine::acquire`]
//! and torn down when the last holder drops its reference, so it outlives
//! every dispatcher that was instantiated from it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use tracing::{debug, info, warn};

static ENGINE: Mutex<Weak<TransportEngine>> = Mutex::new(Weak::new());

pub struct TransportEngine {
    provider: Arc<CryptoProvider>,
    system_roots: Arc<RootCertStore>,
}

impl TransportEngine {
    /// Return the live engine, initialising it if no holder exists.
    #[must_use]
    pub fn acquire() -> Arc<Self> {
        let mut slot = ENGINE.lock();
        if let Some(engine) = slot.upgrade() {
            debug!("reusing live transport engine");
            return engine;
        }

        let engine = Arc::new(Self::init());
        *slot = Arc::downgrade(&engine);
        engine
    }

    fn init() -> Self {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let loaded = rustls_native_certs::load_native_certs();
        for error in &loaded.errors {
            warn!(error = %error, "failed to load part of the system trust store");
        }
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(loaded.certs);

        info!(
            trust_anchors = added,
            ignored, "transport engine initialised"
        );

        Self {
            provider,
            system_roots: Arc::new(roots),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    #[must_use]
    pub fn system_roots(&self) -> &Arc<RootCertStore> {
        &self.system_roots
    }

    /// Number of live references, this one included.
    #[must_use]
    pub fn holders(this: &Arc<Self>) -> usize {
        Arc::strong_count(this)
    }
}

impl Drop for TransportEngine {
    fn drop(&mut self) {
        info!("transport engine torn down");
    }
}

impl std::fmt::Debug for TransportEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEngine")
            .field("trust_anchors", &self.system_roots.len())
            .finish_non_exhaustive()
    }
}
