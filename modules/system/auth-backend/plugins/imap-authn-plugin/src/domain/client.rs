//! `AuthBackend` implementation for the IMAP plugin.
//!
//! Delegates both stages to the per-worker domain service.

use async_trait::async_trait;
use auth_backend_sdk::{AuthBackend, AuthRequest, Verdict};

use super::service::Service;

#[async_trait]
impl AuthBackend for Service {
    fn authorize(&self, request: &mut dyn AuthRequest) -> Verdict {
        self.authorize(request)
    }

    async fn authenticate(&self, request: &mut dyn AuthRequest) -> Verdict {
        self.authenticate(request).await
    }
}
