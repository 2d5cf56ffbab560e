//! Pipeline stage trait for authentication backends.
//!
//! The host calls `authorize` while building the request's processing plan
//! and `authenticate` once the request reached the backend that claimed it.

use async_trait::async_trait;

use crate::models::Verdict;
use crate::request::AuthRequest;

/// Stage interface implemented by every backend worker.
///
/// One value implementing this trait exists per host worker, so an
/// implementation may keep worker-exclusive resources without locking.
///
/// ```ignore
/// let verdict = match backend.authorize(&mut request) {
///     Verdict::Proceed => backend.authenticate(&mut request).await,
///     other => other,
/// };
/// ```
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Decide whether this backend should handle the request.
    ///
    /// Must not perform network activity. Returns [`Verdict::Noop`] to defer
    /// to other backends, or [`Verdict::Proceed`] after claiming the request.
    fn authorize(&self, request: &mut dyn AuthRequest) -> Verdict;

    /// Validate the request's credentials.
    ///
    /// The returned future stays pending while the backend waits for remote
    /// I/O; the host is free to schedule other requests in the meantime.
    /// Resolves to one of [`Verdict::Accept`], [`Verdict::Reject`],
    /// [`Verdict::Invalid`] or [`Verdict::Fail`].
    async fn authenticate(&self, request: &mut dyn AuthRequest) -> Verdict;
}
