//! Seam between the dispatcher and the network engine.

use async_trait::async_trait;

use super::attempt::{CompletedAttempt, LoginAttempt};

/// Performs the network side of a login attempt.
///
/// Implementations report every failure through the returned
/// [`CompletedAttempt`]; they never panic on remote misbehaviour. The
/// dispatcher enforces the total timeout around this call.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn login(&self, attempt: &LoginAttempt) -> CompletedAttempt;
}
