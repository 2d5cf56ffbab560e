#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Auth Backend SDK
//!
//! This crate provides the public contract between a request-processing host
//! and the authentication backends plugged into it:
//!
//! - [`AuthBackend`] - Pipeline stage trait (`authorize` / `authenticate`)
//! - [`AuthRequest`] - Capabilities the host exposes for one inbound request
//! - [`Verdict`] - Fixed result set returned by every stage
//! - [`AuthBackendError`] - Lifecycle error types
//!
//! ## Usage
//!
//! The host drives each backend worker through both stages:
//!
//! ```ignore
//! use auth_backend_sdk::{AuthBackend, Verdict};
//!
//! if backend.authorize(&mut request) == Verdict::Proceed {
//!     let verdict = backend.authenticate(&mut request).await;
//! }
//! ```

pub mod api;
pub mod error;
pub mod models;
pub mod request;

// Re-export main types at crate root
pub use api::AuthBackend;
pub use error::AuthBackendError;
pub use models::{CertAttribute, CredentialField, Diagnostic, DiagnosticLevel, Verdict};
pub use request::AuthRequest;
