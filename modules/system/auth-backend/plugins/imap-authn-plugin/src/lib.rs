#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! IMAP `AuthN` Plugin
//!
//! Authenticates a username/password pair by logging in to an IMAP server.
//! Each host worker gets its own dispatcher which multiplexes many login
//! attempts, suspends the calling request while its attempt is in flight and
//! resumes it with exactly one result.
//!
//! ## Verdicts
//!
//! - **accept**: the server answered the `LOGIN` with a tagged `OK`
//! - **reject**: the server refused the login, or the connection failed
//! - **invalid**: missing or malformed credentials, broken TLS material
//! - **fail**: the worker has no capacity left or is detaching
//!
//! ## Configuration
//!
//! ```yaml
//! name: imap
//! imap_uri: imaps://mail.example.com
//! timeout: 5s
//! max_in_flight: 64
//! tls:
//!   ca_file: /etc/ssl/certs/mail-ca.pem
//!   check_cert: true
//!   check_cert_cn: true
//!   extract_cert_attrs: true
//! ```

pub mod config;
pub mod domain;
pub mod infra;
pub mod module;

pub use domain::Service;
pub use module::ImapAuthNPlugin;
