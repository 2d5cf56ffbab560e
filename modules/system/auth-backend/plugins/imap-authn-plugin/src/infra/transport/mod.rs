//! Network transport: TLS context initialisation and the IMAP exchange.

pub mod imap;
pub mod protocol;
pub mod tls;

pub use imap::ImapTransport;
pub use tls::{TlsInitError, TlsMaterial, policy_for};
