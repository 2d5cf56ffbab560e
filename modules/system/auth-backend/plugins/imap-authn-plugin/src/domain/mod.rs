pub mod attempt;
pub mod builder;
pub mod client;
pub mod credential;
pub mod error;
pub mod inspector;
pub mod service;
pub mod transport;

pub use error::DomainError;
pub use service::Service;
