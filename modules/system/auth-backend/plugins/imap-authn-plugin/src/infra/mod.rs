pub mod dispatcher;
pub mod engine;
pub mod transport;

pub use dispatcher::{DetachMode, DetachReport, DispatchError, PendingAttempt, WorkerHandle};
pub use engine::TransportEngine;
