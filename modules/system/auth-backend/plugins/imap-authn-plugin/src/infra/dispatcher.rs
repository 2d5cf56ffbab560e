//! Per-worker dispatcher.
//!
//! Each worker owns one driver task. The driver owns the multiplexing handle
//! (a `JoinSet` of attempt futures) together with the map from in-flight
//! attempts to the one-shot channel of the suspended caller. Nothing else
//! touches either, so no lock is taken on the hot path.
//!
//! A completion is delivered by removing the caller's sender from the map and
//! consuming it, which makes a second delivery for the same attempt
//! impossible. Timeouts and panics are turned into completions inside the
//! attempt future itself; detach force-completes whatever is still running.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc, oneshot};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tracing::{Instrument, debug, debug_span, info, info_span, warn};

use crate::domain::attempt::{AttemptStatus, CompletedAttempt, LoginAttempt, TransportFailure};
use crate::domain::transport::Transport;
use crate::infra::engine::TransportEngine;

/// Identifies one enqueued attempt for the lifetime of its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptToken(u64);

impl fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why an attempt could not be enqueued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{limit} attempts already in flight on this worker")]
    QueueFull { limit: usize },

    #[error("worker is detached")]
    Detached,

    #[error("malformed login attempt: {0}")]
    Malformed(String),

    #[error("no async runtime available to drive the worker")]
    NoRuntime,
}

/// How to treat attempts still in flight when a worker detaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetachMode {
    /// Force-complete everything immediately.
    #[default]
    Cancel,
    /// Let attempts finish for up to `grace`, then force-complete the rest.
    Drain { grace: Duration },
}

/// What happened to the attempts that were outstanding at detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetachReport {
    /// Finished on their own while the worker was detaching.
    pub completed: usize,
    /// Completed with a cancellation failure.
    pub cancelled: usize,
}

enum Command {
    Enqueue {
        token: AttemptToken,
        attempt: LoginAttempt,
        permit: OwnedSemaphorePermit,
        reply: oneshot::Sender<CompletedAttempt>,
    },
    Detach {
        mode: DetachMode,
        done: oneshot::Sender<DetachReport>,
    },
}

/// A suspended caller's side of an enqueued attempt.
#[derive(Debug)]
#[must_use = "an attempt's completion is lost unless resumed"]
pub struct PendingAttempt {
    token: AttemptToken,
    completion: oneshot::Receiver<CompletedAttempt>,
}

impl PendingAttempt {
    #[must_use]
    pub const fn token(&self) -> AttemptToken {
        self.token
    }

    /// Wait for the attempt's single completion.
    pub async fn resume(self) -> CompletedAttempt {
        self.completion
            .await
            .unwrap_or_else(|_| CompletedAttempt::cancelled())
    }
}

/// A worker's entry point into its dispatcher.
#[derive(Debug)]
pub struct WorkerHandle {
    worker: usize,
    commands: mpsc::UnboundedSender<Command>,
    permits: Arc<Semaphore>,
    limit: usize,
    next_token: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Start the driver for `worker` on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::NoRuntime` outside a tokio runtime and
    /// `DispatchError::Malformed` for a zero in-flight bound.
    pub fn spawn(
        worker: usize,
        transport: Arc<dyn Transport>,
        engine: Arc<TransportEngine>,
        max_in_flight: usize,
    ) -> Result<Self, DispatchError> {
        if max_in_flight == 0 {
            return Err(DispatchError::Malformed(
                "in-flight bound must be positive".to_owned(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        let permits = Arc::new(Semaphore::new(max_in_flight));
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            in_flight: JoinSet::new(),
            pending: HashMap::new(),
            permits: Arc::clone(&permits),
            transport,
            _engine: engine,
        };
        let driver = runtime.spawn(driver.run(rx).instrument(info_span!("imap_worker", worker)));

        info!(worker, max_in_flight, "worker dispatcher started");
        Ok(Self {
            worker,
            commands,
            permits,
            limit: max_in_flight,
            next_token: AtomicU64::new(1),
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Register `attempt` with the worker and return immediately.
    ///
    /// The completion channel exists before the attempt reaches the driver,
    /// so its result cannot be missed.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError` when the attempt is malformed, the worker is at
    /// its in-flight bound, or the worker has detached.
    pub fn enqueue(&self, attempt: LoginAttempt) -> Result<PendingAttempt, DispatchError> {
        if attempt.total_timeout.is_zero() || attempt.connect_timeout.is_zero() {
            return Err(DispatchError::Malformed("zero timeout".to_owned()));
        }

        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => DispatchError::QueueFull { limit: self.limit },
                TryAcquireError::Closed => DispatchError::Detached,
            })?;

        let token = AttemptToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (reply, completion) = oneshot::channel();
        self.commands
            .send(Command::Enqueue {
                token,
                attempt,
                permit,
                reply,
            })
            .map_err(|_| DispatchError::Detached)?;

        debug!(worker = self.worker, %token, "attempt enqueued");
        Ok(PendingAttempt { token, completion })
    }

    /// Attempts registered and not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.permits.available_permits())
    }

    #[must_use]
    pub const fn worker(&self) -> usize {
        self.worker
    }

    /// Stop accepting attempts and settle every outstanding one.
    ///
    /// Callers suspended on this worker are resumed before this returns, so
    /// it may run while they still borrow the handle. Returns once the driver,
    /// and with it the multiplexing handle, is gone. Later calls find the
    /// driver gone and report nothing.
    pub async fn detach(&self, mode: DetachMode) -> DetachReport {
        let (done, report) = oneshot::channel();
        let report = if self.commands.send(Command::Detach { mode, done }).is_ok() {
            report.await.unwrap_or_default()
        } else {
            DetachReport::default()
        };

        let driver = self.driver.lock().take();
        let Some(driver) = driver else {
            return report;
        };
        if let Err(e) = driver.await {
            warn!(worker = self.worker, error = %e, "worker driver ended abnormally");
        }
        info!(
            worker = self.worker,
            completed = report.completed,
            cancelled = report.cancelled,
            "worker detached"
        );
        report
    }
}

struct Waiter {
    token: AttemptToken,
    reply: oneshot::Sender<CompletedAttempt>,
    permit: OwnedSemaphorePermit,
}

enum Delivery {
    Completed,
    Cancelled,
    Orphaned,
}

/// Owns the multiplexing handle of one worker.
///
/// Field order matters: the attempt set is dropped before the engine
/// reference.
struct Driver {
    in_flight: JoinSet<CompletedAttempt>,
    pending: HashMap<Id, Waiter>,
    permits: Arc<Semaphore>,
    transport: Arc<dyn Transport>,
    _engine: Arc<TransportEngine>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (mode, done) = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Enqueue { token, attempt, permit, reply }) => {
                        self.start(token, attempt, permit, reply);
                    }
                    Some(Command::Detach { mode, done }) => break (mode, Some(done)),
                    None => break (DetachMode::Cancel, None),
                },
                Some(joined) = self.in_flight.join_next_with_id(), if !self.in_flight.is_empty() => {
                    self.settle(joined);
                }
            }
        };

        let report = self.shutdown(mode, &mut commands).await;
        if let Some(done) = done {
            // The detaching side may have given up waiting.
            let _ = done.send(report);
        }
    }

    fn start(
        &mut self,
        token: AttemptToken,
        attempt: LoginAttempt,
        permit: OwnedSemaphorePermit,
        reply: oneshot::Sender<CompletedAttempt>,
    ) {
        let transport = Arc::clone(&self.transport);
        let total = attempt.total_timeout;
        let task = async move {
            let login = AssertUnwindSafe(transport.login(&attempt)).catch_unwind();
            match tokio::time::timeout(total, login).await {
                Ok(Ok(completed)) => completed,
                Ok(Err(panic)) => CompletedAttempt::transport_failure(TransportFailure::Internal(
                    panic_message(panic.as_ref()),
                )),
                Err(_) => CompletedAttempt::transport_failure(TransportFailure::Timeout {
                    phase: "attempt",
                    after: total,
                }),
            }
        };

        let id = self
            .in_flight
            .spawn(task.instrument(debug_span!("attempt", %token)))
            .id();
        self.pending.insert(
            id,
            Waiter {
                token,
                reply,
                permit,
            },
        );
    }

    fn settle(&mut self, joined: Result<(Id, CompletedAttempt), JoinError>) -> Delivery {
        settle_into(&mut self.pending, joined)
    }

    async fn shutdown(
        &mut self,
        mode: DetachMode,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> DetachReport {
        let mut report = DetachReport::default();

        self.permits.close();
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Enqueue { token, reply, .. } = command {
                debug!(%token, "cancelling attempt queued behind detach");
                if reply.send(CompletedAttempt::cancelled()).is_err() {
                    debug!(%token, "caller went away before completion");
                }
                report.record(&Delivery::Cancelled);
            }
        }

        if let DetachMode::Drain { grace } = mode {
            let (in_flight, pending) = (&mut self.in_flight, &mut self.pending);
            let drain = async {
                while let Some(joined) = in_flight.join_next_with_id().await {
                    report.record(&settle_into(pending, joined));
                }
            };
            if tokio::time::timeout(grace, drain).await.is_err() {
                debug!(remaining = self.in_flight.len(), "drain grace elapsed");
            }
        }

        self.in_flight.abort_all();
        while let Some(joined) = self.in_flight.join_next_with_id().await {
            report.record(&self.settle(joined));
        }

        for (_, waiter) in self.pending.drain() {
            report.record(&deliver(waiter, CompletedAttempt::cancelled()));
        }
        report
    }
}

impl DetachReport {
    fn record(&mut self, delivery: &Delivery) {
        match delivery {
            Delivery::Completed => self.completed += 1,
            Delivery::Cancelled => self.cancelled += 1,
            Delivery::Orphaned => {}
        }
    }
}

fn settle_into(
    pending: &mut HashMap<Id, Waiter>,
    joined: Result<(Id, CompletedAttempt), JoinError>,
) -> Delivery {
    let (id, completed) = match joined {
        Ok(done) => done,
        Err(e) if e.is_cancelled() => (e.id(), CompletedAttempt::cancelled()),
        Err(e) => (
            e.id(),
            CompletedAttempt::transport_failure(TransportFailure::Internal(e.to_string())),
        ),
    };

    let Some(waiter) = pending.remove(&id) else {
        warn!(task = %id, "completion for an unknown attempt");
        return Delivery::Orphaned;
    };
    deliver(waiter, completed)
}

/// Hand `completed` to the suspended caller, consuming its sender.
fn deliver(waiter: Waiter, completed: CompletedAttempt) -> Delivery {
    let cancelled = matches!(
        completed.status,
        AttemptStatus::TransportFailure(TransportFailure::Cancelled(_))
    );
    debug!(token = %waiter.token, cancelled, "attempt completed");
    // The slot is free before the caller can observe the completion.
    drop(waiter.permit);
    if waiter.reply.send(completed).is_err() {
        debug!(token = %waiter.token, "caller went away before completion");
    }
    if cancelled {
        Delivery::Cancelled
    } else {
        Delivery::Completed
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("attempt panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("attempt panicked: {message}")
    } else {
        "attempt panicked".to_owned()
    }
}
