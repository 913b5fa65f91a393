//! Worker threads
//!
//! Connects capture → encode → mux:
//! - one [`EncoderWorker`] per stream kind, pulling engine output into the muxer
//! - one [`CaptureWorker`] for audio, reading the tap into the audio engine
//!
//! Workers are plain OS threads. Each one watches its own stop token and the
//! session-wide abort token, and a fatal error is reported on the failure
//! channel the moment it happens so the session can abort the others.

pub mod capture;
pub mod encoder;

pub use capture::{CaptureReport, CaptureWorker};
pub use encoder::{EncoderReport, EncoderWorker};

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A fatal error raised by a worker
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub worker: String,
    pub message: String,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} worker: {}", self.worker, self.message)
    }
}

/// Where workers report fatal errors
#[derive(Debug, Clone)]
pub struct FailureSink {
    abort: CancellationToken,
    tx: Option<Sender<WorkerFailure>>,
}

impl FailureSink {
    /// Create a sink that cancels `abort` and queues the failure
    pub fn new(abort: CancellationToken) -> (Self, Receiver<WorkerFailure>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { abort, tx: Some(tx) }, rx)
    }

    /// Sink that only cancels `abort`
    pub fn detached(abort: CancellationToken) -> Self {
        Self { abort, tx: None }
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Escalate a fatal error. `Aborted` is the echo of someone else's
    /// failure and is not reported again.
    pub fn report(&self, worker: &str, error: &Error) {
        if matches!(error, Error::Aborted) {
            return;
        }
        tracing::error!("{} worker failed: {}", worker, error);
        self.abort.cancel();
        if let Some(tx) = &self.tx {
            let _ = tx.send(WorkerFailure {
                worker: worker.to_string(),
                message: error.to_string(),
            });
        }
    }
}

/// A spawned worker thread and its stop token
pub struct WorkerHandle<T> {
    name: String,
    stop: CancellationToken,
    thread: Option<JoinHandle<Result<T>>>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Spawn `body` on a named thread
    pub fn spawn<F>(name: impl Into<String>, stop: CancellationToken, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let name = name.into();
        let thread = std::thread::Builder::new()
            .name(format!("screencast-{}", name))
            .spawn(body)
            .map_err(|e| Error::Internal(format!("Failed to spawn {} worker: {}", name, e)))?;
        tracing::debug!("{} worker spawned", name);
        Ok(Self {
            name,
            stop,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to wind down
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the worker and take its result
    pub fn join(mut self) -> Result<T> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| Error::Internal(format!("{} worker already joined", self.name)))?;
        match thread.join() {
            Ok(result) => result,
            Err(_) => Err(Error::Internal(format!("{} worker panicked", self.name))),
        }
    }
}

impl<T> Drop for WorkerHandle<T> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Never joined: let it wind down on its own
            self.stop.cancel();
            tracing::debug!("{} worker handle dropped without join", self.name);
        }
    }
}
