//! Engine input port
//!
//! Producers (the screen source, the audio capture worker) push raw input
//! through an [`InputPort`]; the engine reads it back through the paired
//! [`PortReceiver`]. Pushes and the end-of-stream signal share one exclusive
//! section, so nothing can slip in behind the end-of-stream marker.

use crate::error::{Error, Result};
use crate::types::{BufferFlags, RawInput, StreamKind};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a push waits for queue space before reporting a stall
const PUSH_TIMEOUT: Duration = Duration::from_millis(250);

struct PortShared {
    kind: StreamKind,
    /// Guards push and end-of-stream; holds whether EOS was signalled
    gate: Mutex<bool>,
    /// Published after the last send, read by the engine without the lock
    eos: AtomicBool,
    tx: Sender<RawInput>,
}

/// Producer side of an engine's input
#[derive(Clone)]
pub struct InputPort {
    shared: Arc<PortShared>,
}

/// Engine side of an input port
pub struct PortReceiver {
    shared: Arc<PortShared>,
    rx: Receiver<RawInput>,
}

/// What the engine got from its port
#[derive(Debug)]
pub enum PortRead {
    Input(RawInput),
    /// Nothing within the timeout
    Empty,
    /// End of stream signalled and every input consumed
    Drained,
}

impl InputPort {
    /// Create a port with room for `depth` pending inputs
    pub fn channel(kind: StreamKind, depth: usize) -> (InputPort, PortReceiver) {
        let (tx, rx) = bounded(depth.max(1));
        let shared = Arc::new(PortShared {
            kind,
            gate: Mutex::new(false),
            eos: AtomicBool::new(false),
            tx,
        });
        (
            InputPort {
                shared: shared.clone(),
            },
            PortReceiver { shared, rx },
        )
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    /// Queue raw input. A push flagged END_OF_STREAM forwards its payload (if
    /// any) and closes the port.
    pub fn push_input(&self, data: Vec<u8>, timestamp_us: i64, flags: BufferFlags) -> Result<()> {
        let mut eos = self.shared.gate.lock();
        if *eos {
            return Err(Error::EngineState(format!(
                "{} input pushed after end of stream",
                self.shared.kind
            )));
        }

        if !data.is_empty() {
            let input = RawInput {
                data,
                timestamp_us,
                flags,
            };
            match self.shared.tx.send_timeout(input, PUSH_TIMEOUT) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    return Err(Error::InputStalled(format!(
                        "{} engine queue full for {:?}",
                        self.shared.kind, PUSH_TIMEOUT
                    )));
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(Error::EngineState(format!(
                        "{} engine is gone",
                        self.shared.kind
                    )));
                }
            }
        }

        if flags.contains(BufferFlags::END_OF_STREAM) {
            *eos = true;
            self.shared.eos.store(true, Ordering::Release);
            tracing::debug!("{} input closed with final buffer", self.shared.kind);
        }
        Ok(())
    }

    /// Close the port. Idempotent.
    pub fn signal_end_of_stream(&self) {
        let mut eos = self.shared.gate.lock();
        if !*eos {
            *eos = true;
            self.shared.eos.store(true, Ordering::Release);
            tracing::debug!("{} end of stream signalled", self.shared.kind);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.eos.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("kind", &self.shared.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PortReceiver {
    /// Next input, waiting up to `timeout`
    pub fn read(&self, timeout: Duration) -> PortRead {
        // Load the flag before draining: once it is set no further send can land.
        let closed = self.shared.eos.load(Ordering::Acquire);
        match self.rx.try_recv() {
            Ok(input) => return PortRead::Input(input),
            Err(TryRecvError::Disconnected) => return PortRead::Drained,
            Err(TryRecvError::Empty) if closed => return PortRead::Drained,
            Err(TryRecvError::Empty) => {}
        }
        match self.rx.recv_timeout(timeout) {
            Ok(input) => PortRead::Input(input),
            Err(RecvTimeoutError::Timeout) => PortRead::Empty,
            Err(RecvTimeoutError::Disconnected) => PortRead::Drained,
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
