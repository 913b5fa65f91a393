//! Shared engine bookkeeping
//!
//! [`EngineCore`] carries the parts every backend has in common: lifecycle
//! checks, the input port, the finite output slot pool and the ordering of
//! output events (format first, codec config next, then data, then the
//! end-of-stream buffer). A backend only supplies an [`EncodeStep`].

use super::{expect_kind, EngineOptions, EngineState, InputPort, OutputEvent, PortRead, PortReceiver};
use crate::error::{Error, Result};
use crate::types::{Buffer, BufferFlags, MediaFormat, RawInput, StreamKind};
use std::collections::VecDeque;
use std::time::Duration;

/// The compression step of a backend
pub trait EncodeStep: Send {
    /// Encode one raw input, appending any finished buffers to `out`
    fn encode(&mut self, input: RawInput, out: &mut VecDeque<Buffer>) -> Result<()>;

    /// Emit everything still held back once input has ended
    fn flush(&mut self, out: &mut VecDeque<Buffer>) -> Result<()>;
}

/// Fixed set of output buffer slots
#[derive(Debug, Clone)]
pub struct SlotPool {
    outstanding: Vec<bool>,
}

impl SlotPool {
    pub fn new(size: usize) -> Self {
        Self {
            outstanding: vec![false; size.max(1)],
        }
    }

    pub fn acquire(&mut self) -> Option<usize> {
        let index = self.outstanding.iter().position(|busy| !busy)?;
        self.outstanding[index] = true;
        Some(index)
    }

    /// Returns false if the slot was not handed out
    pub fn release(&mut self, index: usize) -> bool {
        match self.outstanding.get_mut(index) {
            Some(busy) if *busy => {
                *busy = false;
                true
            }
            _ => false,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.iter().filter(|busy| **busy).count()
    }

    pub fn capacity(&self) -> usize {
        self.outstanding.len()
    }
}

/// Lifecycle and output sequencing shared by all backends
pub struct EngineCore {
    kind: StreamKind,
    state: EngineState,
    options: EngineOptions,
    requested: Option<MediaFormat>,
    output_format: Option<MediaFormat>,
    port: Option<InputPort>,
    receiver: Option<PortReceiver>,
    slots: SlotPool,
    pending: VecDeque<Buffer>,
    format_announced: bool,
    config_sent: bool,
    flushed: bool,
    eos_emitted: bool,
    last_timestamp_us: i64,
}

impl EngineCore {
    pub fn new(kind: StreamKind, options: EngineOptions) -> Self {
        Self {
            kind,
            state: EngineState::Created,
            options,
            requested: None,
            output_format: None,
            port: None,
            receiver: None,
            slots: SlotPool::new(options.output_slots),
            pending: VecDeque::new(),
            format_announced: false,
            config_sent: false,
            flushed: false,
            eos_emitted: false,
            last_timestamp_us: 0,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn require(&self, expected: EngineState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::EngineState(format!(
                "{} {} requires state {}, engine is {}",
                self.kind, op, expected, self.state
            )));
        }
        Ok(())
    }

    fn transition(&mut self, to: EngineState) {
        tracing::trace!("{} engine {} -> {}", self.kind, self.state, to);
        self.state = to;
    }

    /// Record the requested format (Created -> Configured)
    pub fn configure(&mut self, format: &MediaFormat) -> Result<()> {
        if self.state != EngineState::Created {
            return Err(Error::EngineConfig(format!(
                "{} engine already configured (state {})",
                self.kind, self.state
            )));
        }
        expect_kind(format, self.kind)?;
        self.requested = Some(format.clone());
        self.transition(EngineState::Configured);
        Ok(())
    }

    pub fn requested_format(&self) -> Option<&MediaFormat> {
        self.requested.as_ref()
    }

    /// Set the negotiated format announced on the first pull
    pub fn set_output_format(&mut self, format: MediaFormat) {
        self.output_format = Some(format);
    }

    pub fn output_format(&self) -> Option<&MediaFormat> {
        self.output_format.as_ref()
    }

    /// Open the input port (Configured -> Running)
    pub fn start(&mut self) -> Result<()> {
        self.require(EngineState::Configured, "start")?;
        if self.output_format.is_none() {
            return Err(Error::EngineState(format!(
                "{} engine has no output format",
                self.kind
            )));
        }
        let (port, receiver) = InputPort::channel(self.kind, self.options.input_queue_depth);
        self.port = Some(port);
        self.receiver = Some(receiver);
        self.transition(EngineState::Running);
        Ok(())
    }

    pub fn input_port(&self) -> Result<InputPort> {
        match (&self.port, self.state) {
            (_, EngineState::Released) | (None, _) => Err(Error::EngineState(format!(
                "{} engine has no open input (state {})",
                self.kind, self.state
            ))),
            (Some(port), _) => Ok(port.clone()),
        }
    }

    /// Produce the next output event
    pub fn pull<E: EncodeStep + ?Sized>(
        &mut self,
        step: &mut E,
        timeout: Duration,
    ) -> Result<OutputEvent> {
        if !matches!(self.state, EngineState::Running | EngineState::Draining) {
            return Err(Error::EngineState(format!(
                "{} pull_output in state {}",
                self.kind, self.state
            )));
        }
        if self.eos_emitted {
            return Err(Error::EngineState(format!(
                "{} pull_output after end of stream",
                self.kind
            )));
        }

        if !self.format_announced {
            let format = self.output_format.clone().ok_or_else(|| {
                Error::EngineState(format!("{} engine has no output format", self.kind))
            })?;
            self.format_announced = true;
            return Ok(OutputEvent::FormatChanged(format));
        }

        let Some(index) = self.slots.acquire() else {
            // Every slot is held by the consumer
            std::thread::sleep(timeout);
            return Ok(OutputEvent::TryAgain);
        };

        match self.next_buffer(step, timeout) {
            Ok(Some(buffer)) => Ok(OutputEvent::Buffer { index, buffer }),
            Ok(None) => {
                self.slots.release(index);
                Ok(OutputEvent::TryAgain)
            }
            Err(e) => {
                self.slots.release(index);
                Err(e)
            }
        }
    }

    fn next_buffer<E: EncodeStep + ?Sized>(
        &mut self,
        step: &mut E,
        timeout: Duration,
    ) -> Result<Option<Buffer>> {
        if !self.config_sent {
            self.config_sent = true;
            let private = self
                .output_format
                .as_ref()
                .map(|f| f.codec_private().to_vec())
                .unwrap_or_default();
            if !private.is_empty() {
                return Ok(Some(Buffer::new(private, 0, BufferFlags::CODEC_CONFIG)));
            }
        }

        if let Some(buffer) = self.take_pending() {
            return Ok(Some(buffer));
        }

        if !self.flushed {
            let receiver = self.receiver.as_ref().ok_or_else(|| {
                Error::EngineState(format!("{} engine input is closed", self.kind))
            })?;
            match receiver.read(timeout) {
                PortRead::Input(input) => {
                    step.encode(input, &mut self.pending)?;
                    return Ok(self.take_pending());
                }
                PortRead::Empty => return Ok(None),
                PortRead::Drained => {
                    self.transition(EngineState::Draining);
                    step.flush(&mut self.pending)?;
                    self.flushed = true;
                    if let Some(buffer) = self.take_pending() {
                        return Ok(Some(buffer));
                    }
                }
            }
        }

        self.eos_emitted = true;
        tracing::debug!("{} engine emitting end of stream", self.kind);
        Ok(Some(Buffer::end_of_stream(self.last_timestamp_us)))
    }

    fn take_pending(&mut self) -> Option<Buffer> {
        let buffer = self.pending.pop_front()?;
        self.last_timestamp_us = self.last_timestamp_us.max(buffer.timestamp_us());
        Some(buffer)
    }

    pub fn release_output(&mut self, index: usize) -> Result<()> {
        if self.state == EngineState::Released {
            return Err(Error::EngineState(format!(
                "{} release_output on released engine",
                self.kind
            )));
        }
        if !self.slots.release(index) {
            return Err(Error::EngineState(format!(
                "{} output slot {} was not handed out",
                self.kind, index
            )));
        }
        Ok(())
    }

    pub fn eos_emitted(&self) -> bool {
        self.eos_emitted
    }

    /// Draining -> Stopped, only once the end-of-stream buffer went out
    pub fn stop(&mut self) -> Result<()> {
        if !self.eos_emitted {
            return Err(Error::EngineState(format!(
                "{} stop before end of stream (state {})",
                self.kind, self.state
            )));
        }
        self.require(EngineState::Draining, "stop")?;
        self.transition(EngineState::Stopped);
        Ok(())
    }

    /// Stopped -> Released
    pub fn release(&mut self) -> Result<()> {
        if self.state == EngineState::Released {
            return Err(Error::EngineState(format!(
                "{} engine already released",
                self.kind
            )));
        }
        self.require(EngineState::Stopped, "release")?;
        self.receiver = None;
        self.port = None;
        self.pending.clear();
        self.transition(EngineState::Released);
        Ok(())
    }

    /// Any state -> Released, without draining. Returns false if already released.
    pub fn abort(&mut self) -> bool {
        if self.state == EngineState::Released {
            return false;
        }
        tracing::debug!("{} engine aborted in state {}", self.kind, self.state);
        self.receiver = None;
        self.port = None;
        self.pending.clear();
        self.transition(EngineState::Released);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_pool() {
        let mut pool = SlotPool::new(2);
        assert_eq!(pool.acquire(), Some(0));
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), None);
        assert!(pool.release(0));
        assert!(!pool.release(0));
        assert!(!pool.release(9));
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.acquire(), Some(0));
    }
}
