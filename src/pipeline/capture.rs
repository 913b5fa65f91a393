//! Audio capture worker
//!
//! Reads fixed-size PCM blocks from the audio tap and pushes them into the
//! audio engine's input port, timestamped at read time. Once stopped it does
//! one last read, closes the port with it, and releases the tap.

use super::FailureSink;
use crate::capture::{AudioSource, ReadError};
use crate::encode::InputPort;
use crate::error::{Error, Result};
use crate::types::{monotonic_us, BufferFlags};

use tokio_util::sync::CancellationToken;

/// What a capture worker did over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    /// Blocks pushed into the engine
    pub blocks: u64,
    pub bytes: u64,
    /// Reads that failed benignly
    pub skipped: u64,
    /// Reads that returned nothing
    pub empty_reads: u64,
    /// Blocks the engine had no room for
    pub stalled: u64,
    /// Whether the final read carried data
    pub final_block: bool,
}

/// Audio capture worker
pub struct CaptureWorker {
    source: Box<dyn AudioSource>,
    port: InputPort,
    block_bytes: usize,
    stop: CancellationToken,
    failures: FailureSink,
    released: bool,
}

impl CaptureWorker {
    pub fn new(
        source: Box<dyn AudioSource>,
        port: InputPort,
        block_bytes: usize,
        stop: CancellationToken,
        failures: FailureSink,
    ) -> Self {
        Self {
            source,
            port,
            block_bytes: block_bytes.max(2),
            stop,
            failures,
            released: false,
        }
    }

    pub fn spawn(self) -> Result<super::WorkerHandle<CaptureReport>> {
        let stop = self.stop.clone();
        super::WorkerHandle::spawn("audio-capture", stop, move || self.run())
    }

    /// Capture until stopped or aborted; the tap is released either way
    pub fn run(mut self) -> Result<CaptureReport> {
        let mut report = CaptureReport::default();
        tracing::info!(
            "Audio capture worker started: {} @ {}Hz, {}ch, {} byte blocks",
            self.source.name(),
            self.source.sample_rate(),
            self.source.channels(),
            self.block_bytes
        );

        let result = self
            .capture(&mut report)
            .and_then(|()| self.finish(&mut report));
        self.release_source();

        match result {
            Ok(()) => {
                tracing::info!(
                    "Audio capture worker finished: {} blocks, {} skipped, {} stalled",
                    report.blocks,
                    report.skipped,
                    report.stalled
                );
                Ok(report)
            }
            Err(e) => {
                // The encoder must still see an end of stream
                self.port.signal_end_of_stream();
                self.failures.report("audio-capture", &e);
                Err(e)
            }
        }
    }

    fn release_source(&mut self) {
        if !self.released {
            self.released = true;
            self.source.release();
        }
    }

    fn capture(&mut self, report: &mut CaptureReport) -> Result<()> {
        let abort = self.failures.abort_token().clone();
        let mut block = vec![0u8; self.block_bytes];

        while !self.stop.is_cancelled() {
            if abort.is_cancelled() {
                return Err(Error::Aborted);
            }

            let timestamp_us = monotonic_us();
            match self.source.read(&mut block) {
                Ok(0) => report.empty_reads += 1,
                Ok(n) => match self.port.push_input(block[..n].to_vec(), timestamp_us, BufferFlags::NONE) {
                    Ok(()) => {
                        report.blocks += 1;
                        report.bytes += n as u64;
                    }
                    Err(e) if e.is_recoverable() => {
                        report.stalled += 1;
                        tracing::debug!("Audio block dropped: {}", e);
                    }
                    Err(e) => return Err(e),
                },
                Err(e) if e.is_benign() => {
                    report.skipped += 1;
                    tracing::debug!("Audio read skipped: {}", e);
                }
                Err(e) => return Err(Error::AudioCapture(e.to_string())),
            }
        }
        Ok(())
    }

    /// Exactly one read after stop; its data (if any) goes out with the
    /// end-of-stream flag
    fn finish(&mut self, report: &mut CaptureReport) -> Result<()> {
        let mut block = vec![0u8; self.block_bytes];
        let timestamp_us = monotonic_us();

        match self.source.read(&mut block) {
            Ok(n) if n > 0 => {
                match self
                    .port
                    .push_input(block[..n].to_vec(), timestamp_us, BufferFlags::END_OF_STREAM)
                {
                    Ok(()) => {
                        report.blocks += 1;
                        report.bytes += n as u64;
                        report.final_block = true;
                    }
                    Err(e) if e.is_recoverable() => {
                        report.stalled += 1;
                        tracing::debug!("Final audio block dropped: {}", e);
                        self.port.signal_end_of_stream();
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(_) => self.port.signal_end_of_stream(),
            Err(e @ (ReadError::BadValue(_) | ReadError::InvalidOperation(_))) => {
                report.skipped += 1;
                tracing::debug!("Final audio read skipped: {}", e);
                self.port.signal_end_of_stream();
            }
            Err(ReadError::Fatal(msg)) => return Err(Error::AudioCapture(msg)),
        }
        Ok(())
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        // A worker whose thread never ran still owns the tap
        self.release_source();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioFeed, ManualAudio};
    use crate::encode::{PortRead, PortReceiver};
    use crate::types::StreamKind;
    use std::time::Duration;

    fn setup() -> (CaptureWorker, AudioFeed, PortReceiver, CancellationToken, CancellationToken) {
        let (source, feed) = ManualAudio::new(44_100, 1);
        let (port, rx) = InputPort::channel(StreamKind::Audio, 16);
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let worker = CaptureWorker::new(
            Box::new(source),
            port,
            4,
            stop.clone(),
            FailureSink::detached(abort.clone()),
        );
        (worker, feed, rx, stop, abort)
    }

    fn drain(rx: &PortReceiver) -> Vec<(Vec<u8>, BufferFlags)> {
        let mut out = Vec::new();
        loop {
            match rx.read(Duration::from_millis(5)) {
                PortRead::Input(input) => out.push((input.data, input.flags)),
                PortRead::Empty => continue,
                PortRead::Drained => return out,
            }
        }
    }

    #[test]
    fn test_unrun_worker_releases_source() {
        let (worker, feed, _rx, _stop, _abort) = setup();
        drop(worker);
        assert_eq!(feed.release_count(), 1);
        assert_eq!(feed.reads(), 0);
    }

    #[test]
    fn test_final_block_carries_eos() {
        let (worker, feed, rx, stop, _abort) = setup();
        stop.cancel();
        feed.push_block(vec![1, 2, 3, 4]);

        let report = worker.run().unwrap();
        assert!(report.final_block);
        assert_eq!(feed.release_count(), 1);
        assert_eq!(feed.reads(), 1);

        let inputs = drain(&rx);
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].1.contains(BufferFlags::END_OF_STREAM));
    }

    #[test]
    fn test_benign_final_error_still_closes() {
        let (worker, feed, rx, stop, _abort) = setup();
        stop.cancel();
        feed.push_error(ReadError::InvalidOperation("stopped".into()));

        let report = worker.run().unwrap();
        assert!(!report.final_block);
        assert_eq!(report.skipped, 1);
        assert!(drain(&rx).is_empty());
        assert_eq!(feed.release_count(), 1);
    }

    #[test]
    fn test_benign_errors_skip_blocks() {
        let (worker, feed, rx, stop, _abort) = setup();
        feed.push_block(vec![1, 1, 1, 1]);
        feed.push_error(ReadError::BadValue("glitch".into()));
        feed.push_block(vec![2, 2, 2, 2]);

        let handle = worker.spawn().unwrap();
        while feed.pending() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.request_stop();
        let report = handle.join().unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.blocks, 2);
        let inputs = drain(&rx);
        assert_eq!(inputs[0].0, vec![1, 1, 1, 1]);
        assert_eq!(inputs[1].0, vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_fatal_error_fails_and_aborts() {
        let (worker, feed, rx, _stop, abort) = setup();
        feed.push_error(ReadError::Fatal("device unplugged".into()));

        let err = worker.run().unwrap_err();
        assert!(matches!(err, Error::AudioCapture(_)));
        assert!(abort.is_cancelled());
        assert_eq!(feed.release_count(), 1);
        // Port closed so the encoder can drain
        assert!(drain(&rx).is_empty());
    }
}
