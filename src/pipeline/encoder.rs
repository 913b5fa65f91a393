//! Encoder worker
//!
//! Pulls one engine's output into the muxer: registers the track on the
//! format announcement, forwards samples, returns every output slot, and on
//! end of stream stops and releases the engine before marking the stream
//! complete.

use super::FailureSink;
use crate::encode::{CodecEngine, EngineState, OutputEvent};
use crate::error::{Error, Result};
use crate::output::{Muxer, TrackId, WriteOutcome};
use crate::types::{Buffer, StreamKind};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What an encoder worker did over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncoderReport {
    pub track: Option<TrackId>,
    /// Samples accepted by the muxer
    pub written: u64,
    /// Samples dropped because the muxer had not started
    pub dropped_not_started: u64,
    /// Samples dropped for going back in time
    pub dropped_regressions: u64,
    /// Codec config and empty buffers
    pub skipped: u64,
    pub end_of_stream_us: Option<i64>,
}

impl EncoderReport {
    pub fn dropped(&self) -> u64 {
        self.dropped_not_started + self.dropped_regressions
    }
}

/// Encoder worker for one stream kind
pub struct EncoderWorker {
    kind: StreamKind,
    engine: Box<dyn CodecEngine>,
    muxer: Arc<Muxer>,
    stop: CancellationToken,
    failures: FailureSink,
    poll_timeout: Duration,
    drain_timeout: Duration,
}

impl EncoderWorker {
    /// The engine must already be running
    pub fn new(
        engine: Box<dyn CodecEngine>,
        muxer: Arc<Muxer>,
        stop: CancellationToken,
        failures: FailureSink,
    ) -> Self {
        Self {
            kind: engine.kind(),
            engine,
            muxer,
            stop,
            failures,
            poll_timeout: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Run on a worker thread
    pub fn spawn(self) -> Result<super::WorkerHandle<EncoderReport>> {
        let name = format!("{}-encoder", self.kind);
        let stop = self.stop.clone();
        super::WorkerHandle::spawn(name, stop, move || self.run())
    }

    /// Run until end of stream, abort or failure
    pub fn run(mut self) -> Result<EncoderReport> {
        let mut report = EncoderReport::default();
        tracing::info!("{} encoder worker started", self.kind);

        match self.pump(&mut report) {
            Ok(()) => {
                tracing::info!(
                    "{} encoder worker finished: {} written, {} dropped before start, {} out of order",
                    self.kind,
                    report.written,
                    report.dropped_not_started,
                    report.dropped_regressions
                );
                Ok(report)
            }
            Err(e) => {
                self.failures.report(&format!("{}-encoder", self.kind), &e);
                self.teardown();
                Err(e)
            }
        }
    }

    /// Free the engine without draining it
    fn teardown(&mut self) {
        if self.engine.state() == EngineState::Released {
            return;
        }
        if let Err(e) = self.engine.abort() {
            tracing::warn!("{} engine teardown failed: {}", self.kind, e);
        }
    }

    fn pump(&mut self, report: &mut EncoderReport) -> Result<()> {
        let abort = self.failures.abort_token().clone();
        let mut drain_deadline: Option<Instant> = None;

        loop {
            if abort.is_cancelled() {
                tracing::debug!("{} encoder worker aborted", self.kind);
                return Err(Error::Aborted);
            }
            if drain_deadline.is_none() && self.stop.is_cancelled() {
                tracing::debug!("{} encoder draining", self.kind);
                drain_deadline = Some(Instant::now() + self.drain_timeout);
            }
            if drain_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(Error::DrainTimeout(self.kind));
            }

            match self.engine.pull_output(self.poll_timeout)? {
                OutputEvent::TryAgain => continue,
                OutputEvent::FormatChanged(format) => {
                    if report.track.is_some() {
                        return Err(Error::ProtocolViolation(format!(
                            "{} engine changed format twice",
                            self.kind
                        )));
                    }
                    report.track = Some(self.muxer.add_track(self.kind, &format)?);
                }
                OutputEvent::Buffer { index, buffer } => {
                    let end_of_stream = buffer.is_end_of_stream();
                    let timestamp_us = buffer.timestamp_us();
                    let forwarded = self.forward(buffer, report);
                    self.engine.release_output(index)?;
                    forwarded?;

                    if end_of_stream {
                        report.end_of_stream_us = Some(timestamp_us);
                        self.engine.stop()?;
                        self.engine.release()?;
                        self.muxer.mark_complete(self.kind);
                        tracing::debug!("{} end of stream at {}us", self.kind, timestamp_us);
                        return Ok(());
                    }
                }
            }
        }
    }

    fn forward(&self, buffer: Buffer, report: &mut EncoderReport) -> Result<()> {
        let buffer = buffer.strip_codec_config();
        if buffer.is_empty() {
            report.skipped += 1;
            return Ok(());
        }
        let track = report.track.ok_or_else(|| {
            Error::ProtocolViolation(format!("{} data before format announcement", self.kind))
        })?;

        match self.muxer.write_sample(track, &buffer) {
            Ok(WriteOutcome::Written) => report.written += 1,
            Ok(WriteOutcome::Dropped) => report.skipped += 1,
            Err(Error::NotStarted) => {
                report.dropped_not_started += 1;
                tracing::debug!(
                    "{} sample at {}us dropped, muxer not started",
                    self.kind,
                    buffer.timestamp_us()
                );
            }
            Err(e @ Error::TimestampRegression { .. }) => {
                report.dropped_regressions += 1;
                tracing::warn!("Dropping sample: {}", e);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl Drop for EncoderWorker {
    fn drop(&mut self) {
        // Covers a worker whose thread never ran
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Container, RecorderConfig};
    use crate::encode::{EngineOptions, RawEngine, VideoCodec};
    use crate::output::MuxerState;
    use crate::types::{BufferFlags, TrackSet};

    fn running_engine() -> (Box<dyn CodecEngine>, crate::encode::InputPort) {
        let config = RecorderConfig::default().with_resolution(4, 2);
        let mut engine = RawEngine::new(StreamKind::Video, EngineOptions::default());
        engine.configure(&config.video_format(VideoCodec::Raw)).unwrap();
        engine.start().unwrap();
        let port = engine.input_port().unwrap();
        (Box::new(engine), port)
    }

    #[test]
    fn test_video_worker_writes_until_eos() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(
            Muxer::create(dir.path().join("v.mkv"), Container::Matroska, TrackSet::video_only())
                .unwrap(),
        );
        let (engine, port) = running_engine();
        for i in 0..10 {
            port.push_input(vec![0; 12], i * 20_833, BufferFlags::NONE).unwrap();
        }
        port.signal_end_of_stream();

        let worker = EncoderWorker::new(
            engine,
            muxer.clone(),
            CancellationToken::new(),
            FailureSink::detached(CancellationToken::new()),
        );
        let report = worker.run().unwrap();
        assert_eq!(report.written, 10);
        assert_eq!(report.dropped(), 0);
        assert!(report.end_of_stream_us.is_some());
        assert!(muxer.is_complete());
        assert_eq!(muxer.state(), MuxerState::Started);
        muxer.finalize().unwrap();
    }

    #[test]
    fn test_drops_while_muxer_waits_for_audio() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(
            Muxer::create(
                dir.path().join("av.mkv"),
                Container::Matroska,
                TrackSet::video_and_audio(),
            )
            .unwrap(),
        );
        let (engine, port) = running_engine();
        for i in 0..3 {
            port.push_input(vec![0; 12], i, BufferFlags::NONE).unwrap();
        }
        port.signal_end_of_stream();

        let worker = EncoderWorker::new(
            engine,
            muxer.clone(),
            CancellationToken::new(),
            FailureSink::detached(CancellationToken::new()),
        );
        let report = worker.run().unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.dropped_not_started, 3);
        assert_eq!(muxer.state(), MuxerState::NotStarted);
    }

    #[test]
    fn test_abort_ends_worker() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(
            Muxer::create(dir.path().join("a.mkv"), Container::Matroska, TrackSet::video_only())
                .unwrap(),
        );
        let (engine, port) = running_engine();
        let abort = CancellationToken::new();
        abort.cancel();
        let worker = EncoderWorker::new(
            engine,
            muxer,
            CancellationToken::new(),
            FailureSink::detached(abort),
        );
        assert!(matches!(worker.run(), Err(Error::Aborted)));
        // The engine was released along with its input queue
        assert!(port.push_input(vec![0; 12], 0, BufferFlags::NONE).is_err());
    }

    #[test]
    fn test_unrun_worker_releases_engine() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(
            Muxer::create(dir.path().join("u.mkv"), Container::Matroska, TrackSet::video_only())
                .unwrap(),
        );
        let (engine, port) = running_engine();
        let worker = EncoderWorker::new(
            engine,
            muxer,
            CancellationToken::new(),
            FailureSink::detached(CancellationToken::new()),
        );
        port.push_input(vec![0; 12], 0, BufferFlags::NONE).unwrap();
        drop(worker);
        assert!(port.push_input(vec![0; 12], 1, BufferFlags::NONE).is_err());
    }

    #[test]
    fn test_drain_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(
            Muxer::create(dir.path().join("d.mkv"), Container::Matroska, TrackSet::video_only())
                .unwrap(),
        );
        // Input never closes, so no end of stream arrives
        let (engine, port) = running_engine();
        let stop = CancellationToken::new();
        stop.cancel();
        let abort = CancellationToken::new();
        let worker = EncoderWorker::new(engine, muxer, stop, FailureSink::detached(abort.clone()))
            .with_drain_timeout(Duration::from_millis(50));
        assert!(matches!(worker.run(), Err(Error::DrainTimeout(StreamKind::Video))));
        assert!(abort.is_cancelled());
        assert!(port.push_input(vec![0; 12], 0, BufferFlags::NONE).is_err());
    }
}
