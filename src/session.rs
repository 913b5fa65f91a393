//! Recording sessions
//!
//! [`SessionController`] owns at most one recording at a time. Starting a
//! session configures both codec engines, creates the muxer and spawns the
//! workers; stopping it winds the pipeline down in order (audio capture,
//! screen, encoders), joins every worker and finalizes the container.
//!
//! A fatal error in any worker cancels the session's abort token right
//! away; the session turns `Failed` and a [`SessionEvent::Failed`] goes out.
//! The next `stop()` (or `start()`) reaps it and deletes the partial file.
//!
//! ```rust,no_run
//! use screencast::capture::{CaptureHandle, TestPatternScreen, ToneSource};
//! use screencast::{AudioMode, RecorderConfig, SessionController};
//!
//! # fn main() -> screencast::Result<()> {
//! let config = RecorderConfig::default();
//! let controller = SessionController::new(config.clone())?;
//! let handle = CaptureHandle::new(TestPatternScreen::new(
//!     config.video.resolution,
//!     config.video.framerate,
//! ))
//! .with_loopback(ToneSource::new(config.audio.sample_rate, config.audio.channels));
//!
//! controller.start(AudioMode::Internal, handle)?;
//! std::thread::sleep(std::time::Duration::from_secs(3));
//! let summary = controller.stop()?;
//! println!("Saved {}", summary.path.display());
//! # Ok(())
//! # }
//! ```

use crate::capture::{AudioSource, CaptureHandle, ScreenSource};
use crate::config::{AudioMode, RecorderConfig};
use crate::encode::{
    create_engine_factory, CodecEngine, EngineFactory, EngineOptions, EngineState, InputPort,
};
use crate::error::{Error, Result};
use crate::output::{check_codec, ContainerSummary, Muxer, MuxerState, TrackId};
use crate::pipeline::{
    CaptureReport, CaptureWorker, EncoderReport, EncoderWorker, FailureSink, WorkerFailure,
    WorkerHandle,
};
use crate::storage::{allocate_output_path, check_free_space, FreeSpace, SystemStorage};
use crate::types::{format_elapsed, monotonic_us, MediaFormat, StreamKind, TrackSet};

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// A session in this state blocks a new start
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Recording | SessionState::Stopping
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Notifications broadcast to subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started {
        id: Uuid,
        path: PathBuf,
        audio_mode: AudioMode,
    },
    /// Fixed-cadence elapsed time while recording
    Progress { id: Uuid, elapsed: Duration },
    /// Free space fell under the floor while recording
    LowStorage { available_mib: u64, required_mib: u64 },
    Failed { id: Uuid, reason: String },
    Stopped(RecordingSummary),
}

/// Snapshot of the active session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub state: SessionState,
    pub audio_mode: AudioMode,
    pub path: PathBuf,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub muxer_state: MuxerState,
    pub tracks: Vec<(StreamKind, TrackId)>,
}

impl SessionHandle {
    /// Elapsed time as `MM:SS` or `H:MM:SS`
    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed)
    }
}

/// The finished recording
#[derive(Debug, Clone)]
pub struct RecordingSummary {
    pub id: Uuid,
    pub path: PathBuf,
    pub audio_mode: AudioMode,
    pub started_at: DateTime<Local>,
    /// Wall-clock time between start and stop
    pub wall_time: Duration,
    pub container: ContainerSummary,
    /// Free space was under the floor after stopping
    pub low_storage: bool,
}

impl RecordingSummary {
    /// Media duration of the container
    pub fn duration(&self) -> Duration {
        self.container.duration
    }

    pub fn samples(&self, kind: StreamKind) -> u64 {
        self.container.samples(kind)
    }

    pub fn bytes_written(&self) -> u64 {
        self.container.bytes_written
    }
}

/// What `toggle` did
#[derive(Debug, Clone)]
pub enum ToggleOutcome {
    Started(SessionHandle),
    Stopped(RecordingSummary),
}

// ============================================================================
// Session internals
// ============================================================================

struct Status {
    state: SessionState,
    failure: Option<String>,
}

/// State shared between the controller and the session's ticker thread
struct SessionShared {
    id: Uuid,
    status: Mutex<Status>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        self.status.lock().state
    }

    fn set_state(&self, state: SessionState) {
        let mut status = self.status.lock();
        if status.state != SessionState::Failed {
            status.state = state;
        }
    }

    /// Record the first failure; returns false when already failed
    fn fail(&self, reason: &str) -> bool {
        let mut status = self.status.lock();
        if status.state == SessionState::Failed {
            return false;
        }
        status.state = SessionState::Failed;
        status.failure.get_or_insert_with(|| reason.to_string());
        true
    }

    fn failure(&self) -> Option<String> {
        self.status.lock().failure.clone()
    }
}

#[derive(Default)]
struct Workers {
    video: Option<WorkerHandle<EncoderReport>>,
    audio: Option<WorkerHandle<EncoderReport>>,
    capture: Option<WorkerHandle<CaptureReport>>,
}

impl Workers {
    /// Join everything after an abort, ignoring results
    fn reap(&mut self) {
        if let Some(h) = self.capture.take() {
            let _ = h.join();
        }
        for h in [self.video.take(), self.audio.take()].into_iter().flatten() {
            let _ = h.join();
        }
    }
}

/// Releases an audio tap that never reached a capture worker
struct TapGuard(Option<Box<dyn AudioSource>>);

impl Drop for TapGuard {
    fn drop(&mut self) {
        if let Some(mut source) = self.0.take() {
            source.release();
        }
    }
}

/// Tears down a prepared engine that never reached an encoder worker
struct EngineGuard(Option<Box<dyn CodecEngine>>);

impl EngineGuard {
    /// Configure and start the engine, returning its input port
    fn prepare(&mut self, format: &MediaFormat) -> Result<InputPort> {
        let engine = self
            .0
            .as_mut()
            .ok_or_else(|| Error::Internal("Engine already handed off".into()))?;
        engine.configure(format)?;
        engine.start()?;
        engine.input_port()
    }

    fn into_inner(mut self) -> Result<Box<dyn CodecEngine>> {
        self.0
            .take()
            .ok_or_else(|| Error::Internal("Engine already handed off".into()))
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if let Some(engine) = self.0.as_mut() {
            if engine.state() != EngineState::Released {
                if let Err(e) = engine.abort() {
                    tracing::warn!("{} engine teardown failed: {}", engine.kind(), e);
                }
            }
        }
    }
}

/// Deletes a half-built output file unless disarmed
struct PartialFile(Option<PathBuf>);

impl PartialFile {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            discard_file(&path);
        }
    }
}

fn discard_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!("Deleted partial recording {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not delete {}: {}", path.display(), e),
    }
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    audio_mode: AudioMode,
    path: PathBuf,
    started_at: DateTime<Local>,
    started: Instant,
    muxer: Arc<Muxer>,
    screen: Box<dyn ScreenSource>,
    video_port: InputPort,
    workers: Workers,
    abort: CancellationToken,
    ticker: Option<JoinHandle<()>>,
    ticker_shutdown: Option<Sender<()>>,
}

impl ActiveSession {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.shared.id,
            state: self.shared.state(),
            audio_mode: self.audio_mode,
            path: self.path.clone(),
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
            muxer_state: self.muxer.state(),
            tracks: self.muxer.tracks(),
        }
    }

    fn stop_ticker(&mut self) {
        self.ticker_shutdown.take();
        if let Some(ticker) = self.ticker.take() {
            if ticker.join().is_err() {
                tracing::warn!("Progress ticker panicked");
            }
        }
    }
}

fn run_ticker(
    shared: Arc<SessionShared>,
    started: Instant,
    interval: Duration,
    failures: Receiver<WorkerFailure>,
    shutdown: Receiver<()>,
    events: broadcast::Sender<SessionEvent>,
) {
    let ticker = crossbeam_channel::tick(interval);
    let mut failures = failures;

    loop {
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                if shared.state() == SessionState::Recording {
                    let _ = events.send(SessionEvent::Progress {
                        id: shared.id,
                        elapsed: started.elapsed(),
                    });
                }
            }
            recv(failures) -> msg => match msg {
                Ok(failure) => {
                    let reason = failure.to_string();
                    if shared.fail(&reason) {
                        tracing::error!("Recording failed: {}", reason);
                        let _ = events.send(SessionEvent::Failed { id: shared.id, reason });
                    }
                }
                // Every worker is gone
                Err(_) => failures = crossbeam_channel::never(),
            },
            recv(shutdown) -> _ => break,
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

struct ControllerInner {
    active: Option<ActiveSession>,
    /// Session being torn down by `stop()`, or reaped by `start()`
    stopping: Option<Arc<SessionShared>>,
    last_state: SessionState,
    last_audio_mode: AudioMode,
}

/// Runs recording sessions, one at a time
pub struct SessionController {
    config: RecorderConfig,
    factory: Arc<dyn EngineFactory>,
    storage: Arc<dyn FreeSpace>,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<ControllerInner>,
}

impl SessionController {
    /// Create a controller using the configured encoder backend and the
    /// system free-space reading
    pub fn new(config: RecorderConfig) -> Result<Self> {
        config.validate()?;
        let factory = create_engine_factory(config.pipeline.backend)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let last_audio_mode = config.audio.mode;
        Ok(Self {
            config,
            factory,
            storage: Arc::new(SystemStorage),
            events,
            inner: Mutex::new(ControllerInner {
                active: None,
                stopping: None,
                last_state: SessionState::Idle,
                last_audio_mode,
            }),
        })
    }

    pub fn with_engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_free_space(mut self, storage: Arc<dyn FreeSpace>) -> Self {
        self.storage = storage;
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn engine_backend(&self) -> &'static str {
        self.factory.name()
    }

    /// Receive session events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        let inner = self.inner.lock();
        if let Some(active) = &inner.active {
            return active.shared.state();
        }
        if let Some(stopping) = &inner.stopping {
            return stopping.state();
        }
        inner.last_state
    }

    /// Snapshot of the active session, if any
    pub fn current(&self) -> Option<SessionHandle> {
        self.inner.lock().active.as_ref().map(|a| a.handle())
    }

    /// Audio mode `toggle` starts with
    pub fn audio_mode(&self) -> AudioMode {
        self.inner.lock().last_audio_mode
    }

    pub fn set_audio_mode(&self, mode: AudioMode) {
        self.inner.lock().last_audio_mode = mode;
    }

    /// Start recording
    pub fn start(&self, audio_mode: AudioMode, capture: CaptureHandle) -> Result<SessionHandle> {
        let failed = {
            let mut inner = self.inner.lock();
            Self::ensure_idle(&inner)?;
            let failed = inner.active.take();
            if let Some(failed) = &failed {
                inner.stopping = Some(failed.shared.clone());
            }
            failed
        };
        // Joining workers can take a while; state() stays answerable meanwhile
        if let Some(failed) = failed {
            tracing::info!("Reaping failed session {}", failed.shared.id);
            let _ = self.shutdown(failed);
            let mut inner = self.inner.lock();
            inner.stopping = None;
            inner.last_state = SessionState::Failed;
        }

        let mut inner = self.inner.lock();
        // Another start may have won the race while reaping
        if inner.stopping.is_some() || inner.active.is_some() {
            return Err(Error::AlreadyRecording);
        }
        inner.last_state = SessionState::Starting;
        match self.launch(audio_mode, capture) {
            Ok(active) => {
                let handle = active.handle();
                let _ = self.events.send(SessionEvent::Started {
                    id: handle.id,
                    path: handle.path.clone(),
                    audio_mode,
                });
                tracing::info!(
                    "Recording {} started: {} (audio {})",
                    handle.id,
                    handle.path.display(),
                    audio_mode.display_name()
                );
                inner.active = Some(active);
                inner.last_audio_mode = audio_mode;
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!("Recording start failed: {}", e);
                inner.last_state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Refuse while a session is live or winding down. A failed session
    /// does not count.
    fn ensure_idle(inner: &ControllerInner) -> Result<()> {
        if inner.stopping.is_some() {
            return Err(Error::AlreadyRecording);
        }
        match &inner.active {
            Some(active) if active.shared.state() != SessionState::Failed => {
                Err(Error::AlreadyRecording)
            }
            _ => Ok(()),
        }
    }

    /// Stop recording and finalize the file
    pub fn stop(&self) -> Result<RecordingSummary> {
        let active = {
            let mut inner = self.inner.lock();
            let active = inner.active.take().ok_or(Error::NotRecording)?;
            active.shared.set_state(SessionState::Stopping);
            inner.stopping = Some(active.shared.clone());
            active
        };

        let result = self.shutdown(active);

        let mut inner = self.inner.lock();
        inner.stopping = None;
        inner.last_state = match result {
            Ok(_) => SessionState::Stopped,
            Err(_) => SessionState::Failed,
        };
        result
    }

    /// Stop the active session, or start one with the last audio mode.
    /// `capture` is only called when starting.
    pub fn toggle<F>(&self, capture: F) -> Result<ToggleOutcome>
    where
        F: FnOnce() -> Result<CaptureHandle>,
    {
        if self.inner.lock().active.is_some() {
            return self.stop().map(ToggleOutcome::Stopped);
        }
        let mode = self.audio_mode();
        self.start(mode, capture()?).map(ToggleOutcome::Started)
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            output_slots: self.config.pipeline.output_slots,
            input_queue_depth: self.config.pipeline.input_queue_depth,
        }
    }

    fn encoder_worker(
        &self,
        engine: Box<dyn CodecEngine>,
        muxer: &Arc<Muxer>,
        failures: &FailureSink,
    ) -> Result<WorkerHandle<EncoderReport>> {
        EncoderWorker::new(engine, muxer.clone(), CancellationToken::new(), failures.clone())
            .with_poll_timeout(self.config.pipeline.poll_timeout())
            .with_drain_timeout(self.config.pipeline.drain_timeout())
            .spawn()
    }

    fn launch(&self, audio_mode: AudioMode, capture: CaptureHandle) -> Result<ActiveSession> {
        let config = &self.config;
        let output = &config.output;

        let (mut screen, tap) = capture.into_parts(audio_mode)?;
        let mut tap = TapGuard(tap.map(|t| t.into_source()));
        if let Some(source) = &tap.0 {
            if source.sample_rate() != config.audio.sample_rate
                || source.channels() != config.audio.channels
            {
                return Err(Error::Config(format!(
                    "Audio source {} delivers {}Hz/{}ch, session expects {}Hz/{}ch",
                    source.name(),
                    source.sample_rate(),
                    source.channels(),
                    config.audio.sample_rate,
                    config.audio.channels
                )));
            }
        }

        check_free_space(self.storage.as_ref(), &output.directory, output.min_free_mib)?;
        if !output.container.is_available() {
            return Err(Error::Config(format!(
                "{:?} output is not available in this build",
                output.container
            )));
        }

        // Engines first: configuration errors surface before any file or thread exists
        let video_format = config.video_format(self.factory.video_codec());
        check_codec(output.container, &video_format)?;
        let audio_format = audio_mode
            .is_enabled()
            .then(|| config.audio_format(self.factory.audio_codec()));
        if let Some(format) = &audio_format {
            check_codec(output.container, format)?;
        }

        // Zero in the file; every sample of this session is stamped after it
        let origin_us = monotonic_us();
        let options = self.engine_options();
        let mut video_engine = EngineGuard(Some(self.factory.create_video(options)?));
        let video_port = video_engine.prepare(&video_format)?;
        let audio = match &audio_format {
            Some(format) => {
                let mut engine = EngineGuard(Some(self.factory.create_audio(options)?));
                let port = engine.prepare(format)?;
                Some((engine, port))
            }
            None => None,
        };

        let started_at = Local::now();
        let path = allocate_output_path(
            &output.directory,
            &output.prefix,
            &started_at,
            output.container.extension(),
        )?;
        let expected = if audio.is_some() {
            TrackSet::video_and_audio()
        } else {
            TrackSet::video_only()
        };
        let mut partial = PartialFile(Some(path.clone()));
        let muxer = Muxer::create(&path, output.container, expected)?.with_time_origin(origin_us);
        let muxer = Arc::new(muxer);

        let abort = CancellationToken::new();
        let (failures, failure_rx) = FailureSink::new(abort.clone());
        let mut workers = Workers::default();

        let spawned = (|| -> Result<()> {
            workers.video = Some(self.encoder_worker(video_engine.into_inner()?, &muxer, &failures)?);
            if let Some((audio_engine, audio_port)) = audio {
                workers.audio =
                    Some(self.encoder_worker(audio_engine.into_inner()?, &muxer, &failures)?);
                if let Some(source) = tap.0.take() {
                    let worker = CaptureWorker::new(
                        source,
                        audio_port,
                        config.audio.block_bytes(),
                        CancellationToken::new(),
                        failures.clone(),
                    );
                    workers.capture = Some(worker.spawn()?);
                }
            }
            screen.attach(video_port.clone())
        })();

        if let Err(e) = spawned {
            abort.cancel();
            video_port.signal_end_of_stream();
            workers.reap();
            muxer.abort();
            return Err(e);
        }
        drop(failures);

        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            status: Mutex::new(Status {
                state: SessionState::Recording,
                failure: None,
            }),
        });
        let started = Instant::now();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let ticker = {
            let shared = shared.clone();
            let interval = config.pipeline.progress_interval();
            let events = self.events.clone();
            std::thread::Builder::new()
                .name("screencast-progress".into())
                .spawn(move || run_ticker(shared, started, interval, failure_rx, shutdown_rx, events))
        };
        let ticker = match ticker {
            Ok(t) => t,
            Err(e) => {
                abort.cancel();
                let _ = screen.detach();
                video_port.signal_end_of_stream();
                workers.reap();
                muxer.abort();
                return Err(Error::Internal(format!("Failed to spawn progress ticker: {}", e)));
            }
        };

        partial.disarm();
        Ok(ActiveSession {
            shared,
            audio_mode,
            path,
            started_at,
            started,
            muxer,
            screen,
            video_port,
            workers,
            abort,
            ticker: Some(ticker),
            ticker_shutdown: Some(shutdown_tx),
        })
    }

    /// Wind a session down and finalize (or discard) its file
    fn shutdown(&self, mut active: ActiveSession) -> Result<RecordingSummary> {
        let id = active.shared.id;
        tracing::info!("Stopping recording {}", id);
        let mut errors: Vec<String> = Vec::new();

        // Audio first: the capture worker closes the audio input itself
        if let Some(capture) = &active.workers.capture {
            capture.request_stop();
        }
        if let Err(e) = active.screen.detach() {
            errors.push(format!("screen source: {}", e));
        }
        active.video_port.signal_end_of_stream();
        for worker in [&active.workers.video, &active.workers.audio].into_iter().flatten() {
            worker.request_stop();
        }

        let mut record = |name: &str, result: Result<()>| match result {
            Ok(()) => {}
            // Follows someone else's failure
            Err(Error::Aborted) => {}
            Err(e) => errors.push(format!("{}: {}", name, e)),
        };
        if let Some(h) = active.workers.capture.take() {
            record("audio capture", h.join().map(|_| ()));
        }
        if let Some(h) = active.workers.video.take() {
            record("video encoder", h.join().map(|_| ()));
        }
        if let Some(h) = active.workers.audio.take() {
            record("audio encoder", h.join().map(|_| ()));
        }
        active.stop_ticker();

        if errors.is_empty() && active.abort.is_cancelled() {
            errors.push("session aborted".into());
        }
        if let Some(reason) = active.shared.failure() {
            errors.insert(0, reason);
        }

        let finalized = if errors.is_empty() {
            active.muxer.finalize().map_err(|e| e.to_string())
        } else {
            Err(errors.join("; "))
        };

        match finalized {
            Ok(container) => {
                let low_storage = self.low_storage_after_stop();
                let summary = RecordingSummary {
                    id,
                    path: active.path.clone(),
                    audio_mode: active.audio_mode,
                    started_at: active.started_at,
                    wall_time: active.started.elapsed(),
                    container,
                    low_storage,
                };
                active.shared.set_state(SessionState::Stopped);
                tracing::info!(
                    "Recording {} saved: {} ({}, {:.2} MB)",
                    id,
                    summary.path.display(),
                    format_elapsed(summary.duration()),
                    summary.bytes_written() as f64 / 1_000_000.0
                );
                let _ = self.events.send(SessionEvent::Stopped(summary.clone()));
                Ok(summary)
            }
            Err(reason) => {
                active.muxer.abort();
                discard_file(&active.path);
                if active.shared.fail(&reason) {
                    let _ = self.events.send(SessionEvent::Failed {
                        id,
                        reason: reason.clone(),
                    });
                }
                tracing::error!("Recording {} failed: {}", id, reason);
                Err(Error::RecordingFailed(reason))
            }
        }
    }

    /// Advisory check once the file is closed
    fn low_storage_after_stop(&self) -> bool {
        let output = &self.config.output;
        match self.storage.available_mib(&output.directory) {
            Ok(available_mib) if available_mib < output.min_free_mib => {
                tracing::warn!(
                    "Low storage after recording: {} MiB left ({} MiB floor)",
                    available_mib,
                    output.min_free_mib
                );
                let _ = self.events.send(SessionEvent::LowStorage {
                    available_mib,
                    required_mib: output.min_free_mib,
                });
                true
            }
            _ => false,
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let active = self.inner.get_mut().active.take();
        if let Some(active) = active {
            tracing::warn!("Controller dropped while recording, stopping {}", active.shared.id);
            let _ = self.shutdown(active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ManualAudio, ManualScreen};
    use crate::encode::EncoderBackend;
    use crate::storage::FixedStorage;

    fn controller(dir: &Path, free_mib: u64) -> SessionController {
        let config = RecorderConfig::default()
            .with_output_dir(dir)
            .with_resolution(4, 2)
            .with_backend(EncoderBackend::Raw);
        SessionController::new(config)
            .unwrap()
            .with_free_space(Arc::new(FixedStorage::mib(free_mib)))
    }

    #[test]
    fn test_stop_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), 1_000);
        assert!(matches!(controller.stop(), Err(Error::NotRecording)));
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[test]
    fn test_low_storage_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), 50);
        let (screen, sink) = ManualScreen::new();
        let err = controller
            .start(AudioMode::Disabled, CaptureHandle::new(screen))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientStorage { .. }));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!sink.is_attached());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_second_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), 1_000);
        let (screen, _sink) = ManualScreen::new();
        controller
            .start(AudioMode::Disabled, CaptureHandle::new(screen))
            .unwrap();
        let (screen, _sink) = ManualScreen::new();
        let err = controller
            .start(AudioMode::Disabled, CaptureHandle::new(screen))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRecording));
        controller.stop().unwrap();
    }

    #[test]
    fn test_mismatched_audio_source_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), 1_000);
        let (screen, _sink) = ManualScreen::new();
        let (mic, feed) = ManualAudio::new(48_000, 2);
        let err = controller
            .start(
                AudioMode::Microphone,
                CaptureHandle::new(screen).with_microphone(mic),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(feed.release_count(), 1);
        assert_eq!(controller.state(), SessionState::Idle);
    }
}
