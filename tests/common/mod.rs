#![allow(dead_code)]

use screencast::encode::{
    AudioCodec, CodecEngine, EngineFactory, EngineOptions, EngineState, InputPort, OutputEvent,
    RawEngineFactory, VideoCodec,
};
use screencast::storage::{FreeSpace, MIB};
use screencast::{Error, RecorderConfig, Result, SessionController, SessionState, StreamKind};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What happened to one engine
#[derive(Default)]
pub struct EngineCounters {
    pub created: AtomicU64,
    pub buffers: AtomicU64,
    pub eos: AtomicU64,
    pub stops: AtomicU64,
    pub releases: AtomicU64,
    /// FormatChanged is held back while closed
    pub gate_closed: AtomicBool,
    /// Fail `pull_output` once this many data buffers went out
    pub fail_after: AtomicU64,
    /// The factory refuses to build the engine
    pub refuse: AtomicBool,
}

impl EngineCounters {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }

    pub fn close_gate(&self) {
        self.gate_closed.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gate_closed.store(false, Ordering::SeqCst);
    }

    pub fn fail_after(&self, buffers: u64) {
        self.fail_after.store(buffers, Ordering::SeqCst);
    }

    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

/// Raw engine wrapper that counts lifecycle calls
pub struct CountingEngine {
    inner: Box<dyn CodecEngine>,
    counters: Arc<EngineCounters>,
    format_sent: bool,
}

impl CodecEngine for CountingEngine {
    fn kind(&self) -> StreamKind {
        self.inner.kind()
    }

    fn state(&self) -> EngineState {
        self.inner.state()
    }

    fn configure(&mut self, format: &screencast::MediaFormat) -> Result<()> {
        self.inner.configure(format)
    }

    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn input_port(&self) -> Result<InputPort> {
        self.inner.input_port()
    }

    fn pull_output(&mut self, timeout: Duration) -> Result<OutputEvent> {
        if !self.format_sent && self.counters.gate_closed.load(Ordering::SeqCst) {
            std::thread::sleep(timeout);
            return Ok(OutputEvent::TryAgain);
        }
        let limit = self.counters.fail_after.load(Ordering::SeqCst);
        if limit > 0 && EngineCounters::get(&self.counters.buffers) >= limit {
            return Err(Error::EngineState(format!("{} engine failure", self.kind())));
        }

        let event = self.inner.pull_output(timeout)?;
        match &event {
            OutputEvent::FormatChanged(_) => self.format_sent = true,
            OutputEvent::Buffer { buffer, .. } if buffer.is_end_of_stream() => {
                self.counters.eos.fetch_add(1, Ordering::SeqCst);
            }
            OutputEvent::Buffer { .. } => {
                self.counters.buffers.fetch_add(1, Ordering::SeqCst);
            }
            OutputEvent::TryAgain => {}
        }
        Ok(event)
    }

    fn release_output(&mut self, index: usize) -> Result<()> {
        self.inner.release_output(index)
    }

    fn stop(&mut self) -> Result<()> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        self.inner.stop()
    }

    fn release(&mut self) -> Result<()> {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release()
    }

    fn abort(&mut self) -> Result<()> {
        if self.inner.state() != EngineState::Released {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.abort()
    }

    fn output_format(&self) -> Option<&screencast::MediaFormat> {
        self.inner.output_format()
    }
}

/// Raw engines with counters per stream kind
#[derive(Default)]
pub struct CountingFactory {
    pub video: Arc<EngineCounters>,
    pub audio: Arc<EngineCounters>,
}

impl CountingFactory {
    fn wrap(
        &self,
        inner: Box<dyn CodecEngine>,
        counters: &Arc<EngineCounters>,
    ) -> Result<Box<dyn CodecEngine>> {
        if counters.refuse.load(Ordering::SeqCst) {
            return Err(Error::EngineConfig(format!("{} engine refused", inner.kind())));
        }
        counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingEngine {
            inner,
            counters: counters.clone(),
            format_sent: false,
        }))
    }
}

impl EngineFactory for CountingFactory {
    fn name(&self) -> &'static str {
        "counting-raw"
    }

    fn video_codec(&self) -> VideoCodec {
        VideoCodec::Raw
    }

    fn audio_codec(&self) -> AudioCodec {
        AudioCodec::Pcm
    }

    fn create_video(&self, options: EngineOptions) -> Result<Box<dyn CodecEngine>> {
        self.wrap(RawEngineFactory.create_video(options)?, &self.video)
    }

    fn create_audio(&self, options: EngineOptions) -> Result<Box<dyn CodecEngine>> {
        self.wrap(RawEngineFactory.create_audio(options)?, &self.audio)
    }
}

/// Free space that tests can change while recording
pub struct AdjustableStorage {
    bytes: AtomicU64,
}

impl AdjustableStorage {
    pub fn mib(mib: u64) -> Arc<Self> {
        Arc::new(Self {
            bytes: AtomicU64::new(mib * MIB),
        })
    }

    pub fn set_mib(&self, mib: u64) {
        self.bytes.store(mib * MIB, Ordering::SeqCst);
    }
}

impl FreeSpace for AdjustableStorage {
    fn available_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.bytes.load(Ordering::SeqCst))
    }
}

/// Small raw-backend config writing into `dir`
pub fn test_config(dir: &Path) -> RecorderConfig {
    RecorderConfig::default()
        .with_output_dir(dir)
        .with_resolution(16, 8)
        .with_fps(48)
        .with_backend(screencast::EncoderBackend::Raw)
        .with_drain_timeout_ms(2_000)
        .with_progress_interval_ms(50)
}

pub fn controller(config: RecorderConfig, factory: Arc<CountingFactory>) -> SessionController {
    SessionController::new(config)
        .unwrap()
        .with_engine_factory(factory)
        .with_free_space(AdjustableStorage::mib(10_000))
}

/// Poll until `check` holds or `timeout` runs out
pub fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

pub fn wait_for_state(controller: &SessionController, state: SessionState) -> bool {
    wait_for(Duration::from_secs(3), || controller.state() == state)
}

pub fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}
