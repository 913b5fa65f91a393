//! Synthetic and host-driven sources
//!
//! - [`TestPatternScreen`]: moving bar test pattern at a fixed frame rate
//! - [`ToneSource`]: sine tone, paced to real time
//! - [`ManualScreen`] / [`FrameSink`]: the host pushes frames itself
//! - [`ManualAudio`] / [`AudioFeed`]: the host queues blocks and read errors

use super::{AudioSource, ReadError, ReadResult, ScreenSource};
use crate::encode::InputPort;
use crate::error::{Error, Result};
use crate::types::{monotonic_us, BufferFlags, Framerate, Resolution};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test pattern
// ============================================================================

/// Fill an I420 frame with a grey ramp and a bright bar that moves each frame
pub fn fill_test_pattern(frame: &mut Vec<u8>, resolution: Resolution, index: u64) {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    frame.clear();
    frame.resize(resolution.i420_frame_size(), 128);

    if width == 0 {
        return;
    }
    let bar_width = (width / 16).max(1);
    let bar_x = (index as usize * 8) % width;
    for y in 0..height {
        let row = &mut frame[y * width..(y + 1) * width];
        for (x, px) in row.iter_mut().enumerate() {
            let in_bar = x >= bar_x && x < bar_x + bar_width;
            *px = if in_bar {
                235
            } else {
                16 + ((x * 200) / width) as u8
            };
        }
    }
}

/// Screen source producing a generated pattern
pub struct TestPatternScreen {
    resolution: Resolution,
    framerate: Framerate,
    frame_limit: Option<u64>,
    frames_sent: Arc<AtomicU64>,
    stop: Option<CancellationToken>,
    thread: Option<JoinHandle<()>>,
}

impl TestPatternScreen {
    pub fn new(resolution: Resolution, framerate: Framerate) -> Self {
        Self {
            resolution,
            framerate,
            frame_limit: None,
            frames_sent: Arc::new(AtomicU64::new(0)),
            stop: None,
            thread: None,
        }
    }

    /// Stop producing after `frames` frames
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

fn run_pattern(
    port: InputPort,
    resolution: Resolution,
    framerate: Framerate,
    frame_limit: Option<u64>,
    frames_sent: Arc<AtomicU64>,
    stop: CancellationToken,
) {
    let interval = Duration::from_micros(framerate.frame_duration_us().max(1) as u64);
    let ticker = crossbeam_channel::tick(interval);
    let mut frame = Vec::new();
    let mut index = 0u64;
    let mut dropped = 0u64;

    while !stop.is_cancelled() {
        if frame_limit.is_some_and(|limit| index >= limit) {
            break;
        }
        if ticker.recv().is_err() || stop.is_cancelled() {
            break;
        }

        fill_test_pattern(&mut frame, resolution, index);
        match port.push_input(frame.clone(), monotonic_us(), BufferFlags::NONE) {
            Ok(()) => {
                frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_recoverable() => {
                dropped += 1;
                tracing::debug!("Test pattern frame {} dropped: {}", index, e);
            }
            Err(e) => {
                tracing::debug!("Test pattern stopped: {}", e);
                break;
            }
        }
        index += 1;
    }

    tracing::debug!(
        "Test pattern thread exiting ({} frames, {} dropped)",
        frames_sent.load(Ordering::Relaxed),
        dropped
    );
}

impl ScreenSource for TestPatternScreen {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn attach(&mut self, port: InputPort) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::Capture("Test pattern already attached".into()));
        }
        let stop = CancellationToken::new();
        let (resolution, framerate, limit) = (self.resolution, self.framerate, self.frame_limit);
        let frames_sent = self.frames_sent.clone();
        let thread_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("screencast-pattern".into())
            .spawn(move || run_pattern(port, resolution, framerate, limit, frames_sent, thread_stop))
            .map_err(|e| Error::Capture(format!("Failed to spawn pattern thread: {}", e)))?;

        self.stop = Some(stop);
        self.thread = Some(handle);
        tracing::info!("Test pattern attached: {} @ {}", self.resolution, self.framerate);
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| Error::Capture("Test pattern thread panicked".into()))?;
            tracing::info!("Test pattern detached after {} frames", self.frames_sent());
        }
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for TestPatternScreen {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

// ============================================================================
// Manual screen
// ============================================================================

/// Host side of a [`ManualScreen`]
#[derive(Clone, Default)]
pub struct FrameSink {
    port: Arc<Mutex<Option<InputPort>>>,
    pushed: Arc<AtomicU64>,
}

impl FrameSink {
    pub fn is_attached(&self) -> bool {
        self.port.lock().is_some()
    }

    /// Push one I420 frame. Returns `Ok(false)` when no engine is attached
    /// and the frame went nowhere.
    pub fn push_frame(&self, data: Vec<u8>, timestamp_us: i64) -> Result<bool> {
        let port = self.port.lock();
        let Some(port) = port.as_ref() else {
            return Ok(false);
        };
        port.push_input(data, timestamp_us, BufferFlags::NONE)?;
        self.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    pub fn frames_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

/// Screen source whose frames come from the host through a [`FrameSink`]
pub struct ManualScreen {
    sink: FrameSink,
}

impl ManualScreen {
    pub fn new() -> (Self, FrameSink) {
        let sink = FrameSink::default();
        (Self { sink: sink.clone() }, sink)
    }
}

impl ScreenSource for ManualScreen {
    fn name(&self) -> &str {
        "manual"
    }

    fn attach(&mut self, port: InputPort) -> Result<()> {
        let mut slot = self.sink.port.lock();
        if slot.is_some() {
            return Err(Error::Capture("Manual screen already attached".into()));
        }
        *slot = Some(port);
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        self.sink.port.lock().take();
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.sink.is_attached()
    }
}

// ============================================================================
// Tone
// ============================================================================

/// Audio source generating a sine tone
pub struct ToneSource {
    sample_rate: u32,
    channels: u16,
    frequency: f64,
    amplitude: f64,
    phase: f64,
    paced: bool,
    next_due: Option<Instant>,
    released: bool,
}

impl ToneSource {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frequency: 440.0,
            amplitude: 0.25,
            phase: 0.0,
            paced: true,
            next_due: None,
            released: false,
        }
    }

    pub fn with_frequency(mut self, hz: f64) -> Self {
        self.frequency = hz;
        self
    }

    /// Return blocks as fast as they are read
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn wait_for_block(&mut self, frames: usize) {
        let block = Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        // Fall back to the clock when reads lag far behind
        self.next_due = Some(due.max(now.checked_sub(block).unwrap_or(now)) + block);
    }
}

impl AudioSource for ToneSource {
    fn name(&self) -> &str {
        "tone"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadResult {
        if self.released {
            return Err(ReadError::InvalidOperation("tone source released".into()));
        }
        let frame_bytes = 2 * self.channels as usize;
        let frames = buf.len() / frame_bytes;
        if self.paced {
            self.wait_for_block(frames);
        }

        let step = std::f64::consts::TAU * self.frequency / self.sample_rate.max(1) as f64;
        for frame in buf[..frames * frame_bytes].chunks_exact_mut(frame_bytes) {
            let value = (self.phase.sin() * self.amplitude * i16::MAX as f64) as i16;
            for sample in frame.chunks_exact_mut(2) {
                sample.copy_from_slice(&value.to_le_bytes());
            }
            self.phase = (self.phase + step) % std::f64::consts::TAU;
        }
        Ok(frames * frame_bytes)
    }

    fn release(&mut self) {
        self.released = true;
    }
}

// ============================================================================
// Manual audio
// ============================================================================

enum FeedItem {
    Block(Vec<u8>),
    Error(ReadError),
}

/// Host side of a [`ManualAudio`]
#[derive(Clone)]
pub struct AudioFeed {
    tx: Sender<FeedItem>,
    released: Arc<AtomicUsize>,
    reads: Arc<AtomicU64>,
}

impl AudioFeed {
    /// Queue a block for the next read
    pub fn push_block(&self, data: Vec<u8>) {
        let _ = self.tx.send(FeedItem::Block(data));
    }

    /// Make the next read fail
    pub fn push_error(&self, error: ReadError) {
        let _ = self.tx.send(FeedItem::Error(error));
    }

    /// Items not read yet
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Times the source was released
    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Reads performed on the source
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

/// Audio source reading host-queued blocks. An empty queue reads as
/// nothing available after a short wait.
pub struct ManualAudio {
    rx: Receiver<FeedItem>,
    sample_rate: u32,
    channels: u16,
    wait: Duration,
    released: Arc<AtomicUsize>,
    reads: Arc<AtomicU64>,
}

impl ManualAudio {
    pub fn new(sample_rate: u32, channels: u16) -> (Self, AudioFeed) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let released = Arc::new(AtomicUsize::new(0));
        let reads = Arc::new(AtomicU64::new(0));
        (
            Self {
                rx,
                sample_rate,
                channels,
                wait: Duration::from_millis(10),
                released: released.clone(),
                reads: reads.clone(),
            },
            AudioFeed { tx, released, reads },
        )
    }
}

impl AudioSource for ManualAudio {
    fn name(&self) -> &str {
        "manual"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadResult {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.rx.recv_timeout(self.wait) {
            Ok(FeedItem::Block(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Ok(FeedItem::Error(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::PortRead;
    use crate::types::StreamKind;

    #[test]
    fn test_pattern_frame_size() {
        let res = Resolution::new(32, 16);
        let mut frame = Vec::new();
        fill_test_pattern(&mut frame, res, 3);
        assert_eq!(frame.len(), res.i420_frame_size());
        // Bar starts at x = 24
        assert_eq!(frame[24], 235);
        assert_eq!(frame[0], 16);
        // Chroma stays neutral
        assert_eq!(*frame.last().unwrap(), 128);
    }

    #[test]
    fn test_pattern_respects_frame_limit() {
        let (port, rx) = InputPort::channel(StreamKind::Video, 16);
        let mut screen = TestPatternScreen::new(Resolution::new(8, 4), Framerate::new(200, 1))
            .with_frame_limit(5);
        screen.attach(port).unwrap();

        let mut received = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while received < 5 && Instant::now() < deadline {
            if let PortRead::Input(input) = rx.read(Duration::from_millis(20)) {
                assert_eq!(input.data.len(), 48);
                received += 1;
            }
        }
        screen.detach().unwrap();
        assert_eq!(received, 5);
        assert_eq!(screen.frames_sent(), 5);
        assert!(!screen.is_attached());
    }

    #[test]
    fn test_manual_screen() {
        let (mut screen, sink) = ManualScreen::new();
        assert!(!sink.push_frame(vec![0; 12], 0).unwrap());

        let (port, rx) = InputPort::channel(StreamKind::Video, 4);
        screen.attach(port).unwrap();
        assert!(sink.push_frame(vec![0; 12], 10).unwrap());
        assert!(matches!(rx.read(Duration::from_millis(5)), PortRead::Input(_)));

        screen.detach().unwrap();
        assert!(!sink.is_attached());
        assert_eq!(sink.frames_pushed(), 1);
    }

    #[test]
    fn test_tone_fills_whole_frames() {
        let mut tone = ToneSource::new(44_100, 2).unpaced();
        let mut buf = vec![0u8; 4 * 100 + 3];
        assert_eq!(tone.read(&mut buf).unwrap(), 400);
        // Left and right carry the same sample
        assert_eq!(buf[4..6], buf[6..8]);

        tone.release();
        assert!(tone.read(&mut buf).unwrap_err().is_benign());
    }

    #[test]
    fn test_manual_audio_feed() {
        let (mut source, feed) = ManualAudio::new(44_100, 1);
        feed.push_block(vec![1, 2, 3, 4]);
        feed.push_error(ReadError::BadValue("glitch".into()));
        assert_eq!(feed.pending(), 2);

        let mut buf = [0u8; 2];
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert!(source.read(&mut buf).is_err());
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert_eq!(feed.reads(), 3);

        source.release();
        assert_eq!(feed.release_count(), 1);
    }
}
