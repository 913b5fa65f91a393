//! Capture sources
//!
//! The host hands a session a [`CaptureHandle`]: one screen source plus the
//! audio taps it can offer. The screen source pushes frames straight into the
//! video engine's input port; audio sources are read block by block by the
//! capture worker.
//!
//! Built-in sources:
//! - synthetic test pattern and tone
//! - manual screen and audio sources driven by the host (or tests)
//! - PipeWire loopback and microphone taps (feature `pipewire`)

pub mod synthetic;

#[cfg(feature = "pipewire")]
pub mod pipewire;

pub use synthetic::{AudioFeed, FrameSink, ManualAudio, ManualScreen, TestPatternScreen, ToneSource};

use crate::config::AudioMode;
use crate::encode::InputPort;
use crate::error::{Error, Result};

/// Failure of a single audio read
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadError {
    /// The source returned malformed data for this block
    #[error("bad value: {0}")]
    BadValue(String),

    /// The source was not in a state to be read
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The source is gone
    #[error("{0}")]
    Fatal(String),
}

impl ReadError {
    /// Benign errors skip one block; the stream carries on
    pub fn is_benign(&self) -> bool {
        matches!(self, ReadError::BadValue(_) | ReadError::InvalidOperation(_))
    }
}

/// Result of one audio read: bytes written into the buffer
pub type ReadResult = std::result::Result<usize, ReadError>;

/// Trait for screen sources
///
/// While attached, the source pushes I420 frames into the port with
/// monotonic microsecond timestamps.
pub trait ScreenSource: Send {
    fn name(&self) -> &str;

    /// Start delivering frames into the video engine's input
    fn attach(&mut self, port: InputPort) -> Result<()>;

    /// Stop delivering frames. Must not signal end of stream.
    fn detach(&mut self) -> Result<()>;

    fn is_attached(&self) -> bool;
}

/// Trait for audio sources
///
/// Reads deliver interleaved signed 16-bit little-endian PCM and may block
/// for at most a few block durations.
pub trait AudioSource: Send {
    fn name(&self) -> &str;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Fill `buf` with the next block. `Ok(0)` means nothing was available.
    fn read(&mut self, buf: &mut [u8]) -> ReadResult;

    /// Free the underlying device
    fn release(&mut self);
}

/// The audio tap picked for a session
pub enum AudioTap {
    /// Internal audio (what the system plays)
    Loopback(Box<dyn AudioSource>),
    Microphone(Box<dyn AudioSource>),
}

impl AudioTap {
    pub fn mode(&self) -> AudioMode {
        match self {
            AudioTap::Loopback(_) => AudioMode::Internal,
            AudioTap::Microphone(_) => AudioMode::Microphone,
        }
    }

    pub fn source(&self) -> &dyn AudioSource {
        match self {
            AudioTap::Loopback(s) | AudioTap::Microphone(s) => s.as_ref(),
        }
    }

    pub fn into_source(self) -> Box<dyn AudioSource> {
        match self {
            AudioTap::Loopback(s) | AudioTap::Microphone(s) => s,
        }
    }
}

impl std::fmt::Debug for AudioTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTap")
            .field("mode", &self.mode())
            .field("source", &self.source().name())
            .finish()
    }
}

/// Everything a session needs to capture from
pub struct CaptureHandle {
    screen: Box<dyn ScreenSource>,
    loopback: Option<Box<dyn AudioSource>>,
    microphone: Option<Box<dyn AudioSource>>,
}

impl CaptureHandle {
    pub fn new(screen: impl ScreenSource + 'static) -> Self {
        Self::from_boxed(Box::new(screen))
    }

    pub fn from_boxed(screen: Box<dyn ScreenSource>) -> Self {
        Self {
            screen,
            loopback: None,
            microphone: None,
        }
    }

    pub fn with_loopback(mut self, source: impl AudioSource + 'static) -> Self {
        self.loopback = Some(Box::new(source));
        self
    }

    pub fn with_microphone(mut self, source: impl AudioSource + 'static) -> Self {
        self.microphone = Some(Box::new(source));
        self
    }

    pub fn screen_name(&self) -> &str {
        self.screen.name()
    }

    /// Check whether the handle can serve an audio mode
    pub fn supports(&self, mode: AudioMode) -> bool {
        match mode {
            AudioMode::Disabled => true,
            AudioMode::Internal => self.loopback.is_some(),
            AudioMode::Microphone => self.microphone.is_some(),
        }
    }

    /// Split into the screen source and the tap for `mode`. Taps not picked
    /// are released here.
    pub fn into_parts(self, mode: AudioMode) -> Result<(Box<dyn ScreenSource>, Option<AudioTap>)> {
        let supported = self.supports(mode);
        let Self {
            screen,
            loopback,
            microphone,
        } = self;
        if !supported {
            for mut source in [loopback, microphone].into_iter().flatten() {
                source.release();
            }
            return Err(Error::AudioCapture(format!(
                "No {} source in capture handle",
                mode.display_name()
            )));
        }

        let (tap, unused) = match mode {
            AudioMode::Disabled => (None, [loopback, microphone]),
            AudioMode::Internal => (loopback.map(AudioTap::Loopback), [None, microphone]),
            AudioMode::Microphone => (microphone.map(AudioTap::Microphone), [loopback, None]),
        };
        for mut source in unused.into_iter().flatten() {
            source.release();
        }
        Ok((screen, tap))
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("screen", &self.screen.name())
            .field("loopback", &self.loopback.as_ref().map(|s| s.name().to_string()))
            .field("microphone", &self.microphone.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}
