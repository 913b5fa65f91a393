//! Codec engines
//!
//! A codec engine turns raw frames or PCM blocks into compressed buffers
//! through a pull/push interface: producers push into the engine's
//! [`InputPort`], a worker pulls [`OutputEvent`]s back out and returns every
//! buffer slot it was handed.
//!
//! Backends:
//! - `raw`: pass-through "uncompressed" codec, always available
//! - `ffmpeg`: libx264 H.264 and AAC through FFmpeg (feature `ffmpeg`)

pub mod engine;
pub mod h264;
pub mod port;
pub mod raw;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use crate::error::{Error, Result};
use crate::types::{Buffer, MediaFormat, StreamKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use engine::{EncodeStep, EngineCore, SlotPool};
pub use port::{InputPort, PortRead, PortReceiver};
pub use raw::{RawEngine, RawEngineFactory};

/// Supported video codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// Uncompressed I420 frames
    Raw,
    /// H.264/AVC
    H264,
}

impl VideoCodec {
    /// Get human-readable name
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::Raw => "Uncompressed (I420)",
            VideoCodec::H264 => "H.264 (AVC)",
        }
    }

    /// Matroska CodecID
    pub fn matroska_codec_id(&self) -> &'static str {
        match self {
            VideoCodec::Raw => "V_UNCOMPRESSED",
            VideoCodec::H264 => "V_MPEG4/ISO/AVC",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Supported audio codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// Signed 16-bit little-endian PCM
    Pcm,
    /// AAC-LC
    Aac,
}

impl AudioCodec {
    pub fn display_name(&self) -> &'static str {
        match self {
            AudioCodec::Pcm => "PCM s16le",
            AudioCodec::Aac => "AAC-LC",
        }
    }

    pub fn matroska_codec_id(&self) -> &'static str {
        match self {
            AudioCodec::Pcm => "A_PCM/INT/LIT",
            AudioCodec::Aac => "A_AAC",
        }
    }
}

impl std::fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Codec engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Created,
    Configured,
    Running,
    /// End of input observed, buffered output still coming
    Draining,
    /// All output drained and `stop()` called
    Stopped,
    /// Terminal
    Released,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Result of one `pull_output` call
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// A buffer occupying output slot `index` until released
    Buffer { index: usize, buffer: Buffer },
    /// Nothing ready within the timeout
    TryAgain,
    /// Negotiated output format, emitted once before any data buffer
    FormatChanged(MediaFormat),
}

/// Trait for codec engines
pub trait CodecEngine: Send {
    /// Stream kind this engine encodes
    fn kind(&self) -> StreamKind;

    /// Current lifecycle state
    fn state(&self) -> EngineState;

    /// Apply the requested format (Created -> Configured)
    fn configure(&mut self, format: &MediaFormat) -> Result<()>;

    /// Begin accepting input (Configured -> Running)
    fn start(&mut self) -> Result<()>;

    /// Handle producers push raw input into
    fn input_port(&self) -> Result<InputPort>;

    /// Wait up to `timeout` for the next output event
    fn pull_output(&mut self, timeout: Duration) -> Result<OutputEvent>;

    /// Return an output slot handed out by `pull_output`
    fn release_output(&mut self, index: usize) -> Result<()>;

    /// Stop after the end-of-stream buffer was emitted
    fn stop(&mut self) -> Result<()>;

    /// Free the engine (Stopped -> Released)
    fn release(&mut self) -> Result<()>;

    /// Free the engine from any state, dropping queued input and output.
    /// A no-op once released.
    fn abort(&mut self) -> Result<()>;

    /// Format announced through `FormatChanged`, once known
    fn output_format(&self) -> Option<&MediaFormat>;
}

/// Per-engine resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Output buffer slots
    pub output_slots: usize,
    /// Raw inputs queued before `push_input` blocks
    pub input_queue_depth: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            output_slots: 4,
            input_queue_depth: 16,
        }
    }
}

/// Creates the video and audio engines for a session
pub trait EngineFactory: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    fn video_codec(&self) -> VideoCodec;

    fn audio_codec(&self) -> AudioCodec;

    fn create_video(&self, options: EngineOptions) -> Result<Box<dyn CodecEngine>>;

    fn create_audio(&self, options: EngineOptions) -> Result<Box<dyn CodecEngine>>;
}

/// Encoder backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderBackend {
    /// FFmpeg when built in and usable, raw otherwise
    #[default]
    Auto,
    /// Pass-through uncompressed engines
    Raw,
    /// FFmpeg H.264/AAC
    Ffmpeg,
}

/// Create an engine factory for a backend
pub fn create_engine_factory(backend: EncoderBackend) -> Result<Arc<dyn EngineFactory>> {
    match backend {
        EncoderBackend::Auto => {
            #[cfg(feature = "ffmpeg")]
            {
                if ffmpeg::is_available() {
                    tracing::info!("Using FFmpeg encoders");
                    return Ok(Arc::new(ffmpeg::FfmpegEngineFactory::new()?));
                }
                tracing::info!("FFmpeg encoders not available, using raw engines");
            }
            Ok(Arc::new(RawEngineFactory))
        }
        EncoderBackend::Raw => Ok(Arc::new(RawEngineFactory)),
        EncoderBackend::Ffmpeg => {
            #[cfg(feature = "ffmpeg")]
            {
                Ok(Arc::new(ffmpeg::FfmpegEngineFactory::new()?))
            }
            #[cfg(not(feature = "ffmpeg"))]
            {
                Err(Error::EngineConfig(
                    "FFmpeg backend requested but screencast was built without the `ffmpeg` feature"
                        .into(),
                ))
            }
        }
    }
}

/// Information about available engine backends
#[derive(Debug, Clone)]
pub struct EncoderInfo {
    pub raw: bool,
    pub ffmpeg_compiled: bool,
    pub x264: bool,
    pub aac: bool,
}

/// Get information about available engine backends
pub fn get_info() -> EncoderInfo {
    #[cfg(feature = "ffmpeg")]
    let (x264, aac) = (ffmpeg::has_x264(), ffmpeg::has_aac());
    #[cfg(not(feature = "ffmpeg"))]
    let (x264, aac) = (false, false);

    EncoderInfo {
        raw: true,
        ffmpeg_compiled: cfg!(feature = "ffmpeg"),
        x264,
        aac,
    }
}

/// Check a requested format matches the engine's stream kind
pub(crate) fn expect_kind(format: &MediaFormat, kind: StreamKind) -> Result<()> {
    if format.kind() != kind {
        return Err(Error::EngineConfig(format!(
            "{} engine cannot take a {} format",
            kind,
            format.kind()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_ids() {
        assert_eq!(VideoCodec::Raw.matroska_codec_id(), "V_UNCOMPRESSED");
        assert_eq!(VideoCodec::H264.matroska_codec_id(), "V_MPEG4/ISO/AVC");
        assert_eq!(AudioCodec::Pcm.matroska_codec_id(), "A_PCM/INT/LIT");
        assert_eq!(AudioCodec::Aac.matroska_codec_id(), "A_AAC");
    }

    #[test]
    fn test_raw_factory() {
        let factory = create_engine_factory(EncoderBackend::Raw).unwrap();
        assert_eq!(factory.name(), "raw");
        assert_eq!(factory.video_codec(), VideoCodec::Raw);
        let engine = factory.create_audio(EngineOptions::default()).unwrap();
        assert_eq!(engine.kind(), StreamKind::Audio);
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn test_ffmpeg_backend_requires_feature() {
        let err = create_engine_factory(EncoderBackend::Ffmpeg).err().unwrap();
        assert!(matches!(err, Error::EngineConfig(_)));
    }
}
