//! screencast - Screen Recording Engine
//!
//! Captures a screen (and optionally audio), encodes both streams on
//! independent worker threads and multiplexes them into one container file.
//!
//! # Features
//!
//! - **Capture**: synthetic and host-driven sources, PipeWire loopback and
//!   microphone taps (feature `pipewire`)
//! - **Encode**: pass-through raw engines, H.264/AAC through FFmpeg (feature `ffmpeg`)
//! - **Output**: native Matroska writer, MP4 through FFmpeg
//!
//! # Example
//!
//! ```rust,no_run
//! use screencast::capture::{CaptureHandle, TestPatternScreen};
//! use screencast::{AudioMode, RecorderConfig, SessionController};
//!
//! fn main() -> screencast::Result<()> {
//!     let config = RecorderConfig::default();
//!     let controller = SessionController::new(config.clone())?;
//!     let screen = TestPatternScreen::new(config.video.resolution, config.video.framerate);
//!
//!     controller.start(AudioMode::Disabled, CaptureHandle::new(screen))?;
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     let summary = controller.stop()?;
//!     println!("{} ({:?})", summary.path.display(), summary.duration());
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod encode;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod session;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use capture::{AudioSource, AudioTap, CaptureHandle, ScreenSource};
pub use config::{AudioMode, Container, RecorderConfig, VideoQuality};
pub use encode::{AudioCodec, CodecEngine, EncoderBackend, EngineFactory, VideoCodec};
pub use error::{Error, Result};
pub use output::{inspect, ContainerInfo, Muxer, MuxerState};
pub use session::{
    RecordingSummary, SessionController, SessionEvent, SessionHandle, SessionState, ToggleOutcome,
};
pub use types::{Buffer, BufferFlags, Framerate, MediaFormat, Resolution, StreamKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if FFmpeg encoders are usable in this build
pub fn is_ffmpeg_available() -> bool {
    #[cfg(feature = "ffmpeg")]
    {
        encode::ffmpeg::is_available()
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        false
    }
}

/// Get information about available encoders
pub fn get_encoder_info() -> encode::EncoderInfo {
    encode::get_info()
}
