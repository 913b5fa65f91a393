//! Configuration types for screencast
//!
//! A [`RecorderConfig`] is read from TOML with `[output]`, `[video]`, `[audio]`
//! and `[pipeline]` sections. Every field has a default, so an empty file is a
//! valid configuration.

use crate::encode::{AudioCodec, EncoderBackend, VideoCodec};
use crate::error::{Error, Result};
use crate::types::{AudioFormat, Framerate, MediaFormat, Resolution, VideoFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where audio for a session comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    /// Video only
    #[default]
    Disabled,
    /// Internal playback loopback
    Internal,
    /// Microphone
    Microphone,
}

impl AudioMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, AudioMode::Disabled)
    }

    /// Map the recorder's persisted integer setting (0/1/2)
    pub fn from_setting(value: i32) -> Option<Self> {
        match value {
            0 => Some(AudioMode::Disabled),
            1 => Some(AudioMode::Internal),
            2 => Some(AudioMode::Microphone),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AudioMode::Disabled => "disabled",
            AudioMode::Internal => "internal audio",
            AudioMode::Microphone => "microphone",
        }
    }
}

impl std::fmt::Display for AudioMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Video quality presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl VideoQuality {
    pub const ALL: [VideoQuality; 3] = [VideoQuality::Low, VideoQuality::Medium, VideoQuality::High];

    /// Target video bitrate in bits/sec
    pub fn bitrate(&self) -> u32 {
        match self {
            VideoQuality::Low => 4_000_000,
            VideoQuality::Medium => 5_500_000,
            VideoQuality::High => 7_500_000,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            VideoQuality::Low => "Low",
            VideoQuality::Medium => "Medium",
            VideoQuality::High => "High",
        }
    }
}

/// Output container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    /// Native Matroska writer
    #[default]
    Matroska,
    /// MP4 through FFmpeg
    Mp4,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Matroska => "mkv",
            Container::Mp4 => "mp4",
        }
    }

    /// Check if this build can write the container
    pub fn is_available(&self) -> bool {
        match self {
            Container::Matroska => true,
            Container::Mp4 => cfg!(feature = "ffmpeg"),
        }
    }
}

/// Output file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory recordings are written to
    pub directory: PathBuf,
    /// Container format
    pub container: Container,
    /// File name prefix
    pub prefix: String,
    /// Refuse to start below this much free space (MiB)
    pub min_free_mib: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_recordings_dir(),
            container: Container::Matroska,
            prefix: "ScreenRecord".to_string(),
            min_free_mib: 100,
        }
    }
}

fn default_recordings_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Videos").join("Screencasts"))
        .unwrap_or_else(|| std::env::temp_dir().join("screencasts"))
}

/// Video stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub resolution: Resolution,
    pub framerate: Framerate,
    pub quality: VideoQuality,
    /// Explicit bitrate, overrides the quality preset
    pub bitrate: Option<u32>,
    pub key_frame_interval_secs: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::HD_720P,
            framerate: Framerate::FPS_48,
            quality: VideoQuality::Medium,
            bitrate: None,
            key_frame_interval_secs: 1,
        }
    }
}

impl VideoConfig {
    pub fn effective_bitrate(&self) -> u32 {
        self.bitrate.unwrap_or_else(|| self.quality.bitrate())
    }
}

/// Audio stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Mode used by toggle before any explicit start
    pub mode: AudioMode,
    pub sample_rate: u32,
    pub channels: u16,
    /// Compressed bitrate in bits/sec
    pub bitrate: u32,
    /// Samples per channel in one captured block
    pub block_samples: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mode: AudioMode::Disabled,
            sample_rate: 44_100,
            channels: 1,
            bitrate: 128_000,
            block_samples: 1024,
        }
    }
}

impl AudioConfig {
    /// Bytes in one captured block of s16le samples
    pub fn block_bytes(&self) -> usize {
        self.block_samples as usize * self.channels as usize * 2
    }
}

/// Worker and timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub backend: EncoderBackend,
    /// Engine output poll timeout
    pub poll_timeout_ms: u64,
    /// Upper bound for a worker to reach end-of-stream after stop
    pub drain_timeout_ms: u64,
    /// Output buffer slots per engine
    pub output_slots: usize,
    /// Pending raw inputs per engine before producers block
    pub input_queue_depth: usize,
    /// Progress event cadence
    pub progress_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: EncoderBackend::Auto,
            poll_timeout_ms: 10,
            drain_timeout_ms: 5_000,
            output_slots: 4,
            input_queue_depth: 16,
            progress_interval_ms: 1_000,
        }
    }
}

impl PipelineConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Full recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecorderConfig {
    pub output: OutputConfig,
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub pipeline: PipelineConfig,
}

impl RecorderConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: RecorderConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output.directory = dir.into();
        self
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.output.container = container;
        self
    }

    pub fn with_min_free_mib(mut self, mib: u64) -> Self {
        self.output.min_free_mib = mib;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.video.resolution = Resolution::new(width, height);
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.video.framerate = Framerate::new(fps, 1);
        self
    }

    pub fn with_quality(mut self, quality: VideoQuality) -> Self {
        self.video.quality = quality;
        self
    }

    pub fn with_audio_mode(mut self, mode: AudioMode) -> Self {
        self.audio.mode = mode;
        self
    }

    pub fn with_backend(mut self, backend: EncoderBackend) -> Self {
        self.pipeline.backend = backend;
        self
    }

    pub fn with_drain_timeout_ms(mut self, ms: u64) -> Self {
        self.pipeline.drain_timeout_ms = ms;
        self
    }

    pub fn with_progress_interval_ms(mut self, ms: u64) -> Self {
        self.pipeline.progress_interval_ms = ms;
        self
    }

    /// Reject values no session could run with
    pub fn validate(&self) -> Result<()> {
        let v = &self.video;
        if v.resolution.width == 0 || v.resolution.height == 0 {
            return Err(Error::Config(format!("Invalid resolution {}", v.resolution)));
        }
        if v.framerate.num == 0 || v.framerate.den == 0 {
            return Err(Error::Config("Framerate must be non-zero".into()));
        }
        let a = &self.audio;
        if a.sample_rate == 0 || a.channels == 0 || a.block_samples == 0 {
            return Err(Error::Config(
                "Audio sample rate, channels and block size must be non-zero".into(),
            ));
        }
        let p = &self.pipeline;
        if p.output_slots == 0 || p.input_queue_depth == 0 {
            return Err(Error::Config("Engine queues need at least one slot".into()));
        }
        if p.poll_timeout_ms == 0 || p.progress_interval_ms == 0 {
            return Err(Error::Config("Timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Requested video format for a codec
    pub fn video_format(&self, codec: VideoCodec) -> MediaFormat {
        MediaFormat::Video(VideoFormat {
            codec,
            resolution: self.video.resolution,
            framerate: self.video.framerate,
            bitrate: self.video.effective_bitrate(),
            key_frame_interval_secs: self.video.key_frame_interval_secs,
            codec_private: Vec::new(),
        })
    }

    /// Requested audio format for a codec
    pub fn audio_format(&self, codec: AudioCodec) -> MediaFormat {
        let a = &self.audio;
        let bitrate = match codec {
            AudioCodec::Pcm => a.sample_rate * a.channels as u32 * 16,
            AudioCodec::Aac => a.bitrate,
        };
        MediaFormat::Audio(AudioFormat {
            codec,
            sample_rate: a.sample_rate,
            channels: a.channels,
            bits_per_sample: 16,
            bitrate,
            frame_samples: a.block_samples,
            codec_private: Vec::new(),
        })
    }
}
