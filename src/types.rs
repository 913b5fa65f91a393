//! Common types used throughout screencast

use crate::encode::{AudioCodec, VideoCodec};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    // Common resolutions
    pub const SD_360P: Self = Self::new(640, 360);
    pub const HD_720P: Self = Self::new(1280, 720);
    pub const FHD_1080P: Self = Self::new(1920, 1080);

    /// Calculate total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Size in bytes of one I420 (planar YUV 4:2:0) frame
    pub fn i420_frame_size(&self) -> usize {
        let luma = self.pixels() as usize;
        let chroma = ((self.width as usize + 1) / 2) * ((self.height as usize + 1) / 2);
        luma + 2 * chroma
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::FHD_1080P
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Framerate representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    // Common framerates
    pub const FPS_30: Self = Self::new(30, 1);
    pub const FPS_48: Self = Self::new(48, 1);
    pub const FPS_60: Self = Self::new(60, 1);

    /// Get framerate as f64
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Frame duration in microseconds
    pub fn frame_duration_us(&self) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (1_000_000 * self.den as i64) / self.num as i64
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self::FPS_48
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{} fps", self.num)
        } else {
            write!(f, "{:.2} fps", self.as_f64())
        }
    }
}

/// The two kinds of stream a session can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Video, StreamKind::Audio];

    /// Dense index for per-kind tables
    pub fn index(&self) -> usize {
        match self {
            StreamKind::Video => 0,
            StreamKind::Audio => 1,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

/// Set of stream kinds a session expects to register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackSet {
    video: bool,
    audio: bool,
}

impl TrackSet {
    pub const fn empty() -> Self {
        Self {
            video: false,
            audio: false,
        }
    }

    pub const fn video_only() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }

    pub const fn video_and_audio() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }

    pub fn insert(&mut self, kind: StreamKind) {
        match kind {
            StreamKind::Video => self.video = true,
            StreamKind::Audio => self.audio = true,
        }
    }

    pub fn contains(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Video => self.video,
            StreamKind::Audio => self.audio,
        }
    }

    pub fn len(&self) -> usize {
        self.video as usize + self.audio as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = StreamKind> + '_ {
        StreamKind::ALL.into_iter().filter(|k| self.contains(*k))
    }
}

/// Buffer flag set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    /// Sample starts a decodable group (sync sample)
    pub const KEY_FRAME: Self = Self(1);
    /// Codec setup data, never written as a sample
    pub const CODEC_CONFIG: Self = Self(1 << 1);
    /// Last buffer of the stream
    pub const END_OF_STREAM: Self = Self(1 << 2);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A chunk of stream data moving between pipeline stages
///
/// The payload is fixed once the buffer is built. Ownership moves from stage
/// to stage; nothing keeps a reference after handing a buffer on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    timestamp_us: i64,
    flags: BufferFlags,
}

impl Buffer {
    pub fn new(data: Vec<u8>, timestamp_us: i64, flags: BufferFlags) -> Self {
        Self {
            data,
            timestamp_us,
            flags,
        }
    }

    /// Empty terminal buffer
    pub fn end_of_stream(timestamp_us: i64) -> Self {
        Self::new(Vec::new(), timestamp_us, BufferFlags::END_OF_STREAM)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Presentation timestamp in monotonic microseconds
    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    /// Codec config payloads were already handed over with the format; the
    /// buffer is forwarded with zero size so nothing downstream writes it.
    pub fn strip_codec_config(mut self) -> Self {
        if self.is_codec_config() {
            self.data.clear();
        }
        self
    }
}

/// Raw (uncompressed) input for a codec engine
///
/// Video input is one I420 frame, audio input one block of interleaved
/// little-endian PCM samples.
#[derive(Debug, Clone)]
pub struct RawInput {
    pub data: Vec<u8>,
    pub timestamp_us: i64,
    pub flags: BufferFlags,
}

/// Negotiated video stream format
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFormat {
    pub codec: VideoCodec,
    pub resolution: Resolution,
    pub framerate: Framerate,
    /// Bitrate in bits/sec
    pub bitrate: u32,
    /// Seconds between key frames
    pub key_frame_interval_secs: u32,
    /// Codec setup data (SPS/PPS for H.264, empty for raw video)
    pub codec_private: Vec<u8>,
}

/// Negotiated audio stream format
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Bitrate in bits/sec
    pub bitrate: u32,
    /// Samples per channel carried by one output buffer
    pub frame_samples: u32,
    /// Codec setup data (AudioSpecificConfig for AAC, empty for PCM)
    pub codec_private: Vec<u8>,
}

impl AudioFormat {
    /// Bytes of one interleaved PCM sample frame
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

/// Stream format as requested from, or negotiated by, a codec engine
#[derive(Debug, Clone, PartialEq)]
pub enum MediaFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl MediaFormat {
    pub fn kind(&self) -> StreamKind {
        match self {
            MediaFormat::Video(_) => StreamKind::Video,
            MediaFormat::Audio(_) => StreamKind::Audio,
        }
    }

    pub fn codec_private(&self) -> &[u8] {
        match self {
            MediaFormat::Video(v) => &v.codec_private,
            MediaFormat::Audio(a) => &a.codec_private,
        }
    }

    /// Nominal duration of one output buffer in microseconds
    pub fn frame_duration_us(&self) -> i64 {
        match self {
            MediaFormat::Video(v) => v.framerate.frame_duration_us(),
            MediaFormat::Audio(a) if a.sample_rate > 0 => {
                a.frame_samples as i64 * 1_000_000 / a.sample_rate as i64
            }
            MediaFormat::Audio(_) => 0,
        }
    }

    pub fn as_video(&self) -> Option<&VideoFormat> {
        match self {
            MediaFormat::Video(v) => Some(v),
            MediaFormat::Audio(_) => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioFormat> {
        match self {
            MediaFormat::Audio(a) => Some(a),
            MediaFormat::Video(_) => None,
        }
    }
}

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic timestamp in microseconds, shared by every capture path
pub fn monotonic_us() -> i64 {
    let epoch = CLOCK_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}

/// Format an elapsed duration the way recorder UIs show it (`MM:SS` or `H:MM:SS`)
pub fn format_elapsed(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_buffer_flags() {
        let flags = BufferFlags::KEY_FRAME | BufferFlags::END_OF_STREAM;
        assert!(flags.contains(BufferFlags::KEY_FRAME));
        assert!(flags.contains(BufferFlags::END_OF_STREAM));
        assert!(!flags.contains(BufferFlags::CODEC_CONFIG));
        assert!(!flags.contains(BufferFlags::NONE));
    }

    #[test]
    fn test_codec_config_is_stripped() {
        let config = Buffer::new(vec![1, 2, 3], 0, BufferFlags::CODEC_CONFIG).strip_codec_config();
        assert!(config.is_empty());
        assert!(config.is_codec_config());

        let data = Buffer::new(vec![1, 2, 3], 0, BufferFlags::KEY_FRAME).strip_codec_config();
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_track_set() {
        let set = TrackSet::video_only();
        assert!(set.contains(StreamKind::Video));
        assert!(!set.contains(StreamKind::Audio));
        assert_eq!(set.len(), 1);

        let mut set = TrackSet::empty();
        set.insert(StreamKind::Audio);
        set.insert(StreamKind::Video);
        assert_eq!(set, TrackSet::video_and_audio());
        assert_eq!(set.iter().collect::<Vec<_>>(), StreamKind::ALL.to_vec());
    }

    #[test]
    fn test_i420_frame_size() {
        assert_eq!(Resolution::new(4, 2).i420_frame_size(), 8 + 2 * 2);
        assert_eq!(Resolution::new(5, 3).i420_frame_size(), 15 + 2 * 6);
    }

    #[test]
    fn test_frame_durations() {
        assert_eq!(Framerate::FPS_48.frame_duration_us(), 20_833);
        let audio = MediaFormat::Audio(AudioFormat {
            codec: AudioCodec::Pcm,
            sample_rate: 44_100,
            channels: 1,
            bits_per_sample: 16,
            bitrate: 705_600,
            frame_samples: 1024,
            codec_private: Vec::new(),
        });
        assert_eq!(audio.frame_duration_us(), 23_219);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(5)), "00:05");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "02:05");
        assert_eq!(format_elapsed(Duration::from_secs(3_725)), "1:02:05");
    }

    #[test]
    fn test_monotonic_clock() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
    }
}
