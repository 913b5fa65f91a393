//! Output module
//!
//! - [`Muxer`]: the single owner of the container, gating and serializing writes
//! - [`ContainerWriter`]: the byte-level format behind it
//!   - native Matroska (.mkv), always available
//!   - FFmpeg MP4/Matroska (feature `ffmpeg`)
//! - [`inspect`]: reads a finished Matroska file back

pub mod ebml;
pub mod inspect;
pub mod matroska;
pub mod muxer;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use inspect::{inspect, ContainerInfo, TrackInfo};
pub use matroska::MatroskaWriter;
pub use muxer::{Muxer, MuxerState, WriteOutcome};

use crate::config::Container;
use crate::error::{Error, Result};
use crate::types::{Buffer, MediaFormat, StreamKind};
use std::path::Path;
use std::time::Duration;

/// Track identifier assigned when a track is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-track totals of a finished container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSummary {
    pub id: TrackId,
    pub kind: StreamKind,
    pub samples: u64,
    pub key_frames: u64,
    pub bytes: u64,
}

/// What a finished container holds
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub duration: Duration,
    pub tracks: Vec<TrackSummary>,
    pub bytes_written: u64,
}

impl ContainerSummary {
    pub fn track(&self, kind: StreamKind) -> Option<&TrackSummary> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn samples(&self, kind: StreamKind) -> u64 {
        self.track(kind).map(|t| t.samples).unwrap_or(0)
    }
}

/// Trait for container formats
///
/// Call order: `add_track` for every stream, `begin`, any number of
/// `write_sample`, then `finish` once.
pub trait ContainerWriter: Send {
    fn container(&self) -> Container;

    fn add_track(&mut self, kind: StreamKind, format: &MediaFormat) -> Result<TrackId>;

    /// Pin the timestamp written as zero. Without one, the first sample
    /// written to any track becomes the origin. Ignored once a sample is out.
    fn set_time_origin(&mut self, origin_us: i64);

    /// Write the container header
    fn begin(&mut self) -> Result<()>;

    /// Append one sample at the buffer's timestamp
    fn write_sample(&mut self, track: TrackId, buffer: &Buffer) -> Result<()>;

    /// Write trailing data and flush
    fn finish(&mut self) -> Result<ContainerSummary>;
}

/// Create a container writer for a new file
pub fn create_writer(path: &Path, container: Container) -> Result<Box<dyn ContainerWriter>> {
    match container {
        Container::Matroska => Ok(Box::new(MatroskaWriter::create(path)?)),
        Container::Mp4 => {
            #[cfg(feature = "ffmpeg")]
            {
                Ok(Box::new(ffmpeg::FfmpegWriter::create(path, container)?))
            }
            #[cfg(not(feature = "ffmpeg"))]
            {
                Err(Error::Config(
                    "MP4 output needs screencast built with the `ffmpeg` feature".into(),
                ))
            }
        }
    }
}

/// Check that a stream's codec can go into a container
pub fn check_codec(container: Container, format: &MediaFormat) -> Result<()> {
    use crate::encode::{AudioCodec, VideoCodec};
    let ok = match (container, format) {
        (Container::Matroska, _) => true,
        (Container::Mp4, MediaFormat::Video(v)) => v.codec == VideoCodec::H264,
        (Container::Mp4, MediaFormat::Audio(a)) => a.codec == AudioCodec::Aac,
    };
    if !ok {
        return Err(Error::Config(format!(
            "{:?} cannot hold a {} {} stream",
            container,
            match format {
                MediaFormat::Video(v) => v.codec.display_name(),
                MediaFormat::Audio(a) => a.codec.display_name(),
            },
            format.kind()
        )));
    }
    Ok(())
}
