//! Audio/Video Muxer
//!
//! Owns the container writer for a session. Every mutation (track
//! registration, sample writes, completion flags, finalize) runs inside one
//! exclusive section, so encoder workers on different threads can share a
//! `Muxer` through an `Arc` without any locking of their own.
//!
//! The container header is written the moment the last expected track
//! registers; samples arriving before that are refused with
//! [`Error::NotStarted`] and dropped by the caller.

use super::{check_codec, create_writer, ContainerSummary, ContainerWriter, TrackId};
use crate::config::Container;
use crate::error::{Error, Result};
use crate::types::{Buffer, MediaFormat, StreamKind, TrackSet};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// Muxer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuxerState {
    /// Waiting for every expected track
    NotStarted,
    /// Header written, samples accepted
    Started,
    /// Writing the trailer
    Finalizing,
    /// File closed (finished or aborted)
    Released,
}

impl std::fmt::Display for MuxerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// What happened to a sample handed to [`Muxer::write_sample`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Zero-length or codec config buffer, nothing to write
    Dropped,
}

#[derive(Debug, Clone, Copy)]
struct TrackSlot {
    id: TrackId,
    last_timestamp_us: Option<i64>,
    written: u64,
}

struct MuxerInner {
    state: MuxerState,
    writer: Option<Box<dyn ContainerWriter>>,
    tracks: [Option<TrackSlot>; 2],
    completed: TrackSet,
    summary: Option<ContainerSummary>,
}

impl MuxerInner {
    fn registered(&self) -> TrackSet {
        let mut set = TrackSet::empty();
        for kind in StreamKind::ALL {
            if self.tracks[kind.index()].is_some() {
                set.insert(kind);
            }
        }
        set
    }

    fn slot_for(&mut self, id: TrackId) -> Option<(StreamKind, &mut TrackSlot)> {
        let kind = StreamKind::ALL
            .into_iter()
            .find(|kind| matches!(self.tracks[kind.index()], Some(slot) if slot.id == id))?;
        self.tracks[kind.index()].as_mut().map(|slot| (kind, slot))
    }
}

/// Shared container owner for one recording
pub struct Muxer {
    path: PathBuf,
    container: Container,
    expected: TrackSet,
    inner: Mutex<MuxerInner>,
}

impl Muxer {
    /// Create a muxer writing a new file
    pub fn create(path: impl Into<PathBuf>, container: Container, expected: TrackSet) -> Result<Self> {
        let path = path.into();
        let writer = create_writer(&path, container)?;
        Self::with_writer(path, writer, expected)
    }

    /// Create a muxer around an existing writer
    pub fn with_writer(
        path: impl Into<PathBuf>,
        writer: Box<dyn ContainerWriter>,
        expected: TrackSet,
    ) -> Result<Self> {
        if !expected.contains(StreamKind::Video) {
            return Err(Error::Config("A recording always carries a video track".into()));
        }
        let path = path.into();
        tracing::debug!("Muxer created for {} ({} tracks expected)", path.display(), expected.len());
        Ok(Self {
            path,
            container: writer.container(),
            expected,
            inner: Mutex::new(MuxerInner {
                state: MuxerState::NotStarted,
                writer: Some(writer),
                tracks: [None, None],
                completed: TrackSet::empty(),
                summary: None,
            }),
        })
    }

    /// Map `origin_us` to zero in the file instead of the first sample written.
    /// Samples of either stream stamped after the origin keep their spacing.
    pub fn with_time_origin(mut self, origin_us: i64) -> Self {
        if let Some(writer) = self.inner.get_mut().writer.as_mut() {
            writer.set_time_origin(origin_us);
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn expected(&self) -> TrackSet {
        self.expected
    }

    pub fn state(&self) -> MuxerState {
        self.inner.lock().state
    }

    /// Registered tracks in stream order
    pub fn tracks(&self) -> Vec<(StreamKind, TrackId)> {
        let inner = self.inner.lock();
        StreamKind::ALL
            .into_iter()
            .filter_map(|kind| inner.tracks[kind.index()].map(|slot| (kind, slot.id)))
            .collect()
    }

    /// Samples written for a stream so far
    pub fn written(&self, kind: StreamKind) -> u64 {
        self.inner.lock().tracks[kind.index()]
            .map(|slot| slot.written)
            .unwrap_or(0)
    }

    /// Register the track for a stream; starts the muxer once every
    /// expected track is present
    pub fn add_track(&self, kind: StreamKind, format: &MediaFormat) -> Result<TrackId> {
        let mut inner = self.inner.lock();

        if !self.expected.contains(kind) {
            return Err(Error::ProtocolViolation(format!(
                "{} track registered but the session has no {} stream",
                kind, kind
            )));
        }
        if inner.tracks[kind.index()].is_some() {
            return Err(Error::DuplicateTrack(kind));
        }
        if inner.state != MuxerState::NotStarted {
            return Err(Error::ProtocolViolation(format!(
                "{} track registered while muxer is {}",
                kind, inner.state
            )));
        }
        check_codec(self.container, format)?;

        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| Error::Internal("Muxer has no writer".into()))?;
        let id = writer.add_track(kind, format)?;
        inner.tracks[kind.index()] = Some(TrackSlot {
            id,
            last_timestamp_us: None,
            written: 0,
        });
        tracing::info!("Added {} track {}", kind, id);

        if inner.registered() == self.expected {
            if let Some(writer) = inner.writer.as_mut() {
                writer.begin()?;
            }
            inner.state = MuxerState::Started;
            tracing::info!("Muxer started: {}", self.path.display());
        }
        Ok(id)
    }

    /// Append a sample to its track
    pub fn write_sample(&self, track: TrackId, buffer: &Buffer) -> Result<WriteOutcome> {
        let mut inner = self.inner.lock();
        if inner.state != MuxerState::Started {
            return Err(Error::NotStarted);
        }
        if buffer.is_codec_config() || buffer.is_empty() {
            return Ok(WriteOutcome::Dropped);
        }

        let timestamp_us = buffer.timestamp_us();
        let (kind, previous) = match inner.slot_for(track) {
            Some((kind, slot)) => (kind, slot.last_timestamp_us),
            None => {
                return Err(Error::ProtocolViolation(format!("Unknown track {}", track)));
            }
        };
        if let Some(previous_us) = previous {
            if timestamp_us < previous_us {
                return Err(Error::TimestampRegression {
                    kind,
                    timestamp_us,
                    previous_us,
                });
            }
        }

        inner
            .writer
            .as_mut()
            .ok_or_else(|| Error::Internal("Muxer has no writer".into()))?
            .write_sample(track, buffer)?;

        if let Some((_, slot)) = inner.slot_for(track) {
            slot.last_timestamp_us = Some(timestamp_us);
            slot.written += 1;
        }
        tracing::trace!("{} sample at {}us ({} bytes)", kind, timestamp_us, buffer.len());
        Ok(WriteOutcome::Written)
    }

    /// Record that a stream delivered its end-of-stream buffer
    pub fn mark_complete(&self, kind: StreamKind) {
        let mut inner = self.inner.lock();
        inner.completed.insert(kind);
        tracing::debug!("{} stream complete", kind);
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        self.expected.iter().all(|kind| inner.completed.contains(kind))
    }

    /// Write the trailer and close the file. A second call returns the
    /// first result without touching the file.
    pub fn finalize(&self) -> Result<ContainerSummary> {
        let mut inner = self.inner.lock();
        match inner.state {
            MuxerState::Released => {
                return inner
                    .summary
                    .clone()
                    .ok_or_else(|| Error::Container("Muxer was aborted".into()));
            }
            MuxerState::NotStarted => return Err(Error::NotStarted),
            MuxerState::Finalizing | MuxerState::Started => {}
        }

        let missing: Vec<String> = self
            .expected
            .iter()
            .filter(|kind| !inner.completed.contains(*kind))
            .map(|kind| kind.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::StreamsIncomplete(missing.join(", ")));
        }

        inner.state = MuxerState::Finalizing;
        let result = match inner.writer.as_mut() {
            Some(writer) => writer.finish(),
            None => Err(Error::Internal("Muxer has no writer".into())),
        };
        // The file is closed either way
        inner.writer = None;
        inner.state = MuxerState::Released;

        let summary = result?;
        tracing::info!(
            "Muxer finished: {} ({:.2}s, {:.2} MB)",
            self.path.display(),
            summary.duration.as_secs_f64(),
            summary.bytes_written as f64 / 1_000_000.0
        );
        inner.summary = Some(summary.clone());
        Ok(summary)
    }

    /// Close the file without finishing it
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        if inner.state == MuxerState::Released {
            return;
        }
        inner.writer = None;
        inner.state = MuxerState::Released;
        tracing::warn!("Muxer aborted: {}", self.path.display());
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("path", &self.path)
            .field("expected", &self.expected)
            .field("state", &self.state())
            .finish()
    }
}
