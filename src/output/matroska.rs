//! Native Matroska writer
//!
//! Layout: EBML header, one Segment (size patched on finish) holding Info
//! (duration patched on finish), Tracks, Clusters of SimpleBlocks and a Cues
//! index of video key frames. Timestamps use a 1 ms TimestampScale and are
//! rebased to the first written sample.

use super::ebml::{self, id};
use super::{ContainerSummary, ContainerWriter, TrackId, TrackSummary};
use crate::config::Container;
use crate::error::{Error, Result};
use crate::types::{Buffer, MediaFormat, StreamKind};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

const TIMESTAMP_SCALE_NS: u64 = 1_000_000;
const MAX_CLUSTER_MS: i64 = 5_000;
/// A video key frame opens a new cluster once the current one is this old
const KEYFRAME_CLUSTER_MS: i64 = 1_000;

struct Track {
    number: u64,
    kind: StreamKind,
    format: MediaFormat,
    last_ms: Option<i64>,
    samples: u64,
    key_frames: u64,
    bytes: u64,
}

struct OpenCluster {
    /// Offset of the cluster element relative to the segment data start
    segment_offset: u64,
    size_pos: u64,
    data_start: u64,
    timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Writing,
    Finished,
}

/// Streaming Matroska writer
pub struct MatroskaWriter<W: Write + Seek> {
    out: W,
    phase: Phase,
    tracks: Vec<Track>,
    segment_size_pos: u64,
    segment_data_start: u64,
    duration_pos: u64,
    cluster: Option<OpenCluster>,
    cues: Vec<(i64, u64, u64)>,
    origin_us: Option<i64>,
    /// Samples stamped before the origin and written at zero
    clamped: u64,
    bytes_written: u64,
}

impl MatroskaWriter<BufWriter<File>> {
    /// Create a writer for a new file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            Error::Container(format!("Failed to create {}: {}", path.display(), e))
        })?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Seek> MatroskaWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            phase: Phase::Setup,
            tracks: Vec::new(),
            segment_size_pos: 0,
            segment_data_start: 0,
            duration_pos: 0,
            cluster: None,
            cues: Vec::new(),
            origin_us: None,
            clamped: 0,
            bytes_written: 0,
        }
    }

    /// Hand back the underlying stream
    pub fn into_inner(self) -> W {
        self.out
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.out.stream_position()?)
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Overwrite bytes at `pos` and return to the end
    fn patch(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        let end = self.position()?;
        self.out.seek(SeekFrom::Start(pos))?;
        self.out.write_all(bytes)?;
        self.out.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    fn ebml_header() -> Vec<u8> {
        let mut body = Vec::new();
        ebml::write_uint(&mut body, id::EBML_VERSION, 1);
        ebml::write_uint(&mut body, id::EBML_READ_VERSION, 1);
        ebml::write_uint(&mut body, id::EBML_MAX_ID_LENGTH, 4);
        ebml::write_uint(&mut body, id::EBML_MAX_SIZE_LENGTH, 8);
        ebml::write_str(&mut body, id::DOC_TYPE, "matroska");
        ebml::write_uint(&mut body, id::DOC_TYPE_VERSION, 4);
        ebml::write_uint(&mut body, id::DOC_TYPE_READ_VERSION, 2);
        let mut out = Vec::new();
        ebml::write_master(&mut out, id::EBML, &body);
        out
    }

    fn track_entry(track: &Track) -> Vec<u8> {
        let mut body = Vec::new();
        ebml::write_uint(&mut body, id::TRACK_NUMBER, track.number);
        ebml::write_uint(&mut body, id::TRACK_UID, track.number);
        ebml::write_uint(&mut body, id::FLAG_LACING, 0);

        let duration_ns = track.format.frame_duration_us() as u64 * 1_000;
        match &track.format {
            MediaFormat::Video(v) => {
                ebml::write_uint(&mut body, id::TRACK_TYPE, 1);
                ebml::write_str(&mut body, id::CODEC_ID, v.codec.matroska_codec_id());
                if duration_ns > 0 {
                    ebml::write_uint(&mut body, id::DEFAULT_DURATION, duration_ns);
                }
                let mut video = Vec::new();
                ebml::write_uint(&mut video, id::PIXEL_WIDTH, v.resolution.width as u64);
                ebml::write_uint(&mut video, id::PIXEL_HEIGHT, v.resolution.height as u64);
                if v.codec == crate::encode::VideoCodec::Raw {
                    ebml::write_bytes(&mut video, id::COLOUR_SPACE, b"I420");
                }
                ebml::write_master(&mut body, id::VIDEO, &video);
            }
            MediaFormat::Audio(a) => {
                ebml::write_uint(&mut body, id::TRACK_TYPE, 2);
                ebml::write_str(&mut body, id::CODEC_ID, a.codec.matroska_codec_id());
                if duration_ns > 0 {
                    ebml::write_uint(&mut body, id::DEFAULT_DURATION, duration_ns);
                }
                let mut audio = Vec::new();
                ebml::write_float(&mut audio, id::SAMPLING_FREQUENCY, a.sample_rate as f64);
                ebml::write_uint(&mut audio, id::CHANNELS, a.channels as u64);
                ebml::write_uint(&mut audio, id::BIT_DEPTH, a.bits_per_sample as u64);
                ebml::write_master(&mut body, id::AUDIO, &audio);
            }
        }
        let private = track.format.codec_private();
        if !private.is_empty() {
            ebml::write_bytes(&mut body, id::CODEC_PRIVATE, private);
        }

        let mut out = Vec::new();
        ebml::write_master(&mut out, id::TRACK_ENTRY, &body);
        out
    }

    fn open_cluster(&mut self, timestamp_ms: i64) -> Result<()> {
        let start = self.position()?;
        let mut head = Vec::new();
        ebml::write_id(&mut head, id::CLUSTER);
        let size_pos = start + head.len() as u64;
        head.extend_from_slice(&ebml::UNKNOWN_SIZE);
        let data_start = start + head.len() as u64;
        ebml::write_uint(&mut head, id::TIMESTAMP, timestamp_ms as u64);
        self.emit(&head)?;

        tracing::trace!("Opened cluster at {} ms", timestamp_ms);
        self.cluster = Some(OpenCluster {
            segment_offset: start - self.segment_data_start,
            size_pos,
            data_start,
            timestamp_ms,
        });
        Ok(())
    }

    fn close_cluster(&mut self) -> Result<()> {
        if let Some(cluster) = self.cluster.take() {
            let size = self.position()? - cluster.data_start;
            self.patch(cluster.size_pos, &ebml::encode_vint(size, 8))?;
        }
        Ok(())
    }

    fn needs_new_cluster(&self, timestamp_ms: i64, kind: StreamKind, key: bool) -> bool {
        let Some(cluster) = &self.cluster else {
            return true;
        };
        let relative = timestamp_ms - cluster.timestamp_ms;
        if relative < i16::MIN as i64 || relative > i16::MAX as i64 {
            return true;
        }
        if relative >= MAX_CLUSTER_MS {
            return true;
        }
        kind == StreamKind::Video && key && relative >= KEYFRAME_CLUSTER_MS
    }

    fn write_cues(&mut self) -> Result<()> {
        if self.cues.is_empty() {
            return Ok(());
        }
        let mut body = Vec::new();
        for (time_ms, track, position) in &self.cues {
            let mut positions = Vec::new();
            ebml::write_uint(&mut positions, id::CUE_TRACK, *track);
            ebml::write_uint(&mut positions, id::CUE_CLUSTER_POSITION, *position);
            let mut point = Vec::new();
            ebml::write_uint(&mut point, id::CUE_TIME, *time_ms as u64);
            ebml::write_master(&mut point, id::CUE_TRACK_POSITIONS, &positions);
            ebml::write_master(&mut body, id::CUE_POINT, &point);
        }
        let mut out = Vec::new();
        ebml::write_master(&mut out, id::CUES, &body);
        self.emit(&out)
    }

    fn samples_written(&self) -> u64 {
        self.tracks.iter().map(|t| t.samples).sum()
    }

    fn duration_ms(&self) -> f64 {
        self.tracks
            .iter()
            .filter_map(|t| {
                let last = t.last_ms?;
                Some(last as f64 + t.format.frame_duration_us() as f64 / 1_000.0)
            })
            .fold(0.0, f64::max)
    }
}

impl<W: Write + Seek + Send> ContainerWriter for MatroskaWriter<W> {
    fn container(&self) -> Container {
        Container::Matroska
    }

    fn add_track(&mut self, kind: StreamKind, format: &MediaFormat) -> Result<TrackId> {
        if self.phase != Phase::Setup {
            return Err(Error::Container("Tracks must be added before the header".into()));
        }
        if format.kind() != kind {
            return Err(Error::Container(format!(
                "{} track given a {} format",
                kind,
                format.kind()
            )));
        }
        let number = self.tracks.len() as u64 + 1;
        self.tracks.push(Track {
            number,
            kind,
            format: format.clone(),
            last_ms: None,
            samples: 0,
            key_frames: 0,
            bytes: 0,
        });
        Ok(TrackId(number))
    }

    fn set_time_origin(&mut self, origin_us: i64) {
        if self.samples_written() == 0 {
            self.origin_us = Some(origin_us);
        }
    }

    fn begin(&mut self) -> Result<()> {
        if self.phase != Phase::Setup {
            return Err(Error::Container("Header already written".into()));
        }
        if self.tracks.is_empty() {
            return Err(Error::Container("No tracks registered".into()));
        }

        let mut head = Self::ebml_header();
        ebml::write_id(&mut head, id::SEGMENT);
        let segment_size_pos = head.len() as u64;
        head.extend_from_slice(&ebml::UNKNOWN_SIZE);
        let segment_data_start = head.len() as u64;

        let mut info = Vec::new();
        ebml::write_uint(&mut info, id::TIMESTAMP_SCALE, TIMESTAMP_SCALE_NS);
        let app = concat!("screencast ", env!("CARGO_PKG_VERSION"));
        ebml::write_str(&mut info, id::MUXING_APP, app);
        ebml::write_str(&mut info, id::WRITING_APP, app);
        ebml::write_id(&mut info, id::DURATION);
        ebml::write_size(&mut info, 8);
        let duration_offset = info.len() as u64;
        info.extend_from_slice(&0f64.to_be_bytes());

        let mut info_element = Vec::new();
        ebml::write_id(&mut info_element, id::INFO);
        ebml::write_size(&mut info_element, info.len() as u64);
        let duration_pos = head.len() as u64 + info_element.len() as u64 + duration_offset;
        info_element.extend_from_slice(&info);
        head.extend_from_slice(&info_element);

        let mut tracks = Vec::new();
        for track in &self.tracks {
            tracks.extend_from_slice(&Self::track_entry(track));
        }
        ebml::write_master(&mut head, id::TRACKS, &tracks);

        let base = self.position()?;
        self.emit(&head)?;
        self.segment_size_pos = base + segment_size_pos;
        self.segment_data_start = base + segment_data_start;
        self.duration_pos = base + duration_pos;
        self.phase = Phase::Writing;

        tracing::debug!("Matroska header written with {} tracks", self.tracks.len());
        Ok(())
    }

    fn write_sample(&mut self, track: TrackId, buffer: &Buffer) -> Result<()> {
        if self.phase != Phase::Writing {
            return Err(Error::Container("Sample written outside of the data phase".into()));
        }
        let index = self
            .tracks
            .iter()
            .position(|t| t.number == track.0)
            .ok_or_else(|| Error::Container(format!("Unknown track {}", track.0)))?;
        let kind = self.tracks[index].kind;
        let key = buffer.is_key_frame();

        let origin = *self.origin_us.get_or_insert(buffer.timestamp_us());
        let offset_us = buffer.timestamp_us() - origin;
        if offset_us < 0 {
            if self.clamped == 0 {
                tracing::warn!(
                    "{} sample at {}us precedes the time origin {}us, writing it at 0",
                    kind,
                    buffer.timestamp_us(),
                    origin
                );
            }
            self.clamped += 1;
        }
        let timestamp_ms = offset_us.max(0) / 1_000;

        if self.needs_new_cluster(timestamp_ms, kind, key) {
            self.close_cluster()?;
            self.open_cluster(timestamp_ms)?;
        }
        let (cluster_ts, cluster_offset) = match &self.cluster {
            Some(c) => (c.timestamp_ms, c.segment_offset),
            None => return Err(Error::Internal("Cluster missing after open".into())),
        };
        // One cue per cluster, at its first video key frame
        let indexed = self.cues.last().map(|cue| cue.2) == Some(cluster_offset);
        if kind == StreamKind::Video && key && !indexed {
            self.cues.push((timestamp_ms, track.0, cluster_offset));
        }

        let relative = (timestamp_ms - cluster_ts) as i16;
        let mut block = Vec::with_capacity(buffer.len() + 16);
        ebml::write_id(&mut block, id::SIMPLE_BLOCK);
        let track_vint = ebml::encode_vint(track.0, ebml::size_len(track.0));
        ebml::write_size(&mut block, track_vint.len() as u64 + 3 + buffer.len() as u64);
        block.extend_from_slice(&track_vint);
        block.extend_from_slice(&relative.to_be_bytes());
        block.push(if key { 0x80 } else { 0x00 });
        block.extend_from_slice(buffer.data());
        self.emit(&block)?;

        let t = &mut self.tracks[index];
        t.last_ms = Some(t.last_ms.map_or(timestamp_ms, |last| last.max(timestamp_ms)));
        t.samples += 1;
        t.bytes += buffer.len() as u64;
        if key {
            t.key_frames += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<ContainerSummary> {
        if self.phase != Phase::Writing {
            return Err(Error::Container("Container is not being written".into()));
        }
        self.close_cluster()?;
        self.write_cues()?;

        let duration_ms = self.duration_ms();
        self.patch(self.duration_pos, &duration_ms.to_be_bytes())?;
        let segment_size = self.position()? - self.segment_data_start;
        self.patch(self.segment_size_pos, &ebml::encode_vint(segment_size, 8))?;
        self.out.flush()?;
        self.phase = Phase::Finished;

        let summary = ContainerSummary {
            duration: Duration::from_secs_f64(duration_ms / 1_000.0),
            tracks: self
                .tracks
                .iter()
                .map(|t| TrackSummary {
                    id: TrackId(t.number),
                    kind: t.kind,
                    samples: t.samples,
                    key_frames: t.key_frames,
                    bytes: t.bytes,
                })
                .collect(),
            bytes_written: self.bytes_written,
        };
        if self.clamped > 0 {
            tracing::warn!("{} samples preceded the time origin", self.clamped);
        }
        tracing::debug!(
            "Matroska finished: {:.0} ms, {} bytes",
            duration_ms,
            self.bytes_written
        );
        Ok(summary)
    }
}
