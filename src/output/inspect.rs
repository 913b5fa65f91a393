//! Matroska inspection
//!
//! Walks a Matroska file and reports its tracks, the timestamps of every
//! block and the declared duration. Block payloads are skipped, so large raw
//! recordings are cheap to inspect.

use super::ebml::{self, id, ElementHeader};
use crate::error::{Error, Result};
use crate::types::StreamKind;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

/// One track of an inspected file
#[derive(Debug, Clone, Default)]
pub struct TrackInfo {
    pub number: u64,
    pub kind: Option<StreamKind>,
    pub codec_id: String,
    pub codec_private: Vec<u8>,
    pub default_duration_ns: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_rate: Option<f64>,
    pub channels: Option<u32>,
    /// Block timestamps in milliseconds, in file order
    pub timestamps_ms: Vec<i64>,
    pub key_frames: u64,
    pub bytes: u64,
}

impl TrackInfo {
    pub fn sample_count(&self) -> usize {
        self.timestamps_ms.len()
    }

    /// Check block timestamps never go backwards
    pub fn is_monotonic(&self) -> bool {
        self.timestamps_ms.windows(2).all(|w| w[0] <= w[1])
    }
}

/// Everything read back from a container
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub doc_type: String,
    pub muxing_app: Option<String>,
    pub timestamp_scale_ns: u64,
    /// Declared duration in milliseconds
    pub duration_ms: Option<f64>,
    pub tracks: Vec<TrackInfo>,
    pub clusters: usize,
    pub cue_points: usize,
}

impl ContainerInfo {
    pub fn tracks_of(&self, kind: StreamKind) -> impl Iterator<Item = &TrackInfo> {
        self.tracks.iter().filter(move |t| t.kind == Some(kind))
    }

    pub fn track_count(&self, kind: StreamKind) -> usize {
        self.tracks_of(kind).count()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| Duration::from_secs_f64(ms / 1_000.0))
    }

    fn track_mut(&mut self, number: u64) -> Option<&mut TrackInfo> {
        self.tracks.iter_mut().find(|t| t.number == number)
    }
}

/// Inspect a Matroska file
pub fn inspect(path: impl AsRef<Path>) -> Result<ContainerInfo> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = Walker {
        r: BufReader::new(file),
        pos: 0,
    };
    let info = reader.walk().map_err(|e| match e {
        Error::Io(io) if io.kind() == std::io::ErrorKind::InvalidData => {
            Error::Container(format!("{}: {}", path.display(), io))
        }
        other => other,
    })?;
    tracing::debug!(
        "Inspected {}: {} tracks, {} clusters",
        path.display(),
        info.tracks.len(),
        info.clusters
    );
    Ok(info)
}

struct Walker<R: Read + Seek> {
    r: R,
    pos: u64,
}

impl<R: Read + Seek> Walker<R> {
    fn header(&mut self) -> Result<Option<ElementHeader>> {
        let header = ebml::read_header(&mut self.r)?;
        if let Some(h) = &header {
            self.pos += h.header_len as u64;
        }
        Ok(header)
    }

    fn body(&mut self, size: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        self.r.read_exact(&mut buf)?;
        self.pos += size;
        Ok(buf)
    }

    fn skip(&mut self, size: u64) -> Result<()> {
        self.r.seek(SeekFrom::Current(size as i64))?;
        self.pos += size;
        Ok(())
    }

    fn walk(&mut self) -> Result<ContainerInfo> {
        let mut info = ContainerInfo {
            timestamp_scale_ns: 1_000_000,
            ..Default::default()
        };

        let header = self
            .header()?
            .ok_or_else(|| Error::Container("Empty file".into()))?;
        if header.id != id::EBML {
            return Err(Error::Container("Not an EBML file".into()));
        }
        let size = header
            .size
            .ok_or_else(|| Error::Container("EBML header has unknown size".into()))?;
        for (child, payload) in ebml::children(&self.body(size)?) {
            if child == id::DOC_TYPE {
                info.doc_type = String::from_utf8_lossy(payload).into_owned();
            }
        }
        if info.doc_type != "matroska" && info.doc_type != "webm" {
            return Err(Error::Container(format!(
                "Unsupported document type '{}'",
                info.doc_type
            )));
        }

        let segment = self
            .header()?
            .ok_or_else(|| Error::Container("Missing Segment".into()))?;
        if segment.id != id::SEGMENT {
            return Err(Error::Container("Missing Segment".into()));
        }
        let segment_end = segment.size.map(|s| self.pos + s);

        let mut cluster_ts: i64 = 0;
        loop {
            if segment_end.is_some_and(|end| self.pos >= end) {
                break;
            }
            let Some(element) = self.header()? else {
                break;
            };
            match (element.id, element.size) {
                (id::INFO, Some(size)) => self.read_info(&mut info, size)?,
                (id::TRACKS, Some(size)) => self.read_tracks(&mut info, size)?,
                (id::CLUSTER, _) => {
                    // Children are walked by this loop, known size or not
                    info.clusters += 1;
                }
                (id::TIMESTAMP, Some(size)) => {
                    cluster_ts = ebml::parse_uint(&self.body(size)?) as i64;
                }
                (id::SIMPLE_BLOCK, Some(size)) => {
                    self.read_block(&mut info, size, cluster_ts, None)?;
                }
                (id::BLOCK_GROUP, Some(size)) => {
                    let body = self.body(size)?;
                    let mut block = None;
                    let mut referenced = false;
                    for (child, payload) in ebml::children(&body) {
                        match child {
                            id::BLOCK => block = Some(payload),
                            id::REFERENCE_BLOCK => referenced = true,
                            _ => {}
                        }
                    }
                    if let Some(block) = block {
                        let size = block.len() as u64;
                        record_block(&mut info, block, size, cluster_ts, Some(!referenced));
                    }
                }
                (id::CUES, Some(size)) => {
                    let body = self.body(size)?;
                    info.cue_points = ebml::children(&body)
                        .filter(|(child, _)| *child == id::CUE_POINT)
                        .count();
                }
                (_, Some(size)) => self.skip(size)?,
                (other, None) => {
                    return Err(Error::Container(format!(
                        "Element 0x{:X} has unknown size",
                        other
                    )))
                }
            }
        }

        // Convert block timestamps to milliseconds
        if info.timestamp_scale_ns != 1_000_000 {
            let scale = info.timestamp_scale_ns as f64 / 1_000_000.0;
            for track in &mut info.tracks {
                for ts in &mut track.timestamps_ms {
                    *ts = (*ts as f64 * scale).round() as i64;
                }
            }
            info.duration_ms = info.duration_ms.map(|d| d * scale);
        }
        Ok(info)
    }

    fn read_info(&mut self, info: &mut ContainerInfo, size: u64) -> Result<()> {
        for (child, payload) in ebml::children(&self.body(size)?) {
            match child {
                id::TIMESTAMP_SCALE => info.timestamp_scale_ns = ebml::parse_uint(payload),
                id::DURATION => info.duration_ms = ebml::parse_float(payload),
                id::MUXING_APP => {
                    info.muxing_app = Some(String::from_utf8_lossy(payload).into_owned())
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn read_tracks(&mut self, info: &mut ContainerInfo, size: u64) -> Result<()> {
        let body = self.body(size)?;
        for (child, entry) in ebml::children(&body) {
            if child != id::TRACK_ENTRY {
                continue;
            }
            let mut track = TrackInfo::default();
            for (field, payload) in ebml::children(entry) {
                match field {
                    id::TRACK_NUMBER => track.number = ebml::parse_uint(payload),
                    id::TRACK_TYPE => {
                        track.kind = match ebml::parse_uint(payload) {
                            1 => Some(StreamKind::Video),
                            2 => Some(StreamKind::Audio),
                            _ => None,
                        }
                    }
                    id::CODEC_ID => track.codec_id = String::from_utf8_lossy(payload).into_owned(),
                    id::CODEC_PRIVATE => track.codec_private = payload.to_vec(),
                    id::DEFAULT_DURATION => track.default_duration_ns = Some(ebml::parse_uint(payload)),
                    id::VIDEO => {
                        for (v, p) in ebml::children(payload) {
                            match v {
                                id::PIXEL_WIDTH => track.width = Some(ebml::parse_uint(p) as u32),
                                id::PIXEL_HEIGHT => track.height = Some(ebml::parse_uint(p) as u32),
                                _ => {}
                            }
                        }
                    }
                    id::AUDIO => {
                        for (a, p) in ebml::children(payload) {
                            match a {
                                id::SAMPLING_FREQUENCY => track.sample_rate = ebml::parse_float(p),
                                id::CHANNELS => track.channels = Some(ebml::parse_uint(p) as u32),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            info.tracks.push(track);
        }
        Ok(())
    }

    /// Read a SimpleBlock header and skip its payload
    fn read_block(
        &mut self,
        info: &mut ContainerInfo,
        size: u64,
        cluster_ts: i64,
        key: Option<bool>,
    ) -> Result<()> {
        // Track vint (up to 8 bytes) + timecode + flags
        let head_len = size.min(11);
        let head = self.body(head_len)?;
        record_block(info, &head, size, cluster_ts, key);
        self.skip(size - head_len)
    }
}

fn record_block(info: &mut ContainerInfo, head: &[u8], size: u64, cluster_ts: i64, key: Option<bool>) {
    let Some((number, vint_len)) = ebml::parse_vint(head) else {
        return;
    };
    if head.len() < vint_len + 3 {
        return;
    }
    let relative = i16::from_be_bytes([head[vint_len], head[vint_len + 1]]) as i64;
    let flags = head[vint_len + 2];
    let is_key = key.unwrap_or(flags & 0x80 != 0);
    let payload = size.saturating_sub(vint_len as u64 + 3);

    if let Some(track) = info.track_mut(number) {
        track.timestamps_ms.push(cluster_ts + relative);
        track.bytes += payload;
        if is_key {
            track.key_frames += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;
    use crate::encode::{AudioCodec, VideoCodec};
    use crate::output::{ContainerWriter, MatroskaWriter};
    use crate::types::{Buffer, BufferFlags};

    #[test]
    fn test_inspect_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two-tracks.mkv");
        let config = RecorderConfig::default().with_resolution(4, 2);

        let mut writer = MatroskaWriter::create(&path).unwrap();
        let video = writer
            .add_track(StreamKind::Video, &config.video_format(VideoCodec::Raw))
            .unwrap();
        let audio = writer
            .add_track(StreamKind::Audio, &config.audio_format(AudioCodec::Pcm))
            .unwrap();
        writer.begin().unwrap();
        for i in 0..10i64 {
            writer
                .write_sample(video, &Buffer::new(vec![0; 12], i * 100_000, BufferFlags::KEY_FRAME))
                .unwrap();
            writer
                .write_sample(audio, &Buffer::new(vec![0; 2048], i * 100_000 + 5_000, BufferFlags::KEY_FRAME))
                .unwrap();
        }
        writer.finish().unwrap();
        drop(writer);

        let info = inspect(&path).unwrap();
        assert_eq!(info.doc_type, "matroska");
        assert_eq!(info.track_count(StreamKind::Video), 1);
        assert_eq!(info.track_count(StreamKind::Audio), 1);

        let v = info.tracks_of(StreamKind::Video).next().unwrap();
        assert_eq!(v.codec_id, "V_UNCOMPRESSED");
        assert_eq!((v.width, v.height), (Some(4), Some(2)));
        assert_eq!(v.sample_count(), 10);
        assert_eq!(v.timestamps_ms[9], 900);
        assert!(v.is_monotonic());
        assert_eq!(v.bytes, 120);

        let a = info.tracks_of(StreamKind::Audio).next().unwrap();
        assert_eq!(a.codec_id, "A_PCM/INT/LIT");
        assert_eq!(a.sample_rate, Some(44_100.0));
        assert_eq!(a.timestamps_ms[0], 5);
        assert_eq!(a.sample_count(), 10);

        // Audio block at 905 ms plus one 1024-sample block
        let duration = info.duration_ms.unwrap();
        assert!((duration - 928.2).abs() < 1.0, "duration {}", duration);
        assert!(info.cue_points >= 1);
    }

    #[test]
    fn test_unknown_size_segment() {
        // Header of a file whose writer never finished
        let mut data = Vec::new();
        let mut ebml_body = Vec::new();
        ebml::write_str(&mut ebml_body, id::DOC_TYPE, "matroska");
        ebml::write_master(&mut data, id::EBML, &ebml_body);
        ebml::write_id(&mut data, id::SEGMENT);
        data.extend_from_slice(&ebml::UNKNOWN_SIZE);

        let mut entry = Vec::new();
        ebml::write_uint(&mut entry, id::TRACK_NUMBER, 1);
        ebml::write_uint(&mut entry, id::TRACK_TYPE, 2);
        let mut tracks = Vec::new();
        ebml::write_master(&mut tracks, id::TRACK_ENTRY, &entry);
        ebml::write_master(&mut data, id::TRACKS, &tracks);

        ebml::write_id(&mut data, id::CLUSTER);
        data.extend_from_slice(&ebml::UNKNOWN_SIZE);
        ebml::write_uint(&mut data, id::TIMESTAMP, 40);
        ebml::write_bytes(&mut data, id::SIMPLE_BLOCK, &[0x81, 0x00, 0x02, 0x80, 0xAA]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.mkv");
        std::fs::write(&path, &data).unwrap();

        let info = inspect(&path).unwrap();
        assert_eq!(info.duration_ms, None);
        let track = &info.tracks[0];
        assert_eq!(track.timestamps_ms, vec![42]);
        assert_eq!(track.key_frames, 1);
        assert_eq!(track.bytes, 1);
    }

    #[test]
    fn test_rejects_non_matroska() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.mkv");
        std::fs::write(&path, b"\x00\x00\x00\x18ftypmp42").unwrap();
        assert!(matches!(inspect(&path), Err(Error::Container(_))));
    }
}
