//! FFmpeg container writer
//!
//! Writes MP4 (or Matroska) through libavformat. Samples arrive with
//! microsecond timestamps and are rescaled to whatever time base the muxer
//! picked for each stream when the header was written.

use super::{ContainerSummary, ContainerWriter, TrackId, TrackSummary};
use crate::config::Container;
use crate::encode::{AudioCodec, VideoCodec};
use crate::error::{Error, Result};
use crate::types::{Buffer, MediaFormat, StreamKind};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::Id as CodecId;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MICROS: ffmpeg::Rational = ffmpeg::Rational(1, 1_000_000);

struct StreamSlot {
    summary: TrackSummary,
    index: usize,
    frame_duration_us: i64,
    last_us: i64,
}

/// Container writer backed by an FFmpeg output context
pub struct FfmpegWriter {
    output_ctx: ffmpeg::format::context::Output,
    path: PathBuf,
    container: Container,
    streams: Vec<StreamSlot>,
    base_us: Option<i64>,
    started: bool,
    bytes_written: u64,
}

fn format_name(container: Container) -> &'static str {
    match container {
        Container::Matroska => "matroska",
        Container::Mp4 => "mp4",
    }
}

fn video_codec_id(codec: VideoCodec) -> CodecId {
    match codec {
        VideoCodec::Raw => CodecId::RAWVIDEO,
        VideoCodec::H264 => CodecId::H264,
    }
}

fn audio_codec_id(codec: AudioCodec) -> CodecId {
    match codec {
        AudioCodec::Pcm => CodecId::PCM_S16LE,
        AudioCodec::Aac => CodecId::AAC,
    }
}

/// Copy codec private data into FFmpeg-owned, padded memory
unsafe fn set_extradata(par: *mut ffmpeg::ffi::AVCodecParameters, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    let padding = ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
    let ptr = ffmpeg::ffi::av_malloc(data.len() + padding) as *mut u8;
    if ptr.is_null() {
        return;
    }
    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
    std::ptr::write_bytes(ptr.add(data.len()), 0, padding);
    (*par).extradata = ptr;
    (*par).extradata_size = data.len() as i32;
}

impl FfmpegWriter {
    /// Open an output file
    pub fn create(path: impl AsRef<Path>, container: Container) -> Result<Self> {
        ffmpeg::init().map_err(|e| Error::Ffmpeg(e.to_string()))?;

        let path = path.as_ref().to_path_buf();
        let output_ctx = ffmpeg::format::output_as(&path, format_name(container))
            .map_err(|e| Error::Container(format!("Failed to create output: {}", e)))?;

        Ok(Self {
            output_ctx,
            path,
            container,
            streams: Vec::new(),
            base_us: None,
            started: false,
            bytes_written: 0,
        })
    }

    fn slot_mut(&mut self, track: TrackId) -> Result<&mut StreamSlot> {
        self.streams
            .iter_mut()
            .find(|s| s.summary.id == track)
            .ok_or_else(|| Error::Container(format!("Unknown track {}", track)))
    }
}

impl ContainerWriter for FfmpegWriter {
    fn container(&self) -> Container {
        self.container
    }

    fn add_track(&mut self, kind: StreamKind, format: &MediaFormat) -> Result<TrackId> {
        if self.started {
            return Err(Error::Container("Tracks must be added before the header".into()));
        }
        let codec_id = match format {
            MediaFormat::Video(v) => video_codec_id(v.codec),
            MediaFormat::Audio(a) => audio_codec_id(a.codec),
        };
        let codec = ffmpeg::encoder::find(codec_id)
            .ok_or_else(|| Error::Container(format!("Codec {:?} not found", codec_id)))?;

        let mut stream = self
            .output_ctx
            .add_stream(codec)
            .map_err(|e| Error::Container(format!("Failed to add {} stream: {}", kind, e)))?;
        let index = stream.index();

        unsafe {
            let mut params = stream.parameters();
            let par = params.as_mut_ptr();
            (*par).codec_id = codec_id.into();
            (*par).codec_tag = 0;

            match format {
                MediaFormat::Video(v) => {
                    (*par).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                    (*par).width = v.resolution.width as i32;
                    (*par).height = v.resolution.height as i32;
                    (*par).format = ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
                    (*par).bit_rate = v.bitrate as i64;
                }
                MediaFormat::Audio(a) => {
                    (*par).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
                    (*par).sample_rate = a.sample_rate as i32;
                    (*par).bit_rate = a.bitrate as i64;
                    (*par).frame_size = a.frame_samples as i32;
                    ffmpeg::ffi::av_channel_layout_default(&mut (*par).ch_layout, a.channels as i32);
                }
            }
            set_extradata(par, format.codec_private());
        }

        stream.set_time_base(MICROS);
        if let MediaFormat::Video(v) = format {
            stream.set_rate(ffmpeg::Rational::new(v.framerate.num as i32, v.framerate.den as i32));
        }

        let id = TrackId(index as u64 + 1);
        self.streams.push(StreamSlot {
            summary: TrackSummary {
                id,
                kind,
                samples: 0,
                key_frames: 0,
                bytes: 0,
            },
            index,
            frame_duration_us: format.frame_duration_us(),
            last_us: 0,
        });
        tracing::debug!("FFmpeg {} stream {} added ({:?})", kind, index, codec_id);
        Ok(id)
    }

    fn begin(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.output_ctx
            .write_header()
            .map_err(|e| Error::Container(format!("Failed to write header: {}", e)))?;
        self.started = true;
        tracing::debug!("FFmpeg header written: {}", self.path.display());
        Ok(())
    }

    fn set_time_origin(&mut self, origin_us: i64) {
        if self.streams.iter().all(|s| s.summary.samples == 0) {
            self.base_us = Some(origin_us);
        }
    }

    fn write_sample(&mut self, track: TrackId, buffer: &Buffer) -> Result<()> {
        if !self.started {
            return Err(Error::Container("Header not written".into()));
        }
        let base = *self.base_us.get_or_insert(buffer.timestamp_us());
        let pts_us = (buffer.timestamp_us() - base).max(0);

        let slot = self.slot_mut(track)?;
        let index = slot.index;
        let duration_us = slot.frame_duration_us;

        let mut pkt = ffmpeg::Packet::copy(buffer.data());
        pkt.set_pts(Some(pts_us));
        pkt.set_dts(Some(pts_us));
        pkt.set_duration(duration_us);
        pkt.set_stream(index);
        if buffer.is_key_frame() {
            pkt.set_flags(ffmpeg::codec::packet::Flags::KEY);
        }

        let stream_tb = self
            .output_ctx
            .stream(index)
            .ok_or_else(|| Error::Container(format!("Stream {} not found", index)))?
            .time_base();
        pkt.rescale_ts(MICROS, stream_tb);

        pkt.write_interleaved(&mut self.output_ctx)
            .map_err(|e| Error::Container(format!("Failed to write packet: {}", e)))?;

        let slot = self.slot_mut(track)?;
        slot.summary.samples += 1;
        slot.summary.bytes += buffer.len() as u64;
        if buffer.is_key_frame() {
            slot.summary.key_frames += 1;
        }
        slot.last_us = pts_us + duration_us;
        self.bytes_written += buffer.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<ContainerSummary> {
        if !self.started {
            return Err(Error::Container("Header not written".into()));
        }
        self.output_ctx
            .write_trailer()
            .map_err(|e| Error::Container(format!("Failed to write trailer: {}", e)))?;
        self.started = false;

        let duration_us = self.streams.iter().map(|s| s.last_us).max().unwrap_or(0);
        let bytes_written = std::fs::metadata(&self.path)
            .map(|m| m.len())
            .unwrap_or(self.bytes_written);

        tracing::info!(
            "FFmpeg writer finished: {} streams, {:.2} MB",
            self.streams.len(),
            bytes_written as f64 / 1_000_000.0
        );

        Ok(ContainerSummary {
            duration: Duration::from_micros(duration_us.max(0) as u64),
            tracks: self.streams.iter().map(|s| s.summary.clone()).collect(),
            bytes_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;

    #[test]
    fn test_mp4_rejects_late_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let Ok(mut writer) = FfmpegWriter::create(dir.path().join("out.mp4"), Container::Mp4) else {
            return;
        };
        let format = RecorderConfig::default().audio_format(AudioCodec::Aac);
        if writer.add_track(StreamKind::Audio, &format).is_err() {
            // No AAC encoder in this FFmpeg build
            return;
        }
        writer.begin().unwrap();
        assert!(writer.add_track(StreamKind::Audio, &format).is_err());
    }
}
