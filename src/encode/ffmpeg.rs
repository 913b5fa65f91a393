//! FFmpeg-backed engines
//!
//! - libx264 for H.264 video (I420 input, no B-frames so output order is
//!   presentation order)
//! - FFmpeg's native AAC encoder for audio (s16le input converted to planar f32)
//!
//! Both encoders are opened with a global header so the parameter sets end up
//! in codec private data instead of the first packet.

use super::{
    h264, AudioCodec, CodecEngine, EncodeStep, EngineCore, EngineFactory, EngineOptions,
    EngineState, InputPort, OutputEvent, VideoCodec,
};
use crate::error::{Error, Result};
use crate::types::{
    AudioFormat, Buffer, BufferFlags, MediaFormat, RawInput, StreamKind, VideoFormat,
};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::Dictionary;
use std::collections::VecDeque;
use std::time::Duration;

const VIDEO_ENCODER: &str = "libx264";
const AUDIO_ENCODER: &str = "aac";

fn ffmpeg_err(context: &str) -> impl Fn(ffmpeg::Error) -> Error + '_ {
    move |e| Error::Ffmpeg(format!("{}: {}", context, e))
}

fn extradata_of(ctx: *const ffmpeg::ffi::AVCodecContext) -> Vec<u8> {
    unsafe {
        let ptr = (*ctx).extradata;
        let size = (*ctx).extradata_size as usize;
        if !ptr.is_null() && size > 0 {
            std::slice::from_raw_parts(ptr, size).to_vec()
        } else {
            Vec::new()
        }
    }
}

/// Drain every packet the encoder has ready
fn receive_all<F>(encoder: &mut ffmpeg::encoder::Encoder, mut emit: F) -> Result<()>
where
    F: FnMut(&ffmpeg::Packet),
{
    loop {
        let mut packet = ffmpeg::Packet::empty();
        match encoder.receive_packet(&mut packet) {
            Ok(()) => emit(&packet),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => return Ok(()),
            Err(ffmpeg::Error::Eof) => return Ok(()),
            Err(e) => return Err(Error::Ffmpeg(format!("Failed to receive packet: {}", e))),
        }
    }
}

// ============================================================================
// Video
// ============================================================================

struct X264Step {
    encoder: ffmpeg::encoder::Video,
    format: VideoFormat,
}

impl X264Step {
    fn open(format: &VideoFormat) -> Result<(Self, Vec<u8>)> {
        let codec = ffmpeg::encoder::find_by_name(VIDEO_ENCODER)
            .ok_or_else(|| Error::EngineConfig(format!("Encoder {} not found", VIDEO_ENCODER)))?;

        let context = ffmpeg::codec::context::Context::new_with_codec(codec);
        let mut encoder = context
            .encoder()
            .video()
            .map_err(|e| Error::EngineConfig(e.to_string()))?;

        encoder.set_width(format.resolution.width);
        encoder.set_height(format.resolution.height);
        encoder.set_format(Pixel::YUV420P);
        // Microsecond time base: packet timestamps are buffer timestamps
        encoder.set_time_base(ffmpeg::Rational::new(1, 1_000_000));
        encoder.set_frame_rate(Some(ffmpeg::Rational::new(
            format.framerate.num as i32,
            format.framerate.den as i32,
        )));
        let fps = format.framerate.as_f64().round().max(1.0) as u32;
        encoder.set_gop(fps * format.key_frame_interval_secs.max(1));
        encoder.set_max_b_frames(0);
        encoder.set_bit_rate(format.bitrate as usize);
        encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        opts.set("preset", "veryfast");
        opts.set("tune", "zerolatency");

        let opened = encoder
            .open_with(opts)
            .map_err(|e| Error::EngineConfig(format!("Failed to open {}: {}", VIDEO_ENCODER, e)))?;

        let extradata = extradata_of(unsafe { opened.as_ptr() });
        let private = h264::codec_private_from_extradata(&extradata).ok_or_else(|| {
            Error::EngineConfig("x264 did not produce SPS/PPS extradata".into())
        })?;

        tracing::info!(
            "Video encoder initialized: {} {} @ {} kbps, gop {}",
            VIDEO_ENCODER,
            format.resolution,
            format.bitrate / 1000,
            fps * format.key_frame_interval_secs.max(1)
        );

        Ok((
            Self {
                encoder: opened,
                format: format.clone(),
            },
            private,
        ))
    }

    fn collect(&mut self, out: &mut VecDeque<Buffer>) -> Result<()> {
        receive_all(&mut self.encoder, |packet| {
            let data = packet.data().unwrap_or(&[]);
            let payload = if h264::is_annex_b(data) {
                h264::annex_b_to_avcc(data)
            } else {
                data.to_vec()
            };
            let flags = if packet.is_key() {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::NONE
            };
            out.push_back(Buffer::new(payload, packet.pts().unwrap_or(0), flags));
        })
    }
}

impl EncodeStep for X264Step {
    fn encode(&mut self, input: RawInput, out: &mut VecDeque<Buffer>) -> Result<()> {
        let res = self.format.resolution;
        if input.data.len() != res.i420_frame_size() {
            return Err(Error::ProtocolViolation(format!(
                "video frame of {} bytes, expected {}",
                input.data.len(),
                res.i420_frame_size()
            )));
        }

        let mut frame = ffmpeg::frame::Video::new(Pixel::YUV420P, res.width, res.height);
        let (w, h) = (res.width as usize, res.height as usize);
        let planes = [(w, h), (w.div_ceil(2), h.div_ceil(2)), (w.div_ceil(2), h.div_ceil(2))];
        let mut offset = 0;
        for (index, (pw, ph)) in planes.into_iter().enumerate() {
            let stride = frame.stride(index);
            let dst = frame.data_mut(index);
            for row in 0..ph {
                dst[row * stride..row * stride + pw]
                    .copy_from_slice(&input.data[offset + row * pw..offset + (row + 1) * pw]);
            }
            offset += pw * ph;
        }
        frame.set_pts(Some(input.timestamp_us));

        self.encoder
            .send_frame(&frame)
            .map_err(ffmpeg_err("Failed to send frame"))?;
        self.collect(out)
    }

    fn flush(&mut self, out: &mut VecDeque<Buffer>) -> Result<()> {
        self.encoder
            .send_eof()
            .map_err(ffmpeg_err("Failed to send EOF"))?;
        self.collect(out)
    }
}

// ============================================================================
// Audio
// ============================================================================

struct AacStep {
    encoder: ffmpeg::encoder::Audio,
    format: AudioFormat,
    frame_size: usize,
    /// Planar f32 samples waiting for a full encoder frame
    fifo: Vec<Vec<f32>>,
    /// Timestamp of the first captured sample
    base_us: Option<i64>,
    /// Samples (per channel) sent to the encoder so far
    sent: i64,
}

impl AacStep {
    fn open(format: &AudioFormat) -> Result<(Self, Vec<u8>)> {
        if !(1..=2).contains(&format.channels) {
            return Err(Error::EngineConfig(format!(
                "AAC engine supports mono or stereo, got {} channels",
                format.channels
            )));
        }
        let codec = ffmpeg::encoder::find_by_name(AUDIO_ENCODER)
            .ok_or_else(|| Error::EngineConfig(format!("Encoder {} not found", AUDIO_ENCODER)))?;

        let context = ffmpeg::codec::context::Context::new_with_codec(codec);
        let mut encoder = context
            .encoder()
            .audio()
            .map_err(|e| Error::EngineConfig(format!("Not an audio encoder: {}", e)))?;

        encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        unsafe {
            let ctx = encoder.as_mut_ptr();
            (*ctx).sample_rate = format.sample_rate as i32;
            (*ctx).sample_fmt = ffmpeg::ffi::AVSampleFormat::AV_SAMPLE_FMT_FLTP;
            (*ctx).bit_rate = format.bitrate as i64;
            (*ctx).time_base = ffmpeg::ffi::AVRational {
                num: 1,
                den: format.sample_rate as i32,
            };
            ffmpeg::ffi::av_channel_layout_default(&mut (*ctx).ch_layout, format.channels as i32);
        }

        let opened = encoder
            .open()
            .map_err(|e| Error::EngineConfig(format!("Failed to open audio encoder: {}", e)))?;

        let frame_size = match unsafe { (*opened.as_ptr()).frame_size } {
            n if n > 0 => n as usize,
            _ => 1024,
        };
        let private = extradata_of(unsafe { opened.as_ptr() });

        tracing::info!(
            "Audio encoder initialized: AAC @ {}Hz, {} channels, {} kbps, frame_size={}",
            format.sample_rate,
            format.channels,
            format.bitrate / 1000,
            frame_size
        );

        Ok((
            Self {
                encoder: opened,
                format: format.clone(),
                frame_size,
                fifo: vec![Vec::new(); format.channels as usize],
                base_us: None,
                sent: 0,
            },
            private,
        ))
    }

    fn send_frame(&mut self, samples: usize) -> Result<()> {
        let layout = if self.format.channels == 1 {
            ffmpeg::channel_layout::ChannelLayout::MONO
        } else {
            ffmpeg::channel_layout::ChannelLayout::STEREO
        };
        let mut frame = ffmpeg::frame::Audio::new(
            ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Planar),
            samples,
            layout,
        );
        frame.set_rate(self.format.sample_rate);
        frame.set_pts(Some(self.sent));

        for (ch, queue) in self.fifo.iter_mut().enumerate() {
            let plane = frame.data_mut(ch);
            for (i, sample) in queue.drain(..samples).enumerate() {
                plane[i * 4..i * 4 + 4].copy_from_slice(&sample.to_ne_bytes());
            }
        }
        self.sent += samples as i64;

        self.encoder
            .send_frame(&frame)
            .map_err(ffmpeg_err("Failed to send audio frame"))
    }

    fn collect(&mut self, out: &mut VecDeque<Buffer>) -> Result<()> {
        let base = self.base_us.unwrap_or(0);
        let rate = self.format.sample_rate as i64;
        receive_all(&mut self.encoder, |packet| {
            let pts = packet.pts().unwrap_or(0).max(0);
            let timestamp_us = base + pts * 1_000_000 / rate;
            out.push_back(Buffer::new(
                packet.data().unwrap_or(&[]).to_vec(),
                timestamp_us,
                BufferFlags::KEY_FRAME,
            ));
        })
    }
}

impl EncodeStep for AacStep {
    fn encode(&mut self, input: RawInput, out: &mut VecDeque<Buffer>) -> Result<()> {
        let channels = self.format.channels as usize;
        if input.data.len() % (channels * 2) != 0 {
            return Err(Error::ProtocolViolation(format!(
                "audio block of {} bytes is not whole s16 frames",
                input.data.len()
            )));
        }
        self.base_us.get_or_insert(input.timestamp_us);

        for (i, pair) in input.data.chunks_exact(2).enumerate() {
            let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
            self.fifo[i % channels].push(sample);
        }

        while self.fifo[0].len() >= self.frame_size {
            self.send_frame(self.frame_size)?;
        }
        self.collect(out)
    }

    fn flush(&mut self, out: &mut VecDeque<Buffer>) -> Result<()> {
        let rest = self.fifo[0].len();
        if rest > 0 {
            self.send_frame(rest)?;
        }
        self.encoder
            .send_eof()
            .map_err(ffmpeg_err("Failed to send EOF"))?;
        self.collect(out)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Codec engine backed by an FFmpeg encoder
pub struct FfmpegEngine {
    core: EngineCore,
    step: Option<Box<dyn EncodeStep>>,
}

impl FfmpegEngine {
    pub fn new(kind: StreamKind, options: EngineOptions) -> Self {
        Self {
            core: EngineCore::new(kind, options),
            step: None,
        }
    }
}

impl CodecEngine for FfmpegEngine {
    fn kind(&self) -> StreamKind {
        self.core.kind()
    }

    fn state(&self) -> EngineState {
        self.core.state()
    }

    fn configure(&mut self, format: &MediaFormat) -> Result<()> {
        super::expect_kind(format, self.core.kind())?;
        let (step, output): (Box<dyn EncodeStep>, MediaFormat) = match format {
            MediaFormat::Video(v) if v.codec == VideoCodec::H264 => {
                let (step, private) = X264Step::open(v)?;
                let output = VideoFormat {
                    codec_private: private,
                    ..v.clone()
                };
                (Box::new(step), MediaFormat::Video(output))
            }
            MediaFormat::Audio(a) if a.codec == AudioCodec::Aac => {
                let (step, private) = AacStep::open(a)?;
                let output = AudioFormat {
                    codec_private: private,
                    frame_samples: step.frame_size as u32,
                    ..a.clone()
                };
                (Box::new(step), MediaFormat::Audio(output))
            }
            other => {
                return Err(Error::EngineConfig(format!(
                    "FFmpeg engine cannot encode {:?}",
                    other.kind()
                )))
            }
        };

        self.core.configure(format)?;
        self.core.set_output_format(output);
        self.step = Some(step);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.core.start()
    }

    fn input_port(&self) -> Result<InputPort> {
        self.core.input_port()
    }

    fn pull_output(&mut self, timeout: Duration) -> Result<OutputEvent> {
        match self.step.as_mut() {
            Some(step) => self.core.pull(step.as_mut(), timeout),
            None => Err(Error::EngineState(format!(
                "{} engine not configured",
                self.core.kind()
            ))),
        }
    }

    fn release_output(&mut self, index: usize) -> Result<()> {
        self.core.release_output(index)
    }

    fn stop(&mut self) -> Result<()> {
        self.core.stop()
    }

    fn release(&mut self) -> Result<()> {
        self.core.release()?;
        self.step = None;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.core.abort();
        self.step = None;
        Ok(())
    }

    fn output_format(&self) -> Option<&MediaFormat> {
        self.core.output_format()
    }
}

impl Drop for FfmpegEngine {
    fn drop(&mut self) {
        if self.step.is_some() {
            tracing::debug!("Dropping {} FFmpeg engine", self.core.kind());
        }
    }
}

/// Factory for FFmpeg engines
#[derive(Debug)]
pub struct FfmpegEngineFactory;

impl FfmpegEngineFactory {
    pub fn new() -> Result<Self> {
        ffmpeg::init().map_err(|e| Error::Ffmpeg(format!("FFmpeg init failed: {}", e)))?;
        if !has_x264() || !has_aac() {
            return Err(Error::EngineConfig(
                "FFmpeg is missing libx264 or the AAC encoder".into(),
            ));
        }
        Ok(Self)
    }
}

impl EngineFactory for FfmpegEngineFactory {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn video_codec(&self) -> VideoCodec {
        VideoCodec::H264
    }

    fn audio_codec(&self) -> AudioCodec {
        AudioCodec::Aac
    }

    fn create_video(&self, options: EngineOptions) -> Result<Box<dyn CodecEngine>> {
        Ok(Box::new(FfmpegEngine::new(StreamKind::Video, options)))
    }

    fn create_audio(&self, options: EngineOptions) -> Result<Box<dyn CodecEngine>> {
        Ok(Box::new(FfmpegEngine::new(StreamKind::Audio, options)))
    }
}

fn has_encoder(name: &str) -> bool {
    if ffmpeg::init().is_err() {
        return false;
    }
    ffmpeg::encoder::find_by_name(name).is_some()
}

/// Check for x264 support
pub fn has_x264() -> bool {
    has_encoder(VIDEO_ENCODER)
}

/// Check for the AAC encoder
pub fn has_aac() -> bool {
    has_encoder(AUDIO_ENCODER)
}

pub fn is_available() -> bool {
    has_x264() && has_aac()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;

    #[test]
    fn test_video_engine_emits_codec_config() {
        if !has_x264() {
            println!("x264 not available, skipping test");
            return;
        }
        let config = RecorderConfig::default().with_resolution(64, 48);
        let mut engine = FfmpegEngine::new(StreamKind::Video, EngineOptions::default());
        engine.configure(&config.video_format(VideoCodec::H264)).unwrap();
        let private = engine.output_format().unwrap().codec_private().to_vec();
        assert_eq!(private.first(), Some(&1));
    }
}
