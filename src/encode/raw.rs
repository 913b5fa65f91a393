//! Pass-through engine
//!
//! Emits raw I420 frames and s16le PCM blocks as output buffers unchanged,
//! every one of them a key frame. Used when no compressing backend is built
//! in, and by the test suite.

use super::{
    AudioCodec, CodecEngine, EncodeStep, EngineCore, EngineFactory, EngineOptions, EngineState,
    InputPort, OutputEvent, VideoCodec,
};
use crate::error::{Error, Result};
use crate::types::{Buffer, BufferFlags, MediaFormat, RawInput, StreamKind};
use std::collections::VecDeque;
use std::time::Duration;

/// Checks payload sizes and forwards them
struct Passthrough {
    kind: StreamKind,
    /// Exact size of a video frame, or the sample frame size for audio
    unit: usize,
}

impl EncodeStep for Passthrough {
    fn encode(&mut self, input: RawInput, out: &mut VecDeque<Buffer>) -> Result<()> {
        let ok = match self.kind {
            StreamKind::Video => input.data.len() == self.unit,
            StreamKind::Audio => self.unit > 0 && input.data.len() % self.unit == 0,
        };
        if !ok {
            return Err(Error::ProtocolViolation(format!(
                "{} input of {} bytes does not match unit of {} bytes",
                self.kind,
                input.data.len(),
                self.unit
            )));
        }
        out.push_back(Buffer::new(input.data, input.timestamp_us, BufferFlags::KEY_FRAME));
        Ok(())
    }

    fn flush(&mut self, _out: &mut VecDeque<Buffer>) -> Result<()> {
        Ok(())
    }
}

/// Uncompressed codec engine
pub struct RawEngine {
    core: EngineCore,
    step: Passthrough,
}

impl RawEngine {
    pub fn new(kind: StreamKind, options: EngineOptions) -> Self {
        Self {
            core: EngineCore::new(kind, options),
            step: Passthrough { kind, unit: 0 },
        }
    }
}

impl CodecEngine for RawEngine {
    fn kind(&self) -> StreamKind {
        self.core.kind()
    }

    fn state(&self) -> EngineState {
        self.core.state()
    }

    fn configure(&mut self, format: &MediaFormat) -> Result<()> {
        let unit = match format {
            MediaFormat::Video(v) if v.codec == VideoCodec::Raw => {
                if v.resolution.width % 2 != 0 || v.resolution.height % 2 != 0 {
                    return Err(Error::EngineConfig(format!(
                        "I420 needs even dimensions, got {}",
                        v.resolution
                    )));
                }
                v.resolution.i420_frame_size()
            }
            MediaFormat::Audio(a) if a.codec == AudioCodec::Pcm => {
                if a.bits_per_sample != 16 {
                    return Err(Error::EngineConfig(format!(
                        "Raw audio supports 16-bit samples, got {}",
                        a.bits_per_sample
                    )));
                }
                a.bytes_per_frame()
            }
            MediaFormat::Video(v) => {
                return Err(Error::EngineConfig(format!(
                    "Raw engine cannot encode {}",
                    v.codec
                )))
            }
            MediaFormat::Audio(a) => {
                return Err(Error::EngineConfig(format!(
                    "Raw engine cannot encode {}",
                    a.codec
                )))
            }
        };

        self.core.configure(format)?;
        self.step.unit = unit;
        self.core.set_output_format(format.clone());
        tracing::debug!("Raw {} engine configured ({} byte units)", self.core.kind(), unit);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.core.start()
    }

    fn input_port(&self) -> Result<InputPort> {
        self.core.input_port()
    }

    fn pull_output(&mut self, timeout: Duration) -> Result<OutputEvent> {
        self.core.pull(&mut self.step, timeout)
    }

    fn release_output(&mut self, index: usize) -> Result<()> {
        self.core.release_output(index)
    }

    fn stop(&mut self) -> Result<()> {
        self.core.stop()
    }

    fn release(&mut self) -> Result<()> {
        self.core.release()
    }

    fn abort(&mut self) -> Result<()> {
        self.core.abort();
        Ok(())
    }

    fn output_format(&self) -> Option<&MediaFormat> {
        self.core.output_format()
    }
}

impl Drop for RawEngine {
    fn drop(&mut self) {
        if self.core.state() != EngineState::Released {
            tracing::debug!(
                "Raw {} engine dropped in state {}",
                self.core.kind(),
                self.core.state()
            );
        }
    }
}

/// Factory for pass-through engines
#[derive(Debug, Clone, Copy, Default)]
pub struct RawEngineFactory;

impl EngineFactory for RawEngineFactory {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn video_codec(&self) -> VideoCodec {
        VideoCodec::Raw
    }

    fn audio_codec(&self) -> AudioCodec {
        AudioCodec::Pcm
    }

    fn create_video(&self, options: EngineOptions) -> Result<Box<dyn CodecEngine>> {
        Ok(Box::new(RawEngine::new(StreamKind::Video, options)))
    }

    fn create_audio(&self, options: EngineOptions) -> Result<Box<dyn CodecEngine>> {
        Ok(Box::new(RawEngine::new(StreamKind::Audio, options)))
    }
}
