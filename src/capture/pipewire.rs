//! PipeWire audio taps
//!
//! Loopback (monitor of the default sink) or microphone capture in S16
//! interleaved format. The PipeWire main loop runs on its own thread and
//! hands chunks over a bounded channel; reads assemble them into blocks.

use super::{AudioSource, ReadError, ReadResult};
use crate::error::{Error, Result};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Which side of the audio graph to tap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapTarget {
    /// What the system plays
    Loopback,
    /// Default input device
    Microphone,
}

/// PipeWire-backed audio source
pub struct PipeWireTap {
    target: TapTarget,
    sample_rate: u32,
    channels: u16,
    running: Arc<AtomicBool>,
    chunk_rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PipeWireTap {
    /// Connect a capture stream; chunks start flowing right away
    pub fn open(target: TapTarget, sample_rate: u32, channels: u16) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (chunk_tx, chunk_rx) = crossbeam_channel::bounded::<Vec<u8>>(64);

        let thread_running = running.clone();
        let handle = std::thread::Builder::new()
            .name("screencast-pipewire".into())
            .spawn(move || {
                if let Err(e) =
                    run_pipewire_capture(target, sample_rate, channels, thread_running.clone(), chunk_tx)
                {
                    tracing::error!("PipeWire audio capture error: {}", e);
                }
                thread_running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| Error::AudioCapture(format!("Failed to spawn PipeWire thread: {}", e)))?;

        tracing::info!("PipeWire {:?} tap opened @ {}Hz, {}ch", target, sample_rate, channels);
        Ok(Self {
            target,
            sample_rate,
            channels,
            running,
            chunk_rx,
            pending: Vec::new(),
            thread: Some(handle),
        })
    }

    pub fn loopback(sample_rate: u32, channels: u16) -> Result<Self> {
        Self::open(TapTarget::Loopback, sample_rate, channels)
    }

    pub fn microphone(sample_rate: u32, channels: u16) -> Result<Self> {
        Self::open(TapTarget::Microphone, sample_rate, channels)
    }

    fn block_duration(&self, bytes: usize) -> Duration {
        let frame_bytes = 2 * self.channels.max(1) as usize;
        let frames = bytes / frame_bytes;
        Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64)
    }
}

impl AudioSource for PipeWireTap {
    fn name(&self) -> &str {
        match self.target {
            TapTarget::Loopback => "pipewire-loopback",
            TapTarget::Microphone => "pipewire-microphone",
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadResult {
        if self.thread.is_none() {
            return Err(ReadError::InvalidOperation("tap released".into()));
        }
        let timeout = self.block_duration(buf.len()) * 2;

        while self.pending.len() < buf.len() {
            match self.chunk_rx.recv_timeout(timeout) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                // Partial data stays queued for the next read
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ReadError::Fatal("PipeWire stream ended".into()));
                }
            }
        }

        let n = buf.len();
        buf.copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::warn!("PipeWire thread panicked");
            }
            tracing::info!("PipeWire {:?} tap released", self.target);
        }
    }
}

impl Drop for PipeWireTap {
    fn drop(&mut self) {
        self.release();
    }
}

/// Run the PipeWire capture loop until `running` clears
fn run_pipewire_capture(
    target: TapTarget,
    sample_rate: u32,
    channels: u16,
    running: Arc<AtomicBool>,
    chunk_tx: Sender<Vec<u8>>,
) -> Result<()> {
    use pipewire as pw;

    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None)
        .map_err(|e| Error::PipeWire(format!("Failed to create mainloop: {}", e)))?;

    let context = pw::context::Context::new(&mainloop)
        .map_err(|e| Error::PipeWire(format!("Failed to create context: {}", e)))?;

    let core = context
        .connect(None)
        .map_err(|e| Error::PipeWire(format!("Failed to connect: {}", e)))?;

    let capture_sink = match target {
        TapTarget::Loopback => "true",
        TapTarget::Microphone => "false",
    };
    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Screen",
        *pw::keys::STREAM_CAPTURE_SINK => capture_sink,
    };

    let stream = pw::stream::Stream::new(&core, "screencast-audio", props)
        .map_err(|e| Error::PipeWire(format!("Failed to create stream: {}", e)))?;

    let process_running = running.clone();
    let mut overruns = 0u64;
    let _listener = stream
        .add_local_listener_with_user_data(())
        .process(move |stream, _| {
            if !process_running.load(Ordering::SeqCst) {
                return;
            }
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let chunk = data.chunk();
            let offset = chunk.offset() as usize;
            let size = chunk.size() as usize;

            if let Some(slice) = data.data() {
                if offset + size <= slice.len() && size > 0 {
                    if chunk_tx.try_send(slice[offset..offset + size].to_vec()).is_err() {
                        overruns += 1;
                        if overruns % 100 == 1 {
                            tracing::warn!("PipeWire audio overrun ({} chunks lost)", overruns);
                        }
                    }
                }
            }
        })
        .register()
        .map_err(|e| Error::PipeWire(format!("Failed to register listener: {}", e)))?;

    let mut audio_info = libspa_sys::spa_audio_info_raw {
        format: libspa_sys::SPA_AUDIO_FORMAT_S16,
        flags: 0,
        rate: sample_rate,
        channels: channels as u32,
        position: [0; 64],
    };
    if channels >= 2 {
        audio_info.position[0] = libspa_sys::SPA_AUDIO_CHANNEL_FL;
        audio_info.position[1] = libspa_sys::SPA_AUDIO_CHANNEL_FR;
    } else {
        audio_info.position[0] = libspa_sys::SPA_AUDIO_CHANNEL_MONO;
    }

    // Build format pod
    let mut buffer = vec![0u8; 1024];
    let pod = unsafe {
        let builder = libspa_sys::spa_pod_builder {
            data: buffer.as_mut_ptr() as *mut _,
            size: buffer.len() as u32,
            _padding: 0,
            state: libspa_sys::spa_pod_builder_state {
                offset: 0,
                flags: 0,
                frame: std::ptr::null_mut(),
            },
            callbacks: libspa_sys::spa_callbacks {
                funcs: std::ptr::null(),
                data: std::ptr::null_mut(),
            },
        };

        let pod_ptr = libspa_sys::spa_format_audio_raw_build(
            &builder as *const _ as *mut _,
            libspa_sys::SPA_PARAM_EnumFormat,
            &mut audio_info,
        );

        if pod_ptr.is_null() {
            return Err(Error::PipeWire("Failed to build audio format pod".into()));
        }

        libspa::pod::Pod::from_raw(pod_ptr)
    };

    let flags = pw::stream::StreamFlags::AUTOCONNECT
        | pw::stream::StreamFlags::MAP_BUFFERS
        | pw::stream::StreamFlags::RT_PROCESS;

    stream
        .connect(libspa::utils::Direction::Input, None, flags, &mut [pod])
        .map_err(|e| Error::PipeWire(format!("Failed to connect stream: {}", e)))?;

    tracing::info!("PipeWire audio stream connected");

    let weak_mainloop = mainloop.downgrade();
    while running.load(Ordering::SeqCst) {
        match weak_mainloop.upgrade() {
            Some(ml) => {
                ml.loop_().iterate(Duration::from_millis(10));
            }
            None => break,
        }
    }

    Ok(())
}

/// Check if a PipeWire daemon answers
pub fn is_available() -> bool {
    std::process::Command::new("pw-cli")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
