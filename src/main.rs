//! screencast CLI
//!
//! Command-line interface for recording and inspecting screencasts.

use clap::{Parser, Subcommand, ValueEnum};
use screencast::{
    capture::{CaptureHandle, TestPatternScreen, ToneSource},
    config::{AudioMode, Container, RecorderConfig, VideoQuality},
    encode::{get_info, EncoderBackend},
    output::inspect,
    storage::{FreeSpace, SystemStorage},
    types::format_elapsed,
    SessionController, SessionEvent, StreamKind,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Encoder backend for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Backend {
    /// FFmpeg when available, raw otherwise
    #[default]
    Auto,
    /// Uncompressed pass-through
    Raw,
    /// Force FFmpeg H.264/AAC
    Ffmpeg,
}

impl From<Backend> for EncoderBackend {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Auto => EncoderBackend::Auto,
            Backend::Raw => EncoderBackend::Raw,
            Backend::Ffmpeg => EncoderBackend::Ffmpeg,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Audio {
    Disabled,
    Internal,
    Microphone,
}

impl From<Audio> for AudioMode {
    fn from(a: Audio) -> Self {
        match a {
            Audio::Disabled => AudioMode::Disabled,
            Audio::Internal => AudioMode::Internal,
            Audio::Microphone => AudioMode::Microphone,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Quality {
    Low,
    Medium,
    High,
}

impl From<Quality> for VideoQuality {
    fn from(q: Quality) -> Self {
        match q {
            Quality::Low => VideoQuality::Low,
            Quality::Medium => VideoQuality::Medium,
            Quality::High => VideoQuality::High,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Mkv,
    Mp4,
}

#[derive(Parser)]
#[command(name = "screencast")]
#[command(about = "Screen recording engine - Capture, Encode, Mux")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration, free space and encoder capabilities
    Info,

    /// Record the test pattern until Ctrl+C
    Record {
        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Audio source
        #[arg(short, long, value_enum)]
        audio: Option<Audio>,

        /// Quality preset
        #[arg(short, long, value_enum)]
        quality: Option<Quality>,

        /// Resolution (e.g., 1280x720)
        #[arg(short, long)]
        resolution: Option<String>,

        /// Framerate
        #[arg(short, long)]
        fps: Option<u32>,

        /// Container format
        #[arg(long, value_enum)]
        format: Option<Format>,

        /// Encoder backend
        #[arg(short, long, value_enum)]
        encoder: Option<Backend>,
    },

    /// Print the tracks of a recorded Matroska file
    Inspect {
        file: PathBuf,
    },

    /// List quality presets
    Presets,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("screencast=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };

    match cli.command {
        Commands::Info => cmd_info(&config),
        Commands::Record {
            output,
            seconds,
            audio,
            quality,
            resolution,
            fps,
            format,
            encoder,
        } => {
            let mut config = config;
            if let Some(dir) = output {
                config = config.with_output_dir(dir);
            }
            if let Some(audio) = audio {
                config = config.with_audio_mode(audio.into());
            }
            if let Some(quality) = quality {
                config = config.with_quality(quality.into());
            }
            if let Some(res) = resolution {
                let (w, h) = parse_resolution(&res)?;
                config = config.with_resolution(w, h);
            }
            if let Some(fps) = fps {
                config = config.with_fps(fps);
            }
            if let Some(format) = format {
                config = config.with_container(match format {
                    Format::Mkv => Container::Matroska,
                    Format::Mp4 => Container::Mp4,
                });
            }
            if let Some(encoder) = encoder {
                config = config.with_backend(encoder.into());
            }
            cmd_record(config, seconds).await
        }
        Commands::Inspect { file } => cmd_inspect(file),
        Commands::Presets => cmd_presets(),
    }
}

fn parse_resolution(s: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| anyhow::anyhow!("Resolution must look like 1280x720, got {}", s))?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

fn cmd_info(config: &RecorderConfig) -> anyhow::Result<()> {
    println!("screencast {}", screencast::VERSION);
    println!("==============================\n");

    println!("=== Configuration ===");
    print!("{}", config.to_toml_string()?);

    println!("\n=== Storage ===");
    let dir = &config.output.directory;
    match SystemStorage.available_mib(dir) {
        Ok(mib) => println!("{}: {} MiB free (floor {} MiB)", dir.display(), mib, config.output.min_free_mib),
        Err(e) => println!("{}: unknown ({})", dir.display(), e),
    }

    println!("\n=== Encoders ===");
    let info = get_info();
    println!("Raw (uncompressed): Yes");
    println!(
        "FFmpeg: {}",
        if info.ffmpeg_compiled { "compiled in" } else { "not compiled in" }
    );
    println!("  - H.264 (x264): {}", if info.x264 { "Yes" } else { "No" });
    println!("  - AAC: {}", if info.aac { "Yes" } else { "No" });

    println!("\n=== Containers ===");
    for container in [Container::Matroska, Container::Mp4] {
        println!(
            "  .{:<4} {}",
            container.extension(),
            if container.is_available() { "Yes" } else { "No (needs `ffmpeg`)" }
        );
    }

    Ok(())
}

fn capture_handle(config: &RecorderConfig) -> CaptureHandle {
    let screen = TestPatternScreen::new(config.video.resolution, config.video.framerate);
    let (rate, channels) = (config.audio.sample_rate, config.audio.channels);

    #[cfg(feature = "pipewire")]
    {
        use screencast::capture::pipewire::PipeWireTap;
        if screencast::capture::pipewire::is_available() {
            let mut handle = CaptureHandle::new(screen);
            match config.audio.mode {
                AudioMode::Internal => match PipeWireTap::loopback(rate, channels) {
                    Ok(tap) => handle = handle.with_loopback(tap),
                    Err(e) => tracing::warn!("PipeWire loopback unavailable: {}", e),
                },
                AudioMode::Microphone => match PipeWireTap::microphone(rate, channels) {
                    Ok(tap) => handle = handle.with_microphone(tap),
                    Err(e) => tracing::warn!("PipeWire microphone unavailable: {}", e),
                },
                AudioMode::Disabled => {}
            }
            if handle.supports(config.audio.mode) {
                return handle;
            }
            return handle
                .with_loopback(ToneSource::new(rate, channels))
                .with_microphone(ToneSource::new(rate, channels).with_frequency(220.0));
        }
    }

    CaptureHandle::new(screen)
        .with_loopback(ToneSource::new(rate, channels))
        .with_microphone(ToneSource::new(rate, channels).with_frequency(220.0))
}

async fn cmd_record(config: RecorderConfig, seconds: Option<u64>) -> anyhow::Result<()> {
    let controller = Arc::new(SessionController::new(config.clone())?);
    let mut events = controller.subscribe();

    println!("Configuration:");
    println!("  Resolution: {} @ {}", config.video.resolution, config.video.framerate);
    println!("  Quality: {}", config.video.quality.display_name());
    println!("  Audio: {}", config.audio.mode.display_name());
    println!("  Encoder: {}", controller.engine_backend());
    println!();

    let handle = controller.start(config.audio.mode, capture_handle(&config))?;
    println!("Recording to {}", handle.path.display());
    println!("Press Ctrl+C to stop.\n");

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Progress { elapsed, .. }) => {
                    println!("  {}", format_elapsed(elapsed));
                }
                Ok(SessionEvent::LowStorage { available_mib, .. }) => {
                    println!("  Low storage: {} MiB left", available_mib);
                }
                Ok(SessionEvent::Failed { reason, .. }) => {
                    println!("  Recording failed: {}", reason);
                    break;
                }
                Ok(SessionEvent::Stopped(_)) => break,
                Ok(SessionEvent::Started { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    match seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    println!("\nStopping...");
    let stopper = controller.clone();
    let result = tokio::task::spawn_blocking(move || stopper.stop()).await?;
    printer.abort();
    let summary = result?;

    println!("\nRecording saved:");
    println!("  File: {}", summary.path.display());
    println!("  Duration: {}", format_elapsed(summary.duration()));
    println!("  Video samples: {}", summary.samples(StreamKind::Video));
    if summary.audio_mode.is_enabled() {
        println!("  Audio samples: {}", summary.samples(StreamKind::Audio));
    }
    println!("  Size: {:.2} MB", summary.bytes_written() as f64 / 1_000_000.0);
    if summary.low_storage {
        println!("  Warning: storage is running low");
    }

    Ok(())
}

fn cmd_inspect(file: PathBuf) -> anyhow::Result<()> {
    let info = inspect(&file)?;

    println!("{}", file.display());
    println!("  Doc type: {}", info.doc_type);
    if let Some(app) = &info.muxing_app {
        println!("  Muxing app: {}", app);
    }
    match info.duration() {
        Some(d) => println!("  Duration: {:.3}s", d.as_secs_f64()),
        None => println!("  Duration: unknown"),
    }
    println!("  Clusters: {}, cue points: {}", info.clusters, info.cue_points);

    for track in &info.tracks {
        let kind = track.kind.map(|k| k.to_string()).unwrap_or_else(|| "unknown".into());
        println!("\n  Track {} ({})", track.number, kind);
        println!("    Codec: {}", track.codec_id);
        if let (Some(w), Some(h)) = (track.width, track.height) {
            println!("    Size: {}x{}", w, h);
        }
        if let Some(rate) = track.sample_rate {
            println!("    Sample rate: {:.0} Hz, {} ch", rate, track.channels.unwrap_or(1));
        }
        println!("    Samples: {} ({} key)", track.sample_count(), track.key_frames);
        println!("    Bytes: {}", track.bytes);
        if let (Some(first), Some(last)) = (track.timestamps_ms.first(), track.timestamps_ms.last()) {
            println!("    Timestamps: {} ms .. {} ms", first, last);
        }
    }

    Ok(())
}

fn cmd_presets() -> anyhow::Result<()> {
    println!("Quality Presets");
    println!("===============\n");

    for quality in VideoQuality::ALL {
        println!(
            "  {:<8} {:.1} Mbps",
            quality.display_name(),
            quality.bitrate() as f64 / 1_000_000.0
        );
    }

    println!("\nUsage: screencast record --quality <low|medium|high>");

    Ok(())
}
