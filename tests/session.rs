mod common;

use common::*;
use screencast::capture::{
    CaptureHandle, ManualAudio, ManualScreen, ReadError, ReadResult, ToneSource,
};
use screencast::types::monotonic_us;
use screencast::{
    inspect, AudioMode, AudioSource, Error, MuxerState, SessionEvent, SessionState, StreamKind,
    ToggleOutcome,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FRAME_US: i64 = 20_833;

#[test]
fn test_video_only_recording() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let frame_size = config.video.resolution.i420_frame_size();
    let factory = Arc::new(CountingFactory::default());
    let controller = controller(config, factory.clone());
    let mut events = controller.subscribe();

    let (screen, sink) = ManualScreen::new();
    let handle = controller
        .start(AudioMode::Disabled, CaptureHandle::new(screen))
        .unwrap();
    assert_eq!(handle.state, SessionState::Recording);
    assert!(sink.is_attached());

    let base = monotonic_us();
    for i in 0..30 {
        assert!(sink.push_frame(vec![0x80; frame_size], base + i * FRAME_US).unwrap());
    }
    let summary = controller.stop().unwrap();

    assert_eq!(summary.path, handle.path);
    assert_eq!(summary.samples(StreamKind::Video), 30);
    assert_eq!(summary.samples(StreamKind::Audio), 0);
    // 30 frames plus the short lead-in between start and the first frame
    let ms = summary.duration().as_millis();
    assert!((620..=700).contains(&ms), "duration {} ms", ms);
    assert_eq!(controller.state(), SessionState::Stopped);
    assert!(!sink.is_attached());

    let info = inspect(&summary.path).unwrap();
    assert_eq!(info.track_count(StreamKind::Video), 1);
    assert_eq!(info.track_count(StreamKind::Audio), 0);
    assert_eq!(info.tracks[0].sample_count(), 30);
    assert!(info.tracks[0].is_monotonic());

    assert_eq!(EngineCounters::get(&factory.video.eos), 1);
    assert_eq!(EngineCounters::get(&factory.video.stops), 1);
    assert_eq!(EngineCounters::get(&factory.video.releases), 1);
    assert_eq!(EngineCounters::get(&factory.audio.created), 0);

    let seen: Vec<SessionEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(seen
        .iter()
        .any(|e| matches!(e, SessionEvent::Started { path, .. } if *path == handle.path)));
    assert!(matches!(seen.last(), Some(SessionEvent::Stopped(_))));
}

#[test]
fn test_audio_track_may_register_first() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let frame_size = config.video.resolution.i420_frame_size();
    let block = config.audio.block_bytes();
    let factory = Arc::new(CountingFactory::default());
    factory.video.close_gate();
    let controller = controller(config, factory.clone());

    let (screen, sink) = ManualScreen::new();
    let (loopback, feed) = ManualAudio::new(44_100, 1);
    controller
        .start(
            AudioMode::Internal,
            CaptureHandle::new(screen).with_loopback(loopback),
        )
        .unwrap();

    // Audio registered alone: the header waits for video
    assert!(wait_for(Duration::from_secs(2), || {
        controller.current().map(|h| h.tracks.len()) == Some(1)
    }));
    let current = controller.current().unwrap();
    assert_eq!(current.tracks[0].0, StreamKind::Audio);
    assert_eq!(current.muxer_state, MuxerState::NotStarted);

    factory.video.open_gate();
    assert!(wait_for(Duration::from_secs(2), || {
        controller.current().map(|h| h.muxer_state) == Some(MuxerState::Started)
    }));

    for _ in 0..5 {
        feed.push_block(vec![0u8; block]);
    }
    assert!(wait_for(Duration::from_secs(2), || feed.pending() == 0));
    let base = monotonic_us();
    for i in 0..10 {
        assert!(sink.push_frame(vec![0x10; frame_size], base + i * FRAME_US).unwrap());
    }

    let summary = controller.stop().unwrap();
    assert_eq!(summary.samples(StreamKind::Video), 10);
    assert_eq!(summary.samples(StreamKind::Audio), 5);
    assert_eq!(feed.release_count(), 1);

    let info = inspect(&summary.path).unwrap();
    assert_eq!(info.tracks.len(), 2);
    assert_eq!(info.tracks[0].kind, Some(StreamKind::Audio));
    assert_eq!(info.tracks[1].kind, Some(StreamKind::Video));

    for counters in [&factory.video, &factory.audio] {
        assert_eq!(EngineCounters::get(&counters.eos), 1);
        assert_eq!(EngineCounters::get(&counters.stops), 1);
        assert_eq!(EngineCounters::get(&counters.releases), 1);
    }
}

#[test]
fn test_low_storage_refuses_start() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("recordings");
    let storage = AdjustableStorage::mib(99);
    let controller = screencast::SessionController::new(test_config(&out))
        .unwrap()
        .with_free_space(storage.clone());

    let (screen, sink) = ManualScreen::new();
    let (mic, feed) = ManualAudio::new(44_100, 1);
    let err = controller
        .start(
            AudioMode::Microphone,
            CaptureHandle::new(screen).with_microphone(mic),
        )
        .unwrap_err();

    assert!(matches!(
        err,
        Error::InsufficientStorage {
            available_mib: 99,
            required_mib: 100
        }
    ));
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(!sink.is_attached());
    assert_eq!(feed.release_count(), 1);
    assert!(files_in(&out).is_empty());
}

#[test]
fn test_low_storage_after_stop_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let storage = AdjustableStorage::mib(500);
    let controller = screencast::SessionController::new(test_config(dir.path()))
        .unwrap()
        .with_free_space(storage.clone());
    let mut events = controller.subscribe();

    let (screen, _sink) = ManualScreen::new();
    controller
        .start(AudioMode::Disabled, CaptureHandle::new(screen))
        .unwrap();
    storage.set_mib(20);
    let summary = controller.stop().unwrap();

    assert!(summary.low_storage);
    assert!(summary.path.exists());
    let low = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
        SessionEvent::LowStorage { available_mib, .. } => Some(available_mib),
        _ => None,
    });
    assert_eq!(low, Some(20));
}

#[test]
fn test_refused_audio_engine_releases_video_engine() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("recordings");
    let factory = Arc::new(CountingFactory::default());
    factory.audio.refuse();
    let controller = controller(test_config(&out), factory.clone());

    let (screen, sink) = ManualScreen::new();
    let (mic, feed) = ManualAudio::new(44_100, 1);
    let err = controller
        .start(
            AudioMode::Microphone,
            CaptureHandle::new(screen).with_microphone(mic),
        )
        .unwrap_err();

    assert!(matches!(err, Error::EngineConfig(_)));
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(!sink.is_attached());
    assert_eq!(feed.release_count(), 1);
    assert_eq!(EngineCounters::get(&factory.video.created), 1);
    assert_eq!(EngineCounters::get(&factory.video.releases), 1);
    assert!(files_in(&out).is_empty());
}

#[test]
fn test_stop_twice() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(CountingFactory::default());
    let controller = controller(test_config(dir.path()), factory.clone());

    let (screen, _sink) = ManualScreen::new();
    controller
        .start(AudioMode::Disabled, CaptureHandle::new(screen))
        .unwrap();
    controller.stop().unwrap();
    assert!(matches!(controller.stop(), Err(Error::NotRecording)));
    assert_eq!(EngineCounters::get(&factory.video.releases), 1);
}

#[test]
fn test_toggle_uses_last_audio_mode() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (rate, channels) = (config.audio.sample_rate, config.audio.channels);
    let factory = Arc::new(CountingFactory::default());
    let controller = controller(config, factory.clone());
    controller.set_audio_mode(AudioMode::Internal);

    let outcome = controller
        .toggle(|| {
            let (screen, _sink) = ManualScreen::new();
            Ok(CaptureHandle::new(screen).with_loopback(ToneSource::new(rate, channels)))
        })
        .unwrap();
    let ToggleOutcome::Started(handle) = outcome else {
        panic!("expected a start");
    };
    assert_eq!(handle.audio_mode, AudioMode::Internal);
    std::thread::sleep(Duration::from_millis(100));

    let outcome = controller
        .toggle(|| panic!("capture is not built when stopping"))
        .unwrap();
    let ToggleOutcome::Stopped(summary) = outcome else {
        panic!("expected a stop");
    };
    assert_eq!(summary.audio_mode, AudioMode::Internal);
    assert!(summary.samples(StreamKind::Audio) > 0);
    assert_eq!(EngineCounters::get(&factory.audio.releases), 1);
}

#[test]
fn test_encoder_failure_discards_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let frame_size = config.video.resolution.i420_frame_size();
    let factory = Arc::new(CountingFactory::default());
    factory.video.fail_after(3);
    let controller = controller(config, factory.clone());
    let mut events = controller.subscribe();

    let (screen, sink) = ManualScreen::new();
    let handle = controller
        .start(AudioMode::Disabled, CaptureHandle::new(screen))
        .unwrap();
    let base = monotonic_us();
    for i in 0..6 {
        // Pushes after the failure may be refused
        let _ = sink.push_frame(vec![0; frame_size], base + i * FRAME_US);
    }

    assert!(wait_for_state(&controller, SessionState::Failed));
    let err = controller.stop().unwrap_err();
    assert!(matches!(err, Error::RecordingFailed(_)));
    assert!(!handle.path.exists());
    assert_eq!(controller.state(), SessionState::Failed);

    // The failed engine was torn down without reaching end of stream
    assert_eq!(EngineCounters::get(&factory.video.eos), 0);
    assert_eq!(EngineCounters::get(&factory.video.stops), 0);
    assert_eq!(EngineCounters::get(&factory.video.releases), 1);

    let failed = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, SessionEvent::Failed { .. }))
        .count();
    assert_eq!(failed, 1);

    // The controller accepts a new session afterwards
    let (screen, _sink) = ManualScreen::new();
    factory.video.fail_after(0);
    controller
        .start(AudioMode::Disabled, CaptureHandle::new(screen))
        .unwrap();
    controller.stop().unwrap();
}

#[test]
fn test_fatal_audio_read_fails_session() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(CountingFactory::default());
    let controller = controller(test_config(dir.path()), factory.clone());

    let (screen, _sink) = ManualScreen::new();
    let (mic, feed) = ManualAudio::new(44_100, 1);
    let handle = controller
        .start(
            AudioMode::Microphone,
            CaptureHandle::new(screen).with_microphone(mic),
        )
        .unwrap();
    feed.push_error(ReadError::Fatal("device removed".into()));

    assert!(wait_for_state(&controller, SessionState::Failed));
    assert!(matches!(controller.stop(), Err(Error::RecordingFailed(_))));
    assert!(!handle.path.exists());
    assert_eq!(feed.release_count(), 1);
    for counters in [&factory.video, &factory.audio] {
        assert_eq!(EngineCounters::get(&counters.created), 1);
        assert_eq!(EngineCounters::get(&counters.releases), 1);
    }
}

#[test]
fn test_audio_older_than_first_video_keeps_spacing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let frame_size = config.video.resolution.i420_frame_size();
    let block = config.audio.block_bytes();
    let factory = Arc::new(CountingFactory::default());
    let controller = controller(config, factory.clone());

    let (screen, sink) = ManualScreen::new();
    let (loopback, feed) = ManualAudio::new(44_100, 1);
    controller
        .start(
            AudioMode::Internal,
            CaptureHandle::new(screen).with_loopback(loopback),
        )
        .unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        controller.current().map(|h| h.muxer_state) == Some(MuxerState::Started)
    }));

    // A late-stamped frame reaches the file before any audio
    assert!(sink
        .push_frame(vec![0x40; frame_size], monotonic_us() + 500_000)
        .unwrap());
    assert!(wait_for(Duration::from_secs(2), || {
        EngineCounters::get(&factory.video.buffers) == 1
    }));
    std::thread::sleep(Duration::from_millis(50));

    for _ in 0..5 {
        feed.push_block(vec![0u8; block]);
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(wait_for(Duration::from_secs(2), || feed.pending() == 0));

    let summary = controller.stop().unwrap();
    assert_eq!(summary.samples(StreamKind::Video), 1);
    assert_eq!(summary.samples(StreamKind::Audio), 5);

    let info = inspect(&summary.path).unwrap();
    let video = &info.tracks_of(StreamKind::Video).next().unwrap().timestamps_ms;
    let audio = &info.tracks_of(StreamKind::Audio).next().unwrap().timestamps_ms;
    assert!(video[0] >= 500, "video at {} ms", video[0]);
    assert_eq!(audio.len(), 5);
    assert!(audio.windows(2).all(|w| w[0] <= w[1]));
    // Capture spacing survives instead of collapsing onto zero
    assert!(audio[4] - audio[0] >= 40, "audio at {:?}", audio);
    assert!(video[0] - audio[4] >= 200, "video {} ms, audio {:?}", video[0], audio);
}

/// Audio source whose release takes a while, like a device being closed
struct SlowRelease {
    delay: Duration,
    released: Arc<AtomicU64>,
}

impl AudioSource for SlowRelease {
    fn name(&self) -> &str {
        "slow-release"
    }

    fn sample_rate(&self) -> u32 {
        44_100
    }

    fn channels(&self) -> u16 {
        1
    }

    fn read(&mut self, _buf: &mut [u8]) -> ReadResult {
        std::thread::sleep(Duration::from_millis(2));
        Ok(0)
    }

    fn release(&mut self) {
        std::thread::sleep(self.delay);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_state_answers_while_failed_session_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let frame_size = config.video.resolution.i420_frame_size();
    let factory = Arc::new(CountingFactory::default());
    factory.video.fail_after(1);
    let controller = controller(config, factory.clone());

    let released = Arc::new(AtomicU64::new(0));
    let (screen, sink) = ManualScreen::new();
    let mic = SlowRelease {
        delay: Duration::from_millis(800),
        released: released.clone(),
    };
    controller
        .start(
            AudioMode::Microphone,
            CaptureHandle::new(screen).with_microphone(mic),
        )
        .unwrap();
    let base = monotonic_us();
    for i in 0..3 {
        let _ = sink.push_frame(vec![0; frame_size], base + i * FRAME_US);
    }
    assert!(wait_for_state(&controller, SessionState::Failed));
    factory.video.fail_after(0);

    std::thread::scope(|s| {
        let starter = s.spawn(|| {
            let (screen, _sink) = ManualScreen::new();
            controller.start(AudioMode::Disabled, CaptureHandle::new(screen))
        });
        std::thread::sleep(Duration::from_millis(50));

        let asked = Instant::now();
        let state = controller.state();
        let waited = asked.elapsed();
        assert!(waited < Duration::from_millis(300), "state() blocked for {:?}", waited);
        assert!(
            matches!(state, SessionState::Failed | SessionState::Recording),
            "state {:?}",
            state
        );

        starter.join().unwrap().unwrap();
    });

    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(controller.state(), SessionState::Recording);
    controller.stop().unwrap();
}

#[test]
fn test_progress_events_while_recording() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(CountingFactory::default());
    let controller = controller(test_config(dir.path()), factory);
    let mut events = controller.subscribe();

    let (screen, _sink) = ManualScreen::new();
    controller
        .start(AudioMode::Disabled, CaptureHandle::new(screen))
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));
    controller.stop().unwrap();

    let progress = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, SessionEvent::Progress { .. }))
        .count();
    assert!(progress >= 2, "only {} progress events", progress);
}
