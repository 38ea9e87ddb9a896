use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use super::*;
use crate::stream::MemoryInputStream;
use crate::test_utils::{
    FakeAv1DecoderFactory, FakeDecoderGate, FixtureVideoBuilder, NullGpuBackend, TextureMode,
};

const FRAME_DURATION: i64 = 100_000_000; // 100 ms
const STEP: i64 = 50_000_000; // 50 ms
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn engine_with(
    capacity: usize,
    backend: Arc<NullGpuBackend>,
    factory: FakeAv1DecoderFactory,
) -> PlaybackEngine {
    PlaybackEngine::new(capacity, backend, Arc::new(factory))
}

fn open_bytes(engine: &mut PlaybackEngine, bytes: Vec<u8>) {
    engine.open(Arc::new(MemoryInputStream::new(bytes)), false, false);
}

/// Pumps `update(0)` until the predicate holds or the timeout expires.
fn pump_until(
    engine: &mut PlaybackEngine,
    what: &str,
    mut predicate: impl FnMut(&mut PlaybackEngine) -> bool,
) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        engine.update(0);
        if predicate(engine) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(1));
    }
}

fn wait_until_playing(engine: &mut PlaybackEngine) {
    pump_until(engine, "buffering to end", |engine| !engine.is_buffering());
}

fn display_frame(engine: &mut PlaybackEngine) -> Option<usize> {
    engine
        .create_render_lock()
        .map(|lock| lock.display_frame().frame_index())
}

/// Advances playback by one step, waiting out any buffering pause so the
/// step is not silently swallowed.
fn step_playback(engine: &mut PlaybackEngine, indicator_seen: &mut bool) {
    engine.update(STEP);
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while engine.is_buffering() {
        *indicator_seen |= engine.buffering_indicator_should_be_shown();
        engine.update(0);
        assert!(Instant::now() < deadline, "buffering never ended");
        sleep(Duration::from_millis(1));
    }
    *indicator_seen |= engine.buffering_indicator_should_be_shown();
}

#[test]
fn test_single_shot_playback_displays_every_frame_in_order() {
    init_logging();
    let file = FixtureVideoBuilder::new(&[true, false, false, true, false], FRAME_DURATION).build();

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(3, Arc::clone(&backend), FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);

    wait_until_playing(&mut engine);
    let mut indicator_seen = engine.buffering_indicator_should_be_shown();

    let mut displayed = Vec::new();
    for _ in 0..12 {
        step_playback(&mut engine, &mut indicator_seen);
        if let Some(frame) = display_frame(&mut engine) {
            displayed.push(frame);
        }
    }

    // Every frame shown, in order, ending on the final frame.
    assert!(displayed.windows(2).all(|pair| pair[0] <= pair[1]), "{displayed:?}");
    for frame in 0..5 {
        assert!(displayed.contains(&frame), "frame {frame} was never displayed: {displayed:?}");
    }
    assert_eq!(*displayed.last().unwrap(), 4);
    assert_eq!(engine.playback_time(), 5 * FRAME_DURATION);

    // Decoding is instant here; the buffering indicator must never appear.
    assert!(!indicator_seen);
}

#[test]
fn test_loop_playback_wraps_and_reselects_base_keyframe() {
    init_logging();
    let keyframes = [
        true, false, false, false, false, true, false, false, false, false,
    ];
    let file = FixtureVideoBuilder::new(&keyframes, FRAME_DURATION).build();

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(5, Arc::clone(&backend), FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);
    engine.set_playback_mode(PlaybackMode::Loop);

    wait_until_playing(&mut engine);

    let mut keyframe_history = Vec::new();
    let mut wrapped = false;
    let mut indicator_seen = false;
    let deadline = Instant::now() + WAIT_TIMEOUT;

    loop {
        let before = engine.playback_time();
        step_playback(&mut engine, &mut indicator_seen);
        let now = engine.playback_time();
        if now < before {
            wrapped = true;
        }

        if let Some(lock) = engine.create_render_lock() {
            let keyframe = lock.keyframe().frame_index();
            if keyframe_history.last() != Some(&keyframe) {
                keyframe_history.push(keyframe);
            }
        }

        if wrapped && now == 3 * FRAME_DURATION {
            break;
        }
        assert!(Instant::now() < deadline, "loop playback never wrapped");
    }

    // After 1.3 s of a 1 s loop, playback sits at 0.3 s on frame 3.
    assert_eq!(engine.playback_time(), 3 * FRAME_DURATION);
    let lock = engine.create_render_lock().unwrap();
    assert_eq!(lock.display_frame().frame_index(), 3);
    assert_eq!(lock.keyframe().frame_index(), 0);

    // The base keyframe moved to 5 for the second half and back to 0 after
    // the wrap.
    let five = keyframe_history.iter().position(|&k| k == 5).unwrap();
    assert!(
        keyframe_history[five..].contains(&0),
        "keyframe history never returned to 0: {keyframe_history:?}"
    );
}

#[test]
fn test_back_and_forth_reflects_at_the_end() {
    init_logging();
    let keyframes = [true, false, false, false, false, true, false, false, false, false];
    let file = FixtureVideoBuilder::new(&keyframes, FRAME_DURATION).build();

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(5, backend, FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);
    engine.set_playback_mode(PlaybackMode::BackAndForth);

    pump_until(&mut engine, "load to finish", |engine| {
        engine.async_load_state() == AsyncLoadState::Ready
    });
    engine.seek(9 * FRAME_DURATION, true);
    pump_until(&mut engine, "seek target to become ready", |engine| {
        !engine.is_buffering() && engine.is_current_frame_display_ready()
    });

    // 0.9 s + 0.3 s reflects off the 1 s boundary to 0.8 s, playing backward.
    engine.update(6 * STEP);
    assert_eq!(engine.playback_time(), 8 * FRAME_DURATION);
    assert!(!engine.playing_forward());
}

#[test]
fn test_seek_across_keyframe_boundary() {
    init_logging();
    let keyframes = [true, false, false, false, false, false, true, false, false, false];
    let file = FixtureVideoBuilder::new(&keyframes, FRAME_DURATION).build();

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(5, backend, FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);

    // Reach dependent frame 2.
    pump_until(&mut engine, "load to finish", |engine| {
        engine.async_load_state() == AsyncLoadState::Ready
    });
    engine.seek(2 * FRAME_DURATION + FRAME_DURATION / 2, true);
    pump_until(&mut engine, "frame 2 to display", |engine| {
        engine.is_current_frame_display_ready()
    });
    assert_eq!(display_frame(&mut engine), Some(2));

    // Seek to frame 7, whose base keyframe is 6.
    engine.seek(7 * FRAME_DURATION + FRAME_DURATION / 2, true);

    let mut interim_displays = Vec::new();
    pump_until(&mut engine, "frame 7 to display", |engine| {
        if let Some(frame) = engine
            .create_render_lock()
            .map(|lock| lock.display_frame().frame_index())
        {
            interim_displays.push(frame);
        }
        engine.is_current_frame_display_ready()
    });

    let lock = engine.create_render_lock().unwrap();
    assert_eq!(lock.display_frame().frame_index(), 7);
    assert_eq!(lock.keyframe().frame_index(), 6);
    assert!(lock.predecessor().is_none());

    // The skipped-over frames must never have been displayed.
    assert!(
        interim_displays.iter().all(|frame| !(3..=5).contains(frame)),
        "skipped frames appeared during the seek: {interim_displays:?}"
    );
}

#[test]
fn test_seek_aborts_blocked_texture_promise() {
    init_logging();
    let keyframes = [true, false, false, false, false, true, false, false, false, false];
    let file = FixtureVideoBuilder::new(&keyframes, FRAME_DURATION).build();

    // The gated decoder withholds pictures, so the content-decode stage ends
    // up blocked in its texture promise wait.
    let gate = Arc::new(FakeDecoderGate::default());
    gate.set_blocked(true);

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(
        5,
        backend,
        FakeAv1DecoderFactory {
            delay: 0,
            gate: Some(Arc::clone(&gate)),
        },
    );
    open_bytes(&mut engine, file);

    pump_until(&mut engine, "load to finish", |engine| {
        engine.async_load_state() == AsyncLoadState::Ready
    });
    // Give the pipeline time to reach the blocking wait.
    sleep(Duration::from_millis(50));
    engine.update(0);
    assert!(engine.is_buffering());

    // Seeking must abort the blocked promise instead of deadlocking.
    engine.seek(5 * FRAME_DURATION + FRAME_DURATION / 2, true);
    gate.set_blocked(false);

    // The pipeline recovers and decodes the seek target; a slot left
    // write-locked or a hung worker would keep this from ever succeeding.
    pump_until(&mut engine, "seek target after abort", |engine| {
        engine.is_current_frame_display_ready()
    });
    assert_eq!(display_frame(&mut engine), Some(5));
}

#[test]
fn test_truncation_before_index_fails_the_load() {
    init_logging();
    let mut file = FixtureVideoBuilder::new(&[true, false, false], FRAME_DURATION)
        .with_index(false)
        .build();
    // Chop into the last frame's payload; without an index chunk the full
    // file scan runs into the truncation.
    file.truncate(file.len() - 10);

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(4, backend, FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);

    pump_until(&mut engine, "load to fail", |engine| {
        engine.async_load_state() == AsyncLoadState::Error
    });
    assert!(engine.create_render_lock().is_none());
}

#[test]
fn test_truncated_frame_stops_playback_at_the_last_complete_frame() {
    init_logging();
    let keyframes = [true, false, false, false, true, false, false, false];
    let builder = FixtureVideoBuilder::new(&keyframes, FRAME_DURATION);
    let mut file = builder.build();

    // Cut into frame 6's payload, leaving the index (which still lists all
    // eight frames) and frames 0..=5 intact.
    let frame_7 = builder.build_frame_payload(7).len() + 5;
    let into_frame_6 = frame_7 + 10;
    file.truncate(file.len() - into_frame_6);

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(10, backend, FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);

    wait_until_playing(&mut engine);

    // Play forward; the engine must stop advancing at the truncated frame.
    let mut max_displayed = 0;
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        engine.update(STEP);
        if let Some(frame) = display_frame(&mut engine) {
            max_displayed = max_displayed.max(frame);
        }
        if engine.is_buffering() && max_displayed == 5 {
            break;
        }
        sleep(Duration::from_millis(1));
    }

    assert_eq!(max_displayed, 5, "playback ran past the truncation");
    assert!(engine.is_buffering());
    // The clock froze inside frame 6's window.
    assert!(engine.playback_time() < 7 * FRAME_DURATION);

    // No progress happens beyond this point.
    let stalled_at = engine.playback_time();
    for _ in 0..20 {
        engine.update(STEP);
    }
    assert_eq!(engine.playback_time(), stalled_at);
    assert!(display_frame(&mut engine).is_none_or(|frame| frame <= 5));
}

#[test]
fn test_zstd_rgb_textures_bypass_the_av1_decoder() {
    init_logging();
    let file = FixtureVideoBuilder::new(&[true, false, false], FRAME_DURATION)
        .texture_mode(TextureMode::ZstdRgb)
        .build();

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(4, Arc::clone(&backend), FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);

    wait_until_playing(&mut engine);
    assert!(display_frame(&mut engine).is_some());
    assert!(!backend.uploads.lock().unwrap().is_empty());
}

#[test]
fn test_empty_textures_flow_through_the_pipeline() {
    init_logging();
    let file = FixtureVideoBuilder::new(&[true, false, false], FRAME_DURATION)
        .texture_mode(TextureMode::Empty)
        .build();

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(4, backend, FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);

    wait_until_playing(&mut engine);
    assert!(display_frame(&mut engine).is_some());
}

#[test]
fn test_upload_failure_invalidates_slots_and_recovers() {
    init_logging();
    let file = FixtureVideoBuilder::new(&[true, false, false], FRAME_DURATION).build();

    let backend = Arc::new(NullGpuBackend::default());
    *backend.fail_uploads.lock().unwrap() = true;

    let mut engine = engine_with(4, Arc::clone(&backend), FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);

    pump_until(&mut engine, "load to finish", |engine| {
        engine.async_load_state() == AsyncLoadState::Ready
    });
    sleep(Duration::from_millis(50));
    engine.update(0);

    // Failed uploads invalidate their slots; nothing becomes displayable.
    assert!(engine.is_buffering());
    assert!(!backend.invalidated_slots.lock().unwrap().is_empty());

    // Once uploads work again, playback comes up.
    *backend.fail_uploads.lock().unwrap() = false;
    wait_until_playing(&mut engine);
    assert!(display_frame(&mut engine).is_some());
}

#[test]
fn test_video_switch_is_deferred_until_stages_exit() {
    init_logging();
    let first = FixtureVideoBuilder::new(&[true, false, false], FRAME_DURATION).build();
    let second = FixtureVideoBuilder::new(&[true, false], FRAME_DURATION * 2).build();

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(4, backend, FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, first);
    wait_until_playing(&mut engine);
    assert!(engine.switched_to_most_recent_video());

    open_bytes(&mut engine, second);
    pump_until(&mut engine, "switch to the new video", |engine| {
        engine.switched_to_most_recent_video()
    });

    let info = engine.video_info().unwrap();
    assert_eq!(info.index.frame_count(), 2);
    assert_eq!(info.index.video_end_timestamp(), 4 * FRAME_DURATION);
}

#[test]
fn test_render_lock_holds_dependency_closure() {
    init_logging();
    let file = FixtureVideoBuilder::new(&[true, false, false], FRAME_DURATION).build();

    let backend = Arc::new(NullGpuBackend::default());
    let mut engine = engine_with(4, backend, FakeAv1DecoderFactory::default());
    open_bytes(&mut engine, file);

    pump_until(&mut engine, "load to finish", |engine| {
        engine.async_load_state() == AsyncLoadState::Ready
    });
    engine.seek(2 * FRAME_DURATION + FRAME_DURATION / 2, true);
    pump_until(&mut engine, "frame 2 to display", |engine| {
        engine.is_current_frame_display_ready()
    });

    let lock = engine.create_render_lock().unwrap();
    assert_eq!(lock.display_frame().frame_index(), 2);
    assert_eq!(lock.keyframe().frame_index(), 0);
    assert_eq!(lock.predecessor().map(|p| p.frame_index()), Some(1));
    assert!(lock.intra_frame_time() >= 0.0 && lock.intra_frame_time() <= 1.0);
}
