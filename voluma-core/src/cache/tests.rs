use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::clock::{FrameIterator, PlaybackClock, PlaybackMode};
use crate::index::FrameIndex;

const FRAME_DURATION: i64 = 100;

fn index_of(keyframes: &[bool]) -> FrameIndex {
    let mut index = FrameIndex::new();
    for (i, &is_keyframe) in keyframes.iter().enumerate() {
        index.push_frame(i as i64 * FRAME_DURATION, i as u64 * 1000, is_keyframe);
    }
    index.push_video_end(
        keyframes.len() as i64 * FRAME_DURATION,
        keyframes.len() as u64 * 1000,
    );
    index
}

fn iter_at(index: &FrameIndex, frame: usize, mode: PlaybackMode) -> FrameIterator<'_> {
    let clock = PlaybackClock::new();
    clock.set_playback_conditions(
        index.video_start_timestamp(),
        index.video_end_timestamp(),
        mode,
        1.0,
    );
    clock.seek(frame as i64 * FRAME_DURATION, true);
    let state = clock.lock();
    FrameIterator::new(&state, index).unwrap()
}

/// Repeatedly admits and "decodes" (drops the write guards of) frames until
/// the cache has nothing left to do for the given playback position.
fn fill_cache(cache: &DecodedFrameCache, index: &FrameIndex, frame: usize, mode: PlaybackMode) {
    loop {
        let locks = cache.lock_for_decoding_next(&iter_at(index, frame, mode));
        if locks.is_empty() {
            break;
        }
        drop(locks);
    }
}

fn cached_frames(cache: &DecodedFrameCache) -> Vec<usize> {
    let state = cache.inner.state.lock().unwrap();
    let mut frames: Vec<usize> = state.frame_to_slot.keys().copied().collect();
    frames.sort_unstable();
    frames
}

#[test]
fn test_admission_locks_dependency_closure_in_order() {
    let index = index_of(&[true, false, false, true, false]);
    let cache = DecodedFrameCache::new(4);

    // Playback at dependent frame 2: its keyframe (0), predecessor (1), and
    // the frame itself must all be locked, ordered by frame index.
    let locks = cache.lock_for_decoding_next(&iter_at(&index, 2, PlaybackMode::SingleShot));
    let frames: Vec<usize> = locks.iter().map(|l| l.frame_index()).collect();
    assert_eq!(frames, vec![0, 1, 2]);
}

#[test]
fn test_admission_returns_empty_when_everything_is_required() {
    let index = index_of(&[true, false, false]);
    let cache = DecodedFrameCache::new(3);

    fill_cache(&cache, &index, 0, PlaybackMode::SingleShot);
    assert_eq!(cached_frames(&cache), vec![0, 1, 2]);

    // All three slots are required by upcoming playback; nothing to decode.
    let locks = cache.lock_for_decoding_next(&iter_at(&index, 0, PlaybackMode::SingleShot));
    assert!(locks.is_empty());
}

#[test]
fn test_admission_proceeds_frame_by_frame() {
    let index = index_of(&[true, false, false, false]);
    let cache = DecodedFrameCache::new(4);

    let locks = cache.lock_for_decoding_next(&iter_at(&index, 0, PlaybackMode::SingleShot));
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].frame_index(), 0);
    drop(locks);

    // Frame 0 is now cached; the next missing frame is 1, whose dependencies
    // are already resident.
    let locks = cache.lock_for_decoding_next(&iter_at(&index, 0, PlaybackMode::SingleShot));
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].frame_index(), 1);
}

#[test]
fn test_eviction_prefers_frames_shown_latest() {
    let index = index_of(&[true, false, false, true, false, false]);
    let cache = DecodedFrameCache::new(4);

    // Fill the cache for playback at frame 0: frames 0..3 become resident.
    fill_cache(&cache, &index, 0, PlaybackMode::SingleShot);
    assert_eq!(cached_frames(&cache), vec![0, 1, 2, 3]);

    // Move playback to frame 3. Frames 0..2 will never be shown again in
    // single-shot mode; the admission for missing frame 4 must evict one of
    // them rather than keyframe 3 (which is required).
    let locks = cache.lock_for_decoding_next(&iter_at(&index, 3, PlaybackMode::SingleShot));
    let frames: Vec<usize> = locks.iter().map(|l| l.frame_index()).collect();
    assert_eq!(frames, vec![4]);
    drop(locks);

    assert!(cached_frames(&cache).contains(&3));
    assert!(cached_frames(&cache).contains(&4));
}

#[test]
fn test_admission_rolls_back_when_no_slots_are_free() {
    let index = index_of(&[true, false, false, true, false]);
    let cache = DecodedFrameCache::new(3);

    fill_cache(&cache, &index, 0, PlaybackMode::SingleShot);

    // Hold read locks on everything so no slot can be reused.
    let read_locks = cache.lock_for_reading(&[0, 1, 2]).unwrap();

    // Playback at frame 3 needs a fresh slot for keyframe 3, but all slots
    // are read-locked: admission must fail without leaving stray write locks.
    let locks = cache.lock_for_decoding_next(&iter_at(&index, 3, PlaybackMode::SingleShot));
    assert!(locks.is_empty());
    drop(read_locks);

    let locks = cache.lock_for_decoding_next(&iter_at(&index, 3, PlaybackMode::SingleShot));
    assert!(!locks.is_empty());
}

#[test]
fn test_read_locking_is_all_or_nothing() {
    let index = index_of(&[true, false, false]);
    let cache = DecodedFrameCache::new(3);
    fill_cache(&cache, &index, 0, PlaybackMode::SingleShot);

    assert!(cache.lock_for_reading(&[0, 1]).is_some());
    // One absent frame fails the whole request.
    assert!(cache.lock_for_reading(&[0, 99]).is_none());
}

#[test]
fn test_read_locks_exclude_writers() {
    let index = index_of(&[true, false]);
    let cache = DecodedFrameCache::new(2);

    let write_locks = cache.lock_for_decoding_next(&iter_at(&index, 0, PlaybackMode::SingleShot));
    assert_eq!(write_locks.len(), 1);

    // The frame is assigned but write-locked; readers must be refused.
    assert!(cache.lock_for_reading(&[0]).is_none());
    drop(write_locks);
    assert!(cache.lock_for_reading(&[0]).is_some());
}

#[test]
fn test_writers_exclude_readers() {
    let index = index_of(&[true, false, false]);
    let cache = DecodedFrameCache::new(3);
    fill_cache(&cache, &index, 0, PlaybackMode::SingleShot);

    let read_lock = cache.lock_for_reading(&[2]).unwrap();

    // With frame 2 read-locked and frames 0/1 required, playback at frame 0
    // of a longer video could not evict slot 2. Emulate via the slot lock.
    let slot = read_lock[0].slot_index();
    assert!(cache.lock_slot_for_writing(slot).is_none());
    drop(read_lock);
    assert!(cache.lock_slot_for_writing(slot).is_some());
}

#[test]
fn test_cloned_read_lock_keeps_slot_locked() {
    let index = index_of(&[true]);
    let cache = DecodedFrameCache::new(1);
    fill_cache(&cache, &index, 0, PlaybackMode::SingleShot);

    let read_locks = cache.lock_for_reading(&[0]).unwrap();
    let cloned = read_locks[0].clone();
    drop(read_locks);

    let slot = cloned.slot_index();
    assert!(cache.lock_slot_for_writing(slot).is_none());
    drop(cloned);
    assert!(cache.lock_slot_for_writing(slot).is_some());
}

#[test]
fn test_invalidated_write_guard_maps_slot_to_empty() {
    let index = index_of(&[true, false]);
    let cache = DecodedFrameCache::new(2);

    let locks = cache.lock_for_decoding_next(&iter_at(&index, 0, PlaybackMode::SingleShot));
    locks[0].invalidate();
    drop(locks);

    assert!(cache.lock_for_reading(&[0]).is_none());
    assert_eq!(cached_frames(&cache), Vec::<usize>::new());
}

#[test]
fn test_invalidate_all() {
    let index = index_of(&[true, false, false]);
    let cache = DecodedFrameCache::new(3);
    fill_cache(&cache, &index, 0, PlaybackMode::SingleShot);

    cache.invalidate_all();
    assert_eq!(cached_frames(&cache), Vec::<usize>::new());
}

#[test]
fn test_check_decoding_progress_counts_consecutive_ready_frames() {
    let index = index_of(&[true, false, false, false]);
    let cache = DecodedFrameCache::new(4);
    fill_cache(&cache, &index, 0, PlaybackMode::SingleShot);

    let progress = cache.check_decoding_progress(&iter_at(&index, 0, PlaybackMode::SingleShot));
    assert_eq!(progress.ready_frames, 4);
    assert_eq!(progress.required_frames, 4);
    assert_eq!(progress.ready_time_span(), 4 * FRAME_DURATION);
}

#[test]
fn test_check_decoding_progress_stops_at_write_locked_frame() {
    let index = index_of(&[true, false, false, false]);
    let cache = DecodedFrameCache::new(4);

    // Decode frames 0 and 1, but leave frame 2 write-locked (in progress).
    drop(cache.lock_for_decoding_next(&iter_at(&index, 0, PlaybackMode::SingleShot)));
    drop(cache.lock_for_decoding_next(&iter_at(&index, 0, PlaybackMode::SingleShot)));
    let in_progress = cache.lock_for_decoding_next(&iter_at(&index, 0, PlaybackMode::SingleShot));
    assert_eq!(in_progress[0].frame_index(), 2);

    let progress = cache.check_decoding_progress(&iter_at(&index, 0, PlaybackMode::SingleShot));
    assert_eq!(progress.ready_frames, 2);
    assert_eq!(progress.ready_time_span(), 2 * FRAME_DURATION);
}

#[test]
fn test_check_decoding_progress_is_bounded_for_infinite_iterators() {
    let index = index_of(&[true, false]);
    let cache = DecodedFrameCache::new(2);
    fill_cache(&cache, &index, 0, PlaybackMode::Loop);

    // A loop iterator never ends; the walk must stop at capacity.
    let progress = cache.check_decoding_progress(&iter_at(&index, 0, PlaybackMode::Loop));
    assert_eq!(progress.ready_frames, 2);
}

#[test]
fn test_read_lock_release_wakes_signal() {
    struct Counter(AtomicUsize);
    impl CacheWakeSignal for Counter {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let index = index_of(&[true]);
    let cache = DecodedFrameCache::new(1);
    let signal = Arc::new(Counter(AtomicUsize::new(0)));
    cache.set_wake_signal(signal.clone());

    fill_cache(&cache, &index, 0, PlaybackMode::SingleShot);
    let read_locks = cache.lock_for_reading(&[0]).unwrap();
    assert_eq!(signal.0.load(Ordering::SeqCst), 0);
    drop(read_locks);
    assert_eq!(signal.0.load(Ordering::SeqCst), 1);
}
