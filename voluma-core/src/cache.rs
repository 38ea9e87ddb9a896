//! Decoded frame cache.
//!
//! A fixed-capacity pool of slots holding decoded frames until rendering
//! needs them. Slot bookkeeping (which frame lives where, lock counts) sits
//! behind one mutex; the decoded data itself lives in per-slot mutexes so
//! that decoding and GPU upload can run without holding the bookkeeping lock.
//!
//! Lock discipline: a slot's data mutex may be taken while holding the state
//! mutex, never the other way around. Writers hold a slot's exclusive write
//! flag for the whole decode; readers (rendering) share slots through read
//! counts. Displaying a dependent frame needs up to two other frames resident
//! (its base keyframe and its direct predecessor), which is why admission and
//! read-locking always operate on the dependency closure.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::clock::FrameIterator;
use crate::codec::{DecodedFrameContent, FrameMetadata};

/// Notified whenever a read lock is released, freeing a slot for reuse.
pub trait CacheWakeSignal: Send + Sync {
    fn wake(&self);
}

/// Decoded data of one cached frame: the frame's metadata, the CPU-side
/// buffers, and the tightly packed texture. GPU-side resources are owned by
/// the backend, keyed by slot index.
#[derive(Debug, Default)]
pub struct FrameData {
    pub metadata: FrameMetadata,
    pub content: DecodedFrameContent,
    pub texture: Vec<u8>,
}

const MAX_DEPENDENCY_COUNT: usize = 2;

#[derive(Default)]
struct Slot {
    /// The cached frame's index, or `None` while the slot is empty.
    frame_index: Option<usize>,
    /// Frames this slot's frame depends on for display.
    depends_on: [Option<usize>; MAX_DEPENDENCY_COUNT],
    /// Exclusive write access, held by the decode pipeline.
    write_locked: bool,
    /// Shared read access, held by rendering.
    read_lock_count: usize,
}

impl Slot {
    fn is_locked(&self) -> bool {
        self.write_locked || self.read_lock_count > 0
    }
}

struct CacheState {
    slots: Vec<Slot>,
    /// Frame index -> slot index, for cache residency checks.
    frame_to_slot: HashMap<usize, usize>,
}

impl CacheState {
    fn is_frame_cached(&self, frame_index: usize) -> bool {
        self.frame_to_slot.contains_key(&frame_index)
    }

    /// Clears a slot's frame assignment. Requires the state lock.
    fn invalidate_slot(&mut self, slot_index: usize) {
        if let Some(frame_index) = self.slots[slot_index].frame_index.take() {
            self.frame_to_slot.remove(&frame_index);
        }
    }

    /// Assigns a frame (and its dependencies) to a slot, clearing any prior
    /// assignment. Requires the state lock.
    fn configure_slot(
        &mut self,
        slot_index: usize,
        frame_index: usize,
        depends_on: [Option<usize>; MAX_DEPENDENCY_COUNT],
    ) {
        self.invalidate_slot(slot_index);
        let slot = &mut self.slots[slot_index];
        slot.frame_index = Some(frame_index);
        slot.depends_on = depends_on;
        self.frame_to_slot.insert(frame_index, slot_index);
    }
}

struct CacheInner {
    state: Mutex<CacheState>,
    /// Per-slot decoded data, lockable independently of the bookkeeping.
    slot_data: Vec<Mutex<FrameData>>,
    wake_signal: OnceLock<Arc<dyn CacheWakeSignal>>,
}

impl CacheInner {
    fn release_write_lock(&self, slot_index: usize) {
        let mut state = self.state.lock().unwrap();
        state.slots[slot_index].write_locked = false;
    }

    fn release_read_lock(&self, slot_index: usize) {
        {
            let mut state = self.state.lock().unwrap();
            state.slots[slot_index].read_lock_count -= 1;
        }
        if let Some(signal) = self.wake_signal.get() {
            signal.wake();
        }
    }
}

/// Progress report from [`DecodedFrameCache::check_decoding_progress`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodingProgress {
    /// Distinct cached slots required by upcoming playback.
    pub required_frames: usize,
    /// Consecutive upcoming frames that are decoded and displayable.
    pub ready_frames: usize,
    /// Time range covered by the ready frames, in nanoseconds.
    pub ready_start_time: i64,
    pub ready_end_time: i64,
}

impl DecodingProgress {
    /// Duration covered by the ready frames.
    pub fn ready_time_span(&self) -> i64 {
        (self.ready_end_time - self.ready_start_time).max(0)
    }
}

/// Bounded pool of decoded frames with read/write locking.
pub struct DecodedFrameCache {
    inner: Arc<CacheInner>,
}

impl DecodedFrameCache {
    /// Creates a cache with the given number of slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::new();
        let mut slot_data = Vec::new();
        slots.resize_with(capacity, Slot::default);
        slot_data.resize_with(capacity, || Mutex::new(FrameData::default()));

        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    slots,
                    frame_to_slot: HashMap::new(),
                }),
                slot_data,
                wake_signal: OnceLock::new(),
            }),
        }
    }

    /// Registers the signal to notify when read locks are released. May be
    /// set once.
    pub fn set_wake_signal(&self, signal: Arc<dyn CacheWakeSignal>) {
        let _ = self.inner.wake_signal.set(signal);
    }

    /// Number of frames this cache can hold.
    pub fn capacity(&self) -> usize {
        self.inner.slot_data.len()
    }

    /// Invalidates every slot that is not currently locked, and clears the
    /// frame assignment of locked ones on their release path. Used when
    /// switching to another video.
    pub fn invalidate_all(&self) {
        let mut state = self.inner.state.lock().unwrap();
        for slot_index in 0..state.slots.len() {
            state.invalidate_slot(slot_index);
        }
    }

    /// Finds and write-locks the slots needed to decode the next frame
    /// required by playback.
    ///
    /// Walks the upcoming frames, marking already-cached ones (and their
    /// dependencies) as required, until it finds a frame that is not fully
    /// cached or until every slot is required. For a missing frame, it
    /// resolves the dependency set {keyframe, predecessor, frame} and picks
    /// an unlocked non-required slot for each missing member, preferring
    /// slots whose content will be shown latest (empty slots count as never).
    /// The write guards are returned ordered by ascending frame index. Callers
    /// rely on that order: the keyframe decodes before the predecessor before
    /// the target frame.
    ///
    /// Returns an empty vector when there is nothing to decode or no slots
    /// can be freed.
    pub fn lock_for_decoding_next(&self, iter: &FrameIterator) -> SmallVec<[WriteLockedFrame; 3]> {
        let index = iter.index();
        let mut it = iter.clone();
        let capacity = self.capacity();

        let mut required = vec![false; capacity];
        let mut required_count = 0usize;
        let mut frame_to_decode = None;

        let mut state = self.inner.state.lock().unwrap();

        // Flag the cached slots that upcoming playback requires.
        //
        // With back-and-forth playback the iterator can yield the same frame
        // more than once; those repeats are counted as required again on
        // purpose, which bounds this loop even if the iterator keeps
        // returning the same frames forever. Dependency slots are only
        // counted once.
        loop {
            let next_frame = it.current();

            let Some(&slot_index) = state.frame_to_slot.get(&next_frame) else {
                frame_to_decode = Some(next_frame);
                break;
            };

            required_count += 1;
            required[slot_index] = true;

            for dependency in state.slots[slot_index].depends_on {
                let Some(dependency) = dependency else { continue };
                match state.frame_to_slot.get(&dependency) {
                    Some(&dependency_slot) => {
                        if !required[dependency_slot] {
                            required_count += 1;
                            required[dependency_slot] = true;
                        }
                    }
                    None => {
                        frame_to_decode = Some(next_frame);
                        break;
                    }
                }
            }

            if frame_to_decode.is_some() {
                break;
            }
            if required_count >= capacity {
                // Every slot is required; nothing can be decoded right now.
                return SmallVec::new();
            }

            it.advance();
            if it.at_end() {
                break;
            }
        }

        let Some(frame_to_decode) = frame_to_decode else {
            return SmallVec::new();
        };

        // Determine which of {keyframe, predecessor, frame} are missing.
        let (base_keyframe, predecessor) = index.find_dependency_frames(frame_to_decode);

        let frame_if_needed =
            (!state.is_frame_cached(frame_to_decode)).then_some(frame_to_decode);
        let keyframe_if_needed =
            base_keyframe.filter(|&keyframe| !state.is_frame_cached(keyframe));
        let predecessor_if_needed = predecessor
            .filter(|&pred| Some(pred) != base_keyframe)
            .filter(|&pred| !state.is_frame_cached(pred));

        // Pick the unlocked, non-required slot whose content is shown
        // latest. Empty slots and never-revisited frames score as infinity;
        // the first such slot wins ties.
        let find_good_free_slot = |state: &CacheState, required: &[bool]| {
            let mut best_score = None;
            let mut selected = None;
            for (slot_index, slot) in state.slots.iter().enumerate() {
                if required[slot_index] || slot.is_locked() {
                    continue;
                }
                let score = match slot.frame_index {
                    Some(frame) => iter.duration_to(frame).map_or(u64::MAX, u64::from),
                    None => u64::MAX,
                };
                if best_score.is_none_or(|best| score > best) {
                    best_score = Some(score);
                    selected = Some(slot_index);
                }
            }
            selected
        };

        // Reserve a slot per missing frame, rolling back on failure.
        let mut keyframe_slot = None;
        if keyframe_if_needed.is_some() {
            let Some(slot) = find_good_free_slot(&state, &required) else {
                return SmallVec::new();
            };
            state.slots[slot].write_locked = true;
            keyframe_slot = Some(slot);
        }

        let mut predecessor_slot = None;
        if predecessor_if_needed.is_some() {
            match find_good_free_slot(&state, &required) {
                Some(slot) => {
                    state.slots[slot].write_locked = true;
                    predecessor_slot = Some(slot);
                }
                None => {
                    if let Some(slot) = keyframe_slot {
                        state.slots[slot].write_locked = false;
                    }
                    return SmallVec::new();
                }
            }
        }

        let mut frame_slot = None;
        if frame_if_needed.is_some() {
            match find_good_free_slot(&state, &required) {
                Some(slot) => {
                    state.slots[slot].write_locked = true;
                    frame_slot = Some(slot);
                }
                None => {
                    if let Some(slot) = keyframe_slot {
                        state.slots[slot].write_locked = false;
                    }
                    if let Some(slot) = predecessor_slot {
                        state.slots[slot].write_locked = false;
                    }
                    return SmallVec::new();
                }
            }
        }

        // Clear the reserved slots' old content and assign the new frames.
        let mut locked = SmallVec::new();

        if let (Some(keyframe), Some(slot)) = (keyframe_if_needed, keyframe_slot) {
            state.configure_slot(slot, keyframe, [None, None]);
            locked.push(WriteLockedFrame::new(&self.inner, slot, keyframe));
        }

        if let (Some(pred), Some(slot)) = (predecessor_if_needed, predecessor_slot) {
            let base = base_keyframe.expect("a dependent frame always has a base keyframe");
            let second = (pred > 0 && pred - 1 != base).then(|| pred - 1);
            state.configure_slot(slot, pred, [Some(base), second]);
            locked.push(WriteLockedFrame::new(&self.inner, slot, pred));
        }

        if let (Some(frame), Some(slot)) = (frame_if_needed, frame_slot) {
            let second = predecessor.filter(|&pred| Some(pred) != base_keyframe);
            state.configure_slot(slot, frame, [base_keyframe, second]);
            locked.push(WriteLockedFrame::new(&self.inner, slot, frame));
        }

        locked
    }

    /// Atomically read-locks all of the given frames, in the order passed in.
    /// Fails without taking any lock if one of them is absent or currently
    /// write-locked.
    pub fn lock_for_reading(&self, frame_indices: &[usize]) -> Option<Vec<ReadLockedFrame>> {
        let mut state = self.inner.state.lock().unwrap();

        let mut slot_indices = Vec::with_capacity(frame_indices.len());
        for &frame_index in frame_indices {
            let &slot_index = state.frame_to_slot.get(&frame_index)?;
            if state.slots[slot_index].write_locked {
                return None;
            }
            slot_indices.push(slot_index);
        }

        let mut locked = Vec::with_capacity(slot_indices.len());
        for (&slot_index, &frame_index) in slot_indices.iter().zip(frame_indices) {
            state.slots[slot_index].read_lock_count += 1;
            locked.push(ReadLockedFrame {
                inner: Arc::clone(&self.inner),
                slot_index,
                frame_index,
            });
        }
        Some(locked)
    }

    /// Write-locks the given slot regardless of its frame assignment, for
    /// teardown and external slot maintenance. Fails if the slot is locked.
    /// The guard's `frame_index` is meaningless if the slot was empty.
    pub fn lock_slot_for_writing(&self, slot_index: usize) -> Option<WriteLockedFrame> {
        let mut state = self.inner.state.lock().unwrap();
        if state.slots[slot_index].is_locked() {
            return None;
        }
        state.slots[slot_index].write_locked = true;
        let frame_index = state.slots[slot_index].frame_index.unwrap_or(usize::MAX);
        Some(WriteLockedFrame {
            inner: Arc::clone(&self.inner),
            slot_index,
            frame_index,
        })
    }

    /// Counts how many consecutive upcoming frames could be displayed with
    /// the currently cached data, and the time span they cover. Checks at
    /// most `capacity` frames so that infinite iterators terminate.
    ///
    /// Unlike the admission walk, required slots are counted without
    /// duplicates here.
    pub fn check_decoding_progress(&self, iter: &FrameIterator) -> DecodingProgress {
        let index = iter.index();
        let mut it = iter.clone();

        let mut progress = DecodingProgress {
            ready_start_time: i64::MAX,
            ready_end_time: i64::MIN,
            ..DecodingProgress::default()
        };
        let mut required = vec![false; self.capacity()];

        let state = self.inner.state.lock().unwrap();

        loop {
            let next_frame = it.current();

            let Some(&slot_index) = state.frame_to_slot.get(&next_frame) else {
                break;
            };
            if state.slots[slot_index].write_locked {
                break;
            }
            if !required[slot_index] {
                progress.required_frames += 1;
                required[slot_index] = true;
            }

            let mut frame_ready = true;
            for dependency in state.slots[slot_index].depends_on {
                let Some(dependency) = dependency else { continue };
                match state.frame_to_slot.get(&dependency) {
                    Some(&dependency_slot) if !state.slots[dependency_slot].write_locked => {
                        if !required[dependency_slot] {
                            progress.required_frames += 1;
                            required[dependency_slot] = true;
                        }
                    }
                    _ => {
                        frame_ready = false;
                        break;
                    }
                }
            }
            if !frame_ready {
                break;
            }

            progress.ready_frames += 1;
            progress.ready_start_time =
                progress.ready_start_time.min(index.at(next_frame).timestamp());
            progress.ready_end_time = progress
                .ready_end_time
                .max(index.at(next_frame + 1).timestamp());

            if progress.ready_frames >= self.capacity() {
                break;
            }

            it.advance();
            if it.at_end() {
                break;
            }
        }

        if progress.ready_frames == 0 {
            progress.ready_start_time = 0;
            progress.ready_end_time = 0;
        }
        progress
    }

    /// Logs the lock state of every slot holding data.
    pub fn debug_print_cache_health(&self) {
        let state = self.inner.state.lock().unwrap();
        let mut valid = 0;
        for (slot_index, slot) in state.slots.iter().enumerate() {
            let Some(frame_index) = slot.frame_index else {
                continue;
            };
            valid += 1;
            if slot.write_locked || slot.read_lock_count > 0 {
                debug!(
                    slot_index,
                    frame_index,
                    write_locked = slot.write_locked,
                    read_locks = slot.read_lock_count,
                    depends_on = ?slot.depends_on,
                    "cache slot locked"
                );
            }
        }
        debug!(valid, capacity = state.slots.len(), "cache health");
    }

}

impl Clone for DecodedFrameCache {
    /// Clones the shared handle; both handles address the same slots.
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Exclusive write access to one cache slot, released on drop.
pub struct WriteLockedFrame {
    inner: Arc<CacheInner>,
    slot_index: usize,
    frame_index: usize,
}

impl WriteLockedFrame {
    fn new(inner: &Arc<CacheInner>, slot_index: usize, frame_index: usize) -> Self {
        Self {
            inner: Arc::clone(inner),
            slot_index,
            frame_index,
        }
    }

    /// The frame index this slot was locked to decode.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    /// Locks the slot's decoded data for writing. May be held across the
    /// decode without blocking the cache's bookkeeping.
    pub fn data(&self) -> MutexGuard<'_, FrameData> {
        self.inner.slot_data[self.slot_index].lock().unwrap()
    }

    /// Clears the slot's frame assignment, mapping it back to empty. The
    /// write lock itself stays held until drop.
    pub fn invalidate(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.invalidate_slot(self.slot_index);
    }
}

impl Drop for WriteLockedFrame {
    fn drop(&mut self) {
        self.inner.release_write_lock(self.slot_index);
    }
}

/// Shared read access to one cache slot, released on drop. Cloning takes an
/// additional read lock.
pub struct ReadLockedFrame {
    inner: Arc<CacheInner>,
    slot_index: usize,
    frame_index: usize,
}

impl ReadLockedFrame {
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    /// Locks the slot's decoded data.
    pub fn data(&self) -> MutexGuard<'_, FrameData> {
        self.inner.slot_data[self.slot_index].lock().unwrap()
    }
}

impl Clone for ReadLockedFrame {
    fn clone(&self) -> Self {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.slots[self.slot_index].read_lock_count += 1;
        }
        Self {
            inner: Arc::clone(&self.inner),
            slot_index: self.slot_index,
            frame_index: self.frame_index,
        }
    }
}

impl Drop for ReadLockedFrame {
    fn drop(&mut self) {
        self.inner.release_read_lock(self.slot_index);
    }
}

#[cfg(test)]
mod tests;
