//! Playback clock and the frame lookahead iterator.
//!
//! The clock is shared between the update/render side and the reading stage.
//! Every externally visible change (advance, seek, mode/speed/range changes)
//! notifies the change condvar, which the reading stage waits on when it has
//! nothing to decode.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::cache::CacheWakeSignal;
use crate::index::FrameIndex;

/// Playback mode. The numeric values are part of the embedding API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PlaybackMode {
    /// Plays the video once, then shows the final frame statically.
    #[default]
    SingleShot = 0,
    /// Loops the video.
    Loop = 1,
    /// Alternates between forward and backward playback, looping the video
    /// without a discontinuity.
    BackAndForth = 2,
}

/// Clock state; accessed through [`PlaybackClock::lock`].
#[derive(Debug)]
pub struct ClockState {
    current_time: i64,
    forward: bool,
    speed: f64,
    mode: PlaybackMode,
    video_start_time: i64,
    video_end_time: i64,
}

impl ClockState {
    pub fn playback_time(&self) -> i64 {
        self.current_time
    }

    pub fn playing_forward(&self) -> bool {
        self.forward
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn video_start_time(&self) -> i64 {
        self.video_start_time
    }

    pub fn video_end_time(&self) -> i64 {
        self.video_end_time
    }

    /// Seeks while the state is already locked. Returns true if anything
    /// changed; the caller must notify the clock's condvar in that case.
    pub fn seek(&mut self, timestamp: i64, forward: bool) -> bool {
        let timestamp = timestamp.clamp(self.video_start_time, self.video_end_time);
        let changed = self.current_time != timestamp || self.forward != forward;
        self.current_time = timestamp;
        self.forward = forward;
        changed
    }

    fn advance(&mut self, elapsed_ns: i64) {
        // The cast back to i64 keeps the time update exact; accumulating in
        // floating point would drift.
        let step = (self.speed * elapsed_ns as f64).round() as i64;
        self.current_time += if self.forward { step } else { -step };

        match self.mode {
            PlaybackMode::SingleShot => {
                self.current_time = self
                    .current_time
                    .clamp(self.video_start_time, self.video_end_time);
            }
            PlaybackMode::Loop => {
                let range = self.video_end_time - self.video_start_time;
                if range > 0
                    && (self.current_time < self.video_start_time
                        || self.current_time > self.video_end_time)
                {
                    self.current_time = self.video_start_time
                        + (self.current_time - self.video_start_time).rem_euclid(range);
                }
            }
            PlaybackMode::BackAndForth => {
                if self.current_time < self.video_start_time {
                    self.current_time =
                        self.video_start_time + (self.video_start_time - self.current_time);
                    self.forward = true;
                } else if self.current_time > self.video_end_time {
                    self.current_time =
                        self.video_end_time - (self.current_time - self.video_end_time);
                    self.forward = false;
                }
            }
        }
    }
}

/// The current playback time and settings, shared between the render side and
/// the decoding threads.
pub struct PlaybackClock {
    state: Mutex<ClockState>,
    changed: Condvar,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                current_time: i64::MIN,
                forward: true,
                speed: 1.0,
                mode: PlaybackMode::SingleShot,
                video_start_time: i64::MIN,
                video_end_time: i64::MIN,
            }),
            changed: Condvar::new(),
        }
    }

    /// Locks the clock state. The reading stage holds this lock while
    /// deciding what to decode next.
    pub fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap()
    }

    /// Waits on the change condvar with a timeout, releasing the given state
    /// guard while waiting.
    pub fn wait_timeout<'a>(
        &'a self,
        guard: MutexGuard<'a, ClockState>,
        timeout: Duration,
    ) -> MutexGuard<'a, ClockState> {
        self.changed.wait_timeout(guard, timeout).unwrap().0
    }

    /// Wakes every thread waiting on the change condvar.
    pub fn notify_change(&self) {
        self.changed.notify_all();
    }

    /// Sets all playback conditions at once (new video, or a mode change from
    /// the embedding).
    pub fn set_playback_conditions(&self, start: i64, end: i64, mode: PlaybackMode, speed: f64) {
        let changed = {
            let mut state = self.lock();
            let changed = state.video_start_time != start
                || state.video_end_time != end
                || state.mode != mode
                || state.speed != speed;
            state.video_start_time = start;
            state.video_end_time = end;
            state.mode = mode;
            state.speed = speed;
            changed
        };
        if changed {
            self.notify_change();
        }
    }

    pub fn set_playback_time_range(&self, start: i64, end: i64) {
        let changed = {
            let mut state = self.lock();
            let changed = state.video_start_time != start || state.video_end_time != end;
            state.video_start_time = start;
            state.video_end_time = end;
            changed
        };
        if changed {
            self.notify_change();
        }
    }

    pub fn set_playback_mode(&self, mode: PlaybackMode) {
        let changed = {
            let mut state = self.lock();
            let changed = state.mode != mode;
            state.mode = mode;
            changed
        };
        if changed {
            self.notify_change();
        }
    }

    pub fn set_playback_speed(&self, speed: f64) {
        let changed = {
            let mut state = self.lock();
            let changed = state.speed != speed;
            state.speed = speed;
            changed
        };
        if changed {
            self.notify_change();
        }
    }

    /// Seeks to the given timestamp (clamped to the video range) and sets the
    /// playback direction. Returns the time after clamping.
    pub fn seek(&self, timestamp: i64, forward: bool) -> i64 {
        let (changed, time) = {
            let mut state = self.lock();
            let changed = state.seek(timestamp, forward);
            (changed, state.current_time)
        };
        if changed {
            self.notify_change();
        }
        time
    }

    /// Advances playback by the given elapsed wall-clock time, scaled by the
    /// playback speed and folded by the playback mode. Returns the resulting
    /// playback time.
    pub fn advance(&self, elapsed_ns: i64) -> i64 {
        let (changed, time) = {
            let mut state = self.lock();
            let prev_time = state.current_time;
            let prev_forward = state.forward;
            state.advance(elapsed_ns);
            (
                state.current_time != prev_time || state.forward != prev_forward,
                state.current_time,
            )
        };
        if changed {
            self.notify_change();
        }
        time
    }

    pub fn playback_time(&self) -> i64 {
        self.lock().current_time
    }

    pub fn playing_forward(&self) -> bool {
        self.lock().forward
    }

    pub fn mode(&self) -> PlaybackMode {
        self.lock().mode
    }

    pub fn speed(&self) -> f64 {
        self.lock().speed
    }
}

impl CacheWakeSignal for PlaybackClock {
    // Read-lock releases free up cache slots; waking the change condvar lets
    // the reading stage re-run its admission check immediately instead of
    // relying on its wait timeout.
    fn wake(&self) {
        self.notify_change();
    }
}

/// Yields the frame indices that playback will visit next, assuming no
/// outside influence (such as a seek). Used by the reading stage to select
/// frames for decoding and by the cache to score eviction candidates.
#[derive(Clone)]
pub struct FrameIterator<'a> {
    at_end: bool,
    current: usize,
    forward: bool,
    mode: PlaybackMode,
    index: &'a FrameIndex,
}

impl<'a> FrameIterator<'a> {
    /// Builds an iterator at the clock's current frame. Returns `None` if the
    /// current playback time maps to no frame.
    pub fn new(clock: &ClockState, index: &'a FrameIndex) -> Option<Self> {
        let current = index.find_frame_index_for_timestamp(clock.playback_time())?;
        Some(Self {
            at_end: false,
            current,
            forward: clock.playing_forward(),
            mode: clock.mode(),
            index,
        })
    }

    /// True once `advance` ran past the end of a finite (single-shot)
    /// playback.
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// The iterator's current frame.
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn index(&self) -> &'a FrameIndex {
        self.index
    }

    /// Proceeds to the next frame that will be played back.
    pub fn advance(&mut self) {
        let count = self.index.frame_count() as isize;
        let mut next = self.current as isize + if self.forward { 1 } else { -1 };

        match self.mode {
            PlaybackMode::SingleShot => {
                if next < 0 || next >= count {
                    self.at_end = true;
                }
                next = next.clamp(0, count - 1);
            }
            PlaybackMode::Loop => {
                next = (next + count) % count;
            }
            PlaybackMode::BackAndForth => {
                if next < 0 {
                    next = 1.min(count - 1);
                    self.forward = true;
                } else if next >= count {
                    next = count - 1;
                    self.forward = false;
                }
            }
        }

        self.current = next as usize;
    }

    /// Number of frames until playback reaches `frame` from the current
    /// position, continuing linearly in the current mode. Zero for the
    /// current frame; `None` if the frame will never be played (again).
    pub fn duration_to(&self, frame: usize) -> Option<u32> {
        let count = self.index.frame_count() as i64;
        let frame = frame as i64;
        let current = self.current as i64;
        if frame >= count {
            return None;
        }

        let duration = if self.forward {
            if frame >= current {
                frame - current
            } else {
                match self.mode {
                    PlaybackMode::SingleShot => return None,
                    PlaybackMode::Loop => count - (current - frame),
                    PlaybackMode::BackAndForth => 2 * (count - current) - 1 + (current - frame),
                }
            }
        } else if current >= frame {
            current - frame
        } else {
            match self.mode {
                PlaybackMode::SingleShot => return None,
                PlaybackMode::Loop => count - (frame - current),
                PlaybackMode::BackAndForth => 2 * current + 1 + (frame - current),
            }
        };

        Some(duration as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_with_range(start: i64, end: i64, mode: PlaybackMode) -> PlaybackClock {
        let clock = PlaybackClock::new();
        clock.set_playback_conditions(start, end, mode, 1.0);
        clock.seek(start, true);
        clock
    }

    fn index_of(count: usize, duration: i64) -> FrameIndex {
        let mut index = FrameIndex::new();
        for i in 0..count {
            index.push_frame(i as i64 * duration, i as u64 * 100, i == 0);
        }
        index.push_video_end(count as i64 * duration, count as u64 * 100);
        index
    }

    #[test]
    fn test_single_shot_clamps() {
        let clock = clock_with_range(0, 1_000, PlaybackMode::SingleShot);
        assert_eq!(clock.advance(600), 600);
        assert_eq!(clock.advance(600), 1_000);
        assert!(clock.playing_forward());

        clock.seek(100, false);
        assert_eq!(clock.advance(300), 0);
    }

    #[test]
    fn test_loop_wraps_modularly() {
        let clock = clock_with_range(0, 1_000_000_000, PlaybackMode::Loop);
        assert_eq!(clock.advance(1_300_000_000), 300_000_000);
    }

    #[test]
    fn test_loop_advance_is_reversible() {
        let clock = clock_with_range(0, 1_000, PlaybackMode::Loop);
        clock.seek(200, true);
        clock.advance(900); // 1100 -> wraps to 100
        assert_eq!(clock.playback_time(), 100);
        clock.advance(-900); // -800 -> wraps back to 200
        assert_eq!(clock.playback_time(), 200);
    }

    #[test]
    fn test_back_and_forth_reflects() {
        let clock = clock_with_range(0, 1_000_000_000, PlaybackMode::BackAndForth);
        clock.seek(900_000_000, true);
        assert_eq!(clock.advance(300_000_000), 800_000_000);
        assert!(!clock.playing_forward());

        clock.seek(100_000_000, false);
        assert_eq!(clock.advance(300_000_000), 200_000_000);
        assert!(clock.playing_forward());
    }

    #[test]
    fn test_speed_scales_advance() {
        let clock = clock_with_range(0, 1_000_000, PlaybackMode::SingleShot);
        clock.set_playback_speed(0.5);
        assert_eq!(clock.advance(1_000), 500);
    }

    #[test]
    fn test_seek_is_idempotent_and_clamps() {
        let clock = clock_with_range(0, 1_000, PlaybackMode::SingleShot);
        assert_eq!(clock.seek(5_000, true), 1_000);
        assert_eq!(clock.seek(1_000, true), 1_000);
        assert_eq!(clock.playback_time(), 1_000);
    }

    #[test]
    fn test_iterator_single_shot_forward() {
        let index = index_of(5, 100);
        let clock = clock_with_range(0, 500, PlaybackMode::SingleShot);
        clock.seek(250, true);

        let state = clock.lock();
        let mut it = FrameIterator::new(&state, &index).unwrap();
        drop(state);

        let mut visited = vec![it.current()];
        while !it.at_end() {
            it.advance();
            if !it.at_end() {
                visited.push(it.current());
            }
        }
        assert_eq!(visited, vec![2, 3, 4]);
    }

    #[test]
    fn test_iterator_loop_wraps() {
        let index = index_of(4, 100);
        let clock = clock_with_range(0, 400, PlaybackMode::Loop);
        clock.seek(250, true);

        let state = clock.lock();
        let mut it = FrameIterator::new(&state, &index).unwrap();
        drop(state);

        let mut visited = Vec::new();
        for _ in 0..6 {
            visited.push(it.current());
            it.advance();
        }
        assert_eq!(visited, vec![2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_iterator_back_and_forth_reflects() {
        let index = index_of(3, 100);
        let clock = clock_with_range(0, 300, PlaybackMode::BackAndForth);
        clock.seek(150, true);

        let state = clock.lock();
        let mut it = FrameIterator::new(&state, &index).unwrap();
        drop(state);

        let mut visited = Vec::new();
        for _ in 0..7 {
            visited.push(it.current());
            it.advance();
        }
        // The last frame repeats while the playback time reflects through it.
        assert_eq!(visited, vec![1, 2, 2, 1, 0, 1, 2]);
    }

    #[test]
    fn test_duration_to() {
        let index = index_of(5, 100);
        let clock = clock_with_range(0, 500, PlaybackMode::SingleShot);
        clock.seek(250, true);

        let state = clock.lock();
        let it = FrameIterator::new(&state, &index).unwrap();
        drop(state);

        assert_eq!(it.duration_to(2), Some(0));
        assert_eq!(it.duration_to(4), Some(2));
        // Already passed and never revisited in single-shot mode.
        assert_eq!(it.duration_to(0), None);
        assert_eq!(it.duration_to(99), None);
    }

    #[test]
    fn test_duration_to_loop_and_back_and_forth() {
        let index = index_of(5, 100);

        let clock = clock_with_range(0, 500, PlaybackMode::Loop);
        clock.seek(250, true);
        let state = clock.lock();
        let it = FrameIterator::new(&state, &index).unwrap();
        drop(state);
        assert_eq!(it.duration_to(0), Some(3)); // 3, 4, 0

        let clock = clock_with_range(0, 500, PlaybackMode::BackAndForth);
        clock.seek(250, true);
        let state = clock.lock();
        let it = FrameIterator::new(&state, &index).unwrap();
        drop(state);
        // 3, 4, 4, 3, 2, 1: six steps to reach frame 1.
        assert_eq!(it.duration_to(1), Some(6));
    }
}
