//! Buffering control: decides whether playback runs or waits for decoding.
//!
//! Playback resumes once a minimum number of upcoming frames is decoded and
//! either decoding keeps up with real time (with headroom), the rest of the
//! video is expected to decode before playback catches up, the cache is
//! nearly full with required frames, or nothing is left to decode.

use std::time::Instant;

use tracing::debug;

use crate::cache::DecodingProgress;

/// Decode throughput must beat real time by this factor to count as "fast
/// enough".
const REALTIME_DECODING_HEADROOM_FACTOR: f64 = 0.85;

/// Buffering shorter than this never shows a user-visible indicator.
const INDICATOR_DELAY_SECONDS: f32 = 0.1;

/// Placeholder for "infinitely many frames remain" in looping modes.
pub const UNBOUNDED_REMAINING_FRAMES: i64 = i32::MAX as i64;

/// Inputs to one buffering decision, gathered by the engine.
#[derive(Debug, Clone, Copy)]
pub struct BufferingInputs {
    pub progress: DecodingProgress,
    /// Rolling decode-latency estimate from the transfer stage.
    pub decode_time_samples: usize,
    pub average_decode_time_ns: i64,
    pub cache_capacity: usize,
    pub video_frame_count: usize,
    /// Frames left to play in the current mode and direction;
    /// [`UNBOUNDED_REMAINING_FRAMES`] for looping modes.
    pub remaining_frames_in_video: i64,
    /// Playback time left until the video boundary, adjusted for speed.
    pub remaining_playback_time_ns: f64,
}

/// Tracks the buffering state, the user-visible indicator, and the progress
/// estimate.
pub struct BufferingController {
    buffering: bool,
    show_indicator: bool,
    progress_percent: f32,
    buffering_since: Instant,
}

impl BufferingController {
    /// A new controller starts out buffering: nothing is decoded yet.
    pub fn new() -> Self {
        Self {
            buffering: true,
            show_indicator: false,
            progress_percent: 0.0,
            buffering_since: Instant::now(),
        }
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Whether a buffering indicator should be shown to the user. Separate
    /// from the buffering state itself: short hiccups stay invisible.
    pub fn indicator_visible(&self) -> bool {
        self.buffering && self.show_indicator
    }

    pub fn progress_percent(&self) -> f32 {
        self.progress_percent
    }

    pub fn start_buffering(&mut self) {
        self.buffering = true;
        self.show_indicator = false;
        self.progress_percent = 0.0;
        self.buffering_since = Instant::now();
    }

    pub fn stop_buffering(&mut self) {
        self.buffering = false;
        self.show_indicator = false;
    }

    /// Bookkeeping while asynchronous loading is still in progress: buffering
    /// is forced, and the indicator appears after the grace period.
    pub fn update_while_loading(&mut self) {
        if !self.buffering {
            self.start_buffering();
        }
        self.progress_percent = 0.0;
        if !self.show_indicator {
            self.show_indicator =
                self.buffering_since.elapsed().as_secs_f32() >= INDICATOR_DELAY_SECONDS;
        }
    }

    /// Evaluates whether buffering should continue, updating the indicator
    /// and the progress estimate. Returns true to keep buffering.
    pub fn should_buffer(&mut self, inputs: &BufferingInputs) -> bool {
        let ready = inputs.progress.ready_frames as i64;
        let required = inputs.progress.required_frames as i64;
        let capacity = inputs.cache_capacity as i64;
        let frame_count = inputs.video_frame_count as i64;
        let average_decode = inputs.average_decode_time_ns;

        let average_frame_duration = if ready > 0 {
            inputs.progress.ready_time_span() / ready
        } else {
            0
        };
        let minimum_ready = 5.min(capacity).min(inputs.remaining_frames_in_video);

        let mut new_progress = 0.0f64;

        if ready >= minimum_ready {
            let mut remaining_to_decode = (inputs.remaining_frames_in_video - ready).max(0);
            if capacity >= frame_count {
                remaining_to_decode = remaining_to_decode.min((frame_count - ready).max(0));
            }

            let decode_time_estimate = remaining_to_decode.saturating_mul(average_decode) as f64;
            let playback_remainder = inputs.remaining_playback_time_ns;

            if inputs.decode_time_samples > 0
                && ready >= 5
                && (average_decode as f64)
                    <= REALTIME_DECODING_HEADROOM_FACTOR * average_frame_duration as f64
            {
                // Decoding is faster than real time.
                if self.buffering {
                    debug!(ready, average_decode, "stopping buffering: real-time decoding");
                }
                self.stop_buffering();
                return false;
            }

            // Progress estimate: the best of the three criteria evaluated
            // below, each normalized to its own scale.
            new_progress =
                new_progress.max(ready as f64 / (ready + remaining_to_decode).max(1) as f64);
            let decode_time_so_far = (ready * average_decode) as f64;
            let denominator = decode_time_so_far + decode_time_estimate
                - REALTIME_DECODING_HEADROOM_FACTOR * playback_remainder;
            if denominator > 0.0 {
                new_progress = new_progress.max(decode_time_so_far / denominator);
            }
            if capacity < frame_count {
                new_progress = new_progress.max(required as f64 / (capacity - 2).max(1) as f64);
            }

            // The "- 2" accounts for the two frames a third frame may depend
            // on; the cache may never fill completely beyond that.
            let cache_nearly_full = capacity < frame_count && required >= capacity - 2;

            if remaining_to_decode == 0
                || decode_time_estimate <= REALTIME_DECODING_HEADROOM_FACTOR * playback_remainder
                || cache_nearly_full
            {
                if self.buffering {
                    debug!(
                        ready,
                        remaining_to_decode,
                        cache_nearly_full,
                        "stopping buffering: cache nearly full or decode expected to finish in time"
                    );
                }
                self.stop_buffering();
                return false;
            }
        }

        // Still buffering. Show the indicator after the grace period, or
        // immediately once it is measurable that decoding cannot keep up
        // with real time.
        if self.buffering && !self.show_indicator {
            let buffering_duration = self.buffering_since.elapsed().as_secs_f32();
            let decode_is_slow = inputs.decode_time_samples > 0
                && ready >= 2
                && (average_decode as f64)
                    > REALTIME_DECODING_HEADROOM_FACTOR * average_frame_duration as f64;
            if buffering_duration >= INDICATOR_DELAY_SECONDS || decode_is_slow {
                self.show_indicator = true;
            }
        }

        self.progress_percent = (100.0 * new_progress).clamp(0.0, 100.0) as f32;
        true
    }
}

impl Default for BufferingController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(ready: usize, required: usize, frame_duration: i64) -> DecodingProgress {
        DecodingProgress {
            required_frames: required,
            ready_frames: ready,
            ready_start_time: 0,
            ready_end_time: ready as i64 * frame_duration,
        }
    }

    fn inputs(ready: usize, average_decode: i64) -> BufferingInputs {
        BufferingInputs {
            progress: progress(ready, ready, 33_000_000),
            decode_time_samples: ready,
            average_decode_time_ns: average_decode,
            cache_capacity: 30,
            video_frame_count: 300,
            remaining_frames_in_video: 300,
            remaining_playback_time_ns: 10e9,
        }
    }

    #[test]
    fn test_stays_buffering_below_minimum_ready() {
        let mut controller = BufferingController::new();
        assert!(controller.should_buffer(&inputs(2, 1_000_000)));
        assert!(controller.is_buffering());
    }

    #[test]
    fn test_exits_when_decoding_is_realtime() {
        let mut controller = BufferingController::new();
        // 1 ms decode vs 33 ms frame duration: plenty of headroom.
        assert!(!controller.should_buffer(&inputs(5, 1_000_000)));
        assert!(!controller.is_buffering());
    }

    #[test]
    fn test_keeps_buffering_when_decoding_is_slow() {
        let mut controller = BufferingController::new();
        // 100 ms decode vs 33 ms frame duration, and far more playback time
        // needed than remains.
        assert!(controller.should_buffer(&inputs(5, 100_000_000)));
        assert!(controller.is_buffering());
        assert!(controller.progress_percent() > 0.0);
    }

    #[test]
    fn test_exits_when_nothing_remains_to_decode() {
        let mut controller = BufferingController::new();
        let mut inputs = inputs(5, 100_000_000);
        inputs.remaining_frames_in_video = 5;
        assert!(!controller.should_buffer(&inputs));
    }

    #[test]
    fn test_exits_when_cache_is_nearly_full() {
        let mut controller = BufferingController::new();
        let mut inputs = inputs(10, 100_000_000);
        inputs.cache_capacity = 12;
        inputs.progress.required_frames = 10;
        assert!(!controller.should_buffer(&inputs));
    }

    #[test]
    fn test_minimum_ready_respects_video_end() {
        let mut controller = BufferingController::new();
        // Only two frames remain: two ready frames suffice to exit (nothing
        // else remains to decode).
        let mut inputs = inputs(2, 100_000_000);
        inputs.remaining_frames_in_video = 2;
        assert!(!controller.should_buffer(&inputs));
    }

    #[test]
    fn test_indicator_appears_immediately_when_decode_is_slow() {
        let mut controller = BufferingController::new();
        controller.start_buffering();
        controller.should_buffer(&inputs(4, 100_000_000));
        assert!(controller.indicator_visible());
    }

    #[test]
    fn test_indicator_hidden_during_short_buffering() {
        let mut controller = BufferingController::new();
        controller.start_buffering();
        // Fast decode, but fewer than the minimum ready frames: buffering
        // continues without an indicator.
        controller.should_buffer(&inputs(1, 1_000_000));
        assert!(!controller.indicator_visible());
    }
}
