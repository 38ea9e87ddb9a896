//! The playback engine: owns the clock, the cache, and the pipeline stages,
//! and presents the playback control surface to the embedding.
//!
//! Usage:
//! - Construct with a GPU backend and an AV1 decoder factory.
//! - Call [`PlaybackEngine::open`] with an input stream to start loading.
//! - Call [`PlaybackEngine::update`] once per rendered frame (with zero
//!   elapsed time while paused), then [`PlaybackEngine::create_render_lock`]
//!   to obtain the frames to draw.

use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::av1::Av1DecoderFactory;
use crate::backend::GpuFrameBackend;
use crate::buffering::{BufferingController, BufferingInputs, UNBOUNDED_REMAINING_FRAMES};
use crate::cache::{DecodedFrameCache, ReadLockedFrame};
use crate::clock::{FrameIterator, PlaybackClock, PlaybackMode};
use crate::reader::FileReader;
use crate::render_lock::RenderLock;
use crate::stages::{
    AsyncLoadState, ContentStage, ReadingStage, SharedCache, SharedVideoInfo, TransferStage,
    VideoInfo, VideoStage,
};
use crate::stages::reading::LoadStateCell;
use crate::stream::InputStream;

/// Default number of decoded frames the cache holds.
pub const DEFAULT_CACHE_CAPACITY: usize = 30;

struct StageSet {
    reading: ReadingStage,
    video: VideoStage,
    content: ContentStage,
    transfer: TransferStage,
}

impl StageSet {
    fn request_exit_all(&self) {
        self.reading.request_exit();
        self.video.request_exit();
        self.content.request_exit();
        self.transfer.request_exit();
    }

    fn all_finished(&self) -> bool {
        self.reading.is_finished()
            && self.video.is_finished()
            && self.content.is_finished()
            && self.transfer.is_finished()
    }

    fn join_all(&self) {
        self.reading.join();
        self.video.join();
        self.content.join();
        self.transfer.join();
    }

    /// Clears all stage work queues, for seeks and video switches. If called
    /// while the clock is locked, the reading stage is guaranteed not to
    /// queue further frames until the clock is unlocked.
    fn clear_work_queues(&self) {
        self.reading.abort_current_frames();
        self.video.clear_queue_and_abort_current_frames();
        self.content.clear_queues();
        // Transfer items point into cache slots; stale ones after a cache
        // invalidation caused issues, so the transfer queue is cleared too.
        self.transfer.clear_queue(false);
    }
}

/// Plays one volumetric video: parses the container, pipelines frame
/// decoding, and exposes read-locked frames to the renderer.
pub struct PlaybackEngine {
    backend: Arc<dyn GpuFrameBackend>,
    av1_factory: Arc<dyn Av1DecoderFactory>,

    clock: Arc<PlaybackClock>,
    load_state: Arc<LoadStateCell>,
    video_info: SharedVideoInfo,
    shared_cache: SharedCache,
    stages: Option<StageSet>,

    buffering: BufferingController,

    /// Read locks backing the currently displayed frame triple. Kept across
    /// failed re-locks so the previous frame stays displayable.
    frames_locked_for_rendering: Vec<ReadLockedFrame>,
    /// True while the held render locks belong to a previous video during a
    /// deferred switch.
    locks_from_previous_video: bool,
    current_intra_frame_time: f32,

    cache_capacity: usize,
    cache_all_frames: bool,

    /// The stream to switch to on a later `update`, once the old video's
    /// stages exited.
    pending_stream: Option<(Arc<dyn InputStream>, bool, bool)>,

    /// Ring cursor over the backend's in-flight deformation state buffers.
    render_buffer_cursor: usize,

    opened: bool,
}

impl PlaybackEngine {
    pub fn new(
        cache_capacity: usize,
        backend: Arc<dyn GpuFrameBackend>,
        av1_factory: Arc<dyn Av1DecoderFactory>,
    ) -> Self {
        Self {
            backend,
            av1_factory,
            clock: Arc::new(PlaybackClock::new()),
            load_state: Arc::new(LoadStateCell::new(AsyncLoadState::Error)),
            video_info: Arc::new(Mutex::new(None)),
            shared_cache: Arc::new(Mutex::new(None)),
            stages: None,
            buffering: BufferingController::new(),
            frames_locked_for_rendering: Vec::new(),
            locks_from_previous_video: false,
            current_intra_frame_time: 0.0,
            cache_capacity,
            cache_all_frames: false,
            pending_stream: None,
            render_buffer_cursor: 0,
            opened: false,
        }
    }

    /// Opens a video from the given input stream and starts the loading
    /// threads. `is_streaming` enables range pre-scheduling on streams that
    /// implement the streaming extension; `cache_all_frames` sizes the cache
    /// to hold the whole video.
    ///
    /// Calling `open` again switches to the new video. The switch is
    /// deferred: the old stages are asked to exit, and one of the following
    /// `update` calls completes the switch once they have. Query
    /// [`PlaybackEngine::switched_to_most_recent_video`] for completion.
    pub fn open(
        &mut self,
        stream: Arc<dyn InputStream>,
        is_streaming: bool,
        cache_all_frames: bool,
    ) {
        self.load_state.set(AsyncLoadState::Loading);

        if let Some(stages) = &self.stages {
            stages.request_exit_all();
            self.pending_stream = Some((stream, is_streaming, cache_all_frames));
            return;
        }

        self.open_impl(stream, is_streaming, cache_all_frames);
    }

    fn open_impl(
        &mut self,
        stream: Arc<dyn InputStream>,
        is_streaming: bool,
        cache_all_frames: bool,
    ) {
        let reader = FileReader::new(stream, is_streaming);
        self.cache_all_frames = cache_all_frames;

        // Metadata, index, and playback range are (re)initialized
        // asynchronously by the reading stage.
        *self.video_info.lock().unwrap() = None;
        *self.shared_cache.lock().unwrap() = None;
        self.clock.set_playback_time_range(0, 0);
        self.clock.seek(0, true);
        self.buffering.start_buffering();

        let transfer = TransferStage::spawn(Arc::clone(&self.backend));
        let content = ContentStage::spawn(Arc::clone(&self.backend), transfer.clone());
        let video = VideoStage::spawn(
            Arc::clone(&self.av1_factory),
            content.clone(),
            Arc::clone(&self.video_info),
        );
        let reading = ReadingStage::spawn(
            reader,
            Arc::clone(&self.clock),
            Arc::clone(&self.shared_cache),
            video.clone(),
            content.clone(),
            Arc::clone(&self.load_state),
            Arc::clone(&self.video_info),
        );

        self.stages = Some(StageSet {
            reading,
            video,
            content,
            transfer,
        });
        self.opened = true;
    }

    fn switch_to_pending_stream(&mut self) {
        let Some((stream, is_streaming, cache_all_frames)) = self.pending_stream.take() else {
            return;
        };
        if let Some(stages) = self.stages.take() {
            stages.join_all();
        }

        // Drop all cached frames of the old video. Held render locks keep
        // their slots alive but are flagged as stale.
        if let Some(cache) = self.shared_cache.lock().unwrap().clone() {
            cache.invalidate_all();
        }
        if !self.frames_locked_for_rendering.is_empty() {
            self.locks_from_previous_video = true;
        }

        debug!("switching to the next video");
        self.open_impl(stream, is_streaming, cache_all_frames);
    }

    /// Advances playback by the given elapsed wall-clock time and refreshes
    /// the frames locked for rendering. Call once per rendered frame, with
    /// zero elapsed time while paused.
    ///
    /// Returns the playback time, or `None` while no video is loaded.
    pub fn update(&mut self, elapsed_ns: i64) -> Option<i64> {
        if !self.opened {
            return None;
        }

        // Execute a queued video switch once the old stages exited.
        if self.pending_stream.is_some()
            && self.stages.as_ref().is_none_or(StageSet::all_finished)
        {
            self.switch_to_pending_stream();
        }

        // While async loading runs, buffer and stay away from the metadata,
        // index, and playback state.
        if self.load_state.get() != AsyncLoadState::Ready {
            self.buffering.update_while_loading();
            return None;
        }

        let Some(info) = self.current_video_info() else {
            return None;
        };

        // Allocate the decoded frame cache once per video, now that the
        // frame count and texture size are known.
        if self.shared_cache.lock().unwrap().is_none() {
            let capacity = if self.cache_all_frames {
                info.index.frame_count()
            } else {
                self.cache_capacity
            };
            let cache = DecodedFrameCache::new(capacity.max(1));
            cache.set_wake_signal(Arc::clone(&self.clock) as _);
            *self.shared_cache.lock().unwrap() = Some(cache);
            if let Some(stages) = &self.stages {
                stages.reading.set_cache_initialized(true);
            }
        }
        let cache = self
            .shared_cache
            .lock()
            .unwrap()
            .clone()
            .expect("cache was just allocated");

        // Leave the buffering state once enough frames are decoded.
        if self.buffering.is_buffering() {
            self.evaluate_buffering(&info, &cache);
        }

        // The clock only advances while not buffering.
        let playback_time = if self.buffering.is_buffering() || elapsed_ns == 0 {
            self.clock.playback_time()
        } else {
            self.clock.advance(elapsed_ns)
        };

        let Some(current_frame) = info.index.find_frame_index_for_timestamp(playback_time) else {
            error!(playback_time, "playback time does not map to a frame");
            return Some(playback_time);
        };

        // Lock the display frame and its dependencies for rendering. Locking
        // frames that are already locked succeeds: read locks are shared.
        let frames = display_frame_set(&info, current_frame);
        if let Some(locks) = cache.lock_for_reading(&frames) {
            self.frames_locked_for_rendering = locks;
            self.locks_from_previous_video = false;

            let frame_start = info.index.at(current_frame).timestamp();
            let frame_end = info.index.at(current_frame + 1).timestamp();
            self.current_intra_frame_time = (((playback_time - frame_start) as f64)
                / ((frame_end - frame_start).max(1) as f64))
                .clamp(0.0, 1.0) as f32;
        } else {
            // The frames needed for display are not available. Drop the
            // stale read locks: with a small cache they can pin every slot
            // the decoder would need to make progress, and the render lock
            // turning `None` is the defined buffering signal anyway.
            self.frames_locked_for_rendering.clear();
            if !self.buffering.is_buffering() {
                debug!(current_frame, "starting buffering: display frames not cached");
                self.buffering.start_buffering();
            }
        }

        Some(playback_time)
    }

    /// Seeks to the given time with the given playback direction.
    ///
    /// Beyond moving the clock, this aborts in-flight frame reads, clears
    /// the decode queues, and enters buffering if the seek target is not
    /// ready, so the pipeline converges on the new position quickly.
    pub fn seek(&mut self, timestamp: i64, forward: bool) {
        let Some(stages) = &self.stages else {
            return;
        };

        // Holding the clock lock keeps the reading stage from re-reading
        // outdated frames between the queue clearing and the actual seek.
        let changed = {
            let mut clock_state = self.clock.lock();
            stages.clear_work_queues();
            clock_state.seek(timestamp, forward)
        };
        if changed {
            self.clock.notify_change();
        }

        if self.load_state.get() != AsyncLoadState::Ready {
            return;
        }
        let info = self.current_video_info();
        let cache = self.shared_cache.lock().unwrap().clone();
        if let (Some(info), Some(cache)) = (info, cache) {
            if !self.buffering.is_buffering() && self.evaluate_buffering(&info, &cache) {
                debug!("starting buffering: too few frames ready after seeking");
                self.buffering.start_buffering();
            }
        }
    }

    /// Read-locks the current display frame triple and returns it as a
    /// self-contained render lock, or `None` if the frames are not decoded
    /// yet (the signal to show buffering instead of a frame).
    pub fn create_render_lock(&mut self) -> Option<RenderLock> {
        if self.frames_locked_for_rendering.is_empty() {
            return None;
        }

        let locks = self.frames_locked_for_rendering.clone();
        let dst_buffer_index = self.render_buffer_cursor;
        self.render_buffer_cursor =
            (self.render_buffer_cursor + 1) % self.backend.frames_in_flight().max(1);

        Some(RenderLock::new(
            locks,
            self.current_intra_frame_time,
            dst_buffer_index,
            Arc::clone(&self.backend),
        ))
    }

    /// Whether the frame at the current playback time is decoded and ready
    /// for display; useful for polling after a seek. Returns true for
    /// out-of-range playback times so that pollers cannot hang.
    pub fn is_current_frame_display_ready(&mut self) -> bool {
        if !self.switched_to_most_recent_video() {
            return false;
        }
        let Some(info) = self.current_video_info() else {
            return false;
        };
        let Some(cache) = self.shared_cache.lock().unwrap().clone() else {
            return false;
        };

        let playback_time = self.clock.playback_time();
        let Some(current_frame) = info.index.find_frame_index_for_timestamp(playback_time) else {
            return true;
        };

        let frames = display_frame_set(&info, current_frame);
        match cache.lock_for_reading(&frames) {
            Some(locks) => {
                self.frames_locked_for_rendering = locks;
                true
            }
            None => false,
        }
    }

    /// Whether, after a repeated `open`, the switch to the newest video has
    /// completed and one of its frames is displayable.
    pub fn switched_to_most_recent_video(&self) -> bool {
        self.pending_stream.is_none()
            && self.load_state.get() == AsyncLoadState::Ready
            && !self.locks_from_previous_video
            && !self.frames_locked_for_rendering.is_empty()
    }

    // --- Playback control surface ---

    pub fn async_load_state(&self) -> AsyncLoadState {
        self.load_state.get()
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.is_buffering()
    }

    pub fn buffering_indicator_should_be_shown(&self) -> bool {
        self.buffering.indicator_visible()
    }

    pub fn buffering_progress_percent(&self) -> f32 {
        self.buffering.progress_percent()
    }

    pub fn set_playback_mode(&self, mode: PlaybackMode) {
        self.clock.set_playback_mode(mode);
    }

    pub fn set_playback_speed(&self, speed: f64) {
        self.clock.set_playback_speed(speed);
    }

    pub fn playback_time(&self) -> i64 {
        self.clock.playback_time()
    }

    pub fn playing_forward(&self) -> bool {
        self.clock.playing_forward()
    }

    pub fn clock(&self) -> &Arc<PlaybackClock> {
        &self.clock
    }

    /// The loaded video's metadata and index. Only available once the load
    /// state is ready.
    pub fn video_info(&self) -> Option<Arc<VideoInfo>> {
        if self.load_state.get() != AsyncLoadState::Ready {
            return None;
        }
        self.current_video_info()
    }

    fn current_video_info(&self) -> Option<Arc<VideoInfo>> {
        self.video_info.lock().unwrap().clone()
    }

    /// Gathers the buffering inputs and evaluates the controller. Returns
    /// true if (continued) buffering is warranted.
    fn evaluate_buffering(&mut self, info: &Arc<VideoInfo>, cache: &DecodedFrameCache) -> bool {
        let (progress, playback_time, speed, mode, forward) = {
            let clock_state = self.clock.lock();
            let progress = FrameIterator::new(&clock_state, &info.index)
                .map(|iter| cache.check_decoding_progress(&iter))
                .unwrap_or_default();
            (
                progress,
                clock_state.playback_time(),
                clock_state.speed(),
                clock_state.mode(),
                clock_state.playing_forward(),
            )
        };

        let (decode_time_samples, average_decode_time_ns) = self
            .stages
            .as_ref()
            .map(|stages| stages.transfer.average_decoding_time())
            .unwrap_or((0, 0));

        let frame_count = info.index.frame_count();
        let remaining_frames_in_video = if mode == PlaybackMode::SingleShot {
            match info.index.find_frame_index_for_timestamp(playback_time) {
                Some(current) if forward => (frame_count - current) as i64,
                Some(current) => current as i64 + 1,
                None => frame_count as i64,
            }
        } else {
            UNBOUNDED_REMAINING_FRAMES
        };

        let remaining_playback_time_ns = if forward {
            (info.index.video_end_timestamp() - playback_time) as f64
        } else {
            (playback_time - info.index.video_start_timestamp()) as f64
        } / speed.max(f64::EPSILON);

        self.buffering.should_buffer(&BufferingInputs {
            progress,
            decode_time_samples,
            average_decode_time_ns,
            cache_capacity: cache.capacity(),
            video_frame_count: frame_count,
            remaining_frames_in_video,
            remaining_playback_time_ns,
        })
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if let Some(stages) = self.stages.take() {
            // Exit order matters: upstream stages first, so nothing refills
            // the queues of a stage that is shutting down. Pending texture
            // promises are aborted by the content stage's exit so its worker
            // cannot block forever.
            stages.request_exit_all();
            stages.join_all();
        }
    }
}

/// The frame set the renderer must lock as a unit: the display frame, its
/// keyframe (if different), and its predecessor (if different from both).
fn display_frame_set(info: &VideoInfo, current_frame: usize) -> Vec<usize> {
    let (keyframe, predecessor) = info.index.find_dependency_frames(current_frame);
    let mut frames = vec![current_frame];
    if let Some(keyframe) = keyframe {
        frames.push(keyframe);
    }
    if let Some(predecessor) = predecessor {
        if Some(predecessor) != keyframe {
            frames.push(predecessor);
        }
    }
    frames
}

#[cfg(test)]
mod tests;
