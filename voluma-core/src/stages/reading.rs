//! Reading stage: loads the file's metadata and index, then reads frame
//! bytes as demanded by the cache admission and feeds both decode stages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{debug, error, warn};
use voluma_shared::chunk::ChunkType;

use crate::cache::WriteLockedFrame;
use crate::clock::{FrameIterator, PlaybackClock};
use crate::codec::read_frame_metadata;
use crate::error::{Result, VolumaError};
use crate::index::FrameIndex;
use crate::reader::FileReader;
use crate::stages::{
    ContentStage, FramePayload, SharedCache, SharedVideoInfo, VideoInfo, VideoStage,
};
use crate::stream::InputStream;

/// How much upcoming video to pre-request from a streaming transport while
/// the reading stage has nothing to decode.
const SECONDS_TO_BUFFER_IN_ADVANCE: f32 = 5.0;

/// Caps one pre-scheduled streaming range request.
const MAX_STREAM_REQUEST_SIZE: u64 = 6 * 1024 * 1024;

/// Backstop for events that do not wake the change condvar.
const IDLE_WAIT_TIMEOUT: Duration = Duration::from_millis(250);

/// State of asynchronously loading a video. The numeric values are part of
/// the embedding API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AsyncLoadState {
    /// Loading is in progress; metadata, index, and playback state must not
    /// be accessed.
    Loading = 0,
    /// Loading failed; the video cannot be displayed.
    Error = 1,
    /// Metadata and index are available. Frames may still be decoding.
    Ready = 2,
}

/// Atomically readable load state shared across threads.
pub struct LoadStateCell(AtomicU8);

impl LoadStateCell {
    pub fn new(state: AsyncLoadState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> AsyncLoadState {
        match self.0.load(Ordering::Acquire) {
            0 => AsyncLoadState::Loading,
            1 => AsyncLoadState::Error,
            _ => AsyncLoadState::Ready,
        }
    }

    pub fn set(&self, state: AsyncLoadState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

struct Shared {
    quit: AtomicBool,
    abort_current_frames: AtomicBool,
    currently_reading: AtomicBool,
    /// Serializes the "check abort, then enqueue" window against abort
    /// requests.
    abort_mutex: Mutex<()>,
    streaming_mutex: Mutex<()>,

    /// The cache is allocated on the update side once the texture size is
    /// known; reading frames waits for that handshake.
    cache_initialized: Mutex<bool>,
    cache_initialized_cond: Condvar,

    clock: Arc<PlaybackClock>,
    cache: SharedCache,
    video: VideoStage,
    content: ContentStage,
    load_state: Arc<LoadStateCell>,
    video_info: SharedVideoInfo,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the reading stage worker. Clones share the same stage.
#[derive(Clone)]
pub struct ReadingStage {
    shared: Arc<Shared>,
    stream: Arc<dyn InputStream>,
    uses_streaming: bool,
}

impl ReadingStage {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        reader: FileReader,
        clock: Arc<PlaybackClock>,
        cache: SharedCache,
        video: VideoStage,
        content: ContentStage,
        load_state: Arc<LoadStateCell>,
        video_info: SharedVideoInfo,
    ) -> Self {
        let stream = Arc::clone(reader.stream());
        let uses_streaming = reader.uses_streaming();

        let shared = Arc::new(Shared {
            quit: AtomicBool::new(false),
            abort_current_frames: AtomicBool::new(false),
            currently_reading: AtomicBool::new(false),
            abort_mutex: Mutex::new(()),
            streaming_mutex: Mutex::new(()),
            cache_initialized: Mutex::new(false),
            cache_initialized_cond: Condvar::new(),
            clock,
            cache,
            video,
            content,
            load_state,
            video_info,
            worker: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("voluma-reading".into())
            .spawn(move || worker_main(worker_shared, reader))
            .expect("failed to spawn the reading stage thread");
        *shared.worker.lock().unwrap() = Some(handle);

        Self {
            shared,
            stream,
            uses_streaming,
        }
    }

    /// Signals that the decoded frame cache has been (de)allocated. Frame
    /// reading only starts once the cache exists.
    pub fn set_cache_initialized(&self, initialized: bool) {
        {
            let mut flag = self.shared.cache_initialized.lock().unwrap();
            *flag = initialized;
        }
        if initialized {
            self.shared.cache_initialized_cond.notify_all();
        }
    }

    /// Aborts reading the current range of frames (used when seeking).
    ///
    /// If this is called while the clock is locked, the reading stage will
    /// not read or queue any further frames until the clock is unlocked. A
    /// blocked read is woken through the input stream, and pending streaming
    /// range requests are dropped.
    pub fn abort_current_frames(&self) {
        {
            let _window = self.shared.abort_mutex.lock().unwrap();
            self.shared
                .abort_current_frames
                .store(true, Ordering::Release);
        }

        self.stream.abort_read();

        if self.uses_streaming {
            let _streaming = self.shared.streaming_mutex.lock().unwrap();
            if let Some(streaming) = self.stream.streaming() {
                streaming.drop_pending_requests();
            }
        }
    }

    pub fn request_exit(&self) {
        {
            // Holding both locks guarantees the worker observes the flag
            // before blocking on either condvar.
            let _init = self.shared.cache_initialized.lock().unwrap();
            let _clock = self.shared.clock.lock();
            self.shared.quit.store(true, Ordering::Release);
        }
        self.shared.clock.notify_change();
        self.shared.cache_initialized_cond.notify_all();

        // Wake a read that may be stalled on a slow or dropped connection.
        while self.shared.currently_reading.load(Ordering::Acquire) {
            self.stream.abort_read();
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared
            .worker
            .lock()
            .unwrap()
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    pub fn join(&self) {
        let handle = self.shared.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn worker_main(shared: Arc<Shared>, mut reader: FileReader) {
    // On startup, read the file's metadata and index and publish them.
    shared.currently_reading.store(true, Ordering::Release);
    let startup = read_file_metadata_and_index(&shared, &mut reader);
    shared.currently_reading.store(false, Ordering::Release);

    let info = match startup {
        Ok(info) => info,
        Err(e) => {
            if !e.is_aborted() {
                error!(error = %e, "loading the video's metadata and index failed");
            }
            shared.load_state.set(AsyncLoadState::Error);
            return;
        }
    };

    // Wait for the update side to allocate the decoded frame cache; its size
    // depends on the frame count published above.
    {
        let mut initialized = shared.cache_initialized.lock().unwrap();
        while !*initialized && !shared.quit.load(Ordering::Acquire) {
            initialized = shared.cache_initialized_cond.wait(initialized).unwrap();
        }
    }
    let Some(cache) = shared.cache.lock().unwrap().clone() else {
        // Only reachable through an exit request before the cache existed.
        return;
    };

    // Main loop, reading frames as needed.
    while !shared.quit.load(Ordering::Acquire) {
        let mut clock_state = shared.clock.lock();

        let locks = match FrameIterator::new(&clock_state, &info.index) {
            Some(iter) => cache.lock_for_decoding_next(&iter),
            None => SmallVec::new(),
        };

        // Re-check under the clock lock so an exit request cannot slip in
        // between the admission and blocking below.
        if shared.quit.load(Ordering::Acquire) {
            break;
        }

        if locks.is_empty() {
            // Nothing to decode. For streamed sources, pre-request upcoming
            // ranges before blocking, to ride out unreliable connections.
            if reader.streaming().is_some() {
                if let Some(iter) = FrameIterator::new(&clock_state, &info.index) {
                    drop(clock_state);
                    {
                        let _streaming = shared.streaming_mutex.lock().unwrap();
                        if !shared.abort_current_frames.load(Ordering::Acquire) {
                            pre_schedule_frames_for_streaming(&reader, iter);
                        }
                    }
                    clock_state = shared.clock.lock();
                    if shared.quit.load(Ordering::Acquire) {
                        break;
                    }
                }
            }

            // Woken by clock changes and by read-lock releases (via the
            // cache's wake signal). The timeout is a backstop against any
            // release path that bypasses the signal; without it, buffering
            // could starve waiting for slots that were freed silently.
            drop(shared.clock.wait_timeout(clock_state, IDLE_WAIT_TIMEOUT));
        } else {
            shared.abort_current_frames.store(false, Ordering::Release);
            drop(clock_state);

            read_frames_for_decoding(&shared, &mut reader, &info, locks);
        }
    }
}

fn read_file_metadata_and_index(shared: &Shared, reader: &mut FileReader) -> Result<Arc<VideoInfo>> {
    let quit = || shared.quit.load(Ordering::Acquire);

    let metadata = reader.read_metadata()?;
    if quit() {
        return Err(VolumaError::Aborted);
    }

    // Load the frame index from the index chunk if present, or compile it
    // from the frame data (slow).
    let index = if reader.find_next_chunk(ChunkType::Index)? {
        if quit() {
            return Err(VolumaError::Aborted);
        }
        FrameIndex::from_index_chunk(reader)?
    } else {
        warn!("the file has no index chunk; scanning all frames to build an index, this may be slow");

        let mut index = FrameIndex::new();
        let mut bytes = Vec::new();
        let mut last_end_timestamp = i64::MIN;

        reader.seek(0)?;
        loop {
            let Some(offset) = reader.read_next_frame(&mut bytes)? else {
                break;
            };
            let (frame_metadata, _) = read_frame_metadata(&bytes)?;
            index.push_frame(frame_metadata.start_timestamp, offset, frame_metadata.is_keyframe);
            last_end_timestamp = frame_metadata.end_timestamp;

            if quit() {
                return Err(VolumaError::Aborted);
            }
        }
        index.push_video_end(last_end_timestamp, reader.file_offset());
        index
    };

    if index.frame_count() == 0 {
        return Err(VolumaError::Truncated("the video contains no frames"));
    }
    if !index.at(0).is_keyframe() {
        return Err(VolumaError::MissingKeyframe);
    }

    // Peek into the first frame to learn the video's texture size, which the
    // update side needs to allocate frame resources.
    reader.seek(index.at(0).offset())?;
    let mut bytes = Vec::new();
    if reader.read_next_frame(&mut bytes)?.is_none() {
        return Err(VolumaError::Truncated("the video's first frame"));
    }
    let (first_frame, _) = read_frame_metadata(&bytes)?;

    let info = Arc::new(VideoInfo {
        metadata,
        index,
        texture_width: first_frame.texture_width,
        texture_height: first_frame.texture_height,
    });
    *shared.video_info.lock().unwrap() = Some(Arc::clone(&info));

    // Seed the clock with the video's time range.
    shared.clock.set_playback_time_range(
        info.index.video_start_timestamp(),
        info.index.video_end_timestamp(),
    );
    shared
        .clock
        .seek(info.index.video_start_timestamp(), true);

    shared.load_state.set(AsyncLoadState::Ready);
    Ok(info)
}

fn invalidate_all(pending: &mut VecDeque<WriteLockedFrame>) {
    for guard in pending.drain(..) {
        guard.invalidate();
    }
}

/// Reads the frames required to decode the locked cache items and queues
/// them to both decode stages.
///
/// The decoders are stateful across frames, so decoding must proceed
/// sequentially from a keyframe. Starting from the lowest locked frame, this
/// walks back to its base keyframe, or stops early at `last queued + 1` if
/// the pipeline state is already positioned there. Frames read along the way
/// that have no cache slot are queued with no slot handle, decoding them
/// only to advance the decoder state.
fn read_frames_for_decoding(
    shared: &Shared,
    reader: &mut FileReader,
    info: &Arc<VideoInfo>,
    locks: SmallVec<[WriteLockedFrame; 3]>,
) {
    let index = &info.index;

    let content_last = shared.content.last_frame_queued();
    let video_last = shared.video.last_frame_queued();
    if content_last != video_last {
        // Should be rare; it forces a restart from the keyframe below.
        warn!(
            ?content_last,
            ?video_last,
            "decode stages disagree about the last queued frame"
        );
    }
    let successive = if content_last == video_last {
        content_last.map_or(0, |last| last + 1)
    } else {
        0
    };

    let min_frame = locks.iter().map(WriteLockedFrame::frame_index).min();
    let max_frame = locks.iter().map(WriteLockedFrame::frame_index).max();
    let (Some(min_frame), Some(max_frame)) = (min_frame, max_frame) else {
        return;
    };

    let mut start_frame = min_frame;
    while start_frame > 0 && start_frame != successive && !index.at(start_frame).is_keyframe() {
        start_frame -= 1;
    }

    debug!(start_frame, min_frame, max_frame, "reading frame range");

    let mut pending: VecDeque<WriteLockedFrame> = locks.into_iter().collect();

    for current_frame in start_frame..=max_frame {
        let reading_start = Instant::now();

        if let Err(e) = reader.seek(index.at(current_frame).offset()) {
            error!(current_frame, error = %e, "seeking to frame failed");
            invalidate_all(&mut pending);
            return;
        }

        let mut bytes = Vec::new();
        shared.currently_reading.store(true, Ordering::Release);
        let read_result = if shared.quit.load(Ordering::Acquire) {
            Ok(None)
        } else {
            reader.read_next_frame(&mut bytes)
        };
        shared.currently_reading.store(false, Ordering::Release);

        match read_result {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                if !shared.quit.load(Ordering::Acquire)
                    && !shared.abort_current_frames.load(Ordering::Acquire)
                {
                    error!(current_frame, "failed to read frame");
                }
                invalidate_all(&mut pending);
                return;
            }
        }

        let guard = if pending.front().map(WriteLockedFrame::frame_index) == Some(current_frame) {
            pending.pop_front()
        } else {
            None
        };

        let reading_time_ns = reading_start.elapsed().as_nanos() as i64;
        debug!(
            current_frame,
            read_ms = reading_time_ns / 1_000_000,
            "frame read"
        );

        // The enqueue must be atomic against abort requests: after the
        // slow part (reading) finished, re-check the abort flags and queue
        // both stages inside the same window.
        {
            let _window = shared.abort_mutex.lock().unwrap();

            if shared.quit.load(Ordering::Acquire)
                || shared.abort_current_frames.load(Ordering::Acquire)
            {
                debug!(current_frame, "aborting the current frame range");
                if let Some(guard) = guard {
                    guard.invalidate();
                }
                invalidate_all(&mut pending);
                break;
            }

            let (frame_metadata, content_offset) = match read_frame_metadata(&bytes) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!(current_frame, error = %e, "parsing frame metadata failed");
                    if let Some(guard) = guard {
                        guard.invalidate();
                    }
                    invalidate_all(&mut pending);
                    break;
                }
            };

            let payload = FramePayload {
                frame_index: current_frame,
                metadata: Arc::new(frame_metadata),
                data: Arc::new(bytes),
                content_offset,
            };

            if !shared.video.queue_frame(payload.clone()) {
                // A queue clear between frames left the video decoder in a
                // state that cannot accept this dependent frame.
                if let Some(guard) = guard {
                    guard.invalidate();
                }
                invalidate_all(&mut pending);
                break;
            }

            if !shared.content.queue_frame(payload, reading_time_ns, guard) {
                invalidate_all(&mut pending);
                break;
            }
        }
    }
}

/// Requests the byte ranges of roughly the next five seconds of playback
/// from the streaming transport, merging adjacent frames into single
/// requests.
fn pre_schedule_frames_for_streaming(reader: &FileReader, mut iter: FrameIterator) {
    let Some(streaming) = reader.streaming() else {
        return;
    };
    let index = iter.index();

    let nanoseconds_to_buffer = (SECONDS_TO_BUFFER_IN_ADVANCE as f64 * 1e9) as i64;
    // Bounds the loop in case the time criterion is never reached.
    let max_lookahead_frames = (30.0 * SECONDS_TO_BUFFER_IN_ADVANCE + 0.5) as usize;

    let mut scheduled: Option<(u64, u64)> = None;
    let mut buffered_ns = 0i64;
    let mut lookahead_frames = 0usize;

    loop {
        let frame = iter.current();
        let range_from = index.at(frame).offset();
        let range_to = index.at(frame + 1).offset() - 1;

        // Grow the scheduled range while frames are adjacent; flush it when a
        // gap appears. Dependency frames are ignored here: their data is
        // almost always already available or requested.
        match &mut scheduled {
            None => scheduled = Some((range_from, range_to)),
            Some((from, to)) => {
                if range_from == *to + 1 {
                    *to = range_to;
                } else if range_to + 1 == *from {
                    *from = range_from;
                } else {
                    streaming.stream_range(*from, *to, true, MAX_STREAM_REQUEST_SIZE);
                    scheduled = Some((range_from, range_to));
                }
            }
        }

        buffered_ns += index.at(frame + 1).timestamp() - index.at(frame).timestamp();
        if buffered_ns >= nanoseconds_to_buffer {
            break;
        }

        lookahead_frames += 1;
        if lookahead_frames >= max_lookahead_frames {
            break;
        }

        iter.advance();
        if iter.at_end() {
            break;
        }
    }

    if let Some((from, to)) = scheduled {
        streaming.stream_range(from, to, true, MAX_STREAM_REQUEST_SIZE);
    }
}
