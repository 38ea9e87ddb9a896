//! Content-decode stage: decompresses geometry and deformation state into
//! write-locked cache slots, pairs each frame with its texture via a
//! [`TextureFramePromise`], and starts the GPU upload.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::backend::GpuFrameBackend;
use crate::cache::WriteLockedFrame;
use crate::codec::{self, DecodingContext};
use crate::error::{Result, VolumaError};
use crate::promise::{PromiseStatus, TextureFramePromise, TexturePayload};
use crate::stages::{FramePayload, TransferStage};

struct WorkItem {
    payload: FramePayload,
    /// Time it took to read the compressed frame data, for the latency
    /// estimate.
    reading_time_ns: i64,
    /// The slot to decode into, or `None` when the frame is decoded only to
    /// advance the (stateful) decoders.
    guard: Option<WriteLockedFrame>,
    /// The last frame queued before this one; restores the contiguity state
    /// when the queue is cleared.
    previous_queued: Option<usize>,
}

#[derive(Default)]
struct WorkQueue {
    items: VecDeque<WorkItem>,
    last_frame_queued: Option<usize>,
}

/// Texture pairing state. Pictures and work items arrive independently; this
/// matches them up FIFO by frame index.
#[derive(Default)]
struct TextureQueue {
    /// Textures that arrived before their work item.
    pending: VecDeque<(usize, TexturePayload)>,
    /// Promise registered by an in-progress work item waiting for its
    /// texture, with the expected frame index.
    current: Option<(usize, TextureFramePromise)>,
    /// Set by queue clearing; the in-progress item must not register a new
    /// promise afterwards, because its texture was discarded.
    abort_current: bool,
}

struct Shared {
    // Lock order: `queue` before `textures`, never the other way around.
    queue: Mutex<WorkQueue>,
    work_available: Condvar,
    textures: Mutex<TextureQueue>,
    quit: AtomicBool,
    backend: Arc<dyn GpuFrameBackend>,
    transfer: TransferStage,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the content-decode stage worker. Clones share the same stage.
#[derive(Clone)]
pub struct ContentStage {
    shared: Arc<Shared>,
}

impl ContentStage {
    pub fn spawn(backend: Arc<dyn GpuFrameBackend>, transfer: TransferStage) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(WorkQueue::default()),
            work_available: Condvar::new(),
            textures: Mutex::new(TextureQueue::default()),
            quit: AtomicBool::new(false),
            backend,
            transfer,
            worker: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("voluma-content".into())
            .spawn(move || worker_main(worker_shared))
            .expect("failed to spawn the content-decode stage thread");
        *shared.worker.lock().unwrap() = Some(handle);

        Self { shared }
    }

    /// Queues a frame for content decoding.
    ///
    /// Fails for a dependent frame that is not contiguous with the last
    /// queued frame: the decoding state after working through the queue would
    /// not match (this can happen even with in-order queuing, because the
    /// queue may have been cleared in between). The guard is invalidated in
    /// that case.
    pub fn queue_frame(
        &self,
        payload: FramePayload,
        reading_time_ns: i64,
        guard: Option<WriteLockedFrame>,
    ) -> bool {
        let mut queue = self.shared.queue.lock().unwrap();

        if !payload.metadata.is_keyframe
            && Some(payload.frame_index) != queue.last_frame_queued.map(|last| last + 1)
        {
            warn!(
                frame_index = payload.frame_index,
                last_queued = ?queue.last_frame_queued,
                "refusing to queue a non-contiguous dependent frame for content decode"
            );
            if let Some(guard) = guard {
                guard.invalidate();
            }
            return false;
        }

        let previous_queued = queue.last_frame_queued;
        queue.last_frame_queued = Some(payload.frame_index);
        queue.items.push_back(WorkItem {
            payload,
            reading_time_ns,
            guard,
            previous_queued,
        });

        drop(queue);
        self.shared.work_available.notify_one();
        true
    }

    /// Called by the video-decode stage to deliver one frame's texture.
    ///
    /// If the in-progress work item already registered a promise for this
    /// frame, the texture fulfills it; a frame-index mismatch aborts the
    /// promise and drops the texture (both sides resync after the next
    /// keyframe). Otherwise the texture waits for its work item.
    pub fn queue_texture(&self, frame_index: usize, payload: TexturePayload) {
        let mut textures = self.shared.textures.lock().unwrap();

        if let Some((expected, promise)) = textures.current.take() {
            if expected == frame_index {
                promise.fulfill(payload);
            } else {
                error!(
                    expected,
                    received = frame_index,
                    "texture arrived for an unexpected frame; aborting both sides"
                );
                promise.abort();
            }
        } else {
            textures.pending.push_back((frame_index, payload));
        }
    }

    /// The last frame index queued, for the reading stage's contiguity
    /// bookkeeping.
    pub fn last_frame_queued(&self) -> Option<usize> {
        self.shared.queue.lock().unwrap().last_frame_queued
    }

    /// Drops all queued work and pending textures, invalidating queued cache
    /// slots and aborting the in-progress frame's open promise.
    pub fn clear_queues(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        {
            let mut textures = self.shared.textures.lock().unwrap();

            // The in-progress item must not create a promise for texture data
            // that no longer exists.
            textures.abort_current = true;

            if let Some((_, promise)) = textures.current.take() {
                if promise.status() == PromiseStatus::Open {
                    promise.abort();
                }
            }
            textures.pending.clear();
        }

        if let Some(front) = queue.items.front() {
            queue.last_frame_queued = front.previous_queued;
        }
        for item in queue.items.drain(..) {
            if let Some(guard) = item.guard {
                guard.invalidate();
            }
        }
    }

    pub fn request_exit(&self) {
        {
            let _queue = self.shared.queue.lock().unwrap();
            let mut textures = self.shared.textures.lock().unwrap();
            textures.abort_current = true;
            if let Some((_, promise)) = textures.current.take() {
                if promise.status() == PromiseStatus::Open {
                    promise.abort();
                }
            }
            self.shared.quit.store(true, Ordering::Release);
        }
        self.shared.work_available.notify_all();
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

fn worker_main(shared: Arc<Shared>) {
    let mut ctx = match DecodingContext::new() {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "failed to initialize the content-decode context");
            return;
        }
    };

    loop {
        let item = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.quit.load(Ordering::Acquire) {
                    return;
                }
                if let Some(item) = queue.items.pop_front() {
                    // A fresh item resets the per-item abort window; aborts
                    // arriving from here on target this item.
                    shared.textures.lock().unwrap().abort_current = false;
                    break item;
                }
                queue = shared.work_available.wait(queue).unwrap();
            }
        };

        process_item(&shared, &mut ctx, item);
    }
}

fn process_item(shared: &Shared, ctx: &mut DecodingContext, item: WorkItem) {
    let frame_index = item.payload.frame_index;

    // Acquire the frame's texture promise: pre-fulfilled if the texture
    // already arrived, otherwise registered for the video stage to fulfill.
    let promise = {
        let mut textures = shared.textures.lock().unwrap();

        if textures.abort_current {
            if let Some(guard) = item.guard {
                guard.invalidate();
            }
            return;
        }

        let pending_frame = textures.pending.front().map(|(frame, _)| *frame);
        match pending_frame {
            None => {
                let promise = TextureFramePromise::new();
                textures.current = Some((frame_index, promise.clone()));
                promise
            }
            Some(pending) if pending == frame_index => {
                let (_, payload) = textures
                    .pending
                    .pop_front()
                    .expect("front was checked above");
                TextureFramePromise::fulfilled(payload)
            }
            Some(pending) => {
                error!(
                    expected = frame_index,
                    pending,
                    "queued texture belongs to an unexpected frame; discarding both"
                );
                textures.pending.pop_front();
                if let Some(guard) = item.guard {
                    guard.invalidate();
                }
                return;
            }
        }
    };

    let Some(guard) = item.guard else {
        // Decode-to-advance-state only: the texture pairing must still be
        // consumed, the result is discarded.
        promise.wait();
        return;
    };

    let decoding_start = Instant::now();

    match decode_into_slot(shared, ctx, &item.payload, &guard, &promise) {
        Ok(token) => {
            let decoding_time_ns = decoding_start.elapsed().as_nanos() as i64;
            debug!(
                frame_index,
                decode_ms = decoding_time_ns / 1_000_000,
                "frame content decoded"
            );
            shared.transfer.queue_frame(
                frame_index,
                item.reading_time_ns,
                decoding_time_ns,
                token,
                guard,
            );
        }
        Err(e) => {
            // Aborted promises are the normal seek/shutdown path, not an
            // error worth reporting.
            if !e.is_aborted() {
                error!(frame_index, error = %e, "frame decode failed");
            }
            // Consume the texture pairing even on failure, so the following
            // frames' pictures keep matching their work items.
            if promise.status() == PromiseStatus::Open {
                promise.wait();
            }
            shared.backend.invalidate_slot(guard.slot_index());
            guard.invalidate();
        }
    }
}

/// Decodes geometry, deformation state, and alpha into the slot, waits for
/// the texture, and starts the GPU upload. Returns the transfer token.
fn decode_into_slot(
    shared: &Shared,
    ctx: &mut DecodingContext,
    payload: &FramePayload,
    guard: &WriteLockedFrame,
    promise: &TextureFramePromise,
) -> Result<crate::backend::TransferToken> {
    let metadata = &*payload.metadata;
    let mut data = guard.data();

    data.metadata = metadata.clone();
    codec::decode_content(payload.content_bytes(), metadata, ctx, &mut data.content)?;

    let texture = promise.wait().ok_or(VolumaError::Aborted)?;
    match texture {
        TexturePayload::Picture(picture) => {
            data.texture.resize(metadata.texture_data_size(), 0);
            codec::copy_texture_from_picture(&picture, &mut data.texture);
        }
        TexturePayload::Rgb(rgb) => {
            if rgb.len() != metadata.texture_data_size() {
                return Err(VolumaError::ZstdDecode(
                    "decompressed RGB texture has an unexpected size".into(),
                ));
            }
            data.texture = rgb;
        }
        TexturePayload::Empty => {
            data.texture.clear();
        }
    }

    shared
        .backend
        .upload_frame_resources(guard.slot_index(), &data)
}
