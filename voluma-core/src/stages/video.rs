//! Video-decode stage: drives the external AV1 decoder and matches decoded
//! pictures to frames.
//!
//! Pictures come out of the decoder in the same order frames are sent in,
//! possibly delayed; a FIFO pairing queue of sent frame indices matches them
//! up. Zstd-RGB textures and empty frames bypass the decoder but flow through
//! the same pairing so ordering is preserved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use crate::av1::{Av1Decoder, Av1DecoderFactory};
use crate::error::{Result, VolumaError};
use crate::promise::TexturePayload;
use crate::stages::{ContentStage, FramePayload, SharedVideoInfo};

struct WorkItem {
    payload: FramePayload,
    /// Restores the contiguity state when the queue is cleared.
    previous_queued: Option<usize>,
}

#[derive(Default)]
struct WorkQueue {
    items: VecDeque<WorkItem>,
    last_frame_queued: Option<usize>,
}

/// A frame whose texture was handed to the decoder (or, for empty frames,
/// queued in order without touching the decoder).
struct PendingFrame {
    frame_index: usize,
    is_empty: bool,
    texture_width: u32,
    texture_height: u32,
}

struct Shared {
    // Lock order: `queue` before `abort`, never the other way around.
    queue: Mutex<WorkQueue>,
    work_available: Condvar,
    /// Gates deliveries to the content stage so that nothing is delivered
    /// after an abort cleared the downstream queues.
    abort: Mutex<bool>,
    quit: AtomicBool,
    content: ContentStage,
    video_info: SharedVideoInfo,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the video-decode stage worker. Clones share the same stage.
#[derive(Clone)]
pub struct VideoStage {
    shared: Arc<Shared>,
}

impl VideoStage {
    pub fn spawn(
        factory: Arc<dyn Av1DecoderFactory>,
        content: ContentStage,
        video_info: SharedVideoInfo,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(WorkQueue::default()),
            work_available: Condvar::new(),
            abort: Mutex::new(false),
            quit: AtomicBool::new(false),
            content,
            video_info,
            worker: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("voluma-video".into())
            .spawn(move || worker_main(worker_shared, factory))
            .expect("failed to spawn the video-decode stage thread");
        *shared.worker.lock().unwrap() = Some(handle);

        Self { shared }
    }

    /// Queues a frame's texture for decoding. Fails for a dependent frame
    /// that is not contiguous with the last queued frame.
    pub fn queue_frame(&self, payload: FramePayload) -> bool {
        let mut queue = self.shared.queue.lock().unwrap();

        if !payload.metadata.is_keyframe
            && Some(payload.frame_index) != queue.last_frame_queued.map(|last| last + 1)
        {
            warn!(
                frame_index = payload.frame_index,
                last_queued = ?queue.last_frame_queued,
                "refusing to queue a non-contiguous dependent frame for video decode"
            );
            return false;
        }

        let previous_queued = queue.last_frame_queued;
        queue.last_frame_queued = Some(payload.frame_index);
        queue.items.push_back(WorkItem {
            payload,
            previous_queued,
        });

        drop(queue);
        self.shared.work_available.notify_one();
        true
    }

    /// The last frame index queued, for the reading stage's contiguity
    /// bookkeeping.
    pub fn last_frame_queued(&self) -> Option<usize> {
        self.shared.queue.lock().unwrap().last_frame_queued
    }

    /// Clears the work queue and tells the worker to flush the decoder
    /// before processing the next frame.
    ///
    /// The decoder requires a keyframe after a flush, so the contiguity
    /// state resets to "keyframes only" instead of continuing after the last
    /// decoded frame.
    pub fn clear_queue_and_abort_current_frames(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        *self.shared.abort.lock().unwrap() = true;

        queue.last_frame_queued = None;
        queue.items.clear();
    }

    pub fn request_exit(&self) {
        self.shared.quit.store(true, Ordering::Release);
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

struct Worker {
    shared: Arc<Shared>,
    decoder: Box<dyn Av1Decoder>,
    /// FIFO of frames inside (or ordered around) the decoder.
    pending: VecDeque<PendingFrame>,
    /// Zstd context, only created upon encountering a zstd-RGB texture.
    zstd: Option<zstd::bulk::Decompressor<'static>>,
}

fn worker_main(shared: Arc<Shared>, factory: Arc<dyn Av1DecoderFactory>) {
    let decoder = match factory.new_decoder() {
        Ok(decoder) => decoder,
        Err(e) => {
            error!(error = %e, "failed to create the AV1 decoder");
            return;
        }
    };

    let mut worker = Worker {
        shared: Arc::clone(&shared),
        decoder,
        pending: VecDeque::new(),
        zstd: None,
    };

    loop {
        let item = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.quit.load(Ordering::Acquire) {
                    return;
                }
                if let Some(item) = queue.items.pop_front() {
                    // An abort since the last item means the decoder holds
                    // state for frames that were dropped; flush it. The next
                    // queued frame is guaranteed to be a keyframe.
                    let mut abort = shared.abort.lock().unwrap();
                    if *abort {
                        worker.decoder.flush();
                        worker.pending.clear();
                    }
                    *abort = false;
                    break item;
                }
                queue = shared.work_available.wait(queue).unwrap();
            }
        };

        worker.process_item(&item);

        // With an empty work queue, drain any delayed pictures from the
        // decoder before waiting for new work. Without this, a nearly-full
        // cache could stall: the reading stage will not queue frames beyond
        // the cache size, and the delayed pictures are needed to fill it.
        let queue_empty = shared.queue.lock().unwrap().items.is_empty();
        if queue_empty {
            if let Err(e) = worker.drain_pictures() {
                if !e.is_aborted() {
                    error!(error = %e, "draining delayed pictures failed");
                }
            }
        }
    }
}

impl Worker {
    fn quit_or_abort(&self) -> bool {
        self.shared.quit.load(Ordering::Acquire) || *self.shared.abort.lock().unwrap()
    }

    fn process_item(&mut self, item: &WorkItem) {
        let payload = &item.payload;
        let metadata = &*payload.metadata;

        // No texture stored: the video frame is empty. Ordering still has to
        // hold, so the empty marker flows through the pairing queue unless
        // nothing is in flight.
        if metadata.compressed_texture_size == 0 {
            if self.pending.is_empty() {
                self.deliver(payload.frame_index, TexturePayload::Empty);
            } else {
                self.pending.push_back(PendingFrame {
                    frame_index: payload.frame_index,
                    is_empty: true,
                    texture_width: metadata.texture_width,
                    texture_height: metadata.texture_height,
                });
            }
            return;
        }

        // Zstd-compressed RGB bypasses the AV1 decoder entirely.
        if metadata.zstd_rgb_texture {
            if let Err(e) = self.process_zstd_texture(payload) {
                error!(frame_index = payload.frame_index, error = %e, "zstd texture decode failed");
            }
            return;
        }

        if let Err(e) = self.process_av1_texture(payload) {
            if !e.is_aborted() {
                error!(frame_index = payload.frame_index, error = %e, "AV1 texture decode failed");
            }
            return;
        }

        // At the end of the stream, drain all pictures the decoder still
        // buffers.
        let frame_count = {
            let info = self.shared.video_info.lock().unwrap();
            info.as_ref().map(|info| info.index.frame_count())
        };
        if frame_count == Some(payload.frame_index + 1) {
            if let Err(e) = self.drain_pictures() {
                if !e.is_aborted() {
                    error!(error = %e, "draining pictures at end of stream failed");
                }
            }
        }
    }

    fn process_av1_texture(&mut self, payload: &FramePayload) -> Result<()> {
        let metadata = &*payload.metadata;

        self.decoder.send_data(payload.texture_bytes())?;
        self.pending.push_back(PendingFrame {
            frame_index: payload.frame_index,
            is_empty: false,
            texture_width: metadata.texture_width,
            texture_height: metadata.texture_height,
        });

        if self.quit_or_abort() {
            return Err(VolumaError::Aborted);
        }

        self.pump_pictures()
    }

    fn process_zstd_texture(&mut self, payload: &FramePayload) -> Result<()> {
        let metadata = &*payload.metadata;
        if self.zstd.is_none() {
            self.zstd = Some(zstd::bulk::Decompressor::new()?);
        }
        let zstd = self.zstd.as_mut().expect("context was just created");

        let mut rgb =
            vec![0u8; metadata.texture_width as usize * metadata.texture_height as usize * 3];
        let n = zstd
            .decompress_to_buffer(payload.texture_bytes(), rgb.as_mut_slice())
            .map_err(|e| VolumaError::ZstdDecode(format!("texture: {e}")))?;
        if n != rgb.len() {
            return Err(VolumaError::ZstdDecode(
                "decompressed texture has an unexpected size".into(),
            ));
        }

        if !self.deliver(payload.frame_index, TexturePayload::Rgb(rgb)) {
            return Err(VolumaError::Aborted);
        }
        Ok(())
    }

    /// Delivers empty frames queued ahead of the next picture.
    fn deliver_leading_empties(&mut self) -> Result<()> {
        while let Some(front) = self.pending.front() {
            if !front.is_empty {
                break;
            }
            let frame_index = front.frame_index;
            self.pending.pop_front();
            if !self.deliver(frame_index, TexturePayload::Empty) {
                return Err(VolumaError::Aborted);
            }
        }
        Ok(())
    }

    /// Fetches available pictures from the decoder and delivers them in
    /// pairing order. Stops when the decoder needs more data.
    fn pump_pictures(&mut self) -> Result<()> {
        loop {
            self.deliver_leading_empties()?;

            let Some(picture) = self.decoder.next_picture()? else {
                break;
            };

            let Some(pending) = self.pending.pop_front() else {
                error!("received a picture but no frame is pending");
                continue;
            };

            if let Err(e) = picture.validate(pending.texture_width, pending.texture_height) {
                // The pairing entry is consumed; the frame is lost and the
                // content stage aborts it on mismatch.
                return Err(e);
            }

            if !self.deliver(pending.frame_index, TexturePayload::Picture(picture)) {
                return Err(VolumaError::Aborted);
            }

            if self.quit_or_abort() {
                return Err(VolumaError::Aborted);
            }
        }

        self.deliver_leading_empties()
    }

    /// Drains every remaining picture (and trailing empty frame) out of the
    /// decoder.
    fn drain_pictures(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            if self.quit_or_abort() {
                return Err(VolumaError::Aborted);
            }

            self.deliver_leading_empties()?;
            if self.pending.is_empty() {
                break;
            }

            let Some(picture) = self.decoder.next_picture()? else {
                debug!(
                    still_pending = self.pending.len(),
                    "decoder returned no further pictures while draining"
                );
                break;
            };

            let pending = self.pending.pop_front().expect("pending cannot be empty here");
            picture.validate(pending.texture_width, pending.texture_height)?;
            if !self.deliver(pending.frame_index, TexturePayload::Picture(picture)) {
                return Err(VolumaError::Aborted);
            }
        }
        Ok(())
    }

    /// Hands a texture to the content stage, unless an abort raced in.
    /// Returns false if the delivery was suppressed.
    fn deliver(&self, frame_index: usize, payload: TexturePayload) -> bool {
        let abort = self.shared.abort.lock().unwrap();
        if *abort {
            return false;
        }
        self.shared.content.queue_texture(frame_index, payload);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GpuFrameBackend;
    use crate::codec::FrameMetadata;
    use crate::stages::TransferStage;
    use crate::test_utils::{FakeAv1DecoderFactory, NullGpuBackend};

    fn payload(frame_index: usize, is_keyframe: bool) -> FramePayload {
        FramePayload {
            frame_index,
            metadata: Arc::new(FrameMetadata {
                is_keyframe,
                ..FrameMetadata::default()
            }),
            data: Arc::new(Vec::new()),
            content_offset: 0,
        }
    }

    struct TestStages {
        video: VideoStage,
        content: ContentStage,
        transfer: TransferStage,
    }

    impl TestStages {
        fn spawn() -> Self {
            let backend: Arc<dyn GpuFrameBackend> = Arc::new(NullGpuBackend::default());
            let transfer = TransferStage::spawn(Arc::clone(&backend));
            let content = ContentStage::spawn(Arc::clone(&backend), transfer.clone());
            let video = VideoStage::spawn(
                Arc::new(FakeAv1DecoderFactory::default()),
                content.clone(),
                Arc::new(Mutex::new(None)),
            );
            Self {
                video,
                content,
                transfer,
            }
        }
    }

    impl Drop for TestStages {
        fn drop(&mut self) {
            self.video.request_exit();
            self.content.request_exit();
            self.transfer.request_exit();
            self.video.join();
            self.content.join();
            self.transfer.join();
        }
    }

    #[test]
    fn test_dependent_frames_must_be_contiguous() {
        let stages = TestStages::spawn();

        // A dependent frame with no keyframe queued before it is refused.
        assert!(!stages.video.queue_frame(payload(1, false)));

        assert!(stages.video.queue_frame(payload(0, true)));
        assert!(stages.video.queue_frame(payload(1, false)));
        // Skipping ahead breaks the decoder state.
        assert!(!stages.video.queue_frame(payload(3, false)));
        // Keyframes are always accepted.
        assert!(stages.video.queue_frame(payload(3, true)));
        assert_eq!(stages.video.last_frame_queued(), Some(3));
    }

    #[test]
    fn test_queue_clear_resets_to_keyframes_only() {
        let stages = TestStages::spawn();

        assert!(stages.video.queue_frame(payload(0, true)));
        assert!(stages.video.queue_frame(payload(1, false)));

        // After a clear the decoder gets flushed, so only a keyframe may
        // follow, even the otherwise-contiguous next frame.
        stages.video.clear_queue_and_abort_current_frames();
        assert!(!stages.video.queue_frame(payload(2, false)));
        assert!(stages.video.queue_frame(payload(2, true)));
    }
}
