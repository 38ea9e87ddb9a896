//! Transfer stage: waits for GPU upload completion and releases write locks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::backend::{GpuFrameBackend, TransferToken};
use crate::cache::WriteLockedFrame;

/// Rolling window size for the effective decode-latency estimate.
const MAX_DECODE_TIME_SAMPLES: usize = 32;

/// Upper bound on waiting for a single upload fence. Exceeding it is logged
/// and treated as an upload failure for the affected frame.
const UPLOAD_WAIT_CAP: Duration = Duration::from_secs(3);

struct WorkItem {
    /// Used for logging only.
    frame_index: usize,
    reading_time_ns: i64,
    decoding_time_ns: i64,
    token: TransferToken,
    guard: WriteLockedFrame,
}

#[derive(Default)]
struct DecodeTimeStats {
    samples: VecDeque<i64>,
    average_ns: i64,
}

struct Shared {
    queue: Mutex<VecDeque<WorkItem>>,
    work_available: Condvar,
    quit: AtomicBool,
    /// Kept under its own small mutex; written here, read by the buffering
    /// controller.
    stats: Mutex<DecodeTimeStats>,
    backend: Arc<dyn GpuFrameBackend>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the transfer stage worker. Clones share the same stage.
#[derive(Clone)]
pub struct TransferStage {
    shared: Arc<Shared>,
}

impl TransferStage {
    pub fn spawn(backend: Arc<dyn GpuFrameBackend>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            quit: AtomicBool::new(false),
            stats: Mutex::new(DecodeTimeStats::default()),
            backend,
            worker: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("voluma-transfer".into())
            .spawn(move || worker_main(worker_shared))
            .expect("failed to spawn the transfer stage thread");
        *shared.worker.lock().unwrap() = Some(handle);

        Self { shared }
    }

    /// Hands a decoded, still write-locked frame over to await its upload.
    pub fn queue_frame(
        &self,
        frame_index: usize,
        reading_time_ns: i64,
        decoding_time_ns: i64,
        token: TransferToken,
        guard: WriteLockedFrame,
    ) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push_back(WorkItem {
                frame_index,
                reading_time_ns,
                decoding_time_ns,
                token,
                guard,
            });
        }
        self.shared.work_available.notify_one();
    }

    /// Drops all queued frames, invalidating their slots. With
    /// `finish_all_transfers`, in-flight uploads are awaited first so the
    /// backend is quiescent afterwards.
    pub fn clear_queue(&self, finish_all_transfers: bool) {
        let mut queue = self.shared.queue.lock().unwrap();
        for item in queue.drain(..) {
            if finish_all_transfers {
                let _ = self.shared.backend.await_upload(item.token, UPLOAD_WAIT_CAP);
            }
            item.guard.invalidate();
        }
    }

    /// The rolling effective decode-latency estimate: sample count and the
    /// average of `max(read, decode, transfer)` per frame, in nanoseconds.
    pub fn average_decoding_time(&self) -> (usize, i64) {
        let stats = self.shared.stats.lock().unwrap();
        (stats.samples.len(), stats.average_ns)
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

    /// Joins the worker thread. `request_exit` must have been called.
    pub fn join(&self) {
        let handle = self.shared.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn worker_main(shared: Arc<Shared>) {
    loop {
        let item = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.quit.load(Ordering::Acquire) {
                    return;
                }
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                queue = shared.work_available.wait(queue).unwrap();
            }
        };

        process_item(&shared, item);
    }
}

fn process_item(shared: &Shared, item: WorkItem) {
    // The content-decode stage already started the upload; this is only a
    // rough estimate of the transfer time.
    let transfer_start = Instant::now();

    match shared.backend.await_upload(item.token, UPLOAD_WAIT_CAP) {
        Ok(()) => {}
        Err(e) => {
            if transfer_start.elapsed() >= UPLOAD_WAIT_CAP {
                warn!(
                    frame_index = item.frame_index,
                    "upload fence wait exceeded its time cap"
                );
            }
            error!(frame_index = item.frame_index, error = %e, "frame upload failed");
            shared.backend.invalidate_slot(item.guard.slot_index());
            item.guard.invalidate();
            return;
        }
    }

    let transfer_time_ns = transfer_start.elapsed().as_nanos() as i64;

    // Releasing the write lock marks the slot as filled and displayable.
    drop(item.guard);

    // Reading, decoding, and transfer run in parallel across frames, so the
    // effective per-frame decode latency is the maximum of the three.
    let effective_ns = item
        .reading_time_ns
        .max(item.decoding_time_ns)
        .max(transfer_time_ns);
    update_average(shared, effective_ns);

    debug!(
        frame_index = item.frame_index,
        transfer_ms = transfer_time_ns / 1_000_000,
        effective_ms = effective_ns / 1_000_000,
        "frame transferred"
    );
}

fn update_average(shared: &Shared, sample_ns: i64) {
    let mut stats = shared.stats.lock().unwrap();
    if stats.samples.len() >= MAX_DECODE_TIME_SAMPLES {
        stats.samples.pop_front();
    }
    stats.samples.push_back(sample_ns);
    stats.average_ns = stats.samples.iter().sum::<i64>() / stats.samples.len() as i64;
}
