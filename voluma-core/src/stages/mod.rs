//! The four-stage frame pipeline.
//!
//! Architecture:
//! - The reading stage picks the next frames to decode (driven by the cache
//!   admission), reads their bytes, and feeds both decode stages.
//! - The video-decode stage turns texture payloads into pictures and hands
//!   them to the content-decode stage through per-frame texture promises.
//! - The content-decode stage decompresses geometry and deformation state
//!   into write-locked cache slots, waits for the texture, and starts the
//!   GPU upload.
//! - The transfer stage waits for upload completion, releases the write
//!   locks, and keeps the rolling decode-latency estimate.
//!
//! Every stage is one OS thread with a mutex/condvar work queue and atomic
//! quit/abort flags; cancellation is always cooperative.

pub mod content;
pub mod reading;
pub mod transfer;
pub mod video;

use std::sync::{Arc, Mutex};

use voluma_shared::metadata::VideoMetadata;

use crate::cache::DecodedFrameCache;
use crate::codec::FrameMetadata;
use crate::index::FrameIndex;

pub use content::ContentStage;
pub use reading::{AsyncLoadState, ReadingStage};
pub use transfer::TransferStage;
pub use video::VideoStage;

/// Everything the reading stage learns about a video at startup: the file
/// metadata (if present), the frame index, and the texture dimensions peeked
/// from the first frame.
#[derive(Debug)]
pub struct VideoInfo {
    pub metadata: Option<VideoMetadata>,
    pub index: FrameIndex,
    pub texture_width: u32,
    pub texture_height: u32,
}

/// Holder for the asynchronously loaded [`VideoInfo`], shared between the
/// reading stage (writer) and everyone else (readers, only after the load
/// state turned ready).
pub type SharedVideoInfo = Arc<Mutex<Option<Arc<VideoInfo>>>>;

/// Holder for the decoded frame cache. The cache is allocated on the update
/// side only after loading finished (its size may depend on the frame
/// count), so the reading stage receives it through this slot, gated by the
/// cache-initialized handshake.
pub type SharedCache = Arc<Mutex<Option<DecodedFrameCache>>>;

/// One frame's bytes and parsed metadata, shared between the decode stages.
#[derive(Clone)]
pub struct FramePayload {
    pub frame_index: usize,
    pub metadata: Arc<FrameMetadata>,
    /// The complete frame chunk payload.
    pub data: Arc<Vec<u8>>,
    /// Offset of the encoded content within `data` (after the headers).
    pub content_offset: usize,
}

impl FramePayload {
    /// The frame's texture bytes: the AV1 chunk or the zstd RGB blob.
    pub fn texture_bytes(&self) -> &[u8] {
        let start = self.content_offset
            + self.metadata.compressed_mesh_size as usize
            + self.metadata.compressed_deformation_state_size as usize;
        &self.data[start..start + self.metadata.compressed_texture_size as usize]
    }

    /// The frame's content (everything decode_content consumes).
    pub fn content_bytes(&self) -> &[u8] {
        &self.data[self.content_offset..]
    }
}
