//! Shared on-disk format types for Voluma volumetric video files.
//!
//! A volumetric video file is a sequence of typed chunks. Header chunks
//! (metadata, index) appear before all frame chunks; unknown chunk types are
//! skipped by size. This crate defines the wire schemas and their
//! readers/writers; the playback engine in `voluma-core` builds on top of
//! them.

pub mod chunk;
pub mod frame;
pub mod index;
pub mod metadata;
pub mod vertex;

pub use chunk::{CHUNK_HEADER_SIZE, ChunkHeader, ChunkType};
pub use frame::{FRAME_HEADER_SIZE, FrameFlags, FrameHeader, KEYFRAME_HEADER_SIZE, KeyframeHeader};
pub use index::{INDEX_ENTRY_SIZE, INDEX_KEYFRAME_BIT, IndexEntry};
pub use metadata::VideoMetadata;
pub use vertex::{
    MAX_NODES_PER_VERTEX, MeshVertex, NO_ASSIGNED_NODES, dequantize_node_weight,
    normalize_node_weights,
};
