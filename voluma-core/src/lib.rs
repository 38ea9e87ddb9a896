//! Voluma playback engine.
//!
//! Plays volumetric video: time-sequenced 3D meshes with per-frame
//! deformation, textured by a conventional 2D video stream. The engine
//! parses the self-describing container, decodes per-frame geometry and
//! texture data through a four-stage parallel pipeline (read, video decode,
//! content decode, transfer), and hands GPU-ready frames to a renderer
//! through read-locked render locks.
//!
//! GPU upload and drawing go through the [`backend::GpuFrameBackend`] trait;
//! AV1 texture decoding through [`av1::Av1Decoder`]. Both are supplied by
//! the embedding.

pub mod av1;
pub mod backend;
pub mod buffering;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod engine;
pub mod error;
pub mod index;
pub mod promise;
pub mod reader;
pub mod render_lock;
pub mod stages;
pub mod stream;
pub mod test_utils;

pub use backend::{GpuFrameBackend, TransferToken, ViewTransforms};
pub use clock::{PlaybackClock, PlaybackMode};
pub use engine::{DEFAULT_CACHE_CAPACITY, PlaybackEngine};
pub use error::{Result, VolumaError};
pub use render_lock::RenderLock;
pub use stages::AsyncLoadState;
pub use stream::{FileInputStream, InputStream, MemoryInputStream, StreamingInputStream};
