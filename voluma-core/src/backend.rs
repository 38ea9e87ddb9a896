//! GPU backend interface.
//!
//! The engine core is GPU-API agnostic: per-frame GPU resources are owned by
//! a [`GpuFrameBackend`] implementation, keyed by cache slot index. Command
//! recording receives an opaque backend command context per call instead of
//! the backend holding pointers back into the engine.

use std::any::Any;
use std::time::Duration;

use glam::Mat4;

use crate::cache::FrameData;
use crate::error::Result;

/// Opaque handle to an in-flight resource upload.
pub type TransferToken = u64;

/// Model-view and model-view-projection matrices for one view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransforms {
    pub model_view: Mat4,
    pub model_view_projection: Mat4,
}

/// Per-GPU-API implementation of frame resource management and rendering.
///
/// `cmd` parameters carry the backend's command recording context (command
/// buffer, encoder, ...) as `&mut dyn Any`; implementations downcast to their
/// own type.
pub trait GpuFrameBackend: Send + Sync {
    /// Starts uploading a decoded frame's resources (vertex/index buffers,
    /// deformation state, vertex alpha, texture) for the given slot. Called
    /// from the content-decode stage; returns a token the transfer stage
    /// waits on.
    fn upload_frame_resources(&self, slot_index: usize, frame: &FrameData)
    -> Result<TransferToken>;

    /// Blocks until the upload behind `token` completed. Returns an error on
    /// upload failure or when the timeout elapsed.
    fn await_upload(&self, token: TransferToken, timeout: Duration) -> Result<()>;

    /// Drops GPU resources associated with a slot whose decode failed or was
    /// invalidated.
    fn invalidate_slot(&self, slot_index: usize);

    /// Records a job interpolating the deformation state for display into the
    /// per-in-flight-frame buffer `dst_buffer_index`, blending between the
    /// predecessor slot (or identity, for keyframes) and the display slot by
    /// `factor`.
    fn record_interpolate_deformation_state(
        &self,
        cmd: &mut dyn Any,
        display_slot: usize,
        predecessor_slot: Option<usize>,
        factor: f32,
        dst_buffer_index: usize,
    );

    /// Records per-view draw setup (descriptor binding, pipeline selection).
    fn record_view_setup(&self, cmd: &mut dyn Any, view_index: u32, use_surface_normal_shading: bool);

    /// Records the indexed draw for one view. `transforms` is present for
    /// early-bound matrices and `None` when the caller late-binds them via
    /// [`GpuFrameBackend::set_late_model_view_projection`].
    fn record_draw(
        &self,
        cmd: &mut dyn Any,
        display_slot: usize,
        keyframe_slot: usize,
        view_index: u32,
        transforms: Option<&ViewTransforms>,
        intra_frame_factor: f32,
    );

    /// Updates a view's matrices after the draw was recorded. Only called
    /// when [`GpuFrameBackend::supports_late_mvp`] returns true.
    fn set_late_model_view_projection(&self, _view_index: u32, _transforms: &ViewTransforms) {}

    /// Number of frames the backend keeps in flight; sizes the ring of
    /// interpolated deformation state buffers.
    fn frames_in_flight(&self) -> usize;

    /// Whether the backend can consume matrices set after `record_draw`.
    fn supports_late_mvp(&self) -> bool {
        false
    }
}
