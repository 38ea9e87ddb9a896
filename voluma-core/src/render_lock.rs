//! Render lock: a stable, read-locked view of the frames needed to render
//! the current playback time.
//!
//! Intended for multi-threaded rendering: the update side creates a lock
//! after `update()` and hands it to the render thread, which may consume it
//! later even if the update side touches the video again in between. Locks
//! must be consumed in creation order, one at a time. For backends with
//! multiple frames in flight, keep the lock alive until the GPU consumed the
//! recorded commands (a delete queue, or a backend fence awaited on drop).

use std::any::Any;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::backend::{GpuFrameBackend, ViewTransforms};
use crate::cache::ReadLockedFrame;

/// Holds read locks on the display frame, its base keyframe, and its
/// predecessor (those of the three that exist), plus the intra-frame
/// interpolation factor at creation time. Dropping the lock releases the
/// read locks.
pub struct RenderLock {
    /// Ordered: display frame, then keyframe (if different), then
    /// predecessor (if different from both).
    locks: Vec<ReadLockedFrame>,
    intra_frame_time: f32,
    /// Ring index of the per-in-flight-frame deformation state buffer.
    dst_buffer_index: usize,
    use_surface_normal_shading: bool,
    /// Early-bound per-view matrices, consumed by `render_view`.
    transforms: HashMap<u32, ViewTransforms>,
    backend: Arc<dyn GpuFrameBackend>,
}

impl RenderLock {
    pub(crate) fn new(
        locks: Vec<ReadLockedFrame>,
        intra_frame_time: f32,
        dst_buffer_index: usize,
        backend: Arc<dyn GpuFrameBackend>,
    ) -> Self {
        debug_assert!(!locks.is_empty());
        Self {
            locks,
            intra_frame_time,
            dst_buffer_index,
            use_surface_normal_shading: false,
            transforms: HashMap::new(),
            backend,
        }
    }

    /// The displayed frame.
    pub fn display_frame(&self) -> &ReadLockedFrame {
        &self.locks[0]
    }

    /// The display frame's base keyframe; equals the display frame when that
    /// is itself a keyframe.
    pub fn keyframe(&self) -> &ReadLockedFrame {
        if self.locks.len() == 1 {
            &self.locks[0]
        } else {
            &self.locks[1]
        }
    }

    /// The display frame's predecessor, when it is distinct from both the
    /// display frame and the keyframe. For the frame directly after a
    /// keyframe the predecessor coincides with the keyframe and this returns
    /// `None`.
    pub fn predecessor(&self) -> Option<&ReadLockedFrame> {
        if self.locks.len() == 3 {
            Some(&self.locks[2])
        } else {
            None
        }
    }

    /// Normalized position in `[0, 1]` between the display frame's start and
    /// end timestamps; the interpolation factor between the predecessor's
    /// and the display frame's deformation state.
    pub fn intra_frame_time(&self) -> f32 {
        self.intra_frame_time
    }

    pub fn set_use_surface_normal_shading(&mut self, enable: bool) {
        self.use_surface_normal_shading = enable;
    }

    pub fn use_surface_normal_shading(&self) -> bool {
        self.use_surface_normal_shading
    }

    /// Whether matrices should be set after `render_view`, with the most
    /// up-to-date values available right before submission.
    pub fn supports_late_model_view_projection(&self) -> bool {
        self.backend.supports_late_mvp()
    }

    /// Call once at the start of a frame: records the job interpolating the
    /// deformation state for display, from identity for keyframes.
    pub fn prepare_frame(&mut self, cmd: &mut dyn Any) {
        let display_is_keyframe =
            self.display_frame().frame_index() == self.keyframe().frame_index();
        // A dependent frame interpolates from the last locked frame: the
        // distinct predecessor if present, else the keyframe (which then is
        // the predecessor).
        let predecessor_slot = if display_is_keyframe {
            None
        } else {
            self.locks.last().map(ReadLockedFrame::slot_index)
        };

        self.backend.record_interpolate_deformation_state(
            cmd,
            self.display_frame().slot_index(),
            predecessor_slot,
            self.intra_frame_time,
            self.dst_buffer_index,
        );
    }

    /// Call before each view's render pass.
    pub fn prepare_view(&mut self, view_index: u32, cmd: &mut dyn Any) {
        self.backend
            .record_view_setup(cmd, view_index, self.use_surface_normal_shading);
    }

    /// Sets a view's matrices. For early-binding backends this must precede
    /// `render_view`; late-binding backends accept it afterwards and pick up
    /// the freshest values.
    pub fn set_model_view_projection(&mut self, view_index: u32, transforms: ViewTransforms) {
        if self.backend.supports_late_mvp() {
            self.backend
                .set_late_model_view_projection(view_index, &transforms);
        }
        self.transforms.insert(view_index, transforms);
    }

    /// Call during each view's render pass: records the indexed draw.
    pub fn render_view(&mut self, view_index: u32, cmd: &mut dyn Any) {
        let transforms = if self.backend.supports_late_mvp() {
            None
        } else {
            self.transforms.get(&view_index)
        };

        self.backend.record_draw(
            cmd,
            self.display_frame().slot_index(),
            self.keyframe().slot_index(),
            view_index,
            transforms,
            self.intra_frame_time,
        );
    }
}
