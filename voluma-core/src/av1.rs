//! AV1 texture decoder contract.
//!
//! The engine does not ship an AV1 implementation; hosts supply one (dav1d,
//! rav1d, a hardware decoder) through these traits. The video-decode stage
//! creates one decoder per stage thread via the factory and drives it with
//! the send/next-picture loop; the decoder may hold delayed frames, so the
//! stage drains it on end-of-stream and when its work queue empties.

use crate::error::{Result, VolumaError};

/// Pixel layout of a decoded picture. The container only carries 4:2:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    I420,
    /// Anything else the decoder might emit; rejected by the video stage.
    Other,
}

/// One image plane of a decoded picture.
#[derive(Debug, Clone)]
pub struct PicturePlane {
    pub data: Vec<u8>,
    /// Row stride in bytes; may exceed the plane width.
    pub stride: usize,
}

/// A decoded AV1 picture.
#[derive(Debug, Clone)]
pub struct Av1Picture {
    pub width: u32,
    pub height: u32,
    pub bits_per_component: u8,
    pub layout: PixelLayout,
    /// Luma plane (`width` x `height`).
    pub luma: PicturePlane,
    /// Chroma planes (`width / 2` x `height / 2` each).
    pub chroma_u: PicturePlane,
    pub chroma_v: PicturePlane,
}

/// External AV1 decoder.
///
/// Accepts one low-overhead bitstream chunk per frame. After `flush`, the
/// next chunk sent must be a keyframe.
pub trait Av1Decoder: Send {
    /// Feeds one compressed frame chunk to the decoder.
    fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Returns the next decoded picture, or `None` if the decoder needs more
    /// data. Pictures come out in presentation order; the decoder may delay
    /// them by several frames.
    fn next_picture(&mut self) -> Result<Option<Av1Picture>>;

    /// Discards all internal decoder state and delayed pictures.
    fn flush(&mut self);
}

/// Creates AV1 decoders, one per video-decode stage thread.
pub trait Av1DecoderFactory: Send + Sync {
    fn new_decoder(&self) -> Result<Box<dyn Av1Decoder>>;
}

impl Av1Picture {
    /// Validates the picture against the frame header's expectations.
    pub fn validate(&self, expected_width: u32, expected_height: u32) -> Result<()> {
        if self.width != expected_width || self.height != expected_height {
            return Err(VolumaError::Av1Decode(format!(
                "texture size mismatch: metadata says {expected_width}x{expected_height}, \
                 decoded picture is {}x{}",
                self.width, self.height
            )));
        }
        if self.layout != PixelLayout::I420 {
            return Err(VolumaError::Av1Decode(
                "decoded picture layout is not I420".into(),
            ));
        }
        if self.bits_per_component != 8 {
            return Err(VolumaError::Av1Decode(format!(
                "decoded picture has {} bits per component, expected 8",
                self.bits_per_component
            )));
        }
        Ok(())
    }
}
