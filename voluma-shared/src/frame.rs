//! Frame chunk headers.
//!
//! Frame chunks have a separate version byte so that readers can still
//! identify newer frames as frame chunks (and skip them) even if they cannot
//! parse them.
//!
//! # Layout
//! ```text
//! Frame header (36 bytes):
//! 0x00: version u8                            - currently 0
//! 0x01: bitflags u8                           - see FrameFlags
//! 0x02: deformation_node_count u16
//! 0x04: start_timestamp i64                   - nanoseconds
//! 0x0C: end_timestamp i64                     - nanoseconds, equals the next frame's start
//! 0x14: texture_width u32
//! 0x18: texture_height u32
//! 0x1C: compressed_deformation_state_size u32
//! 0x20: compressed_texture_size u32           - AV1 chunk, or zstd RGB if flagged
//!
//! Keyframe sub-header (40 bytes, keyframes only):
//! 0x00: unique_vertex_count u16
//! 0x02: vertex_count u16
//! 0x04: triangle_count u32
//! 0x08: bbox [f32; 6]                         - min x/y/z, then factor x/y/z
//! 0x20: compressed_mesh_size u32
//! 0x24: encoded_vertex_weights_size u32
//! ```
//!
//! The bounding box stores the minimum corner and per-axis quantization
//! factors; the maximum corner is `min + factor * 65535`.
//!
//! After the header(s), the frame payload follows: compressed mesh (keyframes
//! only), compressed deformation state, compressed texture, and optionally
//! compressed vertex alpha values.

use std::io::{self, Read, Write};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Current frame chunk version.
pub const FRAME_VERSION: u8 = 0;

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 36;

/// Size of the keyframe sub-header in bytes.
pub const KEYFRAME_HEADER_SIZE: usize = 40;

bitflags! {
    /// Frame header flag byte. Unused bits are always zero.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// The frame ships full mesh, index, and weight data.
        const KEYFRAME = 1 << 0;
        /// The frame carries per-vertex alpha values.
        const HAS_VERTEX_ALPHA = 1 << 1;
        /// The texture is zstd-compressed raw RGB instead of an AV1 chunk.
        const ZSTD_RGB_TEXTURE = 1 << 2;
    }
}

/// Fixed-layout header at the start of every frame chunk payload.
///
/// The deformation node count is stored for every frame (not only keyframes)
/// so that frames can be sized and loaded independently in advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: FrameFlags,
    pub deformation_node_count: u16,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub texture_width: u32,
    pub texture_height: u32,
    pub compressed_deformation_state_size: u32,
    pub compressed_texture_size: u32,
}

impl FrameHeader {
    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let version = reader.read_u8()?;
        let flags = FrameFlags::from_bits_truncate(reader.read_u8()?);
        let deformation_node_count = reader.read_u16::<LittleEndian>()?;
        let start_timestamp = reader.read_i64::<LittleEndian>()?;
        let end_timestamp = reader.read_i64::<LittleEndian>()?;
        let texture_width = reader.read_u32::<LittleEndian>()?;
        let texture_height = reader.read_u32::<LittleEndian>()?;
        let compressed_deformation_state_size = reader.read_u32::<LittleEndian>()?;
        let compressed_texture_size = reader.read_u32::<LittleEndian>()?;
        Ok(Self {
            version,
            flags,
            deformation_node_count,
            start_timestamp,
            end_timestamp,
            texture_width,
            texture_height,
            compressed_deformation_state_size,
            compressed_texture_size,
        })
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u8(self.version)?;
        writer.write_u8(self.flags.bits())?;
        writer.write_u16::<LittleEndian>(self.deformation_node_count)?;
        writer.write_i64::<LittleEndian>(self.start_timestamp)?;
        writer.write_i64::<LittleEndian>(self.end_timestamp)?;
        writer.write_u32::<LittleEndian>(self.texture_width)?;
        writer.write_u32::<LittleEndian>(self.texture_height)?;
        writer.write_u32::<LittleEndian>(self.compressed_deformation_state_size)?;
        writer.write_u32::<LittleEndian>(self.compressed_texture_size)?;
        Ok(())
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(FrameFlags::KEYFRAME)
    }
}

/// Sub-header following [`FrameHeader`] for keyframes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyframeHeader {
    /// Number of unique vertices, excluding vertices duplicated for texturing.
    pub unique_vertex_count: u16,
    /// Number of renderable vertices, including duplicated ones.
    pub vertex_count: u16,
    pub triangle_count: u32,
    /// Minimum corner followed by per-axis quantization factors.
    pub bbox: [f32; 6],
    pub compressed_mesh_size: u32,
    /// Size of the decompressed but still encoded vertex weight data.
    pub encoded_vertex_weights_size: u32,
}

impl KeyframeHeader {
    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let unique_vertex_count = reader.read_u16::<LittleEndian>()?;
        let vertex_count = reader.read_u16::<LittleEndian>()?;
        let triangle_count = reader.read_u32::<LittleEndian>()?;
        let mut bbox = [0.0f32; 6];
        for value in &mut bbox {
            *value = reader.read_f32::<LittleEndian>()?;
        }
        let compressed_mesh_size = reader.read_u32::<LittleEndian>()?;
        let encoded_vertex_weights_size = reader.read_u32::<LittleEndian>()?;
        Ok(Self {
            unique_vertex_count,
            vertex_count,
            triangle_count,
            bbox,
            compressed_mesh_size,
            encoded_vertex_weights_size,
        })
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(self.unique_vertex_count)?;
        writer.write_u16::<LittleEndian>(self.vertex_count)?;
        writer.write_u32::<LittleEndian>(self.triangle_count)?;
        for value in &self.bbox {
            writer.write_f32::<LittleEndian>(*value)?;
        }
        writer.write_u32::<LittleEndian>(self.compressed_mesh_size)?;
        writer.write_u32::<LittleEndian>(self.encoded_vertex_weights_size)?;
        Ok(())
    }

    /// Maximum bounding box corner derived from the stored min + factors.
    pub fn bbox_max(&self) -> [f32; 3] {
        [
            self.bbox[0] + self.bbox[3] * u16::MAX as f32,
            self.bbox[1] + self.bbox[4] * u16::MAX as f32,
            self.bbox[2] + self.bbox[5] * u16::MAX as f32,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_roundtrip() {
        let header = FrameHeader {
            version: FRAME_VERSION,
            flags: FrameFlags::KEYFRAME | FrameFlags::HAS_VERTEX_ALPHA,
            deformation_node_count: 64,
            start_timestamp: 1_000_000,
            end_timestamp: 34_333_333,
            texture_width: 1024,
            texture_height: 1024,
            compressed_deformation_state_size: 512,
            compressed_texture_size: 20_000,
        };

        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE);

        let parsed = FrameHeader::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_keyframe());
    }

    #[test]
    fn test_keyframe_header_roundtrip() {
        let header = KeyframeHeader {
            unique_vertex_count: 100,
            vertex_count: 120,
            triangle_count: 200,
            bbox: [-1.0, -1.0, 0.0, 2.0 / 65535.0, 2.0 / 65535.0, 1.0 / 65535.0],
            compressed_mesh_size: 4096,
            encoded_vertex_weights_size: 700,
        };

        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), KEYFRAME_HEADER_SIZE);

        let parsed = KeyframeHeader::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_bbox_max() {
        let header = KeyframeHeader {
            unique_vertex_count: 0,
            vertex_count: 0,
            triangle_count: 0,
            bbox: [-1.0, 0.0, 2.0, 2.0 / 65535.0, 1.0 / 65535.0, 0.5 / 65535.0],
            compressed_mesh_size: 0,
            encoded_vertex_weights_size: 0,
        };
        let max = header.bbox_max();
        assert!((max[0] - 1.0).abs() < 1e-4);
        assert!((max[1] - 1.0).abs() < 1e-4);
        assert!((max[2] - 2.5).abs() < 1e-4);
    }

    #[test]
    fn test_unknown_flag_bits_are_dropped() {
        let mut bytes = Vec::new();
        FrameHeader {
            version: FRAME_VERSION,
            flags: FrameFlags::KEYFRAME,
            deformation_node_count: 0,
            start_timestamp: 0,
            end_timestamp: 0,
            texture_width: 0,
            texture_height: 0,
            compressed_deformation_state_size: 0,
            compressed_texture_size: 0,
        }
        .write_to(&mut bytes)
        .unwrap();
        bytes[1] |= 0x80;

        let parsed = FrameHeader::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed.flags, FrameFlags::KEYFRAME);
    }
}
