//! Metadata chunk wire format.
//!
//! Zero or one metadata chunk may be present among a file's header chunks.
//!
//! # Layout
//! ```text
//! 0x00: version u8   - currently 0
//! 0x01: look_at [f32; 3]
//! 0x0D: radius f32
//! 0x11: yaw f32
//! 0x15: pitch f32
//! ```

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::chunk::{ChunkHeader, ChunkType};

/// Current metadata chunk version.
pub const METADATA_VERSION: u8 = 0;

/// Size of the metadata chunk payload in bytes.
pub const METADATA_SIZE: usize = 25;

/// File metadata: the initial camera view suggested by the authoring tool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMetadata {
    pub look_at: [f32; 3],
    pub radius: f32,
    pub yaw: f32,
    pub pitch: f32,
}

impl VideoMetadata {
    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let _version = reader.read_u8()?;
        let mut look_at = [0.0f32; 3];
        for value in &mut look_at {
            *value = reader.read_f32::<LittleEndian>()?;
        }
        let radius = reader.read_f32::<LittleEndian>()?;
        let yaw = reader.read_f32::<LittleEndian>()?;
        let pitch = reader.read_f32::<LittleEndian>()?;
        Ok(Self {
            look_at,
            radius,
            yaw,
            pitch,
        })
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u8(METADATA_VERSION)?;
        for value in &self.look_at {
            writer.write_f32::<LittleEndian>(*value)?;
        }
        writer.write_f32::<LittleEndian>(self.radius)?;
        writer.write_f32::<LittleEndian>(self.yaw)?;
        writer.write_f32::<LittleEndian>(self.pitch)?;
        Ok(())
    }

    /// Serializes the metadata as a complete chunk (header + payload).
    pub fn serialize_to_chunk(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(crate::chunk::CHUNK_HEADER_SIZE + METADATA_SIZE);
        ChunkHeader::new(METADATA_SIZE as u32, ChunkType::Metadata)
            .write_to(&mut bytes)
            .expect("writing to a Vec cannot fail");
        self.write_to(&mut bytes)
            .expect("writing to a Vec cannot fail");
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_chunk_roundtrip() {
        let metadata = VideoMetadata {
            look_at: [0.0, 1.0, 0.25],
            radius: 2.5,
            yaw: 0.5,
            pitch: -0.25,
        };

        let chunk = metadata.serialize_to_chunk();
        assert_eq!(chunk.len(), crate::chunk::CHUNK_HEADER_SIZE + METADATA_SIZE);

        let mut cursor = chunk.as_slice();
        let header = ChunkHeader::read_from(&mut cursor).unwrap();
        assert_eq!(header.chunk_type, ChunkType::Metadata as u8);
        assert_eq!(header.size_without_header as usize, METADATA_SIZE);

        let parsed = VideoMetadata::read_from(&mut cursor).unwrap();
        assert_eq!(parsed, metadata);
    }
}
