//! Chunk framing for volumetric video files.
//!
//! Every chunk starts with the same 5-byte header, which allows readers to
//! skip over chunk types they do not recognize.
//!
//! # Layout
//! ```text
//! 0x00: size_without_header u32  - payload size, excluding this header
//! 0x04: chunk_type u8
//! ```

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Size of the chunk header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 5;

/// Chunk type codes.
///
/// Header chunks may only appear before any frame chunk. A reader looking for
/// a header chunk must stop searching once it encounters a frame chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// A single video frame (frame chunk, version 0).
    Frame = 0x00,
    /// File metadata such as the initial camera view (header chunk, version 0).
    Metadata = 0x01,
    /// Compressed frame index (header chunk, version 0).
    Index = 0x02,
}

impl ChunkType {
    /// Returns the chunk type for a known type code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ChunkType::Frame),
            0x01 => Some(ChunkType::Metadata),
            0x02 => Some(ChunkType::Index),
            _ => None,
        }
    }

    /// Whether this code names a known header chunk.
    ///
    /// Note that for unknown codes neither `is_header_chunk` nor
    /// `is_frame_chunk` returns true, so callers must decide which property
    /// to assume for chunks they do not recognize.
    pub fn is_header_chunk(code: u8) -> bool {
        code == ChunkType::Metadata as u8 || code == ChunkType::Index as u8
    }

    /// Whether this code names a known frame chunk.
    pub fn is_frame_chunk(code: u8) -> bool {
        code == ChunkType::Frame as u8
    }
}

/// Parsed chunk header.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    /// Payload size in bytes, excluding the header itself.
    pub size_without_header: u32,
    /// Raw chunk type code (may be unknown to this reader).
    pub chunk_type: u8,
}

impl ChunkHeader {
    pub fn new(size_without_header: u32, chunk_type: ChunkType) -> Self {
        Self {
            size_without_header,
            chunk_type: chunk_type as u8,
        }
    }

    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let size_without_header = reader.read_u32::<LittleEndian>()?;
        let chunk_type = reader.read_u8()?;
        Ok(Self {
            size_without_header,
            chunk_type,
        })
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.size_without_header)?;
        writer.write_u8(self.chunk_type)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = ChunkHeader::new(1234, ChunkType::Frame);
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), CHUNK_HEADER_SIZE);

        let parsed = ChunkHeader::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed.size_without_header, 1234);
        assert_eq!(parsed.chunk_type, ChunkType::Frame as u8);
    }

    #[test]
    fn test_chunk_classification() {
        assert!(ChunkType::is_frame_chunk(0x00));
        assert!(ChunkType::is_header_chunk(0x01));
        assert!(ChunkType::is_header_chunk(0x02));
        // Unknown codes are neither.
        assert!(!ChunkType::is_frame_chunk(0x7f));
        assert!(!ChunkType::is_header_chunk(0x7f));
        assert_eq!(ChunkType::from_code(0x7f), None);
    }
}
