//! Index chunk wire format.
//!
//! The index chunk stores, zstd-compressed, one entry per frame followed by a
//! single trailing `i64` carrying the end timestamp of the last frame.
//!
//! # Layout
//! ```text
//! Index chunk payload:
//! 0x00: version u8          - currently 0
//! 0x01: compressed_size u32
//! 0x05: zstd frame          - compressed index array
//!
//! Decompressed index array, per frame (12 bytes):
//! 0x00: size_and_keyframe_flag u32  - bit 31: keyframe; bits 0..31: frame
//!                                     size in bytes excluding the chunk header
//! 0x04: start_timestamp i64         - nanoseconds
//! ```
//!
//! The array stores frame *sizes* rather than file offsets to improve
//! compressibility (offsets would also depend on the compressed size of the
//! index chunk itself). Readers reconstruct offsets by accumulating sizes
//! starting at the file position directly after the index chunk.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Current index chunk version.
pub const INDEX_VERSION: u8 = 0;

/// Size of one decompressed index array entry in bytes.
pub const INDEX_ENTRY_SIZE: usize = 12;

/// Keyframe flag bit in `size_and_keyframe_flag`.
pub const INDEX_KEYFRAME_BIT: u32 = 1 << 31;

/// One decompressed index array entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub size_and_keyframe_flag: u32,
    pub start_timestamp: i64,
}

impl IndexEntry {
    pub fn new(frame_size: u32, is_keyframe: bool, start_timestamp: i64) -> Self {
        debug_assert_eq!(frame_size & INDEX_KEYFRAME_BIT, 0);
        Self {
            size_and_keyframe_flag: (frame_size & !INDEX_KEYFRAME_BIT)
                | if is_keyframe { INDEX_KEYFRAME_BIT } else { 0 },
            start_timestamp,
        }
    }

    /// Frame size in bytes, excluding the frame chunk header.
    pub fn frame_size(&self) -> u32 {
        self.size_and_keyframe_flag & !INDEX_KEYFRAME_BIT
    }

    pub fn is_keyframe(&self) -> bool {
        self.size_and_keyframe_flag & INDEX_KEYFRAME_BIT != 0
    }

    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let size_and_keyframe_flag = reader.read_u32::<LittleEndian>()?;
        let start_timestamp = reader.read_i64::<LittleEndian>()?;
        Ok(Self {
            size_and_keyframe_flag,
            start_timestamp,
        })
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.size_and_keyframe_flag)?;
        writer.write_i64::<LittleEndian>(self.start_timestamp)?;
        Ok(())
    }
}

/// Serializes the decompressed index array from entries plus the trailing end
/// timestamp of the last frame.
pub fn write_index_array(
    entries: &[IndexEntry],
    end_timestamp: i64,
    writer: &mut impl Write,
) -> io::Result<()> {
    for entry in entries {
        entry.write_to(writer)?;
    }
    writer.write_i64::<LittleEndian>(end_timestamp)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_flag_packing() {
        let entry = IndexEntry::new(123_456, true, 42);
        assert_eq!(entry.frame_size(), 123_456);
        assert!(entry.is_keyframe());

        let entry = IndexEntry::new(7, false, -1);
        assert_eq!(entry.frame_size(), 7);
        assert!(!entry.is_keyframe());
    }

    #[test]
    fn test_index_array_roundtrip() {
        let entries = [
            IndexEntry::new(100, true, 0),
            IndexEntry::new(50, false, 33),
            IndexEntry::new(60, false, 66),
        ];

        let mut bytes = Vec::new();
        write_index_array(&entries, 99, &mut bytes).unwrap();
        assert_eq!(bytes.len(), entries.len() * INDEX_ENTRY_SIZE + 8);

        let mut cursor = bytes.as_slice();
        for expected in &entries {
            assert_eq!(IndexEntry::read_from(&mut cursor).unwrap(), *expected);
        }
        assert_eq!(cursor.read_i64::<LittleEndian>().unwrap(), 99);
    }
}
