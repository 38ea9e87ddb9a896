//! Frame index.
//!
//! Maps playback timestamps to frames and frames to their file offsets and
//! dependency frames. Built either from the file's compressed index chunk or,
//! if that is missing, by scanning every frame chunk in the file.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{error, warn};
use voluma_shared::chunk::{CHUNK_HEADER_SIZE, ChunkType};
use voluma_shared::index::{INDEX_ENTRY_SIZE, INDEX_VERSION, IndexEntry};

use crate::error::{Result, VolumaError};
use crate::reader::FileReader;

/// One frame's entry in the index. The keyframe flag is packed into the high
/// bit of the offset.
#[derive(Debug, Clone, Copy)]
pub struct FrameIndexItem {
    timestamp: i64,
    offset_and_keyframe_flag: u64,
}

const IS_KEYFRAME_BIT: u64 = 1 << 63;

impl FrameIndexItem {
    fn new(timestamp: i64, offset: u64, is_keyframe: bool) -> Self {
        Self {
            timestamp,
            offset_and_keyframe_flag: (offset & !IS_KEYFRAME_BIT)
                | if is_keyframe { IS_KEYFRAME_BIT } else { 0 },
        }
    }

    /// Frame start timestamp in nanoseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// File offset of the frame's chunk header.
    pub fn offset(&self) -> u64 {
        self.offset_and_keyframe_flag & !IS_KEYFRAME_BIT
    }

    pub fn is_keyframe(&self) -> bool {
        self.offset_and_keyframe_flag & IS_KEYFRAME_BIT != 0
    }
}

/// An index of the frames in a video file.
///
/// The item vector carries one trailing sentinel whose timestamp is the end
/// timestamp of the last frame and whose offset is the file end offset; this
/// makes every frame's end timestamp available as `at(i + 1).timestamp()`.
#[derive(Debug, Default)]
pub struct FrameIndex {
    items: Vec<FrameIndexItem>,
}

impl FrameIndex {
    /// Constructs an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the index from the file's index chunk. The reader's cursor must
    /// be at the start of the index chunk.
    ///
    /// The index array stores frame sizes; offsets are reconstructed by
    /// accumulating them from the offset of the first frame chunk.
    pub fn from_index_chunk(reader: &mut FileReader) -> Result<Self> {
        // Skip over the chunk header.
        reader.seek(reader.file_offset() + CHUNK_HEADER_SIZE as u64)?;

        let mut scheme = [0u8; 5];
        if reader.read(&mut scheme)? != scheme.len() {
            return Err(VolumaError::Truncated("index chunk"));
        }
        let version = scheme[0];
        if version != INDEX_VERSION {
            warn!(version, "encountered an index chunk with an unknown version");
            return Err(VolumaError::FormatVersion {
                kind: "index chunk",
                version,
            });
        }
        let compressed_size = LittleEndian::read_u32(&scheme[1..5]) as usize;

        let mut compressed = vec![0u8; compressed_size];
        if reader.read(&mut compressed)? != compressed.len() {
            return Err(VolumaError::Truncated("index chunk"));
        }

        let array_size = zstd::zstd_safe::get_frame_content_size(&compressed)
            .ok()
            .flatten()
            .ok_or_else(|| {
                VolumaError::ZstdDecode("index array content size is unknown".into())
            })? as usize;

        let mut array = vec![0u8; array_size];
        let mut dctx = zstd::bulk::Decompressor::new()?;
        let decompressed = dctx
            .decompress_to_buffer(&compressed, array.as_mut_slice())
            .map_err(|e| VolumaError::ZstdDecode(format!("index array: {e}")))?;
        if decompressed != array_size {
            return Err(VolumaError::ZstdDecode(
                "index array decompressed to an unexpected size".into(),
            ));
        }
        if array_size < 8 || (array_size - 8) % INDEX_ENTRY_SIZE != 0 {
            return Err(VolumaError::Truncated("index array"));
        }

        // The frame sizes are accumulated onto the offset of the first frame
        // chunk, which directly follows the header chunks.
        if !reader.find_next_chunk(ChunkType::Frame)? {
            return Err(VolumaError::UnexpectedChunk(
                "no frame chunk follows the index chunk",
            ));
        }

        let frame_count = (array_size - 8) / INDEX_ENTRY_SIZE;
        let mut index = FrameIndex {
            items: Vec::with_capacity(frame_count + 1),
        };

        let mut current_offset = reader.file_offset();
        let mut cursor = array.as_slice();
        for _ in 0..frame_count {
            let entry = IndexEntry::read_from(&mut cursor)?;
            index.push_frame(entry.start_timestamp, current_offset, entry.is_keyframe());
            current_offset += (CHUNK_HEADER_SIZE as u32 + entry.frame_size()) as u64;
        }

        let end_timestamp = LittleEndian::read_i64(&array[array_size - 8..]);
        index.push_video_end(end_timestamp, current_offset);

        Ok(index)
    }

    /// Removes all frames from the index.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Appends a frame. Used by the full-file scan fallback.
    pub fn push_frame(&mut self, timestamp: i64, offset: u64, is_keyframe: bool) {
        self.items
            .push(FrameIndexItem::new(timestamp, offset, is_keyframe));
    }

    /// Appends the trailing sentinel. Must be called exactly once, after all
    /// frames were pushed.
    pub fn push_video_end(&mut self, end_timestamp: i64, end_offset: u64) {
        self.items
            .push(FrameIndexItem::new(end_timestamp, end_offset, false));
    }

    /// Number of frames in the video (excluding the sentinel).
    pub fn frame_count(&self) -> usize {
        self.items.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// The index item for the given frame. `frame_count()` addresses the
    /// sentinel, which carries the last frame's end timestamp and the file
    /// end offset.
    pub fn at(&self, frame_index: usize) -> &FrameIndexItem {
        &self.items[frame_index]
    }

    pub fn video_start_timestamp(&self) -> i64 {
        self.items.first().map(|item| item.timestamp).unwrap_or(0)
    }

    pub fn video_end_timestamp(&self) -> i64 {
        self.items.last().map(|item| item.timestamp).unwrap_or(0)
    }

    /// Binary search for the frame that should be displayed at the given
    /// timestamp: the greatest `i` with `at(i).timestamp() <= timestamp`.
    /// Returns `None` if the timestamp is outside the video's time range.
    pub fn find_frame_index_for_timestamp(&self, timestamp: i64) -> Option<usize> {
        if self.is_empty()
            || timestamp < self.video_start_timestamp()
            || timestamp > self.video_end_timestamp()
        {
            return None;
        }

        let mut lowest = 0;
        let mut highest = self.frame_count() - 1;
        while lowest < highest {
            let mid = (lowest + highest + 1) / 2;
            if self.items[mid].timestamp > timestamp {
                highest = mid - 1;
            } else {
                lowest = mid;
            }
        }

        Some(lowest)
    }

    /// The frames that `frame_index` depends on for display: its base
    /// keyframe and its immediate predecessor. Keyframes depend on nothing.
    ///
    /// Note that the predecessor may equal the base keyframe (for the frame
    /// directly after a keyframe).
    pub fn find_dependency_frames(&self, frame_index: usize) -> (Option<usize>, Option<usize>) {
        let mut base_keyframe = frame_index;
        while !self.at(base_keyframe).is_keyframe() {
            if base_keyframe == 0 {
                // The first frame is validated to be a keyframe on open.
                error!(frame_index, "no keyframe precedes frame");
                return (None, None);
            }
            base_keyframe -= 1;
        }

        if base_keyframe == frame_index {
            (None, None)
        } else {
            (Some(base_keyframe), Some(frame_index - 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_index(keyframes: &[bool], frame_duration: i64) -> FrameIndex {
        let mut index = FrameIndex::new();
        let mut offset = 0u64;
        for (i, &is_keyframe) in keyframes.iter().enumerate() {
            index.push_frame(i as i64 * frame_duration, offset, is_keyframe);
            offset += 100;
        }
        index.push_video_end(keyframes.len() as i64 * frame_duration, offset);
        index
    }

    #[test]
    fn test_timestamp_lookup() {
        let index = test_index(&[true, false, false, true, false], 100);

        assert_eq!(index.find_frame_index_for_timestamp(-1), None);
        assert_eq!(index.find_frame_index_for_timestamp(0), Some(0));
        assert_eq!(index.find_frame_index_for_timestamp(99), Some(0));
        assert_eq!(index.find_frame_index_for_timestamp(100), Some(1));
        assert_eq!(index.find_frame_index_for_timestamp(250), Some(2));
        assert_eq!(index.find_frame_index_for_timestamp(499), Some(4));
        // The exact end timestamp maps to the last frame.
        assert_eq!(index.find_frame_index_for_timestamp(500), Some(4));
        assert_eq!(index.find_frame_index_for_timestamp(501), None);
    }

    #[test]
    fn test_dependency_frames() {
        let index = test_index(&[true, false, false, true, false], 100);

        assert_eq!(index.find_dependency_frames(0), (None, None));
        // Directly after a keyframe, predecessor == keyframe.
        assert_eq!(index.find_dependency_frames(1), (Some(0), Some(0)));
        assert_eq!(index.find_dependency_frames(2), (Some(0), Some(1)));
        assert_eq!(index.find_dependency_frames(3), (None, None));
        assert_eq!(index.find_dependency_frames(4), (Some(3), Some(3)));
    }

    #[test]
    fn test_offset_keyframe_packing() {
        let item = FrameIndexItem::new(42, 0x1234_5678_9abc, true);
        assert_eq!(item.offset(), 0x1234_5678_9abc);
        assert!(item.is_keyframe());
        assert_eq!(item.timestamp(), 42);
    }

    #[test]
    fn test_empty_index() {
        let index = FrameIndex::new();
        assert_eq!(index.frame_count(), 0);
        assert_eq!(index.find_frame_index_for_timestamp(0), None);
    }

    #[test]
    fn test_index_from_chunk_matches_full_scan() {
        use std::sync::Arc;

        use crate::codec::read_frame_metadata;
        use crate::stream::MemoryInputStream;
        use crate::test_utils::FixtureVideoBuilder;

        let file = FixtureVideoBuilder::new(&[true, false, false, true, false], 100).build();

        let mut reader = FileReader::new(Arc::new(MemoryInputStream::new(file.clone())), false);
        assert!(reader.find_next_chunk(ChunkType::Index).unwrap());
        let from_chunk = FrameIndex::from_index_chunk(&mut reader).unwrap();

        let mut reader = FileReader::new(Arc::new(MemoryInputStream::new(file)), false);
        let mut scanned = FrameIndex::new();
        let mut bytes = Vec::new();
        let mut last_end_timestamp = 0;
        reader.seek(0).unwrap();
        while let Some(offset) = reader.read_next_frame(&mut bytes).unwrap() {
            let (frame_metadata, _) = read_frame_metadata(&bytes).unwrap();
            scanned.push_frame(frame_metadata.start_timestamp, offset, frame_metadata.is_keyframe);
            last_end_timestamp = frame_metadata.end_timestamp;
        }
        scanned.push_video_end(last_end_timestamp, reader.file_offset());

        assert_eq!(from_chunk.frame_count(), scanned.frame_count());
        for i in 0..=from_chunk.frame_count() {
            assert_eq!(from_chunk.at(i).timestamp(), scanned.at(i).timestamp(), "frame {i}");
            assert_eq!(from_chunk.at(i).offset(), scanned.at(i).offset(), "frame {i}");
            assert_eq!(from_chunk.at(i).is_keyframe(), scanned.at(i).is_keyframe(), "frame {i}");
        }
    }

    #[test]
    fn test_unknown_index_version_fails_without_panicking() {
        use std::sync::Arc;

        use crate::stream::MemoryInputStream;
        use crate::test_utils::FixtureVideoBuilder;

        let mut file = FixtureVideoBuilder::new(&[true, false], 100)
            .with_metadata(false)
            .build();
        // The index chunk leads the file; its version byte follows the chunk
        // header.
        file[CHUNK_HEADER_SIZE] = 9;

        let mut reader = FileReader::new(Arc::new(MemoryInputStream::new(file)), false);
        assert!(reader.find_next_chunk(ChunkType::Index).unwrap());
        let err = FrameIndex::from_index_chunk(&mut reader).unwrap_err();
        assert!(matches!(err, VolumaError::FormatVersion { .. }));
    }
}
