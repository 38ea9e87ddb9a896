//! Chunked file reader.
//!
//! Wraps an [`InputStream`] with a small peek buffer so that chunk headers
//! can be inspected without committing the cursor, and provides chunk-level
//! navigation: find a chunk of a given type, read the metadata chunk, read
//! the next frame chunk.

use std::sync::Arc;

use tracing::warn;
use voluma_shared::chunk::{CHUNK_HEADER_SIZE, ChunkHeader, ChunkType};
use voluma_shared::metadata::{METADATA_SIZE, VideoMetadata};

use crate::error::{Result, VolumaError};
use crate::stream::{InputStream, StreamingInputStream};

/// Reader over the chunk structure of a video file.
///
/// The reader tracks a logical file offset; bytes pulled into the peek buffer
/// do not advance it until they are consumed by `read`.
pub struct FileReader {
    stream: Arc<dyn InputStream>,
    uses_streaming: bool,
    peek_buffer: Vec<u8>,
    current_offset: u64,
}

impl FileReader {
    /// Takes shared ownership of the given input stream.
    ///
    /// `uses_streaming` must be set if the stream implements
    /// [`StreamingInputStream`]; it enables range pre-scheduling in the
    /// reading stage.
    pub fn new(stream: Arc<dyn InputStream>, uses_streaming: bool) -> Self {
        Self {
            stream,
            uses_streaming,
            peek_buffer: Vec::new(),
            current_offset: 0,
        }
    }

    /// The stream handle, for cross-thread `abort_read` calls.
    pub fn stream(&self) -> &Arc<dyn InputStream> {
        &self.stream
    }

    pub fn uses_streaming(&self) -> bool {
        self.uses_streaming
    }

    /// Access to the streaming extension, if configured.
    pub fn streaming(&self) -> Option<&dyn StreamingInputStream> {
        if self.uses_streaming {
            self.stream.streaming()
        } else {
            None
        }
    }

    /// Current logical file offset.
    pub fn file_offset(&self) -> u64 {
        self.current_offset
    }

    /// Seeks to the given absolute file offset, dropping peeked bytes.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.peek_buffer.clear();
        self.stream.seek(offset)?;
        self.current_offset = offset;
        Ok(())
    }

    /// Reads up to `dest.len()` bytes, consuming peeked bytes first.
    /// Returns the number of bytes read.
    pub fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        let mut filled = 0;

        if !self.peek_buffer.is_empty() {
            let n = self.peek_buffer.len().min(dest.len());
            dest[..n].copy_from_slice(&self.peek_buffer[..n]);
            self.peek_buffer.drain(..n);
            filled = n;
        }

        while filled < dest.len() {
            let n = self.stream.read(&mut dest[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        self.current_offset += filled as u64;
        Ok(filled)
    }

    /// Ensures at least `bytes` bytes are available in the peek buffer
    /// without advancing the logical offset. Returns false on end-of-stream.
    fn peek(&mut self, bytes: usize) -> Result<bool> {
        while self.peek_buffer.len() < bytes {
            let start = self.peek_buffer.len();
            self.peek_buffer.resize(bytes, 0);
            let n = self.stream.read(&mut self.peek_buffer[start..])?;
            self.peek_buffer.truncate(start + n);
            if n == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Parses the chunk header at the current offset without consuming it.
    /// Returns `None` at end-of-stream.
    pub fn parse_chunk_header(&mut self) -> Result<Option<ChunkHeader>> {
        if !self.peek(CHUNK_HEADER_SIZE)? {
            if !self.peek_buffer.is_empty() {
                return Err(VolumaError::Truncated("chunk header"));
            }
            return Ok(None);
        }
        let header = ChunkHeader::read_from(&mut &self.peek_buffer[..CHUNK_HEADER_SIZE])?;
        Ok(Some(header))
    }

    /// Scans for the next chunk of the given type, skipping unknown chunks by
    /// size. Header chunks are searched from the file start; the search for
    /// them stops (not found) at the first frame chunk, since header chunks
    /// may not appear after any frame chunk. On success the cursor rests at
    /// the chunk's header.
    pub fn find_next_chunk(&mut self, target: ChunkType) -> Result<bool> {
        let searching_header_chunk = ChunkType::is_header_chunk(target as u8);
        if searching_header_chunk {
            self.seek(0)?;
        }

        loop {
            let Some(header) = self.parse_chunk_header()? else {
                return Ok(false);
            };

            if header.chunk_type == target as u8 {
                return Ok(true);
            }
            if searching_header_chunk && ChunkType::is_frame_chunk(header.chunk_type) {
                return Ok(false);
            }

            self.seek(
                self.current_offset + CHUNK_HEADER_SIZE as u64 + header.size_without_header as u64,
            )?;
        }
    }

    /// Reads the metadata header chunk, if the file has one.
    pub fn read_metadata(&mut self) -> Result<Option<VideoMetadata>> {
        if !self.find_next_chunk(ChunkType::Metadata)? {
            return Ok(None);
        }

        let header = self
            .parse_chunk_header()?
            .ok_or(VolumaError::Truncated("metadata chunk"))?;
        if (header.size_without_header as usize) < METADATA_SIZE {
            warn!(
                size = header.size_without_header,
                "metadata chunk is too small, ignoring it"
            );
            return Ok(None);
        }

        let mut bytes = vec![0u8; CHUNK_HEADER_SIZE + header.size_without_header as usize];
        if self.read(&mut bytes)? != bytes.len() {
            return Err(VolumaError::Truncated("metadata chunk"));
        }

        let metadata = VideoMetadata::read_from(&mut &bytes[CHUNK_HEADER_SIZE..])?;
        Ok(Some(metadata))
    }

    /// Reads the next frame chunk's payload into `data`.
    /// Returns the frame chunk's file offset, or `None` at end-of-stream.
    pub fn read_next_frame(&mut self, data: &mut Vec<u8>) -> Result<Option<u64>> {
        if !self.find_next_chunk(ChunkType::Frame)? {
            return Ok(None);
        }

        let frame_offset = self.current_offset;
        let header = self
            .parse_chunk_header()?
            .ok_or(VolumaError::Truncated("frame chunk"))?;

        let mut header_bytes = [0u8; CHUNK_HEADER_SIZE];
        self.read(&mut header_bytes)?;

        data.resize(header.size_without_header as usize, 0);
        if self.read(data)? != data.len() {
            return Err(VolumaError::Truncated("frame payload"));
        }

        Ok(Some(frame_offset))
    }
}
