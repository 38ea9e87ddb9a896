//! Input stream abstraction for video sources.
//!
//! Streams use interior mutability and are shared via `Arc`: the reading
//! stage owns the read cursor, while other threads may call
//! [`InputStream::abort_read`] to wake a blocked read during seek or
//! shutdown.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A seekable, abortable byte source for a volumetric video.
///
/// Contract for `abort_read`: any read blocked in another thread returns with
/// a short read, and subsequent reads keep short-returning until the next
/// `seek` clears the abort state. This lets a controller thread interrupt the
/// reading stage even while it is blocked on slow I/O.
pub trait InputStream: Send + Sync {
    /// Reads up to `buf.len()` bytes. Returns the number of bytes read; fewer
    /// than requested means end-of-stream, an error, or an aborted read.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Moves the read cursor to the given absolute offset and clears any
    /// pending abort.
    fn seek(&self, offset: u64) -> io::Result<()>;

    /// Reads exactly `buf.len()` bytes or fails.
    fn read_all(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "short read from input stream",
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Wakes a `read` blocked in another thread with a short read.
    fn abort_read(&self);

    /// Access to the streaming extension, if this source supports range
    /// pre-scheduling (e.g. a network transport).
    fn streaming(&self) -> Option<&dyn StreamingInputStream> {
        None
    }
}

/// Extension for network-backed sources that can pre-fetch byte ranges.
pub trait StreamingInputStream: InputStream {
    /// Requests that the range `[from, to]` be fetched in the background.
    /// `allow_extend` permits the transport to round the range up, bounded by
    /// `max_size` bytes.
    fn stream_range(&self, from: u64, to: u64, allow_extend: bool, max_size: u64);

    /// Drops queued range requests that have not started transferring yet.
    fn drop_pending_requests(&self);
}

/// File-backed input stream.
pub struct FileInputStream {
    file: Mutex<File>,
    aborted: AtomicBool,
}

impl FileInputStream {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            file: Mutex::new(File::open(path)?),
            aborted: AtomicBool::new(false),
        })
    }
}

impl InputStream for FileInputStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.aborted.load(Ordering::Acquire) {
            return Ok(0);
        }
        self.file.lock().unwrap().read(buf)
    }

    fn seek(&self, offset: u64) -> io::Result<()> {
        self.aborted.store(false, Ordering::Release);
        self.file.lock().unwrap().seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn abort_read(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// In-memory input stream, primarily for tests and pre-downloaded videos.
pub struct MemoryInputStream {
    data: Vec<u8>,
    position: Mutex<usize>,
    aborted: AtomicBool,
}

impl MemoryInputStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            position: Mutex::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl InputStream for MemoryInputStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.aborted.load(Ordering::Acquire) {
            return Ok(0);
        }
        let mut position = self.position.lock().unwrap();
        let remaining = self.data.len().saturating_sub(*position);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[*position..*position + n]);
        *position += n;
        Ok(n)
    }

    fn seek(&self, offset: u64) -> io::Result<()> {
        self.aborted.store(false, Ordering::Release);
        *self.position.lock().unwrap() = (offset as usize).min(self.data.len());
        Ok(())
    }

    fn abort_read(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}
