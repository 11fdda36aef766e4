//! Byte sources for the block pipeline
//!
//! Blocks are addressed by bit offsets but the underlying storage is byte
//! oriented. A [`BlockSource`] exposes positional reads with no shared
//! cursor, so the block finder, the BGZF scanner, and decode workers can
//! read from the same source concurrently through `Arc` handles.

use std::fs::File;
use std::io;
use std::sync::Arc;

use memmap2::Mmap;

/// A seekable, size-aware byte source.
///
/// Implementations must be cheap to read from concurrently; `read_at` takes
/// `&self` and must not depend on any shared cursor state.
pub trait BlockSource: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Read exactly `buf.len()` bytes or fail with `UnexpectedEof`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let n = self.read_at(offset, buf)?;
        if n < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "source ended before requested range",
            ));
        }
        Ok(())
    }
}

/// An in-memory source, used for tests and for callers that already hold
/// the compressed stream in a buffer.
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        MemorySource { data: data.into() }
    }
}

impl BlockSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + buf.len()).min(self.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.data[start..end]);
        Ok(n)
    }
}

/// A memory-mapped file source. Mapping instead of buffered reads keeps
/// positional access cheap for the many small header reads the BGZF scanner
/// performs.
pub struct FileSource {
    map: Mmap,
}

impl FileSource {
    pub fn open(file: &File) -> io::Result<Self> {
        // SAFETY: The map is read-only and the file is expected to stay
        // unmodified while the pipeline runs, as with any mapped input.
        let map = unsafe { Mmap::map(file)? };
        Ok(FileSource { map })
    }
}

impl BlockSource for FileSource {
    fn size(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = (offset as usize).min(self.map.len());
        let end = (start + buf.len()).min(self.map.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.map[start..end]);
        Ok(n)
    }
}
