//! The cache seam consumed by the blob reader.
//!
//! The reader stores one entry per chunk, keyed by a stable identifier
//! derived from the blob digest and the chunk coordinates. Backends are
//! byte-addressable on read and two-phase on write: bytes streamed into a
//! [`CacheWriter`] become visible to readers only after `commit`. A writer
//! dropped without commit is discarded.
//!
//! The traits are synchronous; callers drive them from async code the same
//! way disk stores are driven elsewhere in the stack. Implementations must
//! tolerate `add` for an id that is already committed (servers may answer a
//! multi-range request with overlapping parts, producing a second write for
//! the same chunk).

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// No committed entry under the requested id.
    #[error("cache entry not found")]
    NotFound,

    #[error("cache is closed")]
    Closed,

    #[error("cache I/O error: {0}")]
    Io(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Options forwarded opaquely to the cache backend on every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOpts {
    /// Bypass any read-ahead or write-behind buffering the backend keeps and
    /// go straight to the backing store.
    pub direct: bool,
}

/// A positioned reader over one committed cache entry.
pub trait CacheReader: Send + std::fmt::Debug {
    /// Read up to `buf.len()` bytes at `off` within the entry, returning the
    /// byte count. Reads at or past the end of the entry return 0.
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> CacheResult<usize>;
}

/// A sequential writer for one cache entry.
pub trait CacheWriter: Write + Send + std::fmt::Debug {
    /// Atomically publish everything written so far.
    fn commit(&mut self) -> CacheResult<()>;

    /// Discard everything written so far. Dropping an uncommitted writer has
    /// the same effect.
    fn abort(&mut self) -> CacheResult<()>;
}

/// A named-entry byte store with commit/abort write semantics.
pub trait BlobCache: Send + Sync {
    fn get(&self, id: &str, opts: &CacheOpts) -> CacheResult<Box<dyn CacheReader>>;
    fn add(&self, id: &str, opts: &CacheOpts) -> CacheResult<Box<dyn CacheWriter>>;

    /// Release backend resources. Idempotent.
    fn close(&self) -> CacheResult<()>;
}

/// In-memory [`BlobCache`] used by tests and for small blobs.
///
/// Committed entries live in a map of immutable buffers; commit is
/// last-writer-wins, which satisfies the overlapping-parts requirement.
#[derive(Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>>,
    closed: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed entries, for inspection in tests.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobCache for MemoryCache {
    fn get(&self, id: &str, _opts: &CacheOpts) -> CacheResult<Box<dyn CacheReader>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        let entries = self.entries.lock().expect("cache lock poisoned");
        let data = entries.get(id).cloned().ok_or(CacheError::NotFound)?;
        Ok(Box::new(MemoryReader { data }))
    }

    fn add(&self, id: &str, _opts: &CacheOpts) -> CacheResult<Box<dyn CacheWriter>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        Ok(Box::new(MemoryWriter {
            id: id.to_string(),
            buf: Vec::new(),
            entries: Arc::clone(&self.entries),
            committed: false,
            aborted: false,
        }))
    }

    fn close(&self) -> CacheResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.entries.lock().expect("cache lock poisoned").clear();
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryReader {
    data: Arc<Vec<u8>>,
}

impl CacheReader for MemoryReader {
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> CacheResult<usize> {
        let off = usize::try_from(off).map_err(|_| CacheError::Io("offset overflow".into()))?;
        if off >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - off);
        buf[..n].copy_from_slice(&self.data[off..off + n]);
        Ok(n)
    }
}

#[derive(Debug)]
struct MemoryWriter {
    id: String,
    buf: Vec<u8>,
    entries: Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>>,
    committed: bool,
    aborted: bool,
}

impl Write for MemoryWriter {
    fn write(&mut self, p: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(p);
        Ok(p.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CacheWriter for MemoryWriter {
    fn commit(&mut self) -> CacheResult<()> {
        if self.committed || self.aborted {
            return Ok(());
        }
        self.committed = true;
        let data = Arc::new(std::mem::take(&mut self.buf));
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .insert(self.id.clone(), data);
        Ok(())
    }

    fn abort(&mut self) -> CacheResult<()> {
        self.aborted = true;
        self.buf.clear();
        Ok(())
    }
}
