//! The lazy remote blob reader.
//!
//! One [`Blob`] fronts one image layer. Reads are aligned onto the chunk
//! grid, served from the cache where possible, and the remaining chunks are
//! fetched in a single coalesced range request. Concurrent readers asking for
//! the same chunk set share one request: the leader streams response bytes
//! into the cache and its own buffer, everyone else re-reads the committed
//! chunks from the cache afterwards.

use crate::cache::{BlobCache, CacheError, CacheOpts, CacheReader, CacheResult};
use crate::error::{RemoteError, Result};
use crate::fetcher::{HttpFetcher, RangeResponse};
use crate::region::{ceil, floor, walk_chunks, Region, RegionSet};
use crate::resolver::{Descriptor, Refspec, RegistryHost, Resolver};
use crate::singleflight::{Flight, Group};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_CHUNK_SIZE: u64 = 50_000;

/// Tuning knobs for one blob. Defaults match typical layer access patterns:
/// 50 KB chunks, prefetch fan-out disabled, a one-minute liveness window and
/// a five-minute bound on any single fetch.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub chunk_size: u64,
    /// Fetch window for `cache`; values above `chunk_size` split a prefetch
    /// into concurrent windows of this many bytes (rounded down to the chunk
    /// grid). Zero disables the fan-out.
    pub prefetch_chunk_size: u64,
    pub check_interval: Duration,
    pub fetch_timeout: Duration,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            prefetch_chunk_size: 0,
            check_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(300),
        }
    }
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Cancels in-flight work. When set, the caller owns the deadline and the
    /// blob's default fetch timeout does not apply.
    pub cancel: Option<CancellationToken>,
    /// Forwarded opaquely to the cache backend.
    pub cache_opts: CacheOpts,
}

/// A lazily fetched remote blob with chunk-level caching.
///
/// All operations are safe to call concurrently. No lock is held across I/O;
/// mutexes guard only field snapshots and swaps.
pub struct Blob {
    fetcher: Mutex<Arc<HttpFetcher>>,
    size: u64,
    chunk_size: u64,
    prefetch_chunk_size: u64,
    check_interval: Duration,
    fetch_timeout: Duration,
    cache: Arc<dyn BlobCache>,
    last_check: Mutex<Instant>,
    fetched_regions: Mutex<RegionSet>,
    fetch_group: Group<Result<()>>,
    /// Serializes copy-out of shared fetch results into caller buffers.
    shared_copy_lock: tokio::sync::Mutex<()>,
    resolver: Resolver,
    closed: Mutex<bool>,
}

impl Blob {
    pub fn new(
        fetcher: HttpFetcher,
        size: u64,
        cache: Arc<dyn BlobCache>,
        resolver: Resolver,
        config: BlobConfig,
    ) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(RemoteError::InvalidConfig("chunk_size must be greater than zero"));
        }
        if config.fetch_timeout.is_zero() {
            return Err(RemoteError::InvalidConfig("fetch_timeout must be greater than zero"));
        }
        Ok(Self {
            fetcher: Mutex::new(Arc::new(fetcher)),
            size,
            chunk_size: config.chunk_size,
            prefetch_chunk_size: config.prefetch_chunk_size,
            check_interval: config.check_interval,
            fetch_timeout: config.fetch_timeout,
            cache,
            last_check: Mutex::new(Instant::now()),
            fetched_regions: Mutex::new(RegionSet::new()),
            fetch_group: Group::new(),
            shared_copy_lock: tokio::sync::Mutex::new(()),
            resolver,
            closed: Mutex::new(false),
        })
    }

    /// Blob size in bytes, fixed at resolve time.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Total bytes fetched from the remote so far.
    pub fn fetched_size(&self) -> u64 {
        self.fetched_regions
            .lock()
            .expect("region set lock poisoned")
            .total_size()
    }

    /// Throttled liveness probe against the upstream URL.
    ///
    /// At most one probe per `check_interval`; a failed probe does not
    /// advance the clock, so the next call retries.
    pub async fn check(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RemoteError::BlobClosed);
        }

        let now = Instant::now();
        {
            let last = *self.last_check.lock().expect("last_check lock poisoned");
            if now.duration_since(last) < self.check_interval {
                return Ok(());
            }
        }

        let fetcher = self.fetcher_snapshot();
        let result = fetcher.check().await;
        if result.is_ok() {
            self.touch_last_check(now);
        }
        result
    }

    /// Re-resolve the fetcher, e.g. after upstream credentials expired.
    ///
    /// The new blob must report the same size. In-flight reads keep the
    /// snapshot they captured; only subsequent operations see the new
    /// fetcher.
    pub async fn refresh(
        &self,
        hosts: &[RegistryHost],
        refspec: &Refspec,
        desc: &Descriptor,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(RemoteError::BlobClosed);
        }

        let (fetcher, new_size) = self.resolver.resolve_fetcher(hosts, refspec, desc).await?;
        if new_size != self.size {
            return Err(RemoteError::SizeMismatch {
                got: new_size,
                want: self.size,
            });
        }

        *self.fetcher.lock().expect("fetcher lock poisoned") = Arc::new(fetcher);
        self.touch_last_check(Instant::now());
        Ok(())
    }

    /// Read into `dst` at `offset`, fetching missing chunks from the remote.
    ///
    /// Whole chunks are fetched and cached even for sub-chunk reads, so
    /// neighboring reads are served locally. Returns the number of readable
    /// bytes, `min(dst.len(), size - offset)`.
    pub async fn read_at(&self, dst: &mut [u8], offset: u64, opts: &FetchOptions) -> Result<usize> {
        if self.is_closed() {
            return Err(RemoteError::BlobClosed);
        }
        if dst.is_empty() || offset > self.size {
            return Ok(0);
        }

        let len = dst.len() as u64;
        let all_region = Region::new(
            floor(offset, self.chunk_size),
            ceil(offset + len - 1, self.chunk_size) - 1,
        );

        let fetcher = self.fetcher_snapshot();

        let mut chunks = Vec::new();
        walk_chunks(all_region, self.chunk_size, self.size, |chunk| {
            chunks.push(chunk);
            Ok(())
        })?;

        // Carve `dst` into one disjoint window per chunk and probe the cache;
        // misses keep their window as a streaming destination.
        let mut missing: HashMap<Region, ChunkSink<'_>> = HashMap::new();
        let mut rest: &mut [u8] = dst;
        let mut rest_off: u64 = 0;
        for chunk in chunks {
            let base = chunk.b.saturating_sub(offset);
            let lower_unread = offset.saturating_sub(chunk.b);
            let upper_unread = (chunk.e + 1).saturating_sub(offset + len);
            let expected = chunk
                .size()
                .saturating_sub(lower_unread)
                .saturating_sub(upper_unread);

            let skip = base.saturating_sub(rest_off) as usize;
            let tail = std::mem::take(&mut rest);
            let (_, tail) = tail.split_at_mut(skip);
            let (window, tail) = tail.split_at_mut(expected as usize);
            rest = tail;
            rest_off = base + expected;

            if self.read_chunk_from_cache(chunk, window, lower_unread, &fetcher, opts) {
                continue;
            }
            missing.insert(chunk, ChunkSink::Buffer(BytesWriter::new(window, lower_unread)));
        }

        self.fetch_range(&mut missing, opts).await?;

        Ok((len.min(self.size - offset)) as usize)
    }

    /// Populate the cache for `[offset, offset + size)` without a caller
    /// buffer, optionally fanning out over prefetch windows.
    pub async fn cache(&self, offset: u64, size: u64, opts: &FetchOptions) -> Result<()> {
        if self.is_closed() {
            return Err(RemoteError::BlobClosed);
        }
        if size == 0 {
            return Ok(());
        }

        let fetcher = self.fetcher_snapshot();

        if self.prefetch_chunk_size <= self.chunk_size {
            return self.cache_at(offset, size, &fetcher, opts).await;
        }

        let fetch_size = self.chunk_size * (self.prefetch_chunk_size / self.chunk_size);
        let end = offset.saturating_add(size);
        let mut windows = Vec::new();
        let mut at = offset;
        while at < end {
            windows.push((at, fetch_size.min(end - at)));
            at = at.saturating_add(fetch_size);
        }
        futures::future::try_join_all(
            windows
                .into_iter()
                .map(|(o, l)| self.cache_at(o, l, &fetcher, opts)),
        )
        .await
        .map(|_| ())
    }

    /// Close the blob. Idempotent; the cache handle is closed once and every
    /// later operation fails with [`RemoteError::BlobClosed`].
    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().expect("closed lock poisoned");
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.cache
            .close()
            .map_err(|err| RemoteError::Cache(err.to_string()))
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().expect("closed lock poisoned")
    }

    /// Operations act on a snapshot so a concurrent refresh never swaps the
    /// fetcher out from under a request.
    fn fetcher_snapshot(&self) -> Arc<HttpFetcher> {
        Arc::clone(&self.fetcher.lock().expect("fetcher lock poisoned"))
    }

    fn touch_last_check(&self, now: Instant) {
        *self.last_check.lock().expect("last_check lock poisoned") = now;
    }

    fn read_chunk_from_cache(
        &self,
        chunk: Region,
        dest: &mut [u8],
        offset_in_chunk: u64,
        fetcher: &HttpFetcher,
        opts: &FetchOptions,
    ) -> bool {
        let Ok(mut reader) = self.cache.get(&fetcher.gen_id(chunk), &opts.cache_opts) else {
            return false;
        };
        // A short or failed read counts as a miss; the fetch path will
        // rewrite the entry.
        read_full(reader.as_mut(), dest, offset_in_chunk).is_ok()
    }

    async fn cache_at(
        &self,
        offset: u64,
        size: u64,
        fetcher: &Arc<HttpFetcher>,
        opts: &FetchOptions,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let all_region = Region::new(
            floor(offset, self.chunk_size),
            ceil(offset.saturating_add(size) - 1, self.chunk_size) - 1,
        );

        let mut chunks = Vec::new();
        walk_chunks(all_region, self.chunk_size, self.size, |chunk| {
            chunks.push(chunk);
            Ok(())
        })?;

        let mut missing: HashMap<Region, ChunkSink<'_>> = HashMap::new();
        for chunk in chunks {
            if self
                .cache
                .get(&fetcher.gen_id(chunk), &opts.cache_opts)
                .is_ok()
            {
                continue;
            }
            missing.insert(chunk, ChunkSink::Discard);
        }

        self.fetch_range(&mut missing, opts).await
    }

    /// Coalescing entry point: fetch every region in `all_data`, writing each
    /// chunk into the cache and its registered sink.
    ///
    /// Identical concurrent region sets share one request. Sharing callers
    /// read the committed chunks back from the cache; if that re-read fails
    /// (the backend evicted or corrupted an entry in the window between
    /// commit and copy), the whole round is retried once.
    async fn fetch_range(
        &self,
        all_data: &mut HashMap<Region, ChunkSink<'_>>,
        opts: &FetchOptions,
    ) -> Result<()> {
        if all_data.is_empty() {
            return Ok(());
        }

        let key = sync_key(all_data);
        let mut retried = false;
        loop {
            for sink in all_data.values_mut() {
                sink.reset();
            }
            let mut fetched: HashMap<Region, bool> = HashMap::new();
            let flight = {
                let all = &mut *all_data;
                let fetched = &mut fetched;
                self.fetch_group
                    .do_call(&key, || self.fetch_regions(all, fetched, opts))
                    .await
            };

            match flight {
                Flight::Led(result) => return result,
                Flight::Shared(Ok(())) => {
                    match self.copy_fetched_chunks(all_data, &fetched, opts).await {
                        Ok(()) => return Ok(()),
                        Err(err) if !retried => {
                            debug!(
                                error = %err,
                                "shared fetch result unavailable in cache; refetching"
                            );
                            retried = true;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Flight::Shared(Err(err)) => return Err(err),
                Flight::Abandoned => return Err(RemoteError::Cancelled),
            }
        }
    }

    /// The leader's fetch path, run once per single-flight key.
    async fn fetch_regions(
        &self,
        all_data: &mut HashMap<Region, ChunkSink<'_>>,
        fetched: &mut HashMap<Region, bool>,
        opts: &FetchOptions,
    ) -> Result<()> {
        if all_data.is_empty() {
            return Ok(());
        }

        let fetcher = self.fetcher_snapshot();
        let mut regions: Vec<Region> = all_data.keys().copied().collect();
        regions.sort();
        for reg in &regions {
            fetched.insert(*reg, false);
        }

        let work = async {
            let mut resp = fetcher.fetch(&regions, true).await?;
            // Reaching the blob doubles as a liveness check.
            self.touch_last_check(Instant::now());

            while let Some(part_region) = resp.next_region().await? {
                let mut chunks = Vec::new();
                walk_chunks(part_region, self.chunk_size, self.size, |chunk| {
                    chunks.push(chunk);
                    Ok(())
                })?;
                for chunk in chunks {
                    self.cache_chunk_data(&mut resp, chunk, &fetcher, all_data, fetched, opts)
                        .await?;
                }
            }

            let mut unfetched: Vec<Region> = fetched
                .iter()
                .filter(|&(_, &done)| !done)
                .map(|(reg, _)| *reg)
                .collect();
            if !unfetched.is_empty() {
                unfetched.sort();
                return Err(RemoteError::MissingRegions(unfetched));
            }
            Ok(())
        };

        match &opts.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(RemoteError::Cancelled),
                result = work => result,
            },
            None => match tokio::time::timeout(self.fetch_timeout, work).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            },
        }
    }

    /// Stream one chunk of the current response part into a fresh cache
    /// entry, teeing into the caller's sink when the chunk was asked for.
    async fn cache_chunk_data(
        &self,
        resp: &mut RangeResponse,
        chunk: Region,
        fetcher: &HttpFetcher,
        all_data: &mut HashMap<Region, ChunkSink<'_>>,
        fetched: &mut HashMap<Region, bool>,
        opts: &FetchOptions,
    ) -> Result<()> {
        let id = fetcher.gen_id(chunk);
        let mut writer = self
            .cache
            .add(&id, &opts.cache_opts)
            .map_err(|err| RemoteError::Cache(err.to_string()))?;

        let requested = fetched.contains_key(&chunk);
        let mut remaining = chunk.size();
        let streamed: Result<()> = loop {
            if remaining == 0 {
                break Ok(());
            }
            match resp.read_part(remaining).await {
                Ok(bytes) => {
                    if let Err(err) = writer.write_all(&bytes) {
                        break Err(RemoteError::Cache(err.to_string()));
                    }
                    if requested {
                        if let Some(sink) = all_data.get_mut(&chunk) {
                            sink.write_bytes(&bytes);
                        }
                    }
                    remaining -= bytes.len() as u64;
                }
                Err(err) => break Err(err),
            }
        };

        match streamed {
            Ok(()) => {
                writer
                    .commit()
                    .map_err(|err| RemoteError::Cache(err.to_string()))?;
                self.fetched_regions
                    .lock()
                    .expect("region set lock poisoned")
                    .add(chunk);
                fetched.insert(chunk, true);
                Ok(())
            }
            Err(err) => {
                let _ = writer.abort();
                Err(err)
            }
        }
    }

    /// Copy a shared fetch result from the cache into this caller's sinks.
    async fn copy_fetched_chunks(
        &self,
        all_data: &mut HashMap<Region, ChunkSink<'_>>,
        fetched: &HashMap<Region, bool>,
        opts: &FetchOptions,
    ) -> Result<()> {
        let fetcher = self.fetcher_snapshot();
        let _guard = self.shared_copy_lock.lock().await;

        let mut regions: Vec<Region> = all_data.keys().copied().collect();
        regions.sort();
        for chunk in regions {
            if fetched.contains_key(&chunk) {
                continue;
            }
            let mut reader = self
                .cache
                .get(&fetcher.gen_id(chunk), &opts.cache_opts)
                .map_err(|err| RemoteError::Cache(err.to_string()))?;
            let mut buf = vec![0u8; chunk.size() as usize];
            read_full(reader.as_mut(), &mut buf, 0)
                .map_err(|err| RemoteError::Cache(err.to_string()))?;
            if let Some(sink) = all_data.get_mut(&chunk) {
                sink.write_bytes(&buf);
            }
        }
        Ok(())
    }
}

/// Single-flight key: the sorted region list, rendered like `[0,2],[3,5]`.
fn sync_key(all_data: &HashMap<Region, ChunkSink<'_>>) -> String {
    let mut regions: Vec<Region> = all_data.keys().copied().collect();
    regions.sort();
    let parts: Vec<String> = regions.iter().map(Region::to_string).collect();
    parts.join(",")
}

fn read_full(reader: &mut dyn CacheReader, buf: &mut [u8], off: u64) -> CacheResult<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader.read_at(&mut buf[filled..], off + filled as u64)?;
        if n == 0 {
            return Err(CacheError::Io(format!(
                "incomplete read from cache: read {filled} bytes, expected {}",
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(())
}

/// Destination for one chunk's byte stream.
enum ChunkSink<'a> {
    /// Project the stream onto a window of the caller's buffer.
    Buffer(BytesWriter<'a>),
    /// Prefetch: the cache write is the point, the bytes go nowhere else.
    Discard,
}

impl ChunkSink<'_> {
    fn write_bytes(&mut self, p: &[u8]) {
        match self {
            ChunkSink::Buffer(writer) => writer.write_bytes(p),
            ChunkSink::Discard => {}
        }
    }

    /// Rewind before a fetch attempt is replayed.
    fn reset(&mut self) {
        if let ChunkSink::Buffer(writer) = self {
            writer.current = 0;
        }
    }
}

/// Streams a chunk-aligned byte stream into a sub-window of a caller buffer.
///
/// The cursor advances by the full length of every write regardless of how
/// much lands in `dest`; only the overlap with `[dest_off, dest_off +
/// dest.len())` is copied. This keeps cache writes chunk-sized while the
/// caller reads an arbitrary sub-range.
struct BytesWriter<'a> {
    dest: &'a mut [u8],
    dest_off: u64,
    current: u64,
}

impl<'a> BytesWriter<'a> {
    fn new(dest: &'a mut [u8], dest_off: u64) -> Self {
        Self {
            dest,
            dest_off,
            current: 0,
        }
    }

    fn write_bytes(&mut self, p: &[u8]) {
        let dest_len = self.dest.len() as u64;
        let dest_base = self.current.saturating_sub(self.dest_off);
        let p_begin = self.dest_off.saturating_sub(self.current);
        let p_end = (self.dest_off + dest_len)
            .saturating_sub(self.current)
            .min(p.len() as u64);
        self.current += p.len() as u64;

        if dest_base < dest_len && p_begin < p_end {
            let dest_base = dest_base as usize;
            let (p_begin, p_end) = (p_begin as usize, p_end as usize);
            let n = p_end - p_begin;
            self.dest[dest_base..dest_base + n].copy_from_slice(&p[p_begin..p_end]);
        }
    }
}

impl Write for BytesWriter<'_> {
    fn write(&mut self, p: &[u8]) -> std::io::Result<usize> {
        self.write_bytes(p);
        Ok(p.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_writer_fills_full_window() {
        let mut dest = [0u8; 6];
        let mut w = BytesWriter::new(&mut dest, 0);
        w.write_bytes(b"012345");
        assert_eq!(&dest, b"012345");
    }

    #[test]
    fn bytes_writer_projects_offset_window() {
        // Chunk stream "012345", caller wants bytes [2, 5) of the chunk.
        let mut dest = [0u8; 3];
        let mut w = BytesWriter::new(&mut dest, 2);
        w.write_bytes(b"012345");
        assert_eq!(&dest, b"234");
    }

    #[test]
    fn bytes_writer_handles_split_writes() {
        let mut dest = [0u8; 3];
        let mut w = BytesWriter::new(&mut dest, 2);
        // Stream arrives in fragments straddling the window edges.
        w.write_bytes(b"0");
        w.write_bytes(b"12");
        w.write_bytes(b"34");
        w.write_bytes(b"5");
        assert_eq!(&dest, b"234");
    }

    #[test]
    fn bytes_writer_ignores_bytes_outside_window() {
        let mut dest = [0u8; 2];
        let mut w = BytesWriter::new(&mut dest, 3);
        w.write_bytes(b"012"); // entirely before the window
        assert_eq!(w.dest, &[0, 0]);
        w.write_bytes(b"34");
        assert_eq!(w.dest, b"34");
        w.write_bytes(b"56789"); // entirely after the window
        assert_eq!(w.dest, b"34");
    }

    #[test]
    fn bytes_writer_cursor_advances_through_empty_window() {
        let mut dest: [u8; 0] = [];
        let mut w = BytesWriter::new(&mut dest, 1);
        w.write_bytes(b"0123");
        assert_eq!(w.current, 4);
    }

    #[test]
    fn bytes_writer_io_write_reports_full_length() {
        let mut dest = [0u8; 2];
        let mut w = BytesWriter::new(&mut dest, 0);
        assert_eq!(w.write(b"01234").unwrap(), 5);
        assert_eq!(&dest, b"01");
    }

    #[test]
    fn sink_reset_allows_replay() {
        let mut dest = [0u8; 3];
        let mut sink = ChunkSink::Buffer(BytesWriter::new(&mut dest, 0));
        sink.write_bytes(b"abc");
        sink.reset();
        sink.write_bytes(b"xyz");
        assert_eq!(&dest, b"xyz");
    }

    #[test]
    fn sync_key_is_sorted_and_deterministic() {
        let mut a: HashMap<Region, ChunkSink<'_>> = HashMap::new();
        a.insert(Region::new(3, 5), ChunkSink::Discard);
        a.insert(Region::new(0, 2), ChunkSink::Discard);

        let mut b: HashMap<Region, ChunkSink<'_>> = HashMap::new();
        b.insert(Region::new(0, 2), ChunkSink::Discard);
        b.insert(Region::new(3, 5), ChunkSink::Discard);

        assert_eq!(sync_key(&a), "[0,2],[3,5]");
        assert_eq!(sync_key(&a), sync_key(&b));
    }
}
