//! Lazy remote blob reader with chunk-level caching and request coalescing.
//!
//! This crate is the data plane beneath a lazily-pulling container image
//! filesystem: file-level readers sit on top of a [`Blob`] per image layer
//! and stream layer bytes on demand from an OCI registry.
//!
//! - [`Blob`]: random-access reads (`read_at`), prefetch (`cache`), liveness
//!   checks and credential refresh over one remote blob
//! - [`HttpFetcher`]: multi-range HTTP requests and response part iteration
//! - [`BlobCache`]: the chunk store interface the reader populates, with
//!   [`MemoryCache`] as the bundled in-memory implementation
//! - [`Resolver`]: turns registry hosts + refspec + descriptor into blobs
//!
//! Reads are aligned onto a chunk grid and cached chunk by chunk, so nearby
//! reads are served locally. Concurrent misses for the same chunk set are
//! coalesced into a single upstream request.

mod blob;
mod cache;
mod error;
mod fetcher;
mod region;
mod resolver;
mod singleflight;

pub use blob::{Blob, BlobConfig, FetchOptions, DEFAULT_CHUNK_SIZE};
pub use cache::{BlobCache, CacheError, CacheOpts, CacheReader, CacheWriter, MemoryCache};
pub use error::{RemoteError, Result};
pub use fetcher::{build_client, HttpFetcher, HttpsClient, RangeResponse};
pub use region::{Region, RegionSet};
pub use resolver::{Descriptor, Refspec, RegistryHost, Resolver};
