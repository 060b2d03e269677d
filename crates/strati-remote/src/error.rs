use crate::region::Region;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors surfaced by the remote blob reader.
///
/// The enum is `Clone` so a single fetch outcome can be fanned out to every
/// caller coalesced onto it; transport and cache causes are carried as
/// strings for the same reason.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("blob is already closed")]
    BlobClosed,

    #[error("invalid size of refreshed blob {got}; want {want}")]
    SizeMismatch { got: u64, want: u64 },

    #[error("region ({b}, {e}) must be aligned to chunk size {chunk_size}")]
    MisalignedRegion { b: u64, e: u64, chunk_size: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16 },

    #[error("malformed range response: {0}")]
    MalformedResponse(String),

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: u64, got: u64 },

    #[error("fetch did not cover requested regions: {0:?}")]
    MissingRegions(Vec<Region>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("fetch timed out")]
    Timeout,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("failed to resolve blob: {0}")]
    Resolve(String),
}
