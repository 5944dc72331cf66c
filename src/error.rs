//! Crate-wide error surface. Span resolution has a contractual set of failure
//! kinds (bounds, integrity, state machine, cache, decompress), so everything
//! is one enum rather than per-module error types.

use thiserror::Error;

use crate::span::SpanState;
use crate::ztoc::SpanId;

#[derive(Debug, Error)]
pub enum Error {
    /// A span id past the end of the ZToC.
    #[error("span {id} exceeds max span id {max}")]
    ExceedMaxSpan { id: SpanId, max: SpanId },

    /// Fetched compressed bytes did not hash to the digest recorded in the
    /// ZToC. The span is rolled back so a later caller may retry.
    #[error("span {id} digest mismatch: expected {expected}, got {actual}")]
    IncorrectSpanDigest {
        id: SpanId,
        expected: String,
        actual: String,
    },

    /// The state machine was asked to make an edge it does not allow.
    #[error("invalid span state transition: {from} -> {to}")]
    InvalidStateTransition { from: SpanState, to: SpanState },

    /// Uncompressed bytes were requested from a span that has not been
    /// decompressed.
    #[error("span {id} content not available in state {state}")]
    SpanNotAvailable { id: SpanId, state: SpanState },

    #[error("decompress failed: {0}")]
    Decompress(String),

    #[error("compress failed: {0}")]
    Compress(String),

    /// Distinguishable from other cache failures per the cache contract.
    #[error("cache key not found: {key}")]
    CacheMiss { key: String },

    #[error("cache is closed")]
    CacheClosed,

    #[error("invalid ztoc: {0}")]
    InvalidZtoc(&'static str),

    /// The blob ended before the requested compressed range.
    #[error("blob read truncated at offset {offset}: wanted {wanted} bytes, got {got}")]
    TruncatedBlob {
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for [`Error::CacheMiss`]; lets callers branch on "not cached"
    /// without destructuring.
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Error::CacheMiss { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
