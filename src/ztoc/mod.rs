//! ZToC (Zipped Table of Contents): the precomputed index that makes a gzip
//! layer randomly accessible. The uncompressed byte space is tiled by
//! fixed-size spans; each span records its compressed range, the digest of its
//! compressed bytes, and the inflate checkpoint needed to resume decompression
//! at its start.

pub mod builder;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub use builder::ZtocBuilder;

/// Index of a span within a layer. Spans are numbered from zero in
/// uncompressed-offset order.
pub type SpanId = u32;

/// Default uncompressed bytes per span (4 MiB).
pub const DEFAULT_SPAN_SIZE: u64 = 4 * 1024 * 1024;

/// Captured decompressor state sufficient to resume raw DEFLATE decoding at a
/// span's first compressed byte.
#[derive(Debug, Clone)]
pub struct InflateCheckpoint {
    /// Bits of the span's first compressed byte already consumed by the
    /// preceding span. Zero when the span starts byte-aligned.
    pub bit_offset: u8,
    /// Up to 32 KiB of uncompressed bytes immediately preceding the span,
    /// preloaded as the back-reference window. Empty for the first span.
    pub window: Bytes,
}

/// Per-span entry of the index.
#[derive(Debug, Clone)]
pub struct SpanInfo {
    /// Compressed byte range `[start, end)` within the layer blob.
    pub start_comp_offset: u64,
    pub end_comp_offset: u64,
    /// Uncompressed byte range `[start, end)` this span represents.
    pub start_uncomp_offset: u64,
    pub end_uncomp_offset: u64,
    /// Digest of the compressed span bytes, `sha256:<hex>`.
    pub digest: String,
    pub checkpoint: InflateCheckpoint,
}

/// Location of one file's content inside the uncompressed layer. Tar parsing
/// lives above this crate; only offset, size, and mode survive into the index.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub path: String,
    pub uncompressed_offset: u64,
    pub uncompressed_size: u64,
    pub mode: u32,
}

/// Read-only view over a built index. Immutable after construction and freely
/// shareable across threads.
#[derive(Debug)]
pub struct Ztoc {
    span_size: u64,
    spans: Vec<SpanInfo>,
    files: Vec<FileMetadata>,
}

impl Ztoc {
    /// Assemble a view from its parts, checking the structural invariants:
    /// spans tile `[0, total)` without gaps or overlaps, every span except the
    /// last is exactly `span_size` long, digests are non-empty, and windows
    /// fit the DEFLATE back-reference limit.
    pub fn new(span_size: u64, spans: Vec<SpanInfo>, files: Vec<FileMetadata>) -> Result<Self> {
        if span_size == 0 {
            return Err(Error::InvalidZtoc("span size must be non-zero"));
        }
        if spans.is_empty() {
            return Err(Error::InvalidZtoc("ztoc has no spans"));
        }
        if spans.len() > (SpanId::MAX as usize) + 1 {
            return Err(Error::InvalidZtoc("span count overflows span id space"));
        }
        let mut expected_start = 0u64;
        let last = spans.len() - 1;
        for (i, span) in spans.iter().enumerate() {
            if span.start_uncomp_offset != expected_start {
                return Err(Error::InvalidZtoc("spans do not tile the uncompressed space"));
            }
            let len = span
                .end_uncomp_offset
                .checked_sub(span.start_uncomp_offset)
                .ok_or(Error::InvalidZtoc("span has negative uncompressed length"))?;
            if len == 0 || len > span_size {
                return Err(Error::InvalidZtoc("span uncompressed length out of range"));
            }
            if i < last && len != span_size {
                return Err(Error::InvalidZtoc("only the last span may be short"));
            }
            if span.start_comp_offset >= span.end_comp_offset {
                return Err(Error::InvalidZtoc("span has empty compressed range"));
            }
            if span.digest.is_empty() {
                return Err(Error::InvalidZtoc("span digest is empty"));
            }
            if span.checkpoint.bit_offset >= 8 {
                return Err(Error::InvalidZtoc("checkpoint bit offset out of range"));
            }
            if span.checkpoint.window.len() > crate::inflate::WINDOW_SIZE {
                return Err(Error::InvalidZtoc("checkpoint window exceeds 32 KiB"));
            }
            expected_start = span.end_uncomp_offset;
        }
        Ok(Self {
            span_size,
            spans,
            files,
        })
    }

    #[inline]
    pub fn span_size(&self) -> u64 {
        self.span_size
    }

    /// Inclusive upper bound of valid span ids.
    #[inline]
    pub fn max_span_id(&self) -> SpanId {
        (self.spans.len() - 1) as SpanId
    }

    #[inline]
    pub fn span_count(&self) -> u32 {
        self.spans.len() as u32
    }

    /// Total uncompressed size of the layer.
    #[inline]
    pub fn total_uncompressed_size(&self) -> u64 {
        self.spans[self.spans.len() - 1].end_uncomp_offset
    }

    /// Span covering an uncompressed offset, clamped to the last span for
    /// offsets at or past the end of the layer.
    #[inline]
    pub fn span_of(&self, uncomp_offset: u64) -> SpanId {
        let id = uncomp_offset / self.span_size;
        (id.min(self.max_span_id() as u64)) as SpanId
    }

    pub fn span(&self, id: SpanId) -> Option<&SpanInfo> {
        self.spans.get(id as usize)
    }

    pub fn spans(&self) -> &[SpanInfo] {
        &self.spans
    }

    /// Look up a file recorded in the index by path.
    pub fn file_metadata(&self, path: &str) -> Option<&FileMetadata> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn files(&self) -> &[FileMetadata] {
        &self.files
    }
}

/// Content digest in the `sha256:<hex>` form used throughout the index and as
/// the compressed-namespace cache key.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}
