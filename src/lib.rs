//! Lazy span-level access to gzip-compressed container image layers.
//!
//! A layer normally has to be downloaded and decompressed in full before any
//! file inside is readable. This crate consumes a precomputed ZToC (Zipped
//! Table of Contents) that tiles the layer's uncompressed byte space into
//! fixed-size spans, each with its compressed range, a digest of the
//! compressed bytes, and a checkpoint to resume DEFLATE decoding; the
//! [`SpanManager`] then fetches, verifies, caches, and decompresses exactly
//! the spans a read touches.
//!
//! ```no_run
//! # async fn demo() -> layerspan::Result<()> {
//! use layerspan::{MemoryBlobReader, MemoryCache, SpanManager, ZtocBuilder};
//!
//! let (ztoc, blob) = ZtocBuilder::new(65536)
//!     .add_file("app/config", vec![0u8; 200_000])
//!     .build()?;
//! let manager = SpanManager::new(ztoc, MemoryBlobReader::new(blob), MemoryCache::new());
//!
//! let meta = manager.ztoc().file_metadata("app/config").unwrap();
//! let (start, end) = (
//!     meta.uncompressed_offset,
//!     meta.uncompressed_offset + meta.uncompressed_size,
//! );
//! let content = manager.get_contents(start, end).read_to_end().await?;
//! # let _ = content;
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod cache;
mod error;
mod inflate;
pub mod span;
pub mod ztoc;

pub use blob::{BlobReader, FileBlobReader, MemoryBlobReader};
pub use cache::{uncompressed_key, DirectoryCache, MemoryCache, SpanCache};
pub use error::{Error, Result};
pub use span::manager::SpanManager;
pub use span::reader::ContentReader;
pub use span::{validate_transition, SpanState};
pub use ztoc::{
    FileMetadata, InflateCheckpoint, SpanId, SpanInfo, Ztoc, ZtocBuilder, DEFAULT_SPAN_SIZE,
};
