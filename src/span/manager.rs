//! The resolver: drives spans through fetch, verification, caching, and
//! decompression, coalescing concurrent callers so each span is fetched at
//! most once per generation.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::blob::BlobReader;
use crate::cache::{uncompressed_key, SpanCache};
use crate::error::{Error, Result};
use crate::inflate::inflate_span;
use crate::span::{SpanRecord, SpanState, SpanTable};
use crate::ztoc::{sha256_digest, SpanId, Ztoc};

use super::reader::ContentReader;

/// Lazy access engine over one compressed layer. Shared freely across
/// concurrent readers; all per-span coordination is internal.
///
/// A span advances `Unrequested → Requested → Fetched → Uncompressed`.
/// Prefetch ([`resolve_span`](Self::resolve_span)) stops at `Fetched`
/// (compressed bytes verified and cached); serving content
/// ([`get_span_content`](Self::get_span_content),
/// [`get_contents`](Self::get_contents)) drives spans to `Uncompressed`.
pub struct SpanManager<B, C> {
    ztoc: Ztoc,
    blob: B,
    cache: C,
    table: SpanTable,
}

impl<B: BlobReader, C: SpanCache> SpanManager<B, C> {
    pub fn new(ztoc: Ztoc, blob: B, cache: C) -> Self {
        let table = SpanTable::from_ztoc(&ztoc);
        Self {
            ztoc,
            blob,
            cache,
            table,
        }
    }

    pub fn ztoc(&self) -> &Ztoc {
        &self.ztoc
    }

    /// Current resolution state of a span.
    pub fn span_state(&self, id: SpanId) -> Result<SpanState> {
        Ok(self.record(id)?.state())
    }

    /// Drive a span to `Fetched`: read its compressed range from the blob,
    /// verify the digest, and cache the compressed bytes. Does not
    /// decompress. Idempotent: a span at `Fetched` or beyond is left alone.
    pub async fn resolve_span(&self, id: SpanId) -> Result<()> {
        self.ensure_state(id, SpanState::Fetched).await
    }

    /// Prefetch every span in id order.
    pub async fn resolve_all(&self) -> Result<()> {
        for id in 0..=self.ztoc.max_span_id() {
            self.resolve_span(id).await?;
        }
        Ok(())
    }

    /// Uncompressed bytes `[offset, offset + length)` within a span, clamped
    /// to the span's extent, driving the span to `Uncompressed` first.
    /// `length == 0` returns empty bytes without touching span state.
    pub async fn get_span_content(&self, id: SpanId, offset: u64, length: u64) -> Result<Bytes> {
        self.record(id)?;
        if length == 0 {
            return Ok(Bytes::new());
        }
        self.ensure_state(id, SpanState::Uncompressed).await?;
        self.read_uncompressed(id, offset, length).await
    }

    /// Lazy ordered stream over the uncompressed range `[start, end)`. Spans
    /// are resolved one at a time as the stream is consumed; an empty or
    /// inverted range yields an empty stream without touching the blob.
    pub fn get_contents(&self, start: u64, end: u64) -> ContentReader<'_, B, C> {
        ContentReader::new(self, start, end)
    }

    fn record(&self, id: SpanId) -> Result<&SpanRecord> {
        self.table.get(id).ok_or(Error::ExceedMaxSpan {
            id,
            max: self.ztoc.max_span_id(),
        })
    }

    /// Core resolution loop: fast-path the already-resolved case, otherwise
    /// serialize on the span's gate and perform whatever work remains.
    /// Concurrent resolvers park on the gate and observe the claimant's
    /// outcome through the span state.
    async fn ensure_state(&self, id: SpanId, target: SpanState) -> Result<()> {
        let record = self.record(id)?;
        if record.state() >= target {
            return Ok(());
        }

        let _gate = record.gate.lock().await;
        let mut state = record.state();
        if state == SpanState::Requested {
            // The previous claimant unwound without completing or rolling
            // back; reclaim the span for a fresh generation.
            record.rollback();
            state = SpanState::Unrequested;
        }
        if state == SpanState::Unrequested {
            self.fetch_span(id, record).await?;
            state = SpanState::Fetched;
        }
        if target == SpanState::Uncompressed && state == SpanState::Fetched {
            self.decompress_span(id, record).await?;
        }
        Ok(())
    }

    /// Winner path, gate held: blob read, digest verification, compressed
    /// cache fill, `Requested → Fetched`. Any exit before completion
    /// (error, panic, or the caller's future being dropped) rolls the span
    /// back so the next caller can retry.
    async fn fetch_span(&self, id: SpanId, record: &SpanRecord) -> Result<()> {
        record.transition(SpanState::Requested)?;
        let claim = ClaimGuard::new(record);

        let len = record.compressed_len() as usize;
        let mut compressed = vec![0u8; len];
        self.blob
            .read_exact_at(record.start_comp_offset, &mut compressed)
            .await?;

        let actual = sha256_digest(&compressed);
        if actual != record.digest {
            warn!(
                span = id,
                expected = %record.digest,
                actual = %actual,
                "span digest mismatch, rolling back"
            );
            return Err(Error::IncorrectSpanDigest {
                id,
                expected: record.digest.clone(),
                actual,
            });
        }

        self.cache.put(&record.digest, &compressed).await?;
        claim.complete(SpanState::Fetched)?;
        debug!(span = id, bytes = len, "span fetched");
        Ok(())
    }

    /// Gate held, state `Fetched`: inflate the cached compressed bytes from
    /// the span's checkpoint, cache the result under the uncompressed
    /// namespace, advance to `Uncompressed`. Failures leave the span
    /// `Fetched`; decompression can be retried from cache without refetching.
    async fn decompress_span(&self, id: SpanId, record: &SpanRecord) -> Result<()> {
        let compressed = self
            .cache
            .get(&record.digest, 0, record.compressed_len())
            .await?;
        let info = self.record_info(id)?;
        let uncompressed = inflate_span(&info.checkpoint, &compressed, record.uncompressed_len())?;
        self.cache
            .put(&uncompressed_key(&record.digest), &uncompressed)
            .await?;
        record.transition(SpanState::Uncompressed)?;
        debug!(span = id, bytes = uncompressed.len(), "span decompressed");
        Ok(())
    }

    fn record_info(&self, id: SpanId) -> Result<&crate::ztoc::SpanInfo> {
        self.ztoc.span(id).ok_or(Error::ExceedMaxSpan {
            id,
            max: self.ztoc.max_span_id(),
        })
    }

    /// Serve bytes from the uncompressed cache without resolving. The span
    /// must already be `Uncompressed`.
    pub(crate) async fn read_uncompressed(
        &self,
        id: SpanId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let record = self.record(id)?;
        let state = record.state();
        if state < SpanState::Uncompressed {
            return Err(Error::SpanNotAvailable { id, state });
        }
        let span_len = record.uncompressed_len();
        let offset = offset.min(span_len);
        let length = length.min(span_len - offset);
        trace!(span = id, offset, length, "serving span content from cache");
        self.cache
            .get(&uncompressed_key(&record.digest), offset, length)
            .await
    }
}

/// Rolls a claimed span back to `Unrequested` unless the claim completed.
/// Dropping the claimant's future mid-fetch runs this before the gate is
/// released, so cancellation cannot strand a span in `Requested`.
struct ClaimGuard<'a> {
    record: &'a SpanRecord,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    fn new(record: &'a SpanRecord) -> Self {
        Self {
            record,
            armed: true,
        }
    }

    fn complete(mut self, to: SpanState) -> Result<()> {
        self.record.transition(to)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.record.rollback();
        }
    }
}
