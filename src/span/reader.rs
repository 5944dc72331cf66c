//! Lazy range reads: an uncompressed `[start, end)` request becomes an
//! ordered walk over the covering spans, each resolved only when the stream
//! reaches it.

use bytes::Bytes;

use crate::blob::BlobReader;
use crate::cache::SpanCache;
use crate::error::{Error, Result};
use crate::span::manager::SpanManager;

/// Ordered, non-restartable stream over an uncompressed byte range. Bytes
/// already yielded stay valid if a later span fails; the failure surfaces on
/// the next read.
pub struct ContentReader<'a, B, C> {
    manager: &'a SpanManager<B, C>,
    cursor: u64,
    end: u64,
}

impl<'a, B: BlobReader, C: SpanCache> ContentReader<'a, B, C> {
    pub(crate) fn new(manager: &'a SpanManager<B, C>, start: u64, end: u64) -> Self {
        let end = end.min(manager.ztoc().total_uncompressed_size());
        Self {
            manager,
            cursor: start.min(end),
            end,
        }
    }

    /// Bytes not yet yielded.
    pub fn remaining(&self) -> u64 {
        self.end - self.cursor
    }

    /// Yield the next contiguous piece: the covered part of the span under
    /// the cursor, resolved on demand. `None` once the range is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.cursor >= self.end {
            return Ok(None);
        }
        let ztoc = self.manager.ztoc();
        let id = ztoc.span_of(self.cursor);
        let span = ztoc.span(id).ok_or(Error::ExceedMaxSpan {
            id,
            max: ztoc.max_span_id(),
        })?;
        let offset_in_span = self.cursor - span.start_uncomp_offset;
        let take = span.end_uncomp_offset.min(self.end) - self.cursor;

        let chunk = self
            .manager
            .get_span_content(id, offset_in_span, take)
            .await?;
        if chunk.len() as u64 != take {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("span {id} yielded {} bytes, wanted {take}", chunk.len()),
            )));
        }
        self.cursor += take;
        Ok(Some(chunk))
    }

    /// Drain the stream into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.remaining() as usize);
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
