//! Push-time index construction: gzip a layer with a flush point at every
//! span boundary and record the resulting ZToC.
//!
//! A sync flush at each boundary byte-aligns the stream without resetting the
//! back-reference window, so every checkpoint the builder emits has bit offset
//! zero and a window equal to the 32 KiB of uncompressed data preceding the
//! span. The decoder accepts arbitrary bit offsets; the builder just never
//! produces one.

use bytes::Bytes;
use flate2::{Compress, Compression, FlushCompress, Status};

use crate::error::{Error, Result};
use crate::inflate::WINDOW_SIZE;
use crate::ztoc::{sha256_digest, FileMetadata, InflateCheckpoint, SpanInfo, Ztoc};

const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff];

/// Builds a gzip layer blob and its ZToC from named file contents. Files are
/// concatenated in insertion order to form the uncompressed layer byte
/// stream.
pub struct ZtocBuilder {
    span_size: u64,
    level: Compression,
    files: Vec<(String, u32, Bytes)>,
}

impl ZtocBuilder {
    pub fn new(span_size: u64) -> Self {
        Self {
            span_size,
            level: Compression::default(),
            files: Vec::new(),
        }
    }

    /// Gzip compression level, 0-9.
    pub fn compression_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level);
        self
    }

    pub fn add_file(self, path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.add_file_with_mode(path, 0o644, content)
    }

    pub fn add_file_with_mode(
        mut self,
        path: impl Into<String>,
        mode: u32,
        content: impl Into<Bytes>,
    ) -> Self {
        self.files.push((path.into(), mode, content.into()));
        self
    }

    /// Compress the layer and emit `(ztoc, blob)`. The blob is a complete
    /// gzip member (header, deflate stream, CRC32/ISIZE trailer); span
    /// compressed offsets point inside it.
    pub fn build(self) -> Result<(Ztoc, Bytes)> {
        if self.span_size == 0 {
            return Err(Error::InvalidZtoc("span size must be non-zero"));
        }

        let mut files = Vec::with_capacity(self.files.len());
        let mut layer = Vec::new();
        for (path, mode, content) in &self.files {
            files.push(FileMetadata {
                path: path.clone(),
                uncompressed_offset: layer.len() as u64,
                uncompressed_size: content.len() as u64,
                mode: *mode,
            });
            layer.extend_from_slice(content);
        }
        if layer.is_empty() {
            return Err(Error::InvalidZtoc("layer has no content"));
        }

        let mut blob = Vec::with_capacity(layer.len() / 2 + 64);
        blob.extend_from_slice(&GZIP_HEADER);

        let mut compressor = Compress::new(self.level, false);
        let mut spans = Vec::new();
        let span_size = self.span_size as usize;
        let chunk_count = layer.len().div_ceil(span_size);

        for (i, chunk) in layer.chunks(span_size).enumerate() {
            let start_uncomp = (i * span_size) as u64;
            let start_comp = blob.len() as u64;
            let window_start = (i * span_size).saturating_sub(WINDOW_SIZE);
            let checkpoint = InflateCheckpoint {
                bit_offset: 0,
                window: Bytes::copy_from_slice(&layer[window_start..i * span_size]),
            };

            deflate_all(&mut compressor, chunk, &mut blob)?;
            flush_boundary(&mut compressor, &mut blob, i + 1 == chunk_count)?;

            let end_comp = blob.len() as u64;
            spans.push(SpanInfo {
                start_comp_offset: start_comp,
                end_comp_offset: end_comp,
                start_uncomp_offset: start_uncomp,
                end_uncomp_offset: start_uncomp + chunk.len() as u64,
                digest: sha256_digest(&blob[start_comp as usize..end_comp as usize]),
                checkpoint,
            });
        }

        let mut crc = flate2::Crc::new();
        crc.update(&layer);
        blob.extend_from_slice(&crc.sum().to_le_bytes());
        blob.extend_from_slice(&(layer.len() as u32).to_le_bytes());

        let ztoc = Ztoc::new(self.span_size, spans, files)?;
        Ok((ztoc, Bytes::from(blob)))
    }
}

fn compress_err(err: flate2::CompressError) -> Error {
    Error::Compress(err.to_string())
}

fn deflate_all(compressor: &mut Compress, mut input: &[u8], out: &mut Vec<u8>) -> Result<()> {
    while !input.is_empty() {
        out.reserve(input.len() / 2 + 64);
        let before = compressor.total_in();
        compressor
            .compress_vec(input, out, FlushCompress::None)
            .map_err(compress_err)?;
        let consumed = (compressor.total_in() - before) as usize;
        input = &input[consumed..];
    }
    Ok(())
}

fn flush_boundary(compressor: &mut Compress, out: &mut Vec<u8>, finish: bool) -> Result<()> {
    let flush = if finish {
        FlushCompress::Finish
    } else {
        FlushCompress::Sync
    };
    loop {
        out.reserve(4096);
        let before = compressor.total_out();
        let status = compressor
            .compress_vec(&[], out, flush)
            .map_err(compress_err)?;
        if finish {
            if status == Status::StreamEnd {
                return Ok(());
            }
        } else if compressor.total_out() == before {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inflate::inflate_span;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 11 + i / 17) % 253) as u8).collect()
    }

    #[test]
    fn test_build_single_span() {
        let content = patterned(4096);
        let (ztoc, blob) = ZtocBuilder::new(65536)
            .add_file("a.txt", content.clone())
            .build()
            .unwrap();
        assert_eq!(ztoc.max_span_id(), 0);
        assert_eq!(ztoc.total_uncompressed_size(), 4096);
        assert_eq!(&blob[..3], &[0x1f, 0x8b, 0x08]);

        let span = ztoc.span(0).unwrap();
        assert_eq!(span.start_comp_offset, GZIP_HEADER.len() as u64);
        let compressed = &blob[span.start_comp_offset as usize..span.end_comp_offset as usize];
        assert_eq!(span.digest, sha256_digest(compressed));
        let out = inflate_span(&span.checkpoint, compressed, 4096).unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn test_build_multi_span_decodes_each_span() {
        let content = patterned(300_000);
        let span_size = 65536u64;
        let (ztoc, blob) = ZtocBuilder::new(span_size)
            .add_file("big.bin", content.clone())
            .build()
            .unwrap();
        assert_eq!(ztoc.span_count() as u64, 300_000_u64.div_ceil(span_size));

        for span in ztoc.spans() {
            let compressed = &blob[span.start_comp_offset as usize..span.end_comp_offset as usize];
            let expected = span.end_uncomp_offset - span.start_uncomp_offset;
            let out = inflate_span(&span.checkpoint, compressed, expected).unwrap();
            assert_eq!(
                out,
                content[span.start_uncomp_offset as usize..span.end_uncomp_offset as usize]
            );
        }
    }

    #[test]
    fn test_spans_are_contiguous_in_both_spaces() {
        let content = patterned(200_001);
        let (ztoc, _) = ZtocBuilder::new(65536)
            .add_file("odd.bin", content)
            .build()
            .unwrap();
        let spans = ztoc.spans();
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end_uncomp_offset, pair[1].start_uncomp_offset);
            assert_eq!(pair[0].end_comp_offset, pair[1].start_comp_offset);
        }
        assert_eq!(
            spans.last().unwrap().end_uncomp_offset - spans.last().unwrap().start_uncomp_offset,
            200_001 % 65536
        );
    }

    #[test]
    fn test_file_offsets_follow_insertion_order() {
        let (ztoc, _) = ZtocBuilder::new(1024)
            .add_file("first", vec![1u8; 100])
            .add_file_with_mode("second", 0o755, vec![2u8; 50])
            .build()
            .unwrap();
        let first = ztoc.file_metadata("first").unwrap();
        let second = ztoc.file_metadata("second").unwrap();
        assert_eq!(first.uncompressed_offset, 0);
        assert_eq!(first.uncompressed_size, 100);
        assert_eq!(second.uncompressed_offset, 100);
        assert_eq!(second.uncompressed_size, 50);
        assert_eq!(second.mode, 0o755);
    }

    #[test]
    fn test_empty_layer_rejected() {
        let err = ZtocBuilder::new(1024).build().unwrap_err();
        assert!(matches!(err, Error::InvalidZtoc(_)));
    }
}
