//! Resumable raw-DEFLATE decoding for span content.
//!
//! A span's compressed bytes are a slice out of the middle of a layer's
//! DEFLATE stream. Resuming there needs two pieces of state a conventional
//! inflate API does not accept: the bit offset within the first byte, and the
//! preceding 32 KiB of uncompressed output as the back-reference window. Both
//! come from the span's ZToC checkpoint, so the RFC 1951 machinery is embedded
//! here: an LSB-first bit cursor, canonical Huffman decoding driven by
//! per-length counts, and a ring window seeded from the checkpoint.
//!
//! Decoding stops as soon as the span's expected uncompressed length has been
//! produced and never reads past the provided compressed slice.

use crate::error::{Error, Result};
use crate::ztoc::InflateCheckpoint;

/// DEFLATE back-reference window (RFC 1951 limit).
pub(crate) const WINDOW_SIZE: usize = 32 * 1024;

const MAX_CODE_LENGTH: usize = 15;

const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];
const LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];
/// Order in which code-length code lengths are stored in a dynamic block
/// header.
const CODELEN_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

fn corrupt(msg: &str) -> Error {
    Error::Decompress(msg.to_string())
}

/// Decompress one span. `compressed` is exactly the span's compressed range;
/// the result is exactly `expected_len` bytes or an error.
pub(crate) fn inflate_span(
    checkpoint: &InflateCheckpoint,
    compressed: &[u8],
    expected_len: u64,
) -> Result<Vec<u8>> {
    let expected = expected_len as usize;
    if expected == 0 {
        return Ok(Vec::new());
    }
    let mut decoder = SpanDecoder::new(checkpoint, compressed, expected);
    decoder.run()?;
    Ok(decoder.out)
}

/// LSB-first bit cursor over a compressed slice. Running off the end of the
/// slice is a hard error: the ZToC guarantees a span decodes within its own
/// compressed range.
struct BitCursor<'a> {
    data: &'a [u8],
    byte: usize,
    bit: u8,
}

impl<'a> BitCursor<'a> {
    fn new(data: &'a [u8], bit_offset: u8) -> Self {
        Self {
            data,
            byte: 0,
            bit: bit_offset,
        }
    }

    #[inline]
    fn read_bit(&mut self) -> Result<u32> {
        let b = *self
            .data
            .get(self.byte)
            .ok_or_else(|| corrupt("compressed span truncated"))?;
        let bit = (b >> self.bit) & 1;
        self.bit += 1;
        if self.bit == 8 {
            self.bit = 0;
            self.byte += 1;
        }
        Ok(bit as u32)
    }

    #[inline]
    fn read_bits(&mut self, count: u8) -> Result<u32> {
        let mut value = 0u32;
        for i in 0..count {
            value |= self.read_bit()? << i;
        }
        Ok(value)
    }

    /// Discard bits up to the next byte boundary (stored-block headers are
    /// byte-aligned).
    #[inline]
    fn align(&mut self) {
        if self.bit != 0 {
            self.bit = 0;
            self.byte += 1;
        }
    }

    #[inline]
    fn read_aligned_byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.byte)
            .ok_or_else(|| corrupt("compressed span truncated"))?;
        self.byte += 1;
        Ok(b)
    }

    #[inline]
    fn read_u16_le(&mut self) -> Result<u16> {
        let lo = self.read_aligned_byte()? as u16;
        let hi = self.read_aligned_byte()? as u16;
        Ok(lo | (hi << 8))
    }
}

/// Canonical Huffman code, decoded by walking per-length code counts: at each
/// length the accumulated code value is compared against the first code of
/// that length, indexing into the length-sorted symbol list on a hit.
struct CodeTable {
    counts: [u16; MAX_CODE_LENGTH + 1],
    symbols: Vec<u16>,
}

impl CodeTable {
    fn from_lengths(lengths: &[u8]) -> Result<Self> {
        let mut counts = [0u16; MAX_CODE_LENGTH + 1];
        for &len in lengths {
            if len as usize > MAX_CODE_LENGTH {
                return Err(corrupt("huffman code length exceeds 15"));
            }
            counts[len as usize] += 1;
        }
        if counts[0] as usize == lengths.len() {
            return Err(corrupt("huffman table has no codes"));
        }

        // Reject over-subscribed code sets; incomplete ones are legal and
        // simply leave some codes undecodable.
        let mut remaining: i32 = 1;
        for len in 1..=MAX_CODE_LENGTH {
            remaining = (remaining << 1) - counts[len] as i32;
            if remaining < 0 {
                return Err(corrupt("over-subscribed huffman code set"));
            }
        }

        let mut offsets = [0u16; MAX_CODE_LENGTH + 1];
        for len in 1..MAX_CODE_LENGTH {
            offsets[len + 1] = offsets[len] + counts[len];
        }
        let mut symbols = vec![0u16; lengths.len()];
        for (symbol, &len) in lengths.iter().enumerate() {
            if len != 0 {
                symbols[offsets[len as usize] as usize] = symbol as u16;
                offsets[len as usize] += 1;
            }
        }
        Ok(Self { counts, symbols })
    }

    fn decode(&self, bits: &mut BitCursor<'_>) -> Result<u16> {
        let mut code: u32 = 0;
        let mut first: u32 = 0;
        let mut index: u32 = 0;
        for len in 1..=MAX_CODE_LENGTH {
            code |= bits.read_bit()?;
            let count = self.counts[len] as u32;
            if code < first + count {
                return Ok(self.symbols[(index + (code - first)) as usize]);
            }
            index += count;
            first = (first + count) << 1;
            code <<= 1;
        }
        Err(corrupt("invalid huffman code"))
    }
}

fn fixed_literal_table() -> CodeTable {
    let mut lengths = [0u8; 288];
    lengths[..144].fill(8);
    lengths[144..256].fill(9);
    lengths[256..280].fill(7);
    lengths[280..].fill(8);
    CodeTable::from_lengths(&lengths).expect("fixed literal code set is valid")
}

fn fixed_distance_table() -> CodeTable {
    CodeTable::from_lengths(&[5u8; 32]).expect("fixed distance code set is valid")
}

struct SpanDecoder<'a> {
    bits: BitCursor<'a>,
    out: Vec<u8>,
    expected: usize,
    window: Box<[u8]>,
    window_pos: usize,
    /// Bytes of history preloaded from the checkpoint window.
    preloaded: usize,
}

impl<'a> SpanDecoder<'a> {
    fn new(checkpoint: &InflateCheckpoint, compressed: &'a [u8], expected: usize) -> Self {
        let mut window = vec![0u8; WINDOW_SIZE].into_boxed_slice();
        let dict = &checkpoint.window;
        let preloaded = dict.len().min(WINDOW_SIZE);
        window[..preloaded].copy_from_slice(&dict[dict.len() - preloaded..]);
        Self {
            bits: BitCursor::new(compressed, checkpoint.bit_offset),
            out: Vec::with_capacity(expected),
            expected,
            window,
            window_pos: preloaded & (WINDOW_SIZE - 1),
            preloaded,
        }
    }

    #[inline]
    fn done(&self) -> bool {
        self.out.len() == self.expected
    }

    #[inline]
    fn emit(&mut self, byte: u8) {
        self.out.push(byte);
        self.window[self.window_pos] = byte;
        self.window_pos = (self.window_pos + 1) & (WINDOW_SIZE - 1);
    }

    /// Back-reference history currently reachable: checkpoint window plus
    /// everything emitted so far, capped at the window size.
    #[inline]
    fn history(&self) -> usize {
        (self.preloaded + self.out.len()).min(WINDOW_SIZE)
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let bfinal = self.bits.read_bit()? == 1;
            let btype = self.bits.read_bits(2)?;
            match btype {
                0 => self.stored_block()?,
                1 => {
                    let literals = fixed_literal_table();
                    let distances = fixed_distance_table();
                    self.compressed_block(&literals, Some(&distances))?;
                }
                2 => self.dynamic_block()?,
                _ => return Err(corrupt("reserved block type")),
            }
            if self.done() {
                return Ok(());
            }
            if bfinal {
                return Err(corrupt("deflate stream ended before span was complete"));
            }
        }
    }

    fn stored_block(&mut self) -> Result<()> {
        self.bits.align();
        let len = self.bits.read_u16_le()?;
        let nlen = self.bits.read_u16_le()?;
        if len != !nlen {
            return Err(corrupt("stored block length check failed"));
        }
        for _ in 0..len {
            if self.done() {
                return Ok(());
            }
            let byte = self.bits.read_aligned_byte()?;
            self.emit(byte);
        }
        Ok(())
    }

    fn dynamic_block(&mut self) -> Result<()> {
        let hlit = self.bits.read_bits(5)? as usize + 257;
        let hdist = self.bits.read_bits(5)? as usize + 1;
        let hclen = self.bits.read_bits(4)? as usize + 4;
        if hlit > 286 || hdist > 30 {
            return Err(corrupt("dynamic block header counts out of range"));
        }

        let mut codelen_lengths = [0u8; 19];
        for &pos in CODELEN_ORDER.iter().take(hclen) {
            codelen_lengths[pos] = self.bits.read_bits(3)? as u8;
        }
        let codelen_table = CodeTable::from_lengths(&codelen_lengths)?;

        let mut lengths = vec![0u8; hlit + hdist];
        let mut i = 0;
        while i < lengths.len() {
            let sym = codelen_table.decode(&mut self.bits)?;
            match sym {
                0..=15 => {
                    lengths[i] = sym as u8;
                    i += 1;
                }
                16 => {
                    if i == 0 {
                        return Err(corrupt("length repeat with no previous length"));
                    }
                    let count = self.bits.read_bits(2)? as usize + 3;
                    if i + count > lengths.len() {
                        return Err(corrupt("length repeat overflows table"));
                    }
                    let prev = lengths[i - 1];
                    lengths[i..i + count].fill(prev);
                    i += count;
                }
                17 => {
                    let count = self.bits.read_bits(3)? as usize + 3;
                    if i + count > lengths.len() {
                        return Err(corrupt("length repeat overflows table"));
                    }
                    i += count;
                }
                18 => {
                    let count = self.bits.read_bits(7)? as usize + 11;
                    if i + count > lengths.len() {
                        return Err(corrupt("length repeat overflows table"));
                    }
                    i += count;
                }
                _ => return Err(corrupt("invalid code-length symbol")),
            }
        }

        let literals = CodeTable::from_lengths(&lengths[..hlit])?;
        let dist_lengths = &lengths[hlit..];
        let distances = if dist_lengths.iter().all(|&l| l == 0) {
            // Literal-only block: distance codes are absent and any match is
            // corrupt.
            None
        } else {
            Some(CodeTable::from_lengths(dist_lengths)?)
        };
        self.compressed_block(&literals, distances.as_ref())
    }

    fn compressed_block(
        &mut self,
        literals: &CodeTable,
        distances: Option<&CodeTable>,
    ) -> Result<()> {
        loop {
            if self.done() {
                return Ok(());
            }
            let sym = literals.decode(&mut self.bits)?;
            if sym < 256 {
                self.emit(sym as u8);
            } else if sym == 256 {
                return Ok(());
            } else {
                let idx = (sym - 257) as usize;
                if idx >= LENGTH_BASE.len() {
                    return Err(corrupt("invalid length symbol"));
                }
                let mut length = LENGTH_BASE[idx] as usize;
                let extra = LENGTH_EXTRA[idx];
                if extra > 0 {
                    length += self.bits.read_bits(extra)? as usize;
                }

                let table =
                    distances.ok_or_else(|| corrupt("match in block without distance codes"))?;
                let dsym = table.decode(&mut self.bits)? as usize;
                if dsym >= DIST_BASE.len() {
                    return Err(corrupt("invalid distance symbol"));
                }
                let mut distance = DIST_BASE[dsym] as usize;
                let dextra = DIST_EXTRA[dsym];
                if dextra > 0 {
                    distance += self.bits.read_bits(dextra)? as usize;
                }
                self.copy_match(distance, length)?;
            }
        }
    }

    fn copy_match(&mut self, distance: usize, length: usize) -> Result<()> {
        if distance > self.history() {
            return Err(corrupt("match distance exceeds available window"));
        }
        let mut src = (self.window_pos + WINDOW_SIZE - distance) & (WINDOW_SIZE - 1);
        for _ in 0..length {
            if self.done() {
                // Span output ends at a block boundary, never inside a match.
                return Err(corrupt("match extends past span end"));
            }
            let byte = self.window[src];
            self.emit(byte);
            src = (src + 1) & (WINDOW_SIZE - 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use flate2::{Compress, Compression, FlushCompress, Status};

    /// Raw-deflate `input`, sync-flushing at each boundary so the stream stays
    /// byte-aligned there, and return the compressed bytes plus the compressed
    /// offset of each boundary.
    fn deflate_with_flush_points(input: &[u8], boundaries: &[usize]) -> (Vec<u8>, Vec<usize>) {
        let mut comp = Compress::new(Compression::default(), false);
        let mut out = Vec::new();
        let mut offsets = vec![0usize];
        let mut consumed = 0usize;
        for (i, &bound) in boundaries.iter().enumerate() {
            let chunk = &input[consumed..bound];
            let mut fed = 0usize;
            while fed < chunk.len() {
                out.reserve(chunk.len() / 2 + 64);
                let before = comp.total_in();
                comp.compress_vec(&chunk[fed..], &mut out, FlushCompress::None)
                    .unwrap();
                fed += (comp.total_in() - before) as usize;
            }
            consumed = bound;
            let finish = i == boundaries.len() - 1;
            loop {
                out.reserve(4096);
                let before = comp.total_out();
                let status = comp
                    .compress_vec(
                        &[],
                        &mut out,
                        if finish {
                            FlushCompress::Finish
                        } else {
                            FlushCompress::Sync
                        },
                    )
                    .unwrap();
                if finish {
                    if status == Status::StreamEnd {
                        break;
                    }
                } else if comp.total_out() == before {
                    break;
                }
            }
            offsets.push(out.len());
        }
        (out, offsets)
    }

    fn checkpoint(window: &[u8]) -> InflateCheckpoint {
        InflateCheckpoint {
            bit_offset: 0,
            window: Bytes::copy_from_slice(window),
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        // Mildly repetitive so the compressor emits real back-references.
        (0..len)
            .map(|i| ((i * 7 + i / 13) % 251) as u8)
            .collect()
    }

    #[test]
    fn test_whole_stream_round_trip() {
        let input = patterned(100_000);
        let (compressed, _) = deflate_with_flush_points(&input, &[input.len()]);
        let out = inflate_span(&checkpoint(&[]), &compressed, input.len() as u64).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_resume_with_window() {
        let input = patterned(200_000);
        let bound = 120_000;
        let (compressed, offsets) = deflate_with_flush_points(&input, &[bound, input.len()]);

        let first = inflate_span(
            &checkpoint(&[]),
            &compressed[offsets[0]..offsets[1]],
            bound as u64,
        )
        .unwrap();
        assert_eq!(first, input[..bound]);

        let window_start = bound - WINDOW_SIZE.min(bound);
        let second = inflate_span(
            &checkpoint(&input[window_start..bound]),
            &compressed[offsets[1]..offsets[2]],
            (input.len() - bound) as u64,
        )
        .unwrap();
        assert_eq!(second, input[bound..]);
    }

    #[test]
    fn test_resume_without_window_fails_on_far_reference() {
        use rand::RngCore;
        let bound = 120_000;
        let mut input = vec![0u8; bound];
        rand::thread_rng().fill_bytes(&mut input);
        // The second segment opens with a verbatim copy of the kilobyte just
        // before the boundary, so its compressed form starts with a match
        // whose distance reaches into the first segment.
        let repeat = input[bound - 1024..bound].to_vec();
        input.extend_from_slice(&repeat);
        let (compressed, offsets) = deflate_with_flush_points(&input, &[bound, input.len()]);
        let err = inflate_span(
            &checkpoint(&[]),
            &compressed[offsets[1]..offsets[2]],
            (input.len() - bound) as u64,
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Decompress(_)));
    }

    #[test]
    fn test_truncated_input_fails() {
        let input = patterned(50_000);
        let (compressed, _) = deflate_with_flush_points(&input, &[input.len()]);
        let err = inflate_span(
            &checkpoint(&[]),
            &compressed[..compressed.len() / 2],
            input.len() as u64,
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Decompress(_)));
    }

    #[test]
    fn test_stored_blocks_decode() {
        // Incompressible input forces stored blocks at level 0.
        let input = patterned(4096);
        let mut comp = Compress::new(Compression::none(), false);
        let mut out = Vec::new();
        let mut fed = 0usize;
        while fed < input.len() {
            out.reserve(input.len() + 1024);
            let before = comp.total_in();
            comp.compress_vec(&input[fed..], &mut out, FlushCompress::None)
                .unwrap();
            fed += (comp.total_in() - before) as usize;
        }
        loop {
            out.reserve(1024);
            let status = comp
                .compress_vec(&[], &mut out, FlushCompress::Finish)
                .unwrap();
            if status == Status::StreamEnd {
                break;
            }
        }
        let decoded = inflate_span(&checkpoint(&[]), &out, input.len() as u64).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_zero_expected_reads_nothing() {
        let out = inflate_span(&checkpoint(&[]), &[], 0).unwrap();
        assert!(out.is_empty());
    }
}
