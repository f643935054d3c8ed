//! Transport codec: converts between installed form (bytes as they will
//! reside on the device) and transport form (compressed, and possibly
//! expressed as a delta against an origin archive).
//!
//! Algorithms are looked up in a small registry keyed by the stable hash of
//! their name (the same `id()` primitive used for part/meta names), and
//! each implements [`TransportAlgorithm`] — the Rust rendition of the
//! original's `{start, write_chunk, finish, free}` object, with `free`
//! handled by ordinary `Drop`.

use log::debug;

use crate::error::{Error, Result};
use crate::id::stable_hash;

/// Fixed-capacity working buffers, matching the original's 4 KiB decode
/// buffer / 1 KiB internal context discipline.
pub const CHUNK_SIZE: usize = 4096;

/// Per-part state machine: `Idle -> Started -> Writing -> Finished`.
/// `Started` requires a valid part size; `finish()` may only be called
/// from `Writing`. Re-entry into `Started` for the next part resets the
/// decoder but keeps configured I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Started,
    Writing,
    Finished,
}

/// Context handed to an algorithm's `start`: the declared installed size
/// of the part, and (for algorithms that need a reference stream) the
/// matching origin part's bytes.
pub struct TransportContext<'a> {
    pub installed_size: u64,
    pub origin: Option<&'a [u8]>,
}

/// A registry entry. `write_chunk` appends produced bytes to `output`;
/// implementations must be tolerant of being called with short chunks.
pub trait TransportAlgorithm {
    fn start(&mut self, ctx: &TransportContext) -> Result<()>;
    fn write_chunk(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()>;
    fn finish(&mut self, output: &mut Vec<u8>) -> Result<()>;
    /// Does this algorithm require an origin reference stream to decode?
    fn requires_origin(&self) -> bool {
        false
    }
}

/// Drives one [`TransportAlgorithm`] through a whole part's worth of input,
/// in `CHUNK_SIZE` pieces, enforcing the `Idle -> Started -> Writing ->
/// Finished` state machine.
pub struct PartCodec {
    algorithm: Box<dyn TransportAlgorithm>,
    state: State,
}

impl PartCodec {
    pub fn new(algorithm: Box<dyn TransportAlgorithm>) -> PartCodec {
        PartCodec {
            algorithm,
            state: State::Idle,
        }
    }

    pub fn start(&mut self, ctx: &TransportContext) -> Result<()> {
        if ctx.origin.is_none() && self.algorithm.requires_origin() {
            return Err(Error::MissingOrigin);
        }
        self.algorithm.start(ctx)?;
        self.state = State::Started;
        Ok(())
    }

    fn write_chunk(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        if self.state != State::Started && self.state != State::Writing {
            return Err(Error::Failed);
        }
        self.algorithm.write_chunk(input, output)?;
        self.state = State::Writing;
        Ok(())
    }

    fn finish(&mut self, output: &mut Vec<u8>) -> Result<()> {
        if self.state != State::Writing {
            return Err(Error::Failed);
        }
        self.algorithm.finish(output)?;
        self.state = State::Finished;
        Ok(())
    }

    /// Run `input` through the algorithm end to end, in `CHUNK_SIZE`
    /// pieces, returning the full produced output.
    pub fn run(&mut self, ctx: &TransportContext, input: &[u8]) -> Result<Vec<u8>> {
        self.start(ctx)?;
        let mut output = Vec::new();
        if input.is_empty() {
            // Still drive one empty chunk so Started -> Writing happens.
            self.write_chunk(&[], &mut output)?;
        } else {
            for chunk in input.chunks(CHUNK_SIZE) {
                self.write_chunk(chunk, &mut output)?;
            }
        }
        self.finish(&mut output)?;
        self.state = State::Idle;
        Ok(output)
    }
}

/// `"nop"` — verbatim copy, always available, used for parts without a
/// registered codec.
#[derive(Default)]
pub struct NopCodec;

impl TransportAlgorithm for NopCodec {
    fn start(&mut self, _ctx: &TransportContext) -> Result<()> {
        Ok(())
    }

    fn write_chunk(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        output.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, _output: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}

const HS_LITERAL: u8 = 0;
const HS_MATCH: u8 = 1;
const HS_WINDOW: usize = 2048;
const HS_MIN_MATCH: usize = 3;
const HS_MAX_MATCH: usize = 3 + 255;

/// `"heatshrink"` — a small LZSS-style streaming compressor, grounded in
/// the embedded `heatshrink` library's encode/decode state machine:
/// tokens are either a single literal byte or a (distance, length) copy
/// from the already-decoded output, with a small fixed search window so
/// the encoder stays suitable for constrained memory.
#[derive(Default)]
pub struct HeatshrinkEncoder {
    history: Vec<u8>,
}

impl TransportAlgorithm for HeatshrinkEncoder {
    fn start(&mut self, _ctx: &TransportContext) -> Result<()> {
        self.history.clear();
        Ok(())
    }

    fn write_chunk(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let mut pos = 0usize;
        while pos < input.len() {
            let window_start = self.history.len().saturating_sub(HS_WINDOW);
            let window = &self.history[window_start..];
            let remaining = &input[pos..];

            let best = find_longest_match(window, remaining);
            match best {
                Some((distance, length)) if length >= HS_MIN_MATCH => {
                    output.push(HS_MATCH);
                    output.extend_from_slice(&(distance as u16).to_le_bytes());
                    output.push((length - HS_MIN_MATCH) as u8);
                    self.history.extend_from_slice(&remaining[..length]);
                    pos += length;
                }
                _ => {
                    output.push(HS_LITERAL);
                    output.push(input[pos]);
                    self.history.push(input[pos]);
                    pos += 1;
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, _output: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}

fn find_longest_match(window: &[u8], data: &[u8]) -> Option<(usize, usize)> {
    if window.is_empty() || data.is_empty() {
        return None;
    }
    let max_len = data.len().min(HS_MAX_MATCH);
    let mut best_len = 0usize;
    let mut best_distance = 0usize;

    for start in 0..window.len() {
        let candidate = &window[start..];
        let len = candidate
            .iter()
            .zip(data.iter())
            .take(max_len)
            .take_while(|(a, b)| a == b)
            .count();
        if len > best_len {
            best_len = len;
            best_distance = window.len() - start;
        }
    }

    if best_len >= HS_MIN_MATCH {
        Some((best_distance, best_len))
    } else {
        None
    }
}

#[derive(Default)]
pub struct HeatshrinkDecoder {
    output: Vec<u8>,
    pending: Vec<u8>,
}

impl TransportAlgorithm for HeatshrinkDecoder {
    fn start(&mut self, _ctx: &TransportContext) -> Result<()> {
        self.output.clear();
        self.pending.clear();
        Ok(())
    }

    fn write_chunk(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        self.pending.extend_from_slice(input);
        self.drain(output)
    }

    fn finish(&mut self, output: &mut Vec<u8>) -> Result<()> {
        self.drain(output)?;
        if !self.pending.is_empty() {
            return Err(Error::Truncated);
        }
        Ok(())
    }
}

impl HeatshrinkDecoder {
    fn drain(&mut self, output: &mut Vec<u8>) -> Result<()> {
        let mut cursor = 0usize;
        loop {
            if cursor >= self.pending.len() {
                break;
            }
            match self.pending[cursor] {
                HS_LITERAL => {
                    if cursor + 1 >= self.pending.len() {
                        break;
                    }
                    let byte = self.pending[cursor + 1];
                    self.output.push(byte);
                    output.push(byte);
                    cursor += 2;
                }
                HS_MATCH => {
                    if cursor + 3 >= self.pending.len() {
                        break;
                    }
                    let distance =
                        u16::from_le_bytes([self.pending[cursor + 1], self.pending[cursor + 2]])
                            as usize;
                    let length = self.pending[cursor + 3] as usize + HS_MIN_MATCH;
                    if distance > self.output.len() {
                        return Err(Error::Truncated);
                    }
                    let start = self.output.len() - distance;
                    for i in 0..length {
                        let byte = self.output[start + i];
                        self.output.push(byte);
                        output.push(byte);
                    }
                    cursor += 4;
                }
                _ => return Err(Error::Truncated),
            }
        }
        self.pending.drain(..cursor);
        Ok(())
    }
}

const DELTA_BLOCK: usize = 4096;
const DELTA_INSERT: u8 = 0;
const DELTA_COPY: u8 = 1;

/// `"bsdiff-delta"` — a byte-oriented copy/insert delta against the
/// origin part's same-id bytes. Fixed-size blocks unchanged from the
/// origin are encoded as a `COPY(origin_offset, len)` opcode; changed
/// blocks are encoded as `INSERT(len) + literal bytes`. This is the
/// algorithm the decode contract's "algorithms requiring a reference
/// stream" language refers to.
///
/// Block boundaries must be known up front, so this does not implement
/// [`TransportAlgorithm`]'s chunked state machine; [`encode_part`] and
/// [`decode_part`] call `encode_whole`/`decode_whole` directly instead.
pub struct BsdiffEncoder;

impl BsdiffEncoder {
    pub fn encode_whole(origin: &[u8], input: &[u8]) -> Vec<u8> {
        let mut output = Vec::new();
        for (i, block) in input.chunks(DELTA_BLOCK).enumerate() {
            let origin_offset = i * DELTA_BLOCK;
            let matches = origin.len() >= origin_offset + block.len()
                && &origin[origin_offset..origin_offset + block.len()] == block;
            if matches {
                output.push(DELTA_COPY);
                output.extend_from_slice(&(origin_offset as u64).to_le_bytes());
                output.extend_from_slice(&(block.len() as u32).to_le_bytes());
            } else {
                output.push(DELTA_INSERT);
                output.extend_from_slice(&(block.len() as u32).to_le_bytes());
                output.extend_from_slice(block);
            }
        }
        output
    }
}

pub struct BsdiffDecoder;

impl BsdiffDecoder {
    pub fn decode_whole(origin: &[u8], transport_bytes: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        let mut cursor = 0usize;
        while cursor < transport_bytes.len() {
            let tag = transport_bytes[cursor];
            cursor += 1;
            match tag {
                DELTA_INSERT => {
                    if cursor + 4 > transport_bytes.len() {
                        return Err(Error::Truncated);
                    }
                    let len = u32::from_le_bytes(transport_bytes[cursor..cursor + 4].try_into().unwrap())
                        as usize;
                    cursor += 4;
                    if cursor + len > transport_bytes.len() {
                        return Err(Error::Truncated);
                    }
                    output.extend_from_slice(&transport_bytes[cursor..cursor + len]);
                    cursor += len;
                }
                DELTA_COPY => {
                    if cursor + 12 > transport_bytes.len() {
                        return Err(Error::Truncated);
                    }
                    let origin_offset =
                        u64::from_le_bytes(transport_bytes[cursor..cursor + 8].try_into().unwrap())
                            as usize;
                    let len = u32::from_le_bytes(
                        transport_bytes[cursor + 8..cursor + 12].try_into().unwrap(),
                    ) as usize;
                    cursor += 12;
                    if origin_offset + len > origin.len() {
                        return Err(Error::Overrun);
                    }
                    output.extend_from_slice(&origin[origin_offset..origin_offset + len]);
                }
                _ => return Err(Error::Truncated),
            }
        }
        Ok(output)
    }
}

/// Well-known algorithm names, folded through the same `stable_hash`
/// primitive used for part/meta names.
pub mod names {
    pub const NOP: &str = "nop";
    pub const HEATSHRINK: &str = "heatshrink";
    pub const BSDIFF_DELTA: &str = "bsdiff-delta";
}

/// Look up an encoder by algorithm id (`stable_hash(name)`).
///
/// `bsdiff-delta` needs whole-part block boundaries up front and cannot
/// run through the chunked [`PartCodec`] state machine; callers reach it
/// through [`encode_part`] instead, so it is not handed out here.
pub fn encoder_for(id: u32) -> Result<Box<dyn TransportAlgorithm>> {
    if id == stable_hash(names::NOP) {
        Ok(Box::<NopCodec>::default())
    } else if id == stable_hash(names::HEATSHRINK) {
        Ok(Box::<HeatshrinkEncoder>::default())
    } else if id == stable_hash(names::BSDIFF_DELTA) {
        Err(Error::NotSupported)
    } else {
        Err(Error::UnsupportedAlgorithm)
    }
}

/// Look up a decoder by algorithm id. See [`encoder_for`] on why
/// `bsdiff-delta` is excluded; use [`decode_part`] for it instead.
pub fn decoder_for(id: u32) -> Result<Box<dyn TransportAlgorithm>> {
    if id == stable_hash(names::NOP) {
        Ok(Box::<NopCodec>::default())
    } else if id == stable_hash(names::HEATSHRINK) {
        Ok(Box::<HeatshrinkDecoder>::default())
    } else if id == stable_hash(names::BSDIFF_DELTA) {
        Err(Error::NotSupported)
    } else {
        Err(Error::UnsupportedAlgorithm)
    }
}

/// Encode a single part's installed-form bytes into transport form.
/// `bsdiff-delta` bypasses the chunked state machine (it needs whole-part
/// block boundaries up front); every other algorithm runs through
/// [`PartCodec`].
pub fn encode_part(algorithm_id: u32, installed: &[u8], origin: Option<&[u8]>) -> Result<Vec<u8>> {
    if algorithm_id == stable_hash(names::BSDIFF_DELTA) {
        let origin = origin.ok_or(Error::MissingOrigin)?;
        debug!("transport encode bsdiff-delta: {} bytes", installed.len());
        return Ok(BsdiffEncoder::encode_whole(origin, installed));
    }
    let algorithm = encoder_for(algorithm_id)?;
    let mut codec = PartCodec::new(algorithm);
    let ctx = TransportContext {
        installed_size: installed.len() as u64,
        origin,
    };
    debug!("transport encode id={:08x}: {} bytes", algorithm_id, installed.len());
    codec.run(&ctx, installed)
}

/// Decode a single part's transport-form bytes back to installed form.
pub fn decode_part(
    algorithm_id: u32,
    transport_bytes: &[u8],
    installed_size: u64,
    origin: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let decoded = if algorithm_id == stable_hash(names::BSDIFF_DELTA) {
        let origin = origin.ok_or(Error::MissingOrigin)?;
        BsdiffDecoder::decode_whole(origin, transport_bytes)?
    } else {
        let algorithm = decoder_for(algorithm_id)?;
        let mut codec = PartCodec::new(algorithm);
        let ctx = TransportContext {
            installed_size,
            origin,
        };
        codec.run(&ctx, transport_bytes)?
    };

    if decoded.len() as u64 != installed_size {
        return if (decoded.len() as u64) < installed_size {
            Err(Error::Truncated)
        } else {
            Err(Error::Overrun)
        };
    }
    debug!("transport decode id={:08x}: {} bytes", algorithm_id, decoded.len());
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let id = stable_hash(names::NOP);
        let encoded = encode_part(id, &data, None).unwrap();
        let decoded = decode_part(id, &encoded, data.len() as u64, None).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn heatshrink_round_trip_repetitive_data() {
        let data = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabcabc".to_vec();
        let id = stable_hash(names::HEATSHRINK);
        let encoded = encode_part(id, &data, None).unwrap();
        assert!(encoded.len() < data.len() * 2);
        let decoded = decode_part(id, &encoded, data.len() as u64, None).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn heatshrink_round_trip_random_like_data() {
        let data: Vec<u8> = (0..500).map(|i| ((i * 37 + 11) % 251) as u8).collect();
        let id = stable_hash(names::HEATSHRINK);
        let encoded = encode_part(id, &data, None).unwrap();
        let decoded = decode_part(id, &encoded, data.len() as u64, None).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn bsdiff_delta_shrinks_for_near_identical_data() {
        let origin = vec![0xABu8; 64 * 1024];
        let mut modified = origin.clone();
        modified[100] = 0xFF;

        let id = stable_hash(names::BSDIFF_DELTA);
        let encoded = encode_part(id, &modified, Some(&origin)).unwrap();
        assert!(encoded.len() < modified.len());

        let decoded = decode_part(id, &encoded, modified.len() as u64, Some(&origin)).unwrap();
        assert_eq!(decoded, modified);
    }

    #[test]
    fn bsdiff_delta_without_origin_fails() {
        let id = stable_hash(names::BSDIFF_DELTA);
        let data = vec![1u8, 2, 3];
        assert!(matches!(
            encode_part(id, &data, None),
            Err(Error::MissingOrigin)
        ));
    }

    #[test]
    fn unknown_algorithm_rejected() {
        assert!(matches!(
            encoder_for(0xDEAD_BEEF),
            Err(Error::UnsupportedAlgorithm)
        ));
    }
}
