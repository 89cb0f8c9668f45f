//! Reversible pre-compression transforms: LZP and Delta2.
//!
//! Both run between the dedup stage and the primary codec.  Successful
//! transforms are recorded in the preproc type byte that leads the chunk
//! payload:
//!
//! ```text
//! bit 0  PREPROC_TYPE_LZP
//! bit 1  PREPROC_TYPE_DELTA2
//! ```
//!
//! On the wire the codec input is wrapped as
//! `[1B type | 8B BE preproc_len | codec_output]` when the codec shrank
//! the buffer, or `[1B type | preproc_output]` when it did not.  A type
//! byte of 0 under `CHUNK_FLAG_PREPROC`, or with bits outside the mask,
//! is corruption.
//!
//! # LZP
//! Order-3 context predictor: a 64Ki-entry table maps the hash of the
//! previous three bytes to the last position seen under that context.
//! Tokens are grouped eight per control byte (bit set = match).  Matches
//! are emitted only at [`LZP_MIN_MATCH`] or longer, as a 255-continued
//! length.  Decoding needs the original length, which every caller knows
//! from frame context.
//!
//! # Delta2
//! Byte-lane delta at a probed stride (2, 3, 4 or 8, bounded by the
//! configured span).  Effective on embedded tables of fixed-width binary
//! integers where high-order lanes repeat.  Output is the 1-byte stride
//! followed by the wrapped differences; always `len + 1` bytes.

use thiserror::Error;

pub const PREPROC_TYPE_LZP:    u8 = 0x01;
pub const PREPROC_TYPE_DELTA2: u8 = 0x02;
pub const PREPROC_TYPE_MASK:   u8 = 0x03;

/// Size of the wrapper in front of compressed codec input: type byte +
/// big-endian post-preprocess length.
pub const PREPROC_WRAPPER_BYTES: usize = 9;

const LZP_TABLE_BITS:  usize = 16;
const LZP_TABLE_SIZE:  usize = 1 << LZP_TABLE_BITS;
const LZP_EMPTY:       u32   = u32::MAX;
pub const LZP_MIN_MATCH: usize = 32;

/// Strides Delta2 will probe, smallest first.
const DELTA2_STRIDES: [u8; 4] = [2, 3, 4, 8];
/// Fraction (in 1/256ths) of sampled positions that must repeat at a
/// stride before the transform is considered worthwhile.
const DELTA2_THRESHOLD: u32 = 102; // ~40%

#[derive(Error, Debug)]
pub enum PreprocError {
    #[error("invalid preprocessing flags {0:#04x}")]
    InvalidFlags(u8),
    #[error("truncated preprocessed stream")]
    Truncated,
    #[error("invalid delta stride {0}")]
    BadStride(u8),
    #[error("preprocessed stream decodes to {got} bytes, expected {expected}")]
    LengthMismatch { expected: usize, got: usize },
}

/// Validate a wire type byte against the known transform bits.
pub fn validate_type_byte(ty: u8) -> Result<(), PreprocError> {
    if ty == 0 || ty & !PREPROC_TYPE_MASK != 0 {
        return Err(PreprocError::InvalidFlags(ty));
    }
    Ok(())
}

// ── LZP ──────────────────────────────────────────────────────────────────────

#[inline]
fn lzp_hash(a: u8, b: u8, c: u8) -> usize {
    let ctx = ((a as u32) << 16) | ((b as u32) << 8) | c as u32;
    (ctx.wrapping_mul(2654435761) >> (32 - LZP_TABLE_BITS)) as usize & (LZP_TABLE_SIZE - 1)
}

/// LZP-encode `data`.  The caller keeps the result only if it is strictly
/// smaller than the input.
pub fn lzp_compress(data: &[u8]) -> Vec<u8> {
    let mut table = vec![LZP_EMPTY; LZP_TABLE_SIZE];
    let mut out = Vec::with_capacity(data.len() / 2 + 16);

    let mut i = 0usize;
    let mut ctrl_idx = 0usize;
    let mut ctrl_bit = 8u8; // 8 forces a fresh control byte first
    while i < data.len() {
        if ctrl_bit == 8 {
            ctrl_idx = out.len();
            out.push(0);
            ctrl_bit = 0;
        }

        let mut matched = false;
        if i >= 3 {
            let h = lzp_hash(data[i - 3], data[i - 2], data[i - 1]);
            let cand = table[h];
            table[h] = i as u32;
            if cand != LZP_EMPTY {
                let cand = cand as usize;
                let mut len = 0usize;
                while i + len < data.len() && data[cand + len] == data[i + len] {
                    len += 1;
                }
                if len >= LZP_MIN_MATCH {
                    out[ctrl_idx] |= 1 << ctrl_bit;
                    let mut v = len - LZP_MIN_MATCH;
                    while v >= 255 {
                        out.push(255);
                        v -= 255;
                    }
                    out.push(v as u8);
                    i += len;
                    matched = true;
                }
            }
        }
        if !matched {
            out.push(data[i]);
            i += 1;
        }
        ctrl_bit += 1;
    }
    out
}

/// Reverse [`lzp_compress`].  `expected_len` is the pre-transform length,
/// known to every caller from frame context.
pub fn lzp_decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>, PreprocError> {
    let mut table = vec![LZP_EMPTY; LZP_TABLE_SIZE];
    let mut out = Vec::with_capacity(expected_len);

    let mut pos = 0usize;
    let mut ctrl = 0u8;
    let mut ctrl_bit = 8u8;
    while out.len() < expected_len {
        if ctrl_bit == 8 {
            ctrl = *data.get(pos).ok_or(PreprocError::Truncated)?;
            pos += 1;
            ctrl_bit = 0;
        }

        let is_match = ctrl & (1 << ctrl_bit) != 0;
        let mut cand = LZP_EMPTY;
        if out.len() >= 3 {
            let n = out.len();
            let h = lzp_hash(out[n - 3], out[n - 2], out[n - 1]);
            cand = table[h];
            table[h] = n as u32;
        }

        if is_match {
            if cand == LZP_EMPTY {
                // A match token with no context history cannot decode.
                return Err(PreprocError::Truncated);
            }
            let mut len = LZP_MIN_MATCH;
            loop {
                let b = *data.get(pos).ok_or(PreprocError::Truncated)?;
                pos += 1;
                len += b as usize;
                if b != 255 {
                    break;
                }
            }
            if out.len() + len > expected_len {
                return Err(PreprocError::LengthMismatch {
                    expected: expected_len,
                    got:      out.len() + len,
                });
            }
            let src = cand as usize;
            // Byte-wise: the match may run past its own start.
            for k in 0..len {
                let b = out[src + k];
                out.push(b);
            }
        } else {
            let b = *data.get(pos).ok_or(PreprocError::Truncated)?;
            pos += 1;
            out.push(b);
        }
        ctrl_bit += 1;
    }
    Ok(out)
}

// ── Delta2 ───────────────────────────────────────────────────────────────────

/// Probe for a stride with enough byte-lane repetition to be worth
/// transforming.  Returns the winning stride, or `None`.
pub fn delta2_probe(data: &[u8], span: u8) -> Option<u8> {
    if span == 0 || data.len() < 64 {
        return None;
    }
    let sample = &data[..data.len().min(64 * 1024)];
    let mut best: Option<(u8, u32)> = None;
    for &s in DELTA2_STRIDES.iter().filter(|&&s| s <= span) {
        let s_us = s as usize;
        if sample.len() <= s_us * 4 {
            continue;
        }
        let mut hits = 0u32;
        let n = sample.len() - s_us;
        for i in 0..n {
            let d = sample[i + s_us].wrapping_sub(sample[i]);
            // Repetition or a slow ramp both delta to near-zero bytes.
            if d.wrapping_add(2) <= 4 {
                hits += 1;
            }
        }
        let score = (hits as u64 * 256 / n as u64) as u32;
        if score >= DELTA2_THRESHOLD && best.map_or(true, |(_, b)| score > b) {
            best = Some((s, score));
        }
    }
    best.map(|(s, _)| s)
}

/// Delta2-encode at `stride`: 1-byte stride header, raw head, then
/// wrapping byte-lane differences.  Output is exactly `len + 1` bytes.
pub fn delta2_encode(data: &[u8], stride: u8) -> Vec<u8> {
    let s = stride as usize;
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(stride);
    out.extend_from_slice(&data[..s.min(data.len())]);
    for i in s..data.len() {
        out.push(data[i].wrapping_sub(data[i - s]));
    }
    out
}

/// Reverse [`delta2_encode`].  Output is exactly `input - 1` bytes.
pub fn delta2_decode(data: &[u8]) -> Result<Vec<u8>, PreprocError> {
    let (&stride, rest) = data.split_first().ok_or(PreprocError::Truncated)?;
    if !DELTA2_STRIDES.contains(&stride) {
        return Err(PreprocError::BadStride(stride));
    }
    let s = stride as usize;
    let mut out = Vec::with_capacity(rest.len());
    out.extend_from_slice(&rest[..s.min(rest.len())]);
    for i in s..rest.len() {
        let b = out[i - s].wrapping_add(rest[i]);
        out.push(b);
    }
    Ok(out)
}
