//! Codec registry: frozen 8-byte algo tags + pluggable backends.
//!
//! # Identity rules
//! Every codec is identified by the 8-byte ASCII tag written at offset 0
//! of the file header (`"lzma    "`, `"zlib    "`, ...).  The tag is the
//! authoritative identity; it is never negotiated at runtime.  A reader
//! that cannot supply the tagged codec MUST fail immediately — no partial
//! decode, no fallback to another backend.
//!
//! # Compress-side contract
//! `compress` may fail or return output no smaller than its input; the
//! caller handles both by storing the chunk uncompressed.  `decompress`
//! failures are always fatal.
//!
//! # Adaptive mode
//! The `"adapt   "` tag is a composite: it runs its child codecs over the
//! chunk and keeps the smallest output, recording the winner in the
//! 2-bit sub-algo field of the chunk flag byte.  Child ids are frozen:
//! 1 = bzip2, 2 = lzma, 3 = ppmd (reserved).  Sub-algo 0 on the wire is
//! corruption.

use std::io::{self, Read, Write};
use thiserror::Error;

/// Clamp the stream-level compression level (0..=14) onto a backend range.
#[inline]
fn scale_level(level: i32, lo: i32, hi: i32) -> i32 {
    lo + level.clamp(0, crate::config::MAX_LEVEL) * (hi - lo) / crate::config::MAX_LEVEL
}

// ── Frozen algo tags ─────────────────────────────────────────────────────────
//
// These values are permanent.  A tag is NEVER reused, even if a codec is
// retired; parsers MUST reject unknown tags.

pub const TAG_NONE:   [u8; 8] = *b"none    ";
pub const TAG_LZMA:   [u8; 8] = *b"lzma    ";
pub const TAG_ZLIB:   [u8; 8] = *b"zlib    ";
pub const TAG_LZ4:    [u8; 8] = *b"lz4     ";
pub const TAG_ZSTD:   [u8; 8] = *b"zstd    ";
pub const TAG_BZIP2:  [u8; 8] = *b"bzip2   ";
pub const TAG_BROTLI: [u8; 8] = *b"brotli  ";
pub const TAG_PPMD:   [u8; 8] = *b"ppmd    ";
pub const TAG_ADAPT:  [u8; 8] = *b"adapt   ";

// ── Adaptive sub-algo ids (2-bit field in the chunk flag byte) ───────────────

pub const SUB_ALGO_BZIP2: u8 = 1;
pub const SUB_ALGO_LZMA:  u8 = 2;
pub const SUB_ALGO_PPMD:  u8 = 3;

// ── Algorithm enum ───────────────────────────────────────────────────────────

/// Runtime codec discriminant carrying the frozen wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    None,
    Lzma,
    Zlib,
    Lz4,
    Zstd,
    Bzip2,
    Brotli,
    /// Reserved: the tag parses but no backend exists in this build.
    Ppmd,
    Adapt,
}

impl Algorithm {
    /// The 8-byte tag written to the file header.
    #[inline]
    pub fn tag(self) -> [u8; 8] {
        match self {
            Algorithm::None   => TAG_NONE,
            Algorithm::Lzma   => TAG_LZMA,
            Algorithm::Zlib   => TAG_ZLIB,
            Algorithm::Lz4    => TAG_LZ4,
            Algorithm::Zstd   => TAG_ZSTD,
            Algorithm::Bzip2  => TAG_BZIP2,
            Algorithm::Brotli => TAG_BROTLI,
            Algorithm::Ppmd   => TAG_PPMD,
            Algorithm::Adapt  => TAG_ADAPT,
        }
    }

    /// Resolve a wire tag.  `None` means the tag is unknown to this build.
    pub fn from_tag(tag: &[u8; 8]) -> Option<Self> {
        match tag {
            t if t == &TAG_NONE   => Some(Algorithm::None),
            t if t == &TAG_LZMA   => Some(Algorithm::Lzma),
            t if t == &TAG_ZLIB   => Some(Algorithm::Zlib),
            t if t == &TAG_LZ4    => Some(Algorithm::Lz4),
            t if t == &TAG_ZSTD   => Some(Algorithm::Zstd),
            t if t == &TAG_BZIP2  => Some(Algorithm::Bzip2),
            t if t == &TAG_BROTLI => Some(Algorithm::Brotli),
            t if t == &TAG_PPMD   => Some(Algorithm::Ppmd),
            t if t == &TAG_ADAPT  => Some(Algorithm::Adapt),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::None   => "none",
            Algorithm::Lzma   => "lzma",
            Algorithm::Zlib   => "zlib",
            Algorithm::Lz4    => "lz4",
            Algorithm::Zstd   => "zstd",
            Algorithm::Bzip2  => "bzip2",
            Algorithm::Brotli => "brotli",
            Algorithm::Ppmd   => "ppmd",
            Algorithm::Adapt  => "adapt",
        }
    }

    /// Parse a CLI spelling.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"   => Some(Algorithm::None),
            "lzma"   => Some(Algorithm::Lzma),
            "zlib"   => Some(Algorithm::Zlib),
            "lz4"    => Some(Algorithm::Lz4),
            "zstd"   => Some(Algorithm::Zstd),
            "bzip2"  => Some(Algorithm::Bzip2),
            "brotli" => Some(Algorithm::Brotli),
            "ppmd"   => Some(Algorithm::Ppmd),
            "adapt"  => Some(Algorithm::Adapt),
            _ => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    /// The tagged codec has no backend in this build.  Decoding MUST NOT
    /// continue.
    #[error("required codec not available ({tag}) - cannot decode without it")]
    UnavailableCodec { tag: String },
    /// Adaptive frame whose sub-algo field is 0 or otherwise unassigned.
    #[error("invalid adaptive sub-algo id {0}")]
    InvalidSubAlgo(u8),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send {
    fn algorithm(&self) -> Algorithm;
    fn compress(&mut self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in backends ────────────────────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn algorithm(&self) -> Algorithm { Algorithm::None }
    fn compress(&mut self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&mut self, data: &[u8])       -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn algorithm(&self) -> Algorithm { Algorithm::Lzma }
    fn compress(&mut self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct ZlibCodec;
impl Codec for ZlibCodec {
    fn algorithm(&self) -> Algorithm { Algorithm::Zlib }
    fn compress(&mut self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let lvl = flate2::Compression::new(scale_level(level, 1, 9) as u32);
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), lvl);
        enc.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn algorithm(&self) -> Algorithm { Algorithm::Lz4 }
    fn compress(&mut self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn algorithm(&self) -> Algorithm { Algorithm::Zstd }
    fn compress(&mut self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, scale_level(level, 1, 19))
            .map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct Bzip2Codec;
impl Codec for Bzip2Codec {
    fn algorithm(&self) -> Algorithm { Algorithm::Bzip2 }
    fn compress(&mut self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let lvl = bzip2::Compression::new(scale_level(level, 1, 9) as u32);
        let mut out = Vec::new();
        bzip2::read::BzEncoder::new(data, lvl)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn algorithm(&self) -> Algorithm { Algorithm::Brotli }
    fn compress(&mut self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = scale_level(level, 0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

// ── Adaptive composite ───────────────────────────────────────────────────────

/// Runs the child codecs over a chunk and keeps the smallest output.
///
/// The winner's sub-algo id goes into bits 4..5 of the chunk flag byte so
/// the decoder can dispatch without trial decompression.
pub struct AdaptiveCodec;

impl AdaptiveCodec {
    /// Compress with every available child, returning `(sub_algo, bytes)`
    /// for the smallest result.
    pub fn compress_best(&mut self, data: &[u8], level: i32) -> Result<(u8, Vec<u8>), CodecError> {
        let mut best: Option<(u8, Vec<u8>)> = None;
        for sub in [SUB_ALGO_BZIP2, SUB_ALGO_LZMA] {
            let mut child = Self::child(sub)?;
            // A failing child just drops out of the race.
            let out = match child.compress(data, level) {
                Ok(o) => o,
                Err(e) => {
                    log::debug!("adaptive: {} failed: {e}", child.algorithm().name());
                    continue;
                }
            };
            if best.as_ref().map_or(true, |(_, b)| out.len() < b.len()) {
                best = Some((sub, out));
            }
        }
        best.ok_or_else(|| CodecError::Compression("no adaptive child produced output".into()))
    }

    /// Resolve a wire sub-algo id to its child codec.
    pub fn child(sub_algo: u8) -> Result<Box<dyn Codec>, CodecError> {
        match sub_algo {
            SUB_ALGO_BZIP2 => Ok(Box::new(Bzip2Codec)),
            SUB_ALGO_LZMA  => Ok(Box::new(LzmaCodec)),
            SUB_ALGO_PPMD  => Err(CodecError::UnavailableCodec {
                tag: Algorithm::Ppmd.name().into(),
            }),
            other => Err(CodecError::InvalidSubAlgo(other)),
        }
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a wire tag to a codec, failing hard on unknown tags.
pub fn get_codec_by_tag(tag: &[u8; 8]) -> Result<Box<dyn Codec>, CodecError> {
    match Algorithm::from_tag(tag) {
        Some(algo) => get_codec(algo),
        None => Err(CodecError::UnavailableCodec {
            tag: String::from_utf8_lossy(tag).trim_end().to_string(),
        }),
    }
}

/// Resolve an [`Algorithm`] to its backend.
///
/// `Adapt` resolves to a plain passthrough here; the transform stack
/// routes adaptive compression through [`AdaptiveCodec::compress_best`]
/// and dispatches decode via the sub-algo flag bits.
pub fn get_codec(algo: Algorithm) -> Result<Box<dyn Codec>, CodecError> {
    match algo {
        Algorithm::None   => Ok(Box::new(NoneCodec)),
        Algorithm::Lzma   => Ok(Box::new(LzmaCodec)),
        Algorithm::Zlib   => Ok(Box::new(ZlibCodec)),
        Algorithm::Lz4    => Ok(Box::new(Lz4Codec)),
        Algorithm::Zstd   => Ok(Box::new(ZstdCodec)),
        Algorithm::Bzip2  => Ok(Box::new(Bzip2Codec)),
        Algorithm::Brotli => Ok(Box::new(BrotliCodec)),
        Algorithm::Adapt  => Ok(Box::new(NoneCodec)),
        Algorithm::Ppmd   => Err(CodecError::UnavailableCodec {
            tag: Algorithm::Ppmd.name().into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algo: Algorithm) {
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(64);
        let mut c = get_codec(algo).unwrap();
        let packed = c.compress(&data, 6).unwrap();
        assert!(packed.len() < data.len(), "{} did not shrink text", algo.name());
        assert_eq!(c.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn text_roundtrips() {
        for algo in [
            Algorithm::Lzma,
            Algorithm::Zlib,
            Algorithm::Lz4,
            Algorithm::Zstd,
            Algorithm::Bzip2,
            Algorithm::Brotli,
        ] {
            roundtrip(algo);
        }
    }

    #[test]
    fn tags_roundtrip() {
        for algo in [
            Algorithm::None,
            Algorithm::Lzma,
            Algorithm::Zlib,
            Algorithm::Lz4,
            Algorithm::Zstd,
            Algorithm::Bzip2,
            Algorithm::Brotli,
            Algorithm::Ppmd,
            Algorithm::Adapt,
        ] {
            assert_eq!(Algorithm::from_tag(&algo.tag()), Some(algo));
            assert_eq!(Algorithm::from_name(algo.name()), Some(algo));
        }
        assert_eq!(Algorithm::from_tag(b"what????"), None);
    }

    #[test]
    fn adaptive_picks_a_winner() {
        let data = vec![7u8; 4096];
        let (sub, packed) = AdaptiveCodec.compress_best(&data, 6).unwrap();
        assert!(sub == SUB_ALGO_BZIP2 || sub == SUB_ALGO_LZMA);
        let mut child = AdaptiveCodec::child(sub).unwrap();
        assert_eq!(child.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn adaptive_rejects_bad_sub_ids() {
        assert!(matches!(AdaptiveCodec::child(0), Err(CodecError::InvalidSubAlgo(0))));
        assert!(matches!(
            AdaptiveCodec::child(SUB_ALGO_PPMD),
            Err(CodecError::UnavailableCodec { .. })
        ));
    }

    #[test]
    fn ppmd_tag_is_reserved() {
        assert!(matches!(
            get_codec(Algorithm::Ppmd),
            Err(CodecError::UnavailableCodec { .. })
        ));
    }
}
