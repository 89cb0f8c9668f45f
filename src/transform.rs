//! The per-chunk transform stack.
//!
//! Encode order is fixed: `dedup? → LZP? → Delta2? → codec → encrypt?`,
//! then digest/MAC and framing.  Decode applies the exact inverse, with
//! MAC verification before decryption and decryption before any
//! decompression.
//!
//! # Payload interior
//! Without dedup the payload is the preproc-wrapped codec output (see
//! `preproc`).  With dedup it is
//! `[dedup_hdr | index_part | data_part]` where the index is transposed
//! and compressed only when ≥ 90 bytes, and the data part goes through
//! the ordinary preproc + codec path so the codec dictionary never sees
//! index bytes.
//!
//! # Fallback discipline
//! A codec error or non-shrinking output at compress time downgrades the
//! chunk to UNCOMPRESSED, keeping any recorded preprocessing.  Dedup
//! accept/reject happens inside the engine, before it commits anything
//! to a shared store; the framed payload is bounded by the chunk size
//! plus fixed overhead no matter what the codec does.

use std::sync::{Arc, Mutex};

use crate::checksum::MAX_CKSUM_BYTES;
use crate::codec::{self, AdaptiveCodec, Algorithm, Codec, SUB_ALGO_BZIP2};
use crate::config::{DedupMode, Options};
use crate::crypto::CryptoBinding;
use crate::dedup::{
    self, BlockDedupe, DedupHeader, DedupeEngine, GlobalDedupe, GlobalState, DedupOutput,
    INDEX_COMPRESS_MIN, RABIN_HDR_SIZE,
};
use crate::error::ParcError;
use crate::format::{
    build_frame, verify_frame, FrameIntegrity, FrameLayout, CHSIZE_MASK, CHUNK_FLAG_COMPRESSED,
    CHUNK_FLAG_DEDUP, CHUNK_FLAG_PREPROC, CHUNK_SUBALGO_MASK, CHUNK_SUBALGO_SHIFT,
};
use crate::preproc::{
    self, validate_type_byte, PREPROC_TYPE_DELTA2, PREPROC_TYPE_LZP, PREPROC_WRAPPER_BYTES,
};
use crate::scheduler::RingToken;

/// Per-worker transform pipeline.  Owns the codec and dedup state for
/// the lifetime of the stream; the crypto context is shared read-only.
pub struct TransformStack {
    opts:   Options,
    layout: FrameLayout,
    codec:  Box<dyn Codec>,
    dedup:  Option<Box<dyn DedupeEngine>>,
    crypto: Option<Arc<CryptoBinding>>,
}

impl TransformStack {
    /// Build a worker's stack.  `global` must be `Some` exactly when the
    /// stream runs global dedup.
    pub fn new(
        opts:   &Options,
        crypto: Option<Arc<CryptoBinding>>,
        global: Option<Arc<Mutex<GlobalState>>>,
    ) -> Result<Self, ParcError> {
        let layout = FrameLayout::new(opts.checksum, crypto.as_deref());
        let codec = codec::get_codec(opts.algo)?;
        let dedup: Option<Box<dyn DedupeEngine>> = match opts.dedup {
            DedupMode::Off => None,
            mode => {
                let fixed = mode == DedupMode::Fixed;
                let max_payload = opts.chunksize as usize;
                Some(match global {
                    Some(state) => Box::new(GlobalDedupe::new(
                        fixed,
                        opts.dedup_block,
                        opts.delta_mode,
                        max_payload,
                        state,
                    )),
                    None => Box::new(BlockDedupe::new(
                        fixed,
                        opts.dedup_block,
                        opts.delta_mode,
                        max_payload,
                    )),
                })
            }
        };
        Ok(Self { opts: opts.clone(), layout, codec, dedup, crypto })
    }

    #[inline]
    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    // ── Encode ───────────────────────────────────────────────────────────

    /// Transform one raw chunk into a complete wire frame in `out`.
    pub fn encode_chunk(
        &mut self,
        id:   u64,
        raw:  &[u8],
        out:  &mut Vec<u8>,
        ring: Option<&RingToken>,
    ) -> Result<(), ParcError> {
        // Digest of the raw bytes (zeros in crypto mode, which carries a
        // per-chunk HMAC instead).
        let mut digest = [0u8; MAX_CKSUM_BYTES];
        if self.crypto.is_none() {
            self.opts.checksum.digest_into(raw, &mut digest);
        }
        let digest = &digest[..self.layout.cksum_bytes];

        let mut flags = 0u8;

        // Dedup stage.  Global mode serializes through the ring token,
        // and the engine's accept/commit decision is final: once it has
        // committed a chunk's blocks, that chunk MUST frame as dedup or
        // decoder ordinals would drift.
        let dedup_out = match self.dedup.as_mut() {
            None => None,
            Some(engine) => {
                let guard = RingToken::enter(ring)?;
                let result = engine.deduplicate(raw)?;
                drop(guard);
                result
            }
        };

        let (mut interior, inner_flags) = match dedup_out {
            Some(ded) => {
                flags |= CHUNK_FLAG_DEDUP;
                self.encode_dedup_payload(raw, &ded)?
            }
            None => self.encode_interior(raw)?,
        };
        flags |= inner_flags;
        if let Some(ctx) = &self.crypto {
            ctx.apply_cipher(id, &mut interior)?;
        }

        let original_len = if (raw.len() as u64) < self.opts.chunksize {
            flags |= CHSIZE_MASK;
            Some(raw.len() as u64)
        } else {
            None
        };

        let integrity = match &self.crypto {
            Some(ctx) => FrameIntegrity::Hmac(ctx, id),
            None => FrameIntegrity::Crc32,
        };
        build_frame(out, self.layout, digest, flags, &interior, original_len, integrity)?;
        Ok(())
    }

    /// Preproc + codec over one buffer, returning the payload interior
    /// and the chunk flag bits it earned.
    fn encode_interior(&mut self, data: &[u8]) -> Result<(Vec<u8>, u8), ParcError> {
        let mut ty = 0u8;
        let mut cur: Vec<u8>;
        let mut cur_ref: &[u8] = data;

        // LZP is kept only when it strictly shrinks; otherwise the chain
        // continues with the untouched buffer.
        let lzp_buf;
        if self.opts.lzp {
            lzp_buf = preproc::lzp_compress(cur_ref);
            if lzp_buf.len() < cur_ref.len() {
                ty |= PREPROC_TYPE_LZP;
                cur_ref = &lzp_buf;
            }
        }

        if let Some(stride) = preproc::delta2_probe(cur_ref, self.opts.delta2_span) {
            cur = preproc::delta2_encode(cur_ref, stride);
            ty |= PREPROC_TYPE_DELTA2;
        } else {
            cur = cur_ref.to_vec();
        }

        // Codec stage.  Errors and non-shrinking output both downgrade
        // to UNCOMPRESSED; preprocessing stays recorded either way.
        let mut sub_algo = 0u8;
        let codec_out = if self.opts.algo == Algorithm::Adapt {
            match AdaptiveCodec.compress_best(&cur, self.opts.level) {
                Ok((sub, out)) => {
                    sub_algo = sub;
                    Some(out)
                }
                Err(e) => {
                    log::debug!("adaptive codec fell back to stored: {e}");
                    None
                }
            }
        } else {
            match self.codec.compress(&cur, self.opts.level) {
                Ok(out) => Some(out),
                Err(e) => {
                    log::debug!("{} fell back to stored: {e}", self.opts.algo.name());
                    None
                }
            }
        };

        let mut flags = 0u8;
        let body = match codec_out {
            Some(codec_out)
                if codec_out.len() + wrapper_cost(ty) < cur.len() + stored_cost(ty) =>
            {
                flags |= CHUNK_FLAG_COMPRESSED;
                flags |= (sub_algo << CHUNK_SUBALGO_SHIFT) & CHUNK_SUBALGO_MASK;
                if ty != 0 {
                    flags |= CHUNK_FLAG_PREPROC;
                    let mut body = Vec::with_capacity(PREPROC_WRAPPER_BYTES + codec_out.len());
                    body.push(ty);
                    body.extend_from_slice(&(cur.len() as u64).to_be_bytes());
                    body.extend_from_slice(&codec_out);
                    body
                } else {
                    codec_out
                }
            }
            _ if ty != 0 => {
                flags |= CHUNK_FLAG_PREPROC;
                let mut body = Vec::with_capacity(1 + cur.len());
                body.push(ty);
                body.append(&mut cur);
                body
            }
            _ => data.to_vec(),
        };
        Ok((body, flags))
    }

    /// Assemble `[dedup_hdr | index_part | data_part]`.
    fn encode_dedup_payload(
        &mut self,
        raw: &[u8],
        ded: &DedupOutput,
    ) -> Result<(Vec<u8>, u8), ParcError> {
        let index_raw = dedup::pack_index(&ded.entries);
        let index_part = if index_raw.len() >= INDEX_COMPRESS_MIN {
            match self.index_codec()?.compress(&index_raw, self.opts.level) {
                Ok(c) if c.len() < index_raw.len() => c,
                _ => index_raw,
            }
        } else {
            index_raw
        };

        let (data_part, inner_flags) = self.encode_interior(&ded.records)?;

        let hdr = DedupHeader {
            n_entries:      ded.entries.len() as u32,
            raw_len:        raw.len() as u64,
            comp_index_len: index_part.len() as u32,
            comp_data_len:  data_part.len() as u32,
            data_raw_len:   ded.records.len() as u32,
        };

        let mut body = vec![0u8; RABIN_HDR_SIZE];
        hdr.write_into(&mut body);
        body.extend_from_slice(&index_part);
        body.extend_from_slice(&data_part);
        Ok((body, inner_flags))
    }

    /// Codec used for the transposed index.  Adaptive streams pin the
    /// bzip2 child so decode needs no extra signaling.
    fn index_codec(&mut self) -> Result<Box<dyn Codec>, ParcError> {
        if self.opts.algo == Algorithm::Adapt {
            Ok(AdaptiveCodec::child(SUB_ALGO_BZIP2)?)
        } else {
            Ok(codec::get_codec(self.opts.algo)?)
        }
    }

    // ── Decode ───────────────────────────────────────────────────────────

    /// Verify and reverse one wire frame.  `frame` holds the complete
    /// frame including the `cmp_len` prefix and any suffix.
    pub fn decode_chunk(
        &mut self,
        id:    u64,
        frame: &mut [u8],
        ring:  Option<&RingToken>,
    ) -> Result<Vec<u8>, ParcError> {
        let layout = self.layout;
        let cmp_len = u64::from_be_bytes(frame[..8].try_into().unwrap());
        let payload_len = (cmp_len - layout.min_cmp_len()) as usize;
        let flags_off = layout.flags_off();
        let payload_off = layout.payload_off();
        let flags = frame[flags_off];

        let expected_raw = if flags & CHSIZE_MASK != 0 {
            let suffix_off = payload_off + payload_len;
            u64::from_be_bytes(frame[suffix_off..suffix_off + 8].try_into().unwrap()) as usize
        } else {
            self.opts.chunksize as usize
        };
        if expected_raw > self.opts.chunksize as usize {
            return Err(ParcError::CorruptChunk(format!(
                "original_len {expected_raw} exceeds chunk size {}",
                self.opts.chunksize
            )));
        }

        // 1. Authenticate the frame before touching the payload.
        let integrity = match &self.crypto {
            Some(ctx) => FrameIntegrity::Hmac(ctx, id),
            None => FrameIntegrity::Crc32,
        };
        verify_frame(frame, layout, integrity)?;

        // 2. Decrypt in place.
        let payload = &mut frame[payload_off..payload_off + payload_len];
        if let Some(ctx) = &self.crypto {
            ctx.apply_cipher(id, payload)?;
        }
        let payload: &[u8] = payload;

        // 3. Reverse the transform stack.
        let raw = if flags & CHUNK_FLAG_DEDUP != 0 {
            self.decode_dedup_payload(payload, flags, expected_raw, ring)?
        } else {
            // A chunk the encoder framed without dedup mutates no shared
            // state; pass the ordering token straight through so ring
            // successors are not left waiting.
            drop(RingToken::enter(ring)?);
            self.decode_interior(payload, flags, expected_raw)?
        };
        if raw.len() != expected_raw {
            return Err(ParcError::CorruptChunk(format!(
                "chunk decoded to {} bytes, expected {expected_raw}",
                raw.len()
            )));
        }

        // 4. Digest check (non-crypto streams only).
        if self.crypto.is_none() {
            let mut digest = [0u8; MAX_CKSUM_BYTES];
            let n = self.opts.checksum.digest_into(&raw, &mut digest);
            let stored = &frame[layout.digest_off()..layout.digest_off() + n];
            if digest[..n] != *stored {
                return Err(ParcError::DigestMismatch {
                    got:      hex::encode(&digest[..n]),
                    expected: hex::encode(stored),
                });
            }
        }
        Ok(raw)
    }

    /// Reverse the preproc + codec interior of one buffer.
    fn decode_interior(
        &mut self,
        data:         &[u8],
        flags:        u8,
        expected_len: usize,
    ) -> Result<Vec<u8>, ParcError> {
        let compressed = flags & CHUNK_FLAG_COMPRESSED != 0;
        let preproc = flags & CHUNK_FLAG_PREPROC != 0;

        let (ty, mut cur) = if preproc {
            let (&ty, rest) = data
                .split_first()
                .ok_or_else(|| ParcError::CorruptChunk("empty preprocessed payload".into()))?;
            validate_type_byte(ty)?;
            if compressed {
                if rest.len() < 8 {
                    return Err(ParcError::CorruptChunk("short preproc wrapper".into()));
                }
                let preproc_len = u64::from_be_bytes(rest[..8].try_into().unwrap()) as usize;
                if preproc_len > expected_len + expected_len / 2 + 16 {
                    return Err(ParcError::CorruptChunk(format!(
                        "preprocessed length {preproc_len} implausible for {expected_len} raw bytes"
                    )));
                }
                let out = self.interior_decompress(&rest[8..], flags)?;
                if out.len() != preproc_len {
                    return Err(ParcError::CorruptChunk(format!(
                        "codec produced {} bytes, wrapper says {preproc_len}",
                        out.len()
                    )));
                }
                (ty, out)
            } else {
                (ty, rest.to_vec())
            }
        } else if compressed {
            (0, self.interior_decompress(data, flags)?)
        } else {
            (0, data.to_vec())
        };

        if ty & PREPROC_TYPE_DELTA2 != 0 {
            cur = preproc::delta2_decode(&cur)?;
        }
        if ty & PREPROC_TYPE_LZP != 0 {
            cur = preproc::lzp_decompress(&cur, expected_len)?;
        }
        Ok(cur)
    }

    /// Dispatch codec decompression, honoring the adaptive sub-algo bits.
    fn interior_decompress(&mut self, data: &[u8], flags: u8) -> Result<Vec<u8>, ParcError> {
        if self.opts.algo == Algorithm::Adapt {
            let sub = (flags & CHUNK_SUBALGO_MASK) >> CHUNK_SUBALGO_SHIFT;
            let mut child = AdaptiveCodec::child(sub)?;
            Ok(child.decompress(data)?)
        } else {
            Ok(self.codec.decompress(data)?)
        }
    }

    fn decode_dedup_payload(
        &mut self,
        payload:      &[u8],
        flags:        u8,
        expected_raw: usize,
        ring:         Option<&RingToken>,
    ) -> Result<Vec<u8>, ParcError> {
        let hdr = DedupHeader::parse(payload)?;
        if hdr.raw_len as usize != expected_raw {
            return Err(ParcError::CorruptChunk(format!(
                "dedup header raw_len {} disagrees with frame ({expected_raw})",
                hdr.raw_len
            )));
        }
        let index_end = RABIN_HDR_SIZE + hdr.comp_index_len as usize;
        let data_end = index_end + hdr.comp_data_len as usize;
        if data_end != payload.len() {
            return Err(ParcError::CorruptChunk(
                "dedup part sizes disagree with payload length".into(),
            ));
        }

        let index_part = &payload[RABIN_HDR_SIZE..index_end];
        let index_raw_len = hdr.n_entries as usize * 4;
        let index_raw = if index_part.len() == index_raw_len {
            index_part.to_vec()
        } else if index_part.len() < index_raw_len {
            let out = self.index_codec()?.decompress(index_part)?;
            if out.len() != index_raw_len {
                return Err(ParcError::CorruptChunk(format!(
                    "index decompressed to {} bytes, expected {index_raw_len}",
                    out.len()
                )));
            }
            out
        } else {
            return Err(ParcError::CorruptChunk("index larger than its raw form".into()));
        };
        let entries = dedup::unpack_index(&index_raw)?;

        let records =
            self.decode_interior(&payload[index_end..data_end], flags, hdr.data_raw_len as usize)?;
        if records.len() != hdr.data_raw_len as usize {
            return Err(ParcError::CorruptChunk(format!(
                "record stream decoded to {} bytes, header says {}",
                records.len(),
                hdr.data_raw_len
            )));
        }

        let engine = self
            .dedup
            .as_mut()
            .ok_or_else(|| ParcError::CorruptChunk("dedup frame in a non-dedup stream".into()))?;
        let guard = RingToken::enter(ring)?;
        let raw = engine.reconstruct(&entries, &records, expected_raw)?;
        drop(guard);
        Ok(raw)
    }
}

/// Extra payload bytes of the compressed-with-preproc layout.
#[inline]
fn wrapper_cost(ty: u8) -> usize {
    if ty != 0 { PREPROC_WRAPPER_BYTES } else { 0 }
}

/// Extra payload bytes of the stored-with-preproc layout.
#[inline]
fn stored_cost(ty: u8) -> usize {
    if ty != 0 { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CipherKind;

    fn test_opts(algo: Algorithm) -> Options {
        Options {
            algo,
            chunksize: 64 * 1024,
            nthreads: 1,
            ..Options::default()
        }
    }

    fn stack(opts: &Options) -> TransformStack {
        TransformStack::new(opts, None, None).unwrap()
    }

    fn crypto_stack(mut opts: Options, password: &str) -> TransformStack {
        opts.cipher = Some(CipherKind::AesCtr);
        let mut pw = password.as_bytes().to_vec();
        let ctx = CryptoBinding::for_compress(
            CipherKind::AesCtr,
            opts.checksum,
            opts.keylen,
            &mut pw,
        )
        .unwrap();
        TransformStack::new(&opts, Some(Arc::new(ctx)), None).unwrap()
    }

    fn reseal_crc(frame: &mut [u8], layout: crate::format::FrameLayout) {
        let off = layout.mac_off();
        frame[off..off + 4].fill(0);
        let mut h = crc32fast::Hasher::new();
        h.update(frame);
        let crc = h.finalize().to_be_bytes();
        frame[off..off + 4].copy_from_slice(&crc);
    }

    #[test]
    fn plain_chunk_roundtrip() {
        let opts = test_opts(Algorithm::Zstd);
        let mut stack = stack(&opts);
        let raw = b"hello chunk pipeline ".repeat(500);
        let mut frame = Vec::new();
        stack.encode_chunk(0, &raw, &mut frame, None).unwrap();
        assert!(frame.len() < raw.len() + 64);
        let out = stack.decode_chunk(0, &mut frame, None).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn incompressible_chunk_is_stored() {
        use rand::{rngs::StdRng, RngCore, SeedableRng};
        let opts = test_opts(Algorithm::Lz4);
        let mut stack = stack(&opts);
        let mut raw = vec![0u8; 32 * 1024];
        StdRng::seed_from_u64(3).fill_bytes(&mut raw);

        let mut frame = Vec::new();
        stack.encode_chunk(0, &raw, &mut frame, None).unwrap();
        let flags = frame[stack.layout().flags_off()];
        assert_eq!(flags & CHUNK_FLAG_COMPRESSED, 0);
        assert_eq!(stack.decode_chunk(0, &mut frame, None).unwrap(), raw);
    }

    #[test]
    fn preproc_flags_recorded_and_reversed() {
        let mut opts = test_opts(Algorithm::Zlib);
        opts.lzp = true;
        opts.delta2_span = 8;
        let mut stack = stack(&opts);

        // Text repeats (LZP) and carries an int table (Delta2).
        let mut raw = b"the quick brown fox jumps over the lazy dog ".repeat(400);
        for v in 0u32..4000 {
            raw.extend_from_slice(&v.to_be_bytes());
        }

        let mut frame = Vec::new();
        stack.encode_chunk(0, &raw, &mut frame, None).unwrap();
        let flags = frame[stack.layout().flags_off()];
        assert_ne!(flags & CHUNK_FLAG_PREPROC, 0);
        assert_eq!(stack.decode_chunk(0, &mut frame, None).unwrap(), raw);
    }

    #[test]
    fn zeroed_type_byte_is_rejected() {
        let mut opts = test_opts(Algorithm::Zlib);
        opts.lzp = true;
        let mut stack = stack(&opts);
        let raw = b"abcabcabc abcabcabc abcabcabc abcabcabc ".repeat(300);

        let mut frame = Vec::new();
        stack.encode_chunk(0, &raw, &mut frame, None).unwrap();
        let layout = stack.layout();
        assert_ne!(frame[layout.flags_off()] & CHUNK_FLAG_PREPROC, 0);

        // Clear the preproc type byte and re-seal the CRC, so the frame
        // check passes and the preproc validation has to catch it.
        frame[layout.payload_off()] = 0;
        reseal_crc(&mut frame, layout);
        let err = stack.decode_chunk(0, &mut frame, None).unwrap_err();
        assert!(
            err.to_string().contains("invalid preprocessing flags"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn dedup_chunk_roundtrip() {
        let mut opts = test_opts(Algorithm::Zstd);
        opts.dedup = DedupMode::Fixed;
        let mut stack = stack(&opts);

        let mut raw = Vec::new();
        for _ in 0..6 {
            raw.extend_from_slice(&vec![0xAB; 4096]);
            raw.extend_from_slice(&vec![0xCD; 4096]);
        }
        assert!(raw.len() < 64 * 1024);
        let mut frame = Vec::new();
        stack.encode_chunk(0, &raw, &mut frame, None).unwrap();
        let flags = frame[stack.layout().flags_off()];
        assert_ne!(flags & CHUNK_FLAG_DEDUP, 0);
        assert_eq!(stack.decode_chunk(0, &mut frame, None).unwrap(), raw);
    }

    #[test]
    fn adaptive_records_and_uses_sub_algo() {
        let opts = test_opts(Algorithm::Adapt);
        let mut stack = stack(&opts);
        let raw = b"adaptive mode picks the best child codec ".repeat(800);

        let mut frame = Vec::new();
        stack.encode_chunk(0, &raw, &mut frame, None).unwrap();
        let flags = frame[stack.layout().flags_off()];
        assert_ne!(flags & CHUNK_FLAG_COMPRESSED, 0);
        let sub = (flags & CHUNK_SUBALGO_MASK) >> CHUNK_SUBALGO_SHIFT;
        assert!(sub == 1 || sub == 2, "sub-algo {sub}");
        assert_eq!(stack.decode_chunk(0, &mut frame, None).unwrap(), raw);
    }

    #[test]
    fn crypto_chunk_roundtrip_and_auth() {
        let mut enc = crypto_stack(test_opts(Algorithm::Zstd), "hunter2");
        let raw = b"sensitive chunk contents ".repeat(100);

        let mut frame = Vec::new();
        enc.encode_chunk(7, &raw, &mut frame, None).unwrap();

        // Digest region is zeroed in crypto mode.
        let layout = enc.layout();
        assert!(frame[layout.digest_off()..layout.digest_off() + layout.cksum_bytes]
            .iter()
            .all(|&b| b == 0));

        let mut ok = frame.clone();
        assert_eq!(enc.decode_chunk(7, &mut ok, None).unwrap(), raw);

        // Payload bit flip fails authentication before decryption.
        let mut bad = frame.clone();
        let p = layout.payload_off();
        bad[p] ^= 0x40;
        assert!(matches!(
            enc.decode_chunk(7, &mut bad, None),
            Err(ParcError::Crypto(crate::crypto::CryptoError::AuthFailed))
        ));

        // A frame replayed under another chunk id also fails.
        let mut moved = frame;
        assert!(enc.decode_chunk(8, &mut moved, None).is_err());
    }

    #[test]
    fn digest_mismatch_is_detected() {
        let opts = test_opts(Algorithm::None);
        let mut stack = stack(&opts);
        let raw = b"stored verbatim".to_vec();

        let mut frame = Vec::new();
        stack.encode_chunk(0, &raw, &mut frame, None).unwrap();
        let layout = stack.layout();
        // Corrupt the digest and re-seal the CRC: only the digest check
        // can catch this.
        frame[layout.digest_off()] ^= 0xFF;
        reseal_crc(&mut frame, layout);
        assert!(matches!(
            stack.decode_chunk(0, &mut frame, None),
            Err(ParcError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn short_chunk_carries_original_len() {
        let opts = test_opts(Algorithm::Zstd);
        let mut stack = stack(&opts);
        let raw = b"x".to_vec();

        let mut frame = Vec::new();
        stack.encode_chunk(0, &raw, &mut frame, None).unwrap();
        let flags = frame[stack.layout().flags_off()];
        assert_ne!(flags & CHSIZE_MASK, 0);
        let suffix = u64::from_be_bytes(frame[frame.len() - 8..].try_into().unwrap());
        assert_eq!(suffix, 1);
        assert_eq!(stack.decode_chunk(0, &mut frame, None).unwrap(), raw);
    }
}
