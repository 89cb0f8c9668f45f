//! Container format — file header, chunk frames, trailer.
//!
//! # File header (all integers big-endian)
//!
//! ```text
//! Offset  Size      Field
//!    0      8       algo_tag   ASCII, space padded ("lzma    ", ...)
//!    8      2       version    = 8; readers accept 5..=8
//!   10      2       flags      (bits below)
//!   12      8       chunksize
//!   20      4       level      i32
//!  [ crypto mode (flags & MASK_CRYPTO_ALG):
//!   24      4       saltlen
//!   28    saltlen   salt
//!    +      8|24    nonce      (8 AES-CTR, 24 XSalsa20)
//!    +      4       keylen     (present when version >= 7; 16 implied below)
//!    +   mac_bytes  hdr_hmac   (absent when version <= 5)
//!    non-crypto mode, version >= 5:
//!   24      4       hdr_crc32 ]
//! ```
//!
//! # Chunk frame
//!
//! ```text
//! cmp_len          8         = cksum_bytes + mac_bytes + 1 + payload len
//! digest_or_zero   cksum_bytes
//! mac_or_crc       mac_bytes (HMAC, or CRC-32 with mac_bytes = 4)
//! flags            1
//! payload          cmp_len - 1 - mac_bytes - cksum_bytes
//! original_len     8         (only when flags & CHSIZE_MASK)
//! ```
//!
//! The MAC/CRC domain is the whole frame with the mac region zeroed, so
//! the value is stable regardless of what later fills the region.  A
//! `cmp_len` of zero is the stream trailer.
//!
//! # Verification order
//! Header: parse → bounds → CRC/HMAC; frame: CRC/HMAC before decryption,
//! decryption before decompression.  MAC comparisons are constant-time.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, WriteBytesExt};
use thiserror::Error;

use crate::checksum::ChecksumKind;
use crate::codec::Algorithm;
use crate::config::{CipherKind, CHUNK_OVERHEAD, MAX_LEVEL};
use crate::crypto::{CryptoBinding, CryptoError};

/// Container version written by this build.
pub const CURRENT_VERSION: u16 = 8;
/// Oldest readable container version (three before current).
pub const MIN_VERSION: u16 = CURRENT_VERSION - 3;

/// Stream trailer: a zero `cmp_len`.
pub const TRAILER: [u8; 8] = [0u8; 8];

// ── FileHeader flags (u16) ───────────────────────────────────────────────────

pub const FLAG_DEDUP:         u16 = 0x0001;
pub const FLAG_DEDUP_FIXED:   u16 = 0x0002;
pub const FLAG_SINGLE_CHUNK:  u16 = 0x0004;
/// Dedup index and block store span all chunks (see `dedup`).
pub const FLAG_DEDUP_GLOBAL:  u16 = 0x0008;
pub const CRYPTO_ALG_AES:     u16 = 0x0010;
pub const CRYPTO_ALG_SALSA20: u16 = 0x0020;
pub const MASK_CRYPTO_ALG:    u16 = 0x0030;
pub const FLAG_ARCHIVE:       u16 = 0x0040;

// ── Chunk flag byte ──────────────────────────────────────────────────────────

pub const CHUNK_FLAG_COMPRESSED: u8 = 0x01;
pub const CHUNK_FLAG_DEDUP:      u8 = 0x02;
pub const CHUNK_FLAG_PREPROC:    u8 = 0x04;
pub const CHUNK_SUBALGO_MASK:    u8 = 0x30;
pub const CHUNK_SUBALGO_SHIFT:   u8 = 4;
/// Set when the chunk is shorter than `chunksize` and carries the
/// 8-byte `original_len` suffix.
pub const CHSIZE_MASK:           u8 = 0x80;

/// Fixed prefix of the file header before any crypto suffix.
const FIXED_HEADER_LEN: usize = 24;
/// Upper bound accepted for `saltlen` when parsing.
const MAX_SALT_LEN: u32 = 4096;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("not a parc stream (unknown algorithm tag {0:?})")]
    FormatMismatch(String),
    #[error("unsupported container version {0} (this build reads {MIN_VERSION}..={CURRENT_VERSION})")]
    UnsupportedVersion(u16),
    #[error("header checksum mismatch - stream is corrupted or tampered with")]
    Tampered,
    #[error("chunk size {0} exceeds 80% of physical memory")]
    OversizeChunk(u64),
    #[error("compression level {0} out of range 0..={MAX_LEVEL}")]
    BadLevel(i32),
    #[error("invalid checksum id in header flags")]
    BadChecksum,
    #[error("invalid crypto algorithm bits {0:#06x}")]
    BadCipher(u16),
    #[error("stream is encrypted and requires a password")]
    PasswordRequired,
    #[error("frame length {0} exceeds bound {1}")]
    OversizeFrame(u64, u64),
    #[error("frame too short for its digest and MAC regions")]
    ShortFrame,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Physical memory, for the chunk-size sanity bound.
pub fn total_ram_bytes() -> u64 {
    // Conservative fallback when sysconf is unavailable.
    const FALLBACK: u64 = 1 << 31;
    unsafe {
        let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
        let page_size = libc::sysconf(libc::_SC_PAGE_SIZE);
        if pages <= 0 || page_size <= 0 {
            FALLBACK
        } else {
            (pages as u64).saturating_mul(page_size as u64)
        }
    }
}

// ── FileHeader ───────────────────────────────────────────────────────────────

/// Parsed file header.  `salt`/`nonce` are empty outside crypto mode.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub algo:      Algorithm,
    pub version:   u16,
    pub flags:     u16,
    pub chunksize: u64,
    pub level:     i32,
    pub salt:      Vec<u8>,
    pub nonce:     Vec<u8>,
    pub keylen:    u32,
}

impl FileHeader {
    pub fn cipher(&self) -> Result<Option<CipherKind>, FormatError> {
        match self.flags & MASK_CRYPTO_ALG {
            0                  => Ok(None),
            CRYPTO_ALG_AES     => Ok(Some(CipherKind::AesCtr)),
            CRYPTO_ALG_SALSA20 => Ok(Some(CipherKind::XSalsa20)),
            bits               => Err(FormatError::BadCipher(bits)),
        }
    }

    pub fn checksum(&self) -> Result<ChecksumKind, FormatError> {
        ChecksumKind::from_flags(self.flags).ok_or(FormatError::BadChecksum)
    }

    #[inline] pub fn is_dedup(&self)       -> bool { self.flags & FLAG_DEDUP != 0 }
    #[inline] pub fn is_dedup_fixed(&self) -> bool { self.flags & FLAG_DEDUP_FIXED != 0 }
    #[inline] pub fn is_archive(&self)     -> bool { self.flags & FLAG_ARCHIVE != 0 }
    #[inline] pub fn is_single_chunk(&self) -> bool { self.flags & FLAG_SINGLE_CHUNK != 0 }

    /// Largest `cmp_len` a frame of this stream may declare.
    #[inline]
    pub fn max_frame_len(&self) -> u64 {
        self.chunksize + CHUNK_OVERHEAD
    }
}

/// Serialize the fixed header prefix.
fn header_body(hdr: &FileHeader) -> io::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(FIXED_HEADER_LEN + 64);
    body.extend_from_slice(&hdr.algo.tag());
    body.write_u16::<BigEndian>(hdr.version)?;
    body.write_u16::<BigEndian>(hdr.flags)?;
    body.write_u64::<BigEndian>(hdr.chunksize)?;
    body.write_i32::<BigEndian>(hdr.level)?;
    Ok(body)
}

/// Write the file header.  In crypto mode `crypto` supplies salt, nonce
/// and the header HMAC; otherwise a CRC-32 closes the header.
pub fn write_file_header<W: Write>(
    w:      &mut W,
    hdr:    &FileHeader,
    crypto: Option<&CryptoBinding>,
) -> Result<(), FormatError> {
    let mut body = header_body(hdr)?;

    if let Some(ctx) = crypto {
        body.write_u32::<BigEndian>(ctx.salt().len() as u32)?;
        body.extend_from_slice(ctx.salt());
        body.extend_from_slice(ctx.nonce());
        body.write_u32::<BigEndian>(ctx.keylen())?;
        let mac = ctx.header_mac(&body)?;
        body.extend_from_slice(&mac);
    } else {
        let mut h = crc32fast::Hasher::new();
        h.update(&body);
        body.write_u32::<BigEndian>(h.finalize())?;
    }

    w.write_all(&body)?;
    Ok(())
}

fn read_exact_vec<R: Read>(r: &mut R, n: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read and validate a file header.
///
/// Validation order: algo tag → version window → chunk-size and level
/// bounds → checksum id → (crypto) key derivation and HMAC, or CRC-32.
/// In crypto mode the password buffer is consumed (zeroed) by key
/// derivation.
pub fn read_file_header<R: Read>(
    r:        &mut R,
    password: Option<&mut [u8]>,
) -> Result<(FileHeader, Option<CryptoBinding>), FormatError> {
    let mut raw = read_exact_vec(r, FIXED_HEADER_LEN)?;

    let tag: [u8; 8] = raw[0..8].try_into().unwrap();
    let algo = Algorithm::from_tag(&tag).ok_or_else(|| {
        FormatError::FormatMismatch(String::from_utf8_lossy(&tag).trim_end().to_string())
    })?;

    let version = u16::from_be_bytes(raw[8..10].try_into().unwrap());
    if !(MIN_VERSION..=CURRENT_VERSION).contains(&version) {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let flags = u16::from_be_bytes(raw[10..12].try_into().unwrap());
    let chunksize = u64::from_be_bytes(raw[12..20].try_into().unwrap());
    if chunksize == 0 || chunksize > total_ram_bytes() / 5 * 4 {
        return Err(FormatError::OversizeChunk(chunksize));
    }

    let level = i32::from_be_bytes(raw[20..24].try_into().unwrap());
    if !(0..=MAX_LEVEL).contains(&level) {
        return Err(FormatError::BadLevel(level));
    }

    let mut hdr = FileHeader {
        algo,
        version,
        flags,
        chunksize,
        level,
        salt: Vec::new(),
        nonce: Vec::new(),
        keylen: 16,
    };
    let checksum = hdr.checksum()?;

    match hdr.cipher()? {
        None => {
            if version >= 5 {
                let stored = read_exact_vec(r, 4)?;
                let mut h = crc32fast::Hasher::new();
                h.update(&raw);
                if h.finalize().to_be_bytes() != stored[..] {
                    return Err(FormatError::Tampered);
                }
            }
            Ok((hdr, None))
        }
        Some(cipher) => {
            let saltlen_bytes = read_exact_vec(r, 4)?;
            raw.extend_from_slice(&saltlen_bytes);
            let saltlen = u32::from_be_bytes(saltlen_bytes[..].try_into().unwrap());
            if saltlen == 0 || saltlen > MAX_SALT_LEN {
                return Err(FormatError::Tampered);
            }

            let salt = read_exact_vec(r, saltlen as usize)?;
            raw.extend_from_slice(&salt);
            let nonce = read_exact_vec(r, cipher.nonce_len())?;
            raw.extend_from_slice(&nonce);

            // Streams older than v7 predate the keylen field.
            let keylen = if version >= 7 {
                let kl = read_exact_vec(r, 4)?;
                raw.extend_from_slice(&kl);
                u32::from_be_bytes(kl[..].try_into().unwrap())
            } else {
                16
            };

            let password = password.ok_or(FormatError::PasswordRequired)?;
            let ctx = CryptoBinding::for_decompress(
                cipher, checksum, keylen, password, &salt, &nonce,
            )?;

            // v5 headers carried no MAC; the chunk MACs still cover the
            // payload, so only the header fields go unauthenticated.
            if version > 5 {
                let stored = read_exact_vec(r, ctx.mac_bytes())?;
                ctx.verify_header_mac(&raw, &stored)
                    .map_err(|_| FormatError::Tampered)?;
            }

            hdr.salt = salt;
            hdr.nonce = nonce;
            hdr.keylen = keylen;
            Ok((hdr, Some(ctx)))
        }
    }
}

// ── Frame layout ─────────────────────────────────────────────────────────────

/// Region widths of a chunk frame, fixed for the stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameLayout {
    pub cksum_bytes: usize,
    pub mac_bytes:   usize,
}

impl FrameLayout {
    /// Layout for a stream: digest width from the checksum, mac width
    /// from the crypto context (CRC-32 width otherwise).
    pub fn new(checksum: ChecksumKind, crypto: Option<&CryptoBinding>) -> Self {
        Self {
            cksum_bytes: checksum.digest_size(),
            mac_bytes:   crypto.map_or(4, |c| c.mac_bytes()),
        }
    }

    #[inline] pub fn digest_off(&self) -> usize { 8 }
    #[inline] pub fn mac_off(&self)    -> usize { 8 + self.cksum_bytes }
    #[inline] pub fn flags_off(&self)  -> usize { self.mac_off() + self.mac_bytes }
    #[inline] pub fn payload_off(&self) -> usize { self.flags_off() + 1 }

    /// Smallest legal `cmp_len` (empty payload).
    #[inline]
    pub fn min_cmp_len(&self) -> u64 {
        (self.cksum_bytes + self.mac_bytes + 1) as u64
    }

    /// Total frame bytes following the 8-byte `cmp_len` prefix.
    #[inline]
    pub fn frame_len(&self, cmp_len: u64, has_suffix: bool) -> usize {
        cmp_len as usize + if has_suffix { 8 } else { 0 }
    }
}

/// Integrity algorithm sealing a frame.
pub enum FrameIntegrity<'a> {
    /// Frame CRC-32, big-endian, left-aligned in the 4-byte mac region.
    Crc32,
    /// Per-chunk HMAC keyed by `(stream key, chunk_id)`.
    Hmac(&'a CryptoBinding, u64),
}

/// Assemble a complete wire frame (including the `cmp_len` prefix and
/// optional `original_len` suffix) into `out`, sealing the mac region.
pub fn build_frame(
    out:          &mut Vec<u8>,
    layout:       FrameLayout,
    digest:       &[u8],
    flags:        u8,
    payload:      &[u8],
    original_len: Option<u64>,
    integrity:    FrameIntegrity<'_>,
) -> Result<(), FormatError> {
    debug_assert_eq!(digest.len(), layout.cksum_bytes);
    let cmp_len = layout.min_cmp_len() + payload.len() as u64;

    out.clear();
    out.reserve(8 + layout.frame_len(cmp_len, original_len.is_some()));
    out.extend_from_slice(&cmp_len.to_be_bytes());
    out.extend_from_slice(digest);
    out.extend_from_slice(&vec![0u8; layout.mac_bytes]);
    out.push(flags);
    out.extend_from_slice(payload);
    if let Some(n) = original_len {
        out.extend_from_slice(&n.to_be_bytes());
    }

    // Sealed over the zeroed mac region.
    let mac_off = layout.mac_off();
    match integrity {
        FrameIntegrity::Crc32 => {
            let mut h = crc32fast::Hasher::new();
            h.update(out);
            let crc = h.finalize().to_be_bytes();
            out[mac_off..mac_off + 4].copy_from_slice(&crc);
        }
        FrameIntegrity::Hmac(ctx, chunk_id) => {
            let mac = ctx.chunk_mac(chunk_id, &[out])?;
            out[mac_off..mac_off + layout.mac_bytes].copy_from_slice(&mac);
        }
    }
    Ok(())
}

/// Verify a complete wire frame in place.  The mac region is zeroed for
/// the computation and not restored; callers read it out beforehand if
/// they need it.
///
/// MUST run before the payload is decrypted or decompressed.
pub fn verify_frame(
    buf:       &mut [u8],
    layout:    FrameLayout,
    integrity: FrameIntegrity<'_>,
) -> Result<(), FormatError> {
    let mac_off = layout.mac_off();
    let mut stored = vec![0u8; layout.mac_bytes];
    stored.copy_from_slice(&buf[mac_off..mac_off + layout.mac_bytes]);
    buf[mac_off..mac_off + layout.mac_bytes].fill(0);

    match integrity {
        FrameIntegrity::Crc32 => {
            let mut h = crc32fast::Hasher::new();
            h.update(buf);
            if h.finalize().to_be_bytes() != stored[..4] {
                return Err(FormatError::Tampered);
            }
        }
        FrameIntegrity::Hmac(ctx, chunk_id) => {
            ctx.verify_chunk_mac(chunk_id, &[buf], &stored)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use std::io::Cursor;

    fn plain_header() -> FileHeader {
        let opts = Options::default();
        FileHeader {
            algo:      Algorithm::Zstd,
            version:   CURRENT_VERSION,
            flags:     opts.checksum.id(),
            chunksize: opts.chunksize,
            level:     opts.level,
            salt:      Vec::new(),
            nonce:     Vec::new(),
            keylen:    16,
        }
    }

    #[test]
    fn plain_header_roundtrip() {
        let hdr = plain_header();
        let mut buf = Vec::new();
        write_file_header(&mut buf, &hdr, None).unwrap();

        let (parsed, ctx) = read_file_header(&mut Cursor::new(&buf), None).unwrap();
        assert!(ctx.is_none());
        assert_eq!(parsed.algo, Algorithm::Zstd);
        assert_eq!(parsed.version, CURRENT_VERSION);
        assert_eq!(parsed.chunksize, hdr.chunksize);
        assert_eq!(parsed.checksum().unwrap(), ChecksumKind::Blake256);
    }

    #[test]
    fn every_header_bit_flip_is_detected() {
        let hdr = plain_header();
        let mut buf = Vec::new();
        write_file_header(&mut buf, &hdr, None).unwrap();

        for byte in 0..buf.len() {
            let mut bad = buf.clone();
            bad[byte] ^= 0x01;
            assert!(
                read_file_header(&mut Cursor::new(&bad), None).is_err(),
                "flip at byte {byte} went unnoticed"
            );
        }
    }

    #[test]
    fn unknown_tag_is_format_mismatch() {
        let mut hdr = plain_header();
        hdr.algo = Algorithm::Zstd;
        let mut buf = Vec::new();
        write_file_header(&mut buf, &hdr, None).unwrap();
        buf[0..8].copy_from_slice(b"wurble  ");
        assert!(matches!(
            read_file_header(&mut Cursor::new(&buf), None),
            Err(FormatError::FormatMismatch(_))
        ));
    }

    #[test]
    fn version_window_is_enforced() {
        for version in [MIN_VERSION - 1, CURRENT_VERSION + 1] {
            let mut hdr = plain_header();
            hdr.version = version;
            let mut buf = Vec::new();
            write_file_header(&mut buf, &hdr, None).unwrap();
            assert!(matches!(
                read_file_header(&mut Cursor::new(&buf), None),
                Err(FormatError::UnsupportedVersion(v)) if v == version
            ));
        }
    }

    #[test]
    fn oversize_chunksize_is_rejected() {
        let mut hdr = plain_header();
        hdr.chunksize = u64::MAX / 2;
        let mut buf = Vec::new();
        write_file_header(&mut buf, &hdr, None).unwrap();
        assert!(matches!(
            read_file_header(&mut Cursor::new(&buf), None),
            Err(FormatError::OversizeChunk(_))
        ));
    }

    #[test]
    fn crypto_header_roundtrip_and_tamper() {
        let mut pw = b"hunter2".to_vec();
        let ctx = CryptoBinding::for_compress(
            CipherKind::AesCtr,
            ChecksumKind::Blake256,
            32,
            &mut pw,
        )
        .unwrap();

        let mut hdr = plain_header();
        hdr.flags |= CRYPTO_ALG_AES;
        let mut buf = Vec::new();
        write_file_header(&mut buf, &hdr, Some(&ctx)).unwrap();

        // Correct password parses.
        let mut pw = b"hunter2".to_vec();
        let (parsed, rctx) =
            read_file_header(&mut Cursor::new(&buf), Some(&mut pw)).unwrap();
        assert!(rctx.is_some());
        assert_eq!(parsed.keylen, 32);
        assert_eq!(parsed.cipher().unwrap(), Some(CipherKind::AesCtr));

        // Missing password is an explicit error.
        assert!(matches!(
            read_file_header(&mut Cursor::new(&buf), None),
            Err(FormatError::PasswordRequired)
        ));

        // Any bit flip fails the header HMAC (or field validation).
        for byte in 0..buf.len() {
            let mut bad = buf.clone();
            bad[byte] ^= 0x80;
            let mut pw = b"hunter2".to_vec();
            assert!(
                read_file_header(&mut Cursor::new(&bad), Some(&mut pw)).is_err(),
                "flip at byte {byte} went unnoticed"
            );
        }

        // Wrong password fails the header HMAC.
        let mut pw = b"hunter3".to_vec();
        assert!(matches!(
            read_file_header(&mut Cursor::new(&buf), Some(&mut pw)),
            Err(FormatError::Tampered)
        ));
    }

    #[test]
    fn frame_seal_verify_roundtrip() {
        let layout = FrameLayout::new(ChecksumKind::Blake256, None);
        let digest = [0xAAu8; 32];
        let payload = b"frame payload bytes";
        let mut frame = Vec::new();
        build_frame(
            &mut frame,
            layout,
            &digest,
            CHUNK_FLAG_COMPRESSED | CHSIZE_MASK,
            payload,
            Some(19),
            FrameIntegrity::Crc32,
        )
        .unwrap();

        let cmp_len = u64::from_be_bytes(frame[..8].try_into().unwrap());
        assert_eq!(cmp_len, layout.min_cmp_len() + payload.len() as u64);
        assert_eq!(frame.len(), 8 + layout.frame_len(cmp_len, true));

        let mut ok = frame.clone();
        verify_frame(&mut ok, layout, FrameIntegrity::Crc32).unwrap();

        for byte in 0..frame.len() {
            let mut bad = frame.clone();
            bad[byte] ^= 0x04;
            assert!(
                verify_frame(&mut bad, layout, FrameIntegrity::Crc32).is_err(),
                "flip at byte {byte} went unnoticed"
            );
        }
    }

    #[test]
    fn frame_hmac_covers_every_byte() {
        let mut pw = b"pw".to_vec();
        let ctx = CryptoBinding::for_compress(
            CipherKind::XSalsa20,
            ChecksumKind::Sha256,
            32,
            &mut pw,
        )
        .unwrap();
        let layout = FrameLayout::new(ChecksumKind::Sha256, Some(&ctx));
        assert_eq!(layout.mac_bytes, 32);

        let digest = vec![0u8; 32]; // zeroed in crypto mode
        let mut frame = Vec::new();
        build_frame(
            &mut frame,
            layout,
            &digest,
            CHUNK_FLAG_COMPRESSED,
            b"ciphertext",
            None,
            FrameIntegrity::Hmac(&ctx, 5),
        )
        .unwrap();

        let mut ok = frame.clone();
        verify_frame(&mut ok, layout, FrameIntegrity::Hmac(&ctx, 5)).unwrap();

        // Wrong chunk id fails: frames cannot be transplanted.
        let mut moved = frame.clone();
        assert!(verify_frame(&mut moved, layout, FrameIntegrity::Hmac(&ctx, 6)).is_err());

        for byte in 0..frame.len() {
            let mut bad = frame.clone();
            bad[byte] ^= 0x10;
            assert!(
                verify_frame(&mut bad, layout, FrameIntegrity::Hmac(&ctx, 5)).is_err(),
                "flip at byte {byte} went unnoticed"
            );
        }
    }
}
