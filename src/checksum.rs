//! Chunk digest registry.
//!
//! Every non-encrypted chunk carries a digest of its raw (pre-transform)
//! bytes in the frame's `digest_or_zero` region.  The digest algorithm is
//! declared once in the file header flags and is fixed for the stream.
//!
//! # Wire ids
//! The id occupies the `CKSUM_MASK` bits of the header flags:
//!
//! ```text
//! 0x100  CRC-64 (XZ polynomial)      8 bytes
//! 0x200  BLAKE-256                  32 bytes
//! 0x300  BLAKE-512                  64 bytes
//! 0x400  SHA-256                    32 bytes
//! 0x500  SHA-512                    64 bytes
//! 0x600  KECCAK-256                 32 bytes
//! 0x700  KECCAK-512                 64 bytes
//! ```
//!
//! Ids 0x200/0x300 originally designated the SKEIN digests of the same
//! widths; streams from that era (version <= 5) decode through the BLAKE
//! implementations at the identical ids, so no separate legacy ids
//! exist.

use blake2::{Blake2b512, Blake2s256};
use crc::Crc;
use sha2::{Digest, Sha256, Sha512};
use sha3::{Keccak256, Keccak512};

/// Largest digest width any kind produces.
pub const MAX_CKSUM_BYTES: usize = 64;

/// CRC-64 instance shared by digesting and tests.
pub const CRC64: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_XZ);

/// Mask over the header flag bits holding the checksum id.
pub const CKSUM_MASK: u16 = 0x0700;

/// Digest algorithm for raw chunk bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Crc64,
    Blake256,
    Blake512,
    Sha256,
    Sha512,
    Keccak256,
    Keccak512,
}

impl ChecksumKind {
    /// Wire id, already positioned inside `CKSUM_MASK`.
    #[inline]
    pub fn id(self) -> u16 {
        match self {
            ChecksumKind::Crc64     => 0x0100,
            ChecksumKind::Blake256  => 0x0200,
            ChecksumKind::Blake512  => 0x0300,
            ChecksumKind::Sha256    => 0x0400,
            ChecksumKind::Sha512    => 0x0500,
            ChecksumKind::Keccak256 => 0x0600,
            ChecksumKind::Keccak512 => 0x0700,
        }
    }

    /// Decode a checksum id from header flags.
    ///
    /// Old streams whose 0x200/0x300 meant SKEIN resolve here to the
    /// BLAKE kinds of identical width; the ids are shared by design.
    pub fn from_flags(flags: u16) -> Option<Self> {
        match flags & CKSUM_MASK {
            0x0100 => Some(ChecksumKind::Crc64),
            0x0200 => Some(ChecksumKind::Blake256),
            0x0300 => Some(ChecksumKind::Blake512),
            0x0400 => Some(ChecksumKind::Sha256),
            0x0500 => Some(ChecksumKind::Sha512),
            0x0600 => Some(ChecksumKind::Keccak256),
            0x0700 => Some(ChecksumKind::Keccak512),
            _ => None,
        }
    }

    /// Digest width in bytes (`cksum_bytes` in the frame layout).
    #[inline]
    pub fn digest_size(self) -> usize {
        match self {
            ChecksumKind::Crc64 => 8,
            ChecksumKind::Blake256 | ChecksumKind::Sha256 | ChecksumKind::Keccak256 => 32,
            ChecksumKind::Blake512 | ChecksumKind::Sha512 | ChecksumKind::Keccak512 => 64,
        }
    }

    /// Digest `data` into `out`, returning the digest width.
    ///
    /// `out` must be at least [`MAX_CKSUM_BYTES`] long; bytes past the
    /// width are left untouched.
    pub fn digest_into(self, data: &[u8], out: &mut [u8]) -> usize {
        let n = self.digest_size();
        match self {
            ChecksumKind::Crc64 => {
                out[..8].copy_from_slice(&CRC64.checksum(data).to_be_bytes());
            }
            ChecksumKind::Blake256  => out[..32].copy_from_slice(&Blake2s256::digest(data)),
            ChecksumKind::Blake512  => out[..64].copy_from_slice(&Blake2b512::digest(data)),
            ChecksumKind::Sha256    => out[..32].copy_from_slice(&Sha256::digest(data)),
            ChecksumKind::Sha512    => out[..64].copy_from_slice(&Sha512::digest(data)),
            ChecksumKind::Keccak256 => out[..32].copy_from_slice(&Keccak256::digest(data)),
            ChecksumKind::Keccak512 => out[..64].copy_from_slice(&Keccak512::digest(data)),
        }
        n
    }

    /// Human-readable name, also the `-S` CLI spelling.
    pub fn name(self) -> &'static str {
        match self {
            ChecksumKind::Crc64     => "CRC64",
            ChecksumKind::Blake256  => "BLAKE256",
            ChecksumKind::Blake512  => "BLAKE512",
            ChecksumKind::Sha256    => "SHA256",
            ChecksumKind::Sha512    => "SHA512",
            ChecksumKind::Keccak256 => "KECCAK256",
            ChecksumKind::Keccak512 => "KECCAK512",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "CRC64"     => Some(ChecksumKind::Crc64),
            "BLAKE256"  => Some(ChecksumKind::Blake256),
            "BLAKE512"  => Some(ChecksumKind::Blake512),
            "SHA256"    => Some(ChecksumKind::Sha256),
            "SHA512"    => Some(ChecksumKind::Sha512),
            "KECCAK256" => Some(ChecksumKind::Keccak256),
            "KECCAK512" => Some(ChecksumKind::Keccak512),
            _ => None,
        }
    }
}
