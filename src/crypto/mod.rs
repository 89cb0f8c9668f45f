//! Stream encryption and authentication for parc containers.
//!
//! Key derivation: PBKDF2-HMAC-SHA256(password, salt, 50k rounds) →
//! `keylen` cipher-key bytes ‖ 32 MAC-master bytes.  The password buffer
//! is zeroed as soon as derivation completes; derived keys are zeroed on
//! teardown (`Zeroizing` — the writes are not elided by the compiler).
//!
//! Ciphers are length-preserving stream ciphers applied in place:
//! - AES-CTR: counter block = `nonce(8) ‖ chunk_id(u32 BE) ‖ ctr(u32)`,
//!   so every chunk owns a disjoint 2^32-block keystream segment.
//! - XSalsa20: per-chunk nonce = `base_nonce[0..16] ‖ chunk_id(u64 BE)`.
//!
//! Chunks are therefore independently decryptable and reorderable.
//!
//! MAC keying: per-chunk key = HMAC-SHA256(mac_master, chunk_id BE); the
//! file header is authenticated with the MAC master directly.  The MAC
//! algorithm follows the stream's checksum family (keyed BLAKE2 for the
//! BLAKE kinds, HMAC otherwise); verification is constant-time via
//! `Mac::verify_slice`.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::{Aes128, Aes256};
use blake2::{Blake2bMac512, Blake2sMac256};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use salsa20::XSalsa20;
use sha2::{Sha256, Sha512};
use sha3::{Keccak256, Keccak512};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::checksum::ChecksumKind;
use crate::config::CipherKind;

type Aes128Ctr = ctr::Ctr32BE<Aes128>;
type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// PBKDF2 iteration count.  Frozen: decoding derives with the same value.
pub const PBKDF2_ROUNDS: u32 = 50_000;

/// Salt width written to the file header.
pub const SALT_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("authentication failed - wrong password or corrupted data")]
    AuthFailed,
    #[error("invalid key length {0} (expected 16 or 32)")]
    InvalidKeyLength(u32),
    #[error("SALSA20 requires a 32-byte key")]
    SalsaKeyLength,
    #[error("chunk id {0} exceeds the cipher counter space")]
    CounterExhausted(u64),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

// ── MAC family ───────────────────────────────────────────────────────────────

/// MAC algorithm, chosen from the stream's checksum kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacKind {
    HmacSha256,
    HmacSha512,
    Blake2s,
    Blake2b,
    HmacKeccak256,
    HmacKeccak512,
}

impl MacKind {
    fn for_checksum(cksum: ChecksumKind) -> Self {
        match cksum {
            // CRC-64 has no keyed form; HMAC-SHA256 stands in.
            ChecksumKind::Crc64     => MacKind::HmacSha256,
            ChecksumKind::Sha256    => MacKind::HmacSha256,
            ChecksumKind::Sha512    => MacKind::HmacSha512,
            ChecksumKind::Blake256  => MacKind::Blake2s,
            ChecksumKind::Blake512  => MacKind::Blake2b,
            ChecksumKind::Keccak256 => MacKind::HmacKeccak256,
            ChecksumKind::Keccak512 => MacKind::HmacKeccak512,
        }
    }

    fn output_len(self) -> usize {
        match self {
            MacKind::HmacSha256 | MacKind::Blake2s | MacKind::HmacKeccak256 => 32,
            MacKind::HmacSha512 | MacKind::Blake2b | MacKind::HmacKeccak512 => 64,
        }
    }
}

macro_rules! mac_over {
    ($mac:ty, $key:expr, $parts:expr, $op:expr) => {{
        let mut m = <$mac>::new_from_slice($key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        for &part in $parts {
            m.update(part);
        }
        $op(m)
    }};
}

fn mac_compute(kind: MacKind, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, CryptoError> {
    match kind {
        MacKind::HmacSha256 => {
            mac_over!(Hmac<Sha256>, key, parts, |m: Hmac<Sha256>| Ok(m.finalize().into_bytes().to_vec()))
        }
        MacKind::HmacSha512 => {
            mac_over!(Hmac<Sha512>, key, parts, |m: Hmac<Sha512>| Ok(m.finalize().into_bytes().to_vec()))
        }
        MacKind::Blake2s => {
            mac_over!(Blake2sMac256, key, parts, |m: Blake2sMac256| Ok(m.finalize().into_bytes().to_vec()))
        }
        MacKind::Blake2b => {
            mac_over!(Blake2bMac512, key, parts, |m: Blake2bMac512| Ok(m.finalize().into_bytes().to_vec()))
        }
        MacKind::HmacKeccak256 => {
            mac_over!(Hmac<Keccak256>, key, parts, |m: Hmac<Keccak256>| Ok(m.finalize().into_bytes().to_vec()))
        }
        MacKind::HmacKeccak512 => {
            mac_over!(Hmac<Keccak512>, key, parts, |m: Hmac<Keccak512>| Ok(m.finalize().into_bytes().to_vec()))
        }
    }
}

fn mac_verify(kind: MacKind, key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), CryptoError> {
    // verify_slice performs the comparison in constant time.
    match kind {
        MacKind::HmacSha256 => {
            mac_over!(Hmac<Sha256>, key, parts, |m: Hmac<Sha256>| m.verify_slice(tag).map_err(|_| CryptoError::AuthFailed))
        }
        MacKind::HmacSha512 => {
            mac_over!(Hmac<Sha512>, key, parts, |m: Hmac<Sha512>| m.verify_slice(tag).map_err(|_| CryptoError::AuthFailed))
        }
        MacKind::Blake2s => {
            mac_over!(Blake2sMac256, key, parts, |m: Blake2sMac256| m.verify_slice(tag).map_err(|_| CryptoError::AuthFailed))
        }
        MacKind::Blake2b => {
            mac_over!(Blake2bMac512, key, parts, |m: Blake2bMac512| m.verify_slice(tag).map_err(|_| CryptoError::AuthFailed))
        }
        MacKind::HmacKeccak256 => {
            mac_over!(Hmac<Keccak256>, key, parts, |m: Hmac<Keccak256>| m.verify_slice(tag).map_err(|_| CryptoError::AuthFailed))
        }
        MacKind::HmacKeccak512 => {
            mac_over!(Hmac<Keccak512>, key, parts, |m: Hmac<Keccak512>| m.verify_slice(tag).map_err(|_| CryptoError::AuthFailed))
        }
    }
}

// ── CryptoBinding ────────────────────────────────────────────────────────────

/// Per-stream crypto context: cipher key, MAC master, salt and nonce.
///
/// Created once at stream start and shared read-only by every worker.
/// Key material lives in `Zeroizing` buffers and is wiped on drop.
pub struct CryptoBinding {
    cipher:     CipherKind,
    keylen:     u32,
    mac_kind:   MacKind,
    cipher_key: Zeroizing<Vec<u8>>,
    mac_master: Zeroizing<[u8; 32]>,
    salt:       Vec<u8>,
    nonce:      Vec<u8>,
}

impl CryptoBinding {
    /// Build a context for a new stream: fresh random salt and nonce,
    /// keys derived from `password`, which is zeroed before returning.
    pub fn for_compress(
        cipher:   CipherKind,
        checksum: ChecksumKind,
        keylen:   u32,
        password: &mut [u8],
    ) -> Result<Self, CryptoError> {
        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = vec![0u8; cipher.nonce_len()];
        OsRng.fill_bytes(&mut nonce);
        Self::derive(cipher, checksum, keylen, password, salt, nonce)
    }

    /// Build a context for an existing stream from the header's salt and
    /// nonce.  `password` is zeroed before returning.
    pub fn for_decompress(
        cipher:   CipherKind,
        checksum: ChecksumKind,
        keylen:   u32,
        password: &mut [u8],
        salt:     &[u8],
        nonce:    &[u8],
    ) -> Result<Self, CryptoError> {
        Self::derive(cipher, checksum, keylen, password, salt.to_vec(), nonce.to_vec())
    }

    fn derive(
        cipher:   CipherKind,
        checksum: ChecksumKind,
        keylen:   u32,
        password: &mut [u8],
        salt:     Vec<u8>,
        nonce:    Vec<u8>,
    ) -> Result<Self, CryptoError> {
        if keylen != 16 && keylen != 32 {
            password.zeroize();
            return Err(CryptoError::InvalidKeyLength(keylen));
        }
        if cipher == CipherKind::XSalsa20 && keylen != 32 {
            password.zeroize();
            return Err(CryptoError::SalsaKeyLength);
        }

        let mut okm = Zeroizing::new(vec![0u8; keylen as usize + 32]);
        pbkdf2_hmac::<Sha256>(password, &salt, PBKDF2_ROUNDS, &mut okm);
        password.zeroize();

        let cipher_key = Zeroizing::new(okm[..keylen as usize].to_vec());
        let mut mac_master = Zeroizing::new([0u8; 32]);
        mac_master.copy_from_slice(&okm[keylen as usize..]);

        Ok(Self {
            cipher,
            keylen,
            mac_kind: MacKind::for_checksum(checksum),
            cipher_key,
            mac_master,
            salt,
            nonce,
        })
    }

    #[inline] pub fn cipher(&self) -> CipherKind { self.cipher }
    #[inline] pub fn keylen(&self) -> u32        { self.keylen }
    #[inline] pub fn salt(&self)   -> &[u8]      { &self.salt }
    #[inline] pub fn nonce(&self)  -> &[u8]      { &self.nonce }

    /// Width of every MAC this context produces (`mac_bytes`).
    #[inline]
    pub fn mac_bytes(&self) -> usize {
        self.mac_kind.output_len()
    }

    // ── Header MAC ───────────────────────────────────────────────────────

    pub fn header_mac(&self, header: &[u8]) -> Result<Vec<u8>, CryptoError> {
        mac_compute(self.mac_kind, &*self.mac_master, &[header])
    }

    pub fn verify_header_mac(&self, header: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
        mac_verify(self.mac_kind, &*self.mac_master, &[header], tag)
    }

    // ── Chunk MAC ────────────────────────────────────────────────────────

    fn chunk_key(&self, chunk_id: u64) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        Ok(Zeroizing::new(mac_compute(
            MacKind::HmacSha256,
            &*self.mac_master,
            &[&chunk_id.to_be_bytes()],
        )?))
    }

    /// MAC over the assembled frame regions for chunk `chunk_id`.
    pub fn chunk_mac(&self, chunk_id: u64, parts: &[&[u8]]) -> Result<Vec<u8>, CryptoError> {
        let key = self.chunk_key(chunk_id)?;
        mac_compute(self.mac_kind, &key, parts)
    }

    /// Constant-time verification; MUST run before any decryption.
    pub fn verify_chunk_mac(
        &self,
        chunk_id: u64,
        parts:    &[&[u8]],
        tag:      &[u8],
    ) -> Result<(), CryptoError> {
        let key = self.chunk_key(chunk_id)?;
        mac_verify(self.mac_kind, &key, parts, tag)
    }

    // ── Cipher ───────────────────────────────────────────────────────────

    /// Encrypt or decrypt `buf` in place for chunk `chunk_id`.
    ///
    /// Stream ciphers are involutions under the same keystream, so the
    /// same call serves both directions.
    pub fn apply_cipher(&self, chunk_id: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        match self.cipher {
            CipherKind::AesCtr => {
                if chunk_id > u32::MAX as u64 {
                    return Err(CryptoError::CounterExhausted(chunk_id));
                }
                let mut iv = [0u8; 16];
                iv[..8].copy_from_slice(&self.nonce);
                iv[8..12].copy_from_slice(&(chunk_id as u32).to_be_bytes());
                // iv[12..16] is the per-chunk block counter, starting at 0.
                match self.keylen {
                    16 => {
                        let mut c = Aes128Ctr::new_from_slices(&self.cipher_key, &iv)
                            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
                        c.apply_keystream(buf);
                    }
                    _ => {
                        let mut c = Aes256Ctr::new_from_slices(&self.cipher_key, &iv)
                            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
                        c.apply_keystream(buf);
                    }
                }
            }
            CipherKind::XSalsa20 => {
                let mut per_chunk = [0u8; 24];
                per_chunk[..16].copy_from_slice(&self.nonce[..16]);
                per_chunk[16..].copy_from_slice(&chunk_id.to_be_bytes());
                let mut c = XSalsa20::new_from_slices(&self.cipher_key, &per_chunk)
                    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
                c.apply_keystream(buf);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(cipher: CipherKind, keylen: u32) -> CryptoBinding {
        let mut pw = b"hunter2".to_vec();
        CryptoBinding::for_compress(cipher, ChecksumKind::Blake256, keylen, &mut pw).unwrap()
    }

    #[test]
    fn password_is_zeroed_after_derivation() {
        let mut pw = b"secret passphrase".to_vec();
        let _ = CryptoBinding::for_compress(CipherKind::AesCtr, ChecksumKind::Sha256, 32, &mut pw)
            .unwrap();
        assert!(pw.iter().all(|&b| b == 0));
    }

    #[test]
    fn cipher_roundtrips_per_chunk() {
        for (cipher, keylen) in [
            (CipherKind::AesCtr, 16),
            (CipherKind::AesCtr, 32),
            (CipherKind::XSalsa20, 32),
        ] {
            let ctx = binding(cipher, keylen);
            let plain = b"chunk pipeline payload".repeat(11);
            let mut buf = plain.clone();
            ctx.apply_cipher(3, &mut buf).unwrap();
            assert_ne!(buf, plain);
            ctx.apply_cipher(3, &mut buf).unwrap();
            assert_eq!(buf, plain);
        }
    }

    #[test]
    fn chunks_use_distinct_keystreams() {
        let ctx = binding(CipherKind::AesCtr, 32);
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        ctx.apply_cipher(0, &mut a).unwrap();
        ctx.apply_cipher(1, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn same_password_same_salt_same_keys() {
        let mut pw1 = b"pw".to_vec();
        let mut pw2 = b"pw".to_vec();
        let a = CryptoBinding::for_compress(CipherKind::AesCtr, ChecksumKind::Sha256, 32, &mut pw1)
            .unwrap();
        let b = CryptoBinding::for_decompress(
            CipherKind::AesCtr,
            ChecksumKind::Sha256,
            32,
            &mut pw2,
            a.salt(),
            a.nonce(),
        )
        .unwrap();
        let tag = a.chunk_mac(7, &[b"frame"]).unwrap();
        b.verify_chunk_mac(7, &[b"frame"], &tag).unwrap();
    }

    #[test]
    fn wrong_password_fails_verification() {
        let mut pw1 = b"hunter2".to_vec();
        let mut pw2 = b"hunter3".to_vec();
        let a = CryptoBinding::for_compress(CipherKind::AesCtr, ChecksumKind::Sha256, 32, &mut pw1)
            .unwrap();
        let b = CryptoBinding::for_decompress(
            CipherKind::AesCtr,
            ChecksumKind::Sha256,
            32,
            &mut pw2,
            a.salt(),
            a.nonce(),
        )
        .unwrap();
        let tag = a.chunk_mac(0, &[b"frame"]).unwrap();
        assert!(matches!(
            b.verify_chunk_mac(0, &[b"frame"], &tag),
            Err(CryptoError::AuthFailed)
        ));
    }

    #[test]
    fn mac_width_tracks_checksum_family() {
        let mut pw = b"x".to_vec();
        let c = CryptoBinding::for_compress(CipherKind::AesCtr, ChecksumKind::Sha512, 32, &mut pw)
            .unwrap();
        assert_eq!(c.mac_bytes(), 64);
        let mut pw = b"x".to_vec();
        let c = CryptoBinding::for_compress(CipherKind::AesCtr, ChecksumKind::Crc64, 32, &mut pw)
            .unwrap();
        assert_eq!(c.mac_bytes(), 32);
    }

    #[test]
    fn salsa_requires_full_key() {
        let mut pw = b"x".to_vec();
        assert!(matches!(
            CryptoBinding::for_compress(CipherKind::XSalsa20, ChecksumKind::Sha256, 16, &mut pw),
            Err(CryptoError::SalsaKeyLength)
        ));
    }
}
