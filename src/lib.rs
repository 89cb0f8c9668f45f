//! # parc — parallel chunked multi-algorithm compressor
//!
//! Format guarantees (frozen at container version 8):
//! - All multi-byte integers on the wire are big-endian; never negotiated
//! - The stream is self-describing: the 8-byte algo tag, version, flags,
//!   chunk size and level lead every stream
//! - Header integrity is mandatory: CRC-32 in plain streams, an HMAC
//!   derived from the password in encrypted streams
//! - Every chunk frame carries either a digest of its raw bytes or a
//!   per-chunk HMAC; frames are verified before decryption, decrypted
//!   before decompression — no opt-outs, no partial decode
//! - Chunks are independent: frames appear in strictly ascending chunk
//!   id, and encrypted chunks are individually decryptable
//! - A `cmp_len` of zero is the stream trailer; a stream without its
//!   trailer is truncated, never a valid prefix
//! - Readers accept the three container versions before the current one
//!   and nothing else

pub mod archive;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod format;
pub mod preproc;
pub mod scheduler;
pub mod stream;
pub mod transform;

// Flat re-exports for the most common types.
pub use archive::{ArchiveExtractor, ArchiveStream};
pub use checksum::ChecksumKind;
pub use codec::{get_codec, Algorithm, Codec, CodecError};
pub use config::{parse_size, CipherKind, DedupMode, Options};
pub use crypto::CryptoBinding;
pub use error::ParcError;
pub use format::{FileHeader, FormatError, CURRENT_VERSION};
pub use stream::{
    compress_file, compress_stream, decompress_file, decompress_stream, Stats,
};
