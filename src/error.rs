//! Crate-level error type aggregating the per-concern enums.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::CryptoError;
use crate::dedup::DedupError;
use crate::format::FormatError;
use crate::preproc::PreprocError;

#[derive(Error, Debug)]
pub enum ParcError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    Preproc(#[from] PreprocError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("chunk digest mismatch (got {got}, expected {expected}) - stream is corrupted")]
    DigestMismatch { got: String, expected: String },
    #[error("corrupt chunk payload: {0}")]
    CorruptChunk(String),
    #[error("unexpected end of stream (missing trailer)")]
    UnexpectedEof,
    #[error("stream cancelled")]
    Cancelled,
}

impl ParcError {
    /// True for failures that indicate deliberate or accidental data
    /// modification rather than an environment problem.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            ParcError::Format(FormatError::Tampered)
                | ParcError::Crypto(CryptoError::AuthFailed)
                | ParcError::DigestMismatch { .. }
        )
    }
}
