//! Stream options — everything the pipeline needs to know up front.

use crate::checksum::ChecksumKind;
use crate::codec::Algorithm;

/// Highest stream-level compression level.
pub const MAX_LEVEL: i32 = 14;

/// Default chunk size: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default compression level.
pub const DEFAULT_LEVEL: i32 = 6;

/// Hard cap on worker threads.
pub const MAX_THREADS: usize = 256;

/// Slack allowed on top of `chunksize` for framing + codec overhead.
/// A frame whose `cmp_len` exceeds `chunksize + CHUNK_OVERHEAD` is
/// rejected at decode time.
pub const CHUNK_OVERHEAD: u64 = 256;

/// Deduplication block splitting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMode {
    Off,
    /// Content-defined boundaries (rolling hash).
    Rabin,
    /// Fixed-size blocks.
    Fixed,
}

/// Stream cipher selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    AesCtr,
    XSalsa20,
}

impl CipherKind {
    /// Stream nonce width stored in the file header.
    #[inline]
    pub fn nonce_len(self) -> usize {
        match self {
            CipherKind::AesCtr   => 8,
            CipherKind::XSalsa20 => 24,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherKind::AesCtr   => "AES",
            CipherKind::XSalsa20 => "SALSA20",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "AES"     => Some(CipherKind::AesCtr),
            "SALSA20" => Some(CipherKind::XSalsa20),
            _ => None,
        }
    }
}

/// Options driving one compression or decompression stream.
#[derive(Debug, Clone)]
pub struct Options {
    pub algo:       Algorithm,
    pub level:      i32,
    pub chunksize:  u64,
    /// Requested worker count; clamped to logical CPUs by the scheduler.
    pub nthreads:   usize,
    pub checksum:   ChecksumKind,

    pub dedup:        DedupMode,
    /// Share the dedup index across all chunks (requires `dedup != Off`).
    pub global_dedup: bool,
    /// 0..=5, selects the mean dedup block size (4 KiB << n).
    pub dedup_block:  u8,
    /// 0 = off, 1 = same-length delta blocks, 2 = any-length.
    pub delta_mode:   u8,

    pub lzp:         bool,
    /// Maximum Delta2 stride to probe; 0 disables the transform.
    pub delta2_span: u8,

    pub cipher: Option<CipherKind>,
    /// Cipher key length in bytes (16 or 32).
    pub keylen: u32,

    /// Input is an archive member stream, not a flat file.
    pub archive: bool,
    /// Collect per-stream counters and report them on completion.
    pub mem_stats:  bool,
    pub comp_stats: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            algo:         Algorithm::Zstd,
            level:        DEFAULT_LEVEL,
            chunksize:    DEFAULT_CHUNK_SIZE,
            nthreads:     0,
            checksum:     ChecksumKind::Blake256,
            dedup:        DedupMode::Off,
            global_dedup: false,
            dedup_block:  1,
            delta_mode:   0,
            lzp:          false,
            delta2_span:  0,
            cipher:       None,
            keylen:       32,
            archive:      false,
            mem_stats:    false,
            comp_stats:   false,
        }
    }
}

impl Options {
    /// Effective worker count: `min(requested, logical_cpus)`, at least 1.
    pub fn effective_threads(&self) -> usize {
        let requested = if self.nthreads == 0 { num_cpus::get() } else { self.nthreads };
        requested.clamp(1, MAX_THREADS).min(num_cpus::get().max(1))
    }
}

/// Parse a size argument with optional g/m/k suffix (case-insensitive).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".into());
    }
    let (num, mult) = match s.as_bytes()[s.len() - 1].to_ascii_lowercase() {
        b'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        b'm' => (&s[..s.len() - 1], 1024 * 1024),
        b'k' => (&s[..s.len() - 1], 1024),
        _    => (s, 1),
    };
    let n: u64 = num.parse().map_err(|_| format!("invalid size '{s}'"))?;
    n.checked_mul(mult).ok_or_else(|| format!("size '{s}' overflows"))
}
