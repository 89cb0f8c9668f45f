//! Stream drivers: tie the header, scheduler, and adapters together.
//!
//! `compress_stream`/`decompress_stream` run the pipeline over any
//! `Read`/`Write` pair (pipe mode uses stdin/stdout directly).  The file
//! front-ends write to `<dest>.tmp` and rename on success, so a failed
//! run never leaves a partial output behind.
//!
//! # Reader adapters
//! - [`FixedChunkReader`]: plain `chunksize` reads.
//! - [`RabinChunkReader`]: reads up to `chunksize`, then backs off to the
//!   last content-defined boundary in the upper half and carries the tail
//!   into the next chunk, so dedup block boundaries survive chunking.
//!   The final read emits whatever remains, even below the minimum block
//!   size.
//! - [`FrameReader`]: reads one complete frame, enforcing
//!   `cmp_len <= chunksize + 256` and the minimum region size before any
//!   allocation trusts the declared length.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{DedupMode, Options};
use crate::crypto::CryptoBinding;
use crate::dedup::{mean_block_size, GlobalState, RollingHash};
use crate::error::ParcError;
use crate::format::{
    self, FileHeader, FormatError, FrameLayout, CHSIZE_MASK, CRYPTO_ALG_AES, CRYPTO_ALG_SALSA20,
    CURRENT_VERSION, FLAG_ARCHIVE, FLAG_DEDUP, FLAG_DEDUP_FIXED, FLAG_DEDUP_GLOBAL,
    FLAG_SINGLE_CHUNK,
};
use crate::scheduler::{self, ChunkSource, FrameSource};

// ── Stats ────────────────────────────────────────────────────────────────────

/// Per-stream counters, shared across producer/writer threads.
#[derive(Debug, Default)]
pub struct Stats {
    bytes_in:  AtomicU64,
    bytes_out: AtomicU64,
    chunks:    AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline] pub fn add_in(&self, n: u64)  { self.bytes_in.fetch_add(n, Ordering::Relaxed); }
    #[inline] pub fn add_out(&self, n: u64) { self.bytes_out.fetch_add(n, Ordering::Relaxed); }
    #[inline] pub fn add_chunk(&self)       { self.chunks.fetch_add(1, Ordering::Relaxed); }

    #[inline] pub fn bytes_in(&self)  -> u64 { self.bytes_in.load(Ordering::Relaxed) }
    #[inline] pub fn bytes_out(&self) -> u64 { self.bytes_out.load(Ordering::Relaxed) }
    #[inline] pub fn chunks(&self)    -> u64 { self.chunks.load(Ordering::Relaxed) }

    /// Compression ratio (input / output); 0 when nothing was written.
    pub fn ratio(&self) -> f64 {
        let out = self.bytes_out();
        if out == 0 {
            0.0
        } else {
            self.bytes_in() as f64 / out as f64
        }
    }

    /// Upper bound on worker buffer memory: two rotating buffers per
    /// active lane, allocated lazily.
    pub fn buffer_memory(&self, nthreads: usize, chunksize: u64) -> u64 {
        let active = (self.chunks().min(nthreads as u64)).max(1);
        active * 2 * chunksize
    }
}

// ── Chunk sources ────────────────────────────────────────────────────────────

fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match src.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

/// Plain fixed-size chunk reads.
pub struct FixedChunkReader<'r, R: Read + Send> {
    src:       &'r mut R,
    chunksize: usize,
}

impl<'r, R: Read + Send> FixedChunkReader<'r, R> {
    pub fn new(src: &'r mut R, chunksize: u64) -> Self {
        Self { src, chunksize: chunksize as usize }
    }
}

impl<R: Read + Send> ChunkSource for FixedChunkReader<'_, R> {
    fn read_chunk(&mut self, buf: &mut Vec<u8>) -> Result<usize, ParcError> {
        buf.resize(self.chunksize, 0);
        Ok(read_full(self.src, buf)?)
    }
}

/// Content-aware chunk reads for rabin dedup: fill to `chunksize`, back
/// off to the last rolling-hash boundary in the upper half, and carry
/// the tail into the next chunk.
pub struct RabinChunkReader<'r, R: Read + Send> {
    src:       &'r mut R,
    chunksize: usize,
    mask:      u32,
    carry:     Vec<u8>,
}

impl<'r, R: Read + Send> RabinChunkReader<'r, R> {
    pub fn new(src: &'r mut R, chunksize: u64, block_level: u8) -> Self {
        Self {
            src,
            chunksize: chunksize as usize,
            mask: (mean_block_size(block_level) - 1) as u32,
            carry: Vec::new(),
        }
    }

    /// Last boundary position in `(len/2, len)`, if any.
    fn backoff_boundary(&self, data: &[u8]) -> Option<usize> {
        let half = data.len() / 2;
        let mut hasher = RollingHash::new();
        let mut last = None;
        for (i, &b) in data.iter().enumerate() {
            hasher.input(b);
            if i + 1 > half && i + 1 < data.len() && hasher.full() && hasher.sum() & self.mask == self.mask
            {
                last = Some(i + 1);
            }
        }
        last
    }
}

impl<R: Read + Send> ChunkSource for RabinChunkReader<'_, R> {
    fn read_chunk(&mut self, buf: &mut Vec<u8>) -> Result<usize, ParcError> {
        buf.resize(self.chunksize, 0);
        let head = self.carry.len();
        buf[..head].copy_from_slice(&self.carry);
        self.carry.clear();
        let n = head + read_full(self.src, &mut buf[head..])?;

        // Only a full buffer can have a successor to carry into.
        if n == self.chunksize {
            if let Some(boundary) = self.backoff_boundary(&buf[..n]) {
                self.carry.extend_from_slice(&buf[boundary..n]);
                return Ok(boundary);
            }
        }
        Ok(n)
    }
}

// ── Frame source ─────────────────────────────────────────────────────────────

/// Reads complete wire frames for the decompression pipeline.
pub struct FrameReader<'r, R: Read + Send> {
    src:       &'r mut R,
    layout:    FrameLayout,
    max_frame: u64,
}

impl<'r, R: Read + Send> FrameReader<'r, R> {
    pub fn new(src: &'r mut R, layout: FrameLayout, max_frame: u64) -> Self {
        Self { src, layout, max_frame }
    }
}

impl<R: Read + Send> FrameSource for FrameReader<'_, R> {
    fn read_frame(&mut self, buf: &mut Vec<u8>) -> Result<usize, ParcError> {
        let mut prefix = [0u8; 8];
        // A stream that ends without its 8-zero-byte trailer is
        // truncated, never a valid empty suffix.
        if self.src.read_exact(&mut prefix).is_err() {
            return Err(ParcError::UnexpectedEof);
        }
        let cmp_len = u64::from_be_bytes(prefix);
        if cmp_len == 0 {
            return Ok(0); // trailer
        }
        if cmp_len < self.layout.min_cmp_len() {
            return Err(FormatError::ShortFrame.into());
        }
        if cmp_len > self.max_frame {
            return Err(FormatError::OversizeFrame(cmp_len, self.max_frame).into());
        }

        let body_len = cmp_len as usize;
        buf.clear();
        buf.resize(8 + body_len, 0);
        buf[..8].copy_from_slice(&prefix);
        self.src
            .read_exact(&mut buf[8..8 + body_len])
            .map_err(|_| ParcError::UnexpectedEof)?;

        let flags = buf[self.layout.flags_off()];
        if flags & CHSIZE_MASK != 0 {
            let total = 8 + body_len + 8;
            buf.resize(total, 0);
            self.src
                .read_exact(&mut buf[8 + body_len..total])
                .map_err(|_| ParcError::UnexpectedEof)?;
            Ok(total)
        } else {
            Ok(8 + body_len)
        }
    }
}

// ── Compression driver ───────────────────────────────────────────────────────

fn header_flags(opts: &Options, single_chunk: bool) -> u16 {
    let mut flags = opts.checksum.id();
    match opts.dedup {
        DedupMode::Off => {}
        DedupMode::Rabin => flags |= FLAG_DEDUP,
        DedupMode::Fixed => flags |= FLAG_DEDUP | FLAG_DEDUP_FIXED,
    }
    if opts.global_dedup {
        flags |= FLAG_DEDUP_GLOBAL;
    }
    match opts.cipher {
        Some(crate::config::CipherKind::AesCtr) => flags |= CRYPTO_ALG_AES,
        Some(crate::config::CipherKind::XSalsa20) => flags |= CRYPTO_ALG_SALSA20,
        None => {}
    }
    if opts.archive {
        flags |= FLAG_ARCHIVE;
    }
    if single_chunk {
        flags |= FLAG_SINGLE_CHUNK;
    }
    flags
}

fn invalid_input(msg: &str) -> ParcError {
    ParcError::Io(io::Error::new(io::ErrorKind::InvalidInput, msg.to_string()))
}

/// Compress `src` into `dst`.  `source_size` (when known) marks
/// single-chunk streams in the header.  `password` is consumed and
/// zeroed when encryption is requested.
pub fn compress_stream<R: Read + Send, W: Write>(
    src:         &mut R,
    dst:         &mut W,
    opts:        &Options,
    password:    Option<&mut Vec<u8>>,
    source_size: Option<u64>,
) -> Result<Stats, ParcError> {
    if opts.global_dedup && opts.dedup == DedupMode::Off {
        return Err(invalid_input("global dedup requires a dedup mode"));
    }
    if opts.chunksize == 0 {
        return Err(invalid_input("chunk size must be nonzero"));
    }

    let crypto = match opts.cipher {
        None => None,
        Some(cipher) => {
            let password = password.ok_or(FormatError::PasswordRequired)?;
            let ctx = CryptoBinding::for_compress(cipher, opts.checksum, opts.keylen, password)?;
            Some(Arc::new(ctx))
        }
    };

    let single_chunk = source_size.is_some_and(|n| n <= opts.chunksize);
    let header = FileHeader {
        algo:      opts.algo,
        version:   CURRENT_VERSION,
        flags:     header_flags(opts, single_chunk),
        chunksize: opts.chunksize,
        level:     opts.level,
        salt:      Vec::new(),
        nonce:     Vec::new(),
        keylen:    opts.keylen,
    };
    format::write_file_header(dst, &header, crypto.as_deref())?;

    let global = if opts.global_dedup { Some(GlobalState::new()?) } else { None };
    let stats = Stats::new();

    match opts.dedup {
        DedupMode::Rabin => {
            let mut reader = RabinChunkReader::new(src, opts.chunksize, opts.dedup_block);
            scheduler::run_compress(opts, crypto, global, &mut reader, dst, &stats)?;
        }
        _ => {
            let mut reader = FixedChunkReader::new(src, opts.chunksize);
            scheduler::run_compress(opts, crypto, global, &mut reader, dst, &stats)?;
        }
    }

    dst.flush()?;
    log::info!(
        "compressed {} B -> {} B in {} chunk(s), ratio {:.3}",
        stats.bytes_in(),
        stats.bytes_out(),
        stats.chunks(),
        stats.ratio()
    );
    Ok(stats)
}

/// Decompress `src` into `dst`.  Thread count and stats flags come from
/// `cli_opts`; everything else is dictated by the stream header.
///
/// Returns the parsed header (callers dispatch archive extraction on its
/// flags) along with the stream counters.
pub fn decompress_stream<R: Read + Send, W: Write>(
    src:      &mut R,
    dst:      &mut W,
    cli_opts: &Options,
    password: Option<&mut Vec<u8>>,
) -> Result<(FileHeader, Stats), ParcError> {
    let (header, crypto) = format::read_file_header(src, password.map(|p| p.as_mut_slice()))?;
    let crypto = crypto.map(Arc::new);

    let mut opts = cli_opts.clone();
    opts.algo = header.algo;
    opts.level = header.level;
    opts.chunksize = header.chunksize;
    opts.checksum = header.checksum()?;
    opts.cipher = header.cipher()?;
    opts.keylen = header.keylen;
    opts.dedup = if header.is_dedup() {
        if header.is_dedup_fixed() { DedupMode::Fixed } else { DedupMode::Rabin }
    } else {
        DedupMode::Off
    };
    opts.global_dedup = header.flags & FLAG_DEDUP_GLOBAL != 0;
    opts.archive = header.is_archive();

    let layout = FrameLayout::new(opts.checksum, crypto.as_deref());
    let global = if opts.global_dedup { Some(GlobalState::new()?) } else { None };
    let stats = Stats::new();

    let mut reader = FrameReader::new(src, layout, header.max_frame_len());
    scheduler::run_decompress(&opts, crypto, global, &mut reader, dst, &stats)?;

    dst.flush()?;
    log::info!(
        "decompressed {} B -> {} B in {} chunk(s)",
        stats.bytes_in(),
        stats.bytes_out(),
        stats.chunks()
    );
    Ok((header, stats))
}

// ── File front-ends ──────────────────────────────────────────────────────────

fn tmp_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Run `work` against a temp file, renaming over `dest` on success and
/// unlinking on failure.  No partial output survives an error.
pub fn commit_to_file<T>(
    dest: &Path,
    work: impl FnOnce(&mut File) -> Result<T, ParcError>,
) -> Result<T, ParcError> {
    let tmp = tmp_path(dest);
    let result = File::create(&tmp).map_err(ParcError::from).and_then(|mut f| {
        let out = work(&mut f)?;
        f.sync_all()?;
        Ok(out)
    });
    match result {
        Ok(out) => {
            fs::rename(&tmp, dest)?;
            Ok(out)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Compress a file to `<input>`-derived or explicit output path.
pub fn compress_file(
    input:    &Path,
    output:   &Path,
    opts:     &Options,
    password: Option<&mut Vec<u8>>,
) -> Result<Stats, ParcError> {
    let mut src = File::open(input)?;
    let size = src.metadata()?.len();
    commit_to_file(output, |dst| compress_stream(&mut src, dst, opts, password, Some(size)))
}

/// Decompress a file, committing via temp + rename.
pub fn decompress_file(
    input:    &Path,
    output:   &Path,
    cli_opts: &Options,
    password: Option<&mut Vec<u8>>,
) -> Result<(FileHeader, Stats), ParcError> {
    let mut src = File::open(input)?;
    commit_to_file(output, |dst| decompress_stream(&mut src, dst, cli_opts, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fixed_reader_shapes() {
        let data = vec![9u8; 10_000];
        let mut src = Cursor::new(data);
        let mut reader = FixedChunkReader::new(&mut src, 4096);
        let mut buf = Vec::new();
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 4096);
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 4096);
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 1808);
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 0);
    }

    #[test]
    fn rabin_reader_carries_tail_and_loses_nothing() {
        // Varied data so boundaries exist.
        let mut data = vec![0u8; 300_000];
        let mut x = 7u32;
        for b in data.iter_mut() {
            x = x.wrapping_mul(1664525).wrapping_add(1013904223);
            *b = (x >> 24) as u8;
        }

        let mut src = Cursor::new(data.clone());
        let mut reader = RabinChunkReader::new(&mut src, 64 * 1024, 1);
        let mut buf = Vec::new();
        let mut total = Vec::new();
        loop {
            let n = reader.read_chunk(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= 64 * 1024);
            total.extend_from_slice(&buf[..n]);
        }
        assert_eq!(total, data);
    }

    #[test]
    fn rabin_reader_chunking_is_deterministic() {
        let mut data = vec![0u8; 200_000];
        let mut x = 99u32;
        for b in data.iter_mut() {
            x = x.wrapping_mul(1664525).wrapping_add(1013904223);
            *b = (x >> 16) as u8;
        }
        let sizes = |data: &[u8]| {
            let mut src = Cursor::new(data.to_vec());
            let mut reader = RabinChunkReader::new(&mut src, 32 * 1024, 0);
            let mut buf = Vec::new();
            let mut sizes = Vec::new();
            loop {
                let n = reader.read_chunk(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                sizes.push(n);
            }
            sizes
        };
        assert_eq!(sizes(&data), sizes(&data));
    }
}
