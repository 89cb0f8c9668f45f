//! Block-level deduplication engine.
//!
//! A chunk is split into blocks — content-defined (rolling-hash
//! boundaries) or fixed-size — and every block is identified by the
//! BLAKE3 of its bytes.  The engine emits an index of one u32 entry per
//! logical block plus a record stream holding each distinct block once:
//!
//! ```text
//! entry            bit 31 = delta record, bits 0..30 = stored ordinal
//! plain record     len u32 BE | bytes
//! delta record     ref_ordinal u32 BE | len u32 BE | xor-vs-ref bytes
//! ```
//!
//! An ordinal equal to the current stored-block count introduces the next
//! record; anything lower is a back-reference.  Delta records exist only
//! when block-delta is enabled and always reference an earlier ordinal.
//!
//! The framing layer transposes the index column-major and compresses
//! index and records separately (see `transform`); this module only deals
//! in entries and records.
//!
//! # Global mode
//! With a shared [`GlobalState`] the ordinal space spans all chunks and
//! the block store spills to a scratch file under the cache directory.
//! Callers MUST serialize global calls in chunk-id order; the scheduler's
//! token ring does this.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Byte size of the dedup header at the front of a deduplicated payload.
pub const RABIN_HDR_SIZE: usize = 24;

/// Indexes shorter than this are stored verbatim rather than compressed.
pub const INDEX_COMPRESS_MIN: usize = 90;

/// Entry bit marking a delta record.
pub const ENTRY_DELTA_BIT: u32 = 0x8000_0000;
const ENTRY_ORDINAL_MASK: u32 = 0x7FFF_FFFF;

/// Rolling-hash window for content-defined boundaries.
const ROLL_WINDOW: usize = 48;

/// Environment override for the global-dedup scratch directory.
pub const CACHE_DIR_ENV: &str = "PARC_CACHE_DIR";

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("corrupt dedup stream: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

fn corrupt(msg: impl Into<String>) -> DedupError {
    DedupError::Corrupt(msg.into())
}

// ── Dedup header ─────────────────────────────────────────────────────────────

/// Fixed header leading every deduplicated chunk payload.
///
/// `comp_index_len` and `comp_data_len` are patched in by the framing
/// layer once both parts have been through the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupHeader {
    pub n_entries:      u32,
    pub raw_len:        u64,
    pub comp_index_len: u32,
    pub comp_data_len:  u32,
    /// Record-stream length before preprocessing/compression.
    pub data_raw_len:   u32,
}

impl DedupHeader {
    pub fn write_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.n_entries.to_be_bytes());
        out[4..12].copy_from_slice(&self.raw_len.to_be_bytes());
        out[12..16].copy_from_slice(&self.comp_index_len.to_be_bytes());
        out[16..20].copy_from_slice(&self.comp_data_len.to_be_bytes());
        out[20..24].copy_from_slice(&self.data_raw_len.to_be_bytes());
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DedupError> {
        if buf.len() < RABIN_HDR_SIZE {
            return Err(corrupt("short dedup header"));
        }
        Ok(Self {
            n_entries:      u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            raw_len:        u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            comp_index_len: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            comp_data_len:  u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            data_raw_len:   u32::from_be_bytes(buf[20..24].try_into().unwrap()),
        })
    }
}

// ── Index transpose ──────────────────────────────────────────────────────────

/// Serialize index entries big-endian, transposed column-major: all byte-0
/// planes, then byte-1, byte-2, byte-3.  Similar adjacent entries leave
/// long runs in each plane, which the codec rewards.
pub fn pack_index(entries: &[u32]) -> Vec<u8> {
    let n = entries.len();
    let mut out = vec![0u8; n * 4];
    for (i, e) in entries.iter().enumerate() {
        let be = e.to_be_bytes();
        for plane in 0..4 {
            out[plane * n + i] = be[plane];
        }
    }
    out
}

/// Reverse [`pack_index`].
pub fn unpack_index(bytes: &[u8]) -> Result<Vec<u32>, DedupError> {
    if bytes.len() % 4 != 0 {
        return Err(corrupt("index length not a multiple of 4"));
    }
    let n = bytes.len() / 4;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(u32::from_be_bytes([
            bytes[i],
            bytes[n + i],
            bytes[2 * n + i],
            bytes[3 * n + i],
        ]));
    }
    Ok(out)
}

// ── Block splitting ──────────────────────────────────────────────────────────

/// Byte→u32 mix table for the rolling hash, derived once from a fixed
/// seed so both ends of the wire agree.
fn mix_table() -> [u32; 256] {
    let mut t = [0u32; 256];
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    for slot in t.iter_mut() {
        // splitmix64 step
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        *slot = (z ^ (z >> 31)) as u32;
    }
    t
}

/// Rolling hash over a fixed window, used for content-defined splits.
pub struct RollingHash {
    table: [u32; 256],
    buf:   [u8; ROLL_WINDOW],
    index: usize,
    fill:  usize,
    sum:   u32,
}

impl RollingHash {
    pub fn new() -> Self {
        Self {
            table: mix_table(),
            buf:   [0; ROLL_WINDOW],
            index: 0,
            fill:  0,
            sum:   0,
        }
    }

    pub fn reset(&mut self) {
        self.buf = [0; ROLL_WINDOW];
        self.index = 0;
        self.fill = 0;
        self.sum = 0;
    }

    #[inline]
    pub fn input(&mut self, byte: u8) {
        let incoming = self.table[byte as usize];
        let outgoing = self.table[self.buf[self.index] as usize];
        self.sum = self.sum.rotate_left(1) ^ outgoing.rotate_left(ROLL_WINDOW as u32) ^ incoming;
        self.buf[self.index] = byte;
        self.index = (self.index + 1) % ROLL_WINDOW;
        if self.fill < ROLL_WINDOW {
            self.fill += 1;
        }
    }

    #[inline]
    pub fn full(&self) -> bool {
        self.fill == ROLL_WINDOW
    }

    #[inline]
    pub fn sum(&self) -> u32 {
        self.sum
    }
}

impl Default for RollingHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean block size for a `-B` level (0..=5).
#[inline]
pub fn mean_block_size(level: u8) -> usize {
    4096usize << level.min(5)
}

/// Split `data` into block ranges.  `fixed` selects fixed-size blocks;
/// otherwise boundaries fall where the rolling hash matches the mean-size
/// mask, clamped to [mean/4, mean*4].
pub fn split_blocks(data: &[u8], fixed: bool, block_level: u8) -> Vec<(usize, usize)> {
    let mean = mean_block_size(block_level);
    let mut out = Vec::with_capacity(data.len() / mean + 1);

    if fixed {
        let mut off = 0;
        while off < data.len() {
            let end = (off + mean).min(data.len());
            out.push((off, end));
            off = end;
        }
        return out;
    }

    let mask = (mean - 1) as u32;
    let min = mean / 4;
    let max = mean * 4;
    let mut hasher = RollingHash::new();
    let mut start = 0usize;
    for (i, &b) in data.iter().enumerate() {
        hasher.input(b);
        let len = i + 1 - start;
        if len >= max || (len >= min && hasher.full() && hasher.sum() & mask == mask) {
            out.push((start, i + 1));
            start = i + 1;
            hasher.reset();
        }
    }
    if start < data.len() {
        out.push((start, data.len()));
    }
    out
}

// ── Records and similarity ───────────────────────────────────────────────────

/// Cheap similarity fingerprint: BLAKE3 over a sparse byte sample,
/// truncated to 64 bits.  Blocks sharing the fingerprint are delta
/// candidates.
fn similarity_key(block: &[u8]) -> u64 {
    let step = (block.len() / 64).max(1);
    let mut sample = [0u8; 64];
    let mut n = 0;
    let mut i = 0;
    while i < block.len() && n < 64 {
        sample[n] = block[i];
        n += 1;
        i += step;
    }
    let hash = blake3::hash(&sample[..n]);
    u64::from_be_bytes(hash.as_bytes()[..8].try_into().unwrap())
}

fn xor_delta(block: &[u8], reference: &[u8]) -> Vec<u8> {
    block
        .iter()
        .enumerate()
        .map(|(k, &b)| if k < reference.len() { b ^ reference[k] } else { b })
        .collect()
}

/// Worthiness estimate for a delta record: header plus only the bytes
/// that actually differ.  The xor body is stored full-length but the
/// zero runs vanish under the codec, which is what the estimate models.
fn delta_cost(xor: &[u8]) -> usize {
    8 + xor.iter().filter(|&&b| b != 0).count()
}

fn read_u32_at(records: &[u8], pos: &mut usize) -> Result<u32, DedupError> {
    let end = *pos + 4;
    if end > records.len() {
        return Err(corrupt("truncated record stream"));
    }
    let v = u32::from_be_bytes(records[*pos..end].try_into().unwrap());
    *pos = end;
    Ok(v)
}

/// Read the wire form of one record: optional delta reference, then the
/// length-prefixed body (verbatim bytes for plain records, xor bytes for
/// delta records).
fn read_record<'a>(
    records:  &'a [u8],
    pos:      &mut usize,
    is_delta: bool,
) -> Result<(Option<usize>, &'a [u8]), DedupError> {
    let ref_ord = if is_delta { Some(read_u32_at(records, pos)? as usize) } else { None };
    let len = read_u32_at(records, pos)? as usize;
    let end = *pos + len;
    if end > records.len() {
        return Err(corrupt("record overruns stream"));
    }
    let body = &records[*pos..end];
    *pos = end;
    Ok((ref_ord, body))
}

// ── Engine interface ─────────────────────────────────────────────────────────

/// One chunk's worth of dedup output: the entry index plus the record
/// stream of distinct blocks.
#[derive(Debug)]
pub struct DedupOutput {
    pub entries: Vec<u32>,
    pub records: Vec<u8>,
}

/// The interface the transform stack talks to.
pub trait DedupeEngine: Send {
    /// Deduplicate one chunk.  `None` means the chunk did not shrink and
    /// should be framed without `CHUNK_FLAG_DEDUP`.
    fn deduplicate(&mut self, chunk: &[u8]) -> Result<Option<DedupOutput>, DedupError>;

    /// Rebuild the raw chunk from entries + records.  `raw_len` is the
    /// expected output size from the dedup header.
    fn reconstruct(
        &mut self,
        entries: &[u32],
        records: &[u8],
        raw_len: usize,
    ) -> Result<Vec<u8>, DedupError>;
}

// ── Local engine ─────────────────────────────────────────────────────────────

/// Whether a chunk's dedup output is acceptable: worthwhile by the
/// effective estimate AND guaranteed to frame within the chunk bound.
///
/// The estimate discounts delta-record zeros (the codec removes them);
/// the hard bound keeps the framed payload inside `max_payload` plus
/// fixed overhead regardless of how the codec does, so a decoder's
/// `cmp_len` check can never reject our own output.
fn acceptable(
    effective:   usize,
    entries:     usize,
    records_len: usize,
    chunk_len:   usize,
    max_payload: usize,
) -> bool {
    effective < chunk_len
        && records_len <= u32::MAX as usize
        && RABIN_HDR_SIZE + entries * 4 + records_len <= max_payload
}

/// Per-worker engine whose ordinal space resets every chunk.
pub struct BlockDedupe {
    fixed:       bool,
    block_level: u8,
    /// 0 = exact only, 1 = same-length delta, 2 = any-length delta.
    delta_mode:  u8,
    /// Chunk-size bound the framed output must stay within.
    max_payload: usize,
}

impl BlockDedupe {
    pub fn new(fixed: bool, block_level: u8, delta_mode: u8, max_payload: usize) -> Self {
        Self { fixed, block_level, delta_mode, max_payload }
    }
}

impl DedupeEngine for BlockDedupe {
    fn deduplicate(&mut self, chunk: &[u8]) -> Result<Option<DedupOutput>, DedupError> {
        let ranges = split_blocks(chunk, self.fixed, self.block_level);
        let mut entries = Vec::with_capacity(ranges.len());
        let mut records = Vec::new();
        let mut stored: Vec<(usize, usize)> = Vec::new();
        let mut exact: HashMap<[u8; 32], u32> = HashMap::new();
        let mut similar: HashMap<u64, u32> = HashMap::new();
        let mut effective = RABIN_HDR_SIZE;

        for (start, end) in ranges {
            let block = &chunk[start..end];
            let hash: [u8; 32] = blake3::hash(block).into();
            effective += 4;

            if let Some(&ord) = exact.get(&hash) {
                entries.push(ord);
                continue;
            }

            let ordinal = stored.len() as u32;
            let mut wrote_delta = false;
            if self.delta_mode > 0 {
                let key = similarity_key(block);
                match similar.get(&key).copied() {
                    Some(ref_ord) => {
                        let (rs, re) = stored[ref_ord as usize];
                        let reference = &chunk[rs..re];
                        if self.delta_mode >= 2 || reference.len() == block.len() {
                            let xor = xor_delta(block, reference);
                            entries.push(ordinal | ENTRY_DELTA_BIT);
                            records.extend_from_slice(&ref_ord.to_be_bytes());
                            records.extend_from_slice(&(block.len() as u32).to_be_bytes());
                            effective += delta_cost(&xor);
                            records.extend_from_slice(&xor);
                            wrote_delta = true;
                        }
                    }
                    None => {
                        similar.insert(key, ordinal);
                    }
                }
            }
            if !wrote_delta {
                entries.push(ordinal);
                records.extend_from_slice(&(block.len() as u32).to_be_bytes());
                records.extend_from_slice(block);
                effective += 4 + block.len();
            }
            exact.insert(hash, ordinal);
            stored.push((start, end));
        }

        if !acceptable(effective, entries.len(), records.len(), chunk.len(), self.max_payload) {
            return Ok(None);
        }
        Ok(Some(DedupOutput { entries, records }))
    }

    fn reconstruct(
        &mut self,
        entries: &[u32],
        records: &[u8],
        raw_len: usize,
    ) -> Result<Vec<u8>, DedupError> {
        let mut stored: Vec<Vec<u8>> = Vec::new();
        let mut out = Vec::with_capacity(raw_len);
        let mut pos = 0usize;

        for &entry in entries {
            let ordinal = (entry & ENTRY_ORDINAL_MASK) as usize;
            let is_delta = entry & ENTRY_DELTA_BIT != 0;

            if ordinal < stored.len() {
                if is_delta {
                    return Err(corrupt("delta bit on back-reference"));
                }
                out.extend_from_slice(&stored[ordinal]);
                continue;
            }
            if ordinal != stored.len() {
                return Err(corrupt(format!(
                    "ordinal {ordinal} skips ahead of {} stored blocks",
                    stored.len()
                )));
            }

            let (ref_ord, body) = read_record(records, &mut pos, is_delta)?;
            let block = match ref_ord {
                None => body.to_vec(),
                Some(r) => {
                    let reference = stored
                        .get(r)
                        .ok_or_else(|| corrupt(format!("delta reference {r} out of range")))?;
                    xor_delta(body, reference)
                }
            };
            out.extend_from_slice(&block);
            stored.push(block);
        }

        if pos != records.len() {
            return Err(corrupt("trailing bytes after last record"));
        }
        if out.len() != raw_len {
            return Err(corrupt(format!(
                "reconstructed {} bytes, header says {raw_len}",
                out.len()
            )));
        }
        Ok(out)
    }
}

// ── Global engine ────────────────────────────────────────────────────────────

/// Append-only block store spilling to a scratch file.
struct BlockStore {
    file:    File,
    path:    PathBuf,
    offsets: Vec<(u64, u32)>,
    tail:    u64,
}

impl BlockStore {
    fn create() -> Result<Self, DedupError> {
        static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let dir = std::env::var_os(CACHE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let path = dir.join(format!("parc-dedup-{}-{}.scratch", std::process::id(), seq));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { file, path, offsets: Vec::new(), tail: 0 })
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn append(&mut self, block: &[u8]) -> Result<u32, DedupError> {
        let ordinal = self.offsets.len() as u32;
        self.file.seek(SeekFrom::Start(self.tail))?;
        self.file.write_all(block)?;
        self.offsets.push((self.tail, block.len() as u32));
        self.tail += block.len() as u64;
        Ok(ordinal)
    }

    fn read(&mut self, ordinal: usize) -> Result<Vec<u8>, DedupError> {
        let (off, len) = *self
            .offsets
            .get(ordinal)
            .ok_or_else(|| corrupt(format!("global ordinal {ordinal} unknown")))?;
        let mut buf = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(off))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Shared state behind global mode.  The scheduler's ring guarantees
/// chunk-ordered access; the mutex only satisfies the type system.
pub struct GlobalState {
    exact:   HashMap<[u8; 32], u32>,
    similar: HashMap<u64, u32>,
    store:   BlockStore,
}

impl GlobalState {
    pub fn new() -> Result<Arc<Mutex<Self>>, DedupError> {
        Ok(Arc::new(Mutex::new(Self {
            exact:   HashMap::new(),
            similar: HashMap::new(),
            store:   BlockStore::create()?,
        })))
    }
}

/// Engine whose index and block store span the whole stream.
pub struct GlobalDedupe {
    fixed:       bool,
    block_level: u8,
    delta_mode:  u8,
    max_payload: usize,
    state:       Arc<Mutex<GlobalState>>,
}

impl GlobalDedupe {
    pub fn new(
        fixed:       bool,
        block_level: u8,
        delta_mode:  u8,
        max_payload: usize,
        state:       Arc<Mutex<GlobalState>>,
    ) -> Self {
        Self { fixed, block_level, delta_mode, max_payload, state }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, GlobalState>, DedupError> {
        self.state.lock().map_err(|_| corrupt("global dedup state poisoned"))
    }
}

impl DedupeEngine for GlobalDedupe {
    fn deduplicate(&mut self, chunk: &[u8]) -> Result<Option<DedupOutput>, DedupError> {
        let ranges = split_blocks(chunk, self.fixed, self.block_level);
        let mut state = self.lock()?;

        let mut entries = Vec::with_capacity(ranges.len());
        let mut records = Vec::new();
        // Blocks introduced by this chunk; committed to the store only if
        // the chunk ends up worthwhile.
        let mut fresh: Vec<(usize, usize, [u8; 32])> = Vec::new();
        let mut fresh_exact: HashMap<[u8; 32], u32> = HashMap::new();
        let base = state.store.len() as u32;
        let mut effective = RABIN_HDR_SIZE;

        for (start, end) in ranges {
            let block = &chunk[start..end];
            let hash: [u8; 32] = blake3::hash(block).into();
            effective += 4;

            if let Some(&ord) = state.exact.get(&hash) {
                entries.push(ord);
                continue;
            }
            if let Some(&ord) = fresh_exact.get(&hash) {
                entries.push(ord);
                continue;
            }

            let ordinal = base + fresh.len() as u32;
            let mut wrote_delta = false;
            if self.delta_mode > 0 {
                let key = similarity_key(block);
                match state.similar.get(&key).copied() {
                    Some(ref_ord) => {
                        let reference = if ref_ord < base {
                            state.store.read(ref_ord as usize)?
                        } else {
                            let (rs, re, _) = fresh[(ref_ord - base) as usize];
                            chunk[rs..re].to_vec()
                        };
                        if self.delta_mode >= 2 || reference.len() == block.len() {
                            let xor = xor_delta(block, &reference);
                            entries.push(ordinal | ENTRY_DELTA_BIT);
                            records.extend_from_slice(&ref_ord.to_be_bytes());
                            records.extend_from_slice(&(block.len() as u32).to_be_bytes());
                            effective += delta_cost(&xor);
                            records.extend_from_slice(&xor);
                            wrote_delta = true;
                        }
                    }
                    None => {
                        state.similar.insert(key, ordinal);
                    }
                }
            }
            if !wrote_delta {
                entries.push(ordinal);
                records.extend_from_slice(&(block.len() as u32).to_be_bytes());
                records.extend_from_slice(block);
                effective += 4 + block.len();
            }
            fresh_exact.insert(hash, ordinal);
            fresh.push((start, end, hash));
        }

        if !acceptable(effective, entries.len(), records.len(), chunk.len(), self.max_payload) {
            // Roll back similarity keys pointing at ordinals that will
            // never exist.  The decoder skips non-dedup chunks entirely,
            // so nothing may be committed for them.
            state.similar.retain(|_, &mut ord| ord < base);
            return Ok(None);
        }

        // Commit in order; later chunks may reference these ordinals.
        for (start, end, hash) in fresh {
            let ord = state.store.append(&chunk[start..end])?;
            state.exact.insert(hash, ord);
        }
        Ok(Some(DedupOutput { entries, records }))
    }

    fn reconstruct(
        &mut self,
        entries: &[u32],
        records: &[u8],
        raw_len: usize,
    ) -> Result<Vec<u8>, DedupError> {
        let mut state = self.lock()?;
        let base = state.store.len();
        let mut fresh: Vec<Vec<u8>> = Vec::new();
        let mut out = Vec::with_capacity(raw_len);
        let mut pos = 0usize;

        for &entry in entries {
            let ordinal = (entry & ENTRY_ORDINAL_MASK) as usize;
            let is_delta = entry & ENTRY_DELTA_BIT != 0;

            if ordinal < base {
                if is_delta {
                    return Err(corrupt("delta bit on back-reference"));
                }
                let block = state.store.read(ordinal)?;
                out.extend_from_slice(&block);
                continue;
            }
            let local = ordinal - base;
            if local < fresh.len() {
                if is_delta {
                    return Err(corrupt("delta bit on back-reference"));
                }
                out.extend_from_slice(&fresh[local]);
                continue;
            }
            if local != fresh.len() {
                return Err(corrupt(format!("ordinal {ordinal} skips ahead of the store")));
            }

            let (ref_ord, body) = read_record(records, &mut pos, is_delta)?;
            let block = match ref_ord {
                None => body.to_vec(),
                Some(r) if r < base => {
                    let reference = state.store.read(r)?;
                    xor_delta(body, &reference)
                }
                Some(r) => {
                    let reference = fresh
                        .get(r - base)
                        .ok_or_else(|| corrupt(format!("delta reference {r} out of range")))?;
                    xor_delta(body, reference)
                }
            };
            out.extend_from_slice(&block);
            fresh.push(block);
        }

        if pos != records.len() {
            return Err(corrupt("trailing bytes after last record"));
        }
        if out.len() != raw_len {
            return Err(corrupt(format!(
                "reconstructed {} bytes, header says {raw_len}",
                out.len()
            )));
        }

        // Mutation order across chunks is the ring's contract.
        for block in fresh {
            state.store.append(&block)?;
        }
        Ok(out)
    }
}
