//! Archive mode: a directory tree as a member-record byte stream.
//!
//! The walker serializes members into the stream the compressor consumes;
//! extraction parses the same records out of the decompressed bytes.  The
//! record format is private to this crate:
//!
//! ```text
//! member   kind u8 | path_len u16 BE | path bytes | mode u32 BE
//!          | mtime i64 BE | size u64 BE | data (size bytes)
//! kinds    1 = file (data = contents), 2 = directory (size = 0),
//!          3 = symlink (data = target), 0xFF = end of archive
//! ```
//!
//! Members are sorted by (extension, size) so alike files sit together
//! for the codec — fixed-size segments sorted independently, then merged
//! with a k-way heap.  `-n` disables the sort and keeps walk order.
//!
//! Extraction refuses absolute paths and `..` components, restores
//! mtimes, applies recorded permissions (forced over read-only targets
//! with `-m`), and skips members older than an existing destination when
//! `-K` is given.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use walkdir::WalkDir;

use crate::error::ParcError;

const KIND_FILE:    u8 = 1;
const KIND_DIR:     u8 = 2;
const KIND_SYMLINK: u8 = 3;
const KIND_END:     u8 = 0xFF;

/// Members per independently-sorted segment.
const SORT_SEGMENT: usize = 4096;

/// Fixed header bytes after `kind` and `path_len`: mode + mtime + size.
const MEMBER_FIXED_TAIL: usize = 4 + 8 + 8;

fn bad_archive(msg: &str) -> ParcError {
    ParcError::CorruptChunk(format!("archive stream: {msg}"))
}

// ── Walker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Member {
    path:  PathBuf,
    rel:   Vec<u8>,
    kind:  u8,
    mode:  u32,
    mtime: i64,
    size:  u64,
}

impl Member {
    fn sort_key(&self) -> (Vec<u8>, u64, Vec<u8>) {
        let ext = Path::new(std::ffi::OsStr::from_bytes(&self.rel))
            .extension()
            .map(|e| e.as_bytes().to_vec())
            .unwrap_or_default();
        (ext, self.size, self.rel.clone())
    }
}

fn collect_members(roots: &[PathBuf]) -> Result<Vec<Member>, ParcError> {
    let mut members = Vec::new();
    for root in roots {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                ParcError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
            })?;
            let meta = entry
                .path()
                .symlink_metadata()
                .map_err(ParcError::Io)?;
            let ftype = meta.file_type();
            let (kind, size) = if ftype.is_dir() {
                (KIND_DIR, 0)
            } else if ftype.is_symlink() {
                let target = fs::read_link(entry.path())?;
                (KIND_SYMLINK, target.as_os_str().as_bytes().len() as u64)
            } else if ftype.is_file() {
                (KIND_FILE, meta.len())
            } else {
                log::warn!("skipping special file {}", entry.path().display());
                continue;
            };
            members.push(Member {
                path:  entry.path().to_path_buf(),
                rel:   entry.path().as_os_str().as_bytes().to_vec(),
                kind,
                mode:  meta.mode(),
                mtime: meta.mtime(),
                size,
            });
        }
    }
    Ok(members)
}

/// Sort members in fixed segments, then k-way merge the segments.
fn sort_members(members: Vec<Member>) -> Vec<Member> {
    let n = members.len();
    let mut segments: Vec<Vec<Member>> = Vec::new();
    let mut iter = members.into_iter();
    loop {
        let seg: Vec<Member> = iter.by_ref().take(SORT_SEGMENT).collect();
        if seg.is_empty() {
            break;
        }
        let mut seg = seg;
        seg.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        segments.push(seg);
    }

    // Directories first regardless of key, so extraction can create them
    // before their contents arrive.
    let mut heads: Vec<std::vec::IntoIter<Member>> =
        segments.into_iter().map(|s| s.into_iter()).collect();
    let mut heap = BinaryHeap::new();
    for (i, it) in heads.iter_mut().enumerate() {
        if let Some(m) = it.next() {
            heap.push(Reverse(((m.kind != KIND_DIR, m.sort_key()), i, MemberBox(m))));
        }
    }
    let mut out = Vec::with_capacity(n);
    while let Some(Reverse((_, i, MemberBox(m)))) = heap.pop() {
        out.push(m);
        if let Some(next) = heads[i].next() {
            heap.push(Reverse(((next.kind != KIND_DIR, next.sort_key()), i, MemberBox(next))));
        }
    }
    out
}

/// Heap element wrapper: ordering comes solely from the key tuple.
struct MemberBox(Member);

impl PartialEq for MemberBox {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}
impl Eq for MemberBox {}
impl PartialOrd for MemberBox {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MemberBox {
    fn cmp(&self, _: &Self) -> std::cmp::Ordering {
        std::cmp::Ordering::Equal
    }
}

// ── Stream side ──────────────────────────────────────────────────────────────

enum StreamState {
    /// Emitting the bytes of `pending`; `body` follows when present.
    Emit { pending: Vec<u8>, pos: usize, body: Option<File>, remaining: u64 },
    NextMember,
    Finished,
}

/// `Read` adapter feeding the member-record stream into the compressor.
pub struct ArchiveStream {
    members: std::vec::IntoIter<Member>,
    state:   StreamState,
}

impl ArchiveStream {
    /// Walk `roots` and build the stream.  `sort` groups alike files.
    pub fn new(roots: &[PathBuf], sort: bool) -> Result<Self, ParcError> {
        let mut members = collect_members(roots)?;
        if sort {
            members = sort_members(members);
        }
        log::debug!("archiving {} member(s)", members.len());
        Ok(Self {
            members: members.into_iter(),
            state:   StreamState::NextMember,
        })
    }

    fn member_header(m: &Member) -> Vec<u8> {
        let mut h = Vec::with_capacity(3 + m.rel.len() + MEMBER_FIXED_TAIL);
        h.push(m.kind);
        h.extend_from_slice(&(m.rel.len() as u16).to_be_bytes());
        h.extend_from_slice(&m.rel);
        h.extend_from_slice(&m.mode.to_be_bytes());
        h.extend_from_slice(&m.mtime.to_be_bytes());
        h.extend_from_slice(&m.size.to_be_bytes());
        h
    }

    fn advance(&mut self) -> io::Result<()> {
        self.state = match self.members.next() {
            None => StreamState::Emit {
                pending:   vec![KIND_END],
                pos:       0,
                body:      None,
                remaining: 0,
            },
            Some(m) => {
                let mut pending = Self::member_header(&m);
                let (body, remaining) = match m.kind {
                    KIND_FILE => (Some(File::open(&m.path)?), m.size),
                    KIND_SYMLINK => {
                        let target = fs::read_link(&m.path)?;
                        pending.extend_from_slice(target.as_os_str().as_bytes());
                        (None, 0)
                    }
                    _ => (None, 0),
                };
                StreamState::Emit { pending, pos: 0, body, remaining }
            }
        };
        Ok(())
    }
}

impl Read for ArchiveStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            match &mut self.state {
                StreamState::Finished => return Ok(0),
                StreamState::NextMember => self.advance()?,
                StreamState::Emit { pending, pos, body, remaining } => {
                    if *pos < pending.len() {
                        let n = (pending.len() - *pos).min(out.len());
                        out[..n].copy_from_slice(&pending[*pos..*pos + n]);
                        *pos += n;
                        return Ok(n);
                    }
                    if *remaining > 0 {
                        let file = body.as_mut().ok_or_else(|| {
                            io::Error::new(io::ErrorKind::Other, "member body lost")
                        })?;
                        let want = (*remaining).min(out.len() as u64) as usize;
                        let n = file.read(&mut out[..want])?;
                        if n == 0 {
                            // File shrank underneath us; the recorded
                            // size is the contract, so fail loudly.
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "file truncated while archiving",
                            ));
                        }
                        *remaining -= n as u64;
                        return Ok(n);
                    }
                    let was_end = pending.first() == Some(&KIND_END);
                    self.state = if was_end {
                        StreamState::Finished
                    } else {
                        StreamState::NextMember
                    };
                }
            }
        }
    }
}

// ── Extract side ─────────────────────────────────────────────────────────────

enum BodySink {
    File(File),
    /// Member skipped (`-K` kept a newer destination).
    Discard,
    /// Symlink target accumulating until the body completes.
    Symlink(Vec<u8>),
}

enum ExtractState {
    Header,
    Body { path: PathBuf, sink: BodySink, remaining: u64, mode: u32, mtime: i64 },
    Done,
}

/// `Write` adapter draining the decompressed member stream to disk.
pub struct ArchiveExtractor {
    dest:        PathBuf,
    state:       ExtractState,
    /// Partial member header carried between writes.
    hbuf:        Vec<u8>,
    /// Restore recorded permissions even over pre-existing targets.
    force_perms: bool,
    /// Skip members older than an existing destination file.
    keep_newer:  bool,
    extracted:   u64,
}

impl ArchiveExtractor {
    pub fn new(dest: &Path, force_perms: bool, keep_newer: bool) -> Self {
        Self {
            dest: dest.to_path_buf(),
            state: ExtractState::Header,
            hbuf: Vec::new(),
            force_perms,
            keep_newer,
            extracted: 0,
        }
    }

    /// Must be called after the stream is fully written; errors when the
    /// end record never arrived.  Returns the number of members written
    /// out.
    pub fn finish(self) -> Result<u64, ParcError> {
        match self.state {
            ExtractState::Done => Ok(self.extracted),
            _ => Err(bad_archive("ended before the end-of-archive record")),
        }
    }

    fn safe_join(&self, rel: &[u8]) -> Result<PathBuf, ParcError> {
        let rel = PathBuf::from(std::ffi::OsString::from_vec(rel.to_vec()));
        // Leading slashes are dropped (tar-style); anything that could
        // climb out of the destination is refused outright.
        let mut clean = PathBuf::new();
        for comp in rel.components() {
            match comp {
                Component::Normal(p) => clean.push(p),
                Component::CurDir | Component::RootDir => {}
                _ => return Err(bad_archive("member path escapes destination")),
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(bad_archive("empty member path"));
        }
        Ok(self.dest.join(clean))
    }

    fn apply_metadata(&self, path: &Path, mode: u32, mtime: i64) -> io::Result<()> {
        if self.force_perms {
            fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        let t = FileTime::from_unix_time(mtime, 0);
        filetime::set_file_times(path, t, t)?;
        Ok(())
    }

    fn skip_existing_newer(&self, path: &Path, mtime: i64) -> bool {
        if !self.keep_newer {
            return false;
        }
        match path.symlink_metadata() {
            Ok(meta) => meta.mtime() >= mtime,
            Err(_) => false,
        }
    }

    /// Header bytes required before the current member can be decoded.
    fn header_need(&self) -> usize {
        match self.hbuf.first() {
            None => 1,
            Some(&KIND_END) => 1,
            Some(_) if self.hbuf.len() < 3 => 3,
            Some(_) => {
                let path_len = u16::from_be_bytes([self.hbuf[1], self.hbuf[2]]) as usize;
                3 + path_len + MEMBER_FIXED_TAIL
            }
        }
    }

    /// Decode the complete member header in `hbuf` and move to the next
    /// state.  Directories complete immediately.
    fn begin_member(&mut self) -> Result<(), ParcError> {
        let buf = std::mem::take(&mut self.hbuf);
        if buf[0] == KIND_END {
            self.state = ExtractState::Done;
            return Ok(());
        }
        let kind = buf[0];
        let path_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let rel = &buf[3..3 + path_len];
        let mut off = 3 + path_len;
        let mode = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let mtime = i64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let size = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());

        let path = self.safe_join(rel)?;
        match kind {
            KIND_DIR => {
                fs::create_dir_all(&path)?;
                self.apply_metadata(&path, mode, mtime)?;
                self.extracted += 1;
                self.state = ExtractState::Header;
            }
            KIND_FILE => {
                let sink = if self.skip_existing_newer(&path, mtime) {
                    log::debug!("keeping newer {}", path.display());
                    BodySink::Discard
                } else {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    BodySink::File(File::create(&path)?)
                };
                self.state = ExtractState::Body { path, sink, remaining: size, mode, mtime };
                if size == 0 {
                    self.finish_member()?;
                }
            }
            KIND_SYMLINK => {
                let sink = BodySink::Symlink(Vec::with_capacity(size as usize));
                self.state = ExtractState::Body { path, sink, remaining: size, mode, mtime };
                if size == 0 {
                    return Err(bad_archive("symlink member with empty target"));
                }
            }
            other => return Err(bad_archive(&format!("unknown member kind {other}"))),
        }
        Ok(())
    }

    /// Close out the member whose body just completed.
    fn finish_member(&mut self) -> Result<(), ParcError> {
        let state = std::mem::replace(&mut self.state, ExtractState::Header);
        let (path, sink, mode, mtime) = match state {
            ExtractState::Body { path, sink, mode, mtime, .. } => (path, sink, mode, mtime),
            other => {
                self.state = other;
                return Ok(());
            }
        };
        match sink {
            BodySink::Discard => {}
            BodySink::File(file) => {
                drop(file);
                self.apply_metadata(&path, mode, mtime)?;
                self.extracted += 1;
            }
            BodySink::Symlink(target) => {
                let target = PathBuf::from(std::ffi::OsString::from_vec(target));
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let _ = fs::remove_file(&path);
                std::os::unix::fs::symlink(&target, &path)?;
                let t = FileTime::from_unix_time(mtime, 0);
                let _ = filetime::set_symlink_file_times(&path, t, t);
                self.extracted += 1;
            }
        }
        Ok(())
    }
}

impl Write for ArchiveExtractor {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let as_io = |e: ParcError| io::Error::new(io::ErrorKind::InvalidData, e.to_string());
        let total = data.len();
        let mut data = data;
        while !data.is_empty() {
            match &mut self.state {
                ExtractState::Done => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "data after end-of-archive record",
                    ));
                }
                ExtractState::Header => {
                    let need = self.header_need();
                    let take = (need - self.hbuf.len()).min(data.len());
                    self.hbuf.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    // path_len may have just arrived, growing the need.
                    if self.hbuf.len() == self.header_need() {
                        self.begin_member().map_err(as_io)?;
                    }
                }
                ExtractState::Body { sink, remaining, .. } => {
                    let n = (*remaining).min(data.len() as u64) as usize;
                    match sink {
                        BodySink::File(f) => f.write_all(&data[..n])?,
                        BodySink::Symlink(buf) => buf.extend_from_slice(&data[..n]),
                        BodySink::Discard => {}
                    }
                    *remaining -= n as u64;
                    data = &data[n..];
                    if *remaining == 0 {
                        self.finish_member().map_err(as_io)?;
                    }
                }
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use tempfile::TempDir;

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("a.txt"), b"alpha file").unwrap();
        fs::write(root.join("sub/b.log"), b"log line\n".repeat(100)).unwrap();
        fs::write(root.join("sub/deeper/c.txt"), b"").unwrap();
        std::os::unix::fs::symlink("a.txt", root.join("link")).unwrap();
    }

    #[test]
    fn stream_extract_roundtrip() {
        let src_dir = TempDir::new().unwrap();
        build_tree(src_dir.path());

        let mut stream =
            ArchiveStream::new(&[src_dir.path().to_path_buf()], true).unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();

        let dst_dir = TempDir::new().unwrap();
        let mut ex = ArchiveExtractor::new(dst_dir.path(), false, false);
        // Drip-feed in odd sizes to exercise the state machine.
        for piece in bytes.chunks(7) {
            ex.write_all(piece).unwrap();
        }
        let n = ex.finish().unwrap();
        assert!(n >= 5);

        let root = dst_dir.path().join(src_dir.path().strip_prefix("/").unwrap());
        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"alpha file");
        assert_eq!(
            fs::read(root.join("sub/b.log")).unwrap(),
            b"log line\n".repeat(100)
        );
        assert_eq!(fs::read(root.join("sub/deeper/c.txt")).unwrap(), b"");
        assert_eq!(
            fs::read_link(root.join("link")).unwrap(),
            PathBuf::from("a.txt")
        );
    }

    #[test]
    fn extractor_rejects_escaping_paths() {
        let dst = TempDir::new().unwrap();
        let mut ex = ArchiveExtractor::new(dst.path(), false, false);
        let mut record = Vec::new();
        record.push(KIND_FILE);
        let rel = b"../evil";
        record.extend_from_slice(&(rel.len() as u16).to_be_bytes());
        record.extend_from_slice(rel);
        record.extend_from_slice(&0o644u32.to_be_bytes());
        record.extend_from_slice(&0i64.to_be_bytes());
        record.extend_from_slice(&0u64.to_be_bytes());
        assert!(ex.write_all(&record).is_err());
    }

    #[test]
    fn truncated_stream_fails_finish() {
        let dst = TempDir::new().unwrap();
        let mut ex = ArchiveExtractor::new(dst.path(), false, false);
        let mut record = Vec::new();
        record.push(KIND_FILE);
        let rel = b"partial";
        record.extend_from_slice(&(rel.len() as u16).to_be_bytes());
        record.extend_from_slice(rel);
        record.extend_from_slice(&0o644u32.to_be_bytes());
        record.extend_from_slice(&0i64.to_be_bytes());
        record.extend_from_slice(&100u64.to_be_bytes());
        record.extend_from_slice(&[0xAB; 40]); // only 40 of 100 body bytes
        ex.write_all(&record).unwrap();
        assert!(ex.finish().is_err());
    }

    #[test]
    fn keep_newer_skips_older_members(){
        let src_dir = TempDir::new().unwrap();
        fs::write(src_dir.path().join("keep.txt"), b"old contents").unwrap();
        filetime::set_file_mtime(
            src_dir.path().join("keep.txt"),
            FileTime::from_unix_time(1_000_000, 0),
        )
        .unwrap();

        let mut stream =
            ArchiveStream::new(&[src_dir.path().to_path_buf()], false).unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();

        let dst_dir = TempDir::new().unwrap();
        let dest_file = dst_dir
            .path()
            .join(src_dir.path().strip_prefix("/").unwrap())
            .join("keep.txt");
        fs::create_dir_all(dest_file.parent().unwrap()).unwrap();
        fs::write(&dest_file, b"newer contents").unwrap();

        let mut ex = ArchiveExtractor::new(dst_dir.path(), false, true);
        ex.write_all(&bytes).unwrap();
        ex.finish().unwrap();
        assert_eq!(fs::read(&dest_file).unwrap(), b"newer contents");
    }
}
