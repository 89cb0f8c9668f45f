//! End-to-end stream tests: round-trips across the codec × dedup ×
//! preproc × cipher matrix, frame ordering, tamper detection, bounds,
//! and truncation behavior.

use std::io::Cursor;

use rand::{rngs::StdRng, RngCore, SeedableRng};

use parc::checksum::ChecksumKind;
use parc::codec::Algorithm;
use parc::config::{CipherKind, DedupMode, Options};
use parc::crypto::CryptoError;
use parc::error::ParcError;
use parc::format::{self, FormatError, CHSIZE_MASK, CHUNK_FLAG_COMPRESSED, FLAG_SINGLE_CHUNK};
use parc::stream::{compress_stream, decompress_stream};

const CHUNK: u64 = 64 * 1024;

fn base_opts(algo: Algorithm) -> Options {
    Options {
        algo,
        chunksize: CHUNK,
        nthreads: 4,
        ..Options::default()
    }
}

fn pack(data: &[u8], opts: &Options, password: Option<&str>) -> Vec<u8> {
    let mut src = Cursor::new(data.to_vec());
    let mut out = Vec::new();
    let mut pw = password.map(|p| p.as_bytes().to_vec());
    compress_stream(&mut src, &mut out, opts, pw.as_mut(), Some(data.len() as u64)).unwrap();
    out
}

fn unpack(
    stream: &[u8],
    opts: &Options,
    password: Option<&str>,
) -> Result<Vec<u8>, ParcError> {
    let mut src = Cursor::new(stream.to_vec());
    let mut out = Vec::new();
    let mut pw = password.map(|p| p.as_bytes().to_vec());
    decompress_stream(&mut src, &mut out, opts, pw.as_mut())?;
    Ok(out)
}

fn roundtrip(data: &[u8], opts: &Options) {
    let packed = pack(data, opts, None);
    let out = unpack(&packed, opts, None).unwrap();
    assert_eq!(out, data, "round-trip mismatch ({})", opts.algo.name());
}

fn english(len: usize) -> Vec<u8> {
    b"It is a truth universally acknowledged, that a single man in \
      possession of a good fortune, must be in want of a wife. "
        .iter()
        .cycle()
        .take(len)
        .copied()
        .collect()
}

fn random(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Byte length of a current-version non-crypto file header.
const PLAIN_HEADER_LEN: usize = 28;

/// Iterate `(flags, frame_range)` over every frame of a non-crypto
/// stream, in order.
fn frames(stream: &[u8], _opts: &Options) -> Vec<(u8, std::ops::Range<usize>)> {
    let (header, _) = format::read_file_header(&mut Cursor::new(stream), None).unwrap();
    let layout = format::FrameLayout::new(header.checksum().unwrap(), None);
    let mut pos = PLAIN_HEADER_LEN;
    let mut out = Vec::new();
    loop {
        let cmp_len = u64::from_be_bytes(stream[pos..pos + 8].try_into().unwrap());
        if cmp_len == 0 {
            assert_eq!(pos + 8, stream.len(), "bytes after trailer");
            break;
        }
        let flags = stream[pos + layout.flags_off()];
        let mut end = pos + 8 + cmp_len as usize;
        if flags & CHSIZE_MASK != 0 {
            end += 8;
        }
        out.push((flags, pos..end));
        pos = end;
    }
    out
}

// ── Round-trip matrix ────────────────────────────────────────────────────────

#[test]
fn roundtrip_every_codec() {
    let text = english(200_000); // spans 4 chunks with an uneven tail
    for algo in [
        Algorithm::None,
        Algorithm::Lz4,
        Algorithm::Zstd,
        Algorithm::Zlib,
        Algorithm::Bzip2,
        Algorithm::Lzma,
        Algorithm::Brotli,
        Algorithm::Adapt,
    ] {
        roundtrip(&text, &base_opts(algo));
    }
}

#[test]
fn roundtrip_input_shapes() {
    let opts = base_opts(Algorithm::Zstd);
    roundtrip(b"", &opts);
    roundtrip(b"x", &opts);
    roundtrip(&vec![0u8; CHUNK as usize], &opts); // exactly one chunk
    roundtrip(&vec![7u8; CHUNK as usize + 1], &opts); // 1-byte tail
    roundtrip(&random(3 * CHUNK as usize + 1234, 11), &opts);
}

#[test]
fn roundtrip_dedup_modes() {
    let mut repetitive = Vec::new();
    for i in 0..40u8 {
        repetitive.extend_from_slice(&english(8000));
        repetitive.extend_from_slice(&vec![i % 4; 8000]);
    }

    for dedup in [DedupMode::Rabin, DedupMode::Fixed] {
        let mut opts = base_opts(Algorithm::Zstd);
        opts.dedup = dedup;
        roundtrip(&repetitive, &opts);

        opts.global_dedup = true;
        roundtrip(&repetitive, &opts);

        opts.delta_mode = 1;
        roundtrip(&repetitive, &opts);

        opts.delta_mode = 2;
        roundtrip(&repetitive, &opts);
    }
}

#[test]
fn roundtrip_preproc_combinations() {
    let mut data = english(120_000);
    for v in 0u32..8000 {
        data.extend_from_slice(&v.to_be_bytes());
    }
    for (lzp, span) in [(true, 0), (false, 8), (true, 8)] {
        let mut opts = base_opts(Algorithm::Zlib);
        opts.lzp = lzp;
        opts.delta2_span = span;
        roundtrip(&data, &opts);
    }
}

#[test]
fn roundtrip_ciphers() {
    let data = english(150_000);
    for (cipher, keylen) in [
        (CipherKind::AesCtr, 16),
        (CipherKind::AesCtr, 32),
        (CipherKind::XSalsa20, 32),
    ] {
        let mut opts = base_opts(Algorithm::Zstd);
        opts.cipher = Some(cipher);
        opts.keylen = keylen;
        let packed = pack(&data, &opts, Some("hunter2"));
        let out = unpack(&packed, &opts, Some("hunter2")).unwrap();
        assert_eq!(out, data);
    }
}

#[test]
fn roundtrip_checksums() {
    let data = english(80_000);
    for cksum in [
        ChecksumKind::Crc64,
        ChecksumKind::Blake256,
        ChecksumKind::Blake512,
        ChecksumKind::Sha256,
        ChecksumKind::Sha512,
        ChecksumKind::Keccak256,
        ChecksumKind::Keccak512,
    ] {
        let mut opts = base_opts(Algorithm::Lz4);
        opts.checksum = cksum;
        roundtrip(&data, &opts);
    }
}

#[test]
fn roundtrip_kitchen_sink() {
    // Dedup + both preprocs + encryption + adaptive codec, many chunks.
    let mut data = Vec::new();
    for _ in 0..6 {
        data.extend_from_slice(&english(30_000));
        for v in 0u32..4000 {
            data.extend_from_slice(&v.to_be_bytes());
        }
    }
    let mut opts = base_opts(Algorithm::Adapt);
    opts.dedup = DedupMode::Rabin;
    opts.global_dedup = true;
    opts.delta_mode = 1;
    opts.lzp = true;
    opts.delta2_span = 8;
    opts.cipher = Some(CipherKind::XSalsa20);
    let packed = pack(&data, &opts, Some("s3cret"));
    assert_eq!(unpack(&packed, &opts, Some("s3cret")).unwrap(), data);
}

// ── Ordering ─────────────────────────────────────────────────────────────────

#[test]
fn output_is_identical_for_any_worker_count() {
    let data = random(CHUNK as usize * 7 + 999, 5);
    let mut reference = None;
    for threads in [1usize, 2, 3, 8] {
        let mut opts = base_opts(Algorithm::Lz4);
        opts.nthreads = threads;
        let packed = pack(&data, &opts, None);
        match &reference {
            None => reference = Some(packed),
            Some(r) => assert_eq!(&packed, r, "thread count {threads} reordered output"),
        }
        // And every worker count decodes every stream.
        for dthreads in [1usize, 5] {
            let mut dopts = opts.clone();
            dopts.nthreads = dthreads;
            assert_eq!(unpack(reference.as_ref().unwrap(), &dopts, None).unwrap(), data);
        }
    }
}

#[test]
fn frames_appear_in_ascending_chunk_order() {
    // Chunk i is filled with byte i, so order errors change content.
    let n = 9usize;
    let mut data = Vec::new();
    for i in 0..n {
        data.extend_from_slice(&vec![i as u8; CHUNK as usize]);
    }
    let opts = base_opts(Algorithm::None);
    let packed = pack(&data, &opts, None);
    assert_eq!(frames(&packed, &opts).len(), n);
    assert_eq!(unpack(&packed, &opts, None).unwrap(), data);
}

// ── Scenario checks ──────────────────────────────────────────────────────────

#[test]
fn one_byte_stream_layout() {
    let opts = base_opts(Algorithm::Lzma);
    let packed = pack(b"Q", &opts, None);

    let (header, _) = format::read_file_header(&mut Cursor::new(&packed), None).unwrap();
    assert!(header.flags & FLAG_SINGLE_CHUNK != 0);

    let frames = frames(&packed, &opts);
    assert_eq!(frames.len(), 1);
    let (flags, range) = &frames[0];
    assert_ne!(flags & CHSIZE_MASK, 0);
    let original_len =
        u64::from_be_bytes(packed[range.end - 8..range.end].try_into().unwrap());
    assert_eq!(original_len, 1);

    // 8-zero-byte trailer closes the stream.
    assert_eq!(&packed[packed.len() - 8..], &[0u8; 8]);
    assert_eq!(unpack(&packed, &opts, None).unwrap(), b"Q");
}

#[test]
fn random_data_is_stored_uncompressed() {
    let data = random(3 * CHUNK as usize, 77);
    let opts = base_opts(Algorithm::Lz4);
    let packed = pack(&data, &opts, None);
    let frames = frames(&packed, &opts);
    assert_eq!(frames.len(), 3);
    for (flags, _) in &frames {
        assert_eq!(flags & CHUNK_FLAG_COMPRESSED, 0, "random frame marked compressed");
    }
    assert_eq!(unpack(&packed, &opts, None).unwrap(), data);
}

#[test]
fn wrong_password_fails_without_output() {
    let data = english(100_000);
    let mut opts = base_opts(Algorithm::Zlib);
    opts.cipher = Some(CipherKind::AesCtr);
    let packed = pack(&data, &opts, Some("hunter2"));

    let mut src = Cursor::new(packed.clone());
    let mut out = Vec::new();
    let mut pw = Some(b"hunter3".to_vec());
    let err = decompress_stream(&mut src, &mut out, &opts, pw.as_mut()).unwrap_err();
    assert!(err.is_integrity_failure(), "unexpected error: {err}");
    assert!(out.is_empty(), "plaintext was emitted before auth failure");
}

#[test]
fn encrypted_payload_bit_flip_is_auth_failure() {
    let data = english(90_000);
    let mut opts = base_opts(Algorithm::Zstd);
    opts.cipher = Some(CipherKind::AesCtr);
    let packed = pack(&data, &opts, Some("pw"));

    // Flip one payload bit somewhere after the header region.
    let mut bad = packed.clone();
    let target = bad.len() / 2;
    bad[target] ^= 0x01;

    let mut src = Cursor::new(bad);
    let mut out = Vec::new();
    let mut pw = Some(b"pw".to_vec());
    let err = decompress_stream(&mut src, &mut out, &opts, pw.as_mut()).unwrap_err();
    match err {
        ParcError::Crypto(CryptoError::AuthFailed) => {}
        other => panic!("expected AuthFailed, got {other}"),
    }
    assert!(out.is_empty());
}

#[test]
fn plain_frame_tampering_never_passes_silently() {
    let data = english(70_000);
    let opts = base_opts(Algorithm::Zstd);
    let packed = pack(&data, &opts, None);
    let frame_start = PLAIN_HEADER_LEN;

    // Sample offsets across the stream: length, digest, mac, flags,
    // payload, later frames.
    let span = packed.len() - frame_start;
    for delta in [0usize, 9, 40, 44, 45, span / 3, span / 2, span - 9] {
        let mut bad = packed.clone();
        let idx = frame_start + delta;
        bad[idx] ^= 0x20;
        let result = unpack(&bad, &opts, None);
        assert!(result.is_err(), "flip at frame offset {delta} decoded silently");
    }
}

// ── Bounds and truncation ────────────────────────────────────────────────────

#[test]
fn oversize_frame_is_rejected() {
    let opts = base_opts(Algorithm::Lz4);
    let packed = pack(&english(10_000), &opts, None);
    let frame_start = PLAIN_HEADER_LEN;

    let mut bad = packed.clone();
    bad[frame_start..frame_start + 8]
        .copy_from_slice(&(CHUNK + 257).to_be_bytes());
    match unpack(&bad, &opts, None).unwrap_err() {
        ParcError::Format(FormatError::OversizeFrame(..)) => {}
        other => panic!("expected OversizeFrame, got {other}"),
    }

    let mut bad = packed;
    bad[frame_start..frame_start + 8].copy_from_slice(&3u64.to_be_bytes());
    match unpack(&bad, &opts, None).unwrap_err() {
        ParcError::Format(FormatError::ShortFrame) => {}
        other => panic!("expected ShortFrame, got {other}"),
    }
}

#[test]
fn missing_trailer_is_truncation() {
    let opts = base_opts(Algorithm::Zstd);
    let packed = pack(&english(50_000), &opts, None);

    // Whole trailer gone.
    let err = unpack(&packed[..packed.len() - 8], &opts, None).unwrap_err();
    assert!(matches!(err, ParcError::UnexpectedEof), "got {err}");

    // Truncated mid-frame.
    let err = unpack(&packed[..packed.len() / 2], &opts, None).unwrap_err();
    assert!(matches!(err, ParcError::UnexpectedEof), "got {err}");

    // Empty input entirely.
    let err = unpack(&[], &opts, None).unwrap_err();
    assert!(matches!(err, ParcError::Format(_) | ParcError::Io(_)), "got {err}");
}

#[test]
fn empty_stream_roundtrips_to_header_and_trailer() {
    let opts = base_opts(Algorithm::Zstd);
    let packed = pack(b"", &opts, None);
    // header (28) + trailer (8), no frames.
    assert_eq!(packed.len(), 36);
    assert_eq!(unpack(&packed, &opts, None).unwrap(), b"");
}

#[test]
fn decoder_ignores_cli_transform_options() {
    // The header, not the CLI, dictates decode parameters.
    let mut enc_opts = base_opts(Algorithm::Bzip2);
    enc_opts.lzp = true;
    enc_opts.delta2_span = 8;
    enc_opts.dedup = DedupMode::Fixed;
    let mut data = english(50_000);
    data.extend_from_slice(&vec![9u8; 50_000]);
    let packed = pack(&data, &enc_opts, None);

    let dec_opts = base_opts(Algorithm::Lz4); // deliberately wrong
    assert_eq!(unpack(&packed, &dec_opts, None).unwrap(), data);
}
