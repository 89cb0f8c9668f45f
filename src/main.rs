use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use parc::archive::{ArchiveExtractor, ArchiveStream};
use parc::checksum::ChecksumKind;
use parc::codec::Algorithm;
use parc::config::{parse_size, CipherKind, DedupMode, Options, MAX_LEVEL};
use parc::error::ParcError;
use parc::stream::{self, Stats};

/// Default suffix for compressed output files.
const SUFFIX: &str = ".parc";

#[derive(Parser)]
#[command(
    name = "parc",
    version,
    about = "Parallel chunked multi-algorithm compressor",
    after_help = "Exit codes: 0 success, 1 failure, 2 bad arguments."
)]
struct Cli {
    /// Compress with ALGO: lzma zlib lz4 zstd bzip2 brotli adapt none
    #[arg(short = 'c', value_name = "ALGO", conflicts_with = "decompress")]
    compress: Option<String>,

    /// Decompress
    #[arg(short = 'd')]
    decompress: bool,

    /// Chunk size, with optional g/m/k suffix
    #[arg(short = 's', value_name = "SIZE", default_value = "8m")]
    chunk_size: String,

    /// Compression level
    #[arg(short = 'l', value_name = "0-14", default_value_t = 6,
          value_parser = clap::value_parser!(i32).range(0..=MAX_LEVEL as i64))]
    level: i32,

    /// Pipe mode: read stdin, write stdout
    #[arg(short = 'p')]
    pipe: bool,

    /// Worker threads (defaults to the logical CPU count)
    #[arg(short = 't', value_name = "1-256",
          value_parser = clap::value_parser!(u16).range(1..=256))]
    threads: Option<u16>,

    /// Content-defined (rabin) deduplication
    #[arg(short = 'D')]
    rabin_dedup: bool,

    /// Fixed-block deduplication
    #[arg(short = 'F', conflicts_with = "rabin_dedup")]
    fixed_dedup: bool,

    /// Global deduplication: one index across all chunks (needs -D or -F)
    #[arg(short = 'G')]
    global_dedup: bool,

    /// Delta-encode similar dedup blocks (repeat for any-length matches)
    #[arg(short = 'E', action = clap::ArgAction::Count)]
    delta: u8,

    /// LZP preprocessing
    #[arg(short = 'L')]
    lzp: bool,

    /// Delta2 (stride delta) preprocessing
    #[arg(short = 'P')]
    delta2: bool,

    /// Chunk checksum: CRC64 BLAKE256 BLAKE512 SHA256 SHA512 KECCAK256 KECCAK512
    #[arg(short = 'S', value_name = "CKSUM", default_value = "BLAKE256")]
    checksum: String,

    /// Dedup mean block size selector (4 KiB << n)
    #[arg(short = 'B', value_name = "0-5", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..=5))]
    dedup_block: u8,

    /// Encrypt: AES (AES-CTR) or SALSA20 (XSalsa20)
    #[arg(short = 'e', value_name = "CIPHER")]
    encrypt: Option<String>,

    /// Password file; its contents are zeroed after the first use
    #[arg(short = 'w', value_name = "FILE")]
    password_file: Option<PathBuf>,

    /// Cipher key length in bytes
    #[arg(short = 'k', value_name = "16|32", default_value_t = 32)]
    keylen: u32,

    /// Archive mode: treat the input path as a directory tree
    #[arg(short = 'a')]
    archive: bool,

    /// Verbose diagnostics
    #[arg(short = 'v')]
    verbose: bool,

    /// Disable archive member sorting
    #[arg(short = 'n')]
    no_sort: bool,

    /// Force recorded permissions on extraction
    #[arg(short = 'm')]
    force_perms: bool,

    /// Never overwrite files newer than the archived member
    #[arg(short = 'K')]
    keep_newer: bool,

    /// Report memory use on completion
    #[arg(short = 'M')]
    mem_stats: bool,

    /// Report compression statistics on completion
    #[arg(short = 'C')]
    comp_stats: bool,

    /// Input path (omit in pipe mode)
    file: Option<PathBuf>,

    /// Output path (derived from the input when omitted)
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if cli.verbose { "debug" } else { "warn" }),
    )
    .init();

    let opts = match build_options(&cli) {
        Ok(o) => o,
        Err(msg) => {
            eprintln!("parc: {msg}");
            return ExitCode::from(2);
        }
    };

    match run(&cli, opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_integrity_failure() {
                eprintln!("parc: INTEGRITY FAILURE: {e}");
            } else {
                eprintln!("parc: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

// ── Argument assembly ────────────────────────────────────────────────────────

fn build_options(cli: &Cli) -> Result<Options, String> {
    if cli.compress.is_none() && !cli.decompress {
        return Err("one of -c <algo> or -d is required".into());
    }
    if cli.file.is_none() && !cli.pipe {
        return Err("an input path is required unless -p is given".into());
    }
    if cli.archive && cli.compress.is_some() && cli.file.is_none() {
        return Err("archive mode requires an input directory".into());
    }

    let algo = match &cli.compress {
        None => Algorithm::Zstd, // overridden by the header on decompress
        Some(name) => {
            let algo = Algorithm::from_name(name)
                .ok_or_else(|| format!("unknown algorithm '{name}'"))?;
            if algo == Algorithm::Ppmd {
                return Err("ppmd has no backend in this build".into());
            }
            algo
        }
    };

    let checksum = ChecksumKind::from_name(&cli.checksum)
        .ok_or_else(|| format!("unknown checksum '{}'", cli.checksum))?;

    let cipher = match &cli.encrypt {
        None => None,
        Some(name) => Some(
            CipherKind::from_name(name).ok_or_else(|| format!("unknown cipher '{name}'"))?,
        ),
    };
    if cipher.is_some() {
        if cli.password_file.is_none() {
            return Err("-e requires a password file (-w)".into());
        }
        if cli.keylen != 16 && cli.keylen != 32 {
            return Err(format!("invalid key length {} (use 16 or 32)", cli.keylen));
        }
        if cipher == Some(CipherKind::XSalsa20) && cli.keylen != 32 {
            return Err("SALSA20 requires -k 32".into());
        }
    }

    let dedup = if cli.rabin_dedup {
        DedupMode::Rabin
    } else if cli.fixed_dedup {
        DedupMode::Fixed
    } else {
        DedupMode::Off
    };
    if cli.global_dedup && dedup == DedupMode::Off {
        return Err("-G requires -D or -F".into());
    }

    let chunksize = parse_size(&cli.chunk_size)?;
    if chunksize == 0 {
        return Err("chunk size must be nonzero".into());
    }

    Ok(Options {
        algo,
        level: cli.level,
        chunksize,
        nthreads: cli.threads.map_or(0, usize::from),
        checksum,
        dedup,
        global_dedup: cli.global_dedup,
        dedup_block: cli.dedup_block,
        delta_mode: cli.delta.min(2),
        lzp: cli.lzp,
        delta2_span: if cli.delta2 { 8 } else { 0 },
        cipher,
        keylen: cli.keylen,
        archive: cli.archive,
        mem_stats: cli.mem_stats,
        comp_stats: cli.comp_stats,
    })
}

/// Read the password file, then zero it on disk.
fn read_password(path: &Path) -> Result<Vec<u8>, ParcError> {
    let mut pw = fs::read(path)?;
    // Overwrite the on-disk copy before anything else can fail.
    let zeros = vec![0u8; pw.len()];
    fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|mut f| {
            f.write_all(&zeros)?;
            f.sync_all()
        })?;
    while pw.last() == Some(&b'\n') || pw.last() == Some(&b'\r') {
        pw.pop();
    }
    Ok(pw)
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

fn run(cli: &Cli, opts: Options) -> Result<(), ParcError> {
    let mut password = match (&cli.encrypt, &cli.decompress, &cli.password_file) {
        (Some(_), _, Some(path)) => Some(read_password(path)?),
        (None, true, Some(path)) => Some(read_password(path)?),
        _ => None,
    };

    if cli.compress.is_some() {
        compress(cli, &opts, password.as_mut())
    } else {
        decompress(cli, &opts, password.as_mut())
    }
}

fn compress(cli: &Cli, opts: &Options, password: Option<&mut Vec<u8>>) -> Result<(), ParcError> {
    let stats = if cli.pipe {
        // The source crosses into the producer thread; the plain handles
        // are Send where the locked variants are not.
        let mut dst = io::stdout();
        if opts.archive {
            let roots = archive_roots(cli)?;
            let mut src = ArchiveStream::new(&roots, !cli.no_sort)?;
            stream::compress_stream(&mut src, &mut dst, opts, password, None)?
        } else {
            let mut src = io::stdin();
            stream::compress_stream(&mut src, &mut dst, opts, password, None)?
        }
    } else {
        let input = cli.file.as_deref().expect("validated by build_options");
        let output = match &cli.output {
            Some(p) => p.clone(),
            None => {
                let mut os = input.as_os_str().to_owned();
                os.push(SUFFIX);
                PathBuf::from(os)
            }
        };
        if opts.archive {
            let roots = archive_roots(cli)?;
            let mut src = ArchiveStream::new(&roots, !cli.no_sort)?;
            stream::commit_to_file(&output, |dst| {
                stream::compress_stream(&mut src, dst, opts, password, None)
            })?
        } else {
            stream::compress_file(input, &output, opts, password)?
        }
    };
    report(cli, opts, &stats);
    Ok(())
}

fn decompress(cli: &Cli, opts: &Options, password: Option<&mut Vec<u8>>) -> Result<(), ParcError> {
    if cli.pipe {
        // Peek the fixed header to learn the archive flag before a single
        // payload byte is produced, then splice the bytes back in front.
        let mut head = [0u8; 24];
        io::stdin().read_exact(&mut head)?;
        let flags = u16::from_be_bytes([head[10], head[11]]);
        let mut src = io::Cursor::new(head.to_vec()).chain(io::stdin());

        if flags & parc::format::FLAG_ARCHIVE != 0 {
            let dest = cli.output.clone().unwrap_or_else(|| PathBuf::from("."));
            fs::create_dir_all(&dest)?;
            let mut extractor = ArchiveExtractor::new(&dest, cli.force_perms, cli.keep_newer);
            let (_, stats) = stream::decompress_stream(&mut src, &mut extractor, opts, password)?;
            let members = extractor.finish()?;
            log::info!("extracted {members} member(s) to {}", dest.display());
            report(cli, opts, &stats);
        } else {
            let mut dst = io::stdout();
            let (_, stats) = stream::decompress_stream(&mut src, &mut dst, opts, password)?;
            report(cli, opts, &stats);
        }
        return Ok(());
    }

    let input = cli.file.as_deref().expect("validated by build_options");

    // Peek mode from the stream so archives unpack without extra flags.
    // The header is re-read by the real pass.
    let is_archive = {
        let mut probe = fs::File::open(input)?;
        match parc::format::read_file_header(&mut probe, None) {
            Ok((hdr, _)) => hdr.is_archive(),
            Err(parc::format::FormatError::PasswordRequired) => {
                // Encrypted: flags parse before key derivation.
                let mut probe = fs::File::open(input)?;
                let mut fixed = [0u8; 24];
                probe.read_exact(&mut fixed)?;
                u16::from_be_bytes([fixed[10], fixed[11]]) & parc::format::FLAG_ARCHIVE != 0
            }
            Err(e) => return Err(e.into()),
        }
    };

    if is_archive {
        let mut src = fs::File::open(input)?;
        let dest = cli.output.clone().unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dest)?;
        let mut extractor = ArchiveExtractor::new(&dest, cli.force_perms, cli.keep_newer);
        let (_, stats) = stream::decompress_stream(&mut src, &mut extractor, opts, password)?;
        let members = extractor.finish()?;
        log::info!("extracted {members} member(s) to {}", dest.display());
        report(cli, opts, &stats);
        return Ok(());
    }

    let output = match &cli.output {
        Some(p) => p.clone(),
        None => default_unpack_path(input),
    };
    let (_, stats) = stream::decompress_file(input, &output, opts, password)?;
    report(cli, opts, &stats);
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn archive_roots(cli: &Cli) -> Result<Vec<PathBuf>, ParcError> {
    let root = cli.file.clone().ok_or_else(|| {
        ParcError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "archive mode requires an input directory",
        ))
    })?;
    Ok(vec![root])
}

fn default_unpack_path(input: &Path) -> PathBuf {
    let s = input.as_os_str().to_string_lossy();
    match s.strip_suffix(SUFFIX) {
        Some(stem) if !stem.is_empty() => PathBuf::from(stem.to_string()),
        _ => {
            let mut os = input.as_os_str().to_owned();
            os.push(".out");
            PathBuf::from(os)
        }
    }
}

fn report(cli: &Cli, opts: &Options, stats: &Stats) {
    if cli.comp_stats {
        eprintln!(
            "chunks: {}  in: {} B  out: {} B  ratio: {:.3}",
            stats.chunks(),
            stats.bytes_in(),
            stats.bytes_out(),
            stats.ratio()
        );
    }
    if cli.mem_stats {
        let threads = opts.effective_threads();
        eprintln!(
            "threads: {}  chunk: {} B  peak buffers: ~{} B",
            threads,
            opts.chunksize,
            stats.buffer_memory(threads, opts.chunksize)
        );
    }
}
