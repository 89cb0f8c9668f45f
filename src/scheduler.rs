//! Ordered parallelism: N workers, one producer, one in-order writer.
//!
//! Chunks are dispatched round-robin by `id mod N` and drained by the
//! writer in the same round-robin order, so output appears in strictly
//! ascending chunk id with no reordering queues.
//!
//! # Lanes
//! Each worker owns a lane of three bounded(1) channels standing in for
//! the classic counting-semaphore triplet:
//!
//! ```text
//! start       producer → worker   (carries the job)
//! done        worker  → writer    (carries the result)
//! write_done  writer  → producer  (carries the recycled buffer pair;
//!                                  primed with one credit)
//! ```
//!
//! The buffer pair rides the credits, so steady state runs without
//! allocation and buffers are lazily allocated on first use — a stream
//! with fewer chunks than workers never inflates the idle lanes.
//!
//! # Cancellation
//! Any fatal error sets the shared cancel flag and records the first
//! error.  Teardown is channel-closure driven: the writer drops the
//! credit senders, which unblocks the producer, which drops the start
//! senders, which unblocks the workers, which drops the dedup ring
//! senders.  Every suspension point is a channel operation, so closure
//! reaches all of them.
//!
//! # Global-dedup ring
//! One token circulates worker 0 → 1 → ... → N-1 → 0, entered around the
//! dedup stage only, serializing shared-index mutations in chunk-id
//! order while the codec stages stay parallel.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::Options;
use crate::crypto::CryptoBinding;
use crate::dedup::GlobalState;
use crate::error::ParcError;
use crate::format::TRAILER;
use crate::stream::Stats;
use crate::transform::TransformStack;

// ── Sources ──────────────────────────────────────────────────────────────────

/// Producer-side input for compression: one raw chunk per call.  Sources
/// move into the producer thread, hence `Send`.
pub trait ChunkSource: Send {
    /// Fill `buf` with the next chunk, returning its length; 0 = EOF.
    fn read_chunk(&mut self, buf: &mut Vec<u8>) -> Result<usize, ParcError>;
}

/// Producer-side input for decompression: one complete wire frame per
/// call (including the `cmp_len` prefix and any suffix); 0 = trailer.
pub trait FrameSource: Send {
    fn read_frame(&mut self, buf: &mut Vec<u8>) -> Result<usize, ParcError>;
}

// ── Ring token ───────────────────────────────────────────────────────────────

/// A worker's handle on the global-dedup ring: wait on its own slot,
/// post to the successor's.
pub struct RingToken {
    wait: Receiver<()>,
    post: Sender<()>,
}

/// Held for the duration of one dedup stage; posts onward on drop.
pub struct RingPass<'a>(Option<&'a Sender<()>>);

impl RingToken {
    /// Acquire the ring (a no-op when no ring is configured).
    pub fn enter(token: Option<&RingToken>) -> Result<RingPass<'_>, ParcError> {
        match token {
            None => Ok(RingPass(None)),
            Some(t) => {
                t.wait.recv().map_err(|_| ParcError::Cancelled)?;
                Ok(RingPass(Some(&t.post)))
            }
        }
    }
}

impl Drop for RingPass<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.0 {
            // The single token circulates, so the slot is always free;
            // on teardown the receiver may already be gone.
            let _ = tx.try_send(());
        }
    }
}

fn build_ring(n: usize) -> Vec<RingToken> {
    let slots: Vec<(Sender<()>, Receiver<()>)> = (0..n).map(|_| bounded(1)).collect();
    // Worker 0 proceeds first.
    slots[0].0.send(()).ok();
    (0..n)
        .map(|i| RingToken {
            wait: slots[i].1.clone(),
            post: slots[(i + 1) % n].0.clone(),
        })
        .collect()
}

// ── Messages ─────────────────────────────────────────────────────────────────

struct Job {
    id:    u64,
    /// Valid bytes in `data`; 0 is the EOF marker.
    len:   usize,
    data:  Vec<u8>,
    spare: Vec<u8>,
}

struct Outcome {
    out:   Vec<u8>,
    spare: Vec<u8>,
    /// Echo of the producer's EOF marker (`cmp_len` 0 downstream).
    eof:   bool,
    err:   Option<ParcError>,
}

struct ProducerLane {
    start_tx:  Sender<Job>,
    credit_rx: Receiver<(Vec<u8>, Vec<u8>)>,
}

struct WriterLane {
    done_rx:   Receiver<Outcome>,
    credit_tx: Sender<(Vec<u8>, Vec<u8>)>,
}

struct WorkerLane {
    start_rx: Receiver<Job>,
    done_tx:  Sender<Outcome>,
    ring:     Option<RingToken>,
}

fn build_lanes(n: usize, with_ring: bool) -> (Vec<ProducerLane>, Vec<WriterLane>, Vec<WorkerLane>) {
    let mut ring: Vec<Option<RingToken>> = if with_ring {
        build_ring(n).into_iter().map(Some).collect()
    } else {
        (0..n).map(|_| None).collect()
    };

    let mut producers = Vec::with_capacity(n);
    let mut writers = Vec::with_capacity(n);
    let mut workers = Vec::with_capacity(n);
    for i in 0..n {
        let (start_tx, start_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let (credit_tx, credit_rx) = bounded(1);
        // The initial write_done credit: an empty buffer pair, so real
        // allocation happens on first use.
        credit_tx
            .send((Vec::new(), Vec::new()))
            .expect("fresh credit channel cannot be full");
        producers.push(ProducerLane { start_tx, credit_rx });
        writers.push(WriterLane { done_rx, credit_tx });
        workers.push(WorkerLane { start_rx, done_tx, ring: ring[i].take() });
    }
    (producers, writers, workers)
}

// ── Error slot ───────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ErrorSlot(Arc<Mutex<Option<ParcError>>>);

impl ErrorSlot {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    /// First error wins; later ones are logged and dropped.
    fn record(&self, err: ParcError) {
        if let Ok(mut slot) = self.0.lock() {
            if slot.is_none() {
                *slot = Some(err);
                return;
            }
            log::debug!("suppressing secondary error: {err}");
        }
    }

    fn take(&self) -> Option<ParcError> {
        self.0.lock().ok().and_then(|mut s| s.take())
    }
}

// ── Worker loops ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Direction {
    Compress,
    Decompress,
}

fn worker_loop(
    worker_id: usize,
    lane:      WorkerLane,
    mut stack: TransformStack,
    dir:       Direction,
    cancel:    &AtomicBool,
) {
    log::debug!("worker {worker_id} started");
    while let Ok(mut job) = lane.start_rx.recv() {
        if job.len == 0 {
            let _ = lane.done_tx.send(Outcome {
                out:   Vec::new(),
                spare: job.spare,
                eof:   true,
                err:   None,
            });
            continue;
        }
        if cancel.load(Ordering::Relaxed) {
            // A peer already failed; echo cancellation downstream.  The
            // writer always reaches the true error first because it
            // drains in chunk order.
            let _ = lane.done_tx.send(Outcome {
                out:   Vec::new(),
                spare: job.spare,
                eof:   false,
                err:   Some(ParcError::Cancelled),
            });
            continue;
        }

        let mut out = std::mem::take(&mut job.spare);
        let result = match dir {
            Direction::Compress => stack.encode_chunk(
                job.id,
                &job.data[..job.len],
                &mut out,
                lane.ring.as_ref(),
            ),
            Direction::Decompress => {
                match stack.decode_chunk(job.id, &mut job.data[..job.len], lane.ring.as_ref()) {
                    Ok(raw) => {
                        out.clear();
                        out.extend_from_slice(&raw);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };

        let outcome = match result {
            Ok(()) => Outcome { out, spare: job.data, eof: false, err: None },
            Err(e) => {
                cancel.store(true, Ordering::Relaxed);
                Outcome { out: Vec::new(), spare: job.data, eof: false, err: Some(e) }
            }
        };
        if lane.done_tx.send(outcome).is_err() {
            break; // writer is gone
        }
    }
    log::debug!("worker {worker_id} finished");
}

// ── Producer loops ───────────────────────────────────────────────────────────

fn produce_chunks(
    source: &mut dyn ChunkSource,
    lanes:  &[ProducerLane],
    cancel: &AtomicBool,
    errors: &ErrorSlot,
    stats:  &Stats,
) {
    let mut id = 0u64;
    let mut w = 0usize;
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let (mut data, spare) = match lanes[w].credit_rx.recv() {
            Ok(pair) => pair,
            Err(_) => break, // writer tore the lanes down
        };
        let len = match source.read_chunk(&mut data) {
            Ok(n) => n,
            Err(e) => {
                cancel.store(true, Ordering::Relaxed);
                errors.record(e);
                break;
            }
        };
        stats.add_in(len as u64);
        let eof = len == 0;
        if lanes[w].start_tx.send(Job { id, len, data, spare }).is_err() {
            break;
        }
        if eof {
            break;
        }
        id += 1;
        w = (w + 1) % lanes.len();
    }
    // Dropping the start senders releases any idle worker.
}

fn produce_frames(
    source: &mut dyn FrameSource,
    lanes:  &[ProducerLane],
    cancel: &AtomicBool,
    errors: &ErrorSlot,
    stats:  &Stats,
) {
    let mut id = 0u64;
    let mut w = 0usize;
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let (mut data, spare) = match lanes[w].credit_rx.recv() {
            Ok(pair) => pair,
            Err(_) => break,
        };
        let len = match source.read_frame(&mut data) {
            Ok(n) => n,
            Err(e) => {
                cancel.store(true, Ordering::Relaxed);
                errors.record(e);
                break;
            }
        };
        stats.add_in(len as u64);
        let eof = len == 0;
        if lanes[w].start_tx.send(Job { id, len, data, spare }).is_err() {
            break;
        }
        if eof {
            break;
        }
        id += 1;
        w = (w + 1) % lanes.len();
    }
}

// ── Writer loop ──────────────────────────────────────────────────────────────

/// Drain lanes in round-robin order, writing frames (or raw chunks) in
/// strictly ascending chunk id.  Returns `Ok(true)` on a clean EOF.
fn drain_in_order(
    sink:    &mut dyn Write,
    lanes:   &[WriterLane],
    cancel:  &AtomicBool,
    errors:  &ErrorSlot,
    stats:   &Stats,
    trailer: bool,
) -> bool {
    let mut w = 0usize;
    loop {
        let outcome = match lanes[w].done_rx.recv() {
            Ok(o) => o,
            Err(_) => {
                // Workers died without an EOF echo; the producer or a
                // worker recorded why.
                cancel.store(true, Ordering::Relaxed);
                return false;
            }
        };
        if let Some(err) = outcome.err {
            cancel.store(true, Ordering::Relaxed);
            errors.record(err);
            return false;
        }
        if outcome.eof {
            if trailer {
                if let Err(e) = sink.write_all(&TRAILER) {
                    errors.record(e.into());
                    return false;
                }
            }
            return true;
        }

        if let Err(e) = sink.write_all(&outcome.out) {
            cancel.store(true, Ordering::Relaxed);
            errors.record(e.into());
            return false;
        }
        stats.add_out(outcome.out.len() as u64);
        stats.add_chunk();

        // Return the pair as the next write_done credit.
        let _ = lanes[w].credit_tx.send((outcome.spare, outcome.out));
        w = (w + 1) % lanes.len();
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Run the compression pipeline: `source` chunks in, framed stream (plus
/// trailer) out.  The caller has already written the file header.
pub fn run_compress(
    opts:   &Options,
    crypto: Option<Arc<CryptoBinding>>,
    global: Option<Arc<Mutex<GlobalState>>>,
    source: &mut dyn ChunkSource,
    sink:   &mut dyn Write,
    stats:  &Stats,
) -> Result<(), ParcError> {
    run_pipeline(opts, crypto, global, Feed::Chunks(source), sink, stats, Direction::Compress)
}

/// Run the decompression pipeline: wire frames in, raw bytes out.  The
/// caller has already parsed the file header.
pub fn run_decompress(
    opts:   &Options,
    crypto: Option<Arc<CryptoBinding>>,
    global: Option<Arc<Mutex<GlobalState>>>,
    source: &mut dyn FrameSource,
    sink:   &mut dyn Write,
    stats:  &Stats,
) -> Result<(), ParcError> {
    run_pipeline(opts, crypto, global, Feed::Frames(source), sink, stats, Direction::Decompress)
}

enum Feed<'a> {
    Chunks(&'a mut dyn ChunkSource),
    Frames(&'a mut dyn FrameSource),
}

fn run_pipeline(
    opts:   &Options,
    crypto: Option<Arc<CryptoBinding>>,
    global: Option<Arc<Mutex<GlobalState>>>,
    feed:   Feed<'_>,
    sink:   &mut dyn Write,
    stats:  &Stats,
    dir:    Direction,
) -> Result<(), ParcError> {
    let n = opts.effective_threads();
    let with_ring = global.is_some();
    let (producer_lanes, writer_lanes, worker_lanes) = build_lanes(n, with_ring);

    // Build every worker's stack up front so setup errors surface before
    // any thread starts.
    let mut stacks = Vec::with_capacity(n);
    for _ in 0..n {
        stacks.push(TransformStack::new(opts, crypto.clone(), global.clone())?);
    }

    let cancel = AtomicBool::new(false);
    let errors = ErrorSlot::new();
    let trailer = matches!(dir, Direction::Compress);

    let clean = thread::scope(|s| {
        let cancel = &cancel;
        let errors = &errors;

        for (i, (lane, stack)) in worker_lanes.into_iter().zip(stacks).enumerate() {
            s.spawn(move || worker_loop(i, lane, stack, dir, cancel));
        }

        let producer_stats = stats;
        s.spawn(move || match feed {
            Feed::Chunks(source) => {
                produce_chunks(source, &producer_lanes, cancel, errors, producer_stats)
            }
            Feed::Frames(source) => {
                produce_frames(source, &producer_lanes, cancel, errors, producer_stats)
            }
        });

        let clean = drain_in_order(sink, &writer_lanes, cancel, errors, stats, trailer);
        // Tear the write_done credits down before the scope joins, so a
        // producer blocked on a credit wakes, drops the start lanes, and
        // lets every worker drain out.
        drop(writer_lanes);
        clean
    });

    match errors.take() {
        Some(err) => Err(err),
        None if clean => Ok(()),
        None => Err(ParcError::Cancelled),
    }
}
