//! The `pipeline` module implements the Ordered Parallel Pipeline: an
//! order-preserving, multi-threaded application of a pure streaming
//! transform `F` over a stream of inputs.
//!
//! `F` is instantiated exactly once per worker thread (so a `LineDecoder`'s
//! table precomputation and scratch buffers amortize across every line that
//! worker ever handles) and is otherwise just `FnMut(T) -> R`. Workers share
//! no mutable state; the only coordination is a bounded work queue and a
//! bounded result queue, both realized as `crossbeam_channel`s.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::config::Config;
use crate::decoder::{Diagnostics, LineDecoder};
use crate::errors;
use crate::finders::Finder;
use crate::signal::PACKET_LEN;

/// Upper bound on in-flight items: how far the coordinator lets the work
/// queue run ahead of the result queue before it stops refilling.
const PREFETCH: usize = 32;

/// How long the coordinator waits on the result queue before checking
/// whether a worker has stopped unexpectedly.
const RESULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// How long `Pipeline::new` waits for each worker's readiness handshake
/// before treating worker start as failed.
const WORKER_START_TIMEOUT: Duration = Duration::from_secs(1);

/// Order-preserving parallel map: feeds an input iterator through `P`
/// worker threads (or, when `P == 1`, a degenerate in-process path) and
/// yields outputs in the same order the inputs arrived, regardless of which
/// worker actually produced which output or how long each one took.
///
/// Dropping a `Pipeline` before its input is exhausted tears down the
/// workers the same way running it to completion would: the work channel
/// is closed, the quit flag is raised, and every worker thread is joined.
pub struct Pipeline<T, R> {
    mode: Mode<T, R>,
}

enum Mode<T, R> {
    Single(SingleProcess<T, R>),
    Threaded(ThreadedPipeline<T, R>),
}

impl<T, R> Pipeline<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Runs `input` through `workers` copies of the transform produced by
    /// `make_worker`, one call per worker. `make_worker` itself must be
    /// `Fn` (not `FnOnce`) because the pipeline may need to retry worker
    /// startup; the `W` it returns is the actual `FnMut(T) -> R` driven
    /// per-item.
    ///
    /// `workers == 1` takes the single-process path: no threads, no
    /// channels, `F` instantiated once in the caller.
    pub fn new<I, F, W>(workers: usize, input: I, make_worker: F) -> crate::Result<Pipeline<T, R>>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        F: Fn() -> W + Send + Sync + 'static,
        W: FnMut(T) -> R + Send + 'static,
    {
        assert!(workers >= 1, "pipeline requires at least one worker");

        if workers == 1 {
            return Ok(Pipeline {
                mode: Mode::Single(SingleProcess {
                    input: Box::new(input.into_iter()),
                    worker: Box::new(make_worker()),
                }),
            });
        }

        Ok(Pipeline {
            mode: Mode::Threaded(ThreadedPipeline::start(workers, input.into_iter(), make_worker)?),
        })
    }

    /// Pulls the next output, or `None` once the input is exhausted and
    /// every in-flight item has been drained. A fatal pipeline condition
    /// (only possible in the multi-threaded path) surfaces as `Err` here
    /// rather than via `Iterator`'s infallible `Item`.
    pub fn next_result(&mut self) -> crate::Result<Option<R>> {
        match &mut self.mode {
            Mode::Single(single) => Ok(single.next()),
            Mode::Threaded(threaded) => threaded.next(),
        }
    }
}

/// Iterator adapter over `next_result`, for callers that are content to
/// `panic!` (or otherwise abort) on a fatal pipeline error rather than
/// threading a `Result` through their own loop. `next_result` remains the
/// primitive; this just matches the ergonomics `for packet in pipeline`
/// calls for.
impl<T, R> Iterator for Pipeline<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    type Item = crate::Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_result() {
            Ok(Some(r)) => Some(Ok(r)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
fn collect_ok<T, R>(mut pipeline: Pipeline<T, R>) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    let mut out = Vec::new();
    while let Some(r) = pipeline.next_result().expect("pipeline error") {
        out.push(r);
    }
    out
}

#[test]
fn test_new_single_process_mode_applies_function_in_order() {
    let pipeline = Pipeline::new(1, 0..10, || |x: i32| x * 2).unwrap();
    let out = collect_ok(pipeline);
    assert_eq!(out, (0..10).map(|x| x * 2).collect::<Vec<_>>());
}

#[test]
fn test_new_threaded_mode_preserves_input_order() {
    let input: Vec<i32> = (0..2000).collect();
    let pipeline = Pipeline::new(4, input.clone(), || {
        let mut calls = 0u32;
        move |x: i32| {
            calls += 1;
            // Vary per-item latency so workers genuinely race.
            let spins = (x % 7) as u32 * 37 + calls % 5;
            let mut acc = 0u64;
            for i in 0..spins {
                acc = acc.wrapping_add(i as u64);
            }
            std::hint::black_box(acc);
            x
        }
    })
    .unwrap();

    let out = collect_ok(pipeline);
    assert_eq!(out, input);
}

#[test]
fn test_new_threaded_mode_matches_single_process_output() {
    let input: Vec<i32> = (0..500).collect();

    let single = Pipeline::new(1, input.clone(), || |x: i32| x.wrapping_mul(31).wrapping_add(7)).unwrap();
    let threaded = Pipeline::new(5, input, || |x: i32| x.wrapping_mul(31).wrapping_add(7)).unwrap();

    assert_eq!(collect_ok(single), collect_ok(threaded));
}

#[test]
fn test_new_worker_factory_runs_exactly_once_per_worker() {
    use std::sync::atomic::AtomicUsize;

    static SETUP_CALLS: AtomicUsize = AtomicUsize::new(0);
    SETUP_CALLS.store(0, Ordering::SeqCst);

    let input: Vec<i32> = (0..300).collect();
    let pipeline = Pipeline::new(8, input, || {
        SETUP_CALLS.fetch_add(1, Ordering::SeqCst);
        |x: i32| x
    })
    .unwrap();

    let _ = collect_ok(pipeline);
    assert_eq!(SETUP_CALLS.load(Ordering::SeqCst), 8);
}

#[test]
fn test_new_in_flight_work_never_exceeds_prefetch_window() {
    use std::sync::atomic::AtomicUsize;

    static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
    static MAX_SEEN: AtomicUsize = AtomicUsize::new(0);
    IN_FLIGHT.store(0, Ordering::SeqCst);
    MAX_SEEN.store(0, Ordering::SeqCst);

    let input: Vec<i32> = (0..600).collect();
    let pipeline = Pipeline::new(6, input, || {
        |x: i32| {
            let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
            MAX_SEEN.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(50));
            IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
            x
        }
    })
    .unwrap();

    let _ = collect_ok(pipeline);
    assert!(MAX_SEEN.load(Ordering::SeqCst) <= PREFETCH);
}

#[test]
fn test_new_empty_input_yields_no_output() {
    let pipeline = Pipeline::new(3, Vec::<i32>::new(), || |x: i32| x).unwrap();
    assert_eq!(collect_ok(pipeline), Vec::<i32>::new());
}

#[test]
fn test_new_a_worker_panic_surfaces_as_child_stopped() {
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));

    // A stream long enough that the panicking worker's death is
    // observed well before the input is exhausted.
    let input: Vec<i32> = (0..5000).collect();
    let mut pipeline = Pipeline::new(3, input, || {
        |x: i32| {
            if x == 17 {
                panic!("simulated worker death");
            }
            thread::sleep(Duration::from_micros(200));
            x
        }
    })
    .unwrap();

    let mut saw_error = false;
    loop {
        match pipeline.next_result() {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(crate::Error::ChildStopped) => {
                saw_error = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    std::panic::set_hook(previous_hook);
    assert!(saw_error, "expected a ChildStopped error after a worker panicked");
}

/// The `P == 1` degenerate mode: no threads, no queues, `F` called directly
/// from the consuming thread.
struct SingleProcess<T, R> {
    input: Box<dyn Iterator<Item = T> + Send>,
    worker: Box<dyn FnMut(T) -> R + Send>,
}

impl<T, R> SingleProcess<T, R> {
    fn next(&mut self) -> Option<R> {
        let item = self.input.next()?;
        Some((self.worker)(item))
    }
}

/// The `P >= 2` mode. No separate dispatcher thread is spawned; the
/// coordinator is whichever thread calls `next()`, which doubles as the
/// pull-based backpressure mechanism: one input is sent for every result
/// received, so at most `PREFETCH` items are ever in flight.
struct ThreadedPipeline<T, R> {
    input: Box<dyn Iterator<Item = T> + Send>,
    work_tx: Sender<(u64, T)>,
    result_rx: Receiver<(u64, R)>,
    quit: Arc<AtomicBool>,
    stopped: Vec<Arc<AtomicBool>>,
    handles: Vec<thread::JoinHandle<()>>,

    next_seq_in: u64,
    next_seq_out: u64,
    in_flight: usize,
    input_exhausted: bool,
    pending: BTreeMap<u64, R>,
}

/// Sets `stopped` on drop unconditionally, including on an unwinding panic,
/// so a worker that dies mid-item is still observed as stopped rather than
/// leaving the coordinator waiting forever.
struct StoppedGuard(Arc<AtomicBool>);

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl<T, R> ThreadedPipeline<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn start<I, F, W>(workers: usize, input: I, make_worker: F) -> crate::Result<ThreadedPipeline<T, R>>
    where
        I: Iterator<Item = T> + Send + 'static,
        F: Fn() -> W + Send + Sync + 'static,
        W: FnMut(T) -> R + Send + 'static,
    {
        let (work_tx, work_rx) = bounded::<(u64, T)>(PREFETCH);
        let (result_tx, result_rx) = bounded::<(u64, R)>(PREFETCH);
        let quit = Arc::new(AtomicBool::new(false));
        let factory = Arc::new(make_worker);

        let mut handles = Vec::with_capacity(workers);
        let mut stopped = Vec::with_capacity(workers);
        let mut ready_rxs = Vec::with_capacity(workers);

        for id in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let factory = Arc::clone(&factory);
            let worker_stopped = Arc::new(AtomicBool::new(false));
            stopped.push(Arc::clone(&worker_stopped));

            let (ready_tx, ready_rx) = bounded::<()>(1);
            ready_rxs.push(ready_rx);

            let spawned = thread::Builder::new()
                .name(format!("vbi-decoder-{id}"))
                .spawn(move || {
                    let _guard = StoppedGuard(worker_stopped);
                    let mut f = factory();
                    let _ = ready_tx.send(());
                    tracing::info!(worker = id, "decoder worker started");

                    loop {
                        match work_rx.recv() {
                            Ok((n, item)) => {
                                let out = f(item);
                                if result_tx.send((n, out)).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }

                    tracing::info!(worker = id, "decoder worker stopped");
                });

            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(worker = id, error = %e, "failed to spawn decoder worker thread");
                    quit.store(true, Ordering::SeqCst);
                    drop(work_tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return errors::worker_start_timeout();
                }
            };
            handles.push(handle);
        }

        // Readiness handshake: every worker must report in within the
        // startup deadline, or the whole pipeline fails to start.
        for (id, ready_rx) in ready_rxs.into_iter().enumerate() {
            if ready_rx.recv_timeout(WORKER_START_TIMEOUT).is_err() {
                tracing::warn!(worker = id, "decoder worker did not start in time");
                quit.store(true, Ordering::SeqCst);
                drop(work_tx);
                for handle in handles {
                    let _ = handle.join();
                }
                return errors::worker_start_timeout();
            }
        }

        Ok(ThreadedPipeline {
            input: Box::new(input),
            work_tx,
            result_rx,
            quit,
            stopped,
            handles,
            next_seq_in: 0,
            next_seq_out: 0,
            in_flight: 0,
            input_exhausted: false,
            pending: BTreeMap::new(),
        })
    }

    /// Tops up the work queue up to `PREFETCH` in-flight items.
    fn refill(&mut self) {
        while self.in_flight < PREFETCH && !self.input_exhausted {
            match self.input.next() {
                Some(item) => {
                    let n = self.next_seq_in;
                    self.next_seq_in += 1;
                    if self.work_tx.send((n, item)).is_err() {
                        // A worker channel dying mid-send means every
                        // worker has already stopped; the next recv below
                        // will observe that and raise ChildStopped.
                        self.input_exhausted = true;
                        break;
                    }
                    self.in_flight += 1;
                }
                None => self.input_exhausted = true,
            }
        }
    }

    fn any_worker_unexpectedly_stopped(&self) -> bool {
        !self.quit.load(Ordering::SeqCst) && self.stopped.iter().any(|s| s.load(Ordering::SeqCst))
    }

    fn next(&mut self) -> crate::Result<Option<R>> {
        loop {
            if let Some(&n) = self.pending.keys().next() {
                if n == self.next_seq_out {
                    let out = self.pending.remove(&n).expect("just peeked this key");
                    self.next_seq_out += 1;
                    return Ok(Some(out));
                }
            }

            if self.any_worker_unexpectedly_stopped() {
                return errors::child_stopped();
            }

            self.refill();

            if self.input_exhausted && self.in_flight == 0 && self.pending.is_empty() {
                return Ok(None);
            }

            if self.any_worker_unexpectedly_stopped() {
                return errors::child_stopped();
            }

            match self.result_rx.recv_timeout(RESULT_POLL_TIMEOUT) {
                Ok((n, out)) => {
                    self.in_flight -= 1;
                    self.pending.insert(n, out);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.any_worker_unexpectedly_stopped() {
                        return errors::child_stopped();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return errors::child_stopped();
                }
            }
        }
    }
}

impl<T, R> Drop for ThreadedPipeline<T, R> {
    /// Teardown: raise the quit flag, drop the
    /// sending half of the work channel so blocked `recv`s wake with an
    /// error, then join every worker. Runs on every exit path — including
    /// an iterator that's dropped without being driven to completion, or
    /// one that's abandoned after a `ChildStopped` error.
    fn drop(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
        // Replace work_tx with a disconnected sender so the real one
        // drops, closing the channel workers are blocked on.
        let (dummy_tx, _dummy_rx) = bounded::<(u64, T)>(0);
        let real_tx = std::mem::replace(&mut self.work_tx, dummy_tx);
        drop(real_tx);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Convenience constructor that wires a [`Pipeline`] directly to
/// [`LineDecoder`]: each worker gets its own `LineDecoder` (built once, per
/// the "expensive per-worker setup" contract) driven by its own fresh set
/// of [`Finder`]s. `make_finders` is called once per worker for the same
/// reason `make_worker` is in [`Pipeline::new`] — finders carry per-line
/// mutable state (`HeaderFinder::matched`) and must not be shared.
pub fn decode_lines<I>(
    config: Config,
    make_finders: impl Fn() -> Vec<Box<dyn Finder>> + Send + Sync + 'static,
    input: I,
) -> crate::Result<Pipeline<Vec<f64>, ([u8; PACKET_LEN], Diagnostics)>>
where
    I: IntoIterator<Item = Vec<f64>>,
    I::IntoIter: Send + 'static,
{
    let workers = config.workers;
    Pipeline::new(workers, input, move || {
        let mut decoder = LineDecoder::new(config, make_finders());
        move |samples: Vec<f64>| decoder.decode(&samples)
    })
}

#[test]
fn test_decode_lines_recovers_known_payload_through_the_pipeline() {
    use crate::finders::HeaderFinder;
    use crate::signal;
    use crate::synth::render_line;

    let mut payload = [0x41u8; PACKET_LEN];
    payload[0] = *signal::hamm_bytes().first().unwrap();
    payload[1] = *signal::hamm_bytes().last().unwrap();
    for b in payload.iter_mut().skip(2) {
        *b = *signal::parity_bytes()
            .iter()
            .min_by_key(|&&p| (p as i16 - 0x41).abs())
            .unwrap();
    }
    let samples = render_line(&payload, 5.112, 100.0, signal::N_SAMPLES);

    let lines = vec![samples.clone(), samples];
    let pipeline = decode_lines(
        Config::bt8x8().with_workers(2),
        || vec![Box::new(HeaderFinder::bbc1()) as Box<dyn Finder>],
        lines,
    )
    .unwrap();

    let results = collect_ok(pipeline);
    assert_eq!(results.len(), 2);
    for (packet, diagnostics) in results {
        assert_eq!(packet, payload);
        assert!(diagnostics.alignment_ok);
    }
}
