use crossbeam_utils::atomic::AtomicCell;
use smol::channel::{self, Receiver, Sender};
use smol::LocalExecutor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::cache::MetaCache;
use crate::stream::Stream;

pub enum Command {
    Stop,
    Load(Box<Stream>),
    Zero,
}

/// Per-worker counters. Streams update them from the worker thread; the
/// engine reads them without locking (single writer, relaxed readers).
pub struct WorkerStats {
    pub load: AtomicUsize,
    pub data_total: AtomicU64,
    pub data_pivot: AtomicCell<Instant>,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub delay_sum: AtomicCell<f64>,
    pub delay_count: AtomicCell<f64>,
    pub delay_average: AtomicCell<f64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        WorkerStats {
            load: AtomicUsize::new(0),
            data_total: AtomicU64::new(0),
            data_pivot: AtomicCell::new(Instant::now()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            delay_sum: AtomicCell::new(0.0),
            delay_count: AtomicCell::new(0.0),
            delay_average: AtomicCell::new(0.0),
        }
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_data(&self, bytes: u64) {
        self.data_total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// One sample of the delay statistic: how far the play head moved
    /// while the sender was still behind its previous target. The sums
    /// restart before they can lose precision.
    pub fn delay_point(&self, lagging: bool, delta: f64) {
        if self.delay_count.load() >= 1e9 {
            self.delay_sum.store(0.0);
            self.delay_count.store(0.0);
        }
        if lagging {
            self.delay_sum.store(self.delay_sum.load() + delta);
        }
        let count = self.delay_count.load() + 1.0;
        self.delay_count.store(count);
        self.delay_average.store(self.delay_sum.load() / count);
    }

    pub fn zero_delays(&self) {
        self.delay_sum.store(0.0);
        self.delay_count.store(0.0);
        self.delay_average.store(0.0);
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        WorkerStats::new()
    }
}

/// One streaming worker: an OS thread running a single-threaded executor
/// that owns every stream handed to it. Commands arrive over an async
/// channel; `Stop` ends the loop and drops whatever is still in flight.
pub struct Worker {
    pub id: usize,
    pub stats: Arc<WorkerStats>,
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(id: usize, cache: Option<Arc<MetaCache>>) -> Worker {
        let (tx, rx) = channel::unbounded();
        let stats = Arc::new(WorkerStats::new());
        let thread_stats = stats.clone();
        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || run(id, rx, thread_stats, cache))
            .expect("failed to spawn worker thread");
        Worker {
            id,
            stats,
            tx,
            thread: Some(thread),
        }
    }

    /// Hands a stream over; the worker owns it for the rest of its life.
    /// On a closed queue the stream comes back to the caller.
    pub fn enqueue(&self, stream: Box<Stream>) -> Result<(), Box<Stream>> {
        self.tx
            .try_send(Command::Load(stream))
            .map_err(|e| match e.into_inner() {
                Command::Load(stream) => stream,
                _ => unreachable!(),
            })
    }

    pub fn zero(&self) {
        let _ = self.tx.try_send(Command::Zero);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.tx.try_send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Worker {} panicked during shutdown!", self.id);
            }
        }
    }
}

fn run(id: usize, rx: Receiver<Command>, stats: Arc<WorkerStats>, cache: Option<Arc<MetaCache>>) {
    let executor = LocalExecutor::new();
    smol::block_on(executor.run(async {
        log::debug!("[worker {}] up", id);
        loop {
            match rx.recv().await {
                Ok(Command::Load(stream)) => {
                    executor
                        .spawn(stream.run(cache.clone(), stats.clone()))
                        .detach();
                }
                Ok(Command::Zero) => stats.zero_delays(),
                Ok(Command::Stop) | Err(_) => break,
            }
        }
        log::debug!("[worker {}] down", id);
    }));
}
