//! Detection worker pool.
//!
//! `W` worker threads drain one bounded queue of capacity `C` shared by all
//! sources. Submission never blocks:
//! - a queued job for the same source is replaced in place, so a source has
//!   at most one pending job and keeps its position in line;
//! - otherwise, when the queue is full, the oldest job is evicted.
//!
//! Each worker owns its backend instance. Backend errors and panics are
//! counted and logged; the frame is dropped and the worker carries on.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use serde::Serialize;

use crate::error::DetectionError;
use crate::frame::{Frame, PutOutcome};
use crate::lock_or_recover;

use super::backend::DetectorBackend;
use super::registry::BackendFactory;
use super::result::DetectionResult;

/// Receives what the workers compute.
pub trait ResultHandler: Send + Sync {
    /// Whether a result for this frame would still be accepted. Checked
    /// before running the backend so superseded jobs cost nothing.
    fn wants(&self, _source_id: &str, _sequence: u64) -> bool {
        true
    }

    fn handle(&self, result: DetectionResult) -> PutOutcome;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Took the place of a queued job for the same source.
    Replaced,
    /// Queue was full; the oldest job was dropped to make room.
    Evicted,
    /// Pool is shutting down.
    Closed,
}

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub submitted: u64,
    pub replaced: u64,
    pub evicted: u64,
    pub completed: u64,
    pub failed: u64,
    pub stale: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    replaced: AtomicU64,
    evicted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
}

struct Queue {
    jobs: VecDeque<Arc<Frame>>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    capacity: usize,
    counters: Counters,
}

pub struct DetectionPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    backend_name: &'static str,
}

impl DetectionPool {
    /// Build one backend per worker and start the workers.
    ///
    /// Fails if any backend cannot be built; no thread is left running.
    pub fn start(
        config: PoolConfig,
        factory: BackendFactory,
        handler: Arc<dyn ResultHandler>,
    ) -> Result<Self, DetectionError> {
        let worker_count = config.workers.max(1);
        let backends = (0..worker_count)
            .map(|_| factory())
            .collect::<Result<Vec<_>, _>>()?;
        let backend_name = backends.first().map(|b| b.name()).unwrap_or("none");

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::with_capacity(config.queue_capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity: config.queue_capacity.max(1),
            counters: Counters::default(),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for (index, backend) in backends.into_iter().enumerate() {
            let worker_shared = shared.clone();
            let handler = handler.clone();
            let spawned = thread::Builder::new()
                .name(format!("detect-{index}"))
                .spawn(move || worker_loop(index, backend, &worker_shared, handler.as_ref()));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    let pool = Self {
                        shared,
                        workers: Mutex::new(workers),
                        backend_name,
                    };
                    pool.shutdown();
                    return Err(DetectionError::Model(format!("spawn worker: {e}")));
                }
            }
        }

        log::info!(
            "detection pool started: {} worker(s), queue capacity {}, backend {}",
            worker_count,
            shared.capacity,
            backend_name
        );
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            backend_name,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Queue a frame for detection without blocking.
    pub fn submit(&self, frame: Arc<Frame>) -> SubmitOutcome {
        let counters = &self.shared.counters;
        let mut queue = lock_or_recover(&self.shared.queue);
        if queue.closed {
            return SubmitOutcome::Closed;
        }
        counters.submitted.fetch_add(1, Ordering::Relaxed);

        if let Some(slot) = queue
            .jobs
            .iter_mut()
            .find(|job| job.source_id() == frame.source_id())
        {
            log::debug!(
                "source {}: replacing queued frame {} with {}",
                frame.source_id(),
                slot.sequence(),
                frame.sequence()
            );
            *slot = frame;
            counters.replaced.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Replaced;
        }

        let mut outcome = SubmitOutcome::Queued;
        if queue.jobs.len() >= self.shared.capacity {
            if let Some(oldest) = queue.jobs.pop_front() {
                log::debug!(
                    "detection queue full: evicted frame {} of source {}",
                    oldest.sequence(),
                    oldest.source_id()
                );
                counters.evicted.fetch_add(1, Ordering::Relaxed);
                outcome = SubmitOutcome::Evicted;
            }
        }
        queue.jobs.push_back(frame);
        drop(queue);
        self.shared.available.notify_one();
        outcome
    }

    /// Drop queued jobs of a source. Jobs already running finish normally.
    pub fn purge(&self, source_id: &str) -> usize {
        let mut queue = lock_or_recover(&self.shared.queue);
        let before = queue.jobs.len();
        queue.jobs.retain(|job| job.source_id() != source_id);
        before - queue.jobs.len()
    }

    pub fn pending(&self) -> usize {
        lock_or_recover(&self.shared.queue).jobs.len()
    }

    pub fn pending_for(&self, source_id: &str) -> usize {
        lock_or_recover(&self.shared.queue)
            .jobs
            .iter()
            .filter(|job| job.source_id() == source_id)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            replaced: c.replaced.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Stop accepting jobs, drop what is queued and join the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = lock_or_recover(&self.shared.queue);
            if !queue.closed {
                queue.closed = true;
                queue.jobs.clear();
            }
        }
        self.shared.available.notify_all();

        let handles: Vec<_> = lock_or_recover(&self.workers).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("detection worker terminated abnormally");
            }
        }
    }
}

impl Drop for DetectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn next_job(shared: &Shared) -> Option<Arc<Frame>> {
    let mut queue = lock_or_recover(&shared.queue);
    loop {
        if queue.closed {
            return None;
        }
        if let Some(job) = queue.jobs.pop_front() {
            return Some(job);
        }
        queue = shared
            .available
            .wait(queue)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
    }
}

fn worker_loop(
    index: usize,
    mut backend: Box<dyn DetectorBackend>,
    shared: &Shared,
    handler: &dyn ResultHandler,
) {
    if let Err(e) = backend.warm_up() {
        log::warn!("detect-{index}: warm-up failed: {e}");
    }
    let counters = &shared.counters;

    while let Some(frame) = next_job(shared) {
        if !handler.wants(frame.source_id(), frame.sequence()) {
            counters.stale.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| backend.detect(&frame))) {
            Ok(Ok(detections)) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                let result =
                    DetectionResult::new(frame.source_id(), frame.sequence(), detections);
                if handler.handle(result) != PutOutcome::Applied {
                    counters.stale.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "detect-{index}: source {} frame {} dropped: {e}",
                    frame.source_id(),
                    frame.sequence()
                );
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "detect-{index}: backend {} panicked on source {} frame {}",
                    backend.name(),
                    frame.source_id(),
                    frame.sequence()
                );
            }
        }
    }
    log::debug!("detect-{index}: stopped");
}
