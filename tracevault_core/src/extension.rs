use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::store::TraceStore;

/// Worker-pool sizing. Defaults to the logical CPU count for both bounds,
/// matching the "one helper per processor" model the tracer was designed
/// around.
#[derive(Copy, Clone, Debug)]
pub struct CoordinatorConfig {
    pub min_threads: usize,
    pub max_threads: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map(|x| x.get()).unwrap_or(1);
        Self { min_threads: cpus, max_threads: cpus }
    }
}

enum Work {
    Extend(TraceStore),
    Prefault(TraceStore),
    Shutdown,
}

/// Schedules asynchronous extend and prefault work for stores on a shared,
/// bounded thread pool. Work items are per-store and independent: different
/// stores extend concurrently, while the per-store in-flight flag serializes
/// extends of one store so swaps never race.
///
/// Created once (either by the embedding application or the caller of
/// [crate::api::initialize_trace_context]); dropping it shuts the workers
/// down and joins them.
pub struct ExtensionCoordinator {
    sender: Sender<Work>,
    workers: Vec<JoinHandle<()>>,
}

impl ExtensionCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let threads = config.max_threads.max(config.min_threads).max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Work>();
        let workers = (0..threads)
            .map(|_| {
                let rx = rx.clone();
                std::thread::spawn(move || worker_loop(rx))
            })
            .collect();
        Self { sender: tx, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue extension work for a store unless one is already outstanding.
    pub fn schedule_extend(&self, store: TraceStore) {
        if !store.begin_extend() {
            return;
        }
        debug!(kind = %store.kind(), "extension scheduled");
        if let Err(undelivered) = self.sender.send(Work::Extend(store)) {
            // pool already shut down; release the slot so the writer falls
            // back to dropping instead of waiting forever
            if let Work::Extend(store) = undelivered.into_inner() {
                store.end_extend();
            }
        }
    }

    /// Queue opportunistic page warmup of a store's active mapping.
    pub fn schedule_prefault(&self, store: TraceStore) {
        self.sender.send(Work::Prefault(store)).ok();
    }
}

fn worker_loop(rx: Receiver<Work>) {
    while let Ok(work) = rx.recv() {
        match work {
            Work::Extend(store) => store.perform_extend(),
            Work::Prefault(store) => store.perform_prefault(),
            Work::Shutdown => break,
        }
    }
}

impl Drop for ExtensionCoordinator {
    fn drop(&mut self) {
        for _ in &self.workers {
            self.sender.send(Work::Shutdown).ok();
        }
        for handle in self.workers.drain(..) {
            handle.join().ok();
        }
    }
}
