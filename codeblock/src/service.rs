// service.rs — Background compile service
//
// Runs compile jobs on worker threads so the caller never blocks on the
// toolchain. At most one job per block is in flight; jobs submitted while
// one is running collapse into a single pending slot where the newest job
// replaces older ones. Finished jobs come back as events that the owner
// applies with `Block::apply_compile_result`, which re-validates them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::block::{Block, BlockId};
use crate::compile::{CompileJob, CompileOutcome};
use crate::toolchain::{Toolchain, ToolchainError};

/// A finished job.
#[derive(Debug)]
pub struct CompileEvent {
    pub job: CompileJob,
    pub outcome: Result<CompileOutcome, ToolchainError>,
}

impl CompileEvent {
    pub fn block_id(&self) -> &BlockId {
        &self.job.block_id
    }

    /// Hand the result to its block. Returns `Ok(false)` if the block moved
    /// on; toolchain failures are passed through untouched.
    pub fn apply_to(self, block: &mut Block) -> Result<bool, ToolchainError> {
        let outcome = self.outcome?;
        Ok(block.apply_compile_result(&self.job, outcome))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Dispatched to a worker.
    Started,
    /// A job for this block is running; this one runs after it.
    Queued,
    /// Replaced a job that was already waiting.
    Coalesced,
}

#[derive(Default)]
struct Slot {
    pending: Option<CompileJob>,
}

struct Shared {
    toolchain: Toolchain,
    /// Blocks with a job in flight.
    slots: Mutex<HashMap<BlockId, Slot>>,
    jobs: Sender<CompileJob>,
    events: Sender<CompileEvent>,
}

pub struct CompileService {
    shared: Option<Arc<Shared>>,
    events: Receiver<CompileEvent>,
    workers: Vec<JoinHandle<()>>,
}

impl CompileService {
    pub fn new(toolchain: Toolchain, worker_threads: usize) -> std::io::Result<Self> {
        let (job_tx, job_rx) = unbounded::<CompileJob>();
        let (event_tx, event_rx) = unbounded::<CompileEvent>();
        let shared = Arc::new(Shared {
            toolchain,
            slots: Mutex::new(HashMap::new()),
            jobs: job_tx,
            events: event_tx,
        });
        let mut workers = Vec::new();
        for idx in 0..worker_threads.max(1) {
            let rx = job_rx.clone();
            let shared = Arc::downgrade(&shared);
            let handle = thread::Builder::new()
                .name(format!("codeblock-compile-{idx}"))
                .spawn(move || worker_loop(rx, shared))?;
            workers.push(handle);
        }
        Ok(CompileService {
            shared: Some(shared),
            events: event_rx,
            workers,
        })
    }

    pub fn submit(&self, job: CompileJob) -> Submitted {
        let Some(shared) = &self.shared else {
            return Submitted::Queued;
        };
        let mut slots = shared.slots.lock();
        match slots.get_mut(&job.block_id) {
            Some(slot) => {
                let replaced = slot.pending.replace(job).is_some();
                if replaced {
                    Submitted::Coalesced
                } else {
                    Submitted::Queued
                }
            }
            None => {
                tracing::debug!(block = %job.block_id, "compile dispatched");
                slots.insert(job.block_id.clone(), Slot::default());
                // Workers only exit once this sender is dropped.
                let _ = shared.jobs.send(job);
                Submitted::Started
            }
        }
    }

    pub fn is_busy(&self, block: &BlockId) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.slots.lock().contains_key(block))
    }

    pub fn events(&self) -> &Receiver<CompileEvent> {
        &self.events
    }

    pub fn try_next(&self) -> Option<CompileEvent> {
        self.events.try_recv().ok()
    }

    pub fn next(&self) -> Option<CompileEvent> {
        self.events.recv().ok()
    }
}

impl Drop for CompileService {
    fn drop(&mut self) {
        // Workers only hold weak references; dropping the last strong one
        // drops the job sender and ends their loops.
        if let Some(shared) = self.shared.take() {
            shared.slots.lock().clear();
            drop(shared);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("compile worker panicked");
            }
        }
    }
}

fn worker_loop(rx: Receiver<CompileJob>, shared: Weak<Shared>) {
    while let Ok(job) = rx.recv() {
        let Some(s) = shared.upgrade() else {
            break;
        };
        let outcome = job.run(&s.toolchain);
        let block_id = job.block_id.clone();

        // Settle the slot before publishing, so an observer that sees the
        // event also sees whether more work is coming.
        let next = {
            let mut slots = s.slots.lock();
            let next = slots.get_mut(&block_id).and_then(|slot| slot.pending.take());
            if next.is_none() {
                slots.remove(&block_id);
            }
            next
        };
        let _ = s.events.send(CompileEvent { job, outcome });
        if let Some(next) = next {
            tracing::debug!(block = %block_id, "running coalesced compile");
            let _ = s.jobs.send(next);
        }
    }
}
