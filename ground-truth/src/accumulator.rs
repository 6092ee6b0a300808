//! Per-worker collection of executed instruction offsets.
//!
//! Every execution worker (a QEMU vCPU) owns one [`WorkerSet`]. Only the owner inserts into
//! it, so its lock is never contended while the guest runs. The sets are unioned into a
//! single ordered table by [`Accumulator::merge`] once all workers have stopped.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use hashbrown::HashMap;

use crate::{InstructionOffset, InstructionTable};

#[derive(Debug, Default)]
pub struct WorkerSet {
    offsets: Mutex<HashMap<i64, u8>>,
}

impl WorkerSet {
    /// Records one executed instruction. Repeated offsets keep the first length seen.
    ///
    /// The lock is taken on every call. It is only contended when QEMU reuses a vCPU index on
    /// another thread, or when [`Accumulator::merge`] drains the set.
    #[inline]
    pub fn insert(&self, insn: InstructionOffset) {
        let mut offsets = self.offsets.lock().unwrap_or_else(PoisonError::into_inner);
        offsets.entry(insn.offset).or_insert(insn.length);
    }

    pub fn len(&self) -> usize {
        self.offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain_into(&self, table: &mut InstructionTable) {
        let mut offsets = self.offsets.lock().unwrap_or_else(PoisonError::into_inner);
        for (offset, length) in offsets.drain() {
            table.entry(offset).or_insert(length);
        }
    }
}

/// Growable table of worker sets indexed by worker id.
#[derive(Debug, Default)]
pub struct Accumulator {
    workers: RwLock<Vec<Option<Arc<WorkerSet>>>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the set owned by `worker`, creating it (and growing the table) on first use.
    pub fn register(&self, worker: usize) -> Arc<WorkerSet> {
        if let Some(Some(set)) = self
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker)
        {
            return Arc::clone(set);
        }

        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        if workers.len() <= worker {
            workers.resize_with(worker + 1, || None);
        }
        let set = workers[worker].get_or_insert_with(|| {
            tracing::debug!(worker = worker, "registered capture worker");
            Arc::new(WorkerSet::default())
        });
        Arc::clone(set)
    }

    pub fn record(&self, worker: usize, insn: InstructionOffset) {
        self.register(worker).insert(insn);
    }

    pub fn workers(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .count()
    }

    /// Unions every worker set into one table, visiting workers in id order.
    ///
    /// Must only be called after all workers have quiesced. The worker sets are left empty.
    pub fn merge(&self) -> InstructionTable {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        let mut table = InstructionTable::new();
        for set in workers.iter().flatten() {
            set.drain_into(&mut table);
        }
        tracing::debug!(workers = workers.len(), instructions = table.len(), "merged worker sets");
        table
    }
}
