//! Worker table
//!
//! Bookkeeping for in-flight session workers, parallel to the session
//! registry but behind its own lock: shutdown must be able to snapshot
//! the table even while a worker holds the registry lock. A slot is
//! occupied exactly while its session task runs, so occupancy doubles as
//! the active-session count for admission control.
//!
//! Only the acceptor inserts. It probes from a rotating cursor and reaps
//! slots whose task has already finished.

use crate::registry::MAX_SESSIONS;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;

/// One in-flight session: its worker identity and task handle.
#[derive(Debug)]
pub struct WorkerSlot {
    pub id: u64,
    pub handle: JoinHandle<()>,
}

/// Fixed-size table of in-flight session handles.
#[derive(Debug, Default)]
pub struct WorkerTable {
    slots: Mutex<[Option<WorkerSlot>; MAX_SESSIONS]>,
    cursor: AtomicUsize,
}

impl WorkerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a free slot, probing from the rotating cursor. Reaps slots
    /// whose worker already finished. `None` while the table is full of
    /// live workers.
    pub fn free_slot(&self) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        for offset in 0..MAX_SESSIONS {
            let index = (start + offset) % MAX_SESSIONS;
            match &slots[index] {
                None => return Some(index),
                Some(worker) if worker.handle.is_finished() => {
                    slots[index] = None;
                    return Some(index);
                }
                Some(_) => {}
            }
        }
        None
    }

    /// Record a freshly spawned worker in a slot returned by
    /// [`Self::free_slot`].
    pub fn install(&self, slot: usize, worker: WorkerSlot) {
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        debug_assert!(slots[slot].as_ref().is_none_or(|w| w.handle.is_finished()));
        slots[slot] = Some(worker);
    }

    /// How many workers are still running.
    pub fn occupied(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slots
            .iter()
            .flatten()
            .filter(|worker| !worker.handle.is_finished())
            .count()
    }

    /// Take every recorded worker out of the table for the shutdown join.
    pub fn drain(&self) -> Vec<WorkerSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.iter_mut().filter_map(Option::take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parked_worker(id: u64) -> WorkerSlot {
        WorkerSlot {
            id,
            handle: tokio::spawn(std::future::pending()),
        }
    }

    #[tokio::test]
    async fn slots_fill_up_to_capacity() {
        let table = WorkerTable::new();
        for id in 0..MAX_SESSIONS as u64 {
            let slot = table.free_slot().expect("a slot should be free");
            table.install(slot, parked_worker(id));
        }
        assert_eq!(table.occupied(), MAX_SESSIONS);
        assert!(table.free_slot().is_none());

        for worker in table.drain() {
            worker.handle.abort();
        }
    }

    #[tokio::test]
    async fn finished_workers_are_reaped() {
        let table = WorkerTable::new();
        let handle = tokio::spawn(async {});
        handle.abort();
        // Wait for the task to actually finish.
        tokio::task::yield_now().await;

        let slot = table.free_slot().unwrap();
        table.install(slot, WorkerSlot { id: 1, handle });

        // A dead worker neither counts as active nor blocks its slot.
        while table.occupied() != 0 {
            tokio::task::yield_now().await;
        }
        assert!(table.free_slot().is_some());
    }

    #[tokio::test]
    async fn drain_empties_the_table() {
        let table = WorkerTable::new();
        for id in 0..3 {
            let slot = table.free_slot().unwrap();
            table.install(slot, parked_worker(id));
        }

        let drained = table.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(table.occupied(), 0);
        for worker in drained {
            worker.handle.abort();
        }
    }
}
