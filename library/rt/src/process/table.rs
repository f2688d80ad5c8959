//! The global process table: pid → process.
//!
//! Numbers index a bounded slot space; lookups go through a concurrent map
//! keyed by number and re-check the serial so a stale pid never resolves.
//! Freed numbers pass through a FIFO free list before reuse and come back
//! with a bumped serial, giving the ABA grace window the pid contract
//! requires.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::process::{Process, ProcessId};

pub const DEFAULT_MAX_PROCESSES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("process limit reached (system_limit)")]
    SystemLimit,
}

struct ProcessTable {
    slots: DashMap<u32, Arc<Process>>,
    /// number → serial to assign at next reuse
    serials: Mutex<HashMap<u32, u32>>,
    free: Mutex<VecDeque<u32>>,
    next_fresh: AtomicU32,
    limit: AtomicUsize,
    live: AtomicUsize,
}

lazy_static! {
    static ref TABLE: ProcessTable = ProcessTable {
        slots: DashMap::new(),
        serials: Mutex::new(HashMap::new()),
        free: Mutex::new(VecDeque::new()),
        next_fresh: AtomicU32::new(0),
        limit: AtomicUsize::new(DEFAULT_MAX_PROCESSES),
        live: AtomicUsize::new(0),
    };
}

/// Applies the configured `max_processes`; runtime initialization only.
pub fn set_limit(limit: usize) {
    TABLE.limit.store(limit.max(1), Ordering::Relaxed);
}

/// Reserves a pid for a process about to be spawned.
pub fn allocate_pid() -> Result<ProcessId, TableError> {
    if TABLE.live.load(Ordering::Relaxed) >= TABLE.limit.load(Ordering::Relaxed) {
        return Err(TableError::SystemLimit);
    }
    if let Some(number) = TABLE.free.lock().pop_front() {
        let serial = *TABLE.serials.lock().get(&number).unwrap_or(&0);
        return Ok(ProcessId::new(number, serial));
    }
    let number = TABLE.next_fresh.fetch_add(1, Ordering::Relaxed);
    if number > ProcessId::NUMBER_MAX {
        return Err(TableError::SystemLimit);
    }
    Ok(ProcessId::new(number, 0))
}

/// Publishes a spawned process under its allocated pid.
pub fn insert(process: Arc<Process>) {
    let pid = process.pid();
    let prior = TABLE.slots.insert(pid.number(), process);
    debug_assert!(prior.is_none(), "slot {} was still occupied", pid.number());
    TABLE.live.fetch_add(1, Ordering::Relaxed);
}

/// Dereferences a live pid in O(1). A pid whose slot was reused (serial
/// mismatch) or freed resolves to `None`.
pub fn lookup(pid: ProcessId) -> Option<Arc<Process>> {
    let entry = TABLE.slots.get(&pid.number())?;
    if entry.value().pid() == pid {
        Some(entry.value().clone())
    } else {
        None
    }
}

/// Unlinks a terminated process from its slot, bumping the slot serial and
/// recycling the number through the free list.
pub fn remove(pid: ProcessId) -> Option<Arc<Process>> {
    let (number, removed) = TABLE
        .slots
        .remove_if(&pid.number(), |_, process| process.pid() == pid)?;
    TABLE.live.fetch_sub(1, Ordering::Relaxed);
    TABLE
        .serials
        .lock()
        .insert(number, pid.serial().wrapping_add(1));
    TABLE.free.lock().push_back(number);
    Some(removed)
}

/// Number of live processes.
pub fn len() -> usize {
    TABLE.live.load(Ordering::Relaxed)
}

/// Snapshot of every live process, for sweeps (purge votes, shutdown,
/// crash dumps).
pub fn snapshot() -> Vec<Arc<Process>> {
    TABLE.slots.iter().map(|entry| entry.value().clone()).collect()
}
