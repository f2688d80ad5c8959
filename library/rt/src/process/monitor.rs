//! Link and monitor bookkeeping.
//!
//! Every cross-process relationship is held as identifiers in the local
//! sets of both endpoints; there are no pointers between processes.
//! Links are symmetric (both sides record the peer); monitors are one-way
//! (the watcher records the target, the target records the watcher), keyed
//! by the unique reference returned to the watcher.

use hashbrown::{HashMap, HashSet};

use crate::process::ProcessId;

#[derive(Debug, Default)]
pub struct LinkSet {
    peers: HashSet<ProcessId>,
}

impl LinkSet {
    pub fn insert(&mut self, peer: ProcessId) -> bool {
        self.peers.insert(peer)
    }

    pub fn remove(&mut self, peer: &ProcessId) -> bool {
        self.peers.remove(peer)
    }

    pub fn contains(&self, peer: &ProcessId) -> bool {
        self.peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessId> {
        self.peers.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ProcessId> + '_ {
        self.peers.drain()
    }
}

/// Monitors held by this process over others (`ref → target`), and
/// monitors others hold over this process (`ref → watcher`).
#[derive(Debug, Default)]
pub struct MonitorSet {
    pub outgoing: HashMap<u64, ProcessId>,
    pub incoming: HashMap<u64, ProcessId>,
}

impl MonitorSet {
    pub fn watch(&mut self, reference: u64, target: ProcessId) {
        self.outgoing.insert(reference, target);
    }

    pub fn unwatch(&mut self, reference: u64) -> Option<ProcessId> {
        self.outgoing.remove(&reference)
    }

    pub fn watched_by(&mut self, reference: u64, watcher: ProcessId) {
        self.incoming.insert(reference, watcher);
    }

    pub fn unwatched_by(&mut self, reference: u64) -> Option<ProcessId> {
        self.incoming.remove(&reference)
    }
}
