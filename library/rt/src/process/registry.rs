//! Registered names: atom → pid.
//!
//! A process may hold at most one name, and a name maps to at most one
//! live process. Names are released automatically at termination.

use dashmap::DashMap;
use lazy_static::lazy_static;

use crate::process::{table, Process, ProcessId};
use crate::term::Atom;

lazy_static! {
    static ref REGISTERED: DashMap<Atom, ProcessId> = DashMap::new();
}

/// Registers `process` under `name`. Fails if the name is taken or the
/// process already has one.
pub fn register(name: Atom, process: &Process) -> bool {
    let mut own = process.registered_name.lock();
    if own.is_some() {
        return false;
    }
    let entry = REGISTERED.entry(name);
    match entry {
        dashmap::mapref::entry::Entry::Occupied(_) => false,
        dashmap::mapref::entry::Entry::Vacant(vacant) => {
            vacant.insert(process.pid());
            *own = Some(name);
            true
        }
    }
}

pub fn unregister(name: Atom) -> bool {
    match REGISTERED.remove(&name) {
        Some((_, pid)) => {
            if let Some(process) = table::lookup(pid) {
                *process.registered_name.lock() = None;
            }
            true
        }
        None => false,
    }
}

pub fn whereis(name: Atom) -> Option<ProcessId> {
    let pid = *REGISTERED.get(&name)?;
    // The name may outlive the process briefly during termination
    table::lookup(pid).map(|p| p.pid())
}

/// All currently registered names.
pub fn names() -> Vec<Atom> {
    REGISTERED.iter().map(|entry| *entry.key()).collect()
}

/// Termination hook: releases the name held by `process`, if any.
pub fn unregister_owned(process: &Process) {
    let mut own = process.registered_name.lock();
    if let Some(name) = own.take() {
        REGISTERED.remove_if(&name, |_, pid| *pid == process.pid());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::heap::DEFAULT_HEAP_WORDS;
    use crate::process::Priority;
    use crate::term::atoms;

    fn live_process() -> Arc<Process> {
        let pid = table::allocate_pid().unwrap();
        let process = Arc::new(Process::new(
            pid,
            None,
            Priority::Normal,
            DEFAULT_HEAP_WORDS,
            65535,
            pid,
            (atoms::UNDEFINED, atoms::UNDEFINED, 0),
        ));
        table::insert(process.clone());
        process
    }

    #[test]
    fn one_name_per_process_and_per_name() {
        let a = live_process();
        let b = live_process();
        let name = Atom::intern("registry_test_primary").unwrap();
        let other = Atom::intern("registry_test_secondary").unwrap();

        assert!(register(name, &a));
        assert_eq!(whereis(name), Some(a.pid()));
        // The name is taken, and a named process cannot take another
        assert!(!register(name, &b));
        assert!(!register(other, &a));

        assert!(unregister(name));
        assert_eq!(whereis(name), None);
        assert!(a.registered_name().is_none());

        table::remove(a.pid());
        table::remove(b.pid());
    }

    #[test]
    fn termination_releases_the_name() {
        let p = live_process();
        let name = Atom::intern("registry_test_dying").unwrap();
        assert!(register(name, &p));

        unregister_owned(&p);
        assert_eq!(whereis(name), None);
        // A successor may take the name immediately
        let q = live_process();
        assert!(register(name, &q));
        unregister_owned(&q);
        table::remove(p.pid());
        table::remove(q.pid());
    }
}
