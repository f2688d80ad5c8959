//! The global atom table.
//!
//! Atoms are interned once and never reclaimed; the table is append-only and
//! bounded. Lookups by id take a read lock on the name vector; the strings
//! themselves are leaked so `&'static str` handles stay valid for the life
//! of the runtime.

use core::fmt;

use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_ATOM_TABLE_SIZE: usize = 8192;

/// Atoms interned at table construction, in this exact order, so their ids
/// are compile-time constants.
const SEED: &[&str] = &[
    "false",
    "true",
    "undefined",
    "ok",
    "error",
    "throw",
    "exit",
    "normal",
    "kill",
    "killed",
    "shutdown",
    "badarg",
    "badarith",
    "system_limit",
    "not_supported",
    "function_clause",
    "badfun",
    "badarity",
    "badmap",
    "badkey",
    "badmatch",
    "case_clause",
    "if_clause",
    "undef",
    "nocatch",
    "infinity",
    "EXIT",
    "DOWN",
    "process",
    "native_fault",
    "panic",
    "thread_died",
    "trap_exit",
    "low",
    "high",
    "max",
    "timeout_value",
    "noproc",
    "busy",
    "runnable",
    "running",
    "waiting",
    "exiting",
    "suspended",
    "message_queue_len",
    "registered_name",
    "links",
    "monitors",
    "status",
    "heap_size",
    "total_heap_size",
    "reductions",
    "priority",
    "group_leader",
    "flush",
    "monitor",
    "demonitor",
    "link",
    "unlink",
    "nonode@nohost",
];

/// Well-known atoms. Ids match their position in `SEED`.
pub mod atoms {
    use super::Atom;

    pub const FALSE: Atom = Atom(0);
    pub const TRUE: Atom = Atom(1);
    pub const UNDEFINED: Atom = Atom(2);
    pub const OK: Atom = Atom(3);
    pub const ERROR: Atom = Atom(4);
    pub const THROW: Atom = Atom(5);
    pub const EXIT: Atom = Atom(6);
    pub const NORMAL: Atom = Atom(7);
    pub const KILL: Atom = Atom(8);
    pub const KILLED: Atom = Atom(9);
    pub const SHUTDOWN: Atom = Atom(10);
    pub const BADARG: Atom = Atom(11);
    pub const BADARITH: Atom = Atom(12);
    pub const SYSTEM_LIMIT: Atom = Atom(13);
    pub const NOT_SUPPORTED: Atom = Atom(14);
    pub const FUNCTION_CLAUSE: Atom = Atom(15);
    pub const BADFUN: Atom = Atom(16);
    pub const BADARITY: Atom = Atom(17);
    pub const BADMAP: Atom = Atom(18);
    pub const BADKEY: Atom = Atom(19);
    pub const BADMATCH: Atom = Atom(20);
    pub const CASE_CLAUSE: Atom = Atom(21);
    pub const IF_CLAUSE: Atom = Atom(22);
    pub const UNDEF: Atom = Atom(23);
    pub const NOCATCH: Atom = Atom(24);
    pub const INFINITY: Atom = Atom(25);
    pub const EXIT_TAG: Atom = Atom(26);
    pub const DOWN: Atom = Atom(27);
    pub const PROCESS: Atom = Atom(28);
    pub const NATIVE_FAULT: Atom = Atom(29);
    pub const PANIC: Atom = Atom(30);
    pub const THREAD_DIED: Atom = Atom(31);
    pub const TRAP_EXIT: Atom = Atom(32);
    pub const LOW: Atom = Atom(33);
    pub const HIGH: Atom = Atom(34);
    pub const MAX: Atom = Atom(35);
    pub const TIMEOUT_VALUE: Atom = Atom(36);
    pub const NOPROC: Atom = Atom(37);
    pub const BUSY: Atom = Atom(38);
    pub const RUNNABLE: Atom = Atom(39);
    pub const RUNNING: Atom = Atom(40);
    pub const WAITING: Atom = Atom(41);
    pub const EXITING: Atom = Atom(42);
    pub const SUSPENDED: Atom = Atom(43);
    pub const MESSAGE_QUEUE_LEN: Atom = Atom(44);
    pub const REGISTERED_NAME: Atom = Atom(45);
    pub const LINKS: Atom = Atom(46);
    pub const MONITORS: Atom = Atom(47);
    pub const STATUS: Atom = Atom(48);
    pub const HEAP_SIZE: Atom = Atom(49);
    pub const TOTAL_HEAP_SIZE: Atom = Atom(50);
    pub const REDUCTIONS: Atom = Atom(51);
    pub const PRIORITY: Atom = Atom(52);
    pub const GROUP_LEADER: Atom = Atom(53);
    pub const FLUSH: Atom = Atom(54);
    pub const MONITOR: Atom = Atom(55);
    pub const DEMONITOR: Atom = Atom(56);
    pub const LINK: Atom = Atom(57);
    pub const UNLINK: Atom = Atom(58);
    pub const NONODE: Atom = Atom(59);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AtomError {
    #[error("atom table exhausted (system_limit)")]
    SystemLimit,
    #[error("atom name exceeds 255 bytes")]
    NameTooLong,
}

/// An interned symbolic name, referenced by table index.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Atom(pub(super) u32);

impl Atom {
    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_id(id: u32) -> Self {
        Self(id)
    }

    /// Interns `name`, allocating a new id if it was not seen before.
    pub fn intern(name: &str) -> Result<Self, AtomError> {
        TABLE.get_or_insert(name)
    }

    /// Looks up an existing atom without interning.
    pub fn get(name: &str) -> Option<Self> {
        TABLE.ids.get(name).map(|entry| Atom(*entry.value()))
    }

    /// The atom's text. Panics on an id that was never allocated, which
    /// cannot be produced by safe use of this module.
    pub fn name(self) -> &'static str {
        TABLE.names.read()[self.0 as usize]
    }

    /// Whether the id refers to an allocated atom.
    pub fn exists(id: u32) -> bool {
        (id as usize) < TABLE.names.read().len()
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name())
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct AtomTable {
    names: RwLock<Vec<&'static str>>,
    ids: DashMap<&'static str, u32>,
    limit: AtomicUsize,
}

impl AtomTable {
    fn new() -> Self {
        let table = AtomTable {
            names: RwLock::new(Vec::with_capacity(SEED.len() * 2)),
            ids: DashMap::new(),
            limit: AtomicUsize::new(DEFAULT_ATOM_TABLE_SIZE),
        };
        for name in SEED {
            table.get_or_insert(name).expect("atom table seed overflow");
        }
        table
    }

    fn get_or_insert(&self, name: &str) -> Result<Atom, AtomError> {
        if let Some(entry) = self.ids.get(name) {
            return Ok(Atom(*entry.value()));
        }
        if name.len() > 255 {
            return Err(AtomError::NameTooLong);
        }
        let mut names = self.names.write();
        // Double-checked: another thread may have inserted while we waited
        if let Some(entry) = self.ids.get(name) {
            return Ok(Atom(*entry.value()));
        }
        if names.len() >= self.limit.load(Ordering::Relaxed) {
            return Err(AtomError::SystemLimit);
        }
        let id = names.len() as u32;
        let leaked: &'static str = Box::leak(name.to_string().into_boxed_str());
        names.push(leaked);
        self.ids.insert(leaked, id);
        Ok(Atom(id))
    }
}

lazy_static! {
    static ref TABLE: AtomTable = AtomTable::new();
}

/// Raises the table bound; used by runtime initialization. The bound can
/// only grow, and never below the seeded prefix.
pub fn set_table_limit(limit: usize) {
    TABLE.limit.fetch_max(limit.max(SEED.len()), Ordering::Relaxed);
}

/// Number of atoms currently interned.
pub fn table_len() -> usize {
    TABLE.names.read().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_atoms_have_stable_ids() {
        assert_eq!(atoms::FALSE.name(), "false");
        assert_eq!(atoms::TRUE.name(), "true");
        assert_eq!(atoms::KILLED.name(), "killed");
        assert_eq!(atoms::EXIT_TAG.name(), "EXIT");
        assert_eq!(atoms::DOWN.name(), "DOWN");
        assert_eq!(atoms::NONODE.name(), "nonode@nohost");
        for (id, name) in SEED.iter().enumerate() {
            assert_eq!(Atom::from_id(id as u32).name(), *name);
        }
    }

    #[test]
    fn interning_is_idempotent() {
        let a = Atom::intern("qwertyuiop").unwrap();
        let b = Atom::intern("qwertyuiop").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name(), "qwertyuiop");
        assert_eq!(Atom::get("qwertyuiop"), Some(a));
        assert_eq!(Atom::get("never-interned-atom"), None);
    }

    #[test]
    fn overlong_names_are_rejected() {
        let long = "x".repeat(256);
        assert_eq!(Atom::intern(&long), Err(AtomError::NameTooLong));
    }
}
