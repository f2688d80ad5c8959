//! The process: the unit of concurrency and isolation.
//!
//! A [`Process`] splits into a shared part — identity, priority, the atomic
//! status word, the signal queue — that any thread may touch, and the
//! [`ProcessBody`] behind a mutex, which only the scheduler slot running
//! the process (or termination, or an introspection BIF) holds. Senders
//! never lock the body: they append signals and wake the target.

pub mod flags;
pub mod id;
pub mod mailbox;
pub mod monitor;
pub mod registry;
pub mod signals;
pub mod spawn;
pub mod table;

pub use self::flags::{status, AtomicStatus};
pub use self::id::ProcessId;
pub use self::mailbox::{Mailbox, Message};
pub use self::monitor::{LinkSet, MonitorSet};
pub use self::signals::{PendingExit, Signal, SignalQueue};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard};

use crate::gc::{Collector, Sweep};
use crate::heap::ProcessHeap;
use crate::term::{atoms, Atom, OpaqueTerm};

/// Scheduling priority. `Max` is reserved for system processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Max = 3,
}

impl Priority {
    pub fn from_atom(atom: Atom) -> Option<Self> {
        match atom {
            a if a == atoms::LOW => Some(Self::Low),
            a if a == atoms::NORMAL => Some(Self::Normal),
            a if a == atoms::HIGH => Some(Self::High),
            a if a == atoms::MAX => Some(Self::Max),
            _ => None,
        }
    }

    pub fn as_atom(self) -> Atom {
        match self {
            Self::Low => atoms::LOW,
            Self::Normal => atoms::NORMAL,
            Self::High => atoms::HIGH,
            Self::Max => atoms::MAX,
        }
    }
}

/// A code address: a loaded module instance plus an instruction offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePtr {
    pub instance: u32,
    pub offset: u32,
}

impl CodePtr {
    pub const INVALID: CodePtr = CodePtr { instance: u32::MAX, offset: 0 };
}

/// A suspended caller: where to resume, which register receives the return
/// value, and the caller's register window.
#[derive(Debug)]
pub struct Frame {
    pub ret: CodePtr,
    pub dst: u16,
    pub saved_regs: Vec<OpaqueTerm>,
}

/// An active catch scope: unwinding pops frames back to `frame_depth` and
/// resumes at `handler`.
#[derive(Debug, Clone, Copy)]
pub struct CatchFrame {
    pub frame_depth: usize,
    pub handler: CodePtr,
}

/// Mutable execution state, owned by whoever is running the process.
pub struct ProcessBody {
    pub heap: ProcessHeap,
    /// Registers of the current frame
    pub regs: Vec<OpaqueTerm>,
    pub frames: Vec<Frame>,
    pub catches: Vec<CatchFrame>,
    pub ip: CodePtr,
    pub mailbox: Mailbox,
    /// `(hash, key, value)`; the hash makes lookups cheap and survives GC
    pub dictionary: Vec<(u64, OpaqueTerm, OpaqueTerm)>,
    pub links: LinkSet,
    pub monitors: MonitorSet,
    pub group_leader: ProcessId,
    /// Armed `receive after` deadline token, if any
    pub timer: Option<u64>,
    /// Set when the armed timer fired before a match
    pub timed_out: bool,
    pub fullsweep_after: u32,
    pub minor_gcs: u32,
    /// Tracing bits set by trace-change signals; reserved for tooling
    pub trace_flags: u32,
    /// Engine-owned slot for an operation parked across a dirty-scheduler
    /// migration
    pub dirty: Option<Box<dyn core::any::Any + Send>>,
}

impl ProcessBody {
    fn new(heap_words: usize, fullsweep_after: u32, group_leader: ProcessId) -> Self {
        Self {
            heap: ProcessHeap::new(heap_words),
            regs: Vec::new(),
            frames: Vec::new(),
            catches: Vec::new(),
            ip: CodePtr::INVALID,
            mailbox: Mailbox::default(),
            dictionary: Vec::new(),
            links: LinkSet::default(),
            monitors: MonitorSet::default(),
            group_leader,
            timer: None,
            timed_out: false,
            fullsweep_after,
            minor_gcs: 0,
            trace_flags: 0,
            dirty: None,
        }
    }
}

pub struct Process {
    pid: ProcessId,
    parent: Option<ProcessId>,
    priority: Priority,
    status: AtomicStatus,
    total_reductions: AtomicU64,
    signals: Mutex<SignalQueue>,
    body: Mutex<ProcessBody>,
    pub(crate) registered_name: Mutex<Option<Atom>>,
    /// `{module, function, arity}` the process was spawned with
    initial_call: (Atom, Atom, u8),
}

impl Process {
    pub fn new(
        pid: ProcessId,
        parent: Option<ProcessId>,
        priority: Priority,
        heap_words: usize,
        fullsweep_after: u32,
        group_leader: ProcessId,
        initial_call: (Atom, Atom, u8),
    ) -> Self {
        Self {
            pid,
            parent,
            priority,
            status: AtomicStatus::new(status::RUNNABLE),
            total_reductions: AtomicU64::new(0),
            signals: Mutex::new(SignalQueue::default()),
            body: Mutex::new(ProcessBody::new(heap_words, fullsweep_after, group_leader)),
            registered_name: Mutex::new(None),
            initial_call,
        }
    }

    #[inline]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    #[inline]
    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn status(&self) -> &AtomicStatus {
        &self.status
    }

    #[inline]
    pub fn initial_call(&self) -> (Atom, Atom, u8) {
        self.initial_call
    }

    pub fn is_exiting(&self) -> bool {
        self.status.is_set(status::EXITING)
    }

    pub fn traps_exits(&self) -> bool {
        self.status.is_set(status::TRAP_EXIT)
    }

    pub fn set_trap_exit(&self, enabled: bool) -> bool {
        let was = self.status.is_set(status::TRAP_EXIT);
        if enabled {
            self.status.set(status::TRAP_EXIT);
        } else {
            self.status.clear(status::TRAP_EXIT);
        }
        was
    }

    /// Exclusive access to the execution state. Held by the scheduler for
    /// the duration of a slice, and briefly by introspection and
    /// termination.
    pub fn body(&self) -> MutexGuard<'_, ProcessBody> {
        self.body.lock()
    }

    pub fn try_body(&self) -> Option<MutexGuard<'_, ProcessBody>> {
        self.body.try_lock()
    }

    pub fn push_signal(&self, signal: Signal) {
        self.signals.lock().push(signal);
    }

    pub fn take_signal(&self) -> Option<Signal> {
        self.signals.lock().pop()
    }

    pub fn has_signals(&self) -> bool {
        !self.signals.lock().is_empty()
    }

    pub fn add_reductions(&self, n: u64) {
        self.total_reductions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn reductions(&self) -> u64 {
        self.total_reductions.load(Ordering::Relaxed)
    }

    pub fn registered_name(&self) -> Option<Atom> {
        *self.registered_name.lock()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("priority", &self.priority)
            .field("status", &self.status.load())
            .finish()
    }
}

/// Allocates a runtime-unique reference id (for monitors and `make_ref`).
pub fn next_reference_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Runs a collection on `body`, choosing minor or full sweep, rooted at
/// the registers, frame windows, mailbox, and dictionary. Returns words
/// moved.
pub fn collect_garbage(body: &mut ProcessBody, need: usize) -> usize {
    let old_pressure = body.heap.old_used() * 2 > body.heap.young_capacity().max(1) * 3;
    let sweep = if body.minor_gcs >= body.fullsweep_after || old_pressure {
        Sweep::Full
    } else {
        Sweep::Minor
    };
    let moved = collect_garbage_sweep(body, need, sweep);
    match sweep {
        Sweep::Minor => body.minor_gcs += 1,
        Sweep::Full => body.minor_gcs = 0,
    }
    moved
}

/// Runs a collection with an explicit sweep kind (the `garbage_collect`
/// BIF forces a full sweep).
pub fn collect_garbage_sweep(body: &mut ProcessBody, need: usize, sweep: Sweep) -> usize {
    let mut gc = Collector::begin(&mut body.heap, sweep, need);
    for slot in body.regs.iter_mut() {
        *slot = gc.evacuate(*slot);
    }
    for frame in body.frames.iter_mut() {
        for slot in frame.saved_regs.iter_mut() {
            *slot = gc.evacuate(*slot);
        }
    }
    for message in body.mailbox.iter_mut() {
        message.term = gc.evacuate(message.term);
    }
    for (_, key, value) in body.dictionary.iter_mut() {
        *key = gc.evacuate(*key);
        *value = gc.evacuate(*value);
    }
    gc.finish(&mut body.heap, need)
}

/// Whether the young generation is full enough that the engine should
/// collect at the next safe point (three quarters used).
pub fn should_collect(body: &ProcessBody) -> bool {
    let used = body.heap.young_used();
    let capacity = body.heap.young_capacity();
    used * 4 >= capacity * 3
}

/// Runs the termination protocol: the process is removed from the table,
/// its links and monitors fire, resources are released, and runtime
/// watchers are notified. Exactly one caller may reach this per process.
pub fn terminate(process: &Arc<Process>, exit: PendingExit) {
    let pid = process.pid();
    process.status().set(status::EXITING);

    // Make the pid unresolvable first so no further signals land here
    table::remove(pid);
    registry::unregister_owned(process);

    let mut body = process.body();
    if let Some(token) = body.timer.take() {
        crate::scheduler::timers::cancel(token);
    }

    let reason_text = crate::printer::format(&exit.fragment, exit.reason);
    let is_normal = exit.reason == OpaqueTerm::make_atom(atoms::NORMAL);
    if is_normal {
        trace!(target: "process", "{} exited normally", pid);
    } else {
        debug!(target: "process", "{} exited with reason {}", pid, reason_text);
    }

    // Links: exit signals carry the reason; `kill` deaths propagate as
    // `killed`, which link partners may trap
    for peer in body.links.drain() {
        let mut fragment = ProcessHeap::fragment();
        let reason = fragment
            .copy_from(&exit.fragment, exit.reason)
            .expect("fragments grow on demand");
        signals::send_to(
            peer,
            Signal::Exit { sender: pid, fragment, reason, from_link: true },
        );
    }

    // Incoming monitors: exactly one DOWN each
    let incoming: Vec<(u64, ProcessId)> = body.monitors.incoming.drain().collect();
    for (reference, watcher) in incoming {
        let mut fragment = ProcessHeap::fragment();
        let reason = fragment
            .copy_from(&exit.fragment, exit.reason)
            .expect("fragments grow on demand");
        signals::send_to(watcher, Signal::Down { reference, from: pid, fragment, reason });
    }

    // Outgoing monitors: tell targets to forget us
    let outgoing: Vec<(u64, ProcessId)> = body.monitors.outgoing.drain().collect();
    for (reference, target) in outgoing {
        signals::send_to(target, Signal::Demonitor { reference });
    }

    // Release execution state; off-heap references drop with the heap
    body.regs.clear();
    body.frames.clear();
    body.catches.clear();
    body.dictionary.clear();
    body.heap = ProcessHeap::new(16);
    drop(body);

    crate::runtime::notify_exit(pid, &reason_text, is_normal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::DEFAULT_HEAP_WORDS;

    fn test_process() -> Process {
        Process::new(
            ProcessId::new(7, 0),
            None,
            Priority::Normal,
            DEFAULT_HEAP_WORDS,
            65535,
            ProcessId::new(7, 0),
            (atoms::UNDEFINED, atoms::UNDEFINED, 0),
        )
    }

    #[test]
    fn trap_exit_toggles() {
        let p = test_process();
        assert!(!p.traps_exits());
        assert!(!p.set_trap_exit(true));
        assert!(p.traps_exits());
        assert!(p.set_trap_exit(false));
        assert!(!p.traps_exits());
    }

    #[test]
    fn gc_keeps_all_root_classes() {
        let p = test_process();
        let mut body = p.body();
        let t1 = body.heap.tuple(&[OpaqueTerm::make_small(1)]).unwrap();
        let t2 = body.heap.tuple(&[OpaqueTerm::make_small(2)]).unwrap();
        let t3 = body.heap.tuple(&[OpaqueTerm::make_small(3)]).unwrap();
        let t4 = body.heap.tuple(&[OpaqueTerm::make_small(4)]).unwrap();

        body.regs.push(t1);
        body.frames.push(Frame { ret: CodePtr::INVALID, dst: 0, saved_regs: vec![t2] });
        body.mailbox.push(Message { sender: p.pid(), term: t3 });
        let hash = body.heap.term_hash(t4);
        body.dictionary.push((hash, OpaqueTerm::make_small(0), t4));

        collect_garbage(&mut body, 0);

        let r = body.regs[0];
        assert_eq!(body.heap.tuple_element(r, 0), OpaqueTerm::make_small(1));
        let f = body.frames[0].saved_regs[0];
        assert_eq!(body.heap.tuple_element(f, 0), OpaqueTerm::make_small(2));
        let m = body.mailbox.peek().unwrap().term;
        assert_eq!(body.heap.tuple_element(m, 0), OpaqueTerm::make_small(3));
        let d = body.dictionary[0].2;
        assert_eq!(body.heap.tuple_element(d, 0), OpaqueTerm::make_small(4));
    }

    #[test]
    fn mailbox_cursor_survives_collection() {
        let p = test_process();
        let mut body = p.body();
        for i in 0..3 {
            let t = body.heap.tuple(&[OpaqueTerm::make_small(i)]).unwrap();
            body.mailbox.push(Message { sender: p.pid(), term: t });
        }
        body.mailbox.advance();
        body.mailbox.advance();
        assert_eq!(body.mailbox.cursor(), 2);

        collect_garbage(&mut body, 0);

        assert_eq!(body.mailbox.cursor(), 2);
        let m = body.mailbox.peek().unwrap().term;
        assert_eq!(body.heap.tuple_element(m, 0), OpaqueTerm::make_small(2));
    }
}
