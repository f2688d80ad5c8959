//! The scheduler pool.
//!
//! A fixed set of OS threads each owns four priority run queues; work
//! arrives locally from the running process's spawns, from a global
//! injector fed by non-scheduler threads (timers, dirty completions,
//! runtime control), or by stealing from a random peer. An idle scheduler
//! parks on its condvar, bounded by the next timer deadline.
//!
//! The execution engine is installed as a trait object at boot: the
//! scheduler owns the loop, the engine owns instruction dispatch, and the
//! verdict of each slice (`Yielded`, `Waiting`, `Exited`, …) decides what
//! happens to the process next.

pub mod queue;
pub mod timers;

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::deque::{Injector, Steal};
use lazy_static::lazy_static;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::process::{self, status, PendingExit, Process};
use self::queue::RunQueues;

/// Reductions granted per scheduling slice.
pub const REDUCTION_BUDGET: u32 = 4000;

/// Dirty pool flavors: CPU-bound work and blocking I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyKind {
    Cpu,
    Io,
}

/// Verdict of one scheduling slice.
pub enum Execution {
    /// Budget exhausted or explicit yield: requeue at the priority tail
    Yielded,
    /// Parked in a receive; a signal or timer will requeue it
    Waiting,
    /// The process is done; run termination
    Exited(PendingExit),
    /// `halt/1`: stop the runtime with this status
    Halted(i32),
    /// Migrate to a dirty scheduler; the pending operation is parked in
    /// the process body
    Dirty(DirtyKind),
}

/// Outcome of a dirty-scheduler slice.
pub enum DirtyOutcome {
    /// Hand the process back to the normal schedulers
    Resume,
    Exited(PendingExit),
}

/// The execution engine, supplied by the emulator at boot.
pub trait Engine: Send + Sync + 'static {
    fn run(&self, scheduler: &Scheduler, process: &Arc<Process>, reductions: u32) -> Execution;

    /// Runs the dirty operation the engine parked on this process.
    fn run_dirty(&self, process: &Arc<Process>) -> DirtyOutcome;
}

pub struct Scheduler {
    pub id: usize,
    queues: Mutex<RunQueues>,
    parked: Mutex<bool>,
    wakeup: Condvar,
    steal_rotation: AtomicUsize,
}

impl Scheduler {
    fn new(id: usize) -> Self {
        Self {
            id,
            queues: Mutex::new(RunQueues::default()),
            parked: Mutex::new(false),
            wakeup: Condvar::new(),
            steal_rotation: AtomicUsize::new(id),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queues.lock().len()
    }

    fn push(&self, process: Arc<Process>) {
        self.queues.lock().push(process);
    }

    fn pop(&self) -> Option<Arc<Process>> {
        self.queues.lock().pop()
    }

    fn unpark(&self) {
        let mut parked = self.parked.lock();
        if *parked {
            *parked = false;
            self.wakeup.notify_one();
        }
    }
}

struct DirtyPool {
    kind: DirtyKind,
    queue: Mutex<std::collections::VecDeque<Arc<Process>>>,
    wakeup: Condvar,
}

impl DirtyPool {
    fn new(kind: DirtyKind) -> Self {
        Self { kind, queue: Mutex::new(Default::default()), wakeup: Condvar::new() }
    }

    fn submit(&self, process: Arc<Process>) {
        self.queue.lock().push_back(process);
        self.wakeup.notify_one();
    }
}

struct SchedulerSet {
    schedulers: RwLock<Vec<Arc<Scheduler>>>,
    injector: Injector<Arc<Process>>,
    engine: RwLock<Option<Arc<dyn Engine>>>,
    shutdown: AtomicBool,
    dirty_cpu: DirtyPool,
    dirty_io: DirtyPool,
}

lazy_static! {
    static ref SET: SchedulerSet = SchedulerSet {
        schedulers: RwLock::new(Vec::new()),
        injector: Injector::new(),
        engine: RwLock::new(None),
        shutdown: AtomicBool::new(false),
        dirty_cpu: DirtyPool::new(DirtyKind::Cpu),
        dirty_io: DirtyPool::new(DirtyKind::Io),
    };
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
}

/// The scheduler owning the current thread, if this is a scheduler thread.
pub fn current() -> Option<Arc<Scheduler>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

pub fn scheduler_count() -> usize {
    SET.schedulers.read().len()
}

pub fn is_shutting_down() -> bool {
    SET.shutdown.load(Ordering::Acquire)
}

/// Flags shutdown and wakes everything so the loops can drain and exit.
pub fn begin_shutdown() {
    SET.shutdown.store(true, Ordering::Release);
    for scheduler in SET.schedulers.read().iter() {
        scheduler.unpark();
    }
    SET.dirty_cpu.wakeup.notify_all();
    SET.dirty_io.wakeup.notify_all();
}

/// Installs the engine and spins up `count` scheduler threads plus the
/// dirty pools. Returns the join handles for shutdown.
pub fn start(count: usize, engine: Arc<dyn Engine>) -> Vec<std::thread::JoinHandle<()>> {
    *SET.engine.write() = Some(engine);
    SET.shutdown.store(false, Ordering::Release);

    let mut schedulers = SET.schedulers.write();
    schedulers.clear();
    for id in 0..count {
        schedulers.push(Arc::new(Scheduler::new(id)));
    }
    let started: Vec<Arc<Scheduler>> = schedulers.clone();
    drop(schedulers);

    let mut handles = Vec::with_capacity(count + 4);
    for scheduler in started {
        let handle = std::thread::Builder::new()
            .name(format!("scheduler-{}", scheduler.id))
            .spawn(move || scheduler_loop(scheduler))
            .expect("failed to start scheduler thread");
        handles.push(handle);
    }
    for (kind, index) in [(DirtyKind::Cpu, 0), (DirtyKind::Cpu, 1), (DirtyKind::Io, 0), (DirtyKind::Io, 1)]
    {
        let handle = std::thread::Builder::new()
            .name(format!("dirty-{:?}-{}", kind, index).to_lowercase())
            .spawn(move || dirty_loop(kind))
            .expect("failed to start dirty scheduler thread");
        handles.push(handle);
    }
    handles
}

/// Queues a runnable process: locally when called from a scheduler thread,
/// through the global injector otherwise.
pub fn enqueue(process: Arc<Process>) {
    if !process.status().transition(
        status::RUNNABLE,
        status::IN_RUNQ | status::EXITING | status::RUNNING,
        0,
        status::IN_RUNQ,
    ) {
        return;
    }
    match current() {
        Some(scheduler) => {
            scheduler.push(process);
            // A busy scheduler shares the load
            wake_idle_peer(scheduler.id);
        }
        None => {
            SET.injector.push(process);
            wake_idle_peer(usize::MAX);
        }
    }
}

/// Wakes a process parked in a receive. No-op for anything not WAITING.
pub fn wake(process: &Arc<Process>) {
    if process.status().transition(
        status::WAITING,
        status::EXITING,
        status::WAITING,
        status::RUNNABLE,
    ) {
        trace!(target: "scheduler", "waking {}", process.pid());
        enqueue(process.clone());
    }
}

/// Routes a dirty-flagged process to the right pool.
pub fn submit_dirty(kind: DirtyKind, process: Arc<Process>) {
    match kind {
        DirtyKind::Cpu => SET.dirty_cpu.submit(process),
        DirtyKind::Io => SET.dirty_io.submit(process),
    }
}

fn wake_idle_peer(excluding: usize) {
    for scheduler in SET.schedulers.read().iter() {
        if scheduler.id != excluding && *scheduler.parked.lock() {
            scheduler.unpark();
            return;
        }
    }
}

fn engine() -> Arc<dyn Engine> {
    SET.engine.read().clone().expect("scheduler started without an engine")
}

fn fire_timers() {
    for (token, pid) in timers::take_expired(Instant::now()) {
        let Some(process) = crate::process::table::lookup(pid) else { continue };
        {
            let mut body = process.body();
            if body.timer != Some(token) {
                continue;
            }
            body.timer = None;
            body.timed_out = true;
        }
        wake(&process);
    }
}

fn next_work(scheduler: &Arc<Scheduler>) -> Option<Arc<Process>> {
    if let Some(process) = scheduler.pop() {
        return Some(process);
    }
    // Global injector next
    loop {
        match SET.injector.steal() {
            Steal::Success(process) => return Some(process),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }
    // Steal from a rotating peer victim
    let peers = SET.schedulers.read();
    if peers.len() > 1 {
        let start = scheduler.steal_rotation.fetch_add(1, Ordering::Relaxed);
        for i in 0..peers.len() {
            let victim = &peers[(start + i) % peers.len()];
            if victim.id == scheduler.id {
                continue;
            }
            if let Some(process) = victim.queues.lock().steal() {
                trace!(
                    target: "scheduler",
                    "scheduler {} stole {} from {}",
                    scheduler.id,
                    process.pid(),
                    victim.id
                );
                return Some(process);
            }
        }
    }
    None
}

fn scheduler_loop(scheduler: Arc<Scheduler>) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(scheduler.clone()));
    debug!(target: "scheduler", "scheduler {} online", scheduler.id);

    loop {
        fire_timers();

        match next_work(&scheduler) {
            Some(process) => run_slice(&scheduler, process),
            None => {
                if is_shutting_down() {
                    break;
                }
                let mut parked = scheduler.parked.lock();
                *parked = true;
                let timeout = timers::next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::from_millis(50))
                    .min(Duration::from_millis(50));
                scheduler.wakeup.wait_for(&mut parked, timeout.max(Duration::from_millis(1)));
                *parked = false;
            }
        }
    }
    debug!(target: "scheduler", "scheduler {} offline", scheduler.id);
}

fn run_slice(scheduler: &Scheduler, process: Arc<Process>) {
    // Claim the run slot; a stale queue entry (already running elsewhere,
    // or exiting) is simply dropped
    if !process.status().transition(
        status::RUNNABLE | status::IN_RUNQ,
        status::RUNNING | status::EXITING,
        status::RUNNABLE | status::IN_RUNQ,
        status::RUNNING,
    ) {
        return;
    }

    let verdict = engine().run(scheduler, &process, REDUCTION_BUDGET);
    match verdict {
        Execution::Yielded => {
            process.status().transition(status::RUNNING, 0, status::RUNNING, status::RUNNABLE);
            enqueue(process);
        }
        Execution::Waiting => {
            // The engine parked it WAITING before returning; nothing to do
        }
        Execution::Exited(exit) => {
            process.status().clear(status::RUNNING);
            process::terminate(&process, exit);
        }
        Execution::Halted(code) => {
            debug!(target: "scheduler", "halt({}) from {}", code, process.pid());
            process.status().clear(status::RUNNING);
            process::terminate(&process, PendingExit::normal());
            crate::runtime::halt(code);
        }
        Execution::Dirty(kind) => {
            process
                .status()
                .transition(status::RUNNING, 0, status::RUNNING, status::DIRTY_RUNNING);
            submit_dirty(kind, process);
        }
    }
}

fn dirty_loop(kind: DirtyKind) {
    let pool = match kind {
        DirtyKind::Cpu => &SET.dirty_cpu,
        DirtyKind::Io => &SET.dirty_io,
    };
    loop {
        let next = {
            let mut queue = pool.queue.lock();
            loop {
                if let Some(process) = queue.pop_front() {
                    break Some(process);
                }
                if is_shutting_down() {
                    break None;
                }
                pool.wakeup.wait_for(&mut queue, Duration::from_millis(100));
            }
        };
        let Some(process) = next else { break };

        match engine().run_dirty(&process) {
            DirtyOutcome::Resume => {
                process.status().transition(
                    status::DIRTY_RUNNING,
                    0,
                    status::DIRTY_RUNNING,
                    status::RUNNABLE,
                );
                enqueue(process);
            }
            DirtyOutcome::Exited(exit) => {
                process.status().clear(status::DIRTY_RUNNING);
                process::terminate(&process, exit);
            }
        }
    }
}
