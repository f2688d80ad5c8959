//! Boot and runtime control.
//!
//! `initialize` applies the configuration to the global tables, `start`
//! installs the engine and spins up the scheduler pool, `spawn_initial`
//! creates the first process, and `wait`/`shutdown` drive the lifecycle
//! from the embedding launcher. Fatal errors and `halt/1` funnel through
//! [`halt`], which records the exit status and begins shutdown.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap;
use lazy_static::lazy_static;
use log::{info, warn};
use parking_lot::Mutex;

use crate::process::{signals, spawn, table, ProcessId, Signal};
use crate::scheduler::{self, Engine};
use crate::term::{atom, Atom, OpaqueTerm};

/// Launcher exit codes.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const EARLY_INIT: i32 = 1;
    pub const MAIN_INIT: i32 = 2;
    pub const RUNTIME_FATAL: i32 = 3;
    /// Base for configuration-specific errors
    pub const CONFIG_BASE: i32 = 64;
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduler threads; `None` means one per CPU
    pub scheduler_count: Option<usize>,
    pub max_processes: usize,
    /// Total heap words across processes; `None` is unlimited
    pub memory_limit: Option<usize>,
    pub atom_table_size: usize,
    pub distribution_enabled: bool,
    pub node_name: String,
    pub distribution_cookie: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler_count: None,
            max_processes: table::DEFAULT_MAX_PROCESSES,
            memory_limit: None,
            atom_table_size: atom::DEFAULT_ATOM_TABLE_SIZE,
            distribution_enabled: false,
            node_name: String::new(),
            distribution_cookie: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("scheduler_count must be nonzero")]
    NoSchedulers,
    #[error("max_processes must be nonzero")]
    NoProcesses,
    #[error("distribution requires a node_name")]
    MissingNodeName,
    #[error("distribution requires a cookie")]
    MissingCookie,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler_count == Some(0) {
            return Err(ConfigError::NoSchedulers);
        }
        if self.max_processes == 0 {
            return Err(ConfigError::NoProcesses);
        }
        if self.distribution_enabled {
            if self.node_name.is_empty() {
                return Err(ConfigError::MissingNodeName);
            }
            if self.distribution_cookie.is_empty() {
                return Err(ConfigError::MissingCookie);
            }
        }
        Ok(())
    }

    fn effective_schedulers(&self) -> usize {
        self.scheduler_count.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        })
    }
}

/// How a watched process ended.
#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub pid: ProcessId,
    pub reason: String,
    pub normal: bool,
}

struct ExitWatch {
    watchers: HashMap<ProcessId, mpsc::Sender<ExitNotice>>,
    /// Exits that beat their watcher registration
    already_exited: HashMap<ProcessId, ExitNotice>,
}

lazy_static! {
    static ref WATCH: Mutex<ExitWatch> = Mutex::new(ExitWatch {
        watchers: HashMap::new(),
        already_exited: HashMap::new(),
    });
}

static EXIT_STATUS: AtomicI32 = AtomicI32::new(exit_code::SUCCESS);
static HALTED: AtomicBool = AtomicBool::new(false);

pub struct Runtime {
    config: Config,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Spawn(#[from] spawn::SpawnError),
    #[error("runtime is not started")]
    NotStarted,
}

impl Runtime {
    /// Validates the configuration and applies it to the global tables.
    pub fn initialize(config: Config) -> Result<Self, RuntimeError> {
        config.validate()?;
        atom::set_table_limit(config.atom_table_size);
        table::set_limit(config.max_processes);
        info!(
            target: "runtime",
            "initialized: {} schedulers, {} max processes, {} atoms",
            config.effective_schedulers(),
            config.max_processes,
            config.atom_table_size,
        );
        Ok(Self { config, handles: Vec::new() })
    }

    /// Starts the scheduler pool with the given execution engine.
    pub fn start(&mut self, engine: std::sync::Arc<dyn Engine>) -> Result<(), RuntimeError> {
        let count = self.config.effective_schedulers();
        self.handles = scheduler::start(count, engine);
        Ok(())
    }

    /// Spawns the initial process on `module:function(args…)` and
    /// registers a watcher for its exit. With no parent heap to copy from,
    /// the arguments must be immediates.
    pub fn spawn_initial(
        &self,
        module: Atom,
        function: Atom,
        args: &[OpaqueTerm],
    ) -> Result<(ProcessId, mpsc::Receiver<ExitNotice>), RuntimeError> {
        if self.handles.is_empty() {
            return Err(RuntimeError::NotStarted);
        }
        let (tx, rx) = mpsc::channel();
        let spawned = spawn::spawn_mfa(None, module, function, args, Default::default())?;
        // An exit that lands before this registration is buffered and
        // re-delivered, so the watcher cannot miss it
        register_watcher(spawned.pid, tx);
        Ok((spawned.pid, rx))
    }

    /// Blocks until the watched process exits or the runtime halts,
    /// returning the final launcher exit code.
    pub fn wait(&self, rx: &mpsc::Receiver<ExitNotice>) -> i32 {
        loop {
            if HALTED.load(Ordering::Acquire) {
                return EXIT_STATUS.load(Ordering::Acquire);
            }
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(notice) => {
                    if !notice.normal {
                        warn!(
                            target: "runtime",
                            "initial process {} exited: {}",
                            notice.pid,
                            notice.reason
                        );
                        if EXIT_STATUS.load(Ordering::Acquire) == exit_code::SUCCESS {
                            EXIT_STATUS.store(exit_code::RUNTIME_FATAL, Ordering::Release);
                        }
                    }
                    return EXIT_STATUS.load(Ordering::Acquire);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return EXIT_STATUS.load(Ordering::Acquire)
                }
            }
        }
    }

    /// Drains the system: no new work, stragglers get exit signals with
    /// reason `shutdown`, schedulers are joined. Returns the exit status.
    pub fn shutdown(self) -> i32 {
        info!(target: "runtime", "shutting down, {} processes live", table::len());

        // Ask every remaining process to stop
        for process in table::snapshot() {
            let pid = process.pid();
            let fragment = crate::heap::ProcessHeap::fragment();
            signals::send_to(
                pid,
                Signal::Exit {
                    sender: pid,
                    fragment,
                    reason: OpaqueTerm::make_atom(crate::term::atoms::SHUTDOWN),
                    from_link: false,
                },
            );
        }
        // Give them a moment to run their cleanup, then stop the pool
        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while table::len() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        scheduler::begin_shutdown();
        for handle in self.handles {
            let _ = handle.join();
        }
        EXIT_STATUS.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Watches an arbitrary process for exit; used by embedders and tests.
/// An exit that already happened is delivered immediately.
pub fn watch(pid: ProcessId) -> mpsc::Receiver<ExitNotice> {
    let (tx, rx) = mpsc::channel();
    register_watcher(pid, tx);
    rx
}

fn register_watcher(pid: ProcessId, tx: mpsc::Sender<ExitNotice>) {
    let mut watch = WATCH.lock();
    if let Some(notice) = watch.already_exited.remove(&pid) {
        let _ = tx.send(notice);
    } else {
        watch.watchers.insert(pid, tx);
    }
}

/// Termination hook: routes exit notices to runtime watchers.
pub fn notify_exit(pid: ProcessId, reason: &str, normal: bool) {
    let notice = ExitNotice { pid, reason: reason.to_string(), normal };
    let mut watch = WATCH.lock();
    match watch.watchers.remove(&pid) {
        Some(tx) => {
            let _ = tx.send(notice);
        }
        None => {
            // Keep it in case a watcher registers just after the exit; the
            // buffer is bounded, unwatched history is disposable
            if watch.already_exited.len() >= 4096 {
                watch.already_exited.clear();
            }
            watch.already_exited.insert(pid, notice);
        }
    }
}

/// `halt/1` and fatal errors: record the status and begin shutdown.
pub fn halt(code: i32) {
    EXIT_STATUS.store(code, Ordering::Release);
    HALTED.store(true, Ordering::Release);
    scheduler::begin_shutdown();
}

pub fn exit_status() -> i32 {
    EXIT_STATUS.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_the_contract() {
        let config = Config::default();
        assert_eq!(config.max_processes, 1 << 20);
        assert_eq!(config.atom_table_size, 8192);
        assert!(!config.distribution_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn distribution_requires_identity() {
        let config = Config {
            distribution_enabled: true,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingNodeName)));

        let config = Config {
            distribution_enabled: true,
            node_name: "ember@localhost".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingCookie)));
    }
}
