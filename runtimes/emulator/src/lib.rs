//! The Ember emulator: the bytecode execution engine plus the built-in
//! function layer and the native-extension sandbox. The engine implements
//! [`ember_rt::scheduler::Engine`]; the scheduler pool in `ember_rt` owns
//! the loop around it.

pub mod bifs;
pub mod emulator;
pub mod nifs;
pub mod sys;

pub use self::emulator::Emulator;

use std::sync::mpsc;
use std::sync::Arc;

use anyhow::Context;

use ember_rt::runtime::{exit_code, Config, ExitNotice, Runtime};
use ember_rt::term::Atom;
use ember_rt::ProcessId;

/// A booted runtime plus the handle used to watch the initial process.
pub struct Booted {
    pub runtime: Runtime,
    pub initial: ProcessId,
    exit_rx: mpsc::Receiver<ExitNotice>,
}

impl Booted {
    /// Blocks until the initial process exits or the runtime halts, then
    /// drains the system and returns the launcher exit code.
    pub fn wait_and_shutdown(self) -> i32 {
        let status = self.runtime.wait(&self.exit_rx);
        let shutdown_status = self.runtime.shutdown();
        if status != exit_code::SUCCESS {
            status
        } else {
            shutdown_status
        }
    }
}

/// Initializes the runtime, installs the emulator as the engine, and
/// spawns the initial process on `module:function()`.
pub fn boot(config: Config, module: &str, function: &str) -> anyhow::Result<Booted> {
    let mut runtime = Runtime::initialize(config).context("runtime initialization")?;
    runtime
        .start(Arc::new(Emulator::new()))
        .context("scheduler pool startup")?;
    let module = Atom::intern(module).context("interning the entry module")?;
    let function = Atom::intern(function).context("interning the entry function")?;
    let (initial, exit_rx) = runtime
        .spawn_initial(module, function, &[])
        .with_context(|| format!("spawning {module}:{function}/0"))?;
    Ok(Booted { runtime, initial, exit_rx })
}
