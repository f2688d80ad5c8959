//! The Ember core runtime: terms, per-process heaps and garbage
//! collection, processes and their signals, the module registry and code
//! loader, and the scheduler pool. The execution engine lives in the
//! emulator crate and plugs in through [`scheduler::Engine`].

pub mod code;
pub mod error;
pub mod etf;
pub mod gc;
pub mod heap;
pub mod map;
pub mod printer;
pub mod process;
pub mod runtime;
pub mod scheduler;
pub mod term;

pub use self::error::{Exception, ExceptionClass};
pub use self::heap::{HeapFull, ProcessHeap};
pub use self::process::{Priority, Process, ProcessId};
pub use self::term::{atoms, Atom, OpaqueTerm};
