//! Per-call NIF isolation.
//!
//! Every NIF call executes on a sandbox worker: a dedicated thread with a
//! fixed-size stack (the operating system places a guard page at its low
//! end) and a `catch_unwind` boundary. The calling scheduler blocks on the
//! reply channel; if the worker panics the payload is converted into a
//! fault, and if the worker dies outright the broken channel is reported
//! as a fault as well. Either way the damage is confined to the calling
//! process — worker threads are respawned on demand and the runtime keeps
//! going.
//!
//! Load-time verification (see [`loader`](super::loader)) only admits
//! memory-safe extensions, so the fault classes reaching this boundary in
//! practice are panics and stack exhaustion, not wild pointer writes.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crossbeam::channel::{bounded, unbounded, Sender};
use lazy_static::lazy_static;
use log::debug;
use parking_lot::Mutex;

use ember_rt::heap::ProcessHeap;
use ember_rt::term::{atoms, Atom, OpaqueTerm};

use super::{NifCallable, NifEnv, NifError};

/// Stack given to each sandbox worker.
const SANDBOX_STACK_BYTES: usize = 1 << 20;
const SANDBOX_WORKERS: usize = 4;

/// A fault caught by the isolation boundary.
#[derive(Debug)]
pub struct NifFault {
    /// `panic` or `thread_died`
    pub kind: Atom,
    pub detail: String,
}

type CallReply = Result<(ProcessHeap, Result<OpaqueTerm, NifError>), NifFault>;

struct Job {
    callable: NifCallable,
    fragment: ProcessHeap,
    args: Vec<OpaqueTerm>,
    reply: Sender<CallReply>,
}

lazy_static! {
    static ref QUEUE: Mutex<Sender<Job>> = Mutex::new(spawn_workers());
}

fn spawn_workers() -> Sender<Job> {
    let (tx, rx) = unbounded::<Job>();
    for index in 0..SANDBOX_WORKERS {
        let rx = rx.clone();
        std::thread::Builder::new()
            .name(format!("nif-sandbox-{index}"))
            .stack_size(SANDBOX_STACK_BYTES)
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let Job { callable, mut fragment, args, reply } = job;
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        let mut env = NifEnv::new(&mut fragment);
                        invoke(&callable, &mut env, &args)
                    }));
                    let _ = match outcome {
                        Ok(result) => reply.send(Ok((fragment, result))),
                        Err(payload) => reply.send(Err(NifFault {
                            kind: atoms::PANIC,
                            detail: panic_message(payload),
                        })),
                    };
                }
                debug!(target: "nif", "sandbox worker {index} retiring");
            })
            .expect("failed to start NIF sandbox worker");
    }
    tx
}

fn invoke(
    callable: &NifCallable,
    env: &mut NifEnv<'_>,
    args: &[OpaqueTerm],
) -> Result<OpaqueTerm, NifError> {
    match callable {
        NifCallable::Rust(fun) => fun(env, args),
        NifCallable::Foreign(foreign) => foreign.invoke(env, args),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs one call to completion on a sandbox worker.
pub fn execute(
    callable: NifCallable,
    fragment: ProcessHeap,
    args: Vec<OpaqueTerm>,
) -> CallReply {
    let (reply_tx, reply_rx) = bounded(1);
    let job = Job { callable, fragment, args, reply: reply_tx };
    if QUEUE.lock().send(job).is_err() {
        return Err(NifFault {
            kind: atoms::THREAD_DIED,
            detail: "sandbox queue closed".to_string(),
        });
    }
    match reply_rx.recv() {
        Ok(reply) => reply,
        Err(_) => Err(NifFault {
            kind: atoms::THREAD_DIED,
            detail: "sandbox worker died mid-call".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(fun: super::super::RustNif, args: Vec<OpaqueTerm>) -> CallReply {
        execute(NifCallable::Rust(fun), ProcessHeap::fragment(), args)
    }

    #[test]
    fn values_come_back() {
        fn double(env: &mut NifEnv<'_>, args: &[OpaqueTerm]) -> Result<OpaqueTerm, NifError> {
            let n = env.get_int(args[0])?;
            env.make_int(n * 2)
        }
        let (heap, result) = run(double, vec![OpaqueTerm::make_small(21)]).unwrap();
        let _ = heap;
        assert_eq!(result.unwrap(), OpaqueTerm::make_small(42));
    }

    #[test]
    fn panics_become_faults() {
        fn exploding(_: &mut NifEnv<'_>, _: &[OpaqueTerm]) -> Result<OpaqueTerm, NifError> {
            panic!("deliberate fault");
        }
        let fault = run(exploding, vec![]).unwrap_err();
        assert_eq!(fault.kind, atoms::PANIC);
        assert!(fault.detail.contains("deliberate fault"));
    }

    #[test]
    fn workers_survive_a_fault() {
        fn exploding(_: &mut NifEnv<'_>, _: &[OpaqueTerm]) -> Result<OpaqueTerm, NifError> {
            panic!("again");
        }
        fn fine(env: &mut NifEnv<'_>, _: &[OpaqueTerm]) -> Result<OpaqueTerm, NifError> {
            env.make_int(7)
        }
        let _ = run(exploding, vec![]).unwrap_err();
        let (_, result) = run(fine, vec![]).unwrap();
        assert_eq!(result.unwrap(), OpaqueTerm::make_small(7));
    }
}
