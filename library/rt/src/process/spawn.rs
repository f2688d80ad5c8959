//! Process creation.
//!
//! Spawning builds a fresh process around an entry point — an exported
//! `{module, function, arity}` or a closure — copies the arguments into
//! the child's heap, wires up the requested link or monitor while both
//! sides are still quiescent, publishes the child in the process table,
//! and queues it.

use std::sync::Arc;

use log::trace;

use crate::code;
use crate::heap::DEFAULT_HEAP_WORDS;
use crate::process::{
    next_reference_id, table, CodePtr, Priority, Process, ProcessBody, ProcessId,
};
use crate::term::{Atom, OpaqueTerm};

use ember_bytecode::Opcode;

#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    pub link: bool,
    pub monitor: bool,
    pub priority: Priority,
    pub heap_words: usize,
    pub fullsweep_after: u32,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            link: false,
            monitor: false,
            priority: Priority::Normal,
            heap_words: DEFAULT_HEAP_WORDS,
            fullsweep_after: 65535,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Table(#[from] table::TableError),
    #[error("{0}:{1}/{2} is not an exported function")]
    Undef(Atom, Atom, u8),
    #[error("spawn argument is not a closure")]
    NotAClosure,
}

pub struct Spawned {
    pub pid: ProcessId,
    /// Monitor reference when `options.monitor` was set
    pub monitor: Option<u64>,
}

/// Spawns a process running `module:function(args…)`. `args` are terms on
/// the parent's heap (`source`); with no parent they must be immediates.
pub fn spawn_mfa(
    parent: Option<(&Process, &mut ProcessBody)>,
    module: Atom,
    function: Atom,
    args: &[OpaqueTerm],
    options: SpawnOptions,
) -> Result<Spawned, SpawnError> {
    let arity = args.len() as u8;
    let (instance, offset) = code::resolve(module, function, arity)
        .ok_or(SpawnError::Undef(module, function, arity))?;
    let frame_size = function_frame(&instance.code, offset);
    spawn_at(
        parent,
        (module, function, arity),
        CodePtr { instance: instance.id, offset: offset + 1 },
        frame_size,
        args,
        &[],
        options,
    )
}

/// Spawns a process applying a zero-arity closure on the parent's heap.
pub fn spawn_closure(
    parent: (&Process, &mut ProcessBody),
    closure: OpaqueTerm,
    options: SpawnOptions,
) -> Result<Spawned, SpawnError> {
    let (parent_process, parent_body) = parent;
    if !parent_body.heap.is_closure(closure) {
        return Err(SpawnError::NotAClosure);
    }
    let (instance_id, fun, arity, env_len) = parent_body.heap.closure_parts(closure);
    if arity != 0 {
        return Err(SpawnError::NotAClosure);
    }
    let instance = code::instance(instance_id).ok_or(SpawnError::NotAClosure)?;
    let lambda = instance.lambdas.get(fun as usize).ok_or(SpawnError::NotAClosure)?;
    debug_assert_eq!(lambda.env_len as usize, env_len);

    let env: Vec<OpaqueTerm> =
        (0..env_len).map(|i| parent_body.heap.closure_env(closure, i)).collect();
    let frame_size = function_frame(&instance.code, lambda.offset);
    spawn_at(
        Some((parent_process, parent_body)),
        (instance.name, lambda.function, 0),
        CodePtr { instance: instance.id, offset: lambda.offset + 1 },
        frame_size,
        &env,
        &[],
        options,
    )
}

/// The frame size declared by the `FuncInfo` header at `offset`.
fn function_frame(code: &[Opcode], offset: u32) -> u16 {
    match code.get(offset as usize) {
        Some(Opcode::FuncInfo { frame_size, .. }) => *frame_size,
        _ => 0,
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_at(
    parent: Option<(&Process, &mut ProcessBody)>,
    initial_call: (Atom, Atom, u8),
    entry: CodePtr,
    frame_size: u16,
    args: &[OpaqueTerm],
    extra: &[OpaqueTerm],
    options: SpawnOptions,
) -> Result<Spawned, SpawnError> {
    let pid = table::allocate_pid()?;
    let group_leader = parent
        .as_ref()
        .map(|(_, body)| body.group_leader)
        .unwrap_or(pid);

    // Size the initial heap to hold the copied arguments outright
    let args_words: usize = parent
        .as_ref()
        .map(|(_, body)| {
            args.iter().chain(extra).map(|arg| body.heap.term_size(*arg)).sum()
        })
        .unwrap_or(0);
    let heap_words = options.heap_words.max(args_words + args_words / 2 + 16);

    let process = Arc::new(Process::new(
        pid,
        parent.as_ref().map(|(p, _)| p.pid()),
        options.priority,
        heap_words,
        options.fullsweep_after,
        group_leader,
        initial_call,
    ));

    let mut monitor = None;
    {
        let mut body = process.body();
        body.ip = entry;
        body.regs = vec![OpaqueTerm::NIL; frame_size as usize];
        match parent {
            Some((parent_process, parent_body)) => {
                for (i, arg) in args.iter().chain(extra).enumerate() {
                    body.regs[i] = body
                        .heap
                        .copy_from(&parent_body.heap, *arg)
                        .expect("initial heap was sized for the arguments");
                }
                // Links and monitors are installed directly on both sides:
                // neither process can run or exit during this window
                if options.link {
                    parent_body.links.insert(pid);
                    body.links.insert(parent_process.pid());
                }
                if options.monitor {
                    let reference = next_reference_id();
                    parent_body.monitors.watch(reference, pid);
                    body.monitors.watched_by(reference, parent_process.pid());
                    monitor = Some(reference);
                }
            }
            None => {
                for (i, arg) in args.iter().enumerate() {
                    debug_assert!(arg.is_immediate());
                    body.regs[i] = *arg;
                }
            }
        }
    }

    trace!(
        target: "process",
        "spawned {} at {}:{}/{} (frame {})",
        pid,
        initial_call.0,
        initial_call.1,
        initial_call.2,
        frame_size
    );
    table::insert(process.clone());
    crate::scheduler::enqueue(process);
    Ok(Spawned { pid, monitor })
}
