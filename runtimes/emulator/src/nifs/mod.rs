//! Natively implemented functions.
//!
//! A NIF is bound to a `{module, function, arity}` and overrides any
//! bytecode export with the same signature. Calls are marshalled through
//! the [`sandbox`]: arguments are copied into a private heap fragment, the
//! call runs on a sandbox worker with its own stack and a panic boundary,
//! and the result is copied back onto the caller's heap. The only surface
//! a NIF has on the runtime is its [`NifEnv`].
//!
//! A fault caught by the boundary is re-raised in the caller as a
//! catchable `error` with reason `{native_fault, Kind, Detail}`; uncaught,
//! it terminates exactly the calling process.

pub mod loader;
pub mod sandbox;

pub use self::loader::{
    load_library, load_source, lookup, register_extension, NifExtension, NifFunction,
    NifLoadError,
};

use std::sync::Arc;

use ember_rt::error::Exception;
use ember_rt::heap::{HeapFull, ProcessHeap};
use ember_rt::process::{collect_garbage, PendingExit, Process, ProcessBody};
use ember_rt::scheduler::DirtyKind;
use ember_rt::term::{atoms, Atom, OpaqueTerm};

/// Sentinel the marker export must return for a library to load.
pub const NIF_SENTINEL: u32 = 0x5341_4645;
/// Metadata version this runtime accepts.
pub const NIF_API_VERSION: u32 = 1;

pub mod flags {
    pub const DIRTY_CPU: u32 = 1 << 0;
    pub const DIRTY_IO: u32 = 1 << 1;
}

/// A Rust-native NIF body: runs against the per-call environment.
pub type RustNif = fn(&mut NifEnv<'_>, &[OpaqueTerm]) -> Result<OpaqueTerm, NifError>;

/// Recoverable NIF errors: surfaced as ordinary language exceptions in
/// the caller without terminating it.
#[derive(Debug)]
pub enum NifError {
    Badarg,
    /// Raise `error(Reason)` with a reason term built through the env
    Raise(OpaqueTerm),
}

/// The per-call environment: term construction on a private fragment plus
/// read access to the argument terms. Everything a NIF builds lives in
/// the fragment until the runtime links the result into the caller.
pub struct NifEnv<'a> {
    heap: &'a mut ProcessHeap,
}

impl<'a> NifEnv<'a> {
    pub(crate) fn new(heap: &'a mut ProcessHeap) -> Self {
        Self { heap }
    }

    pub fn make_int(&mut self, value: i64) -> Result<OpaqueTerm, NifError> {
        self.heap.integer(value).map_err(|_| NifError::Badarg)
    }

    pub fn make_atom(&mut self, name: &str) -> Result<OpaqueTerm, NifError> {
        Atom::intern(name).map(OpaqueTerm::make_atom).map_err(|_| NifError::Badarg)
    }

    pub fn make_tuple(&mut self, elems: &[OpaqueTerm]) -> Result<OpaqueTerm, NifError> {
        self.heap.tuple(elems).map_err(|_| NifError::Badarg)
    }

    pub fn make_list(&mut self, elems: &[OpaqueTerm]) -> Result<OpaqueTerm, NifError> {
        self.heap.list_from_slice(elems, OpaqueTerm::NIL).map_err(|_| NifError::Badarg)
    }

    pub fn make_binary(&mut self, bytes: &[u8]) -> Result<OpaqueTerm, NifError> {
        self.heap.binary(bytes).map_err(|_| NifError::Badarg)
    }

    pub fn get_int(&self, term: OpaqueTerm) -> Result<i64, NifError> {
        if term.is_small() {
            Ok(term.small_value())
        } else {
            Err(NifError::Badarg)
        }
    }

    pub fn get_atom(&self, term: OpaqueTerm) -> Result<Atom, NifError> {
        if term.is_atom() {
            Ok(term.atom_value())
        } else {
            Err(NifError::Badarg)
        }
    }

    pub fn get_binary(&self, term: OpaqueTerm) -> Result<Vec<u8>, NifError> {
        if self.heap.is_binary(term) {
            Ok(self.heap.binary_to_vec(term))
        } else {
            Err(NifError::Badarg)
        }
    }

    pub fn get_tuple(&self, term: OpaqueTerm) -> Result<Vec<OpaqueTerm>, NifError> {
        if self.heap.is_tuple(term) {
            let arity = self.heap.tuple_arity(term);
            Ok((0..arity).map(|i| self.heap.tuple_element(term, i)).collect())
        } else {
            Err(NifError::Badarg)
        }
    }

    pub fn get_list(&self, term: OpaqueTerm) -> Result<Vec<OpaqueTerm>, NifError> {
        let mut out = Vec::new();
        let mut cursor = term;
        while cursor.is_cons() {
            out.push(self.heap.cons_head(cursor));
            cursor = self.heap.cons_tail(cursor);
        }
        if cursor.is_nil() {
            Ok(out)
        } else {
            Err(NifError::Badarg)
        }
    }

    pub fn heap(&mut self) -> &mut ProcessHeap {
        self.heap
    }
}

/// The callable form behind a registered NIF.
#[derive(Clone)]
pub enum NifCallable {
    /// Statically linked, written in Rust against [`NifEnv`]
    Rust(RustNif),
    /// Loaded from a verified shared object
    Foreign(loader::ForeignNif),
}

/// A registered NIF entry point.
#[derive(Clone)]
pub struct NifEntry {
    pub module: Atom,
    pub name: Atom,
    pub arity: u8,
    pub flags: u32,
    pub callable: NifCallable,
}

impl NifEntry {
    pub fn dirty_kind(&self) -> Option<DirtyKind> {
        if self.flags & flags::DIRTY_CPU != 0 {
            Some(DirtyKind::Cpu)
        } else if self.flags & flags::DIRTY_IO != 0 {
            Some(DirtyKind::Io)
        } else {
            None
        }
    }
}

/// Outcome of a sandboxed NIF call, from the engine's point of view.
pub enum NifOutcome {
    Value(OpaqueTerm),
    Raise(Exception),
}

/// A call parked across a dirty-scheduler migration.
pub struct PendingNif {
    pub entry: NifEntry,
    pub args_base: u16,
    pub arity: u8,
    pub dst: Option<u16>,
}

/// Runs `entry` against the argument window, isolating the call and
/// linking the result (or fault) back into the caller.
pub fn call(
    process: &Arc<Process>,
    body: &mut ProcessBody,
    entry: &NifEntry,
    args_base: u16,
    arity: u8,
    reds: &mut i64,
) -> NifOutcome {
    // Stage the arguments in a private fragment; the caller's heap is
    // untouched (and unmoved) for the duration of the call
    let mut fragment = ProcessHeap::fragment();
    let mut args = Vec::with_capacity(arity as usize);
    for i in 0..arity as usize {
        let arg = body.regs[args_base as usize + i];
        let staged = fragment
            .copy_from(&body.heap, arg)
            .expect("fragments grow on demand");
        args.push(staged);
    }
    *reds -= 1 + (fragment.young_used() / 64) as i64;

    match sandbox::execute(entry.callable.clone(), fragment, args) {
        Ok((result_heap, Ok(value))) => {
            let value = link_result(body, &result_heap, value);
            NifOutcome::Value(value)
        }
        Ok((_, Err(NifError::Badarg))) => NifOutcome::Raise(Exception::badarg()),
        Ok((result_heap, Err(NifError::Raise(reason)))) => {
            let reason = link_result(body, &result_heap, reason);
            NifOutcome::Raise(Exception::error(reason))
        }
        Err(fault) => {
            log::warn!(
                target: "nif",
                "{} fault in {}:{}/{}: {}",
                process.pid(),
                entry.module,
                entry.name,
                entry.arity,
                fault.detail
            );
            let reason = native_fault_reason(body, &fault);
            NifOutcome::Raise(Exception::error(reason))
        }
    }
}

/// Completes a dirty-parked call on a dirty scheduler thread.
pub fn execute_pending(
    process: &Arc<Process>,
    body: &mut ProcessBody,
    pending: PendingNif,
) -> Result<(), PendingExit> {
    let mut reds = i64::MAX;
    let outcome = call(process, body, &pending.entry, pending.args_base, pending.arity, &mut reds);
    match outcome {
        NifOutcome::Value(value) => {
            crate::emulator::complete_parked_call(body, pending.dst, value)
        }
        NifOutcome::Raise(ex) => crate::emulator::unwind_parked(body, ex),
    }
}

/// Copies a term the NIF built in its fragment onto the caller's heap,
/// collecting as needed. The argument window keeps the inputs rooted.
fn link_result(body: &mut ProcessBody, fragment: &ProcessHeap, value: OpaqueTerm) -> OpaqueTerm {
    loop {
        match body.heap.copy_from(fragment, value) {
            Ok(linked) => return linked,
            Err(HeapFull { need }) => {
                collect_garbage(body, need);
            }
        }
    }
}

/// `{native_fault, Kind, Detail}` on the caller's heap.
fn native_fault_reason(body: &mut ProcessBody, fault: &sandbox::NifFault) -> OpaqueTerm {
    loop {
        let attempt = body
            .heap
            .binary(fault.detail.as_bytes())
            .and_then(|detail| {
                body.heap.tuple(&[
                    OpaqueTerm::make_atom(atoms::NATIVE_FAULT),
                    OpaqueTerm::make_atom(fault.kind),
                    detail,
                ])
            });
        match attempt {
            Ok(reason) => return reason,
            Err(HeapFull { need }) => {
                collect_garbage(body, need);
            }
        }
    }
}
