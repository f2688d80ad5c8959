//! The bytecode execution engine.
//!
//! The engine runs one process at a time: it restores the instruction
//! pointer and register file, dispatches instructions until the reduction
//! budget is spent, the process parks in a receive, or it exits, and hands
//! the verdict back to the scheduler. Every instruction boundary is a safe
//! point: signals are drained at slice entry and at receive and call
//! boundaries, and a failed allocation collects and re-executes the
//! current instruction, whose inputs all still sit in the register file.

use std::cmp::Ordering;
use std::sync::Arc;

use log::trace;
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use ember_bytecode::Opcode;
use ember_rt::code::{self, ModuleInstance};
use ember_rt::error::{Exception, ExceptionClass};
use ember_rt::heap::{HeapFull, Number, ProcessHeap};
use ember_rt::process::{
    collect_garbage, should_collect, signals, status, CatchFrame, CodePtr, Frame, PendingExit,
    Process, ProcessBody, Signal,
};
use ember_rt::scheduler::{timers, DirtyOutcome, Engine, Execution, Scheduler};
use ember_rt::term::{atoms, Atom, OpaqueTerm};
use ember_rt::map;

use crate::bifs::{self, BifOutcome};
use crate::nifs::{self, NifOutcome, PendingNif};

pub struct Emulator;

impl Emulator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Emulator {
    fn run(&self, scheduler: &Scheduler, process: &Arc<Process>, reductions: u32) -> Execution {
        let mut guard = process.body();
        let body = &mut *guard;

        // Entry safe point: pending signals may already decide our fate
        if let Some(exit) = signals::drain(process, body) {
            return Execution::Exited(exit);
        }

        let mut reds = reductions as i64;
        let verdict = dispatch(scheduler, process, body, &mut reds);
        process.add_reductions((reductions as i64 - reds).max(0) as u64);
        verdict
    }

    fn run_dirty(&self, process: &Arc<Process>) -> DirtyOutcome {
        let mut guard = process.body();
        let body = &mut *guard;
        let pending = match body.dirty.take() {
            Some(boxed) => match boxed.downcast::<PendingNif>() {
                Ok(pending) => *pending,
                Err(_) => return DirtyOutcome::Resume,
            },
            None => return DirtyOutcome::Resume,
        };
        match nifs::execute_pending(process, body, pending) {
            Ok(()) => DirtyOutcome::Resume,
            Err(exit) => DirtyOutcome::Exited(exit),
        }
    }
}

/// Arguments ready in the current register window.
#[derive(Clone, Copy)]
struct ArgWindow {
    base: u16,
    arity: u8,
}

fn dispatch(
    scheduler: &Scheduler,
    process: &Arc<Process>,
    body: &mut ProcessBody,
    reds: &mut i64,
) -> Execution {
    let mut instance = match code::instance(body.ip.instance) {
        Some(instance) => instance,
        None => {
            // The owning module vanished mid-flight; treat as undef
            return Execution::Exited(exit_for_exception(body, Exception::undef()));
        }
    };
    let mut offset = body.ip.offset;

    macro_rules! park {
        () => {{
            body.ip = CodePtr { instance: instance.id, offset };
        }};
    }
    // Raise or unwind; on uncaught exceptions turns into an exit. The
    // exception expression is evaluated before `body` is reborrowed.
    macro_rules! throw {
        ($ex:expr) => {{
            let ex = $ex;
            match unwind(body, &mut instance, &mut offset, ex) {
                Ok(()) => continue,
                Err(exit) => return Execution::Exited(exit),
            }
        }};
    }
    // Allocation with collect-and-retry; restarts the current instruction
    macro_rules! alloc {
        ($e:expr) => {
            match $e {
                Ok(value) => value,
                Err(HeapFull { need }) => {
                    collect_garbage(body, need);
                    continue;
                }
            }
        };
    }

    loop {
        if *reds <= 0 {
            park!();
            if should_collect(body) {
                collect_garbage(body, 0);
            }
            return Execution::Yielded;
        }

        let op = match instance.code.get(offset as usize) {
            Some(op) => op.clone(),
            None => {
                // Fell off the end of the code section
                throw!(Exception::undef());
            }
        };
        trace!(target: "emulator", "{} @{}:{} {:?}", process.pid(), instance.id, offset, op);

        match op {
            Opcode::Nop => offset += 1,
            Opcode::FuncInfo { .. } => {
                throw!(Exception::error(OpaqueTerm::make_atom(atoms::FUNCTION_CLAUSE)));
            }

            Opcode::Mov { dst, src } => {
                body.regs[dst as usize] = body.regs[src as usize];
                offset += 1;
            }
            Opcode::LoadAtom { dst, atom } => {
                body.regs[dst as usize] = OpaqueTerm::make_atom(instance.atoms[atom as usize]);
                offset += 1;
            }
            Opcode::LoadInt { dst, value } => {
                let term = alloc!(body.heap.integer(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::LoadNil { dst } => {
                body.regs[dst as usize] = OpaqueTerm::NIL;
                offset += 1;
            }
            Opcode::LoadLiteral { dst, literal } => {
                let term = instance.literals[literal as usize];
                if term.is_literal() {
                    body.heap.vote_literal(term.literal_area());
                }
                body.regs[dst as usize] = term;
                offset += 1;
            }

            Opcode::Br { label } => offset = label,
            Opcode::Brt { label, src } => match body.regs[src as usize].as_bool() {
                Some(true) => offset = label,
                Some(false) => offset += 1,
                None => throw!(Exception::badarg()),
            },
            Opcode::Brf { label, src } => match body.regs[src as usize].as_bool() {
                Some(false) => offset = label,
                Some(true) => offset += 1,
                None => throw!(Exception::badarg()),
            },
            Opcode::Ret { src } => {
                let value = body.regs[src as usize];
                match do_return(body, &mut instance, &mut offset, value) {
                    Some(execution) => return execution,
                    None => {}
                }
            }
            Opcode::Halt { src } => {
                let value = body.regs[src as usize];
                if !value.is_small() {
                    throw!(Exception::badarg());
                }
                park!();
                return Execution::Halted(value.small_value() as i32);
            }
            Opcode::Reduce => {
                *reds -= 1;
                offset += 1;
            }

            Opcode::Call { dst, offset: target, arity, args } => {
                *reds -= 1;
                if let Some(exit) = drain_if_signalled(process, body) {
                    return Execution::Exited(exit);
                }
                do_call(body, &instance, target, ArgWindow { base: args, arity }, dst, offset + 1);
                offset = body.ip.offset;
            }
            Opcode::Enter { offset: target, arity, args } => {
                *reds -= 1;
                if let Some(exit) = drain_if_signalled(process, body) {
                    return Execution::Exited(exit);
                }
                do_enter(body, &instance, target, ArgWindow { base: args, arity });
                offset = body.ip.offset;
            }
            Opcode::CallStatic { dst, import, args } => {
                *reds -= 1;
                if let Some(exit) = drain_if_signalled(process, body) {
                    return Execution::Exited(exit);
                }
                let (m, f, a) = instance.imports[import as usize];
                match qualified_call(
                    scheduler,
                    process,
                    body,
                    &mut instance,
                    &mut offset,
                    reds,
                    (m, f, a),
                    ArgWindow { base: args, arity: a },
                    Some(dst),
                ) {
                    QualifiedFlow::Done => {}
                    QualifiedFlow::Raise(ex) => throw!(ex),
                    QualifiedFlow::Control(execution) => return execution,
                }
            }
            Opcode::EnterStatic { import, args } => {
                *reds -= 1;
                if let Some(exit) = drain_if_signalled(process, body) {
                    return Execution::Exited(exit);
                }
                let (m, f, a) = instance.imports[import as usize];
                match qualified_call(
                    scheduler,
                    process,
                    body,
                    &mut instance,
                    &mut offset,
                    reds,
                    (m, f, a),
                    ArgWindow { base: args, arity: a },
                    None,
                ) {
                    QualifiedFlow::Done => {}
                    QualifiedFlow::Raise(ex) => throw!(ex),
                    QualifiedFlow::Control(execution) => return execution,
                }
            }
            Opcode::CallClosure { dst, fun, arity, args } => {
                *reds -= 1;
                match closure_call(body, &mut instance, &mut offset, fun, arity, args, Some(dst)) {
                    Ok(()) => {}
                    Err(ex) => throw!(ex),
                }
            }
            Opcode::EnterClosure { fun, arity, args } => {
                *reds -= 1;
                match closure_call(body, &mut instance, &mut offset, fun, arity, args, None) {
                    Ok(()) => {}
                    Err(ex) => throw!(ex),
                }
            }

            // Type tests: fall through on success, branch to `fail` otherwise
            Opcode::IsAtom { fail, src } => {
                offset = test(body.regs[src as usize].is_atom(), offset, fail)
            }
            Opcode::IsNil { fail, src } => {
                offset = test(body.regs[src as usize].is_nil(), offset, fail)
            }
            Opcode::IsInt { fail, src } => {
                offset = test(body.heap.is_integer(body.regs[src as usize]), offset, fail)
            }
            Opcode::IsFloat { fail, src } => {
                offset = test(body.heap.is_float(body.regs[src as usize]), offset, fail)
            }
            Opcode::IsNumber { fail, src } => {
                offset = test(body.heap.is_number(body.regs[src as usize]), offset, fail)
            }
            Opcode::IsTuple { fail, src } => {
                offset = test(body.heap.is_tuple(body.regs[src as usize]), offset, fail)
            }
            Opcode::IsTaggedTuple { fail, src, arity, atom } => {
                let term = body.regs[src as usize];
                let wanted = OpaqueTerm::make_atom(instance.atoms[atom as usize]);
                let ok = body.heap.is_tuple(term)
                    && body.heap.tuple_arity(term) == arity as usize
                    && arity > 0
                    && body.heap.tuple_element(term, 0) == wanted;
                offset = test(ok, offset, fail);
            }
            Opcode::IsCons { fail, src } => {
                offset = test(body.regs[src as usize].is_cons(), offset, fail)
            }
            Opcode::IsList { fail, src } => {
                offset = test(body.heap.is_list(body.regs[src as usize]), offset, fail)
            }
            Opcode::IsMap { fail, src } => {
                offset = test(body.heap.is_map(body.regs[src as usize]), offset, fail)
            }
            Opcode::IsBinary { fail, src } => {
                offset = test(body.heap.is_binary(body.regs[src as usize]), offset, fail)
            }
            Opcode::IsPid { fail, src } => {
                offset = test(body.regs[src as usize].is_pid(), offset, fail)
            }
            Opcode::IsRef { fail, src } => {
                let term = body.regs[src as usize];
                let ok = term.is_local_ref()
                    || body.heap.box_kind(term) == Some(ember_rt::term::BoxKind::ExternalRef);
                offset = test(ok, offset, fail);
            }
            Opcode::IsFunction { fail, src } => {
                offset = test(body.heap.is_closure(body.regs[src as usize]), offset, fail)
            }

            Opcode::IsEq { fail, a, b } => {
                let ok = body.heap.eq(body.regs[a as usize], body.regs[b as usize]);
                offset = test(ok, offset, fail);
            }
            Opcode::IsNe { fail, a, b } => {
                let ok = !body.heap.eq(body.regs[a as usize], body.regs[b as usize]);
                offset = test(ok, offset, fail);
            }
            Opcode::IsEqExact { fail, a, b } => {
                let ok = body.heap.exact_eq(body.regs[a as usize], body.regs[b as usize]);
                offset = test(ok, offset, fail);
            }
            Opcode::IsNeExact { fail, a, b } => {
                let ok = !body.heap.exact_eq(body.regs[a as usize], body.regs[b as usize]);
                offset = test(ok, offset, fail);
            }
            Opcode::IsLt { fail, a, b } => {
                let ok = body.heap.compare(body.regs[a as usize], body.regs[b as usize], false)
                    == Ordering::Less;
                offset = test(ok, offset, fail);
            }
            Opcode::IsGe { fail, a, b } => {
                let ok = body.heap.compare(body.regs[a as usize], body.regs[b as usize], false)
                    != Ordering::Less;
                offset = test(ok, offset, fail);
            }

            Opcode::MakeTuple { dst, base, arity } => {
                let elems: Vec<OpaqueTerm> = (0..arity as usize)
                    .map(|i| body.regs[base as usize + i])
                    .collect();
                let term = alloc!(body.heap.tuple(&elems));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::GetElement { dst, src, index } => {
                let tuple = body.regs[src as usize];
                if !body.heap.is_tuple(tuple)
                    || index as usize >= body.heap.tuple_arity(tuple)
                {
                    throw!(Exception::badarg());
                }
                body.regs[dst as usize] = body.heap.tuple_element(tuple, index as usize);
                offset += 1;
            }
            Opcode::SetElement { dst, src, index, value } => {
                let tuple = body.regs[src as usize];
                if !body.heap.is_tuple(tuple)
                    || index as usize >= body.heap.tuple_arity(tuple)
                {
                    throw!(Exception::badarg());
                }
                let arity = body.heap.tuple_arity(tuple);
                let mut elems: Vec<OpaqueTerm> =
                    (0..arity).map(|i| body.heap.tuple_element(tuple, i)).collect();
                elems[index as usize] = body.regs[value as usize];
                let term = alloc!(body.heap.tuple(&elems));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::GetArity { dst, src } => {
                let tuple = body.regs[src as usize];
                if !body.heap.is_tuple(tuple) {
                    throw!(Exception::badarg());
                }
                body.regs[dst as usize] =
                    OpaqueTerm::make_small(body.heap.tuple_arity(tuple) as i64);
                offset += 1;
            }
            Opcode::Cons { dst, head, tail } => {
                let term =
                    alloc!(body.heap.cons(body.regs[head as usize], body.regs[tail as usize]));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Head { dst, src } => {
                let cons = body.regs[src as usize];
                if !cons.is_cons() {
                    throw!(Exception::badarg());
                }
                body.regs[dst as usize] = body.heap.cons_head(cons);
                offset += 1;
            }
            Opcode::Tail { dst, src } => {
                let cons = body.regs[src as usize];
                if !cons.is_cons() {
                    throw!(Exception::badarg());
                }
                body.regs[dst as usize] = body.heap.cons_tail(cons);
                offset += 1;
            }
            Opcode::MakeMap { dst, base, pairs } => {
                let kvs: Vec<(OpaqueTerm, OpaqueTerm)> = (0..pairs as usize)
                    .map(|i| {
                        (body.regs[base as usize + i * 2], body.regs[base as usize + i * 2 + 1])
                    })
                    .collect();
                let term = alloc!(map::map_from_pairs(&mut body.heap, &kvs));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::MapGet { fail, dst, map: src, key } => {
                let map_term = body.regs[src as usize];
                if !body.heap.is_map(map_term) {
                    throw!(badmap(body, map_term));
                }
                match map::map_get(&body.heap, map_term, body.regs[key as usize]) {
                    Some(value) => {
                        body.regs[dst as usize] = value;
                        offset += 1;
                    }
                    None => offset = fail,
                }
            }
            Opcode::MapPut { dst, map: src, key, value } => {
                let map_term = body.regs[src as usize];
                if !body.heap.is_map(map_term) {
                    throw!(badmap(body, map_term));
                }
                let term = alloc!(map::map_put(
                    &mut body.heap,
                    map_term,
                    body.regs[key as usize],
                    body.regs[value as usize],
                ));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::MakeClosure { dst, fun, base, env_len } => {
                let lambda = instance.lambdas[fun as usize];
                let env: Vec<OpaqueTerm> = (0..env_len as usize)
                    .map(|i| body.regs[base as usize + i])
                    .collect();
                let term =
                    alloc!(body.heap.closure(instance.id, fun, lambda.arity, &env));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::UnpackEnv { dst, closure, index } => {
                let term = body.regs[closure as usize];
                if !body.heap.is_closure(term) {
                    throw!(Exception::badarg());
                }
                body.regs[dst as usize] = body.heap.closure_env(term, index as usize);
                offset += 1;
            }

            Opcode::Add { dst, a, b } => {
                let value = match arith2(body, a, b, ArithOp::Add) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Sub { dst, a, b } => {
                let value = match arith2(body, a, b, ArithOp::Sub) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Mul { dst, a, b } => {
                let value = match arith2(body, a, b, ArithOp::Mul) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Divide { dst, a, b } => {
                let value = match arith2(body, a, b, ArithOp::Fdiv) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::DivInt { dst, a, b } => {
                let value = match arith2(body, a, b, ArithOp::Div) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Rem { dst, a, b } => {
                let value = match arith2(body, a, b, ArithOp::Rem) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Neg { dst, src } => {
                let value = match body.heap.number_value(body.regs[src as usize]) {
                    Some(Number::Int(i)) => match i.checked_neg() {
                        Some(n) => Number::Int(n),
                        None => Number::Big(-BigInt::from(i)),
                    },
                    Some(Number::Big(b)) => Number::Big(-b),
                    Some(Number::Float(f)) => Number::Float(-f),
                    None => throw!(Exception::badarith()),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Band { dst, a, b } => {
                let value = match bitwise2(body, a, b, BitOp::And) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Bor { dst, a, b } => {
                let value = match bitwise2(body, a, b, BitOp::Or) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Bxor { dst, a, b } => {
                let value = match bitwise2(body, a, b, BitOp::Xor) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Bnot { dst, src } => {
                let value = match integer_value(body, src) {
                    Ok(value) => Number::Big(!value),
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Bsl { dst, a, b } => {
                let value = match shift(body, a, b, true) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Bsr { dst, a, b } => {
                let value = match shift(body, a, b, false) {
                    Ok(value) => value,
                    Err(ex) => throw!(ex),
                };
                let term = alloc!(body.heap.number(value));
                body.regs[dst as usize] = term;
                offset += 1;
            }
            Opcode::Not { dst, src } => match body.regs[src as usize].as_bool() {
                Some(value) => {
                    body.regs[dst as usize] = OpaqueTerm::make_bool(!value);
                    offset += 1;
                }
                None => throw!(Exception::badarg()),
            },
            Opcode::And { dst, a, b } => match bool2(body, a, b) {
                Ok((x, y)) => {
                    body.regs[dst as usize] = OpaqueTerm::make_bool(x && y);
                    offset += 1;
                }
                Err(ex) => throw!(ex),
            },
            Opcode::Or { dst, a, b } => match bool2(body, a, b) {
                Ok((x, y)) => {
                    body.regs[dst as usize] = OpaqueTerm::make_bool(x || y);
                    offset += 1;
                }
                Err(ex) => throw!(ex),
            },

            Opcode::Catch { handler } => {
                body.catches.push(CatchFrame {
                    frame_depth: body.frames.len(),
                    handler: CodePtr { instance: instance.id, offset: handler },
                });
                offset += 1;
            }
            Opcode::EndCatch => {
                body.catches.pop();
                offset += 1;
            }
            Opcode::Raise { class, reason } => {
                let class = match body.regs[class as usize] {
                    t if t.is_atom() => ExceptionClass::from_atom(t.atom_value()),
                    _ => None,
                };
                let Some(class) = class else {
                    throw!(Exception::badarg());
                };
                let reason = body.regs[reason as usize];
                throw!(Exception { class, reason, trace: OpaqueTerm::NIL });
            }
            Opcode::StackTrace { dst } => {
                let trace = alloc!(build_stack_trace(body, &instance, offset));
                body.regs[dst as usize] = trace;
                offset += 1;
            }

            Opcode::Send { to, msg } => {
                if let Some(exit) = drain_if_signalled(process, body) {
                    return Execution::Exited(exit);
                }
                match do_send(process, body, to, msg, reds) {
                    Ok(()) => offset += 1,
                    Err(ex) => throw!(ex),
                }
            }
            Opcode::RecvPeek { dst, empty } => {
                if let Some(exit) = drain_if_signalled(process, body) {
                    return Execution::Exited(exit);
                }
                match body.mailbox.peek() {
                    Some(message) => {
                        body.regs[dst as usize] = message.term;
                        offset += 1;
                    }
                    None => offset = empty,
                }
            }
            Opcode::RecvNext => {
                body.mailbox.advance();
                offset += 1;
            }
            Opcode::RecvPop => {
                body.mailbox.take();
                if let Some(token) = body.timer.take() {
                    timers::cancel(token);
                }
                body.timed_out = false;
                offset += 1;
            }
            Opcode::RecvWait { peek, timeout } => {
                if let Some(exit) = drain_if_signalled(process, body) {
                    return Execution::Exited(exit);
                }
                // A signal may have queued a fresh message: go match it
                if body.mailbox.peek().is_some() {
                    offset = peek;
                    continue;
                }
                if body.timed_out {
                    // The armed timer fired: fall through to the timeout body
                    body.timed_out = false;
                    body.mailbox.rewind();
                    offset += 1;
                    continue;
                }
                let timeout_term = body.regs[timeout as usize];
                if timeout_term == OpaqueTerm::make_atom(atoms::INFINITY) {
                    // Park without a timer
                } else if timeout_term.is_small() && timeout_term.small_value() >= 0 {
                    if body.timer.is_none() {
                        let ms = timeout_term.small_value() as u64;
                        body.timer = Some(timers::arm(
                            std::time::Duration::from_millis(ms),
                            process.pid(),
                        ));
                    }
                } else {
                    throw!(Exception::error(OpaqueTerm::make_atom(atoms::TIMEOUT_VALUE)));
                }

                // Park on this instruction; a wake re-executes RecvWait
                body.ip = CodePtr { instance: instance.id, offset };
                if !process.status().transition(
                    status::RUNNING,
                    status::EXITING,
                    status::RUNNING,
                    status::WAITING,
                ) {
                    continue;
                }
                // Re-check for the race where a signal landed between the
                // mailbox check and the status change
                if process.has_signals() || body.timed_out {
                    if process.status().transition(
                        status::WAITING,
                        0,
                        status::WAITING,
                        status::RUNNING,
                    ) {
                        continue;
                    }
                    // Someone else already woke us; run with it
                    continue;
                }
                return Execution::Waiting;
            }
        }
    }
}

#[inline]
fn test(ok: bool, offset: u32, fail: u32) -> u32 {
    if ok {
        offset + 1
    } else {
        fail
    }
}

fn drain_if_signalled(process: &Arc<Process>, body: &mut ProcessBody) -> Option<PendingExit> {
    if process.has_signals() {
        signals::drain(process, body)
    } else {
        None
    }
}

/// `{badmap, Term}` with the offending term attached when it fits.
fn badmap(body: &mut ProcessBody, term: OpaqueTerm) -> Exception {
    match body.heap.tuple(&[OpaqueTerm::make_atom(atoms::BADMAP), term]) {
        Ok(reason) => Exception::error(reason),
        Err(_) => Exception::error(OpaqueTerm::make_atom(atoms::BADMAP)),
    }
}

fn function_frame_size(instance: &ModuleInstance, header_offset: u32) -> u16 {
    match instance.code.get(header_offset as usize) {
        Some(Opcode::FuncInfo { frame_size, .. }) => *frame_size,
        _ => 0,
    }
}

/// Intra-module call: push the caller frame, build the callee window.
fn do_call(
    body: &mut ProcessBody,
    instance: &Arc<ModuleInstance>,
    target: u32,
    args: ArgWindow,
    dst: u16,
    ret_offset: u32,
) {
    let frame_size = function_frame_size(instance, target);
    let saved = std::mem::take(&mut body.regs);
    let mut regs = vec![OpaqueTerm::NIL; frame_size as usize];
    for i in 0..args.arity as usize {
        regs[i] = saved[args.base as usize + i];
    }
    body.frames.push(Frame {
        ret: CodePtr { instance: instance.id, offset: ret_offset },
        dst,
        saved_regs: saved,
    });
    body.regs = regs;
    body.ip = CodePtr { instance: instance.id, offset: target + 1 };
}

/// Intra-module tail call: replace the current window in place.
fn do_enter(
    body: &mut ProcessBody,
    instance: &Arc<ModuleInstance>,
    target: u32,
    args: ArgWindow,
) {
    let frame_size = function_frame_size(instance, target);
    let mut regs = vec![OpaqueTerm::NIL; frame_size as usize];
    for i in 0..args.arity as usize {
        regs[i] = body.regs[args.base as usize + i];
    }
    body.regs = regs;
    body.ip = CodePtr { instance: instance.id, offset: target + 1 };
}

/// Pops a frame and resumes the caller; with no caller left the process
/// finished its initial call and exits normally.
fn do_return(
    body: &mut ProcessBody,
    instance: &mut Arc<ModuleInstance>,
    offset: &mut u32,
    value: OpaqueTerm,
) -> Option<Execution> {
    match body.frames.pop() {
        Some(frame) => {
            body.regs = frame.saved_regs;
            body.regs[frame.dst as usize] = value;
            while body
                .catches
                .last()
                .map(|c| c.frame_depth > body.frames.len())
                .unwrap_or(false)
            {
                body.catches.pop();
            }
            if frame.ret.instance != instance.id {
                match code::instance(frame.ret.instance) {
                    Some(next) => *instance = next,
                    None => {
                        return Some(Execution::Exited(exit_for_exception(
                            body,
                            Exception::undef(),
                        )))
                    }
                }
            }
            *offset = frame.ret.offset;
            body.ip = frame.ret;
            None
        }
        None => Some(Execution::Exited(PendingExit::normal())),
    }
}

enum QualifiedFlow {
    Done,
    Raise(Exception),
    Control(Execution),
}

/// A fully-qualified call: NIF override first, then the BIF layer, then
/// the current version of the target module. This resolution point is
/// where a process migrates to newly loaded code.
#[allow(clippy::too_many_arguments)]
fn qualified_call(
    scheduler: &Scheduler,
    process: &Arc<Process>,
    body: &mut ProcessBody,
    instance: &mut Arc<ModuleInstance>,
    offset: &mut u32,
    reds: &mut i64,
    mfa: (Atom, Atom, u8),
    args: ArgWindow,
    dst: Option<u16>,
) -> QualifiedFlow {
    let (m, f, a) = mfa;

    // erlang:apply/3 re-enters resolution with a dynamic target
    if m == bifs::erlang_module() && f == bifs::apply_atom() && a == 3 {
        return apply_call(scheduler, process, body, instance, offset, reds, args, dst);
    }

    if let Some(entry) = nifs::lookup(m, f, a) {
        if let Some(kind) = entry.dirty_kind() {
            // Park the pending call and migrate to the dirty pool
            body.ip = CodePtr { instance: instance.id, offset: *offset };
            body.dirty = Some(Box::new(PendingNif {
                entry,
                args_base: args.base,
                arity: args.arity,
                dst,
            }));
            return QualifiedFlow::Control(Execution::Dirty(kind));
        }
        return match nifs::call(process, body, &entry, args.base, args.arity, reds) {
            NifOutcome::Value(value) => finish_call(body, instance, offset, value, dst),
            NifOutcome::Raise(ex) => QualifiedFlow::Raise(ex),
        };
    }

    if let Some(bif) = bifs::lookup(m, f, a) {
        let mut ctx = bifs::BifContext::new(scheduler, process, body, args.base, args.arity, reds);
        return match bif(&mut ctx) {
            Ok(BifOutcome::Value(value)) => finish_call(body, instance, offset, value, dst),
            Ok(BifOutcome::Halt(code)) => {
                body.ip = CodePtr { instance: instance.id, offset: *offset };
                QualifiedFlow::Control(Execution::Halted(code))
            }
            Err(ex) => QualifiedFlow::Raise(ex),
        };
    }

    match code::resolve(m, f, a) {
        Some((target, export_offset)) => {
            body.ip = CodePtr { instance: instance.id, offset: *offset + 1 };
            let frame_size = function_frame_size(&target, export_offset);
            let saved = std::mem::take(&mut body.regs);
            let mut regs = vec![OpaqueTerm::NIL; frame_size as usize];
            for i in 0..args.arity as usize {
                regs[i] = saved[args.base as usize + i];
            }
            match dst {
                Some(dst) => {
                    body.frames.push(Frame { ret: body.ip, dst, saved_regs: saved });
                }
                None => {
                    // Tail call: the caller frame is already gone
                }
            }
            body.regs = regs;
            *instance = target;
            *offset = export_offset + 1;
            body.ip = CodePtr { instance: instance.id, offset: *offset };
            QualifiedFlow::Done
        }
        None => QualifiedFlow::Raise(undef_exception(body, m, f, a)),
    }
}

/// Routes a BIF/NIF return value: into `dst` for a plain call, through the
/// frame stack for a tail call.
fn finish_call(
    body: &mut ProcessBody,
    instance: &mut Arc<ModuleInstance>,
    offset: &mut u32,
    value: OpaqueTerm,
    dst: Option<u16>,
) -> QualifiedFlow {
    match dst {
        Some(dst) => {
            body.regs[dst as usize] = value;
            *offset += 1;
            QualifiedFlow::Done
        }
        None => match do_return(body, instance, offset, value) {
            Some(execution) => QualifiedFlow::Control(execution),
            None => QualifiedFlow::Done,
        },
    }
}

/// `erlang:apply(M, F, Args)`: resolve at runtime and tail into the
/// qualified-call machinery with the arguments staged after the window.
#[allow(clippy::too_many_arguments)]
fn apply_call(
    scheduler: &Scheduler,
    process: &Arc<Process>,
    body: &mut ProcessBody,
    instance: &mut Arc<ModuleInstance>,
    offset: &mut u32,
    reds: &mut i64,
    args: ArgWindow,
    dst: Option<u16>,
) -> QualifiedFlow {
    let base = args.base as usize;
    let module = body.regs[base];
    let function = body.regs[base + 1];
    let list = body.regs[base + 2];
    if !module.is_atom() || !function.is_atom() {
        return QualifiedFlow::Raise(Exception::badarg());
    }
    let mut call_args = Vec::new();
    let mut cursor = list;
    while cursor.is_cons() {
        call_args.push(body.heap.cons_head(cursor));
        cursor = body.heap.cons_tail(cursor);
    }
    if !cursor.is_nil() || call_args.len() > u8::MAX as usize {
        return QualifiedFlow::Raise(Exception::badarg());
    }

    // Stage the arguments in a window past the live registers
    let staged_base = body.regs.len();
    body.regs.extend_from_slice(&call_args);
    let staged = ArgWindow { base: staged_base as u16, arity: call_args.len() as u8 };
    let flow = qualified_call(
        scheduler,
        process,
        body,
        instance,
        offset,
        reds,
        (module.atom_value(), function.atom_value(), call_args.len() as u8),
        staged,
        dst,
    );
    // For a plain call into a BIF/NIF the window is still in our frame:
    // trim the staging back off. Every other path replaced the register
    // file outright.
    if dst.is_some() && matches!(flow, QualifiedFlow::Done) && body.regs.len() > staged_base {
        body.regs.truncate(staged_base);
    }
    flow
}

fn closure_call(
    body: &mut ProcessBody,
    instance: &mut Arc<ModuleInstance>,
    offset: &mut u32,
    fun_reg: u16,
    arity: u8,
    args_base: u16,
    dst: Option<u16>,
) -> Result<(), Exception> {
    let closure = body.regs[fun_reg as usize];
    if !body.heap.is_closure(closure) {
        let reason = body
            .heap
            .tuple(&[OpaqueTerm::make_atom(atoms::BADFUN), closure])
            .unwrap_or_else(|_| OpaqueTerm::make_atom(atoms::BADFUN));
        return Err(Exception::error(reason));
    }
    let (instance_id, fun, closure_arity, env_len) = body.heap.closure_parts(closure);
    if closure_arity != arity {
        return Err(Exception::error(OpaqueTerm::make_atom(atoms::BADARITY)));
    }
    let target = code::instance(instance_id).ok_or_else(Exception::undef)?;
    let lambda = target.lambdas[fun as usize];

    let frame_size = function_frame_size(&target, lambda.offset);
    let mut regs = vec![OpaqueTerm::NIL; frame_size as usize];
    for i in 0..arity as usize {
        regs[i] = body.regs[args_base as usize + i];
    }
    for i in 0..env_len {
        regs[arity as usize + i] = body.heap.closure_env(closure, i);
    }

    body.ip = CodePtr { instance: instance.id, offset: *offset + 1 };
    match dst {
        Some(dst) => {
            let saved = std::mem::replace(&mut body.regs, regs);
            body.frames.push(Frame { ret: body.ip, dst, saved_regs: saved });
        }
        None => body.regs = regs,
    }
    *instance = target;
    *offset = lambda.offset + 1;
    body.ip = CodePtr { instance: instance.id, offset: *offset };
    Ok(())
}

/// Raises `ex` in the process: unwinds to the nearest catch scope, or
/// converts it into the process exit reason. The engine-loop variant keeps
/// its cached instance and offset in sync with `body.ip`.
fn unwind(
    body: &mut ProcessBody,
    instance: &mut Arc<ModuleInstance>,
    offset: &mut u32,
    ex: Exception,
) -> Result<(), PendingExit> {
    unwind_parked(body, ex)?;
    if body.ip.instance != instance.id {
        match code::instance(body.ip.instance) {
            Some(next) => *instance = next,
            None => return Err(exit_for_exception(body, Exception::undef())),
        }
    }
    *offset = body.ip.offset;
    Ok(())
}

/// Unwind driven purely by process state; also used when completing a
/// call that was parked across a dirty-scheduler migration.
pub(crate) fn unwind_parked(body: &mut ProcessBody, ex: Exception) -> Result<(), PendingExit> {
    match body.catches.pop() {
        Some(catch) => {
            while body.frames.len() > catch.frame_depth {
                let frame = body.frames.pop().expect("catch depth within frame stack");
                body.regs = frame.saved_regs;
            }
            // Handler convention: x0 = class, x1 = reason, x2 = trace.
            // Frames installing a catch declare at least three registers.
            if body.regs.len() < 3 {
                body.regs.resize(3, OpaqueTerm::NIL);
            }
            body.regs[0] = OpaqueTerm::make_atom(ex.class.as_atom());
            body.regs[1] = ex.reason;
            body.regs[2] = ex.trace;
            body.ip = catch.handler;
            Ok(())
        }
        None => Err(exit_for_exception(body, ex)),
    }
}

/// Completes a call whose instruction is parked in `body.ip` (a dirty NIF
/// that just finished): deliver the value and step past the call.
pub(crate) fn complete_parked_call(
    body: &mut ProcessBody,
    dst: Option<u16>,
    value: OpaqueTerm,
) -> Result<(), PendingExit> {
    match dst {
        Some(dst) => {
            body.regs[dst as usize] = value;
            body.ip.offset += 1;
            Ok(())
        }
        None => match body.frames.pop() {
            Some(frame) => {
                body.regs = frame.saved_regs;
                body.regs[frame.dst as usize] = value;
                while body
                    .catches
                    .last()
                    .map(|c| c.frame_depth > body.frames.len())
                    .unwrap_or(false)
                {
                    body.catches.pop();
                }
                body.ip = frame.ret;
                Ok(())
            }
            None => Err(PendingExit::normal()),
        },
    }
}

/// Packages an uncaught exception as the process exit reason, wrapped per
/// class, in a self-contained fragment.
fn exit_for_exception(body: &ProcessBody, ex: Exception) -> PendingExit {
    let mut fragment = ProcessHeap::fragment();
    let reason = fragment
        .copy_from(&body.heap, ex.reason)
        .expect("fragments grow on demand");
    let reason = match ex.class {
        ExceptionClass::Exit => reason,
        ExceptionClass::Throw => fragment
            .tuple(&[OpaqueTerm::make_atom(atoms::NOCATCH), reason])
            .expect("fragments grow on demand"),
        ExceptionClass::Error => {
            let trace = fragment
                .copy_from(&body.heap, ex.trace)
                .unwrap_or(OpaqueTerm::NIL);
            fragment
                .tuple(&[reason, trace])
                .expect("fragments grow on demand")
        }
    };
    PendingExit { fragment, reason, killed: false }
}

fn undef_exception(body: &mut ProcessBody, m: Atom, f: Atom, a: u8) -> Exception {
    let reason = body
        .heap
        .tuple(&[
            OpaqueTerm::make_atom(atoms::UNDEF),
            OpaqueTerm::make_atom(m),
            OpaqueTerm::make_atom(f),
            OpaqueTerm::make_small(a as i64),
        ])
        .unwrap_or_else(|_| OpaqueTerm::make_atom(atoms::UNDEF));
    Exception::error(reason)
}

/// Builds `[{Module, Function, Arity}, …]` for the current call chain.
fn build_stack_trace(
    body: &mut ProcessBody,
    instance: &Arc<ModuleInstance>,
    offset: u32,
) -> Result<OpaqueTerm, HeapFull> {
    const MAX_FRAMES: usize = 8;
    let mut locations: Vec<(Atom, Atom, u8)> = Vec::new();
    if let Some((f, a)) = enclosing_function(instance, offset) {
        locations.push((instance.name, f, a));
    }
    let frame_ptrs: Vec<CodePtr> =
        body.frames.iter().rev().take(MAX_FRAMES - 1).map(|f| f.ret).collect();
    for ret in frame_ptrs {
        if let Some(frame_instance) = code::instance(ret.instance) {
            if let Some((f, a)) = enclosing_function(&frame_instance, ret.offset) {
                locations.push((frame_instance.name, f, a));
            }
        }
    }

    let mut list = OpaqueTerm::NIL;
    for (m, f, a) in locations.into_iter().rev() {
        let entry = body.heap.tuple(&[
            OpaqueTerm::make_atom(m),
            OpaqueTerm::make_atom(f),
            OpaqueTerm::make_small(a as i64),
        ])?;
        list = body.heap.cons(entry, list)?;
    }
    Ok(list)
}

/// The function whose body contains `offset`: the nearest `FuncInfo` at or
/// before it.
fn enclosing_function(instance: &ModuleInstance, offset: u32) -> Option<(Atom, u8)> {
    let mut found = None;
    for (at, op) in instance.code.iter().enumerate() {
        if at as u32 > offset {
            break;
        }
        if let Opcode::FuncInfo { function, arity, .. } = op {
            found = Some((instance.atoms[*function as usize], *arity));
        }
    }
    found
}

fn do_send(
    process: &Arc<Process>,
    body: &mut ProcessBody,
    to: u16,
    msg: u16,
    reds: &mut i64,
) -> Result<(), Exception> {
    let to = body.regs[to as usize];
    let msg = body.regs[msg as usize];
    let target = if to.is_pid() {
        to.pid_value()
    } else if to.is_atom() {
        match ember_rt::process::registry::whereis(to.atom_value()) {
            Some(pid) => pid,
            None => return Err(Exception::badarg()),
        }
    } else {
        return Err(Exception::badarg());
    };

    let mut fragment = ProcessHeap::fragment();
    let root = fragment
        .copy_from(&body.heap, msg)
        .expect("fragments grow on demand");
    // Cost scales with the copied payload
    *reds -= 1 + (fragment.young_used() / 64) as i64;
    signals::send_to(target, Signal::Message { sender: process.pid(), fragment, root });
    Ok(())
}

enum ArithOp {
    Add,
    Sub,
    Mul,
    Fdiv,
    Div,
    Rem,
}

fn arith2(
    body: &ProcessBody,
    a: u16,
    b: u16,
    op: ArithOp,
) -> Result<Number, Exception> {
    let x = body.heap.number_value(body.regs[a as usize]).ok_or_else(Exception::badarith)?;
    let y = body.heap.number_value(body.regs[b as usize]).ok_or_else(Exception::badarith)?;

    use Number::*;
    let result = match op {
        ArithOp::Add => match (x, y) {
            (Int(x), Int(y)) => x
                .checked_add(y)
                .map(Int)
                .unwrap_or_else(|| Big(BigInt::from(x) + y)),
            (x, y) => match promote(x, y) {
                Promoted::Floats(x, y) => Float(x + y),
                Promoted::Bigs(x, y) => Big(x + y),
            },
        },
        ArithOp::Sub => match (x, y) {
            (Int(x), Int(y)) => x
                .checked_sub(y)
                .map(Int)
                .unwrap_or_else(|| Big(BigInt::from(x) - y)),
            (x, y) => match promote(x, y) {
                Promoted::Floats(x, y) => Float(x - y),
                Promoted::Bigs(x, y) => Big(x - y),
            },
        },
        ArithOp::Mul => match (x, y) {
            (Int(x), Int(y)) => x
                .checked_mul(y)
                .map(Int)
                .unwrap_or_else(|| Big(BigInt::from(x) * y)),
            (x, y) => match promote(x, y) {
                Promoted::Floats(x, y) => Float(x * y),
                Promoted::Bigs(x, y) => Big(x * y),
            },
        },
        ArithOp::Fdiv => match promote(x, y) {
            Promoted::Floats(x, y) => {
                if y == 0.0 {
                    return Err(Exception::badarith());
                }
                Float(x / y)
            }
            Promoted::Bigs(x, y) => {
                if y.is_zero() {
                    return Err(Exception::badarith());
                }
                let (x, y) = (x.to_f64(), y.to_f64());
                match (x, y) {
                    (Some(x), Some(y)) => Float(x / y),
                    _ => return Err(Exception::badarith()),
                }
            }
        },
        ArithOp::Div | ArithOp::Rem => {
            let rem = matches!(op, ArithOp::Rem);
            match (x, y) {
                (Int(x), Int(y)) => {
                    if y == 0 {
                        return Err(Exception::badarith());
                    }
                    if rem {
                        Int(x.wrapping_rem(y))
                    } else {
                        x.checked_div(y)
                            .map(Int)
                            .unwrap_or_else(|| Big(BigInt::from(x) / y))
                    }
                }
                (x, y) => match promote(x, y) {
                    Promoted::Bigs(x, y) => {
                        if y.is_zero() {
                            return Err(Exception::badarith());
                        }
                        if rem {
                            Big(x % y)
                        } else {
                            Big(x / y)
                        }
                    }
                    Promoted::Floats(..) => return Err(Exception::badarith()),
                },
            }
        }
    };
    Ok(result)
}

enum Promoted {
    Floats(f64, f64),
    Bigs(BigInt, BigInt),
}

fn promote(x: Number, y: Number) -> Promoted {
    use Number::*;
    match (x, y) {
        (Float(x), Float(y)) => Promoted::Floats(x, y),
        (Float(x), Int(y)) => Promoted::Floats(x, y as f64),
        (Int(x), Float(y)) => Promoted::Floats(x as f64, y),
        (Float(x), Big(y)) => Promoted::Floats(x, y.to_f64().unwrap_or(f64::INFINITY)),
        (Big(x), Float(y)) => Promoted::Floats(x.to_f64().unwrap_or(f64::INFINITY), y),
        (Big(x), Big(y)) => Promoted::Bigs(x, y),
        (Big(x), Int(y)) => Promoted::Bigs(x, BigInt::from(y)),
        (Int(x), Big(y)) => Promoted::Bigs(BigInt::from(x), y),
        (Int(x), Int(y)) => Promoted::Bigs(BigInt::from(x), BigInt::from(y)),
    }
}

enum BitOp {
    And,
    Or,
    Xor,
}

fn integer_value(body: &ProcessBody, reg: u16) -> Result<BigInt, Exception> {
    match body.heap.number_value(body.regs[reg as usize]) {
        Some(Number::Int(i)) => Ok(BigInt::from(i)),
        Some(Number::Big(b)) => Ok(b),
        _ => Err(Exception::badarith()),
    }
}

fn bitwise2(body: &ProcessBody, a: u16, b: u16, op: BitOp) -> Result<Number, Exception> {
    let x = integer_value(body, a)?;
    let y = integer_value(body, b)?;
    Ok(Number::Big(match op {
        BitOp::And => x & y,
        BitOp::Or => x | y,
        BitOp::Xor => x ^ y,
    }))
}

fn shift(body: &ProcessBody, a: u16, b: u16, left: bool) -> Result<Number, Exception> {
    let x = integer_value(body, a)?;
    let n = match body.heap.number_value(body.regs[b as usize]) {
        Some(Number::Int(n)) if n.unsigned_abs() <= 1 << 20 => n,
        _ => return Err(Exception::badarith()),
    };
    let shifted = if (left && n >= 0) || (!left && n < 0) {
        x << n.unsigned_abs() as usize
    } else {
        x >> n.unsigned_abs() as usize
    };
    Ok(Number::Big(shifted))
}

fn bool2(body: &ProcessBody, a: u16, b: u16) -> Result<(bool, bool), Exception> {
    let x = body.regs[a as usize].as_bool().ok_or_else(Exception::badarg)?;
    let y = body.regs[b as usize].as_bool().ok_or_else(Exception::badarg)?;
    Ok((x, y))
}
