//! BIFs of the `erlang` and `maps` modules.

use hashbrown::HashMap;

use ember_rt::code::{self, PurgeResult};
use ember_rt::error::Exception;
use ember_rt::etf;
use ember_rt::heap::ProcessHeap;
use ember_rt::map;
use ember_rt::process::{
    collect_garbage_sweep, next_reference_id, registry, signals, spawn, status, table,
    ProcessId, Signal,
};
use ember_rt::term::{atoms, Atom, OpaqueTerm};

use super::{Bif, BifContext, BifOutcome};

type BifResult = Result<BifOutcome, Exception>;

/// Interns names and fills the dispatch table.
pub(super) fn register(table: &mut HashMap<(Atom, Atom, u8), Bif>) {
    let erlang = Atom::intern("erlang").expect("atom table exhausted at boot");
    let maps = Atom::intern("maps").expect("atom table exhausted at boot");
    let mut add = |module: Atom, name: &str, arity: u8, bif: Bif| {
        let name = Atom::intern(name).expect("atom table exhausted at boot");
        table.insert((module, name, arity), bif);
    };

    add(erlang, "self", 0, bif_self);
    add(erlang, "spawn", 3, bif_spawn_3);
    add(erlang, "spawn", 1, bif_spawn_1);
    add(erlang, "spawn_link", 3, bif_spawn_link_3);
    add(erlang, "spawn_link", 1, bif_spawn_link_1);
    add(erlang, "spawn_monitor", 3, bif_spawn_monitor_3);
    add(erlang, "exit", 1, bif_exit_1);
    add(erlang, "exit", 2, bif_exit_2);
    add(erlang, "throw", 1, bif_throw_1);
    add(erlang, "error", 1, bif_error_1);
    add(erlang, "link", 1, bif_link_1);
    add(erlang, "unlink", 1, bif_unlink_1);
    add(erlang, "monitor", 2, bif_monitor_2);
    add(erlang, "demonitor", 1, bif_demonitor_1);
    add(erlang, "process_flag", 2, bif_process_flag_2);
    add(erlang, "register", 2, bif_register_2);
    add(erlang, "unregister", 1, bif_unregister_1);
    add(erlang, "whereis", 1, bif_whereis_1);
    add(erlang, "registered", 0, bif_registered_0);
    add(erlang, "is_process_alive", 1, bif_is_process_alive_1);
    add(erlang, "processes", 0, bif_processes_0);
    add(erlang, "process_info", 2, bif_process_info_2);
    add(erlang, "put", 2, bif_put_2);
    add(erlang, "get", 1, bif_get_1);
    add(erlang, "erase", 1, bif_erase_1);
    add(erlang, "make_ref", 0, bif_make_ref_0);
    add(erlang, "send", 2, bif_send_2);
    add(erlang, "element", 2, bif_element_2);
    add(erlang, "setelement", 3, bif_setelement_3);
    add(erlang, "tuple_size", 1, bif_tuple_size_1);
    add(erlang, "tuple_to_list", 1, bif_tuple_to_list_1);
    add(erlang, "list_to_tuple", 1, bif_list_to_tuple_1);
    add(erlang, "hd", 1, bif_hd_1);
    add(erlang, "tl", 1, bif_tl_1);
    add(erlang, "length", 1, bif_length_1);
    add(erlang, "byte_size", 1, bif_byte_size_1);
    add(erlang, "binary_part", 3, bif_binary_part_3);
    add(erlang, "list_to_binary", 1, bif_list_to_binary_1);
    add(erlang, "binary_to_list", 1, bif_binary_to_list_1);
    add(erlang, "term_to_binary", 1, bif_term_to_binary_1);
    add(erlang, "binary_to_term", 1, bif_binary_to_term_1);
    add(erlang, "map_size", 1, bif_map_size_1);
    add(erlang, "load_module", 2, bif_load_module_2);
    add(erlang, "purge_module", 1, bif_purge_module_1);
    add(erlang, "delete_module", 1, bif_delete_module_1);
    add(erlang, "garbage_collect", 0, bif_garbage_collect_0);
    add(erlang, "halt", 1, bif_halt_1);
    add(erlang, "node", 0, bif_node_0);
    add(erlang, "group_leader", 0, bif_group_leader_0);
    add(erlang, "group_leader", 2, bif_group_leader_2);
    add(erlang, "is_atom", 1, bif_is_atom_1);
    add(erlang, "is_boolean", 1, bif_is_boolean_1);
    add(erlang, "is_integer", 1, bif_is_integer_1);
    add(erlang, "is_float", 1, bif_is_float_1);
    add(erlang, "is_number", 1, bif_is_number_1);
    add(erlang, "is_list", 1, bif_is_list_1);
    add(erlang, "is_tuple", 1, bif_is_tuple_1);
    add(erlang, "is_map", 1, bif_is_map_1);
    add(erlang, "is_pid", 1, bif_is_pid_1);
    add(erlang, "is_reference", 1, bif_is_reference_1);
    add(erlang, "is_binary", 1, bif_is_binary_1);
    add(erlang, "is_function", 1, bif_is_function_1);

    add(maps, "get", 2, bif_maps_get_2);
    add(maps, "put", 3, bif_maps_put_3);
    add(maps, "find", 2, bif_maps_find_2);
}

fn ok(value: OpaqueTerm) -> BifResult {
    Ok(BifOutcome::Value(value))
}

fn true_value() -> BifResult {
    ok(OpaqueTerm::make_bool(true))
}

fn pid_arg(ctx: &BifContext<'_>, i: usize) -> Result<ProcessId, Exception> {
    let term = ctx.arg(i);
    if term.is_pid() {
        Ok(term.pid_value())
    } else {
        Err(Exception::badarg())
    }
}

fn atom_arg(ctx: &BifContext<'_>, i: usize) -> Result<Atom, Exception> {
    let term = ctx.arg(i);
    if term.is_atom() {
        Ok(term.atom_value())
    } else {
        Err(Exception::badarg())
    }
}

fn list_arg(ctx: &BifContext<'_>, i: usize) -> Result<Vec<OpaqueTerm>, Exception> {
    let mut out = Vec::new();
    let mut cursor = ctx.arg(i);
    while cursor.is_cons() {
        out.push(ctx.body.heap.cons_head(cursor));
        cursor = ctx.body.heap.cons_tail(cursor);
    }
    if cursor.is_nil() {
        Ok(out)
    } else {
        Err(Exception::badarg())
    }
}

// -- processes ------------------------------------------------------------

fn bif_self(ctx: &mut BifContext<'_>) -> BifResult {
    ok(OpaqueTerm::make_pid(ctx.process.pid()))
}

fn do_spawn(ctx: &mut BifContext<'_>, link: bool, monitor: bool) -> BifResult {
    let module = atom_arg(ctx, 0)?;
    let function = atom_arg(ctx, 1)?;
    let args = list_arg(ctx, 2)?;
    let options = spawn::SpawnOptions { link, monitor, ..Default::default() };
    let spawned = spawn::spawn_mfa(
        Some((&**ctx.process, &mut *ctx.body)),
        module,
        function,
        &args,
        options,
    )
    .map_err(spawn_error)?;
    match spawned.monitor {
        Some(reference) => {
            let pid = spawned.pid;
            ok(ctx.build(|body| {
                body.heap.tuple(&[
                    OpaqueTerm::make_pid(pid),
                    OpaqueTerm::make_ref(reference),
                ])
            }))
        }
        None => ok(OpaqueTerm::make_pid(spawned.pid)),
    }
}

fn spawn_error(err: spawn::SpawnError) -> Exception {
    match err {
        spawn::SpawnError::Table(_) => Exception::system_limit(),
        spawn::SpawnError::Undef(..) => Exception::undef(),
        spawn::SpawnError::NotAClosure => Exception::badarg(),
    }
}

fn bif_spawn_3(ctx: &mut BifContext<'_>) -> BifResult {
    do_spawn(ctx, false, false)
}

fn bif_spawn_link_3(ctx: &mut BifContext<'_>) -> BifResult {
    do_spawn(ctx, true, false)
}

fn bif_spawn_monitor_3(ctx: &mut BifContext<'_>) -> BifResult {
    do_spawn(ctx, false, true)
}

fn do_spawn_fun(ctx: &mut BifContext<'_>, link: bool) -> BifResult {
    let closure = ctx.arg(0);
    let options = spawn::SpawnOptions { link, ..Default::default() };
    let spawned = spawn::spawn_closure((&**ctx.process, &mut *ctx.body), closure, options)
        .map_err(spawn_error)?;
    ok(OpaqueTerm::make_pid(spawned.pid))
}

fn bif_spawn_1(ctx: &mut BifContext<'_>) -> BifResult {
    do_spawn_fun(ctx, false)
}

fn bif_spawn_link_1(ctx: &mut BifContext<'_>) -> BifResult {
    do_spawn_fun(ctx, true)
}

fn bif_exit_1(ctx: &mut BifContext<'_>) -> BifResult {
    Err(Exception::exit(ctx.arg(0)))
}

fn bif_throw_1(ctx: &mut BifContext<'_>) -> BifResult {
    Err(Exception::throw(ctx.arg(0)))
}

fn bif_error_1(ctx: &mut BifContext<'_>) -> BifResult {
    Err(Exception::error(ctx.arg(0)))
}

fn bif_exit_2(ctx: &mut BifContext<'_>) -> BifResult {
    let target = pid_arg(ctx, 0)?;
    let reason = ctx.arg(1);
    let sender = ctx.process.pid();
    if reason == OpaqueTerm::make_atom(atoms::KILL) {
        signals::send_to(target, Signal::Kill { sender });
    } else {
        let mut fragment = ProcessHeap::fragment();
        let reason = fragment
            .copy_from(&ctx.body.heap, reason)
            .expect("fragments grow on demand");
        signals::send_to(
            target,
            Signal::Exit { sender, fragment, reason, from_link: false },
        );
    }
    true_value()
}

fn bif_link_1(ctx: &mut BifContext<'_>) -> BifResult {
    let target = pid_arg(ctx, 0)?;
    if target == ctx.process.pid() {
        return true_value();
    }
    if table::lookup(target).is_none() {
        return Err(Exception::error(OpaqueTerm::make_atom(atoms::NOPROC)));
    }
    ctx.body.links.insert(target);
    signals::send_to(target, Signal::Link { from: ctx.process.pid() });
    true_value()
}

fn bif_unlink_1(ctx: &mut BifContext<'_>) -> BifResult {
    let target = pid_arg(ctx, 0)?;
    ctx.body.links.remove(&target);
    signals::send_to(target, Signal::Unlink { from: ctx.process.pid() });
    true_value()
}

fn bif_monitor_2(ctx: &mut BifContext<'_>) -> BifResult {
    let kind = atom_arg(ctx, 0)?;
    if kind != atoms::PROCESS {
        return Err(Exception::badarg());
    }
    let target = pid_arg(ctx, 1)?;
    let reference = next_reference_id();
    ctx.body.monitors.watch(reference, target);
    let delivered = signals::send_to(
        target,
        Signal::Monitor { from: ctx.process.pid(), reference },
    );
    if !delivered {
        // Target is already gone: the DOWN arrives immediately
        ctx.process.push_signal(Signal::Down {
            reference,
            from: target,
            fragment: ProcessHeap::fragment(),
            reason: OpaqueTerm::make_atom(atoms::NOPROC),
        });
    }
    ok(OpaqueTerm::make_ref(reference))
}

fn bif_demonitor_1(ctx: &mut BifContext<'_>) -> BifResult {
    let reference = ctx.arg(0);
    if !reference.is_local_ref() {
        return Err(Exception::badarg());
    }
    let reference = reference.ref_value();
    if let Some(target) = ctx.body.monitors.unwatch(reference) {
        signals::send_to(target, Signal::Demonitor { reference });
    }
    true_value()
}

fn bif_process_flag_2(ctx: &mut BifContext<'_>) -> BifResult {
    let flag = atom_arg(ctx, 0)?;
    if flag != atoms::TRAP_EXIT {
        return Err(Exception::badarg());
    }
    let value = match ctx.arg(1).as_bool() {
        Some(value) => value,
        None => return Err(Exception::badarg()),
    };
    let old = ctx.process.set_trap_exit(value);
    ok(OpaqueTerm::make_bool(old))
}

fn bif_register_2(ctx: &mut BifContext<'_>) -> BifResult {
    let name = atom_arg(ctx, 0)?;
    if name == atoms::UNDEFINED {
        return Err(Exception::badarg());
    }
    let pid = pid_arg(ctx, 1)?;
    let process = table::lookup(pid).ok_or_else(Exception::badarg)?;
    if registry::register(name, &process) {
        true_value()
    } else {
        Err(Exception::badarg())
    }
}

fn bif_unregister_1(ctx: &mut BifContext<'_>) -> BifResult {
    let name = atom_arg(ctx, 0)?;
    if registry::unregister(name) {
        true_value()
    } else {
        Err(Exception::badarg())
    }
}

fn bif_whereis_1(ctx: &mut BifContext<'_>) -> BifResult {
    let name = atom_arg(ctx, 0)?;
    match registry::whereis(name) {
        Some(pid) => ok(OpaqueTerm::make_pid(pid)),
        None => ok(OpaqueTerm::make_atom(atoms::UNDEFINED)),
    }
}

fn bif_registered_0(ctx: &mut BifContext<'_>) -> BifResult {
    let names = registry::names();
    ok(ctx.build(move |body| {
        let elems: Vec<OpaqueTerm> =
            names.iter().map(|name| OpaqueTerm::make_atom(*name)).collect();
        body.heap.list_from_slice(&elems, OpaqueTerm::NIL)
    }))
}

fn bif_is_process_alive_1(ctx: &mut BifContext<'_>) -> BifResult {
    let pid = pid_arg(ctx, 0)?;
    ok(OpaqueTerm::make_bool(table::lookup(pid).is_some()))
}

fn bif_processes_0(ctx: &mut BifContext<'_>) -> BifResult {
    let pids: Vec<ProcessId> = table::snapshot().iter().map(|p| p.pid()).collect();
    ctx.charge(pids.len() as i64 / 16);
    ok(ctx.build(move |body| {
        let elems: Vec<OpaqueTerm> =
            pids.iter().map(|pid| OpaqueTerm::make_pid(*pid)).collect();
        body.heap.list_from_slice(&elems, OpaqueTerm::NIL)
    }))
}

fn bif_process_info_2(ctx: &mut BifContext<'_>) -> BifResult {
    let pid = pid_arg(ctx, 0)?;
    let key = atom_arg(ctx, 1)?;
    let is_self = pid == ctx.process.pid();

    let target = if is_self { None } else { table::lookup(pid) };
    if !is_self && target.is_none() {
        return ok(OpaqueTerm::make_atom(atoms::UNDEFINED));
    }

    // A value small enough to be captured before any allocation
    enum Info {
        Count(i64),
        AtomValue(Atom),
        Pid(ProcessId),
        Pids(Vec<ProcessId>),
    }

    let info = if is_self {
        gather_info(ctx.process, ctx.body, key)
    } else {
        let target = target.as_ref().unwrap();
        match target.try_body() {
            // Briefly contended (probably running); report nothing rather
            // than block the scheduler
            None => return ok(OpaqueTerm::make_atom(atoms::UNDEFINED)),
            Some(body) => gather_info(target, &body, key),
        }
    };

    fn gather_info(
        process: &ember_rt::Process,
        body: &ember_rt::process::ProcessBody,
        key: Atom,
    ) -> Option<Info> {
        Some(match key {
            k if k == atoms::MESSAGE_QUEUE_LEN => Info::Count(body.mailbox.len() as i64),
            k if k == atoms::REGISTERED_NAME => match process.registered_name() {
                Some(name) => Info::AtomValue(name),
                None => Info::Count(-1),
            },
            k if k == atoms::LINKS => Info::Pids(body.links.iter().copied().collect()),
            k if k == atoms::MONITORS => {
                Info::Pids(body.monitors.outgoing.values().copied().collect())
            }
            k if k == atoms::STATUS => {
                let bits = process.status().load();
                Info::AtomValue(if bits & status::EXITING != 0 {
                    atoms::EXITING
                } else if bits & status::RUNNING != 0 || bits & status::DIRTY_RUNNING != 0 {
                    atoms::RUNNING
                } else if bits & status::WAITING != 0 {
                    atoms::WAITING
                } else if bits & status::SUSPENDED != 0 {
                    atoms::SUSPENDED
                } else {
                    atoms::RUNNABLE
                })
            }
            k if k == atoms::HEAP_SIZE => Info::Count(body.heap.young_capacity() as i64),
            k if k == atoms::TOTAL_HEAP_SIZE => Info::Count(body.heap.total_words() as i64),
            k if k == atoms::REDUCTIONS => Info::Count(process.reductions() as i64),
            k if k == atoms::PRIORITY => Info::AtomValue(process.priority().as_atom()),
            k if k == atoms::GROUP_LEADER => Info::Pid(body.group_leader),
            _ => return None,
        })
    }

    let Some(info) = info else {
        return Err(Exception::badarg());
    };
    let key_term = OpaqueTerm::make_atom(key);
    ok(ctx.build(move |body| {
        let value = match &info {
            Info::Count(-1) => OpaqueTerm::NIL,
            Info::Count(n) => body.heap.integer(*n)?,
            Info::AtomValue(atom) => OpaqueTerm::make_atom(*atom),
            Info::Pid(pid) => OpaqueTerm::make_pid(*pid),
            Info::Pids(pids) => {
                let elems: Vec<OpaqueTerm> =
                    pids.iter().map(|pid| OpaqueTerm::make_pid(*pid)).collect();
                body.heap.list_from_slice(&elems, OpaqueTerm::NIL)?
            }
        };
        body.heap.tuple(&[key_term, value])
    }))
}

// -- process dictionary ---------------------------------------------------

fn bif_put_2(ctx: &mut BifContext<'_>) -> BifResult {
    let hash = ctx.body.heap.term_hash(ctx.arg(0));
    let position = ctx
        .body
        .dictionary
        .iter()
        .position(|(h, k, _)| *h == hash && ctx.body.heap.exact_eq(*k, ctx.arg(0)));
    match position {
        Some(at) => {
            let old = ctx.body.dictionary[at].2;
            let value = ctx.arg(1);
            ctx.body.dictionary[at].2 = value;
            ok(old)
        }
        None => {
            let entry = (hash, ctx.arg(0), ctx.arg(1));
            ctx.body.dictionary.push(entry);
            ok(OpaqueTerm::make_atom(atoms::UNDEFINED))
        }
    }
}

fn bif_get_1(ctx: &mut BifContext<'_>) -> BifResult {
    let hash = ctx.body.heap.term_hash(ctx.arg(0));
    let found = ctx
        .body
        .dictionary
        .iter()
        .find(|(h, k, _)| *h == hash && ctx.body.heap.exact_eq(*k, ctx.arg(0)))
        .map(|(_, _, v)| *v);
    ok(found.unwrap_or(OpaqueTerm::make_atom(atoms::UNDEFINED)))
}

fn bif_erase_1(ctx: &mut BifContext<'_>) -> BifResult {
    let hash = ctx.body.heap.term_hash(ctx.arg(0));
    let position = ctx
        .body
        .dictionary
        .iter()
        .position(|(h, k, _)| *h == hash && ctx.body.heap.exact_eq(*k, ctx.arg(0)));
    match position {
        Some(at) => ok(ctx.body.dictionary.remove(at).2),
        None => ok(OpaqueTerm::make_atom(atoms::UNDEFINED)),
    }
}

// -- terms ----------------------------------------------------------------

fn bif_make_ref_0(_ctx: &mut BifContext<'_>) -> BifResult {
    ok(OpaqueTerm::make_ref(next_reference_id()))
}

fn bif_send_2(ctx: &mut BifContext<'_>) -> BifResult {
    let to = ctx.arg(0);
    let msg = ctx.arg(1);
    let target = if to.is_pid() {
        to.pid_value()
    } else if to.is_atom() {
        registry::whereis(to.atom_value()).ok_or_else(Exception::badarg)?
    } else {
        return Err(Exception::badarg());
    };
    let mut fragment = ProcessHeap::fragment();
    let root = fragment
        .copy_from(&ctx.body.heap, msg)
        .expect("fragments grow on demand");
    ctx.charge(1 + (fragment.young_used() / 64) as i64);
    signals::send_to(target, Signal::Message { sender: ctx.process.pid(), fragment, root });
    ok(msg)
}

fn bif_element_2(ctx: &mut BifContext<'_>) -> BifResult {
    let index = ctx.arg(0);
    let tuple = ctx.arg(1);
    if !index.is_small() || !ctx.body.heap.is_tuple(tuple) {
        return Err(Exception::badarg());
    }
    let index = index.small_value();
    if index < 1 || index as usize > ctx.body.heap.tuple_arity(tuple) {
        return Err(Exception::badarg());
    }
    ok(ctx.body.heap.tuple_element(tuple, index as usize - 1))
}

fn bif_setelement_3(ctx: &mut BifContext<'_>) -> BifResult {
    let index = ctx.arg(0);
    let tuple = ctx.arg(1);
    if !index.is_small() || !ctx.body.heap.is_tuple(tuple) {
        return Err(Exception::badarg());
    }
    let at = index.small_value();
    if at < 1 || at as usize > ctx.body.heap.tuple_arity(tuple) {
        return Err(Exception::badarg());
    }
    let base = ctx_arg_register(ctx, 0);
    ok(ctx.build(move |body| {
        let tuple = body.regs[base + 1];
        let arity = body.heap.tuple_arity(tuple);
        let mut elems: Vec<OpaqueTerm> =
            (0..arity).map(|i| body.heap.tuple_element(tuple, i)).collect();
        elems[at as usize - 1] = body.regs[base + 2];
        body.heap.tuple(&elems)
    }))
}

fn bif_tuple_size_1(ctx: &mut BifContext<'_>) -> BifResult {
    let tuple = ctx.arg(0);
    if !ctx.body.heap.is_tuple(tuple) {
        return Err(Exception::badarg());
    }
    ok(OpaqueTerm::make_small(ctx.body.heap.tuple_arity(tuple) as i64))
}

fn bif_tuple_to_list_1(ctx: &mut BifContext<'_>) -> BifResult {
    let tuple = ctx.arg(0);
    if !ctx.body.heap.is_tuple(tuple) {
        return Err(Exception::badarg());
    }
    let base = ctx_arg_register(ctx, 0);
    ok(ctx.build(move |body| {
        let tuple = body.regs[base];
        let arity = body.heap.tuple_arity(tuple);
        let elems: Vec<OpaqueTerm> =
            (0..arity).map(|i| body.heap.tuple_element(tuple, i)).collect();
        body.heap.list_from_slice(&elems, OpaqueTerm::NIL)
    }))
}

fn bif_list_to_tuple_1(ctx: &mut BifContext<'_>) -> BifResult {
    let _ = list_arg(ctx, 0)?;
    let base = ctx_arg_register(ctx, 0);
    ok(ctx.build(move |body| {
        let mut elems = Vec::new();
        let mut cursor = body.regs[base];
        while cursor.is_cons() {
            elems.push(body.heap.cons_head(cursor));
            cursor = body.heap.cons_tail(cursor);
        }
        body.heap.tuple(&elems)
    }))
}

fn bif_hd_1(ctx: &mut BifContext<'_>) -> BifResult {
    let list = ctx.arg(0);
    if !list.is_cons() {
        return Err(Exception::badarg());
    }
    ok(ctx.body.heap.cons_head(list))
}

fn bif_tl_1(ctx: &mut BifContext<'_>) -> BifResult {
    let list = ctx.arg(0);
    if !list.is_cons() {
        return Err(Exception::badarg());
    }
    ok(ctx.body.heap.cons_tail(list))
}

fn bif_length_1(ctx: &mut BifContext<'_>) -> BifResult {
    let len = list_arg(ctx, 0)?.len();
    ctx.charge(1 + len as i64 / 64);
    ok(OpaqueTerm::make_small(len as i64))
}

// -- binaries -------------------------------------------------------------

fn bif_byte_size_1(ctx: &mut BifContext<'_>) -> BifResult {
    let bin = ctx.arg(0);
    if !ctx.body.heap.is_binary(bin) {
        return Err(Exception::badarg());
    }
    ok(OpaqueTerm::make_small(ctx.body.heap.binary_size(bin) as i64))
}

fn bif_binary_part_3(ctx: &mut BifContext<'_>) -> BifResult {
    let bin = ctx.arg(0);
    let start = ctx.arg(1);
    let len = ctx.arg(2);
    if !ctx.body.heap.is_binary(bin) || !start.is_small() || !len.is_small() {
        return Err(Exception::badarg());
    }
    let size = ctx.body.heap.binary_size(bin);
    let (start, len) = (start.small_value(), len.small_value());
    if start < 0 || len < 0 || (start + len) as usize > size {
        return Err(Exception::badarg());
    }
    let base = ctx_arg_register(ctx, 0);
    ok(ctx.build(move |body| {
        let bin = body.regs[base];
        body.heap.sub_binary(bin, start as usize, len as usize)
    }))
}

fn bif_list_to_binary_1(ctx: &mut BifContext<'_>) -> BifResult {
    let elems = list_arg(ctx, 0)?;
    let mut bytes = Vec::with_capacity(elems.len());
    for elem in elems {
        if elem.is_small() && (0..=255).contains(&elem.small_value()) {
            bytes.push(elem.small_value() as u8);
        } else if ctx.body.heap.is_binary(elem) {
            ctx.body.heap.with_binary_bytes(elem, |b| bytes.extend_from_slice(b));
        } else {
            return Err(Exception::badarg());
        }
    }
    ctx.charge(1 + bytes.len() as i64 / 64);
    ok(ctx.build(move |body| body.heap.binary(&bytes)))
}

fn bif_binary_to_list_1(ctx: &mut BifContext<'_>) -> BifResult {
    let bin = ctx.arg(0);
    if !ctx.body.heap.is_binary(bin) {
        return Err(Exception::badarg());
    }
    let bytes = ctx.body.heap.binary_to_vec(bin);
    ctx.charge(1 + bytes.len() as i64 / 64);
    ok(ctx.build(move |body| {
        let elems: Vec<OpaqueTerm> =
            bytes.iter().map(|b| OpaqueTerm::make_small(*b as i64)).collect();
        body.heap.list_from_slice(&elems, OpaqueTerm::NIL)
    }))
}

fn bif_term_to_binary_1(ctx: &mut BifContext<'_>) -> BifResult {
    let encoded = etf::encode(&ctx.body.heap, ctx.arg(0)).map_err(|_| Exception::badarg())?;
    ctx.charge(1 + encoded.len() as i64 / 64);
    ok(ctx.build(move |body| body.heap.binary(&encoded)))
}

fn bif_binary_to_term_1(ctx: &mut BifContext<'_>) -> BifResult {
    let bin = ctx.arg(0);
    if !ctx.body.heap.is_binary(bin) {
        return Err(Exception::badarg());
    }
    let bytes = ctx.body.heap.binary_to_vec(bin);
    ctx.charge(1 + bytes.len() as i64 / 64);
    let mut fragment = ProcessHeap::fragment();
    let root = etf::decode(&mut fragment, &bytes).map_err(|_| Exception::badarg())?;
    ok(ctx.build(move |body| body.heap.copy_from(&fragment, root)))
}

// -- maps -----------------------------------------------------------------

fn bif_map_size_1(ctx: &mut BifContext<'_>) -> BifResult {
    let map_term = ctx.arg(0);
    if !ctx.body.heap.is_map(map_term) {
        return Err(Exception::badarg());
    }
    ok(OpaqueTerm::make_small(map::map_size(&ctx.body.heap, map_term) as i64))
}

fn bif_maps_get_2(ctx: &mut BifContext<'_>) -> BifResult {
    let key = ctx.arg(0);
    let map_term = ctx.arg(1);
    if !ctx.body.heap.is_map(map_term) {
        return Err(Exception::badarg());
    }
    match map::map_get(&ctx.body.heap, map_term, key) {
        Some(value) => ok(value),
        None => {
            let base = ctx_arg_register(ctx, 0);
            let reason = ctx.build(move |body| {
                let key = body.regs[base];
                body.heap.tuple(&[OpaqueTerm::make_atom(atoms::BADKEY), key])
            });
            Err(Exception::error(reason))
        }
    }
}

fn bif_maps_put_3(ctx: &mut BifContext<'_>) -> BifResult {
    let map_term = ctx.arg(2);
    if !ctx.body.heap.is_map(map_term) {
        return Err(Exception::badarg());
    }
    let base = ctx_arg_register(ctx, 0);
    ok(ctx.build(move |body| {
        let key = body.regs[base];
        let value = body.regs[base + 1];
        let map_term = body.regs[base + 2];
        map::map_put(&mut body.heap, map_term, key, value)
    }))
}

fn bif_maps_find_2(ctx: &mut BifContext<'_>) -> BifResult {
    let key = ctx.arg(0);
    let map_term = ctx.arg(1);
    if !ctx.body.heap.is_map(map_term) {
        return Err(Exception::badarg());
    }
    match map::map_get(&ctx.body.heap, map_term, key) {
        Some(_) => {
            let base = ctx_arg_register(ctx, 0);
            ok(ctx.build(move |body| {
                let key = body.regs[base];
                let map_term = body.regs[base + 1];
                let value = map::map_get(&body.heap, map_term, key)
                    .expect("map unchanged during find");
                body.heap.tuple(&[OpaqueTerm::make_atom(atoms::OK), value])
            }))
        }
        None => ok(OpaqueTerm::make_atom(atoms::ERROR)),
    }
}

// -- code management ------------------------------------------------------

fn bif_load_module_2(ctx: &mut BifContext<'_>) -> BifResult {
    let module = atom_arg(ctx, 0)?;
    let image = ctx.arg(1);
    if !ctx.body.heap.is_binary(image) {
        return Err(Exception::badarg());
    }
    let bytes = ctx.body.heap.binary_to_vec(image);
    ctx.charge(1 + bytes.len() as i64 / 64);
    match code::load_bytes(&bytes) {
        Ok(instance) if instance.name == module => ok(ctx.build(move |body| {
            body.heap.tuple(&[
                OpaqueTerm::make_atom(Atom::intern("module").expect("atom table exhausted")),
                OpaqueTerm::make_atom(module),
            ])
        })),
        Ok(_) | Err(_) => {
            let badfile = Atom::intern("badfile").expect("atom table exhausted");
            ok(ctx.build(move |body| {
                body.heap.tuple(&[
                    OpaqueTerm::make_atom(atoms::ERROR),
                    OpaqueTerm::make_atom(badfile),
                ])
            }))
        }
    }
}

fn bif_purge_module_1(ctx: &mut BifContext<'_>) -> BifResult {
    let module = atom_arg(ctx, 0)?;
    match code::purge(module, Some((ctx.process.pid(), ctx.body))) {
        PurgeResult::Purged => true_value(),
        PurgeResult::Busy => ok(OpaqueTerm::make_atom(atoms::BUSY)),
        PurgeResult::NoOldCode => ok(OpaqueTerm::make_bool(false)),
        PurgeResult::NotLoaded => Err(Exception::badarg()),
    }
}

fn bif_delete_module_1(ctx: &mut BifContext<'_>) -> BifResult {
    let module = atom_arg(ctx, 0)?;
    match code::delete(module) {
        PurgeResult::Purged => true_value(),
        PurgeResult::Busy => ok(OpaqueTerm::make_atom(atoms::BUSY)),
        _ => ok(OpaqueTerm::make_atom(atoms::UNDEFINED)),
    }
}

fn bif_garbage_collect_0(ctx: &mut BifContext<'_>) -> BifResult {
    let moved = collect_garbage_sweep(ctx.body, 0, ember_rt::gc::Sweep::Full);
    ctx.charge(1 + moved as i64 / 64);
    true_value()
}

fn bif_halt_1(ctx: &mut BifContext<'_>) -> BifResult {
    let code = ctx.arg(0);
    if !code.is_small() {
        return Err(Exception::badarg());
    }
    Ok(BifOutcome::Halt(code.small_value() as i32))
}

fn bif_node_0(_ctx: &mut BifContext<'_>) -> BifResult {
    ok(OpaqueTerm::make_atom(atoms::NONODE))
}

fn bif_group_leader_0(ctx: &mut BifContext<'_>) -> BifResult {
    ok(OpaqueTerm::make_pid(ctx.body.group_leader))
}

fn bif_group_leader_2(ctx: &mut BifContext<'_>) -> BifResult {
    let leader = pid_arg(ctx, 0)?;
    let target = pid_arg(ctx, 1)?;
    if table::lookup(leader).is_none() {
        return Err(Exception::badarg());
    }
    if target == ctx.process.pid() {
        ctx.body.group_leader = leader;
    } else if !signals::send_to(target, Signal::GroupLeader { leader }) {
        return Err(Exception::badarg());
    }
    true_value()
}

// -- type tests -----------------------------------------------------------

macro_rules! type_test_bif {
    ($name:ident, |$ctx:ident, $term:ident| $test:expr) => {
        fn $name($ctx: &mut BifContext<'_>) -> BifResult {
            let $term = $ctx.arg(0);
            let _ = &$ctx;
            ok(OpaqueTerm::make_bool($test))
        }
    };
}

type_test_bif!(bif_is_atom_1, |ctx, t| t.is_atom());
type_test_bif!(bif_is_boolean_1, |ctx, t| t.as_bool().is_some());
type_test_bif!(bif_is_integer_1, |ctx, t| ctx.body.heap.is_integer(t));
type_test_bif!(bif_is_float_1, |ctx, t| ctx.body.heap.is_float(t));
type_test_bif!(bif_is_number_1, |ctx, t| ctx.body.heap.is_number(t));
type_test_bif!(bif_is_list_1, |ctx, t| ctx.body.heap.is_list(t));
type_test_bif!(bif_is_tuple_1, |ctx, t| ctx.body.heap.is_tuple(t));
type_test_bif!(bif_is_map_1, |ctx, t| ctx.body.heap.is_map(t));
type_test_bif!(bif_is_pid_1, |ctx, t| t.is_pid());
type_test_bif!(bif_is_reference_1, |ctx, t| t.is_local_ref());
type_test_bif!(bif_is_binary_1, |ctx, t| ctx.body.heap.is_binary(t));
type_test_bif!(bif_is_function_1, |ctx, t| ctx.body.heap.is_closure(t));

/// Absolute register index of argument `i`, for build closures that must
/// re-read arguments across a collection.
fn ctx_arg_register(ctx: &BifContext<'_>, i: usize) -> usize {
    ctx.arg_register(i)
}
