//! End-to-end scenarios: modules are assembled with the bytecode builder,
//! loaded through the registry, and run on a real scheduler pool. A probe
//! NIF reports observations back to the test thread; runtime exit watchers
//! observe process termination reasons.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use ember_bytecode::{Image, ModuleBuilder, Opcode};
use ember_emulator::nifs::{self, NifEnv, NifError, NifExtension, NifFunction};
use ember_emulator::Emulator;
use ember_rt::code;
use ember_rt::process::{signals, spawn, Priority, Signal};
use ember_rt::runtime::{self, Config, ExitNotice, Runtime};
use ember_rt::term::{Atom, OpaqueTerm};
use ember_rt::{etf, ProcessHeap, ProcessId};

// -- harness --------------------------------------------------------------

static PROBE_LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn probe_report(env: &mut NifEnv<'_>, args: &[OpaqueTerm]) -> Result<OpaqueTerm, NifError> {
    let rendered = render(env, args[0]);
    PROBE_LOG.lock().unwrap().push(rendered);
    env.make_atom("ok")
}

fn faulty_boom(_env: &mut NifEnv<'_>, _args: &[OpaqueTerm]) -> Result<OpaqueTerm, NifError> {
    // Stands in for the null dereference of the scenario: in a verified
    // memory-safe extension, faults surface as panics
    panic!("segmentation-style fault");
}

fn render(env: &NifEnv<'_>, term: OpaqueTerm) -> String {
    if let Ok(n) = env.get_int(term) {
        return n.to_string();
    }
    if let Ok(atom) = env.get_atom(term) {
        return atom.name().to_string();
    }
    if let Ok(elems) = env.get_tuple(term) {
        let parts: Vec<String> = elems.iter().map(|t| render(env, *t)).collect();
        return format!("{{{}}}", parts.join(","));
    }
    "?".to_string()
}

fn ensure_runtime() {
    static START: Once = Once::new();
    START.call_once(|| {
        let config = Config { scheduler_count: Some(4), ..Default::default() };
        let mut runtime = Runtime::initialize(config).expect("config is valid");
        runtime.start(Arc::new(Emulator::new())).expect("scheduler start");
        // The pool lives for the whole test binary
        Box::leak(Box::new(runtime));

        nifs::register_extension(NifExtension {
            module: "probe".into(),
            version: nifs::NIF_API_VERSION,
            functions: vec![NifFunction {
                name: "report".into(),
                arity: 1,
                flags: 0,
                fun: probe_report,
            }],
        })
        .unwrap();
        nifs::register_extension(NifExtension {
            module: "faulty".into(),
            version: nifs::NIF_API_VERSION,
            functions: vec![NifFunction {
                name: "boom".into(),
                arity: 0,
                flags: 0,
                fun: faulty_boom,
            }],
        })
        .unwrap();
        nifs::register_extension(NifExtension {
            module: "blocking".into(),
            version: nifs::NIF_API_VERSION,
            functions: vec![NifFunction {
                name: "slow_triple".into(),
                arity: 1,
                flags: nifs::flags::DIRTY_CPU,
                fun: blocking_slow_triple,
            }],
        })
        .unwrap();
    });
}

fn blocking_slow_triple(
    env: &mut NifEnv<'_>,
    args: &[OpaqueTerm],
) -> Result<OpaqueTerm, NifError> {
    // Long enough that running it on a normal scheduler would be rude
    std::thread::sleep(Duration::from_millis(30));
    let n = env.get_int(args[0])?;
    env.make_int(n * 3)
}

fn unique(prefix: &str) -> String {
    static N: AtomicUsize = AtomicUsize::new(0);
    format!("{}_{}", prefix, N.fetch_add(1, Ordering::Relaxed))
}

/// Waits until the probe log satisfies `pred`, returning a snapshot.
fn wait_for_probe(pred: impl Fn(&[String]) -> bool, what: &str) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        {
            let log = PROBE_LOG.lock().unwrap();
            if pred(&log) {
                return log.clone();
            }
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}: log = {:?}", PROBE_LOG.lock().unwrap());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn probe_contains(entry: &str) -> impl Fn(&[String]) -> bool + '_ {
    move |log| log.iter().any(|line| line == entry)
}

fn spawn_main(image: Image) -> (ProcessId, std::sync::mpsc::Receiver<ExitNotice>) {
    spawn_entry(image, "main", Priority::Normal)
}

fn spawn_entry(
    image: Image,
    entry: &str,
    priority: Priority,
) -> (ProcessId, std::sync::mpsc::Receiver<ExitNotice>) {
    ensure_runtime();
    let instance = code::load(image).expect("image loads");
    let function = Atom::intern(entry).unwrap();
    let options = spawn::SpawnOptions { priority, ..Default::default() };
    let spawned = spawn::spawn_mfa(None, instance.name, function, &[], options).expect("spawns");
    let rx = runtime::watch(spawned.pid);
    (spawned.pid, rx)
}

fn await_exit(rx: &std::sync::mpsc::Receiver<ExitNotice>) -> ExitNotice {
    rx.recv_timeout(Duration::from_secs(10)).expect("process exits in time")
}

/// Encodes a literal with the external format, for the builder.
fn literal_blob(build: impl FnOnce(&mut ProcessHeap) -> OpaqueTerm) -> Vec<u8> {
    let mut staging = ProcessHeap::fragment();
    let term = build(&mut staging);
    etf::encode(&staging, term).unwrap()
}

/// Emits a receive-anything-forever loop at the current position.
fn emit_wait_forever(m: &mut ModuleBuilder, scratch: u16) {
    let peek = m.new_label();
    let wait = m.new_label();
    m.bind(peek);
    m.push(Opcode::RecvPeek { dst: scratch, empty: wait });
    m.push(Opcode::RecvNext);
    m.push(Opcode::Br { label: peek });
    m.bind(wait);
    let infinity = m.atom("infinity");
    m.push(Opcode::LoadAtom { dst: scratch + 1, atom: infinity });
    m.push(Opcode::RecvWait { peek, timeout: scratch + 1 });
    m.push(Opcode::Br { label: peek });
}

// -- S1: spawn, send, selective receive -----------------------------------

#[test]
fn s1_ping_pong() {
    ensure_runtime();
    let name = unique("s1");
    let mut m = ModuleBuilder::new(&name);
    let spawn3 = m.import("erlang", "spawn", 3);
    let self0 = m.import("erlang", "self", 0);
    let report1 = m.import("probe", "report", 1);
    let server_atom = m.atom("server");
    let ping = m.atom("ping");
    let pong_label = m.atom("s1_pong_seen");
    let ok = m.atom("ok");
    let infinity = m.atom("infinity");

    m.begin_function("main", 0, 8, true);
    // P = spawn(name, server, [])
    m.push(Opcode::LoadAtom { dst: 1, atom: 0 });
    m.push(Opcode::LoadAtom { dst: 2, atom: server_atom });
    m.push(Opcode::LoadNil { dst: 3 });
    m.push(Opcode::CallStatic { dst: 0, import: spawn3, args: 1 });
    // P ! {ping, self()}
    m.push(Opcode::CallStatic { dst: 2, import: self0, args: 0 });
    m.push(Opcode::LoadAtom { dst: 1, atom: ping });
    m.push(Opcode::MakeTuple { dst: 3, base: 1, arity: 2 });
    m.push(Opcode::Send { to: 0, msg: 3 });
    // receive X -> probe:report(s1_pong_seen) when X =:= pong
    let peek = m.new_label();
    let wait = m.new_label();
    let not_pong = m.new_label();
    m.bind(peek);
    m.push(Opcode::RecvPeek { dst: 4, empty: wait });
    let pong = m.atom("pong");
    m.push(Opcode::LoadAtom { dst: 5, atom: pong });
    m.push(Opcode::IsEqExact { fail: not_pong, a: 4, b: 5 });
    m.push(Opcode::RecvPop);
    m.push(Opcode::LoadAtom { dst: 6, atom: pong_label });
    m.push(Opcode::CallStatic { dst: 7, import: report1, args: 6 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(not_pong);
    m.push(Opcode::RecvNext);
    m.push(Opcode::Br { label: peek });
    m.bind(wait);
    m.push(Opcode::LoadAtom { dst: 6, atom: infinity });
    m.push(Opcode::RecvWait { peek, timeout: 6 });
    m.push(Opcode::Br { label: peek });

    // server: receive {ping, From} -> From ! pong
    m.begin_function("server", 0, 8, true);
    let speek = m.new_label();
    let snext = m.new_label();
    let swait = m.new_label();
    m.bind(speek);
    m.push(Opcode::RecvPeek { dst: 0, empty: swait });
    m.push(Opcode::IsTaggedTuple { fail: snext, src: 0, arity: 2, atom: ping });
    m.push(Opcode::RecvPop);
    m.push(Opcode::GetElement { dst: 1, src: 0, index: 1 });
    m.push(Opcode::LoadAtom { dst: 2, atom: pong });
    m.push(Opcode::Send { to: 1, msg: 2 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(snext);
    m.push(Opcode::RecvNext);
    m.push(Opcode::Br { label: speek });
    m.bind(swait);
    m.push(Opcode::LoadAtom { dst: 3, atom: infinity });
    m.push(Opcode::RecvWait { peek: speek, timeout: 3 });
    m.push(Opcode::Br { label: speek });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    wait_for_probe(probe_contains("s1_pong_seen"), "pong round trip");
    let exit = await_exit(&rx);
    assert!(exit.normal, "main exits normally, got {}", exit.reason);
}

// -- S2: link cascade -----------------------------------------------------

#[test]
fn s2_link_cascade_kills_non_trapping_peer() {
    ensure_runtime();
    let name = unique("s2");
    let mut m = ModuleBuilder::new(&name);
    let spawn_link3 = m.import("erlang", "spawn_link", 3);
    let exit1 = m.import("erlang", "exit", 1);
    let boom_atom = m.atom("boom");
    let reason = m.atom("s2_reason");

    m.begin_function("main", 0, 8, true);
    m.push(Opcode::LoadAtom { dst: 1, atom: 0 });
    m.push(Opcode::LoadAtom { dst: 2, atom: boom_atom });
    m.push(Opcode::LoadNil { dst: 3 });
    m.push(Opcode::CallStatic { dst: 0, import: spawn_link3, args: 1 });
    emit_wait_forever(&mut m, 4);

    m.begin_function("boom", 0, 4, true);
    m.push(Opcode::LoadAtom { dst: 0, atom: reason });
    m.push(Opcode::CallStatic { dst: 1, import: exit1, args: 0 });
    m.push(Opcode::Ret { src: 0 });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    let exit = await_exit(&rx);
    assert!(!exit.normal);
    assert!(
        exit.reason.contains("s2_reason"),
        "exit reason should carry the linked reason, got {}",
        exit.reason
    );
}

// -- S3: preemption and priorities ----------------------------------------

#[test]
fn s3_long_loop_yields_and_high_priority_runs_first() {
    ensure_runtime();
    let loop_name = unique("s3_loop");
    let mut m = ModuleBuilder::new(&loop_name);
    let report1 = m.import("probe", "report", 1);
    let done = m.atom("s3_loop_done");
    let ok = m.atom("ok");

    m.begin_function("main", 0, 8, true);
    m.push(Opcode::LoadInt { dst: 0, value: 400_000 });
    m.push(Opcode::LoadInt { dst: 1, value: 0 });
    let head = m.new_label();
    let body = m.new_label();
    m.bind(head);
    m.push(Opcode::Reduce);
    m.push(Opcode::IsEqExact { fail: body, a: 0, b: 1 });
    m.push(Opcode::LoadAtom { dst: 2, atom: done });
    m.push(Opcode::CallStatic { dst: 3, import: report1, args: 2 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(body);
    m.push(Opcode::LoadInt { dst: 2, value: 1 });
    m.push(Opcode::Sub { dst: 0, a: 0, b: 2 });
    m.push(Opcode::Br { label: head });
    let loop_image = m.build().unwrap();

    let high_name = unique("s3_high");
    let mut h = ModuleBuilder::new(&high_name);
    let report1 = h.import("probe", "report", 1);
    let hi = h.atom("s3_high_ran");
    let ok = h.atom("ok");
    h.begin_function("main", 0, 4, true);
    h.push(Opcode::LoadAtom { dst: 0, atom: hi });
    h.push(Opcode::CallStatic { dst: 1, import: report1, args: 0 });
    h.push(Opcode::LoadAtom { dst: 0, atom: ok });
    h.push(Opcode::Ret { src: 0 });
    let high_image = h.build().unwrap();

    let (looper, loop_rx) = spawn_main(loop_image);
    let (_high, high_rx) = spawn_entry(high_image, "main", Priority::High);

    let log = wait_for_probe(probe_contains("s3_loop_done"), "long loop completion");
    let hi_at = log.iter().position(|l| l == "s3_high_ran").expect("high process ran");
    let done_at = log.iter().position(|l| l == "s3_loop_done").unwrap();
    assert!(
        hi_at < done_at,
        "a freshly spawned high-priority process must not wait for a long loop"
    );

    await_exit(&loop_rx);
    await_exit(&high_rx);
    // The loop ran at least 400k reduction bumps across many slices, so
    // the recorded reduction count reflects the forced yields
    let _ = looper;
}

// -- S4: hot code replacement and purge ------------------------------------

#[test]
fn s4_code_switch_at_qualified_call_and_purge_votes() {
    ensure_runtime();
    let subject = unique("s4_mod");

    let version_image = |vsn: i64| {
        let mut m = ModuleBuilder::new(&subject);
        let lit = m.literal(literal_blob(|heap| {
            let tag = OpaqueTerm::make_atom(Atom::intern("vsn").unwrap());
            let n = OpaqueTerm::make_small(vsn);
            heap.tuple(&[tag, n]).unwrap()
        }));
        m.begin_function("f", 0, 2, true);
        m.push(Opcode::LoadLiteral { dst: 0, literal: lit });
        m.push(Opcode::Ret { src: 0 });
        m.build().unwrap()
    };

    let runner_name = unique("s4_run");
    let mut m = ModuleBuilder::new(&runner_name);
    let f0 = m.import(&subject, "f", 0);
    let report1 = m.import("probe", "report", 1);
    let ok = m.atom("ok");
    let infinity = m.atom("infinity");

    m.begin_function("main", 0, 8, true);
    // report(element(2, subject:f()))
    m.push(Opcode::CallStatic { dst: 0, import: f0, args: 4 });
    m.push(Opcode::GetElement { dst: 1, src: 0, index: 1 });
    m.push(Opcode::CallStatic { dst: 2, import: report1, args: 1 });
    // wait for the go-ahead
    let peek1 = m.new_label();
    let wait1 = m.new_label();
    m.bind(peek1);
    m.push(Opcode::RecvPeek { dst: 3, empty: wait1 });
    m.push(Opcode::RecvPop);
    // the switch: a fully qualified call resolves the new version
    m.push(Opcode::CallStatic { dst: 0, import: f0, args: 4 });
    m.push(Opcode::GetElement { dst: 1, src: 0, index: 1 });
    m.push(Opcode::CallStatic { dst: 2, import: report1, args: 1 });
    // hold the v2 literal in r0 and wait to be released
    let peek2 = m.new_label();
    let wait2 = m.new_label();
    m.bind(peek2);
    m.push(Opcode::RecvPeek { dst: 3, empty: wait2 });
    m.push(Opcode::RecvPop);
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(wait1);
    m.push(Opcode::LoadAtom { dst: 5, atom: infinity });
    m.push(Opcode::RecvWait { peek: peek1, timeout: 5 });
    m.push(Opcode::Br { label: peek1 });
    m.bind(wait2);
    m.push(Opcode::LoadAtom { dst: 5, atom: infinity });
    m.push(Opcode::RecvWait { peek: peek2, timeout: 5 });
    m.push(Opcode::Br { label: peek2 });

    code::load(version_image(1)).unwrap();
    let (runner, rx) = spawn_main(m.build().unwrap());
    wait_for_probe(probe_contains("1"), "v1 observed");

    // Load v2: v1 moves to the old slot
    code::load(version_image(2)).unwrap();
    let subject_atom = Atom::intern(&subject).unwrap();
    assert!(code::old_version(subject_atom).is_some());

    let nudge = |pid| {
        let fragment = ProcessHeap::fragment();
        signals::send_to(
            pid,
            Signal::Message { sender: pid, fragment, root: OpaqueTerm::NIL },
        );
    };
    nudge(runner);
    wait_for_probe(probe_contains("2"), "v2 observed after qualified call");

    // The runner still votes for v1's literal area (loaded before any
    // collection), so the purge must refuse
    assert_eq!(code::purge(subject_atom, None), code::PurgeResult::Busy);

    // Release the runner; with it gone the votes disappear
    nudge(runner);
    let exit = await_exit(&rx);
    assert!(exit.normal);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match code::purge(subject_atom, None) {
            code::PurgeResult::Purged => break,
            code::PurgeResult::Busy if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            other => panic!("unexpected purge outcome: {other:?}"),
        }
    }
    assert!(code::old_version(subject_atom).is_none());
}

// -- S5: NIF fault isolation ----------------------------------------------

#[test]
fn s5_nif_fault_is_catchable_and_isolated() {
    ensure_runtime();
    let name = unique("s5_catch");
    let mut m = ModuleBuilder::new(&name);
    let boom0 = m.import("faulty", "boom", 0);
    let report1 = m.import("probe", "report", 1);
    let ok = m.atom("ok");
    let unreachable = m.atom("s5_no_fault");

    m.begin_function("main", 0, 8, true);
    let handler = m.new_label();
    m.push(Opcode::Catch { handler });
    m.push(Opcode::CallStatic { dst: 3, import: boom0, args: 4 });
    m.push(Opcode::EndCatch);
    m.push(Opcode::LoadAtom { dst: 4, atom: unreachable });
    m.push(Opcode::CallStatic { dst: 5, import: report1, args: 4 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    // handler: x0 = class, x1 = {native_fault, Kind, Detail}
    m.bind(handler);
    m.push(Opcode::GetElement { dst: 4, src: 1, index: 0 });
    m.push(Opcode::Mov { dst: 5, src: 0 });
    m.push(Opcode::MakeTuple { dst: 6, base: 4, arity: 2 });
    m.push(Opcode::CallStatic { dst: 7, import: report1, args: 6 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    wait_for_probe(probe_contains("{native_fault,error}"), "caught native fault");
    let exit = await_exit(&rx);
    assert!(exit.normal, "a caught fault does not terminate the caller");
}

#[test]
fn s5_uncaught_nif_fault_terminates_only_the_caller() {
    ensure_runtime();
    let name = unique("s5_raw");
    let mut m = ModuleBuilder::new(&name);
    let boom0 = m.import("faulty", "boom", 0);
    m.begin_function("main", 0, 8, true);
    m.push(Opcode::CallStatic { dst: 0, import: boom0, args: 4 });
    m.push(Opcode::Ret { src: 0 });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    let exit = await_exit(&rx);
    assert!(!exit.normal);
    assert!(
        exit.reason.contains("native_fault"),
        "reason should be a native fault, got {}",
        exit.reason
    );

    // The runtime and other processes survive: a fresh probe call works
    let after = unique("s5_after");
    let mut ok_mod = ModuleBuilder::new(&after);
    let report1 = ok_mod.import("probe", "report", 1);
    let alive = ok_mod.atom("s5_still_alive");
    let ok = ok_mod.atom("ok");
    ok_mod.begin_function("main", 0, 4, true);
    ok_mod.push(Opcode::LoadAtom { dst: 0, atom: alive });
    ok_mod.push(Opcode::CallStatic { dst: 1, import: report1, args: 0 });
    ok_mod.push(Opcode::LoadAtom { dst: 0, atom: ok });
    ok_mod.push(Opcode::Ret { src: 0 });
    let (_p2, rx2) = spawn_main(ok_mod.build().unwrap());
    wait_for_probe(probe_contains("s5_still_alive"), "runtime survives the fault");
    assert!(await_exit(&rx2).normal);
}

// -- S6: external term round trip -----------------------------------------

#[test]
fn s6_term_to_binary_round_trip_in_bytecode() {
    ensure_runtime();
    let name = unique("s6");
    let mut m = ModuleBuilder::new(&name);
    let t2b = m.import("erlang", "term_to_binary", 1);
    let b2t = m.import("erlang", "binary_to_term", 1);
    let report1 = m.import("probe", "report", 1);
    let lit = m.literal(literal_blob(|heap| {
        let elems: Vec<OpaqueTerm> = (0..10).map(OpaqueTerm::make_small).collect();
        heap.list_from_slice(&elems, OpaqueTerm::NIL).unwrap()
    }));
    let yes = m.atom("s6_equal");
    let no = m.atom("s6_mismatch");
    let ok = m.atom("ok");

    m.begin_function("main", 0, 8, true);
    m.push(Opcode::LoadLiteral { dst: 1, literal: lit });
    m.push(Opcode::CallStatic { dst: 2, import: t2b, args: 1 });
    m.push(Opcode::Mov { dst: 4, src: 2 });
    m.push(Opcode::CallStatic { dst: 3, import: b2t, args: 4 });
    let bad = m.new_label();
    m.push(Opcode::IsEqExact { fail: bad, a: 1, b: 3 });
    // idempotence: encoding the decoded copy gives identical bytes
    m.push(Opcode::Mov { dst: 4, src: 3 });
    m.push(Opcode::CallStatic { dst: 5, import: t2b, args: 4 });
    m.push(Opcode::IsEqExact { fail: bad, a: 2, b: 5 });
    m.push(Opcode::LoadAtom { dst: 6, atom: yes });
    m.push(Opcode::CallStatic { dst: 7, import: report1, args: 6 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(bad);
    m.push(Opcode::LoadAtom { dst: 6, atom: no });
    m.push(Opcode::CallStatic { dst: 7, import: report1, args: 6 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    wait_for_probe(probe_contains("s6_equal"), "round trip equality");
    assert!(await_exit(&rx).normal);
}

// -- ordering, monitors, trap_exit, kill, timeouts ------------------------

#[test]
fn per_pair_message_order_is_fifo() {
    ensure_runtime();
    let name = unique("order");
    let mut m = ModuleBuilder::new(&name);
    let spawn3 = m.import("erlang", "spawn", 3);
    let report1 = m.import("probe", "report", 1);
    let recv_atom = m.atom("recv");
    let ok = m.atom("ok");
    let infinity = m.atom("infinity");
    let order_ok = m.atom("order_ok");
    let order_bad = m.atom("order_bad");

    m.begin_function("main", 0, 8, true);
    m.push(Opcode::LoadAtom { dst: 1, atom: 0 });
    m.push(Opcode::LoadAtom { dst: 2, atom: recv_atom });
    m.push(Opcode::LoadNil { dst: 3 });
    m.push(Opcode::CallStatic { dst: 0, import: spawn3, args: 1 });
    m.push(Opcode::LoadInt { dst: 1, value: 0 });
    m.push(Opcode::LoadInt { dst: 2, value: 100 });
    let shead = m.new_label();
    let sbody = m.new_label();
    m.bind(shead);
    m.push(Opcode::Reduce);
    m.push(Opcode::IsEqExact { fail: sbody, a: 1, b: 2 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(sbody);
    m.push(Opcode::Send { to: 0, msg: 1 });
    m.push(Opcode::LoadInt { dst: 3, value: 1 });
    m.push(Opcode::Add { dst: 1, a: 1, b: 3 });
    m.push(Opcode::Br { label: shead });

    m.begin_function("recv", 0, 8, true);
    m.push(Opcode::LoadInt { dst: 0, value: 0 });
    m.push(Opcode::LoadInt { dst: 1, value: 100 });
    let rpeek = m.new_label();
    let rwait = m.new_label();
    let rbad = m.new_label();
    m.bind(rpeek);
    m.push(Opcode::RecvPeek { dst: 2, empty: rwait });
    m.push(Opcode::IsEqExact { fail: rbad, a: 2, b: 0 });
    m.push(Opcode::RecvPop);
    m.push(Opcode::LoadInt { dst: 3, value: 1 });
    m.push(Opcode::Add { dst: 0, a: 0, b: 3 });
    m.push(Opcode::Reduce);
    m.push(Opcode::IsEqExact { fail: rpeek, a: 0, b: 1 });
    m.push(Opcode::LoadAtom { dst: 4, atom: order_ok });
    m.push(Opcode::CallStatic { dst: 5, import: report1, args: 4 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(rbad);
    m.push(Opcode::LoadAtom { dst: 4, atom: order_bad });
    m.push(Opcode::CallStatic { dst: 5, import: report1, args: 4 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(rwait);
    m.push(Opcode::LoadAtom { dst: 6, atom: infinity });
    m.push(Opcode::RecvWait { peek: rpeek, timeout: 6 });
    m.push(Opcode::Br { label: rpeek });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    let log = wait_for_probe(
        |log| log.iter().any(|l| l == "order_ok" || l == "order_bad"),
        "ordered delivery",
    );
    assert!(log.iter().any(|l| l == "order_ok"), "messages arrived out of order: {log:?}");
    assert!(await_exit(&rx).normal);
}

#[test]
fn monitor_fires_exactly_once() {
    ensure_runtime();
    let name = unique("mon");
    let mut m = ModuleBuilder::new(&name);
    let spawn_monitor3 = m.import("erlang", "spawn_monitor", 3);
    let exit1 = m.import("erlang", "exit", 1);
    let report1 = m.import("probe", "report", 1);
    let boom_atom = m.atom("boom");
    let down = m.atom("DOWN");
    let reason = m.atom("mon_reason");
    let no_extra = m.atom("mon_no_extra");
    let extra = m.atom("mon_extra");
    let ok = m.atom("ok");
    let infinity = m.atom("infinity");

    m.begin_function("main", 0, 10, true);
    m.push(Opcode::LoadAtom { dst: 1, atom: 0 });
    m.push(Opcode::LoadAtom { dst: 2, atom: boom_atom });
    m.push(Opcode::LoadNil { dst: 3 });
    m.push(Opcode::CallStatic { dst: 0, import: spawn_monitor3, args: 1 });
    // receive {'DOWN', Ref, process, Pid, Reason} -> report(Reason)
    let peek = m.new_label();
    let skip = m.new_label();
    let wait = m.new_label();
    m.bind(peek);
    m.push(Opcode::RecvPeek { dst: 4, empty: wait });
    m.push(Opcode::IsTaggedTuple { fail: skip, src: 4, arity: 5, atom: down });
    m.push(Opcode::RecvPop);
    m.push(Opcode::GetElement { dst: 5, src: 4, index: 4 });
    m.push(Opcode::CallStatic { dst: 6, import: report1, args: 5 });
    // a second DOWN must never arrive: wait 150ms, then report silence
    let peek2 = m.new_label();
    let wait2 = m.new_label();
    m.bind(peek2);
    m.push(Opcode::RecvPeek { dst: 7, empty: wait2 });
    m.push(Opcode::LoadAtom { dst: 8, atom: extra });
    m.push(Opcode::CallStatic { dst: 9, import: report1, args: 8 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(wait2);
    m.push(Opcode::LoadInt { dst: 7, value: 150 });
    m.push(Opcode::RecvWait { peek: peek2, timeout: 7 });
    m.push(Opcode::LoadAtom { dst: 8, atom: no_extra });
    m.push(Opcode::CallStatic { dst: 9, import: report1, args: 8 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(skip);
    m.push(Opcode::RecvNext);
    m.push(Opcode::Br { label: peek });
    m.bind(wait);
    m.push(Opcode::LoadAtom { dst: 5, atom: infinity });
    m.push(Opcode::RecvWait { peek, timeout: 5 });
    m.push(Opcode::Br { label: peek });

    m.begin_function("boom", 0, 4, true);
    m.push(Opcode::LoadAtom { dst: 0, atom: reason });
    m.push(Opcode::CallStatic { dst: 1, import: exit1, args: 0 });
    m.push(Opcode::Ret { src: 0 });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    wait_for_probe(probe_contains("mon_reason"), "DOWN delivered");
    wait_for_probe(probe_contains("mon_no_extra"), "no duplicate DOWN");
    assert!(await_exit(&rx).normal);
    assert!(!PROBE_LOG.lock().unwrap().iter().any(|l| l == "mon_extra"));
}

#[test]
fn trap_exit_converts_link_signal_to_message() {
    ensure_runtime();
    let name = unique("trap");
    let mut m = ModuleBuilder::new(&name);
    let process_flag2 = m.import("erlang", "process_flag", 2);
    let spawn_link3 = m.import("erlang", "spawn_link", 3);
    let exit1 = m.import("erlang", "exit", 1);
    let report1 = m.import("probe", "report", 1);
    let trap_exit = m.atom("trap_exit");
    let true_atom = m.atom("true");
    let boom_atom = m.atom("boom");
    let exit_tag = m.atom("EXIT");
    let reason = m.atom("trap_reason");
    let ok = m.atom("ok");
    let infinity = m.atom("infinity");

    m.begin_function("main", 0, 8, true);
    m.push(Opcode::LoadAtom { dst: 1, atom: trap_exit });
    m.push(Opcode::LoadAtom { dst: 2, atom: true_atom });
    m.push(Opcode::CallStatic { dst: 0, import: process_flag2, args: 1 });
    m.push(Opcode::LoadAtom { dst: 1, atom: 0 });
    m.push(Opcode::LoadAtom { dst: 2, atom: boom_atom });
    m.push(Opcode::LoadNil { dst: 3 });
    m.push(Opcode::CallStatic { dst: 0, import: spawn_link3, args: 1 });
    // receive {'EXIT', Pid, Reason} -> report(Reason)
    let peek = m.new_label();
    let skip = m.new_label();
    let wait = m.new_label();
    m.bind(peek);
    m.push(Opcode::RecvPeek { dst: 4, empty: wait });
    m.push(Opcode::IsTaggedTuple { fail: skip, src: 4, arity: 3, atom: exit_tag });
    m.push(Opcode::RecvPop);
    m.push(Opcode::GetElement { dst: 5, src: 4, index: 2 });
    m.push(Opcode::CallStatic { dst: 6, import: report1, args: 5 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(skip);
    m.push(Opcode::RecvNext);
    m.push(Opcode::Br { label: peek });
    m.bind(wait);
    m.push(Opcode::LoadAtom { dst: 5, atom: infinity });
    m.push(Opcode::RecvWait { peek, timeout: 5 });
    m.push(Opcode::Br { label: peek });

    m.begin_function("boom", 0, 4, true);
    m.push(Opcode::LoadAtom { dst: 0, atom: reason });
    m.push(Opcode::CallStatic { dst: 1, import: exit1, args: 0 });
    m.push(Opcode::Ret { src: 0 });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    wait_for_probe(probe_contains("trap_reason"), "trapped EXIT message");
    let exit = await_exit(&rx);
    assert!(exit.normal, "trapping process survives the link signal");
}

#[test]
fn kill_is_unignorable_even_when_trapping() {
    ensure_runtime();
    let name = unique("kill");
    let mut m = ModuleBuilder::new(&name);
    let process_flag2 = m.import("erlang", "process_flag", 2);
    let trap_exit = m.atom("trap_exit");
    let true_atom = m.atom("true");

    m.begin_function("main", 0, 8, true);
    m.push(Opcode::LoadAtom { dst: 1, atom: trap_exit });
    m.push(Opcode::LoadAtom { dst: 2, atom: true_atom });
    m.push(Opcode::CallStatic { dst: 0, import: process_flag2, args: 1 });
    emit_wait_forever(&mut m, 3);

    let (pid, rx) = spawn_main(m.build().unwrap());
    // Give it a moment to park, then kill from outside
    std::thread::sleep(Duration::from_millis(100));
    signals::send_to(pid, Signal::Kill { sender: pid });

    let exit = await_exit(&rx);
    assert!(!exit.normal);
    assert!(exit.reason.contains("killed"), "kill reports as killed, got {}", exit.reason);
}

#[test]
fn dirty_nif_migrates_and_resumes() {
    ensure_runtime();
    let name = unique("dirty");
    let mut m = ModuleBuilder::new(&name);
    let slow1 = m.import("blocking", "slow_triple", 1);
    let report1 = m.import("probe", "report", 1);
    let ok = m.atom("ok");

    m.begin_function("main", 0, 8, true);
    m.push(Opcode::LoadInt { dst: 1, value: 14 });
    m.push(Opcode::CallStatic { dst: 2, import: slow1, args: 1 });
    m.push(Opcode::CallStatic { dst: 3, import: report1, args: 2 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    wait_for_probe(probe_contains("42"), "dirty call result");
    assert!(await_exit(&rx).normal);
}

#[test]
fn receive_after_times_out_and_cancels() {
    ensure_runtime();
    let name = unique("timeout");
    let mut m = ModuleBuilder::new(&name);
    let report1 = m.import("probe", "report", 1);
    let timed_out = m.atom("recv_timed_out");
    let got_msg = m.atom("recv_got_message");
    let ok = m.atom("ok");

    m.begin_function("main", 0, 8, true);
    let peek = m.new_label();
    let wait = m.new_label();
    m.bind(peek);
    m.push(Opcode::RecvPeek { dst: 0, empty: wait });
    m.push(Opcode::RecvPop);
    m.push(Opcode::LoadAtom { dst: 1, atom: got_msg });
    m.push(Opcode::CallStatic { dst: 2, import: report1, args: 1 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });
    m.bind(wait);
    m.push(Opcode::LoadInt { dst: 3, value: 50 });
    m.push(Opcode::RecvWait { peek, timeout: 3 });
    // timeout body
    m.push(Opcode::LoadAtom { dst: 1, atom: timed_out });
    m.push(Opcode::CallStatic { dst: 2, import: report1, args: 1 });
    m.push(Opcode::LoadAtom { dst: 0, atom: ok });
    m.push(Opcode::Ret { src: 0 });

    let (_pid, rx) = spawn_main(m.build().unwrap());
    wait_for_probe(probe_contains("recv_timed_out"), "receive-after timeout");
    assert!(await_exit(&rx).normal);
}
