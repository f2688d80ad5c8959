//! Property suites for the runtime invariants: process-table pid safety,
//! external-term round-tripping, and heap integrity across collections.

use std::sync::Arc;

use proptest::prelude::*;

use ember_rt::gc::{Collector, Sweep};
use ember_rt::heap::ProcessHeap;
use ember_rt::process::{table, Priority, Process, ProcessId};
use ember_rt::term::{atoms, Atom, OpaqueTerm};
use ember_rt::{etf, map};

fn dummy_process(pid: ProcessId) -> Arc<Process> {
    Arc::new(Process::new(
        pid,
        None,
        Priority::Normal,
        256,
        65535,
        pid,
        (atoms::UNDEFINED, atoms::UNDEFINED, 0),
    ))
}

proptest! {
    /// Table size tracks spawns minus exits, live pids resolve, and a
    /// freed pid's serial never resolves again.
    #[test]
    fn process_table_tracks_spawns_and_exits(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
        let before = table::len();
        let mut live: Vec<ProcessId> = Vec::new();
        let mut dead: Vec<ProcessId> = Vec::new();

        for spawn in ops {
            if spawn || live.is_empty() {
                let pid = table::allocate_pid().unwrap();
                table::insert(dummy_process(pid));
                live.push(pid);
            } else {
                let pid = live.swap_remove(0);
                table::remove(pid);
                dead.push(pid);
            }
        }

        prop_assert_eq!(table::len(), before + live.len());
        for pid in &live {
            prop_assert!(table::lookup(*pid).is_some(), "live pid {} must resolve", pid);
        }
        for pid in &dead {
            // The number may have been reused, but never with our serial
            if let Some(found) = table::lookup(*pid) {
                prop_assert_ne!(found.pid().serial(), pid.serial());
            }
        }

        for pid in live {
            table::remove(pid);
        }
    }
}

/// A strategy for closed terms, built bottom-up on a fragment heap as a
/// construction recipe (the heap itself is not `Clone`).
#[derive(Debug, Clone)]
enum TermShape {
    Int(i64),
    BigMul(i64),
    Float(f64),
    Atom(u8),
    Nil,
    Binary(Vec<u8>),
    List(Vec<TermShape>),
    Tuple(Vec<TermShape>),
    Map(Vec<(TermShape, TermShape)>),
}

fn term_shape() -> impl Strategy<Value = TermShape> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(TermShape::Int),
        (1i64..i64::MAX).prop_map(TermShape::BigMul),
        any::<f64>().prop_filter("finite floats", |f| f.is_finite()).prop_map(TermShape::Float),
        (0u8..8).prop_map(TermShape::Atom),
        Just(TermShape::Nil),
        proptest::collection::vec(any::<u8>(), 0..96).prop_map(TermShape::Binary),
    ];
    leaf.prop_recursive(3, 48, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(TermShape::List),
            proptest::collection::vec(inner.clone(), 0..6).prop_map(TermShape::Tuple),
            proptest::collection::vec((inner.clone(), inner), 0..6).prop_map(TermShape::Map),
        ]
    })
}

fn build_term(heap: &mut ProcessHeap, shape: &TermShape) -> OpaqueTerm {
    match shape {
        TermShape::Int(value) => heap.integer(*value).unwrap(),
        TermShape::BigMul(value) => {
            heap.big(num_bigint::BigInt::from(*value) * i64::MAX).unwrap()
        }
        TermShape::Float(value) => heap.float(*value).unwrap(),
        TermShape::Atom(index) => {
            let names = ["alpha", "beta", "gamma", "delta", "ok", "error", "true", "false"];
            OpaqueTerm::make_atom(Atom::intern(names[*index as usize]).unwrap())
        }
        TermShape::Nil => OpaqueTerm::NIL,
        TermShape::Binary(bytes) => heap.binary(bytes).unwrap(),
        TermShape::List(elems) => {
            let elems: Vec<OpaqueTerm> =
                elems.iter().map(|shape| build_term(heap, shape)).collect();
            heap.list_from_slice(&elems, OpaqueTerm::NIL).unwrap()
        }
        TermShape::Tuple(elems) => {
            let elems: Vec<OpaqueTerm> =
                elems.iter().map(|shape| build_term(heap, shape)).collect();
            heap.tuple(&elems).unwrap()
        }
        TermShape::Map(pairs) => {
            let pairs: Vec<(OpaqueTerm, OpaqueTerm)> = pairs
                .iter()
                .map(|(k, v)| (build_term(heap, k), build_term(heap, v)))
                .collect();
            map::map_from_pairs(heap, &pairs).unwrap()
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// decode(encode(T)) is structurally equal to T, and encoding the
    /// decoded value is byte-identical.
    #[test]
    fn external_term_format_round_trips(shape in term_shape()) {
        let mut src = ProcessHeap::fragment();
        let term = build_term(&mut src, &shape);
        let encoded = etf::encode(&src, term).unwrap();

        let mut dst = ProcessHeap::fragment();
        let decoded = etf::decode(&mut dst, &encoded).unwrap();
        let reencoded = etf::encode(&dst, decoded).unwrap();
        prop_assert_eq!(&encoded, &reencoded);

        let mut merged = ProcessHeap::fragment();
        let a = merged.copy_from(&src, term).unwrap();
        let b = merged.copy_from(&dst, decoded).unwrap();
        prop_assert!(merged.exact_eq(a, b));
    }

    /// After minor and full collections every live pointer still
    /// dereferences to the same structural value, and off-heap data stays
    /// owned.
    #[test]
    fn collections_preserve_reachable_structure(shape in term_shape()) {
        let mut heap = ProcessHeap::fragment();
        let mut root = build_term(&mut heap, &shape);
        // Unreachable garbage interleaved with the live structure
        for filler in 0..16 {
            heap.tuple(&[OpaqueTerm::make_small(filler)]).unwrap();
        }

        let before = etf::encode(&heap, root).unwrap();

        let mut gc = Collector::begin(&mut heap, Sweep::Minor, 0);
        root = gc.evacuate(root);
        gc.finish(&mut heap, 0);
        prop_assert_eq!(&etf::encode(&heap, root).unwrap(), &before);

        let mut gc = Collector::begin(&mut heap, Sweep::Full, 0);
        root = gc.evacuate(root);
        gc.finish(&mut heap, 0);
        prop_assert_eq!(&etf::encode(&heap, root).unwrap(), &before);

        // Off-heap data the term references is still owned: its Arc lives
        // in the heap's owner table
        prop_assert!(heap.young_used() + heap.old_used() > 0 || before.len() <= 16);
    }
}
