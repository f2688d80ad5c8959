//! The module registry and code loader.
//!
//! Each module name owns a pair of slots: *current* and *old*. Loading a
//! new version atomically moves current to old and publishes the new
//! instance; a load while old code is still occupied is refused, the
//! caller must purge first. Fully-qualified calls resolve through the
//! current slot at call time, which is the version-switch boundary;
//! intra-module jumps stay inside the instance that is executing them.
//!
//! Every loaded instance owns an immutable literal region, addressed by
//! literal pointers carrying the instance id. Purging requires proof that
//! no process is executing the old instance and no heap references its
//! literals; the proof is gathered from per-process votes that the
//! collector maintains, so the sweep itself never walks foreign heaps.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use log::{debug, info};

use ember_bytecode::{Image, Opcode, ReadError};

use crate::etf::{self, EtfError};
use crate::heap::{LiteralRegion, OffHeap, ProcessHeap};
use crate::process::{ProcessBody, ProcessId};
use crate::term::{Atom, AtomError, BoxKind, OpaqueTerm, Tag};

/// Literal-area ids share the instance id space and must fit the pointer
/// encoding's area field.
const MAX_INSTANCES: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LambdaInfo {
    pub function: Atom,
    pub arity: u8,
    pub env_len: u8,
    pub offset: u32,
}

/// One immutable loaded version of a module.
#[derive(Debug)]
pub struct ModuleInstance {
    pub id: u32,
    pub name: Atom,
    /// Local atom index → global atom
    pub atoms: Vec<Atom>,
    pub imports: Vec<(Atom, Atom, u8)>,
    pub exports: HashMap<(Atom, u8), u32>,
    pub lambdas: Vec<LambdaInfo>,
    /// Literal table: terms in this instance's literal region
    pub literals: Vec<OpaqueTerm>,
    pub code: Vec<Opcode>,
    /// Raw attributes chunk, retained for tooling
    pub attributes: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("atom table: {0}")]
    Atom(#[from] AtomError),
    #[error("old code for {0} has not been purged")]
    OldCodeExists(Atom),
    #[error("literal {index}: {source}")]
    Literal { index: usize, source: EtfError },
    #[error("loaded module instance limit reached")]
    InstanceLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeResult {
    Purged,
    /// A process still executes the old code or references its literals
    Busy,
    NoOldCode,
    NotLoaded,
}

#[derive(Default)]
struct ModuleSlot {
    current: Option<Arc<ModuleInstance>>,
    old: Option<Arc<ModuleInstance>>,
}

lazy_static! {
    static ref MODULES: DashMap<Atom, ModuleSlot> = DashMap::new();
    static ref INSTANCES: DashMap<u32, Arc<ModuleInstance>> = DashMap::new();
    static ref LITERALS: DashMap<u32, Arc<LiteralRegion>> = DashMap::new();
}

static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(0);

/// Parses and loads a module image from bytes.
pub fn load_bytes(bytes: &[u8]) -> Result<Arc<ModuleInstance>, LoadError> {
    let image = ember_bytecode::ImageReader::new(bytes).read()?;
    load(image)
}

/// Loads a parsed image: interns atoms, materializes the literal region,
/// builds the export table, and publishes atomically.
pub fn load(image: Image) -> Result<Arc<ModuleInstance>, LoadError> {
    let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    if id >= MAX_INSTANCES {
        return Err(LoadError::InstanceLimit);
    }

    let mut atoms = Vec::with_capacity(image.atoms.len());
    for name in &image.atoms {
        atoms.push(Atom::intern(name)?);
    }
    let name = atoms[0];

    // Decode literals into a staging fragment, then seal it into the
    // immutable region addressed by this instance's id
    let mut staging = ProcessHeap::fragment();
    let mut staged_roots = Vec::with_capacity(image.literals.len());
    for (index, blob) in image.literals.iter().enumerate() {
        let root = etf::decode(&mut staging, blob)
            .map_err(|source| LoadError::Literal { index, source })?;
        staged_roots.push(root);
    }
    let (region, literals) = seal_literals(&staging, &staged_roots, id);

    let imports = image
        .imports
        .iter()
        .map(|import| {
            (atoms[import.module as usize], atoms[import.function as usize], import.arity)
        })
        .collect();
    let exports = image
        .exports
        .iter()
        .map(|export| ((atoms[export.function as usize], export.arity), export.offset))
        .collect();
    let lambdas = image
        .funs
        .iter()
        .map(|lambda| LambdaInfo {
            function: atoms[lambda.function as usize],
            arity: lambda.arity,
            env_len: lambda.env_len,
            offset: lambda.offset,
        })
        .collect();

    let instance = Arc::new(ModuleInstance {
        id,
        name,
        atoms,
        imports,
        exports,
        lambdas,
        literals,
        code: image.code,
        attributes: image.attributes,
    });

    // Publish: current moves to old; a still-occupied old slot refuses the
    // load so nothing mutates on failure
    {
        let mut slot = MODULES.entry(name).or_default();
        if slot.old.is_some() {
            return Err(LoadError::OldCodeExists(name));
        }
        LITERALS.insert(id, Arc::new(region));
        INSTANCES.insert(id, instance.clone());
        slot.old = slot.current.take();
        slot.current = Some(instance.clone());
    }

    info!(
        target: "loader",
        "loaded {} as instance {} ({} exports, {} literals)",
        name,
        id,
        instance.exports.len(),
        instance.literals.len(),
    );
    Ok(instance)
}

/// Moves the current version to the old slot without loading a
/// replacement. Fails with `Busy` if old code already exists.
pub fn delete(module: Atom) -> PurgeResult {
    match MODULES.get_mut(&module) {
        None => PurgeResult::NotLoaded,
        Some(mut slot) => {
            if slot.old.is_some() {
                return PurgeResult::Busy;
            }
            match slot.current.take() {
                None => PurgeResult::NotLoaded,
                Some(current) => {
                    slot.old = Some(current);
                    PurgeResult::Purged
                }
            }
        }
    }
}

/// Attempts to reclaim a module's old version.
///
/// `caller` is the process executing the purge (whose body lock is already
/// held); its own frames and votes are checked directly. Every other
/// process is inspected under a brief try-lock; contention is reported as
/// `Busy` rather than waited out, since the caller can simply retry.
pub fn purge(
    module: Atom,
    caller: Option<(ProcessId, &ProcessBody)>,
) -> PurgeResult {
    let old = match MODULES.get(&module) {
        None => return PurgeResult::NotLoaded,
        Some(slot) => match &slot.old {
            None => return PurgeResult::NoOldCode,
            Some(old) => old.clone(),
        },
    };
    let old_id = old.id;

    if let Some((_, body)) = caller {
        if body_references(body, old_id) {
            return PurgeResult::Busy;
        }
    }
    let caller_pid = caller.map(|(pid, _)| pid);
    for process in crate::process::table::snapshot() {
        if Some(process.pid()) == caller_pid {
            continue;
        }
        match process.try_body() {
            None => return PurgeResult::Busy,
            Some(body) => {
                if body_references(&body, old_id) {
                    return PurgeResult::Busy;
                }
            }
        }
    }

    // The vote sweep came back clean: retire the instance. The literal
    // region is freed once the last cached reference drops.
    if let Some(mut slot) = MODULES.get_mut(&module) {
        slot.old = None;
    }
    INSTANCES.remove(&old_id);
    LITERALS.remove(&old_id);
    debug!(target: "loader", "purged {} instance {}", module, old_id);
    PurgeResult::Purged
}

fn body_references(body: &ProcessBody, instance: u32) -> bool {
    if body.ip.instance == instance {
        return true;
    }
    if body.frames.iter().any(|frame| frame.ret.instance == instance) {
        return true;
    }
    if body.catches.iter().any(|c| c.handler.instance == instance) {
        return true;
    }
    body.heap.literal_votes().contains(&instance)
}

pub fn current(module: Atom) -> Option<Arc<ModuleInstance>> {
    MODULES.get(&module)?.current.clone()
}

pub fn old_version(module: Atom) -> Option<Arc<ModuleInstance>> {
    MODULES.get(&module)?.old.clone()
}

/// Resolves a fully-qualified call against the current version.
pub fn resolve(module: Atom, function: Atom, arity: u8) -> Option<(Arc<ModuleInstance>, u32)> {
    let instance = current(module)?;
    let offset = *instance.exports.get(&(function, arity))?;
    Some((instance, offset))
}

pub fn instance(id: u32) -> Option<Arc<ModuleInstance>> {
    INSTANCES.get(&id).map(|entry| entry.value().clone())
}

pub fn literal_region(area: u32) -> Option<Arc<LiteralRegion>> {
    LITERALS.get(&area).map(|entry| entry.value().clone())
}

pub fn loaded_modules() -> Vec<Atom> {
    MODULES
        .iter()
        .filter(|entry| entry.value().current.is_some())
        .map(|entry| *entry.key())
        .collect()
}

/// Structurally copies each staged literal into a fresh immutable arena,
/// rewriting every pointer to carry the literal region and area id.
fn seal_literals(
    staging: &ProcessHeap,
    roots: &[OpaqueTerm],
    area: u32,
) -> (LiteralRegion, Vec<OpaqueTerm>) {
    let mut words: Vec<u64> = Vec::new();
    let mut off_heap = hashbrown::HashMap::new();
    let sealed = roots
        .iter()
        .map(|root| seal_term(staging, *root, area, &mut words, &mut off_heap))
        .collect();
    (LiteralRegion { words, off_heap }, sealed)
}

fn seal_term(
    src: &ProcessHeap,
    term: OpaqueTerm,
    area: u32,
    words: &mut Vec<u64>,
    off_heap: &mut hashbrown::HashMap<u64, OffHeap>,
) -> OpaqueTerm {
    if !term.is_ptr() {
        return term;
    }
    match term.tag() {
        Tag::Cons => {
            // Iterative over the spine; recursion depth tracks nesting only
            let mut heads = Vec::new();
            let mut cursor = term;
            while cursor.is_cons() {
                heads.push(seal_term(src, src.cons_head(cursor), area, words, off_heap));
                cursor = src.cons_tail(cursor);
            }
            let mut tail = seal_term(src, cursor, area, words, off_heap);
            for head in heads.into_iter().rev() {
                let offset = words.len();
                words.push(head.raw());
                words.push(tail.raw());
                tail = OpaqueTerm::make_literal_ptr(Tag::Cons, area, offset);
            }
            tail
        }
        Tag::Boxed => {
            let header = src.header(term);
            let total = crate::heap::header_words(header);
            match header.header_kind() {
                BoxKind::Tuple | BoxKind::SmallMap | BoxKind::MapNode | BoxKind::LargeMap => {
                    // Container: seal children first, then emit the box
                    let children: Vec<OpaqueTerm> = (1..total)
                        .map(|i| {
                            let child = OpaqueTerm::from_raw(src.word(term, i));
                            seal_term(src, child, area, words, off_heap)
                        })
                        .collect();
                    let offset = words.len();
                    words.push(header.raw());
                    for child in children {
                        words.push(child.raw());
                    }
                    OpaqueTerm::make_literal_ptr(Tag::Boxed, area, offset)
                }
                BoxKind::Closure => {
                    let env: Vec<OpaqueTerm> = (3..total)
                        .map(|i| {
                            let child = OpaqueTerm::from_raw(src.word(term, i));
                            seal_term(src, child, area, words, off_heap)
                        })
                        .collect();
                    let offset = words.len();
                    words.push(header.raw());
                    words.push(src.word(term, 1));
                    words.push(src.word(term, 2));
                    for child in env {
                        words.push(child.raw());
                    }
                    OpaqueTerm::make_literal_ptr(Tag::Boxed, area, offset)
                }
                BoxKind::Big | BoxKind::RefcBinary | BoxKind::SubBinary => {
                    // Raw payload plus a shared off-heap reference
                    let ptr = src.word(term, 1);
                    if let Some(entry) = src.off_heap.get(&ptr) {
                        off_heap.insert(ptr, entry.clone());
                    }
                    let offset = words.len();
                    for i in 0..total {
                        words.push(src.word(term, i));
                    }
                    OpaqueTerm::make_literal_ptr(Tag::Boxed, area, offset)
                }
                BoxKind::Float | BoxKind::HeapBinary | BoxKind::ExternalRef => {
                    let offset = words.len();
                    for i in 0..total {
                        words.push(src.word(term, i));
                    }
                    OpaqueTerm::make_literal_ptr(Tag::Boxed, area, offset)
                }
            }
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_bytecode::ModuleBuilder;

    fn unique_name(prefix: &str) -> String {
        use std::sync::atomic::AtomicUsize;
        static N: AtomicUsize = AtomicUsize::new(0);
        format!("{}_{}", prefix, N.fetch_add(1, Ordering::Relaxed))
    }

    fn simple_image(module: &str, ret: i64) -> Image {
        let mut m = ModuleBuilder::new(module);
        m.begin_function("f", 0, 1, true);
        m.push(Opcode::LoadInt { dst: 0, value: ret });
        m.push(Opcode::Ret { src: 0 });
        m.build().unwrap()
    }

    #[test]
    fn load_publishes_current_and_resolves_exports() {
        let name = unique_name("mod_a");
        let instance = load(simple_image(&name, 1)).unwrap();
        let module = Atom::intern(&name).unwrap();
        assert_eq!(instance.name, module);

        let f = Atom::intern("f").unwrap();
        let (resolved, offset) = resolve(module, f, 0).unwrap();
        assert_eq!(resolved.id, instance.id);
        assert_eq!(offset, 0);
        assert!(resolve(module, f, 1).is_none());
    }

    #[test]
    fn reload_moves_current_to_old_and_third_load_fails() {
        let name = unique_name("mod_b");
        let v1 = load(simple_image(&name, 1)).unwrap();
        let v2 = load(simple_image(&name, 2)).unwrap();
        let module = Atom::intern(&name).unwrap();

        assert_eq!(current(module).unwrap().id, v2.id);
        assert_eq!(old_version(module).unwrap().id, v1.id);

        match load(simple_image(&name, 3)) {
            Err(LoadError::OldCodeExists(m)) => assert_eq!(m, module),
            other => panic!("expected OldCodeExists, got {:?}", other.map(|i| i.id)),
        }
    }

    #[test]
    fn purge_without_references_succeeds() {
        let name = unique_name("mod_c");
        load(simple_image(&name, 1)).unwrap();
        let v1_id = {
            let module = Atom::intern(&name).unwrap();
            current(module).unwrap().id
        };
        load(simple_image(&name, 2)).unwrap();
        let module = Atom::intern(&name).unwrap();

        // Other tests may hold a process body for a moment, which the sweep
        // conservatively reports as Busy; retry briefly
        let mut outcome = purge(module, None);
        for _ in 0..100 {
            if outcome != PurgeResult::Busy {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
            outcome = purge(module, None);
        }
        assert_eq!(outcome, PurgeResult::Purged);
        assert!(old_version(module).is_none());
        assert!(instance(v1_id).is_none());
        assert!(literal_region(v1_id).is_none());
        // A second purge has nothing to do
        assert_eq!(purge(module, None), PurgeResult::NoOldCode);
    }

    #[test]
    fn literals_seal_into_region() {
        let mut m = ModuleBuilder::new(&unique_name("mod_lit"));
        // Literal: {ok, [1, 2.5, <<"abc">>]}
        let blob = {
            let mut staging = ProcessHeap::fragment();
            let f = staging.float(2.5).unwrap();
            let b = staging.binary(b"abc").unwrap();
            let list = staging
                .list_from_slice(&[OpaqueTerm::make_small(1), f, b], OpaqueTerm::NIL)
                .unwrap();
            let t = staging
                .tuple(&[OpaqueTerm::make_atom(crate::term::atoms::OK), list])
                .unwrap();
            etf::encode(&staging, t).unwrap()
        };
        let lit = m.literal(blob);
        m.begin_function("lit", 0, 1, true);
        m.push(Opcode::LoadLiteral { dst: 0, literal: lit });
        m.push(Opcode::Ret { src: 0 });

        let instance = load(m.build().unwrap()).unwrap();
        let root = instance.literals[0];
        assert!(root.is_literal());
        assert_eq!(root.literal_area(), instance.id);

        // Read the sealed structure through a scratch heap
        let heap = ProcessHeap::fragment();
        assert_eq!(heap.tuple_arity(root), 2);
        let list = heap.tuple_element(root, 1);
        assert!(list.is_literal());
        assert_eq!(heap.cons_head(list), OpaqueTerm::make_small(1));
        let second = heap.cons_head(heap.cons_tail(list));
        assert_eq!(heap.float_value(second), 2.5);
    }
}
