//! Per-process heaps and heap fragments.
//!
//! A heap is a pair of word arenas: the young generation, where all new
//! allocation happens by bumping a frontier, and the old generation, written
//! only by the collector. Pointers encode `(region, word offset)` so arena
//! storage can move (or grow) without invalidating terms, and so a term can
//! never address another process's heap.
//!
//! Heap fragments reuse the same structure with a growable young arena and
//! no old generation; they carry message payloads between processes and hold
//! literal tables while a module loads.
//!
//! The off-heap table maps raw `Arc` pointers embedded in boxes (big
//! integers, reference-counted binaries) to their owning `Arc`, so dropping
//! an entry releases one reference. The collector rebuilds the table from
//! survivors after every sweep.

use core::cell::RefCell;
use core::cmp::Ordering;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::term::{BinaryData, BoxKind, OpaqueTerm, Region, Tag, TermType};

/// Default young-generation size for a fresh process, in words.
pub const DEFAULT_HEAP_WORDS: usize = 256;
/// Binaries at or above this many bytes are allocated off-heap.
pub const HEAP_BINARY_LIMIT: usize = 64;
/// Flat maps grow to this many entries before promotion to a trie.
pub const SMALL_MAP_LIMIT: usize = 32;

/// Allocation failed; the caller should collect (with at least `need`
/// words of headroom) and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("heap exhausted, need {need} words")]
pub struct HeapFull {
    pub need: usize,
}

/// A reference-counted allocation shared between heaps.
#[derive(Debug, Clone)]
pub enum OffHeap {
    Binary(Arc<BinaryData>),
    Big(Arc<BigInt>),
}

impl OffHeap {
    pub fn key(&self) -> u64 {
        match self {
            OffHeap::Binary(b) => Arc::as_ptr(b) as u64,
            OffHeap::Big(b) => Arc::as_ptr(b) as u64,
        }
    }
}

/// An immutable arena owned by a module version: the sealed form of a heap
/// fragment, addressed by literal pointers carrying its area id.
#[derive(Debug)]
pub struct LiteralRegion {
    pub words: Vec<u64>,
    pub off_heap: HashMap<u64, OffHeap>,
}

/// A numeric view of a term, used by arithmetic and comparison.
#[derive(Debug, Clone)]
pub enum Number {
    Int(i64),
    Big(BigInt),
    Float(f64),
}

#[derive(Debug)]
pub struct ProcessHeap {
    pub(crate) young: Vec<u64>,
    pub(crate) old: Vec<u64>,
    /// Young offset below which survivors are mature (promotion candidates)
    pub(crate) high_water: usize,
    /// Fragments grow instead of failing allocation
    growable: bool,
    pub(crate) off_heap: HashMap<u64, OffHeap>,
    /// Literal areas referenced since the last collection; the purge sweep
    /// reads these as this process's votes.
    pub(crate) literal_votes: HashSet<u32>,
    literal_cache: RefCell<HashMap<u32, Arc<LiteralRegion>>>,
}

impl ProcessHeap {
    pub fn new(words: usize) -> Self {
        Self {
            young: Vec::with_capacity(words.max(16)),
            old: Vec::new(),
            high_water: 0,
            growable: false,
            off_heap: HashMap::new(),
            literal_votes: HashSet::new(),
            literal_cache: RefCell::new(HashMap::new()),
        }
    }

    /// A growable fragment heap, used for message payloads and literal
    /// construction.
    pub fn fragment() -> Self {
        let mut heap = Self::new(16);
        heap.growable = true;
        heap
    }

    pub fn young_used(&self) -> usize {
        self.young.len()
    }

    pub fn young_capacity(&self) -> usize {
        self.young.capacity()
    }

    pub fn old_used(&self) -> usize {
        self.old.len()
    }

    pub fn available(&self) -> usize {
        self.young.capacity() - self.young.len()
    }

    pub fn total_words(&self) -> usize {
        self.young.capacity() + self.old.capacity()
    }

    pub fn literal_votes(&self) -> &HashSet<u32> {
        &self.literal_votes
    }

    /// Records that this heap may reference the given literal area.
    pub fn vote_literal(&mut self, area: u32) {
        self.literal_votes.insert(area);
    }

    pub fn add_off_heap(&mut self, entry: OffHeap) {
        self.off_heap.entry(entry.key()).or_insert(entry);
    }

    /// Bump-allocates `n` zeroed words in the young generation, returning
    /// their offset.
    pub(crate) fn alloc_words(&mut self, n: usize) -> Result<usize, HeapFull> {
        self.alloc(n)
    }

    fn alloc(&mut self, n: usize) -> Result<usize, HeapFull> {
        if self.young.len() + n > self.young.capacity() {
            if self.growable {
                self.young.reserve(n);
            } else {
                return Err(HeapFull { need: n });
            }
        }
        let offset = self.young.len();
        self.young.resize(offset + n, 0);
        Ok(offset)
    }

    // -- constructors ------------------------------------------------------

    pub fn cons(&mut self, head: OpaqueTerm, tail: OpaqueTerm) -> Result<OpaqueTerm, HeapFull> {
        let offset = self.alloc(2)?;
        self.young[offset] = head.raw();
        self.young[offset + 1] = tail.raw();
        Ok(OpaqueTerm::make_ptr(Tag::Cons, Region::Young, offset))
    }

    /// Builds a proper list of `elems` ending in `tail`.
    pub fn list_from_slice(
        &mut self,
        elems: &[OpaqueTerm],
        tail: OpaqueTerm,
    ) -> Result<OpaqueTerm, HeapFull> {
        let mut acc = tail;
        for elem in elems.iter().rev() {
            acc = self.cons(*elem, acc)?;
        }
        Ok(acc)
    }

    pub fn tuple(&mut self, elems: &[OpaqueTerm]) -> Result<OpaqueTerm, HeapFull> {
        let offset = self.alloc(1 + elems.len())?;
        self.young[offset] = OpaqueTerm::make_header(BoxKind::Tuple, elems.len()).raw();
        for (i, elem) in elems.iter().enumerate() {
            self.young[offset + 1 + i] = elem.raw();
        }
        Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
    }

    pub fn float(&mut self, value: f64) -> Result<OpaqueTerm, HeapFull> {
        let offset = self.alloc(2)?;
        self.young[offset] = OpaqueTerm::make_header(BoxKind::Float, 0).raw();
        self.young[offset + 1] = value.to_bits();
        Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
    }

    /// An integer, as a small if it fits and a bignum box otherwise.
    pub fn integer(&mut self, value: i64) -> Result<OpaqueTerm, HeapFull> {
        match OpaqueTerm::try_small(value) {
            Some(term) => Ok(term),
            None => self.big(BigInt::from(value)),
        }
    }

    /// A bignum, normalized back to a small when it fits.
    pub fn big(&mut self, value: BigInt) -> Result<OpaqueTerm, HeapFull> {
        if let Some(small) = value.to_i64().and_then(OpaqueTerm::try_small) {
            return Ok(small);
        }
        let arc = Arc::new(value);
        let ptr = Arc::as_ptr(&arc) as u64;
        let offset = self.alloc(2)?;
        self.young[offset] = OpaqueTerm::make_header(BoxKind::Big, 0).raw();
        self.young[offset + 1] = ptr;
        self.add_off_heap(OffHeap::Big(arc));
        Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
    }

    pub fn number(&mut self, value: Number) -> Result<OpaqueTerm, HeapFull> {
        match value {
            Number::Int(i) => self.integer(i),
            Number::Big(b) => self.big(b),
            Number::Float(f) => self.float(f),
        }
    }

    /// A binary from raw bytes: inline below [`HEAP_BINARY_LIMIT`],
    /// otherwise reference-counted off-heap.
    pub fn binary(&mut self, bytes: &[u8]) -> Result<OpaqueTerm, HeapFull> {
        if bytes.len() < HEAP_BINARY_LIMIT {
            let words = bytes.len().div_ceil(8);
            let offset = self.alloc(1 + words)?;
            self.young[offset] = OpaqueTerm::make_header(BoxKind::HeapBinary, bytes.len()).raw();
            unsafe {
                let dst = self.young.as_mut_ptr().add(offset + 1) as *mut u8;
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            }
            Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
        } else {
            let data = Arc::new(BinaryData::from_bytes(bytes));
            let len = bytes.len();
            self.refc_binary(data, 0, len)
        }
    }

    pub fn refc_binary(
        &mut self,
        data: Arc<BinaryData>,
        byte_offset: usize,
        byte_len: usize,
    ) -> Result<OpaqueTerm, HeapFull> {
        debug_assert!(byte_offset + byte_len <= data.len());
        let ptr = Arc::as_ptr(&data) as u64;
        let offset = self.alloc(4)?;
        self.young[offset] = OpaqueTerm::make_header(BoxKind::RefcBinary, 0).raw();
        self.young[offset + 1] = ptr;
        self.young[offset + 2] = byte_offset as u64;
        self.young[offset + 3] = byte_len as u64;
        self.add_off_heap(OffHeap::Binary(data));
        Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
    }

    /// A window over an existing binary. Windows over inline heap binaries
    /// copy the covered bytes; windows over off-heap binaries share the
    /// parent's data, keeping it reachable.
    pub fn sub_binary(
        &mut self,
        parent: OpaqueTerm,
        byte_offset: usize,
        byte_len: usize,
    ) -> Result<OpaqueTerm, HeapFull> {
        match self.box_kind(parent) {
            Some(BoxKind::HeapBinary) => {
                let bytes = self.with_binary_bytes(parent, |b| b[byte_offset..byte_offset + byte_len].to_vec());
                self.binary(&bytes)
            }
            Some(BoxKind::RefcBinary) | Some(BoxKind::SubBinary) => {
                let base_ptr = self.word(parent, 1);
                let base_offset = self.word(parent, 2) as usize;
                let arc = self.off_heap_binary(parent);
                let offset = self.alloc(4)?;
                self.young[offset] = OpaqueTerm::make_header(BoxKind::SubBinary, 0).raw();
                self.young[offset + 1] = base_ptr;
                self.young[offset + 2] = (base_offset + byte_offset) as u64;
                self.young[offset + 3] = byte_len as u64;
                self.add_off_heap(OffHeap::Binary(arc));
                Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
            }
            _ => panic!("sub_binary of a non-binary term"),
        }
    }

    pub fn closure(
        &mut self,
        instance: u32,
        fun: u32,
        arity: u8,
        env: &[OpaqueTerm],
    ) -> Result<OpaqueTerm, HeapFull> {
        let offset = self.alloc(3 + env.len())?;
        self.young[offset] = OpaqueTerm::make_header(BoxKind::Closure, env.len()).raw();
        self.young[offset + 1] = instance as u64;
        self.young[offset + 2] = ((arity as u64) << 32) | fun as u64;
        for (i, item) in env.iter().enumerate() {
            self.young[offset + 3 + i] = item.raw();
        }
        // Closures pin their module version the same way literals do
        self.vote_literal(instance);
        Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
    }

    pub fn external_ref(&mut self, node: OpaqueTerm, id: u64) -> Result<OpaqueTerm, HeapFull> {
        let offset = self.alloc(3)?;
        self.young[offset] = OpaqueTerm::make_header(BoxKind::ExternalRef, 0).raw();
        self.young[offset + 1] = node.raw();
        self.young[offset + 2] = id;
        Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
    }

    // -- raw access --------------------------------------------------------

    fn arena_word(&self, region: Region, area: u32, offset: usize) -> u64 {
        match region {
            Region::Young => self.young[offset],
            Region::Old => self.old[offset],
            Region::Literal => {
                let mut cache = self.literal_cache.borrow_mut();
                let region = cache.entry(area).or_insert_with(|| {
                    crate::code::literal_region(area).expect("literal area missing")
                });
                region.words[offset]
            }
        }
    }

    /// Reads the word at `ptr + index`.
    pub fn word(&self, ptr: OpaqueTerm, index: usize) -> u64 {
        debug_assert!(ptr.is_ptr());
        let area = if ptr.is_literal() { ptr.literal_area() } else { 0 };
        self.arena_word(ptr.region(), area, ptr.ptr_offset() + index)
    }

    pub(crate) fn write_word(&mut self, ptr: OpaqueTerm, index: usize, value: u64) {
        debug_assert!(ptr.is_ptr() && !ptr.is_literal());
        let offset = ptr.ptr_offset() + index;
        match ptr.region() {
            Region::Young => self.young[offset] = value,
            Region::Old => self.old[offset] = value,
            Region::Literal => unreachable!("literal areas are immutable"),
        }
    }

    /// Drops cached literal regions; called after GC so purged areas are
    /// not kept alive by stale cache entries.
    pub fn clear_literal_cache(&self) {
        self.literal_cache.borrow_mut().clear();
    }

    pub fn header(&self, boxed: OpaqueTerm) -> OpaqueTerm {
        debug_assert!(boxed.is_boxed());
        OpaqueTerm::from_raw(self.word(boxed, 0))
    }

    pub fn box_kind(&self, term: OpaqueTerm) -> Option<BoxKind> {
        if term.is_boxed() {
            Some(self.header(term).header_kind())
        } else {
            None
        }
    }

    /// Total size in words of the boxed allocation at `boxed`, header
    /// included.
    pub fn box_words(&self, boxed: OpaqueTerm) -> usize {
        let header = self.header(boxed);
        header_words(header)
    }

    // -- typed readers -----------------------------------------------------

    pub fn term_type(&self, term: OpaqueTerm) -> TermType {
        match term.tag() {
            Tag::Small => TermType::Number,
            Tag::Atom => TermType::Atom,
            Tag::Pid => TermType::Pid,
            Tag::Ref => TermType::Reference,
            Tag::Cons => TermType::List,
            Tag::Special => TermType::Nil,
            Tag::Header => unreachable!("header word escaped to a register"),
            Tag::Boxed => match self.header(term).header_kind() {
                BoxKind::Tuple => TermType::Tuple,
                BoxKind::Big | BoxKind::Float => TermType::Number,
                BoxKind::HeapBinary | BoxKind::RefcBinary | BoxKind::SubBinary => TermType::Binary,
                BoxKind::SmallMap | BoxKind::LargeMap | BoxKind::MapNode => TermType::Map,
                BoxKind::Closure => TermType::Closure,
                BoxKind::ExternalRef => TermType::Reference,
            },
        }
    }

    pub fn is_integer(&self, t: OpaqueTerm) -> bool {
        t.is_small() || self.box_kind(t) == Some(BoxKind::Big)
    }

    pub fn is_float(&self, t: OpaqueTerm) -> bool {
        self.box_kind(t) == Some(BoxKind::Float)
    }

    pub fn is_number(&self, t: OpaqueTerm) -> bool {
        self.is_integer(t) || self.is_float(t)
    }

    pub fn is_binary(&self, t: OpaqueTerm) -> bool {
        matches!(
            self.box_kind(t),
            Some(BoxKind::HeapBinary | BoxKind::RefcBinary | BoxKind::SubBinary)
        )
    }

    pub fn is_tuple(&self, t: OpaqueTerm) -> bool {
        self.box_kind(t) == Some(BoxKind::Tuple)
    }

    pub fn is_map(&self, t: OpaqueTerm) -> bool {
        matches!(self.box_kind(t), Some(BoxKind::SmallMap | BoxKind::LargeMap))
    }

    pub fn is_closure(&self, t: OpaqueTerm) -> bool {
        self.box_kind(t) == Some(BoxKind::Closure)
    }

    pub fn is_list(&self, t: OpaqueTerm) -> bool {
        t.is_nil() || t.is_cons()
    }

    pub fn cons_head(&self, cons: OpaqueTerm) -> OpaqueTerm {
        debug_assert!(cons.is_cons());
        OpaqueTerm::from_raw(self.word(cons, 0))
    }

    pub fn cons_tail(&self, cons: OpaqueTerm) -> OpaqueTerm {
        debug_assert!(cons.is_cons());
        OpaqueTerm::from_raw(self.word(cons, 1))
    }

    pub fn tuple_arity(&self, tuple: OpaqueTerm) -> usize {
        self.header(tuple).header_size()
    }

    pub fn tuple_element(&self, tuple: OpaqueTerm, index: usize) -> OpaqueTerm {
        debug_assert!(index < self.tuple_arity(tuple));
        OpaqueTerm::from_raw(self.word(tuple, 1 + index))
    }

    pub fn float_value(&self, boxed: OpaqueTerm) -> f64 {
        debug_assert_eq!(self.box_kind(boxed), Some(BoxKind::Float));
        f64::from_bits(self.word(boxed, 1))
    }

    pub fn big_value(&self, boxed: OpaqueTerm) -> BigInt {
        debug_assert_eq!(self.box_kind(boxed), Some(BoxKind::Big));
        let ptr = self.word(boxed, 1) as *const BigInt;
        // The off-heap table (or the literal region) holds the Arc that
        // keeps this allocation alive for at least as long as the box.
        unsafe { (*ptr).clone() }
    }

    pub fn number_value(&self, term: OpaqueTerm) -> Option<Number> {
        if term.is_small() {
            return Some(Number::Int(term.small_value()));
        }
        match self.box_kind(term) {
            Some(BoxKind::Big) => Some(Number::Big(self.big_value(term))),
            Some(BoxKind::Float) => Some(Number::Float(self.float_value(term))),
            _ => None,
        }
    }

    pub fn binary_size(&self, term: OpaqueTerm) -> usize {
        match self.box_kind(term) {
            Some(BoxKind::HeapBinary) => self.header(term).header_size(),
            Some(BoxKind::RefcBinary) | Some(BoxKind::SubBinary) => self.word(term, 3) as usize,
            _ => panic!("binary_size of a non-binary term"),
        }
    }

    pub fn with_binary_bytes<R>(&self, term: OpaqueTerm, f: impl FnOnce(&[u8]) -> R) -> R {
        match self.box_kind(term) {
            Some(BoxKind::HeapBinary) => {
                let len = self.header(term).header_size();
                let offset = term.ptr_offset() + 1;
                let area = if term.is_literal() { term.literal_area() } else { 0 };
                match term.region() {
                    Region::Young => {
                        let bytes = unsafe {
                            core::slice::from_raw_parts(
                                self.young.as_ptr().add(offset) as *const u8,
                                len,
                            )
                        };
                        f(bytes)
                    }
                    Region::Old => {
                        let bytes = unsafe {
                            core::slice::from_raw_parts(
                                self.old.as_ptr().add(offset) as *const u8,
                                len,
                            )
                        };
                        f(bytes)
                    }
                    Region::Literal => {
                        let region = crate::code::literal_region(area).expect("literal area missing");
                        let bytes = unsafe {
                            core::slice::from_raw_parts(
                                region.words.as_ptr().add(offset) as *const u8,
                                len,
                            )
                        };
                        f(bytes)
                    }
                }
            }
            Some(BoxKind::RefcBinary) | Some(BoxKind::SubBinary) => {
                let ptr = self.word(term, 1) as *const BinaryData;
                let offset = self.word(term, 2) as usize;
                let len = self.word(term, 3) as usize;
                let data = unsafe { &*ptr };
                f(&data.as_bytes()[offset..offset + len])
            }
            _ => panic!("with_binary_bytes of a non-binary term"),
        }
    }

    pub fn binary_to_vec(&self, term: OpaqueTerm) -> Vec<u8> {
        self.with_binary_bytes(term, |b| b.to_vec())
    }

    /// The `Arc` backing an off-heap binary box.
    pub fn off_heap_binary(&self, term: OpaqueTerm) -> Arc<BinaryData> {
        let ptr = self.word(term, 1);
        match self.off_heap.get(&ptr) {
            Some(OffHeap::Binary(arc)) => arc.clone(),
            _ => {
                // Literal-area binaries are owned by the region, not the heap
                let area = term.literal_area();
                let region = crate::code::literal_region(area).expect("literal area missing");
                match region.off_heap.get(&ptr) {
                    Some(OffHeap::Binary(arc)) => arc.clone(),
                    _ => panic!("off-heap binary has no owner"),
                }
            }
        }
    }

    /// `(instance, fun index, arity, env_len)` of a closure box.
    pub fn closure_parts(&self, term: OpaqueTerm) -> (u32, u32, u8, usize) {
        debug_assert_eq!(self.box_kind(term), Some(BoxKind::Closure));
        let env_len = self.header(term).header_size();
        let instance = self.word(term, 1) as u32;
        let packed = self.word(term, 2);
        ((instance), (packed & u32::MAX as u64) as u32, (packed >> 32) as u8, env_len)
    }

    pub fn closure_env(&self, term: OpaqueTerm, index: usize) -> OpaqueTerm {
        debug_assert!(index < self.header(term).header_size());
        OpaqueTerm::from_raw(self.word(term, 3 + index))
    }

    // -- equality, ordering, hashing --------------------------------------

    /// Structural equality with exact number semantics (`=:=`).
    pub fn exact_eq(&self, a: OpaqueTerm, b: OpaqueTerm) -> bool {
        self.compare(a, b, true) == Ordering::Equal
    }

    /// Structural equality with numeric coercion (`==`).
    pub fn eq(&self, a: OpaqueTerm, b: OpaqueTerm) -> bool {
        self.compare(a, b, false) == Ordering::Equal
    }

    /// The language-level total order. With `exact`, integers and floats of
    /// equal value stay distinct (floats sort after the integer).
    pub fn compare(&self, a: OpaqueTerm, b: OpaqueTerm, exact: bool) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let (ta, tb) = (self.term_type(a), self.term_type(b));
        if ta != tb {
            return ta.cmp(&tb);
        }
        match ta {
            TermType::Number => {
                let na = self.number_value(a).expect("number");
                let nb = self.number_value(b).expect("number");
                match compare_numbers(&na, &nb) {
                    Ordering::Equal if exact => {
                        // int < float among equal values in the exact order
                        let fa = matches!(na, Number::Float(_));
                        let fb = matches!(nb, Number::Float(_));
                        fa.cmp(&fb)
                    }
                    ordering => ordering,
                }
            }
            TermType::Atom => {
                let (a, b) = (a.atom_value(), b.atom_value());
                a.name().cmp(b.name())
            }
            TermType::Pid => {
                let (a, b) = (a.pid_value(), b.pid_value());
                a.cmp(&b)
            }
            TermType::Reference => self.compare_refs(a, b),
            TermType::Nil => Ordering::Equal,
            TermType::Closure => {
                let pa = self.closure_parts(a);
                let pb = self.closure_parts(b);
                pa.cmp(&pb).then_with(|| {
                    for i in 0..pa.3.min(pb.3) {
                        let ord =
                            self.compare(self.closure_env(a, i), self.closure_env(b, i), exact);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                })
            }
            TermType::Tuple => {
                let (la, lb) = (self.tuple_arity(a), self.tuple_arity(b));
                if la != lb {
                    return la.cmp(&lb);
                }
                for i in 0..la {
                    let ord =
                        self.compare(self.tuple_element(a, i), self.tuple_element(b, i), exact);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }
            TermType::Map => self.compare_maps(a, b, exact),
            TermType::List => {
                let (mut xa, mut xb) = (a, b);
                loop {
                    match (xa.is_cons(), xb.is_cons()) {
                        (true, true) => {
                            let ord = self.compare(
                                self.cons_head(xa),
                                self.cons_head(xb),
                                exact,
                            );
                            if ord != Ordering::Equal {
                                return ord;
                            }
                            xa = self.cons_tail(xa);
                            xb = self.cons_tail(xb);
                        }
                        // An improper or shorter tail falls back to direct
                        // term comparison (nil < anything non-nil of the
                        // same position class)
                        _ => return self.compare(xa, xb, exact),
                    }
                }
            }
            TermType::Binary => {
                self.with_binary_bytes(a, |ba| self.with_binary_bytes(b, |bb| ba.cmp(bb)))
            }
        }
    }

    fn compare_refs(&self, a: OpaqueTerm, b: OpaqueTerm) -> Ordering {
        let key = |t: OpaqueTerm| -> (u64, u64) {
            if t.is_local_ref() {
                (0, t.ref_value())
            } else {
                (self.word(t, 1), self.word(t, 2))
            }
        };
        key(a).cmp(&key(b))
    }

    fn compare_maps(&self, a: OpaqueTerm, b: OpaqueTerm, exact: bool) -> Ordering {
        // Maps order first by size, then by key/value lists in key order.
        let (sa, sb) = (crate::map::map_size(self, a), crate::map::map_size(self, b));
        if sa != sb {
            return sa.cmp(&sb);
        }
        let mut pa = crate::map::map_pairs(self, a);
        let mut pb = crate::map::map_pairs(self, b);
        let key_cmp = |h: &ProcessHeap, x: &(OpaqueTerm, OpaqueTerm), y: &(OpaqueTerm, OpaqueTerm)| {
            h.compare(x.0, y.0, true)
        };
        pa.sort_by(|x, y| key_cmp(self, x, y));
        pb.sort_by(|x, y| key_cmp(self, x, y));
        for ((ka, va), (kb, vb)) in pa.iter().zip(pb.iter()) {
            let ord = self.compare(*ka, *kb, exact);
            if ord != Ordering::Equal {
                return ord;
            }
            let ord = self.compare(*va, *vb, exact);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Structural hash, stable across collection and across heaps.
    pub fn term_hash(&self, term: OpaqueTerm) -> u64 {
        let mut hash = 0xcbf29ce484222325u64;
        self.hash_into(term, &mut hash);
        hash
    }

    fn hash_into(&self, term: OpaqueTerm, hash: &mut u64) {
        fn mix(hash: &mut u64, value: u64) {
            *hash ^= value;
            *hash = hash.wrapping_mul(0x100000001b3);
        }
        match term.tag() {
            Tag::Small => {
                // Hash numbers by value so 1 and 1.0 collide (== maps)
                mix(hash, 1);
                mix(hash, term.small_value() as u64);
            }
            Tag::Atom => {
                mix(hash, 2);
                mix(hash, term.atom_value().id() as u64);
            }
            Tag::Pid => {
                mix(hash, 3);
                mix(hash, term.raw());
            }
            Tag::Ref => {
                mix(hash, 4);
                mix(hash, term.ref_value());
            }
            Tag::Special => mix(hash, 5),
            Tag::Cons => {
                mix(hash, 6);
                let mut cursor = term;
                while cursor.is_cons() {
                    self.hash_into(self.cons_head(cursor), hash);
                    cursor = self.cons_tail(cursor);
                }
                if !cursor.is_nil() {
                    self.hash_into(cursor, hash);
                }
            }
            Tag::Header => unreachable!(),
            Tag::Boxed => match self.header(term).header_kind() {
                BoxKind::Tuple => {
                    mix(hash, 7);
                    let arity = self.tuple_arity(term);
                    mix(hash, arity as u64);
                    for i in 0..arity {
                        self.hash_into(self.tuple_element(term, i), hash);
                    }
                }
                BoxKind::Float => {
                    let value = self.float_value(term);
                    if value.fract() == 0.0 && value.abs() < (1i64 << 60) as f64 {
                        mix(hash, 1);
                        mix(hash, (value as i64) as u64);
                    } else {
                        mix(hash, 8);
                        mix(hash, value.to_bits());
                    }
                }
                BoxKind::Big => {
                    let value = self.big_value(term);
                    mix(hash, 9);
                    for byte in value.to_signed_bytes_le() {
                        mix(hash, byte as u64);
                    }
                }
                BoxKind::HeapBinary | BoxKind::RefcBinary | BoxKind::SubBinary => {
                    mix(hash, 10);
                    self.with_binary_bytes(term, |bytes| {
                        for b in bytes {
                            mix(hash, *b as u64);
                        }
                    });
                }
                BoxKind::SmallMap | BoxKind::LargeMap => {
                    mix(hash, 11);
                    let mut pairs = crate::map::map_pairs(self, term);
                    let mut hashes: Vec<u64> = pairs
                        .drain(..)
                        .map(|(k, v)| {
                            let mut h = 0xcbf29ce484222325u64;
                            self.hash_into(k, &mut h);
                            self.hash_into(v, &mut h);
                            h
                        })
                        .collect();
                    // Order-independent combination
                    hashes.sort_unstable();
                    for h in hashes {
                        mix(hash, h);
                    }
                }
                BoxKind::MapNode => unreachable!("map node escaped to a register"),
                BoxKind::Closure => {
                    mix(hash, 12);
                    let (instance, fun, arity, env_len) = self.closure_parts(term);
                    mix(hash, instance as u64);
                    mix(hash, fun as u64);
                    mix(hash, arity as u64);
                    for i in 0..env_len {
                        self.hash_into(self.closure_env(term, i), hash);
                    }
                }
                BoxKind::ExternalRef => {
                    mix(hash, 13);
                    mix(hash, self.word(term, 1));
                    mix(hash, self.word(term, 2));
                }
            },
        }
    }

    // -- copying -----------------------------------------------------------

    /// Words needed to copy `term` into another heap (off-heap data is
    /// shared, not counted).
    pub fn term_size(&self, term: OpaqueTerm) -> usize {
        if term.is_immediate() || term.is_literal() {
            return 0;
        }
        match term.tag() {
            Tag::Cons => {
                let mut size = 0;
                let mut cursor = term;
                while cursor.is_cons() && !cursor.is_literal() {
                    size += 2 + self.term_size(self.cons_head(cursor));
                    cursor = self.cons_tail(cursor);
                }
                size + self.term_size(cursor)
            }
            Tag::Boxed => {
                let header = self.header(term);
                let mut size = header_words(header);
                match header.header_kind() {
                    BoxKind::Tuple => {
                        for i in 0..header.header_size() {
                            size += self.term_size(self.tuple_element(term, i));
                        }
                    }
                    BoxKind::SmallMap => {
                        for i in 0..header.header_size() * 2 {
                            size += self.term_size(OpaqueTerm::from_raw(self.word(term, 1 + i)));
                        }
                    }
                    BoxKind::LargeMap => {
                        for (k, v) in crate::map::map_pairs(self, term) {
                            // Conservative: trie is rebuilt as entries on copy
                            size += 2 + self.term_size(k) + self.term_size(v);
                        }
                        size += crate::map::trie_copy_slack(self, term);
                    }
                    BoxKind::Closure => {
                        for i in 0..header.header_size() {
                            size += self.term_size(self.closure_env(term, i));
                        }
                    }
                    _ => {}
                }
                size
            }
            _ => unreachable!(),
        }
    }

    /// Deep-copies `root` (owned by `src`) into this heap. Literal pointers
    /// are retained as-is and voted; off-heap references are shared.
    ///
    /// Fails with `HeapFull` if this heap lacks room, leaving any partially
    /// copied words as garbage for the next collection.
    pub fn copy_from(&mut self, src: &ProcessHeap, root: OpaqueTerm) -> Result<OpaqueTerm, HeapFull> {
        if root.is_immediate() {
            return Ok(root);
        }
        if root.is_literal() {
            self.vote_literal(root.literal_area());
            self.vote_literal_subterms(src, root);
            return Ok(root);
        }
        match root.tag() {
            Tag::Cons => {
                // Walk the spine iteratively so recursion depth is bounded
                // by nesting, not list length
                let mut heads = Vec::new();
                let mut cursor = root;
                while cursor.is_cons() && !cursor.is_literal() {
                    heads.push(self.copy_from(src, src.cons_head(cursor))?);
                    cursor = src.cons_tail(cursor);
                }
                let mut tail = self.copy_from(src, cursor)?;
                for head in heads.into_iter().rev() {
                    tail = self.cons(head, tail)?;
                }
                Ok(tail)
            }
            Tag::Boxed => {
                let header = src.header(root);
                match header.header_kind() {
                    BoxKind::Tuple => {
                        let arity = header.header_size();
                        let mut elems = Vec::with_capacity(arity);
                        for i in 0..arity {
                            elems.push(self.copy_from(src, src.tuple_element(root, i))?);
                        }
                        self.tuple(&elems)
                    }
                    BoxKind::Float => self.float(src.float_value(root)),
                    BoxKind::Big => {
                        let ptr = src.word(root, 1);
                        let arc = match src.off_heap.get(&ptr) {
                            Some(OffHeap::Big(arc)) => arc.clone(),
                            _ => Arc::new(src.big_value(root)),
                        };
                        let offset = self.alloc(2)?;
                        self.young[offset] = OpaqueTerm::make_header(BoxKind::Big, 0).raw();
                        self.young[offset + 1] = Arc::as_ptr(&arc) as u64;
                        self.add_off_heap(OffHeap::Big(arc));
                        Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
                    }
                    BoxKind::HeapBinary => {
                        let bytes = src.with_binary_bytes(root, |bytes| bytes.to_vec());
                        self.binary(&bytes)
                    }
                    BoxKind::RefcBinary | BoxKind::SubBinary => {
                        let arc = src.off_heap_binary(root);
                        let offset = src.word(root, 2) as usize;
                        let len = src.word(root, 3) as usize;
                        self.refc_binary(arc, offset, len)
                    }
                    BoxKind::SmallMap => {
                        let pairs = header.header_size();
                        let mut elems = Vec::with_capacity(pairs * 2);
                        for i in 0..pairs * 2 {
                            let t = OpaqueTerm::from_raw(src.word(root, 1 + i));
                            elems.push(self.copy_from(src, t)?);
                        }
                        crate::map::small_map_from_sorted(self, &elems)
                    }
                    BoxKind::LargeMap => {
                        let mut map = crate::map::empty_map(self)?;
                        for (k, v) in crate::map::map_pairs(src, root) {
                            let k = self.copy_from(src, k)?;
                            let v = self.copy_from(src, v)?;
                            map = crate::map::map_put(self, map, k, v)?;
                        }
                        Ok(map)
                    }
                    BoxKind::MapNode => unreachable!("map node escaped to a register"),
                    BoxKind::Closure => {
                        let (instance, fun, arity, env_len) = src.closure_parts(root);
                        let mut env = Vec::with_capacity(env_len);
                        for i in 0..env_len {
                            env.push(self.copy_from(src, src.closure_env(root, i))?);
                        }
                        self.closure(instance, fun, arity, &env)
                    }
                    BoxKind::ExternalRef => {
                        let node = OpaqueTerm::from_raw(src.word(root, 1));
                        let id = src.word(root, 2);
                        self.external_ref(node, id)
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    /// Votes every literal area reachable from a literal root. Literal
    /// terms can reference other areas only through closure instances, so a
    /// single area vote suffices for plain data; closures vote in their
    /// constructor, so here we only record the root's own area.
    fn vote_literal_subterms(&mut self, _src: &ProcessHeap, root: OpaqueTerm) {
        self.vote_literal(root.literal_area());
    }
}

/// Total word size of a boxed allocation described by `header`.
pub(crate) fn header_words(header: OpaqueTerm) -> usize {
    debug_assert!(header.is_header());
    let size = header.header_size();
    match header.header_kind() {
        BoxKind::Tuple => 1 + size,
        BoxKind::Big => 2,
        BoxKind::Float => 2,
        BoxKind::HeapBinary => 1 + size.div_ceil(8),
        BoxKind::RefcBinary | BoxKind::SubBinary => 4,
        BoxKind::SmallMap => 1 + size * 2,
        BoxKind::LargeMap => 2,
        BoxKind::MapNode => crate::map::node_words(size),
        BoxKind::Closure => 3 + size,
        BoxKind::ExternalRef => 3,
    }
}

pub(crate) fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    use Number::*;
    match (a, b) {
        (Int(x), Int(y)) => x.cmp(y),
        (Big(x), Big(y)) => x.cmp(y),
        (Int(x), Big(y)) => BigInt::from(*x).cmp(y),
        (Big(x), Int(y)) => x.cmp(&BigInt::from(*y)),
        (Float(x), Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Int(x), Float(y)) => compare_int_float(*x, *y),
        (Float(x), Int(y)) => compare_int_float(*y, *x).reverse(),
        (Big(x), Float(y)) => compare_big_float(x, *y),
        (Float(x), Big(y)) => compare_big_float(y, *x).reverse(),
    }
}

fn compare_int_float(int: i64, float: f64) -> Ordering {
    if float.is_nan() {
        return Ordering::Less;
    }
    (int as f64).partial_cmp(&float).unwrap_or(Ordering::Equal)
}

fn compare_big_float(big: &BigInt, float: f64) -> Ordering {
    if float.is_nan() {
        return Ordering::Less;
    }
    match big.to_f64() {
        Some(value) => value.partial_cmp(&float).unwrap_or(Ordering::Equal),
        None => Ordering::Greater,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{atoms, Atom};

    #[test]
    fn list_construction_and_reads() {
        let mut heap = ProcessHeap::new(64);
        let one = OpaqueTerm::make_small(1);
        let two = OpaqueTerm::make_small(2);
        let list = heap.list_from_slice(&[one, two], OpaqueTerm::NIL).unwrap();
        assert!(list.is_cons());
        assert_eq!(heap.cons_head(list), one);
        let tail = heap.cons_tail(list);
        assert_eq!(heap.cons_head(tail), two);
        assert!(heap.cons_tail(tail).is_nil());
    }

    #[test]
    fn tuple_roundtrip() {
        let mut heap = ProcessHeap::new(64);
        let a = OpaqueTerm::make_atom(atoms::OK);
        let b = OpaqueTerm::make_small(17);
        let t = heap.tuple(&[a, b]).unwrap();
        assert_eq!(heap.tuple_arity(t), 2);
        assert_eq!(heap.tuple_element(t, 0), a);
        assert_eq!(heap.tuple_element(t, 1), b);
    }

    #[test]
    fn alloc_failure_reports_need() {
        let mut heap = ProcessHeap::new(16);
        let elems: Vec<_> = (0..32).map(|i| OpaqueTerm::make_small(i)).collect();
        match heap.tuple(&elems) {
            Err(HeapFull { need }) => assert_eq!(need, 33),
            Ok(_) => panic!("expected exhaustion"),
        }
    }

    #[test]
    fn numbers_normalize() {
        let mut heap = ProcessHeap::new(64);
        let small = heap.integer(42).unwrap();
        assert!(small.is_small());
        let big = heap.big(BigInt::from(7)).unwrap();
        assert!(big.is_small());
        let really_big = heap.big(BigInt::from(i64::MAX) * 4).unwrap();
        assert!(really_big.is_boxed());
        assert_eq!(heap.big_value(really_big), BigInt::from(i64::MAX) * 4);
    }

    #[test]
    fn binaries_inline_and_off_heap() {
        let mut heap = ProcessHeap::new(128);
        let small = heap.binary(b"hello").unwrap();
        assert_eq!(heap.binary_size(small), 5);
        heap.with_binary_bytes(small, |b| assert_eq!(b, b"hello"));

        let big_bytes = vec![7u8; 100];
        let big = heap.binary(&big_bytes).unwrap();
        assert_eq!(heap.box_kind(big), Some(BoxKind::RefcBinary));
        assert_eq!(heap.binary_size(big), 100);
        heap.with_binary_bytes(big, |b| assert_eq!(b, &big_bytes[..]));

        let sub = heap.sub_binary(big, 10, 20).unwrap();
        assert_eq!(heap.box_kind(sub), Some(BoxKind::SubBinary));
        assert_eq!(heap.binary_size(sub), 20);
        heap.with_binary_bytes(sub, |b| assert_eq!(b, &big_bytes[10..30]));
    }

    #[test]
    fn ordering_follows_type_ranks() {
        let mut heap = ProcessHeap::new(256);
        let number = OpaqueTerm::make_small(999);
        let atom = OpaqueTerm::make_atom(Atom::intern("zzz").unwrap());
        let tuple = heap.tuple(&[]).unwrap();
        let nil = OpaqueTerm::NIL;
        let list = heap.cons(number, OpaqueTerm::NIL).unwrap();
        let bin = heap.binary(b"x").unwrap();

        let terms = [number, atom, tuple, nil, list, bin];
        for window in terms.windows(2) {
            assert_eq!(
                heap.compare(window[0], window[1], true),
                Ordering::Less,
                "{:?} should sort before {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn numeric_eq_coerces_but_exact_does_not() {
        let mut heap = ProcessHeap::new(64);
        let int = OpaqueTerm::make_small(1);
        let float = heap.float(1.0).unwrap();
        assert!(heap.eq(int, float));
        assert!(!heap.exact_eq(int, float));
        assert_eq!(heap.compare(int, float, true), Ordering::Less);
    }

    #[test]
    fn copy_between_heaps_preserves_structure() {
        let mut src = ProcessHeap::new(256);
        let inner = src.tuple(&[OpaqueTerm::make_small(1), OpaqueTerm::make_small(2)]).unwrap();
        let bin = src.binary(&vec![9u8; 80]).unwrap();
        let root = src
            .list_from_slice(&[inner, bin, OpaqueTerm::make_atom(atoms::OK)], OpaqueTerm::NIL)
            .unwrap();

        let mut dst = ProcessHeap::fragment();
        let copied = dst.copy_from(&src, root).unwrap();
        assert_eq!(dst.compare(copied, copied, true), Ordering::Equal);

        let first = dst.cons_head(copied);
        assert_eq!(dst.tuple_arity(first), 2);
        assert_eq!(dst.tuple_element(first, 1), OpaqueTerm::make_small(2));
        let second = dst.cons_head(dst.cons_tail(copied));
        dst.with_binary_bytes(second, |b| assert_eq!(b.len(), 80));
        // Off-heap data is shared, not duplicated
        assert_eq!(src.off_heap.len(), 1);
        assert_eq!(dst.off_heap.len(), 1);
        assert_eq!(
            src.off_heap.keys().next().unwrap(),
            dst.off_heap.keys().next().unwrap()
        );
    }

    #[test]
    fn hashes_are_structural() {
        let mut a = ProcessHeap::new(128);
        let mut b = ProcessHeap::new(128);
        let ta = a.tuple(&[OpaqueTerm::make_small(5), OpaqueTerm::make_atom(atoms::OK)]).unwrap();
        let tb = b.tuple(&[OpaqueTerm::make_small(5), OpaqueTerm::make_atom(atoms::OK)]).unwrap();
        assert_eq!(a.term_hash(ta), b.term_hash(tb));

        let int_hash = a.term_hash(OpaqueTerm::make_small(3));
        let float = a.float(3.0).unwrap();
        assert_eq!(int_hash, a.term_hash(float));
    }
}
