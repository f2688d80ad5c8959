//! The per-process generational copying collector.
//!
//! A collection evacuates live terms out of the from-space arenas into
//! fresh to-space arenas, Cheney-style: roots are forwarded first, then the
//! to-space is scanned word by word, copying everything it references.
//! Forwarding markers overwrite the first word of moved allocations (the
//! header of a box, the head of a cons cell) so sharing and cycles-free
//! structure survive the move.
//!
//! A **minor** collection evacuates only the young generation. Survivors
//! that were already live at the previous collection (below the high-water
//! mark) are tenured into the old generation; evacuation out of a tenured
//! object propagates tenure, preserving the invariant that the old
//! generation never points into the young one.
//!
//! A **major** (full-sweep) collection evacuates both generations into a
//! new old generation, leaving the young arena empty.
//!
//! Off-heap references (bignums, reference-counted binaries) are not moved:
//! the collector records which raw pointers remain reachable and rebuilds
//! the owner table from survivors, dropping the `Arc`s of everything else.
//! Literal pointers are copied verbatim; the literal areas they reference
//! are re-voted so the purge sweep sees an up-to-date set.

use hashbrown::{HashMap, HashSet};
use log::trace;

use crate::heap::{header_words, OffHeap, ProcessHeap};
use crate::term::{BoxKind, OpaqueTerm, Region, Tag};

/// Which collection to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    Minor,
    Full,
}

/// In-flight collection state. Create with [`Collector::begin`], forward
/// every root through [`evacuate`](Collector::evacuate), then call
/// [`finish`](Collector::finish).
pub struct Collector {
    sweep: Sweep,
    src_young: Vec<u64>,
    src_old: Vec<u64>,
    high_water: usize,
    to_young: Vec<u64>,
    to_old: Vec<u64>,
    old_scan_base: usize,
    live_off_heap: HashSet<u64>,
    votes: HashSet<u32>,
    off_heap: HashMap<u64, OffHeap>,
    moved: usize,
}

impl Collector {
    /// Takes the from-space arenas out of `heap` and prepares to-spaces.
    /// `need` is the allocation (in words) that prompted the collection.
    pub fn begin(heap: &mut ProcessHeap, sweep: Sweep, need: usize) -> Self {
        let src_young = core::mem::take(&mut heap.young);
        let young_capacity = src_young.capacity();
        let (src_old, to_old, old_scan_base) = match sweep {
            Sweep::Minor => {
                // The old generation is not collected; tenured objects are
                // appended to it and scanned from where it previously ended.
                let old = core::mem::take(&mut heap.old);
                let base = old.len();
                (Vec::new(), old, base)
            }
            Sweep::Full => {
                let src = core::mem::take(&mut heap.old);
                let capacity = src.capacity().max(src_young.capacity());
                (src, Vec::with_capacity(capacity), 0)
            }
        };
        trace!(
            target: "gc",
            "{:?} sweep: young {} words used, old {} words used, need {}",
            sweep,
            src_young.len(),
            if sweep == Sweep::Minor { old_scan_base } else { src_old.len() },
            need,
        );
        Self {
            sweep,
            src_young,
            src_old,
            high_water: heap.high_water,
            to_young: Vec::with_capacity(young_capacity.max(need)),
            to_old,
            old_scan_base,
            live_off_heap: HashSet::new(),
            votes: HashSet::new(),
            off_heap: core::mem::take(&mut heap.off_heap),
            moved: 0,
        }
    }

    /// Forwards one root slot, copying its target if it has not moved yet.
    pub fn evacuate(&mut self, term: OpaqueTerm) -> OpaqueTerm {
        self.evacuate_to(term, false)
    }

    fn evacuate_to(&mut self, term: OpaqueTerm, force_old: bool) -> OpaqueTerm {
        if !term.is_ptr() {
            return term;
        }
        if term.is_literal() {
            self.votes.insert(term.literal_area());
            return term;
        }
        let region = term.region();
        if self.sweep == Sweep::Minor && region == Region::Old {
            // Old generation survives a minor sweep in place
            return term;
        }
        let offset = term.ptr_offset();
        let first = OpaqueTerm::from_raw(self.src_word(region, offset));
        if first.is_forward() {
            return term.with_target(first.forward_region(), first.forward_offset());
        }

        let tenure = force_old
            || self.sweep == Sweep::Full
            || (region == Region::Young && offset < self.high_water);

        match term.tag() {
            Tag::Cons => {
                let head = self.src_word(region, offset);
                let tail = self.src_word(region, offset + 1);
                let (dst_region, dst_offset) = self.push_words(&[head, tail], tenure);
                self.set_src_word(region, offset, OpaqueTerm::make_forward(dst_region, dst_offset).raw());
                self.moved += 2;
                term.with_target(dst_region, dst_offset)
            }
            Tag::Boxed => {
                let header = OpaqueTerm::from_raw(self.src_word(region, offset));
                let total = header_words(header);
                let mut words = Vec::with_capacity(total);
                for i in 0..total {
                    words.push(self.src_word(region, offset + i));
                }
                self.note_off_heap(header, &words);
                let (dst_region, dst_offset) = self.push_words(&words, tenure);
                self.set_src_word(region, offset, OpaqueTerm::make_forward(dst_region, dst_offset).raw());
                self.moved += total;
                term.with_target(dst_region, dst_offset)
            }
            _ => unreachable!(),
        }
    }

    fn note_off_heap(&mut self, header: OpaqueTerm, words: &[u64]) {
        match header.header_kind() {
            BoxKind::Big | BoxKind::RefcBinary | BoxKind::SubBinary => {
                self.live_off_heap.insert(words[1]);
            }
            BoxKind::Closure => {
                // Closures pin their module version like a literal reference
                self.votes.insert(words[1] as u32);
            }
            _ => {}
        }
    }

    fn src_word(&self, region: Region, offset: usize) -> u64 {
        match region {
            Region::Young => self.src_young[offset],
            Region::Old => self.src_old[offset],
            Region::Literal => unreachable!(),
        }
    }

    fn set_src_word(&mut self, region: Region, offset: usize, value: u64) {
        match region {
            Region::Young => self.src_young[offset] = value,
            Region::Old => self.src_old[offset] = value,
            Region::Literal => unreachable!(),
        }
    }

    fn push_words(&mut self, words: &[u64], tenure: bool) -> (Region, usize) {
        if tenure {
            let offset = self.to_old.len();
            self.to_old.extend_from_slice(words);
            (Region::Old, offset)
        } else {
            let offset = self.to_young.len();
            self.to_young.extend_from_slice(words);
            (Region::Young, offset)
        }
    }

    /// Cheney scan: walk both to-spaces, evacuating everything the copied
    /// objects reference, then install the new arenas into `heap`.
    ///
    /// Returns the number of words moved.
    pub fn finish(mut self, heap: &mut ProcessHeap, need: usize) -> usize {
        let mut young_scan = 0usize;
        let mut old_scan = self.old_scan_base;

        // Both spaces must reach a fixpoint: scanning the young space can
        // tenure objects, and scanning the old space can pull more objects in.
        loop {
            let mut progressed = false;
            while young_scan < self.to_young.len() {
                progressed = true;
                young_scan = self.scan_at(young_scan, false);
            }
            while old_scan < self.to_old.len() {
                progressed = true;
                old_scan = self.scan_at(old_scan, true);
            }
            if !progressed {
                break;
            }
        }

        // Survivor scan done: everything not in the live set is garbage.
        let live = &self.live_off_heap;
        self.off_heap.retain(|ptr, _| live.contains(ptr));

        if self.to_young.len() + need > self.to_young.capacity() {
            // Index pointers survive growth, so reserving here is safe
            let grow = (self.to_young.len() + need).next_power_of_two();
            self.to_young.reserve(grow - self.to_young.len());
        }

        trace!(
            target: "gc",
            "collected: {} words moved, young {}/{} words, old {} words, {} off-heap live",
            self.moved,
            self.to_young.len(),
            self.to_young.capacity(),
            self.to_old.len(),
            self.off_heap.len(),
        );

        heap.young = self.to_young;
        heap.old = self.to_old;
        heap.high_water = heap.young.len();
        heap.off_heap = self.off_heap;
        heap.literal_votes = self.votes;
        heap.clear_literal_cache();
        self.moved
    }

    /// Scans one allocation starting at `offset` in the given to-space,
    /// returning the offset just past it.
    fn scan_at(&mut self, offset: usize, in_old: bool) -> usize {
        let word = OpaqueTerm::from_raw(if in_old {
            self.to_old[offset]
        } else {
            self.to_young[offset]
        });

        if !word.is_header() {
            // A bare cons cell: two term words
            for i in 0..2 {
                let slot = OpaqueTerm::from_raw(self.to_space_word(in_old, offset + i));
                let moved = self.evacuate_to(slot, in_old);
                self.set_to_space_word(in_old, offset + i, moved.raw());
            }
            return offset + 2;
        }

        let total = header_words(word);
        let term_slots: core::ops::Range<usize> = match word.header_kind() {
            BoxKind::Tuple | BoxKind::SmallMap | BoxKind::MapNode => 1..total,
            BoxKind::LargeMap => 1..2,
            BoxKind::Closure => 3..total,
            BoxKind::ExternalRef => 1..2,
            BoxKind::Big
            | BoxKind::Float
            | BoxKind::HeapBinary
            | BoxKind::RefcBinary
            | BoxKind::SubBinary => 0..0,
        };
        for i in term_slots {
            let slot = OpaqueTerm::from_raw(self.to_space_word(in_old, offset + i));
            let moved = self.evacuate_to(slot, in_old);
            self.set_to_space_word(in_old, offset + i, moved.raw());
        }
        offset + total
    }

    fn to_space_word(&self, in_old: bool, offset: usize) -> u64 {
        if in_old {
            self.to_old[offset]
        } else {
            self.to_young[offset]
        }
    }

    fn set_to_space_word(&mut self, in_old: bool, offset: usize, value: u64) {
        if in_old {
            self.to_old[offset] = value;
        } else {
            self.to_young[offset] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::atoms;

    fn small(i: i64) -> OpaqueTerm {
        OpaqueTerm::make_small(i)
    }

    /// Runs a collection with a single root, returning the forwarded root.
    fn collect(heap: &mut ProcessHeap, sweep: Sweep, root: OpaqueTerm) -> OpaqueTerm {
        let mut gc = Collector::begin(heap, sweep, 0);
        let root = gc.evacuate(root);
        gc.finish(heap, 0);
        root
    }

    #[test]
    fn minor_drops_garbage_and_keeps_live_data() {
        let mut heap = ProcessHeap::new(512);
        // Garbage
        for i in 0..50 {
            heap.tuple(&[small(i)]).unwrap();
        }
        let keep = heap
            .tuple(&[small(1), OpaqueTerm::make_atom(atoms::OK)])
            .unwrap();
        let keep = heap.cons(keep, OpaqueTerm::NIL).unwrap();
        let used_before = heap.young_used();

        let root = collect(&mut heap, Sweep::Minor, keep);

        assert!(heap.young_used() + heap.old_used() < used_before);
        let tuple = heap.cons_head(root);
        assert_eq!(heap.tuple_arity(tuple), 2);
        assert_eq!(heap.tuple_element(tuple, 0), small(1));
        assert_eq!(heap.tuple_element(tuple, 1), OpaqueTerm::make_atom(atoms::OK));
    }

    #[test]
    fn sharing_is_preserved() {
        let mut heap = ProcessHeap::new(512);
        let shared = heap.tuple(&[small(7)]).unwrap();
        let root = heap.tuple(&[shared, shared]).unwrap();

        let root = collect(&mut heap, Sweep::Minor, root);
        // 2 words for the shared tuple + 3 for the outer: sharing kept
        assert_eq!(heap.young_used() + heap.old_used(), 5);
        let a = heap.tuple_element(root, 0);
        let b = heap.tuple_element(root, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn survivors_promote_on_second_minor() {
        let mut heap = ProcessHeap::new(512);
        let keep = heap.tuple(&[small(3)]).unwrap();

        // First minor: survivor stays young, high-water mark set above it
        let keep = collect(&mut heap, Sweep::Minor, keep);
        assert_eq!(keep.region(), Region::Young);
        assert_eq!(heap.old_used(), 0);

        // Second minor: mature survivor tenures to the old generation
        let keep = collect(&mut heap, Sweep::Minor, keep);
        assert_eq!(keep.region(), Region::Old);
        assert!(heap.old_used() > 0);
        assert_eq!(heap.tuple_element(keep, 0), small(3));

        // No young pointers reachable from the old generation
        let elem = heap.tuple_element(keep, 0);
        assert!(!elem.is_ptr());
    }

    #[test]
    fn full_sweep_compacts_everything_into_old() {
        let mut heap = ProcessHeap::new(512);
        let t = heap.tuple(&[small(1), small(2)]).unwrap();
        let keep = collect(&mut heap, Sweep::Minor, t);
        let keep = collect(&mut heap, Sweep::Minor, keep);
        assert!(heap.old_used() > 0);

        let keep = collect(&mut heap, Sweep::Full, keep);
        assert_eq!(keep.region(), Region::Old);
        assert_eq!(heap.young_used(), 0);
        assert_eq!(heap.old_used(), 3);
        assert_eq!(heap.tuple_element(keep, 1), small(2));
    }

    #[test]
    fn dead_off_heap_references_are_released() {
        let mut heap = ProcessHeap::new(512);
        let payload = vec![1u8; 100];
        let dead = heap.binary(&payload).unwrap();
        let live = heap.binary(&payload).unwrap();
        assert_eq!(heap.off_heap.len(), 2);
        let _ = dead;

        let live = collect(&mut heap, Sweep::Minor, live);
        assert_eq!(heap.off_heap.len(), 1);
        heap.with_binary_bytes(live, |b| assert_eq!(b, &payload[..]));
    }

    #[test]
    fn tenure_propagates_to_referenced_objects() {
        let mut heap = ProcessHeap::new(512);
        let mature = heap.tuple(&[small(1)]).unwrap();
        // Age the outer tuple across one minor so it is below the mark
        let mature = collect(&mut heap, Sweep::Minor, mature);

        // Fresh young object referenced by the mature one
        let fresh = heap.tuple(&[small(2)]).unwrap();
        heap.write_word(mature, 1, fresh.raw());

        let root = collect(&mut heap, Sweep::Minor, mature);
        assert_eq!(root.region(), Region::Old);
        let inner = heap.tuple_element(root, 0);
        // The old generation may not point into the young one
        assert_eq!(inner.region(), Region::Old);
        assert_eq!(heap.tuple_element(inner, 0), small(2));
    }
}
