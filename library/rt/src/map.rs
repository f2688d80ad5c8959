//! Map terms.
//!
//! Small maps are a flat array of key/value pairs sorted by key; once a map
//! grows past [`SMALL_MAP_LIMIT`](crate::heap::SMALL_MAP_LIMIT) entries it is
//! promoted to a 16-ary hash-array-mapped trie whose nodes live on the
//! process heap. Updates path-copy, so existing map terms are never mutated.
//!
//! A trie node packs two 16-bit bitmaps into its header size field: the low
//! half marks slots holding inline key/value entries, the high half marks
//! slots holding child pointers. Hash collisions past the deepest level fall
//! back to a small-map bucket.

use crate::heap::{HeapFull, ProcessHeap, SMALL_MAP_LIMIT};
use crate::term::{BoxKind, OpaqueTerm, Region, Tag};

const BITS_PER_LEVEL: u32 = 4;
const FANOUT: u64 = 1 << BITS_PER_LEVEL;
const LEVEL_MASK: u64 = FANOUT - 1;
const MAX_LEVEL: u32 = 60 / BITS_PER_LEVEL;

fn datamap(packed: usize) -> u16 {
    (packed & 0xffff) as u16
}

fn nodemap(packed: usize) -> u16 {
    ((packed >> 16) & 0xffff) as u16
}

fn pack(datamap: u16, nodemap: u16) -> usize {
    (datamap as usize) | ((nodemap as usize) << 16)
}

/// Total words of a trie node with the given packed bitmaps.
pub(crate) fn node_words(packed: usize) -> usize {
    1 + 2 * datamap(packed).count_ones() as usize + nodemap(packed).count_ones() as usize
}

fn slot_rank(bitmap: u16, index: u32) -> usize {
    (bitmap & ((1u16 << index) - 1)).count_ones() as usize
}

pub fn is_map(heap: &ProcessHeap, term: OpaqueTerm) -> bool {
    matches!(heap.box_kind(term), Some(BoxKind::SmallMap | BoxKind::LargeMap))
}

pub fn map_size(heap: &ProcessHeap, map: OpaqueTerm) -> usize {
    heap.header(map).header_size()
}

/// An empty map (small representation).
pub fn empty_map(heap: &mut ProcessHeap) -> Result<OpaqueTerm, HeapFull> {
    small_map_from_sorted(heap, &[])
}

/// Builds a small map box from interleaved `[k0, v0, k1, v1, …]` already
/// sorted by key.
pub(crate) fn small_map_from_sorted(
    heap: &mut ProcessHeap,
    elems: &[OpaqueTerm],
) -> Result<OpaqueTerm, HeapFull> {
    debug_assert!(elems.len() % 2 == 0);
    let pairs = elems.len() / 2;
    let offset = alloc(heap, 1 + elems.len())?;
    heap.young[offset] = OpaqueTerm::make_header(BoxKind::SmallMap, pairs).raw();
    for (i, elem) in elems.iter().enumerate() {
        heap.young[offset + 1 + i] = elem.raw();
    }
    Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
}

/// Builds a map from arbitrary pairs; later duplicates win.
pub fn map_from_pairs(
    heap: &mut ProcessHeap,
    pairs: &[(OpaqueTerm, OpaqueTerm)],
) -> Result<OpaqueTerm, HeapFull> {
    let mut dedup: Vec<(OpaqueTerm, OpaqueTerm)> = Vec::with_capacity(pairs.len());
    for (k, v) in pairs {
        match dedup.iter_mut().find(|(existing, _)| heap.exact_eq(*existing, *k)) {
            Some(entry) => entry.1 = *v,
            None => dedup.push((*k, *v)),
        }
    }
    if dedup.len() <= SMALL_MAP_LIMIT {
        dedup.sort_by(|a, b| heap.compare(a.0, b.0, true));
        let elems: Vec<OpaqueTerm> = dedup.iter().flat_map(|(k, v)| [*k, *v]).collect();
        small_map_from_sorted(heap, &elems)
    } else {
        let mut map = empty_map(heap)?;
        for (k, v) in dedup {
            map = map_put(heap, map, k, v)?;
        }
        Ok(map)
    }
}

pub fn map_get(heap: &ProcessHeap, map: OpaqueTerm, key: OpaqueTerm) -> Option<OpaqueTerm> {
    match heap.box_kind(map) {
        Some(BoxKind::SmallMap) => {
            let pairs = map_size(heap, map);
            for i in 0..pairs {
                let k = OpaqueTerm::from_raw(heap.word(map, 1 + i * 2));
                if heap.exact_eq(k, key) {
                    return Some(OpaqueTerm::from_raw(heap.word(map, 2 + i * 2)));
                }
            }
            None
        }
        Some(BoxKind::LargeMap) => {
            let root = OpaqueTerm::from_raw(heap.word(map, 1));
            let hash = heap.term_hash(key);
            trie_get(heap, root, 0, hash, key)
        }
        _ => None,
    }
}

fn trie_get(
    heap: &ProcessHeap,
    node: OpaqueTerm,
    level: u32,
    hash: u64,
    key: OpaqueTerm,
) -> Option<OpaqueTerm> {
    // Collision buckets at the deepest level are small maps
    if heap.box_kind(node) == Some(BoxKind::SmallMap) {
        return map_get(heap, node, key);
    }
    let packed = heap.header(node).header_size();
    let index = ((hash >> (level * BITS_PER_LEVEL)) & LEVEL_MASK) as u32;
    let bit = 1u16 << index;
    if datamap(packed) & bit != 0 {
        let rank = slot_rank(datamap(packed), index);
        let k = OpaqueTerm::from_raw(heap.word(node, 1 + rank * 2));
        if heap.exact_eq(k, key) {
            return Some(OpaqueTerm::from_raw(heap.word(node, 2 + rank * 2)));
        }
        return None;
    }
    if nodemap(packed) & bit != 0 {
        let data_slots = 2 * datamap(packed).count_ones() as usize;
        let rank = slot_rank(nodemap(packed), index);
        let child = OpaqueTerm::from_raw(heap.word(node, 1 + data_slots + rank));
        return trie_get(heap, child, level + 1, hash, key);
    }
    None
}

/// Inserts or replaces a key. Returns a new map term; the input map is
/// unchanged.
pub fn map_put(
    heap: &mut ProcessHeap,
    map: OpaqueTerm,
    key: OpaqueTerm,
    value: OpaqueTerm,
) -> Result<OpaqueTerm, HeapFull> {
    match heap.box_kind(map) {
        Some(BoxKind::SmallMap) => {
            let pairs = map_size(heap, map);
            let mut elems: Vec<OpaqueTerm> = Vec::with_capacity((pairs + 1) * 2);
            for i in 0..pairs * 2 {
                elems.push(OpaqueTerm::from_raw(heap.word(map, 1 + i)));
            }
            // Replace in place if present
            for i in (0..elems.len()).step_by(2) {
                if heap.exact_eq(elems[i], key) {
                    elems[i + 1] = value;
                    return small_map_from_sorted(heap, &elems);
                }
            }
            if pairs < SMALL_MAP_LIMIT {
                let at = (0..elems.len())
                    .step_by(2)
                    .find(|&i| heap.compare(key, elems[i], true) == core::cmp::Ordering::Less)
                    .unwrap_or(elems.len());
                elems.insert(at, value);
                elems.insert(at, key);
                small_map_from_sorted(heap, &elems)
            } else {
                // Promote to a trie
                let mut root = small_map_from_sorted(heap, &[])?;
                root = promote_bucket(heap, root)?;
                let mut count = 0usize;
                for i in (0..elems.len()).step_by(2) {
                    let hash = heap.term_hash(elems[i]);
                    let (new_root, added) =
                        trie_put(heap, root, 0, hash, elems[i], elems[i + 1])?;
                    root = new_root;
                    count += added as usize;
                }
                let hash = heap.term_hash(key);
                let (root, added) = trie_put(heap, root, 0, hash, key, value)?;
                count += added as usize;
                large_map(heap, count, root)
            }
        }
        Some(BoxKind::LargeMap) => {
            let count = map_size(heap, map);
            let root = OpaqueTerm::from_raw(heap.word(map, 1));
            let hash = heap.term_hash(key);
            let (root, added) = trie_put(heap, root, 0, hash, key, value)?;
            large_map(heap, count + added as usize, root)
        }
        _ => panic!("map_put on a non-map term"),
    }
}

fn large_map(heap: &mut ProcessHeap, count: usize, root: OpaqueTerm) -> Result<OpaqueTerm, HeapFull> {
    let offset = alloc(heap, 2)?;
    heap.young[offset] = OpaqueTerm::make_header(BoxKind::LargeMap, count).raw();
    heap.young[offset + 1] = root.raw();
    Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
}

/// An empty trie node.
fn promote_bucket(heap: &mut ProcessHeap, _seed: OpaqueTerm) -> Result<OpaqueTerm, HeapFull> {
    build_node(heap, 0, 0, &[], &[])
}

fn build_node(
    heap: &mut ProcessHeap,
    datamap: u16,
    nodemap: u16,
    entries: &[OpaqueTerm],
    children: &[OpaqueTerm],
) -> Result<OpaqueTerm, HeapFull> {
    debug_assert_eq!(entries.len(), 2 * datamap.count_ones() as usize);
    debug_assert_eq!(children.len(), nodemap.count_ones() as usize);
    let packed = pack(datamap, nodemap);
    let offset = alloc(heap, node_words(packed))?;
    heap.young[offset] = OpaqueTerm::make_header(BoxKind::MapNode, packed).raw();
    for (i, term) in entries.iter().chain(children.iter()).enumerate() {
        heap.young[offset + 1 + i] = term.raw();
    }
    Ok(OpaqueTerm::make_ptr(Tag::Boxed, Region::Young, offset))
}

fn read_node(
    heap: &ProcessHeap,
    node: OpaqueTerm,
) -> (u16, u16, Vec<OpaqueTerm>, Vec<OpaqueTerm>) {
    let packed = heap.header(node).header_size();
    let (dm, nm) = (datamap(packed), nodemap(packed));
    let data_slots = 2 * dm.count_ones() as usize;
    let entries = (0..data_slots)
        .map(|i| OpaqueTerm::from_raw(heap.word(node, 1 + i)))
        .collect();
    let children = (0..nm.count_ones() as usize)
        .map(|i| OpaqueTerm::from_raw(heap.word(node, 1 + data_slots + i)))
        .collect();
    (dm, nm, entries, children)
}

fn trie_put(
    heap: &mut ProcessHeap,
    node: OpaqueTerm,
    level: u32,
    hash: u64,
    key: OpaqueTerm,
    value: OpaqueTerm,
) -> Result<(OpaqueTerm, bool), HeapFull> {
    // Collision bucket
    if heap.box_kind(node) == Some(BoxKind::SmallMap) {
        let before = map_size(heap, node);
        let new_bucket = bucket_put(heap, node, key, value)?;
        let after = map_size(heap, new_bucket);
        return Ok((new_bucket, after > before));
    }

    let (dm, nm, entries, children) = read_node(heap, node);
    let index = ((hash >> (level * BITS_PER_LEVEL)) & LEVEL_MASK) as u32;
    let bit = 1u16 << index;

    if dm & bit != 0 {
        let rank = slot_rank(dm, index);
        let existing_key = entries[rank * 2];
        let existing_value = entries[rank * 2 + 1];
        if heap.exact_eq(existing_key, key) {
            let mut entries = entries;
            entries[rank * 2 + 1] = value;
            return Ok((build_node(heap, dm, nm, &entries, &children)?, false));
        }
        // Two keys share this slot: push both down a level
        let existing_hash = heap.term_hash(existing_key);
        let child = if level + 1 >= MAX_LEVEL {
            let bucket = small_map_from_sorted(heap, &[])?;
            let bucket = bucket_put(heap, bucket, existing_key, existing_value)?;
            bucket_put(heap, bucket, key, value)?
        } else {
            let empty = build_node(heap, 0, 0, &[], &[])?;
            let (child, _) =
                trie_put(heap, empty, level + 1, existing_hash, existing_key, existing_value)?;
            let (child, _) = trie_put(heap, child, level + 1, hash, key, value)?;
            child
        };
        let mut entries = entries;
        let rank2 = rank * 2;
        entries.drain(rank2..rank2 + 2);
        let mut children = children;
        children.insert(slot_rank(nm, index), child);
        return Ok((build_node(heap, dm & !bit, nm | bit, &entries, &children)?, true));
    }

    if nm & bit != 0 {
        let rank = slot_rank(nm, index);
        let (child, added) = trie_put(heap, children[rank], level + 1, hash, key, value)?;
        let mut children = children;
        children[rank] = child;
        return Ok((build_node(heap, dm, nm, &entries, &children)?, added));
    }

    // Empty slot: store inline
    let rank = slot_rank(dm, index);
    let mut entries = entries;
    entries.insert(rank * 2, value);
    entries.insert(rank * 2, key);
    Ok((build_node(heap, dm | bit, nm, &entries, &children)?, true))
}

/// Put into a collision bucket, ignoring the small-map size limit.
fn bucket_put(
    heap: &mut ProcessHeap,
    bucket: OpaqueTerm,
    key: OpaqueTerm,
    value: OpaqueTerm,
) -> Result<OpaqueTerm, HeapFull> {
    let pairs = map_size(heap, bucket);
    let mut elems: Vec<OpaqueTerm> = Vec::with_capacity((pairs + 1) * 2);
    for i in 0..pairs * 2 {
        elems.push(OpaqueTerm::from_raw(heap.word(bucket, 1 + i)));
    }
    for i in (0..elems.len()).step_by(2) {
        if heap.exact_eq(elems[i], key) {
            elems[i + 1] = value;
            return small_map_from_sorted(heap, &elems);
        }
    }
    elems.push(key);
    elems.push(value);
    small_map_from_sorted(heap, &elems)
}

/// Every key/value pair of a map, in unspecified order.
pub fn map_pairs(heap: &ProcessHeap, map: OpaqueTerm) -> Vec<(OpaqueTerm, OpaqueTerm)> {
    match heap.box_kind(map) {
        Some(BoxKind::SmallMap) => {
            let pairs = map_size(heap, map);
            (0..pairs)
                .map(|i| {
                    (
                        OpaqueTerm::from_raw(heap.word(map, 1 + i * 2)),
                        OpaqueTerm::from_raw(heap.word(map, 2 + i * 2)),
                    )
                })
                .collect()
        }
        Some(BoxKind::LargeMap) => {
            let mut out = Vec::with_capacity(map_size(heap, map));
            collect_pairs(heap, OpaqueTerm::from_raw(heap.word(map, 1)), &mut out);
            out
        }
        _ => panic!("map_pairs of a non-map term"),
    }
}

fn collect_pairs(
    heap: &ProcessHeap,
    node: OpaqueTerm,
    out: &mut Vec<(OpaqueTerm, OpaqueTerm)>,
) {
    if heap.box_kind(node) == Some(BoxKind::SmallMap) {
        out.extend(map_pairs(heap, node));
        return;
    }
    let (_, _, entries, children) = read_node(heap, node);
    for pair in entries.chunks_exact(2) {
        out.push((pair[0], pair[1]));
    }
    for child in children {
        collect_pairs(heap, child, out);
    }
}

/// Extra headroom needed to rebuild a trie during a cross-heap copy, beyond
/// the per-entry payload: interior nodes and path-copy churn.
pub(crate) fn trie_copy_slack(heap: &ProcessHeap, map: OpaqueTerm) -> usize {
    map_size(heap, map) * 8 + 32
}

fn alloc(heap: &mut ProcessHeap, words: usize) -> Result<usize, HeapFull> {
    // Mirror of ProcessHeap::alloc for this module
    heap.alloc_words(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> OpaqueTerm {
        OpaqueTerm::make_small(i)
    }

    #[test]
    fn small_map_put_and_get() {
        let mut heap = ProcessHeap::fragment();
        let mut map = empty_map(&mut heap).unwrap();
        for i in 0..10 {
            map = map_put(&mut heap, map, int(i), int(i * 100)).unwrap();
        }
        assert_eq!(map_size(&heap, map), 10);
        assert_eq!(heap.box_kind(map), Some(BoxKind::SmallMap));
        for i in 0..10 {
            assert_eq!(map_get(&heap, map, int(i)), Some(int(i * 100)));
        }
        assert_eq!(map_get(&heap, map, int(11)), None);

        // Replacement does not grow the map
        let replaced = map_put(&mut heap, map, int(3), int(-3)).unwrap();
        assert_eq!(map_size(&heap, replaced), 10);
        assert_eq!(map_get(&heap, replaced, int(3)), Some(int(-3)));
        // The original is untouched
        assert_eq!(map_get(&heap, map, int(3)), Some(int(300)));
    }

    #[test]
    fn promotion_to_trie_preserves_entries() {
        let mut heap = ProcessHeap::fragment();
        let mut map = empty_map(&mut heap).unwrap();
        let n = 200i64;
        for i in 0..n {
            map = map_put(&mut heap, map, int(i), int(i * 2)).unwrap();
        }
        assert_eq!(heap.box_kind(map), Some(BoxKind::LargeMap));
        assert_eq!(map_size(&heap, map), n as usize);
        for i in 0..n {
            assert_eq!(map_get(&heap, map, int(i)), Some(int(i * 2)), "key {}", i);
        }
        let mut pairs = map_pairs(&heap, map);
        assert_eq!(pairs.len(), n as usize);
        pairs.sort_by_key(|(k, _)| k.small_value());
        assert_eq!(pairs[0].0, int(0));
        assert_eq!(pairs[199].1, int(398));
    }

    #[test]
    fn trie_replacement_keeps_size(){
        let mut heap = ProcessHeap::fragment();
        let mut map = empty_map(&mut heap).unwrap();
        for i in 0..100 {
            map = map_put(&mut heap, map, int(i), int(0)).unwrap();
        }
        let before = map_size(&heap, map);
        let map = map_put(&mut heap, map, int(50), int(1)).unwrap();
        assert_eq!(map_size(&heap, map), before);
        assert_eq!(map_get(&heap, map, int(50)), Some(int(1)));
    }

    #[test]
    fn map_from_pairs_dedups() {
        let mut heap = ProcessHeap::fragment();
        let map =
            map_from_pairs(&mut heap, &[(int(1), int(10)), (int(2), int(20)), (int(1), int(11))])
                .unwrap();
        assert_eq!(map_size(&heap, map), 2);
        assert_eq!(map_get(&heap, map, int(1)), Some(int(11)));
    }
}
