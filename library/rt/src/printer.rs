//! Human-readable term formatting, for logs, crash dumps, and the error
//! printer. Output approximates the language's own literal syntax; deeply
//! nested or very long terms are elided rather than flattened.

use crate::heap::ProcessHeap;
use crate::term::{BoxKind, OpaqueTerm, Tag};

const MAX_DEPTH: usize = 16;
const MAX_ELEMS: usize = 64;

pub fn format(heap: &ProcessHeap, term: OpaqueTerm) -> String {
    let mut out = String::new();
    write_term(heap, term, &mut out, 0);
    out
}

fn write_term(heap: &ProcessHeap, term: OpaqueTerm, out: &mut String, depth: usize) {
    use core::fmt::Write;

    if depth > MAX_DEPTH {
        out.push_str("...");
        return;
    }
    match term.tag() {
        Tag::Small => {
            let _ = write!(out, "{}", term.small_value());
        }
        Tag::Atom => {
            let name = term.atom_value().name();
            let plain = name
                .chars()
                .next()
                .map(|c| c.is_ascii_lowercase())
                .unwrap_or(false)
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@');
            if plain {
                out.push_str(name);
            } else {
                let _ = write!(out, "'{}'", name);
            }
        }
        Tag::Pid => {
            let _ = write!(out, "{}", term.pid_value());
        }
        Tag::Ref => {
            let _ = write!(out, "#Ref<0.{}>", term.ref_value());
        }
        Tag::Special => {
            out.push_str(if term.is_nil() { "[]" } else { "<none>" });
        }
        Tag::Header => out.push_str("<header>"),
        Tag::Cons => {
            out.push('[');
            let mut cursor = term;
            let mut count = 0;
            loop {
                if count >= MAX_ELEMS {
                    out.push_str("|...");
                    break;
                }
                write_term(heap, heap.cons_head(cursor), out, depth + 1);
                let tail = heap.cons_tail(cursor);
                if tail.is_nil() {
                    break;
                }
                if tail.is_cons() {
                    out.push(',');
                    cursor = tail;
                    count += 1;
                    continue;
                }
                out.push('|');
                write_term(heap, tail, out, depth + 1);
                break;
            }
            out.push(']');
        }
        Tag::Boxed => match heap.header(term).header_kind() {
            BoxKind::Tuple => {
                out.push('{');
                let arity = heap.tuple_arity(term);
                for i in 0..arity.min(MAX_ELEMS) {
                    if i > 0 {
                        out.push(',');
                    }
                    write_term(heap, heap.tuple_element(term, i), out, depth + 1);
                }
                if arity > MAX_ELEMS {
                    out.push_str(",...");
                }
                out.push('}');
            }
            BoxKind::Float => {
                let _ = write!(out, "{:?}", heap.float_value(term));
            }
            BoxKind::Big => {
                let _ = write!(out, "{}", heap.big_value(term));
            }
            BoxKind::HeapBinary | BoxKind::RefcBinary | BoxKind::SubBinary => {
                let size = heap.binary_size(term);
                let printable = heap.with_binary_bytes(term, |bytes| {
                    bytes.len() <= MAX_ELEMS
                        && bytes.iter().all(|b| (0x20..0x7f).contains(b))
                });
                if printable {
                    heap.with_binary_bytes(term, |bytes| {
                        let _ = write!(out, "<<\"{}\">>", String::from_utf8_lossy(bytes));
                    });
                } else {
                    let _ = write!(out, "<<{} bytes>>", size);
                }
            }
            BoxKind::SmallMap | BoxKind::LargeMap => {
                out.push_str("#{");
                let pairs = crate::map::map_pairs(heap, term);
                for (i, (k, v)) in pairs.iter().take(MAX_ELEMS).enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_term(heap, *k, out, depth + 1);
                    out.push_str(" => ");
                    write_term(heap, *v, out, depth + 1);
                }
                if pairs.len() > MAX_ELEMS {
                    out.push_str(",...");
                }
                out.push('}');
            }
            BoxKind::MapNode => out.push_str("<map-node>"),
            BoxKind::Closure => {
                let (instance, fun, arity, _) = heap.closure_parts(term);
                let _ = write!(out, "#Fun<{}.{}.{}>", instance, fun, arity);
            }
            BoxKind::ExternalRef => {
                let _ = write!(out, "#Ref<{}>", heap.word(term, 2));
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::atoms;

    #[test]
    fn formats_common_shapes() {
        let mut heap = ProcessHeap::fragment();
        let inner = heap
            .tuple(&[OpaqueTerm::make_atom(atoms::ERROR), OpaqueTerm::make_small(42)])
            .unwrap();
        let list = heap.list_from_slice(&[inner, OpaqueTerm::NIL], OpaqueTerm::NIL).unwrap();
        assert_eq!(format(&heap, list), "[{error,42},[]]");

        let bin = heap.binary(b"hi there").unwrap();
        assert_eq!(format(&heap, bin), "<<\"hi there\">>");

        let improper = heap.cons(OpaqueTerm::make_small(1), OpaqueTerm::make_small(2)).unwrap();
        assert_eq!(format(&heap, improper), "[1|2]");
    }
}
