//! The external term format: a portable, self-describing binary encoding
//! of terms, used by `term_to_binary`/`binary_to_term` and by the literal
//! chunk of module images. Tag values follow the classic format so
//! fixtures are recognizable in a hex dump.

use num_bigint::{BigInt, Sign};
use num_traits::Zero;

use crate::heap::{HeapFull, ProcessHeap};
use crate::process::ProcessId;
use crate::term::{Atom, AtomError, BoxKind, OpaqueTerm, Tag};

pub const VERSION_BYTE: u8 = 131;

const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const NEW_FLOAT_EXT: u8 = 70;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const MAP_EXT: u8 = 116;
const NEW_PID_EXT: u8 = 88;
const NEWER_REFERENCE_EXT: u8 = 90;

#[derive(Debug, thiserror::Error)]
pub enum EtfError {
    #[error("unexpected end of input")]
    Eof,
    #[error("unsupported version byte {0}")]
    BadVersion(u8),
    #[error("unknown tag {0}")]
    BadTag(u8),
    #[error("malformed payload")]
    Malformed,
    #[error(transparent)]
    Atom(#[from] AtomError),
    #[error(transparent)]
    Heap(#[from] HeapFull),
    #[error("term cannot be encoded")]
    Unencodable,
}

/// Encodes `term` (owned by `heap`) into a self-contained byte vector.
/// Closures are not encodable.
pub fn encode(heap: &ProcessHeap, term: OpaqueTerm) -> Result<Vec<u8>, EtfError> {
    let mut out = vec![VERSION_BYTE];
    encode_term(heap, term, &mut out)?;
    Ok(out)
}

fn encode_term(heap: &ProcessHeap, term: OpaqueTerm, out: &mut Vec<u8>) -> Result<(), EtfError> {
    match term.tag() {
        Tag::Small => {
            let value = term.small_value();
            if (0..=255).contains(&value) {
                out.push(SMALL_INTEGER_EXT);
                out.push(value as u8);
            } else if let Ok(value) = i32::try_from(value) {
                out.push(INTEGER_EXT);
                out.extend_from_slice(&value.to_be_bytes());
            } else {
                encode_big(&BigInt::from(value), out);
            }
        }
        Tag::Atom => {
            let name = term.atom_value().name().as_bytes();
            debug_assert!(name.len() <= 255);
            out.push(SMALL_ATOM_UTF8_EXT);
            out.push(name.len() as u8);
            out.extend_from_slice(name);
        }
        Tag::Special if term.is_nil() => out.push(NIL_EXT),
        Tag::Special => return Err(EtfError::Unencodable),
        Tag::Pid => {
            let pid = term.pid_value();
            out.push(NEW_PID_EXT);
            encode_term(heap, OpaqueTerm::make_atom(crate::term::atoms::NONODE), out)?;
            out.extend_from_slice(&pid.number().to_be_bytes());
            out.extend_from_slice(&pid.serial().to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
        }
        Tag::Ref => {
            let id = term.ref_value();
            out.push(NEWER_REFERENCE_EXT);
            out.extend_from_slice(&2u16.to_be_bytes());
            encode_term(heap, OpaqueTerm::make_atom(crate::term::atoms::NONODE), out)?;
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&((id >> 32) as u32).to_be_bytes());
            out.extend_from_slice(&(id as u32).to_be_bytes());
        }
        Tag::Cons => {
            let mut elems = Vec::new();
            let mut cursor = term;
            while cursor.is_cons() {
                elems.push(heap.cons_head(cursor));
                cursor = heap.cons_tail(cursor);
            }
            out.push(LIST_EXT);
            out.extend_from_slice(&(elems.len() as u32).to_be_bytes());
            for elem in elems {
                encode_term(heap, elem, out)?;
            }
            encode_term(heap, cursor, out)?;
        }
        Tag::Header => return Err(EtfError::Unencodable),
        Tag::Boxed => match heap.header(term).header_kind() {
            BoxKind::Float => {
                out.push(NEW_FLOAT_EXT);
                out.extend_from_slice(&heap.float_value(term).to_bits().to_be_bytes());
            }
            BoxKind::Big => encode_big(&heap.big_value(term), out),
            BoxKind::Tuple => {
                let arity = heap.tuple_arity(term);
                if arity <= 255 {
                    out.push(SMALL_TUPLE_EXT);
                    out.push(arity as u8);
                } else {
                    out.push(LARGE_TUPLE_EXT);
                    out.extend_from_slice(&(arity as u32).to_be_bytes());
                }
                for i in 0..arity {
                    encode_term(heap, heap.tuple_element(term, i), out)?;
                }
            }
            BoxKind::HeapBinary | BoxKind::RefcBinary | BoxKind::SubBinary => {
                out.push(BINARY_EXT);
                heap.with_binary_bytes(term, |bytes| {
                    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    out.extend_from_slice(bytes);
                });
            }
            BoxKind::SmallMap | BoxKind::LargeMap => {
                let pairs = crate::map::map_pairs(heap, term);
                out.push(MAP_EXT);
                out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
                for (key, value) in pairs {
                    encode_term(heap, key, out)?;
                    encode_term(heap, value, out)?;
                }
            }
            BoxKind::ExternalRef => {
                out.push(NEWER_REFERENCE_EXT);
                out.extend_from_slice(&2u16.to_be_bytes());
                encode_term(heap, OpaqueTerm::from_raw(heap.word(term, 1)), out)?;
                out.extend_from_slice(&0u32.to_be_bytes());
                let id = heap.word(term, 2);
                out.extend_from_slice(&((id >> 32) as u32).to_be_bytes());
                out.extend_from_slice(&(id as u32).to_be_bytes());
            }
            BoxKind::MapNode | BoxKind::Closure => return Err(EtfError::Unencodable),
        },
    }
    Ok(())
}

fn encode_big(value: &BigInt, out: &mut Vec<u8>) {
    let (sign, bytes) = value.to_bytes_le();
    if bytes.len() <= 255 {
        out.push(SMALL_BIG_EXT);
        out.push(bytes.len() as u8);
    } else {
        out.push(LARGE_BIG_EXT);
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    }
    out.push((sign == Sign::Minus) as u8);
    out.extend_from_slice(&bytes);
}

/// Decodes a self-contained encoding into `heap`. Decoding into a
/// fragment cannot fail for space; decoding into a fixed process heap can
/// report `Heap(HeapFull)`, letting the caller collect and retry.
pub fn decode(heap: &mut ProcessHeap, bytes: &[u8]) -> Result<OpaqueTerm, EtfError> {
    let mut reader = Reader { bytes, pos: 0 };
    let version = reader.u8()?;
    if version != VERSION_BYTE {
        return Err(EtfError::BadVersion(version));
    }
    let term = decode_term(heap, &mut reader)?;
    Ok(term)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], EtfError> {
        let end = self.pos.checked_add(len).ok_or(EtfError::Eof)?;
        if end > self.bytes.len() {
            return Err(EtfError::Eof);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EtfError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EtfError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, EtfError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, EtfError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }
}

fn decode_term(heap: &mut ProcessHeap, reader: &mut Reader<'_>) -> Result<OpaqueTerm, EtfError> {
    let tag = reader.u8()?;
    match tag {
        SMALL_INTEGER_EXT => Ok(OpaqueTerm::make_small(reader.u8()? as i64)),
        INTEGER_EXT => Ok(OpaqueTerm::make_small(reader.i32()? as i64)),
        NEW_FLOAT_EXT => {
            let bits = u64::from_be_bytes(reader.take(8)?.try_into().unwrap());
            Ok(heap.float(f64::from_bits(bits))?)
        }
        SMALL_BIG_EXT | LARGE_BIG_EXT => {
            let len = if tag == SMALL_BIG_EXT {
                reader.u8()? as usize
            } else {
                reader.u32()? as usize
            };
            let negative = reader.u8()? != 0;
            let bytes = reader.take(len)?;
            let mut value = BigInt::from_bytes_le(Sign::Plus, bytes);
            if value.is_zero() {
                value = BigInt::zero();
            } else if negative {
                value = -value;
            }
            Ok(heap.big(value)?)
        }
        ATOM_UTF8_EXT | SMALL_ATOM_UTF8_EXT => {
            let len = if tag == ATOM_UTF8_EXT {
                reader.u16()? as usize
            } else {
                reader.u8()? as usize
            };
            let bytes = reader.take(len)?;
            let name = core::str::from_utf8(bytes).map_err(|_| EtfError::Malformed)?;
            Ok(OpaqueTerm::make_atom(Atom::intern(name)?))
        }
        SMALL_TUPLE_EXT | LARGE_TUPLE_EXT => {
            let arity = if tag == SMALL_TUPLE_EXT {
                reader.u8()? as usize
            } else {
                reader.u32()? as usize
            };
            let mut elems = Vec::with_capacity(arity);
            for _ in 0..arity {
                elems.push(decode_term(heap, reader)?);
            }
            Ok(heap.tuple(&elems)?)
        }
        NIL_EXT => Ok(OpaqueTerm::NIL),
        STRING_EXT => {
            let len = reader.u16()? as usize;
            let bytes = reader.take(len)?.to_vec();
            let elems: Vec<OpaqueTerm> =
                bytes.iter().map(|b| OpaqueTerm::make_small(*b as i64)).collect();
            Ok(heap.list_from_slice(&elems, OpaqueTerm::NIL)?)
        }
        LIST_EXT => {
            let len = reader.u32()? as usize;
            let mut elems = Vec::with_capacity(len.min(1 << 16));
            for _ in 0..len {
                elems.push(decode_term(heap, reader)?);
            }
            let tail = decode_term(heap, reader)?;
            Ok(heap.list_from_slice(&elems, tail)?)
        }
        BINARY_EXT => {
            let len = reader.u32()? as usize;
            let bytes = reader.take(len)?.to_vec();
            Ok(heap.binary(&bytes)?)
        }
        MAP_EXT => {
            let arity = reader.u32()? as usize;
            let mut pairs = Vec::with_capacity(arity.min(1 << 16));
            for _ in 0..arity {
                let key = decode_term(heap, reader)?;
                let value = decode_term(heap, reader)?;
                pairs.push((key, value));
            }
            Ok(crate::map::map_from_pairs(heap, &pairs)?)
        }
        NEW_PID_EXT => {
            let _node = decode_term(heap, reader)?;
            let number = reader.u32()?;
            let serial = reader.u32()?;
            let _creation = reader.u32()?;
            if number > ProcessId::NUMBER_MAX {
                return Err(EtfError::Malformed);
            }
            Ok(OpaqueTerm::make_pid(ProcessId::new(number, serial)))
        }
        NEWER_REFERENCE_EXT => {
            let len = reader.u16()? as usize;
            let _node = decode_term(heap, reader)?;
            let _creation = reader.u32()?;
            let mut ids = [0u32; 4];
            if len > ids.len() {
                return Err(EtfError::Malformed);
            }
            for slot in ids.iter_mut().take(len) {
                *slot = reader.u32()?;
            }
            let id = ((ids[0] as u64) << 32) | ids[1] as u64;
            if id < (1 << 61) {
                Ok(OpaqueTerm::make_ref(id))
            } else {
                let node = OpaqueTerm::make_atom(crate::term::atoms::NONODE);
                Ok(heap.external_ref(node, id)?)
            }
        }
        other => Err(EtfError::BadTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::atoms;

    fn roundtrip(build: impl FnOnce(&mut ProcessHeap) -> OpaqueTerm) {
        let mut src = ProcessHeap::fragment();
        let term = build(&mut src);
        let encoded = encode(&src, term).unwrap();
        let mut dst = ProcessHeap::fragment();
        let decoded = decode(&mut dst, &encoded).unwrap();

        // Compare across heaps by re-encoding: the encoding is canonical
        // for the term shapes we construct here
        let reencoded = encode(&dst, decoded).unwrap();
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn scalar_roundtrips() {
        roundtrip(|_| OpaqueTerm::make_small(0));
        roundtrip(|_| OpaqueTerm::make_small(255));
        roundtrip(|_| OpaqueTerm::make_small(-3));
        roundtrip(|_| OpaqueTerm::make_small(1 << 40));
        roundtrip(|_| OpaqueTerm::make_atom(atoms::OK));
        roundtrip(|_| OpaqueTerm::NIL);
        roundtrip(|h| h.float(3.25).unwrap());
        roundtrip(|h| h.big(BigInt::from(u64::MAX) * 1234567).unwrap());
        roundtrip(|_| OpaqueTerm::make_pid(ProcessId::new(77, 3)));
        roundtrip(|_| OpaqueTerm::make_ref(0xdead_beef));
    }

    #[test]
    fn container_roundtrips() {
        roundtrip(|h| {
            let inner = h.tuple(&[OpaqueTerm::make_small(1), OpaqueTerm::make_small(2)]).unwrap();
            h.list_from_slice(&[inner, OpaqueTerm::make_atom(atoms::ERROR)], OpaqueTerm::NIL)
                .unwrap()
        });
        roundtrip(|h| h.binary(b"some binary payload").unwrap());
        roundtrip(|h| h.binary(&vec![3u8; 300]).unwrap());
        roundtrip(|h| {
            crate::map::map_from_pairs(
                h,
                &[
                    (OpaqueTerm::make_small(1), OpaqueTerm::make_atom(atoms::TRUE)),
                    (OpaqueTerm::make_atom(atoms::OK), OpaqueTerm::make_small(2)),
                ],
            )
            .unwrap()
        });
    }

    #[test]
    fn ten_element_list_roundtrips_idempotently() {
        let mut heap = ProcessHeap::fragment();
        let elems: Vec<OpaqueTerm> = (0..10).map(OpaqueTerm::make_small).collect();
        let list = heap.list_from_slice(&elems, OpaqueTerm::NIL).unwrap();

        let encoded = encode(&heap, list).unwrap();
        let mut dst = ProcessHeap::fragment();
        let decoded = decode(&mut dst, &encoded).unwrap();

        // Equal to the original, structurally
        let mut merged = ProcessHeap::fragment();
        let a = merged.copy_from(&heap, list).unwrap();
        let b = merged.copy_from(&dst, decoded).unwrap();
        assert!(merged.exact_eq(a, b));

        // And idempotent
        let encoded_again = encode(&dst, decoded).unwrap();
        assert_eq!(encoded, encoded_again);
    }

    #[test]
    fn closures_are_unencodable() {
        let mut heap = ProcessHeap::fragment();
        let fun = heap.closure(0, 0, 0, &[]).unwrap();
        assert!(matches!(encode(&heap, fun), Err(EtfError::Unencodable)));
    }

    #[test]
    fn malformed_input_is_rejected() {
        let mut heap = ProcessHeap::fragment();
        assert!(matches!(decode(&mut heap, &[]), Err(EtfError::Eof)));
        assert!(matches!(decode(&mut heap, &[130, 106]), Err(EtfError::BadVersion(130))));
        assert!(matches!(decode(&mut heap, &[131, 200]), Err(EtfError::BadTag(200))));
        // Truncated tuple
        assert!(matches!(decode(&mut heap, &[131, 104, 2, 97, 1]), Err(EtfError::Eof)));
    }
}
