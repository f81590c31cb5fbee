//! External term format decoding for module literals.
//!
//! Literal table entries are serialized terms (version byte 131). The
//! decoder materializes them into the fragment space of the requesting
//! process so that a literal operand can never move live terms
//! mid-instruction; the survivors merge into the main heap at the next
//! collection.

use crate::atom::AtomTable;
use crate::heap::Heap;
use crate::term::{self, Term};

const VERSION: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Undecodable literal blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExtermError {
    /// Blob ends inside a term.
    #[error("truncated external term")]
    Truncated,
    /// Missing 131 version byte.
    #[error("bad external term version")]
    BadVersion,
    /// Tag outside the supported subset.
    #[error("unsupported external term tag {0}")]
    UnsupportedTag(u8),
    /// A big integer wider than 64 bits.
    #[error("big integer does not fit 64 bits")]
    IntegerTooLarge,
    /// An atom name is not valid UTF-8.
    #[error("malformed atom name")]
    BadAtom,
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, ExtermError> {
        let b = *self.data.get(self.at).ok_or(ExtermError::Truncated)?;
        self.at += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ExtermError> {
        let slice = self
            .data
            .get(self.at..self.at + n)
            .ok_or(ExtermError::Truncated)?;
        self.at += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, ExtermError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32, ExtermError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }
}

/// Decodes one serialized term into the fragment space of `heap`.
pub fn decode(data: &[u8], heap: &mut Heap, atoms: &mut AtomTable) -> Result<Term, ExtermError> {
    let mut reader = Reader { data, at: 0 };
    if reader.u8()? != VERSION {
        return Err(ExtermError::BadVersion);
    }
    decode_term(&mut reader, heap, atoms)
}

fn frag_int(heap: &mut Heap, value: i64) -> Term {
    heap.make_int_fragment(value)
}

fn frag_tuple(heap: &mut Heap, elements: &[Term]) -> Term {
    let at = heap.alloc_fragment(elements.len() + 1);
    heap.store(
        at,
        Term::from_raw((elements.len() as u64) << 6 | term::boxed::TUPLE),
    );
    for (i, e) in elements.iter().enumerate() {
        heap.store(at + 1 + i, *e);
    }
    Term::boxed_at(at)
}

fn frag_cons(heap: &mut Heap, head: Term, tail: Term) -> Term {
    let at = heap.alloc_fragment(2);
    heap.store(at, head);
    heap.store(at + 1, tail);
    Term::list_at(at)
}

fn frag_binary(heap: &mut Heap, bytes: &[u8]) -> Term {
    let words = Heap::binary_words(bytes.len());
    let at = heap.alloc_fragment(words);
    heap.store(
        at,
        Term::from_raw(((words - 1) as u64) << 6 | term::boxed::HEAP_BIN),
    );
    heap.store(at + 1, Term::from_raw(bytes.len() as u64));
    for slot in 2..words {
        heap.store(at + slot, Term::from_raw(0));
    }
    let t = Term::boxed_at(at);
    heap.binary_write(t, 0, bytes);
    t
}

fn frag_float(heap: &mut Heap, value: f64) -> Term {
    let at = heap.alloc_fragment(2);
    heap.store(at, Term::from_raw(1 << 6 | term::boxed::FLOAT));
    heap.store(at + 1, Term::from_raw(value.to_bits()));
    Term::boxed_at(at)
}

fn decode_atom(
    reader: &mut Reader<'_>,
    atoms: &mut AtomTable,
    len: usize,
) -> Result<Term, ExtermError> {
    let bytes = reader.take(len)?;
    let name = core::str::from_utf8(bytes).map_err(|_| ExtermError::BadAtom)?;
    Ok(Term::atom(atoms.insert(name)))
}

fn decode_term(
    reader: &mut Reader<'_>,
    heap: &mut Heap,
    atoms: &mut AtomTable,
) -> Result<Term, ExtermError> {
    let tag = reader.u8()?;
    match tag {
        SMALL_INTEGER_EXT => Ok(Term::small(i64::from(reader.u8()?))),
        INTEGER_EXT => Ok(Term::small(i64::from(reader.u32()? as i32))),
        NEW_FLOAT_EXT => {
            let bits = u64::from_be_bytes(reader.take(8)?.try_into().expect("8 bytes"));
            Ok(frag_float(heap, f64::from_bits(bits)))
        }
        FLOAT_EXT => {
            let text = reader.take(31)?;
            let end = text.iter().position(|b| *b == 0).unwrap_or(31);
            let parsed = core::str::from_utf8(&text[..end])
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or(ExtermError::UnsupportedTag(FLOAT_EXT))?;
            Ok(frag_float(heap, parsed))
        }
        ATOM_EXT | ATOM_UTF8_EXT => {
            let len = reader.u16()? as usize;
            decode_atom(reader, atoms, len)
        }
        SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
            let len = reader.u8()? as usize;
            decode_atom(reader, atoms, len)
        }
        SMALL_TUPLE_EXT | LARGE_TUPLE_EXT => {
            let arity = if tag == SMALL_TUPLE_EXT {
                reader.u8()? as usize
            } else {
                reader.u32()? as usize
            };
            let mut elements = Vec::with_capacity(arity);
            for _ in 0..arity {
                elements.push(decode_term(reader, heap, atoms)?);
            }
            Ok(frag_tuple(heap, &elements))
        }
        NIL_EXT => Ok(Term::NIL),
        STRING_EXT => {
            let len = reader.u16()? as usize;
            let bytes = reader.take(len)?.to_vec();
            let mut list = Term::NIL;
            for b in bytes.into_iter().rev() {
                list = frag_cons(heap, Term::small(i64::from(b)), list);
            }
            Ok(list)
        }
        LIST_EXT => {
            let len = reader.u32()? as usize;
            let mut elements = Vec::with_capacity(len);
            for _ in 0..len {
                elements.push(decode_term(reader, heap, atoms)?);
            }
            let mut list = decode_term(reader, heap, atoms)?;
            for e in elements.into_iter().rev() {
                list = frag_cons(heap, e, list);
            }
            Ok(list)
        }
        BINARY_EXT => {
            let len = reader.u32()? as usize;
            let bytes = reader.take(len)?.to_vec();
            Ok(frag_binary(heap, &bytes))
        }
        SMALL_BIG_EXT => {
            let len = reader.u8()? as usize;
            let sign = reader.u8()?;
            if len > 8 {
                return Err(ExtermError::IntegerTooLarge);
            }
            let mut magnitude: u64 = 0;
            for (i, b) in reader.take(len)?.iter().enumerate() {
                magnitude |= u64::from(*b) << (8 * i);
            }
            let value = if sign == 0 {
                i64::try_from(magnitude).map_err(|_| ExtermError::IntegerTooLarge)?
            } else if magnitude <= (i64::MAX as u64) + 1 {
                (magnitude as i64).wrapping_neg()
            } else {
                return Err(ExtermError::IntegerTooLarge);
            };
            Ok(frag_int(heap, value))
        }
        MAP_EXT => {
            let size = reader.u32()? as usize;
            let mut pairs = Vec::with_capacity(size);
            for _ in 0..size {
                let key = decode_term(reader, heap, atoms)?;
                let value = decode_term(reader, heap, atoms)?;
                pairs.push((key, value));
            }
            pairs.sort_by(|a, b| term::compare(heap, a.0, b.0));
            let keys: Vec<Term> = pairs.iter().map(|p| p.0).collect();
            let keys_tuple = frag_tuple(heap, &keys);
            let at = heap.alloc_fragment(2 + size);
            heap.store(
                at,
                Term::from_raw(((1 + size) as u64) << 6 | term::boxed::MAP),
            );
            heap.store(at + 1, keys_tuple);
            for (i, (_, v)) in pairs.into_iter().enumerate() {
                heap.store(at + 2 + i, v);
            }
            Ok(Term::boxed_at(at))
        }
        other => Err(ExtermError::UnsupportedTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::install_defaults;

    fn setup() -> (Heap, AtomTable) {
        let mut atoms = AtomTable::new();
        install_defaults(&mut atoms);
        (Heap::with_capacity(64), atoms)
    }

    #[test]
    fn decodes_integers() {
        let (mut heap, mut atoms) = setup();
        assert_eq!(
            decode(&[131, 97, 42], &mut heap, &mut atoms),
            Ok(Term::small(42))
        );
        assert_eq!(
            decode(&[131, 98, 0xFF, 0xFF, 0xFF, 0xFE], &mut heap, &mut atoms),
            Ok(Term::small(-2))
        );
    }

    #[test]
    fn decodes_atoms_and_reuses_ids() {
        let (mut heap, mut atoms) = setup();
        let t = decode(&[131, 119, 2, b'o', b'k'], &mut heap, &mut atoms).expect("decodes");
        assert_eq!(t, Term::atom(crate::atom::defaults::OK));
    }

    #[test]
    fn decodes_nested_structures() {
        let (mut heap, mut atoms) = setup();
        // {ok, [1, 2]}
        let blob = [
            131, 104, 2, 119, 2, b'o', b'k', 108, 0, 0, 0, 2, 97, 1, 97, 2, 106,
        ];
        let t = decode(&blob, &mut heap, &mut atoms).expect("decodes");
        assert!(heap.is_tuple(t));
        assert_eq!(heap.tuple_element(t, 0), Term::atom(crate::atom::defaults::OK));
        let list = heap.tuple_element(t, 1);
        assert_eq!(heap.list_head(list), Term::small(1));
        assert_eq!(heap.list_head(heap.list_tail(list)), Term::small(2));
    }

    #[test]
    fn decodes_binaries_and_strings() {
        let (mut heap, mut atoms) = setup();
        let bin = decode(&[131, 109, 0, 0, 0, 3, 1, 2, 3], &mut heap, &mut atoms).expect("decodes");
        assert_eq!(heap.binary_bytes(bin), [1, 2, 3]);

        let s = decode(&[131, 107, 0, 2, b'h', b'i'], &mut heap, &mut atoms).expect("decodes");
        assert_eq!(heap.list_head(s), Term::small(i64::from(b'h')));
    }

    #[test]
    fn decodes_small_bigs() {
        let (mut heap, mut atoms) = setup();
        // 2^62 positive, little-endian magnitude.
        let blob = [131, 110, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0x40];
        let t = decode(&blob, &mut heap, &mut atoms).expect("decodes");
        assert_eq!(heap.any_int_value(t), 1 << 62);

        let too_big = [131, 110, 9, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0x40];
        assert_eq!(
            decode(&too_big, &mut heap, &mut atoms),
            Err(ExtermError::IntegerTooLarge)
        );
    }

    #[test]
    fn map_keys_are_sorted() {
        let (mut heap, mut atoms) = setup();
        // #{2 => b, 1 => a} arrives unsorted.
        let blob = [
            131, 116, 0, 0, 0, 2, 97, 2, 119, 1, b'b', 97, 1, 119, 1, b'a',
        ];
        let t = decode(&blob, &mut heap, &mut atoms).expect("decodes");
        assert!(heap.is_map(t));
        assert_eq!(heap.map_key(t, 0), Term::small(1));
        assert_eq!(heap.map_key(t, 1), Term::small(2));
    }
}
