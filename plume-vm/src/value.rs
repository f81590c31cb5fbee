//! Host-side term descriptions.
//!
//! [`Value`] is how an embedder passes arguments in and reads results,
//! mailboxes and exit reasons out without touching tagged words or
//! process heaps directly.

use core::fmt;

use crate::atom::AtomTable;
use crate::context::Context;
use crate::heap::{Heap, OutOfMemory};
use crate::term::{self, boxed, Term};

/// A plain-Rust description of a term.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer (immediate or boxed).
    Int(i64),
    /// Float.
    Float(f64),
    /// Atom by name.
    Atom(String),
    /// Local pid.
    Pid(u32),
    /// Reference.
    Ref(u64),
    /// Tuple.
    Tuple(Vec<Value>),
    /// Proper list.
    List(Vec<Value>),
    /// List with a non-nil tail.
    ImproperList(Vec<Value>, Box<Value>),
    /// Binary.
    Binary(Vec<u8>),
    /// Map in key order.
    Map(Vec<(Value, Value)>),
    /// A term with no useful host representation (closures, match
    /// states).
    Opaque(&'static str),
}

impl Value {
    /// Atom by name.
    pub fn atom(name: &str) -> Value {
        Value::Atom(name.to_string())
    }

    /// The empty list.
    pub fn nil() -> Value {
        Value::List(Vec::new())
    }

    /// Decodes a term of `heap` into a host value.
    pub fn from_term(atoms: &AtomTable, heap: &Heap, t: Term) -> Value {
        if t.is_small() {
            return Value::Int(t.small_value());
        }
        if t.is_nil() {
            return Value::nil();
        }
        if t.is_atom() {
            return Value::Atom(atoms.name(t.atom_id()).to_string());
        }
        if t.is_pid() {
            return Value::Pid(t.pid_id());
        }
        if t.is_list_cell() {
            let mut items = Vec::new();
            let mut cursor = t;
            while cursor.is_list_cell() {
                items.push(Value::from_term(atoms, heap, heap.list_head(cursor)));
                cursor = heap.list_tail(cursor);
            }
            if cursor.is_nil() {
                return Value::List(items);
            }
            return Value::ImproperList(items, Box::new(Value::from_term(atoms, heap, cursor)));
        }
        if !t.is_boxed() {
            return Value::Opaque("unrepresentable");
        }
        match heap.boxed_kind(t) {
            boxed::INT => Value::Int(heap.any_int_value(t)),
            boxed::FLOAT => Value::Float(heap.float_value(t)),
            boxed::REF => Value::Ref(heap.ref_ticks(t)),
            boxed::TUPLE => Value::Tuple(
                (0..heap.tuple_arity(t))
                    .map(|i| Value::from_term(atoms, heap, heap.tuple_element(t, i)))
                    .collect(),
            ),
            boxed::HEAP_BIN | boxed::SUB_BIN => Value::Binary(heap.binary_bytes(t)),
            boxed::MAP => Value::Map(
                (0..heap.map_size(t))
                    .map(|i| {
                        (
                            Value::from_term(atoms, heap, heap.map_key(t, i)),
                            Value::from_term(atoms, heap, heap.map_value(t, i)),
                        )
                    })
                    .collect(),
            ),
            boxed::FUN => Value::Opaque("fun"),
            boxed::MATCH_STATE => Value::Opaque("match_state"),
            _ => Value::Opaque("unrepresentable"),
        }
    }

    /// Heap words a built term will need.
    fn words(&self) -> usize {
        match self {
            Value::Int(v) => {
                if (term::MIN_SMALL..=term::MAX_SMALL).contains(v) {
                    0
                } else {
                    2
                }
            }
            Value::Float(_) | Value::Ref(_) => 2,
            Value::Atom(_) | Value::Pid(_) | Value::Opaque(_) => 0,
            Value::Tuple(items) => 1 + items.len() + items.iter().map(Value::words).sum::<usize>(),
            Value::List(items) => items.len() * 2 + items.iter().map(Value::words).sum::<usize>(),
            Value::ImproperList(items, tail) => {
                items.len() * 2 + items.iter().map(Value::words).sum::<usize>() + tail.words()
            }
            Value::Binary(bytes) => Heap::binary_words(bytes.len()),
            Value::Map(pairs) => {
                Heap::map_words(pairs.len(), false)
                    + pairs.iter().map(|(k, v)| k.words() + v.words()).sum::<usize>()
            }
        }
    }

    /// Builds this value on a process heap, interning atoms as needed.
    /// Map keys are sorted on the way in.
    pub fn build(&self, atoms: &mut AtomTable, ctx: &mut Context) -> Result<Term, OutOfMemory> {
        ctx.ensure_free(self.words())?;
        Ok(self.build_inner(atoms, &mut ctx.heap))
    }

    fn build_inner(&self, atoms: &mut AtomTable, heap: &mut Heap) -> Term {
        match self {
            Value::Int(v) => heap.make_int(*v),
            Value::Float(v) => heap.alloc_float(*v),
            Value::Atom(name) => Term::atom(atoms.insert(name)),
            Value::Pid(pid) => Term::pid(*pid),
            Value::Ref(ticks) => heap.alloc_ref(*ticks),
            Value::Opaque(_) => Term::INVALID,
            Value::Tuple(items) => {
                let built: Vec<Term> = items.iter().map(|i| i.build_inner(atoms, heap)).collect();
                let tuple = heap.alloc_tuple(built.len());
                for (i, t) in built.into_iter().enumerate() {
                    heap.put_tuple_element(tuple, i, t);
                }
                tuple
            }
            Value::List(items) => {
                let built: Vec<Term> = items.iter().map(|i| i.build_inner(atoms, heap)).collect();
                let mut list = Term::NIL;
                for t in built.into_iter().rev() {
                    list = heap.cons(t, list);
                }
                list
            }
            Value::ImproperList(items, tail) => {
                let built: Vec<Term> = items.iter().map(|i| i.build_inner(atoms, heap)).collect();
                let mut list = tail.build_inner(atoms, heap);
                for t in built.into_iter().rev() {
                    list = heap.cons(t, list);
                }
                list
            }
            Value::Binary(bytes) => {
                let bin = heap.alloc_binary(bytes.len());
                heap.binary_write(bin, 0, bytes);
                bin
            }
            Value::Map(pairs) => {
                let mut built: Vec<(Term, Term)> = pairs
                    .iter()
                    .map(|(k, v)| (k.build_inner(atoms, heap), v.build_inner(atoms, heap)))
                    .collect();
                built.sort_by(|a, b| term::compare(heap, a.0, b.0));
                let map = heap.alloc_map(built.len(), None);
                for (i, (k, v)) in built.into_iter().enumerate() {
                    heap.set_map_entry(map, i, k, v);
                }
                map
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Atom(name) => write!(f, "{name}"),
            Value::Pid(pid) => write!(f, "<0.{pid}.0>"),
            Value::Ref(ticks) => write!(f, "#Ref<{ticks}>"),
            Value::Tuple(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::ImproperList(items, tail) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "|{tail}]")
            }
            Value::Binary(bytes) => write!(f, "<<{} bytes>>", bytes.len()),
            Value::Map(pairs) => {
                write!(f, "#{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k} => {v}")?;
                }
                write!(f, "}}")
            }
            Value::Opaque(kind) => write!(f, "#{kind}<>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::install_defaults;

    fn setup() -> (AtomTable, Context) {
        let mut atoms = AtomTable::new();
        install_defaults(&mut atoms);
        (atoms, Context::new(1))
    }

    #[test]
    fn round_trips_through_a_heap() {
        let (mut atoms, mut ctx) = setup();
        let value = Value::Tuple(vec![
            Value::atom("ok"),
            Value::List(vec![Value::Int(1), Value::Int(1 << 61)]),
            Value::Binary(vec![1, 2, 3]),
        ]);
        let t = value.build(&mut atoms, &mut ctx).expect("builds");
        assert_eq!(Value::from_term(&atoms, &ctx.heap, t), value);
    }

    #[test]
    fn maps_sort_keys_when_built() {
        let (mut atoms, mut ctx) = setup();
        let value = Value::Map(vec![
            (Value::Int(2), Value::atom("b")),
            (Value::Int(1), Value::atom("a")),
        ]);
        let t = value.build(&mut atoms, &mut ctx).expect("builds");
        assert_eq!(ctx.heap.map_key(t, 0), Term::small(1));
        assert_eq!(ctx.heap.map_key(t, 1), Term::small(2));
    }

    #[test]
    fn improper_lists_round_trip() {
        let (mut atoms, mut ctx) = setup();
        let value = Value::ImproperList(vec![Value::Int(1)], Box::new(Value::Int(2)));
        let t = value.build(&mut atoms, &mut ctx).expect("builds");
        assert_eq!(Value::from_term(&atoms, &ctx.heap, t), value);
    }

    #[test]
    fn display_is_erlang_flavored() {
        let value = Value::Tuple(vec![Value::atom("error"), Value::Int(3)]);
        assert_eq!(value.to_string(), "{error,3}");
    }
}
