//! Tagged machine-word term representation.
//!
//! Every value is a single `u64`. The low bits select the kind:
//!
//! | low bits | kind |
//! |---|---|
//! | `...1111` | immediate small integer, signed 60-bit payload |
//! | `..001011` | atom, payload is the global atom id |
//! | `..111011` | the empty list |
//! | `..101011` | the invalid (non-value) sentinel |
//! | `..011011` | catch label (stack only) |
//! | `...0011` | local pid |
//! | `.....01` | list cell, payload is a heap index |
//! | `.....10` | boxed object, payload is a heap index |
//! | `.....00` | continuation pointer (stack only) |
//!
//! Heap payloads are indices into the owning process's heap arena, never
//! raw addresses, so a term can never reference another process's heap.
//! Boxed objects start with a header word `(payload_words << 6) | kind`;
//! header kinds are multiples of four so a header is distinguishable from
//! any value word during a heap scan.

use core::fmt;

use crate::heap::Heap;

/// A tagged machine word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Term(pub(crate) u64);

static_assertions::const_assert_eq!(core::mem::size_of::<Term>(), 8);

/// Largest immediate integer.
pub const MAX_SMALL: i64 = (1 << 59) - 1;
/// Smallest immediate integer.
pub const MIN_SMALL: i64 = -(1 << 59);

/// Boxed header kinds. Multiples of four; see the module docs.
pub mod boxed {
    /// Tuple of `n` elements.
    pub const TUPLE: u64 = 0x00;
    /// Signed 64-bit integer that did not fit the immediate range.
    pub const INT: u64 = 0x08;
    /// Reference: 64-bit monotonic ticks.
    pub const REF: u64 = 0x10;
    /// Function closure.
    pub const FUN: u64 = 0x14;
    /// Floating point number.
    pub const FLOAT: u64 = 0x18;
    /// Heap binary: byte length word plus packed data words.
    pub const HEAP_BIN: u64 = 0x24;
    /// Sub-binary view: length, byte offset, parent.
    pub const SUB_BIN: u64 = 0x28;
    /// Map: keys tuple plus value words.
    pub const MAP: u64 = 0x2C;
    /// Binary match state: binary, bit offset, saved offsets.
    pub const MATCH_STATE: u64 = 0x30;
}

const TAG_LIST: u64 = 0x1;
const TAG_BOXED: u64 = 0x2;
const TAG_PID: u64 = 0x3;
const TAG_ATOM: u64 = 0x0B;
const TAG_CATCH: u64 = 0x1B;
const TERM_NIL: u64 = 0x3B;
const TERM_INVALID: u64 = 0x2B;
const TAG_SMALL: u64 = 0xF;

/// First heap index of the per-process fragment space. Indices below it
/// address the main region.
pub(crate) const FRAG_BASE: usize = 1 << 40;

impl Term {
    /// The empty list.
    pub const NIL: Term = Term(TERM_NIL);
    /// The non-value sentinel.
    pub const INVALID: Term = Term(TERM_INVALID);
    /// Continuation pointer that terminates the process on return.
    pub(crate) const CP_SENTINEL: u64 = u64::MAX & !0x3;

    /// Immediate integer. The value must fit `MIN_SMALL..=MAX_SMALL`.
    #[inline]
    pub fn small(value: i64) -> Term {
        debug_assert!((MIN_SMALL..=MAX_SMALL).contains(&value));
        Term((value as u64) << 4 | TAG_SMALL)
    }

    /// Atom with the given global id.
    #[inline]
    pub fn atom(id: u32) -> Term {
        Term(u64::from(id) << 6 | TAG_ATOM)
    }

    /// Local pid.
    #[inline]
    pub fn pid(process_id: u32) -> Term {
        Term(u64::from(process_id) << 4 | TAG_PID)
    }

    /// List cell at a heap index.
    #[inline]
    pub(crate) fn list_at(index: usize) -> Term {
        Term((index as u64) << 2 | TAG_LIST)
    }

    /// Boxed object at a heap index.
    #[inline]
    pub(crate) fn boxed_at(index: usize) -> Term {
        Term((index as u64) << 2 | TAG_BOXED)
    }

    /// Catch-label stack word.
    pub(crate) fn catch_label(module_index: usize, label: u32) -> Term {
        let packed = ((module_index as u64) << 24) | u64::from(label);
        Term(packed << 6 | TAG_CATCH)
    }

    /// Continuation pointer word.
    pub(crate) fn cp(module_index: usize, code_offset: usize) -> u64 {
        ((module_index as u64) << 24) | ((code_offset as u64) << 2)
    }

    /// Splits a continuation pointer into module index and code offset.
    pub(crate) fn cp_parts(cp: u64) -> (usize, usize) {
        ((cp >> 24) as usize, ((cp & 0xFF_FFFF) >> 2) as usize)
    }

    /// Raw word.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Term {
        Term(raw)
    }

    /// Whether this is the invalid sentinel.
    #[inline]
    pub fn is_invalid(self) -> bool {
        self.0 == TERM_INVALID
    }

    /// Immediate small integer?
    #[inline]
    pub fn is_small(self) -> bool {
        self.0 & 0xF == TAG_SMALL
    }

    /// Value of an immediate integer.
    #[inline]
    pub fn small_value(self) -> i64 {
        debug_assert!(self.is_small());
        (self.0 as i64) >> 4
    }

    /// Atom (including the empty list is *not* an atom here)?
    #[inline]
    pub fn is_atom(self) -> bool {
        self.0 & 0x3F == TAG_ATOM
    }

    /// Global atom id.
    #[inline]
    pub fn atom_id(self) -> u32 {
        debug_assert!(self.is_atom());
        (self.0 >> 6) as u32
    }

    /// The empty list?
    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == TERM_NIL
    }

    /// Local pid?
    #[inline]
    pub fn is_pid(self) -> bool {
        self.0 & 0xF == TAG_PID
    }

    /// Local process id of a pid.
    #[inline]
    pub fn pid_id(self) -> u32 {
        debug_assert!(self.is_pid());
        (self.0 >> 4) as u32
    }

    /// Non-empty list cell?
    #[inline]
    pub fn is_list_cell(self) -> bool {
        self.0 & 0x3 == TAG_LIST
    }

    /// List (empty or cell)?
    #[inline]
    pub fn is_list(self) -> bool {
        self.is_nil() || self.is_list_cell()
    }

    /// Boxed object?
    #[inline]
    pub fn is_boxed(self) -> bool {
        self.0 & 0x3 == TAG_BOXED
    }

    /// Heap index of a list cell or boxed object.
    #[inline]
    pub(crate) fn heap_index(self) -> usize {
        debug_assert!(self.is_list_cell() || self.is_boxed());
        (self.0 >> 2) as usize
    }

    /// Catch-label stack word?
    #[inline]
    pub(crate) fn is_catch_label(self) -> bool {
        self.0 & 0x3F == TAG_CATCH
    }

    /// Splits a catch label into module index and label number.
    pub(crate) fn catch_label_parts(self) -> (usize, u32) {
        debug_assert!(self.is_catch_label());
        let packed = self.0 >> 6;
        ((packed >> 24) as usize, (packed & 0xFF_FFFF) as u32)
    }

    /// Continuation-pointer stack word?
    #[inline]
    pub(crate) fn is_cp_word(self) -> bool {
        self.0 & 0x3 == 0
    }

    /// `true` or `false`?
    pub fn is_boolean(self) -> bool {
        self == Term::atom(crate::atom::defaults::TRUE) || self == Term::atom(crate::atom::defaults::FALSE)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_small() {
            write!(f, "Term::small({})", self.small_value())
        } else if self.is_nil() {
            write!(f, "Term::NIL")
        } else if self.is_invalid() {
            write!(f, "Term::INVALID")
        } else if self.is_atom() {
            write!(f, "Term::atom({})", self.atom_id())
        } else if self.is_pid() {
            write!(f, "Term::pid({})", self.pid_id())
        } else if self.is_list_cell() {
            write!(f, "Term::list@{}", self.heap_index())
        } else if self.is_boxed() {
            write!(f, "Term::boxed@{}", self.heap_index())
        } else {
            write!(f, "Term({:#x})", self.0)
        }
    }
}

/// Type precedence of the total order: number < atom < reference <
/// function < port < pid < tuple < map < list < binary.
fn order_class(heap: &Heap, t: Term) -> u8 {
    if t.is_small() {
        return 0;
    }
    if t.is_atom() {
        return 1;
    }
    if t.is_pid() {
        return 5;
    }
    if t.is_nil() || t.is_list_cell() {
        return 8;
    }
    debug_assert!(t.is_boxed());
    match heap.boxed_kind(t) {
        boxed::INT | boxed::FLOAT => 0,
        boxed::REF => 2,
        boxed::FUN => 3,
        boxed::TUPLE => 6,
        boxed::MAP => 7,
        boxed::HEAP_BIN | boxed::SUB_BIN => 9,
        _ => 10,
    }
}

fn is_number(heap: &Heap, t: Term) -> bool {
    t.is_small() || (t.is_boxed() && matches!(heap.boxed_kind(t), boxed::INT | boxed::FLOAT))
}

fn is_float(heap: &Heap, t: Term) -> bool {
    t.is_boxed() && heap.boxed_kind(t) == boxed::FLOAT
}

fn number_compare(heap: &Heap, a: Term, b: Term) -> core::cmp::Ordering {
    if is_float(heap, a) || is_float(heap, b) {
        let fa = heap.number_as_f64(a);
        let fb = heap.number_as_f64(b);
        fa.partial_cmp(&fb).unwrap_or(core::cmp::Ordering::Equal)
    } else {
        heap.any_int_value(a).cmp(&heap.any_int_value(b))
    }
}

/// Total order over all terms of one heap.
///
/// Numbers compare by value across integer/float; atoms compare by id;
/// everything else compares structurally within its class.
pub fn compare(heap: &Heap, a: Term, b: Term) -> core::cmp::Ordering {
    use core::cmp::Ordering;

    if a == b {
        return Ordering::Equal;
    }

    let ca = order_class(heap, a);
    let cb = order_class(heap, b);
    if ca != cb {
        return ca.cmp(&cb);
    }

    match ca {
        0 => number_compare(heap, a, b),
        1 => a.atom_id().cmp(&b.atom_id()),
        2 => heap.ref_ticks(a).cmp(&heap.ref_ticks(b)),
        5 => a.pid_id().cmp(&b.pid_id()),
        6 => {
            let (na, nb) = (heap.tuple_arity(a), heap.tuple_arity(b));
            if na != nb {
                return na.cmp(&nb);
            }
            for i in 0..na {
                let ord = compare(heap, heap.tuple_element(a, i), heap.tuple_element(b, i));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        7 => {
            let (na, nb) = (heap.map_size(a), heap.map_size(b));
            if na != nb {
                return na.cmp(&nb);
            }
            for i in 0..na {
                let ord = compare(heap, heap.map_key(a, i), heap.map_key(b, i));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            for i in 0..na {
                let ord = compare(heap, heap.map_value(a, i), heap.map_value(b, i));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        8 => {
            let mut ta = a;
            let mut tb = b;
            loop {
                match (ta.is_nil(), tb.is_nil()) {
                    (true, true) => return Ordering::Equal,
                    (true, false) => return Ordering::Less,
                    (false, true) => return Ordering::Greater,
                    (false, false) => {}
                }
                if !ta.is_list_cell() || !tb.is_list_cell() {
                    // Improper tails compare as plain terms.
                    return compare(heap, ta, tb);
                }
                let ord = compare(heap, heap.list_head(ta), heap.list_head(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
                ta = heap.list_tail(ta);
                tb = heap.list_tail(tb);
            }
        }
        9 => heap.binary_bytes(a).cmp(&heap.binary_bytes(b)),
        3 => {
            // Functions have no useful order; compare their words.
            a.raw().cmp(&b.raw())
        }
        _ => a.raw().cmp(&b.raw()),
    }
}

/// Structural equality: `1 == 1.0`.
pub fn equals(heap: &Heap, a: Term, b: Term) -> bool {
    compare(heap, a, b) == core::cmp::Ordering::Equal
}

/// Exact equality: types must match, so `1 =/= 1.0`.
pub fn exactly_equals(heap: &Heap, a: Term, b: Term) -> bool {
    if is_number(heap, a) && is_number(heap, b) && is_float(heap, a) != is_float(heap, b) {
        return false;
    }
    equals(heap, a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_integer_round_trip() {
        for v in [0i64, 1, -1, 42, MAX_SMALL, MIN_SMALL] {
            let t = Term::small(v);
            assert!(t.is_small());
            assert_eq!(t.small_value(), v);
        }
    }

    #[test]
    fn immediate_tags_are_disjoint() {
        let small = Term::small(3);
        let atom = Term::atom(3);
        let pid = Term::pid(3);
        assert!(!small.is_atom() && !small.is_pid() && !small.is_list());
        assert!(!atom.is_small() && !atom.is_pid() && !atom.is_nil());
        assert!(!pid.is_small() && !pid.is_atom());
        assert!(Term::NIL.is_list() && !Term::NIL.is_list_cell());
        assert!(!Term::INVALID.is_atom());
    }

    #[test]
    fn catch_labels_round_trip() {
        let t = Term::catch_label(7, 12345);
        assert!(t.is_catch_label());
        assert!(!t.is_atom());
        assert_eq!(t.catch_label_parts(), (7, 12345));
    }

    #[test]
    fn cp_round_trip() {
        let cp = Term::cp(3, 4040);
        assert_eq!(Term::cp_parts(cp), (3, 4040));
        assert!(Term::from_raw(cp).is_cp_word());
    }
}
