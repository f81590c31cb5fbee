//! Per-process heap, stack and copying collector.
//!
//! One contiguous region per process: the heap grows up from index 0, the
//! stack grows down from the top, and allocation fails over to the
//! collector when the free band between them is too small. A second,
//! append-only fragment space holds values materialized while decoded
//! operands are live (literals, boxed integer operands); fragments never
//! move until the next collection, which merges the survivors into the
//! new region.
//!
//! Callers must treat every previously decoded [`Term`] as invalid after
//! any call that may collect.

use crate::term::{boxed, Term, FRAG_BASE};

/// Default region size of a fresh process, in words.
pub const DEFAULT_REGION_WORDS: usize = 8;

/// Free-space factor above which `test_heap` shrinks the region.
pub const SHRINK_THRESHOLD_COEFF: usize = 32;

/// Fragment words that force a merge at the next collection point.
pub const FRAGMENT_MERGE_LIMIT: usize = 512;

const MOVED: u64 = 0x6B;

/// Requested size exceeded the configured heap maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("heap limit exceeded")]
pub struct OutOfMemory;

/// A process's heap/stack region plus fragment space.
#[derive(Debug)]
pub struct Heap {
    region: Vec<Term>,
    heap_ptr: usize,
    /// Stack pointer: index of the lowest live stack slot.
    e: usize,
    fragments: Vec<Term>,
    max_words: Option<usize>,
}

impl Heap {
    /// Fresh region of [`DEFAULT_REGION_WORDS`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REGION_WORDS)
    }

    /// Fresh region of `words` words.
    pub fn with_capacity(words: usize) -> Self {
        Heap {
            region: vec![Term::NIL; words],
            heap_ptr: 0,
            e: words,
            fragments: Vec::new(),
            max_words: None,
        }
    }

    /// Caps the total region size; exceeding it makes collection fail.
    pub fn set_max_words(&mut self, max: Option<usize>) {
        self.max_words = max;
    }

    /// Free words between heap top and stack bottom.
    pub fn free(&self) -> usize {
        self.e - self.heap_ptr
    }

    /// Words currently allocated on the heap side.
    pub fn heap_used(&self) -> usize {
        self.heap_ptr
    }

    /// Total region size in words.
    pub fn region_words(&self) -> usize {
        self.region.len()
    }

    // ------------------------------------------------------------------
    // Word access
    // ------------------------------------------------------------------

    /// Words currently parked in the fragment space.
    pub(crate) fn fragments_len(&self) -> usize {
        self.fragments.len()
    }

    /// Whether a heap index addresses an allocated word. Diagnostics
    /// use this to avoid chasing junk from uninitialized stack slots.
    pub(crate) fn index_in_bounds(&self, index: usize) -> bool {
        if index >= FRAG_BASE {
            index - FRAG_BASE < self.fragments.len()
        } else {
            index < self.heap_ptr
        }
    }

    #[inline]
    pub(crate) fn load(&self, index: usize) -> Term {
        if index >= FRAG_BASE {
            self.fragments[index - FRAG_BASE]
        } else {
            self.region[index]
        }
    }

    #[inline]
    pub(crate) fn store(&mut self, index: usize, value: Term) {
        if index >= FRAG_BASE {
            self.fragments[index - FRAG_BASE] = value;
        } else {
            self.region[index] = value;
        }
    }

    /// Allocates `words` uninitialized heap words. The caller must have
    /// ensured the space and fills the header before the next collection
    /// point.
    pub(crate) fn alloc(&mut self, words: usize) -> usize {
        assert!(
            self.free() >= words,
            "heap allocation of {words} words without headroom"
        );
        let at = self.heap_ptr;
        self.heap_ptr += words;
        at
    }

    /// Allocates `words` in the fragment space. Never collects.
    pub(crate) fn alloc_fragment(&mut self, words: usize) -> usize {
        let at = self.fragments.len();
        self.fragments.extend(core::iter::repeat(Term::NIL).take(words));
        FRAG_BASE + at
    }

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------

    /// Current stack pointer.
    pub(crate) fn stack_pointer(&self) -> usize {
        self.e
    }

    /// Live stack depth in words.
    pub(crate) fn stack_len(&self) -> usize {
        self.region.len() - self.e
    }

    /// y-register read.
    #[inline]
    pub(crate) fn y_get(&self, slot: usize) -> Term {
        self.region[self.e + slot]
    }

    /// y-register write.
    #[inline]
    pub(crate) fn y_set(&mut self, slot: usize, value: Term) {
        self.region[self.e + slot] = value;
    }

    /// Pushes a frame of `slots` y-registers plus the saved CP above
    /// them. Slots are nil-initialized when `zero`.
    pub(crate) fn frame_push(&mut self, slots: usize, cp: u64, zero: bool) {
        debug_assert!(self.free() >= slots + 1);
        self.e -= slots + 1;
        if zero {
            for slot in 0..slots {
                self.region[self.e + slot] = Term::NIL;
            }
        }
        self.region[self.e + slots] = Term::from_raw(cp);
    }

    /// Pops `slots` y-registers and returns the restored CP.
    pub(crate) fn frame_pop(&mut self, slots: usize) -> u64 {
        let cp = self.region[self.e + slots].raw();
        self.e += slots + 1;
        cp
    }

    /// Drops the lowest `n` y-registers, keeping the CP in place.
    pub(crate) fn frame_trim(&mut self, n: usize) {
        self.e += n;
    }

    /// Raw stack words from the stack pointer to the stack base, lowest
    /// first. Used by the unwinder and the crash dump.
    pub(crate) fn stack_words(&self) -> &[Term] {
        &self.region[self.e..]
    }

    /// Unwinds the stack pointer to `target` (an index previously
    /// obtained from [`Heap::stack_pointer`] arithmetic).
    pub(crate) fn unwind_to(&mut self, target: usize) {
        debug_assert!(target >= self.e && target <= self.region.len());
        self.e = target;
    }

    // ------------------------------------------------------------------
    // Constructors and accessors
    // ------------------------------------------------------------------

    /// Builds an integer term, boxing it when it does not fit the
    /// immediate range. Requires 2 words of headroom in the worst case.
    pub fn make_int(&mut self, value: i64) -> Term {
        if (crate::term::MIN_SMALL..=crate::term::MAX_SMALL).contains(&value) {
            Term::small(value)
        } else {
            let at = self.alloc(2);
            self.region[at] = Term::from_raw(1 << 6 | boxed::INT);
            self.region[at + 1] = Term::from_raw(value as u64);
            Term::boxed_at(at)
        }
    }

    /// As [`Heap::make_int`], but boxing into the fragment space so the
    /// call can never move live terms.
    pub(crate) fn make_int_fragment(&mut self, value: i64) -> Term {
        if (crate::term::MIN_SMALL..=crate::term::MAX_SMALL).contains(&value) {
            Term::small(value)
        } else {
            let at = self.alloc_fragment(2);
            self.store(at, Term::from_raw(1 << 6 | boxed::INT));
            self.store(at + 1, Term::from_raw(value as u64));
            Term::boxed_at(at)
        }
    }

    /// Header kind of a boxed term.
    #[inline]
    pub(crate) fn boxed_kind(&self, t: Term) -> u64 {
        self.load(t.heap_index()).raw() & 0x3F
    }

    #[inline]
    fn boxed_words(&self, t: Term) -> usize {
        (self.load(t.heap_index()).raw() >> 6) as usize
    }

    /// Any-integer (immediate or boxed) predicate.
    pub fn is_any_int(&self, t: Term) -> bool {
        t.is_small() || (t.is_boxed() && self.boxed_kind(t) == boxed::INT)
    }

    /// Number predicate (integer or float).
    pub fn is_number(&self, t: Term) -> bool {
        t.is_small() || (t.is_boxed() && matches!(self.boxed_kind(t), boxed::INT | boxed::FLOAT))
    }

    /// Value of an immediate or boxed integer.
    pub fn any_int_value(&self, t: Term) -> i64 {
        if t.is_small() {
            t.small_value()
        } else {
            debug_assert_eq!(self.boxed_kind(t), boxed::INT);
            self.load(t.heap_index() + 1).raw() as i64
        }
    }

    /// A number as `f64`, promoting integers.
    pub fn number_as_f64(&self, t: Term) -> f64 {
        if t.is_small() {
            t.small_value() as f64
        } else if self.boxed_kind(t) == boxed::FLOAT {
            f64::from_bits(self.load(t.heap_index() + 1).raw())
        } else {
            self.any_int_value(t) as f64
        }
    }

    /// Boxed float. Requires 2 words.
    pub fn alloc_float(&mut self, value: f64) -> Term {
        let at = self.alloc(2);
        self.region[at] = Term::from_raw(1 << 6 | boxed::FLOAT);
        self.region[at + 1] = Term::from_raw(value.to_bits());
        Term::boxed_at(at)
    }

    /// Float predicate.
    pub fn is_float(&self, t: Term) -> bool {
        t.is_boxed() && self.boxed_kind(t) == boxed::FLOAT
    }

    /// Float payload.
    pub fn float_value(&self, t: Term) -> f64 {
        debug_assert!(self.is_float(t));
        f64::from_bits(self.load(t.heap_index() + 1).raw())
    }

    /// Boxed reference. Requires 2 words.
    pub fn alloc_ref(&mut self, ticks: u64) -> Term {
        let at = self.alloc(2);
        self.region[at] = Term::from_raw(1 << 6 | boxed::REF);
        self.region[at + 1] = Term::from_raw(ticks);
        Term::boxed_at(at)
    }

    /// Reference predicate.
    pub fn is_ref(&self, t: Term) -> bool {
        t.is_boxed() && self.boxed_kind(t) == boxed::REF
    }

    /// Reference payload.
    pub fn ref_ticks(&self, t: Term) -> u64 {
        debug_assert!(self.is_ref(t));
        self.load(t.heap_index() + 1).raw()
    }

    /// Cons cell. Requires 2 words.
    pub fn cons(&mut self, head: Term, tail: Term) -> Term {
        let at = self.alloc(2);
        self.region[at] = head;
        self.region[at + 1] = tail;
        Term::list_at(at)
    }

    /// Head of a non-empty list.
    pub fn list_head(&self, t: Term) -> Term {
        debug_assert!(t.is_list_cell());
        self.load(t.heap_index())
    }

    /// Tail of a non-empty list.
    pub fn list_tail(&self, t: Term) -> Term {
        debug_assert!(t.is_list_cell());
        self.load(t.heap_index() + 1)
    }

    /// Uninitialized tuple of `arity` elements. Requires `arity + 1`
    /// words; elements must be filled before the next collection point.
    pub fn alloc_tuple(&mut self, arity: usize) -> Term {
        let at = self.alloc(arity + 1);
        self.region[at] = Term::from_raw((arity as u64) << 6 | boxed::TUPLE);
        for slot in 1..=arity {
            self.region[at + slot] = Term::NIL;
        }
        Term::boxed_at(at)
    }

    /// Tuple predicate.
    pub fn is_tuple(&self, t: Term) -> bool {
        t.is_boxed() && self.boxed_kind(t) == boxed::TUPLE
    }

    /// Number of elements.
    pub fn tuple_arity(&self, t: Term) -> usize {
        debug_assert!(self.is_tuple(t));
        self.boxed_words(t)
    }

    /// Element read, 0-based.
    pub fn tuple_element(&self, t: Term, index: usize) -> Term {
        debug_assert!(index < self.tuple_arity(t));
        self.load(t.heap_index() + 1 + index)
    }

    /// Element write, 0-based.
    pub fn put_tuple_element(&mut self, t: Term, index: usize, value: Term) {
        debug_assert!(index < self.tuple_arity(t));
        self.store(t.heap_index() + 1 + index, value);
    }

    // ------------------------------------------------------------------
    // Binaries
    // ------------------------------------------------------------------

    /// Words needed for a heap binary of `len` bytes, header included.
    pub const fn binary_words(len: usize) -> usize {
        2 + len.div_ceil(8)
    }

    /// Words needed for the result of taking a `len`-byte view.
    pub const fn sub_binary_words(len: usize) -> usize {
        if len <= SUB_BINARY_MIN {
            Self::binary_words(len)
        } else {
            4
        }
    }

    /// Zero-filled heap binary of `len` bytes.
    pub fn alloc_binary(&mut self, len: usize) -> Term {
        let words = Self::binary_words(len);
        let at = self.alloc(words);
        self.region[at] = Term::from_raw(((words - 1) as u64) << 6 | boxed::HEAP_BIN);
        self.region[at + 1] = Term::from_raw(len as u64);
        for slot in 2..words {
            self.region[at + slot] = Term::from_raw(0);
        }
        Term::boxed_at(at)
    }

    /// Binary predicate (heap binary or sub-binary).
    pub fn is_binary(&self, t: Term) -> bool {
        t.is_boxed() && matches!(self.boxed_kind(t), boxed::HEAP_BIN | boxed::SUB_BIN)
    }

    /// Byte length of a binary.
    pub fn binary_size(&self, t: Term) -> usize {
        match self.boxed_kind(t) {
            boxed::HEAP_BIN => self.load(t.heap_index() + 1).raw() as usize,
            boxed::SUB_BIN => self.load(t.heap_index() + 1).small_value() as usize,
            _ => unreachable!("not a binary"),
        }
    }

    /// Resolves a binary to its backing heap binary and byte offset.
    fn binary_base(&self, t: Term) -> (usize, usize) {
        match self.boxed_kind(t) {
            boxed::HEAP_BIN => (t.heap_index(), 0),
            boxed::SUB_BIN => {
                let off = self.load(t.heap_index() + 2).small_value() as usize;
                let parent = self.load(t.heap_index() + 3);
                let (base, parent_off) = self.binary_base(parent);
                (base, parent_off + off)
            }
            _ => unreachable!("not a binary"),
        }
    }

    /// Single byte of a binary.
    pub fn binary_byte(&self, t: Term, index: usize) -> u8 {
        debug_assert!(index < self.binary_size(t));
        let (base, off) = self.binary_base(t);
        let byte = off + index;
        let word = self.load(base + 2 + byte / 8).raw();
        (word >> (8 * (byte % 8))) as u8
    }

    /// Copies a binary's bytes out.
    pub fn binary_bytes(&self, t: Term) -> Vec<u8> {
        let len = self.binary_size(t);
        let (base, off) = self.binary_base(t);
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let byte = off + i;
            let word = self.load(base + 2 + byte / 8).raw();
            out.push((word >> (8 * (byte % 8))) as u8);
        }
        out
    }

    /// Writes bytes into a binary at a byte offset.
    pub fn binary_write(&mut self, t: Term, at: usize, bytes: &[u8]) {
        debug_assert!(at + bytes.len() <= self.binary_size(t));
        let (base, off) = self.binary_base(t);
        for (i, b) in bytes.iter().enumerate() {
            let byte = off + at + i;
            let slot = base + 2 + byte / 8;
            let shift = 8 * (byte % 8);
            let word = self.load(slot).raw() & !(0xFFu64 << shift);
            self.store(slot, Term::from_raw(word | (u64::from(*b) << shift)));
        }
    }

    /// A `len`-byte view of `parent` starting at `start`. Short views
    /// are copied into a fresh heap binary instead. Requires
    /// [`Heap::sub_binary_words`] of headroom.
    pub fn maybe_sub_binary(&mut self, parent: Term, start: usize, len: usize) -> Term {
        debug_assert!(start + len <= self.binary_size(parent));
        if len <= SUB_BINARY_MIN {
            let out = self.alloc_binary(len);
            for i in 0..len {
                let b = self.binary_byte(parent, start + i);
                self.binary_write(out, i, &[b]);
            }
            return out;
        }
        // Point at the root binary so chains of views stay flat.
        let (root_start, root) = match self.boxed_kind(parent) {
            boxed::SUB_BIN => {
                let off = self.load(parent.heap_index() + 2).small_value() as usize;
                let up = self.load(parent.heap_index() + 3);
                (off + start, up)
            }
            _ => (start, parent),
        };
        let at = self.alloc(4);
        self.region[at] = Term::from_raw(3 << 6 | boxed::SUB_BIN);
        self.region[at + 1] = Term::small(len as i64);
        self.region[at + 2] = Term::small(root_start as i64);
        self.region[at + 3] = root;
        Term::boxed_at(at)
    }

    // ------------------------------------------------------------------
    // Match states
    // ------------------------------------------------------------------

    /// Words needed for a match state with `slots` save slots.
    pub const fn match_state_words(slots: usize) -> usize {
        4 + slots
    }

    /// Wraps a binary (or re-wraps a match state) with `slots` save
    /// slots. Requires [`Heap::match_state_words`] of headroom.
    pub fn alloc_match_state(&mut self, src: Term, slots: usize) -> Term {
        let (bin, offset) = if self.is_match_state(src) {
            (self.match_state_binary(src), self.match_state_offset(src))
        } else {
            (src, 0)
        };
        let at = self.alloc(4 + slots);
        self.region[at] = Term::from_raw(((3 + slots) as u64) << 6 | boxed::MATCH_STATE);
        self.region[at + 1] = bin;
        self.region[at + 2] = Term::small(offset as i64);
        self.region[at + 3] = Term::small(offset as i64); // start save slot
        for slot in 0..slots {
            self.region[at + 4 + slot] = Term::small(0);
        }
        Term::boxed_at(at)
    }

    /// Match-state predicate.
    pub fn is_match_state(&self, t: Term) -> bool {
        t.is_boxed() && self.boxed_kind(t) == boxed::MATCH_STATE
    }

    /// The matched binary.
    pub fn match_state_binary(&self, t: Term) -> Term {
        debug_assert!(self.is_match_state(t));
        self.load(t.heap_index() + 1)
    }

    /// Current bit offset.
    pub fn match_state_offset(&self, t: Term) -> usize {
        debug_assert!(self.is_match_state(t));
        self.load(t.heap_index() + 2).small_value() as usize
    }

    /// Sets the current bit offset.
    pub fn set_match_state_offset(&mut self, t: Term, offset: usize) {
        debug_assert!(self.is_match_state(t));
        self.store(t.heap_index() + 2, Term::small(offset as i64));
    }

    /// Saves the current offset into a slot, or the start slot.
    pub fn match_state_save(&mut self, t: Term, slot: Option<usize>) {
        let offset = self.load(t.heap_index() + 2);
        let at = match slot {
            Some(n) => t.heap_index() + 4 + n,
            None => t.heap_index() + 3,
        };
        self.store(at, offset);
    }

    /// Restores the offset from a slot, or the start slot.
    pub fn match_state_restore(&mut self, t: Term, slot: Option<usize>) {
        let at = match slot {
            Some(n) => t.heap_index() + 4 + n,
            None => t.heap_index() + 3,
        };
        let offset = self.load(at);
        self.store(t.heap_index() + 2, offset);
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    /// Words needed for a closure with `n_freeze` captured values.
    pub const fn fun_words(n_freeze: usize) -> usize {
        3 + n_freeze
    }

    /// Closure over a module-local fun-table entry. The capture values
    /// are filled by the caller. Requires [`Heap::fun_words`].
    pub fn alloc_fun(&mut self, module_index: usize, fun_index: usize, freeze: &[Term]) -> Term {
        let at = self.alloc(3 + freeze.len());
        self.region[at] = Term::from_raw(((2 + freeze.len()) as u64) << 6 | boxed::FUN);
        self.region[at + 1] = Term::small(module_index as i64);
        self.region[at + 2] = Term::small(fun_index as i64);
        for (slot, value) in freeze.iter().enumerate() {
            self.region[at + 3 + slot] = *value;
        }
        Term::boxed_at(at)
    }

    /// Closure naming an exported function `module:function/arity`.
    pub fn alloc_named_fun(&mut self, module_atom: u32, function_atom: u32, arity: usize) -> Term {
        let at = self.alloc(4);
        self.region[at] = Term::from_raw(3 << 6 | boxed::FUN);
        self.region[at + 1] = Term::atom(module_atom);
        self.region[at + 2] = Term::atom(function_atom);
        self.region[at + 3] = Term::small(arity as i64);
        Term::boxed_at(at)
    }

    /// Function predicate.
    pub fn is_function(&self, t: Term) -> bool {
        t.is_boxed() && self.boxed_kind(t) == boxed::FUN
    }

    /// The shape of a closure.
    pub(crate) fn fun_shape(&self, t: Term) -> FunShape {
        debug_assert!(self.is_function(t));
        let at = t.heap_index();
        let second = self.load(at + 2);
        if second.is_atom() {
            FunShape::Named {
                module_atom: self.load(at + 1).atom_id(),
                function_atom: second.atom_id(),
                arity: self.load(at + 3).small_value() as usize,
            }
        } else {
            FunShape::Index {
                module_index: self.load(at + 1).small_value() as usize,
                fun_index: second.small_value() as usize,
            }
        }
    }

    /// Captured value of an index closure.
    pub(crate) fn fun_freeze(&self, t: Term, n: usize) -> Term {
        self.load(t.heap_index() + 3 + n)
    }

    // ------------------------------------------------------------------
    // Maps
    // ------------------------------------------------------------------

    /// Words needed for a map of `size` entries, including a fresh keys
    /// tuple unless it is shared with an existing map.
    pub const fn map_words(size: usize, shared_keys: bool) -> usize {
        if shared_keys {
            2 + size
        } else {
            (2 + size) + (1 + size)
        }
    }

    /// Map of `size` entries. With `shared_keys` the existing keys tuple
    /// is reused; otherwise a fresh keys tuple is allocated. Entries are
    /// filled with [`Heap::set_map_entry`].
    pub fn alloc_map(&mut self, size: usize, shared_keys: Option<Term>) -> Term {
        let keys = match shared_keys {
            Some(keys) => keys,
            None => self.alloc_tuple(size),
        };
        let at = self.alloc(2 + size);
        self.region[at] = Term::from_raw(((1 + size) as u64) << 6 | boxed::MAP);
        self.region[at + 1] = keys;
        for slot in 0..size {
            self.region[at + 2 + slot] = Term::NIL;
        }
        Term::boxed_at(at)
    }

    /// Map predicate.
    pub fn is_map(&self, t: Term) -> bool {
        t.is_boxed() && self.boxed_kind(t) == boxed::MAP
    }

    /// Number of entries.
    pub fn map_size(&self, t: Term) -> usize {
        debug_assert!(self.is_map(t));
        self.boxed_words(t) - 1
    }

    /// The keys tuple.
    pub fn map_keys(&self, t: Term) -> Term {
        debug_assert!(self.is_map(t));
        self.load(t.heap_index() + 1)
    }

    /// Key at a position.
    pub fn map_key(&self, t: Term, index: usize) -> Term {
        let keys = self.map_keys(t);
        self.tuple_element(keys, index)
    }

    /// Value at a position.
    pub fn map_value(&self, t: Term, index: usize) -> Term {
        debug_assert!(index < self.map_size(t));
        self.load(t.heap_index() + 2 + index)
    }

    /// Writes the entry at a position. Updates the key only when the
    /// keys tuple is owned by this map.
    pub fn set_map_entry(&mut self, t: Term, index: usize, key: Term, value: Term) {
        let keys = self.map_keys(t);
        self.put_tuple_element(keys, index, key);
        self.store(t.heap_index() + 2 + index, value);
    }

    /// Position of a key under structural equality, if present.
    pub fn find_map_pos(&self, t: Term, key: Term) -> Option<usize> {
        (0..self.map_size(t)).find(|i| crate::term::equals(self, self.map_key(t, *i), key))
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Guarantees `need` words of free heap space, collecting if the
    /// free band is too small. Every term held outside the root set is
    /// invalid afterwards.
    pub fn ensure_free(&mut self, need: usize, roots: &mut [&mut Term]) -> Result<(), OutOfMemory> {
        if self.free() >= need {
            return Ok(());
        }
        self.collect(need, roots)
    }

    /// Runs the copying collector, leaving at least `need` free words.
    pub fn collect(&mut self, need: usize, roots: &mut [&mut Term]) -> Result<(), OutOfMemory> {
        let stack_len = self.stack_len();
        let e = self.e;
        let mut from = FromSpace {
            region: core::mem::take(&mut self.region),
            fragments: core::mem::take(&mut self.fragments),
        };
        let mut new_heap: Vec<Term> = Vec::with_capacity(self.heap_ptr + need);

        for root in roots.iter_mut() {
            **root = evacuate(&mut from, &mut new_heap, **root);
        }
        let mut stack: Vec<Term> = from.region[e..].to_vec();
        for word in stack.iter_mut() {
            *word = evacuate(&mut from, &mut new_heap, *word);
        }

        // Cheney scan of the copied objects.
        let mut scan = 0;
        while scan < new_heap.len() {
            let word = new_heap[scan];
            if word.raw() & 0x3 == 0 {
                let kind = word.raw() & 0x3F;
                let words = (word.raw() >> 6) as usize;
                let all_terms = matches!(
                    kind,
                    boxed::TUPLE | boxed::MAP | boxed::FUN | boxed::SUB_BIN | boxed::MATCH_STATE
                );
                if all_terms {
                    for slot in scan + 1..=scan + words {
                        let value = new_heap[slot];
                        new_heap[slot] = evacuate(&mut from, &mut new_heap, value);
                    }
                }
                scan += 1 + words;
            } else {
                let head = new_heap[scan];
                new_heap[scan] = evacuate(&mut from, &mut new_heap, head);
                let tail = new_heap[scan + 1];
                new_heap[scan + 1] = evacuate(&mut from, &mut new_heap, tail);
                scan += 2;
            }
        }

        let live = new_heap.len();
        // Leave headroom proportional to the survivors so busy heaps do
        // not collect on every allocation.
        let final_words = live + need + live / 2 + stack_len + 8;
        self.heap_ptr = live;
        self.region = new_heap;
        self.region.resize(final_words, Term::NIL);
        self.e = final_words - stack_len;
        self.region[self.e..].copy_from_slice(&stack);

        match self.max_words {
            Some(max) if final_words > max => Err(OutOfMemory),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Cross-heap copy
    // ------------------------------------------------------------------

    /// Words a deep copy of `t` will allocate in the destination heap.
    /// Shared substructure is counted once per reference, matching the
    /// copy itself.
    pub fn tree_size(&self, t: Term) -> usize {
        if !(t.is_list_cell() || t.is_boxed()) {
            return 0;
        }
        if t.is_list_cell() {
            let mut total = 0;
            let mut cursor = t;
            while cursor.is_list_cell() {
                total += 2 + self.tree_size(self.list_head(cursor));
                cursor = self.list_tail(cursor);
            }
            return total + self.tree_size(cursor);
        }
        match self.boxed_kind(t) {
            boxed::TUPLE => {
                let arity = self.tuple_arity(t);
                (0..arity).map(|i| self.tree_size(self.tuple_element(t, i))).sum::<usize>() + arity + 1
            }
            boxed::INT | boxed::FLOAT | boxed::REF => 2,
            boxed::HEAP_BIN | boxed::SUB_BIN => Self::binary_words(self.binary_size(t)),
            boxed::MATCH_STATE => {
                self.tree_size(self.match_state_binary(t)) + self.boxed_words(t) + 1
            }
            boxed::FUN => {
                let words = self.boxed_words(t);
                let mut total = words + 1;
                for slot in 0..words.saturating_sub(2) {
                    total += self.tree_size(self.fun_freeze(t, slot));
                }
                total
            }
            boxed::MAP => {
                let size = self.map_size(t);
                let mut total = Self::map_words(size, false);
                for i in 0..size {
                    total += self.tree_size(self.map_key(t, i));
                    total += self.tree_size(self.map_value(t, i));
                }
                total
            }
            _ => 0,
        }
    }

    /// Deep-copies `t` from `src` into this heap. Call
    /// [`Heap::ensure_free`] for [`Heap::tree_size`] words first. With
    /// `src` absent the term is copied within this heap.
    pub fn copy_tree_from(&mut self, src: Option<&Heap>, t: Term) -> Term {
        if !(t.is_list_cell() || t.is_boxed()) {
            return t;
        }

        if t.is_list_cell() {
            let mut heads = Vec::new();
            let mut cursor = t;
            loop {
                let (head, tail) = {
                    let reader = src.unwrap_or(self);
                    (reader.list_head(cursor), reader.list_tail(cursor))
                };
                heads.push(self.copy_tree_from(src, head));
                if tail.is_list_cell() {
                    cursor = tail;
                } else {
                    cursor = tail;
                    break;
                }
            }
            let mut list = self.copy_tree_from(src, cursor);
            for head in heads.into_iter().rev() {
                list = self.cons(head, list);
            }
            return list;
        }

        let kind = src.unwrap_or(self).boxed_kind(t);
        match kind {
            boxed::TUPLE => {
                let arity = src.unwrap_or(self).tuple_arity(t);
                let mut elements = Vec::with_capacity(arity);
                for i in 0..arity {
                    let e = src.unwrap_or(self).tuple_element(t, i);
                    elements.push(self.copy_tree_from(src, e));
                }
                let out = self.alloc_tuple(arity);
                for (i, e) in elements.into_iter().enumerate() {
                    self.put_tuple_element(out, i, e);
                }
                out
            }
            boxed::INT => {
                let v = src.unwrap_or(self).any_int_value(t);
                self.make_int(v)
            }
            boxed::FLOAT => {
                let v = src.unwrap_or(self).float_value(t);
                self.alloc_float(v)
            }
            boxed::REF => {
                let ticks = src.unwrap_or(self).ref_ticks(t);
                self.alloc_ref(ticks)
            }
            boxed::HEAP_BIN | boxed::SUB_BIN => {
                // Views flatten on copy; the parent stays behind.
                let bytes = src.unwrap_or(self).binary_bytes(t);
                let out = self.alloc_binary(bytes.len());
                self.binary_write(out, 0, &bytes);
                out
            }
            boxed::MATCH_STATE => {
                let reader = src.unwrap_or(self);
                let offset = reader.match_state_offset(t);
                let slots = reader.boxed_words(t) - 3;
                let bin = reader.match_state_binary(t);
                let bin = self.copy_tree_from(src, bin);
                let out = self.alloc_match_state(bin, slots);
                self.set_match_state_offset(out, offset);
                out
            }
            boxed::FUN => {
                let words = src.unwrap_or(self).boxed_words(t);
                let mut copied = Vec::with_capacity(words);
                for slot in 0..words {
                    let w = src.unwrap_or(self).load(t.heap_index() + 1 + slot);
                    copied.push(w);
                }
                // Re-copy any captured heap values.
                for w in copied.iter_mut().skip(2) {
                    *w = self.copy_tree_from(src, *w);
                }
                let at = self.alloc(words + 1);
                self.region[at] = Term::from_raw((words as u64) << 6 | boxed::FUN);
                for (slot, w) in copied.into_iter().enumerate() {
                    self.region[at + 1 + slot] = w;
                }
                Term::boxed_at(at)
            }
            boxed::MAP => {
                let size = src.unwrap_or(self).map_size(t);
                let mut entries = Vec::with_capacity(size);
                for i in 0..size {
                    let reader = src.unwrap_or(self);
                    let (k, v) = (reader.map_key(t, i), reader.map_value(t, i));
                    let k = self.copy_tree_from(src, k);
                    let v = self.copy_tree_from(src, v);
                    entries.push((k, v));
                }
                let out = self.alloc_map(size, None);
                for (i, (k, v)) in entries.into_iter().enumerate() {
                    self.set_map_entry(out, i, k, v);
                }
                out
            }
            _ => Term::INVALID,
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Views shorter than this are copied, not aliased.
pub const SUB_BINARY_MIN: usize = 16;

/// The shape of a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunShape {
    /// Closure over a fun-table entry of its defining module.
    Index {
        /// Registry index of the defining module.
        module_index: usize,
        /// Fun-table index.
        fun_index: usize,
    },
    /// Reference to an exported function.
    Named {
        /// Module atom.
        module_atom: u32,
        /// Function atom.
        function_atom: u32,
        /// Arity.
        arity: usize,
    },
}

struct FromSpace {
    region: Vec<Term>,
    fragments: Vec<Term>,
}

impl FromSpace {
    fn get(&self, index: usize) -> Term {
        if index >= FRAG_BASE {
            self.fragments[index - FRAG_BASE]
        } else {
            self.region[index]
        }
    }

    fn set(&mut self, index: usize, value: Term) {
        if index >= FRAG_BASE {
            self.fragments[index - FRAG_BASE] = value;
        } else {
            self.region[index] = value;
        }
    }
}

fn evacuate(from: &mut FromSpace, new: &mut Vec<Term>, t: Term) -> Term {
    if !(t.is_list_cell() || t.is_boxed()) {
        return t;
    }
    let idx = t.heap_index();
    let first = from.get(idx);
    if first.raw() == MOVED {
        return from.get(idx + 1);
    }

    let new_idx = new.len();
    let forwarded = if t.is_list_cell() {
        new.push(from.get(idx));
        new.push(from.get(idx + 1));
        Term::list_at(new_idx)
    } else {
        let words = (first.raw() >> 6) as usize;
        for slot in 0..=words {
            new.push(from.get(idx + slot));
        }
        Term::boxed_at(new_idx)
    };
    from.set(idx, Term::from_raw(MOVED));
    from.set(idx + 1, forwarded);
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_all(heap: &mut Heap, roots: &mut [&mut Term]) {
        heap.collect(0, roots).expect("collects");
    }

    #[test]
    fn allocates_and_reads_back() {
        let mut heap = Heap::with_capacity(64);
        let t = heap.alloc_tuple(2);
        heap.put_tuple_element(t, 0, Term::small(1));
        heap.put_tuple_element(t, 1, Term::atom(3));
        assert_eq!(heap.tuple_arity(t), 2);
        assert_eq!(heap.tuple_element(t, 0), Term::small(1));
        assert_eq!(heap.tuple_element(t, 1), Term::atom(3));
    }

    #[test]
    fn collection_preserves_roots_and_drops_garbage() {
        let mut heap = Heap::with_capacity(256);
        let garbage = heap.alloc_tuple(10);
        let _ = garbage;
        let list = {
            let one = heap.make_int(1);
            let tail = heap.cons(one, Term::NIL);
            heap.cons(Term::small(0), tail)
        };
        let mut root = list;
        collect_all(&mut heap, &mut [&mut root]);
        assert!(heap.heap_used() < 10);
        assert_eq!(heap.list_head(root), Term::small(0));
        let tail = heap.list_tail(root);
        assert_eq!(heap.list_head(tail), Term::small(1));
        assert_eq!(heap.list_tail(tail), Term::NIL);
    }

    #[test]
    fn collection_preserves_sharing() {
        let mut heap = Heap::with_capacity(256);
        let shared = heap.alloc_tuple(1);
        heap.put_tuple_element(shared, 0, Term::small(9));
        let holder = heap.alloc_tuple(2);
        heap.put_tuple_element(holder, 0, shared);
        heap.put_tuple_element(holder, 1, shared);
        let mut root = holder;
        collect_all(&mut heap, &mut [&mut root]);
        assert_eq!(heap.tuple_element(root, 0), heap.tuple_element(root, 1));
    }

    #[test]
    fn fragments_merge_into_the_heap() {
        let mut heap = Heap::with_capacity(64);
        let boxed_int = heap.make_int_fragment(i64::MAX);
        assert!(boxed_int.heap_index() >= FRAG_BASE);
        let mut root = boxed_int;
        collect_all(&mut heap, &mut [&mut root]);
        assert!(root.heap_index() < FRAG_BASE);
        assert_eq!(heap.any_int_value(root), i64::MAX);
    }

    #[test]
    fn stack_survives_collection() {
        let mut heap = Heap::with_capacity(64);
        heap.frame_push(2, Term::cp(1, 40), true);
        let value = heap.alloc_tuple(1);
        heap.put_tuple_element(value, 0, Term::small(5));
        heap.y_set(0, value);
        heap.collect(16, &mut []).expect("collects");
        let restored = heap.y_get(0);
        assert_eq!(heap.tuple_element(restored, 0), Term::small(5));
        assert_eq!(heap.frame_pop(2), Term::cp(1, 40));
    }

    #[test]
    fn binary_round_trip() {
        let mut heap = Heap::with_capacity(64);
        let bin = heap.alloc_binary(11);
        heap.binary_write(bin, 0, b"hello world");
        assert_eq!(heap.binary_size(bin), 11);
        assert_eq!(heap.binary_bytes(bin), b"hello world");
        assert_eq!(heap.binary_byte(bin, 4), b'o');
    }

    #[test]
    fn long_views_alias_and_short_views_copy() {
        let mut heap = Heap::with_capacity(128);
        let bin = heap.alloc_binary(32);
        let data: Vec<u8> = (0..32).collect();
        heap.binary_write(bin, 0, &data);
        let long = heap.maybe_sub_binary(bin, 8, 24);
        assert_eq!(heap.boxed_kind(long), boxed::SUB_BIN);
        assert_eq!(heap.binary_bytes(long), &data[8..]);
        let short = heap.maybe_sub_binary(bin, 0, 4);
        assert_eq!(heap.boxed_kind(short), boxed::HEAP_BIN);
        assert_eq!(heap.binary_bytes(short), &data[..4]);
        let nested = heap.maybe_sub_binary(long, 4, 20);
        assert_eq!(heap.binary_bytes(nested), &data[12..]);
    }

    #[test]
    fn cross_heap_copy_is_deep() {
        let mut src = Heap::with_capacity(128);
        let inner = src.alloc_tuple(1);
        src.put_tuple_element(inner, 0, Term::small(7));
        let cell = src.cons(inner, Term::NIL);

        let mut dst = Heap::with_capacity(128);
        let copied = dst.copy_tree_from(Some(&src), cell);
        let head = dst.list_head(copied);
        assert_eq!(dst.tuple_element(head, 0), Term::small(7));

        // Mutating the source does not affect the copy.
        src.put_tuple_element(inner, 0, Term::small(8));
        assert_eq!(dst.tuple_element(dst.list_head(copied), 0), Term::small(7));
    }

    #[test]
    fn tree_size_covers_the_copy() {
        let mut src = Heap::with_capacity(256);
        let bin = src.alloc_binary(20);
        let tup = src.alloc_tuple(2);
        src.put_tuple_element(tup, 0, bin);
        src.put_tuple_element(tup, 1, Term::small(1));
        let list = src.cons(tup, Term::NIL);

        let size = src.tree_size(list);
        let mut dst = Heap::with_capacity(size + 8);
        let before = dst.free();
        let copied = dst.copy_tree_from(Some(&src), list);
        assert!(before - dst.free() <= size);
        assert_eq!(dst.binary_size(dst.tuple_element(dst.list_head(copied), 0)), 20);
    }

    #[test]
    fn heap_limit_reports_out_of_memory() {
        let mut heap = Heap::with_capacity(16);
        heap.set_max_words(Some(24));
        let mut root = Term::NIL;
        assert_eq!(heap.collect(64, &mut [&mut root]), Err(OutOfMemory));
    }
}
