//! Built-in functions: pure, fixed-arity natives invoked by the `bif*`
//! and `gc_bif*` instructions.
//!
//! A GC-BIF may allocate and therefore receives the caller's live
//! x-register count so a collection only traces live values. Failures
//! are exception values, never Rust panics.

use hashbrown::HashMap;

use crate::atom::{defaults, AtomTable};
use crate::context::Context;
use crate::error::Exception;
use crate::term::Term;

/// What a BIF returns: a term, or a raised exception.
pub type BifResult = Result<Term, Exception>;

/// Arity-0 BIF.
pub type Bif0 = fn(&mut Context) -> BifResult;
/// Arity-1 BIF.
pub type Bif1 = fn(&mut Context, Term) -> BifResult;
/// Arity-2 BIF.
pub type Bif2 = fn(&mut Context, Term, Term) -> BifResult;
/// Arity-1 GC-BIF with a live-register hint.
pub type GcBif1 = fn(&mut Context, usize, Term) -> BifResult;
/// Arity-2 GC-BIF with a live-register hint.
pub type GcBif2 = fn(&mut Context, usize, Term, Term) -> BifResult;

/// A registered BIF, tagged by call shape.
#[derive(Clone, Copy)]
pub enum BifImpl {
    /// Arity 0, cannot allocate.
    Bif0(Bif0),
    /// Arity 1, cannot allocate.
    Bif1(Bif1),
    /// Arity 2, cannot allocate.
    Bif2(Bif2),
    /// Arity 1, may collect.
    GcBif1(GcBif1),
    /// Arity 2, may collect.
    GcBif2(GcBif2),
}

impl core::fmt::Debug for BifImpl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let shape = match self {
            BifImpl::Bif0(_) => "bif/0",
            BifImpl::Bif1(_) => "bif/1",
            BifImpl::Bif2(_) => "bif/2",
            BifImpl::GcBif1(_) => "gc_bif/1",
            BifImpl::GcBif2(_) => "gc_bif/2",
        };
        f.write_str(shape)
    }
}

/// BIF lookup table keyed by `(module, function, arity)` atom ids.
#[derive(Debug, Default)]
pub struct BifRegistry {
    map: HashMap<(u32, u32, u32), BifImpl>,
}

impl BifRegistry {
    /// Registers a BIF.
    pub fn register(&mut self, module: u32, function: u32, arity: u32, imp: BifImpl) {
        self.map.insert((module, function, arity), imp);
    }

    /// Looks a BIF up.
    pub fn get(&self, module: u32, function: u32, arity: u32) -> Option<BifImpl> {
        self.map.get(&(module, function, arity)).copied()
    }
}

/// Registers the `erlang` module BIF set.
pub fn install_defaults(registry: &mut BifRegistry, atoms: &mut AtomTable) {
    let erlang = defaults::ERLANG;
    let mut reg = |name: &str, arity: u32, imp: BifImpl| {
        let f = atoms.insert(name);
        registry.register(erlang, f, arity, imp);
    };
    reg("self", 0, BifImpl::Bif0(bif_self));
    reg("+", 2, BifImpl::GcBif2(bif_add));
    reg("-", 2, BifImpl::GcBif2(bif_sub));
    reg("*", 2, BifImpl::GcBif2(bif_mul));
    reg("div", 2, BifImpl::GcBif2(bif_div));
    reg("rem", 2, BifImpl::GcBif2(bif_rem));
    reg("abs", 1, BifImpl::GcBif1(bif_abs));
    reg("length", 1, BifImpl::GcBif1(bif_length));
    reg("byte_size", 1, BifImpl::GcBif1(bif_byte_size));
    reg("tuple_size", 1, BifImpl::GcBif1(bif_tuple_size));
    reg("map_size", 1, BifImpl::GcBif1(bif_map_size));
    reg("element", 2, BifImpl::Bif2(bif_element));
    reg("hd", 1, BifImpl::Bif1(bif_hd));
    reg("tl", 1, BifImpl::Bif1(bif_tl));
}

enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(ctx: &Context, t: Term) -> Result<Num, Exception> {
    if ctx.heap.is_any_int(t) {
        Ok(Num::Int(ctx.heap.any_int_value(t)))
    } else if ctx.heap.is_float(t) {
        Ok(Num::Float(ctx.heap.float_value(t)))
    } else {
        Err(Exception::error_atom(defaults::BADARITH))
    }
}

/// Boxes an integer result, collecting with the live hint if the value
/// does not fit the immediate range.
fn make_int_result(ctx: &mut Context, live: usize, value: i64) -> BifResult {
    if (crate::term::MIN_SMALL..=crate::term::MAX_SMALL).contains(&value) {
        return Ok(Term::small(value));
    }
    ctx.ensure_free_with_live(live, 2)
        .map_err(|_| Exception::error_atom(defaults::OUT_OF_MEMORY))?;
    Ok(ctx.heap.make_int(value))
}

fn make_float_result(ctx: &mut Context, live: usize, value: f64) -> BifResult {
    ctx.ensure_free_with_live(live, 2)
        .map_err(|_| Exception::error_atom(defaults::OUT_OF_MEMORY))?;
    Ok(ctx.heap.alloc_float(value))
}

fn arith2(
    ctx: &mut Context,
    live: usize,
    a: Term,
    b: Term,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> BifResult {
    let (x, y) = (as_num(ctx, a)?, as_num(ctx, b)?);
    match (x, y) {
        (Num::Int(x), Num::Int(y)) => match int_op(x, y) {
            Some(v) => make_int_result(ctx, live, v),
            None => Err(Exception::error_atom(defaults::OVERFLOW)),
        },
        (x, y) => {
            let (x, y) = (as_f64(x), as_f64(y));
            make_float_result(ctx, live, float_op(x, y))
        }
    }
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::Int(v) => v as f64,
        Num::Float(v) => v,
    }
}

fn bif_self(ctx: &mut Context) -> BifResult {
    Ok(Term::pid(ctx.pid))
}

fn bif_add(ctx: &mut Context, live: usize, a: Term, b: Term) -> BifResult {
    arith2(ctx, live, a, b, i64::checked_add, |x, y| x + y)
}

fn bif_sub(ctx: &mut Context, live: usize, a: Term, b: Term) -> BifResult {
    arith2(ctx, live, a, b, i64::checked_sub, |x, y| x - y)
}

fn bif_mul(ctx: &mut Context, live: usize, a: Term, b: Term) -> BifResult {
    arith2(ctx, live, a, b, i64::checked_mul, |x, y| x * y)
}

fn bif_div(ctx: &mut Context, live: usize, a: Term, b: Term) -> BifResult {
    let (x, y) = (as_num(ctx, a)?, as_num(ctx, b)?);
    match (x, y) {
        (Num::Int(_), Num::Int(0)) => Err(Exception::error_atom(defaults::BADARITH)),
        (Num::Int(x), Num::Int(y)) => match x.checked_div(y) {
            Some(v) => make_int_result(ctx, live, v),
            None => Err(Exception::error_atom(defaults::OVERFLOW)),
        },
        _ => Err(Exception::error_atom(defaults::BADARITH)),
    }
}

fn bif_rem(ctx: &mut Context, live: usize, a: Term, b: Term) -> BifResult {
    let (x, y) = (as_num(ctx, a)?, as_num(ctx, b)?);
    match (x, y) {
        (Num::Int(_), Num::Int(0)) => Err(Exception::error_atom(defaults::BADARITH)),
        (Num::Int(x), Num::Int(y)) => match x.checked_rem(y) {
            Some(v) => make_int_result(ctx, live, v),
            None => Err(Exception::error_atom(defaults::OVERFLOW)),
        },
        _ => Err(Exception::error_atom(defaults::BADARITH)),
    }
}

fn bif_abs(ctx: &mut Context, live: usize, a: Term) -> BifResult {
    match as_num(ctx, a)? {
        Num::Int(v) => match v.checked_abs() {
            Some(v) => make_int_result(ctx, live, v),
            None => Err(Exception::error_atom(defaults::OVERFLOW)),
        },
        Num::Float(v) => make_float_result(ctx, live, v.abs()),
    }
}

fn bif_length(ctx: &mut Context, _live: usize, list: Term) -> BifResult {
    let mut len: i64 = 0;
    let mut cursor = list;
    while cursor.is_list_cell() {
        len += 1;
        cursor = ctx.heap.list_tail(cursor);
    }
    if cursor.is_nil() {
        Ok(Term::small(len))
    } else {
        Err(Exception::error_atom(defaults::BADARG))
    }
}

fn bif_byte_size(ctx: &mut Context, _live: usize, bin: Term) -> BifResult {
    if ctx.heap.is_binary(bin) {
        Ok(Term::small(ctx.heap.binary_size(bin) as i64))
    } else {
        Err(Exception::error_atom(defaults::BADARG))
    }
}

fn bif_tuple_size(ctx: &mut Context, _live: usize, tuple: Term) -> BifResult {
    if ctx.heap.is_tuple(tuple) {
        Ok(Term::small(ctx.heap.tuple_arity(tuple) as i64))
    } else {
        Err(Exception::error_atom(defaults::BADARG))
    }
}

fn bif_map_size(ctx: &mut Context, _live: usize, map: Term) -> BifResult {
    if ctx.heap.is_map(map) {
        Ok(Term::small(ctx.heap.map_size(map) as i64))
    } else {
        Err(Exception::error_atom(defaults::BADARG))
    }
}

fn bif_element(ctx: &mut Context, index: Term, tuple: Term) -> BifResult {
    if !index.is_small() || !ctx.heap.is_tuple(tuple) {
        return Err(Exception::error_atom(defaults::BADARG));
    }
    let n = index.small_value();
    if n < 1 || n as usize > ctx.heap.tuple_arity(tuple) {
        return Err(Exception::error_atom(defaults::BADARG));
    }
    Ok(ctx.heap.tuple_element(tuple, n as usize - 1))
}

fn bif_hd(ctx: &mut Context, list: Term) -> BifResult {
    if list.is_list_cell() {
        Ok(ctx.heap.list_head(list))
    } else {
        Err(Exception::error_atom(defaults::BADARG))
    }
}

fn bif_tl(ctx: &mut Context, list: Term) -> BifResult {
    if list.is_list_cell() {
        Ok(ctx.heap.list_tail(list))
    } else {
        Err(Exception::error_atom(defaults::BADARG))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{MAX_SMALL, MIN_SMALL};

    fn ctx() -> Context {
        let mut ctx = Context::new(1);
        ctx.ensure_free(64).expect("room");
        ctx
    }

    #[test]
    fn addition_promotes_on_overflow() {
        let mut ctx = ctx();
        assert_eq!(
            bif_add(&mut ctx, 0, Term::small(3), Term::small(4)),
            Ok(Term::small(7))
        );
        let promoted = bif_add(&mut ctx, 0, Term::small(MAX_SMALL), Term::small(1)).expect("boxes");
        assert!(promoted.is_boxed());
        assert_eq!(ctx.heap.any_int_value(promoted), MAX_SMALL + 1);
    }

    #[test]
    fn addition_past_64_bits_overflows() {
        let mut ctx = ctx();
        let max = ctx.heap.make_int(i64::MAX);
        assert_eq!(
            bif_add(&mut ctx, 0, max, Term::small(1)),
            Err(Exception::error_atom(defaults::OVERFLOW))
        );
    }

    #[test]
    fn division_by_zero_is_badarith() {
        let mut ctx = ctx();
        assert_eq!(
            bif_div(&mut ctx, 0, Term::small(1), Term::small(0)),
            Err(Exception::error_atom(defaults::BADARITH))
        );
        assert_eq!(
            bif_div(&mut ctx, 0, Term::small(7), Term::small(2)),
            Ok(Term::small(3))
        );
    }

    #[test]
    fn float_arithmetic_promotes() {
        let mut ctx = ctx();
        let f = ctx.heap.alloc_float(1.5);
        let sum = bif_add(&mut ctx, 0, f, Term::small(1)).expect("adds");
        assert_eq!(ctx.heap.float_value(sum), 2.5);
    }

    #[test]
    fn non_numbers_are_badarith() {
        let mut ctx = ctx();
        assert_eq!(
            bif_add(&mut ctx, 0, Term::atom(defaults::OK), Term::small(1)),
            Err(Exception::error_atom(defaults::BADARITH))
        );
    }

    #[test]
    fn abs_handles_min_small() {
        let mut ctx = ctx();
        let out = bif_abs(&mut ctx, 0, Term::small(MIN_SMALL)).expect("fits i64");
        assert_eq!(ctx.heap.any_int_value(out), -MIN_SMALL);
    }

    #[test]
    fn length_walks_proper_lists_only() {
        let mut ctx = ctx();
        let list = {
            let tail = ctx.heap.cons(Term::small(2), Term::NIL);
            ctx.heap.cons(Term::small(1), tail)
        };
        assert_eq!(bif_length(&mut ctx, 0, list), Ok(Term::small(2)));
        let improper = ctx.heap.cons(Term::small(1), Term::small(2));
        assert_eq!(
            bif_length(&mut ctx, 0, improper),
            Err(Exception::error_atom(defaults::BADARG))
        );
    }

    #[test]
    fn element_is_one_based() {
        let mut ctx = ctx();
        let t = ctx.heap.alloc_tuple(2);
        ctx.heap.put_tuple_element(t, 0, Term::small(10));
        ctx.heap.put_tuple_element(t, 1, Term::small(20));
        assert_eq!(bif_element(&mut ctx, Term::small(1), t), Ok(Term::small(10)));
        assert_eq!(bif_element(&mut ctx, Term::small(2), t), Ok(Term::small(20)));
        assert_eq!(
            bif_element(&mut ctx, Term::small(3), t),
            Err(Exception::error_atom(defaults::BADARG))
        );
    }
}
