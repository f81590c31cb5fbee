//! Property tests for the term representation: tag round trips and
//! total ordering.

use quickcheck_macros::quickcheck;

use plume_vm::atom::{install_defaults, AtomTable};
use plume_vm::context::Context;
use plume_vm::heap::Heap;
use plume_vm::term::{self, Term, MAX_SMALL, MIN_SMALL};
use plume_vm::Value;

#[quickcheck]
fn small_integers_are_immediate_and_round_trip(value: i64) -> bool {
    let value = value.clamp(MIN_SMALL, MAX_SMALL);
    let t = Term::small(value);
    t.is_small() && t.small_value() == value
}

#[quickcheck]
fn out_of_range_integers_box_and_round_trip(value: i64) -> bool {
    let mut heap = Heap::with_capacity(16);
    let t = heap.make_int(value);
    let boxed_expected = !(MIN_SMALL..=MAX_SMALL).contains(&value);
    t.is_boxed() == boxed_expected && heap.any_int_value(t) == value
}

#[quickcheck]
fn comparison_is_antisymmetric_for_integers(a: i64, b: i64) -> bool {
    let mut heap = Heap::with_capacity(16);
    let ta = heap.make_int(a);
    let tb = heap.make_int(b);
    term::compare(&heap, ta, tb) == term::compare(&heap, tb, ta).reverse()
        && term::compare(&heap, ta, tb) == a.cmp(&b)
}

fn sample_terms(ctx: &mut Context, atoms: &mut AtomTable) -> Vec<Term> {
    let values = [
        Value::Int(0),
        Value::Int(-5),
        Value::Int(MAX_SMALL),
        Value::Int(i64::MAX),
        Value::Float(1.5),
        Value::Float(-0.5),
        Value::atom("ok"),
        Value::atom("error"),
        Value::Pid(1),
        Value::Pid(9),
        Value::Ref(3),
        Value::Tuple(vec![]),
        Value::Tuple(vec![Value::Int(1)]),
        Value::Tuple(vec![Value::Int(1), Value::Int(2)]),
        Value::Map(vec![(Value::Int(1), Value::atom("ok"))]),
        Value::nil(),
        Value::List(vec![Value::Int(1)]),
        Value::List(vec![Value::Int(1), Value::Int(2)]),
        Value::Binary(vec![]),
        Value::Binary(vec![1, 2]),
        Value::Binary(vec![1, 3]),
    ];
    values
        .iter()
        .map(|v| v.build(atoms, ctx).expect("builds"))
        .collect()
}

#[test]
fn ordering_is_total_over_sample_terms() {
    let mut atoms = AtomTable::new();
    install_defaults(&mut atoms);
    let mut ctx = Context::new(1);
    let terms = sample_terms(&mut ctx, &mut atoms);

    for &a in &terms {
        assert_eq!(term::compare(&ctx.heap, a, a), core::cmp::Ordering::Equal);
        for &b in &terms {
            let ab = term::compare(&ctx.heap, a, b);
            let ba = term::compare(&ctx.heap, b, a);
            assert_eq!(ab, ba.reverse(), "antisymmetry of {a:?} vs {b:?}");
        }
    }
}

#[test]
fn ordering_respects_type_precedence() {
    let mut atoms = AtomTable::new();
    install_defaults(&mut atoms);
    let mut ctx = Context::new(1);
    // number < atom < reference < tuple < map < list < binary
    let ladder = [
        Value::Int(1 << 62),
        Value::atom("zzz"),
        Value::Ref(1),
        Value::Tuple(vec![Value::Int(1)]),
        Value::Map(vec![(Value::Int(1), Value::Int(2))]),
        Value::List(vec![Value::Int(1)]),
        Value::Binary(vec![0]),
    ];
    let terms: Vec<Term> = ladder
        .iter()
        .map(|v| v.build(&mut atoms, &mut ctx).expect("builds"))
        .collect();
    for pair in terms.windows(2) {
        assert_eq!(
            term::compare(&ctx.heap, pair[0], pair[1]),
            core::cmp::Ordering::Less
        );
    }
    // Pids order between references and tuples.
    let pid = Term::pid(1);
    assert_eq!(
        term::compare(&ctx.heap, terms[2], pid),
        core::cmp::Ordering::Less
    );
    assert_eq!(
        term::compare(&ctx.heap, pid, terms[3]),
        core::cmp::Ordering::Less
    );
}

#[test]
fn mixed_numeric_comparison_promotes() {
    let mut heap = Heap::with_capacity(16);
    let int = Term::small(2);
    let float = heap.alloc_float(1.5);
    assert_eq!(term::compare(&heap, float, int), core::cmp::Ordering::Less);
    let same = heap.alloc_float(2.0);
    assert!(term::equals(&heap, int, same));
    assert!(!term::exactly_equals(&heap, int, same));
}
