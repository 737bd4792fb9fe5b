//! Property tests: instrumentation determinism, merge monotonicity,
//! behavior preservation.

mod common;

use common::{is_prime_reference, is_prime_unit, run};
use proptest::prelude::*;
use sonda::{
    Analyzer, Cmp, CodeUnit, CoverageBuilder, ExecutionData, ExecutionStore, FilterSet,
    Instrumenter, LabelId, Method, Node, Opcode, ProbeArray, UnitCoverage,
};

/// A unit with `diamonds` consecutive if/else diamonds
fn diamond_unit(diamonds: u32, cmp: Cmp) -> CodeUnit {
    let mut body = vec![Node::Line(1)];
    for d in 0..diamonds {
        let other = LabelId::new(d * 2);
        let join = LabelId::new(d * 2 + 1);
        body.extend([
            Node::Insn(Opcode::LoadLocal(0)),
            Node::Insn(Opcode::Const(i64::from(d))),
            Node::Insn(Opcode::Branch { cmp, target: other }),
            Node::Insn(Opcode::Const(1)),
            Node::Insn(Opcode::StoreLocal(1)),
            Node::Insn(Opcode::Goto(join)),
            Node::Label(other),
            Node::Insn(Opcode::Const(2)),
            Node::Insn(Opcode::StoreLocal(1)),
            Node::Label(join),
            Node::Frame,
        ]);
    }
    body.extend([Node::Insn(Opcode::LoadLocal(1)), Node::Insn(Opcode::ReturnValue)]);
    CodeUnit::new("prop/Diamonds", 1)
        .with_method(Method::new("walk", "(I)I", 2).with_body(body))
}

fn analyze(unit: &CodeUnit, probes: Vec<bool>) -> UnitCoverage {
    let mut store = ExecutionStore::new();
    store
        .put(ExecutionData::new(
            unit.name.clone(),
            unit.fingerprint(),
            probes,
        ))
        .unwrap();
    let mut builder = CoverageBuilder::new();
    Analyzer::new(&store)
        .with_filters(FilterSet::none())
        .analyze(unit, &mut builder)
        .unwrap();
    builder.build().units()[0].clone()
}

proptest! {
    #[test]
    fn prop_instrumentation_is_deterministic(
        diamonds in 0u32..6,
        cmp in prop_oneof![
            Just(Cmp::Eq), Just(Cmp::Ne), Just(Cmp::Lt),
            Just(Cmp::Le), Just(Cmp::Gt), Just(Cmp::Ge)
        ]
    ) {
        let unit = diamond_unit(diamonds, cmp);
        let a = Instrumenter::new().instrument(&unit).unwrap();
        let b = Instrumenter::new().instrument(&unit).unwrap();
        prop_assert_eq!(a.probe_count, b.probe_count);
        prop_assert_eq!(&a.unit, &b.unit);
        // Entry probe plus two edges per diamond.
        prop_assert_eq!(a.probe_count, 1 + diamonds * 2);
    }

    #[test]
    fn prop_instrumented_diamonds_behave_identically(
        diamonds in 1u32..6,
        input in -3i64..10
    ) {
        let unit = diamond_unit(diamonds, Cmp::Ge);
        let instrumented = Instrumenter::new().instrument(&unit).unwrap();
        let scratch = ProbeArray::new(instrumented.probe_count);
        let none = ProbeArray::new(0);
        prop_assert_eq!(
            run(&unit, "walk", &[input], &none),
            run(&instrumented.unit, "walk", &[input], &scratch)
        );
    }

    #[test]
    fn prop_instrumented_is_prime_behaves_identically(n in -50i64..200) {
        let unit = is_prime_unit();
        let instrumented = Instrumenter::new().instrument(&unit).unwrap();
        let scratch = ProbeArray::new(instrumented.probe_count);
        prop_assert_eq!(
            run(&instrumented.unit, "is_prime", &[n], &scratch),
            Some(is_prime_reference(n))
        );
    }

    #[test]
    fn prop_or_merge_never_reduces_coverage(
        first in proptest::collection::vec(any::<bool>(), 5),
        second in proptest::collection::vec(any::<bool>(), 5)
    ) {
        let unit = is_prime_unit();
        let merged: Vec<bool> = first
            .iter()
            .zip(&second)
            .map(|(a, b)| *a || *b)
            .collect();

        let base = analyze(&unit, first);
        let more = analyze(&unit, merged);

        prop_assert!(more.instructions.covered >= base.instructions.covered);
        prop_assert!(more.instructions.missed <= base.instructions.missed);
        prop_assert!(more.branches.covered >= base.branches.covered);
        prop_assert!(more.branches.missed <= base.branches.missed);
        prop_assert!(more.line_counter.covered >= base.line_counter.covered);
        prop_assert!(more.method_counter.covered >= base.method_counter.covered);
    }

    #[test]
    fn prop_counter_totals_are_probe_independent(
        probes in proptest::collection::vec(any::<bool>(), 5)
    ) {
        let unit = is_prime_unit();
        let cov = analyze(&unit, probes);
        let reference = analyze(&unit, vec![false; 5]);
        prop_assert_eq!(cov.instructions.total(), reference.instructions.total());
        prop_assert_eq!(cov.branches.total(), reference.branches.total());
        prop_assert_eq!(cov.method_counter.total(), reference.method_counter.total());
    }
}
