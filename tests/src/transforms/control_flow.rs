use crate::fixtures;
use classcloak_core::{decode, encode, opcode, Insn};
use classcloak_transform::control_flow::ControlFlowMutator;
use classcloak_transform::{Mutator, MutatorKind, PassConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn apply(seed: u64) -> classcloak_core::ClassModel {
    let mut class = fixtures::greeter_class();
    let mutator = ControlFlowMutator::new(PassConfig::default());
    let mut rng = StdRng::seed_from_u64(seed);
    assert!(mutator.apply(&mut class, &mut rng).unwrap());
    class
}

#[test]
fn reports_its_kind() {
    let mutator = ControlFlowMutator::new(PassConfig::default());
    assert_eq!(mutator.kind(), MutatorKind::ControlFlowConceal);
}

#[test]
fn injects_guards_and_stays_encodable() {
    fixtures::init_tracing();
    let before: usize = fixtures::greeter_class()
        .methods
        .iter()
        .filter_map(|m| m.body.as_ref())
        .map(|b| b.insn_count())
        .sum();

    let class = apply(7);
    class.verify().unwrap();
    let after: usize = class
        .methods
        .iter()
        .filter_map(|m| m.body.as_ref())
        .map(|b| b.insn_count())
        .sum();
    assert!(after > before, "no instructions were added");

    let has = |op: u8| {
        class
            .methods
            .iter()
            .filter_map(|m| m.body.as_ref())
            .flat_map(|b| &b.code)
            .any(|i| match i {
                Insn::Branch { op: o, .. } => *o == op,
                Insn::Plain(o) => *o == op,
                _ => false,
            })
    };
    assert!(has(opcode::IF_ICMPEQ));
    assert!(has(opcode::ATHROW));

    // The mutated class must still pass analysis and round trip the codec.
    let bytes = encode(&class).unwrap();
    let decoded = decode(&bytes).unwrap();
    assert_eq!(decoded.methods.len(), class.methods.len());
}

#[test]
fn equal_seeds_agree_and_distinct_seeds_diverge() {
    let a = encode(&apply(11)).unwrap();
    let b = encode(&apply(11)).unwrap();
    let c = encode(&apply(12)).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn class_without_code_is_left_alone() {
    let mut class = fixtures::greeter_class();
    class.methods.clear();
    let mutator = ControlFlowMutator::new(PassConfig::default());
    let mut rng = StdRng::seed_from_u64(0);
    assert!(!mutator.apply(&mut class, &mut rng).unwrap());
}
