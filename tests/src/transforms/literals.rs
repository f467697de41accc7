use crate::fixtures::{self, contains_bytes, GREETER_INT, GREETER_LONG};
use classcloak_core::model::{
    AttrMap, ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC, ACC_STATIC, ACC_SYNTHETIC,
};
use classcloak_core::{
    decode, encode, opcode, ClassModel, ConstEntry, ConstPool, Insn, Member, MethodBody,
};
use classcloak_transform::literals::LiteralConcealMutator;
use classcloak_transform::{Mutator, PassConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn apply_with(config: PassConfig, seed: u64) -> ClassModel {
    let mut class = fixtures::greeter_class();
    let mutator = LiteralConcealMutator::new(config);
    let mut rng = StdRng::seed_from_u64(seed);
    assert!(mutator.apply(&mut class, &mut rng).unwrap());
    class.verify().unwrap();
    class
}

fn body_of<'a>(class: &'a ClassModel, name: &str) -> &'a [Insn] {
    class
        .methods
        .iter()
        .find(|m| class.member_name(m) == name)
        .and_then(|m| m.body.as_ref())
        .map(|b| b.code.as_slice())
        .unwrap()
}

#[test]
fn string_literals_leave_the_pool() {
    fixtures::init_tracing();
    let clean = fixtures::greeter_bytes();
    assert!(contains_bytes(&clean, b"affirmative"));
    assert!(contains_bytes(&clean, b"negative"));

    let class = apply_with(PassConfig::default(), 3);
    let bytes = encode(&class).unwrap();
    assert!(!contains_bytes(&bytes, b"affirmative"));
    assert!(!contains_bytes(&bytes, b"negative"));
    decode(&bytes).unwrap();
}

#[test]
fn decoder_helper_is_injected_once() {
    let original = fixtures::greeter_class();
    let class = apply_with(PassConfig::default(), 3);
    assert_eq!(class.methods.len(), original.methods.len() + 1);

    let helper = class.methods.last().unwrap();
    assert_ne!(helper.access & ACC_SYNTHETIC, 0);

    // Every rewritten string load goes through the same static call.
    let calls: Vec<u16> = body_of(&class, "greet")
        .iter()
        .filter_map(|i| match i {
            Insn::Cp {
                op: opcode::INVOKESTATIC,
                index,
            } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);
}

#[test]
fn numeric_literals_become_xor_pairs() {
    let class = apply_with(PassConfig::default(), 5);
    let decoded = decode(&encode(&class).unwrap()).unwrap();

    let long_at = |idx: u16| match decoded.pool.get(idx) {
        Some(ConstEntry::Long(v)) => *v,
        other => panic!("expected long constant, found {other:?}"),
    };
    let big = body_of(&decoded, "big");
    assert!(matches!(big[2], Insn::Plain(opcode::LXOR)));
    let (Insn::Ldc2(a), Insn::Ldc2(b)) = (&big[0], &big[1]) else {
        panic!("expected a masked pair, found {big:?}");
    };
    assert_eq!(long_at(*a) ^ long_at(*b), GREETER_LONG);

    let int_at = |idx: u16| match decoded.pool.get(idx) {
        Some(ConstEntry::Integer(v)) => *v,
        other => panic!("expected integer constant, found {other:?}"),
    };
    let magic = body_of(&decoded, "magic");
    assert!(matches!(magic[2], Insn::Plain(opcode::IXOR)));
    let (Insn::Ldc(a), Insn::Ldc(b)) = (&magic[0], &magic[1]) else {
        panic!("expected a masked pair, found {magic:?}");
    };
    assert_eq!(int_at(*a) ^ int_at(*b), GREETER_INT);

    // The plain values lost their last reference and were compacted away.
    for idx in 1..decoded.pool.slot_count() {
        match decoded.pool.get(idx as u16) {
            Some(ConstEntry::Long(v)) => assert_ne!(*v, GREETER_LONG),
            Some(ConstEntry::Integer(v)) => assert_ne!(*v, GREETER_INT),
            _ => {}
        }
    }
}

#[test]
fn interface_decoder_call_uses_an_interface_method_ref() {
    fixtures::init_tracing();
    let mut pool = ConstPool::new();
    let this_class = pool.intern_class("sample/Flavored");
    let super_class = pool.intern_class("java/lang/Object");
    let secret = pool.intern_string("butterscotch");
    let name = pool.intern_utf8("flavor");
    let desc = pool.intern_utf8("()Ljava/lang/String;");
    let mut member = Member::new(ACC_PUBLIC | ACC_STATIC, name, desc);
    let mut body = MethodBody::default();
    body.code = vec![Insn::Ldc(secret), Insn::Plain(opcode::ARETURN)];
    member.body = Some(body);
    let mut class = ClassModel {
        minor: 0,
        major: 53,
        access: ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: vec![member],
        pool,
        source_file: None,
        signature: None,
        bootstrap_methods: Vec::new(),
        nest_host: None,
        nest_members: Vec::new(),
        inner_classes: Vec::new(),
        enclosing_method: None,
        attrs: AttrMap::new(),
    };

    let mutator = LiteralConcealMutator::new(PassConfig::default());
    let mut rng = StdRng::seed_from_u64(11);
    assert!(mutator.apply(&mut class, &mut rng).unwrap());
    class.verify().unwrap();

    let call = body_of(&class, "flavor")
        .iter()
        .find_map(|i| match i {
            Insn::Cp {
                op: opcode::INVOKESTATIC,
                index,
            } => Some(*index),
            _ => None,
        })
        .expect("rewritten string load calls the decoder");
    match class.pool.get(call) {
        Some(ConstEntry::InterfaceMethodRef { class: owner, .. }) => {
            assert_eq!(class.pool.class_name(*owner), Some("sample/Flavored"));
        }
        other => panic!("expected an interface method ref, found {other:?}"),
    }
    decode(&encode(&class).unwrap()).unwrap();
}

#[test]
fn minimum_length_spares_short_strings() {
    let config = PassConfig {
        min_string_len: 100,
        ..PassConfig::default()
    };
    let class = apply_with(config, 3);
    let bytes = encode(&class).unwrap();
    // Numerics were still masked, so the pass reports a change, but every
    // string stays readable.
    assert!(contains_bytes(&bytes, b"affirmative"));
    assert!(contains_bytes(&bytes, b"negative"));
    assert_eq!(class.methods.len(), fixtures::greeter_class().methods.len());
}
