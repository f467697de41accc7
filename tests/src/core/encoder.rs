use crate::fixtures::{self, contains_bytes};
use classcloak_core::model::{InnerClass, ACC_PUBLIC, ACC_STATIC};
use classcloak_core::{decode, encode, opcode, ClassModel, Insn, Member, MethodBody};
use classcloak_utils::errors::WriterError;

fn single_method_class(code: Vec<Insn>, descriptor: &str) -> ClassModel {
    let mut class = decode(&fixtures::greeter_bytes()).unwrap();
    class.methods.clear();
    let name = class.pool.intern_utf8("run");
    let desc = class.pool.intern_utf8(descriptor);
    let mut member = Member::new(ACC_PUBLIC | ACC_STATIC, name, desc);
    let mut body = MethodBody::default();
    body.code = code;
    member.body = Some(body);
    class.methods.push(member);
    class
}

#[test]
fn unreferenced_pool_entries_vanish() {
    let mut padded = fixtures::greeter_class();
    padded.pool.intern_string("never-used-constant");
    let bytes = encode(&padded).unwrap();
    assert_eq!(bytes, fixtures::greeter_bytes());
    assert!(!contains_bytes(&bytes, b"never-used-constant"));
}

#[test]
fn stack_map_emitted_for_modern_branchy_class() {
    let bytes = fixtures::greeter_bytes();
    assert!(contains_bytes(&bytes, b"StackMapTable"));
}

#[test]
fn pre_frame_class_version_gets_no_stack_map() {
    let mut class = fixtures::greeter_class();
    class.major = 49;
    let bytes = encode(&class).unwrap();
    assert!(!contains_bytes(&bytes, b"StackMapTable"));
    decode(&bytes).unwrap();
}

#[test]
fn nest_and_inner_class_metadata_survives_a_round_trip() {
    let mut class = fixtures::greeter_class();
    let inner = class.pool.intern_class("sample/Greeter$Helper");
    let inner_name = class.pool.intern_utf8("Helper");
    class.nest_members.push(inner);
    class.inner_classes.push(InnerClass {
        inner,
        outer: Some(class.this_class),
        name: Some(inner_name),
        access: ACC_STATIC,
    });

    let bytes = encode(&class).unwrap();
    assert!(contains_bytes(&bytes, b"NestMembers"));
    assert!(contains_bytes(&bytes, b"InnerClasses"));

    let decoded = decode(&bytes).unwrap();
    assert_eq!(
        decoded.pool.class_name(decoded.nest_members[0]),
        Some("sample/Greeter$Helper")
    );
    let row = &decoded.inner_classes[0];
    assert_eq!(
        decoded.pool.class_name(row.inner),
        Some("sample/Greeter$Helper")
    );
    assert_eq!(
        row.outer.and_then(|i| decoded.pool.class_name(i)),
        Some("sample/Greeter")
    );
    assert_eq!(row.name.and_then(|i| decoded.pool.utf8(i)), Some("Helper"));
    assert_eq!(row.access, ACC_STATIC);
    assert_eq!(encode(&decoded).unwrap(), bytes);
}

#[test]
fn enclosing_method_and_nest_host_survive_a_round_trip() {
    let mut class = fixtures::greeter_class();
    let host = class.pool.intern_class("sample/Outer");
    let method = class.pool.intern_name_and_type("run", "()V");
    class.nest_host = Some(host);
    class.enclosing_method = Some((host, Some(method)));

    let bytes = encode(&class).unwrap();
    assert!(contains_bytes(&bytes, b"NestHost"));
    assert!(contains_bytes(&bytes, b"EnclosingMethod"));

    let decoded = decode(&bytes).unwrap();
    assert_eq!(
        decoded.nest_host.and_then(|i| decoded.pool.class_name(i)),
        Some("sample/Outer")
    );
    let (owner, method) = decoded.enclosing_method.unwrap();
    assert_eq!(decoded.pool.class_name(owner), Some("sample/Outer"));
    assert_eq!(
        method.and_then(|i| decoded.pool.name_and_type(i)),
        Some(("run", "()V"))
    );
}

#[test]
fn far_conditional_branch_is_widened() {
    let mut class = single_method_class(Vec::new(), "()V");
    let body = class.methods[0].body.as_mut().unwrap();
    let far = body.new_label();
    let mut code = vec![
        Insn::Plain(opcode::ICONST_0),
        Insn::Branch {
            op: opcode::IFEQ,
            target: far,
        },
    ];
    code.extend(std::iter::repeat_n(Insn::Plain(opcode::NOP), 40_000));
    code.push(Insn::Mark(far));
    code.push(Insn::Plain(opcode::RETURN));
    body.code = code;

    let bytes = encode(&class).unwrap();
    assert!(contains_bytes(&bytes, b"StackMapTable"));

    let decoded = decode(&bytes).unwrap();
    let body = decoded.methods[0].body.as_ref().unwrap();
    // The widened form decodes as an inverted test plus a separate goto.
    assert_eq!(body.insn_count(), 40_004);
    assert!(body.code.iter().any(|i| matches!(
        i,
        Insn::Branch {
            op: opcode::IFNE,
            ..
        }
    )));
    assert!(body
        .code
        .iter()
        .any(|i| matches!(i, Insn::Branch { op: opcode::GOTO, .. })));
}

#[test]
fn far_backward_goto_is_widened() {
    let mut class = single_method_class(Vec::new(), "()V");
    let body = class.methods[0].body.as_mut().unwrap();
    let top = body.new_label();
    let mut code = vec![Insn::Mark(top)];
    code.extend(std::iter::repeat_n(Insn::Plain(opcode::NOP), 40_000));
    code.push(Insn::Branch {
        op: opcode::GOTO,
        target: top,
    });
    body.code = code;

    let decoded = decode(&encode(&class).unwrap()).unwrap();
    let body = decoded.methods[0].body.as_ref().unwrap();
    assert_eq!(body.insn_count(), 40_001);
    assert!(body
        .code
        .iter()
        .any(|i| matches!(i, Insn::Branch { op: opcode::GOTO, .. })));
}

#[test]
fn oversized_method_is_rejected() {
    let mut class = single_method_class(Vec::new(), "()V");
    let body = class.methods[0].body.as_mut().unwrap();
    let mut code = vec![Insn::Plain(opcode::NOP); 70_000];
    code.push(Insn::Plain(opcode::RETURN));
    body.code = code;
    assert!(matches!(
        encode(&class),
        Err(WriterError::CodeOverflow { len: 70_001, .. })
    ));
}

#[test]
fn unreachable_code_is_rejected() {
    let class = single_method_class(
        vec![Insn::Plain(opcode::RETURN), Insn::Plain(opcode::NOP)],
        "()V",
    );
    assert!(matches!(
        encode(&class),
        Err(WriterError::UnreachableCode { at: 1, .. })
    ));
}

#[test]
fn stack_underflow_is_rejected() {
    let class = single_method_class(vec![Insn::Plain(opcode::POP)], "()V");
    assert!(matches!(
        encode(&class),
        Err(WriterError::StackUnderflow { at: 0, .. })
    ));
}

#[test]
fn dangling_operand_index_is_rejected() {
    let class = single_method_class(vec![Insn::Ldc(999), Insn::Plain(opcode::POP)], "()V");
    assert!(matches!(
        encode(&class),
        Err(WriterError::DanglingIndex { index: 999, .. })
    ));
}

#[test]
fn switch_padding_survives_round_trip() {
    // Shift the switch through all four alignments with leading nops.
    for nops in 0..4usize {
        let mut class = single_method_class(Vec::new(), "(I)I");
        let body = class.methods[0].body.as_mut().unwrap();
        let case0 = body.new_label();
        let fallback = body.new_label();
        let mut code = vec![Insn::Plain(opcode::NOP); nops];
        code.extend([
            Insn::Local {
                op: opcode::ILOAD,
                slot: 0,
            },
            Insn::TableSwitch {
                default: fallback,
                low: 0,
                high: 0,
                targets: vec![case0],
            },
            Insn::Mark(case0),
            Insn::Plain(opcode::ICONST_0),
            Insn::Plain(opcode::IRETURN),
            Insn::Mark(fallback),
            Insn::Plain(opcode::ICONST_M1),
            Insn::Plain(opcode::IRETURN),
        ]);
        body.code = code;

        let bytes = encode(&class).unwrap();
        let decoded = decode(&bytes).unwrap();
        let body = decoded.methods[0].body.as_ref().unwrap();
        let switch = body
            .code
            .iter()
            .find(|i| matches!(i, Insn::TableSwitch { .. }))
            .unwrap();
        if let Insn::TableSwitch {
            low, high, targets, ..
        } = switch
        {
            assert_eq!((*low, *high), (0, 0));
            assert_eq!(targets.len(), 1);
        }
        assert_eq!(encode(&decoded).unwrap(), bytes);
    }
}
