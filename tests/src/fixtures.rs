//! Shared test fixtures: synthetic class models built through the public
//! model API and encoded with the workspace encoder.

use classcloak_core::model::{
    AttrMap, ExceptionRange, ACC_PUBLIC, ACC_STATIC, ACC_SUPER,
};
use classcloak_core::{opcode, ClassModel, Insn, Member, MethodBody};
use std::sync::Once;

static INIT: Once = Once::new();

pub(crate) fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub(crate) const GREETER_LONG: i64 = 0x0123_4567_89ab;
pub(crate) const GREETER_INT: i32 = 0xcafe;

/// A small but representative class: constructor, a branchy string method,
/// a tableswitch, an exception handler, and wide/narrow literals.
pub(crate) fn greeter_class() -> ClassModel {
    let mut class = ClassModel {
        minor: 0,
        major: 52,
        access: ACC_PUBLIC | ACC_SUPER,
        this_class: 0,
        super_class: 0,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        pool: classcloak_core::ConstPool::new(),
        source_file: None,
        signature: None,
        bootstrap_methods: Vec::new(),
        nest_host: None,
        nest_members: Vec::new(),
        inner_classes: Vec::new(),
        enclosing_method: None,
        attrs: AttrMap::new(),
    };
    class.this_class = class.pool.intern_class("sample/Greeter");
    class.super_class = class.pool.intern_class("java/lang/Object");
    class.source_file = Some(class.pool.intern_utf8("Greeter.java"));

    class.methods.push(constructor(&mut class.pool));
    class.methods.push(greet(&mut class.pool));
    class.methods.push(pick(&mut class.pool));
    class.methods.push(guarded(&mut class.pool));
    class.methods.push(big(&mut class.pool));
    class.methods.push(magic(&mut class.pool));
    class
}

pub(crate) fn greeter_bytes() -> Vec<u8> {
    classcloak_core::encode(&greeter_class()).expect("fixture must encode")
}

fn method(
    pool: &mut classcloak_core::ConstPool,
    access: u16,
    name: &str,
    descriptor: &str,
    body: MethodBody,
) -> Member {
    let name = pool.intern_utf8(name);
    let descriptor = pool.intern_utf8(descriptor);
    let mut member = Member::new(access, name, descriptor);
    member.body = Some(body);
    member
}

fn constructor(pool: &mut classcloak_core::ConstPool) -> Member {
    let super_init = pool.intern_method_ref("java/lang/Object", "<init>", "()V");
    let mut body = MethodBody::default();
    body.code = vec![
        Insn::Local {
            op: opcode::ALOAD,
            slot: 0,
        },
        Insn::Cp {
            op: opcode::INVOKESPECIAL,
            index: super_init,
        },
        Insn::Plain(opcode::RETURN),
    ];
    method(pool, ACC_PUBLIC, "<init>", "()V", body)
}

fn greet(pool: &mut classcloak_core::ConstPool) -> Member {
    let yes = pool.intern_string("affirmative");
    let no = pool.intern_string("negative");
    let mut body = MethodBody::default();
    let entry = body.new_label();
    let otherwise = body.new_label();
    body.code = vec![
        Insn::Mark(entry),
        Insn::Local {
            op: opcode::ILOAD,
            slot: 0,
        },
        Insn::Branch {
            op: opcode::IFLE,
            target: otherwise,
        },
        Insn::Ldc(yes),
        Insn::Plain(opcode::ARETURN),
        Insn::Mark(otherwise),
        Insn::Ldc(no),
        Insn::Plain(opcode::ARETURN),
    ];
    body.line_numbers = vec![(entry, 10)];
    method(
        pool,
        ACC_PUBLIC | ACC_STATIC,
        "greet",
        "(I)Ljava/lang/String;",
        body,
    )
}

fn pick(pool: &mut classcloak_core::ConstPool) -> Member {
    let mut body = MethodBody::default();
    let zero = body.new_label();
    let one = body.new_label();
    let fallback = body.new_label();
    body.code = vec![
        Insn::Local {
            op: opcode::ILOAD,
            slot: 0,
        },
        Insn::TableSwitch {
            default: fallback,
            low: 0,
            high: 1,
            targets: vec![zero, one],
        },
        Insn::Mark(zero),
        Insn::Plain(opcode::ICONST_0),
        Insn::Plain(opcode::IRETURN),
        Insn::Mark(one),
        Insn::Plain(opcode::ICONST_0 + 1),
        Insn::Plain(opcode::IRETURN),
        Insn::Mark(fallback),
        Insn::Plain(opcode::ICONST_M1),
        Insn::Plain(opcode::IRETURN),
    ];
    method(pool, ACC_PUBLIC | ACC_STATIC, "pick", "(I)I", body)
}

fn guarded(pool: &mut classcloak_core::ConstPool) -> Member {
    let risky = pool.intern_string("risky");
    let mut body = MethodBody::default();
    let start = body.new_label();
    let end = body.new_label();
    let handler = body.new_label();
    let exit = body.new_label();
    body.code = vec![
        Insn::Mark(start),
        Insn::Ldc(risky),
        Insn::Plain(opcode::POP),
        Insn::Mark(end),
        Insn::Branch {
            op: opcode::GOTO,
            target: exit,
        },
        Insn::Mark(handler),
        Insn::Plain(opcode::POP),
        Insn::Mark(exit),
        Insn::Plain(opcode::RETURN),
    ];
    body.exceptions = vec![ExceptionRange {
        start,
        end,
        handler,
        catch_type: None,
    }];
    method(pool, ACC_PUBLIC | ACC_STATIC, "guarded", "()V", body)
}

fn big(pool: &mut classcloak_core::ConstPool) -> Member {
    let value = pool.intern_long(GREETER_LONG);
    let mut body = MethodBody::default();
    body.code = vec![Insn::Ldc2(value), Insn::Plain(opcode::LRETURN)];
    method(pool, ACC_PUBLIC | ACC_STATIC, "big", "()J", body)
}

fn magic(pool: &mut classcloak_core::ConstPool) -> Member {
    let value = pool.intern_integer(GREETER_INT);
    let mut body = MethodBody::default();
    body.code = vec![Insn::Ldc(value), Insn::Plain(opcode::IRETURN)];
    method(pool, ACC_PUBLIC | ACC_STATIC, "magic", "()I", body)
}

/// True when `needle` occurs as a contiguous byte run inside `haystack`.
pub(crate) fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
