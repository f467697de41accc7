//! Literal concealment: XOR-masked constants decoded at run time.
//!
//! String literals are re-encoded with a per-class position-dependent XOR
//! key and loaded through a synthetic static decoder method injected into
//! the class on first use. Integer and long literals become a masked value
//! and mask pair recombined with `ixor`/`lxor`. The original entries lose
//! their last reference here and vanish during encode-time pool compaction.
//!
//! Floats and doubles are left alone: a bit-exact mask would need raw-bits
//! helper calls, which cost more than they hide.

use crate::{Mutator, MutatorKind, PassConfig};
use classcloak_core::model::{ACC_INTERFACE, ACC_PRIVATE, ACC_STATIC, ACC_SYNTHETIC, Insn};
use classcloak_core::{opcode, ClassModel, ConstEntry, Member, MethodBody};
use classcloak_utils::errors::MutationError;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

const DECODER_DESC: &str = "(Ljava/lang/String;I)Ljava/lang/String;";

#[derive(Debug)]
pub struct LiteralConcealMutator {
    config: PassConfig,
}

impl LiteralConcealMutator {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }
}

enum Rewrite {
    Str(String),
    Int(i32),
    Long(i64),
}

impl Mutator for LiteralConcealMutator {
    fn kind(&self) -> MutatorKind {
        MutatorKind::LiteralConceal
    }

    fn apply(&self, class: &mut ClassModel, rng: &mut StdRng) -> Result<bool, MutationError> {
        let this_name = class
            .this_class_name()
            .ok_or_else(|| MutationError::HelperInjection("unresolved class name".to_owned()))?
            .to_owned();
        // Interfaces below Java 9 cannot hold the private static decoder, so
        // their strings stay in the clear; numeric masking needs no helper.
        let strings_ok = class.access & ACC_INTERFACE == 0 || class.major >= 53;
        let key: i32 = rng.random();
        let helper_name = pick_helper_name(class, rng);

        let mut helper_ref: Option<u16> = None;
        let mut changed = false;

        for m in 0..class.methods.len() {
            let Some(body) = class.methods[m].body.as_ref() else {
                continue;
            };
            let mut plan: Vec<(usize, Rewrite)> = Vec::new();
            for (i, insn) in body.code.iter().enumerate() {
                match insn {
                    Insn::Ldc(idx) => match class.pool.get(*idx) {
                        Some(ConstEntry::Integer(v)) => plan.push((i, Rewrite::Int(*v))),
                        Some(ConstEntry::Str { utf8 }) if strings_ok => {
                            if let Some(s) = class.pool.utf8(*utf8) {
                                if s.encode_utf16().count() >= self.config.min_string_len {
                                    plan.push((i, Rewrite::Str(s.to_owned())));
                                }
                            }
                        }
                        _ => {}
                    },
                    Insn::Ldc2(idx) => {
                        if let Some(ConstEntry::Long(v)) = class.pool.get(*idx) {
                            plan.push((i, Rewrite::Long(*v)));
                        }
                    }
                    _ => {}
                }
            }
            if plan.is_empty() {
                continue;
            }

            let mut replacements: Vec<(usize, Vec<Insn>)> = Vec::with_capacity(plan.len());
            for (i, rewrite) in plan {
                match rewrite {
                    Rewrite::Int(v) => {
                        let mask: i32 = rng.random();
                        let masked = class.pool.intern_integer(v ^ mask);
                        let mask = class.pool.intern_integer(mask);
                        replacements.push((
                            i,
                            vec![
                                Insn::Ldc(masked),
                                Insn::Ldc(mask),
                                Insn::Plain(opcode::IXOR),
                            ],
                        ));
                    }
                    Rewrite::Long(v) => {
                        let mask: i64 = rng.random();
                        let masked = class.pool.intern_long(v ^ mask);
                        let mask = class.pool.intern_long(mask);
                        replacements.push((
                            i,
                            vec![
                                Insn::Ldc2(masked),
                                Insn::Ldc2(mask),
                                Insn::Plain(opcode::LXOR),
                            ],
                        ));
                    }
                    Rewrite::Str(s) => {
                        let Some(masked) = mask_string(&s, key) else {
                            continue;
                        };
                        let masked = class.pool.intern_string(&masked);
                        let key_idx = class.pool.intern_integer(key);
                        let call = *helper_ref.get_or_insert_with(|| {
                            // An interface owner needs an InterfaceMethodref
                            // or the link step rejects the call site.
                            if class.access & ACC_INTERFACE != 0 {
                                class.pool.intern_interface_method_ref(
                                    &this_name,
                                    &helper_name,
                                    DECODER_DESC,
                                )
                            } else {
                                class
                                    .pool
                                    .intern_method_ref(&this_name, &helper_name, DECODER_DESC)
                            }
                        });
                        replacements.push((
                            i,
                            vec![
                                Insn::Ldc(masked),
                                Insn::Ldc(key_idx),
                                Insn::Cp {
                                    op: opcode::INVOKESTATIC,
                                    index: call,
                                },
                            ],
                        ));
                    }
                }
            }
            if replacements.is_empty() {
                continue;
            }

            let Some(body) = class.methods[m].body.as_mut() else {
                continue;
            };
            for (i, seq) in replacements.into_iter().rev() {
                body.code.splice(i..i + 1, seq);
            }
            changed = true;
        }

        if helper_ref.is_some() {
            inject_decoder(class, &helper_name);
            debug!(class = %this_name, helper = %helper_name, "injected string decoder");
        }
        Ok(changed)
    }
}

/// A synthetic method name no existing method uses.
fn pick_helper_name(class: &ClassModel, rng: &mut StdRng) -> String {
    loop {
        let name = format!("m{:08x}", rng.random::<u32>());
        if !class.has_method(&name, DECODER_DESC) {
            return name;
        }
    }
}

/// Masks every UTF-16 unit with the low seven bits of `key + position`.
///
/// A seven-bit mask cannot move a unit into or out of the surrogate ranges,
/// so the masked sequence is itself a valid string and survives the constant
/// pool's modified UTF-8 encoding. The decoder applies the identical XOR,
/// which is its own inverse.
fn mask_string(s: &str, key: i32) -> Option<String> {
    let units: Vec<u16> = s
        .encode_utf16()
        .enumerate()
        .map(|(i, u)| u ^ ((key.wrapping_add(i as i32) & 0x7f) as u16))
        .collect();
    String::from_utf16(&units).ok()
}

/// Appends the static decoder: `String m(String s, int k)` returning a new
/// string with every char XORed by `(k + index) & 0x7f`.
fn inject_decoder(class: &mut ClassModel, name: &str) {
    let string_class = class.pool.intern_class("java/lang/String");
    let to_chars = class
        .pool
        .intern_method_ref("java/lang/String", "toCharArray", "()[C");
    let from_chars = class
        .pool
        .intern_method_ref("java/lang/String", "<init>", "([C)V");
    let name_idx = class.pool.intern_utf8(name);
    let desc_idx = class.pool.intern_utf8(DECODER_DESC);

    let mut body = MethodBody::default();
    let loop_top = body.new_label();
    let done = body.new_label();
    // Locals: 0 = input, 1 = key, 2 = char array, 3 = index.
    body.code = vec![
        Insn::Local {
            op: opcode::ALOAD,
            slot: 0,
        },
        Insn::Cp {
            op: opcode::INVOKEVIRTUAL,
            index: to_chars,
        },
        Insn::Local {
            op: opcode::ASTORE,
            slot: 2,
        },
        Insn::Plain(opcode::ICONST_0),
        Insn::Local {
            op: opcode::ISTORE,
            slot: 3,
        },
        Insn::Mark(loop_top),
        Insn::Local {
            op: opcode::ILOAD,
            slot: 3,
        },
        Insn::Local {
            op: opcode::ALOAD,
            slot: 2,
        },
        Insn::Plain(opcode::ARRAYLENGTH),
        Insn::Branch {
            op: opcode::IF_ICMPGE,
            target: done,
        },
        Insn::Local {
            op: opcode::ALOAD,
            slot: 2,
        },
        Insn::Local {
            op: opcode::ILOAD,
            slot: 3,
        },
        Insn::Plain(opcode::DUP2),
        Insn::Plain(opcode::CALOAD),
        Insn::Local {
            op: opcode::ILOAD,
            slot: 1,
        },
        Insn::Local {
            op: opcode::ILOAD,
            slot: 3,
        },
        Insn::Plain(opcode::IADD),
        Insn::Push8(0x7f),
        Insn::Plain(opcode::IAND),
        Insn::Plain(opcode::IXOR),
        Insn::Plain(opcode::I2C),
        Insn::Plain(opcode::CASTORE),
        Insn::Iinc { slot: 3, delta: 1 },
        Insn::Branch {
            op: opcode::GOTO,
            target: loop_top,
        },
        Insn::Mark(done),
        Insn::Cp {
            op: opcode::NEW,
            index: string_class,
        },
        Insn::Plain(opcode::DUP),
        Insn::Local {
            op: opcode::ALOAD,
            slot: 2,
        },
        Insn::Cp {
            op: opcode::INVOKESPECIAL,
            index: from_chars,
        },
        Insn::Plain(opcode::ARETURN),
    ];

    let mut member = Member::new(ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC, name_idx, desc_idx);
    member.body = Some(body);
    class.methods.push(member);
}
