//! Control-flow concealment: opaque never-taken guards into a trap block.
//!
//! Each rewritten method gets a fresh local slot seeded with a random key in
//! its prologue. At randomly chosen points where the operand stack is empty,
//! a guard loads the key, compares it against a decoy constant the key can
//! never equal, and conditionally branches to a trap block appended at the
//! end of the method (`aconst_null; athrow`). The branch is never taken, so
//! observable behavior is unchanged, but static control flow gains edges
//! that all look live.

use crate::{Mutator, MutatorKind, PassConfig};
use classcloak_core::model::Insn;
use classcloak_core::{frames, opcode, ClassModel};
use classcloak_utils::errors::MutationError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

#[derive(Debug)]
pub struct ControlFlowMutator {
    config: PassConfig,
}

impl ControlFlowMutator {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }
}

impl Mutator for ControlFlowMutator {
    fn kind(&self) -> MutatorKind {
        MutatorKind::ControlFlowConceal
    }

    fn apply(&self, class: &mut ClassModel, rng: &mut StdRng) -> Result<bool, MutationError> {
        let mut changed = false;
        for m in 0..class.methods.len() {
            let Some(body) = class.methods[m].body.as_ref() else {
                continue;
            };
            if body.code.is_empty() {
                continue;
            }
            let name = class.member_name(&class.methods[m]).to_owned();
            // Guards may only go where the operand stack is empty, which the
            // stack-depth analysis tells us per instruction.
            let facts = match frames::analyze(class, &class.methods[m], body) {
                Ok(facts) => facts,
                Err(err) => {
                    debug!(method = %name, %err, "skipping unanalyzable method");
                    continue;
                }
            };
            let eligible: Vec<usize> = body
                .code
                .iter()
                .enumerate()
                .filter(|(i, insn)| {
                    !matches!(insn, Insn::Mark(_))
                        && facts.entry_frames[*i]
                            .as_ref()
                            .is_some_and(|f| f.stack.is_empty())
                })
                .map(|(i, _)| i)
                .collect();
            if eligible.is_empty() {
                continue;
            }
            let max_guards =
                ((eligible.len() as f32) * self.config.max_guard_ratio).ceil() as usize;
            if max_guards == 0 {
                continue;
            }
            let slot = facts.max_locals;
            if slot == u16::MAX {
                return Err(MutationError::NoFreeLocalSlot);
            }

            let mut points = eligible;
            points.shuffle(rng);
            points.truncate(rng.random_range(1..=max_guards.min(points.len())));
            // Descending order keeps earlier insertion points valid.
            points.sort_unstable_by(|a, b| b.cmp(a));

            let key: i32 = rng.random();
            let decoy = key.wrapping_add(rng.random_range(1..=i32::from(u16::MAX)));
            let key_idx = class.pool.intern_integer(key);
            let decoy_idx = class.pool.intern_integer(decoy);

            let Some(body) = class.methods[m].body.as_mut() else {
                continue;
            };
            let trap = body.new_label();
            for &point in &points {
                body.code.splice(
                    point..point,
                    [
                        Insn::Local {
                            op: opcode::ILOAD,
                            slot,
                        },
                        Insn::Ldc(decoy_idx),
                        Insn::Branch {
                            op: opcode::IF_ICMPEQ,
                            target: trap,
                        },
                    ],
                );
            }
            body.code.splice(
                0..0,
                [
                    Insn::Ldc(key_idx),
                    Insn::Local {
                        op: opcode::ISTORE,
                        slot,
                    },
                ],
            );
            body.code.extend([
                Insn::Mark(trap),
                Insn::Plain(opcode::ACONST_NULL),
                Insn::Plain(opcode::ATHROW),
            ]);
            debug!(method = %name, guards = points.len(), slot, "injected opaque guards");
            changed = true;
        }
        Ok(changed)
    }
}
