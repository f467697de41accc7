pub mod control_flow;
pub mod literals;
pub mod obfuscator;
pub mod registry;

use classcloak_core::ClassModel;
use classcloak_utils::errors::MutationError;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of mutation strategies the registry can carry.
///
/// Enumerable by construction: configuration toggles name kinds, never
/// concrete implementation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutatorKind {
    LiteralConceal,
    ControlFlowConceal,
}

impl MutatorKind {
    pub const ALL: [Self; 2] = [Self::LiteralConceal, Self::ControlFlowConceal];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LiteralConceal => "literal-conceal",
            Self::ControlFlowConceal => "control-flow-conceal",
        }
    }
}

impl fmt::Display for MutatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for class-artifact mutation passes.
///
/// A mutator must preserve observable behavior and the structural invariants
/// of the model; method shapes it cannot handle are skipped, not corrupted.
pub trait Mutator: Send + Sync {
    /// The kind this implementation realizes.
    fn kind(&self) -> MutatorKind;
    /// Applies the mutation to one class, returning whether changes were made.
    fn apply(&self, class: &mut ClassModel, rng: &mut StdRng) -> Result<bool, MutationError>;
}

/// Tuning knobs shared by the mutation passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassConfig {
    /// Maximum ratio of eligible injection points that receive opaque guards.
    pub max_guard_ratio: f32,
    /// String literals shorter than this stay in the clear.
    pub min_string_len: usize,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            max_guard_ratio: 0.25,
            min_string_len: 1,
        }
    }
}
