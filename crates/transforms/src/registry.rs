//! Ordered mutator registry and its immutable enablement snapshots.
//!
//! Registration order is the application order and part of the public
//! contract. Batch runs never read the live enabled flags; they take an
//! [`EnabledSet`] captured up front, so flipping a flag mid-batch cannot
//! change what in-flight artifacts receive.

use crate::control_flow::ControlFlowMutator;
use crate::literals::LiteralConcealMutator;
use crate::{Mutator, MutatorKind, PassConfig};
use classcloak_core::ClassModel;
use classcloak_utils::errors::{ObfuscateError, RegistryError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

struct Entry {
    mutator: Box<dyn Mutator>,
    enabled: bool,
}

/// Holds every known mutator with a per-entry enabled flag.
pub struct MutatorRegistry {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for MutatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorRegistry")
            .field("entries", &self.list())
            .finish()
    }
}

impl Default for MutatorRegistry {
    /// The stock registry: literal concealment first, then control-flow
    /// concealment, everything enabled. Literals go first so string call
    /// sites are rewritten before opaque guards dilute them.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(LiteralConcealMutator::new(PassConfig::default())));
        registry.register(Box::new(ControlFlowMutator::new(PassConfig::default())));
        registry
    }
}

impl MutatorRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends a mutator, enabled. A later registration of the same kind
    /// shadows nothing; kinds are expected to be unique per registry.
    pub fn register(&mut self, mutator: Box<dyn Mutator>) {
        self.entries.push(Entry {
            mutator,
            enabled: true,
        });
    }

    /// Registered kinds with their current enabled state, in application order.
    pub fn list(&self) -> Vec<(MutatorKind, bool)> {
        self.entries
            .iter()
            .map(|e| (e.mutator.kind(), e.enabled))
            .collect()
    }

    /// Looks up a registered mutator by kind.
    pub fn get(&self, kind: MutatorKind) -> Result<&dyn Mutator, RegistryError> {
        self.entries
            .iter()
            .find(|e| e.mutator.kind() == kind)
            .map(|e| e.mutator.as_ref())
            .ok_or_else(|| RegistryError::NotFound(kind.to_string()))
    }

    pub fn set_enabled(&mut self, kind: MutatorKind, enabled: bool) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.mutator.kind() == kind)
            .ok_or_else(|| RegistryError::NotFound(kind.to_string()))?;
        entry.enabled = enabled;
        Ok(())
    }

    /// Captures the current enabled kinds as an immutable snapshot.
    pub fn snapshot(&self) -> EnabledSet {
        EnabledSet {
            kinds: self
                .entries
                .iter()
                .filter(|e| e.enabled)
                .map(|e| e.mutator.kind())
                .collect(),
        }
    }

    /// Runs every snapshot-enabled mutator over `class` in registration
    /// order, sharing one seeded RNG across passes so the whole run is a
    /// deterministic function of (input, snapshot, seed). Model invariants
    /// are re-checked after each pass; a violation aborts the artifact.
    pub fn run(
        &self,
        class: &mut ClassModel,
        enabled: &EnabledSet,
        seed: u64,
    ) -> Result<Vec<MutatorKind>, ObfuscateError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut applied = Vec::new();
        for entry in &self.entries {
            let kind = entry.mutator.kind();
            if !enabled.contains(kind) {
                continue;
            }
            let changed = entry.mutator.apply(class, &mut rng)?;
            class.verify()?;
            debug!(mutator = %kind, changed, "mutation pass finished");
            if changed {
                applied.push(kind);
            }
        }
        Ok(applied)
    }
}

/// Immutable set of mutator kinds captured when a batch starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledSet {
    kinds: Vec<MutatorKind>,
}

impl EnabledSet {
    /// Every known kind.
    pub fn all() -> Self {
        Self {
            kinds: MutatorKind::ALL.to_vec(),
        }
    }

    pub fn none() -> Self {
        Self { kinds: Vec::new() }
    }

    pub fn contains(&self, kind: MutatorKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn kinds(&self) -> &[MutatorKind] {
        &self.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_is_literals_then_control_flow() {
        let registry = MutatorRegistry::default();
        let kinds: Vec<_> = registry.list().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![MutatorKind::LiteralConceal, MutatorKind::ControlFlowConceal]
        );
        assert!(registry.list().iter().all(|&(_, enabled)| enabled));
    }

    #[test]
    fn set_enabled_unknown_kind_fails() {
        let mut registry = MutatorRegistry::empty();
        assert!(matches!(
            registry.set_enabled(MutatorKind::LiteralConceal, false),
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.get(MutatorKind::LiteralConceal),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn snapshot_is_isolated_from_later_toggles() {
        let mut registry = MutatorRegistry::default();
        let snapshot = registry.snapshot();
        registry
            .set_enabled(MutatorKind::ControlFlowConceal, false)
            .unwrap();
        assert!(snapshot.contains(MutatorKind::ControlFlowConceal));
        assert!(!registry.snapshot().contains(MutatorKind::ControlFlowConceal));
    }

    #[test]
    fn get_is_idempotent() {
        let registry = MutatorRegistry::default();
        let a = registry.get(MutatorKind::LiteralConceal).unwrap().kind();
        let b = registry.get(MutatorKind::LiteralConceal).unwrap().kind();
        assert_eq!(a, b);
        assert_eq!(a, MutatorKind::LiteralConceal);
    }
}
