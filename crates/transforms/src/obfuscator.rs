//! Decode, mutate, re-encode: the one-artifact pipeline.

use crate::registry::{EnabledSet, MutatorRegistry};
use crate::MutatorKind;
use classcloak_core::{decoder, encoder};
use classcloak_utils::errors::ObfuscateError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Per-batch configuration: the deterministic seed plus the frozen set of
/// enabled mutator kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationConfig {
    pub seed: u64,
    pub enabled: EnabledSet,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            enabled: EnabledSet::all(),
        }
    }
}

/// Output bytes plus a serializable run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationOutcome {
    pub bytes: Vec<u8>,
    pub original_size: usize,
    pub obfuscated_size: usize,
    pub size_increase_percentage: f64,
    pub mutators_applied: Vec<MutatorKind>,
    pub seed_used: u64,
}

/// Runs one class artifact through decode, the enabled mutation passes, and
/// re-encode. Identical input bytes, snapshot, and seed produce identical
/// output bytes.
pub fn obfuscate_class(
    bytes: &[u8],
    registry: &MutatorRegistry,
    config: &ObfuscationConfig,
) -> Result<ObfuscationOutcome, ObfuscateError> {
    let original_size = bytes.len();
    let mut class = decoder::decode(bytes)?;
    debug!(
        class = class.this_class_name().unwrap_or("<unnamed>"),
        size = original_size,
        seed = config.seed,
        "decoded class artifact"
    );

    let mutators_applied = registry.run(&mut class, &config.enabled, config.seed)?;
    let out = encoder::encode(&class)?;

    let obfuscated_size = out.len();
    let size_increase_percentage = if original_size > 0 {
        (obfuscated_size as f64 - original_size as f64) / original_size as f64 * 100.0
    } else {
        0.0
    };
    debug!(
        size = obfuscated_size,
        delta = obfuscated_size as i64 - original_size as i64,
        applied = mutators_applied.len(),
        "encoded mutated artifact"
    );

    Ok(ObfuscationOutcome {
        bytes: out,
        original_size,
        obfuscated_size,
        size_increase_percentage,
        mutators_applied,
        seed_used: config.seed,
    })
}

/// Convenience entry point: stock registry, default configuration.
pub fn obfuscate(bytes: &[u8]) -> Result<Vec<u8>, ObfuscateError> {
    let registry = MutatorRegistry::default();
    let outcome = obfuscate_class(bytes, &registry, &ObfuscationConfig::default())?;
    Ok(outcome.bytes)
}

/// Machine-readable summary of one outcome.
pub fn summary_report(outcome: &ObfuscationOutcome) -> serde_json::Value {
    json!({
        "original_bytes": outcome.original_size,
        "obfuscated_bytes": outcome.obfuscated_size,
        "size_delta_bytes": outcome.obfuscated_size as i64 - outcome.original_size as i64,
        "percent_size": outcome.size_increase_percentage,
        "mutators_applied": outcome.mutators_applied,
        "seed_used": outcome.seed_used,
    })
}
