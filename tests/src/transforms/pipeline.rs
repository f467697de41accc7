use crate::fixtures;
use classcloak_core::decode;
use classcloak_transform::obfuscator::{
    obfuscate, obfuscate_class, summary_report, ObfuscationConfig,
};
use classcloak_transform::registry::{EnabledSet, MutatorRegistry};
use classcloak_transform::MutatorKind;

#[test]
fn obfuscated_class_still_decodes() {
    fixtures::init_tracing();
    let input = fixtures::greeter_bytes();
    let output = obfuscate(&input).unwrap();
    assert_ne!(output, input);

    let decoded = decode(&output).unwrap();
    assert_eq!(decoded.this_class_name(), Some("sample/Greeter"));
    // Every original method survives alongside the injected decoder.
    for name in ["<init>", "greet", "pick", "guarded", "big", "magic"] {
        assert!(decoded.methods.iter().any(|m| decoded.member_name(m) == name));
    }
}

#[test]
fn outcome_accounting_matches_the_bytes() {
    let input = fixtures::greeter_bytes();
    let registry = MutatorRegistry::default();
    let outcome = obfuscate_class(&input, &registry, &ObfuscationConfig::default()).unwrap();

    assert_eq!(outcome.original_size, input.len());
    assert_eq!(outcome.obfuscated_size, outcome.bytes.len());
    assert_eq!(outcome.seed_used, 42);
    assert_eq!(
        outcome.mutators_applied,
        vec![MutatorKind::LiteralConceal, MutatorKind::ControlFlowConceal]
    );
    assert!(outcome.size_increase_percentage > 0.0);
}

#[test]
fn identical_runs_produce_identical_bytes() {
    let input = fixtures::greeter_bytes();
    let registry = MutatorRegistry::default();
    let config = ObfuscationConfig::default();

    let first = obfuscate_class(&input, &registry, &config).unwrap();
    let second = obfuscate_class(&input, &registry, &config).unwrap();
    assert_eq!(first.bytes, second.bytes);

    let other = ObfuscationConfig {
        seed: 43,
        ..config.clone()
    };
    let third = obfuscate_class(&input, &registry, &other).unwrap();
    assert_ne!(first.bytes, third.bytes);
}

#[test]
fn concurrent_runs_match_sequential_output() {
    let input = fixtures::greeter_bytes();
    let registry = MutatorRegistry::default();
    let config = ObfuscationConfig::default();
    let expected = obfuscate_class(&input, &registry, &config).unwrap().bytes;

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| obfuscate_class(&input, &registry, &config).unwrap().bytes)
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    });
}

#[test]
fn empty_enabled_set_is_the_identity() {
    let input = fixtures::greeter_bytes();
    let registry = MutatorRegistry::default();
    let config = ObfuscationConfig {
        seed: 42,
        enabled: EnabledSet::none(),
    };
    let outcome = obfuscate_class(&input, &registry, &config).unwrap();
    assert_eq!(outcome.bytes, input);
    assert!(outcome.mutators_applied.is_empty());
    assert_eq!(outcome.size_increase_percentage, 0.0);
}

#[test]
fn disabled_mutator_is_skipped() {
    let input = fixtures::greeter_bytes();
    let mut registry = MutatorRegistry::default();
    registry
        .set_enabled(MutatorKind::ControlFlowConceal, false)
        .unwrap();
    let config = ObfuscationConfig {
        seed: 42,
        enabled: registry.snapshot(),
    };
    let outcome = obfuscate_class(&input, &registry, &config).unwrap();
    assert_eq!(outcome.mutators_applied, vec![MutatorKind::LiteralConceal]);
}

#[test]
fn summary_report_is_machine_readable() {
    let input = fixtures::greeter_bytes();
    let registry = MutatorRegistry::default();
    let config = ObfuscationConfig {
        seed: 9,
        enabled: EnabledSet::all(),
    };
    let outcome = obfuscate_class(&input, &registry, &config).unwrap();
    let report = summary_report(&outcome);

    assert_eq!(report["seed_used"], 9);
    assert_eq!(report["original_bytes"], input.len());
    assert_eq!(report["obfuscated_bytes"], outcome.bytes.len());
    assert!(report["mutators_applied"].is_array());
}
