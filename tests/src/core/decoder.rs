use crate::fixtures;
use classcloak_core::{decode, encode};
use classcloak_utils::errors::ParseError;

/// Hand-assembled minimal artifact: `class Tiny extends java.lang.Object`
/// with no members and no attributes.
const TINY: &str = "cafebabe00000034000501000454696e790700010100106a6176612f6c616e672f\
                    4f626a6563740700030021000200040000000000000000";

fn tiny_bytes() -> Vec<u8> {
    hex::decode(TINY).unwrap()
}

#[test]
fn decodes_handwritten_minimal_class() {
    let class = decode(&tiny_bytes()).unwrap();
    assert_eq!(class.this_class_name(), Some("Tiny"));
    assert_eq!(class.pool.class_name(class.super_class), Some("java/lang/Object"));
    assert_eq!(class.major, 52);
    assert!(class.methods.is_empty());
    assert!(class.fields.is_empty());
}

#[test]
fn minimal_class_round_trips_byte_for_byte() {
    let bytes = tiny_bytes();
    let class = decode(&bytes).unwrap();
    assert_eq!(encode(&class).unwrap(), bytes);
}

#[test]
fn rejects_bad_magic() {
    let mut bytes = tiny_bytes();
    bytes[0] = 0xde;
    assert!(matches!(decode(&bytes), Err(ParseError::BadMagic(_))));
}

#[test]
fn rejects_future_class_version() {
    let mut bytes = tiny_bytes();
    // Major version lives at offset 6.
    bytes[6] = 0x01;
    assert!(matches!(
        decode(&bytes),
        Err(ParseError::UnsupportedVersion { .. })
    ));
}

#[test]
fn rejects_unknown_constant_tag() {
    let mut bytes = tiny_bytes();
    // First pool tag follows the 10-byte header.
    bytes[10] = 0x02;
    assert!(matches!(
        decode(&bytes),
        Err(ParseError::BadConstantTag { tag: 0x02, index: 1 })
    ));
}

#[test]
fn rejects_trailing_garbage() {
    let mut bytes = tiny_bytes();
    bytes.extend_from_slice(&[0, 0, 0]);
    assert!(matches!(decode(&bytes), Err(ParseError::TrailingBytes(3))));
}

#[test]
fn every_truncated_prefix_is_rejected() {
    fixtures::init_tracing();
    let bytes = fixtures::greeter_bytes();
    for len in 0..bytes.len() {
        assert!(
            decode(&bytes[..len]).is_err(),
            "prefix of {len} bytes decoded successfully"
        );
    }
}

#[test]
fn round_trip_preserves_structure() {
    let original = fixtures::greeter_class();
    let decoded = decode(&encode(&original).unwrap()).unwrap();

    assert_eq!(decoded.this_class_name(), original.this_class_name());
    assert_eq!(decoded.methods.len(), original.methods.len());
    for (a, b) in original.methods.iter().zip(&decoded.methods) {
        assert_eq!(original.member_name(a), decoded.member_name(b));
        let (abody, bbody) = (a.body.as_ref().unwrap(), b.body.as_ref().unwrap());
        assert_eq!(abody.insn_count(), bbody.insn_count());
        assert_eq!(abody.exceptions.len(), bbody.exceptions.len());
        assert_eq!(abody.line_numbers.len(), bbody.line_numbers.len());
    }
}

#[test]
fn reencoding_a_decoded_class_is_stable() {
    let first = fixtures::greeter_bytes();
    let second = encode(&decode(&first).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn recomputes_stack_and_local_limits() {
    let decoded = decode(&fixtures::greeter_bytes()).unwrap();
    let body_of = |name: &str| {
        decoded
            .methods
            .iter()
            .find(|m| decoded.member_name(m) == name)
            .and_then(|m| m.body.as_ref())
            .unwrap()
    };
    // Fixture bodies carry advisory zeros; the encoder writes analyzed values.
    assert_eq!(body_of("big").max_stack, 2);
    assert_eq!(body_of("magic").max_stack, 1);
    assert_eq!(body_of("greet").max_stack, 1);
    assert_eq!(body_of("greet").max_locals, 1);
    assert_eq!(body_of("<init>").max_locals, 1);
}
