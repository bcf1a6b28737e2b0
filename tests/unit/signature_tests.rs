//! Unit tests for byte-pattern signatures.

use fenix::client::patterns::{SignatureConfig, SignatureSet};
use fenix::memory::{RelativeAddress, Signature};
use fenix::AppError;

#[test]
fn wildcards_match_any_byte() {
    let signature = Signature::parse("80 3d ?? ?? ?? ?? ?? 74").unwrap();
    assert_eq!(signature.len(), 8);
    assert!(signature.matches(&[0x80, 0x3d, 1, 2, 3, 4, 5, 0x74]));
    assert!(!signature.matches(&[0x80, 0x3d, 1, 2, 3, 4, 5, 0x75]));
    assert!(!signature.matches(&[0x80, 0x3d]));
}

#[test]
fn single_question_mark_is_a_wildcard() {
    let signature = Signature::parse("ff ? 05").unwrap();
    assert_eq!(signature.to_string(), "ff ?? 05");
}

#[test]
fn first_match_offset_is_returned() {
    let signature: Signature = "c3 ?? c3".parse().unwrap();
    let haystack = [0x90, 0xc3, 0x00, 0x90, 0xc3, 0x11, 0xc3, 0xc3, 0x22, 0xc3];
    assert_eq!(signature.find_in(&haystack), Some(RelativeAddress(4)));
    assert_eq!(signature.find_in(&haystack[..6]), None);
    assert_eq!(signature.find_in(&[]), None);
}

#[test]
fn match_at_the_very_end_is_found() {
    let signature = Signature::parse("aa bb").unwrap();
    assert_eq!(signature.find_in(&[0, 0, 0xaa, 0xbb]), Some(RelativeAddress(2)));
}

#[test]
fn display_round_trips_through_parse() {
    let text = "8b 35 ?? ?? ?? ?? 33 db";
    let signature = Signature::parse("8B 35 ?? ?? ?? ?? 33 DB").unwrap();
    assert_eq!(signature.to_string(), text);
}

#[test]
fn malformed_signatures_are_config_errors() {
    for text in ["", "   ", "?? ??", "zz 00", "123", "0x90", "+f", "90 -1"] {
        let err = Signature::parse(text).unwrap_err();
        assert!(matches!(err, AppError::Config(_)), "{text:?}: {err}");
    }
}

#[test]
fn builtin_set_has_operand_at_offset_two() {
    let set = SignatureSet::builtin().unwrap();
    for signature in [
        &set.interpreter_state,
        &set.game_state,
        &set.focused_widget,
        &set.loading_screen,
        &set.glue_state,
    ] {
        let operand = signature.to_string();
        let tokens: Vec<&str> = operand.split(' ').collect();
        assert!(tokens[..2].iter().all(|t| *t != "??"), "{operand}");
        assert!(tokens[2..6].iter().all(|t| *t == "??"), "{operand}");
    }
}

#[test]
fn default_config_compiles_to_builtin_set() {
    let compiled = SignatureConfig::default().compile().unwrap();
    assert_eq!(compiled, SignatureSet::builtin().unwrap());
}
