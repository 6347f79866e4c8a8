//! Node spec parsing, table driven with rstest.

use arbor_kernel::nodespec::{MAX_SELECTED, NodeSpecError, parse, validate};
use rstest::rstest;

/// Flatten a parse into `(nodes, sub_spec)` pairs for compact expectations.
fn flat(text: &str) -> Vec<(Vec<String>, String)> {
    parse(text)
        .unwrap_or_else(|e| panic!("'{text}' should parse: {e}"))
        .into_iter()
        .map(|s| (s.nodes, s.sub_spec))
        .collect()
}

fn sel(nodes: &[&str], sub: &str) -> (Vec<String>, String) {
    (nodes.iter().map(|n| n.to_string()).collect(), sub.to_string())
}

// ============================================================================
// Accepted specs
// ============================================================================

#[rstest]
#[case::literal("7", vec![sel(&["7"], "")])]
#[case::range("1-3", vec![sel(&["1", "2", "3"], "")])]
#[case::one_element_range("4-4", vec![sel(&["4"], "")])]
#[case::wildcard(".", vec![sel(&["."], "")])]
#[case::sub_spec("1-2/1-40", vec![sel(&["1", "2"], "1-40")])]
#[case::nested_sub_spec("1/2/3", vec![sel(&["1"], "2/3")])]
#[case::alternatives("1-2,7,.", vec![sel(&["1", "2"], ""), sel(&["7"], ""), sel(&["."], "")])]
#[case::empty_alternatives("1,,2", vec![sel(&["1"], ""), sel(&["2"], "")])]
#[case::whitespace(" 1 - 2 / 5 ", vec![sel(&["1", "2"], "5")])]
#[case::wildcard_with_sub_spec("./1", vec![sel(&["."], "1")])]
#[case::empty("", vec![])]
fn accepted(#[case] text: &str, #[case] expected: Vec<(Vec<String>, String)>) {
    assert_eq!(flat(text), expected);
}

// ============================================================================
// Rejected specs
// ============================================================================

#[rstest]
#[case::reversed("3-1", NodeSpecError::BadRange { begin: 3, end: 1 })]
#[case::reversed_among_good("1-2,5-4,7", NodeSpecError::BadRange { begin: 5, end: 4 })]
#[case::not_a_number("a-3", NodeSpecError::NotANumber("a".into()))]
#[case::missing_end("2-", NodeSpecError::NotANumber("".into()))]
#[case::oversized_range("1-9000000000", NodeSpecError::TooMany { limit: MAX_SELECTED })]
#[case::ranges_add_up("1-40000,40001-80000", NodeSpecError::TooMany { limit: MAX_SELECTED })]
fn rejected(#[case] text: &str, #[case] expected: NodeSpecError) {
    assert_eq!(parse(text).unwrap_err(), expected);
}

#[rstest]
#[case::top_level("3-1", false)]
#[case::one_level_down("1/3-1", false)]
#[case::two_levels_down("1/2/9-8", false)]
#[case::fine("1-3/1-40,.", true)]
#[case::oversized_below("1/1-9000000000", false)]
fn validate_looks_through_sub_specs(#[case] text: &str, #[case] ok: bool) {
    // parse alone treats the sub-spec as opaque text.
    assert!(parse(text).is_ok() || !ok);
    assert_eq!(validate(text).is_ok(), ok);
}

#[test]
fn bad_range_message_names_the_range() {
    let err = parse("3-1").unwrap_err();
    assert!(err.to_string().starts_with("bad range 3-1"));
}

#[test]
fn oversized_spec_is_refused_as_a_bad_range() {
    // The root rejects by message, so the cap must read as a bad range.
    let err = validate("1-9000000000").unwrap_err();
    assert!(err.to_string().starts_with("bad range"));
}
