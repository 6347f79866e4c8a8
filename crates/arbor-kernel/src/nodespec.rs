//! Node selection language.
//!
//! A spec is a comma-separated list of alternatives. Each alternative picks
//! nodes at this level and may carry a sub-spec for the level below:
//!
//! ```text
//!   1-3/1-40,7,.
//!   │   │    │ └─ wildcard: every known child
//!   │   │    └─── literal token
//!   │   └──────── sub-spec, handed to the selected children verbatim
//!   └──────────── inclusive integer range
//! ```
//!
//! Precedence, lowest to highest: `,` then `/` then `-`. The sub-spec is only
//! split off at the first `/`, so `"1/2/3"` selects node `1` with sub-spec
//! `"2/3"`.

use thiserror::Error;

/// Wildcard alternative meaning "all currently known children".
pub const WILDCARD: &str = ".";

/// One alternative of a parsed spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Node tokens at this level, ranges already expanded.
    pub nodes: Vec<String>,
    /// Spec for the level below, or empty.
    pub sub_spec: String,
}

impl Selection {
    pub fn is_wildcard(&self) -> bool {
        self.nodes.len() == 1 && self.nodes[0] == WILDCARD
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeSpecError {
    #[error("bad range {begin}-{end}: end is before begin")]
    BadRange { begin: i64, end: i64 },

    #[error("bad range bound '{0}': not an integer")]
    NotANumber(String),

    #[error("bad range: spec selects more than {limit} nodes at one level")]
    TooMany { limit: u64 },
}

/// Most nodes the ranges of one level may select together.
///
/// Ranges are expanded into tokens, so this bounds what a single spec can
/// make a node allocate.
pub const MAX_SELECTED: u64 = 65_536;

/// Parse a node spec into its alternatives.
///
/// The whole spec is rejected if any range is malformed; callers never see a
/// partial selection.
pub fn parse(text: &str) -> Result<Vec<Selection>, NodeSpecError> {
    // Check every bound first so nothing is expanded for a spec that fails.
    let mut tokens = Vec::new();
    let mut selected = 0u64;
    for (range, sub_spec) in alternatives(text) {
        let token = Token::parse(range)?;
        selected = selected.saturating_add(token.width());
        if selected > MAX_SELECTED {
            return Err(NodeSpecError::TooMany { limit: MAX_SELECTED });
        }
        tokens.push((token, sub_spec));
    }

    Ok(tokens
        .into_iter()
        .map(|(token, sub_spec)| Selection {
            nodes: token.expand(),
            sub_spec: sub_spec.to_string(),
        })
        .collect())
}

/// Check a spec and every nested sub-spec, without keeping the result.
///
/// `parse` treats sub-specs as opaque text; the root uses this to refuse a
/// spec whose bad range sits several levels down before anything is sent.
/// Nothing is expanded and sub-specs are borrowed, so arbitrarily deep specs
/// cost one pending slice per level.
pub fn validate(text: &str) -> Result<(), NodeSpecError> {
    let mut pending = vec![text];
    while let Some(spec) = pending.pop() {
        let mut selected = 0u64;
        for (range, sub_spec) in alternatives(spec) {
            selected = selected.saturating_add(Token::parse(range)?.width());
            if selected > MAX_SELECTED {
                return Err(NodeSpecError::TooMany { limit: MAX_SELECTED });
            }
            if !sub_spec.is_empty() {
                pending.push(sub_spec);
            }
        }
    }
    Ok(())
}

/// Non-empty alternatives of `text`, split into range part and sub-spec.
fn alternatives(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.split(',')
        .map(str::trim)
        .filter(|alternative| !alternative.is_empty())
        .map(|alternative| match alternative.split_once('/') {
            Some((range, sub)) => (range.trim(), sub.trim()),
            None => (alternative, ""),
        })
}

/// Range part of one alternative, bounds checked but not yet expanded.
enum Token<'a> {
    Literal(&'a str),
    Range(i64, i64),
}

impl<'a> Token<'a> {
    fn parse(range: &'a str) -> Result<Self, NodeSpecError> {
        let Some((begin, end)) = range.split_once('-') else {
            return Ok(Token::Literal(range));
        };
        let (begin, end) = (begin.trim(), end.trim());
        let b: i64 = begin
            .parse()
            .map_err(|_| NodeSpecError::NotANumber(begin.to_string()))?;
        let e: i64 = end
            .parse()
            .map_err(|_| NodeSpecError::NotANumber(end.to_string()))?;

        if e < b {
            return Err(NodeSpecError::BadRange { begin: b, end: e });
        }
        Ok(Token::Range(b, e))
    }

    /// Nodes a range selects. Literals are bounded by the text itself.
    fn width(&self) -> u64 {
        match self {
            Token::Literal(_) => 0,
            Token::Range(b, e) => u64::try_from(i128::from(*e) - i128::from(*b) + 1).unwrap_or(u64::MAX),
        }
    }

    fn expand(self) -> Vec<String> {
        match self {
            Token::Literal(text) => vec![text.to_string()],
            Token::Range(b, e) => (b..=e).map(|n| n.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal() {
        let sel = parse("node7").unwrap();
        assert_eq!(sel.len(), 1);
        assert_eq!(sel[0].nodes, vec!["node7"]);
        assert!(sel[0].sub_spec.is_empty());
    }

    #[test]
    fn test_range_expands_inclusive() {
        let sel = parse("1-3").unwrap();
        assert_eq!(sel[0].nodes, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_single_element_range() {
        let sel = parse("5-5").unwrap();
        assert_eq!(sel[0].nodes, vec!["5"]);
    }

    #[test]
    fn test_bad_range_rejects_whole_spec() {
        let err = parse("1-2,3-1").unwrap_err();
        assert_eq!(err, NodeSpecError::BadRange { begin: 3, end: 1 });
        assert!(err.to_string().contains("bad range"));
    }

    #[test]
    fn test_sub_spec_is_not_expanded() {
        let sel = parse("1-2/3-9").unwrap();
        assert_eq!(sel[0].nodes, vec!["1", "2"]);
        assert_eq!(sel[0].sub_spec, "3-9");
    }

    #[test]
    fn test_sub_spec_splits_at_first_slash() {
        let sel = parse("1/2/3").unwrap();
        assert_eq!(sel[0].nodes, vec!["1"]);
        assert_eq!(sel[0].sub_spec, "2/3");
    }

    #[test]
    fn test_wildcard_is_not_expanded() {
        let sel = parse(".").unwrap();
        assert!(sel[0].is_wildcard());
        assert_eq!(sel[0].nodes, vec!["."]);
    }

    #[test]
    fn test_empty_alternatives_skipped() {
        let sel = parse("1,,2, ").unwrap();
        assert_eq!(sel.len(), 2);
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_validate_descends_into_sub_specs() {
        assert!(validate("1-3/1-40/2").is_ok());
        assert_eq!(
            validate("1-3/5-2").unwrap_err(),
            NodeSpecError::BadRange { begin: 5, end: 2 }
        );
    }

    #[test]
    fn test_range_width_is_capped() {
        let top = MAX_SELECTED as i64;
        assert_eq!(parse(&format!("1-{top}")).unwrap()[0].nodes.len(), MAX_SELECTED as usize);
        assert_eq!(
            parse(&format!("1-{}", top + 1)).unwrap_err(),
            NodeSpecError::TooMany { limit: MAX_SELECTED }
        );
        assert_eq!(
            parse("0-9223372036854775807").unwrap_err(),
            NodeSpecError::TooMany { limit: MAX_SELECTED }
        );
    }

    #[test]
    fn test_validate_deep_spec() {
        let deep = vec!["1"; 100_000].join("/");
        assert!(validate(&deep).is_ok());
        assert!(validate(&format!("{deep}/9-8")).is_err());
    }

    #[test]
    fn test_non_numeric_range_bound() {
        assert_eq!(
            parse("a-3").unwrap_err(),
            NodeSpecError::NotANumber("a".to_string())
        );
    }
}
