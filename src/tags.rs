//! Codec for the delimiter-separated fund reference lists stored on manual steps.
//!
//! The `manual.fund_abbr` column holds zero or more fund abbreviations separated
//! by whitespace and/or commas. Everything inside the crate works on [`TagSet`];
//! the raw string only exists at the storage boundary.

use std::collections::BTreeSet;
use std::fmt;

/// Ordered, de-duplicated set of fund abbreviation tokens.
///
/// Matching is exact and case-sensitive: `"abc"` and `"ABC"` are different tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tokens: BTreeSet<String>,
}

impl TagSet {
    /// Parses a raw reference list. `None` and blank input yield the empty set.
    pub fn parse(raw: Option<&str>) -> Self {
        let tokens = raw
            .unwrap_or_default()
            .split(is_delimiter)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect();
        Self { tokens }
    }

    /// Deterministic rendering: tokens in lexical order joined by a single space.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (idx, token) in self.tokens.iter().enumerate() {
            if idx > 0 {
                out.push(' ');
            }
            out.push_str(token);
        }
        out
    }

    /// Serialized form, or `None` when the set is empty.
    pub fn to_column(&self) -> Option<String> {
        (!self.is_empty()).then(|| self.serialize())
    }

    /// Exact-token membership test.
    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    /// Returns a copy of the set without `token`. Absent tokens are a no-op.
    pub fn without(&self, token: &str) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.remove(token);
        Self { tokens }
    }

    /// Number of distinct tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the set holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Iterates tokens in serialization order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::parse(Some(
            &iter
                .into_iter()
                .map(Into::into)
                .collect::<Vec<String>>()
                .join(" "),
        ))
    }
}

/// `serialize(parse(raw) \ {token})`.
pub fn remove(raw: Option<&str>, token: &str) -> String {
    TagSet::parse(raw).without(token).serialize()
}

/// Whether a raw reference list carries `token` as a whole token.
pub fn references(raw: Option<&str>, token: &str) -> bool {
    TagSet::parse(raw).contains(token)
}

fn is_delimiter(ch: char) -> bool {
    ch == ',' || ch.is_whitespace()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_mixed_delimiters() {
        let tags = TagSet::parse(Some("  ABC,XYZ ,  , DEF\tGHI\n"));
        assert_eq!(tags.iter().collect::<Vec<_>>(), vec!["ABC", "DEF", "GHI", "XYZ"]);
    }

    #[test]
    fn blank_and_missing_input_is_empty() {
        assert!(TagSet::parse(None).is_empty());
        assert!(TagSet::parse(Some("")).is_empty());
        assert!(TagSet::parse(Some(" , ,\t")).is_empty());
        assert_eq!(TagSet::parse(Some(" ,")).to_column(), None);
    }

    #[test]
    fn reparse_yields_same_set() {
        let inputs = [
            "ABC",
            "  ABC XYZ  ",
            "ABC,,XYZ",
            ",ABC , XYZ,ABC,",
            "a b\u{3000}c",
            "ทุน1, ทุน2",
        ];
        for raw in inputs {
            let first = TagSet::parse(Some(raw));
            let second = TagSet::parse(Some(&first.serialize()));
            assert_eq!(first, second, "round trip changed {raw:?}");
        }
    }

    #[test]
    fn serialize_is_single_space_joined() {
        let tags = TagSet::parse(Some("XYZ,  ABC"));
        assert_eq!(tags.serialize(), "ABC XYZ");
        assert_eq!(tags.to_string(), "ABC XYZ");
    }

    #[test]
    fn remove_absent_token_keeps_set() {
        let raw = "ABC, XYZ";
        assert_eq!(
            TagSet::parse(Some(&remove(Some(raw), "QQQ"))),
            TagSet::parse(Some(raw))
        );
    }

    #[test]
    fn remove_drops_only_exact_token() {
        assert_eq!(remove(Some("ABC ABCD XABC"), "ABC"), "ABCD XABC");
        assert_eq!(remove(Some("ABC"), "ABC"), "");
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert!(!references(Some("abc"), "ABC"));
        assert!(references(Some("abc ABC"), "ABC"));
    }

    #[test]
    fn collects_from_iterator() {
        let tags: TagSet = ["XYZ", "ABC", "XYZ"].into_iter().collect();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.serialize(), "ABC XYZ");
    }
}
