//! Capability sets: the tokens a server advertises and a client selects from.

use std::collections::BTreeMap;

/// An immutable set of capability tokens, each either bare (`delete-refs`)
/// or `key=value` (`agent=git/x.y`).
///
/// Backed by a `BTreeMap` so iteration (and therefore any wire line built
/// from it) is in a deterministic, sorted order — §4.5 relies on this for
/// the first `want`/push-command line's capability list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    bare: std::collections::BTreeSet<String>,
    valued: BTreeMap<String, String>,
}

impl CapabilitySet {
    /// An empty capability set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space-separated capability line as seen in a v1 hello or v2
    /// capability-advertisement section.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut set = Self::new();
        for token in line.split_ascii_whitespace() {
            set.insert_token(token);
        }
        set
    }

    /// Insert a single token, splitting `key=value` forms automatically.
    pub fn insert_token(&mut self, token: &str) {
        if let Some((key, value)) = token.split_once('=') {
            self.valued.insert(key.to_string(), value.to_string());
        } else {
            self.bare.insert(token.to_string());
        }
    }

    /// True if a bare capability (or the key of a valued one) is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.bare.contains(name) || self.valued.contains_key(name)
    }

    /// The value of a `key=value` capability, if present.
    #[must_use]
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.valued.get(key).map(String::as_str)
    }

    /// Render this set's tokens as they would appear on the wire, sorted for
    /// determinism (bare tokens first, then `key=value` tokens, each
    /// alphabetical).
    #[must_use]
    pub fn to_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.bare.iter().cloned().collect();
        tokens.extend(self.valued.iter().map(|(k, v)| format!("{k}={v}")));
        tokens
    }

    /// Number of tokens in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bare.len() + self.valued.len()
    }

    /// True if the set has no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bare.is_empty() && self.valued.is_empty()
    }
}

/// Build a `CapabilitySet` from an iterator of bare or `key=value` token
/// strings.
impl<S: AsRef<str>> FromIterator<S> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut set = Self::new();
        for token in iter {
            set.insert_token(token.as_ref());
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_tokens() {
        let caps = CapabilitySet::parse("delete-refs side-band-64k agent=git/2.40.0");
        assert!(caps.contains("delete-refs"));
        assert!(caps.contains("side-band-64k"));
        assert_eq!(caps.value_of("agent"), Some("git/2.40.0"));
        assert_eq!(caps.len(), 3);
    }

    #[test]
    fn to_tokens_is_sorted() {
        let caps: CapabilitySet = ["b-cap", "agent=x", "a-cap"].into_iter().collect();
        assert_eq!(caps.to_tokens(), vec!["a-cap", "b-cap", "agent=x"]);
    }

    #[test]
    fn empty_set_has_no_tokens() {
        let caps = CapabilitySet::new();
        assert!(caps.is_empty());
        assert!(caps.to_tokens().is_empty());
    }
}
