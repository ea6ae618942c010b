//! Ref include/exclude filtering by glob pattern.

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

/// A glob pattern failed to compile.
#[derive(Error, Debug)]
#[error("invalid ref filter pattern {pattern:?}: {source}")]
pub struct FilterError {
    pattern: String,
    #[source]
    source: globset::Error,
}

/// Selects ref names by glob: a name is selected iff it matches at least
/// one include pattern (or no include patterns were given at all) and
/// matches none of the exclude patterns.
pub struct RefFilter {
    include: GlobSet,
    has_include: bool,
    exclude: GlobSet,
}

impl RefFilter {
    /// Build a filter from include and exclude glob pattern lists.
    ///
    /// # Errors
    ///
    /// [`FilterError`] if any pattern fails to compile.
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self, FilterError> {
        Ok(Self {
            include: build(include)?,
            has_include: !include.is_empty(),
            exclude: build(exclude)?,
        })
    }

    /// True if `name` should be carried by the mirror.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        let included = !self.has_include || self.include.is_match(name);
        included && !self.exclude.is_match(name)
    }
}

fn build<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet, FilterError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let glob = Glob::new(pattern)
            .map_err(|source| FilterError { pattern: pattern.to_string(), source })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| FilterError { pattern: patterns.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(","), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_include_matches_everything_not_excluded() {
        let filter = RefFilter::new::<&str>(&[], &["refs/private/**"]).unwrap();
        assert!(filter.matches("refs/heads/main"));
        assert!(!filter.matches("refs/private/secret"));
    }

    #[test]
    fn include_restricts_to_matching_names() {
        let filter = RefFilter::new(&["refs/heads/**", "refs/tags/**"], &["refs/heads/wip-*"]).unwrap();
        assert!(filter.matches("refs/heads/main"));
        assert!(filter.matches("refs/tags/v1.0.0"));
        assert!(!filter.matches("refs/heads/wip-foo"));
        assert!(!filter.matches("refs/notes/commits"));
    }
}
