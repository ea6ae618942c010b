//! Mirror ref diffing: deciding what a push needs to change.

use std::collections::BTreeMap;

use gitmirror_wire::{RefChange, NULL_OBJECT_ID};

use crate::filter::RefFilter;

/// Diff `mirror`'s current refs against `upstream`'s, filtered by `filter`,
/// and return the minimal set of changes that makes the mirror's filtered
/// ref set equal upstream's filtered ref set.
///
/// Every upstream ref the filter admits that's missing or stale on the
/// mirror becomes a create or update; every mirror ref not in that filtered
/// upstream set — matched by the filter or not — becomes a delete, since
/// mirroring means the target ends up exactly equal to the filtered source.
#[must_use]
pub fn calculate_mirror_updates(
    mirror: &BTreeMap<String, String>,
    upstream: &BTreeMap<String, String>,
    filter: &RefFilter,
) -> Vec<RefChange> {
    let target: BTreeMap<&str, &str> = upstream
        .iter()
        .filter(|(name, _)| filter.matches(name))
        .map(|(name, oid)| (name.as_str(), oid.as_str()))
        .collect();

    let mut changes = Vec::new();

    for (name, oid) in &target {
        match mirror.get(*name) {
            None => changes.push(RefChange::new(*name, NULL_OBJECT_ID, *oid)),
            Some(existing) if existing != oid => changes.push(RefChange::new(*name, existing.as_str(), *oid)),
            Some(_) => {},
        }
    }

    for (name, oid) in mirror {
        if !target.contains_key(name.as_str()) {
            changes.push(RefChange::new(name.as_str(), oid.as_str(), NULL_OBJECT_ID));
        }
    }

    changes.sort_by(|a, b| a.ref_name.cmp(&b.ref_name));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(n, o)| ((*n).to_string(), (*o).to_string())).collect()
    }

    fn no_filter() -> RefFilter {
        RefFilter::new::<&str>(&[], &[]).unwrap()
    }

    #[test]
    fn new_upstream_ref_is_a_create() {
        let mirror = refs(&[]);
        let upstream = refs(&[("refs/heads/main", &"a".repeat(40))]);
        let changes = calculate_mirror_updates(&mirror, &upstream, &no_filter());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old, NULL_OBJECT_ID);
    }

    #[test]
    fn moved_ref_is_an_update() {
        let mirror = refs(&[("refs/heads/main", &"a".repeat(40))]);
        let upstream = refs(&[("refs/heads/main", &"b".repeat(40))]);
        let changes = calculate_mirror_updates(&mirror, &upstream, &no_filter());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old, "a".repeat(40));
        assert_eq!(changes[0].new, "b".repeat(40));
    }

    #[test]
    fn stale_mirror_only_ref_is_a_delete() {
        let mirror = refs(&[("refs/heads/gone", &"a".repeat(40))]);
        let upstream = refs(&[]);
        let changes = calculate_mirror_updates(&mirror, &upstream, &no_filter());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new, NULL_OBJECT_ID);
    }

    #[test]
    fn identical_refs_produce_no_changes() {
        let both = refs(&[("refs/heads/main", &"a".repeat(40))]);
        assert!(calculate_mirror_updates(&both, &both, &no_filter()).is_empty());
    }

    #[test]
    fn is_idempotent_after_applying() {
        let mirror = refs(&[("refs/heads/old", &"a".repeat(40))]);
        let upstream = refs(&[("refs/heads/main", &"b".repeat(40)), ("refs/heads/old", &"a".repeat(40))]);
        let filter = no_filter();
        let first = calculate_mirror_updates(&mirror, &upstream, &filter);
        assert_eq!(first.len(), 1);

        let mut applied = mirror;
        for change in &first {
            applied.insert(change.ref_name.clone(), change.new.clone());
        }
        let second = calculate_mirror_updates(&applied, &upstream, &filter);
        assert!(second.is_empty());
    }

    #[test]
    fn excluded_mirror_ref_outside_filter_is_still_deleted() {
        let mirror = refs(&[("refs/heads/main", &"a".repeat(40)), ("refs/private/x", &"b".repeat(40))]);
        let upstream = refs(&[("refs/heads/main", &"a".repeat(40))]);
        let filter = RefFilter::new::<&str>(&[], &["refs/private/**"]).unwrap();
        let changes = calculate_mirror_updates(&mirror, &upstream, &filter);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].ref_name, "refs/private/x");
        assert_eq!(changes[0].new, NULL_OBJECT_ID);
    }
}
