//! Ref and ref-change types shared by every protocol version and transport.

use std::fmt;

use crate::error::WireError;

/// The all-zero object id, used to signal "no such object" on one side of a
/// [`RefChange`].
pub const NULL_OBJECT_ID: &str = "0000000000000000000000000000000000000000";

/// Minimum accepted width of a hex object id (the legacy hash family).
const MIN_OID_LEN: usize = 40;

/// A named reference and the object id it currently points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ref {
    /// Ref name, e.g. `refs/heads/main` or the `HEAD` sentinel.
    pub name: String,
    /// Lowercase hex object id.
    pub object_id: String,
}

impl Ref {
    /// Construct a `Ref`, validating `object_id`'s shape.
    ///
    /// # Errors
    ///
    /// [`WireError::MalformedObjectId`] if `object_id` is not lowercase hex
    /// of at least [`MIN_OID_LEN`] characters.
    pub fn new(name: impl Into<String>, object_id: impl Into<String>) -> Result<Self, WireError> {
        let object_id = object_id.into();
        validate_object_id(&object_id)?;
        Ok(Self { name: name.into(), object_id })
    }

    /// Parse a ref-advertisement line of the form `"<object-id> <name>"`.
    ///
    /// # Errors
    ///
    /// [`WireError::MalformedRefLine`] if the line does not split into
    /// exactly two whitespace-separated fields, or
    /// [`WireError::MalformedObjectId`] if the first field isn't a valid
    /// object id.
    pub fn parse_line(line: &str) -> Result<Self, WireError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut parts = line.splitn(2, ' ');
        let (Some(object_id), Some(name)) = (parts.next(), parts.next()) else {
            return Err(WireError::MalformedRefLine(line.to_string()));
        };
        if name.is_empty() {
            return Err(WireError::MalformedRefLine(line.to_string()));
        }
        Self::new(name, object_id)
    }
}

fn validate_object_id(oid: &str) -> Result<(), WireError> {
    if oid.len() < MIN_OID_LEN || !oid.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        return Err(WireError::MalformedObjectId(oid.to_string()));
    }
    Ok(())
}

/// Classification of a [`RefChange`], derived from which endpoints are null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefChangeKind {
    /// `old == NULL_OBJECT_ID`: the ref does not exist on the target yet.
    Create,
    /// `new == NULL_OBJECT_ID`: the ref should be removed from the target.
    Delete,
    /// Neither endpoint is null: the ref moves from one object to another.
    Update,
}

/// A single reference mutation to apply to the target repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefChange {
    /// Ref name being mutated.
    pub ref_name: String,
    /// Object id the target currently has (or [`NULL_OBJECT_ID`] for a
    /// create).
    pub old: String,
    /// Object id the target should have after the push (or
    /// [`NULL_OBJECT_ID`] for a delete).
    pub new: String,
}

impl RefChange {
    /// Construct a `RefChange`.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if both `old` and `new` are
    /// [`NULL_OBJECT_ID`] — that combination is undefined per the wire
    /// protocol and must never be emitted by the ref-diffing logic in
    /// `gitmirror-core`.
    #[must_use]
    pub fn new(ref_name: impl Into<String>, old: impl Into<String>, new: impl Into<String>) -> Self {
        let old = old.into();
        let new = new.into();
        debug_assert!(
            old != NULL_OBJECT_ID || new != NULL_OBJECT_ID,
            "a RefChange must not have both endpoints null"
        );
        Self { ref_name: ref_name.into(), old, new }
    }

    /// Classify this change as a create, delete, or update.
    #[must_use]
    pub fn kind(&self) -> RefChangeKind {
        if self.old == NULL_OBJECT_ID {
            RefChangeKind::Create
        } else if self.new == NULL_OBJECT_ID {
            RefChangeKind::Delete
        } else {
            RefChangeKind::Update
        }
    }

    /// Render as `"<old> <new> <ref>"`, the literal line the push machine
    /// places on the wire (§4.5).
    #[must_use]
    pub fn to_command_line(&self) -> String {
        format!("{} {} {}", self.old, self.new, self.ref_name)
    }
}

impl fmt::Display for RefChange {
    /// Short human-readable form used in log messages, e.g.
    /// `refs/heads/main: 1234567..89abcde`, with object ids shortened to 7
    /// hex characters. This format is original to this crate.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn short(oid: &str) -> &str {
            oid.get(..7).unwrap_or(oid)
        }
        match self.kind() {
            RefChangeKind::Create => write!(f, "{}: (new) {}", self.ref_name, short(&self.new)),
            RefChangeKind::Delete => write!(f, "{}: {} (deleted)", self.ref_name, short(&self.old)),
            RefChangeKind::Update => {
                write!(f, "{}: {}..{}", self.ref_name, short(&self.old), short(&self.new))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ref_line() {
        let r =
            Ref::parse_line("f8355e1c2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c refs/heads/main").unwrap();
        assert_eq!(r.name, "refs/heads/main");
        assert_eq!(r.object_id, "f8355e1c2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c");
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(matches!(Ref::parse_line("nospace"), Err(WireError::MalformedRefLine(_))));
    }

    #[test]
    fn rejects_uppercase_object_id() {
        let err = Ref::new("refs/heads/main", "F8355E1C2F3A4B5C6D7E8F9A0B1C2D3E4F5A6B7C");
        assert!(matches!(err, Err(WireError::MalformedObjectId(_))));
    }

    #[test]
    fn classifies_create_delete_update() {
        let create = RefChange::new("refs/heads/a", NULL_OBJECT_ID, "a".repeat(40));
        assert_eq!(create.kind(), RefChangeKind::Create);

        let delete = RefChange::new("refs/heads/a", "a".repeat(40), NULL_OBJECT_ID);
        assert_eq!(delete.kind(), RefChangeKind::Delete);

        let update = RefChange::new("refs/heads/a", "a".repeat(40), "b".repeat(40));
        assert_eq!(update.kind(), RefChangeKind::Update);
    }

    #[test]
    fn display_short_hashes() {
        let update = RefChange::new(
            "refs/heads/main",
            "f8355e1c2f3a4b5c6d7e8f9a0b1c2d3e4f5a6b7c",
            "28d14065abc4b5c6d7e8f9a0b1c2d3e4f5a6b7c8",
        );
        assert_eq!(update.to_string(), "refs/heads/main: f8355e1..28d1406");
    }
}
