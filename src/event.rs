//! Normalized change event vocabulary.
//!
//! Every OS backend translates its raw notification codes into this closed
//! set before anything reaches a [`ChangeSink`](crate::ChangeSink).

use std::fmt;

/// The kind of change observed under a watched root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// A file or directory appeared (including the new side of a rename).
    Created,
    /// A file or directory disappeared (including the old side of a rename).
    Removed,
    /// Contents or metadata of an entry changed.
    Modified,
    /// The watched root itself is no longer observable; consumers must
    /// re-scan it.
    Invalidated,
    /// The OS reported an action the engine does not map.
    Unknown,
    /// The OS dropped events; consumers must re-scan the affected root.
    Overflow,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeType::Created => "created",
            ChangeType::Removed => "removed",
            ChangeType::Modified => "modified",
            ChangeType::Invalidated => "invalidated",
            ChangeType::Unknown => "unknown",
            ChangeType::Overflow => "overflow",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_type_display() {
        assert_eq!(ChangeType::Created.to_string(), "created");
        assert_eq!(ChangeType::Overflow.to_string(), "overflow");
        assert_eq!(ChangeType::Invalidated.to_string(), "invalidated");
    }
}
