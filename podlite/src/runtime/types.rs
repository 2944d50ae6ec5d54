//! Core identifier types for the runtime layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::util::new_vm_id;

/// VM identifier: `vm-` followed by 10 random alpha characters.
///
/// The format is part of the control interface: responses on the status
/// channel are matched against it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmId(String);

impl VmId {
    /// Total length: `vm-` prefix plus 10 alpha characters.
    pub const FULL_LENGTH: usize = 13;

    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(new_vm_id())
    }

    /// Parse a VmId from an existing string.
    ///
    /// Returns `None` unless the string is `vm-` plus 10 alpha characters.
    pub fn parse(s: &str) -> Option<Self> {
        if Self::is_valid(s) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == Self::FULL_LENGTH
            && s.starts_with("vm-")
            && s[3..].chars().all(|c| c.is_ascii_alphabetic())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmId({})", self.0)
    }
}

impl AsRef<str> for VmId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_id_new() {
        let id1 = VmId::new();
        let id2 = VmId::new();

        assert_eq!(id1.as_str().len(), VmId::FULL_LENGTH);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_vm_id_parse() {
        assert!(VmId::parse("vm-abcdeFGHIJ").is_some());
        assert!(VmId::parse("vm-abc").is_none());
        assert!(VmId::parse("xx-abcdefghij").is_none());
        assert!(VmId::parse("vm-abcde1ghij").is_none());
    }
}
