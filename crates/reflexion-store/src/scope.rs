//! Lesson partitioning key.
//!
//! A [`Scope`] pairs a task type with a short fingerprint of the evaluation
//! criteria. Lessons learned under one set of criteria never leak into
//! searches, dedup checks, or maintenance for another.

use std::fmt;

use ring::digest;
use serde::{Deserialize, Serialize};

/// Number of hex characters kept from the criteria digest.
pub const CRITERIA_HASH_LEN: usize = 8;

/// `(task_type, criteria_hash)` partition of the lesson memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub task_type: String,
    pub criteria_hash: String,
}

impl Scope {
    /// Build a scope from an already computed criteria hash.
    pub fn new(task_type: impl Into<String>, criteria_hash: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            criteria_hash: criteria_hash.into(),
        }
    }

    /// Build the scope for a task type and the raw criteria text.
    pub fn for_criteria(task_type: impl Into<String>, criteria: &str) -> Self {
        Self::new(task_type, criteria_hash(criteria))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_type, self.criteria_hash)
    }
}

/// First eight hex characters of the SHA-256 digest of `criteria`.
pub fn criteria_hash(criteria: &str) -> String {
    let digest = digest::digest(&digest::SHA256, criteria.as_bytes());
    let mut hex = String::with_capacity(CRITERIA_HASH_LEN);
    for byte in digest.as_ref().iter().take(CRITERIA_HASH_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_eight_lowercase_hex_chars() {
        let h = criteria_hash("Clear structure, cite sources");
        assert_eq!(h.len(), CRITERIA_HASH_LEN);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_matches_sha256_prefix() {
        // sha256("abc") = ba7816bf...
        assert_eq!(criteria_hash("abc"), "ba7816bf");
    }

    #[test]
    fn different_criteria_give_different_scopes() {
        let a = Scope::for_criteria("writing", "be concise");
        let b = Scope::for_criteria("writing", "be thorough");
        assert_ne!(a, b);
        assert_eq!(a, Scope::for_criteria("writing", "be concise"));
    }

    #[test]
    fn display_joins_with_slash() {
        let scope = Scope::new("writing", "deadbeef");
        assert_eq!(scope.to_string(), "writing/deadbeef");
    }
}
