//! The rule data model (spec §3 "Rule").
//!
//! A [`Rule`] is an ordered tuple of strings. Tuples are compared and
//! hashed structurally, and sort lexicographically by component — this
//! total order is what gives the field index and the persistent KV a
//! deterministic write sequence (spec I3).

use serde::{Deserialize, Serialize};

/// An ordered tuple of strings representing one authorization fact.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rule(pub Vec<String>);

impl Rule {
    pub fn new(values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Rule(values.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&str> {
        self.0.get(i).map(String::as_str)
    }

    /// Canonical on-disk byte encoding used as (part of) a `rules.db` key:
    /// each field is length-prefixed so that no value can inject a field
    /// separator and corrupt the key ordering (spec §6 "Persistent layout").
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for field in &self.0 {
            let bytes = field.as_bytes();
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
        }
        buf
    }

    /// Inverse of [`Rule::canonical_bytes`].
    pub fn from_canonical_bytes(mut bytes: &[u8]) -> Option<Rule> {
        let mut fields = Vec::new();
        while !bytes.is_empty() {
            if bytes.len() < 4 {
                return None;
            }
            let (len_bytes, rest) = bytes.split_at(4);
            let len = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
            if rest.len() < len {
                return None;
            }
            let (field, rest) = rest.split_at(len);
            fields.push(String::from_utf8(field.to_vec()).ok()?);
            bytes = rest;
        }
        Some(Rule(fields))
    }
}

impl From<Vec<String>> for Rule {
    fn from(v: Vec<String>) -> Self {
        Rule(v)
    }
}

impl From<Rule> for Vec<String> {
    fn from(r: Rule) -> Self {
        r.0
    }
}

/// `(sec, pType)` — names a bucket of rules (spec §3 "Section, PType").
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub sec: String,
    pub p_type: String,
}

impl BucketKey {
    pub fn new(sec: impl Into<String>, p_type: impl Into<String>) -> Self {
        BucketKey {
            sec: sec.into(),
            p_type: p_type.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_round_trip() {
        let rule = Rule::new(["alice", "data1", "read"]);
        let bytes = rule.canonical_bytes();
        assert_eq!(Rule::from_canonical_bytes(&bytes), Some(rule));
    }

    #[test]
    fn canonical_bytes_disambiguate_field_boundaries() {
        // Without length-prefixing, ("ab", "c") and ("a", "bc") would collide.
        let a = Rule::new(["ab", "c"]);
        let b = Rule::new(["a", "bc"]);
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn ordering_is_lexicographic_by_component() {
        let a = Rule::new(["alice", "data1", "read"]);
        let b = Rule::new(["bob", "data1", "read"]);
        assert!(a < b);
    }
}
