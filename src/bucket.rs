//! In-memory rule bucket with a field index (spec §4.A).
//!
//! A bucket holds the set of rules for one `(sec, pType)` pair. Insertion,
//! deletion and filtered deletion are all O(matches) amortized thanks to
//! the per-field-position index; the index itself is never persisted
//! (spec I2 / §3 "PolicyDatabase") and is rebuilt from the rule set on load.

use std::collections::{BTreeSet, HashMap};

use crate::rule::Rule;

/// The set of rules for one `(sec, pType)` bucket, plus its field index.
#[derive(Debug, Default, Clone)]
pub struct RuleBucket {
    rules: BTreeSet<Rule>,
    /// `index[i][value]` = the set of rules with `value` at position `i`.
    index: Vec<HashMap<String, BTreeSet<Rule>>>,
}

impl RuleBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.rules.contains(rule)
    }

    /// Sorted view of every rule in the bucket — used by snapshot capture
    /// and by the persistent-store write path so that write order is
    /// deterministic across replicas (spec I3).
    pub fn iter_sorted(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    fn ensure_index_width(&mut self, width: usize) {
        if self.index.len() < width {
            self.index.resize_with(width, HashMap::new);
        }
    }

    fn index_insert(&mut self, rule: &Rule) {
        self.ensure_index_width(rule.len());
        for (i, value) in rule.0.iter().enumerate() {
            self.index[i]
                .entry(value.clone())
                .or_default()
                .insert(rule.clone());
        }
    }

    fn index_remove(&mut self, rule: &Rule) {
        for (i, value) in rule.0.iter().enumerate() {
            if let Some(set) = self.index.get_mut(i).and_then(|m| m.get_mut(value)) {
                set.remove(rule);
                if set.is_empty() {
                    self.index[i].remove(value);
                }
            }
        }
    }

    /// Insert `rule` if absent. Returns `true` if it was actually added.
    pub fn insert(&mut self, rule: Rule) -> bool {
        if self.rules.contains(&rule) {
            return false;
        }
        self.index_insert(&rule);
        self.rules.insert(rule);
        true
    }

    /// Remove `rule` if present. Returns `true` if it was actually removed.
    pub fn remove(&mut self, rule: &Rule) -> bool {
        if self.rules.remove(rule) {
            self.index_remove(rule);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.rules.clear();
        self.index.clear();
    }

    /// Resolve every rule matching a `removeFiltered` pattern (spec §4.A):
    /// for each offset `j`, if `field_values[j]` is non-empty then
    /// `rule[field_index + j]` must equal it; empty strings match
    /// anything; tuples shorter than `field_index + field_values.len()`
    /// never match.
    ///
    /// Intersects the smallest indexed candidate set first, falling back
    /// to a full scan when every `field_values[j]` is empty (the "match
    /// everything" boundary case).
    pub fn matching_filtered(&self, field_index: usize, field_values: &[String]) -> BTreeSet<Rule> {
        let min_len = field_index + field_values.len();

        let constraints: Vec<(usize, &str)> = field_values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .map(|(j, v)| (field_index + j, v.as_str()))
            .collect();

        if constraints.is_empty() {
            return self
                .rules
                .iter()
                .filter(|r| r.len() >= min_len)
                .cloned()
                .collect();
        }

        // Smallest candidate set first, by consulting the field index.
        let mut candidate_sets: Vec<&BTreeSet<Rule>> = Vec::with_capacity(constraints.len());
        for (pos, value) in &constraints {
            match self.index.get(*pos).and_then(|m| m.get(*value)) {
                Some(set) => candidate_sets.push(set),
                None => return BTreeSet::new(), // no rule has this (pos, value) at all
            }
        }
        candidate_sets.sort_by_key(|s| s.len());

        let mut result: BTreeSet<Rule> = candidate_sets[0]
            .iter()
            .filter(|r| r.len() >= min_len)
            .cloned()
            .collect();
        for set in &candidate_sets[1..] {
            result.retain(|r| set.contains(r));
        }
        result
    }

    /// Remove every rule matching the filter pattern. Returns the removed set.
    pub fn remove_filtered(&mut self, field_index: usize, field_values: &[String]) -> BTreeSet<Rule> {
        let matches = self.matching_filtered(field_index, field_values);
        for rule in &matches {
            self.remove(rule);
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(items: &[&str]) -> Rule {
        Rule::new(items.iter().copied())
    }

    #[test]
    fn insert_is_idempotent() {
        let mut b = RuleBucket::new();
        assert!(b.insert(r(&["alice", "data1", "read"])));
        assert!(!b.insert(r(&["alice", "data1", "read"])));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn remove_missing_is_noop() {
        let mut b = RuleBucket::new();
        assert!(!b.remove(&r(&["alice", "data1", "read"])));
    }

    #[test]
    fn filtered_removal_matches_full_scan() {
        let mut b = RuleBucket::new();
        b.insert(r(&["alice", "d1", "read"]));
        b.insert(r(&["bob", "d1", "write"]));
        b.insert(r(&["alice", "d2", "read"]));

        let removed = b.remove_filtered(0, &["alice".to_string()]);
        assert_eq!(removed.len(), 2);
        assert_eq!(b.len(), 1);
        assert!(b.contains(&r(&["bob", "d1", "write"])));
    }

    #[test]
    fn filtered_removal_all_empty_matches_everything() {
        let mut b = RuleBucket::new();
        b.insert(r(&["alice", "d1", "read"]));
        b.insert(r(&["bob", "d1", "write"]));

        let removed = b.remove_filtered(0, &["".to_string(), "".to_string()]);
        assert_eq!(removed.len(), 2);
        assert!(b.is_empty());
    }

    #[test]
    fn filtered_removal_field_index_at_tuple_length_matches_nothing() {
        let mut b = RuleBucket::new();
        b.insert(r(&["alice", "d1", "read"]));
        let removed = b.remove_filtered(3, &["x".to_string()]);
        assert!(removed.is_empty());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn index_is_consistent_after_mixed_operations() {
        let mut b = RuleBucket::new();
        b.insert(r(&["alice", "d1", "read"]));
        b.insert(r(&["alice", "d2", "write"]));
        b.remove(&r(&["alice", "d1", "read"]));

        // only one rule with "alice" at position 0 should remain indexed
        let matches = b.matching_filtered(0, &["alice".to_string()]);
        assert_eq!(matches.len(), 1);
        assert!(matches.contains(&r(&["alice", "d2", "write"])));
    }
}
