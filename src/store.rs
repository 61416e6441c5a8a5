//! The policy database: `(sec, pType) -> RuleBucket`, backed by an
//! embedded ordered KV store (spec §3 "PolicyDatabase", §4.A contract).
//!
//! The persistent store is the source of truth for what a snapshot or a
//! restart rebuilds from; the in-memory `buckets` map is a field-indexed
//! mirror kept in lock-step with every write so that `removeFiltered` can
//! resolve without a full scan (spec §4.A "Field-index algorithm").

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;

use parking_lot::RwLock;

use crate::bucket::RuleBucket;
use crate::error::RuleIndexError;
use crate::rule::{BucketKey, Rule};

const SEP: u8 = 0x1F;
const APPLIED_INDEX_KEY: &[u8] = b"__meta/applied_index";

fn encode_key(key: &BucketKey, rule: &Rule) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(key.sec.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(key.p_type.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(&rule.canonical_bytes());
    buf
}

fn decode_key(bytes: &[u8]) -> Option<(BucketKey, Rule)> {
    let mut parts = bytes.splitn(3, |b| *b == SEP);
    let sec = parts.next()?;
    let p_type = parts.next()?;
    let rule_bytes = parts.next()?;
    let sec = String::from_utf8(sec.to_vec()).ok()?;
    let p_type = String::from_utf8(p_type.to_vec()).ok()?;
    let rule = Rule::from_canonical_bytes(rule_bytes)?;
    Some((BucketKey::new(sec, p_type), rule))
}

/// Result of an add: the subset actually inserted, for downstream
/// evaluator notification (spec §4.A, §4.B step 3 "effective diff").
#[derive(Debug, Default, Clone)]
pub struct AddOutcome {
    pub added: Vec<Rule>,
}

/// Result of a remove: the subset actually deleted.
#[derive(Debug, Default, Clone)]
pub struct RemoveOutcome {
    pub removed: Vec<Rule>,
}

pub struct PolicyDatabase {
    db: sled::Db,
    buckets: RwLock<HashMap<BucketKey, RuleBucket>>,
}

impl PolicyDatabase {
    /// Open (or create) the persistent store at `path` and rebuild the
    /// in-memory field index from its contents (spec §3 lifecycle (a)).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RuleIndexError> {
        let db = sled::open(path)?;
        let mut buckets: HashMap<BucketKey, RuleBucket> = HashMap::new();
        for kv in db.iter() {
            let (key, _value) = kv?;
            if key.as_ref() == APPLIED_INDEX_KEY {
                continue;
            }
            if let Some((bucket_key, rule)) = decode_key(&key) {
                buckets.entry(bucket_key).or_default().insert(rule);
            }
        }
        Ok(PolicyDatabase {
            db,
            buckets: RwLock::new(buckets),
        })
    }

    /// In-memory-only instance, for tests that don't need crash recovery.
    #[cfg(test)]
    pub fn open_temp() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Self::open(dir.path()).unwrap();
        (db, dir)
    }

    pub fn last_applied_index(&self) -> Result<u64, RuleIndexError> {
        match self.db.get(APPLIED_INDEX_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                Ok(u64::from_be_bytes(bytes.as_ref().try_into().unwrap()))
            }
            _ => Ok(0),
        }
    }

    fn set_applied_index_in_batch(&self, batch: &mut sled::Batch, index: u64) {
        batch.insert(APPLIED_INDEX_KEY, &index.to_be_bytes());
    }

    /// `addRules` (spec §4.A): inserts each rule not already present.
    /// Idempotent; empty `rules` is a no-op that touches neither the KV
    /// nor the in-memory index.
    pub fn add_rules(
        &self,
        key: &BucketKey,
        rules: &[Rule],
        applied_index: u64,
    ) -> Result<AddOutcome, RuleIndexError> {
        if rules.is_empty() {
            return Ok(AddOutcome::default());
        }

        let mut sorted: Vec<&Rule> = rules.iter().collect();
        sorted.sort();

        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(key.clone()).or_default();

        let mut batch = sled::Batch::default();
        let mut added = Vec::new();
        for rule in sorted {
            if !bucket.contains(rule) {
                batch.insert(encode_key(key, rule), &[] as &[u8]);
                added.push(rule.clone());
            }
        }
        self.set_applied_index_in_batch(&mut batch, applied_index);
        self.db.apply_batch(batch)?;

        for rule in &added {
            bucket.insert(rule.clone());
        }

        Ok(AddOutcome { added })
    }

    /// `removeRules` (spec §4.A).
    pub fn remove_rules(
        &self,
        key: &BucketKey,
        rules: &[Rule],
        applied_index: u64,
    ) -> Result<RemoveOutcome, RuleIndexError> {
        if rules.is_empty() {
            return Ok(RemoveOutcome::default());
        }

        let mut sorted: Vec<&Rule> = rules.iter().collect();
        sorted.sort();

        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(key.clone()).or_default();

        let mut batch = sled::Batch::default();
        let mut removed = Vec::new();
        for rule in sorted {
            if bucket.contains(rule) {
                batch.remove(encode_key(key, rule));
                removed.push(rule.clone());
            }
        }
        self.set_applied_index_in_batch(&mut batch, applied_index);
        self.db.apply_batch(batch)?;

        for rule in &removed {
            bucket.remove(rule);
        }

        Ok(RemoveOutcome { removed })
    }

    /// `removeFiltered` (spec §4.A).
    pub fn remove_filtered(
        &self,
        key: &BucketKey,
        field_index: usize,
        field_values: &[String],
        applied_index: u64,
    ) -> Result<RemoveOutcome, RuleIndexError> {
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(key.clone()).or_default();

        let matches = bucket.matching_filtered(field_index, field_values);

        let mut batch = sled::Batch::default();
        for rule in &matches {
            batch.remove(encode_key(key, rule));
        }
        self.set_applied_index_in_batch(&mut batch, applied_index);
        self.db.apply_batch(batch)?;

        for rule in &matches {
            bucket.remove(rule);
        }

        Ok(RemoveOutcome {
            removed: matches.into_iter().collect(),
        })
    }

    /// `updateRule` (spec §4.A): atomic replace. Fails with `NotFound` if
    /// `old_rule` is absent. If `new_rule` already exists, the update
    /// degenerates into a deletion of `old_rule` (spec's documented net
    /// effect).
    pub fn update_rule(
        &self,
        key: &BucketKey,
        old_rule: &Rule,
        new_rule: &Rule,
        applied_index: u64,
    ) -> Result<(), RuleIndexError> {
        self.update_rules(key, std::slice::from_ref(old_rule), std::slice::from_ref(new_rule), applied_index)
    }

    /// `updateRules` (spec §4.A): same-length precondition, atomic
    /// all-or-nothing. Validated before any mutation so that a rejected
    /// batch leaves the bucket untouched.
    pub fn update_rules(
        &self,
        key: &BucketKey,
        old_rules: &[Rule],
        new_rules: &[Rule],
        applied_index: u64,
    ) -> Result<(), RuleIndexError> {
        if old_rules.len() != new_rules.len() {
            return Err(RuleIndexError::LengthMismatch {
                old: old_rules.len(),
                new: new_rules.len(),
            });
        }

        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(key.clone()).or_default();

        for old in old_rules {
            if !bucket.contains(old) {
                return Err(RuleIndexError::NotFound {
                    sec: key.sec.clone(),
                    p_type: key.p_type.clone(),
                    rule: old.clone().into(),
                });
            }
        }

        // Sort (old, new) pairs by old-rule for a deterministic write
        // sequence (I3), then apply the whole batch atomically (I4).
        let mut pairs: Vec<(&Rule, &Rule)> = old_rules.iter().zip(new_rules.iter()).collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        let mut batch = sled::Batch::default();
        for (old, new) in &pairs {
            batch.remove(encode_key(key, old));
            if *old != *new {
                batch.insert(encode_key(key, new), &[] as &[u8]);
            }
        }
        self.set_applied_index_in_batch(&mut batch, applied_index);
        self.db.apply_batch(batch)?;

        for (old, new) in &pairs {
            bucket.remove(old);
            if old != new {
                bucket.insert((*new).clone());
            }
        }

        Ok(())
    }

    /// `clear` (spec §4.A): removes every rule across every bucket.
    pub fn clear(&self, applied_index: u64) -> Result<(), RuleIndexError> {
        let mut buckets = self.buckets.write();

        let mut batch = sled::Batch::default();
        for key in self.db.iter().keys() {
            let key = key?;
            if key.as_ref() != APPLIED_INDEX_KEY {
                batch.remove(key);
            }
        }
        self.set_applied_index_in_batch(&mut batch, applied_index);
        self.db.apply_batch(batch)?;

        buckets.clear();
        Ok(())
    }

    pub fn bucket_len(&self, key: &BucketKey) -> usize {
        self.buckets.read().get(key).map_or(0, RuleBucket::len)
    }

    pub fn contains(&self, key: &BucketKey, rule: &Rule) -> bool {
        self.buckets
            .read()
            .get(key)
            .is_some_and(|b| b.contains(rule))
    }

    /// Serialize the full database as a stream of length-prefixed
    /// `(sec, pType, rule)` triples, terminated by a footer carrying the
    /// last applied index and an opaque voter-configuration blob (spec §6
    /// "Snapshot format"). Iterates buckets and rules in sorted order so
    /// that two replicas with identical state produce byte-identical
    /// snapshots (I3).
    pub fn write_snapshot<W: Write>(
        &self,
        mut writer: W,
        applied_index: u64,
        configuration: &[u8],
    ) -> io::Result<()> {
        let buckets = self.buckets.read();
        let mut keys: Vec<&BucketKey> = buckets.keys().collect();
        keys.sort();

        for key in keys {
            let bucket = &buckets[key];
            for rule in bucket.iter_sorted() {
                write_frame(&mut writer, key.sec.as_bytes())?;
                write_frame(&mut writer, key.p_type.as_bytes())?;
                write_frame(&mut writer, &rule.canonical_bytes())?;
            }
        }

        // Footer: a zero-length sec frame is not a valid triple prefix
        // (sec is never empty in practice) so we use an explicit marker
        // frame instead of relying on EOF.
        write_frame(&mut writer, b"\0FOOTER\0")?;
        writer.write_all(&applied_index.to_be_bytes())?;
        write_frame(&mut writer, configuration)?;
        Ok(())
    }

    /// Restore the full database from a snapshot stream produced by
    /// [`PolicyDatabase::write_snapshot`]. Clears the existing database
    /// first (spec §4.B "Restoring clears the PolicyDatabase...").
    pub fn restore_snapshot<R: Read>(&self, mut reader: R) -> io::Result<(u64, Vec<u8>)> {
        let mut new_buckets: HashMap<BucketKey, RuleBucket> = HashMap::new();
        let mut write_batch = sled::Batch::default();

        loop {
            let sec = read_frame(&mut reader)?;
            if sec == b"\0FOOTER\0" {
                let mut idx_bytes = [0u8; 8];
                reader.read_exact(&mut idx_bytes)?;
                let applied_index = u64::from_be_bytes(idx_bytes);
                let configuration = read_frame(&mut reader)?;

                for key in self.db.iter().keys() {
                    write_batch.remove(key?);
                }
                for kv in rebuild_kv_pairs(&new_buckets) {
                    write_batch.insert(kv.0, kv.1);
                }
                self.set_applied_index_in_batch(&mut write_batch, applied_index);
                self.db
                    .apply_batch(write_batch)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

                *self.buckets.write() = new_buckets;
                return Ok((applied_index, configuration));
            }

            let p_type = read_frame(&mut reader)?;
            let rule_bytes = read_frame(&mut reader)?;
            let sec = String::from_utf8(sec)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let p_type = String::from_utf8(p_type)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let rule = Rule::from_canonical_bytes(&rule_bytes)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad rule bytes"))?;

            new_buckets
                .entry(BucketKey::new(sec, p_type))
                .or_default()
                .insert(rule);
        }
    }
}

fn rebuild_kv_pairs(buckets: &HashMap<BucketKey, RuleBucket>) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut keys: Vec<&BucketKey> = buckets.keys().collect();
    keys.sort();
    for key in keys {
        for rule in buckets[key].iter_sorted() {
            out.push((encode_key(key, rule), Vec::new()));
        }
    }
    out
}

fn write_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
    writer.write_all(bytes)
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(items: &[&str]) -> Rule {
        Rule::new(items.iter().copied())
    }

    #[test]
    fn add_rules_is_idempotent_p5() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let key = BucketKey::new("p", "p");
        let rules = vec![r(&["alice", "data1", "read"])];

        let first = db.add_rules(&key, &rules, 1).unwrap();
        assert_eq!(first.added.len(), 1);
        let second = db.add_rules(&key, &rules, 2).unwrap();
        assert!(second.added.is_empty());
        assert_eq!(db.bucket_len(&key), 1);
    }

    #[test]
    fn add_then_remove_round_trip() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let key = BucketKey::new("p", "p");
        let rules = vec![r(&["alice", "data1", "read"])];

        db.add_rules(&key, &rules, 1).unwrap();
        let removed = db.remove_rules(&key, &rules, 2).unwrap();
        assert_eq!(removed.removed, rules);
        assert_eq!(db.bucket_len(&key), 0);
    }

    #[test]
    fn update_rule_missing_old_is_not_found() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let key = BucketKey::new("p", "p");
        let err = db
            .update_rule(&key, &r(&["a", "x", "r"]), &r(&["a", "x", "w"]), 1)
            .unwrap_err();
        assert!(matches!(err, RuleIndexError::NotFound { .. }));
    }

    #[test]
    fn update_rule_is_self_inverse() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let key = BucketKey::new("p", "p");
        let a = r(&["a", "x", "r"]);
        let b = r(&["a", "x", "w"]);
        db.add_rules(&key, &[a.clone()], 1).unwrap();

        db.update_rule(&key, &a, &b, 2).unwrap();
        db.update_rule(&key, &b, &a, 3).unwrap();
        assert!(db.contains(&key, &a));
        assert_eq!(db.bucket_len(&key), 1);
    }

    #[test]
    fn snapshot_restore_round_trip_is_byte_identical() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let key = BucketKey::new("p", "p");
        db.add_rules(
            &key,
            &[r(&["alice", "d1", "read"]), r(&["bob", "d1", "write"])],
            5,
        )
        .unwrap();

        let mut buf = Vec::new();
        db.write_snapshot(&mut buf, 5, b"config-blob").unwrap();

        let (db2, _dir2) = PolicyDatabase::open_temp();
        let (applied, config) = db2.restore_snapshot(&buf[..]).unwrap();
        assert_eq!(applied, 5);
        assert_eq!(config, b"config-blob");
        assert_eq!(db2.bucket_len(&key), 2);

        let mut buf2 = Vec::new();
        db2.write_snapshot(&mut buf2, 5, b"config-blob").unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn clear_after_snapshot_reports_zero_rules() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let key = BucketKey::new("p", "p");
        db.add_rules(&key, &[r(&["a", "b", "c"])], 1).unwrap();
        db.clear(2).unwrap();
        assert_eq!(db.bucket_len(&key), 0);
        assert_eq!(db.last_applied_index().unwrap(), 2);
    }
}
