//! The replicated log applier (spec §4.B).
//!
//! [`PolicyStateMachine`] is the `openraft::storage::RaftStateMachine`
//! implementation that binds the [`PolicyDatabase`] to the consensus
//! library's apply/snapshot/restore contract. The apply path is the
//! correctness anchor of the whole system (spec §5): `openraft` guarantees
//! it is invoked strictly serially and in committed log order on every
//! replica.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{EntryPayload, LogId, OptionalSend, SnapshotMeta, StorageError, StoredMembership};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::command::Command;
use crate::error::ApplyError;
use crate::evaluator::{EffectiveDiff, EvaluatorPublisher};
use crate::raft_types::TypeConfig;
use crate::store::PolicyDatabase;

/// The typed result of applying one command, returned to the RPC layer
/// through openraft's own client-write response channel (spec §4.B step 4
/// "Return a typed result to the caller").
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ApplyOutcome {
    pub added: Vec<Vec<String>>,
    pub removed: Vec<Vec<String>>,
    pub logical_error: Option<String>,
}

struct SnapshotState {
    meta: SnapshotMeta<TypeConfig>,
    data: Vec<u8>,
}

/// Shared state behind [`PolicyStateMachine`], so a [`PolicySnapshotBuilder`]
/// handed out by `get_snapshot_builder` can be built independently.
pub struct Inner {
    pub db: Arc<PolicyDatabase>,
    last_applied: Mutex<Option<LogId<TypeConfig>>>,
    last_membership: Mutex<StoredMembership<TypeConfig>>,
    current_snapshot: Mutex<Option<SnapshotState>>,
    evaluator: EvaluatorPublisher,
    is_leader: Arc<std::sync::atomic::AtomicBool>,
}

/// Pairs `old_rules[i]`/`new_rules[i]` by position, drops the pairs that are
/// actually no-ops (`old == new`), and builds both the caller-visible
/// [`ApplyOutcome`] and the evaluator-facing [`EffectiveDiff::Updated`] from
/// what's left (spec §4.B step 3, §9 "it does not evaluate policies itself").
/// Returns `diff: None` when every pair was a no-op.
fn effective_update(
    key: crate::rule::BucketKey,
    old_rules: Vec<crate::rule::Rule>,
    new_rules: Vec<crate::rule::Rule>,
) -> (ApplyOutcome, Option<EffectiveDiff>) {
    let (changed_old, changed_new): (Vec<_>, Vec<_>) = old_rules
        .into_iter()
        .zip(new_rules)
        .filter(|(old, new)| old != new)
        .unzip();

    if changed_old.is_empty() {
        return (ApplyOutcome::default(), None);
    }

    let outcome = ApplyOutcome {
        removed: changed_old.iter().cloned().map(Into::into).collect(),
        added: changed_new.iter().cloned().map(Into::into).collect(),
        logical_error: None,
    };
    let diff = Some(EffectiveDiff::Updated {
        key,
        old_rules: changed_old,
        new_rules: changed_new,
    });
    (outcome, diff)
}

pub struct PolicyStateMachine {
    inner: Arc<Inner>,
}

impl PolicyStateMachine {
    pub fn new(
        db: Arc<PolicyDatabase>,
        evaluator: EvaluatorPublisher,
        is_leader: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        PolicyStateMachine {
            inner: Arc::new(Inner {
                db,
                last_applied: Mutex::new(None),
                last_membership: Mutex::new(StoredMembership::default()),
                current_snapshot: Mutex::new(None),
                evaluator,
                is_leader,
            }),
        }
    }

    /// Execute the protocol described in spec §4.B "Apply protocol" for a
    /// single decoded command, returning the effective diff to forward to
    /// the evaluator (step 3) alongside the caller-visible outcome.
    fn apply_one(
        db: &PolicyDatabase,
        command: Command,
        applied_index: u64,
    ) -> (ApplyOutcome, Option<EffectiveDiff>) {
        let result = match command {
            Command::AddRules { key, rules } => db
                .add_rules(&key, &rules, applied_index)
                .map(|outcome| {
                    let diff = (!outcome.added.is_empty()).then(|| EffectiveDiff::Added {
                        key: key.clone(),
                        rules: outcome.added.clone(),
                    });
                    (
                        ApplyOutcome {
                            added: outcome.added.into_iter().map(Into::into).collect(),
                            ..Default::default()
                        },
                        diff,
                    )
                }),
            Command::RemoveRules { key, rules } => db
                .remove_rules(&key, &rules, applied_index)
                .map(|outcome| {
                    let diff = (!outcome.removed.is_empty()).then(|| EffectiveDiff::Removed {
                        key: key.clone(),
                        rules: outcome.removed.clone(),
                    });
                    (
                        ApplyOutcome {
                            removed: outcome.removed.into_iter().map(Into::into).collect(),
                            ..Default::default()
                        },
                        diff,
                    )
                }),
            Command::RemoveFiltered {
                key,
                field_index,
                field_values,
            } => db
                .remove_filtered(&key, field_index, &field_values, applied_index)
                .map(|outcome| {
                    let diff = (!outcome.removed.is_empty()).then(|| EffectiveDiff::Removed {
                        key: key.clone(),
                        rules: outcome.removed.clone(),
                    });
                    (
                        ApplyOutcome {
                            removed: outcome.removed.into_iter().map(Into::into).collect(),
                            ..Default::default()
                        },
                        diff,
                    )
                }),
            Command::UpdateRule {
                key,
                old_rule,
                new_rule,
            } => db
                .update_rule(&key, &old_rule, &new_rule, applied_index)
                .map(|()| effective_update(key, vec![old_rule], vec![new_rule])),
            Command::UpdateRules {
                key,
                old_rules,
                new_rules,
            } => db
                .update_rules(&key, &old_rules, &new_rules, applied_index)
                .map(|()| effective_update(key, old_rules, new_rules)),
            Command::ClearAll => {
                db.clear(applied_index).map(|()| (ApplyOutcome::default(), Some(EffectiveDiff::Cleared)))
            }
        };

        match result {
            Ok((outcome, diff)) => (outcome, diff),
            Err(e) => {
                // `NotFound`/`LengthMismatch` are logical — spec §9 Q3: we
                // always propose and let apply report ApplyLogical, so every
                // replica reaches the identical decision.
                let apply_err = ApplyError::from(e);
                warn!(error = %apply_err, "logical apply failure");
                (
                    ApplyOutcome {
                        logical_error: Some(apply_err.to_string()),
                        ..Default::default()
                    },
                    None,
                )
            }
        }
    }
}

#[async_trait]
impl RaftStateMachine<TypeConfig> for PolicyStateMachine {
    type SnapshotBuilder = PolicySnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<TypeConfig>>, StoredMembership<TypeConfig>), StorageError<TypeConfig>>
    {
        Ok((
            *self.inner.last_applied.lock(),
            self.inner.last_membership.lock().clone(),
        ))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyOutcome>, StorageError<TypeConfig>>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + OptionalSend,
    {
        let mut results = Vec::new();
        let is_leader = self
            .inner
            .is_leader
            .load(std::sync::atomic::Ordering::Acquire);

        for entry in entries {
            *self.inner.last_applied.lock() = Some(entry.log_id);
            let applied_index = entry.log_id.index;

            let outcome = match entry.payload {
                EntryPayload::Blank => ApplyOutcome::default(),
                EntryPayload::Normal(command) => {
                    let (outcome, diff) =
                        Self::apply_one(&self.inner.db, command, applied_index);
                    // Step 3: only after a successful apply, forward the
                    // effective diff. The publisher itself enforces the
                    // configured per-replica/leader-only policy.
                    if let Some(diff) = diff {
                        self.inner.evaluator.publish(diff, is_leader).await;
                    }
                    outcome
                }
                EntryPayload::Membership(membership) => {
                    *self.inner.last_membership.lock() =
                        StoredMembership::new(Some(entry.log_id), membership);
                    ApplyOutcome::default()
                }
            };
            results.push(outcome);
        }

        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        PolicySnapshotBuilder {
            inner: self.inner.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<TypeConfig>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    /// Replaces the entire database from a snapshot stream (spec §4.B
    /// "restore(snapshotHandle)").
    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<TypeConfig>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<TypeConfig>> {
        let bytes = snapshot.into_inner();
        let (applied_index, _configuration) = self
            .inner
            .db
            .restore_snapshot(&bytes[..])
            .map_err(|e| StorageError::read_snapshot(Some(meta.signature()), &e))?;

        info!(applied_index, "state restored from installed snapshot");

        *self.inner.last_applied.lock() = meta.last_log_id;
        *self.inner.last_membership.lock() = meta.last_membership.clone();
        *self.inner.current_snapshot.lock() = Some(SnapshotState {
            meta: meta.clone(),
            data: bytes,
        });

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<TypeConfig>> {
        Ok(self.inner.current_snapshot.lock().as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

/// Produces a point-in-time consistent snapshot (spec §4.B "takeSnapshot").
pub struct PolicySnapshotBuilder {
    inner: Arc<Inner>,
}

#[async_trait]
impl RaftSnapshotBuilder<TypeConfig> for PolicySnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<TypeConfig>> {
        let last_applied = *self.inner.last_applied.lock();
        let last_membership = self.inner.last_membership.lock().clone();
        let applied_index = last_applied.map_or(0, |id| id.index);

        let mut buf = Vec::new();
        let membership_bytes =
            bincode::serialize(&last_membership).map_err(|e| {
                StorageError::read_state_machine(&std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        self.inner
            .db
            .write_snapshot(&mut buf, applied_index, &membership_bytes)
            .map_err(|e| StorageError::read_state_machine(&e))?;

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id: format!("{applied_index}-{}", uuid::Uuid::new_v4()),
        };

        *self.inner.current_snapshot.lock() = Some(SnapshotState {
            meta: meta.clone(),
            data: buf.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(buf)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{BucketKey, Rule};

    #[test]
    fn apply_one_reports_added_rules() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let cmd = Command::AddRules {
            key: BucketKey::new("p", "p"),
            rules: vec![Rule::new(["alice", "data1", "read"])],
        };
        let (outcome, diff) = PolicyStateMachine::apply_one(&db, cmd, 1);
        assert_eq!(outcome.added.len(), 1);
        assert!(matches!(diff, Some(EffectiveDiff::Added { .. })));
    }

    #[test]
    fn apply_one_reports_logical_error_for_missing_update_target() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let cmd = Command::UpdateRule {
            key: BucketKey::new("p", "p"),
            old_rule: Rule::new(["a", "x", "r"]),
            new_rule: Rule::new(["a", "x", "w"]),
        };
        let (outcome, diff) = PolicyStateMachine::apply_one(&db, cmd, 1);
        assert!(outcome.logical_error.is_some());
        assert!(diff.is_none());
    }

    #[test]
    fn apply_one_reports_updated_diff_with_both_sides() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let key = BucketKey::new("p", "p");
        let old_rule = Rule::new(["a", "x", "r"]);
        let new_rule = Rule::new(["a", "x", "w"]);
        db.add_rules(&key, &[old_rule.clone()], 1).unwrap();

        let cmd = Command::UpdateRule {
            key: key.clone(),
            old_rule: old_rule.clone(),
            new_rule: new_rule.clone(),
        };
        let (outcome, diff) = PolicyStateMachine::apply_one(&db, cmd, 2);

        assert_eq!(outcome.removed, vec![Vec::<String>::from(old_rule.clone())]);
        assert_eq!(outcome.added, vec![Vec::<String>::from(new_rule.clone())]);
        assert_eq!(
            diff,
            Some(EffectiveDiff::Updated {
                key,
                old_rules: vec![old_rule],
                new_rules: vec![new_rule],
            })
        );
    }

    #[test]
    fn apply_one_update_rule_no_op_emits_no_diff() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let key = BucketKey::new("p", "p");
        let rule = Rule::new(["a", "x", "r"]);
        db.add_rules(&key, &[rule.clone()], 1).unwrap();

        let cmd = Command::UpdateRule {
            key,
            old_rule: rule.clone(),
            new_rule: rule,
        };
        let (outcome, diff) = PolicyStateMachine::apply_one(&db, cmd, 2);
        assert!(outcome.logical_error.is_none());
        assert!(diff.is_none());
    }

    #[test]
    fn clear_all_emits_cleared_diff() {
        let (db, _dir) = PolicyDatabase::open_temp();
        let key = BucketKey::new("p", "p");
        db.add_rules(&key, &[Rule::new(["a", "b", "c"])], 1).unwrap();
        let (_outcome, diff) = PolicyStateMachine::apply_one(&db, Command::ClearAll, 2);
        assert_eq!(diff, Some(EffectiveDiff::Cleared));
    }
}
