//! The external policy-evaluation engine collaborator (spec §1, §9).
//!
//! The evaluator is out of scope for this crate — it only receives
//! `addRules`/`removeRules`/`updateRule`/`clear` calls. The source
//! material wires the applier directly into the dispatcher which holds
//! the evaluator, a cyclic back-reference (spec §9 "Source patterns
//! requiring re-architecture"). We break the cycle with one-way message
//! passing: the applier publishes [`EffectiveDiff`] events onto a bounded
//! channel; whatever owns an evaluator instance drains it. Neither side
//! holds a handle to the other.

use tokio::sync::mpsc;

use crate::rule::{BucketKey, Rule};

/// The effective (i.e. actually-changed) subset of a mutation, published
/// for the evaluator to apply to its own in-memory mirror (spec §4.B step 3
/// "Glossary: Effective diff").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EffectiveDiff {
    Added { key: BucketKey, rules: Vec<Rule> },
    Removed { key: BucketKey, rules: Vec<Rule> },
    /// `updateRule`/`updateRules` (spec §4.B step 3): `old_rules[i]` is
    /// replaced by `new_rules[i]`, paired by position. Only the pairs that
    /// actually changed are included — a no-op replace never reaches here.
    Updated {
        key: BucketKey,
        old_rules: Vec<Rule>,
        new_rules: Vec<Rule>,
    },
    Cleared,
}

/// Whether the applier forwards effective diffs on every replica, or only
/// on the leader (spec §9 Open Q1). Default is `PerReplica`: every node
/// runs its own evaluator bound to its own applier, which is the safer
/// choice when reads may be served from any node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EvaluatorUpdatePolicy {
    #[default]
    PerReplica,
    LeaderOnly,
}

/// Publishing half of the effective-diff queue, held by the state machine.
#[derive(Clone)]
pub struct EvaluatorPublisher {
    tx: mpsc::Sender<EffectiveDiff>,
    policy: EvaluatorUpdatePolicy,
}

/// Consuming half, held by whatever owns the external evaluator instance.
pub struct EvaluatorSubscriber {
    rx: mpsc::Receiver<EffectiveDiff>,
}

/// Default channel capacity. Diffs are small and consumption should be
/// near-instant (an in-process callback into the evaluator's own index),
/// so a bound this size only trips under sustained evaluator stalls.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub fn channel(policy: EvaluatorUpdatePolicy) -> (EvaluatorPublisher, EvaluatorSubscriber) {
    channel_with_capacity(policy, DEFAULT_QUEUE_CAPACITY)
}

pub fn channel_with_capacity(
    policy: EvaluatorUpdatePolicy,
    capacity: usize,
) -> (EvaluatorPublisher, EvaluatorSubscriber) {
    let (tx, rx) = mpsc::channel(capacity);
    (EvaluatorPublisher { tx, policy }, EvaluatorSubscriber { rx })
}

impl EvaluatorPublisher {
    /// Publish a diff, honoring the configured update policy. `is_leader`
    /// is evaluated at publish time since leadership can change between
    /// applies.
    pub async fn publish(&self, diff: EffectiveDiff, is_leader: bool) {
        if self.policy == EvaluatorUpdatePolicy::LeaderOnly && !is_leader {
            return;
        }
        // A full queue means the evaluator has fallen far behind; dropping
        // here would violate "effective diff" delivery, so we apply
        // backpressure onto the apply path instead of silently losing it.
        let _ = self.tx.send(diff).await;
    }
}

impl EvaluatorSubscriber {
    pub async fn recv(&mut self) -> Option<EffectiveDiff> {
        self.rx.recv().await
    }
}

/// The capability set the evaluator exposes to a consumer of
/// [`EvaluatorSubscriber`] (spec §1 "it does not evaluate policies itself").
/// Implemented by the embedded policy-evaluation engine, not by this crate.
#[async_trait::async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn add_rules(&self, key: &BucketKey, rules: &[Rule]);
    async fn remove_rules(&self, key: &BucketKey, rules: &[Rule]);
    async fn update_rules(&self, key: &BucketKey, old_rules: &[Rule], new_rules: &[Rule]);
    async fn clear(&self);
}

/// Drains an [`EvaluatorSubscriber`] into a [`PolicyEvaluator`] until the
/// publisher side is dropped. Intended to be spawned as its own task.
pub async fn drive(mut subscriber: EvaluatorSubscriber, evaluator: impl PolicyEvaluator) {
    while let Some(diff) = subscriber.recv().await {
        match diff {
            EffectiveDiff::Added { key, rules } => evaluator.add_rules(&key, &rules).await,
            EffectiveDiff::Removed { key, rules } => evaluator.remove_rules(&key, &rules).await,
            EffectiveDiff::Updated { key, old_rules, new_rules } => {
                evaluator.update_rules(&key, &old_rules, &new_rules).await
            }
            EffectiveDiff::Cleared => evaluator.clear().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEvaluator {
        adds: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl PolicyEvaluator for CountingEvaluator {
        async fn add_rules(&self, _key: &BucketKey, rules: &[Rule]) {
            self.adds.fetch_add(rules.len(), Ordering::SeqCst);
        }
        async fn remove_rules(&self, _key: &BucketKey, _rules: &[Rule]) {}
        async fn update_rules(&self, _key: &BucketKey, _old_rules: &[Rule], _new_rules: &[Rule]) {}
        async fn clear(&self) {}
    }

    #[tokio::test]
    async fn leader_only_policy_drops_follower_updates() {
        let (publisher, mut subscriber) = channel(EvaluatorUpdatePolicy::LeaderOnly);
        publisher
            .publish(
                EffectiveDiff::Added {
                    key: BucketKey::new("p", "p"),
                    rules: vec![Rule::new(["a"])],
                },
                false,
            )
            .await;
        drop(publisher);
        assert_eq!(subscriber.recv().await, None);
    }

    #[tokio::test]
    async fn per_replica_policy_delivers_to_evaluator() {
        let (publisher, subscriber) = channel(EvaluatorUpdatePolicy::PerReplica);
        let adds = Arc::new(AtomicUsize::new(0));
        let evaluator = CountingEvaluator { adds: adds.clone() };

        publisher
            .publish(
                EffectiveDiff::Added {
                    key: BucketKey::new("p", "p"),
                    rules: vec![Rule::new(["a"]), Rule::new(["b"])],
                },
                false,
            )
            .await;
        drop(publisher);

        drive(subscriber, evaluator).await;
        assert_eq!(adds.load(Ordering::SeqCst), 2);
    }
}
