//! Cluster bootstrap policy (spec §4.C "Bootstrap policy").
//!
//! Sequencing is grounded directly on `NewHRaftDispatcher`'s constructor in
//! `examples/original_source/dispatcher.go`: decide bootstrap-vs-join from
//! whether the persistent store already holds consensus state, start the
//! consensus engine, then either wait for leadership (freshly bootstrapped)
//! or send a join request to the configured peer — all before the RPC
//! surface starts accepting traffic.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::client::DispatcherClient;
use crate::error::BootstrapError;
use crate::raft_types::{NodeId, Raft};

/// What this node should do on startup, decided purely from local state
/// (spec §4.C): an empty persistent store with no `joinAddress` bootstraps
/// a single-voter cluster; an empty store with a `joinAddress` joins an
/// existing one; anything else rejoins in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapAction {
    BootstrapSingleVoter,
    JoinExisting { join_address: String },
    Rejoin,
}

pub fn decide_bootstrap_action(
    store_is_empty: bool,
    join_address: Option<&str>,
) -> BootstrapAction {
    if store_is_empty {
        match join_address {
            Some(addr) if !addr.is_empty() => BootstrapAction::JoinExisting {
                join_address: addr.to_string(),
            },
            _ => BootstrapAction::BootstrapSingleVoter,
        }
    } else {
        BootstrapAction::Rejoin
    }
}

/// Runs the decided action against a freshly-constructed, not-yet-started
/// raft handle, then waits for leadership to stabilize when we just
/// bootstrapped (mirrors `s.Start(enableBootstrap)` followed by
/// `s.WaitLeader()` only in the bootstrap branch).
///
/// `advertised_rpc_address` is what gets stored as this node's
/// `openraft::BasicNode` address — it must be the address peers can reach
/// this node's RPC server on (spec §6 "Transport endpoint convention"),
/// since `raft_network.rs` dials `https://{node.addr}/raft/...` against it
/// and the `leaderOnly` gate redirects clients to it. The raft listen
/// address is never advertised: nothing outside this process binds to it
/// as a separate transport.
pub async fn run(
    raft: &Raft,
    server_id: &NodeId,
    advertised_rpc_address: &str,
    action: BootstrapAction,
    leader_wait_timeout: Duration,
) -> Result<(), BootstrapError> {
    match &action {
        BootstrapAction::BootstrapSingleVoter => {
            info!(%server_id, "bootstrapping a new cluster");
            let mut members = BTreeMap::new();
            members.insert(server_id.clone(), openraft::BasicNode::new(advertised_rpc_address));
            raft.initialize(members)
                .await
                .map_err(|e| BootstrapError::ConsensusStart(e.to_string()))?;
            wait_for_leader(raft, leader_wait_timeout).await?;
        }
        BootstrapAction::JoinExisting { join_address } => {
            info!(%server_id, %join_address, "joining existing cluster");
            let client = DispatcherClient::new(join_address.clone())
                .map_err(|e| BootstrapError::Join(join_address.clone(), e.to_string()))?;
            client
                .join_node(join_address, server_id, advertised_rpc_address)
                .await
                .map_err(|e| BootstrapError::Join(join_address.clone(), e.to_string()))?;
            wait_for_leader(raft, leader_wait_timeout).await?;
        }
        BootstrapAction::Rejoin => {
            info!(%server_id, "rejoining existing cluster from persistent state");
            wait_for_leader(raft, leader_wait_timeout).await?;
        }
    }
    Ok(())
}

/// Polls raft metrics until a leader is known, bounded by `timeout`
/// (spec §4.C "waits for leadership to stabilize... before accepting
/// client traffic").
async fn wait_for_leader(raft: &Raft, timeout: Duration) -> Result<(), BootstrapError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut rx = raft.metrics();

    loop {
        if rx.borrow().current_leader.is_some() {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(BootstrapError::LeaderWaitTimeout(timeout));
        }
        if tokio::time::timeout(remaining, rx.changed()).await.is_err() {
            warn!("timed out waiting for raft metrics change while awaiting leader");
            return Err(BootstrapError::LeaderWaitTimeout(timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_without_join_address_bootstraps() {
        assert_eq!(
            decide_bootstrap_action(true, None),
            BootstrapAction::BootstrapSingleVoter
        );
    }

    #[test]
    fn empty_store_with_join_address_joins() {
        assert_eq!(
            decide_bootstrap_action(true, Some("10.0.0.1:6789")),
            BootstrapAction::JoinExisting {
                join_address: "10.0.0.1:6789".to_string()
            }
        );
    }

    #[test]
    fn non_empty_store_always_rejoins() {
        assert_eq!(
            decide_bootstrap_action(false, Some("10.0.0.1:6789")),
            BootstrapAction::Rejoin
        );
        assert_eq!(decide_bootstrap_action(false, None), BootstrapAction::Rejoin);
    }
}
