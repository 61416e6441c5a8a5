//! `nodes/join` and `nodes/remove` (spec §4.C "Membership operations").
//!
//! Grounded on `handleJoinNode`/`handleRemoveNode` in
//! `examples/original_source/http/service.go`: decode a length-prefixed
//! protobuf body, hand the parsed fields to the consensus library's
//! reconfiguration API. Both routes sit behind the same [`super::gate`] as
//! the policy routes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use prost::Message;

use crate::command::proto;
use crate::raft_types::{NodeId, Raft};

#[derive(Clone)]
pub struct MembershipState {
    pub raft: Arc<Raft>,
}

/// `nodes/join`: idempotent add-voter (spec §4.C). Re-adding an existing
/// `(serverId, address)` pair is a no-op; re-adding `serverId` with a new
/// address replaces it, which is `openraft`'s natural reconfiguration
/// behavior when the same node id is added again with a new `BasicNode`.
pub async fn join(
    State(state): State<MembershipState>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let req = proto::JoinNodeRequest::decode(&body[..])
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    if req.server_id.is_empty() || req.address.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "server_id and address are required".to_string(),
        ));
    }

    let node_id: NodeId = req.server_id.clone();
    let node = openraft::BasicNode::new(req.address.clone());

    state
        .raft
        .add_learner(node_id.clone(), node, true)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    let mut members: BTreeMap<NodeId, ()> = state
        .raft
        .metrics()
        .borrow()
        .membership_config
        .voter_ids()
        .map(|id| (id, ()))
        .collect();
    members.insert(node_id, ());

    state
        .raft
        .change_membership(members.into_keys().collect::<Vec<_>>(), false)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(StatusCode::OK)
}

/// `nodes/remove`: removes by id; removing a non-member is a no-op
/// (spec §4.C).
pub async fn remove(
    State(state): State<MembershipState>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let req = proto::RemoveNodeRequest::decode(&body[..])
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let current: Vec<NodeId> = state
        .raft
        .metrics()
        .borrow()
        .membership_config
        .voter_ids()
        .collect();

    if !current.contains(&req.server_id) {
        return Ok(StatusCode::OK);
    }

    let remaining: Vec<NodeId> = current.into_iter().filter(|id| *id != req.server_id).collect();

    state
        .raft
        .change_membership(remaining, false)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(StatusCode::OK)
}
