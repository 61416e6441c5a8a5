//! Leader-forwarding RPC surface (spec §4.C).
//!
//! Route table and handler bodies mirror `NewService`/`handleAddPolicy`/
//! `handleRemovePolicy`/`handleUpdatePolicy` in
//! `examples/original_source/http/service.go`, rehosted on `axum` (the
//! teacher's own HTTP stack) instead of `chi`, with TLS termination via
//! `rustls` (spec §6 "All RPCs use TLS with client certificate
//! authentication").

pub mod gate;
pub mod membership;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::put;
use axum::Router;
use prost::Message;
use serde::Deserialize;

use crate::command::{proto, Command};
use crate::raft_types::{Raft, TypeConfig};
use crate::rule::BucketKey;

#[derive(Clone)]
pub struct RpcState {
    pub raft: Arc<Raft>,
}

async fn propose(raft: &Raft, command: Command) -> Result<StatusCode, (StatusCode, String)> {
    match raft.client_write(command).await {
        Ok(resp) => match resp.data.logical_error {
            Some(msg) => Err((StatusCode::BAD_REQUEST, msg)),
            None => Ok(StatusCode::OK),
        },
        Err(e) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

/// `policies/add`.
async fn add_policy(
    State(state): State<RpcState>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let envelope =
        proto::Envelope::decode(&body[..]).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let command = Command::try_from(envelope).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    propose(&state.raft, command).await
}

/// `policies/update` (`UpdateRule` or `UpdateRules`, discriminated by the
/// envelope's own operation tag — spec §4.C).
async fn update_policy(
    State(state): State<RpcState>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let envelope =
        proto::Envelope::decode(&body[..]).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let command = Command::try_from(envelope).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    propose(&state.raft, command).await
}

#[derive(Deserialize)]
pub struct RemoveQuery {
    #[serde(rename = "type")]
    remove_type: Option<String>,
}

/// `policies/remove`, dispatching on `?type=` the way
/// `handleRemovePolicy`'s `chi.URLParam(r, "type")` switch does: absent
/// means `RemoveRules`, `filtered` means `RemoveFilteredRules`, `all`
/// means `ClearAll` with an empty body.
async fn remove_policy(
    State(state): State<RpcState>,
    Query(query): Query<RemoveQuery>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let command = match query.remove_type.as_deref() {
        Some("all") => Command::ClearAll,
        Some("filtered") => {
            let envelope = proto::Envelope::decode(&body[..])
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            Command::try_from(envelope).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        }
        None | Some("") => {
            let envelope = proto::Envelope::decode(&body[..])
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            Command::try_from(envelope).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        }
        Some(other) => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unrecognized remove type: {other}"),
            ))
        }
    };
    propose(&state.raft, command).await
}

/// Assembles the full RPC router: policy + membership routes behind the
/// leader gate, raft transport routes outside it (peers must reach a
/// follower's raft endpoints to elect it).
pub fn router(
    rpc_state: RpcState,
    gate_state: gate::LeaderGateState,
    membership_state: membership::MembershipState,
    raft_rpc_state: crate::raft_network::handlers::RaftRpcState,
) -> Router {
    let gated = Router::new()
        .route("/policies/add", put(add_policy))
        .route("/policies/update", put(update_policy))
        .route("/policies/remove", put(remove_policy))
        .with_state(rpc_state)
        .route(
            "/nodes/join",
            put(membership::join).with_state(membership_state.clone()),
        )
        .route(
            "/nodes/remove",
            put(membership::remove).with_state(membership_state),
        )
        .layer(middleware::from_fn_with_state(gate_state, gate::leader_only));

    let raft_transport = Router::new()
        .route(
            "/raft/append-entries",
            put(crate::raft_network::handlers::append_entries),
        )
        .route(
            "/raft/install-snapshot",
            put(crate::raft_network::handlers::install_snapshot),
        )
        .route("/raft/vote", put(crate::raft_network::handlers::vote))
        .with_state(raft_rpc_state);

    gated.merge(raft_transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_query_defaults_to_none() {
        let q = RemoveQuery { remove_type: None };
        assert!(q.remove_type.is_none());
    }
}
