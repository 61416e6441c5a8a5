//! The `leaderOnly` gate (spec §4.C "Leader forwarding").
//!
//! An axum middleware layer, grounded directly on the source material's
//! `leaderMiddleware`/`getRedirectURL` (`examples/original_source/http/service.go`):
//! queries the consensus library for `(isLeader, leaderAddress)` and either
//! lets the request through, 307-redirects to the leader's equivalent URL,
//! or 503s when no leader is known.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};

use crate::raft_types::{NodeId, Raft};

#[derive(Clone)]
pub struct LeaderGateState {
    pub raft: Arc<Raft>,
    /// This node's own RPC scheme (`https`), used to build the redirect
    /// target since the consensus library only tracks bare addresses.
    pub rpc_scheme: &'static str,
}

/// Mirrors `getRedirectURL`: same path, same query string, host swapped to
/// the leader's RPC address.
fn redirect_url(scheme: &str, leader_address: &str, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path());
    format!("{scheme}://{leader_address}{path_and_query}")
}

pub async fn leader_only(
    State(state): State<LeaderGateState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let metrics = state.raft.metrics().borrow().clone();
    let is_leader = metrics
        .current_leader
        .as_ref()
        .is_some_and(|leader| *leader == metrics.id);

    if is_leader {
        return next.run(request).await;
    }

    match leader_node_address(&state.raft, &metrics).await {
        Some(address) => {
            let url = redirect_url(state.rpc_scheme, &address, request.uri());
            Redirect::temporary(&url).into_response()
        }
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn leader_node_address(
    raft: &Raft,
    metrics: &openraft::RaftMetrics<NodeId, openraft::BasicNode>,
) -> Option<String> {
    let leader_id = metrics.current_leader.clone()?;
    let membership = raft.metrics().borrow().membership_config.clone();
    membership
        .nodes()
        .find(|(id, _)| **id == leader_id)
        .map(|(_, node)| node.addr.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_preserves_path_and_query() {
        let uri: Uri = "/policies/add?foo=bar".parse().unwrap();
        assert_eq!(
            redirect_url("https", "10.0.0.2:6790", &uri),
            "https://10.0.0.2:6790/policies/add?foo=bar"
        );
    }

    #[test]
    fn redirect_with_no_query_omits_question_mark() {
        let uri: Uri = "/nodes/join".parse().unwrap();
        assert_eq!(
            redirect_url("https", "10.0.0.2:6790", &uri),
            "https://10.0.0.2:6790/nodes/join"
        );
    }
}
