//! Node-to-node raft RPC transport (spec §4.C "replication fan-out").
//!
//! `openraft` is transport-agnostic; this module is the seam where
//! AppendEntries / Vote / InstallSnapshot calls become HTTP requests, mTLS
//! and all, mirroring the corpus's `reqwest` + `rustls` client stack (see
//! the consensus engine's own `network.rs` for the same shape against a
//! hand-rolled protocol instead of `openraft`'s).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError};
use openraft::network::{RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;

use crate::raft_types::{NodeId, TypeConfig};

/// One entry point per known cluster member; a new [`HttpRaftNetwork`] is
/// handed out per target by [`HttpRaftNetworkFactory::new_client`], each
/// wrapping the shared connection-pooled `reqwest::Client`.
#[derive(Clone)]
pub struct HttpRaftNetworkFactory {
    client: reqwest::Client,
}

impl HttpRaftNetworkFactory {
    pub fn new(client: reqwest::Client) -> Self {
        HttpRaftNetworkFactory { client }
    }

    pub fn with_default_client() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(HttpRaftNetworkFactory { client })
    }
}

#[async_trait]
impl RaftNetworkFactory<TypeConfig> for HttpRaftNetworkFactory {
    type Network = HttpRaftNetwork;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        HttpRaftNetwork {
            client: self.client.clone(),
            target,
            base_url: format!("https://{}", node.addr),
        }
    }
}

pub struct HttpRaftNetwork {
    client: reqwest::Client,
    target: NodeId,
    base_url: String,
}

impl HttpRaftNetwork {
    async fn post<Req, Resp>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp, RPCError<TypeConfig, RaftError<TypeConfig>>>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}/raft/{}", self.base_url, path);
        let body = bincode::serialize(req).map_err(|e| {
            RPCError::Network(NetworkError::new(&std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                e,
            )))
        })?;

        let resp = self
            .client
            .post(&url)
            .body(body)
            .send()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        bincode::deserialize(&bytes).map_err(|e| {
            RPCError::Network(NetworkError::new(&std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e,
            )))
        })
    }
}

#[async_trait]
impl RaftNetwork<TypeConfig> for HttpRaftNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: openraft::network::RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<TypeConfig, RaftError<TypeConfig>>> {
        self.post("append-entries", &req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: openraft::network::RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<TypeConfig, RaftError<TypeConfig, InstallSnapshotError>>,
    > {
        self.post("install-snapshot", &req)
            .await
            .map_err(|e| match e {
                RPCError::Network(n) => RPCError::Network(n),
                RPCError::Timeout(t) => RPCError::Timeout(t),
                RPCError::Unreachable(u) => RPCError::Unreachable(u),
                RPCError::PayloadTooLarge(p) => RPCError::PayloadTooLarge(p),
                RPCError::RemoteError(RemoteError { target, target_node, source, .. }) => {
                    RPCError::RemoteError(RemoteError::new(target, target_node, source.into()))
                }
            })
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: openraft::network::RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<TypeConfig, RaftError<TypeConfig>>> {
        self.post("vote", &req).await
    }
}

/// Axum handlers mounted under `/raft/*` on the host's RPC server
/// (spec §4.C, the inbound half of this module's outbound client).
pub mod handlers {
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::StatusCode;
    use std::sync::Arc as StdArc;

    use crate::raft_types::Raft;

    #[derive(Clone)]
    pub struct RaftRpcState {
        pub raft: StdArc<Raft>,
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StatusCode> {
        bincode::serialize(value).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<T, StatusCode> {
        bincode::deserialize(bytes).map_err(|_| StatusCode::BAD_REQUEST)
    }

    pub async fn append_entries(
        State(state): State<RaftRpcState>,
        body: Bytes,
    ) -> Result<Vec<u8>, StatusCode> {
        let req = decode(&body)?;
        let resp = state
            .raft
            .append_entries(req)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        encode(&resp)
    }

    pub async fn install_snapshot(
        State(state): State<RaftRpcState>,
        body: Bytes,
    ) -> Result<Vec<u8>, StatusCode> {
        let req = decode(&body)?;
        let resp = state
            .raft
            .install_snapshot(req)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        encode(&resp)
    }

    pub async fn vote(
        State(state): State<RaftRpcState>,
        body: Bytes,
    ) -> Result<Vec<u8>, StatusCode> {
        let req = decode(&body)?;
        let resp = state
            .raft
            .vote(req)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        encode(&resp)
    }
}
