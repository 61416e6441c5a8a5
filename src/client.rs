//! The bundled leader-forwarding client (spec §4.C "Client library").
//!
//! Follows redirects emitted by [`crate::rpc::gate`] up to a bounded hop
//! count, surfacing [`ClientError::NoLeader`] past that bound rather than
//! looping forever against a partitioned or thrashing cluster. One pooled
//! `reqwest::Client` backs every target address, matching the connection
//! reuse the original Go client gets for free from `net/http`'s transport.

use std::time::Duration;

use prost::Message;
use thiserror::Error;

use crate::command::proto;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("exceeded {0} redirect hops without reaching a leader")]
    NoLeader(u8),

    #[error("server reported an error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Bounded-hop-count redirect-following client (spec §4.C default hop
/// count of 3).
pub struct DispatcherClient {
    http: reqwest::Client,
    max_redirects: u8,
}

impl DispatcherClient {
    pub const DEFAULT_MAX_REDIRECTS: u8 = 3;

    pub fn new(seed_address: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_max_redirects(seed_address, Self::DEFAULT_MAX_REDIRECTS)
    }

    pub fn with_max_redirects(
        seed_address: impl Into<String>,
        max_redirects: u8,
    ) -> Result<Self, reqwest::Error> {
        let seed_address = seed_address.into();
        let http = reqwest::Client::builder()
            // We follow redirects ourselves (re-resolving the leader per
            // spec §4.C "clients must re-resolve on every request"), not
            // via reqwest's own automatic redirect policy.
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(10))
            .build()?;
        let _ = seed_address;
        Ok(DispatcherClient { http, max_redirects })
    }

    async fn put_following_redirects(
        &self,
        mut url: String,
        body: Vec<u8>,
    ) -> Result<(), ClientError> {
        for _ in 0..=self.max_redirects {
            let resp = self
                .http
                .put(&url)
                .body(body.clone())
                .send()
                .await?;

            match resp.status() {
                reqwest::StatusCode::OK => return Ok(()),
                reqwest::StatusCode::TEMPORARY_REDIRECT => {
                    let location = resp
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    match location {
                        Some(next) => url = next,
                        None => return Err(ClientError::NoLeader(self.max_redirects)),
                    }
                }
                reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                    return Err(ClientError::NoLeader(self.max_redirects))
                }
                status => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(ClientError::Server {
                        status: status.as_u16(),
                        body,
                    });
                }
            }
        }
        Err(ClientError::NoLeader(self.max_redirects))
    }

    pub async fn add_rules(
        &self,
        base_url: &str,
        sec: &str,
        p_type: &str,
        rules: &[crate::rule::Rule],
    ) -> Result<(), ClientError> {
        let envelope: proto::Envelope = crate::command::Command::AddRules {
            key: crate::rule::BucketKey::new(sec, p_type),
            rules: rules.to_vec(),
        }
        .into();
        self.put_following_redirects(format!("{base_url}/policies/add"), envelope.encode_to_vec())
            .await
    }

    pub async fn remove_rules(
        &self,
        base_url: &str,
        sec: &str,
        p_type: &str,
        rules: &[crate::rule::Rule],
    ) -> Result<(), ClientError> {
        let envelope: proto::Envelope = crate::command::Command::RemoveRules {
            key: crate::rule::BucketKey::new(sec, p_type),
            rules: rules.to_vec(),
        }
        .into();
        self.put_following_redirects(
            format!("{base_url}/policies/remove"),
            envelope.encode_to_vec(),
        )
        .await
    }

    pub async fn clear(&self, base_url: &str) -> Result<(), ClientError> {
        self.put_following_redirects(format!("{base_url}/policies/remove?type=all"), Vec::new())
            .await
    }

    pub async fn join_node(
        &self,
        base_url: &str,
        server_id: &str,
        address: &str,
    ) -> Result<(), ClientError> {
        let req = proto::JoinNodeRequest {
            server_id: server_id.to_string(),
            address: address.to_string(),
        };
        self.put_following_redirects(format!("{base_url}/nodes/join"), req.encode_to_vec())
            .await
    }

    pub async fn remove_node(&self, base_url: &str, server_id: &str) -> Result<(), ClientError> {
        let req = proto::RemoveNodeRequest {
            server_id: server_id.to_string(),
        };
        self.put_following_redirects(format!("{base_url}/nodes/remove"), req.encode_to_vec())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_redirects_matches_spec() {
        assert_eq!(DispatcherClient::DEFAULT_MAX_REDIRECTS, 3);
    }
}
