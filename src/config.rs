//! Dispatcher configuration (spec §6 "Configuration options").
//!
//! Loading hierarchy follows the teacher's `knhk-config` convention —
//! `file < env < defaults-filled-in`, applied in three explicit stages
//! (`load_from_file` → `apply_env_overrides` → `validate`) rather than one
//! big constructor.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::evaluator::EvaluatorUpdatePolicy;

/// TLS material paths (spec §6 "tlsConfig (required; must provide cert,
/// key, CA)").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsensusOverrides {
    /// Passed through to `openraft::Config` (spec §6 "consensusOverrides
    /// passed through to the consensus library"). Left as raw TOML so new
    /// openraft tunables don't require a schema change here.
    #[serde(flatten)]
    pub raw: toml::Table,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DispatcherConfig {
    pub server_id: Option<String>,
    pub data_dir: PathBuf,
    pub raft_listen_address: SocketAddr,
    pub rpc_listen_address: Option<SocketAddr>,
    pub join_address: Option<String>,
    pub tls: TlsConfig,
    #[serde(default)]
    pub consensus_overrides: ConsensusOverrides,
    #[serde(default)]
    pub evaluator_update_policy: EvaluatorUpdatePolicy,
    #[serde(default = "default_leader_wait_timeout_secs")]
    pub leader_wait_timeout_secs: u64,
}

fn default_leader_wait_timeout_secs() -> u64 {
    30
}

impl DispatcherConfig {
    /// `serverId` defaults to the raft listen address (spec §6).
    pub fn server_id(&self) -> String {
        self.server_id
            .clone()
            .unwrap_or_else(|| self.raft_listen_address.to_string())
    }

    /// The RPC listen address is derived by incrementing the consensus
    /// port by 1 when not explicitly configured (spec §6 "Transport
    /// endpoint convention").
    pub fn rpc_listen_address(&self) -> SocketAddr {
        self.rpc_listen_address.unwrap_or_else(|| {
            let mut addr = self.raft_listen_address;
            addr.set_port(addr.port() + 1);
            addr
        })
    }
}

pub fn load(path: impl AsRef<Path>) -> Result<DispatcherConfig, ConfigError> {
    let mut config = load_from_file(path)?;
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

pub fn load_from_file(path: impl AsRef<Path>) -> Result<DispatcherConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let config: DispatcherConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Environment overrides: `POLICY_DISPATCHER_<FIELD>`, matching the
/// `KNHK_*` naming convention the teacher uses for its own override layer.
pub fn apply_env_overrides(config: &mut DispatcherConfig) -> Result<(), ConfigError> {
    if let Ok(v) = std::env::var("POLICY_DISPATCHER_SERVER_ID") {
        config.server_id = Some(v);
    }
    if let Ok(v) = std::env::var("POLICY_DISPATCHER_DATA_DIR") {
        config.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("POLICY_DISPATCHER_RAFT_LISTEN_ADDRESS") {
        config.raft_listen_address = v
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid raft_listen_address: {v}")))?;
    }
    if let Ok(v) = std::env::var("POLICY_DISPATCHER_RPC_LISTEN_ADDRESS") {
        config.rpc_listen_address = Some(
            v.parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid rpc_listen_address: {v}")))?,
        );
    }
    if let Ok(v) = std::env::var("POLICY_DISPATCHER_JOIN_ADDRESS") {
        config.join_address = Some(v);
    }
    Ok(())
}

pub fn validate(config: &DispatcherConfig) -> Result<(), ConfigError> {
    if config.data_dir.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("data_dir is required".to_string()));
    }
    if !config.tls.cert_path.exists() {
        return Err(ConfigError::Invalid(format!(
            "tls cert not found at {}",
            config.tls.cert_path.display()
        )));
    }
    if !config.tls.key_path.exists() {
        return Err(ConfigError::Invalid(format!(
            "tls key not found at {}",
            config.tls.key_path.display()
        )));
    }
    if !config.tls.ca_path.exists() {
        return Err(ConfigError::Invalid(format!(
            "tls CA not found at {}",
            config.tls.ca_path.display()
        )));
    }
    if let Some(join) = &config.join_address {
        if join.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "join_address is not a valid socket address: {join}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> DispatcherConfig {
        DispatcherConfig {
            server_id: None,
            data_dir: PathBuf::from("/tmp/policy-dispatcher"),
            raft_listen_address: "127.0.0.1:7946".parse().unwrap(),
            rpc_listen_address: None,
            join_address: None,
            tls: TlsConfig {
                cert_path: PathBuf::from("/tmp/cert.pem"),
                key_path: PathBuf::from("/tmp/key.pem"),
                ca_path: PathBuf::from("/tmp/ca.pem"),
            },
            consensus_overrides: ConsensusOverrides::default(),
            evaluator_update_policy: EvaluatorUpdatePolicy::PerReplica,
            leader_wait_timeout_secs: 30,
        }
    }

    #[test]
    fn server_id_defaults_to_raft_listen_address() {
        let config = base_config();
        assert_eq!(config.server_id(), "127.0.0.1:7946");
    }

    #[test]
    fn rpc_listen_address_defaults_to_raft_port_plus_one() {
        let config = base_config();
        assert_eq!(config.rpc_listen_address().port(), 7947);
    }

    #[test]
    fn explicit_rpc_listen_address_is_not_overridden() {
        let mut config = base_config();
        config.rpc_listen_address = Some("127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.rpc_listen_address().port(), 9000);
    }
}
