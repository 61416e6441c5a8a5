//! Error taxonomy for the policy dispatcher core.
//!
//! Each concern gets its own `thiserror` enum (mirrors `ConsensusError` in
//! the consensus engine this crate is descended from); [`DispatcherError`]
//! composes them for the host binary. Library code never returns `anyhow`.

use thiserror::Error;

/// Errors raised by the rule index / policy database (spec §4.A).
#[derive(Debug, Error)]
pub enum RuleIndexError {
    #[error("rule not found: sec={sec} p_type={p_type} rule={rule:?}")]
    NotFound {
        sec: String,
        p_type: String,
        rule: Vec<String>,
    },

    #[error("old_rules and new_rules have different lengths: {old} != {new}")]
    LengthMismatch { old: usize, new: usize },

    #[error("persistent store error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Errors raised while applying a committed log entry (spec §4.B / §7).
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Envelope failed to decode. Fatal: I3 would otherwise be violated.
    #[error("malformed command envelope at log index {index}: {source}")]
    Decode {
        index: u64,
        #[source]
        source: prost::DecodeError,
    },

    /// A logical failure reported back to the caller (e.g. `UpdateRule`
    /// whose `old_rule` is absent). Not fatal.
    #[error("logical apply failure: {0}")]
    Logical(#[from] RuleIndexError),

    /// Structural failure (corrupt KV, write-batch commit failure). Fatal.
    #[error("structural apply failure: {0}")]
    Structural(String),
}

/// Errors surfaced by the leader-forwarding RPC gate (spec §4.C / §7).
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("this node is not the leader")]
    NotLeader { leader_address: Option<String> },

    #[error("no leader is currently known")]
    NoLeader,

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("proposal timed out waiting for commit")]
    Timeout,

    #[error("consensus is shutting down")]
    ConsensusShutdown,

    #[error("membership operation rejected: {0}")]
    Membership(String),
}

/// Errors raised while loading and validating configuration (spec §6 / §10.3).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised during cluster bootstrap (spec §4.C "Bootstrap policy").
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to open persistent store at {path}: {source}")]
    OpenStore {
        path: String,
        #[source]
        source: sled::Error,
    },

    #[error("consensus engine failed to start: {0}")]
    ConsensusStart(String),

    #[error("join request to {join_address} failed: {0}", join_address = .1)]
    Join(String, String),

    #[error("timed out waiting for leadership to stabilize after {0:?}")]
    LeaderWaitTimeout(std::time::Duration),
}

/// Top-level error used by the host process (`main.rs`); maps to the exit
/// codes enumerated in spec §6.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("persistent store corruption: {0}")]
    StoreCorruption(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl DispatcherError {
    /// Host-process exit code per spec §6 ("Exit codes").
    pub fn exit_code(&self) -> i32 {
        match self {
            DispatcherError::Config(_) => 1,
            DispatcherError::Bootstrap(_) => 2,
            DispatcherError::StoreCorruption(_) => 3,
            DispatcherError::Rpc(_) => 1,
        }
    }
}
