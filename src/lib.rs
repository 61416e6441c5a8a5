//! Replicated access-control policy dispatcher.
//!
//! A leader-forwarding RPC plane sits in front of a consensus-replicated
//! rule store: every mutation is proposed through the consensus library,
//! applied identically and in order on every replica, and persisted to an
//! embedded ordered KV. The crate does not evaluate policies itself — it
//! exists purely to keep a distributed rule set consistent and to notify
//! an external policy-evaluation engine of the effective change.
//!
//! # Architecture
//!
//! - **Rule Index** (`rule`, `bucket`, `store`): the `(sec, pType) -> rules`
//!   data model, its field index, and its durable KV-backed form.
//! - **Replicated Log Applier** (`command`, `state_machine`, `raft_types`,
//!   `raft_log_store`, `raft_network`): binds the Rule Index to `openraft`.
//! - **Evaluator collaborator** (`evaluator`): one-way effective-diff feed
//!   to the external policy-evaluation engine.
//! - **RPC surface** (`rpc`, `client`): leader-forwarding HTTP routes and
//!   the bundled client that follows their redirects.
//! - **Bootstrap** (`bootstrap`): first-start cluster formation policy.
//! - **Ambient stack** (`config`, `telemetry`, `error`): configuration,
//!   logging, and the error taxonomy shared by every layer above.

#![warn(missing_docs)]

pub mod bootstrap;
pub mod bucket;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod raft_log_store;
pub mod raft_network;
pub mod raft_types;
pub mod rpc;
pub mod rule;
pub mod state_machine;
pub mod store;
pub mod telemetry;
pub mod tls;

/// Crate version, exposed for diagnostics and the `/nodes/join` handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
