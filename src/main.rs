//! `policy-dispatcher` host process entry point.
//!
//! Wires together config loading, logging, bootstrap, the consensus
//! engine, and the RPC surface, then blocks until shutdown. Exit codes
//! follow spec §6 ("Exit codes"): `0` clean shutdown, `1` configuration
//! error, `2` consensus startup error, `3` persistent-store corruption.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use policy_dispatcher_core::error::{BootstrapError, DispatcherError};
use policy_dispatcher_core::raft_types::{NodeId, Raft};
use policy_dispatcher_core::{
    bootstrap, config, evaluator, raft_log_store, rpc, state_machine, store, telemetry, tls,
};

#[derive(Parser, Debug)]
#[command(name = "policy-dispatcher", version = policy_dispatcher_core::VERSION)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "POLICY_DISPATCHER_CONFIG", default_value = "policy-dispatcher.toml")]
    config: PathBuf,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, env = "POLICY_DISPATCHER_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    telemetry::init(if cli.log_json {
        telemetry::LogFormat::Json
    } else {
        telemetry::LogFormat::Text
    });

    if let Err(e) = run(cli).await {
        error!(error = %e, exit_code = e.exit_code(), "dispatcher exited with error");
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), DispatcherError> {
    let cfg = config::load(&cli.config)?;
    let server_id: NodeId = cfg.server_id();

    info!(%server_id, raft_listen = %cfg.raft_listen_address, "starting policy dispatcher");

    // Layout per spec §6: `raft/` (consensus library's own log/stable
    // store) and `rules.db` (our embedded KV), side by side so a
    // snapshot-install touching both stays on one filesystem.
    let raft_dir = cfg.data_dir.join("raft");
    let rules_db_path = cfg.data_dir.join("rules.db");

    std::fs::create_dir_all(&raft_dir).map_err(|e| {
        DispatcherError::Bootstrap(BootstrapError::OpenStore {
            path: raft_dir.display().to_string(),
            source: sled::Error::Io(e),
        })
    })?;

    let shared_db = raft_log_store::open_shared_db(&raft_dir).map_err(|e| {
        DispatcherError::Bootstrap(BootstrapError::OpenStore {
            path: raft_dir.display().to_string(),
            source: e,
        })
    })?;

    let policy_db = Arc::new(
        store::PolicyDatabase::open(&rules_db_path)
            .map_err(|e| DispatcherError::StoreCorruption(e.to_string()))?,
    );

    let store_is_empty = policy_db
        .last_applied_index()
        .map_err(|e| DispatcherError::StoreCorruption(e.to_string()))?
        == 0;

    let log_store = raft_log_store::RaftLogStore::new(&shared_db)
        .map_err(|e| DispatcherError::Bootstrap(BootstrapError::ConsensusStart(e.to_string())))?;

    // The evaluator itself is an external collaborator (spec §1) this
    // crate doesn't implement; a real deployment passes `evaluator_rx` to
    // `evaluator::drive` alongside its own `PolicyEvaluator`.
    let (evaluator_tx, _evaluator_rx) = evaluator::channel(cfg.evaluator_update_policy);
    let is_leader_flag = Arc::new(AtomicBool::new(false));

    let state_machine =
        state_machine::PolicyStateMachine::new(policy_db.clone(), evaluator_tx, is_leader_flag.clone());

    let raft_config = Arc::new(
        openraft::Config::default()
            .validate()
            .map_err(|e| DispatcherError::Bootstrap(BootstrapError::ConsensusStart(e.to_string())))?,
    );

    let network = policy_dispatcher_core::raft_network::HttpRaftNetworkFactory::with_default_client()
        .map_err(|e| DispatcherError::Bootstrap(BootstrapError::ConsensusStart(e.to_string())))?;

    let raft: Raft = openraft::Raft::new(
        server_id.clone(),
        raft_config,
        network,
        log_store,
        state_machine,
    )
    .await
    .map_err(|e| DispatcherError::Bootstrap(BootstrapError::ConsensusStart(e.to_string())))?;
    let raft = Arc::new(raft);

    // Advertise the RPC address, not the raft listen address: it's the only
    // one this process actually binds a listener on (`tls::serve` below),
    // and it's what every peer's `raft_network.rs` and `rpc::gate` dial.
    let rpc_addr = cfg.rpc_listen_address();
    let action = bootstrap::decide_bootstrap_action(store_is_empty, cfg.join_address.as_deref());
    bootstrap::run(
        &raft,
        &server_id,
        &rpc_addr.to_string(),
        action,
        Duration::from_secs(cfg.leader_wait_timeout_secs),
    )
    .await?;

    let rpc_state = rpc::RpcState { raft: raft.clone() };
    let gate_state = rpc::gate::LeaderGateState {
        raft: raft.clone(),
        rpc_scheme: "https",
    };
    let membership_state = rpc::membership::MembershipState { raft: raft.clone() };
    let raft_rpc_state =
        policy_dispatcher_core::raft_network::handlers::RaftRpcState { raft: raft.clone() };

    let app = rpc::router(rpc_state, gate_state, membership_state, raft_rpc_state);

    let tls_server_config = tls::build_server_config(&cfg.tls)
        .map_err(|e| DispatcherError::Bootstrap(BootstrapError::ConsensusStart(e.to_string())))?;

    info!(%rpc_addr, "RPC surface listening");

    tokio::spawn(track_leadership(raft.clone(), server_id.clone(), is_leader_flag));

    tls::serve(rpc_addr, tls_server_config, app)
        .await
        .map_err(|e| DispatcherError::Bootstrap(BootstrapError::ConsensusStart(e.to_string())))?;

    Ok(())
}

/// Keeps `is_leader` in step with the consensus library's own view, so the
/// state machine's "only on the leader" evaluator forward (spec §4.B step
/// 3) is never stale for more than one metrics tick.
async fn track_leadership(raft: Arc<Raft>, server_id: NodeId, is_leader: Arc<AtomicBool>) {
    let mut rx = raft.metrics();
    loop {
        let leader = rx.borrow().current_leader.clone();
        is_leader.store(leader.as_ref() == Some(&server_id), std::sync::atomic::Ordering::Release);
        if rx.changed().await.is_err() {
            return;
        }
    }
}
