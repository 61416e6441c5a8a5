//! The `openraft` type configuration binding this crate's command type and
//! node identity into the consensus library's generic machinery.
//!
//! Per spec §1, the consensus library (log replication, leader election,
//! snapshot transfer) is an external collaborator; this module is the
//! seam where our [`crate::command::Command`] becomes the `D` (write
//! request) type it replicates.

use openraft::BasicNode;

use crate::command::Command;
use crate::state_machine::ApplyOutcome;

/// `serverId` (spec §6 "Configuration options") doubles as the raft node
/// identifier — it defaults to the raft listen address.
pub type NodeId = String;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Command,
        R = ApplyOutcome,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = std::io::Cursor<Vec<u8>>,
);

pub type Raft = openraft::Raft<TypeConfig>;
