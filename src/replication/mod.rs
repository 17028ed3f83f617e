//! Consensus-replicated action log
//!
//! Every state-changing request (exercise creation and deletion, client
//! actions, ticks) is appended to a single totally ordered log. Each replica
//! applies committed entries in index order through
//! [`ExerciseStateMachine`], so replicas that applied the same prefix hold
//! identical exercise states.
//!
//! Two implementations of [`ReplicatedLog`] exist: [`RaftReplica`], a Raft
//! node driven by an async task over a [`RaftTransport`], and [`LocalLog`],
//! a single-process log with no peers.

pub mod command;
pub mod local;
pub mod message;
pub mod network;
pub mod node;
pub mod pending;
pub mod quorum;
pub mod raft;
pub mod raft_log;
pub mod state_machine;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use command::{ApplyOutcome, LogCommand, LogRequest};
pub use local::LocalLog;
pub use network::{RaftTransport, SimEndpoint, SimNetwork, TransportError};
pub use node::RaftReplica;
pub use pending::{PendingRequests, PendingResponse};
pub use raft::{RaftRole, RaftStatus};
pub use state_machine::{ExerciseStateMachine, StateMachine};

pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicationError {
    #[error("Not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("No leader available")]
    NoLeader,

    #[error("Timed out waiting for commit")]
    Timeout,

    #[error("Request {0} is already in flight")]
    DuplicateRequest(Uuid),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Replica shut down")]
    ShutDown,

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Synchronization error: {0}")]
    SyncError(String),
}

/// A totally ordered, replicated command log.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Append `request` and wait until it has been applied locally.
    ///
    /// Resubmitting the same `request_id` after a timeout is safe: the
    /// state machine applies a request id at most once.
    async fn submit(&self, request: LogRequest) -> Result<ApplyOutcome, ReplicationError>;

    /// Whether this replica currently leads. Drives leader-only work such
    /// as the exercise ticker.
    fn is_leader(&self) -> bool;
}
