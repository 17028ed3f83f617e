//! Replica-to-replica wire protocol
//!
//! Serialized with CBOR (`ciborium`) into frames carried by a
//! [`RaftTransport`](super::network::RaftTransport).

use serde::{Deserialize, Serialize};

use super::raft_log::LogEntry;
use super::{LogIndex, NodeId, ReplicationError, Term};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    RequestVoteResponse {
        term: Term,
        vote_granted: bool,
    },
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendEntriesResponse {
        term: Term,
        success: bool,
        /// Last index known to match the leader on success.
        match_index: LogIndex,
        /// Where the leader should retry from on failure.
        conflict_index: LogIndex,
    },
    InstallSnapshot {
        term: Term,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        data: Vec<u8>,
    },
    InstallSnapshotResponse {
        term: Term,
        last_included_index: LogIndex,
    },
    /// A follower hands a client proposal to the leader it knows about.
    ForwardProposal {
        payload: Vec<u8>,
    },
}

impl RaftMessage {
    pub fn term(&self) -> Option<Term> {
        match self {
            Self::RequestVote { term, .. }
            | Self::RequestVoteResponse { term, .. }
            | Self::AppendEntries { term, .. }
            | Self::AppendEntriesResponse { term, .. }
            | Self::InstallSnapshot { term, .. }
            | Self::InstallSnapshotResponse { term, .. } => Some(*term),
            Self::ForwardProposal { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn to_cbor(&self) -> Result<Vec<u8>, ReplicationError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| ReplicationError::Encoding(format!("CBOR encode: {e}")))?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, ReplicationError> {
        ciborium::from_reader(bytes)
            .map_err(|e| ReplicationError::Encoding(format!("CBOR decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_entries_survives_cbor() {
        let envelope = Envelope {
            from: 1,
            to: 2,
            message: RaftMessage::AppendEntries {
                term: 3,
                leader_id: 1,
                prev_log_index: 4,
                prev_log_term: 2,
                entries: vec![LogEntry {
                    term: 3,
                    index: 5,
                    payload: b"{}".to_vec(),
                }],
                leader_commit: 4,
            },
        };
        let bytes = envelope.to_cbor().unwrap();
        assert_eq!(Envelope::from_cbor(&bytes).unwrap(), envelope);
    }
}
