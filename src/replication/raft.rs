//! Raft consensus core
//!
//! A synchronous step machine: feed it messages and clock ticks, collect
//! outgoing messages with [`RaftCore::take_messages`]. It owns the state
//! machine and applies committed entries in index order. All I/O and timers
//! live in the async driver (`node.rs`), which keeps this part testable
//! without a runtime.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Duration, Instant};

use super::raft_log::{LogEntry, RaftLog};
use super::message::{Envelope, RaftMessage};
use super::quorum::QuorumTracker;
use super::state_machine::StateMachine;
use super::{LogIndex, NodeId, ReplicationError, Term};
use crate::config::RaftConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// Externally visible consensus state of one replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub snapshot_index: LogIndex,
}

pub struct RaftCore<M: StateMachine> {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,

    role: RaftRole,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    votes: BTreeSet<NodeId>,

    log: RaftLog,
    commit_index: LogIndex,
    last_applied: LogIndex,
    /// State-machine snapshot covering the log up to `log.snapshot_index()`.
    snapshot: Option<Vec<u8>>,

    // Leader bookkeeping
    next_index: BTreeMap<NodeId, LogIndex>,
    quorum: QuorumTracker,

    election_deadline: Instant,
    heartbeat_deadline: Instant,
    rng: StdRng,

    machine: M,
    outbox: Vec<Envelope>,
}

impl<M: StateMachine> RaftCore<M> {
    pub fn new(id: NodeId, peers: Vec<NodeId>, config: RaftConfig, machine: M, now: Instant) -> Self {
        let peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != id).collect();
        let quorum = QuorumTracker::new(std::iter::once(id).chain(peers.iter().copied()));
        let mut core = Self {
            id,
            peers,
            config,
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            votes: BTreeSet::new(),
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            snapshot: None,
            next_index: BTreeMap::new(),
            quorum,
            election_deadline: now,
            heartbeat_deadline: now,
            // Seeded per node so elections are reproducible in tests.
            rng: StdRng::seed_from_u64(0x5eed ^ id),
            machine,
            outbox: Vec::new(),
        };
        core.reset_election_deadline(now);
        core
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            role: self.role,
            term: self.current_term,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            snapshot_index: self.log.snapshot_index(),
        }
    }

    /// When [`tick`](Self::tick) next has something to do.
    pub fn next_deadline(&self) -> Instant {
        match self.role {
            RaftRole::Leader => self.heartbeat_deadline,
            RaftRole::Follower | RaftRole::Candidate => self.election_deadline,
        }
    }

    /// Drain messages produced since the last call.
    pub fn take_messages(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Advance timers: heartbeats on the leader, elections elsewhere.
    pub fn tick(&mut self, now: Instant) {
        match self.role {
            RaftRole::Leader => {
                if now >= self.heartbeat_deadline {
                    self.broadcast_append();
                    self.heartbeat_deadline = now + self.config.heartbeat_interval();
                }
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if now >= self.election_deadline {
                    self.start_election(now);
                }
            }
        }
    }

    /// Offer a new entry to the cluster.
    ///
    /// The leader appends it; a follower forwards it to the leader it knows
    /// about. Acceptance here is no promise of commit: the caller learns
    /// the outcome when the entry is applied.
    pub fn propose(&mut self, payload: Vec<u8>) -> Result<(), ReplicationError> {
        match self.role {
            RaftRole::Leader => {
                let index = self.log.append(self.current_term, payload);
                self.quorum.update(self.id, index);
                self.broadcast_append();
                self.advance_commit();
                Ok(())
            }
            RaftRole::Follower | RaftRole::Candidate => match self.leader_id {
                Some(leader) => {
                    self.send(leader, RaftMessage::ForwardProposal { payload });
                    Ok(())
                }
                None => Err(ReplicationError::NoLeader),
            },
        }
    }

    /// Handle one message from `from`.
    pub fn step(&mut self, from: NodeId, message: RaftMessage, now: Instant) {
        if let Some(term) = message.term() {
            if term > self.current_term {
                self.become_follower(term, None);
            }
        }

        match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let up_to_date = last_log_term > self.log.last_term()
                    || (last_log_term == self.log.last_term()
                        && last_log_index >= self.log.last_index());
                let vote_granted = term == self.current_term
                    && up_to_date
                    && self.voted_for.map_or(true, |v| v == candidate_id);
                if vote_granted {
                    self.voted_for = Some(candidate_id);
                    self.reset_election_deadline(now);
                }
                self.send(
                    from,
                    RaftMessage::RequestVoteResponse {
                        term: self.current_term,
                        vote_granted,
                    },
                );
            }
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                if self.role == RaftRole::Candidate && term == self.current_term && vote_granted {
                    self.votes.insert(from);
                    if self.quorum.is_quorum(self.votes.len()) {
                        self.become_leader(now);
                    }
                }
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                from,
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                now,
            ),
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
                conflict_index,
            } => {
                if self.role != RaftRole::Leader || term != self.current_term {
                    return;
                }
                if success {
                    self.quorum.update(from, match_index);
                    self.next_index.insert(from, match_index + 1);
                    self.advance_commit();
                    if match_index < self.log.last_index() {
                        self.send_append(from);
                    }
                } else {
                    let next = conflict_index.clamp(1, self.log.last_index() + 1);
                    self.next_index.insert(from, next);
                    self.send_append(from);
                }
            }
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
            } => self.handle_install_snapshot(
                from,
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
                now,
            ),
            RaftMessage::InstallSnapshotResponse {
                term,
                last_included_index,
            } => {
                if self.role != RaftRole::Leader || term != self.current_term {
                    return;
                }
                self.quorum.update(from, last_included_index);
                self.next_index.insert(from, last_included_index + 1);
                if last_included_index < self.log.last_index() {
                    self.send_append(from);
                }
            }
            RaftMessage::ForwardProposal { payload } => {
                if self.role == RaftRole::Leader {
                    if let Err(e) = self.propose(payload) {
                        log::warn!("node {}: forwarded proposal failed: {}", self.id, e);
                    }
                } else {
                    // The proposer retries; it will find the new leader.
                    log::debug!("node {}: dropping forwarded proposal, not leader", self.id);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Role transitions
    // -----------------------------------------------------------------------

    fn reset_election_deadline(&mut self, now: Instant) {
        let timeout = self
            .rng
            .gen_range(self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms);
        self.election_deadline = now + Duration::from_millis(timeout);
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if self.role == RaftRole::Leader {
            log::info!("node {}: stepping down in term {}", self.id, self.current_term);
        }
        self.role = RaftRole::Follower;
        self.leader_id = leader;
    }

    fn start_election(&mut self, now: Instant) {
        self.current_term += 1;
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes = BTreeSet::from([self.id]);
        self.reset_election_deadline(now);
        log::debug!("node {}: starting election for term {}", self.id, self.current_term);

        if self.quorum.is_quorum(self.votes.len()) {
            self.become_leader(now);
            return;
        }
        let request = RaftMessage::RequestVote {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.peers.clone() {
            self.send(peer, request.clone());
        }
    }

    fn become_leader(&mut self, now: Instant) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        log::info!("node {}: elected leader for term {}", self.id, self.current_term);

        let next = self.log.last_index() + 1;
        self.next_index = self.peers.iter().map(|p| (*p, next)).collect();
        self.quorum = QuorumTracker::new(std::iter::once(self.id).chain(self.peers.iter().copied()));

        // Entries from earlier terms only commit behind one from this term.
        let index = self.log.append(self.current_term, Vec::new());
        self.quorum.update(self.id, index);
        self.broadcast_append();
        self.heartbeat_deadline = now + self.config.heartbeat_interval();
        self.advance_commit();
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    fn send(&mut self, to: NodeId, message: RaftMessage) {
        self.outbox.push(Envelope {
            from: self.id,
            to,
            message,
        });
    }

    fn broadcast_append(&mut self) {
        for peer in self.peers.clone() {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: NodeId) {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);

        if next <= self.log.snapshot_index() {
            let Some(data) = self.snapshot.clone() else {
                log::error!("node {}: log compacted without a snapshot", self.id);
                return;
            };
            self.send(
                peer,
                RaftMessage::InstallSnapshot {
                    term: self.current_term,
                    leader_id: self.id,
                    last_included_index: self.log.snapshot_index(),
                    last_included_term: self.log.snapshot_term(),
                    data,
                },
            );
            return;
        }

        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .log
            .entries_from(next, self.config.max_entries_per_message);
        self.send(
            peer,
            RaftMessage::AppendEntries {
                term: self.current_term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        from: NodeId,
        term: Term,
        leader_id: NodeId,
        mut prev_log_index: LogIndex,
        mut prev_log_term: Term,
        mut entries: Vec<LogEntry>,
        leader_commit: LogIndex,
        now: Instant,
    ) {
        let reject = |core: &Self, conflict_index: LogIndex| RaftMessage::AppendEntriesResponse {
            term: core.current_term,
            success: false,
            match_index: 0,
            conflict_index,
        };

        if term < self.current_term {
            let response = reject(self, 0);
            self.send(from, response);
            return;
        }
        self.become_follower(term, Some(leader_id));
        self.reset_election_deadline(now);

        // Everything up to our snapshot is committed and therefore agrees.
        if prev_log_index < self.log.snapshot_index() {
            let snapshot_index = self.log.snapshot_index();
            entries.retain(|e| e.index > snapshot_index);
            prev_log_index = snapshot_index;
            prev_log_term = self.log.snapshot_term();
        }

        match self.log.term_at(prev_log_index) {
            Some(t) if t == prev_log_term => {}
            Some(_) => {
                let response = reject(self, prev_log_index);
                self.send(from, response);
                return;
            }
            None => {
                let response = reject(self, self.log.last_index() + 1);
                self.send(from, response);
                return;
            }
        }

        let last_new = prev_log_index + entries.len() as LogIndex;
        self.log.merge(entries);

        let new_commit = leader_commit.min(last_new);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed();
        }

        self.send(
            from,
            RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                success: true,
                match_index: last_new,
                conflict_index: 0,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        term: Term,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        data: Vec<u8>,
        now: Instant,
    ) {
        if term < self.current_term {
            self.send(
                from,
                RaftMessage::InstallSnapshotResponse {
                    term: self.current_term,
                    last_included_index: 0,
                },
            );
            return;
        }
        self.become_follower(term, Some(leader_id));
        self.reset_election_deadline(now);

        if last_included_index > self.commit_index {
            if let Err(e) = self.machine.restore(&data) {
                log::error!("node {}: failed to install snapshot: {}", self.id, e);
                return;
            }
            self.log.reset_to_snapshot(last_included_index, last_included_term);
            self.commit_index = last_included_index;
            self.last_applied = last_included_index;
            self.snapshot = Some(data);
            log::info!(
                "node {}: installed snapshot at index {} (term {})",
                self.id,
                last_included_index,
                last_included_term
            );
        }

        self.send(
            from,
            RaftMessage::InstallSnapshotResponse {
                term: self.current_term,
                last_included_index,
            },
        );
    }

    fn advance_commit(&mut self) {
        let candidate = self.quorum.quorum_index();
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            self.apply_committed();
            // Let followers apply without waiting for the next heartbeat.
            self.broadcast_append();
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.entry(index) else {
                log::error!("node {}: committed entry {} is missing", self.id, index);
                break;
            };
            if !entry.payload.is_empty() {
                self.machine.apply(index, &entry.payload);
            }
            self.last_applied = index;
        }
        self.maybe_snapshot();
    }

    fn maybe_snapshot(&mut self) {
        let threshold = self.config.snapshot_threshold;
        if threshold == 0 || self.last_applied - self.log.snapshot_index() < threshold {
            return;
        }
        match self.machine.snapshot() {
            Ok(data) => {
                self.log.compact_to(self.last_applied);
                self.snapshot = Some(data);
                log::info!(
                    "node {}: snapshot taken at index {}",
                    self.id,
                    self.last_applied
                );
            }
            Err(e) => log::warn!("node {}: snapshot failed: {}", self.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every applied payload.
    #[derive(Default)]
    struct Recorder {
        applied: Vec<Vec<u8>>,
    }

    impl StateMachine for Recorder {
        fn apply(&mut self, _index: LogIndex, payload: &[u8]) {
            self.applied.push(payload.to_vec());
        }

        fn snapshot(&self) -> Result<Vec<u8>, ReplicationError> {
            serde_json::to_vec(&self.applied).map_err(|e| ReplicationError::Snapshot(e.to_string()))
        }

        fn restore(&mut self, data: &[u8]) -> Result<(), ReplicationError> {
            self.applied =
                serde_json::from_slice(data).map_err(|e| ReplicationError::Snapshot(e.to_string()))?;
            Ok(())
        }
    }

    struct Cluster {
        nodes: BTreeMap<NodeId, RaftCore<Recorder>>,
        isolated: BTreeSet<NodeId>,
        now: Instant,
    }

    impl Cluster {
        fn new(size: u64, config: RaftConfig) -> Self {
            let now = Instant::now();
            let ids: Vec<NodeId> = (1..=size).collect();
            let nodes = ids
                .iter()
                .map(|id| {
                    (
                        *id,
                        RaftCore::new(*id, ids.clone(), config.clone(), Recorder::default(), now),
                    )
                })
                .collect();
            Self {
                nodes,
                isolated: BTreeSet::new(),
                now,
            }
        }

        fn node(&mut self, id: NodeId) -> &mut RaftCore<Recorder> {
            self.nodes.get_mut(&id).unwrap()
        }

        /// Deliver messages until the cluster goes quiet.
        fn pump(&mut self) {
            loop {
                let batch: Vec<Envelope> = self
                    .nodes
                    .values_mut()
                    .flat_map(|core| core.take_messages())
                    .collect();
                if batch.is_empty() {
                    return;
                }
                for envelope in batch {
                    if self.isolated.contains(&envelope.from) || self.isolated.contains(&envelope.to) {
                        continue;
                    }
                    let now = self.now;
                    if let Some(core) = self.nodes.get_mut(&envelope.to) {
                        core.step(envelope.from, envelope.message, now);
                    }
                }
            }
        }

        fn elect(&mut self, id: NodeId) {
            self.now += Duration::from_millis(1_000);
            let now = self.now;
            self.node(id).tick(now);
            self.pump();
        }

        fn heartbeat(&mut self, leader: NodeId) {
            self.now += Duration::from_millis(60);
            let now = self.now;
            self.node(leader).tick(now);
            self.pump();
        }
    }

    #[test]
    fn elects_a_single_leader() {
        let mut cluster = Cluster::new(3, RaftConfig::default());
        cluster.elect(1);

        assert_eq!(cluster.node(1).role(), RaftRole::Leader);
        assert_eq!(cluster.node(2).leader_id(), Some(1));
        assert_eq!(cluster.node(3).leader_id(), Some(1));
    }

    #[test]
    fn committed_entries_apply_everywhere_in_order() {
        let mut cluster = Cluster::new(3, RaftConfig::default());
        cluster.elect(1);
        for payload in [b"a".to_vec(), b"b".to_vec()] {
            cluster.node(1).propose(payload).unwrap();
        }
        // A follower forwards to the leader.
        cluster.node(3).propose(b"c".to_vec()).unwrap();
        cluster.pump();
        cluster.heartbeat(1);

        let expected = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        for id in 1..=3 {
            assert_eq!(cluster.node(id).machine().applied, expected, "node {id}");
        }
    }

    #[test]
    fn minority_cannot_commit() {
        let mut cluster = Cluster::new(3, RaftConfig::default());
        cluster.elect(1);
        cluster.isolated.extend([2, 3]);
        cluster.node(1).propose(b"lost".to_vec()).unwrap();
        cluster.pump();

        assert!(cluster.node(1).machine().applied.is_empty());
    }

    #[test]
    fn new_leader_takes_over_after_isolation() {
        let mut cluster = Cluster::new(3, RaftConfig::default());
        cluster.elect(1);
        cluster.isolated.insert(1);
        cluster.elect(2);

        assert_eq!(cluster.node(2).role(), RaftRole::Leader);
        cluster.node(2).propose(b"x".to_vec()).unwrap();
        cluster.pump();
        cluster.heartbeat(2);
        assert_eq!(cluster.node(3).machine().applied, vec![b"x".to_vec()]);

        // The old leader rejoins, steps down and catches up.
        cluster.isolated.clear();
        cluster.heartbeat(2);
        assert_eq!(cluster.node(1).role(), RaftRole::Follower);
        assert_eq!(cluster.node(1).machine().applied, vec![b"x".to_vec()]);
    }

    #[test]
    fn lagging_follower_receives_snapshot() {
        let config = RaftConfig {
            snapshot_threshold: 2,
            ..RaftConfig::default()
        };
        let mut cluster = Cluster::new(3, config);
        cluster.elect(1);
        cluster.isolated.insert(3);
        for i in 0..5u8 {
            cluster.node(1).propose(vec![i]).unwrap();
            cluster.pump();
        }
        assert!(cluster.node(1).status().snapshot_index > 0);

        cluster.isolated.clear();
        cluster.heartbeat(1);
        cluster.heartbeat(1);

        let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i]).collect();
        assert_eq!(cluster.node(3).machine().applied, expected);
        assert_eq!(
            cluster.node(3).status().last_applied,
            cluster.node(1).status().last_applied
        );
    }

    #[test]
    fn follower_without_leader_refuses_proposals() {
        let mut cluster = Cluster::new(3, RaftConfig::default());
        assert!(matches!(
            cluster.node(2).propose(b"early".to_vec()),
            Err(ReplicationError::NoLeader)
        ));
    }
}
