//! Majority tracking for the leader
//!
//! Tracks the highest log index each node is known to hold and derives the
//! highest index held by a majority (`n / 2 + 1`) of the cluster.

use std::collections::BTreeMap;

use super::{LogIndex, NodeId};

#[derive(Debug, Clone)]
pub struct QuorumTracker {
    quorum_size: usize,
    match_index: BTreeMap<NodeId, LogIndex>,
}

impl QuorumTracker {
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Self {
        let match_index: BTreeMap<NodeId, LogIndex> =
            members.into_iter().map(|id| (id, 0)).collect();
        Self {
            quorum_size: match_index.len() / 2 + 1,
            match_index,
        }
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    /// Record that `node` holds the log up to `index`. Never moves backwards.
    pub fn update(&mut self, node: NodeId, index: LogIndex) {
        if let Some(current) = self.match_index.get_mut(&node) {
            *current = (*current).max(index);
        }
    }

    pub fn match_index(&self, node: NodeId) -> LogIndex {
        self.match_index.get(&node).copied().unwrap_or(0)
    }

    /// Highest index acknowledged by a majority.
    pub fn quorum_index(&self) -> LogIndex {
        let mut indexes: Vec<LogIndex> = self.match_index.values().copied().collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes
            .get(self.quorum_size.saturating_sub(1))
            .copied()
            .unwrap_or(0)
    }

    /// Does `votes` make up a majority of the cluster?
    pub fn is_quorum(&self, votes: usize) -> bool {
        votes >= self.quorum_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_nodes_need_two() {
        let mut tracker = QuorumTracker::new([1, 2, 3]);
        assert_eq!(tracker.quorum_size(), 2);

        tracker.update(1, 5);
        assert_eq!(tracker.quorum_index(), 0);
        tracker.update(3, 4);
        assert_eq!(tracker.quorum_index(), 4);
        tracker.update(2, 7);
        assert_eq!(tracker.quorum_index(), 5);
    }

    #[test]
    fn match_index_never_regresses() {
        let mut tracker = QuorumTracker::new([1, 2, 3]);
        tracker.update(2, 9);
        tracker.update(2, 3);
        assert_eq!(tracker.match_index(2), 9);
    }

    #[test]
    fn single_node_is_its_own_majority() {
        let mut tracker = QuorumTracker::new([7]);
        tracker.update(7, 2);
        assert_eq!(tracker.quorum_index(), 2);
        assert!(tracker.is_quorum(1));
    }
}
