//! Optimistic client state
//!
//! The reconciler keeps two states: `confirmed`, built only from actions the
//! server committed, and `current`, which is `confirmed` with the client's
//! own not-yet-confirmed actions replayed on top. The UI renders `current`.
//!
//! Invariant: `current == replay(confirmed, pending)`, where actions that no
//! longer apply on top of newer server state are skipped in the replay.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::state::{reduce, ExerciseAction, ExerciseState, ReducerError};

/// A speculative action waiting for the server's verdict.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingAction {
    pub action_id: Uuid,
    pub action: ExerciseAction,
}

#[derive(Clone, Debug)]
pub struct OptimisticReconciler {
    confirmed: ExerciseState,
    pending: VecDeque<PendingAction>,
    current: ExerciseState,
}

impl OptimisticReconciler {
    pub fn new(state: ExerciseState) -> Self {
        Self {
            current: state.clone(),
            confirmed: state,
            pending: VecDeque::new(),
        }
    }

    pub fn confirmed(&self) -> &ExerciseState {
        &self.confirmed
    }

    pub fn current(&self) -> &ExerciseState {
        &self.current
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.iter()
    }

    pub fn is_pending(&self, action_id: &Uuid) -> bool {
        self.pending.iter().any(|p| &p.action_id == action_id)
    }

    /// Apply an action committed by the server.
    ///
    /// `index` is the exercise's applied action count after the action;
    /// actions the confirmed state already contains are ignored and
    /// `Ok(false)` is returned.
    pub fn perform_action(
        &mut self,
        index: u64,
        action: &ExerciseAction,
        action_id: Option<Uuid>,
    ) -> Result<bool, ReducerError> {
        if index <= self.confirmed.applied_action_count {
            return Ok(false);
        }
        self.confirmed = reduce(&self.confirmed, action).map_err(|e| {
            log::error!("committed {} does not apply locally: {e}", action.name());
            e
        })?;

        let own_head = matches!(
            (self.pending.front(), action_id),
            (Some(head), Some(id)) if head.action_id == id
        );
        if own_head {
            // Our own action, confirmed in the order we sent it: `current`
            // already includes it.
            self.pending.pop_front();
        } else {
            if let Some(id) = action_id {
                self.pending.retain(|p| p.action_id != id);
            }
            self.recompute();
        }
        Ok(true)
    }

    /// Apply `action` speculatively before the server sees it.
    ///
    /// Fails without queueing anything if the action does not apply to the
    /// current state.
    pub fn begin_optimistic(&mut self, action_id: Uuid, action: ExerciseAction) -> Result<(), ReducerError> {
        self.current = reduce(&self.current, &action)?;
        self.pending.push_back(PendingAction { action_id, action });
        Ok(())
    }

    /// The server rejected a speculative action: drop it and roll back.
    /// Returns whether the action was pending.
    pub fn reject(&mut self, action_id: &Uuid) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| &p.action_id != action_id);
        if self.pending.len() == before {
            return false;
        }
        self.recompute();
        true
    }

    /// Replace the confirmed state wholesale. Speculative actions cannot be
    /// matched against the new state and are handed back to the caller.
    pub fn reset(&mut self, state: ExerciseState) -> Vec<PendingAction> {
        self.current = state.clone();
        self.confirmed = state;
        self.pending.drain(..).collect()
    }

    fn recompute(&mut self) {
        let mut state = self.confirmed.clone();
        for pending in &self.pending {
            match reduce(&state, &pending.action) {
                Ok(next) => state = next,
                Err(e) => log::debug!(
                    "pending {} no longer applies: {e}",
                    pending.action.name()
                ),
            }
        }
        self.current = state;
    }
}
