//! One live exercise
//!
//! An `ExerciseSession` owns the committed state of a single exercise, the
//! ordered history of actions that produced it, and the set of clients
//! connected to it through this replica. Writes only happen from the
//! replicated log's apply path; reads (snapshots, diffs) run concurrently.

use std::collections::BTreeSet;
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::error::{RegistryError, SessionError};
use super::persistence::ExerciseSnapshot;
use crate::permission::validate_permissions;
use crate::state::{
    apply_in_place, reduce, Client, ExerciseAction, ExerciseState, ExerciseStatus, ReducerError,
    Role,
};

/// Buffered events per session before slow subscribers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The two public ids of an exercise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseIds {
    pub trainer_id: String,
    pub participant_id: String,
}

/// An action as it was committed to an exercise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedAction {
    /// The exercise's `appliedActionCount` right after this action.
    pub index: u64,
    pub action: ExerciseAction,
    /// Client-chosen id, echoed back so the proposer can match it.
    pub action_id: Option<Uuid>,
    /// Proposing client, or the session's own emitter for system actions.
    pub emitter_id: Uuid,
}

/// A portable exercise: its starting state and every action since.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseExport {
    pub initial_state: ExerciseState,
    pub actions: Vec<ExerciseAction>,
}

/// Pushed to everything subscribed to a session.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Committed(CommittedAction),
    /// The session was replaced wholesale, e.g. from a consensus snapshot.
    Reset(Box<ExerciseState>),
    Deleted,
}

#[derive(Debug)]
struct SessionInner {
    initial_state: ExerciseState,
    state: ExerciseState,
    /// Contiguous: `history[i].index == initial_state.applied_action_count + i + 1`.
    history: Vec<CommittedAction>,
    connected: BTreeSet<Uuid>,
    started: bool,
    dirty: bool,
    closed: bool,
}

#[derive(Debug)]
pub struct ExerciseSession {
    ids: ExerciseIds,
    emitter_id: Uuid,
    inner: RwLock<SessionInner>,
    events: broadcast::Sender<SessionEvent>,
}

impl ExerciseSession {
    pub fn new(ids: ExerciseIds, emitter_id: Uuid, initial_state: ExerciseState) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let started = initial_state.status == ExerciseStatus::Running;
        Self {
            ids,
            emitter_id,
            inner: RwLock::new(SessionInner {
                state: initial_state.clone(),
                initial_state,
                history: Vec::new(),
                connected: BTreeSet::new(),
                started,
                dirty: true,
                closed: false,
            }),
            events,
        }
    }

    /// Build a session by replaying an export. Fails if any action in the
    /// export is rejected by the reducer.
    pub fn from_export(
        ids: ExerciseIds,
        emitter_id: Uuid,
        export: &ExerciseExport,
    ) -> Result<Self, RegistryError> {
        let initial_state = export.initial_state.without_clients();
        let mut state = initial_state.clone();
        let mut history = Vec::with_capacity(export.actions.len());
        // Client bookkeeping belongs to the connections of the recorded run.
        for action in export.actions.iter().filter(|a| !a.is_client_bookkeeping()) {
            apply_in_place(&mut state, action).map_err(RegistryError::Import)?;
            history.push(CommittedAction {
                index: state.applied_action_count,
                action: action.clone(),
                action_id: None,
                emitter_id,
            });
        }

        let session = Self::new(ids, emitter_id, initial_state);
        {
            let mut inner = session
                .inner
                .write()
                .map_err(|e| RegistryError::SyncError(format!("session lock poisoned: {e}")))?;
            inner.started = state.status == ExerciseStatus::Running;
            inner.state = state;
            inner.history = history;
        }
        Ok(session)
    }

    /// Rebuild a session from a snapshot taken on any replica.
    pub fn from_snapshot(snapshot: ExerciseSnapshot) -> Self {
        let session = Self::new(
            snapshot.ids.clone(),
            snapshot.emitter_id,
            snapshot.initial_state.clone(),
        );
        if let Ok(mut inner) = session.inner.write() {
            inner.load(snapshot);
        }
        session
    }

    pub fn ids(&self) -> &ExerciseIds {
        &self.ids
    }

    pub fn trainer_id(&self) -> &str {
        &self.ids.trainer_id
    }

    pub fn participant_id(&self) -> &str {
        &self.ids.participant_id
    }

    /// Identity used for actions that no client proposed.
    pub fn emitter_id(&self) -> Uuid {
        self.emitter_id
    }

    /// Role granted to a client joining with `public_id`.
    pub fn role_for(&self, public_id: &str) -> Option<Role> {
        if public_id == self.ids.trainer_id {
            Some(Role::Trainer)
        } else if public_id == self.ids.participant_id {
            Some(Role::Participant)
        } else {
            None
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, SessionInner>, SessionError> {
        self.inner
            .read()
            .map_err(|e| SessionError::SyncError(format!("session lock poisoned: {e}")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, SessionInner>, SessionError> {
        self.inner
            .write()
            .map_err(|e| SessionError::SyncError(format!("session lock poisoned: {e}")))
    }

    /// Apply a committed action.
    ///
    /// `proposer` is the client that proposed the action, `None` for system
    /// actions. Permissions are checked against the state the action is
    /// actually applied to. On success the action is appended to the
    /// history and pushed to every subscriber.
    pub fn apply_action(
        &self,
        action: &ExerciseAction,
        proposer: Option<Uuid>,
        action_id: Option<Uuid>,
    ) -> Result<CommittedAction, ReducerError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| ReducerError::unexpected(format!("session lock poisoned: {e}")))?;
        if inner.closed {
            return Err(ReducerError::expected("Exercise has been deleted"));
        }

        if let Some(client_id) = proposer {
            let Some(client) = inner.state.clients.get(&client_id) else {
                return Err(ReducerError::expected(format!(
                    "Client {client_id} is not part of this exercise"
                )));
            };
            if !validate_permissions(client, action, &inner.state) {
                return Err(ReducerError::expected(format!(
                    "Client {client_id} is not allowed to perform {}",
                    action.name()
                )));
            }
        }

        let next = match reduce(&inner.state, action) {
            Ok(next) => next,
            Err(e) => {
                if e.is_expected() {
                    log::debug!("{}: rejected {}: {}", self.ids.trainer_id, action.name(), e);
                } else {
                    log::error!("{}: {} failed: {}", self.ids.trainer_id, action.name(), e);
                }
                return Err(e);
            }
        };

        let committed = CommittedAction {
            index: next.applied_action_count,
            action: action.clone(),
            action_id,
            emitter_id: proposer.unwrap_or(self.emitter_id),
        };
        inner.started = next.status == ExerciseStatus::Running;
        if action.is_lifecycle() {
            log::info!("{}: exercise now {:?}", self.ids.trainer_id, next.status);
        }
        inner.state = next;
        inner.history.push(committed.clone());
        inner.dirty = true;

        // Sent under the write lock so subscribers see commits in order and
        // a snapshot taken after subscribing never misses one.
        let _ = self.events.send(SessionEvent::Committed(committed.clone()));
        Ok(committed)
    }

    /// The `[Client] Add client` action for a newly joining client.
    pub fn add_client_action(client: Client) -> ExerciseAction {
        ExerciseAction::AddClient { client }
    }

    /// The `[Client] Remove client` action for a leaving client.
    pub fn remove_client_action(client_id: Uuid) -> ExerciseAction {
        ExerciseAction::RemoveClient { client_id }
    }

    pub fn get_state_snapshot(&self) -> Result<ExerciseState, SessionError> {
        Ok(self.read()?.state.clone())
    }

    /// Look up a client in the committed state.
    pub fn client(&self, client_id: &Uuid) -> Result<Option<Client>, SessionError> {
        Ok(self.read()?.state.clients.get(client_id).cloned())
    }

    /// Committed actions with `index > from_action_count`, in order.
    pub fn get_state_diff(&self, from_action_count: u64) -> Result<Vec<CommittedAction>, SessionError> {
        let inner = self.read()?;
        let oldest = inner.initial_state.applied_action_count;
        let current = inner.state.applied_action_count;
        if from_action_count < oldest {
            return Err(SessionError::DiffUnavailable {
                requested: from_action_count,
                oldest,
            });
        }
        if from_action_count > current {
            return Err(SessionError::DiffAhead {
                requested: from_action_count,
                current,
            });
        }
        let start = (from_action_count - oldest) as usize;
        Ok(inner.history[start..].to_vec())
    }

    /// Subscribe to committed actions. Subscribe before taking a snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Record a client connected through this replica.
    pub fn attach(&self, client_id: Uuid) -> Result<(), SessionError> {
        let mut inner = self.write()?;
        if inner.closed {
            return Err(SessionError::Closed);
        }
        inner.connected.insert(client_id);
        Ok(())
    }

    pub fn detach(&self, client_id: &Uuid) -> Result<(), SessionError> {
        self.write()?.connected.remove(client_id);
        Ok(())
    }

    pub fn connected_clients(&self) -> Result<Vec<Uuid>, SessionError> {
        Ok(self.read()?.connected.iter().copied().collect())
    }

    /// Whether the exercise is currently running and should receive ticks.
    pub fn is_started(&self) -> bool {
        self.read().map(|inner| inner.started && !inner.closed).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.read().map(|inner| inner.closed).unwrap_or(true)
    }

    pub fn export(&self) -> Result<ExerciseExport, SessionError> {
        let inner = self.read()?;
        Ok(ExerciseExport {
            initial_state: inner.initial_state.without_clients(),
            actions: inner.history.iter().map(|c| c.action.clone()).collect(),
        })
    }

    pub fn snapshot(&self) -> Result<ExerciseSnapshot, SessionError> {
        let inner = self.read()?;
        Ok(inner.to_snapshot(&self.ids, self.emitter_id))
    }

    /// Snapshot the session if it changed since the last call.
    pub fn take_dirty_snapshot(&self) -> Result<Option<ExerciseSnapshot>, SessionError> {
        let mut inner = self.write()?;
        if !inner.dirty {
            return Ok(None);
        }
        inner.dirty = false;
        Ok(Some(inner.to_snapshot(&self.ids, self.emitter_id)))
    }

    pub fn mark_dirty(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.dirty = true;
        }
    }

    /// Replace the committed state with `snapshot` and tell subscribers.
    pub fn reset(&self, snapshot: ExerciseSnapshot) -> Result<(), SessionError> {
        let mut inner = self.write()?;
        if inner.state.applied_action_count == snapshot.state.applied_action_count
            && inner.state == snapshot.state
        {
            return Ok(());
        }
        inner.load(snapshot);
        let _ = self
            .events
            .send(SessionEvent::Reset(Box::new(inner.state.clone())));
        Ok(())
    }

    /// Mark the exercise deleted and tell subscribers.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.write() {
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.connected.clear();
            let _ = self.events.send(SessionEvent::Deleted);
        }
    }
}

impl SessionInner {
    fn to_snapshot(&self, ids: &ExerciseIds, emitter_id: Uuid) -> ExerciseSnapshot {
        ExerciseSnapshot {
            ids: ids.clone(),
            emitter_id,
            initial_state: self.initial_state.clone(),
            state: self.state.clone(),
            history: self.history.clone(),
            saved_at: Utc::now(),
        }
    }

    fn load(&mut self, snapshot: ExerciseSnapshot) {
        self.started = snapshot.state.status == ExerciseStatus::Running;
        self.initial_state = snapshot.initial_state;
        self.state = snapshot.state;
        self.history = snapshot.history;
        self.dirty = true;
    }
}
