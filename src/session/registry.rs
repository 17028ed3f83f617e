//! Registry of live exercises
//!
//! Maps both public ids of every exercise to the same session. The registry
//! is an ordinary value owned by a replica and handed to whoever needs it;
//! there is no process-wide instance.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use uuid::Uuid;

use super::error::{PersistenceError, RegistryError};
use super::exercise::{ExerciseExport, ExerciseIds, ExerciseSession};
use super::ids::is_well_formed;
use super::persistence::{ExerciseSnapshot, SnapshotStore};
use crate::config::PendingExercisePolicy;
use crate::state::{ExerciseState, Role};

pub struct ExerciseRegistry {
    sessions: RwLock<BTreeMap<String, Arc<ExerciseSession>>>,
    /// Trainer ids deleted since the last save.
    removed: Mutex<Vec<String>>,
    created: Notify,
    waiting: AtomicUsize,
    policy: PendingExercisePolicy,
}

/// Releases a pending-join slot when the join stops waiting.
struct WaitSlot<'a>(&'a AtomicUsize);

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExerciseRegistry {
    pub fn new(policy: PendingExercisePolicy) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            removed: Mutex::new(Vec::new()),
            created: Notify::new(),
            waiting: AtomicUsize::new(0),
            policy,
        }
    }

    fn sync_error<E: std::fmt::Display>(e: E) -> RegistryError {
        RegistryError::SyncError(format!("registry lock poisoned: {e}"))
    }

    fn insert(&self, session: ExerciseSession) -> Result<Arc<ExerciseSession>, RegistryError> {
        let session = Arc::new(session);
        {
            let mut sessions = self.sessions.write().map_err(Self::sync_error)?;
            for id in [session.trainer_id(), session.participant_id()] {
                if sessions.contains_key(id) {
                    return Err(RegistryError::IdsInUse(id.to_string()));
                }
            }
            sessions.insert(session.trainer_id().to_string(), Arc::clone(&session));
            sessions.insert(session.participant_id().to_string(), Arc::clone(&session));
        }
        self.created.notify_waiters();
        Ok(session)
    }

    /// Create a session, either empty or replayed from an export.
    pub fn create(
        &self,
        ids: ExerciseIds,
        emitter_id: Uuid,
        import: Option<&ExerciseExport>,
    ) -> Result<Arc<ExerciseSession>, RegistryError> {
        for id in [&ids.trainer_id, &ids.participant_id] {
            if self.contains(id)? {
                return Err(RegistryError::IdsInUse(id.clone()));
            }
        }
        let session = match import {
            Some(export) => ExerciseSession::from_export(ids, emitter_id, export)?,
            None => ExerciseSession::new(ids, emitter_id, ExerciseState::new()),
        };
        let session = self.insert(session)?;
        log::info!(
            "Created exercise {} / {}",
            session.trainer_id(),
            session.participant_id()
        );
        Ok(session)
    }

    /// Remove an exercise by either of its ids and close it.
    pub fn remove(&self, public_id: &str) -> Result<Option<Arc<ExerciseSession>>, RegistryError> {
        let session = {
            let mut sessions = self.sessions.write().map_err(Self::sync_error)?;
            let Some(session) = sessions.get(public_id).cloned() else {
                return Ok(None);
            };
            sessions.remove(session.trainer_id());
            sessions.remove(session.participant_id());
            session
        };
        session.close();
        self.removed
            .lock()
            .map_err(Self::sync_error)?
            .push(session.trainer_id().to_string());
        log::info!("Deleted exercise {}", session.trainer_id());
        Ok(Some(session))
    }

    /// The session behind `public_id` and the role that id grants.
    pub fn get(&self, public_id: &str) -> Result<Option<(Arc<ExerciseSession>, Role)>, RegistryError> {
        let sessions = self.sessions.read().map_err(Self::sync_error)?;
        Ok(sessions.get(public_id).and_then(|session| {
            session
                .role_for(public_id)
                .map(|role| (Arc::clone(session), role))
        }))
    }

    pub fn contains(&self, public_id: &str) -> Result<bool, RegistryError> {
        Ok(self
            .sessions
            .read()
            .map_err(Self::sync_error)?
            .contains_key(public_id))
    }

    /// Like [`get`](Self::get), but waits for an exercise whose creation has
    /// not been applied on this replica yet.
    ///
    /// Waiting joins are bounded by the pending-exercise policy: beyond its
    /// capacity joins fail immediately, and each join waits at most its TTL.
    pub async fn await_exercise(&self, public_id: &str) -> Result<(Arc<ExerciseSession>, Role), RegistryError> {
        if let Some(found) = self.get(public_id)? {
            return Ok(found);
        }
        if !is_well_formed(public_id) {
            return Err(RegistryError::NotFound(public_id.to_string()));
        }

        let previously_waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _slot = WaitSlot(&self.waiting);
        if previously_waiting >= self.policy.capacity {
            return Err(RegistryError::PendingQueueFull);
        }

        let deadline = tokio::time::Instant::now() + self.policy.ttl();
        loop {
            let notified = self.created.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = self.get(public_id)? {
                return Ok(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RegistryError::PendingTimeout(public_id.to_string()));
            }
        }
    }

    /// Every live session, once each, ordered by trainer id.
    pub fn sessions(&self) -> Result<Vec<Arc<ExerciseSession>>, RegistryError> {
        let sessions = self.sessions.read().map_err(Self::sync_error)?;
        Ok(sessions
            .iter()
            .filter(|(id, session)| id.as_str() == session.trainer_id())
            .map(|(_, session)| Arc::clone(session))
            .collect())
    }

    /// Sessions whose exercise is running and should be ticked.
    pub fn running_sessions(&self) -> Result<Vec<Arc<ExerciseSession>>, RegistryError> {
        Ok(self
            .sessions()?
            .into_iter()
            .filter(|session| session.is_started())
            .collect())
    }

    pub fn snapshot_all(&self) -> Result<Vec<ExerciseSnapshot>, RegistryError> {
        self.sessions()?
            .iter()
            .map(|session| {
                session
                    .snapshot()
                    .map_err(|e| RegistryError::SyncError(e.to_string()))
            })
            .collect()
    }

    /// Make the registry hold exactly the exercises in `snapshots`.
    ///
    /// Sessions that survive are reset in place so connected gateways keep
    /// their subscriptions.
    pub fn restore_all(&self, snapshots: Vec<ExerciseSnapshot>) -> Result<(), RegistryError> {
        let wanted: BTreeMap<String, ExerciseSnapshot> = snapshots
            .into_iter()
            .map(|snapshot| (snapshot.ids.trainer_id.clone(), snapshot))
            .collect();

        for session in self.sessions()? {
            if !wanted.contains_key(session.trainer_id()) {
                self.remove(session.trainer_id())?;
            }
        }
        for (trainer_id, snapshot) in wanted {
            match self.get(&trainer_id)? {
                Some((session, _)) => session
                    .reset(snapshot)
                    .map_err(|e| RegistryError::SyncError(e.to_string()))?,
                None => {
                    self.insert(ExerciseSession::from_snapshot(snapshot))?;
                }
            }
        }
        Ok(())
    }

    /// Write every changed session to `store` and drop deleted ones.
    ///
    /// Returns the number of sessions written.
    pub fn save_dirty(&self, store: &dyn SnapshotStore) -> Result<usize, PersistenceError> {
        let removed: Vec<String> = std::mem::take(
            &mut *self
                .removed
                .lock()
                .map_err(|e| PersistenceError::SyncError(e.to_string()))?,
        );
        for trainer_id in removed {
            store.delete(&trainer_id)?;
        }

        let sessions = self
            .sessions()
            .map_err(|e| PersistenceError::SyncError(e.to_string()))?;
        let mut saved = 0;
        for session in sessions {
            let Some(snapshot) = session
                .take_dirty_snapshot()
                .map_err(|e| PersistenceError::SyncError(e.to_string()))?
            else {
                continue;
            };
            if let Err(e) = store.save(&snapshot) {
                session.mark_dirty();
                return Err(e);
            }
            saved += 1;
        }
        Ok(saved)
    }

    /// Load persisted sessions into an empty registry.
    pub fn load_from(&self, store: &dyn SnapshotStore) -> Result<usize, RegistryError> {
        let snapshots = store
            .load_all()
            .map_err(|e| RegistryError::SyncError(e.to_string()))?;
        let count = snapshots.len();
        for snapshot in snapshots {
            self.insert(ExerciseSession::from_snapshot(snapshot))?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::persistence::InMemorySnapshotStore;
    use crate::state::ExerciseAction;

    fn ids(trainer: &str, participant: &str) -> ExerciseIds {
        ExerciseIds {
            trainer_id: trainer.to_string(),
            participant_id: participant.to_string(),
        }
    }

    fn registry(capacity: usize, ttl_ms: u64) -> ExerciseRegistry {
        ExerciseRegistry::new(PendingExercisePolicy { capacity, ttl_ms })
    }

    #[test]
    fn both_ids_resolve_to_one_session() {
        let registry = registry(4, 100);
        registry
            .create(ids("12345678", "123456"), Uuid::new_v4(), None)
            .unwrap();

        let (trainer_view, trainer_role) = registry.get("12345678").unwrap().unwrap();
        let (participant_view, participant_role) = registry.get("123456").unwrap().unwrap();
        assert!(Arc::ptr_eq(&trainer_view, &participant_view));
        assert_eq!(trainer_role, Role::Trainer);
        assert_eq!(participant_role, Role::Participant);
        assert_eq!(registry.sessions().unwrap().len(), 1);
    }

    #[test]
    fn ids_cannot_be_reused() {
        let registry = registry(4, 100);
        registry
            .create(ids("12345678", "123456"), Uuid::new_v4(), None)
            .unwrap();
        let err = registry
            .create(ids("87654321", "123456"), Uuid::new_v4(), None)
            .unwrap_err();
        assert_eq!(err, RegistryError::IdsInUse("123456".to_string()));
    }

    #[test]
    fn removal_closes_and_is_persisted() {
        let registry = registry(4, 100);
        let store = InMemorySnapshotStore::new();
        let session = registry
            .create(ids("12345678", "123456"), Uuid::new_v4(), None)
            .unwrap();
        assert_eq!(registry.save_dirty(&store).unwrap(), 1);
        assert_eq!(registry.save_dirty(&store).unwrap(), 0);
        assert!(store.get("12345678").is_some());

        registry.remove("123456").unwrap();
        assert!(session.is_closed());
        assert!(registry.get("12345678").unwrap().is_none());
        registry.save_dirty(&store).unwrap();
        assert!(store.get("12345678").is_none());
    }

    #[test]
    fn restore_resets_survivors_and_drops_the_rest() {
        let source = registry(4, 100);
        let kept = source
            .create(ids("11111111", "111111"), Uuid::new_v4(), None)
            .unwrap();
        kept.apply_action(&ExerciseAction::StartExercise, None, None)
            .unwrap();
        let snapshots = source.snapshot_all().unwrap();

        let target = registry(4, 100);
        let stale = target
            .create(ids("11111111", "111111"), kept.emitter_id(), None)
            .unwrap();
        let doomed = target
            .create(ids("22222222", "222222"), Uuid::new_v4(), None)
            .unwrap();
        let mut events = stale.subscribe();

        target.restore_all(snapshots).unwrap();

        assert!(doomed.is_closed());
        assert_eq!(target.sessions().unwrap().len(), 1);
        assert_eq!(stale.get_state_snapshot().unwrap().applied_action_count, 1);
        assert!(matches!(
            events.try_recv(),
            Ok(crate::session::SessionEvent::Reset(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn join_waits_for_a_pending_exercise() {
        let registry = Arc::new(registry(4, 1_000));
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_exercise("123456").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry
            .create(ids("12345678", "123456"), Uuid::new_v4(), None)
            .unwrap();

        let (_, role) = waiter.await.unwrap().unwrap();
        assert_eq!(role, Role::Participant);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_joins_are_bounded_and_expire() {
        let registry = Arc::new(registry(1, 500));
        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_exercise("123456").await })
        };
        tokio::task::yield_now().await;

        assert_eq!(
            registry.await_exercise("654321").await.unwrap_err(),
            RegistryError::PendingQueueFull
        );
        assert_eq!(
            first.await.unwrap().unwrap_err(),
            RegistryError::PendingTimeout("123456".to_string())
        );
        assert_eq!(
            registry.await_exercise("not-an-id").await.unwrap_err(),
            RegistryError::NotFound("not-an-id".to_string())
        );
    }
}
