//! Applying committed log entries to the exercise registry
//!
//! [`ExerciseStateMachine`] is the only writer of exercise state on a
//! replica. It decodes each committed [`LogRequest`], executes it against the
//! [`ExerciseRegistry`] and hands the outcome to whichever local caller is
//! waiting on the request id. Request ids already applied inside the
//! deduplication window are not executed again; their cached outcome is
//! returned instead. The window holds the last `dedup_window` request ids,
//! so "at most once" holds only for retries arriving before that many other
//! requests have been applied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::command::{ApplyOutcome, LogCommand, LogRequest};
use super::pending::PendingRequests;
use super::{LogIndex, ReplicationError};
use crate::session::{ExerciseRegistry, ExerciseSnapshot, RegistryError};
use crate::state::Role;

/// Deterministic consumer of committed entries.
pub trait StateMachine: Send + 'static {
    /// Apply the entry at `index`. Must behave identically on every replica.
    fn apply(&mut self, index: LogIndex, payload: &[u8]);

    /// Serialize everything applied so far.
    fn snapshot(&self) -> Result<Vec<u8>, ReplicationError>;

    /// Replace all state with a snapshot.
    fn restore(&mut self, data: &[u8]) -> Result<(), ReplicationError>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachineSnapshot {
    exercises: Vec<ExerciseSnapshot>,
    /// Oldest first.
    applied_requests: Vec<(Uuid, ApplyOutcome)>,
}

pub struct ExerciseStateMachine {
    registry: Arc<ExerciseRegistry>,
    pending: Arc<PendingRequests>,
    dedup_window: usize,
    applied_order: VecDeque<Uuid>,
    applied: HashMap<Uuid, ApplyOutcome>,
}

impl ExerciseStateMachine {
    pub fn new(
        registry: Arc<ExerciseRegistry>,
        pending: Arc<PendingRequests>,
        dedup_window: usize,
    ) -> Self {
        Self {
            registry,
            pending,
            dedup_window: dedup_window.max(1),
            applied_order: VecDeque::new(),
            applied: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ExerciseRegistry> {
        &self.registry
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    fn remember(&mut self, request_id: Uuid, outcome: ApplyOutcome) {
        if self.applied.insert(request_id, outcome).is_none() {
            self.applied_order.push_back(request_id);
        }
        while self.applied_order.len() > self.dedup_window {
            if let Some(oldest) = self.applied_order.pop_front() {
                self.applied.remove(&oldest);
            }
        }
    }

    fn execute(&self, command: LogCommand) -> ApplyOutcome {
        match command {
            LogCommand::CreateExercise {
                ids,
                emitter_id,
                import,
            } => match self.registry.create(ids.clone(), emitter_id, import.as_ref()) {
                Ok(_) => ApplyOutcome::Created { ids },
                Err(RegistryError::IdsInUse(id)) => ApplyOutcome::Conflict { id },
                Err(RegistryError::Import(e)) => {
                    ApplyOutcome::rejected(format!("Import failed: {e}"), e.is_expected())
                }
                Err(e) => ApplyOutcome::rejected(e.to_string(), false),
            },
            LogCommand::DeleteExercise { trainer_id } => match self.registry.get(&trainer_id) {
                Ok(Some((_, Role::Trainer))) => match self.registry.remove(&trainer_id) {
                    Ok(_) => ApplyOutcome::Deleted,
                    Err(e) => ApplyOutcome::rejected(e.to_string(), false),
                },
                Ok(Some(_)) => ApplyOutcome::rejected(
                    "Exercises can only be deleted with the trainer id",
                    true,
                ),
                Ok(None) => {
                    ApplyOutcome::rejected(format!("Exercise {trainer_id} does not exist"), true)
                }
                Err(e) => ApplyOutcome::rejected(e.to_string(), false),
            },
            LogCommand::ProposeAction {
                exercise_id,
                client_id,
                action_id,
                action,
            } => match self.registry.get(&exercise_id) {
                Ok(Some((session, _))) => match session.apply_action(&action, client_id, action_id) {
                    Ok(committed) => ApplyOutcome::Applied { committed },
                    Err(e) => ApplyOutcome::rejected(e.message(), e.is_expected()),
                },
                Ok(None) => {
                    ApplyOutcome::rejected(format!("Exercise {exercise_id} does not exist"), true)
                }
                Err(e) => ApplyOutcome::rejected(e.to_string(), false),
            },
        }
    }
}

impl StateMachine for ExerciseStateMachine {
    fn apply(&mut self, index: LogIndex, payload: &[u8]) {
        let request = match LogRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                // Still deterministic: every replica skips the same entry.
                log::error!("entry {index}: undecodable request: {e}");
                return;
            }
        };

        if let Some(outcome) = self.applied.get(&request.request_id) {
            log::debug!("entry {index}: request {} already applied", request.request_id);
            self.pending.resolve(&request.request_id, outcome.clone());
            return;
        }

        log::debug!("entry {index}: {}", request.command.describe());
        let outcome = self.execute(request.command);
        self.remember(request.request_id, outcome.clone());
        self.pending.resolve(&request.request_id, outcome);
    }

    fn snapshot(&self) -> Result<Vec<u8>, ReplicationError> {
        let exercises = self
            .registry
            .snapshot_all()
            .map_err(|e| ReplicationError::Snapshot(e.to_string()))?;
        let applied_requests = self
            .applied_order
            .iter()
            .filter_map(|id| self.applied.get(id).map(|outcome| (*id, outcome.clone())))
            .collect();
        serde_json::to_vec(&MachineSnapshot {
            exercises,
            applied_requests,
        })
        .map_err(|e| ReplicationError::Snapshot(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ReplicationError> {
        let snapshot: MachineSnapshot =
            serde_json::from_slice(data).map_err(|e| ReplicationError::Snapshot(e.to_string()))?;
        self.registry
            .restore_all(snapshot.exercises)
            .map_err(|e| ReplicationError::Snapshot(e.to_string()))?;
        self.applied_order.clear();
        self.applied.clear();
        for (request_id, outcome) in snapshot.applied_requests {
            self.remember(request_id, outcome);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PendingExercisePolicy;
    use crate::session::ExerciseIds;
    use crate::state::ExerciseAction;

    fn machine() -> ExerciseStateMachine {
        ExerciseStateMachine::new(
            Arc::new(ExerciseRegistry::new(PendingExercisePolicy::default())),
            PendingRequests::new(),
            8,
        )
    }

    fn ids() -> ExerciseIds {
        ExerciseIds {
            trainer_id: "12345678".to_string(),
            participant_id: "123456".to_string(),
        }
    }

    fn create() -> LogRequest {
        LogRequest::new(LogCommand::CreateExercise {
            ids: ids(),
            emitter_id: Uuid::new_v4(),
            import: None,
        })
    }

    fn start() -> LogRequest {
        LogRequest::new(LogCommand::ProposeAction {
            exercise_id: "12345678".to_string(),
            client_id: None,
            action_id: None,
            action: ExerciseAction::StartExercise,
        })
    }

    fn applied_count(machine: &ExerciseStateMachine) -> u64 {
        let (session, _) = machine.registry().get("123456").unwrap().unwrap();
        session.get_state_snapshot().unwrap().applied_action_count
    }

    #[tokio::test]
    async fn duplicate_request_applies_once_and_answers_twice() {
        let mut machine = machine();
        machine.apply(1, &create().encode().unwrap());

        let request = start();
        let payload = request.encode().unwrap();
        let mut first = machine.pending().register(request.request_id).unwrap();
        machine.apply(2, &payload);
        let outcome = first.recv().await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        drop(first);

        let mut retry = machine.pending().register(request.request_id).unwrap();
        machine.apply(3, &payload);
        assert_eq!(retry.recv().await.unwrap(), outcome);
        assert_eq!(applied_count(&machine), 1);
    }

    #[tokio::test]
    async fn rejections_are_reported_not_applied() {
        let mut machine = machine();
        machine.apply(1, &create().encode().unwrap());

        let request = LogRequest::new(LogCommand::ProposeAction {
            exercise_id: "123456".to_string(),
            client_id: None,
            action_id: None,
            action: ExerciseAction::PauseExercise,
        });
        let mut response = machine.pending().register(request.request_id).unwrap();
        machine.apply(2, &request.encode().unwrap());

        match response.recv().await.unwrap() {
            ApplyOutcome::Rejected { expected, .. } => assert!(expected),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(applied_count(&machine), 0);
    }

    #[test]
    fn delete_requires_the_trainer_id() {
        let mut machine = machine();
        machine.apply(1, &create().encode().unwrap());
        machine.apply(
            2,
            &LogRequest::new(LogCommand::DeleteExercise {
                trainer_id: "123456".to_string(),
            })
            .encode()
            .unwrap(),
        );
        assert!(machine.registry().contains("12345678").unwrap());

        machine.apply(
            3,
            &LogRequest::new(LogCommand::DeleteExercise {
                trainer_id: "12345678".to_string(),
            })
            .encode()
            .unwrap(),
        );
        assert!(!machine.registry().contains("12345678").unwrap());
    }

    #[tokio::test]
    async fn taken_ids_are_reported_as_conflicts() {
        let mut machine = machine();
        machine.apply(1, &create().encode().unwrap());

        let again = create();
        let mut response = machine.pending().register(again.request_id).unwrap();
        machine.apply(2, &again.encode().unwrap());
        assert_eq!(
            response.recv().await.unwrap(),
            ApplyOutcome::Conflict {
                id: "12345678".to_string()
            }
        );
    }

    #[test]
    fn garbage_entries_are_skipped() {
        let mut machine = machine();
        machine.apply(1, b"not json");
        assert!(machine.registry().sessions().unwrap().is_empty());
    }

    #[test]
    fn dedup_window_is_bounded() {
        let mut machine = machine();
        for _ in 0..20 {
            machine.remember(Uuid::new_v4(), ApplyOutcome::Deleted);
        }
        assert_eq!(machine.applied.len(), 8);
        assert_eq!(machine.applied_order.len(), 8);
    }

    #[test]
    fn retry_is_deduplicated_only_inside_the_window() {
        let mut machine = ExerciseStateMachine::new(
            Arc::new(ExerciseRegistry::new(PendingExercisePolicy::default())),
            PendingRequests::new(),
            3,
        );
        machine.apply(1, &create().encode().unwrap());
        let tick = LogRequest::new(LogCommand::ProposeAction {
            exercise_id: "12345678".to_string(),
            client_id: None,
            action_id: None,
            action: ExerciseAction::SetPretriageEnabled {
                pretriage_enabled: true,
            },
        });
        let payload = tick.encode().unwrap();
        machine.apply(2, &payload);
        machine.apply(3, &start().encode().unwrap());
        machine.apply(4, &payload);
        assert_eq!(applied_count(&machine), 2);

        // Two more requests push the first attempt out of the window.
        for index in 5..7 {
            machine.apply(index, &create().encode().unwrap());
        }
        machine.apply(7, &payload);
        assert_eq!(applied_count(&machine), 3);
    }

    #[test]
    fn snapshot_restores_exercises_and_dedup_state() {
        let mut source = machine();
        source.apply(1, &create().encode().unwrap());
        let request = start();
        source.apply(2, &request.encode().unwrap());
        let data = source.snapshot().unwrap();

        let mut target = machine();
        target.restore(&data).unwrap();
        assert_eq!(applied_count(&target), 1);

        // The already-applied start is recognized after the restore.
        target.apply(3, &request.encode().unwrap());
        assert_eq!(applied_count(&target), 1);

        let (a, _) = source.registry().get("12345678").unwrap().unwrap();
        let (b, _) = target.registry().get("12345678").unwrap().unwrap();
        assert_eq!(
            a.get_state_snapshot().unwrap().digest(),
            b.get_state_snapshot().unwrap().digest()
        );
    }
}
