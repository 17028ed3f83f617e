//! Exercise lifecycle operations
//!
//! The calls an HTTP layer makes to create, look up, delete and export
//! exercises. Creation and deletion go through the replicated log like
//! every other change; lookups read the local registry.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::replication::{ApplyOutcome, LogCommand, LogRequest, ReplicatedLog, ReplicationError};
use crate::session::{generate_exercise_ids, ExerciseExport, ExerciseIds, ExerciseRegistry, RegistryError, SessionError};
use crate::state::Role;

/// Random draws per id before the id space counts as exhausted.
const ID_ATTEMPTS: usize = 100;

/// Creation attempts when a freshly drawn id was taken concurrently.
const CREATE_ATTEMPTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("No free exercise ids left")]
    IdSpaceExhausted,

    #[error("Exercise {0} does not exist")]
    NotFound(String),

    #[error("Exercise {0} can only be deleted with the trainer id")]
    Forbidden(String),

    #[error("Invalid import: {0}")]
    InvalidImport(String),

    #[error("Request failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

impl LifecycleError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::IdSpaceExhausted => 503,
            Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            Self::InvalidImport(_) => 400,
            Self::Replication(ReplicationError::NoLeader)
            | Self::Replication(ReplicationError::Timeout) => 503,
            Self::Failed(_) | Self::Registry(_) | Self::Session(_) | Self::Replication(_) => 500,
        }
    }
}

pub struct ExerciseService {
    registry: Arc<ExerciseRegistry>,
    log: Arc<dyn ReplicatedLog>,
}

impl ExerciseService {
    pub fn new(registry: Arc<ExerciseRegistry>, log: Arc<dyn ReplicatedLog>) -> Self {
        Self { registry, log }
    }

    /// Create an exercise, optionally from an export. Answers 201 with the
    /// new ids on success.
    pub async fn create_exercise(
        &self,
        import: Option<ExerciseExport>,
    ) -> Result<ExerciseIds, LifecycleError> {
        for _ in 0..CREATE_ATTEMPTS {
            let ids = generate_exercise_ids(&mut rand::thread_rng(), ID_ATTEMPTS, |id| {
                self.registry.contains(id).unwrap_or(true)
            })
            .ok_or(LifecycleError::IdSpaceExhausted)?;

            let request = LogRequest::new(LogCommand::CreateExercise {
                ids,
                emitter_id: Uuid::new_v4(),
                import: import.clone(),
            });
            match self.log.submit(request).await? {
                ApplyOutcome::Created { ids } => return Ok(ids),
                ApplyOutcome::Conflict { id } => {
                    log::debug!("exercise id {id} was taken meanwhile, drawing again");
                }
                ApplyOutcome::Rejected { message, expected: true } => {
                    return Err(LifecycleError::InvalidImport(message))
                }
                other => return Err(LifecycleError::Failed(format!("{other:?}"))),
            }
        }
        Err(LifecycleError::IdSpaceExhausted)
    }

    /// 200 if the exercise exists, 404 otherwise.
    pub fn exercise_exists(&self, exercise_id: &str) -> Result<(), LifecycleError> {
        if self.registry.contains(exercise_id)? {
            Ok(())
        } else {
            Err(LifecycleError::NotFound(exercise_id.to_string()))
        }
    }

    /// Delete an exercise by its trainer id. Answers 204 on success.
    pub async fn delete_exercise(&self, exercise_id: &str) -> Result<(), LifecycleError> {
        match self.registry.get(exercise_id)? {
            None => return Err(LifecycleError::NotFound(exercise_id.to_string())),
            Some((_, Role::Participant)) => {
                return Err(LifecycleError::Forbidden(exercise_id.to_string()))
            }
            Some((_, Role::Trainer)) => {}
        }

        let request = LogRequest::new(LogCommand::DeleteExercise {
            trainer_id: exercise_id.to_string(),
        });
        match self.log.submit(request).await? {
            ApplyOutcome::Deleted => Ok(()),
            // Deleted concurrently by someone else.
            ApplyOutcome::Rejected { expected: true, .. } => {
                Err(LifecycleError::NotFound(exercise_id.to_string()))
            }
            other => Err(LifecycleError::Failed(format!("{other:?}"))),
        }
    }

    /// The exercise's initial state and every committed action, in order.
    pub fn history(&self, exercise_id: &str) -> Result<ExerciseExport, LifecycleError> {
        let (session, _) = self
            .registry
            .get(exercise_id)?
            .ok_or_else(|| LifecycleError::NotFound(exercise_id.to_string()))?;
        Ok(session.export()?)
    }
}
