//! Commands carried by the replicated log
//!
//! Log entry payloads are JSON-encoded [`LogRequest`]s. Every replica
//! decodes and applies the same bytes, so the request carries everything
//! the apply step needs, including ids chosen by the proposer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ReplicationError;
use crate::session::{CommittedAction, ExerciseExport, ExerciseIds};
use crate::state::ExerciseAction;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum LogCommand {
    CreateExercise {
        ids: ExerciseIds,
        /// Identity for system actions, fixed here so all replicas agree.
        emitter_id: Uuid,
        import: Option<ExerciseExport>,
    },
    DeleteExercise {
        trainer_id: String,
    },
    ProposeAction {
        /// Either public id of the exercise.
        exercise_id: String,
        /// `None` for system actions.
        client_id: Option<Uuid>,
        action_id: Option<Uuid>,
        action: ExerciseAction,
    },
}

impl LogCommand {
    pub fn describe(&self) -> String {
        match self {
            Self::CreateExercise { ids, .. } => format!("create {}", ids.trainer_id),
            Self::DeleteExercise { trainer_id } => format!("delete {trainer_id}"),
            Self::ProposeAction {
                exercise_id, action, ..
            } => format!("{} on {exercise_id}", action.name()),
        }
    }
}

/// A command plus the caller-chosen id used for deduplication and for
/// routing the result back to the waiting caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRequest {
    pub request_id: Uuid,
    pub command: LogCommand,
}

impl LogRequest {
    pub fn new(command: LogCommand) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            command,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ReplicationError> {
        serde_json::to_vec(self).map_err(|e| ReplicationError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicationError> {
        serde_json::from_slice(bytes).map_err(|e| ReplicationError::Encoding(e.to_string()))
    }
}

/// What applying a request did.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ApplyOutcome {
    Created { ids: ExerciseIds },
    /// One of the requested exercise ids is already taken.
    Conflict { id: String },
    Deleted,
    Applied { committed: CommittedAction },
    Rejected { message: String, expected: bool },
}

impl ApplyOutcome {
    pub fn rejected(message: impl Into<String>, expected: bool) -> Self {
        Self::Rejected {
            message: message.into(),
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_survives_encoding_with_nested_action() {
        let request = LogRequest::new(LogCommand::ProposeAction {
            exercise_id: "123456".to_string(),
            client_id: Some(Uuid::new_v4()),
            action_id: None,
            action: ExerciseAction::Tick {
                tick_interval_ms: 1000,
            },
        });
        let bytes = request.encode().unwrap();
        assert_eq!(LogRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn garbage_is_an_encoding_error() {
        assert!(matches!(
            LogRequest::decode(b"\x00\x01"),
            Err(ReplicationError::Encoding(_))
        ));
    }
}
