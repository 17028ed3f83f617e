//! Messages exchanged with exercise clients

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::GatewayError;
use crate::session::CommittedAction;
use crate::state::{ExerciseAction, ExerciseState};

/// Reply to every client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SocketResponse<T> {
    Success { payload: T },
    Failure { message: String, expected: bool },
}

impl<T> SocketResponse<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SocketResponse<U> {
        match self {
            Self::Success { payload } => SocketResponse::Success { payload: f(payload) },
            Self::Failure { message, expected } => SocketResponse::Failure { message, expected },
        }
    }

    pub fn into_result(self) -> Result<T, (String, bool)> {
        match self {
            Self::Success { payload } => Ok(payload),
            Self::Failure { message, expected } => Err((message, expected)),
        }
    }
}

impl<T> From<Result<T, GatewayError>> for SocketResponse<T> {
    fn from(result: Result<T, GatewayError>) -> Self {
        match result {
            Ok(payload) => Self::Success { payload },
            Err(e) => {
                if !e.is_expected() {
                    log::warn!("request failed: {e}");
                }
                Self::Failure {
                    expected: e.is_expected(),
                    message: e.to_string(),
                }
            }
        }
    }
}

/// Payload of a successful join.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub client_id: Uuid,
    pub state: ExerciseState,
}

/// Requests a client sends over its connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    JoinExercise {
        exercise_id: String,
        client_name: String,
        client_id: Option<Uuid>,
        view_restriction: Option<Uuid>,
    },
    /// The action stays raw JSON until the gateway has checked its shape.
    ProposeAction {
        action: serde_json::Value,
        action_id: Option<Uuid>,
    },
    GetStateDiff {
        applied_action_count: u64,
    },
    LeaveExercise,
}

/// Pushed from the server to a joined client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A committed action, in commit order.
    PerformAction {
        /// The exercise's applied action count right after this action.
        index: u64,
        action: ExerciseAction,
        action_id: Option<Uuid>,
        emitter_id: Uuid,
    },
    /// The committed state was replaced, e.g. after a replica caught up
    /// from a snapshot. Speculative client state must be rebuilt.
    StateReset { state: ExerciseState },
    ExerciseDeleted,
}

impl From<CommittedAction> for ServerEvent {
    fn from(committed: CommittedAction) -> Self {
        Self::PerformAction {
            index: committed.index,
            action: committed.action,
            action_id: committed.action_id,
            emitter_id: committed.emitter_id,
        }
    }
}
