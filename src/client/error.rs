use thiserror::Error;
use uuid::Uuid;

use crate::state::ReducerError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Not joined to an exercise")]
    NotJoined,

    #[error("No response to action {0} in time; it stays pending")]
    Timeout(Uuid),

    #[error("{message}")]
    Rejected { message: String, expected: bool },

    #[error("Local state error: {0}")]
    Reducer(#[from] ReducerError),

    #[error("Exercise has been deleted")]
    ExerciseDeleted,
}

impl ClientError {
    pub(crate) fn from_failure((message, expected): (String, bool)) -> Self {
        Self::Rejected { message, expected }
    }
}
