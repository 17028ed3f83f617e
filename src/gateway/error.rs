use thiserror::Error;

use crate::replication::ReplicationError;
use crate::session::{RegistryError, SessionError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Not joined to an exercise")]
    NotJoined,

    #[error("Already joined to exercise {0}")]
    AlreadyJoined(String),

    #[error("Exercise {0} does not exist")]
    ExerciseNotFound(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{message}")]
    Rejected { message: String, expected: bool },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

impl GatewayError {
    /// `true` for mistakes a client can make; `false` for server faults.
    pub fn is_expected(&self) -> bool {
        match self {
            Self::NotJoined
            | Self::AlreadyJoined(_)
            | Self::ExerciseNotFound(_)
            | Self::InvalidAction(_)
            | Self::PermissionDenied(_) => true,
            Self::Rejected { expected, .. } => *expected,
            Self::Registry(e) => matches!(
                e,
                RegistryError::NotFound(_)
                    | RegistryError::PendingQueueFull
                    | RegistryError::PendingTimeout(_)
            ),
            Self::Session(e) => !matches!(e, SessionError::SyncError(_)),
            Self::Encoding(_) | Self::Replication(_) => false,
        }
    }
}
