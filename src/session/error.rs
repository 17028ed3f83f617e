use thiserror::Error;

use crate::state::ReducerError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Actions after {requested} are no longer retained (history starts at {oldest}); rejoin for a full state")]
    DiffUnavailable { requested: u64, oldest: u64 },

    #[error("Actions after {requested} requested but only {current} have been applied")]
    DiffAhead { requested: u64, current: u64 },

    #[error("Exercise has been deleted")]
    Closed,

    #[error("Synchronization error: {0}")]
    SyncError(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Exercise id {0} is already in use")]
    IdsInUse(String),

    #[error("Exercise {0} not found")]
    NotFound(String),

    #[error("Too many joins are waiting for exercises to be created")]
    PendingQueueFull,

    #[error("Exercise {0} did not appear in time")]
    PendingTimeout(String),

    #[error("Import failed: {0}")]
    Import(ReducerError),

    #[error("Synchronization error: {0}")]
    SyncError(String),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Synchronization error: {0}")]
    SyncError(String),
}
