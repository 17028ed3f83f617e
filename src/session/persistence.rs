//! Snapshot persistence
//!
//! Saves are idempotent overwrites of a whole exercise; everything in a
//! snapshot can be re-derived from the replicated log, so a lost save only
//! costs replay time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::PersistenceError;
use super::exercise::{CommittedAction, ExerciseIds};
use crate::state::ExerciseState;

/// Everything needed to rebuild one exercise session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseSnapshot {
    pub ids: ExerciseIds,
    pub emitter_id: Uuid,
    pub initial_state: ExerciseState,
    pub state: ExerciseState,
    pub history: Vec<CommittedAction>,
    pub saved_at: DateTime<Utc>,
}

/// Where dirty exercises are written.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &ExerciseSnapshot) -> Result<(), PersistenceError>;

    /// Forget an exercise. Deleting an unknown exercise is not an error.
    fn delete(&self, trainer_id: &str) -> Result<(), PersistenceError>;

    fn load_all(&self) -> Result<Vec<ExerciseSnapshot>, PersistenceError>;
}

/// One `{trainer_id}.json` file per exercise.
pub struct FileSnapshotStore {
    directory: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, trainer_id: &str) -> PathBuf {
        self.directory.join(format!("{trainer_id}.json"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &ExerciseSnapshot) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.directory)
            .map_err(|e| PersistenceError::IoError(e.to_string()))?;

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| PersistenceError::SerializationError(e.to_string()))?;

        // Write then rename so a crash never leaves a truncated file behind.
        let path = self.path_for(&snapshot.ids.trainer_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| PersistenceError::IoError(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| PersistenceError::IoError(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, trainer_id: &str) -> Result<(), PersistenceError> {
        match std::fs::remove_file(self.path_for(trainer_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::IoError(e.to_string())),
        }
    }

    fn load_all(&self) -> Result<Vec<ExerciseSnapshot>, PersistenceError> {
        let mut snapshots = Vec::new();
        if !self.directory.exists() {
            return Ok(snapshots);
        }

        let entries = std::fs::read_dir(&self.directory)
            .map_err(|e| PersistenceError::IoError(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| PersistenceError::IoError(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read(&path).map_err(|e| PersistenceError::IoError(e.to_string()))?;
            let snapshot: ExerciseSnapshot = serde_json::from_slice(&data)
                .map_err(|e| PersistenceError::DeserializationError(e.to_string()))?;
            snapshots.push(snapshot);
        }
        snapshots.sort_by(|a, b| a.ids.trainer_id.cmp(&b.ids.trainer_id));
        Ok(snapshots)
    }
}

/// Keeps snapshots in memory. Used by tests and standalone demos.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<BTreeMap<String, ExerciseSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, trainer_id: &str) -> Option<ExerciseSnapshot> {
        self.snapshots.lock().ok()?.get(trainer_id).cloned()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: &ExerciseSnapshot) -> Result<(), PersistenceError> {
        self.snapshots
            .lock()
            .map_err(|e| PersistenceError::SyncError(format!("snapshot store lock poisoned: {e}")))?
            .insert(snapshot.ids.trainer_id.clone(), snapshot.clone());
        Ok(())
    }

    fn delete(&self, trainer_id: &str) -> Result<(), PersistenceError> {
        self.snapshots
            .lock()
            .map_err(|e| PersistenceError::SyncError(format!("snapshot store lock poisoned: {e}")))?
            .remove(trainer_id);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ExerciseSnapshot>, PersistenceError> {
        Ok(self
            .snapshots
            .lock()
            .map_err(|e| PersistenceError::SyncError(format!("snapshot store lock poisoned: {e}")))?
            .values()
            .cloned()
            .collect())
    }
}
