//! Exercise session registry
//!
//! Live exercises, their committed histories, and their persistence.

pub mod error;
pub mod exercise;
pub mod ids;
pub mod persistence;
pub mod registry;

pub use error::{PersistenceError, RegistryError, SessionError};
pub use exercise::{CommittedAction, ExerciseExport, ExerciseIds, ExerciseSession, SessionEvent};
pub use ids::generate_exercise_ids;
pub use persistence::{ExerciseSnapshot, FileSnapshotStore, InMemorySnapshotStore, SnapshotStore};
pub use registry::ExerciseRegistry;
