//! State & reducer engine
//!
//! A pure `(state, action) -> state | error` transition function shared by
//! the server replicas and the optimistic client.

pub mod action;
pub mod error;
pub mod model;
pub mod reducer;

pub use action::{ExerciseAction, LoadableElement};
pub use error::ReducerError;
pub use model::{
    Client, ExerciseConfiguration, ExerciseState, ExerciseStatus, Hospital, Material, Patient,
    PatientStatus, Personnel, Position, Role, Transfer, TransferPoint, Vehicle, Viewport,
};
pub use reducer::{apply_in_place, reduce};
