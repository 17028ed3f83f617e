//! Client-side optimistic state
//!
//! The reducer runs on the client too: actions are shown immediately and
//! reconciled with the server's committed stream as it arrives.

pub mod connection;
pub mod error;
pub mod exercise_client;
pub mod reconciler;

pub use connection::ExerciseConnection;
pub use error::ClientError;
pub use exercise_client::ExerciseClient;
pub use reconciler::{OptimisticReconciler, PendingAction};
