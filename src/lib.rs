// Exercise Sync - Replicated, deterministic exercise state

pub mod client;
pub mod config;
pub mod gateway;
pub mod lifecycle;
pub mod permission;
pub mod replica;
pub mod replication;
pub mod session;
pub mod state;

pub use config::{ClientConfig, ServerConfig};
pub use replica::ServerReplica;
pub use state::{reduce, ExerciseAction, ExerciseState};
