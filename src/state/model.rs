//! Exercise state model
//!
//! Every entity table is a `BTreeMap` keyed by id, so two states holding the
//! same entities serialize to the same bytes regardless of insertion order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A point on the exercise map.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Role a client acts under, decided by the public id used to join.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Trainer,
    Participant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    pub view_restricted_to_viewport_id: Option<Uuid>,
    pub is_in_waiting_room: bool,
}

impl Client {
    pub fn new(name: impl Into<String>, role: Role, viewport: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            view_restricted_to_viewport_id: viewport,
            is_in_waiting_room: false,
        }
    }
}

/// A rectangular area a client can be restricted to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub id: Uuid,
    pub name: String,
    pub top_left: Position,
    pub width: f64,
    pub height: f64,
}

/// An element travelling between two transfer points.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub start_transfer_point_id: Uuid,
    pub target_transfer_point_id: Uuid,
    /// Exercise time (ms) at which the element arrives.
    pub end_time_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: Uuid,
    pub vehicle_type: String,
    pub name: String,
    pub patient_capacity: u32,
    /// `None` while the vehicle is in transfer.
    pub position: Option<Position>,
    pub transfer: Option<Transfer>,
    pub material_ids: BTreeSet<Uuid>,
    pub personnel_ids: BTreeSet<Uuid>,
    pub patient_ids: BTreeSet<Uuid>,
    #[serde(default)]
    pub unload_on_arrival: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Personnel {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub personnel_type: String,
    /// `None` while loaded into its vehicle or in transfer.
    pub position: Option<Position>,
    pub transfer: Option<Transfer>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Material {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub position: Option<Position>,
}

/// Triage category of a patient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatientStatus {
    White,
    Green,
    Yellow,
    Red,
    Blue,
    Black,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: Uuid,
    /// Human-readable identifier, assigned by the reducer on insert.
    #[serde(default)]
    pub identifier: String,
    pub status: PatientStatus,
    pub position: Option<Position>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPoint {
    pub id: Uuid,
    pub position: Position,
    pub internal_name: String,
    pub external_name: String,
    /// Connected transfer points and the travel duration (ms) to each.
    #[serde(default)]
    pub reachable_transfer_points: BTreeMap<Uuid, u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hospital {
    pub id: Uuid,
    pub name: String,
    pub transport_duration_ms: u64,
    #[serde(default)]
    pub patient_ids: BTreeSet<Uuid>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseConfiguration {
    pub pretriage_enabled: bool,
    pub blue_patients_enabled: bool,
    pub patient_identifier_prefix: String,
}

impl Default for ExerciseConfiguration {
    fn default() -> Self {
        Self {
            pretriage_enabled: true,
            blue_patients_enabled: false,
            patient_identifier_prefix: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExerciseStatus {
    NotStarted,
    Running,
    Paused,
}

/// The complete, serializable state of one exercise.
///
/// Only the reducer produces new values of this type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseState {
    pub vehicles: BTreeMap<Uuid, Vehicle>,
    pub personnel: BTreeMap<Uuid, Personnel>,
    pub patients: BTreeMap<Uuid, Patient>,
    pub materials: BTreeMap<Uuid, Material>,
    pub transfer_points: BTreeMap<Uuid, TransferPoint>,
    pub hospitals: BTreeMap<Uuid, Hospital>,
    pub viewports: BTreeMap<Uuid, Viewport>,
    pub clients: BTreeMap<Uuid, Client>,
    pub configuration: ExerciseConfiguration,
    pub status: ExerciseStatus,
    pub current_time_ms: u64,
    pub tick_counter: u64,
    pub applied_action_count: u64,
    /// Running counter behind patient identifiers.
    pub patient_counter: u64,
}

impl Default for ExerciseState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExerciseState {
    /// A fresh exercise: no entities, not started, time zero.
    pub fn new() -> Self {
        Self {
            vehicles: BTreeMap::new(),
            personnel: BTreeMap::new(),
            patients: BTreeMap::new(),
            materials: BTreeMap::new(),
            transfer_points: BTreeMap::new(),
            hospitals: BTreeMap::new(),
            viewports: BTreeMap::new(),
            clients: BTreeMap::new(),
            configuration: ExerciseConfiguration::default(),
            status: ExerciseStatus::NotStarted,
            current_time_ms: 0,
            tick_counter: 0,
            applied_action_count: 0,
            patient_counter: 0,
        }
    }

    /// SHA-256 (hex) over the canonical JSON encoding.
    ///
    /// Two replicas that applied the same prefix of the log report the same
    /// digest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        match serde_json::to_vec(self) {
            Ok(bytes) => hasher.update(&bytes),
            // Unreachable for plain data. serde_json writes NaN and infinity
            // as `null`, so shape validation rejects non-finite numbers
            // before they can make two states hash alike.
            Err(e) => hasher.update(e.to_string().as_bytes()),
        }
        hex::encode(hasher.finalize())
    }

    /// A state with its connected clients removed.
    ///
    /// Used when a state is exported or imported: clients are a property of
    /// live connections and never survive a restart of the exercise.
    pub fn without_clients(&self) -> Self {
        let mut state = self.clone();
        state.clients.clear();
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_ignores_insertion_order() {
        let a = Client::new("a", Role::Trainer, None);
        let b = Client::new("b", Role::Participant, None);

        let mut first = ExerciseState::new();
        first.clients.insert(a.id, a.clone());
        first.clients.insert(b.id, b.clone());

        let mut second = ExerciseState::new();
        second.clients.insert(b.id, b);
        second.clients.insert(a.id, a);

        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn status_uses_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&ExerciseStatus::NotStarted).unwrap();
        assert_eq!(json, "\"not-started\"");
    }
}
