//! The closed set of exercise actions
//!
//! Actions are pure commands: every input the reducer needs is carried in the
//! action itself, so applying the same action to the same state yields the
//! same result on every replica and on every client.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{
    Client, Hospital, Material, Patient, PatientStatus, Personnel, Position,
    TransferPoint, Vehicle, Viewport,
};

/// Which kind of element a vehicle should load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadableElement {
    Material,
    Personnel,
    Patient,
}

/// Every mutation of an [`ExerciseState`](super::ExerciseState).
///
/// Serialized with a `"type"` tag carrying the human-readable action name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ExerciseAction {
    // ---------------------------------------------------------------------
    // Exercise
    // ---------------------------------------------------------------------
    #[serde(rename = "[Exercise] Start")]
    StartExercise,
    #[serde(rename = "[Exercise] Pause")]
    PauseExercise,
    #[serde(rename = "[Exercise] Tick")]
    Tick { tick_interval_ms: u64 },

    // ---------------------------------------------------------------------
    // Clients
    // ---------------------------------------------------------------------
    #[serde(rename = "[Client] Add client")]
    AddClient { client: Client },
    #[serde(rename = "[Client] Remove client")]
    RemoveClient { client_id: Uuid },
    #[serde(rename = "[Client] Restrict to viewport")]
    RestrictViewToViewport {
        client_id: Uuid,
        viewport_id: Option<Uuid>,
    },
    #[serde(rename = "[Client] Set waitingroom")]
    SetWaitingRoom {
        client_id: Uuid,
        should_be_in_waiting_room: bool,
    },

    // ---------------------------------------------------------------------
    // Viewports
    // ---------------------------------------------------------------------
    #[serde(rename = "[Viewport] Add viewport")]
    AddViewport { viewport: Viewport },
    #[serde(rename = "[Viewport] Move viewport")]
    MoveViewport {
        viewport_id: Uuid,
        target_position: Position,
    },
    #[serde(rename = "[Viewport] Remove viewport")]
    RemoveViewport { viewport_id: Uuid },

    // ---------------------------------------------------------------------
    // Vehicles
    // ---------------------------------------------------------------------
    #[serde(rename = "[Vehicle] Add vehicle")]
    AddVehicle {
        vehicle: Vehicle,
        materials: Vec<Material>,
        personnel: Vec<Personnel>,
    },
    #[serde(rename = "[Vehicle] Rename vehicle")]
    RenameVehicle { vehicle_id: Uuid, name: String },
    #[serde(rename = "[Vehicle] Move vehicle")]
    MoveVehicle {
        vehicle_id: Uuid,
        target_position: Position,
    },
    #[serde(rename = "[Vehicle] Remove vehicle")]
    RemoveVehicle { vehicle_id: Uuid },
    #[serde(rename = "[Vehicle] Unload vehicle")]
    UnloadVehicle { vehicle_id: Uuid },
    #[serde(rename = "[Vehicle] Load vehicle")]
    LoadVehicle {
        vehicle_id: Uuid,
        element_to_be_loaded_type: LoadableElement,
        element_to_be_loaded_id: Uuid,
    },
    #[serde(rename = "[Vehicle] Transfer vehicle")]
    TransferVehicle {
        vehicle_id: Uuid,
        start_transfer_point_id: Uuid,
        target_transfer_point_id: Uuid,
    },
    #[serde(rename = "[Vehicle] Set unload on arrival")]
    SetVehicleUnloadOnArrival {
        vehicle_id: Uuid,
        unload_on_arrival: bool,
    },

    // ---------------------------------------------------------------------
    // Personnel & material
    // ---------------------------------------------------------------------
    #[serde(rename = "[Personnel] Move personnel")]
    MovePersonnel {
        personnel_id: Uuid,
        target_position: Position,
    },
    #[serde(rename = "[Personnel] Transfer personnel")]
    TransferPersonnel {
        personnel_id: Uuid,
        start_transfer_point_id: Uuid,
        target_transfer_point_id: Uuid,
    },
    #[serde(rename = "[Personnel] Remove personnel")]
    RemovePersonnel { personnel_id: Uuid },
    #[serde(rename = "[Material] Move material")]
    MoveMaterial {
        material_id: Uuid,
        target_position: Position,
    },
    #[serde(rename = "[Material] Remove material")]
    RemoveMaterial { material_id: Uuid },

    // ---------------------------------------------------------------------
    // Patients
    // ---------------------------------------------------------------------
    #[serde(rename = "[Patient] Add patient")]
    AddPatient { patient: Patient },
    #[serde(rename = "[Patient] Move patient")]
    MovePatient {
        patient_id: Uuid,
        target_position: Position,
    },
    #[serde(rename = "[Patient] Remove patient")]
    RemovePatient { patient_id: Uuid },
    #[serde(rename = "[Patient] Set status")]
    SetPatientStatus {
        patient_id: Uuid,
        status: PatientStatus,
    },

    // ---------------------------------------------------------------------
    // Transfer points
    // ---------------------------------------------------------------------
    #[serde(rename = "[TransferPoint] Add TransferPoint")]
    AddTransferPoint { transfer_point: TransferPoint },
    #[serde(rename = "[TransferPoint] Move TransferPoint")]
    MoveTransferPoint {
        transfer_point_id: Uuid,
        target_position: Position,
    },
    #[serde(rename = "[TransferPoint] Rename TransferPoint")]
    RenameTransferPoint {
        transfer_point_id: Uuid,
        internal_name: String,
        external_name: String,
    },
    #[serde(rename = "[TransferPoint] Remove TransferPoint")]
    RemoveTransferPoint { transfer_point_id: Uuid },
    #[serde(rename = "[TransferPoint] Connect TransferPoints")]
    ConnectTransferPoints {
        transfer_point_id1: Uuid,
        transfer_point_id2: Uuid,
        /// Travel time in ms; estimated from the distance when absent.
        duration_ms: Option<u64>,
    },
    #[serde(rename = "[TransferPoint] Disconnect TransferPoints")]
    DisconnectTransferPoints {
        transfer_point_id1: Uuid,
        transfer_point_id2: Uuid,
    },

    // ---------------------------------------------------------------------
    // Hospitals
    // ---------------------------------------------------------------------
    #[serde(rename = "[Hospital] Add hospital")]
    AddHospital { hospital: Hospital },
    #[serde(rename = "[Hospital] Remove hospital")]
    RemoveHospital { hospital_id: Uuid },
    #[serde(rename = "[Hospital] Transport patient to hospital")]
    TransportPatientToHospital { hospital_id: Uuid, vehicle_id: Uuid },

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------
    #[serde(rename = "[Configuration] Set pretriageEnabled")]
    SetPretriageEnabled { pretriage_enabled: bool },
    #[serde(rename = "[Configuration] Set bluePatientsEnabled")]
    SetBluePatientsEnabled { blue_patients_enabled: bool },
    #[serde(rename = "[Configuration] Set patientIdentifierPrefix")]
    SetPatientIdentifierPrefix { patient_identifier_prefix: String },
}

impl ExerciseAction {
    /// The wire name of this action, e.g. `"[Vehicle] Move vehicle"`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartExercise => "[Exercise] Start",
            Self::PauseExercise => "[Exercise] Pause",
            Self::Tick { .. } => "[Exercise] Tick",
            Self::AddClient { .. } => "[Client] Add client",
            Self::RemoveClient { .. } => "[Client] Remove client",
            Self::RestrictViewToViewport { .. } => "[Client] Restrict to viewport",
            Self::SetWaitingRoom { .. } => "[Client] Set waitingroom",
            Self::AddViewport { .. } => "[Viewport] Add viewport",
            Self::MoveViewport { .. } => "[Viewport] Move viewport",
            Self::RemoveViewport { .. } => "[Viewport] Remove viewport",
            Self::AddVehicle { .. } => "[Vehicle] Add vehicle",
            Self::RenameVehicle { .. } => "[Vehicle] Rename vehicle",
            Self::MoveVehicle { .. } => "[Vehicle] Move vehicle",
            Self::RemoveVehicle { .. } => "[Vehicle] Remove vehicle",
            Self::UnloadVehicle { .. } => "[Vehicle] Unload vehicle",
            Self::LoadVehicle { .. } => "[Vehicle] Load vehicle",
            Self::TransferVehicle { .. } => "[Vehicle] Transfer vehicle",
            Self::SetVehicleUnloadOnArrival { .. } => "[Vehicle] Set unload on arrival",
            Self::MovePersonnel { .. } => "[Personnel] Move personnel",
            Self::TransferPersonnel { .. } => "[Personnel] Transfer personnel",
            Self::RemovePersonnel { .. } => "[Personnel] Remove personnel",
            Self::MoveMaterial { .. } => "[Material] Move material",
            Self::RemoveMaterial { .. } => "[Material] Remove material",
            Self::AddPatient { .. } => "[Patient] Add patient",
            Self::MovePatient { .. } => "[Patient] Move patient",
            Self::RemovePatient { .. } => "[Patient] Remove patient",
            Self::SetPatientStatus { .. } => "[Patient] Set status",
            Self::AddTransferPoint { .. } => "[TransferPoint] Add TransferPoint",
            Self::MoveTransferPoint { .. } => "[TransferPoint] Move TransferPoint",
            Self::RenameTransferPoint { .. } => "[TransferPoint] Rename TransferPoint",
            Self::RemoveTransferPoint { .. } => "[TransferPoint] Remove TransferPoint",
            Self::ConnectTransferPoints { .. } => "[TransferPoint] Connect TransferPoints",
            Self::DisconnectTransferPoints { .. } => "[TransferPoint] Disconnect TransferPoints",
            Self::AddHospital { .. } => "[Hospital] Add hospital",
            Self::RemoveHospital { .. } => "[Hospital] Remove hospital",
            Self::TransportPatientToHospital { .. } => "[Hospital] Transport patient to hospital",
            Self::SetPretriageEnabled { .. } => "[Configuration] Set pretriageEnabled",
            Self::SetBluePatientsEnabled { .. } => "[Configuration] Set bluePatientsEnabled",
            Self::SetPatientIdentifierPrefix { .. } => {
                "[Configuration] Set patientIdentifierPrefix"
            }
        }
    }

    /// Actions that change the running state of the exercise.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::StartExercise | Self::PauseExercise)
    }

    /// Actions that only track connected clients.
    pub fn is_client_bookkeeping(&self) -> bool {
        matches!(
            self,
            Self::AddClient { .. }
                | Self::RemoveClient { .. }
                | Self::RestrictViewToViewport { .. }
                | Self::SetWaitingRoom { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_name_matches_serde_tag() {
        let action = ExerciseAction::MoveVehicle {
            vehicle_id: Uuid::new_v4(),
            target_position: Position::new(1.0, 2.0),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], action.name());
        assert!(json.get("targetPosition").is_some());

        let tick = serde_json::to_value(ExerciseAction::Tick {
            tick_interval_ms: 1000,
        })
        .unwrap();
        assert_eq!(tick["type"], "[Exercise] Tick");
        assert_eq!(tick["tickIntervalMs"], 1000);
    }

    #[test]
    fn unit_variants_decode_from_tag_only() {
        let action: ExerciseAction =
            serde_json::from_str(r#"{"type":"[Exercise] Start"}"#).unwrap();
        assert_eq!(action, ExerciseAction::StartExercise);
        assert!(action.is_lifecycle());
    }
}
