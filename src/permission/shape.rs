//! Structural validation of decoded actions.

use crate::state::{ExerciseAction, Position};

/// One problem found while checking the shape of an action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: Option<String>,
    pub severity: IssueSeverity,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssueSeverity {
    Warning,
    Error,
}

impl ValidationIssue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            field: None,
            severity: IssueSeverity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            field: None,
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }

    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{field}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Decode an action received over the wire.
///
/// Unknown `type` tags, missing fields and wrongly typed values are reported
/// as a single issue; a decoded action is then run through
/// [`validate_shape`].
pub fn decode_action(value: serde_json::Value) -> Result<ExerciseAction, Vec<ValidationIssue>> {
    let action: ExerciseAction = serde_json::from_value(value)
        .map_err(|e| vec![ValidationIssue::error(format!("malformed action: {e}"))])?;
    let errors: Vec<ValidationIssue> = validate_shape(&action)
        .into_iter()
        .filter(ValidationIssue::is_error)
        .collect();
    if errors.is_empty() {
        Ok(action)
    } else {
        Err(errors)
    }
}

fn check_position(issues: &mut Vec<ValidationIssue>, field: &str, position: &Position) {
    if !position.is_finite() {
        issues.push(ValidationIssue::error("coordinates must be finite").for_field(field));
    }
}

fn check_name(issues: &mut Vec<ValidationIssue>, field: &str, name: &str) {
    if name.trim().is_empty() {
        issues.push(ValidationIssue::error("must not be empty").for_field(field));
    }
}

/// Structural checks that need no exercise state.
pub fn validate_shape(action: &ExerciseAction) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    match action {
        ExerciseAction::Tick { tick_interval_ms } => {
            if *tick_interval_ms == 0 {
                issues.push(
                    ValidationIssue::error("must be greater than zero").for_field("tickIntervalMs"),
                );
            }
        }
        ExerciseAction::AddClient { client } => {
            check_name(&mut issues, "client.name", &client.name);
        }
        ExerciseAction::AddViewport { viewport } => {
            check_name(&mut issues, "viewport.name", &viewport.name);
            check_position(&mut issues, "viewport.topLeft", &viewport.top_left);
            if !(viewport.width.is_finite() && viewport.height.is_finite())
                || viewport.width <= 0.0
                || viewport.height <= 0.0
            {
                issues.push(
                    ValidationIssue::error("width and height must be positive").for_field("viewport"),
                );
            }
        }
        ExerciseAction::AddVehicle {
            vehicle,
            materials,
            personnel,
        } => {
            check_name(&mut issues, "vehicle.name", &vehicle.name);
            if let Some(position) = &vehicle.position {
                check_position(&mut issues, "vehicle.position", position);
            }
            if vehicle.patient_capacity == 0 {
                issues.push(
                    ValidationIssue::warning("vehicle cannot carry patients")
                        .for_field("vehicle.patientCapacity"),
                );
            }
            if materials.iter().any(|m| m.vehicle_id != vehicle.id)
                || materials.len() != vehicle.material_ids.len()
            {
                issues.push(
                    ValidationIssue::error("materials must belong to the vehicle").for_field("materials"),
                );
            }
            if personnel.iter().any(|p| p.vehicle_id != vehicle.id)
                || personnel.len() != vehicle.personnel_ids.len()
            {
                issues.push(
                    ValidationIssue::error("personnel must belong to the vehicle").for_field("personnel"),
                );
            }
            for material in materials {
                if let Some(position) = &material.position {
                    check_position(&mut issues, "materials.position", position);
                }
            }
            for person in personnel {
                if let Some(position) = &person.position {
                    check_position(&mut issues, "personnel.position", position);
                }
            }
        }
        ExerciseAction::RenameVehicle { name, .. } => {
            check_name(&mut issues, "name", name);
        }
        ExerciseAction::MoveViewport {
            target_position, ..
        }
        | ExerciseAction::MoveVehicle {
            target_position, ..
        }
        | ExerciseAction::MovePersonnel {
            target_position, ..
        }
        | ExerciseAction::MoveMaterial {
            target_position, ..
        }
        | ExerciseAction::MovePatient {
            target_position, ..
        }
        | ExerciseAction::MoveTransferPoint {
            target_position, ..
        } => {
            check_position(&mut issues, "targetPosition", target_position);
        }
        ExerciseAction::TransferVehicle {
            start_transfer_point_id,
            target_transfer_point_id,
            ..
        }
        | ExerciseAction::TransferPersonnel {
            start_transfer_point_id,
            target_transfer_point_id,
            ..
        } => {
            if start_transfer_point_id == target_transfer_point_id {
                issues.push(
                    ValidationIssue::error("start and target must differ")
                        .for_field("targetTransferPointId"),
                );
            }
        }
        ExerciseAction::AddPatient { patient } => {
            if let Some(position) = &patient.position {
                check_position(&mut issues, "patient.position", position);
            }
        }
        ExerciseAction::AddTransferPoint { transfer_point } => {
            check_position(&mut issues, "transferPoint.position", &transfer_point.position);
            check_name(
                &mut issues,
                "transferPoint.internalName",
                &transfer_point.internal_name,
            );
            if transfer_point
                .reachable_transfer_points
                .contains_key(&transfer_point.id)
            {
                issues.push(
                    ValidationIssue::error("cannot reach itself")
                        .for_field("transferPoint.reachableTransferPoints"),
                );
            }
        }
        ExerciseAction::RenameTransferPoint { internal_name, .. } => {
            check_name(&mut issues, "internalName", internal_name);
        }
        ExerciseAction::ConnectTransferPoints {
            transfer_point_id1,
            transfer_point_id2,
            ..
        }
        | ExerciseAction::DisconnectTransferPoints {
            transfer_point_id1,
            transfer_point_id2,
        } => {
            if transfer_point_id1 == transfer_point_id2 {
                issues.push(
                    ValidationIssue::error("a transfer point cannot connect to itself")
                        .for_field("transferPointId2"),
                );
            }
        }
        ExerciseAction::AddHospital { hospital } => {
            check_name(&mut issues, "hospital.name", &hospital.name);
        }
        ExerciseAction::StartExercise
        | ExerciseAction::PauseExercise
        | ExerciseAction::RemoveClient { .. }
        | ExerciseAction::RestrictViewToViewport { .. }
        | ExerciseAction::SetWaitingRoom { .. }
        | ExerciseAction::RemoveViewport { .. }
        | ExerciseAction::RemoveVehicle { .. }
        | ExerciseAction::UnloadVehicle { .. }
        | ExerciseAction::LoadVehicle { .. }
        | ExerciseAction::SetVehicleUnloadOnArrival { .. }
        | ExerciseAction::RemovePersonnel { .. }
        | ExerciseAction::RemoveMaterial { .. }
        | ExerciseAction::RemovePatient { .. }
        | ExerciseAction::SetPatientStatus { .. }
        | ExerciseAction::RemoveTransferPoint { .. }
        | ExerciseAction::RemoveHospital { .. }
        | ExerciseAction::TransportPatientToHospital { .. }
        | ExerciseAction::SetPretriageEnabled { .. }
        | ExerciseAction::SetBluePatientsEnabled { .. }
        | ExerciseAction::SetPatientIdentifierPrefix { .. } => {}
    }
    issues
}
