//! The exercise reducer
//!
//! `reduce` never mutates its input: it works on a draft copy and hands the
//! draft back only when the whole action succeeded. `appliedActionCount` is
//! advanced here so every consumer of the reducer counts the same way.

use std::collections::BTreeMap;

use uuid::Uuid;

use super::action::{ExerciseAction, LoadableElement};
use super::error::ReducerError;
use super::model::{ExerciseState, ExerciseStatus, PatientStatus, Position, Transfer};

/// Width (in map units) across which the contents of a vehicle are spread
/// when it is unloaded.
const VEHICLE_UNLOAD_WIDTH: f64 = 2.0;

/// Travel time per map unit used when a connection carries no duration.
const ESTIMATED_MS_PER_UNIT: f64 = 100.0;

/// Apply `action` to `state`, returning the successor state.
///
/// On error `state` is untouched and no partial result escapes.
pub fn reduce(state: &ExerciseState, action: &ExerciseAction) -> Result<ExerciseState, ReducerError> {
    let mut draft = state.clone();
    apply_in_place(&mut draft, action)?;
    Ok(draft)
}

/// Apply `action` directly to `draft`.
///
/// When this returns an error the draft may be half-modified and must be
/// discarded. Use [`reduce`] unless the caller owns a throwaway copy.
pub fn apply_in_place(draft: &mut ExerciseState, action: &ExerciseAction) -> Result<(), ReducerError> {
    match action {
        // -----------------------------------------------------------------
        // Exercise
        // -----------------------------------------------------------------
        ExerciseAction::StartExercise => {
            if draft.status == ExerciseStatus::Running {
                return Err(ReducerError::expected("Exercise is already running"));
            }
            draft.status = ExerciseStatus::Running;
        }
        ExerciseAction::PauseExercise => {
            if draft.status != ExerciseStatus::Running {
                return Err(ReducerError::expected("Exercise is not running"));
            }
            draft.status = ExerciseStatus::Paused;
        }
        ExerciseAction::Tick { tick_interval_ms } => {
            if draft.status != ExerciseStatus::Running {
                return Err(ReducerError::expected(
                    "Cannot tick an exercise that is not running",
                ));
            }
            draft.tick_counter += 1;
            draft.current_time_ms = draft.current_time_ms.saturating_add(*tick_interval_ms);
            complete_transfers(draft)?;
        }

        // -----------------------------------------------------------------
        // Clients
        // -----------------------------------------------------------------
        ExerciseAction::AddClient { client } => {
            if draft.clients.contains_key(&client.id) {
                return Err(ReducerError::expected(format!(
                    "Client with id {} already exists",
                    client.id
                )));
            }
            if let Some(viewport_id) = client.view_restricted_to_viewport_id {
                entity(&draft.viewports, &viewport_id, "Viewport")?;
            }
            draft.clients.insert(client.id, client.clone());
        }
        ExerciseAction::RemoveClient { client_id } => {
            if draft.clients.remove(client_id).is_none() {
                return Err(missing("Client", client_id));
            }
        }
        ExerciseAction::RestrictViewToViewport {
            client_id,
            viewport_id,
        } => {
            if let Some(viewport_id) = viewport_id {
                entity(&draft.viewports, viewport_id, "Viewport")?;
            }
            entity_mut(&mut draft.clients, client_id, "Client")?.view_restricted_to_viewport_id =
                *viewport_id;
        }
        ExerciseAction::SetWaitingRoom {
            client_id,
            should_be_in_waiting_room,
        } => {
            entity_mut(&mut draft.clients, client_id, "Client")?.is_in_waiting_room =
                *should_be_in_waiting_room;
        }

        // -----------------------------------------------------------------
        // Viewports
        // -----------------------------------------------------------------
        ExerciseAction::AddViewport { viewport } => {
            ensure_absent(&draft.viewports, &viewport.id, "Viewport")?;
            draft.viewports.insert(viewport.id, viewport.clone());
        }
        ExerciseAction::MoveViewport {
            viewport_id,
            target_position,
        } => {
            entity_mut(&mut draft.viewports, viewport_id, "Viewport")?.top_left = *target_position;
        }
        ExerciseAction::RemoveViewport { viewport_id } => {
            if draft.viewports.remove(viewport_id).is_none() {
                return Err(missing("Viewport", viewport_id));
            }
            for client in draft.clients.values_mut() {
                if client.view_restricted_to_viewport_id == Some(*viewport_id) {
                    client.view_restricted_to_viewport_id = None;
                }
            }
        }

        // -----------------------------------------------------------------
        // Vehicles
        // -----------------------------------------------------------------
        ExerciseAction::AddVehicle {
            vehicle,
            materials,
            personnel,
        } => {
            ensure_absent(&draft.vehicles, &vehicle.id, "Vehicle")?;
            let materials_consistent = materials.len() == vehicle.material_ids.len()
                && materials
                    .iter()
                    .all(|m| m.vehicle_id == vehicle.id && vehicle.material_ids.contains(&m.id));
            let personnel_consistent = personnel.len() == vehicle.personnel_ids.len()
                && personnel
                    .iter()
                    .all(|p| p.vehicle_id == vehicle.id && vehicle.personnel_ids.contains(&p.id));
            if !materials_consistent || !personnel_consistent {
                return Err(ReducerError::expected(format!(
                    "Vehicle with id {} is inconsistent with its materials or personnel",
                    vehicle.id
                )));
            }
            for patient_id in &vehicle.patient_ids {
                entity(&draft.patients, patient_id, "Patient")?;
            }
            for material in materials {
                draft.materials.insert(material.id, material.clone());
            }
            for person in personnel {
                draft.personnel.insert(person.id, person.clone());
            }
            draft.vehicles.insert(vehicle.id, vehicle.clone());
        }
        ExerciseAction::RenameVehicle { vehicle_id, name } => {
            entity_mut(&mut draft.vehicles, vehicle_id, "Vehicle")?.name = name.clone();
        }
        ExerciseAction::MoveVehicle {
            vehicle_id,
            target_position,
        } => {
            let vehicle = entity_mut(&mut draft.vehicles, vehicle_id, "Vehicle")?;
            if vehicle.transfer.is_some() {
                return Err(in_transfer("Vehicle", vehicle_id));
            }
            vehicle.position = Some(*target_position);
        }
        ExerciseAction::RemoveVehicle { vehicle_id } => {
            remove_vehicle_with_contents(draft, vehicle_id)?;
        }
        ExerciseAction::UnloadVehicle { vehicle_id } => {
            unload_vehicle(draft, vehicle_id)?;
        }
        ExerciseAction::LoadVehicle {
            vehicle_id,
            element_to_be_loaded_type,
            element_to_be_loaded_id,
        } => {
            load_vehicle(draft, vehicle_id, *element_to_be_loaded_type, element_to_be_loaded_id)?;
        }
        ExerciseAction::TransferVehicle {
            vehicle_id,
            start_transfer_point_id,
            target_transfer_point_id,
        } => {
            let transfer = plan_transfer(draft, start_transfer_point_id, target_transfer_point_id)?;
            let vehicle = entity_mut(&mut draft.vehicles, vehicle_id, "Vehicle")?;
            if vehicle.transfer.is_some() {
                return Err(in_transfer("Vehicle", vehicle_id));
            }
            vehicle.position = None;
            vehicle.transfer = Some(transfer);
        }
        ExerciseAction::SetVehicleUnloadOnArrival {
            vehicle_id,
            unload_on_arrival,
        } => {
            entity_mut(&mut draft.vehicles, vehicle_id, "Vehicle")?.unload_on_arrival =
                *unload_on_arrival;
        }

        // -----------------------------------------------------------------
        // Personnel & material
        // -----------------------------------------------------------------
        ExerciseAction::MovePersonnel {
            personnel_id,
            target_position,
        } => {
            let person = entity_mut(&mut draft.personnel, personnel_id, "Personnel")?;
            if person.transfer.is_some() {
                return Err(in_transfer("Personnel", personnel_id));
            }
            person.position = Some(*target_position);
        }
        ExerciseAction::TransferPersonnel {
            personnel_id,
            start_transfer_point_id,
            target_transfer_point_id,
        } => {
            let transfer = plan_transfer(draft, start_transfer_point_id, target_transfer_point_id)?;
            let person = entity_mut(&mut draft.personnel, personnel_id, "Personnel")?;
            if person.transfer.is_some() {
                return Err(in_transfer("Personnel", personnel_id));
            }
            person.position = None;
            person.transfer = Some(transfer);
        }
        ExerciseAction::RemovePersonnel { personnel_id } => {
            let person = draft
                .personnel
                .remove(personnel_id)
                .ok_or_else(|| missing("Personnel", personnel_id))?;
            if let Some(vehicle) = draft.vehicles.get_mut(&person.vehicle_id) {
                vehicle.personnel_ids.remove(personnel_id);
            }
        }
        ExerciseAction::MoveMaterial {
            material_id,
            target_position,
        } => {
            entity_mut(&mut draft.materials, material_id, "Material")?.position =
                Some(*target_position);
        }
        ExerciseAction::RemoveMaterial { material_id } => {
            let material = draft
                .materials
                .remove(material_id)
                .ok_or_else(|| missing("Material", material_id))?;
            if let Some(vehicle) = draft.vehicles.get_mut(&material.vehicle_id) {
                vehicle.material_ids.remove(material_id);
            }
        }

        // -----------------------------------------------------------------
        // Patients
        // -----------------------------------------------------------------
        ExerciseAction::AddPatient { patient } => {
            ensure_absent(&draft.patients, &patient.id, "Patient")?;
            check_status_allowed(draft, patient.status)?;
            draft.patient_counter += 1;
            let mut patient = patient.clone();
            patient.identifier = format!(
                "{}{}",
                draft.configuration.patient_identifier_prefix, draft.patient_counter
            );
            draft.patients.insert(patient.id, patient);
        }
        ExerciseAction::MovePatient {
            patient_id,
            target_position,
        } => {
            entity_mut(&mut draft.patients, patient_id, "Patient")?.position =
                Some(*target_position);
            for vehicle in draft.vehicles.values_mut() {
                vehicle.patient_ids.remove(patient_id);
            }
        }
        ExerciseAction::RemovePatient { patient_id } => {
            if draft.patients.remove(patient_id).is_none() {
                return Err(missing("Patient", patient_id));
            }
            for vehicle in draft.vehicles.values_mut() {
                vehicle.patient_ids.remove(patient_id);
            }
        }
        ExerciseAction::SetPatientStatus { patient_id, status } => {
            if !draft.configuration.pretriage_enabled {
                return Err(ReducerError::expected("Pretriage is disabled"));
            }
            check_status_allowed(draft, *status)?;
            entity_mut(&mut draft.patients, patient_id, "Patient")?.status = *status;
        }

        // -----------------------------------------------------------------
        // Transfer points
        // -----------------------------------------------------------------
        ExerciseAction::AddTransferPoint { transfer_point } => {
            ensure_absent(&draft.transfer_points, &transfer_point.id, "TransferPoint")?;
            for target in transfer_point.reachable_transfer_points.keys() {
                entity(&draft.transfer_points, target, "TransferPoint")?;
            }
            for (target, duration) in &transfer_point.reachable_transfer_points {
                if let Some(other) = draft.transfer_points.get_mut(target) {
                    other
                        .reachable_transfer_points
                        .insert(transfer_point.id, *duration);
                }
            }
            draft
                .transfer_points
                .insert(transfer_point.id, transfer_point.clone());
        }
        ExerciseAction::MoveTransferPoint {
            transfer_point_id,
            target_position,
        } => {
            entity_mut(&mut draft.transfer_points, transfer_point_id, "TransferPoint")?.position =
                *target_position;
        }
        ExerciseAction::RenameTransferPoint {
            transfer_point_id,
            internal_name,
            external_name,
        } => {
            let point = entity_mut(&mut draft.transfer_points, transfer_point_id, "TransferPoint")?;
            point.internal_name = internal_name.clone();
            point.external_name = external_name.clone();
        }
        ExerciseAction::RemoveTransferPoint { transfer_point_id } => {
            entity(&draft.transfer_points, transfer_point_id, "TransferPoint")?;
            let touches = |transfer: &Option<Transfer>| {
                transfer.as_ref().is_some_and(|t| {
                    t.start_transfer_point_id == *transfer_point_id
                        || t.target_transfer_point_id == *transfer_point_id
                })
            };
            if draft.vehicles.values().any(|v| touches(&v.transfer))
                || draft.personnel.values().any(|p| touches(&p.transfer))
            {
                return Err(ReducerError::expected(format!(
                    "TransferPoint with id {transfer_point_id} still has elements in transfer"
                )));
            }
            draft.transfer_points.remove(transfer_point_id);
            for point in draft.transfer_points.values_mut() {
                point.reachable_transfer_points.remove(transfer_point_id);
            }
        }
        ExerciseAction::ConnectTransferPoints {
            transfer_point_id1,
            transfer_point_id2,
            duration_ms,
        } => {
            if transfer_point_id1 == transfer_point_id2 {
                return Err(ReducerError::expected(format!(
                    "TransferPoint with id {transfer_point_id1} cannot connect to itself"
                )));
            }
            let first = entity(&draft.transfer_points, transfer_point_id1, "TransferPoint")?.position;
            let second = entity(&draft.transfer_points, transfer_point_id2, "TransferPoint")?.position;
            let duration = duration_ms.unwrap_or_else(|| estimate_duration(first, second));
            entity_mut(&mut draft.transfer_points, transfer_point_id1, "TransferPoint")?
                .reachable_transfer_points
                .insert(*transfer_point_id2, duration);
            entity_mut(&mut draft.transfer_points, transfer_point_id2, "TransferPoint")?
                .reachable_transfer_points
                .insert(*transfer_point_id1, duration);
        }
        ExerciseAction::DisconnectTransferPoints {
            transfer_point_id1,
            transfer_point_id2,
        } => {
            if transfer_point_id1 == transfer_point_id2 {
                return Err(ReducerError::expected(format!(
                    "TransferPoint with id {transfer_point_id1} cannot disconnect from itself"
                )));
            }
            entity_mut(&mut draft.transfer_points, transfer_point_id1, "TransferPoint")?
                .reachable_transfer_points
                .remove(transfer_point_id2);
            entity_mut(&mut draft.transfer_points, transfer_point_id2, "TransferPoint")?
                .reachable_transfer_points
                .remove(transfer_point_id1);
        }

        // -----------------------------------------------------------------
        // Hospitals
        // -----------------------------------------------------------------
        ExerciseAction::AddHospital { hospital } => {
            ensure_absent(&draft.hospitals, &hospital.id, "Hospital")?;
            draft.hospitals.insert(hospital.id, hospital.clone());
        }
        ExerciseAction::RemoveHospital { hospital_id } => {
            if draft.hospitals.remove(hospital_id).is_none() {
                return Err(missing("Hospital", hospital_id));
            }
        }
        ExerciseAction::TransportPatientToHospital {
            hospital_id,
            vehicle_id,
        } => {
            entity(&draft.hospitals, hospital_id, "Hospital")?;
            let vehicle = entity(&draft.vehicles, vehicle_id, "Vehicle")?;
            if vehicle.transfer.is_some() {
                return Err(in_transfer("Vehicle", vehicle_id));
            }
            if vehicle.patient_ids.is_empty() {
                return Err(ReducerError::expected(format!(
                    "Vehicle with id {vehicle_id} carries no patients"
                )));
            }
            let patient_ids = vehicle.patient_ids.clone();
            for patient_id in &patient_ids {
                draft.patients.remove(patient_id);
            }
            remove_vehicle_with_contents(draft, vehicle_id)?;
            entity_mut(&mut draft.hospitals, hospital_id, "Hospital")?
                .patient_ids
                .extend(patient_ids);
        }

        // -----------------------------------------------------------------
        // Configuration
        // -----------------------------------------------------------------
        ExerciseAction::SetPretriageEnabled { pretriage_enabled } => {
            draft.configuration.pretriage_enabled = *pretriage_enabled;
        }
        ExerciseAction::SetBluePatientsEnabled {
            blue_patients_enabled,
        } => {
            draft.configuration.blue_patients_enabled = *blue_patients_enabled;
        }
        ExerciseAction::SetPatientIdentifierPrefix {
            patient_identifier_prefix,
        } => {
            draft.configuration.patient_identifier_prefix = patient_identifier_prefix.clone();
        }
    }

    draft.applied_action_count += 1;
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn missing(kind: &str, id: &Uuid) -> ReducerError {
    ReducerError::expected(format!("{kind} with id {id} does not exist"))
}

fn in_transfer(kind: &str, id: &Uuid) -> ReducerError {
    ReducerError::expected(format!("{kind} with id {id} is currently in transfer"))
}

fn entity<'a, T>(map: &'a BTreeMap<Uuid, T>, id: &Uuid, kind: &str) -> Result<&'a T, ReducerError> {
    map.get(id).ok_or_else(|| missing(kind, id))
}

fn entity_mut<'a, T>(
    map: &'a mut BTreeMap<Uuid, T>,
    id: &Uuid,
    kind: &str,
) -> Result<&'a mut T, ReducerError> {
    map.get_mut(id).ok_or_else(|| missing(kind, id))
}

fn ensure_absent<T>(map: &BTreeMap<Uuid, T>, id: &Uuid, kind: &str) -> Result<(), ReducerError> {
    if map.contains_key(id) {
        return Err(ReducerError::expected(format!("{kind} with id {id} already exists")));
    }
    Ok(())
}

fn check_status_allowed(state: &ExerciseState, status: PatientStatus) -> Result<(), ReducerError> {
    if status == PatientStatus::Blue && !state.configuration.blue_patients_enabled {
        return Err(ReducerError::expected("Blue patients are disabled"));
    }
    Ok(())
}

fn estimate_duration(a: Position, b: Position) -> u64 {
    let distance = (a.x - b.x).hypot(a.y - b.y);
    ((distance * ESTIMATED_MS_PER_UNIT).round() as u64).max(1)
}

/// Build the transfer record for a trip between two connected points.
fn plan_transfer(state: &ExerciseState, start: &Uuid, target: &Uuid) -> Result<Transfer, ReducerError> {
    let start_point = entity(&state.transfer_points, start, "TransferPoint")?;
    entity(&state.transfer_points, target, "TransferPoint")?;
    let duration = start_point
        .reachable_transfer_points
        .get(target)
        .ok_or_else(|| {
            ReducerError::expected(format!(
                "TransferPoint with id {target} is not reachable from {start}"
            ))
        })?;
    Ok(Transfer {
        start_transfer_point_id: *start,
        target_transfer_point_id: *target,
        end_time_ms: state.current_time_ms.saturating_add(*duration),
    })
}

fn remove_vehicle_with_contents(draft: &mut ExerciseState, vehicle_id: &Uuid) -> Result<(), ReducerError> {
    let vehicle = draft
        .vehicles
        .remove(vehicle_id)
        .ok_or_else(|| missing("Vehicle", vehicle_id))?;
    for material_id in &vehicle.material_ids {
        draft.materials.remove(material_id);
    }
    for personnel_id in &vehicle.personnel_ids {
        draft.personnel.remove(personnel_id);
    }
    for patient_id in &vehicle.patient_ids {
        draft.patients.remove(patient_id);
    }
    Ok(())
}

fn unload_vehicle(draft: &mut ExerciseState, vehicle_id: &Uuid) -> Result<(), ReducerError> {
    let vehicle = entity_mut(&mut draft.vehicles, vehicle_id, "Vehicle")?;
    let origin = vehicle.position.ok_or_else(|| in_transfer("Vehicle", vehicle_id))?;
    let patient_ids = std::mem::take(&mut vehicle.patient_ids);
    let personnel_ids = vehicle.personnel_ids.clone();
    let material_ids = vehicle.material_ids.clone();

    let count = patient_ids.len() + personnel_ids.len() + material_ids.len();
    let space = VEHICLE_UNLOAD_WIDTH / (count + 1) as f64;
    let mut x = origin.x - VEHICLE_UNLOAD_WIDTH / 2.0;

    for patient_id in &patient_ids {
        x += space;
        let patient = draft.patients.get_mut(patient_id).ok_or_else(|| {
            ReducerError::unexpected(format!(
                "Vehicle {vehicle_id} references missing patient {patient_id}"
            ))
        })?;
        patient.position.get_or_insert(Position::new(x, origin.y));
    }
    for personnel_id in &personnel_ids {
        x += space;
        let person = draft.personnel.get_mut(personnel_id).ok_or_else(|| {
            ReducerError::unexpected(format!(
                "Vehicle {vehicle_id} references missing personnel {personnel_id}"
            ))
        })?;
        if person.transfer.is_some() {
            continue;
        }
        person.position.get_or_insert(Position::new(x, origin.y));
    }
    for material_id in &material_ids {
        x += space;
        let material = draft.materials.get_mut(material_id).ok_or_else(|| {
            ReducerError::unexpected(format!(
                "Vehicle {vehicle_id} references missing material {material_id}"
            ))
        })?;
        material.position.get_or_insert(Position::new(x, origin.y));
    }
    Ok(())
}

fn load_vehicle(
    draft: &mut ExerciseState,
    vehicle_id: &Uuid,
    kind: LoadableElement,
    element_id: &Uuid,
) -> Result<(), ReducerError> {
    let vehicle = entity(&draft.vehicles, vehicle_id, "Vehicle")?;
    match kind {
        LoadableElement::Material => {
            if !vehicle.material_ids.contains(element_id) {
                entity(&draft.materials, element_id, "Material")?;
                return Err(ReducerError::expected(format!(
                    "Material with id {element_id} is not assignable to the vehicle with id {vehicle_id}"
                )));
            }
            entity_mut(&mut draft.materials, element_id, "Material")?.position = None;
        }
        LoadableElement::Personnel => {
            if !vehicle.personnel_ids.contains(element_id) {
                entity(&draft.personnel, element_id, "Personnel")?;
                return Err(ReducerError::expected(format!(
                    "Personnel with id {element_id} is not assignable to the vehicle with id {vehicle_id}"
                )));
            }
            let person = entity_mut(&mut draft.personnel, element_id, "Personnel")?;
            if person.transfer.is_some() {
                return Err(in_transfer("Personnel", element_id));
            }
            person.position = None;
        }
        LoadableElement::Patient => {
            entity(&draft.patients, element_id, "Patient")?;
            if vehicle.patient_ids.contains(element_id) {
                return Err(ReducerError::expected(format!(
                    "Patient with id {element_id} is already in the vehicle with id {vehicle_id}"
                )));
            }
            if vehicle.patient_ids.len() >= vehicle.patient_capacity as usize {
                return Err(ReducerError::expected(format!(
                    "Vehicle with id {vehicle_id} is already full"
                )));
            }
            let material_ids = vehicle.material_ids.clone();
            let personnel_ids = vehicle.personnel_ids.clone();

            // A patient can only ride in one vehicle at a time.
            for other in draft.vehicles.values_mut() {
                other.patient_ids.remove(element_id);
            }
            entity_mut(&mut draft.vehicles, vehicle_id, "Vehicle")?
                .patient_ids
                .insert(*element_id);
            entity_mut(&mut draft.patients, element_id, "Patient")?.position = None;
            for material_id in &material_ids {
                if let Some(material) = draft.materials.get_mut(material_id) {
                    material.position = None;
                }
            }
            for personnel_id in &personnel_ids {
                if let Some(person) = draft.personnel.get_mut(personnel_id) {
                    if person.transfer.is_none() {
                        person.position = None;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Place every element whose transfer has ended at its target point.
fn complete_transfers(draft: &mut ExerciseState) -> Result<(), ReducerError> {
    let now = draft.current_time_ms;
    let arrived = |transfer: &Option<Transfer>| {
        transfer
            .as_ref()
            .filter(|t| t.end_time_ms <= now)
            .map(|t| t.target_transfer_point_id)
    };
    let vehicles: Vec<(Uuid, Uuid)> = draft
        .vehicles
        .values()
        .filter_map(|v| arrived(&v.transfer).map(|target| (v.id, target)))
        .collect();
    let personnel: Vec<(Uuid, Uuid)> = draft
        .personnel
        .values()
        .filter_map(|p| arrived(&p.transfer).map(|target| (p.id, target)))
        .collect();

    for (vehicle_id, target) in vehicles {
        let position = arrival_position(draft, &target)?;
        let vehicle = entity_mut(&mut draft.vehicles, &vehicle_id, "Vehicle")?;
        vehicle.transfer = None;
        vehicle.position = Some(position);
        if vehicle.unload_on_arrival {
            unload_vehicle(draft, &vehicle_id)?;
        }
    }
    for (personnel_id, target) in personnel {
        let position = arrival_position(draft, &target)?;
        let person = entity_mut(&mut draft.personnel, &personnel_id, "Personnel")?;
        person.transfer = None;
        person.position = Some(position);
    }
    Ok(())
}

fn arrival_position(draft: &ExerciseState, target: &Uuid) -> Result<Position, ReducerError> {
    draft
        .transfer_points
        .get(target)
        .map(|point| point.position)
        .ok_or_else(|| {
            ReducerError::unexpected(format!("Transfer targets missing transfer point {target}"))
        })
}
