//! Who may propose which action.

use crate::state::{Client, ExerciseAction, ExerciseState, Role};

/// The least privileged caller allowed to propose an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Right {
    /// Only the server itself (ticks, client bookkeeping).
    Server,
    Trainer,
    Participant,
}

/// Static rights required by each action kind.
pub fn required_rights(action: &ExerciseAction) -> Right {
    match action {
        ExerciseAction::Tick { .. } | ExerciseAction::AddClient { .. } => Right::Server,

        ExerciseAction::StartExercise
        | ExerciseAction::PauseExercise
        | ExerciseAction::SetWaitingRoom { .. }
        | ExerciseAction::AddViewport { .. }
        | ExerciseAction::MoveViewport { .. }
        | ExerciseAction::RemoveViewport { .. }
        | ExerciseAction::AddVehicle { .. }
        | ExerciseAction::RenameVehicle { .. }
        | ExerciseAction::RemoveVehicle { .. }
        | ExerciseAction::SetVehicleUnloadOnArrival { .. }
        | ExerciseAction::RemovePersonnel { .. }
        | ExerciseAction::RemoveMaterial { .. }
        | ExerciseAction::AddPatient { .. }
        | ExerciseAction::RemovePatient { .. }
        | ExerciseAction::AddTransferPoint { .. }
        | ExerciseAction::MoveTransferPoint { .. }
        | ExerciseAction::RenameTransferPoint { .. }
        | ExerciseAction::RemoveTransferPoint { .. }
        | ExerciseAction::ConnectTransferPoints { .. }
        | ExerciseAction::DisconnectTransferPoints { .. }
        | ExerciseAction::AddHospital { .. }
        | ExerciseAction::RemoveHospital { .. }
        | ExerciseAction::SetPretriageEnabled { .. }
        | ExerciseAction::SetBluePatientsEnabled { .. }
        | ExerciseAction::SetPatientIdentifierPrefix { .. } => Right::Trainer,

        ExerciseAction::RemoveClient { .. }
        | ExerciseAction::RestrictViewToViewport { .. }
        | ExerciseAction::MoveVehicle { .. }
        | ExerciseAction::UnloadVehicle { .. }
        | ExerciseAction::LoadVehicle { .. }
        | ExerciseAction::TransferVehicle { .. }
        | ExerciseAction::MovePersonnel { .. }
        | ExerciseAction::TransferPersonnel { .. }
        | ExerciseAction::MoveMaterial { .. }
        | ExerciseAction::MovePatient { .. }
        | ExerciseAction::SetPatientStatus { .. }
        | ExerciseAction::TransportPatientToHospital { .. } => Right::Participant,
    }
}

/// May `client` propose `action` against `state`?
///
/// Combines the static rights with per-instance ownership rules: only an
/// unrestricted trainer may act on another client's restriction or session,
/// and nobody in the waiting room may act at all. The committed record of
/// the client is what counts; clients missing from `state` may do nothing.
pub fn validate_permissions(client: &Client, action: &ExerciseAction, state: &ExerciseState) -> bool {
    let Some(current) = state.clients.get(&client.id) else {
        return false;
    };
    if current.is_in_waiting_room {
        return false;
    }

    let allowed = match required_rights(action) {
        Right::Server => false,
        Right::Trainer => current.role == Role::Trainer,
        Right::Participant => true,
    };
    if !allowed {
        return false;
    }

    match action {
        ExerciseAction::RemoveClient { client_id }
        | ExerciseAction::RestrictViewToViewport { client_id, .. } => {
            *client_id == current.id
                || (current.role == Role::Trainer
                    && current.view_restricted_to_viewport_id.is_none())
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn state_with(clients: &[&Client]) -> ExerciseState {
        let mut state = ExerciseState::new();
        for client in clients {
            state.clients.insert(client.id, (*client).clone());
        }
        state
    }

    #[test]
    fn participant_cannot_run_trainer_actions() {
        let participant = Client::new("p", Role::Participant, None);
        let state = state_with(&[&participant]);
        assert!(!validate_permissions(
            &participant,
            &ExerciseAction::StartExercise,
            &state
        ));
        assert!(validate_permissions(
            &participant,
            &ExerciseAction::MoveVehicle {
                vehicle_id: Uuid::new_v4(),
                target_position: crate::state::Position::new(0.0, 0.0),
            },
            &state
        ));
    }

    #[test]
    fn nobody_may_tick_on_behalf_of_the_server() {
        let trainer = Client::new("t", Role::Trainer, None);
        let state = state_with(&[&trainer]);
        assert!(!validate_permissions(
            &trainer,
            &ExerciseAction::Tick {
                tick_interval_ms: 1000
            },
            &state
        ));
    }

    #[test]
    fn participants_only_manage_their_own_viewport() {
        let participant = Client::new("p", Role::Participant, None);
        let other = Client::new("o", Role::Participant, None);
        let trainer = Client::new("t", Role::Trainer, None);
        let state = state_with(&[&participant, &other, &trainer]);

        let restrict = |client_id| ExerciseAction::RestrictViewToViewport {
            client_id,
            viewport_id: None,
        };
        assert!(validate_permissions(&participant, &restrict(participant.id), &state));
        assert!(!validate_permissions(&participant, &restrict(other.id), &state));
        assert!(validate_permissions(&trainer, &restrict(other.id), &state));
    }

    #[test]
    fn restricted_trainer_leaves_other_restrictions_alone() {
        let trainer = Client::new("t", Role::Trainer, Some(Uuid::new_v4()));
        let other = Client::new("o", Role::Participant, Some(Uuid::new_v4()));
        let state = state_with(&[&trainer, &other]);

        let lift = |client_id| ExerciseAction::RestrictViewToViewport {
            client_id,
            viewport_id: None,
        };
        assert!(!validate_permissions(&trainer, &lift(other.id), &state));
        assert!(!validate_permissions(
            &trainer,
            &ExerciseAction::RemoveClient { client_id: other.id },
            &state
        ));
        // Its own restriction is still its to change.
        assert!(validate_permissions(&trainer, &lift(trainer.id), &state));
    }

    #[test]
    fn unknown_client_may_do_nothing() {
        let trainer = Client::new("t", Role::Trainer, None);
        let state = ExerciseState::new();
        assert!(!validate_permissions(
            &trainer,
            &ExerciseAction::PauseExercise,
            &state
        ));
    }

    #[test]
    fn waiting_room_uses_the_committed_client_record() {
        let mut participant = Client::new("p", Role::Participant, None);
        let stale = participant.clone();
        participant.is_in_waiting_room = true;
        let state = state_with(&[&participant]);

        assert!(!validate_permissions(
            &stale,
            &ExerciseAction::UnloadVehicle {
                vehicle_id: Uuid::new_v4()
            },
            &state
        ));
    }
}
