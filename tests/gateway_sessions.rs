//! Client sessions through the gateway: disconnects mid-proposal,
//! re-joins and authorization.
//!
//! Run with:
//!   cargo test --test gateway_sessions

use std::sync::Arc;
use std::time::Duration;

use exercise_sync::gateway::{ClientRequest, GatewayError, ServerEvent, SocketResponse};
use exercise_sync::replication::{
    ApplyOutcome, LogCommand, LogRequest, RaftRole, ReplicatedLog, SimNetwork,
};
use exercise_sync::state::{ExerciseStatus, Position, Role, Viewport};
use exercise_sync::{ExerciseAction, ServerConfig, ServerReplica};
use serde_json::json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn cluster(size: u64) -> (Arc<SimNetwork>, Vec<ServerReplica>) {
    let network = SimNetwork::new();
    let ids: Vec<u64> = (1..=size).collect();
    let replicas = ids
        .iter()
        .map(|id| {
            ServerReplica::raft(ids.clone(), ServerConfig::default(), network.endpoint(*id))
        })
        .collect();
    (network, replicas)
}

async fn wait_for_leader(replicas: &[ServerReplica]) -> usize {
    for _ in 0..200 {
        if let Some(i) = replicas
            .iter()
            .position(|r| r.raft_node().map(|n| n.status().role) == Some(RaftRole::Leader))
        {
            return i;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no leader elected");
}

async fn wait_for_count(replica: &ServerReplica, exercise_id: &str, count: u64) {
    for _ in 0..200 {
        let (session, _) = replica.registry().get(exercise_id).unwrap().unwrap();
        if session.get_state_snapshot().unwrap().applied_action_count >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("replica never reached {count} applied actions");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_before_ack_still_commits_exactly_once() {
    let (_network, replicas) = cluster(3);
    let leader = wait_for_leader(&replicas).await;
    let follower = (leader + 1) % 3;
    let observer_replica = (leader + 2) % 3;

    let ids = replicas[leader].lifecycle().create_exercise(None).await.unwrap();
    let mut trainer = replicas[follower].connect();
    trainer
        .join_exercise(&ids.trainer_id, "Trainer", None, None)
        .await
        .unwrap();

    // One poll hands the proposal to the consensus driver; the answer can
    // only come after the cluster has run, so the timeout fires first.
    let action_id = Uuid::new_v4();
    let answered = tokio::time::timeout(
        Duration::ZERO,
        trainer.propose_action(ExerciseAction::StartExercise, Some(action_id)),
    )
    .await;
    assert!(answered.is_err());
    drop(trainer);

    let mut observer = replicas[observer_replica].connect();
    observer
        .join_exercise(&ids.trainer_id, "Observer", None, None)
        .await
        .unwrap();
    wait_for_count(&replicas[observer_replica], &ids.trainer_id, 3).await;

    let diff = observer.get_state_diff(0).unwrap();
    let proposed: Vec<_> = diff
        .iter()
        .filter(|c| c.action_id == Some(action_id))
        .collect();
    assert_eq!(proposed.len(), 1);
    assert!(matches!(proposed[0].action, ExerciseAction::StartExercise));

    for replica in &replicas {
        replica.shutdown().await;
    }
}

#[tokio::test]
async fn rejoin_with_known_client_id_reattaches() {
    let replica = ServerReplica::standalone(ServerConfig::default());
    let ids = replica.lifecycle().create_exercise(None).await.unwrap();

    let mut first = replica.connect();
    let joined = first
        .join_exercise(&ids.participant_id, "Pat", None, None)
        .await
        .unwrap();
    drop(first);

    let mut second = replica.connect();
    let rejoined = second
        .join_exercise(&ids.participant_id, "Pat", Some(joined.client_id), None)
        .await
        .unwrap();
    let mut third = replica.connect();
    let again = third
        .join_exercise(&ids.participant_id, "Pat", Some(joined.client_id), None)
        .await
        .unwrap();

    assert_eq!(rejoined.client_id, joined.client_id);
    assert_eq!(again.client_id, joined.client_id);
    assert_eq!(again.state.clients.len(), 1);
    // Re-attaching proposes nothing.
    assert_eq!(
        again.state.applied_action_count,
        joined.state.applied_action_count
    );
}

#[tokio::test]
async fn rejoin_with_new_viewport_updates_the_restriction() {
    let replica = ServerReplica::standalone(ServerConfig::default());
    let ids = replica.lifecycle().create_exercise(None).await.unwrap();

    let mut first = replica.connect();
    let joined = first
        .join_exercise(&ids.trainer_id, "Tina", None, None)
        .await
        .unwrap();
    let viewport_id = Uuid::new_v4();
    first
        .propose_action(
            ExerciseAction::AddViewport {
                viewport: Viewport {
                    id: viewport_id,
                    name: "Sector A".to_string(),
                    top_left: Position::new(0.0, 10.0),
                    width: 10.0,
                    height: 10.0,
                },
            },
            None,
        )
        .await
        .unwrap();
    drop(first);

    let mut second = replica.connect();
    let rejoined = second
        .join_exercise(&ids.trainer_id, "Tina", Some(joined.client_id), Some(viewport_id))
        .await
        .unwrap();
    let client = &rejoined.state.clients[&joined.client_id];
    assert_eq!(client.view_restricted_to_viewport_id, Some(viewport_id));
    assert_eq!(second.view_restriction(), Some(viewport_id));
}

#[tokio::test]
async fn unknown_client_id_joins_as_a_new_client() {
    let replica = ServerReplica::standalone(ServerConfig::default());
    let ids = replica.lifecycle().create_exercise(None).await.unwrap();

    let stale = Uuid::new_v4();
    let mut gateway = replica.connect();
    let joined = gateway
        .join_exercise(&ids.participant_id, "Pat", Some(stale), None)
        .await
        .unwrap();
    assert_ne!(joined.client_id, stale);
    assert_eq!(joined.state.clients[&joined.client_id].role, Role::Participant);
}

#[tokio::test]
async fn participant_cannot_run_trainer_actions() {
    let replica = ServerReplica::standalone(ServerConfig::default());
    let ids = replica.lifecycle().create_exercise(None).await.unwrap();
    let mut participant = replica.connect();
    let joined = participant
        .join_exercise(&ids.participant_id, "Pat", None, None)
        .await
        .unwrap();

    let response = participant
        .handle(ClientRequest::ProposeAction {
            action: json!({ "type": "[Exercise] Start" }),
            action_id: None,
        })
        .await;
    match response {
        SocketResponse::Failure { expected, .. } => assert!(expected),
        other => panic!("expected a failure, got {other:?}"),
    }

    // Bypassing the gateway does not help: the apply step checks again.
    let outcome = replica
        .log()
        .submit(LogRequest::new(LogCommand::ProposeAction {
            exercise_id: ids.participant_id.clone(),
            client_id: Some(joined.client_id),
            action_id: None,
            action: ExerciseAction::StartExercise,
        }))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ApplyOutcome::Rejected { expected: true, .. }
    ));

    let (session, _) = replica.registry().get(&ids.trainer_id).unwrap().unwrap();
    let state = session.get_state_snapshot().unwrap();
    assert_eq!(state.status, ExerciseStatus::NotStarted);
    assert_eq!(state.applied_action_count, joined.state.applied_action_count);
}

#[tokio::test]
async fn clients_cannot_inject_server_actions() {
    let replica = ServerReplica::standalone(ServerConfig::default());
    let ids = replica.lifecycle().create_exercise(None).await.unwrap();
    let mut trainer = replica.connect();
    trainer
        .join_exercise(&ids.trainer_id, "Tina", None, None)
        .await
        .unwrap();

    let err = trainer
        .propose_action(
            ExerciseAction::Tick {
                tick_interval_ms: 1_000,
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::PermissionDenied(_)));
    assert!(err.is_expected());
}

#[tokio::test(start_paused = true)]
async fn deleting_the_exercise_notifies_joined_clients() {
    let replica = ServerReplica::standalone(ServerConfig::default());
    let ids = replica.lifecycle().create_exercise(None).await.unwrap();
    let mut participant = replica.connect();
    participant
        .join_exercise(&ids.participant_id, "Pat", None, None)
        .await
        .unwrap();

    replica.lifecycle().delete_exercise(&ids.trainer_id).await.unwrap();
    assert_eq!(
        participant.next_event().await,
        Some(ServerEvent::ExerciseDeleted)
    );
    assert_eq!(participant.next_event().await, None);

    let err = replica
        .connect()
        .join_exercise(&ids.participant_id, "Late", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ExerciseNotFound(_)));
}
