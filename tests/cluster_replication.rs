//! Multi-replica behaviour over the simulated network.

use std::sync::Arc;
use std::time::Duration;

use exercise_sync::gateway::ServerEvent;
use exercise_sync::replication::{
    ApplyOutcome, LogCommand, LogRequest, RaftRole, ReplicatedLog, SimNetwork,
};
use exercise_sync::state::{ExerciseStatus, Patient, PatientStatus, Position};
use exercise_sync::{ExerciseAction, ExerciseState, ServerConfig, ServerReplica};
use uuid::Uuid;

fn cluster(size: u64, config: ServerConfig) -> (Arc<SimNetwork>, Vec<ServerReplica>) {
    let network = SimNetwork::new();
    let ids: Vec<u64> = (1..=size).collect();
    let replicas = ids
        .iter()
        .map(|id| ServerReplica::raft(ids.clone(), config.clone(), network.endpoint(*id)))
        .collect();
    (network, replicas)
}

/// Index of the current leader, skipping `excluded`.
async fn leader(replicas: &[ServerReplica], excluded: Option<usize>) -> usize {
    for _ in 0..200 {
        let found = replicas.iter().enumerate().find(|(i, r)| {
            Some(*i) != excluded
                && r.raft_node().map(|n| n.status().role) == Some(RaftRole::Leader)
        });
        if let Some((i, _)) = found {
            return i;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no leader elected");
}

/// Wait until every replica holds the same state for `exercise_id`.
async fn converged(replicas: &[ServerReplica], exercise_id: &str) -> ExerciseState {
    for _ in 0..200 {
        let states: Vec<Option<ExerciseState>> = replicas
            .iter()
            .map(|r| {
                r.registry()
                    .get(exercise_id)
                    .unwrap()
                    .map(|(session, _)| session.get_state_snapshot().unwrap())
            })
            .collect();
        if let Some(Some(first)) = states.first() {
            if states
                .iter()
                .all(|s| s.as_ref().map(ExerciseState::digest) == Some(first.digest()))
            {
                return first.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("replicas did not converge");
}

async fn shutdown(replicas: &[ServerReplica]) {
    for replica in replicas {
        replica.shutdown().await;
    }
}

fn red_patient() -> ExerciseAction {
    ExerciseAction::AddPatient {
        patient: Patient {
            id: Uuid::new_v4(),
            identifier: String::new(),
            status: PatientStatus::Red,
            position: Some(Position::new(1.0, 2.0)),
        },
    }
}

#[tokio::test(start_paused = true)]
async fn replicas_converge_on_the_same_state() {
    let (_network, replicas) = cluster(3, ServerConfig::default());
    let leader_index = leader(&replicas, None).await;
    let follower_index = (leader_index + 1) % 3;

    let ids = replicas[follower_index]
        .lifecycle()
        .create_exercise(None)
        .await
        .unwrap();

    let mut trainer = replicas[0].connect();
    trainer
        .join_exercise(&ids.trainer_id, "Trainer", None, None)
        .await
        .unwrap();
    let mut participant = replicas[2].connect();
    participant
        .join_exercise(&ids.participant_id, "Participant", None, None)
        .await
        .unwrap();

    trainer.propose_action(red_patient(), None).await.unwrap();
    trainer
        .propose_action(ExerciseAction::StartExercise, None)
        .await
        .unwrap();

    assert_eq!(replicas[follower_index].tick_once().await, 0);
    assert_eq!(replicas[leader_index].tick_once().await, 1);
    assert_eq!(replicas[leader_index].tick_once().await, 1);

    let state = converged(&replicas, &ids.trainer_id).await;
    assert_eq!(state.status, ExerciseStatus::Running);
    assert_eq!(state.tick_counter, 2);
    assert_eq!(state.patients.len(), 1);
    assert_eq!(state.clients.len(), 2);

    // The participant saw every commit after its join, in order.
    let mut indices = Vec::new();
    while let Some(event) = participant.try_next_event() {
        if let ServerEvent::PerformAction { index, .. } = event {
            indices.push(index);
        }
    }
    assert!(!indices.is_empty());
    assert!(indices.windows(2).all(|pair| pair[1] == pair[0] + 1));
    assert_eq!(indices.last().copied(), Some(state.applied_action_count));

    shutdown(&replicas).await;
}

#[tokio::test(start_paused = true)]
async fn proposal_survives_leader_failover() {
    let (network, replicas) = cluster(3, ServerConfig::default());
    let old_leader = leader(&replicas, None).await;
    let entry = (old_leader + 1) % 3;

    let ids = replicas[entry].lifecycle().create_exercise(None).await.unwrap();
    let mut trainer = replicas[entry].connect();
    trainer
        .join_exercise(&ids.trainer_id, "Trainer", None, None)
        .await
        .unwrap();
    converged(&replicas, &ids.trainer_id).await;

    network.isolate(old_leader as u64 + 1);
    let committed = trainer
        .propose_action(ExerciseAction::StartExercise, None)
        .await
        .unwrap();
    let new_leader = leader(&replicas, Some(old_leader)).await;
    assert_ne!(new_leader, old_leader);

    network.heal_all();
    let state = converged(&replicas, &ids.trainer_id).await;
    assert_eq!(state.status, ExerciseStatus::Running);
    assert_eq!(state.applied_action_count, committed.index);

    let history = replicas[old_leader].lifecycle().history(&ids.trainer_id).unwrap();
    let starts = history
        .actions
        .iter()
        .filter(|a| matches!(a, ExerciseAction::StartExercise))
        .count();
    assert_eq!(starts, 1);

    let status = replicas[old_leader]
        .raft_node()
        .unwrap()
        .wait_until(|s| s.role == RaftRole::Follower && s.leader_id.is_some())
        .await
        .unwrap();
    assert_eq!(status.leader_id, Some(new_leader as u64 + 1));

    shutdown(&replicas).await;
}

#[tokio::test(start_paused = true)]
async fn resubmitted_request_applies_once() {
    let (_network, replicas) = cluster(3, ServerConfig::default());
    leader(&replicas, None).await;
    let ids = replicas[0].lifecycle().create_exercise(None).await.unwrap();

    let request = LogRequest::new(LogCommand::ProposeAction {
        exercise_id: ids.trainer_id.clone(),
        client_id: None,
        action_id: None,
        action: ExerciseAction::StartExercise,
    });
    let first = replicas[1].log().submit(request.clone()).await.unwrap();
    let second = replicas[2].log().submit(request).await.unwrap();
    assert!(matches!(first, ApplyOutcome::Applied { .. }));
    assert_eq!(first, second);

    let state = converged(&replicas, &ids.trainer_id).await;
    assert_eq!(state.applied_action_count, 1);

    shutdown(&replicas).await;
}

#[tokio::test(start_paused = true)]
async fn lagging_replica_catches_up_from_snapshot() {
    let mut config = ServerConfig::default();
    config.raft.snapshot_threshold = 4;
    let (network, replicas) = cluster(3, config);
    let leader_index = leader(&replicas, None).await;
    let laggard = (leader_index + 1) % 3;

    let ids = replicas[leader_index]
        .lifecycle()
        .create_exercise(None)
        .await
        .unwrap();
    let mut watcher = replicas[laggard].connect();
    watcher
        .join_exercise(&ids.participant_id, "Watcher", None, None)
        .await
        .unwrap();
    converged(&replicas, &ids.trainer_id).await;
    while watcher.try_next_event().is_some() {}

    network.isolate(laggard as u64 + 1);
    let mut trainer = replicas[leader_index].connect();
    trainer
        .join_exercise(&ids.trainer_id, "Trainer", None, None)
        .await
        .unwrap();
    trainer
        .propose_action(ExerciseAction::StartExercise, None)
        .await
        .unwrap();
    for _ in 0..8 {
        assert_eq!(replicas[leader_index].tick_once().await, 1);
    }
    let leader_status = replicas[leader_index].raft_node().unwrap().status();
    assert!(leader_status.snapshot_index > 0);

    network.heal_all();
    let lagging_status = replicas[laggard]
        .raft_node()
        .unwrap()
        .wait_until(|s| s.snapshot_index > 0)
        .await
        .unwrap();
    assert_eq!(lagging_status.role, RaftRole::Follower);

    let state = converged(&replicas, &ids.trainer_id).await;
    assert_eq!(state.tick_counter, 8);

    // The snapshot replaced the watcher's state wholesale.
    let mut saw_reset = false;
    while let Some(event) = watcher.try_next_event() {
        if let ServerEvent::StateReset { state: reset } = event {
            assert!(reset.tick_counter > 0);
            saw_reset = true;
        }
    }
    assert!(saw_reset);

    shutdown(&replicas).await;
}
