//! Simulated exercise cluster
//!
//! Runs several replicas over an in-process network, drives an exercise
//! through them and checks that every replica ends up with the same state.
//!
//! Run with: cargo run --bin exercise-cluster -- --replicas 3 --ticks 5

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::Parser;

use exercise_sync::replication::{RaftRole, SimNetwork};
use exercise_sync::state::{Patient, PatientStatus, Position};
use exercise_sync::{ExerciseAction, ServerConfig, ServerReplica};

#[derive(Parser)]
#[command(name = "exercise-cluster")]
#[command(about = "Run a simulated replicated exercise cluster", long_about = None)]
struct Args {
    /// Number of replicas.
    #[arg(long, default_value_t = 3)]
    replicas: u64,
    /// Ticks to let the exercise run.
    #[arg(long, default_value_t = 5)]
    ticks: u64,
    /// Cut the leader off halfway through and let the cluster fail over.
    #[arg(long, default_value_t = false)]
    failover: bool,
    /// JSON server configuration; defaults apply to missing fields.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.replicas == 0 {
        bail!("need at least one replica");
    }

    let config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };

    let network = SimNetwork::new();
    let ids: Vec<u64> = (1..=args.replicas).collect();
    let replicas: Vec<ServerReplica> = ids
        .iter()
        .map(|id| ServerReplica::raft(ids.clone(), config.clone(), network.endpoint(*id)))
        .collect();
    for replica in &replicas {
        replica.start_ticker();
    }

    let leader = wait_for_leader(&replicas).await?;
    log::info!("replica {leader} leads");

    // Create through one replica, play through another.
    let entry = &replicas[0];
    let player = &replicas[replicas.len() - 1];
    let exercise = entry.lifecycle().create_exercise(None).await?;
    println!(
        "created exercise: trainer {} / participant {}",
        exercise.trainer_id, exercise.participant_id
    );

    let mut trainer = player.connect();
    trainer
        .join_exercise(&exercise.trainer_id, "Trainer", None, None)
        .await?;
    trainer
        .propose_action(
            ExerciseAction::AddPatient {
                patient: Patient {
                    id: uuid::Uuid::new_v4(),
                    identifier: String::new(),
                    status: PatientStatus::Red,
                    position: Some(Position::new(3.0, 4.0)),
                },
            },
            None,
        )
        .await?;
    trainer
        .propose_action(ExerciseAction::StartExercise, None)
        .await?;

    let tick = config.tick_interval();
    let half = args.ticks / 2;
    tokio::time::sleep(tick * half as u32).await;

    if args.failover && replicas.len() > 2 {
        let old = wait_for_leader(&replicas).await?;
        println!("isolating leader {old}");
        network.isolate(old);
        tokio::time::sleep(Duration::from_millis(config.raft.election_timeout_max_ms * 4)).await;
        let new = wait_for_leader_except(&replicas, old).await?;
        println!("replica {new} took over");
        network.heal_all();
    }

    tokio::time::sleep(tick * (args.ticks - half) as u32).await;
    trainer
        .propose_action(ExerciseAction::PauseExercise, None)
        .await?;
    // Let followers apply the final commit.
    tokio::time::sleep(Duration::from_millis(config.raft.heartbeat_interval_ms * 4)).await;

    let mut digests = Vec::new();
    for replica in &replicas {
        let (session, _) = replica
            .registry()
            .get(&exercise.trainer_id)?
            .ok_or_else(|| anyhow!("exercise missing on a replica"))?;
        let state = session.get_state_snapshot()?;
        let node = replica.raft_node().map(|n| n.status());
        println!(
            "replica {:?}: ticks {} time {}ms actions {} digest {}",
            node.map(|s| s.id),
            state.tick_counter,
            state.current_time_ms,
            state.applied_action_count,
            &state.digest()[..16]
        );
        digests.push(state.digest());
    }

    for replica in &replicas {
        replica.shutdown().await;
    }

    if digests.windows(2).all(|pair| pair[0] == pair[1]) {
        println!("all replicas agree");
        Ok(())
    } else {
        bail!("replicas diverged")
    }
}

async fn wait_for_leader(replicas: &[ServerReplica]) -> anyhow::Result<u64> {
    wait_for_leader_except(replicas, 0).await
}

async fn wait_for_leader_except(replicas: &[ServerReplica], excluded: u64) -> anyhow::Result<u64> {
    for _ in 0..100 {
        let leader = replicas
            .iter()
            .filter_map(|r| r.raft_node())
            .map(|n| n.status())
            .find(|s| s.role == RaftRole::Leader && s.id != excluded);
        if let Some(status) = leader {
            return Ok(status.id);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("no leader elected")
}
