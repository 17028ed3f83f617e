//! One server replica, fully wired
//!
//! Bundles the registry, the replicated log and the background tasks a
//! server runs: the leader-only exercise ticker and the persistence loop.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ServerConfig;
use crate::gateway::ClientGateway;
use crate::lifecycle::ExerciseService;
use crate::replication::{
    ApplyOutcome, ExerciseStateMachine, LocalLog, LogCommand, LogRequest, NodeId, PendingRequests,
    RaftReplica, RaftTransport, ReplicatedLog,
};
use crate::session::{ExerciseRegistry, PersistenceError, SnapshotStore};
use crate::state::ExerciseAction;

pub struct ServerReplica {
    config: ServerConfig,
    registry: Arc<ExerciseRegistry>,
    log: Arc<dyn ReplicatedLog>,
    raft: Option<Arc<RaftReplica>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerReplica {
    fn machine(config: &ServerConfig, registry: &Arc<ExerciseRegistry>) -> ExerciseStateMachine {
        ExerciseStateMachine::new(Arc::clone(registry), PendingRequests::new(), config.dedup_window)
    }

    /// A single server without peers.
    pub fn standalone(config: ServerConfig) -> Self {
        let registry = Arc::new(ExerciseRegistry::new(config.pending_exercises.clone()));
        let log: Arc<dyn ReplicatedLog> = Arc::new(LocalLog::new(Self::machine(&config, &registry)));
        Self {
            config,
            registry,
            log,
            raft: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A member of a Raft cluster. `peers` lists every member, this one
    /// included or not.
    pub fn raft(
        peers: Vec<NodeId>,
        config: ServerConfig,
        transport: impl RaftTransport + 'static,
    ) -> Self {
        let registry = Arc::new(ExerciseRegistry::new(config.pending_exercises.clone()));
        let node = Arc::new(RaftReplica::spawn(
            peers,
            config.clone(),
            Self::machine(&config, &registry),
            transport,
        ));
        let log: Arc<dyn ReplicatedLog> = Arc::clone(&node) as Arc<dyn ReplicatedLog>;
        Self {
            config,
            registry,
            log,
            raft: Some(node),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ExerciseRegistry> {
        &self.registry
    }

    pub fn log(&self) -> &Arc<dyn ReplicatedLog> {
        &self.log
    }

    pub fn raft_node(&self) -> Option<&Arc<RaftReplica>> {
        self.raft.as_ref()
    }

    /// A gateway for a new client connection.
    pub fn connect(&self) -> ClientGateway {
        ClientGateway::new(Arc::clone(&self.registry), Arc::clone(&self.log))
    }

    pub fn lifecycle(&self) -> ExerciseService {
        ExerciseService::new(Arc::clone(&self.registry), Arc::clone(&self.log))
    }

    /// Propose a tick for every running exercise, on the leader only.
    pub async fn tick_once(&self) -> usize {
        tick_running(&self.registry, &self.log, self.config.tick_interval_ms).await
    }

    /// Start the periodic ticker. Followers keep the task running but stay
    /// silent until they become leader.
    pub fn start_ticker(&self) {
        let registry = Arc::clone(&self.registry);
        let log = Arc::clone(&self.log);
        let tick_interval_ms = self.config.tick_interval_ms;
        let period = self.config.tick_interval();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                tick_running(&registry, &log, tick_interval_ms).await;
            }
        });
        self.track(task);
    }

    /// Load exercises persisted by an earlier run. Only meaningful for a
    /// standalone replica: cluster members rebuild their state from the log.
    pub fn load_persisted(&self, store: &dyn SnapshotStore) -> Result<usize, PersistenceError> {
        if self.raft.is_some() {
            log::warn!("ignoring persisted exercises: state comes from the replicated log");
            return Ok(0);
        }
        self.registry
            .load_from(store)
            .map_err(|e| PersistenceError::SyncError(e.to_string()))
    }

    /// Periodically save changed exercises to `store`.
    pub fn start_persistence(&self, store: Arc<dyn SnapshotStore>) {
        let registry = Arc::clone(&self.registry);
        let period = self.config.persistence.save_interval();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match registry.save_dirty(store.as_ref()) {
                    Ok(0) => {}
                    Ok(saved) => log::debug!("saved {saved} exercises"),
                    Err(e) => log::warn!("failed to save exercises: {e}"),
                }
            }
        });
        self.track(task);
    }

    /// Stop background tasks and the consensus driver.
    pub async fn shutdown(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(e) => {
                log::error!("task list lock poisoned: {e}");
                Vec::new()
            }
        };
        for task in tasks {
            task.abort();
        }
        if let Some(node) = &self.raft {
            node.shutdown().await;
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(e) => log::error!("task list lock poisoned: {e}"),
        }
    }
}

async fn tick_running(
    registry: &ExerciseRegistry,
    log: &Arc<dyn ReplicatedLog>,
    tick_interval_ms: u64,
) -> usize {
    if !log.is_leader() {
        return 0;
    }
    let sessions = match registry.running_sessions() {
        Ok(sessions) => sessions,
        Err(e) => {
            log::error!("cannot list running exercises: {e}");
            return 0;
        }
    };

    let mut ticked = 0;
    for session in sessions {
        let request = LogRequest::new(LogCommand::ProposeAction {
            exercise_id: session.trainer_id().to_string(),
            client_id: None,
            action_id: None,
            action: ExerciseAction::Tick { tick_interval_ms },
        });
        match log.submit(request).await {
            Ok(ApplyOutcome::Applied { .. }) => ticked += 1,
            // Paused or deleted since we looked.
            Ok(outcome) => log::debug!("{}: tick not applied: {outcome:?}", session.trainer_id()),
            Err(e) => log::warn!("{}: tick failed: {e}", session.trainer_id()),
        }
    }
    ticked
}
