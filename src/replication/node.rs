//! Async driver for a Raft replica
//!
//! Owns a [`RaftCore`] inside a spawned task, feeding it timer ticks,
//! frames from a [`RaftTransport`] and local proposals. Callers interact
//! through [`RaftReplica`], which implements [`ReplicatedLog`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::command::{ApplyOutcome, LogRequest};
use super::message::Envelope;
use super::network::{RaftTransport, TransportError};
use super::pending::PendingRequests;
use super::raft::{RaftCore, RaftRole, RaftStatus};
use super::state_machine::ExerciseStateMachine;
use super::{NodeId, ReplicatedLog, ReplicationError};
use crate::config::ServerConfig;

enum Control {
    Propose {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), ReplicationError>>,
    },
    Shutdown,
}

enum Event {
    Timer,
    Frame(Result<Vec<u8>, TransportError>),
    Control(Option<Control>),
}

pub struct RaftReplica {
    id: NodeId,
    config: ServerConfig,
    control: mpsc::Sender<Control>,
    status: watch::Receiver<RaftStatus>,
    pending: Arc<PendingRequests>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RaftReplica {
    /// Start a replica. `peers` lists every cluster member; the local id is
    /// taken from the transport.
    pub fn spawn(
        peers: Vec<NodeId>,
        config: ServerConfig,
        machine: ExerciseStateMachine,
        transport: impl RaftTransport + 'static,
    ) -> Self {
        let id = transport.local_id();
        let pending = Arc::clone(machine.pending());
        let core = RaftCore::new(id, peers, config.raft.clone(), machine, Instant::now());
        let (status_tx, status) = watch::channel(core.status());
        let (control, control_rx) = mpsc::channel(256);

        let task = tokio::spawn(run(core, Box::new(transport), control_rx, status_tx));
        log::info!("node {id}: replica started");

        Self {
            id,
            config,
            control,
            status,
            pending,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.status.borrow().leader_id
    }

    /// Wait until the consensus status satisfies `predicate`.
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&RaftStatus) -> bool,
    ) -> Result<RaftStatus, ReplicationError> {
        let mut status = self.status.clone();
        loop {
            {
                let current = status.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            status
                .changed()
                .await
                .map_err(|_| ReplicationError::ShutDown)?;
        }
    }

    /// Stop the driver task and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown).await;
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(e) => {
                log::error!("node {}: task lock poisoned: {e}", self.id);
                None
            }
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("node {}: driver task failed: {e}", self.id);
            }
        }
    }

    async fn propose(&self, payload: Vec<u8>) -> Result<(), ReplicationError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Propose { payload, reply })
            .await
            .map_err(|_| ReplicationError::ShutDown)?;
        rx.await.map_err(|_| ReplicationError::ShutDown)?
    }

    /// How long to wait for an accepted proposal before offering it again.
    /// Forwarded proposals are lost when leadership changes on the way.
    fn resubmit_interval(&self) -> Duration {
        Duration::from_millis(self.config.raft.election_timeout_max_ms * 2)
    }
}

#[async_trait]
impl ReplicatedLog for RaftReplica {
    async fn submit(&self, request: LogRequest) -> Result<ApplyOutcome, ReplicationError> {
        let payload = request.encode()?;
        let mut response = self.pending.register(request.request_id)?;
        let deadline = Instant::now() + self.config.propose_timeout();

        loop {
            let wait = match self.propose(payload.clone()).await {
                Ok(()) => self.resubmit_interval(),
                Err(ReplicationError::NoLeader) | Err(ReplicationError::NotLeader { .. }) => {
                    self.config.propose_retry()
                }
                Err(e) => return Err(e),
            };

            let until = (Instant::now() + wait).min(deadline);
            match tokio::time::timeout_at(until, response.recv()).await {
                Ok(outcome) => return outcome,
                Err(_) if Instant::now() >= deadline => {
                    log::warn!(
                        "node {}: request {} timed out",
                        self.id,
                        request.request_id
                    );
                    return Err(ReplicationError::Timeout);
                }
                Err(_) => log::debug!(
                    "node {}: request {} not applied yet, proposing again",
                    self.id,
                    request.request_id
                ),
            }
        }
    }

    fn is_leader(&self) -> bool {
        self.status.borrow().role == RaftRole::Leader
    }
}

async fn run(
    mut core: RaftCore<ExerciseStateMachine>,
    transport: Box<dyn RaftTransport>,
    mut control: mpsc::Receiver<Control>,
    status: watch::Sender<RaftStatus>,
) {
    let id = core.id();
    loop {
        let event = tokio::select! {
            _ = tokio::time::sleep_until(core.next_deadline()) => Event::Timer,
            frame = transport.recv() => Event::Frame(frame),
            command = control.recv() => Event::Control(command),
        };

        let now = Instant::now();
        match event {
            Event::Timer => core.tick(now),
            Event::Frame(Ok(frame)) => match Envelope::from_cbor(&frame) {
                Ok(envelope) if envelope.to == id => core.step(envelope.from, envelope.message, now),
                Ok(envelope) => log::warn!("node {id}: frame addressed to {}", envelope.to),
                Err(e) => log::warn!("node {id}: dropping frame: {e}"),
            },
            Event::Frame(Err(e)) => {
                log::error!("node {id}: transport failed: {e}");
                break;
            }
            Event::Control(Some(Control::Propose { payload, reply })) => {
                let _ = reply.send(core.propose(payload));
            }
            Event::Control(Some(Control::Shutdown)) | Event::Control(None) => break,
        }

        for envelope in core.take_messages() {
            let to = envelope.to;
            match envelope.to_cbor() {
                Ok(frame) => {
                    if let Err(e) = transport.send(to, frame).await {
                        log::debug!("node {id}: send to {to} failed: {e}");
                    }
                }
                Err(e) => log::error!("node {id}: {e}"),
            }
        }

        let current = core.status();
        status.send_if_modified(|published| {
            if *published == current {
                false
            } else {
                *published = current;
                true
            }
        });
    }
    log::info!("node {id}: replica stopped");
}
