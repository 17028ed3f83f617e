//! Per-connection session gateway
//!
//! One [`ClientGateway`] serves one client connection. Every state change it
//! requests (joining, proposing, leaving) goes through the replicated log;
//! the gateway itself only reads committed session state and relays the
//! session's commit stream to its client.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

use super::error::GatewayError;
use super::protocol::{ClientRequest, JoinResponse, ServerEvent, SocketResponse};
use crate::permission::{decode_action, validate_permissions, validate_shape, ValidationIssue};
use crate::replication::{ApplyOutcome, LogCommand, LogRequest, ReplicatedLog};
use crate::session::{CommittedAction, ExerciseRegistry, ExerciseSession, RegistryError, SessionEvent};
use crate::state::{Client, ExerciseAction};

struct Joined {
    session: Arc<ExerciseSession>,
    client_id: Uuid,
    view_restriction: Option<Uuid>,
    events: broadcast::Receiver<SessionEvent>,
    /// Applied action count of the last state or action sent to the client.
    last_index: u64,
    backlog: VecDeque<ServerEvent>,
    deleted: bool,
}

impl Joined {
    fn on_event(&mut self, event: SessionEvent) -> Option<ServerEvent> {
        match event {
            SessionEvent::Committed(committed) => {
                // Already part of the snapshot the client joined with.
                if committed.index <= self.last_index {
                    return None;
                }
                self.last_index = committed.index;
                Some(committed.into())
            }
            SessionEvent::Reset(state) => {
                self.last_index = state.applied_action_count;
                Some(ServerEvent::StateReset { state: *state })
            }
            SessionEvent::Deleted => {
                self.deleted = true;
                Some(ServerEvent::ExerciseDeleted)
            }
        }
    }

    /// The broadcast buffer overflowed: fill the gap from the history.
    fn on_lagged(&mut self, skipped: u64) {
        log::warn!(
            "{}: client {} lagged by {skipped} events, re-reading history",
            self.session.trainer_id(),
            self.client_id
        );
        match self.session.get_state_diff(self.last_index) {
            Ok(missed) => {
                for committed in missed {
                    self.last_index = committed.index;
                    self.backlog.push_back(committed.into());
                }
            }
            Err(_) => match self.session.get_state_snapshot() {
                Ok(state) => {
                    self.last_index = state.applied_action_count;
                    self.backlog.push_back(ServerEvent::StateReset { state });
                }
                Err(e) => log::error!("{}: cannot resync client: {e}", self.session.trainer_id()),
            },
        }
    }
}

pub struct ClientGateway {
    registry: Arc<ExerciseRegistry>,
    log: Arc<dyn ReplicatedLog>,
    joined: Option<Joined>,
}

impl ClientGateway {
    pub fn new(registry: Arc<ExerciseRegistry>, log: Arc<dyn ReplicatedLog>) -> Self {
        Self {
            registry,
            log,
            joined: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined.is_some()
    }

    pub fn client_id(&self) -> Option<Uuid> {
        self.joined.as_ref().map(|j| j.client_id)
    }

    /// Viewport the client joined restricted to.
    pub fn view_restriction(&self) -> Option<Uuid> {
        self.joined.as_ref().and_then(|j| j.view_restriction)
    }

    pub fn session(&self) -> Option<&Arc<ExerciseSession>> {
        self.joined.as_ref().map(|j| &j.session)
    }

    /// Join an exercise by either of its public ids.
    ///
    /// A `client_id` that already belongs to the exercise re-attaches to
    /// that client; anything else creates a new client whose role follows
    /// from the id used. The returned state already contains the join.
    pub async fn join_exercise(
        &mut self,
        exercise_id: &str,
        client_name: &str,
        client_id: Option<Uuid>,
        view_restriction: Option<Uuid>,
    ) -> Result<JoinResponse, GatewayError> {
        if let Some(joined) = &self.joined {
            return Err(GatewayError::AlreadyJoined(
                joined.session.participant_id().to_string(),
            ));
        }

        let (session, role) = match self.registry.await_exercise(exercise_id).await {
            Ok(found) => found,
            Err(RegistryError::NotFound(_)) | Err(RegistryError::PendingTimeout(_)) => {
                return Err(GatewayError::ExerciseNotFound(exercise_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        // Subscribe first: the snapshot below then bounds what the stream
        // still has to deliver.
        let events = session.subscribe();

        let existing = match client_id {
            Some(id) => session.client(&id)?,
            None => None,
        };
        let client_id = match existing {
            Some(client) => {
                if client.view_restricted_to_viewport_id != view_restriction {
                    self.submit_system(
                        &session,
                        ExerciseAction::RestrictViewToViewport {
                            client_id: client.id,
                            viewport_id: view_restriction,
                        },
                    )
                    .await?;
                }
                log::info!("{}: client {} re-attached", session.trainer_id(), client.id);
                client.id
            }
            None => {
                let client = Client::new(client_name, role, view_restriction);
                let id = client.id;
                self.submit_system(&session, ExerciseSession::add_client_action(client))
                    .await?;
                log::info!(
                    "{}: client {} joined as {:?}",
                    session.trainer_id(),
                    id,
                    role
                );
                id
            }
        };

        session.attach(client_id)?;
        let state = session.get_state_snapshot()?;
        self.joined = Some(Joined {
            session,
            client_id,
            view_restriction,
            events,
            last_index: state.applied_action_count,
            backlog: VecDeque::new(),
            deleted: false,
        });
        Ok(JoinResponse { client_id, state })
    }

    /// Propose an action on behalf of the joined client and wait for it to
    /// be applied.
    ///
    /// Shape and permissions are checked here first so obviously invalid
    /// actions never reach the log; permissions are checked again when the
    /// action is applied.
    pub async fn propose_action(
        &mut self,
        action: ExerciseAction,
        action_id: Option<Uuid>,
    ) -> Result<CommittedAction, GatewayError> {
        let joined = self.joined.as_ref().ok_or(GatewayError::NotJoined)?;

        let issues: Vec<String> = validate_shape(&action)
            .into_iter()
            .filter(ValidationIssue::is_error)
            .map(|issue| issue.to_string())
            .collect();
        if !issues.is_empty() {
            return Err(GatewayError::InvalidAction(issues.join("; ")));
        }

        let Some(client) = joined.session.client(&joined.client_id)? else {
            return Err(GatewayError::PermissionDenied(format!(
                "client {} is no longer part of this exercise",
                joined.client_id
            )));
        };
        let state = joined.session.get_state_snapshot()?;
        if !validate_permissions(&client, &action, &state) {
            return Err(GatewayError::PermissionDenied(format!(
                "{} is not allowed for this client",
                action.name()
            )));
        }

        let request = LogRequest::new(LogCommand::ProposeAction {
            exercise_id: joined.session.trainer_id().to_string(),
            client_id: Some(client.id),
            action_id,
            action,
        });
        expect_applied(self.log.submit(request).await?)
    }

    /// Like [`propose_action`](Self::propose_action) for an action that
    /// arrived as JSON.
    pub async fn propose_json(
        &mut self,
        action: serde_json::Value,
        action_id: Option<Uuid>,
    ) -> Result<CommittedAction, GatewayError> {
        let action = decode_action(action).map_err(|issues| {
            GatewayError::InvalidAction(
                issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        self.propose_action(action, action_id).await
    }

    /// Committed actions after `applied_action_count`.
    pub fn get_state_diff(&self, applied_action_count: u64) -> Result<Vec<CommittedAction>, GatewayError> {
        let joined = self.joined.as_ref().ok_or(GatewayError::NotJoined)?;
        Ok(joined.session.get_state_diff(applied_action_count)?)
    }

    /// Remove the client from the exercise and detach.
    ///
    /// The gateway stays joined if the removal cannot be committed.
    pub async fn leave_exercise(&mut self) -> Result<(), GatewayError> {
        let joined = self.joined.as_ref().ok_or(GatewayError::NotJoined)?;
        let session = Arc::clone(&joined.session);
        let client_id = joined.client_id;
        if !session.is_closed() {
            self.submit_system(&session, ExerciseSession::remove_client_action(client_id))
                .await?;
            log::info!("{}: client {} left", session.trainer_id(), client_id);
        }
        self.joined = None;
        session.detach(&client_id)?;
        Ok(())
    }

    /// Dispatch a wire request.
    pub async fn handle(&mut self, request: ClientRequest) -> SocketResponse<serde_json::Value> {
        let result = match request {
            ClientRequest::JoinExercise {
                exercise_id,
                client_name,
                client_id,
                view_restriction,
            } => self
                .join_exercise(&exercise_id, &client_name, client_id, view_restriction)
                .await
                .and_then(to_value),
            ClientRequest::ProposeAction { action, action_id } => self
                .propose_json(action, action_id)
                .await
                .map(|_| serde_json::Value::Null),
            ClientRequest::GetStateDiff {
                applied_action_count,
            } => self.get_state_diff(applied_action_count).and_then(to_value),
            ClientRequest::LeaveExercise => self
                .leave_exercise()
                .await
                .map(|_| serde_json::Value::Null),
        };
        result.into()
    }

    /// Wait for the next event to push to the client. `None` once the
    /// gateway has left or the exercise is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        loop {
            let joined = self.joined.as_mut()?;
            if let Some(event) = joined.backlog.pop_front() {
                return Some(event);
            }
            if joined.deleted {
                return None;
            }
            match joined.events.recv().await {
                Ok(event) => {
                    if let Some(event) = joined.on_event(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => joined.on_lagged(skipped),
                Err(RecvError::Closed) => joined.deleted = true,
            }
        }
    }

    /// The next event if one is ready.
    pub fn try_next_event(&mut self) -> Option<ServerEvent> {
        loop {
            let joined = self.joined.as_mut()?;
            if let Some(event) = joined.backlog.pop_front() {
                return Some(event);
            }
            if joined.deleted {
                return None;
            }
            match joined.events.try_recv() {
                Ok(event) => {
                    if let Some(event) = joined.on_event(event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(skipped)) => joined.on_lagged(skipped),
                Err(TryRecvError::Closed) => joined.deleted = true,
            }
        }
    }

    async fn submit_system(
        &self,
        session: &ExerciseSession,
        action: ExerciseAction,
    ) -> Result<CommittedAction, GatewayError> {
        let request = LogRequest::new(LogCommand::ProposeAction {
            exercise_id: session.trainer_id().to_string(),
            client_id: None,
            action_id: None,
            action,
        });
        expect_applied(self.log.submit(request).await?)
    }
}

impl Drop for ClientGateway {
    fn drop(&mut self) {
        // A dropped connection keeps its client in the exercise so it can
        // re-attach later.
        if let Some(joined) = &self.joined {
            let _ = joined.session.detach(&joined.client_id);
        }
    }
}

fn expect_applied(outcome: ApplyOutcome) -> Result<CommittedAction, GatewayError> {
    match outcome {
        ApplyOutcome::Applied { committed } => Ok(committed),
        ApplyOutcome::Rejected { message, expected } => {
            Err(GatewayError::Rejected { message, expected })
        }
        other => Err(GatewayError::Rejected {
            message: format!("unexpected outcome {other:?}"),
            expected: false,
        }),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<serde_json::Value, GatewayError> {
    serde_json::to_value(value).map_err(|e| GatewayError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::config::PendingExercisePolicy;
    use crate::replication::{
        ExerciseStateMachine, LocalLog, PendingRequests, ReplicationError,
    };
    use crate::session::ExerciseIds;
    use crate::state::Role;

    async fn setup() -> (Arc<ExerciseRegistry>, Arc<dyn ReplicatedLog>) {
        let registry = Arc::new(ExerciseRegistry::new(PendingExercisePolicy::default()));
        let log: Arc<dyn ReplicatedLog> = Arc::new(LocalLog::new(ExerciseStateMachine::new(
            Arc::clone(&registry),
            PendingRequests::new(),
            64,
        )));
        log.submit(LogRequest::new(LogCommand::CreateExercise {
            ids: ExerciseIds {
                trainer_id: "11112222".to_string(),
                participant_id: "333444".to_string(),
            },
            emitter_id: Uuid::new_v4(),
            import: None,
        }))
        .await
        .unwrap();
        (registry, log)
    }

    #[tokio::test]
    async fn role_follows_the_id_used() {
        let (registry, log) = setup().await;
        let mut trainer = ClientGateway::new(Arc::clone(&registry), Arc::clone(&log));
        let mut participant = ClientGateway::new(registry, log);

        let t = trainer.join_exercise("11112222", "Tina", None, None).await.unwrap();
        let p = participant.join_exercise("333444", "Pat", None, None).await.unwrap();

        assert_eq!(p.state.clients[&t.client_id].role, Role::Trainer);
        assert_eq!(p.state.clients[&p.client_id].role, Role::Participant);
    }

    #[tokio::test]
    async fn unknown_exercise_is_an_expected_failure() {
        let (registry, log) = setup().await;
        let mut gateway = ClientGateway::new(registry, log);
        let err = gateway.join_exercise("nope", "x", None, None).await.unwrap_err();
        assert_eq!(err, GatewayError::ExerciseNotFound("nope".to_string()));
        assert!(err.is_expected());
    }

    #[tokio::test]
    async fn commits_are_pushed_once_in_order() {
        let (registry, log) = setup().await;
        let mut trainer = ClientGateway::new(Arc::clone(&registry), Arc::clone(&log));
        let mut observer = ClientGateway::new(registry, log);
        trainer.join_exercise("11112222", "Tina", None, None).await.unwrap();
        let joined = observer.join_exercise("333444", "Oli", None, None).await.unwrap();

        let action_id = Uuid::new_v4();
        trainer
            .propose_action(ExerciseAction::StartExercise, Some(action_id))
            .await
            .unwrap();

        match observer.try_next_event() {
            Some(ServerEvent::PerformAction {
                index,
                action,
                action_id: id,
                ..
            }) => {
                assert_eq!(index, joined.state.applied_action_count + 1);
                assert_eq!(action, ExerciseAction::StartExercise);
                assert_eq!(id, Some(action_id));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(observer.try_next_event().is_none());
    }

    #[tokio::test]
    async fn malformed_json_never_reaches_the_log() {
        let (registry, log) = setup().await;
        let mut trainer = ClientGateway::new(registry, log);
        let joined = trainer.join_exercise("11112222", "Tina", None, None).await.unwrap();

        let response = trainer
            .handle(ClientRequest::ProposeAction {
                action: serde_json::json!({ "type": "[Exercise] Explode" }),
                action_id: None,
            })
            .await;
        assert!(matches!(
            response,
            SocketResponse::Failure { expected: true, .. }
        ));
        let diff = trainer
            .get_state_diff(joined.state.applied_action_count)
            .unwrap();
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn leaving_removes_the_client() {
        let (registry, log) = setup().await;
        let mut gateway = ClientGateway::new(Arc::clone(&registry), log);
        let joined = gateway.join_exercise("333444", "Pat", None, None).await.unwrap();
        gateway.leave_exercise().await.unwrap();

        let (session, _) = registry.get("333444").unwrap().unwrap();
        assert!(session.client(&joined.client_id).unwrap().is_none());
        assert!(session.connected_clients().unwrap().is_empty());
        assert!(matches!(
            gateway.propose_action(ExerciseAction::StartExercise, None).await,
            Err(GatewayError::NotJoined)
        ));
    }

    /// Forwards to a real log unless switched off.
    struct SwitchableLog {
        inner: Arc<dyn ReplicatedLog>,
        down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ReplicatedLog for SwitchableLog {
        async fn submit(&self, request: LogRequest) -> Result<ApplyOutcome, ReplicationError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(ReplicationError::NoLeader);
            }
            self.inner.submit(request).await
        }

        fn is_leader(&self) -> bool {
            self.inner.is_leader()
        }
    }

    #[tokio::test]
    async fn failed_leave_keeps_the_client_joined() {
        let (registry, inner) = setup().await;
        let log = Arc::new(SwitchableLog {
            inner,
            down: AtomicBool::new(false),
        });
        let mut gateway = ClientGateway::new(Arc::clone(&registry), log.clone());
        let joined = gateway.join_exercise("333444", "Pat", None, None).await.unwrap();

        log.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            gateway.leave_exercise().await,
            Err(GatewayError::Replication(ReplicationError::NoLeader))
        ));
        let (session, _) = registry.get("333444").unwrap().unwrap();
        assert!(session.client(&joined.client_id).unwrap().is_some());
        assert_eq!(session.connected_clients().unwrap(), vec![joined.client_id]);

        log.down.store(false, Ordering::SeqCst);
        gateway.leave_exercise().await.unwrap();
        assert!(session.client(&joined.client_id).unwrap().is_none());
        assert!(session.connected_clients().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletion_ends_the_event_stream() {
        let (registry, log) = setup().await;
        let mut gateway = ClientGateway::new(Arc::clone(&registry), Arc::clone(&log));
        gateway.join_exercise("333444", "Pat", None, None).await.unwrap();

        log.submit(LogRequest::new(LogCommand::DeleteExercise {
            trainer_id: "11112222".to_string(),
        }))
        .await
        .unwrap();

        assert_eq!(gateway.next_event().await, Some(ServerEvent::ExerciseDeleted));
        assert_eq!(gateway.next_event().await, None);
    }
}
