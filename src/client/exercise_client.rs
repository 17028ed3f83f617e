//! An exercise client with optimistic updates
//!
//! Couples an [`ExerciseConnection`] with an [`OptimisticReconciler`]:
//! proposals are applied locally first, server pushes are folded into the
//! confirmed state, and rejections roll the local state back.

use uuid::Uuid;

use super::connection::ExerciseConnection;
use super::error::ClientError;
use super::reconciler::OptimisticReconciler;
use crate::config::ClientConfig;
use crate::gateway::ServerEvent;
use crate::state::{ExerciseAction, ExerciseState};

pub struct ExerciseClient<C: ExerciseConnection> {
    connection: C,
    config: ClientConfig,
    client_id: Option<Uuid>,
    reconciler: Option<OptimisticReconciler>,
}

impl<C: ExerciseConnection> ExerciseClient<C> {
    pub fn new(connection: C, config: ClientConfig) -> Self {
        Self {
            connection,
            config,
            client_id: None,
            reconciler: None,
        }
    }

    pub fn client_id(&self) -> Option<Uuid> {
        self.client_id
    }

    /// The state to render: confirmed plus speculative actions.
    pub fn state(&self) -> Option<&ExerciseState> {
        self.reconciler.as_ref().map(OptimisticReconciler::current)
    }

    pub fn confirmed_state(&self) -> Option<&ExerciseState> {
        self.reconciler.as_ref().map(OptimisticReconciler::confirmed)
    }

    pub fn reconciler(&self) -> Option<&OptimisticReconciler> {
        self.reconciler.as_ref()
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    /// Join, or re-join with the client id from an earlier join.
    pub async fn join(
        &mut self,
        exercise_id: &str,
        client_name: &str,
        view_restriction: Option<Uuid>,
    ) -> Result<Uuid, ClientError> {
        let joined = self
            .connection
            .join(exercise_id, client_name, self.client_id, view_restriction)
            .await
            .into_result()
            .map_err(ClientError::from_failure)?;

        self.client_id = Some(joined.client_id);
        match &mut self.reconciler {
            Some(reconciler) => {
                let dropped = reconciler.reset(joined.state);
                if !dropped.is_empty() {
                    log::warn!(
                        "re-join discarded {} unconfirmed actions",
                        dropped.len()
                    );
                }
            }
            None => self.reconciler = Some(OptimisticReconciler::new(joined.state)),
        }
        Ok(joined.client_id)
    }

    /// Send an action to the server.
    ///
    /// With `optimistic`, the action is applied to the local state before
    /// the request goes out. An action that already fails locally is
    /// rejected without contacting the server. If no answer arrives within
    /// the configured deadline the action stays pending and
    /// [`ClientError::Timeout`] is returned; a later push or
    /// [`resync`](Self::resync) settles it.
    pub async fn propose_action(
        &mut self,
        action: ExerciseAction,
        optimistic: bool,
    ) -> Result<Uuid, ClientError> {
        let reconciler = self.reconciler.as_mut().ok_or(ClientError::NotJoined)?;
        let action_id = Uuid::new_v4();
        if optimistic {
            reconciler.begin_optimistic(action_id, action.clone())?;
        }

        let response = tokio::time::timeout(
            self.config.propose_timeout(),
            self.connection.propose(action, action_id),
        )
        .await;

        match response {
            Err(_) => Err(ClientError::Timeout(action_id)),
            Ok(response) => match response.into_result() {
                // The committed copy arrives as a pushed event.
                Ok(()) => Ok(action_id),
                Err(failure) => {
                    if let Some(reconciler) = self.reconciler.as_mut() {
                        reconciler.reject(&action_id);
                    }
                    Err(ClientError::from_failure(failure))
                }
            },
        }
    }

    /// Fold one pushed event into the local state.
    pub fn handle_event(&mut self, event: ServerEvent) -> Result<(), ClientError> {
        let reconciler = self.reconciler.as_mut().ok_or(ClientError::NotJoined)?;
        match event {
            ServerEvent::PerformAction {
                index,
                action,
                action_id,
                ..
            } => {
                reconciler.perform_action(index, &action, action_id)?;
            }
            ServerEvent::StateReset { state } => {
                let dropped = reconciler.reset(state);
                if !dropped.is_empty() {
                    log::warn!(
                        "state reset discarded {} unconfirmed actions",
                        dropped.len()
                    );
                }
            }
            ServerEvent::ExerciseDeleted => {
                self.reconciler = None;
                return Err(ClientError::ExerciseDeleted);
            }
        }
        Ok(())
    }

    /// Handle every event that has arrived so far.
    pub fn pump_events(&mut self) -> Result<usize, ClientError> {
        let mut handled = 0;
        while let Some(event) = self.connection.poll_event() {
            self.handle_event(event)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Catch up from the server's history after missing pushes, e.g. after
    /// a reconnect. Settles pending actions the server committed meanwhile.
    pub async fn resync(&mut self) -> Result<usize, ClientError> {
        let from = self
            .reconciler
            .as_ref()
            .ok_or(ClientError::NotJoined)?
            .confirmed()
            .applied_action_count;
        let missed = self
            .connection
            .state_diff(from)
            .await
            .into_result()
            .map_err(ClientError::from_failure)?;

        let reconciler = self.reconciler.as_mut().ok_or(ClientError::NotJoined)?;
        let mut applied = 0;
        for committed in missed {
            if reconciler.perform_action(committed.index, &committed.action, committed.action_id)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    pub async fn leave(&mut self) -> Result<(), ClientError> {
        self.connection
            .leave()
            .await
            .into_result()
            .map_err(ClientError::from_failure)?;
        self.reconciler = None;
        Ok(())
    }
}
