//! The client's view of its server connection

use async_trait::async_trait;
use uuid::Uuid;

use crate::gateway::{ClientGateway, JoinResponse, ServerEvent, SocketResponse};
use crate::session::CommittedAction;
use crate::state::ExerciseAction;

/// Request/response calls plus the pushed event stream of one connection.
#[async_trait]
pub trait ExerciseConnection: Send {
    async fn join(
        &mut self,
        exercise_id: &str,
        client_name: &str,
        client_id: Option<Uuid>,
        view_restriction: Option<Uuid>,
    ) -> SocketResponse<JoinResponse>;

    async fn propose(&mut self, action: ExerciseAction, action_id: Uuid) -> SocketResponse<()>;

    async fn state_diff(&mut self, applied_action_count: u64) -> SocketResponse<Vec<CommittedAction>>;

    async fn leave(&mut self) -> SocketResponse<()>;

    /// A pushed event, if one has arrived.
    fn poll_event(&mut self) -> Option<ServerEvent>;
}

/// Talks to a gateway in the same process.
#[async_trait]
impl ExerciseConnection for ClientGateway {
    async fn join(
        &mut self,
        exercise_id: &str,
        client_name: &str,
        client_id: Option<Uuid>,
        view_restriction: Option<Uuid>,
    ) -> SocketResponse<JoinResponse> {
        self.join_exercise(exercise_id, client_name, client_id, view_restriction)
            .await
            .into()
    }

    async fn propose(&mut self, action: ExerciseAction, action_id: Uuid) -> SocketResponse<()> {
        self.propose_action(action, Some(action_id))
            .await
            .map(|_| ())
            .into()
    }

    async fn state_diff(&mut self, applied_action_count: u64) -> SocketResponse<Vec<CommittedAction>> {
        self.get_state_diff(applied_action_count).into()
    }

    async fn leave(&mut self) -> SocketResponse<()> {
        self.leave_exercise().await.into()
    }

    fn poll_event(&mut self) -> Option<ServerEvent> {
        self.try_next_event()
    }
}
