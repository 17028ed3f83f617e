//! Single-replica log
//!
//! Applies requests immediately in submission order. Used by a standalone
//! server and by tests that exercise the layers above replication.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::command::{ApplyOutcome, LogRequest};
use super::pending::PendingRequests;
use super::state_machine::{ExerciseStateMachine, StateMachine};
use super::{LogIndex, ReplicatedLog, ReplicationError};

struct LocalInner {
    machine: ExerciseStateMachine,
    last_index: LogIndex,
}

pub struct LocalLog {
    inner: Mutex<LocalInner>,
    pending: Arc<PendingRequests>,
}

impl LocalLog {
    pub fn new(machine: ExerciseStateMachine) -> Self {
        let pending = Arc::clone(machine.pending());
        Self {
            inner: Mutex::new(LocalInner {
                machine,
                last_index: 0,
            }),
            pending,
        }
    }

    pub async fn last_index(&self) -> LogIndex {
        self.inner.lock().await.last_index
    }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    async fn submit(&self, request: LogRequest) -> Result<ApplyOutcome, ReplicationError> {
        let payload = request.encode()?;
        let mut response = self.pending.register(request.request_id)?;
        {
            let mut inner = self.inner.lock().await;
            inner.last_index += 1;
            let index = inner.last_index;
            inner.machine.apply(index, &payload);
        }
        response.recv().await
    }

    fn is_leader(&self) -> bool {
        true
    }
}
