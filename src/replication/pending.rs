//! Callers waiting for their requests to be applied
//!
//! Every submitted request registers a single-use completion handle under
//! its request id. The apply path resolves it at most once; dropping the
//! handle (timeout, cancelled caller) removes the entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use uuid::Uuid;

use super::command::ApplyOutcome;
use super::ReplicationError;

#[derive(Default)]
pub struct PendingRequests {
    waiting: Mutex<HashMap<Uuid, oneshot::Sender<ApplyOutcome>>>,
}

/// The receiving half of a registered request.
pub struct PendingResponse {
    request_id: Uuid,
    rx: oneshot::Receiver<ApplyOutcome>,
    owner: Arc<PendingRequests>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, request_id: Uuid) -> Result<PendingResponse, ReplicationError> {
        let (tx, rx) = oneshot::channel();
        let mut waiting = self
            .waiting
            .lock()
            .map_err(|e| ReplicationError::SyncError(format!("pending lock poisoned: {e}")))?;
        if waiting.contains_key(&request_id) {
            return Err(ReplicationError::DuplicateRequest(request_id));
        }
        waiting.insert(request_id, tx);
        Ok(PendingResponse {
            request_id,
            rx,
            owner: Arc::clone(self),
        })
    }

    /// Complete a request. Returns `false` if nobody on this replica waits
    /// for it, or it was already resolved.
    pub fn resolve(&self, request_id: &Uuid, outcome: ApplyOutcome) -> bool {
        let sender = match self.waiting.lock() {
            Ok(mut waiting) => waiting.remove(request_id),
            Err(e) => {
                log::error!("pending lock poisoned: {e}");
                None
            }
        };
        sender.is_some_and(|tx| tx.send(outcome).is_ok())
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, request_id: &Uuid) {
        if let Ok(mut waiting) = self.waiting.lock() {
            waiting.remove(request_id);
        }
    }
}

impl PendingResponse {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Wait for the outcome.
    pub async fn recv(&mut self) -> Result<ApplyOutcome, ReplicationError> {
        (&mut self.rx).await.map_err(|_| ReplicationError::ShutDown)
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.owner.forget(&self.request_id);
    }
}
