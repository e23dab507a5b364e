//! Request/response correlation.
//!
//! Every correlated request gets a `requestId`; the matching response
//! resolves the stored responder exactly once. Requests issued before the
//! handshake is confirmed wait in a FIFO queue.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tether_protocol::{Envelope, Payload};
use tokio::sync::oneshot;

use crate::error::{Result, SyncError};

pub fn new_correlation_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "req-{}-{:x}",
        Utc::now().timestamp_millis(),
        random.next_u64()
    )
}

#[derive(Debug)]
struct PendingRequest {
    responder: oneshot::Sender<Result<Envelope>>,
    created_at: DateTime<Utc>,
}

/// Handle returned to the caller of a correlated send.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: String,
    rx: oneshot::Receiver<Result<Envelope>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn wait(self) -> Result<Envelope> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::RequestCancelled(self.correlation_id)),
        }
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<Envelope> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::RequestCancelled(self.correlation_id)),
            Err(_) => Err(SyncError::CorrelationTimeout {
                correlation_id: self.correlation_id,
                waited_secs: timeout.as_secs(),
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: HashMap<String, PendingRequest>,
    queue: VecDeque<Envelope>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps a correlation id onto the envelope (keeping a caller-supplied
    /// one) and stores the responder.
    pub fn register(&mut self, mut envelope: Envelope) -> (Envelope, PendingReply) {
        let correlation_id = envelope
            .correlation_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_correlation_id);
        envelope.correlation_id = Some(correlation_id.clone());

        let (tx, rx) = oneshot::channel();
        if self
            .pending
            .insert(
                correlation_id.clone(),
                PendingRequest {
                    responder: tx,
                    created_at: Utc::now(),
                },
            )
            .is_some()
        {
            tracing::warn!(correlation_id = %correlation_id, "Replacing pending request with duplicate id");
        }

        (
            envelope,
            PendingReply {
                correlation_id,
                rx,
            },
        )
    }

    pub fn enqueue(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
    }

    pub fn drain_queue(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }

    /// Resolves the pending request matching `envelope`, if any. Returns
    /// false for unmatched (or already resolved / cancelled) ids.
    pub fn resolve(&mut self, envelope: &Envelope) -> bool {
        let Some(correlation_id) = envelope.correlation_id.as_deref() else {
            return false;
        };
        let Some(pending) = self.pending.remove(correlation_id) else {
            return false;
        };

        let outcome = match &envelope.payload {
            Payload::Error(info) => Err(SyncError::Remote {
                code: info.code.clone(),
                message: info.message.clone(),
            }),
            _ => Ok(envelope.clone()),
        };

        let waited_ms = Utc::now()
            .signed_duration_since(pending.created_at)
            .num_milliseconds();
        tracing::debug!(
            correlation_id = %correlation_id,
            waited_ms,
            response = envelope.type_tag(),
            "Resolved correlated request"
        );

        // The caller may have stopped waiting; that is not an error here.
        let _ = pending.responder.send(outcome);
        true
    }

    /// Prevents future resolution. A queued request with this id is dropped
    /// before it is ever sent.
    pub fn cancel(&mut self, correlation_id: &str) -> bool {
        let before = self.queue.len();
        self.queue
            .retain(|queued| queued.correlation_id.as_deref() != Some(correlation_id));
        let removed_queued = self.queue.len() != before;
        self.pending.remove(correlation_id).is_some() || removed_queued
    }

    /// Fails a single request without waiting for the server.
    pub fn fail(&mut self, correlation_id: &str, error: SyncError) {
        if let Some(pending) = self.pending.remove(correlation_id) {
            let _ = pending.responder.send(Err(error));
        }
    }
}
