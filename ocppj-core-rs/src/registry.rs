//! Awaitable responses
//!
//! Callers of `call` register a oneshot sender under (peer, unique ID) before
//! the request is enqueued; the endpoint resolves it on CallResult, CallError
//! or cancellation.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::dispatcher::{CancelReason, DispatchError};
use crate::protocol::{BuildError, CallResult, ProtocolError};
use crate::transport::TransportError;

/// Failure to build or hand off an outbound message
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why an awaited call produced no response payload
#[derive(Debug, Error)]
pub enum CallFailure {
    #[error(transparent)]
    Send(#[from] SendError),

    #[error("Remote error {code}: {description}")]
    Remote {
        code: String,
        description: String,
        details: Value,
    },

    #[error("Request canceled: {0}")]
    Canceled(CancelReason),

    #[error("Invalid response: {0}")]
    InvalidResponse(ProtocolError),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Request discarded before it was sent")]
    Discarded,

    #[error("Endpoint stopped")]
    Stopped,
}

pub type CallOutcome = Result<CallResult, CallFailure>;

#[derive(Debug, Default)]
pub struct ResponseRegistry {
    waiters: Mutex<HashMap<(String, String), oneshot::Sender<CallOutcome>>>,
}

impl ResponseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer_id: &str, request_id: &str) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .insert((peer_id.to_string(), request_id.to_string()), tx);
        rx
    }

    /// Deliver `outcome` to the waiter, if any. Returns whether one was found.
    pub fn resolve(&self, peer_id: &str, request_id: &str, outcome: CallOutcome) -> bool {
        let waiter = self
            .waiters
            .lock()
            .remove(&(peer_id.to_string(), request_id.to_string()));
        match waiter {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("Caller for {} went away before its response", request_id);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, peer_id: &str, request_id: &str) -> bool {
        self.waiters
            .lock()
            .remove(&(peer_id.to_string(), request_id.to_string()))
            .is_some()
    }

    /// Fail every waiter of `peer_id` except `keep` with [`CallFailure::Discarded`]
    pub fn discard_peer(&self, peer_id: &str, keep: Option<&str>) -> usize {
        let discarded: Vec<_> = {
            let mut waiters = self.waiters.lock();
            let keys: Vec<_> = waiters
                .keys()
                .filter(|(peer, id)| peer == peer_id && Some(id.as_str()) != keep)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| waiters.remove(&key))
                .collect()
        };
        let count = discarded.len();
        for tx in discarded {
            let _ = tx.send(Err(CallFailure::Discarded));
        }
        count
    }

    /// Drop every waiter; their callers see [`CallFailure::Stopped`]
    pub fn clear(&self) {
        self.waiters.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

/// Await a registered response
pub async fn wait_for(rx: oneshot::Receiver<CallOutcome>) -> CallOutcome {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(CallFailure::Stopped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(id: &str) -> CallResult {
        CallResult {
            unique_id: id.to_string(),
            action: "Heartbeat".to_string(),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let registry = ResponseRegistry::new();
        let rx = registry.register("cs-1", "a");

        assert!(registry.resolve("cs-1", "a", Ok(result("a"))));
        assert!(!registry.resolve("cs-1", "a", Ok(result("a"))));
        assert_eq!(wait_for(rx).await.unwrap().unique_id, "a");
    }

    #[tokio::test]
    async fn test_discard_peer_keeps_in_flight() {
        let registry = ResponseRegistry::new();
        let in_flight = registry.register("cs-1", "a");
        let queued = registry.register("cs-1", "b");
        let other = registry.register("cs-2", "c");

        assert_eq!(registry.discard_peer("cs-1", Some("a")), 1);
        assert!(matches!(wait_for(queued).await, Err(CallFailure::Discarded)));
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(matches!(wait_for(in_flight).await, Err(CallFailure::Stopped)));
        assert!(matches!(wait_for(other).await, Err(CallFailure::Stopped)));
    }
}
