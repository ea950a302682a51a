//! Pending-request state
//!
//! Records the single outstanding request of an endpoint (or of each peer on
//! the server side) so responses can be matched and decoded by action.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::protocol::Call;

/// Pending-request view of one connection
///
/// The parser consults this to decide whether a CallResult or CallError is
/// expected and which action it answers.
pub trait ClientState: Send + Sync {
    /// Record `request` as in flight. Ignored while another request is pending.
    fn add_pending_request(&self, request_id: &str, request: Call);

    fn get_pending_request(&self, request_id: &str) -> Option<Call>;

    fn has_pending_request(&self) -> bool;

    /// Remove the entry if `request_id` is the pending one
    fn delete_pending_request(&self, request_id: &str);

    fn clear_pending_requests(&self);
}

/// Client-side state holding at most one pending request
#[derive(Debug, Default)]
pub struct SingleClientState {
    pending: RwLock<Option<(String, Call)>>,
}

impl SingleClientState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientState for SingleClientState {
    fn add_pending_request(&self, request_id: &str, request: Call) {
        let mut pending = self.pending.write();
        if let Some((current, _)) = pending.as_ref() {
            warn!(
                "Refusing to track request {}: request {} is still pending",
                request_id, current
            );
            return;
        }
        *pending = Some((request_id.to_string(), request));
    }

    fn get_pending_request(&self, request_id: &str) -> Option<Call> {
        self.pending
            .read()
            .as_ref()
            .filter(|(id, _)| id == request_id)
            .map(|(_, call)| call.clone())
    }

    fn has_pending_request(&self) -> bool {
        self.pending.read().is_some()
    }

    fn delete_pending_request(&self, request_id: &str) {
        let mut pending = self.pending.write();
        if matches!(pending.as_ref(), Some((id, _)) if id == request_id) {
            *pending = None;
        }
    }

    fn clear_pending_requests(&self) {
        *self.pending.write() = None;
    }
}

/// Server-side state: at most one pending request per peer
#[derive(Debug, Default)]
pub struct ServerState {
    pending: RwLock<HashMap<String, (String, Call)>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending_request(&self, peer_id: &str, request_id: &str, request: Call) {
        let mut pending = self.pending.write();
        if let Some((current, _)) = pending.get(peer_id) {
            warn!(
                "Refusing to track request {} for {}: request {} is still pending",
                request_id, peer_id, current
            );
            return;
        }
        pending.insert(peer_id.to_string(), (request_id.to_string(), request));
    }

    pub fn get_pending_request(&self, peer_id: &str, request_id: &str) -> Option<Call> {
        self.pending
            .read()
            .get(peer_id)
            .filter(|(id, _)| id == request_id)
            .map(|(_, call)| call.clone())
    }

    /// The request in flight for `peer_id`, whatever its ID
    pub fn pending_request_for(&self, peer_id: &str) -> Option<Call> {
        self.pending.read().get(peer_id).map(|(_, call)| call.clone())
    }

    pub fn has_pending_request(&self, peer_id: &str) -> bool {
        self.pending.read().contains_key(peer_id)
    }

    /// Whether any peer has a request in flight
    pub fn has_pending_requests(&self) -> bool {
        !self.pending.read().is_empty()
    }

    pub fn delete_pending_request(&self, peer_id: &str, request_id: &str) {
        let mut pending = self.pending.write();
        if matches!(pending.get(peer_id), Some((id, _)) if id == request_id) {
            pending.remove(peer_id);
        }
    }

    pub fn clear_client_pending_request(&self, peer_id: &str) {
        if self.pending.write().remove(peer_id).is_some() {
            debug!("Cleared pending request for {}", peer_id);
        }
    }

    pub fn clear_all_pending_requests(&self) {
        self.pending.write().clear();
    }

    /// Scoped view of one peer's state, usable wherever a [`ClientState`] is expected
    pub fn client_state(self: &Arc<Self>, peer_id: &str) -> ScopedClientState {
        ScopedClientState {
            server: Arc::clone(self),
            peer_id: peer_id.to_string(),
        }
    }
}

/// One peer's slice of a [`ServerState`]
#[derive(Debug, Clone)]
pub struct ScopedClientState {
    server: Arc<ServerState>,
    peer_id: String,
}

impl ScopedClientState {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

impl ClientState for ScopedClientState {
    fn add_pending_request(&self, request_id: &str, request: Call) {
        self.server
            .add_pending_request(&self.peer_id, request_id, request);
    }

    fn get_pending_request(&self, request_id: &str) -> Option<Call> {
        self.server.get_pending_request(&self.peer_id, request_id)
    }

    fn has_pending_request(&self) -> bool {
        self.server.has_pending_request(&self.peer_id)
    }

    fn delete_pending_request(&self, request_id: &str) {
        self.server.delete_pending_request(&self.peer_id, request_id);
    }

    fn clear_pending_requests(&self) {
        self.server.clear_client_pending_request(&self.peer_id);
    }
}
