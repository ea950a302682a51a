//! Request dispatchers
//!
//! A dispatcher owns the outbound queue(s) of an endpoint and enforces the
//! OCPP-J rule of at most one outstanding request per connection:
//! - [`ClientDispatcher`]: one queue, one connection, pausable
//! - [`ServerDispatcher`]: one queue per connected peer, peers independent
//!
//! Each runs a single background task that reacts to enqueue, completion,
//! lifecycle and timer events. Completion and cancellation are reported
//! through an injected callback.

pub mod client;
pub mod server;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::protocol::{Call, ErrorKind};
use crate::queue::QueueError;

pub use client::ClientDispatcher;
pub use server::ServerDispatcher;

/// Default response timeout for an in-flight request
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a request was canceled without a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// No response within the configured timeout
    Timeout,
    /// The transport refused the frame
    WriteFailed(String),
}

impl CancelReason {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            CancelReason::Timeout => ErrorKind::GenericError,
            CancelReason::WriteFailed(_) => ErrorKind::InternalError,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => f.write_str("Request timed out"),
            CancelReason::WriteFailed(e) => write!(f, "Failed to send request: {}", e),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No transport attached to dispatcher")]
    NoTransport,

    #[error("No queue for peer {0}")]
    UnknownPeer(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Called with (request ID, request, reason) when a client request is canceled
pub type ClientCancelHandler = Arc<dyn Fn(&str, &Call, &CancelReason) + Send + Sync>;

/// Called with (peer ID, request ID, request, reason) when a server request is canceled
pub type ServerCancelHandler = Arc<dyn Fn(&str, &str, &Call, &CancelReason) + Send + Sync>;

/// Sleep until `deadline`, or forever when there is none
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Queue whose `peek` is slow enough for concurrent callers to overlap
#[cfg(test)]
pub(crate) struct SlowPeekQueue(pub(crate) crate::queue::FifoQueue);

#[cfg(test)]
impl crate::queue::RequestQueue for SlowPeekQueue {
    fn push(&self, bundle: crate::queue::RequestBundle) -> Result<(), QueueError> {
        self.0.push(bundle)
    }

    fn peek(&self) -> Option<crate::queue::RequestBundle> {
        std::thread::sleep(Duration::from_millis(100));
        self.0.peek()
    }

    fn pop(&self) -> Option<crate::queue::RequestBundle> {
        self.0.pop()
    }

    fn pop_if(
        &self,
        predicate: &dyn Fn(&crate::queue::RequestBundle) -> bool,
    ) -> Option<crate::queue::RequestBundle> {
        self.0.pop_if(predicate)
    }

    fn size(&self) -> usize {
        self.0.size()
    }

    fn is_full(&self) -> bool {
        self.0.is_full()
    }

    fn init(&self) {
        self.0.init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_reason_classification() {
        assert_eq!(CancelReason::Timeout.error_kind(), ErrorKind::GenericError);
        assert_eq!(CancelReason::Timeout.to_string(), "Request timed out");

        let failed = CancelReason::WriteFailed("broken pipe".into());
        assert_eq!(failed.error_kind(), ErrorKind::InternalError);
        assert_eq!(failed.to_string(), "Failed to send request: broken pipe");
    }
}
