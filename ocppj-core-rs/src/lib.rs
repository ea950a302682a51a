//! # OCPP-J Core
//!
//! Message framing and request dispatch for OCPP-J (OCPP over WebSocket
//! with JSON arrays), usable on both the charge-point and the central-system
//! side.
//!
//! ## Architecture
//!
//! ```text
//!   application handlers
//!          │ send_request / call / send_response
//!          ▼
//! ┌─────────────────────────────────────┐
//! │  Client / Server facade             │
//! │  ┌──────────┐   ┌────────────────┐  │
//! │  │ Endpoint │   │ Dispatcher     │  │
//! │  │ parse /  │◄─►│ queue(s)       │  │
//! │  │ build    │   │ pending state  │  │
//! │  └──────────┘   │ timeouts       │  │
//! │                 └────────────────┘  │
//! └───────────────┬─────────────────────┘
//!                 │ ClientTransport / ServerTransport
//!                 ▼
//!            WebSocket connection(s)
//! ```
//!
//! A connection carries at most one outstanding request: further requests
//! wait in a FIFO queue until the previous one is answered, times out, or
//! fails to send.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocppj_core::core_profile::{self, HeartbeatRequest};
//! use ocppj_core::{ChannelTransport, Client, ClientDispatcher, DispatcherConfig, Endpoint, EndpointConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = Endpoint::new(EndpointConfig::default()).with_profile(core_profile::profile());
//!     let transport = Arc::new(ChannelTransport::new());
//!     let _outbound = transport.connect();
//!
//!     let client = Client::new(
//!         "CS001",
//!         endpoint,
//!         ClientDispatcher::new(DispatcherConfig::default()),
//!         transport,
//!     );
//!     client.start();
//!
//!     let response = client.call(&HeartbeatRequest {}).await?;
//!     println!("server time: {}", response.current_time);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod core_profile;
pub mod dispatcher;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod server;
pub mod state;
pub mod transport;

pub use client::Client;
pub use config::{DispatcherConfig, EndpointConfig};
pub use dispatcher::{CancelReason, ClientDispatcher, DispatchError, ServerDispatcher};
pub use protocol::{
    BuildError, Call, CallError, CallResult, Dialect, Endpoint, ErrorKind, Message, Profile,
    ProtocolError, Request, Response, ValidationSwitch,
};
pub use queue::{FifoQueue, FifoQueueMap, QueueError, QueueMap, RequestBundle, RequestQueue};
pub use registry::{CallFailure, SendError};
pub use server::Server;
pub use state::{ClientState, ServerState, SingleClientState};
pub use transport::{
    ChannelServerTransport, ChannelTransport, ClientTransport, ConnectionEvent, ServerTransport,
    TransportError,
};
