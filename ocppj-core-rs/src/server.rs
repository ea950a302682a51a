//! Central-system side endpoint
//!
//! Combines an [`Endpoint`] with a [`ServerDispatcher`] and routes traffic per
//! peer. Connection lifecycle is reported by the transport layer through
//! `on_client_connected` and `on_client_disconnected`.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{CancelReason, ServerCancelHandler, ServerDispatcher};
use crate::protocol::{
    Call, CallError, CallResult, Endpoint, ErrorKind, Message, MessageType, ProtocolError,
    Request, Response,
};
use crate::queue::RequestBundle;
use crate::registry::{wait_for, CallFailure, ResponseRegistry, SendError};
use crate::transport::ServerTransport;

pub type PeerRequestHandler = Arc<dyn Fn(&str, Call) + Send + Sync>;
pub type PeerResponseHandler = Arc<dyn Fn(&str, &CallResult) + Send + Sync>;
pub type PeerErrorHandler = Arc<dyn Fn(&str, &CallError) + Send + Sync>;
pub type PeerInvalidMessageHandler = Arc<dyn Fn(&str, &ProtocolError) + Send + Sync>;
pub type PeerLifecycleHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    request: Option<PeerRequestHandler>,
    response: Option<PeerResponseHandler>,
    error: Option<PeerErrorHandler>,
    invalid_message: Option<PeerInvalidMessageHandler>,
    canceled: Option<ServerCancelHandler>,
    connected: Option<PeerLifecycleHandler>,
    disconnected: Option<PeerLifecycleHandler>,
}

pub struct Server {
    endpoint: Endpoint,
    dispatcher: ServerDispatcher,
    transport: Arc<dyn ServerTransport>,
    registry: Arc<ResponseRegistry>,
    handlers: Arc<RwLock<Handlers>>,
}

impl Server {
    pub fn new(
        endpoint: Endpoint,
        dispatcher: ServerDispatcher,
        transport: Arc<dyn ServerTransport>,
    ) -> Self {
        let registry = Arc::new(ResponseRegistry::new());
        let handlers = Arc::new(RwLock::new(Handlers::default()));

        dispatcher.set_network_server(Arc::clone(&transport));
        {
            let registry = Arc::clone(&registry);
            let handlers = Arc::clone(&handlers);
            dispatcher.set_on_request_canceled(move |peer_id, request_id, request, reason| {
                registry.resolve(
                    peer_id,
                    request_id,
                    Err(CallFailure::Canceled(reason.clone())),
                );
                let handler = handlers.read().canceled.clone();
                if let Some(handler) = handler {
                    handler(peer_id, request_id, request, reason);
                }
            });
        }

        Self {
            endpoint,
            dispatcher,
            transport,
            registry,
            handlers,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn dispatcher(&self) -> &ServerDispatcher {
        &self.dispatcher
    }

    pub fn set_request_handler(&self, handler: impl Fn(&str, Call) + Send + Sync + 'static) {
        self.handlers.write().request = Some(Arc::new(handler));
    }

    pub fn set_response_handler(
        &self,
        handler: impl Fn(&str, &CallResult) + Send + Sync + 'static,
    ) {
        self.handlers.write().response = Some(Arc::new(handler));
    }

    pub fn set_error_handler(&self, handler: impl Fn(&str, &CallError) + Send + Sync + 'static) {
        self.handlers.write().error = Some(Arc::new(handler));
    }

    pub fn set_invalid_message_handler(
        &self,
        handler: impl Fn(&str, &ProtocolError) + Send + Sync + 'static,
    ) {
        self.handlers.write().invalid_message = Some(Arc::new(handler));
    }

    pub fn set_canceled_handler(
        &self,
        handler: impl Fn(&str, &str, &Call, &CancelReason) + Send + Sync + 'static,
    ) {
        self.handlers.write().canceled = Some(Arc::new(handler));
    }

    pub fn set_new_client_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers.write().connected = Some(Arc::new(handler));
    }

    pub fn set_client_disconnected_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers.write().disconnected = Some(Arc::new(handler));
    }

    /// Start dispatching. Must be called within a Tokio runtime.
    pub fn start(&self) {
        info!("Starting server");
        self.dispatcher.start();
    }

    pub fn stop(&self) {
        self.dispatcher.stop();
        self.registry.clear();
        info!("Server stopped");
    }

    pub fn on_client_connected(&self, peer_id: &str) {
        info!("Client {} connected", peer_id);
        self.dispatcher.create_client(peer_id);
        let handler = self.handlers.read().connected.clone();
        if let Some(handler) = handler {
            handler(peer_id);
        }
    }

    /// Drop the peer's queue; callers awaiting queued requests fail with
    /// [`CallFailure::Discarded`], the in-flight one keeps waiting
    pub fn on_client_disconnected(&self, peer_id: &str) {
        info!("Client {} disconnected", peer_id);
        let in_flight = self
            .dispatcher
            .state()
            .pending_request_for(peer_id)
            .map(|call| call.unique_id);
        self.dispatcher.delete_client(peer_id);
        let discarded = self.registry.discard_peer(peer_id, in_flight.as_deref());
        if discarded > 0 {
            debug!("Discarded {} queued requests for {}", discarded, peer_id);
        }
        let handler = self.handlers.read().disconnected.clone();
        if let Some(handler) = handler {
            handler(peer_id);
        }
    }

    /// Enqueue a request for `peer_id`, returning its unique ID
    pub fn send_request<R: Request>(&self, peer_id: &str, request: &R) -> Result<String, SendError> {
        let call = self.endpoint.create_call(request)?;
        let request_id = call.unique_id.clone();
        self.dispatcher
            .send_request(peer_id, RequestBundle::new(call)?)?;
        Ok(request_id)
    }

    /// Send a request to `peer_id` and await its typed response
    pub async fn call<R: Request>(
        &self,
        peer_id: &str,
        request: &R,
    ) -> Result<R::Response, CallFailure> {
        let call = self.endpoint.create_call(request).map_err(SendError::from)?;
        let request_id = call.unique_id.clone();
        let bundle = RequestBundle::new(call).map_err(SendError::from)?;

        let rx = self.registry.register(peer_id, &request_id);
        if let Err(e) = self.dispatcher.send_request(peer_id, bundle) {
            self.registry.remove(peer_id, &request_id);
            return Err(SendError::from(e).into());
        }

        let result = wait_for(rx).await?;
        Ok(result.payload_as::<R::Response>()?)
    }

    pub fn send_response<T: Response>(
        &self,
        peer_id: &str,
        request_id: &str,
        response: &T,
    ) -> Result<(), SendError> {
        let result = self.endpoint.create_call_result(response, request_id)?;
        self.transport.write(peer_id, &result.to_bytes()?)?;
        debug!("Sent response to {} for {} ({})", peer_id, request_id, result.action);
        Ok(())
    }

    pub fn send_error(
        &self,
        peer_id: &str,
        request_id: &str,
        kind: ErrorKind,
        description: &str,
        details: Option<Value>,
    ) -> Result<(), SendError> {
        let code = kind.code(self.endpoint.dialect());
        let error = self
            .endpoint
            .create_call_error(request_id, code, description, details)?;
        self.transport.write(peer_id, &error.to_bytes()?)?;
        debug!("Sent error {} to {} for {}", code, peer_id, request_id);
        Ok(())
    }

    /// Process one inbound frame from `peer_id`
    pub fn handle_incoming(&self, peer_id: &str, data: &[u8]) {
        let fields = match self.endpoint.parse_raw_message(data) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Dropping unparseable message from {}: {}", peer_id, e);
                self.notify_invalid(peer_id, &e);
                return;
            }
        };

        let state = self.dispatcher.state().client_state(peer_id);
        match self.endpoint.parse_message(&fields, &state) {
            Ok(Some(Message::Call(call))) => self.handle_request(peer_id, call),
            Ok(Some(Message::CallResult(result))) => self.handle_result(peer_id, result),
            Ok(Some(Message::CallError(error))) => self.handle_error(peer_id, error),
            Ok(None) => {}
            Err(e) => self.handle_protocol_error(peer_id, &fields, e),
        }
    }

    fn handle_request(&self, peer_id: &str, call: Call) {
        debug!("Received request {} ({}) from {}", call.unique_id, call.action, peer_id);
        let handler = self.handlers.read().request.clone();
        match handler {
            Some(handler) => handler(peer_id, call),
            None => {
                let description = format!("No handler for action {}", call.action);
                if let Err(e) = self.send_error(
                    peer_id,
                    &call.unique_id,
                    ErrorKind::NotImplemented,
                    &description,
                    None,
                ) {
                    error!("Failed to reject request {} from {}: {}", call.unique_id, peer_id, e);
                }
            }
        }
    }

    fn handle_result(&self, peer_id: &str, result: CallResult) {
        debug!(
            "Received response to {} ({}) from {}",
            result.unique_id, result.action, peer_id
        );
        self.dispatcher.complete_request(peer_id, &result.unique_id);
        let handler = self.handlers.read().response.clone();
        if let Some(handler) = handler {
            handler(peer_id, &result);
        }
        let request_id = result.unique_id.clone();
        self.registry.resolve(peer_id, &request_id, Ok(result));
    }

    fn handle_error(&self, peer_id: &str, error: CallError) {
        warn!(
            "Received error from {} for {}: {} {}",
            peer_id, error.unique_id, error.error_code, error.error_description
        );
        self.dispatcher.complete_request(peer_id, &error.unique_id);
        let handler = self.handlers.read().error.clone();
        if let Some(handler) = handler {
            handler(peer_id, &error);
        }
        self.registry.resolve(
            peer_id,
            &error.unique_id,
            Err(CallFailure::Remote {
                code: error.error_code.clone(),
                description: error.error_description.clone(),
                details: error.error_details.clone(),
            }),
        );
    }

    fn handle_protocol_error(&self, peer_id: &str, fields: &[Value], e: ProtocolError) {
        warn!("Invalid message from {}: {}", peer_id, e);
        self.notify_invalid(peer_id, &e);

        let message_type = fields
            .first()
            .and_then(Value::as_i64)
            .and_then(MessageType::from_id);
        if let (Some(MessageType::CallResult | MessageType::CallError), Some(id)) =
            (message_type, e.message_id.as_deref())
        {
            self.dispatcher.complete_request(peer_id, id);
            self.registry
                .resolve(peer_id, id, Err(CallFailure::InvalidResponse(e.clone())));
        }
        if message_type == Some(MessageType::CallError) {
            return;
        }
        if let Some(reply) = self.endpoint.call_error_for(&e) {
            match reply.to_bytes() {
                Ok(bytes) => {
                    if let Err(err) = self.transport.write(peer_id, &bytes) {
                        error!(
                            "Failed to report invalid message {} to {}: {}",
                            reply.unique_id, peer_id, err
                        );
                    }
                }
                Err(err) => error!("Failed to serialize CallError: {}", err),
            }
        }
    }

    fn notify_invalid(&self, peer_id: &str, e: &ProtocolError) {
        let handler = self.handlers.read().invalid_message.clone();
        if let Some(handler) = handler {
            handler(peer_id, e);
        }
    }
}
