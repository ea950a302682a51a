//! Charge-point side endpoint
//!
//! Combines an [`Endpoint`] with a [`ClientDispatcher`]:
//! - outbound requests go through the dispatcher queue, responses and errors
//!   are written directly
//! - inbound frames are parsed against the pending-request state and routed
//!   to handlers, completing the dispatcher on CallResult/CallError
//! - malformed inbound frames with a known ID are answered with a CallError

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{CancelReason, ClientCancelHandler, ClientDispatcher};
use crate::protocol::{
    Call, CallError, CallResult, Endpoint, ErrorKind, Message, MessageType, ProtocolError,
    Request, Response,
};
use crate::queue::RequestBundle;
use crate::registry::{wait_for, CallFailure, ResponseRegistry, SendError};
use crate::transport::{ClientTransport, ConnectionEvent};

/// Registry key used for the single server connection
const SERVER_PEER: &str = "";

pub type RequestHandler = Arc<dyn Fn(Call) + Send + Sync>;
pub type ResponseHandler = Arc<dyn Fn(&CallResult) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&CallError) + Send + Sync>;
pub type InvalidMessageHandler = Arc<dyn Fn(&ProtocolError) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    request: Option<RequestHandler>,
    response: Option<ResponseHandler>,
    error: Option<ErrorHandler>,
    invalid_message: Option<InvalidMessageHandler>,
    canceled: Option<ClientCancelHandler>,
}

pub struct Client {
    id: String,
    endpoint: Endpoint,
    dispatcher: ClientDispatcher,
    transport: Arc<dyn ClientTransport>,
    registry: Arc<ResponseRegistry>,
    handlers: Arc<RwLock<Handlers>>,
}

impl Client {
    pub fn new(
        id: impl Into<String>,
        endpoint: Endpoint,
        dispatcher: ClientDispatcher,
        transport: Arc<dyn ClientTransport>,
    ) -> Self {
        let registry = Arc::new(ResponseRegistry::new());
        let handlers = Arc::new(RwLock::new(Handlers::default()));

        dispatcher.set_network_client(Arc::clone(&transport));
        {
            let registry = Arc::clone(&registry);
            let handlers = Arc::clone(&handlers);
            dispatcher.set_on_request_canceled(move |request_id, request, reason| {
                registry.resolve(
                    SERVER_PEER,
                    request_id,
                    Err(CallFailure::Canceled(reason.clone())),
                );
                let handler = handlers.read().canceled.clone();
                if let Some(handler) = handler {
                    handler(request_id, request, reason);
                }
            });
        }

        Self {
            id: id.into(),
            endpoint,
            dispatcher,
            transport,
            registry,
            handlers,
        }
    }

    /// Charge point identity
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn dispatcher(&self) -> &ClientDispatcher {
        &self.dispatcher
    }

    /// Handler for inbound requests; answer with `send_response` or `send_error`
    pub fn set_request_handler(&self, handler: impl Fn(Call) + Send + Sync + 'static) {
        self.handlers.write().request = Some(Arc::new(handler));
    }

    pub fn set_response_handler(&self, handler: impl Fn(&CallResult) + Send + Sync + 'static) {
        self.handlers.write().response = Some(Arc::new(handler));
    }

    pub fn set_error_handler(&self, handler: impl Fn(&CallError) + Send + Sync + 'static) {
        self.handlers.write().error = Some(Arc::new(handler));
    }

    /// Handler for inbound frames that failed to parse
    pub fn set_invalid_message_handler(
        &self,
        handler: impl Fn(&ProtocolError) + Send + Sync + 'static,
    ) {
        self.handlers.write().invalid_message = Some(Arc::new(handler));
    }

    pub fn set_canceled_handler(
        &self,
        handler: impl Fn(&str, &Call, &CancelReason) + Send + Sync + 'static,
    ) {
        self.handlers.write().canceled = Some(Arc::new(handler));
    }

    /// Start dispatching. Must be called within a Tokio runtime.
    pub fn start(&self) {
        info!("Starting client {}", self.id);
        self.dispatcher.start();
    }

    /// Stop dispatching; awaiting callers fail with [`CallFailure::Stopped`]
    pub fn stop(&self) {
        self.dispatcher.stop();
        self.registry.clear();
        info!("Client {} stopped", self.id);
    }

    pub fn on_disconnected(&self, reason: Option<String>) {
        warn!("Client {} disconnected: {:?}", self.id, reason);
        self.dispatcher
            .handle_connection_event(&ConnectionEvent::Disconnected(reason));
    }

    pub fn on_reconnected(&self) {
        info!("Client {} reconnected", self.id);
        self.dispatcher
            .handle_connection_event(&ConnectionEvent::Reconnected);
    }

    /// Enqueue a request, returning its unique ID
    pub fn send_request<R: Request>(&self, request: &R) -> Result<String, SendError> {
        let call = self.endpoint.create_call(request)?;
        let request_id = call.unique_id.clone();
        self.dispatcher.send_request(RequestBundle::new(call)?)?;
        Ok(request_id)
    }

    /// Send a request and await its typed response
    pub async fn call<R: Request>(&self, request: &R) -> Result<R::Response, CallFailure> {
        let call = self.endpoint.create_call(request).map_err(SendError::from)?;
        let request_id = call.unique_id.clone();
        let bundle = RequestBundle::new(call).map_err(SendError::from)?;

        let rx = self.registry.register(SERVER_PEER, &request_id);
        if let Err(e) = self.dispatcher.send_request(bundle) {
            self.registry.remove(SERVER_PEER, &request_id);
            return Err(SendError::from(e).into());
        }

        let result = wait_for(rx).await?;
        Ok(result.payload_as::<R::Response>()?)
    }

    pub fn send_response<T: Response>(&self, request_id: &str, response: &T) -> Result<(), SendError> {
        let result = self.endpoint.create_call_result(response, request_id)?;
        self.transport.write(&result.to_bytes()?)?;
        debug!("Sent response to {} ({})", request_id, result.action);
        Ok(())
    }

    pub fn send_error(
        &self,
        request_id: &str,
        kind: ErrorKind,
        description: &str,
        details: Option<Value>,
    ) -> Result<(), SendError> {
        let code = kind.code(self.endpoint.dialect());
        let error = self
            .endpoint
            .create_call_error(request_id, code, description, details)?;
        self.transport.write(&error.to_bytes()?)?;
        debug!("Sent error {} for {}", code, request_id);
        Ok(())
    }

    /// Process one inbound frame
    pub fn handle_incoming(&self, data: &[u8]) {
        let fields = match self.endpoint.parse_raw_message(data) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Dropping unparseable message: {}", e);
                self.notify_invalid(&e);
                return;
            }
        };

        let state = self.dispatcher.state();
        match self.endpoint.parse_message(&fields, state.as_ref()) {
            Ok(Some(Message::Call(call))) => self.handle_request(call),
            Ok(Some(Message::CallResult(result))) => self.handle_result(result),
            Ok(Some(Message::CallError(error))) => self.handle_error(error),
            Ok(None) => {}
            Err(e) => self.handle_protocol_error(&fields, e),
        }
    }

    fn handle_request(&self, call: Call) {
        debug!("Received request {} ({})", call.unique_id, call.action);
        let handler = self.handlers.read().request.clone();
        match handler {
            Some(handler) => handler(call),
            None => {
                let description = format!("No handler for action {}", call.action);
                if let Err(e) =
                    self.send_error(&call.unique_id, ErrorKind::NotImplemented, &description, None)
                {
                    error!("Failed to reject request {}: {}", call.unique_id, e);
                }
            }
        }
    }

    fn handle_result(&self, result: CallResult) {
        debug!("Received response to {} ({})", result.unique_id, result.action);
        self.dispatcher.complete_request(&result.unique_id);
        let handler = self.handlers.read().response.clone();
        if let Some(handler) = handler {
            handler(&result);
        }
        let request_id = result.unique_id.clone();
        self.registry.resolve(SERVER_PEER, &request_id, Ok(result));
    }

    fn handle_error(&self, error: CallError) {
        warn!(
            "Received error for {}: {} {}",
            error.unique_id, error.error_code, error.error_description
        );
        self.dispatcher.complete_request(&error.unique_id);
        let handler = self.handlers.read().error.clone();
        if let Some(handler) = handler {
            handler(&error);
        }
        self.registry.resolve(
            SERVER_PEER,
            &error.unique_id,
            Err(CallFailure::Remote {
                code: error.error_code.clone(),
                description: error.error_description.clone(),
                details: error.error_details.clone(),
            }),
        );
    }

    fn handle_protocol_error(&self, fields: &[Value], e: ProtocolError) {
        warn!("Invalid message: {}", e);
        self.notify_invalid(&e);

        let message_type = fields
            .first()
            .and_then(Value::as_i64)
            .and_then(MessageType::from_id);
        if let (Some(MessageType::CallResult | MessageType::CallError), Some(id)) =
            (message_type, e.message_id.as_deref())
        {
            // the request was answered, just not usefully
            self.dispatcher.complete_request(id);
            self.registry
                .resolve(SERVER_PEER, id, Err(CallFailure::InvalidResponse(e.clone())));
        }
        if message_type == Some(MessageType::CallError) {
            return;
        }
        if let Some(reply) = self.endpoint.call_error_for(&e) {
            match reply.to_bytes() {
                Ok(bytes) => {
                    if let Err(err) = self.transport.write(&bytes) {
                        error!("Failed to report invalid message {}: {}", reply.unique_id, err);
                    }
                }
                Err(err) => error!("Failed to serialize CallError: {}", err),
            }
        }
    }

    fn notify_invalid(&self, e: &ProtocolError) {
        let handler = self.handlers.read().invalid_message.clone();
        if let Some(handler) = handler {
            handler(e);
        }
    }
}
