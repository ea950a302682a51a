//! WebSocket plumbing for the node
//!
//! Bridges tokio-tungstenite connections to the channel transports of
//! `ocppj-core`:
//! - server: accepts peers on `<path>/<peer id>`, negotiates the OCPP
//!   subprotocol, and pumps frames in both directions per peer
//! - client: connects with exponential backoff, pausing the dispatcher while
//!   disconnected and resuming it once connected again

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ocppj_core::{ChannelServerTransport, ChannelTransport, Client, Dialect, Server};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reconnection backoff for the client side
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Initial reconnect delay
    pub initial: Duration,
    /// Maximum reconnect delay
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Accept peers until the listener fails
pub async fn run_server(
    server: Arc<Server>,
    transport: Arc<ChannelServerTransport>,
    port: u16,
    path: String,
    dialect: Dialect,
) -> Result<(), BoxError> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on ws://{}{}/<station id>", addr, path);

    loop {
        let (stream, remote) = listener.accept().await?;
        let server = Arc::clone(&server);
        let transport = Arc::clone(&transport);
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_peer(server, transport, stream, remote, &path, dialect).await {
                warn!("Connection from {} ended: {}", remote, e);
            }
        });
    }
}

/// Peer ID from a request path of the form `<prefix>/<id>`
fn peer_id_from_path(prefix: &str, path: &str) -> Option<String> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest.to_string())
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

async fn serve_peer(
    server: Arc<Server>,
    transport: Arc<ChannelServerTransport>,
    stream: TcpStream,
    remote: SocketAddr,
    prefix: &str,
    dialect: Dialect,
) -> Result<(), BoxError> {
    let mut peer_id = None;
    let handshake = |request: &Request, mut response: Response| {
        let Some(id) = peer_id_from_path(prefix, request.uri().path()) else {
            return Err(reject(StatusCode::NOT_FOUND, "expected <path>/<station id>"));
        };
        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !offered.split(',').any(|p| p.trim() == dialect.subprotocol()) {
            return Err(reject(StatusCode::BAD_REQUEST, "unsupported OCPP subprotocol"));
        }
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(dialect.subprotocol()),
        );
        peer_id = Some(id);
        Ok(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, handshake).await?;
    let Some(peer_id) = peer_id else {
        return Err("handshake completed without a peer id".into());
    };
    info!("Peer {} connected from {}", peer_id, remote);

    let mut outbound = transport.register(&peer_id);
    server.on_client_connected(&peer_id);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let outcome: Result<(), BoxError> = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(bytes) = frame else { break Ok(()) };
                debug!("Sending to {}: {}", peer_id, String::from_utf8_lossy(&bytes));
                if let Err(e) = ws_tx.send(Message::Text(String::from_utf8_lossy(&bytes).into_owned())).await {
                    break Err(e.into());
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received from {}: {}", peer_id, text);
                        server.handle_incoming(&peer_id, text.as_bytes());
                    }
                    Some(Ok(Message::Binary(data))) => server.handle_incoming(&peer_id, &data),
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                }
            }
        }
    };

    transport.unregister(&peer_id);
    server.on_client_disconnected(&peer_id);
    outcome
}

/// Keep the client connected, reconnecting with exponential backoff
pub async fn run_client(
    client: Arc<Client>,
    transport: Arc<ChannelTransport>,
    url: String,
    dialect: Dialect,
    backoff: Backoff,
) {
    // nothing may be written before the first connection
    client.dispatcher().pause();
    let mut delay = backoff.initial;

    loop {
        info!("Connecting to {}", url);
        match connect_and_run(&client, &transport, &url, dialect).await {
            Ok(()) => {
                info!("Connection closed by server");
                delay = backoff.initial;
                client.on_disconnected(Some("closed by server".to_string()));
            }
            Err(e) => {
                error!("Connection error: {}", e);
                client.on_disconnected(Some(e.to_string()));
            }
        }
        transport.disconnect();

        info!("Reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, backoff.max);
    }
}

async fn connect_and_run(
    client: &Client,
    transport: &ChannelTransport,
    url: &str,
    dialect: Dialect,
) -> Result<(), BoxError> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(dialect.subprotocol()),
    );

    let (ws_stream, response) = tokio_tungstenite::connect_async(request).await?;
    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(dialect.subprotocol()) {
        warn!(
            "Server did not accept subprotocol {}, got: {:?}",
            dialect.subprotocol(),
            accepted
        );
    }
    info!("WebSocket connected to {}", url);

    let mut outbound = transport.connect();
    client.on_reconnected();

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(bytes) = frame else { return Ok(()) };
                debug!("Sending: {}", String::from_utf8_lossy(&bytes));
                ws_tx.send(Message::Text(String::from_utf8_lossy(&bytes).into_owned())).await?;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received: {}", text);
                        client.handle_incoming(text.as_bytes());
                    }
                    Some(Ok(Message::Binary(data))) => client.handle_incoming(&data),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}
