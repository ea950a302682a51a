//! End-to-end dispatch scenarios over in-memory transports

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::{assert_ok, assert_pending, assert_ready};

use ocppj_core::core_profile::{
    self, BootNotificationRequest, BootNotificationResponse, BootReason, ChargingStation,
    DataTransferRequest, DataTransferResponse, DataTransferStatus, HeartbeatRequest,
    RegistrationStatus,
};
use ocppj_core::protocol::Call;
use ocppj_core::{
    CallFailure, CancelReason, ChannelServerTransport, ChannelTransport, Client, ClientDispatcher,
    Dialect, DispatcherConfig, Endpoint, EndpointConfig, ErrorKind, FifoQueue, QueueError,
    RequestBundle, RequestQueue, Server, ServerDispatcher,
};

fn endpoint(dialect: Dialect) -> Endpoint {
    Endpoint::new(EndpointConfig::new(dialect)).with_profile(core_profile::profile())
}

fn sequential_ids(prefix: &'static str) -> impl Fn() -> String + Send + Sync + 'static {
    let counter = AtomicUsize::new(0);
    move || format!("{}-{}", prefix, counter.fetch_add(1, Ordering::Relaxed))
}

fn client(timeout: Duration, endpoint: Endpoint) -> (Client, UnboundedReceiver<Vec<u8>>) {
    let transport = Arc::new(ChannelTransport::new());
    let outbound = transport.connect();
    let dispatcher = ClientDispatcher::new(DispatcherConfig::default().with_timeout(timeout));
    (Client::new("CS001", endpoint, dispatcher, transport), outbound)
}

fn frames(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        out.push(serde_json::from_slice(&bytes).unwrap());
    }
    out
}

fn boot_request() -> BootNotificationRequest {
    BootNotificationRequest {
        charging_station: ChargingStation {
            model: "EK3".to_string(),
            vendor_name: "Elektrokombinacija".to_string(),
            serial_number: Some("SN001".to_string()),
            firmware_version: None,
        },
        reason: BootReason::PowerUp,
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[test]
fn test_queue_capacity_is_enforced() {
    let queue = FifoQueue::new(10);
    for i in 0..10 {
        let bundle = RequestBundle::new(Call {
            unique_id: i.to_string(),
            action: "Heartbeat".to_string(),
            payload: json!({}),
        })
        .unwrap();
        assert_ok!(queue.push(bundle));
    }
    assert!(queue.is_full());

    let extra = RequestBundle::new(Call {
        unique_id: "10".to_string(),
        action: "Heartbeat".to_string(),
        payload: json!({}),
    })
    .unwrap();
    assert_eq!(queue.push(extra), Err(QueueError::Full { capacity: 10 }));
    assert_eq!(queue.size(), 10);
}

#[tokio::test]
async fn test_call_result_completes_pending_request() {
    let mut ep = endpoint(Dialect::V2);
    ep.set_message_id_generator(|| "1234".to_string());
    let (client, mut outbound) = client(Duration::from_secs(30), ep);
    client.start();

    let id = client.send_request(&HeartbeatRequest {}).unwrap();
    assert_eq!(id, "1234");
    settle().await;

    assert_eq!(frames(&mut outbound), vec![json!([2, "1234", "Heartbeat", {}])]);
    assert!(client.dispatcher().state().has_pending_request());

    client.handle_incoming(br#"[3,"1234",{"currentTime":"2024-01-01T00:00:00Z"}]"#);

    assert!(!client.dispatcher().state().has_pending_request());
    assert!(client.dispatcher().queue().is_empty());
    client.stop();
}

#[tokio::test]
async fn test_orphan_response_is_ignored() {
    let mut ep = endpoint(Dialect::V2);
    ep.set_message_id_generator(|| "1234".to_string());
    let (client, mut outbound) = client(Duration::from_secs(30), ep);
    client.start();
    client.send_request(&HeartbeatRequest {}).unwrap();
    settle().await;
    frames(&mut outbound);

    client.handle_incoming(br#"[3,"9999",{"currentTime":"2024-01-01T00:00:00Z"}]"#);
    client.handle_incoming(br#"[4,"9999","GenericError","nope",{}]"#);

    assert!(client.dispatcher().state().has_pending_request());
    assert_eq!(client.dispatcher().queue().size(), 1);
    // dropped silently, nothing sent back
    assert!(frames(&mut outbound).is_empty());
    client.stop();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_once() {
    let (client, _outbound) = client(Duration::from_millis(500), endpoint(Dialect::V2));
    let canceled = Arc::new(Mutex::new(Vec::new()));
    let sink = canceled.clone();
    client.set_canceled_handler(move |id, _, reason| {
        sink.lock().unwrap().push((id.to_string(), reason.clone()));
    });
    client.start();

    let result = client.call(&HeartbeatRequest {}).await;
    assert!(matches!(result, Err(CallFailure::Canceled(CancelReason::Timeout))));

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;

    let canceled = canceled.lock().unwrap();
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].1.error_kind(), ErrorKind::GenericError);
    assert!(client.dispatcher().queue().is_empty());
    assert!(!client.dispatcher().state().has_pending_request());
}

#[tokio::test]
async fn test_disconnect_holds_queued_requests() {
    let mut ep = endpoint(Dialect::V2);
    ep.set_message_id_generator(sequential_ids("req"));
    let (client, mut outbound) = client(Duration::from_secs(30), ep);
    client.start();

    for _ in 0..8 {
        client.send_request(&HeartbeatRequest {}).unwrap();
    }
    settle().await;
    assert_eq!(frames(&mut outbound).len(), 1);

    client.on_disconnected(Some("connection reset".to_string()));
    assert!(client.dispatcher().is_paused());
    client.send_request(&HeartbeatRequest {}).unwrap();
    settle().await;

    // one sent and unanswered, eight never sent
    let state = client.dispatcher().state();
    assert!(state.get_pending_request("req-0").is_some());
    assert_eq!(client.dispatcher().queue().size(), 9);
    assert!(frames(&mut outbound).is_empty());

    client.on_reconnected();
    settle().await;
    assert!(frames(&mut outbound).is_empty());

    client.handle_incoming(br#"[3,"req-0",{"currentTime":"2024-01-01T00:00:00Z"}]"#);
    settle().await;
    let sent = frames(&mut outbound);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0][1], "req-1");
    assert_eq!(client.dispatcher().queue().size(), 8);
    client.stop();
}

#[tokio::test(start_paused = true)]
async fn test_pause_freezes_remaining_timeout() {
    let (client, _outbound) = client(Duration::from_secs(10), endpoint(Dialect::V2));
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    client.set_canceled_handler(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    client.start();
    client.send_request(&HeartbeatRequest {}).unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(4)).await;
    client.on_disconnected(None);
    settle().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    client.on_reconnected();
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    client.stop();
}

#[tokio::test]
async fn test_stalled_peer_does_not_block_others() {
    let transport = Arc::new(ChannelServerTransport::new());
    let mut ep = endpoint(Dialect::V2);
    ep.set_message_id_generator(sequential_ids("srv"));
    let server = Server::new(
        ep,
        ServerDispatcher::new(DispatcherConfig::default()),
        transport.clone(),
    );
    server.start();

    let mut to_a = transport.register("A");
    let mut to_b = transport.register("B");
    server.on_client_connected("A");
    server.on_client_connected("B");

    let data = DataTransferRequest {
        vendor_id: "EK".to_string(),
        message_id: None,
        data: None,
    };
    server.send_request("A", &data).unwrap();
    server.send_request("A", &data).unwrap();
    server.send_request("B", &data).unwrap();
    settle().await;

    assert_eq!(frames(&mut to_a).len(), 1);
    assert_eq!(frames(&mut to_b).len(), 1);
    assert_eq!(
        server.dispatcher().queues().size_per_client().get("A"),
        Some(&2)
    );
    server.stop();
}

#[tokio::test]
async fn test_invalid_call_is_answered_with_call_error() {
    let transport = Arc::new(ChannelServerTransport::new());
    let server = Server::new(
        endpoint(Dialect::V16),
        ServerDispatcher::new(DispatcherConfig::default()),
        transport.clone(),
    );
    server.start();
    let mut to_peer = transport.register("cs-1");
    server.on_client_connected("cs-1");

    server.handle_incoming("cs-1", br#"[2,"77","Unknown",{}]"#);
    server.handle_incoming("cs-1", br#"[2,"78","BootNotification",{"reason":"PowerUp"}]"#);
    server.handle_incoming("cs-1", br#"[2]"#);

    let replies = frames(&mut to_peer);
    assert_eq!(replies.len(), 2);
    assert_eq!(
        replies[0],
        json!([4, "77", "NotSupported", "Unsupported feature Unknown", {}])
    );
    assert_eq!(replies[1][1], "78");
    assert_eq!(replies[1][2], "OccurenceConstraintViolation");
    server.stop();
}

#[tokio::test]
async fn test_pending_call_resolves_on_response() {
    let mut ep = endpoint(Dialect::V2);
    ep.set_message_id_generator(|| "boot-1".to_string());
    let (client, mut outbound) = client(Duration::from_secs(30), ep);
    client.start();

    let request = boot_request();
    let mut call = tokio_test::task::spawn(client.call(&request));
    assert_pending!(call.poll());
    settle().await;
    assert_eq!(frames(&mut outbound)[0][2], "BootNotification");

    client.handle_incoming(
        br#"[3,"boot-1",{"currentTime":"2024-01-01T00:00:00Z","interval":300,"status":"Accepted"}]"#,
    );
    assert!(call.is_woken());
    let response = assert_ready!(call.poll()).unwrap();
    assert_eq!(response.interval, 300);
    assert_eq!(response.status, RegistrationStatus::Accepted);
}

/// Wire a client and a server together through channel pumps
async fn connected_pair() -> (Arc<Client>, Arc<Server>) {
    let server_transport = Arc::new(ChannelServerTransport::new());
    let server = Arc::new(Server::new(
        endpoint(Dialect::V2),
        ServerDispatcher::new(DispatcherConfig::default()),
        server_transport.clone(),
    ));
    server.start();
    let mut to_client = server_transport.register("cs-1");
    server.on_client_connected("cs-1");

    let client_transport = Arc::new(ChannelTransport::new());
    let mut to_server = client_transport.connect();
    let client = Arc::new(Client::new(
        "cs-1",
        endpoint(Dialect::V2),
        ClientDispatcher::new(DispatcherConfig::default()),
        client_transport,
    ));
    client.start();

    let c = Arc::clone(&client);
    tokio::spawn(async move {
        while let Some(bytes) = to_client.recv().await {
            c.handle_incoming(&bytes);
        }
    });
    let s = Arc::clone(&server);
    tokio::spawn(async move {
        while let Some(bytes) = to_server.recv().await {
            s.handle_incoming("cs-1", &bytes);
        }
    });

    (client, server)
}

#[tokio::test]
async fn test_boot_notification_round_trip() {
    let (client, server) = connected_pair().await;

    let weak = Arc::downgrade(&server);
    server.set_request_handler(move |peer, call| {
        let Some(server) = weak.upgrade() else { return };
        let boot: BootNotificationRequest = call.payload_as().unwrap();
        assert_eq!(boot.charging_station.vendor_name, "Elektrokombinacija");
        let response = BootNotificationResponse {
            current_time: Utc::now(),
            interval: 300,
            status: RegistrationStatus::Accepted,
            status_info: None,
        };
        server.send_response(peer, &call.unique_id, &response).unwrap();
    });

    let response = client.call(&boot_request()).await.unwrap();
    assert_eq!(response.status, RegistrationStatus::Accepted);
    assert_eq!(response.interval, 300);
    assert!(!client.dispatcher().state().has_pending_request());

    client.stop();
    server.stop();
}

#[tokio::test]
async fn test_server_call_to_client() {
    let (client, server) = connected_pair().await;

    let weak = Arc::downgrade(&client);
    client.set_request_handler(move |call| {
        let Some(client) = weak.upgrade() else { return };
        let response = DataTransferResponse {
            status: DataTransferStatus::Accepted,
            data: Some(json!({"echo": call.payload["data"].clone()})),
            status_info: None,
        };
        client.send_response(&call.unique_id, &response).unwrap();
    });

    let request = DataTransferRequest {
        vendor_id: "EK".to_string(),
        message_id: Some("ping".to_string()),
        data: Some(json!(42)),
    };
    let response = server.call("cs-1", &request).await.unwrap();
    assert_eq!(response.status, DataTransferStatus::Accepted);
    assert_eq!(response.data, Some(json!({"echo": 42})));

    client.stop();
    server.stop();
}

#[tokio::test]
async fn test_unhandled_request_yields_remote_error() {
    let (client, server) = connected_pair().await;

    let request = DataTransferRequest {
        vendor_id: "EK".to_string(),
        message_id: None,
        data: None,
    };
    match server.call("cs-1", &request).await {
        Err(CallFailure::Remote { code, .. }) => assert_eq!(code, "NotImplemented"),
        other => panic!("expected remote error, got {:?}", other),
    }
    assert!(!server.dispatcher().state().has_pending_request("cs-1"));

    client.stop();
    server.stop();
}

#[tokio::test]
async fn test_disconnect_discards_queued_calls() {
    let transport = Arc::new(ChannelServerTransport::new());
    let mut ep = endpoint(Dialect::V2);
    ep.set_message_id_generator(sequential_ids("srv"));
    let server = Arc::new(Server::new(
        ep,
        ServerDispatcher::new(DispatcherConfig::default()),
        transport.clone(),
    ));
    server.start();
    let _to_peer = transport.register("cs-1");
    server.on_client_connected("cs-1");

    let request = DataTransferRequest {
        vendor_id: "EK".to_string(),
        message_id: None,
        data: None,
    };
    let first = {
        let server = Arc::clone(&server);
        let request = request.clone();
        tokio::spawn(async move { server.call("cs-1", &request).await })
    };
    settle().await;
    let second = {
        let server = Arc::clone(&server);
        let request = request.clone();
        tokio::spawn(async move { server.call("cs-1", &request).await })
    };
    settle().await;

    server.on_client_disconnected("cs-1");
    settle().await;

    let second = second.await.unwrap();
    assert!(matches!(second, Err(CallFailure::Discarded)));
    assert!(!first.is_finished());

    // late answer for the in-flight request still resolves it
    server.handle_incoming("cs-1", br#"[3,"srv-0",{"status":"Rejected"}]"#);
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, DataTransferStatus::Rejected);
    server.stop();
}
