//! Application behavior for the two node roles
//!
//! The station role boots against a central system and keeps a heartbeat;
//! the central system accepts every station and greets it with a
//! DataTransfer once it has registered.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use ocppj_core::core_profile::{
    BootNotificationRequest, BootNotificationResponse, BootReason, ChargingStation,
    ConnectorStatus, DataTransferRequest, DataTransferResponse, DataTransferStatus,
    HeartbeatRequest, HeartbeatResponse, RegistrationStatus, StatusNotificationRequest,
    StatusNotificationResponse,
};
use ocppj_core::{Call, CallFailure, Client, ErrorKind, SendError, Server};
use serde_json::json;
use tracing::{error, info, warn};

pub const VENDOR_ID: &str = "ocppj-node";

/// Station identity sent in BootNotification
#[derive(Debug, Clone)]
pub struct StationInfo {
    pub vendor: String,
    pub model: String,
    pub firmware: Option<String>,
}

impl StationInfo {
    fn boot_request(&self) -> BootNotificationRequest {
        BootNotificationRequest {
            charging_station: ChargingStation {
                model: self.model.clone(),
                vendor_name: self.vendor.clone(),
                serial_number: None,
                firmware_version: self.firmware.clone(),
            },
            reason: BootReason::PowerUp,
        }
    }
}

// ============================================================================
// Station
// ============================================================================

/// Answer requests the central system sends to the station
pub fn install_station_handlers(client: &Arc<Client>) {
    let weak = Arc::downgrade(client);
    client.set_request_handler(move |call| {
        if let Some(client) = weak.upgrade() {
            answer_station_request(&client, call);
        }
    });
    client.set_canceled_handler(|request_id, request, reason| {
        warn!("Request {} ({}) canceled: {}", request_id, request.action, reason);
    });
}

fn answer_station_request(client: &Client, call: Call) {
    let outcome = match call.action.as_str() {
        "DataTransfer" => match call.payload_as::<DataTransferRequest>() {
            Ok(request) => {
                info!("DataTransfer from central system: {:?}", request.data);
                let status = if request.vendor_id == VENDOR_ID {
                    DataTransferStatus::Accepted
                } else {
                    DataTransferStatus::UnknownVendorId
                };
                client.send_response(
                    &call.unique_id,
                    &DataTransferResponse {
                        status,
                        data: None,
                        status_info: None,
                    },
                )
            }
            Err(e) => client.send_error(
                &call.unique_id,
                ErrorKind::FormatViolation,
                &e.to_string(),
                None,
            ),
        },
        other => client.send_error(
            &call.unique_id,
            ErrorKind::NotSupported,
            &format!("Station does not handle {}", other),
            None,
        ),
    };
    if let Err(e) = outcome {
        error!("Failed to answer {}: {}", call.unique_id, e);
    }
}

/// Boot until accepted, then report status and keep a heartbeat
pub async fn run_station(client: Arc<Client>, info: StationInfo, retry: Duration) {
    let interval = loop {
        match client.call(&info.boot_request()).await {
            Ok(BootNotificationResponse {
                status: RegistrationStatus::Accepted,
                interval,
                ..
            }) => {
                info!("Boot accepted, heartbeat interval {}s", interval);
                break interval;
            }
            Ok(response) => warn!("Boot not accepted: {:?}", response.status),
            Err(e) => warn!("Boot failed: {}", e),
        }
        tokio::time::sleep(retry).await;
    };

    let status = StatusNotificationRequest {
        timestamp: Utc::now(),
        connector_status: ConnectorStatus::Available,
        evse_id: 1,
        connector_id: 1,
    };
    if let Err(e) = client.call(&status).await {
        warn!("StatusNotification failed: {}", e);
    }

    let period = Duration::from_secs(u64::try_from(interval).unwrap_or(0).max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match client.call(&HeartbeatRequest {}).await {
            Ok(response) => info!("Heartbeat, central system time {}", response.current_time),
            Err(CallFailure::Canceled(reason)) => warn!("Heartbeat canceled: {}", reason),
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }
}

// ============================================================================
// Central system
// ============================================================================

/// Answer station requests with the given heartbeat interval
pub fn install_csms_handlers(server: &Arc<Server>, heartbeat_interval: i32) {
    let weak = Arc::downgrade(server);
    server.set_request_handler(move |peer_id, call| {
        answer_csms_request(&weak, peer_id, call, heartbeat_interval);
    });
    server.set_new_client_handler(|peer_id| info!("Station {} online", peer_id));
    server.set_client_disconnected_handler(|peer_id| info!("Station {} offline", peer_id));
    server.set_canceled_handler(|peer_id, request_id, request, reason| {
        warn!(
            "Request {} ({}) to {} canceled: {}",
            request_id, request.action, peer_id, reason
        );
    });
}

fn answer_csms_request(server: &Weak<Server>, peer_id: &str, call: Call, heartbeat_interval: i32) {
    let Some(server) = server.upgrade() else {
        return;
    };
    let outcome = match call.action.as_str() {
        "BootNotification" => match call.payload_as::<BootNotificationRequest>() {
            Ok(request) => {
                info!(
                    "Station {} booted: {} {}",
                    peer_id, request.charging_station.vendor_name, request.charging_station.model
                );
                let sent = server.send_response(
                    peer_id,
                    &call.unique_id,
                    &BootNotificationResponse {
                        current_time: Utc::now(),
                        interval: heartbeat_interval,
                        status: RegistrationStatus::Accepted,
                        status_info: None,
                    },
                );
                if sent.is_ok() {
                    greet(Arc::clone(&server), peer_id.to_string());
                }
                sent
            }
            Err(e) => decode_failure(&server, peer_id, &call, e),
        },
        "Heartbeat" => server.send_response(
            peer_id,
            &call.unique_id,
            &HeartbeatResponse {
                current_time: Utc::now(),
            },
        ),
        "StatusNotification" => match call.payload_as::<StatusNotificationRequest>() {
            Ok(request) => {
                info!(
                    "Station {} connector {}/{} is {:?}",
                    peer_id, request.evse_id, request.connector_id, request.connector_status
                );
                server.send_response(peer_id, &call.unique_id, &StatusNotificationResponse {})
            }
            Err(e) => decode_failure(&server, peer_id, &call, e),
        },
        "DataTransfer" => server.send_response(
            peer_id,
            &call.unique_id,
            &DataTransferResponse {
                status: DataTransferStatus::UnknownVendorId,
                data: None,
                status_info: None,
            },
        ),
        other => server.send_error(
            peer_id,
            &call.unique_id,
            ErrorKind::NotSupported,
            &format!("Central system does not handle {}", other),
            None,
        ),
    };
    if let Err(e) = outcome {
        error!("Failed to answer {} from {}: {}", call.unique_id, peer_id, e);
    }
}

fn decode_failure(
    server: &Server,
    peer_id: &str,
    call: &Call,
    e: serde_json::Error,
) -> Result<(), SendError> {
    server.send_error(
        peer_id,
        &call.unique_id,
        ErrorKind::FormatViolation,
        &e.to_string(),
        None,
    )
}

/// Send a DataTransfer to a freshly registered station
fn greet(server: Arc<Server>, peer_id: String) {
    tokio::spawn(async move {
        let request = DataTransferRequest {
            vendor_id: VENDOR_ID.to_string(),
            message_id: Some("Welcome".to_string()),
            data: Some(json!({ "registeredAt": Utc::now().to_rfc3339() })),
        };
        match server.call(&peer_id, &request).await {
            Ok(response) => info!("Station {} answered greeting: {:?}", peer_id, response.status),
            Err(e) => warn!("Greeting to {} failed: {}", peer_id, e),
        }
    });
}
