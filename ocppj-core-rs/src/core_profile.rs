//! Core profile: a small set of OCPP 2.0.1 messages
//!
//! Covers station registration and liveness:
//! - BootNotification / Heartbeat (CP -> CSMS)
//! - StatusNotification (CP -> CSMS)
//! - DataTransfer (either direction)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{Feature, Profile, Request, Response, Validate, ValidationErrors, Validator};

pub const PROFILE_NAME: &str = "core";

/// Profile with every feature of this module
pub fn profile() -> Profile {
    Profile::new(
        PROFILE_NAME,
        [
            Feature::of::<BootNotificationRequest>(),
            Feature::of::<HeartbeatRequest>(),
            Feature::of::<StatusNotificationRequest>(),
            Feature::of::<DataTransferRequest>(),
        ],
    )
}

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

// ============================================================================
// Shared types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStation {
    pub model: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

impl Validate for ChargingStation {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .required_str("model", &self.model)
            .max_len("model", &self.model, 20)
            .required_str("vendorName", &self.vendor_name)
            .max_len("vendorName", &self.vendor_name, 50)
            .opt_max_len("serialNumber", &self.serial_number, 25)
            .opt_max_len("firmwareVersion", &self.firmware_version, 50)
            .finish()
    }
}

/// Extra detail on a status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

impl Validate for StatusInfo {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .required_str("reasonCode", &self.reason_code)
            .max_len("reasonCode", &self.reason_code, 20)
            .opt_max_len("additionalInfo", &self.additional_info, 512)
            .finish()
    }
}

// ============================================================================
// BootNotification
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charging_station: ChargingStation,
    pub reason: BootReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval in seconds
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl Validate for BootNotificationRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .nested("chargingStation", &self.charging_station)
            .finish()
    }
}

impl Validate for BootNotificationResponse {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .min("interval", self.interval.into(), 0)
            .nested("statusInfo", &self.status_info)
            .finish()
    }
}

impl Request for BootNotificationRequest {
    type Response = BootNotificationResponse;
    const ACTION: &'static str = "BootNotification";
}

impl Response for BootNotificationResponse {
    const ACTION: &'static str = "BootNotification";
}

// ============================================================================
// Heartbeat
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

impl Validate for HeartbeatRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

impl Validate for HeartbeatResponse {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

impl Request for HeartbeatRequest {
    type Response = HeartbeatResponse;
    const ACTION: &'static str = "Heartbeat";
}

impl Response for HeartbeatResponse {
    const ACTION: &'static str = "Heartbeat";
}

// ============================================================================
// StatusNotification
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub timestamp: DateTime<Utc>,
    pub connector_status: ConnectorStatus,
    pub evse_id: i32,
    pub connector_id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

impl Validate for StatusNotificationRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .min("evseId", self.evse_id.into(), 0)
            .min("connectorId", self.connector_id.into(), 0)
            .finish()
    }
}

impl Validate for StatusNotificationResponse {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

impl Request for StatusNotificationRequest {
    type Response = StatusNotificationResponse;
    const ACTION: &'static str = "StatusNotification";
}

impl Response for StatusNotificationResponse {
    const ACTION: &'static str = "StatusNotification";
}

// ============================================================================
// DataTransfer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl Validate for DataTransferRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .required_str("vendorId", &self.vendor_id)
            .max_len("vendorId", &self.vendor_id, 255)
            .opt_max_len("messageId", &self.message_id, 50)
            .finish()
    }
}

impl Validate for DataTransferResponse {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .nested("statusInfo", &self.status_info)
            .finish()
    }
}

impl Request for DataTransferRequest {
    type Response = DataTransferResponse;
    const ACTION: &'static str = "DataTransfer";
}

impl Response for DataTransferResponse {
    const ACTION: &'static str = "DataTransfer";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn station(model: &str) -> ChargingStation {
        ChargingStation {
            model: model.to_string(),
            vendor_name: "Elektrokombinacija".to_string(),
            serial_number: None,
            firmware_version: Some("0.1.0".to_string()),
        }
    }

    #[test]
    fn test_profile_has_all_features() {
        let profile = profile();
        for action in ["BootNotification", "Heartbeat", "StatusNotification", "DataTransfer"] {
            assert!(profile.supports_feature(action), "{}", action);
        }
    }

    #[test]
    fn test_boot_notification_serialization() {
        let request = BootNotificationRequest {
            charging_station: station("EK3"),
            reason: BootReason::PowerUp,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["chargingStation"]["vendorName"], "Elektrokombinacija");
        assert_eq!(value["reason"], "PowerUp");
        assert!(value["chargingStation"].get("serialNumber").is_none());
    }

    #[test]
    fn test_boot_notification_model_too_long() {
        let request = BootNotificationRequest {
            charging_station: station("EK3-OCPP-with-a-long-name"),
            reason: BootReason::PowerUp,
        };
        let errors = request.validate().unwrap_err();
        assert_eq!(errors.first().unwrap().field, "chargingStation.model");
    }

    #[test]
    fn test_status_notification_rejects_negative_ids() {
        let request = StatusNotificationRequest {
            timestamp: Utc::now(),
            connector_status: ConnectorStatus::Available,
            evse_id: -1,
            connector_id: 1,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_unknown_enum_value_fails_decoding() {
        let core = profile();
        let feature = core.get_feature("StatusNotification").unwrap();
        let payload = json!({
            "timestamp": "2024-01-01T00:00:00Z",
            "connectorStatus": "Exploded",
            "evseId": 1,
            "connectorId": 1
        });
        assert!(feature.check_request(&payload, true).is_err());
    }
}
