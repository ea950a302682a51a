//! OCPP-J message framing
//!
//! Every OCPP-J frame is a JSON array whose first element is the message type:
//! - CALL: [2, uniqueId, action, payload]
//! - CALLRESULT: [3, uniqueId, payload]
//! - CALLERROR: [4, uniqueId, errorCode, errorDescription, errorDetails]

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::errors::ErrorKind;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Serialize to wire format: [2, uniqueId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.unique_id,
            &self.action,
            &self.payload
        ]);
        serde_json::to_vec(&array)
    }

    /// Decode the payload as a concrete request type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub unique_id: String,
    /// Action of the request this answers. Not transmitted; recovered from
    /// the pending request when parsing.
    pub action: String,
    pub payload: Value,
}

impl CallResult {
    /// Serialize to wire format: [3, uniqueId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.unique_id,
            &self.payload
        ]);
        serde_json::to_vec(&array)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub unique_id: String,
    /// Raw wire code, kept as received
    pub error_code: String,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Classify the wire code, if it is a known one in either dialect
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(&self.error_code)
    }

    /// Serialize to wire format: [4, uniqueId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let details = match &self.error_details {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.unique_id,
            &self.error_code,
            &self.error_description,
            details
        ]);
        serde_json::to_vec(&array)
    }
}

/// Parsed OCPP-J message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Message {
    pub fn unique_id(&self) -> &str {
        match self {
            Message::Call(m) => &m.unique_id,
            Message::CallResult(m) => &m.unique_id,
            Message::CallError(m) => &m.unique_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Call(_) => MessageType::Call,
            Message::CallResult(_) => MessageType::CallResult,
            Message::CallError(_) => MessageType::CallError,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Message::Call(m) => m.to_bytes(),
            Message::CallResult(m) => m.to_bytes(),
            Message::CallError(m) => m.to_bytes(),
        }
    }
}

/// Decode raw bytes into the top-level JSON array of a frame
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<Value>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_format() {
        let call = Call {
            unique_id: "1234".into(),
            action: "Heartbeat".into(),
            payload: json!({}),
        };
        let bytes = call.to_bytes().unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"[2,"1234","Heartbeat",{}]"#);
    }

    #[test]
    fn test_call_result_omits_action() {
        let result = CallResult {
            unique_id: "1234".into(),
            action: "Heartbeat".into(),
            payload: json!({"currentTime": "2024-01-01T00:00:00Z"}),
        };
        let value: Value = serde_json::from_slice(&result.to_bytes().unwrap()).unwrap();
        assert_eq!(value, json!([3, "1234", {"currentTime": "2024-01-01T00:00:00Z"}]));
    }

    #[test]
    fn test_call_error_null_details_become_object() {
        let error = CallError {
            unique_id: "1234".into(),
            error_code: "GenericError".into(),
            error_description: "Request timed out".into(),
            error_details: Value::Null,
        };
        let value: Value = serde_json::from_slice(&error.to_bytes().unwrap()).unwrap();
        assert_eq!(value, json!([4, "1234", "GenericError", "Request timed out", {}]));
        assert_eq!(error.kind(), Some(ErrorKind::GenericError));
    }

    #[test]
    fn test_decode_frame_rejects_non_array() {
        assert!(decode_frame(br#"{"not": "an array"}"#).is_err());
        assert!(decode_frame(b"[2, \"1\"").is_err());
        assert_eq!(decode_frame(b"[]").unwrap().len(), 0);
    }

    #[test]
    fn test_message_accessors() {
        let message = Message::Call(Call {
            unique_id: "abc".into(),
            action: "Heartbeat".into(),
            payload: json!({}),
        });
        assert_eq!(message.unique_id(), "abc");
        assert_eq!(message.message_type(), MessageType::Call);
        assert_eq!(MessageType::from_id(5), None);
    }
}
