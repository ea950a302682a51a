//! Endpoint: message construction and parsing
//!
//! An endpoint owns the supported profiles, the wire dialect, the message ID
//! generator and the validation switch. It is shared by the client and server
//! sides:
//! - `create_*` build outbound frames, validating payloads when enabled
//! - `parse_message` turns a decoded JSON array into a [`Message`], using the
//!   pending-request state to decode responses by the action they answer

use std::fmt;
use std::sync::Arc;

use serde_json::error::Category;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::errors::{is_valid_error_code, BuildError, Dialect, ErrorKind, ProtocolError};
use super::messages::{decode_frame, Call, CallError, CallResult, Message, MessageType};
use super::profile::{Feature, PayloadError, Profile, Request, Response};
use super::validation::{Constraint, FieldViolation, ValidationErrors, ValidationSwitch};
use crate::config::EndpointConfig;
use crate::state::ClientState;

/// Produces unique IDs for outgoing calls
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub struct Endpoint {
    profiles: Vec<Profile>,
    dialect: Dialect,
    validation: ValidationSwitch,
    id_generator: IdGenerator,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("profiles", &self.profiles)
            .field("dialect", &self.dialect)
            .field("validation", &self.validation.is_enabled())
            .finish()
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(EndpointConfig::default())
    }
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            profiles: Vec::new(),
            dialect: config.dialect,
            validation: config.validation,
            id_generator: Arc::new(|| Uuid::new_v4().to_string()),
        }
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.add_profile(profile);
        self
    }

    /// Register a profile, replacing one with the same name
    pub fn add_profile(&mut self, profile: Profile) {
        self.profiles.retain(|p| p.name() != profile.name());
        self.profiles.push(profile);
    }

    pub fn get_profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name() == name)
    }

    pub fn get_profile_for_feature(&self, action: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.supports_feature(action))
    }

    pub fn supports_feature(&self, action: &str) -> bool {
        self.get_profile_for_feature(action).is_some()
    }

    fn feature(&self, action: &str) -> Option<&Feature> {
        self.profiles.iter().find_map(|p| p.get_feature(action))
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = dialect;
    }

    pub fn validation(&self) -> &ValidationSwitch {
        &self.validation
    }

    /// Replace the default uuid v4 generator
    pub fn set_message_id_generator(&mut self, generator: impl Fn() -> String + Send + Sync + 'static) {
        self.id_generator = Arc::new(generator);
    }

    /// Build a CALL for `request` with a fresh unique ID
    pub fn create_call<R: Request>(&self, request: &R) -> Result<Call, BuildError> {
        if !self.supports_feature(R::ACTION) {
            return Err(BuildError::UnsupportedAction(R::ACTION.to_string()));
        }
        if self.validation.is_enabled() {
            request.validate()?;
        }
        Ok(Call {
            unique_id: (self.id_generator)(),
            action: R::ACTION.to_string(),
            payload: serde_json::to_value(request)?,
        })
    }

    /// Build a CALLRESULT answering `unique_id`
    pub fn create_call_result<T: Response>(
        &self,
        response: &T,
        unique_id: &str,
    ) -> Result<CallResult, BuildError> {
        if !self.supports_feature(T::ACTION) {
            return Err(BuildError::UnsupportedAction(T::ACTION.to_string()));
        }
        if self.validation.is_enabled() {
            response.validate()?;
        }
        Ok(CallResult {
            unique_id: unique_id.to_string(),
            action: T::ACTION.to_string(),
            payload: serde_json::to_value(response)?,
        })
    }

    /// Build a CALLERROR answering `unique_id`
    ///
    /// `code` must be a known error code unless validation is off; details
    /// default to an empty object.
    pub fn create_call_error(
        &self,
        unique_id: &str,
        code: &str,
        description: impl Into<String>,
        details: Option<Value>,
    ) -> Result<CallError, BuildError> {
        if unique_id.is_empty() {
            return Err(BuildError::Validation(ValidationErrors::from(vec![
                FieldViolation {
                    field: "uniqueId".to_string(),
                    constraint: Constraint::Required,
                    actual: None,
                },
            ])));
        }
        if self.validation.is_enabled() && !is_valid_error_code(code) {
            return Err(BuildError::InvalidErrorCode(code.to_string()));
        }
        Ok(CallError {
            unique_id: unique_id.to_string(),
            error_code: code.to_string(),
            error_description: description.into(),
            error_details: details.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        })
    }

    /// CALLERROR reply for a parse failure, when its message ID is known
    pub fn call_error_for(&self, error: &ProtocolError) -> Option<CallError> {
        let unique_id = error.message_id.as_ref()?;
        Some(CallError {
            unique_id: unique_id.clone(),
            error_code: error.code.clone(),
            error_description: error.description.clone(),
            error_details: Value::Object(serde_json::Map::new()),
        })
    }

    fn error(&self, kind: ErrorKind, description: impl Into<String>, id: Option<&str>) -> ProtocolError {
        ProtocolError::new(kind, self.dialect, description, id)
    }

    /// Decode raw bytes into the top-level array of a frame
    pub fn parse_raw_message(&self, bytes: &[u8]) -> Result<Vec<Value>, ProtocolError> {
        decode_frame(bytes).map_err(|e| {
            self.error(
                ErrorKind::FormatViolation,
                format!("Invalid JSON array: {}", e),
                None,
            )
        })
    }

    /// Parse a decoded frame
    ///
    /// Returns `Ok(None)` for a CallResult or CallError with no matching
    /// pending request; those are dropped, never answered.
    pub fn parse_message(
        &self,
        fields: &[Value],
        state: &dyn ClientState,
    ) -> Result<Option<Message>, ProtocolError> {
        if fields.len() < 3 {
            return Err(self.error(
                ErrorKind::FormatViolation,
                "Invalid message. Expected array length >= 3",
                None,
            ));
        }

        let type_id = fields[0].as_i64().ok_or_else(|| {
            self.error(
                ErrorKind::FormatViolation,
                format!(
                    "Invalid element {} at 0, expected message type (int)",
                    element(&fields[0])
                ),
                None,
            )
        })?;

        let unique_id = fields[1].as_str().ok_or_else(|| {
            self.error(
                ErrorKind::FormatViolation,
                format!(
                    "Invalid element {} at 1, expected unique ID (string)",
                    element(&fields[1])
                ),
                None,
            )
        })?;
        if unique_id.is_empty() {
            return Err(self.error(
                ErrorKind::FormatViolation,
                "Invalid unique ID, cannot be empty",
                None,
            ));
        }

        match MessageType::from_id(type_id) {
            Some(MessageType::Call) => self.parse_call(fields, unique_id).map(Some),
            Some(MessageType::CallResult) => self.parse_call_result(fields, unique_id, state),
            Some(MessageType::CallError) => self.parse_call_error(fields, unique_id, state),
            None => Err(self.error(
                ErrorKind::MessageTypeNotSupported,
                format!("Invalid message type ID {}", type_id),
                Some(unique_id),
            )),
        }
    }

    fn parse_call(&self, fields: &[Value], unique_id: &str) -> Result<Message, ProtocolError> {
        if fields.len() != 4 {
            return Err(self.error(
                ErrorKind::FormatViolation,
                "Invalid Call message. Expected array length 4",
                Some(unique_id),
            ));
        }
        let action = fields[2].as_str().ok_or_else(|| {
            self.error(
                ErrorKind::FormatViolation,
                format!(
                    "Invalid element {} at 2, expected action (string)",
                    element(&fields[2])
                ),
                Some(unique_id),
            )
        })?;
        let feature = self.feature(action).ok_or_else(|| {
            self.error(
                ErrorKind::NotSupported,
                format!("Unsupported feature {}", action),
                Some(unique_id),
            )
        })?;

        let payload = &fields[3];
        feature
            .check_request(payload, self.validation.is_enabled())
            .map_err(|e| self.payload_error(e, action, unique_id))?;

        Ok(Message::Call(Call {
            unique_id: unique_id.to_string(),
            action: action.to_string(),
            payload: payload.clone(),
        }))
    }

    fn parse_call_result(
        &self,
        fields: &[Value],
        unique_id: &str,
        state: &dyn ClientState,
    ) -> Result<Option<Message>, ProtocolError> {
        let Some(request) = state.get_pending_request(unique_id) else {
            debug!("No pending request for {}, dropping CallResult", unique_id);
            return Ok(None);
        };
        let feature = self.feature(&request.action).ok_or_else(|| {
            self.error(
                ErrorKind::NotSupported,
                format!("Unsupported feature {}", request.action),
                Some(unique_id),
            )
        })?;

        let payload = &fields[2];
        feature
            .check_response(payload, self.validation.is_enabled())
            .map_err(|e| self.payload_error(e, &request.action, unique_id))?;

        Ok(Some(Message::CallResult(CallResult {
            unique_id: unique_id.to_string(),
            action: request.action,
            payload: payload.clone(),
        })))
    }

    fn parse_call_error(
        &self,
        fields: &[Value],
        unique_id: &str,
        state: &dyn ClientState,
    ) -> Result<Option<Message>, ProtocolError> {
        if state.get_pending_request(unique_id).is_none() {
            debug!("No pending request for {}, dropping CallError", unique_id);
            return Ok(None);
        }
        if fields.len() < 4 {
            return Err(self.error(
                ErrorKind::FormatViolation,
                "Invalid Call Error message. Expected array length >= 4",
                Some(unique_id),
            ));
        }
        let error_code = fields[2].as_str().ok_or_else(|| {
            self.error(
                ErrorKind::FormatViolation,
                format!(
                    "Invalid element {} at 2, expected rawErrorCode (string)",
                    element(&fields[2])
                ),
                Some(unique_id),
            )
        })?;
        let error_description = fields[3].as_str().ok_or_else(|| {
            self.error(
                ErrorKind::FormatViolation,
                format!(
                    "Invalid element {} at 3, expected rawErrorDescription (string)",
                    element(&fields[3])
                ),
                Some(unique_id),
            )
        })?;

        Ok(Some(Message::CallError(CallError {
            unique_id: unique_id.to_string(),
            error_code: error_code.to_string(),
            error_description: error_description.to_string(),
            error_details: fields.get(4).cloned().unwrap_or(Value::Null),
        })))
    }

    fn payload_error(&self, error: PayloadError, action: &str, unique_id: &str) -> ProtocolError {
        match error {
            PayloadError::Validation(errors) => {
                let (kind, description) = match errors.first() {
                    Some(violation) => (
                        violation.constraint.error_kind(),
                        format!("{} for feature {}", violation, action),
                    ),
                    None => (
                        ErrorKind::PropertyConstraintViolation,
                        format!("Invalid payload for feature {}", action),
                    ),
                };
                self.error(kind, description, Some(unique_id))
            }
            PayloadError::Decode(e) => self.error(
                decode_error_kind(&e),
                format!("{} for feature {}", e, action),
                Some(unique_id),
            ),
        }
    }
}

/// Classify a payload decoding failure
fn decode_error_kind(error: &serde_json::Error) -> ErrorKind {
    let message = error.to_string();
    if message.starts_with("missing field") {
        ErrorKind::OccurrenceConstraintViolation
    } else if message.starts_with("unknown variant") {
        ErrorKind::PropertyConstraintViolation
    } else if error.classify() == Category::Data {
        ErrorKind::TypeConstraintViolation
    } else {
        ErrorKind::FormatViolation
    }
}

/// Render a frame element for error descriptions, strings without quotes
fn element(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
