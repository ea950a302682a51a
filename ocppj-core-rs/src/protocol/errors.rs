//! OCPP-J error codes, dialects and error types
//!
//! The same failure is spelled differently depending on the negotiated OCPP
//! version. Failures are classified with an abstract [`ErrorKind`] and turned
//! into a wire code through a lookup table keyed by (kind, dialect).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::validation::ValidationErrors;

/// Protocol version family, deciding error-code spelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    /// OCPP 1.6
    V16,
    /// OCPP 2.0.1 and 2.1
    #[default]
    V2,
}

impl Dialect {
    /// WebSocket subprotocol announced for this dialect
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Dialect::V16 => "ocpp1.6",
            Dialect::V2 => "ocpp2.0.1",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subprotocol())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ocpp1.6" | "1.6" | "v16" => Ok(Dialect::V16),
            "ocpp2.0.1" | "2.0.1" | "ocpp2.1" | "2.1" | "v2" => Ok(Dialect::V2),
            other => Err(format!("unknown OCPP dialect: {}", other)),
        }
    }
}

/// Abstract failure classification, independent of the wire dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FormatViolation,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    TypeConstraintViolation,
    NotSupported,
    NotImplemented,
    InternalError,
    GenericError,
    SecurityError,
    ProtocolError,
    MessageTypeNotSupported,
    RpcFrameworkError,
}

/// (kind, OCPP 1.6 spelling, OCPP 2.x spelling)
const ERROR_CODES: &[(ErrorKind, &str, &str)] = &[
    (ErrorKind::FormatViolation, "FormationViolation", "FormatViolation"),
    (
        ErrorKind::OccurrenceConstraintViolation,
        "OccurenceConstraintViolation",
        "OccurrenceConstraintViolation",
    ),
    (
        ErrorKind::PropertyConstraintViolation,
        "PropertyConstraintViolation",
        "PropertyConstraintViolation",
    ),
    (
        ErrorKind::TypeConstraintViolation,
        "TypeConstraintViolation",
        "TypeConstraintViolation",
    ),
    (ErrorKind::NotSupported, "NotSupported", "NotSupported"),
    (ErrorKind::NotImplemented, "NotImplemented", "NotImplemented"),
    (ErrorKind::InternalError, "InternalError", "InternalError"),
    (ErrorKind::GenericError, "GenericError", "GenericError"),
    (ErrorKind::SecurityError, "SecurityError", "SecurityError"),
    (ErrorKind::ProtocolError, "ProtocolError", "ProtocolError"),
    (
        ErrorKind::MessageTypeNotSupported,
        "MessageTypeNotSupported",
        "MessageTypeNotSupported",
    ),
    // 1.6 has no framework error; GenericError is the closest code it knows
    (ErrorKind::RpcFrameworkError, "GenericError", "RpcFrameworkError"),
];

/// Wire error code for a failure kind in the given dialect
pub fn error_code_for(kind: ErrorKind, dialect: Dialect) -> &'static str {
    ERROR_CODES
        .iter()
        .find(|(k, _, _)| *k == kind)
        .map(|(_, v16, v2)| match dialect {
            Dialect::V16 => *v16,
            Dialect::V2 => *v2,
        })
        .unwrap_or("GenericError")
}

/// Whether `code` is a known error code in any dialect
pub fn is_valid_error_code(code: &str) -> bool {
    ErrorKind::from_code(code).is_some()
}

impl ErrorKind {
    /// Wire spelling for this kind
    pub fn code(self, dialect: Dialect) -> &'static str {
        error_code_for(self, dialect)
    }

    /// Classify a wire code, accepting the spelling of any dialect
    pub fn from_code(code: &str) -> Option<ErrorKind> {
        ERROR_CODES
            .iter()
            .find(|(_, v16, v2)| *v16 == code || *v2 == code)
            .map(|(kind, _, _)| *kind)
    }
}

/// Protocol-level failure, addressed to a conversation when the ID is known
///
/// This is what the parser produces for malformed or invalid inbound frames;
/// it converts directly into a CallError reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {description}")]
pub struct ProtocolError {
    pub kind: ErrorKind,
    /// Dialect-specific wire code
    pub code: String,
    pub description: String,
    /// Unique ID of the offending message, when it could be extracted
    pub message_id: Option<String>,
}

impl ProtocolError {
    pub fn new(
        kind: ErrorKind,
        dialect: Dialect,
        description: impl Into<String>,
        message_id: Option<&str>,
    ) -> Self {
        Self {
            kind,
            code: kind.code(dialect).to_string(),
            description: description.into(),
            message_id: message_id.map(str::to_string),
        }
    }
}

/// Failures while building an outgoing message
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("invalid error code: {0}")]
    InvalidErrorCode(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
