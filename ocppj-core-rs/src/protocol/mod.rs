//! OCPP-J message protocol layer

pub mod endpoint;
pub mod errors;
pub mod messages;
pub mod profile;
pub mod validation;

pub use endpoint::{Endpoint, IdGenerator};
pub use errors::{error_code_for, is_valid_error_code, BuildError, Dialect, ErrorKind, ProtocolError};
pub use messages::{decode_frame, Call, CallError, CallResult, Message, MessageType};
pub use profile::{Feature, PayloadError, Profile, Request, Response};
pub use validation::{
    Constraint, FieldViolation, Validate, ValidationErrors, ValidationSwitch, Validator,
};
