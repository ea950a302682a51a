//! Profiles and features
//!
//! A feature is one action with its request and response types. Features are
//! grouped into named profiles, which an endpoint consults to decide whether
//! an action is supported and how to check its payloads.

use std::collections::HashMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::validation::{Validate, ValidationErrors};

/// Outgoing or incoming request payload bound to an action
pub trait Request:
    Serialize + DeserializeOwned + Validate + Debug + Send + Sync + 'static
{
    type Response: Response;

    const ACTION: &'static str;
}

/// Response payload for an action
pub trait Response:
    Serialize + DeserializeOwned + Validate + Debug + Send + Sync + 'static
{
    const ACTION: &'static str;
}

/// Why a payload was rejected
#[derive(Debug)]
pub enum PayloadError {
    Decode(serde_json::Error),
    Validation(ValidationErrors),
}

type PayloadCheck = fn(&Value, bool) -> Result<(), PayloadError>;

fn check_payload<T: DeserializeOwned + Validate>(
    payload: &Value,
    validate: bool,
) -> Result<(), PayloadError> {
    let typed = T::deserialize(payload).map_err(PayloadError::Decode)?;
    if validate {
        typed.validate().map_err(PayloadError::Validation)?;
    }
    Ok(())
}

/// Type-erased action descriptor
#[derive(Clone, Copy)]
pub struct Feature {
    name: &'static str,
    check_request: PayloadCheck,
    check_response: PayloadCheck,
}

impl Feature {
    pub fn of<R: Request>() -> Self {
        Self {
            name: R::ACTION,
            check_request: check_payload::<R>,
            check_response: check_payload::<R::Response>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Decode a request payload and, when `validate` is set, check its constraints
    pub fn check_request(&self, payload: &Value, validate: bool) -> Result<(), PayloadError> {
        (self.check_request)(payload, validate)
    }

    pub fn check_response(&self, payload: &Value, validate: bool) -> Result<(), PayloadError> {
        (self.check_response)(payload, validate)
    }
}

impl Debug for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feature").field("name", &self.name).finish()
    }
}

/// Named group of features
#[derive(Debug, Clone)]
pub struct Profile {
    name: String,
    features: HashMap<&'static str, Feature>,
}

impl Profile {
    pub fn new(name: impl Into<String>, features: impl IntoIterator<Item = Feature>) -> Self {
        Self {
            name: name.into(),
            features: features.into_iter().map(|f| (f.name(), f)).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_feature(&mut self, feature: Feature) {
        self.features.insert(feature.name(), feature);
    }

    pub fn get_feature(&self, action: &str) -> Option<&Feature> {
        self.features.get(action)
    }

    pub fn supports_feature(&self, action: &str) -> bool {
        self.features.contains_key(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Validator;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct PingRequest {
        target: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct PingResponse {}

    impl Validate for PingRequest {
        fn validate(&self) -> Result<(), ValidationErrors> {
            Validator::new().required_str("target", &self.target).finish()
        }
    }

    impl Validate for PingResponse {
        fn validate(&self) -> Result<(), ValidationErrors> {
            Ok(())
        }
    }

    impl Request for PingRequest {
        type Response = PingResponse;
        const ACTION: &'static str = "Ping";
    }

    impl Response for PingResponse {
        const ACTION: &'static str = "Ping";
    }

    #[test]
    fn test_profile_lookup() {
        let profile = Profile::new("diagnostics", [Feature::of::<PingRequest>()]);
        assert_eq!(profile.name(), "diagnostics");
        assert!(profile.supports_feature("Ping"));
        assert!(profile.get_feature("Pong").is_none());
    }

    #[test]
    fn test_feature_checks_request_payload() {
        let feature = Feature::of::<PingRequest>();

        assert!(feature.check_request(&json!({"target": "cs-1"}), true).is_ok());
        assert!(matches!(
            feature.check_request(&json!({"target": ""}), true),
            Err(PayloadError::Validation(_))
        ));
        // constraints are skipped when validation is off, decoding is not
        assert!(feature.check_request(&json!({"target": ""}), false).is_ok());
        assert!(matches!(
            feature.check_request(&json!({"target": 5}), false),
            Err(PayloadError::Decode(_))
        ));
    }

    #[test]
    fn test_feature_checks_response_payload() {
        let feature = Feature::of::<PingRequest>();
        assert!(feature.check_response(&json!({}), true).is_ok());
        assert!(feature.check_response(&json!("pong"), true).is_err());
    }
}
