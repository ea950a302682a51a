//! Configuration for endpoints and dispatchers

use std::time::Duration;

use crate::dispatcher::DEFAULT_MESSAGE_TIMEOUT;
use crate::protocol::{Dialect, ValidationSwitch};

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum queued requests per connection (0 = unbounded)
    pub queue_capacity: usize,

    /// Response timeout for an in-flight request (zero disables it)
    pub timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 0,
            timeout: DEFAULT_MESSAGE_TIMEOUT,
        }
    }
}

impl DispatcherConfig {
    /// Set queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Disable response timeouts
    pub fn without_timeout(mut self) -> Self {
        self.timeout = Duration::ZERO;
        self
    }
}

/// Endpoint configuration
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    /// Error-code spelling used on the wire
    pub dialect: Dialect,

    /// Payload validation switch, possibly shared with other endpoints
    pub validation: ValidationSwitch,
}

impl EndpointConfig {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            validation: ValidationSwitch::default(),
        }
    }

    /// Share an existing validation switch
    pub fn with_validation(mut self, validation: ValidationSwitch) -> Self {
        self.validation = validation;
        self
    }

    /// Start with validation disabled
    pub fn without_validation(self) -> Self {
        self.with_validation(ValidationSwitch::new(false))
    }
}
