//! Client engine configuration.
//!
//! Provides default deadline and relaunch values, which individual
//! calls may override.

use std::time::Duration;

use grapnel_core::LoggerCallback;
use grapnel_wire::ChannelCredentials;

use crate::call::RelaunchPolicy;

/// Errors surfaced synchronously by configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("empty address")]
    EmptyAddress,
    #[error("invalid {name}, should be at least {min:?}")]
    DurationTooShort { name: &'static str, min: Duration },
    #[error("size limit should be positive")]
    NonPositiveLimit,
}

const MIN_DEADLINE: Duration = Duration::from_millis(10);
const MIN_RELAUNCH_INTERVAL: Duration = Duration::from_millis(100);

/// Client engine options.
#[derive(Clone)]
pub struct Options {
    address: String,
    credentials: ChannelCredentials,
    singular_call_deadline: Duration,
    server_stream_deadline: Duration,
    server_stream_relaunch_interval: Duration,
    server_stream_relaunch_policy: RelaunchPolicy,
    request_size_limit_bytes: Option<usize>,
    response_size_limit_bytes: Option<usize>,
}

impl Options {
    pub fn new(address: impl Into<String>) -> Result<Self, ConfigError> {
        let address = address.into();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        Ok(Options {
            address,
            credentials: ChannelCredentials::insecure(),
            singular_call_deadline: Duration::from_secs(1),
            server_stream_deadline: Duration::from_secs(1),
            server_stream_relaunch_interval: Duration::from_secs(5),
            server_stream_relaunch_policy: RelaunchPolicy::Relaunch,
            request_size_limit_bytes: Some(32 * 1024 * 1024),
            response_size_limit_bytes: Some(32 * 1024 * 1024),
        })
    }

    pub fn with_credentials(mut self, credentials: ChannelCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_singular_call_deadline(mut self, deadline: Duration) -> Result<Self, ConfigError> {
        if deadline < MIN_DEADLINE {
            return Err(ConfigError::DurationTooShort {
                name: "singular call deadline",
                min: MIN_DEADLINE,
            });
        }
        self.singular_call_deadline = deadline;
        Ok(self)
    }

    pub fn with_server_stream_deadline(mut self, deadline: Duration) -> Result<Self, ConfigError> {
        if deadline < MIN_DEADLINE {
            return Err(ConfigError::DurationTooShort {
                name: "server stream deadline",
                min: MIN_DEADLINE,
            });
        }
        self.server_stream_deadline = deadline;
        Ok(self)
    }

    pub fn with_server_stream_relaunch_interval(
        mut self,
        interval: Duration,
    ) -> Result<Self, ConfigError> {
        if interval < MIN_RELAUNCH_INTERVAL {
            return Err(ConfigError::DurationTooShort {
                name: "server stream relaunch interval",
                min: MIN_RELAUNCH_INTERVAL,
            });
        }
        self.server_stream_relaunch_interval = interval;
        Ok(self)
    }

    pub fn with_server_stream_relaunch_policy(mut self, policy: RelaunchPolicy) -> Self {
        self.server_stream_relaunch_policy = policy;
        self
    }

    /// `None` means unlimited.
    pub fn with_request_size_limit_bytes(
        mut self,
        limit: Option<usize>,
    ) -> Result<Self, ConfigError> {
        if limit == Some(0) {
            return Err(ConfigError::NonPositiveLimit);
        }
        self.request_size_limit_bytes = limit;
        Ok(self)
    }

    /// `None` means unlimited.
    pub fn with_response_size_limit_bytes(
        mut self,
        limit: Option<usize>,
    ) -> Result<Self, ConfigError> {
        if limit == Some(0) {
            return Err(ConfigError::NonPositiveLimit);
        }
        self.response_size_limit_bytes = limit;
        Ok(self)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn credentials(&self) -> &ChannelCredentials {
        &self.credentials
    }

    pub fn singular_call_deadline(&self) -> Duration {
        self.singular_call_deadline
    }

    pub fn server_stream_deadline(&self) -> Duration {
        self.server_stream_deadline
    }

    pub fn server_stream_relaunch_interval(&self) -> Duration {
        self.server_stream_relaunch_interval
    }

    pub fn server_stream_relaunch_policy(&self) -> RelaunchPolicy {
        self.server_stream_relaunch_policy
    }

    pub fn request_size_limit_bytes(&self) -> Option<usize> {
        self.request_size_limit_bytes
    }

    pub fn response_size_limit_bytes(&self) -> Option<usize> {
        self.response_size_limit_bytes
    }
}

/// User-provided environment, mirroring the server side: the logging
/// sink every engine object shares.
#[derive(Clone)]
pub struct Environment {
    logger_callback: LoggerCallback,
}

impl Environment {
    pub fn new(logger_callback: LoggerCallback) -> Self {
        Environment { logger_callback }
    }

    pub fn logger_callback(&self) -> LoggerCallback {
        self.logger_callback.clone()
    }
}
