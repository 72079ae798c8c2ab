//! Service engine configuration.

use std::collections::BTreeMap;

use grapnel_core::LoggerCallback;
use grapnel_wire::ServerCredentials;

/// Errors surfaced synchronously by configuration and registration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("service name must be non-empty")]
    EmptyServiceName,
    #[error("empty endpoint address")]
    EmptyAddress,
    #[error("non-unique endpoint address: {0}")]
    DuplicateAddress(String),
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange { name: &'static str, min: usize, max: usize, value: usize },
    #[error("method registered twice: {0}")]
    DuplicateMethod(String),
    #[error(
        "descriptor type mismatch for {method}: registered message is {registered}, descriptor declares {declared}"
    )]
    TypeMismatch { method: String, registered: &'static str, declared: String },
    #[error("streaming kind of {0} does not match the registration")]
    KindMismatch(String),
    #[error("none of the methods are registered")]
    NoMethodsRegistered,
    #[error("engine is already running")]
    AlreadyRunning,
}

const COUNT_MIN: usize = 1;
const COUNT_MAX: usize = 1024;

fn bounded(name: &'static str, value: usize) -> Result<usize, ConfigError> {
    if !(COUNT_MIN..=COUNT_MAX).contains(&value) {
        return Err(ConfigError::OutOfRange { name, min: COUNT_MIN, max: COUNT_MAX, value });
    }
    Ok(value)
}

/// Engine options: bind addresses and pool sizing.
#[derive(Clone)]
pub struct Options {
    service_name: String,
    endpoints: BTreeMap<String, ServerCredentials>,
    queue_count: usize,
    threads_per_queue: usize,
    handlers_per_thread: usize,
}

impl Options {
    /// The service name is also used to name worker threads; use the
    /// generated service's full name.
    pub fn new(service_name: impl Into<String>) -> Result<Self, ConfigError> {
        let service_name = service_name.into();
        if service_name.is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        Ok(Options {
            service_name,
            endpoints: BTreeMap::new(),
            queue_count: 1,
            threads_per_queue: 1,
            handlers_per_thread: 1,
        })
    }

    pub fn add_endpoint(
        mut self,
        address: impl Into<String>,
        credentials: ServerCredentials,
    ) -> Result<Self, ConfigError> {
        let address = address.into();
        if address.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.endpoints.contains_key(&address) {
            return Err(ConfigError::DuplicateAddress(address));
        }
        self.endpoints.insert(address, credentials);
        Ok(self)
    }

    pub fn with_queue_count(mut self, count: usize) -> Result<Self, ConfigError> {
        self.queue_count = bounded("queue count", count)?;
        Ok(self)
    }

    pub fn with_threads_per_queue(mut self, count: usize) -> Result<Self, ConfigError> {
        self.threads_per_queue = bounded("threads per queue", count)?;
        Ok(self)
    }

    pub fn with_handlers_per_thread(mut self, count: usize) -> Result<Self, ConfigError> {
        self.handlers_per_thread = bounded("handlers per thread", count)?;
        Ok(self)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn endpoints(&self) -> &BTreeMap<String, ServerCredentials> {
        &self.endpoints
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    pub fn threads_per_queue(&self) -> usize {
        self.threads_per_queue
    }

    pub fn handlers_per_thread(&self) -> usize {
        self.handlers_per_thread
    }
}

/// User-provided environment: the logging sink and whatever else the
/// embedder wants every engine object to share.
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
