//! Custom error types for the gateway.
//!
//! This module defines the primary error type, `GatewayError`, for the whole crate.
//! Using the `thiserror` crate, it provides a single place to describe everything that
//! can go wrong, from configuration problems to a serial adapter disappearing from the
//! USB bus.
//!
//! ## Severity
//!
//! Not every error is treated the same way. [`GatewayError::severity`] sorts them into
//! three buckets:
//!
//! - **`Transient`**: connectivity failures (device discovery miss, port open failure,
//!   serial read/write error). Worker loops turn these into a `Down` state transition
//!   and retry; they never reach the caller.
//! - **`Dropped`**: a single unit of input (a datagram, a persistence insert) could not
//!   be handled. It is logged and skipped.
//! - **`Fatal`**: startup cannot continue (bad configuration, network never became
//!   usable). These propagate out of `main`.

use thiserror::Error;

/// Convenience alias for results using the gateway error type.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Errors produced anywhere in the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid USB id '{0}': expected a hexadecimal string or an integer")]
    InvalidDeviceId(String),

    #[error("Cannot find device with vid {vid:#06x} and pid {pid:#06x}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Could not enumerate serial ports: {0}")]
    PortEnumeration(String),

    #[error("Failed to open serial port '{port}': {reason}")]
    SerialOpen { port: String, reason: String },

    #[error("Malformed datagram: {0}")]
    Datagram(String),

    #[error("Network did not initialize within {waited_secs}s (bind {address})")]
    NetworkTimeout { address: String, waited_secs: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

/// How an error is handled by the component that observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Connectivity loss; retried by the owning worker loop.
    Transient,
    /// The offending unit is discarded and processing continues.
    Dropped,
    /// Aborts startup.
    Fatal,
}

impl GatewayError {
    /// Classify this error for the propagation policy.
    pub fn severity(&self) -> Severity {
        match self {
            GatewayError::DeviceNotFound { .. }
            | GatewayError::PortEnumeration(_)
            | GatewayError::SerialOpen { .. }
            | GatewayError::Io(_) => Severity::Transient,
            GatewayError::Datagram(_) | GatewayError::Storage(_) => Severity::Dropped,
            GatewayError::Config(_)
            | GatewayError::Configuration(_)
            | GatewayError::InvalidDeviceId(_)
            | GatewayError::NetworkTimeout { .. }
            | GatewayError::FeatureNotEnabled(_) => Severity::Fatal,
        }
    }

    /// Whether a worker loop may retry after this error.
    pub fn is_transient(&self) -> bool {
        self.severity() == Severity::Transient
    }
}

impl From<figment::Error> for GatewayError {
    fn from(value: figment::Error) -> Self {
        GatewayError::Config(Box::new(value))
    }
}
