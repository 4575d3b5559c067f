use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes surfaced by the broker components.
///
/// The kind is what failure reports carry; the coordinators use
/// [`ErrorKind::is_retryable`] to decide between replaying an event and
/// surfacing the failure to the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedCertificate,
    DuplicateDevice,
    MissingPolicy,
    InvalidTransition,
    Timeout,
    StoreUnavailable,
    CertificateNotFound,
    DeviceNotFound,
    UnknownThingType,
    InvalidEvent,
    UnexpectedResponse,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedCertificate => "malformed_certificate",
            Self::DuplicateDevice => "duplicate_device",
            Self::MissingPolicy => "missing_policy",
            Self::InvalidTransition => "invalid_transition",
            Self::Timeout => "timeout",
            Self::StoreUnavailable => "store_unavailable",
            Self::CertificateNotFound => "certificate_not_found",
            Self::DeviceNotFound => "device_not_found",
            Self::UnknownThingType => "unknown_thing_type",
            Self::InvalidEvent => "invalid_event",
            Self::UnexpectedResponse => "unexpected_response",
        }
    }

    /// Retryable kinds are safe to handle by replaying the whole event.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::StoreUnavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("device '{identity}' already registered with thing type '{existing_type}', refusing '{requested_type}'")]
    DuplicateDevice {
        identity: String,
        existing_type: String,
        requested_type: String,
    },

    #[error("policy '{0}' does not exist")]
    MissingPolicy(String),

    #[error("certificate '{certificate_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        certificate_id: String,
        from: String,
        to: String,
    },

    #[error("{operation} did not complete within {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("certificate '{0}' not found")]
    CertificateNotFound(String),

    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    #[error("thing type '{0}' does not exist")]
    UnknownThingType(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The call was accepted but its response could not be read, so whether
    /// it applied is unknown.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedCertificate(_) => ErrorKind::MalformedCertificate,
            Self::DuplicateDevice { .. } => ErrorKind::DuplicateDevice,
            Self::MissingPolicy(_) => ErrorKind::MissingPolicy,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::CertificateNotFound(_) => ErrorKind::CertificateNotFound,
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::UnknownThingType(_) => ErrorKind::UnknownThingType,
            Self::InvalidEvent(_) => ErrorKind::InvalidEvent,
            Self::UnexpectedResponse(_) => ErrorKind::UnexpectedResponse,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
