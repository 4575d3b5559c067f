use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{BrokerError, ErrorKind};
use crate::identity::DeviceIdentity;

pub const FAILURE_REPORT_SCHEMA_VERSION: &str = "v1";

pub type Fields = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateStatus {
    Pending,
    Active,
    Revoked,
}

impl CertificateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Revoked => "REVOKED",
        }
    }

    /// Applies a lifecycle transition, returning the resulting status.
    ///
    /// Re-applying the current status is a no-op except out of `REVOKED`,
    /// which is terminal.
    pub fn transition(
        self,
        certificate_id: &str,
        target: CertificateStatus,
    ) -> Result<CertificateStatus, BrokerError> {
        match (self, target) {
            (Self::Revoked, _) | (Self::Active, Self::Pending) => {
                Err(BrokerError::InvalidTransition {
                    certificate_id: certificate_id.to_string(),
                    from: self.as_str().to_string(),
                    to: target.as_str().to_string(),
                })
            }
            (_, target) => Ok(target),
        }
    }
}

impl std::fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificate {
    pub certificate_id: String,
    pub certificate_pem: String,
    pub certificate_arn: String,
    pub status: CertificateStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub identity: DeviceIdentity,
    pub thing_type: String,
    pub principals: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRegistered {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(alias = "awsAccountId")]
    pub account_id: String,
    pub certificate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_pem: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReceived {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_identity: Option<DeviceIdentity>,
    pub fields: Fields,
}

impl CertificateRegistered {
    pub fn normalized(mut self) -> Result<Self, BrokerError> {
        self.account_id = self.account_id.trim().to_string();
        self.certificate_id = self.certificate_id.trim().to_string();
        if self.account_id.is_empty() {
            return Err(BrokerError::InvalidEvent(
                "accountId cannot be empty".to_string(),
            ));
        }
        if self.certificate_id.is_empty() {
            return Err(BrokerError::InvalidEvent(
                "certificateId cannot be empty".to_string(),
            ));
        }
        if matches!(&self.certificate_pem, Some(pem) if pem.trim().is_empty()) {
            self.certificate_pem = None;
        }
        Ok(self)
    }

    pub fn event_id(&self) -> String {
        self.event_id
            .clone()
            .unwrap_or_else(|| contract_fingerprint(self))
    }
}

impl TelemetryReceived {
    /// Decodes a telemetry payload.
    ///
    /// Accepts the structured `{deviceIdentity, fields}` shape and a bare
    /// reading object such as `{"Light": 250}`. A bare object may still carry
    /// `deviceIdentity` and `eventId`; those are lifted out of the readings.
    pub fn from_value(value: Value) -> Result<Self, BrokerError> {
        let Value::Object(mut object) = value else {
            return Err(BrokerError::InvalidEvent(
                "telemetry payload must be a JSON object".to_string(),
            ));
        };

        if object.contains_key("fields") {
            return serde_json::from_value(Value::Object(object))
                .map_err(|error| BrokerError::InvalidEvent(format!("malformed telemetry: {error}")));
        }

        let event_id = match object.remove("eventId") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(_) => {
                return Err(BrokerError::InvalidEvent(
                    "eventId must be a string".to_string(),
                ))
            }
        };
        let device_identity = match object.remove("deviceIdentity") {
            None | Some(Value::Null) => None,
            Some(Value::String(identity)) => Some(DeviceIdentity::new(identity)),
            Some(_) => {
                return Err(BrokerError::InvalidEvent(
                    "deviceIdentity must be a string".to_string(),
                ))
            }
        };

        Ok(Self {
            event_id,
            device_identity,
            fields: object.into_iter().collect(),
        })
    }

    pub fn event_id(&self) -> String {
        self.event_id
            .clone()
            .unwrap_or_else(|| contract_fingerprint(self))
    }
}

/// Ordered stages of event handling; failure reports name the last one that
/// completed and the one that failed.
pub trait EventStep: Copy {
    fn next(self) -> Option<Self>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStep {
    Received,
    IdentityDerived,
    DeviceRegistered,
    PolicyBound,
    Activated,
}

impl EventStep for ProvisioningStep {
    fn next(self) -> Option<Self> {
        match self {
            Self::Received => Some(Self::IdentityDerived),
            Self::IdentityDerived => Some(Self::DeviceRegistered),
            Self::DeviceRegistered => Some(Self::PolicyBound),
            Self::PolicyBound => Some(Self::Activated),
            Self::Activated => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryStep {
    Received,
    RuleEvaluated,
    ReportedMirrored,
    DesiredUpdated,
}

impl EventStep for TelemetryStep {
    fn next(self) -> Option<Self> {
        match self {
            Self::Received => Some(Self::RuleEvaluated),
            Self::RuleEvaluated => Some(Self::ReportedMirrored),
            Self::ReportedMirrored => Some(Self::DesiredUpdated),
            Self::DesiredUpdated => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisioningOutcome {
    pub event_id: String,
    pub certificate_id: String,
    pub device_identity: DeviceIdentity,
    pub policy_name: String,
    pub final_step: ProvisioningStep,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryOutcome {
    pub event_id: String,
    pub target_device: DeviceIdentity,
    pub flag: u8,
    pub desired_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureReport<S> {
    pub event_id: String,
    pub last_completed_step: S,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<S>,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub retryable: bool,
    pub attempts: u32,
    pub record_schema: String,
}

impl<S: EventStep> FailureReport<S> {
    pub fn new(
        event_id: impl Into<String>,
        last_completed_step: S,
        error: &BrokerError,
        attempts: u32,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            last_completed_step,
            failed_step: last_completed_step.next(),
            error_kind: error.kind(),
            error_message: error.to_string(),
            retryable: error.is_retryable(),
            attempts,
            record_schema: FAILURE_REPORT_SCHEMA_VERSION.to_string(),
        }
    }
}

pub fn contract_fingerprint(value: impl Serialize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stable_contract_json(value));
    format!("{:x}", hasher.finalize())
}

pub fn stable_contract_json(value: impl Serialize) -> String {
    serde_json::to_string(&value).expect("serialization of contract value should not fail")
}
