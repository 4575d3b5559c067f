use std::sync::Arc;
use std::time::Duration;

use broker_lambda::adapters::aws_iot::{
    AwsIotCertificateAuthority, AwsIotDeviceRegistry, AwsIotPolicyBackend,
};
use broker_lambda::adapters::certificate_authority::CertificateAuthority;
use broker_lambda::adapters::iot_shadow_store::IotDataShadowStore;
use broker_lambda::adapters::policy_store::PolicyStore;
use broker_lambda::handlers::deregistration::DeregistrationCoordinator;
use broker_lambda::handlers::provisioning::ProvisioningCoordinator;
use broker_lambda::handlers::shadow_update::ShadowUpdateCoordinator;
use broker_lambda::runtime::config::BrokerConfig;
use broker_lambda::runtime::contract::{CertificateRegistered, TelemetryReceived};
use broker_lambda::runtime::error::BrokerError;
use broker_lambda::runtime::identity::DeviceIdentity;
use broker_lambda::runtime::shadow::ShadowUpdate;
use chrono::Utc;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;

/// Time kept back from the invocation deadline for writing the response.
const RESPONSE_MARGIN: Duration = Duration::from_millis(250);

#[derive(Clone)]
struct RuntimeDependencies {
    provisioning: ProvisioningCoordinator,
    telemetry: ShadowUpdateCoordinator,
    deregistration: DeregistrationCoordinator,
}

impl RuntimeDependencies {
    async fn load() -> Result<Self, Error> {
        let config = BrokerConfig::from_env()
            .map(Arc::new)
            .map_err(|error| Error::from(error.message().to_string()))?;
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let iot_client = aws_sdk_iot::Client::new(&aws_config);
        let authority: Arc<dyn CertificateAuthority> =
            Arc::new(AwsIotCertificateAuthority::new(iot_client.clone()));
        let registry = Arc::new(AwsIotDeviceRegistry::new(
            iot_client.clone(),
            authority.clone(),
        ));
        let policies = PolicyStore::new(Arc::new(AwsIotPolicyBackend::new(
            iot_client.clone(),
            authority.clone(),
        )));
        let shadows = Arc::new(
            IotDataShadowStore::connect(
                &aws_config,
                &iot_client,
                config.iot_data_endpoint.as_deref(),
            )
            .await
            .map_err(|error| Error::from(error.to_string()))?,
        );

        Ok(Self {
            provisioning: ProvisioningCoordinator::new(
                authority,
                registry.clone(),
                policies.clone(),
                config.clone(),
            ),
            telemetry: ShadowUpdateCoordinator::new(shadows.clone(), config.clone()),
            deregistration: DeregistrationCoordinator::new(registry, policies, shadows, config),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum EventShape {
    Provisioning,
    Deregistration,
    ShadowUpdate,
    Telemetry,
}

fn classify_event(event: &Value) -> EventShape {
    if event.get("certificateId").is_some() {
        EventShape::Provisioning
    } else if event.get("deregister").is_some() {
        EventShape::Deregistration
    } else if event.get("state").is_some() && event.get("deviceIdentity").is_some() {
        EventShape::ShadowUpdate
    } else {
        EventShape::Telemetry
    }
}

/// A deadline already in the past clamps to `Instant::now()`. `None` only when
/// the runtime's deadline does not fit in epoch milliseconds.
fn invocation_deadline(deadline_epoch_ms: u64, now_epoch_ms: i64) -> Option<Instant> {
    let remaining_ms = i64::try_from(deadline_epoch_ms)
        .ok()?
        .saturating_sub(now_epoch_ms)
        .max(0);
    let remaining = Duration::from_millis(u64::try_from(remaining_ms).ok()?);
    Some(Instant::now() + remaining.saturating_sub(RESPONSE_MARGIN))
}

fn ok_response(key: &str, body: impl Serialize) -> Result<Value, Error> {
    let body = serde_json::to_value(body)
        .map_err(|error| Error::from(format!("failed to serialize response: {error}")))?;
    Ok(json!({ "status": "ok", key: body }))
}

fn failed_response(failure: impl Serialize) -> Result<Value, Error> {
    let failure = serde_json::to_value(failure)
        .map_err(|error| Error::from(format!("failed to serialize failure report: {error}")))?;
    Ok(json!({ "status": "failed", "failure": failure }))
}

fn error_response(error: &BrokerError) -> Result<Value, Error> {
    failed_response(json!({
        "error_kind": error.kind(),
        "error_message": error.to_string(),
        "retryable": error.is_retryable(),
    }))
}

fn required_identity(event: &Value) -> Result<DeviceIdentity, BrokerError> {
    event
        .get("deviceIdentity")
        .and_then(Value::as_str)
        .map(DeviceIdentity::from)
        .ok_or_else(|| BrokerError::InvalidEvent("deviceIdentity must be a string".to_string()))
}

async fn handle_request(
    event: LambdaEvent<Value>,
    deps: &RuntimeDependencies,
) -> Result<Value, Error> {
    let deadline = invocation_deadline(event.context.deadline, Utc::now().timestamp_millis());
    let payload = event.payload;

    match classify_event(&payload) {
        EventShape::Provisioning => {
            let registered: CertificateRegistered = match serde_json::from_value(payload) {
                Ok(registered) => registered,
                Err(error) => {
                    return error_response(&BrokerError::InvalidEvent(format!(
                        "malformed certificate registration: {error}"
                    )))
                }
            };
            match deps.provisioning.handle(registered, deadline).await {
                Ok(outcome) => ok_response("provisioning", outcome),
                Err(report) => failed_response(report),
            }
        }
        EventShape::Deregistration => {
            let target = payload.get("deregister").cloned().unwrap_or(Value::Null);
            let identity = match required_identity(&target) {
                Ok(identity) => identity,
                Err(error) => return error_response(&error),
            };
            let revoke = target.get("revoke").and_then(Value::as_bool).unwrap_or(false);
            match deps
                .deregistration
                .deregister(&identity, revoke, deadline)
                .await
            {
                Ok(done) => ok_response("deregistration", done),
                Err(error) => error_response(&error),
            }
        }
        EventShape::ShadowUpdate => {
            let applied = async {
                let identity = required_identity(&payload)?;
                let update = ShadowUpdate::from_wire(&payload)?;
                let version = deps
                    .telemetry
                    .apply_update(&identity, &update, deadline)
                    .await?;
                Ok::<_, BrokerError>(json!({
                    "deviceIdentity": identity,
                    "version": version,
                }))
            }
            .await;
            match applied {
                Ok(body) => ok_response("shadow", body),
                Err(error) => error_response(&error),
            }
        }
        EventShape::Telemetry => {
            let telemetry = match TelemetryReceived::from_value(payload) {
                Ok(telemetry) => telemetry,
                Err(error) => return error_response(&error),
            };
            match deps.telemetry.handle(telemetry, deadline).await {
                Ok(outcome) => ok_response("telemetry", outcome),
                Err(report) => failed_response(report),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let deps = RuntimeDependencies::load().await?;
    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let deps = deps.clone();
        async move { handle_request(event, &deps).await }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_provisioning_event() {
        let event = json!({
            "awsAccountId": "123456789012",
            "certificateId": "cert-1",
            "certificateStatus": "PENDING_ACTIVATION"
        });
        assert_eq!(classify_event(&event), EventShape::Provisioning);
    }

    #[test]
    fn bare_reading_is_telemetry() {
        assert_eq!(classify_event(&json!({"Light": 250})), EventShape::Telemetry);
        assert_eq!(
            classify_event(&json!({"deviceIdentity": "abc", "fields": {"Light": 1}})),
            EventShape::Telemetry
        );
    }

    #[test]
    fn detects_shadow_update_and_deregistration() {
        assert_eq!(
            classify_event(&json!({"deviceIdentity": "abc", "state": {"desired": {}}})),
            EventShape::ShadowUpdate
        );
        assert_eq!(
            classify_event(&json!({"deregister": {"deviceIdentity": "abc"}})),
            EventShape::Deregistration
        );
    }

    #[test]
    fn past_deadline_leaves_zero_budget() {
        let now_ms = Utc::now().timestamp_millis();
        let before = Instant::now();
        let expired = invocation_deadline(0, now_ms).expect("expired deadline is still a deadline");
        assert!(expired <= Instant::now());
        assert!(expired >= before);

        let just_passed = u64::try_from(now_ms - 5).expect("positive");
        let deadline = invocation_deadline(just_passed, now_ms).expect("deadline");
        assert!(deadline <= Instant::now());
    }

    #[test]
    fn future_deadline_keeps_response_margin() {
        let now_ms = 1_700_000_000_000;
        let before = Instant::now();
        let deadline = invocation_deadline(1_700_000_010_000, now_ms).expect("deadline");
        let after = Instant::now();
        assert!(deadline.duration_since(after) <= Duration::from_secs(10) - RESPONSE_MARGIN);
        assert!(deadline.duration_since(before) >= Duration::from_secs(9));
    }

    #[test]
    fn deadline_inside_margin_is_already_due() {
        let now_ms = 1_700_000_000_000;
        let deadline = invocation_deadline(1_700_000_000_100, now_ms).expect("deadline");
        assert!(deadline <= Instant::now());
    }

    #[test]
    fn unrepresentable_deadline_is_ignored() {
        assert!(invocation_deadline(u64::MAX, 0).is_none());
    }

    #[test]
    fn error_response_carries_kind() {
        let response =
            error_response(&BrokerError::InvalidEvent("bad".to_string())).expect("response");
        assert_eq!(response["status"], json!("failed"));
        assert_eq!(response["failure"]["error_kind"], json!("invalid_event"));
    }
}
