use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;

use crate::adapters::shadow_store::ShadowStore;
use crate::handlers::{backoff_before_retry, bounded, log_error, log_info};
use crate::runtime::config::BrokerConfig;
use crate::runtime::contract::{
    FailureReport, Fields, TelemetryOutcome, TelemetryReceived, TelemetryStep,
};
use crate::runtime::error::BrokerError;
use crate::runtime::identity::DeviceIdentity;
use crate::runtime::shadow::{ShadowDocument, ShadowSection, ShadowUpdate};

const COMPONENT: &str = "shadow_update";

pub type TelemetryFailure = FailureReport<TelemetryStep>;

/// Turns telemetry into a desired-state flag on a device shadow.
///
/// The flag goes to the configured notification device when one is set,
/// otherwise to the device that sent the reading.
#[derive(Clone)]
pub struct ShadowUpdateCoordinator {
    shadows: Arc<dyn ShadowStore>,
    config: Arc<BrokerConfig>,
}

impl ShadowUpdateCoordinator {
    pub fn new(shadows: Arc<dyn ShadowStore>, config: Arc<BrokerConfig>) -> Self {
        Self { shadows, config }
    }

    pub async fn handle(
        &self,
        event: TelemetryReceived,
        deadline: Option<Instant>,
    ) -> Result<TelemetryOutcome, TelemetryFailure> {
        let event_id = event.event_id();
        let mut progress = TelemetryStep::Received;
        let mut attempts = 0u32;

        let result = self
            .run_steps(&event_id, &event, &mut progress, &mut attempts, deadline)
            .await;
        match result {
            Ok(outcome) => {
                log_info(
                    COMPONENT,
                    "telemetry_applied",
                    json!({
                        "event_id": event_id.clone(),
                        "target_device": outcome.target_device.as_str(),
                        "flag": outcome.flag,
                        "desired_version": outcome.desired_version,
                        "reported_version": outcome.reported_version,
                    }),
                );
                Ok(outcome)
            }
            Err(error) => {
                let report = FailureReport::new(event_id, progress, &error, attempts);
                log_error(
                    COMPONENT,
                    "telemetry_failed",
                    json!({
                        "event_id": report.event_id.clone(),
                        "last_completed_step": report.last_completed_step,
                        "failed_step": report.failed_step,
                        "error_kind": report.error_kind,
                        "error": report.error_message.clone(),
                        "attempts": attempts,
                    }),
                );
                Err(report)
            }
        }
    }

    /// Applies a wire-format shadow update to one device and returns the new
    /// version.
    pub async fn apply_update(
        &self,
        identity: &DeviceIdentity,
        update: &ShadowUpdate,
        deadline: Option<Instant>,
    ) -> Result<u64, BrokerError> {
        let mut attempts = 0;
        self.write(identity, update.section, &update.fields, &mut attempts, deadline)
            .await
    }

    pub async fn shadow(
        &self,
        identity: &DeviceIdentity,
        deadline: Option<Instant>,
    ) -> Result<Option<ShadowDocument>, BrokerError> {
        bounded(
            "get_shadow",
            self.config.call_timeout,
            deadline,
            self.shadows.get(identity),
        )
        .await
    }

    async fn run_steps(
        &self,
        event_id: &str,
        event: &TelemetryReceived,
        progress: &mut TelemetryStep,
        attempts: &mut u32,
        deadline: Option<Instant>,
    ) -> Result<TelemetryOutcome, BrokerError> {
        let target = self.target_device(event)?;
        let rule = &self.config.threshold_rule;
        let flag = rule.evaluate(&event.fields)?;
        *progress = TelemetryStep::RuleEvaluated;

        let mut reported_version = None;
        if self.config.mirror_reported {
            let source = event.device_identity.as_ref().unwrap_or(&target);
            reported_version = Some(
                self.write(source, ShadowSection::Reported, &event.fields, attempts, deadline)
                    .await?,
            );
        }
        *progress = TelemetryStep::ReportedMirrored;

        let desired_version = self
            .write(
                &target,
                ShadowSection::Desired,
                &rule.flag_fields(flag),
                attempts,
                deadline,
            )
            .await?;
        *progress = TelemetryStep::DesiredUpdated;

        Ok(TelemetryOutcome {
            event_id: event_id.to_string(),
            target_device: target,
            flag,
            desired_version,
            reported_version,
        })
    }

    fn target_device(&self, event: &TelemetryReceived) -> Result<DeviceIdentity, BrokerError> {
        if let Some(device) = &self.config.notification_device {
            return Ok(DeviceIdentity::new(device.as_str()));
        }
        event.device_identity.clone().ok_or_else(|| {
            BrokerError::InvalidEvent(
                "telemetry has no device identity and no notification device is configured"
                    .to_string(),
            )
        })
    }

    /// One shadow write. Only `StoreUnavailable` is retried; a timed-out write
    /// may already have been applied.
    async fn write(
        &self,
        identity: &DeviceIdentity,
        section: ShadowSection,
        fields: &Fields,
        attempts: &mut u32,
        deadline: Option<Instant>,
    ) -> Result<u64, BrokerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            *attempts = attempt;
            let result = bounded(
                "shadow_update",
                self.config.call_timeout,
                deadline,
                self.shadows.update(identity, section, fields),
            )
            .await;
            match result {
                Err(BrokerError::StoreUnavailable(message))
                    if attempt < self.config.max_attempts =>
                {
                    log_info(
                        COMPONENT,
                        "shadow_write_retried",
                        json!({
                            "device": identity.as_str(),
                            "section": section.as_str(),
                            "attempt": attempt,
                            "error": message.clone(),
                        }),
                    );
                    if !backoff_before_retry(attempt, deadline).await {
                        return Err(BrokerError::StoreUnavailable(message));
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use broker_core::error::ErrorKind;
    use serde_json::Value;

    use crate::adapters::shadow_store::InMemoryShadowStore;

    use super::*;

    /// Fails the first `failures` updates with `StoreUnavailable` without
    /// applying them.
    struct FlakyShadowStore {
        inner: InMemoryShadowStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ShadowStore for FlakyShadowStore {
        async fn update(
            &self,
            identity: &DeviceIdentity,
            section: ShadowSection,
            fields: &Fields,
        ) -> Result<u64, BrokerError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(BrokerError::StoreUnavailable("shadow backend throttled".to_string()));
            }
            self.inner.update(identity, section, fields).await
        }

        async fn get(
            &self,
            identity: &DeviceIdentity,
        ) -> Result<Option<ShadowDocument>, BrokerError> {
            self.inner.get(identity).await
        }

        async fn delete(&self, identity: &DeviceIdentity) -> Result<(), BrokerError> {
            self.inner.delete(identity).await
        }
    }

    fn telemetry(device: Option<&str>, light: Value) -> TelemetryReceived {
        TelemetryReceived {
            event_id: Some("evt-1".to_string()),
            device_identity: device.map(DeviceIdentity::from),
            fields: Fields::from([("Light".to_string(), light)]),
        }
    }

    fn coordinator(config: BrokerConfig, failures: u32) -> ShadowUpdateCoordinator {
        let store = Arc::new(FlakyShadowStore {
            inner: InMemoryShadowStore::new(),
            failures: AtomicU32::new(failures),
        });
        ShadowUpdateCoordinator::new(store, Arc::new(config))
    }

    #[tokio::test]
    async fn bright_reading_raises_anomaly_flag() {
        let coordinator = coordinator(BrokerConfig::default(), 0);
        let device = DeviceIdentity::new("abc123");

        let outcome = coordinator
            .handle(telemetry(Some("abc123"), json!(250)), None)
            .await
            .expect("telemetry applied");
        assert_eq!(outcome.event_id, "evt-1");
        assert_eq!(outcome.flag, 1);
        assert_eq!(outcome.desired_version, 1);
        assert_eq!(outcome.reported_version, None);

        let document = coordinator
            .shadow(&device, None)
            .await
            .expect("get")
            .expect("shadow exists");
        assert_eq!(document.desired.get("anomaly"), Some(&json!(1)));
        assert!(document.reported.is_empty());
    }

    #[tokio::test]
    async fn dim_reading_clears_flag_and_bumps_version() {
        let coordinator = coordinator(BrokerConfig::default(), 0);

        coordinator
            .handle(telemetry(Some("abc123"), json!(250)), None)
            .await
            .expect("first reading");
        let outcome = coordinator
            .handle(telemetry(Some("abc123"), json!(50)), None)
            .await
            .expect("second reading");

        assert_eq!(outcome.flag, 0);
        assert_eq!(outcome.desired_version, 2);
    }

    #[tokio::test]
    async fn reading_at_threshold_is_not_an_anomaly() {
        let coordinator = coordinator(BrokerConfig::default(), 0);
        let outcome = coordinator
            .handle(telemetry(Some("abc123"), json!(200)), None)
            .await
            .expect("telemetry applied");
        assert_eq!(outcome.flag, 0);
    }

    #[tokio::test]
    async fn notification_device_receives_flag_and_sender_receives_mirror() {
        let config = BrokerConfig {
            notification_device: Some("notify-thing".to_string()),
            mirror_reported: true,
            ..BrokerConfig::default()
        };
        let coordinator = coordinator(config, 0);

        let outcome = coordinator
            .handle(telemetry(Some("sensor-1"), json!(400)), None)
            .await
            .expect("telemetry applied");
        assert_eq!(outcome.target_device.as_str(), "notify-thing");
        assert_eq!(outcome.reported_version, Some(1));
        assert_eq!(outcome.desired_version, 1);

        let sender = coordinator
            .shadow(&DeviceIdentity::new("sensor-1"), None)
            .await
            .expect("get")
            .expect("mirrored");
        assert_eq!(sender.reported.get("Light"), Some(&json!(400)));
        assert!(sender.desired.is_empty());
    }

    #[tokio::test]
    async fn bare_reading_needs_a_notification_device() {
        let coordinator = coordinator(BrokerConfig::default(), 0);
        let report = coordinator
            .handle(telemetry(None, json!(250)), None)
            .await
            .expect_err("no target");

        assert_eq!(report.error_kind, ErrorKind::InvalidEvent);
        assert_eq!(report.last_completed_step, TelemetryStep::Received);
        assert_eq!(report.failed_step, Some(TelemetryStep::RuleEvaluated));
    }

    #[tokio::test]
    async fn non_numeric_reading_is_invalid() {
        let coordinator = coordinator(BrokerConfig::default(), 0);
        let report = coordinator
            .handle(telemetry(Some("abc123"), json!("bright")), None)
            .await
            .expect_err("non numeric");

        assert_eq!(report.error_kind, ErrorKind::InvalidEvent);
        assert!(!report.retryable);
        assert!(coordinator
            .shadow(&DeviceIdentity::new("abc123"), None)
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_store_is_retried_without_gaps() {
        let coordinator = coordinator(BrokerConfig::default(), 2);
        let outcome = coordinator
            .handle(telemetry(Some("abc123"), json!(250)), None)
            .await
            .expect("third write succeeds");
        assert_eq!(outcome.desired_version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_outage_reports_attempts() {
        let config = BrokerConfig {
            max_attempts: 2,
            ..BrokerConfig::default()
        };
        let coordinator = coordinator(config, 10);
        let report = coordinator
            .handle(telemetry(Some("abc123"), json!(250)), None)
            .await
            .expect_err("store stays down");

        assert_eq!(report.error_kind, ErrorKind::StoreUnavailable);
        assert_eq!(report.last_completed_step, TelemetryStep::ReportedMirrored);
        assert_eq!(report.failed_step, Some(TelemetryStep::DesiredUpdated));
        assert_eq!(report.attempts, 2);
        assert!(report.retryable);
    }

    /// Applies every update, then loses the acknowledgement.
    struct LostAckShadowStore {
        inner: InMemoryShadowStore,
        error: BrokerError,
    }

    #[async_trait]
    impl ShadowStore for LostAckShadowStore {
        async fn update(
            &self,
            identity: &DeviceIdentity,
            section: ShadowSection,
            fields: &Fields,
        ) -> Result<u64, BrokerError> {
            self.inner.update(identity, section, fields).await?;
            Err(self.error.clone())
        }

        async fn get(
            &self,
            identity: &DeviceIdentity,
        ) -> Result<Option<ShadowDocument>, BrokerError> {
            self.inner.get(identity).await
        }

        async fn delete(&self, identity: &DeviceIdentity) -> Result<(), BrokerError> {
            self.inner.delete(identity).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn applied_write_with_lost_ack_is_not_resent() {
        for error in [
            BrokerError::timeout("update_thing_shadow", Duration::ZERO),
            BrokerError::UnexpectedResponse("update_thing_shadow returned no payload".to_string()),
        ] {
            let kind = error.kind();
            let store = Arc::new(LostAckShadowStore {
                inner: InMemoryShadowStore::new(),
                error,
            });
            let coordinator =
                ShadowUpdateCoordinator::new(store.clone(), Arc::new(BrokerConfig::default()));

            let report = coordinator
                .handle(telemetry(Some("abc123"), json!(250)), None)
                .await
                .expect_err("acknowledgement lost");
            assert_eq!(report.error_kind, kind);
            assert_eq!(report.attempts, 1);

            let document = store
                .inner
                .get(&DeviceIdentity::new("abc123"))
                .await
                .expect("get")
                .expect("update applied once");
            assert_eq!(document.version, 1);
        }
    }

    #[tokio::test]
    async fn wire_update_merges_into_section() {
        let coordinator = coordinator(BrokerConfig::default(), 0);
        let device = DeviceIdentity::new("abc123");
        let update = ShadowUpdate::from_wire(&json!({"state": {"reported": {"Light": 12}}}))
            .expect("valid update");

        let version = coordinator
            .apply_update(&device, &update, Some(Instant::now() + Duration::from_secs(1)))
            .await
            .expect("applied");
        assert_eq!(version, 1);
    }
}
