use std::sync::Arc;

use serde_json::json;
use tokio::time::Instant;

use crate::adapters::certificate_authority::CertificateAuthority;
use crate::adapters::device_registry::DeviceRegistry;
use crate::adapters::policy_store::PolicyStore;
use crate::handlers::{backoff_before_retry, bounded, log_error, log_info};
use crate::runtime::config::BrokerConfig;
use crate::runtime::contract::{
    CertificateRegistered, FailureReport, ProvisioningOutcome, ProvisioningStep,
};
use crate::runtime::error::BrokerError;
use crate::runtime::identity::{derive_device_identity, DeviceIdentity};
use crate::runtime::policy::PolicyParams;

const COMPONENT: &str = "provisioning";

pub type ProvisioningFailure = FailureReport<ProvisioningStep>;

/// Drives a certificate-registration event through
/// `RECEIVED → IDENTITY_DERIVED → DEVICE_REGISTERED → POLICY_BOUND → ACTIVATED`.
///
/// Nothing is rolled back on failure. Every step is idempotent, so the
/// recovery path for a retryable failure is replaying the whole event.
#[derive(Clone)]
pub struct ProvisioningCoordinator {
    authority: Arc<dyn CertificateAuthority>,
    registry: Arc<dyn DeviceRegistry>,
    policies: PolicyStore,
    config: Arc<BrokerConfig>,
}

impl ProvisioningCoordinator {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        registry: Arc<dyn DeviceRegistry>,
        policies: PolicyStore,
        config: Arc<BrokerConfig>,
    ) -> Self {
        Self {
            authority,
            registry,
            policies,
            config,
        }
    }

    pub async fn handle(
        &self,
        event: CertificateRegistered,
        deadline: Option<Instant>,
    ) -> Result<ProvisioningOutcome, ProvisioningFailure> {
        let started_at = Instant::now();
        let raw_event_id = event.event_id();
        let event = event
            .normalized()
            .map_err(|error| self.fail(&raw_event_id, ProvisioningStep::Received, &error, 0))?;
        let event_id = event.event_id();

        log_info(
            COMPONENT,
            "provisioning_started",
            json!({
                "event_id": event_id.clone(),
                "certificate_id": event.certificate_id.clone(),
                "account_id": event.account_id.clone(),
            }),
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut progress = ProvisioningStep::Received;
            match self.run_steps(&event, &mut progress, deadline).await {
                Ok(identity) => {
                    let duration_ms =
                        u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
                    log_info(
                        COMPONENT,
                        "provisioning_completed",
                        json!({
                            "event_id": event_id.clone(),
                            "certificate_id": event.certificate_id.clone(),
                            "device_identity": identity.as_str(),
                            "attempts": attempt,
                            "duration_ms": duration_ms,
                        }),
                    );
                    return Ok(ProvisioningOutcome {
                        event_id,
                        certificate_id: event.certificate_id,
                        device_identity: identity,
                        policy_name: self.config.policy_name.clone(),
                        final_step: progress,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let can_retry = error.is_retryable()
                        && attempt < self.config.max_attempts
                        && backoff_before_retry(attempt, deadline).await;
                    if can_retry {
                        log_info(
                            COMPONENT,
                            "provisioning_replayed",
                            json!({
                                "event_id": event_id.clone(),
                                "attempt": attempt,
                                "last_completed_step": progress,
                                "error_kind": error.kind(),
                                "error": error.to_string(),
                            }),
                        );
                        continue;
                    }
                    return Err(self.fail(&event_id, progress, &error, attempt));
                }
            }
        }
    }

    async fn run_steps(
        &self,
        event: &CertificateRegistered,
        progress: &mut ProvisioningStep,
        deadline: Option<Instant>,
    ) -> Result<DeviceIdentity, BrokerError> {
        let timeout = self.config.call_timeout;
        let certificate_id = event.certificate_id.as_str();

        let certificate_pem = match &event.certificate_pem {
            Some(pem) => pem.clone(),
            None => {
                bounded(
                    "describe_certificate",
                    timeout,
                    deadline,
                    self.authority.describe_certificate(certificate_id),
                )
                .await?
                .certificate_pem
            }
        };
        let identity = derive_device_identity(&certificate_pem)?;
        *progress = ProvisioningStep::IdentityDerived;

        let thing_type = self.config.thing_type_name.as_str();
        bounded(
            "ensure_thing_type",
            timeout,
            deadline,
            self.registry.ensure_thing_type(thing_type),
        )
        .await?;
        bounded(
            "create_device",
            timeout,
            deadline,
            self.registry.create_device(&identity, thing_type),
        )
        .await?;
        bounded(
            "attach_principal",
            timeout,
            deadline,
            self.registry.attach_principal(&identity, certificate_id),
        )
        .await?;
        *progress = ProvisioningStep::DeviceRegistered;

        let policy_name = self.config.policy_name.as_str();
        let params = PolicyParams::for_account(&self.config.region, &event.account_id);
        bounded(
            "ensure_policy",
            timeout,
            deadline,
            self.policies
                .ensure_policy(policy_name, &self.config.policy_template, &params),
        )
        .await?;
        bounded(
            "bind_policy",
            timeout,
            deadline,
            self.policies.bind(policy_name, certificate_id),
        )
        .await?;
        *progress = ProvisioningStep::PolicyBound;

        bounded(
            "activate_certificate",
            timeout,
            deadline,
            self.registry.activate_certificate(certificate_id),
        )
        .await?;
        *progress = ProvisioningStep::Activated;

        Ok(identity)
    }

    fn fail(
        &self,
        event_id: &str,
        last_completed_step: ProvisioningStep,
        error: &BrokerError,
        attempts: u32,
    ) -> ProvisioningFailure {
        let report = FailureReport::new(event_id, last_completed_step, error, attempts);
        log_error(
            COMPONENT,
            "provisioning_failed",
            json!({
                "event_id": report.event_id.clone(),
                "last_completed_step": report.last_completed_step,
                "failed_step": report.failed_step,
                "error_kind": report.error_kind,
                "error": report.error_message.clone(),
                "retryable": report.retryable,
                "attempts": attempts,
            }),
        );
        report
    }
}
