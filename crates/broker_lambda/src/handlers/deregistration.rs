use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

use crate::adapters::device_registry::DeviceRegistry;
use crate::adapters::policy_store::PolicyStore;
use crate::adapters::shadow_store::ShadowStore;
use crate::handlers::{bounded, log_error, log_info};
use crate::runtime::config::BrokerConfig;
use crate::runtime::error::BrokerError;
use crate::runtime::identity::DeviceIdentity;

const COMPONENT: &str = "deregistration";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deregistered {
    pub identity: DeviceIdentity,
    pub device_existed: bool,
    pub detached_principals: Vec<String>,
    pub revoked: bool,
}

/// Tears a device down: policy bindings and principals first, then the
/// shadow, then the device itself. Re-running after a partial failure
/// finishes the job.
#[derive(Clone)]
pub struct DeregistrationCoordinator {
    registry: Arc<dyn DeviceRegistry>,
    policies: PolicyStore,
    shadows: Arc<dyn ShadowStore>,
    config: Arc<BrokerConfig>,
}

impl DeregistrationCoordinator {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        policies: PolicyStore,
        shadows: Arc<dyn ShadowStore>,
        config: Arc<BrokerConfig>,
    ) -> Self {
        Self {
            registry,
            policies,
            shadows,
            config,
        }
    }

    pub async fn deregister(
        &self,
        identity: &DeviceIdentity,
        revoke: bool,
        deadline: Option<Instant>,
    ) -> Result<Deregistered, BrokerError> {
        let result = self.teardown(identity, revoke, deadline).await;
        match &result {
            Ok(done) => log_info(
                COMPONENT,
                "device_deregistered",
                json!({
                    "device_identity": identity.as_str(),
                    "device_existed": done.device_existed,
                    "detached_principals": done.detached_principals.clone(),
                    "revoked": done.revoked,
                }),
            ),
            Err(error) => log_error(
                COMPONENT,
                "deregistration_failed",
                json!({
                    "device_identity": identity.as_str(),
                    "error_kind": error.kind(),
                    "error": error.to_string(),
                    "retryable": error.is_retryable(),
                }),
            ),
        }
        result
    }

    async fn teardown(
        &self,
        identity: &DeviceIdentity,
        revoke: bool,
        deadline: Option<Instant>,
    ) -> Result<Deregistered, BrokerError> {
        let timeout = self.config.call_timeout;
        let device = bounded(
            "get_device",
            timeout,
            deadline,
            self.registry.get_device(identity),
        )
        .await?;
        let principals = device
            .as_ref()
            .map(|device| device.principals.clone())
            .unwrap_or_default();

        for certificate_id in &principals {
            let bound = bounded(
                "bindings_for",
                timeout,
                deadline,
                self.policies.bindings_for(certificate_id),
            )
            .await?;
            for policy_name in &bound {
                bounded(
                    "unbind_policy",
                    timeout,
                    deadline,
                    self.policies.unbind(policy_name, certificate_id),
                )
                .await?;
            }
            if revoke {
                bounded(
                    "revoke_certificate",
                    timeout,
                    deadline,
                    self.registry.revoke_certificate(certificate_id),
                )
                .await?;
            }
            bounded(
                "detach_principal",
                timeout,
                deadline,
                self.registry.detach_principal(identity, certificate_id),
            )
            .await?;
        }

        bounded(
            "delete_shadow",
            timeout,
            deadline,
            self.shadows.delete(identity),
        )
        .await?;
        bounded(
            "delete_device",
            timeout,
            deadline,
            self.registry.delete_device(identity),
        )
        .await?;

        Ok(Deregistered {
            identity: identity.clone(),
            device_existed: device.is_some(),
            detached_principals: principals,
            revoked: revoke,
        })
    }
}
