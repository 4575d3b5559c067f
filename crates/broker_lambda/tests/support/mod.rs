#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use broker_core::config::BrokerConfig;
use broker_core::contract::{CertificateRegistered, Fields, TelemetryReceived};
use broker_core::identity::DeviceIdentity;
use broker_lambda::adapters::certificate_authority::InMemoryCertificateAuthority;
use broker_lambda::adapters::device_registry::InMemoryDeviceRegistry;
use broker_lambda::adapters::policy_store::{InMemoryPolicyBackend, PolicyStore};
use broker_lambda::adapters::shadow_store::InMemoryShadowStore;
use broker_lambda::handlers::deregistration::DeregistrationCoordinator;
use broker_lambda::handlers::provisioning::ProvisioningCoordinator;
use broker_lambda::handlers::shadow_update::ShadowUpdateCoordinator;
use serde_json::Value;

pub const ACCOUNT_ID: &str = "123456789012";

/// A broker wired entirely from in-memory adapters.
pub struct TestBroker {
    pub authority: Arc<InMemoryCertificateAuthority>,
    pub registry: Arc<InMemoryDeviceRegistry>,
    pub policy_backend: Arc<InMemoryPolicyBackend>,
    pub policies: PolicyStore,
    pub shadows: Arc<InMemoryShadowStore>,
    pub provisioning: ProvisioningCoordinator,
    pub telemetry: ShadowUpdateCoordinator,
    pub deregistration: DeregistrationCoordinator,
}

impl TestBroker {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig {
            call_timeout: Duration::from_secs(1),
            ..BrokerConfig::default()
        })
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        let config = Arc::new(config);
        let authority = Arc::new(InMemoryCertificateAuthority::new());
        let registry = Arc::new(InMemoryDeviceRegistry::new(authority.clone()));
        let policy_backend = Arc::new(InMemoryPolicyBackend::new());
        let policies = PolicyStore::new(policy_backend.clone());
        let shadows = Arc::new(InMemoryShadowStore::new());

        Self {
            provisioning: ProvisioningCoordinator::new(
                authority.clone(),
                registry.clone(),
                policies.clone(),
                config.clone(),
            ),
            telemetry: ShadowUpdateCoordinator::new(shadows.clone(), config.clone()),
            deregistration: DeregistrationCoordinator::new(
                registry.clone(),
                policies.clone(),
                shadows.clone(),
                config,
            ),
            authority,
            registry,
            policy_backend,
            policies,
            shadows,
        }
    }

    /// Registers `pem` as a pending certificate and returns the matching event.
    pub fn register(&self, certificate_id: &str, pem: &str) -> CertificateRegistered {
        self.authority
            .register_pending(certificate_id, pem)
            .expect("certificate registers");
        CertificateRegistered {
            event_id: Some(format!("evt-{certificate_id}")),
            account_id: ACCOUNT_ID.to_string(),
            certificate_id: certificate_id.to_string(),
            certificate_pem: Some(pem.to_string()),
        }
    }
}

pub fn reading(device: &DeviceIdentity, field: &str, value: Value) -> TelemetryReceived {
    TelemetryReceived {
        event_id: None,
        device_identity: Some(device.clone()),
        fields: Fields::from([(field.to_string(), value)]),
    }
}

/// A freshly keyed self-signed certificate.
pub fn generated_certificate(name: &str) -> String {
    rcgen::generate_simple_self_signed(vec![name.to_string()])
        .expect("certificate generation")
        .cert
        .pem()
}
