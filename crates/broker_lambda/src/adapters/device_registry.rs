use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::adapters::certificate_authority::{
    revoke_if_possible, transition_certificate, CertificateAuthority,
};
use crate::runtime::contract::{CertificateStatus, Device};
use crate::runtime::error::BrokerError;
use crate::runtime::identity::DeviceIdentity;

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn ensure_thing_type(&self, type_name: &str) -> Result<(), BrokerError>;

    /// Idempotent for an identical `(identity, type_name)`; a different type
    /// for an existing identity is `DuplicateDevice`.
    async fn create_device(
        &self,
        identity: &DeviceIdentity,
        type_name: &str,
    ) -> Result<Device, BrokerError>;

    async fn get_device(&self, identity: &DeviceIdentity) -> Result<Option<Device>, BrokerError>;

    async fn attach_principal(
        &self,
        identity: &DeviceIdentity,
        certificate_id: &str,
    ) -> Result<(), BrokerError>;

    async fn detach_principal(
        &self,
        identity: &DeviceIdentity,
        certificate_id: &str,
    ) -> Result<(), BrokerError>;

    async fn activate_certificate(&self, certificate_id: &str) -> Result<(), BrokerError>;

    async fn revoke_certificate(&self, certificate_id: &str) -> Result<(), BrokerError>;

    /// Removes the device record. Deleting an unknown device is a no-op.
    async fn delete_device(&self, identity: &DeviceIdentity) -> Result<(), BrokerError>;
}

#[derive(Debug, Default)]
struct RegistryState {
    thing_types: BTreeSet<String>,
    devices: HashMap<DeviceIdentity, Device>,
}

/// Registry of thing types and devices; certificate lifecycle changes are
/// delegated to the certificate authority.
pub struct InMemoryDeviceRegistry {
    state: Mutex<RegistryState>,
    authority: Arc<dyn CertificateAuthority>,
}

impl InMemoryDeviceRegistry {
    pub fn new(authority: Arc<dyn CertificateAuthority>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            authority,
        }
    }

    pub fn device_count(&self) -> usize {
        self.lock().map(|state| state.devices.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::StoreUnavailable("device registry lock poisoned".to_string()))
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn ensure_thing_type(&self, type_name: &str) -> Result<(), BrokerError> {
        self.lock()?.thing_types.insert(type_name.to_string());
        Ok(())
    }

    async fn create_device(
        &self,
        identity: &DeviceIdentity,
        type_name: &str,
    ) -> Result<Device, BrokerError> {
        let mut state = self.lock()?;
        if !state.thing_types.contains(type_name) {
            return Err(BrokerError::UnknownThingType(type_name.to_string()));
        }

        let device = state
            .devices
            .entry(identity.clone())
            .or_insert_with(|| Device {
                identity: identity.clone(),
                thing_type: type_name.to_string(),
                principals: Vec::new(),
            });
        if device.thing_type != type_name {
            return Err(BrokerError::DuplicateDevice {
                identity: identity.to_string(),
                existing_type: device.thing_type.clone(),
                requested_type: type_name.to_string(),
            });
        }
        Ok(device.clone())
    }

    async fn get_device(&self, identity: &DeviceIdentity) -> Result<Option<Device>, BrokerError> {
        Ok(self.lock()?.devices.get(identity).cloned())
    }

    async fn attach_principal(
        &self,
        identity: &DeviceIdentity,
        certificate_id: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let device = state
            .devices
            .get_mut(identity)
            .ok_or_else(|| BrokerError::DeviceNotFound(identity.to_string()))?;
        if !device.principals.iter().any(|principal| principal == certificate_id) {
            device.principals.push(certificate_id.to_string());
        }
        Ok(())
    }

    async fn detach_principal(
        &self,
        identity: &DeviceIdentity,
        certificate_id: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        if let Some(device) = state.devices.get_mut(identity) {
            device.principals.retain(|principal| principal != certificate_id);
        }
        Ok(())
    }

    async fn activate_certificate(&self, certificate_id: &str) -> Result<(), BrokerError> {
        transition_certificate(
            self.authority.as_ref(),
            certificate_id,
            CertificateStatus::Active,
        )
        .await
    }

    async fn revoke_certificate(&self, certificate_id: &str) -> Result<(), BrokerError> {
        revoke_if_possible(self.authority.as_ref(), certificate_id).await
    }

    async fn delete_device(&self, identity: &DeviceIdentity) -> Result<(), BrokerError> {
        self.lock()?.devices.remove(identity);
        Ok(())
    }
}
