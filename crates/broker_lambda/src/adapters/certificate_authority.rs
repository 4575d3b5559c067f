use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::runtime::contract::{Certificate, CertificateStatus};
use crate::runtime::error::BrokerError;

/// External issuer of device certificates: lookup by id and status changes.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn describe_certificate(&self, certificate_id: &str) -> Result<Certificate, BrokerError>;

    async fn update_certificate_status(
        &self,
        certificate_id: &str,
        status: CertificateStatus,
    ) -> Result<(), BrokerError>;
}

/// Moves a certificate toward `target`, writing only when the status changes.
pub(crate) async fn transition_certificate(
    authority: &dyn CertificateAuthority,
    certificate_id: &str,
    target: CertificateStatus,
) -> Result<(), BrokerError> {
    let certificate = authority.describe_certificate(certificate_id).await?;
    let next = certificate.status.transition(certificate_id, target)?;
    if next == certificate.status {
        return Ok(());
    }
    authority.update_certificate_status(certificate_id, next).await
}

/// Revoking a certificate that cannot be revoked from its current status is a
/// no-op.
pub(crate) async fn revoke_if_possible(
    authority: &dyn CertificateAuthority,
    certificate_id: &str,
) -> Result<(), BrokerError> {
    match transition_certificate(authority, certificate_id, CertificateStatus::Revoked).await {
        Err(BrokerError::InvalidTransition { .. }) => Ok(()),
        other => other,
    }
}

/// Process-resident certificate ledger.
#[derive(Debug, Default)]
pub struct InMemoryCertificateAuthority {
    certificates: Mutex<HashMap<String, Certificate>>,
}

impl InMemoryCertificateAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a certificate as issued but not yet activated. Re-registering a
    /// known id leaves the existing record untouched.
    pub fn register_pending(
        &self,
        certificate_id: impl Into<String>,
        certificate_pem: impl Into<String>,
    ) -> Result<Certificate, BrokerError> {
        let certificate_id = certificate_id.into();
        let mut certificates = self.lock()?;
        let certificate = certificates
            .entry(certificate_id.clone())
            .or_insert_with(|| Certificate {
                certificate_arn: format!("arn:aws:iot:local:000000000000:cert/{certificate_id}"),
                certificate_id,
                certificate_pem: certificate_pem.into(),
                status: CertificateStatus::Pending,
            });
        Ok(certificate.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Certificate>>, BrokerError> {
        self.certificates
            .lock()
            .map_err(|_| BrokerError::StoreUnavailable("certificate ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl CertificateAuthority for InMemoryCertificateAuthority {
    async fn describe_certificate(&self, certificate_id: &str) -> Result<Certificate, BrokerError> {
        self.lock()?
            .get(certificate_id)
            .cloned()
            .ok_or_else(|| BrokerError::CertificateNotFound(certificate_id.to_string()))
    }

    async fn update_certificate_status(
        &self,
        certificate_id: &str,
        status: CertificateStatus,
    ) -> Result<(), BrokerError> {
        let mut certificates = self.lock()?;
        let certificate = certificates
            .get_mut(certificate_id)
            .ok_or_else(|| BrokerError::CertificateNotFound(certificate_id.to_string()))?;
        certificate.status = certificate.status.transition(certificate_id, status)?;
        Ok(())
    }
}
