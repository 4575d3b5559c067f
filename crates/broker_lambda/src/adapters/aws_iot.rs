//! IoT control-plane implementations of the certificate, registry, and policy
//! adapters. Things are named by device identity and principals are
//! certificate ARNs.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_iot::error::DisplayErrorContext;
use aws_sdk_iot::types::CertificateStatus as IotCertificateStatus;

use crate::adapters::certificate_authority::{
    revoke_if_possible, transition_certificate, CertificateAuthority,
};
use crate::adapters::device_registry::DeviceRegistry;
use crate::adapters::policy_store::{CreateOutcome, PolicyBackend};
use crate::runtime::contract::{Certificate, CertificateStatus, Device};
use crate::runtime::error::BrokerError;
use crate::runtime::identity::DeviceIdentity;
use crate::runtime::policy::{Policy, PolicyDocument, STORED_POLICY_VERSION};

fn unavailable(operation: &str, error: &(impl std::error::Error + 'static)) -> BrokerError {
    BrokerError::StoreUnavailable(format!("{operation} failed: {}", DisplayErrorContext(error)))
}

/// `arn:aws:iot:<region>:<account>:cert/<id>` to `<id>`. Anything else is
/// returned unchanged.
pub fn certificate_id_from_arn(principal: &str) -> &str {
    principal
        .rsplit_once(":cert/")
        .map(|(_, certificate_id)| certificate_id)
        .unwrap_or(principal)
}

async fn certificate_arn(
    authority: &dyn CertificateAuthority,
    certificate_id: &str,
) -> Result<String, BrokerError> {
    let certificate = authority.describe_certificate(certificate_id).await?;
    if certificate.certificate_arn.is_empty() {
        return Err(BrokerError::CertificateNotFound(certificate_id.to_string()));
    }
    Ok(certificate.certificate_arn)
}

/// Anything that is neither active nor revoked has not been activated yet.
pub fn from_iot_status(status: Option<&IotCertificateStatus>) -> CertificateStatus {
    match status {
        Some(IotCertificateStatus::Active) => CertificateStatus::Active,
        Some(IotCertificateStatus::Revoked) => CertificateStatus::Revoked,
        _ => CertificateStatus::Pending,
    }
}

pub fn to_iot_status(status: CertificateStatus) -> IotCertificateStatus {
    match status {
        CertificateStatus::Pending => IotCertificateStatus::PendingActivation,
        CertificateStatus::Active => IotCertificateStatus::Active,
        CertificateStatus::Revoked => IotCertificateStatus::Revoked,
    }
}

pub struct AwsIotCertificateAuthority {
    iot_client: aws_sdk_iot::Client,
}

impl AwsIotCertificateAuthority {
    pub fn new(iot_client: aws_sdk_iot::Client) -> Self {
        Self { iot_client }
    }
}

#[async_trait]
impl CertificateAuthority for AwsIotCertificateAuthority {
    async fn describe_certificate(&self, certificate_id: &str) -> Result<Certificate, BrokerError> {
        let output = self
            .iot_client
            .describe_certificate()
            .certificate_id(certificate_id)
            .send()
            .await
            .map_err(|error| {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    BrokerError::CertificateNotFound(certificate_id.to_string())
                } else {
                    unavailable("describe_certificate", &error)
                }
            })?;

        let description = output
            .certificate_description()
            .ok_or_else(|| BrokerError::CertificateNotFound(certificate_id.to_string()))?;
        let certificate_pem = description.certificate_pem().ok_or_else(|| {
            BrokerError::MalformedCertificate(format!(
                "certificate {certificate_id} has no PEM body"
            ))
        })?;

        Ok(Certificate {
            certificate_id: certificate_id.to_string(),
            certificate_pem: certificate_pem.to_string(),
            certificate_arn: description.certificate_arn().unwrap_or_default().to_string(),
            status: from_iot_status(description.status()),
        })
    }

    async fn update_certificate_status(
        &self,
        certificate_id: &str,
        status: CertificateStatus,
    ) -> Result<(), BrokerError> {
        self.iot_client
            .update_certificate()
            .certificate_id(certificate_id)
            .new_status(to_iot_status(status))
            .send()
            .await
            .map(|_| ())
            .map_err(|error| {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    BrokerError::CertificateNotFound(certificate_id.to_string())
                } else {
                    unavailable("update_certificate", &error)
                }
            })
    }
}

/// Thing registry backed by the IoT control plane.
pub struct AwsIotDeviceRegistry {
    iot_client: aws_sdk_iot::Client,
    authority: Arc<dyn CertificateAuthority>,
}

impl AwsIotDeviceRegistry {
    pub fn new(iot_client: aws_sdk_iot::Client, authority: Arc<dyn CertificateAuthority>) -> Self {
        Self {
            iot_client,
            authority,
        }
    }

    /// `None` when no thing carries this identity.
    async fn thing_type_of(&self, identity: &DeviceIdentity) -> Result<Option<String>, BrokerError> {
        match self
            .iot_client
            .describe_thing()
            .thing_name(identity.as_str())
            .send()
            .await
        {
            Ok(output) => Ok(Some(output.thing_type_name().unwrap_or_default().to_string())),
            Err(error) => {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    Ok(None)
                } else {
                    Err(unavailable("describe_thing", &error))
                }
            }
        }
    }

    async fn principals_of(&self, identity: &DeviceIdentity) -> Result<Vec<String>, BrokerError> {
        let mut principals = Vec::new();
        let mut next_token = None;
        loop {
            let output = match self
                .iot_client
                .list_thing_principals()
                .thing_name(identity.as_str())
                .set_next_token(next_token)
                .send()
                .await
            {
                Ok(output) => output,
                Err(error) => {
                    let error = error.into_service_error();
                    if error.is_resource_not_found_exception() {
                        return Ok(principals);
                    }
                    return Err(unavailable("list_thing_principals", &error));
                }
            };
            principals.extend(
                output
                    .principals
                    .unwrap_or_default()
                    .iter()
                    .map(|principal| certificate_id_from_arn(principal).to_string()),
            );
            match output.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => return Ok(principals),
            }
        }
    }

    async fn existing_device(
        &self,
        identity: &DeviceIdentity,
        existing_type: String,
        type_name: &str,
    ) -> Result<Device, BrokerError> {
        if existing_type != type_name {
            return Err(BrokerError::DuplicateDevice {
                identity: identity.to_string(),
                existing_type,
                requested_type: type_name.to_string(),
            });
        }
        Ok(Device {
            identity: identity.clone(),
            thing_type: existing_type,
            principals: self.principals_of(identity).await?,
        })
    }
}

#[async_trait]
impl DeviceRegistry for AwsIotDeviceRegistry {
    async fn ensure_thing_type(&self, type_name: &str) -> Result<(), BrokerError> {
        match self
            .iot_client
            .create_thing_type()
            .thing_type_name(type_name)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                let error = error.into_service_error();
                if error.is_resource_already_exists_exception() {
                    Ok(())
                } else {
                    Err(unavailable("create_thing_type", &error))
                }
            }
        }
    }

    async fn create_device(
        &self,
        identity: &DeviceIdentity,
        type_name: &str,
    ) -> Result<Device, BrokerError> {
        if let Some(existing_type) = self.thing_type_of(identity).await? {
            return self.existing_device(identity, existing_type, type_name).await;
        }

        match self
            .iot_client
            .create_thing()
            .thing_name(identity.as_str())
            .thing_type_name(type_name)
            .send()
            .await
        {
            Ok(_) => Ok(Device {
                identity: identity.clone(),
                thing_type: type_name.to_string(),
                principals: Vec::new(),
            }),
            Err(error) => {
                let error = error.into_service_error();
                if error.is_resource_already_exists_exception() {
                    // Created concurrently under a different type.
                    let existing_type = self.thing_type_of(identity).await?.unwrap_or_default();
                    self.existing_device(identity, existing_type, type_name).await
                } else if error.is_resource_not_found_exception() {
                    Err(BrokerError::UnknownThingType(type_name.to_string()))
                } else {
                    Err(unavailable("create_thing", &error))
                }
            }
        }
    }

    async fn get_device(&self, identity: &DeviceIdentity) -> Result<Option<Device>, BrokerError> {
        let Some(thing_type) = self.thing_type_of(identity).await? else {
            return Ok(None);
        };
        Ok(Some(Device {
            identity: identity.clone(),
            thing_type,
            principals: self.principals_of(identity).await?,
        }))
    }

    async fn attach_principal(
        &self,
        identity: &DeviceIdentity,
        certificate_id: &str,
    ) -> Result<(), BrokerError> {
        let principal = certificate_arn(self.authority.as_ref(), certificate_id).await?;
        self.iot_client
            .attach_thing_principal()
            .thing_name(identity.as_str())
            .principal(principal)
            .send()
            .await
            .map(|_| ())
            .map_err(|error| {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    BrokerError::DeviceNotFound(identity.to_string())
                } else {
                    unavailable("attach_thing_principal", &error)
                }
            })
    }

    async fn detach_principal(
        &self,
        identity: &DeviceIdentity,
        certificate_id: &str,
    ) -> Result<(), BrokerError> {
        let principal = match certificate_arn(self.authority.as_ref(), certificate_id).await {
            Ok(principal) => principal,
            Err(BrokerError::CertificateNotFound(_)) => return Ok(()),
            Err(error) => return Err(error),
        };
        match self
            .iot_client
            .detach_thing_principal()
            .thing_name(identity.as_str())
            .principal(principal)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    Ok(())
                } else {
                    Err(unavailable("detach_thing_principal", &error))
                }
            }
        }
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
        match self
            .iot_client
            .delete_thing()
            .thing_name(identity.as_str())
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    Ok(())
                } else {
                    Err(unavailable("delete_thing", &error))
                }
            }
        }
    }
}

/// Builds the stored policy from a control-plane read. The first version IoT
/// assigns is `1`, matching [`STORED_POLICY_VERSION`].
pub fn stored_policy(
    name: &str,
    document: Option<&str>,
    version_id: Option<&str>,
) -> Result<Policy, BrokerError> {
    let document = document.ok_or_else(|| {
        BrokerError::StoreUnavailable(format!("policy '{name}' was returned without a document"))
    })?;
    Ok(Policy {
        name: name.to_string(),
        version: version_id.unwrap_or(STORED_POLICY_VERSION).to_string(),
        document: PolicyDocument::from_json(document)?,
    })
}

/// Policies and certificate attachments in the IoT control plane. Bindings are
/// keyed by certificate ARN, resolved through the certificate authority.
pub struct AwsIotPolicyBackend {
    iot_client: aws_sdk_iot::Client,
    authority: Arc<dyn CertificateAuthority>,
}

impl AwsIotPolicyBackend {
    pub fn new(iot_client: aws_sdk_iot::Client, authority: Arc<dyn CertificateAuthority>) -> Self {
        Self {
            iot_client,
            authority,
        }
    }

    async fn attached_policies(&self, target: &str) -> Result<Vec<String>, BrokerError> {
        let mut names = Vec::new();
        let mut marker = None;
        loop {
            let output = self
                .iot_client
                .list_attached_policies()
                .target(target)
                .set_marker(marker)
                .send()
                .await
                .map_err(|error| unavailable("list_attached_policies", &error.into_service_error()))?;
            names.extend(
                output
                    .policies
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|policy| policy.policy_name),
            );
            match output.next_marker {
                Some(next) if !next.is_empty() => marker = Some(next),
                _ => return Ok(names),
            }
        }
    }
}

#[async_trait]
impl PolicyBackend for AwsIotPolicyBackend {
    async fn get_policy(&self, name: &str) -> Result<Option<Policy>, BrokerError> {
        match self.iot_client.get_policy().policy_name(name).send().await {
            Ok(output) => {
                stored_policy(name, output.policy_document(), output.default_version_id()).map(Some)
            }
            Err(error) => {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    Ok(None)
                } else {
                    Err(unavailable("get_policy", &error))
                }
            }
        }
    }

    async fn create_if_absent(&self, policy: Policy) -> Result<CreateOutcome, BrokerError> {
        let created = self
            .iot_client
            .create_policy()
            .policy_name(policy.name.as_str())
            .policy_document(policy.document.to_json())
            .send()
            .await;

        match created {
            Ok(output) => Ok(CreateOutcome::Created(Policy {
                version: output
                    .policy_version_id()
                    .unwrap_or(STORED_POLICY_VERSION)
                    .to_string(),
                ..policy
            })),
            Err(error) => {
                let error = error.into_service_error();
                if error.is_resource_already_exists_exception() {
                    let existing = self.get_policy(&policy.name).await?.ok_or_else(|| {
                        BrokerError::StoreUnavailable(format!(
                            "policy '{}' exists but could not be read back",
                            policy.name
                        ))
                    })?;
                    Ok(CreateOutcome::AlreadyExists(existing))
                } else if error.is_malformed_policy_exception() {
                    Err(BrokerError::InvalidEvent(format!(
                        "policy '{}' was rejected: {}",
                        policy.name,
                        DisplayErrorContext(&error)
                    )))
                } else {
                    Err(unavailable("create_policy", &error))
                }
            }
        }
    }

    async fn insert_binding(
        &self,
        policy_name: &str,
        certificate_id: &str,
    ) -> Result<bool, BrokerError> {
        let target = certificate_arn(self.authority.as_ref(), certificate_id).await?;
        if self
            .attached_policies(&target)
            .await?
            .iter()
            .any(|name| name == policy_name)
        {
            return Ok(false);
        }

        self.iot_client
            .attach_policy()
            .policy_name(policy_name)
            .target(target)
            .send()
            .await
            .map(|_| true)
            .map_err(|error| {
                let error = error.into_service_error();
                if error.is_resource_not_found_exception() {
                    BrokerError::MissingPolicy(policy_name.to_string())
                } else {
                    unavailable("attach_policy", &error)
                }
            })
    }

    async fn remove_binding(
        &self,
        policy_name: &str,
        certificate_id: &str,
    ) -> Result<(), BrokerError> {
        let target = match certificate_arn(self.authority.as_ref(), certificate_id).await {
            Ok(target) => target,
            Err(BrokerError::CertificateNotFound(_)) => return Ok(()),
            Err(error) => return Err(error),
        };
        // DetachPolicy on a pair that is not attached already succeeds.
        self.iot_client
            .detach_policy()
            .policy_name(policy_name)
            .target(target)
            .send()
            .await
            .map(|_| ())
            .map_err(|error| unavailable("detach_policy", &error.into_service_error()))
    }

    async fn bindings_for(&self, certificate_id: &str) -> Result<Vec<String>, BrokerError> {
        match certificate_arn(self.authority.as_ref(), certificate_id).await {
            Ok(target) => self.attached_policies(&target).await,
            Err(BrokerError::CertificateNotFound(_)) => Ok(Vec::new()),
            Err(error) => Err(error),
        }
    }
}
