//! Device identity derivation from X.509 certificates.
//!
//! The identity is the Subject Key Identifier computed with the first method
//! of RFC 5280 section 4.2.1.2: the SHA-1 digest of the subjectPublicKey
//! BIT STRING value (tag, length, and unused-bits octet excluded).

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::BrokerError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

pub fn derive_device_identity(certificate_pem: &str) -> Result<DeviceIdentity, BrokerError> {
    let (_, pem) = parse_x509_pem(certificate_pem.as_bytes())
        .map_err(|error| BrokerError::MalformedCertificate(format!("invalid PEM: {error}")))?;
    if pem.label != "CERTIFICATE" {
        return Err(BrokerError::MalformedCertificate(format!(
            "expected a CERTIFICATE block, found '{}'",
            pem.label
        )));
    }
    derive_from_der(&pem.contents)
}

pub fn derive_from_der(certificate_der: &[u8]) -> Result<DeviceIdentity, BrokerError> {
    let (_, certificate) = X509Certificate::from_der(certificate_der)
        .map_err(|error| BrokerError::MalformedCertificate(format!("invalid DER: {error}")))?;

    let public_key = &certificate.public_key().subject_public_key.data;
    if public_key.is_empty() {
        return Err(BrokerError::MalformedCertificate(
            "certificate carries no public key".to_string(),
        ));
    }

    Ok(DeviceIdentity(hex::encode(Sha1::digest(public_key))))
}
