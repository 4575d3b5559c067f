use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::runtime::error::BrokerError;
use crate::runtime::policy::{Policy, PolicyDocument, PolicyParams, STORED_POLICY_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Policy),
    AlreadyExists(Policy),
}

impl CreateOutcome {
    pub fn into_policy(self) -> Policy {
        match self {
            Self::Created(policy) | Self::AlreadyExists(policy) => policy,
        }
    }
}

/// Storage primitives the policy store is built on.
///
/// `create_if_absent` must be atomic: of any number of concurrent creates for
/// one name, exactly one returns `Created` and every other caller observes the
/// winner's policy.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    async fn get_policy(&self, name: &str) -> Result<Option<Policy>, BrokerError>;

    async fn create_if_absent(&self, policy: Policy) -> Result<CreateOutcome, BrokerError>;

    /// Returns `false` when the binding already existed.
    async fn insert_binding(&self, policy_name: &str, certificate_id: &str)
        -> Result<bool, BrokerError>;

    async fn remove_binding(&self, policy_name: &str, certificate_id: &str)
        -> Result<(), BrokerError>;

    async fn bindings_for(&self, certificate_id: &str) -> Result<Vec<String>, BrokerError>;
}

#[derive(Debug, Default)]
struct PolicyTables {
    policies: HashMap<String, Policy>,
    bindings: BTreeSet<(String, String)>,
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyBackend {
    tables: Mutex<PolicyTables>,
}

impl InMemoryPolicyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy_count(&self) -> usize {
        self.lock().map(|tables| tables.policies.len()).unwrap_or(0)
    }

    pub fn binding_count(&self) -> usize {
        self.lock().map(|tables| tables.bindings.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, PolicyTables>, BrokerError> {
        self.tables
            .lock()
            .map_err(|_| BrokerError::StoreUnavailable("policy tables lock poisoned".to_string()))
    }
}

#[async_trait]
impl PolicyBackend for InMemoryPolicyBackend {
    async fn get_policy(&self, name: &str) -> Result<Option<Policy>, BrokerError> {
        Ok(self.lock()?.policies.get(name).cloned())
    }

    async fn create_if_absent(&self, policy: Policy) -> Result<CreateOutcome, BrokerError> {
        let mut tables = self.lock()?;
        if let Some(existing) = tables.policies.get(&policy.name) {
            return Ok(CreateOutcome::AlreadyExists(existing.clone()));
        }
        tables.policies.insert(policy.name.clone(), policy.clone());
        Ok(CreateOutcome::Created(policy))
    }

    async fn insert_binding(
        &self,
        policy_name: &str,
        certificate_id: &str,
    ) -> Result<bool, BrokerError> {
        Ok(self
            .lock()?
            .bindings
            .insert((certificate_id.to_string(), policy_name.to_string())))
    }

    async fn remove_binding(
        &self,
        policy_name: &str,
        certificate_id: &str,
    ) -> Result<(), BrokerError> {
        self.lock()?
            .bindings
            .remove(&(certificate_id.to_string(), policy_name.to_string()));
        Ok(())
    }

    async fn bindings_for(&self, certificate_id: &str) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .lock()?
            .bindings
            .iter()
            .filter(|(certificate, _)| certificate == certificate_id)
            .map(|(_, policy_name)| policy_name.clone())
            .collect())
    }
}

/// Idempotent policy creation and principal binding over a [`PolicyBackend`].
#[derive(Clone)]
pub struct PolicyStore {
    backend: Arc<dyn PolicyBackend>,
}

impl PolicyStore {
    pub fn new(backend: Arc<dyn PolicyBackend>) -> Self {
        Self { backend }
    }

    /// Returns the stored policy for `name`, creating it from `template` when
    /// absent. An existing policy is never updated in place.
    pub async fn ensure_policy(
        &self,
        name: &str,
        template: &PolicyDocument,
        params: &PolicyParams,
    ) -> Result<Policy, BrokerError> {
        if let Some(existing) = self.backend.get_policy(name).await? {
            return Ok(existing);
        }

        let policy = Policy {
            name: name.to_string(),
            version: STORED_POLICY_VERSION.to_string(),
            document: template.resolve(params),
        };
        Ok(self.backend.create_if_absent(policy).await?.into_policy())
    }

    pub async fn get_policy(&self, name: &str) -> Result<Option<Policy>, BrokerError> {
        self.backend.get_policy(name).await
    }

    pub async fn bind(&self, policy_name: &str, certificate_id: &str) -> Result<(), BrokerError> {
        if self.backend.get_policy(policy_name).await?.is_none() {
            return Err(BrokerError::MissingPolicy(policy_name.to_string()));
        }
        self.backend
            .insert_binding(policy_name, certificate_id)
            .await
            .map(|_| ())
    }

    pub async fn unbind(&self, policy_name: &str, certificate_id: &str) -> Result<(), BrokerError> {
        self.backend.remove_binding(policy_name, certificate_id).await
    }

    pub async fn bindings_for(&self, certificate_id: &str) -> Result<Vec<String>, BrokerError> {
        self.backend.bindings_for(certificate_id).await
    }
}
