use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::runtime::contract::Fields;
use crate::runtime::error::BrokerError;
use crate::runtime::identity::DeviceIdentity;
use crate::runtime::shadow::{ShadowDocument, ShadowSection};

#[async_trait]
pub trait ShadowStore: Send + Sync {
    /// Merges `fields` into one section, creating the document on first use,
    /// and returns the new version. Updates to one device are applied one at a
    /// time in the order they were accepted.
    async fn update(
        &self,
        identity: &DeviceIdentity,
        section: ShadowSection,
        fields: &Fields,
    ) -> Result<u64, BrokerError>;

    async fn get(&self, identity: &DeviceIdentity) -> Result<Option<ShadowDocument>, BrokerError>;

    async fn delete(&self, identity: &DeviceIdentity) -> Result<(), BrokerError>;
}

#[derive(Debug, Default)]
struct ShadowSlot {
    document: ShadowDocument,
    retired: bool,
}

type SharedSlot = Arc<Mutex<ShadowSlot>>;

#[derive(Debug, Default)]
pub struct InMemoryShadowStore {
    slots: RwLock<HashMap<DeviceIdentity, SharedSlot>>,
}

impl InMemoryShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing_slot(&self, identity: &DeviceIdentity) -> Result<Option<SharedSlot>, BrokerError> {
        let slots = self
            .slots
            .read()
            .map_err(|_| BrokerError::StoreUnavailable("shadow index lock poisoned".to_string()))?;
        Ok(slots.get(identity).cloned())
    }

    fn slot_or_insert(&self, identity: &DeviceIdentity) -> Result<SharedSlot, BrokerError> {
        if let Some(slot) = self.existing_slot(identity)? {
            return Ok(slot);
        }
        let mut slots = self
            .slots
            .write()
            .map_err(|_| BrokerError::StoreUnavailable("shadow index lock poisoned".to_string()))?;
        Ok(slots.entry(identity.clone()).or_default().clone())
    }
}

#[async_trait]
impl ShadowStore for InMemoryShadowStore {
    async fn update(
        &self,
        identity: &DeviceIdentity,
        section: ShadowSection,
        fields: &Fields,
    ) -> Result<u64, BrokerError> {
        loop {
            let slot = self.slot_or_insert(identity)?;
            let mut guard = slot.lock().await;
            // Deleted while we queued; the next slot_or_insert starts a fresh document.
            if guard.retired {
                continue;
            }
            return Ok(guard.document.apply(section, fields));
        }
    }

    async fn get(&self, identity: &DeviceIdentity) -> Result<Option<ShadowDocument>, BrokerError> {
        let Some(slot) = self.existing_slot(identity)? else {
            return Ok(None);
        };
        let guard = slot.lock().await;
        Ok((!guard.retired).then(|| guard.document.clone()))
    }

    async fn delete(&self, identity: &DeviceIdentity) -> Result<(), BrokerError> {
        let removed = self
            .slots
            .write()
            .map_err(|_| BrokerError::StoreUnavailable("shadow index lock poisoned".to_string()))?
            .remove(identity);
        if let Some(slot) = removed {
            slot.lock().await.retired = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn first_update_creates_document_at_version_one() {
        let store = InMemoryShadowStore::new();
        let identity = DeviceIdentity::new("abc123");
        assert!(store.get(&identity).await.expect("get").is_none());

        let version = store
            .update(&identity, ShadowSection::Desired, &fields(&[("anomaly", json!(1))]))
            .await
            .expect("update");
        assert_eq!(version, 1);

        let document = store.get(&identity).await.expect("get").expect("created");
        assert_eq!(document.version, 1);
        assert_eq!(document.desired.get("anomaly"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn sections_merge_independently() {
        let store = InMemoryShadowStore::new();
        let identity = DeviceIdentity::new("abc123");
        store
            .update(&identity, ShadowSection::Reported, &fields(&[("Light", json!(250))]))
            .await
            .expect("reported");
        store
            .update(&identity, ShadowSection::Desired, &fields(&[("anomaly", json!(1))]))
            .await
            .expect("desired");

        let document = store.get(&identity).await.expect("get").expect("exists");
        assert_eq!(document.version, 2);
        assert_eq!(document.reported, fields(&[("Light", json!(250))]));
        assert_eq!(document.desired, fields(&[("anomaly", json!(1))]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_updates_yield_gapless_versions() {
        let store = Arc::new(InMemoryShadowStore::new());
        let identity = DeviceIdentity::new("abc123");

        let mut handles = Vec::new();
        for writer in 0..16u64 {
            let store = store.clone();
            let identity = identity.clone();
            handles.push(tokio::spawn(async move {
                let mut versions = Vec::new();
                for step in 0..25u64 {
                    let update = fields(&[
                        ("writer", json!(writer)),
                        ("step", json!(step)),
                        ("pair", json!(writer * 1_000 + step)),
                    ]);
                    versions.push(
                        store
                            .update(&identity, ShadowSection::Desired, &update)
                            .await
                            .expect("update"),
                    );
                }
                versions
            }));
        }

        let mut all_versions = Vec::new();
        for handle in handles {
            let versions = handle.await.expect("writer task");
            assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));
            all_versions.extend(versions);
        }

        all_versions.sort_unstable();
        let expected: Vec<u64> = (1..=400).collect();
        assert_eq!(all_versions, expected);

        let document = store.get(&identity).await.expect("get").expect("exists");
        assert_eq!(document.version, 400);
        let writer = document.desired["writer"].as_u64().expect("writer");
        let step = document.desired["step"].as_u64().expect("step");
        assert_eq!(document.desired["pair"], json!(writer * 1_000 + step));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshots_are_never_torn() {
        let store = Arc::new(InMemoryShadowStore::new());
        let identity = DeviceIdentity::new("abc123");

        let writer = {
            let store = store.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                for round in 0..200u64 {
                    store
                        .update(
                            &identity,
                            ShadowSection::Reported,
                            &fields(&[("a", json!(round)), ("b", json!(round))]),
                        )
                        .await
                        .expect("update");
                }
            })
        };

        for _ in 0..200 {
            if let Some(document) = store.get(&identity).await.expect("get") {
                assert_eq!(document.reported.get("a"), document.reported.get("b"));
                assert_eq!(
                    document.reported["a"].as_u64().expect("round") + 1,
                    document.version
                );
            }
        }
        writer.await.expect("writer task");
    }

    #[tokio::test]
    async fn distinct_devices_have_independent_versions() {
        let store = InMemoryShadowStore::new();
        let first = DeviceIdentity::new("first");
        let second = DeviceIdentity::new("second");
        let update = fields(&[("anomaly", json!(0))]);

        store
            .update(&first, ShadowSection::Desired, &update)
            .await
            .expect("update");
        store
            .update(&first, ShadowSection::Desired, &update)
            .await
            .expect("update");
        let version = store
            .update(&second, ShadowSection::Desired, &update)
            .await
            .expect("update");
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn delete_drops_document_and_restarts_versions() {
        let store = InMemoryShadowStore::new();
        let identity = DeviceIdentity::new("abc123");
        let update = fields(&[("anomaly", json!(1))]);
        store
            .update(&identity, ShadowSection::Desired, &update)
            .await
            .expect("update");

        store.delete(&identity).await.expect("delete");
        store.delete(&identity).await.expect("delete again");
        assert!(store.get(&identity).await.expect("get").is_none());

        let version = store
            .update(&identity, ShadowSection::Desired, &update)
            .await
            .expect("update after delete");
        assert_eq!(version, 1);
    }
}
