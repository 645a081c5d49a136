//! In-memory stores for tests.

use crate::merge_cache::MergeCache;
use crate::metadata_store::{FileRecord, MetadataStore};
use crate::object_store::ObjectStore;
use crate::service::{DatasetService, ServiceLimits};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Records kept in insertion order, which is creation order in tests
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: Mutex<Vec<FileRecord>>,
}

impl InMemoryMetadataStore {
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert(&self, record: &FileRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if records.iter().any(|r| r.id == record.id) {
            anyhow::bail!("duplicate file id {}", record.id);
        }
        records.push(record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<FileRecord>> {
        Ok(self.records.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<FileRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() < before)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Objects keyed by storage key, with their content type
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryObjectStore {
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().unwrap().get(key).map(|(_, ct)| ct.clone())
    }

    /// Drop an object behind the service's back
    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().unwrap().get(key).map(|(bytes, _)| bytes.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.contains(key))
    }
}

/// A service over fresh in-memory stores with default limits
pub fn test_service(
    ttl: Duration,
) -> (DatasetService, Arc<InMemoryMetadataStore>, Arc<InMemoryObjectStore>) {
    let metadata = Arc::new(InMemoryMetadataStore::default());
    let objects = Arc::new(InMemoryObjectStore::default());
    let service = DatasetService::new(
        metadata.clone(),
        objects.clone(),
        Arc::new(MergeCache::new(ttl)),
        ServiceLimits::default(),
    );
    (service, metadata, objects)
}
