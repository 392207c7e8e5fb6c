use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::models::RawProviderMessage;

/// Maps idempotency keys to persisted message ids. Implementations may be
/// lossy: the `(provider_id, provider_message_id)` unique index is authoritative.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn put(&self, key: &str, message_id: &str);

    async fn evict(&self, key: &str);
}

/// Bounded map cleared wholesale once it reaches capacity.
#[derive(Debug, Clone)]
pub struct InMemoryIdempotencyStore {
    capacity: usize,
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryIdempotencyStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, message_id: &str) {
        let mut guard = self.entries.write().await;
        if guard.len() >= self.capacity && !guard.contains_key(key) {
            debug!(capacity = self.capacity, "idempotency cache full, clearing");
            guard.clear();
        }
        guard.insert(key.to_owned(), message_id.to_owned());
    }

    async fn evict(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

#[derive(Clone)]
pub struct IdempotencyManager {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyManager {
    #[must_use]
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Arc::new(InMemoryIdempotencyStore::new(capacity)))
    }

    /// SHA-256 of `providerId|providerMessageId`, hex encoded. The receipt
    /// time is left out so every redelivery of one message maps to one key.
    #[must_use]
    pub fn key_for(raw: &RawProviderMessage) -> String {
        let material = format!("{}|{}", raw.provider_id, raw.provider_message_id);
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    /// Message id recorded for an earlier delivery of `raw`, if any.
    pub async fn check(&self, raw: &RawProviderMessage) -> Option<String> {
        self.store.get(&Self::key_for(raw)).await
    }

    pub async fn record(&self, raw: &RawProviderMessage, message_id: &str) {
        self.store.put(&Self::key_for(raw), message_id).await;
    }

    pub async fn forget(&self, raw: &RawProviderMessage) {
        self.store.evict(&Self::key_for(raw)).await;
    }
}
