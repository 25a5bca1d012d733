//! In-memory blob store.
//!
//! Blobs are held in a `tokio::sync::RwLock<BTreeMap<...>>` so prefix
//! listing comes out ordered.  Used for tests and ephemeral deployments.
//! A configurable limit (`max_size_bytes`) caps total stored bytes.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::backend::{DeleteFailure, StorageBackend, StorageFuture, StoredObject};

struct Entry {
    data: Bytes,
    content_type: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Entry>,
    current_size: u64,
}

/// In-memory blob store.
pub struct MemoryBackend {
    state: tokio::sync::RwLock<State>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryBackend {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            state: tokio::sync::RwLock::new(State::default()),
            max_size_bytes,
        }
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every stored key, in order.
    pub async fn keys(&self) -> Vec<String> {
        self.state.read().await.objects.keys().cloned().collect()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            let replaced = state
                .objects
                .get(&key)
                .map(|e| e.data.len() as u64)
                .unwrap_or(0);
            let new_size = state.current_size - replaced + data.len() as u64;
            if self.max_size_bytes != 0 && new_size > self.max_size_bytes {
                anyhow::bail!(
                    "Memory limit exceeded: current={}, additional={}, max={}",
                    state.current_size,
                    data.len(),
                    self.max_size_bytes
                );
            }
            state.current_size = new_size;
            state.objects.insert(key, Entry { data, content_type });
            Ok(())
        })
    }

    fn get(&self, key: &str) -> StorageFuture<'_, StoredObject> {
        let key = key.to_string();
        Box::pin(async move {
            let state = self.state.read().await;
            let entry = state
                .objects
                .get(&key)
                .ok_or_else(|| anyhow::anyhow!("Object not found at key: {key}"))?;
            Ok(StoredObject {
                data: entry.data.clone(),
                content_type: Some(entry.content_type.clone()),
            })
        })
    }

    fn delete(&self, key: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let mut state = self.state.write().await;
            if let Some(entry) = state.objects.remove(&key) {
                state.current_size = state.current_size.saturating_sub(entry.data.len() as u64);
            }
            Ok(())
        })
    }

    fn delete_batch(&self, keys: &[String]) -> StorageFuture<'_, Vec<DeleteFailure>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            let mut state = self.state.write().await;
            for key in keys {
                if let Some(entry) = state.objects.remove(&key) {
                    state.current_size =
                        state.current_size.saturating_sub(entry.data.len() as u64);
                }
            }
            Ok(Vec::new())
        })
    }

    fn list(&self, prefix: &str) -> StorageFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .objects
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect())
        })
    }

    fn exists(&self, key: &str) -> StorageFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.state.read().await.objects.contains_key(&key)) })
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            if !self.state.read().await.objects.contains_key(&key) {
                anyhow::bail!("Object not found at key: {key}");
            }
            let expires = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + ttl.as_secs();
            Ok(format!("memory://{key}?expires={expires}"))
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
