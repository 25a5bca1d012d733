//! Fault-injecting wrapper around [`MemoryBackend`] for lifecycle tests.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::backend::{DeleteFailure, StorageBackend, StorageFuture, StoredObject};
use super::memory::MemoryBackend;

type DeleteHook = Box<dyn Fn(&str) + Send + Sync>;

/// Calls observed by a [`FlakyBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Put(String),
    Delete(String),
    DeleteBatch(Vec<String>),
    List(String),
}

/// Memory store whose operations fail for configured key substrings.
#[derive(Default)]
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    fail_put: Mutex<Vec<String>>,
    fail_sign: Mutex<Vec<String>>,
    put_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<Call>>,
    on_delete: Mutex<Option<DeleteHook>>,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Puts whose key contains `needle` fail.
    pub fn fail_puts_containing(&self, needle: &str) {
        self.fail_put.lock().unwrap().push(needle.to_string());
    }

    /// Signing fails for keys containing `needle`.
    pub fn fail_signing_containing(&self, needle: &str) {
        self.fail_sign.lock().unwrap().push(needle.to_string());
    }

    /// Every put sleeps this long before completing.
    pub fn delay_puts(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = Some(delay);
    }

    /// Run `hook` synchronously at the start of every single-key delete.
    pub fn on_delete(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_delete.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .flat_map(|c| match c {
                Call::Delete(k) => vec![k],
                Call::DeleteBatch(ks) => ks,
                _ => Vec::new(),
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn matches(list: &Mutex<Vec<String>>, key: &str) -> bool {
        list.lock().unwrap().iter().any(|n| key.contains(n.as_str()))
    }
}

impl StorageBackend for FlakyBackend {
    fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            let delay = *self.put_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.record(Call::Put(key.clone()));
            if Self::matches(&self.fail_put, &key) {
                anyhow::bail!("injected put failure for {key}");
            }
            self.inner.put(&key, data, &content_type).await
        })
    }

    fn get(&self, key: &str) -> StorageFuture<'_, StoredObject> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> StorageFuture<'_, ()> {
        if let Some(hook) = self.on_delete.lock().unwrap().as_ref() {
            hook(key);
        }
        self.record(Call::Delete(key.to_string()));
        self.inner.delete(key)
    }

    fn delete_batch(&self, keys: &[String]) -> StorageFuture<'_, Vec<DeleteFailure>> {
        self.record(Call::DeleteBatch(keys.to_vec()));
        self.inner.delete_batch(keys)
    }

    fn list(&self, prefix: &str) -> StorageFuture<'_, Vec<String>> {
        self.record(Call::List(prefix.to_string()));
        self.inner.list(prefix)
    }

    fn exists(&self, key: &str) -> StorageFuture<'_, bool> {
        self.inner.exists(key)
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> StorageFuture<'_, String> {
        if Self::matches(&self.fail_sign, key) {
            let key = key.to_string();
            return Box::pin(async move { anyhow::bail!("injected signing failure for {key}") });
        }
        self.inner.signed_url(key, ttl)
    }
}
