//! Abstract blob store trait.
//!
//! Every blob store must implement [`StorageBackend`].  Keys are opaque
//! `/`-separated strings produced by [`crate::keys::KeyFactory`]; the store
//! never interprets them beyond prefix matching.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by every backend method.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// A stored blob and the content type it was written with.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
}

/// A key that a batch delete could not remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub reason: String,
}

/// Async blob storage contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// Write `data` to `key`, replacing anything already there.
    fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageFuture<'_, ()>;

    /// Read the full blob at `key`.
    fn get(&self, key: &str) -> StorageFuture<'_, StoredObject>;

    /// Delete the blob at `key`.  Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> StorageFuture<'_, ()>;

    /// Delete many keys in one call.  Per-key failures are returned rather
    /// than failing the whole call; an `Err` means nothing is known.
    fn delete_batch(&self, keys: &[String]) -> StorageFuture<'_, Vec<DeleteFailure>>;

    /// Every key that starts with `prefix`, in lexical order.
    fn list(&self, prefix: &str) -> StorageFuture<'_, Vec<String>>;

    /// Check whether a blob exists at `key`.
    fn exists(&self, key: &str) -> StorageFuture<'_, bool>;

    /// Time-limited URL granting read access to `key`.
    fn signed_url(&self, key: &str, ttl: Duration) -> StorageFuture<'_, String>;
}
