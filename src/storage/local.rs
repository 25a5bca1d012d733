//! Local filesystem blob store.
//!
//! Blobs are stored as flat files under a configurable root directory.
//! The object key is used directly as a relative path
//! (e.g. `services/blogs/{project}/{blog}/{token}.jpg`).
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.
//! Read links are HMAC-signed by [`UrlSigner`].

use bytes::Bytes;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::backend::{DeleteFailure, StorageBackend, StorageFuture, StoredObject};
use super::signing::UrlSigner;

/// Directory (under root) holding in-flight temp files.
const TMP_DIR: &str = ".tmp";

/// Stores blobs on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored blobs.
    root: PathBuf,
    signer: UrlSigner,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>, signer: UrlSigner) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root, signer })
    }

    /// Resolve a key to an absolute file path, rejecting traversal.
    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.is_empty() {
            anyhow::bail!("empty object key");
        }
        for component in Path::new(key).components() {
            match component {
                Component::Normal(_) => {}
                _ => anyhow::bail!("Path traversal detected in object key: {}", key),
            }
        }
        if key == TMP_DIR || key.starts_with(&format!("{TMP_DIR}/")) {
            anyhow::bail!("reserved object key: {}", key);
        }
        Ok(self.root.join(key))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(TMP_DIR).join(format!("tmp-{}", id))
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.resolve(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.prune_empty_dirs(&path);
        Ok(())
    }

    /// Remove now-empty parent directories up to (not including) root.
    fn prune_empty_dirs(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    /// Collect every file key under `dir`, relative to root.
    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> anyhow::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                if path == self.root.join(TMP_DIR) {
                    continue;
                }
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key: Vec<_> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect();
                out.push(key.join("/"));
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn put(&self, key: &str, data: Bytes, _content_type: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let final_path = self.resolve(&key)?;

            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            // Crash-only: temp-fsync-rename pattern.
            let tmp_path = self.temp_path();
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &final_path)?;

            debug!("Local put: {} ({} bytes)", key, data.len());
            Ok(())
        })
    }

    fn get(&self, key: &str) -> StorageFuture<'_, StoredObject> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.resolve(&key)?;
            if !path.is_file() {
                anyhow::bail!("Object not found at key: {}", key);
            }
            let data = Bytes::from(std::fs::read(&path)?);
            Ok(StoredObject {
                data,
                content_type: None,
            })
        })
    }

    fn delete(&self, key: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move { self.remove(&key) })
    }

    fn delete_batch(&self, keys: &[String]) -> StorageFuture<'_, Vec<DeleteFailure>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            let failures = keys
                .into_iter()
                .filter_map(|key| {
                    self.remove(&key).err().map(|e| DeleteFailure {
                        key,
                        reason: e.to_string(),
                    })
                })
                .collect();
            Ok(failures)
        })
    }

    fn list(&self, prefix: &str) -> StorageFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            // Start from the deepest directory the prefix fully names.
            let dir_part = match prefix.rfind('/') {
                Some(idx) => &prefix[..idx],
                None => "",
            };
            let start = if dir_part.is_empty() {
                self.root.clone()
            } else {
                self.resolve(dir_part)?
            };
            let mut keys = Vec::new();
            self.walk(&start, &mut keys)?;
            keys.retain(|k| k.starts_with(&prefix));
            keys.sort();
            Ok(keys)
        })
    }

    fn exists(&self, key: &str) -> StorageFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.resolve(&key)?.is_file()) })
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            self.resolve(&key)?;
            self.signer.sign(&key, ttl)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
