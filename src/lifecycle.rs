//! Resource lifecycle manager.
//!
//! A media-backed resource is one metadata row plus one or more blobs.  The
//! two stores share no transaction, so every operation here is built from a
//! concurrent fan-out and, on partial failure, compensating deletes that run
//! in the background without blocking the caller.
//!
//! Ordering rules:
//!
//! - create: upload and insert run together; whichever side succeeded (or
//!   may have succeeded) is undone when the other fails.
//! - replace: the previous blob is deleted only after the row swap that
//!   made it stale has been confirmed.
//! - delete: the row goes first and synchronously; blobs follow in the
//!   background.  A leaked blob is logged and counted, never surfaced.
//!
//! Bulk attachment is best effort by contrast: siblings are never
//! cancelled and nothing is rolled back.

use metrics::counter;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MediaConfig, PaginationConfig, SigningConfig};
use crate::errors::MediaError;
use crate::fanout::{FanOut, Op, TaskError};
use crate::keys::{KeyFactory, KeyScope, ObjectKey, ResourceKind};
use crate::media::{self, MediaPayload, Upload};
use crate::metadata::store::{BatchScope, BatchSelector, MetadataStore, RowRef, StoreFuture};
use crate::metrics::{
    record_compensation, record_operation, BULK_UPLOAD_FILES_TOTAL, ORPHANED_BLOBS_TOTAL,
    SIGNING_FAILURES_TOTAL,
};
use crate::storage::backend::StorageBackend;

// ── Resource plumbing ───────────────────────────────────────────────

/// A record whose creation pairs a metadata row with a primary blob.
pub trait MediaResource: Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    /// Give the draft its freshly generated identifier.
    fn assign_id(&mut self, id: String);

    /// Directory the primary blob is written to.
    fn key_scope(&self) -> KeyScope;

    /// Point the draft at its primary blob.
    fn attach_key(&mut self, key: &ObjectKey);

    /// Address of the persisted row.
    fn row_ref(&self) -> RowRef;

    fn insert(store: &dyn MetadataStore, record: Self) -> StoreFuture<'_, ()>;
}

/// What happens to blobs after a single-row delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    /// Remove everything under this directory plus the row's own keys.
    Prefix(KeyScope),
    /// Remove exactly the keys the deleted row referenced.
    RowKeys,
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Result of an operation that did not fail outright.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    /// The primary effect happened; a secondary step did not.
    PartialFailure { value: T, warning: MediaError },
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn value(&self) -> &T {
        match self {
            Outcome::Success(v) | Outcome::PartialFailure { value: v, .. } => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Outcome::Success(v) | Outcome::PartialFailure { value: v, .. } => v,
        }
    }

    pub fn warning(&self) -> Option<&MediaError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::PartialFailure { warning, .. } => Some(warning),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(v) => Outcome::Success(f(v)),
            Outcome::PartialFailure { value, warning } => Outcome::PartialFailure {
                value: f(value),
                warning,
            },
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::PartialFailure { .. } => "partial",
        }
    }
}

/// Rows removed by a batch delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeleted {
    pub ids: Vec<String>,
}

/// One file of a bulk attachment.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub index: usize,
    pub destination: String,
    pub upload: Upload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUpload {
    pub index: usize,
    pub reason: String,
}

/// Per-file result of a bulk attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub success: bool,
    pub uploaded: Vec<usize>,
    pub failed: Vec<FailedUpload>,
}

// ── Manager ─────────────────────────────────────────────────────────

/// Orchestrates blob and metadata writes for every resource kind.
pub struct LifecycleManager {
    storage: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
    keys: KeyFactory,
    fanout: FanOut,
    tracker: TaskTracker,
    signing: SigningConfig,
    media: MediaConfig,
    pagination: PaginationConfig,
}

impl LifecycleManager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            metadata,
            keys: KeyFactory::new(config.environment),
            fanout: FanOut::new(config.storage.op_timeout()),
            tracker: TaskTracker::new(),
            signing: config.signing.clone(),
            media: config.media,
            pagination: config.pagination,
        }
    }

    /// Override the per-call store timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.fanout = FanOut::new(timeout);
        self
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    pub fn keys(&self) -> &KeyFactory {
        &self.keys
    }

    pub fn signing(&self) -> &SigningConfig {
        &self.signing
    }

    pub fn media(&self) -> MediaConfig {
        self.media
    }

    pub fn pagination(&self) -> &PaginationConfig {
        &self.pagination
    }

    /// Wait for every background compensation and cleanup scheduled so far.
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of background tasks still running.
    pub fn pending_cleanups(&self) -> usize {
        self.tracker.len()
    }

    // ── create ──────────────────────────────────────────────────────

    /// Create a resource: upload its blob and insert its row together.
    pub async fn create<R: MediaResource>(
        &self,
        mut draft: R,
        payload: MediaPayload,
    ) -> Result<Outcome<R>, MediaError> {
        let started = Instant::now();
        draft.assign_id(uuid::Uuid::new_v4().to_string());
        let key = self
            .keys
            .generate(&draft.key_scope(), payload.format.extension());
        draft.attach_key(&key);
        let record = draft.clone();
        let row = draft.row_ref();

        let storage = Arc::clone(&self.storage);
        let metadata = Arc::clone(&self.metadata);
        let upload_key = key.clone();
        let ops = vec![
            Op::abortable(async move {
                storage
                    .put(upload_key.as_str(), payload.bytes, payload.format.content_type())
                    .await
                    .map_err(MediaError::StorageFailure)
            }),
            Op::abortable(async move {
                R::insert(metadata.as_ref(), draft)
                    .await
                    .map_err(MediaError::from)
            }),
        ];
        let (upload, insert) = into_pair(self.fanout.run_all_or_abort(ops).await)?;

        match (upload, insert) {
            (Ok(()), Ok(())) => {
                info!("Created {} {} with blob {}", R::KIND, row.id, key);
                record_operation(R::KIND.as_str(), "create", "success", started);
                Ok(Outcome::Success(record))
            }
            (upload, insert) => {
                let uploaded = upload_state(&upload);
                if uploaded != UploadState::Absent {
                    flag_in_flight(uploaded, &key);
                    self.spawn_blob_delete("delete_blob", key.into_string());
                }
                if may_have_applied(&insert) {
                    self.spawn_row_delete(row);
                }
                let err = decisive_error(vec![
                    ("metadata insert", insert.err()),
                    ("blob upload", upload.err()),
                ]);
                warn!("Create {} failed: {}", R::KIND, err);
                record_operation(R::KIND.as_str(), "create", err.metric_label(), started);
                Err(err)
            }
        }
    }

    // ── replace_media ───────────────────────────────────────────────

    /// Swap a resource's primary blob for a new one.
    pub async fn replace_media(
        &self,
        row: RowRef,
        scope: KeyScope,
        payload: MediaPayload,
    ) -> Result<Outcome<ObjectKey>, MediaError> {
        let started = Instant::now();
        let kind = row.kind;
        let key = self.keys.generate(&scope, payload.format.extension());

        let storage = Arc::clone(&self.storage);
        let metadata = Arc::clone(&self.metadata);
        let upload_key = key.clone();
        let swap_key = key.as_str().to_string();
        let swap_row = row.clone();
        let ops: Vec<Op<Option<String>, MediaError>> = vec![
            Op::abortable(async move {
                storage
                    .put(upload_key.as_str(), payload.bytes, payload.format.content_type())
                    .await
                    .map(|_| None)
                    .map_err(MediaError::StorageFailure)
            }),
            // Never aborted: its result tells us which key the row held.
            Op::protected(async move {
                metadata
                    .swap_media_key(swap_row, swap_key, None)
                    .await
                    .map(Some)
                    .map_err(MediaError::from)
            }),
        ];
        let (upload, swap) = into_pair(self.fanout.run_all_or_abort(ops).await)?;

        let result = match (upload, swap) {
            (Ok(_), Ok(previous)) => {
                let previous = previous.unwrap_or_default();
                if !previous.is_empty() && previous != key.as_str() {
                    self.spawn_blob_delete("delete_previous_blob", previous);
                }
                info!("Replaced media of {} {} with {}", kind, row.id, key);
                Ok(Outcome::Success(key))
            }
            (upload, Ok(previous)) => {
                // Row now points at a blob that may not exist.
                let uploaded = upload_state(&upload);
                flag_in_flight(uploaded, &key);
                let delete_new = uploaded != UploadState::Absent;
                self.spawn_revert(row, previous.unwrap_or_default(), key, delete_new);
                Err(decisive_error(vec![("blob upload", upload.err())]))
            }
            (upload, Err(swap_err)) => {
                if swap_err.is_indeterminate() {
                    // The swap may have landed; keep the new blob.
                    warn!(
                        "Swap for {} {} did not finish; keeping blob {} in case it is referenced",
                        kind, row.id, key
                    );
                } else {
                    let uploaded = upload_state(&upload);
                    if uploaded != UploadState::Absent {
                        flag_in_flight(uploaded, &key);
                        self.spawn_blob_delete("delete_blob", key.into_string());
                    }
                }
                Err(swap_err.into_media_error("metadata swap"))
            }
        };

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(e) => e.metric_label(),
        };
        record_operation(kind.as_str(), "replace_media", label, started);
        result
    }

    // ── delete ──────────────────────────────────────────────────────

    /// Delete a row, then its blobs in the background.
    pub async fn delete(&self, row: RowRef, cleanup: Cleanup) -> Result<Outcome<()>, MediaError> {
        let started = Instant::now();
        let kind = row.kind;
        let id = row.id.clone();

        let deleted = match tokio::time::timeout(
            self.fanout.timeout(),
            self.metadata.delete_media_row(row),
        )
        .await
        {
            Ok(Ok(deleted)) => deleted,
            Ok(Err(e)) => {
                let err = MediaError::from(e);
                record_operation(kind.as_str(), "delete", err.metric_label(), started);
                return Err(err);
            }
            Err(_) => {
                record_operation(kind.as_str(), "delete", "timeout", started);
                return Err(MediaError::Timeout {
                    operation: "metadata delete".to_string(),
                });
            }
        };

        let prefix = match cleanup {
            Cleanup::Prefix(scope) => Some(self.keys.prefix(&scope)),
            Cleanup::RowKeys => None,
        };
        self.spawn_sweep(prefix, deleted.keys);

        info!("Deleted {} {}", kind, id);
        record_operation(kind.as_str(), "delete", "success", started);
        Ok(Outcome::Success(()))
    }

    /// Delete many rows in one statement and their blobs in one batch call.
    pub async fn delete_batch(
        &self,
        scope: BatchScope,
        selector: BatchSelector,
    ) -> Result<Outcome<BatchDeleted>, MediaError> {
        let started = Instant::now();
        let kind = scope.kind;
        let requested = match &selector {
            BatchSelector::Ids(ids) => Some(ids.clone()),
            BatchSelector::All => None,
        };

        let rows = match tokio::time::timeout(
            self.fanout.timeout(),
            self.metadata.delete_media_rows(scope, selector),
        )
        .await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                let err = MediaError::from(e);
                record_operation(kind.as_str(), "delete_batch", err.metric_label(), started);
                return Err(err);
            }
            Err(_) => {
                record_operation(kind.as_str(), "delete_batch", "timeout", started);
                return Err(MediaError::Timeout {
                    operation: "metadata batch delete".to_string(),
                });
            }
        };

        if rows.is_empty() {
            record_operation(kind.as_str(), "delete_batch", "not_found", started);
            return Err(MediaError::not_found(kind.as_str()));
        }

        let mut ids = Vec::with_capacity(rows.len());
        let mut keys = Vec::new();
        for row in rows {
            ids.push(row.id);
            keys.extend(row.keys);
        }
        self.spawn_sweep(None, keys);
        info!("Deleted {} {} rows", ids.len(), kind);

        let missing: Vec<String> = requested
            .unwrap_or_default()
            .into_iter()
            .filter(|id| !ids.contains(id))
            .collect();
        let deleted = BatchDeleted { ids };
        let outcome = if missing.is_empty() {
            Outcome::Success(deleted)
        } else {
            warn!("Batch delete of {} skipped missing ids: {:?}", kind, missing);
            Outcome::PartialFailure {
                value: deleted,
                warning: MediaError::not_found(format!("{} {}", kind, missing.join(", "))),
            }
        };
        record_operation(kind.as_str(), "delete_batch", outcome.label(), started);
        Ok(outcome)
    }

    // ── attach_media ────────────────────────────────────────────────

    /// Upload several files under a resource, best effort.
    pub async fn attach_media(
        &self,
        scope: KeyScope,
        files: Vec<Attachment>,
    ) -> Result<Outcome<UploadReport>, MediaError> {
        let started = Instant::now();
        if let Some(bad) = files
            .iter()
            .find(|f| !self.keys.contains(&scope, &f.destination))
        {
            return Err(MediaError::invalid(
                "destination",
                format!("{} is outside the resource directory", bad.destination),
            ));
        }

        let indexes: Vec<usize> = files.iter().map(|f| f.index).collect();
        let ops: Vec<_> = files
            .into_iter()
            .map(|file| {
                let storage = Arc::clone(&self.storage);
                let config = self.media;
                async move {
                    let payload = media::prepare_blocking(file.upload, config).await?;
                    storage
                        .put(&file.destination, payload.bytes, payload.format.content_type())
                        .await
                        .map_err(MediaError::StorageFailure)
                }
            })
            .collect();
        let results = self.fanout.run_all(ops).await;

        let mut report = UploadReport {
            success: true,
            uploaded: Vec::new(),
            failed: Vec::new(),
        };
        let mut first_error = None;
        for (index, result) in indexes.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    counter!(BULK_UPLOAD_FILES_TOTAL, "outcome" => "uploaded").increment(1);
                    report.uploaded.push(index);
                }
                Err(e) => {
                    counter!(BULK_UPLOAD_FILES_TOTAL, "outcome" => "failed").increment(1);
                    let err = e.into_media_error("attachment upload");
                    warn!("Attachment {} failed: {}", index, err);
                    report.success = false;
                    report.failed.push(FailedUpload {
                        index,
                        reason: err.to_string(),
                    });
                    first_error.get_or_insert(err);
                }
            }
        }

        let outcome = match first_error {
            None => Outcome::Success(report),
            Some(warning) => Outcome::PartialFailure {
                value: report,
                warning,
            },
        };
        record_operation(scope.kind.as_str(), "attach_media", outcome.label(), started);
        Ok(outcome)
    }

    /// Remove named blobs from a resource directory, synchronously.
    ///
    /// Returns the keys that were removed; keys the store refused to delete
    /// are reported as a warning.
    pub async fn detach_media(
        &self,
        scope: KeyScope,
        keys: Vec<String>,
    ) -> Result<Outcome<Vec<String>>, MediaError> {
        let started = Instant::now();
        if keys.is_empty() {
            return Err(MediaError::invalid("paths", "at least one path is required"));
        }
        if let Some(bad) = keys.iter().find(|k| !self.keys.contains(&scope, k)) {
            return Err(MediaError::invalid(
                "paths",
                format!("{} is outside the resource directory", bad),
            ));
        }

        let failures = match tokio::time::timeout(
            self.fanout.timeout(),
            self.storage.delete_batch(&keys),
        )
        .await
        {
            Ok(Ok(failures)) => failures,
            Ok(Err(e)) => {
                record_operation(scope.kind.as_str(), "detach_media", "error", started);
                return Err(MediaError::StorageFailure(e));
            }
            Err(_) => {
                record_operation(scope.kind.as_str(), "detach_media", "timeout", started);
                return Err(MediaError::Timeout {
                    operation: "blob batch delete".to_string(),
                });
            }
        };

        let removed: Vec<String> = keys
            .into_iter()
            .filter(|k| !failures.iter().any(|f| &f.key == k))
            .collect();
        let outcome = if failures.is_empty() {
            Outcome::Success(removed)
        } else {
            for failure in &failures {
                warn!("Could not detach {}: {}", failure.key, failure.reason);
            }
            let listed: Vec<&str> = failures.iter().map(|f| f.key.as_str()).collect();
            Outcome::PartialFailure {
                value: removed,
                warning: MediaError::StorageFailure(anyhow::anyhow!(
                    "could not delete {}",
                    listed.join(", ")
                )),
            }
        };
        record_operation(scope.kind.as_str(), "detach_media", outcome.label(), started);
        Ok(outcome)
    }

    // ── plain store calls ───────────────────────────────────────────

    /// Run a metadata call that touches no blob, bounded by the store timeout.
    pub async fn store_call<T>(
        &self,
        operation: &str,
        fut: StoreFuture<'_, T>,
    ) -> Result<T, MediaError> {
        match tokio::time::timeout(self.fanout.timeout(), fut).await {
            Ok(result) => result.map_err(MediaError::from),
            Err(_) => Err(MediaError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }

    // ── signing ─────────────────────────────────────────────────────

    /// Sign every key concurrently.  Empty keys and failures yield the
    /// configured placeholder.
    pub async fn sign_keys(&self, keys: Vec<String>, ttl: Duration) -> Vec<String> {
        let ops: Vec<_> = keys
            .iter()
            .map(|key| {
                let storage = Arc::clone(&self.storage);
                let key = key.clone();
                async move {
                    if key.is_empty() {
                        Ok(None)
                    } else {
                        storage.signed_url(&key, ttl).await.map(Some)
                    }
                }
            })
            .collect();
        let results = self.fanout.run_all(ops).await;

        keys.iter()
            .zip(results)
            .map(|(key, result)| match result {
                Ok(Some(url)) => url,
                Ok(None) => self.signing.placeholder_url.clone(),
                Err(e) => {
                    counter!(SIGNING_FAILURES_TOTAL).increment(1);
                    warn!("Failed to sign {}: {}", key, e);
                    self.signing.placeholder_url.clone()
                }
            })
            .collect()
    }

    // ── background work ─────────────────────────────────────────────

    fn spawn_blob_delete(&self, action: &'static str, key: String) {
        let storage = Arc::clone(&self.storage);
        let timeout = self.fanout.timeout();
        self.tracker.spawn(async move {
            remove_blob(storage.as_ref(), timeout, action, &key).await;
        });
    }

    /// Single attempt; the row's blobs were never confirmed, so no sweep.
    fn spawn_row_delete(&self, row: RowRef) {
        let metadata = Arc::clone(&self.metadata);
        let timeout = self.fanout.timeout();
        self.tracker.spawn(async move {
            let kind = row.kind;
            let id = row.id.clone();
            match within(timeout, metadata.delete_media_row(row)).await {
                Ok(_) => {
                    record_compensation("delete_row", true);
                    debug!("Compensated {} {}: row removed", kind, id);
                }
                Err(e) if e.is_not_found() => record_compensation("delete_row", true),
                Err(e) => {
                    record_compensation("delete_row", false);
                    error!("Failed to remove {} row {} after failed upload: {}", kind, id, e);
                }
            }
        });
    }

    /// Point the row back at `previous`, then drop the unusable new blob.
    fn spawn_revert(&self, row: RowRef, previous: String, new_key: ObjectKey, delete_new: bool) {
        let storage = Arc::clone(&self.storage);
        let metadata = Arc::clone(&self.metadata);
        let timeout = self.fanout.timeout();
        self.tracker.spawn(async move {
            let kind = row.kind;
            let id = row.id.clone();
            let reverted = within(
                timeout,
                metadata.swap_media_key(row, previous, Some(new_key.as_str().to_string())),
            )
            .await;
            let released = match reverted {
                Ok(_) => {
                    record_compensation("revert_row", true);
                    true
                }
                // Gone, or already moved on to another key.
                Err(e) if e.is_not_found() => {
                    record_compensation("revert_row", true);
                    true
                }
                Err(e) => {
                    record_compensation("revert_row", false);
                    error!(
                        "Failed to revert {} {} after failed upload; row may reference missing blob {}: {}",
                        kind, id, new_key, e
                    );
                    false
                }
            };
            if released && delete_new {
                remove_blob(storage.as_ref(), timeout, "delete_blob", new_key.as_str()).await;
            }
        });
    }

    /// Remove `keys` plus, when given, everything listed under `prefix`.
    fn spawn_sweep(&self, prefix: Option<String>, keys: Vec<String>) {
        let storage = Arc::clone(&self.storage);
        let timeout = self.fanout.timeout();
        self.tracker.spawn(async move {
            let mut targets = keys;
            if let Some(prefix) = &prefix {
                match within(timeout, storage.list(prefix)).await {
                    Ok(listed) => targets.extend(listed),
                    Err(e) => {
                        record_compensation("list_prefix", false);
                        warn!("Failed to list {} for cleanup: {}", prefix, e);
                    }
                }
            }
            targets.retain(|k| !k.is_empty());
            targets.sort();
            targets.dedup();
            if targets.is_empty() {
                return;
            }

            match within(timeout, storage.delete_batch(&targets)).await {
                Ok(failures) if failures.is_empty() => {
                    record_compensation("delete_batch", true);
                    debug!("Removed {} blobs", targets.len());
                }
                Ok(failures) => {
                    record_compensation("delete_batch", false);
                    counter!(ORPHANED_BLOBS_TOTAL).increment(failures.len() as u64);
                    for failure in failures {
                        error!("Orphaned blob {}: {}", failure.key, failure.reason);
                    }
                }
                Err(e) => {
                    record_compensation("delete_batch", false);
                    counter!(ORPHANED_BLOBS_TOTAL).increment(targets.len() as u64);
                    error!("Failed to delete {} blobs: {}", targets.len(), e);
                }
            }
        });
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn remove_blob(storage: &dyn StorageBackend, timeout: Duration, action: &'static str, key: &str) {
    match within(timeout, storage.delete(key)).await {
        Ok(()) => {
            record_compensation(action, true);
            debug!("Removed blob {}", key);
        }
        Err(e) => {
            record_compensation(action, false);
            counter!(ORPHANED_BLOBS_TOTAL).increment(1);
            error!("Orphaned blob {}: {}", key, e);
        }
    }
}

/// Bound a background store call.
async fn within<T, E>(timeout: Duration, fut: impl Future<Output = Result<T, E>>) -> Result<T, E>
where
    E: From<anyhow::Error>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(E::from(anyhow::anyhow!("timed out after {timeout:?}"))))
}

/// True unless the operation definitely did not take effect.
/// What a finished upload task says about the blob store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadState {
    Stored,
    /// Cancelled, timed out or panicked: the write may still land.
    InFlight,
    Absent,
}

fn upload_state<T>(result: &Result<T, TaskError<MediaError>>) -> UploadState {
    match result {
        Ok(_) => UploadState::Stored,
        Err(e) if e.is_indeterminate() => UploadState::InFlight,
        Err(_) => UploadState::Absent,
    }
}

/// A delete issued now can race the interrupted request; leave a trace the
/// orphan sweep can match on.
fn flag_in_flight(state: UploadState, key: &ObjectKey) {
    if state == UploadState::InFlight {
        warn!(
            "Upload of {} was interrupted; its compensating delete may race a late write",
            key
        );
    }
}

fn may_have_applied<T>(result: &Result<T, TaskError<MediaError>>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => e.is_indeterminate(),
    }
}

/// The error worth reporting: the first one that is not a cancellation
/// caused by a sibling, in the given priority order.
fn decisive_error(candidates: Vec<(&str, Option<TaskError<MediaError>>)>) -> MediaError {
    let mut fallback = None;
    for (operation, err) in candidates {
        match err {
            Some(TaskError::Cancelled) => {
                fallback.get_or_insert(operation);
            }
            Some(e) => return e.into_media_error(operation),
            None => {}
        }
    }
    MediaError::Internal(anyhow::anyhow!(
        "{} was cancelled",
        fallback.unwrap_or("operation")
    ))
}

fn into_pair<T>(mut results: Vec<T>) -> Result<(T, T), MediaError> {
    match (results.pop(), results.pop()) {
        (Some(second), Some(first)) => Ok((first, second)),
        _ => Err(MediaError::Internal(anyhow::anyhow!(
            "fan-out returned fewer results than operations"
        ))),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::media::fixtures;
    use crate::media::MediaFormat;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::metadata::store::{timestamp_now, Album, NewsItem, Project};
    use crate::pagination::PageRequest;
    use crate::storage::testing::{Call, FlakyBackend};
    use std::sync::Mutex;

    struct Harness {
        storage: Arc<FlakyBackend>,
        store: Arc<SqliteMetadataStore>,
        manager: LifecycleManager,
        project: Project,
    }

    async fn harness() -> Harness {
        let storage = FlakyBackend::new();
        let store = Arc::new(SqliteMetadataStore::new(":memory:").unwrap());
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: "acme".to_string(),
            cover: "projects/acme/cover.png".to_string(),
            public_token: "tok".to_string(),
            created_at: timestamp_now(),
        };
        store.insert_project(project.clone()).await.unwrap();
        let manager = LifecycleManager::new(storage.clone(), store.clone(), &Config::default());
        Harness {
            storage,
            store,
            manager,
            project,
        }
    }

    fn jpeg_payload() -> MediaPayload {
        MediaPayload {
            format: MediaFormat::Jpeg,
            bytes: Bytes::from_static(b"jpeg-bytes"),
        }
    }

    fn news_draft(project_id: &str) -> NewsItem {
        NewsItem {
            id: String::new(),
            project_id: project_id.to_string(),
            title: "Launch".to_string(),
            link: String::new(),
            text: String::new(),
            image: String::new(),
            created_at: timestamp_now(),
        }
    }

    fn album_draft(project_id: &str, name: &str) -> Album {
        Album {
            id: String::new(),
            project_id: project_id.to_string(),
            author_id: "author".to_string(),
            name: name.to_string(),
            cover: String::new(),
            created_at: timestamp_now(),
        }
    }

    async fn all_news(h: &Harness) -> Vec<NewsItem> {
        let page = PageRequest::first(h.manager.pagination());
        h.store.list_news(&h.project.id, &page).await.unwrap()
    }

    // ── create ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_create_stores_row_and_blob_under_scope() {
        let h = harness().await;
        let album = h
            .manager
            .create(album_draft(&h.project.id, "Trip"), jpeg_payload())
            .await
            .unwrap()
            .into_value();

        let prefix = format!("services/gallery/{}/{}/", h.project.id, album.id);
        assert!(album.cover.starts_with(&prefix));
        assert!(album.cover.ends_with(".jpg"));
        assert_eq!(h.storage.inner.keys().await, vec![album.cover.clone()]);
    }

    #[tokio::test]
    async fn test_album_insert_failure_deletes_uploaded_cover() {
        let h = harness().await;
        // Unknown project: the insert fails on its foreign key.
        let missing_project = uuid::Uuid::new_v4().to_string();
        let err = h
            .manager
            .create(album_draft(&missing_project, "Trip"), jpeg_payload())
            .await
            .unwrap_err();
        match err {
            MediaError::ForeignKeyViolation { field } => assert_eq!(field, "project_id"),
            other => panic!("unexpected error: {other:?}"),
        }

        h.manager.settle().await;
        let deleted = h.storage.deleted_keys();
        assert_eq!(deleted.len(), 1);
        let prefix = format!("services/gallery/{missing_project}/");
        assert!(deleted[0].starts_with(&prefix));
        assert!(deleted[0].ends_with(".jpg"));
        assert!(h.storage.inner.is_empty().await);
    }

    #[tokio::test]
    async fn test_upload_failure_removes_inserted_row() {
        let h = harness().await;
        h.storage.fail_puts_containing("services/news");
        let err = h
            .manager
            .create(news_draft(&h.project.id), jpeg_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::StorageFailure(_)));

        h.manager.settle().await;
        assert!(all_news(&h).await.is_empty());
        assert!(h.storage.inner.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_timeout_compensates_both_sides() {
        let h = harness().await;
        let manager = LifecycleManager::new(h.storage.clone(), h.store.clone(), &Config::default())
            .with_op_timeout(Duration::from_millis(50));
        h.storage.delay_puts(Duration::from_millis(300));

        let err = manager
            .create(news_draft(&h.project.id), jpeg_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Timeout { .. }));

        manager.settle().await;
        assert!(all_news(&h).await.is_empty());
        assert_eq!(h.storage.deleted_keys().len(), 1);
    }

    // ── replace_media ───────────────────────────────────────────────

    #[test]
    fn test_interrupted_upload_counts_as_in_flight() {
        let stored: Result<(), TaskError<MediaError>> = Ok(());
        assert_eq!(upload_state(&stored), UploadState::Stored);
        for err in [
            TaskError::Cancelled,
            TaskError::TimedOut,
            TaskError::Panicked("boom".to_string()),
        ] {
            let result: Result<(), _> = Err(err);
            assert_eq!(upload_state(&result), UploadState::InFlight);
        }
        let failed: Result<(), _> = Err(TaskError::Failed(MediaError::StorageFailure(
            anyhow::anyhow!("denied"),
        )));
        assert_eq!(upload_state(&failed), UploadState::Absent);
    }

    #[tokio::test]
    async fn test_previous_blob_deleted_only_after_row_points_elsewhere() {
        let h = harness().await;
        let item = h
            .manager
            .create(news_draft(&h.project.id), jpeg_payload())
            .await
            .unwrap()
            .into_value();

        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let store = h.store.clone();
            let project_id = h.project.id.clone();
            let observed = observed.clone();
            h.storage.on_delete(move |key| {
                let page = PageRequest::first(&PaginationConfig::default());
                let rows = futures::executor::block_on(store.list_news(&project_id, &page))
                    .unwrap();
                let current = rows[0].image.clone();
                observed.lock().unwrap().push((key.to_string(), current));
            });
        }

        let scope = KeyScope::owned(ResourceKind::News, &h.project.id, &item.id);
        let new_key = h
            .manager
            .replace_media(item.row_ref(), scope, jpeg_payload())
            .await
            .unwrap()
            .into_value();
        h.manager.settle().await;

        let observed = observed.lock().unwrap().clone();
        assert_eq!(observed, vec![(item.image.clone(), new_key.as_str().to_string())]);
        assert_eq!(h.storage.inner.keys().await, vec![new_key.into_string()]);
    }

    #[tokio::test]
    async fn test_replace_missing_row_deletes_new_blob() {
        let h = harness().await;
        let id = uuid::Uuid::new_v4().to_string();
        let row = RowRef::owned(ResourceKind::News, &h.project.id, &id);
        let scope = KeyScope::owned(ResourceKind::News, &h.project.id, &id);

        let err = h
            .manager
            .replace_media(row, scope, jpeg_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NotFound { .. }));

        h.manager.settle().await;
        assert!(h.storage.inner.is_empty().await);
    }

    #[tokio::test]
    async fn test_replace_upload_failure_reverts_row() {
        let h = harness().await;
        let item = h
            .manager
            .create(news_draft(&h.project.id), jpeg_payload())
            .await
            .unwrap()
            .into_value();
        h.storage.fail_puts_containing(&item.id);

        let scope = KeyScope::owned(ResourceKind::News, &h.project.id, &item.id);
        let err = h
            .manager
            .replace_media(item.row_ref(), scope, jpeg_payload())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::StorageFailure(_)));

        h.manager.settle().await;
        let rows = all_news(&h).await;
        assert_eq!(rows[0].image, item.image);
        assert!(h.storage.inner.keys().await.contains(&item.image));
    }

    // ── delete ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_delete_sweeps_resource_prefix() {
        let h = harness().await;
        let album = h
            .manager
            .create(album_draft(&h.project.id, "Trip"), jpeg_payload())
            .await
            .unwrap()
            .into_value();
        let scope = KeyScope::owned(ResourceKind::Album, &h.project.id, &album.id);
        let photo_key = h.manager.keys().generate(&scope, "png");
        h.storage
            .inner
            .put(photo_key.as_str(), Bytes::from_static(b"p"), "image/png")
            .await
            .unwrap();

        let outcome = h
            .manager
            .delete(album.row_ref(), Cleanup::Prefix(scope))
            .await
            .unwrap();
        assert!(outcome.is_success());

        h.manager.settle().await;
        assert!(h.storage.inner.is_empty().await);
        assert!(h
            .manager
            .delete(album.row_ref(), Cleanup::RowKeys)
            .await
            .unwrap_err()
            .to_string()
            .contains("not found"));
    }

    #[tokio::test]
    async fn test_batch_delete_removes_exactly_deleted_images() {
        let h = harness().await;
        let a = h
            .manager
            .create(news_draft(&h.project.id), jpeg_payload())
            .await
            .unwrap()
            .into_value();
        let b = h
            .manager
            .create(news_draft(&h.project.id), jpeg_payload())
            .await
            .unwrap()
            .into_value();
        let ghost = uuid::Uuid::new_v4().to_string();

        let scope = BatchScope {
            kind: ResourceKind::News,
            project_id: h.project.id.clone(),
            album_id: None,
        };
        let outcome = h
            .manager
            .delete_batch(scope.clone(), BatchSelector::Ids(vec![a.id.clone(), ghost.clone()]))
            .await
            .unwrap();
        match &outcome {
            Outcome::PartialFailure { value, warning } => {
                assert_eq!(value.ids, vec![a.id.clone()]);
                assert!(warning.to_string().contains(&ghost));
            }
            other => panic!("expected partial failure, got {other:?}"),
        }

        h.manager.settle().await;
        let batches: Vec<Vec<String>> = h
            .storage
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::DeleteBatch(keys) => Some(keys),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![vec![a.image.clone()]]);
        assert_eq!(h.storage.inner.keys().await, vec![b.image.clone()]);

        let err = h
            .manager
            .delete_batch(scope, BatchSelector::Ids(vec![ghost]))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NotFound { .. }));
    }

    // ── attach_media ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_bulk_upload_keeps_successful_siblings() {
        let h = harness().await;
        let blog_id = uuid::Uuid::new_v4().to_string();
        let scope = KeyScope::owned(ResourceKind::Blog, &h.project.id, &blog_id);
        let keys: Vec<String> = (0..3)
            .map(|_| h.manager.keys().generate(&scope, "png").into_string())
            .collect();
        let files = vec![
            Attachment {
                index: 0,
                destination: keys[0].clone(),
                upload: Upload::new("image/png", fixtures::png()),
            },
            Attachment {
                index: 1,
                destination: keys[1].clone(),
                upload: Upload::new("image/png", Bytes::from_static(b"not an image")),
            },
            Attachment {
                index: 2,
                destination: keys[2].clone(),
                upload: Upload::new("image/png", fixtures::png()),
            },
        ];

        let outcome = h.manager.attach_media(scope, files).await.unwrap();
        let report = outcome.value().clone();
        assert!(!outcome.is_success());
        assert!(!report.success);
        assert_eq!(report.uploaded, vec![0, 2]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].index, 1);

        h.manager.settle().await;
        let mut stored = h.storage.inner.keys().await;
        stored.sort();
        let mut expected = vec![keys[0].clone(), keys[2].clone()];
        expected.sort();
        assert_eq!(stored, expected);
        assert!(h.storage.deleted_keys().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_upload_rejects_foreign_destination() {
        let h = harness().await;
        let scope = KeyScope::owned(ResourceKind::Blog, &h.project.id, "blog-1");
        let files = vec![Attachment {
            index: 0,
            destination: "projects/other/evil.png".to_string(),
            upload: Upload::new("image/png", fixtures::png()),
        }];
        let err = h.manager.attach_media(scope, files).await.unwrap_err();
        assert!(matches!(err, MediaError::InvalidInput { ref field, .. } if field == "destination"));
        assert!(h.storage.calls().is_empty());
    }

    #[tokio::test]
    async fn test_detach_removes_only_named_keys_inside_scope() {
        let h = harness().await;
        let scope = KeyScope::owned(ResourceKind::Blog, &h.project.id, "blog-1");
        let keep = h.manager.keys().generate(&scope, "png").into_string();
        let drop = h.manager.keys().generate(&scope, "png").into_string();
        for key in [&keep, &drop] {
            h.storage
                .inner
                .put(key, Bytes::from_static(b"p"), "image/png")
                .await
                .unwrap();
        }

        let err = h
            .manager
            .detach_media(scope.clone(), vec!["services/blogs/elsewhere/x.png".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidInput { ref field, .. } if field == "paths"));

        let outcome = h
            .manager
            .detach_media(scope, vec![drop.clone()])
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.into_value(), vec![drop]);
        assert_eq!(h.storage.inner.keys().await, vec![keep]);
    }

    // ── signing ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_signing_failure_degrades_to_placeholder() {
        let h = harness().await;
        h.storage
            .inner
            .put("good.jpg", Bytes::from_static(b"x"), "image/jpeg")
            .await
            .unwrap();
        h.storage.fail_signing_containing("bad");

        let urls = h
            .manager
            .sign_keys(
                vec!["good.jpg".to_string(), "bad.jpg".to_string(), String::new()],
                Duration::from_secs(600),
            )
            .await;
        assert_eq!(urls.len(), 3);
        assert!(urls[0].starts_with("memory://good.jpg?expires="));
        assert_eq!(urls[1], "");
        assert_eq!(urls[2], "");
    }
}
