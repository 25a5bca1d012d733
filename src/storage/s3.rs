//! S3 (and S3-compatible) blob store.
//!
//! All object keys live in a single bucket.  Read links are SigV4
//! presigned GET requests produced by the SDK.
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless explicit keys
//! are configured.

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::{DeleteFailure, StorageBackend, StorageFuture, StoredObject};
use crate::config::S3StorageConfig;

/// Largest batch a single DeleteObjects request accepts.
const DELETE_BATCH_LIMIT: usize = 1000;

/// Blob store backed by an S3 bucket.
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Build the SDK client from config and the default credential chain.
    pub async fn new(config: &S3StorageConfig) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if !config.endpoint_url.is_empty() {
            config_loader = config_loader.endpoint_url(&config.endpoint_url);
        }

        if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            let creds = aws_sdk_s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None, // session_token
                None, // expiry
                "mediacms-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.use_path_style)
            .build();

        info!(
            "S3 blob store initialized: bucket={} region={}",
            config.bucket, config.region
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }

    /// Map an AWS SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("S3 {context}: {err}")
    }

    async fn delete_chunk(&self, keys: &[String]) -> anyhow::Result<Vec<DeleteFailure>> {
        let objects = keys
            .iter()
            .map(|k| {
                ObjectIdentifier::builder()
                    .key(k)
                    .build()
                    .map_err(|e| Self::map_sdk_error("delete_objects build", e))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| Self::map_sdk_error("delete_objects build", e))?;

        let resp = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error("delete_objects", e))?;

        Ok(resp
            .errors()
            .iter()
            .map(|e| DeleteFailure {
                key: e.key().unwrap_or_default().to_string(),
                reason: format!(
                    "{}: {}",
                    e.code().unwrap_or("Unknown"),
                    e.message().unwrap_or_default()
                ),
            })
            .collect())
    }
}

impl StorageBackend for S3Backend {
    fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            debug!("S3 put_object: bucket={} key={}", self.bucket, key);
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .content_type(content_type)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> StorageFuture<'_, StoredObject> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("S3 get_object: bucket={} key={}", self.bucket, key);
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        anyhow::anyhow!("Object not found at key: {key}")
                    } else {
                        Self::map_sdk_error("get_object", service_err)
                    }
                })?;

            let content_type = resp.content_type().map(str::to_string);
            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();

            Ok(StoredObject { data, content_type })
        })
    }

    fn delete(&self, key: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("S3 delete_object: bucket={} key={}", self.bucket, key);
            // S3 delete_object is idempotent -- no error for missing keys.
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;
            Ok(())
        })
    }

    fn delete_batch(&self, keys: &[String]) -> StorageFuture<'_, Vec<DeleteFailure>> {
        let keys = keys.to_vec();
        Box::pin(async move {
            debug!("S3 delete_objects: bucket={} count={}", self.bucket, keys.len());
            let mut failures = Vec::new();
            for chunk in keys.chunks(DELETE_BATCH_LIMIT) {
                let result = self.delete_chunk(chunk).await;
                failures.extend(chunk_failures(chunk, result));
            }
            Ok(failures)
        })
    }

    fn list(&self, prefix: &str) -> StorageFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            debug!("S3 list_objects_v2: bucket={} prefix={}", self.bucket, prefix);
            let mut keys = Vec::new();
            let mut continuation_token: Option<String> = None;
            loop {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix);

                if let Some(ref token) = continuation_token {
                    req = req.continuation_token(token);
                }

                let resp = req
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("list_objects_v2", e))?;

                keys.extend(
                    resp.contents()
                        .iter()
                        .filter_map(|obj| obj.key().map(str::to_string)),
                );

                continuation_token =
                    next_page_token(resp.is_truncated(), resp.next_continuation_token());
                if continuation_token.is_none() {
                    break;
                }
            }
            Ok(keys)
        })
    }

    fn exists(&self, key: &str) -> StorageFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(Self::map_sdk_error("head_object", service_err))
                    }
                }
            }
        })
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            let presigning = PresigningConfig::expires_in(ttl)
                .map_err(|e| Self::map_sdk_error("presigning config", e))?;
            let request = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .presigned(presigning)
                .await
                .map_err(|e| Self::map_sdk_error("presign get_object", e))?;
            Ok(request.uri().to_string())
        })
    }
}

// -- Tests -------------------------------------------------------------------

/// Token for the next listing page.  A truncated response without a token
/// ends the listing rather than restarting it from the first page.
fn next_page_token(is_truncated: Option<bool>, token: Option<&str>) -> Option<String> {
    match (is_truncated, token) {
        (Some(true), Some(token)) if !token.is_empty() => Some(token.to_string()),
        (Some(true), _) => {
            warn!("S3 list_objects_v2 truncated without a continuation token; stopping");
            None
        }
        _ => None,
    }
}

/// Per-key failures for one delete chunk.  A failed request marks every key
/// in the chunk as failed so earlier chunks' results survive.
fn chunk_failures(
    chunk: &[String],
    result: anyhow::Result<Vec<DeleteFailure>>,
) -> Vec<DeleteFailure> {
    match result {
        Ok(failures) => failures,
        Err(e) => {
            warn!("S3 delete_objects chunk of {} keys failed: {}", chunk.len(), e);
            let reason = e.to_string();
            chunk
                .iter()
                .map(|key| DeleteFailure {
                    key: key.clone(),
                    reason: reason.clone(),
                })
                .collect()
        }
    }
}
