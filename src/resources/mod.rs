//! Resource services built on the lifecycle manager.
//!
//! Each service validates caller input, checks the caller may touch the
//! project, and delegates every blob-bearing write to
//! [`LifecycleManager`](crate::lifecycle::LifecycleManager).  Reads replace
//! stored blob keys with signed URLs before returning records.

pub mod blogs;
pub mod categories;
pub mod content;
pub mod documents;
pub mod gallery;
pub mod news;
pub mod projects;

use std::time::Duration;

use crate::errors::MediaError;
use crate::lifecycle::LifecycleManager;
use crate::metadata::store::{Album, Blog, BlogSummary, NewsItem, Photo, Project};

/// Records whose blob key is swapped for a signed URL on the way out.
pub trait Signable {
    fn media_key(&mut self) -> &mut String;
}

macro_rules! signable {
    ($($t:ty => $field:ident),*) => {
        $(impl Signable for $t {
            fn media_key(&mut self) -> &mut String {
                &mut self.$field
            }
        })*
    };
}

signable!(
    Project => cover,
    Blog => cover,
    BlogSummary => cover,
    Album => cover,
    Photo => image,
    NewsItem => image
);

/// Replace every item's key with a signed URL in one fan-out.
pub(crate) async fn sign_all<T: Signable>(
    lifecycle: &LifecycleManager,
    items: &mut [T],
    ttl: Duration,
) {
    let keys: Vec<String> = items.iter_mut().map(|i| i.media_key().clone()).collect();
    let urls = lifecycle.sign_keys(keys, ttl).await;
    for (item, url) in items.iter_mut().zip(urls) {
        *item.media_key() = url;
    }
}

/// Trimmed, non-empty value of a required text field.
pub(crate) fn required(field: &str, value: &str) -> Result<String, MediaError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MediaError::invalid(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Like [`required`], for optional patch fields.
pub(crate) fn optional(field: &str, value: Option<String>) -> Result<Option<String>, MediaError> {
    value.map(|v| required(field, &v)).transpose()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for the service tests.

    use std::sync::Arc;

    use crate::config::Config;
    use crate::identity::Identity;
    use crate::lifecycle::LifecycleManager;
    use crate::media::{fixtures, Upload};
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::storage::testing::FlakyBackend;

    pub struct Fixture {
        pub storage: Arc<FlakyBackend>,
        pub lifecycle: Arc<LifecycleManager>,
        pub admin: Identity,
    }

    pub fn fixture() -> Fixture {
        let storage = FlakyBackend::new();
        let store = Arc::new(SqliteMetadataStore::new(":memory:").unwrap());
        let lifecycle = Arc::new(LifecycleManager::new(
            storage.clone(),
            store,
            &Config::default(),
        ));
        Fixture {
            storage,
            lifecycle,
            admin: Identity::admin("admin-1"),
        }
    }

    pub fn png() -> Upload {
        Upload::new("image/png", fixtures::png())
    }

    pub fn jpeg() -> Upload {
        Upload::new("image/jpeg", fixtures::jpeg())
    }
}
