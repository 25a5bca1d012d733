//! mediacms library: media-backed resource lifecycle engine.
//!
//! Every resource a project owns pairs a metadata row with blobs in an
//! object store.  The two stores share no transaction; this crate keeps
//! them consistent through concurrent fan-out and compensating cleanup,
//! and exposes per-resource services on top.

use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod fanout;
pub mod hierarchy;
pub mod identity;
pub mod keys;
pub mod lifecycle;
pub mod media;
pub mod metadata;
pub mod metrics;
pub mod pagination;
pub mod resources;
pub mod server;
pub mod storage;

use crate::config::Config;
use crate::lifecycle::LifecycleManager;
use crate::metadata::store::MetadataStore;
use crate::resources::blogs::BlogService;
use crate::resources::categories::CategoryService;
use crate::resources::documents::DocumentService;
use crate::resources::gallery::GalleryService;
use crate::resources::news::NewsService;
use crate::resources::projects::ProjectService;
use crate::storage::backend::StorageBackend;
use crate::storage::signing::UrlSigner;

/// Store handles and services, constructed once at startup.
pub struct AppContext {
    /// Loaded configuration.
    pub config: Config,
    /// Shared lifecycle manager; owns the background cleanup tracker.
    pub lifecycle: Arc<LifecycleManager>,
    pub projects: ProjectService,
    pub blogs: BlogService,
    pub gallery: GalleryService,
    pub news: NewsService,
    pub documents: DocumentService,
    pub categories: CategoryService,
    /// Verifies local download links; `None` when the blob store presigns
    /// its own URLs.
    pub media_signer: Option<UrlSigner>,
}

impl AppContext {
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(storage, metadata, &config));
        Self {
            projects: ProjectService::new(Arc::clone(&lifecycle)),
            blogs: BlogService::new(Arc::clone(&lifecycle)),
            gallery: GalleryService::new(Arc::clone(&lifecycle)),
            news: NewsService::new(Arc::clone(&lifecycle)),
            documents: DocumentService::new(Arc::clone(&lifecycle)),
            categories: CategoryService::new(Arc::clone(&lifecycle)),
            lifecycle,
            config,
            media_signer: None,
        }
    }

    /// Serve signed local downloads, verified with `signer`.
    pub fn with_media_signer(mut self, signer: UrlSigner) -> Self {
        self.media_signer = Some(signer);
        self
    }
}
