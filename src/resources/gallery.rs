//! Gallery albums and their photos.
//!
//! An album owns a directory holding its cover and every photo, so
//! deleting the album sweeps the photos' blobs along with it.  A photo
//! delete removes exactly the keys its row referenced.

use std::sync::Arc;

use crate::errors::MediaError;
use crate::identity::Identity;
use crate::keys::{KeyScope, ObjectKey, ResourceKind};
use crate::lifecycle::{BatchDeleted, Cleanup, LifecycleManager, MediaResource, Outcome};
use crate::media::{self, Upload};
use crate::metadata::store::{
    timestamp_now, Album, BatchScope, BatchSelector, MetadataStore, Photo, RowRef, StoreFuture,
};
use crate::pagination::{Page, PageRequest};

use super::{required, sign_all};

impl MediaResource for Album {
    const KIND: ResourceKind = ResourceKind::Album;

    fn assign_id(&mut self, id: String) {
        self.id = id;
    }

    fn key_scope(&self) -> KeyScope {
        album_scope(&self.project_id, &self.id)
    }

    fn attach_key(&mut self, key: &ObjectKey) {
        self.cover = key.as_str().to_string();
    }

    fn row_ref(&self) -> RowRef {
        RowRef::owned(ResourceKind::Album, &self.project_id, &self.id)
    }

    fn insert(store: &dyn MetadataStore, record: Self) -> StoreFuture<'_, ()> {
        store.insert_album(record)
    }
}

impl MediaResource for Photo {
    const KIND: ResourceKind = ResourceKind::Photo;

    fn assign_id(&mut self, id: String) {
        self.id = id;
    }

    /// Photos are written into their album's directory.
    fn key_scope(&self) -> KeyScope {
        KeyScope::owned(ResourceKind::Photo, &self.project_id, &self.album_id)
    }

    fn attach_key(&mut self, key: &ObjectKey) {
        self.image = key.as_str().to_string();
    }

    fn row_ref(&self) -> RowRef {
        RowRef::owned(ResourceKind::Photo, &self.project_id, &self.id)
    }

    fn insert(store: &dyn MetadataStore, record: Self) -> StoreFuture<'_, ()> {
        store.insert_photo(record)
    }
}

fn album_scope(project_id: &str, album_id: &str) -> KeyScope {
    KeyScope::owned(ResourceKind::Album, project_id, album_id)
}

pub struct GalleryService {
    lifecycle: Arc<LifecycleManager>,
}

impl GalleryService {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    // ── albums ──────────────────────────────────────────────────────

    pub async fn create_album(
        &self,
        identity: &Identity,
        project_id: &str,
        name: &str,
        cover: Upload,
    ) -> Result<Outcome<Album>, MediaError> {
        identity.authorize_project(project_id)?;
        let name = required("name", name)?;
        let payload = media::prepare_blocking(cover, self.lifecycle.media()).await?;
        let draft = Album {
            id: String::new(),
            project_id: project_id.to_string(),
            author_id: identity.user_id.clone(),
            name,
            cover: String::new(),
            created_at: timestamp_now(),
        };
        self.lifecycle.create(draft, payload).await
    }

    pub async fn list_albums(
        &self,
        identity: &Identity,
        project_id: &str,
        page: PageRequest,
    ) -> Result<Page<Album>, MediaError> {
        identity.authorize_project(project_id)?;
        let rows = self
            .lifecycle
            .store_call(
                "list albums",
                self.lifecycle.metadata().list_albums(project_id, &page),
            )
            .await?;
        let mut page = Page::from_rows(rows, page.limit);
        let ttl = self.lifecycle.signing().listing_ttl();
        sign_all(&self.lifecycle, &mut page.items, ttl).await;
        Ok(page)
    }

    pub async fn rename_album(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
        name: &str,
    ) -> Result<(), MediaError> {
        identity.authorize_project(project_id)?;
        let name = required("name", name)?;
        self.lifecycle
            .store_call(
                "rename album",
                self.lifecycle.metadata().rename_album(project_id, id, name),
            )
            .await
    }

    pub async fn replace_album_cover(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
        cover: Upload,
    ) -> Result<Outcome<ObjectKey>, MediaError> {
        identity.authorize_project(project_id)?;
        let payload = media::prepare_blocking(cover, self.lifecycle.media()).await?;
        self.lifecycle
            .replace_media(
                RowRef::owned(ResourceKind::Album, project_id, id),
                album_scope(project_id, id),
                payload,
            )
            .await
    }

    /// Delete the album; its photo rows cascade and the directory sweep
    /// removes their blobs.
    pub async fn delete_album(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
    ) -> Result<Outcome<()>, MediaError> {
        identity.authorize_project(project_id)?;
        self.lifecycle
            .delete(
                RowRef::owned(ResourceKind::Album, project_id, id),
                Cleanup::Prefix(album_scope(project_id, id)),
            )
            .await
    }

    // ── photos ──────────────────────────────────────────────────────

    pub async fn add_photo(
        &self,
        identity: &Identity,
        project_id: &str,
        album_id: &str,
        image: Upload,
    ) -> Result<Outcome<Photo>, MediaError> {
        identity.authorize_project(project_id)?;
        let payload = media::prepare_blocking(image, self.lifecycle.media()).await?;
        let draft = Photo {
            id: String::new(),
            project_id: project_id.to_string(),
            album_id: album_id.to_string(),
            image: String::new(),
            created_at: timestamp_now(),
        };
        self.lifecycle.create(draft, payload).await
    }

    pub async fn list_photos(
        &self,
        identity: &Identity,
        project_id: &str,
        album_id: &str,
        page: PageRequest,
    ) -> Result<Page<Photo>, MediaError> {
        identity.authorize_project(project_id)?;
        let rows = self
            .lifecycle
            .store_call(
                "list photos",
                self.lifecycle
                    .metadata()
                    .list_photos(project_id, album_id, &page),
            )
            .await?;
        let mut page = Page::from_rows(rows, page.limit);
        let ttl = self.lifecycle.signing().listing_ttl();
        sign_all(&self.lifecycle, &mut page.items, ttl).await;
        Ok(page)
    }

    /// Delete one photo and exactly the blob it referenced.
    pub async fn delete_photo(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
    ) -> Result<Outcome<()>, MediaError> {
        identity.authorize_project(project_id)?;
        self.lifecycle
            .delete(
                RowRef::owned(ResourceKind::Photo, project_id, id),
                Cleanup::RowKeys,
            )
            .await
    }

    /// Delete the given photos of an album, or all of them when `ids` is
    /// empty.
    pub async fn delete_photos(
        &self,
        identity: &Identity,
        project_id: &str,
        album_id: &str,
        ids: Vec<String>,
    ) -> Result<Outcome<BatchDeleted>, MediaError> {
        identity.authorize_project(project_id)?;
        let selector = if ids.is_empty() {
            BatchSelector::All
        } else {
            BatchSelector::Ids(ids)
        };
        let scope = BatchScope {
            kind: ResourceKind::Photo,
            project_id: project_id.to_string(),
            album_id: Some(album_id.to_string()),
        };
        self.lifecycle.delete_batch(scope, selector).await
    }
}
