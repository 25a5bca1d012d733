//! Metadata records and the abstract store trait.
//!
//! Any relational backend must implement [`MetadataStore`].  The trait
//! uses manually desugared async methods (pinned, boxed futures) so it can
//! be held as `Arc<dyn MetadataStore>`.  Failures are reported as
//! [`StoreError`], whose constraint kinds are vendor neutral.

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::keys::ResourceKind;
use crate::pagination::{Keyed, PageRequest};

/// Future returned by every store method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

// ── Errors ──────────────────────────────────────────────────────────

/// Class of integrity constraint a write violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    InvalidInputSyntax,
}

/// Errors produced by a metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The statement matched no row.
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// An integrity constraint rejected the statement.  `field` names the
    /// offending column or entity when it can be determined.
    #[error("{kind:?} on {}", .field.as_deref().unwrap_or("unknown field"))]
    Constraint {
        kind: ConstraintKind,
        field: Option<String>,
    },

    /// Anything else (I/O, driver, corrupt row).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        StoreError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn constraint(kind: ConstraintKind, field: impl Into<String>) -> Self {
        StoreError::Constraint {
            kind,
            field: Some(field.into()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

// ── Records ─────────────────────────────────────────────────────────

/// Current time at the microsecond precision stores persist.
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}

/// A content service a project can enable (blogs, gallery, news,
/// documents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    #[serde(rename = "serviceId")]
    pub id: String,
    #[serde(rename = "serviceName")]
    pub name: String,
    pub icon: String,
}

/// A tenant.  Owns every other resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub cover: String,
    pub public_token: String,
    pub created_at: DateTime<Utc>,
}

/// A blog post with its full content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blog {
    pub id: String,
    pub project_id: String,
    pub author_id: String,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub category_id: String,
    pub cover: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Category reference embedded in blog listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRef {
    pub id: String,
    pub name: String,
}

/// Blog listing row (no content).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlogSummary {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub author_id: String,
    pub category: CategoryRef,
    pub cover: String,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a blog's descriptive fields.
#[derive(Debug, Clone, Default)]
pub struct BlogMetadataPatch {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub category_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub id: String,
    pub project_id: String,
    pub author_id: String,
    pub name: String,
    pub cover: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    pub id: String,
    pub project_id: String,
    pub album_id: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub link: String,
    pub text: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a news item's text fields.
#[derive(Debug, Clone, Default)]
pub struct NewsPatch {
    pub title: Option<String>,
    pub link: Option<String>,
    pub text: Option<String>,
}

/// A named folder of documents.  Has no blob of its own, but its documents
/// live under its key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCover {
    pub id: String,
    pub project_id: String,
    pub author_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Flat category row.  `parent_id` is `None` for a project's root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRow {
    pub id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

macro_rules! keyed {
    ($($t:ty),*) => {
        $(impl Keyed for $t {
            fn created_at(&self) -> DateTime<Utc> {
                self.created_at
            }
            fn key_id(&self) -> &str {
                &self.id
            }
        })*
    };
}

keyed!(BlogSummary, Album, Photo, NewsItem, DocumentCover);

// ── Row addressing ──────────────────────────────────────────────────

/// Addresses one row of a media-backed table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRef {
    pub kind: ResourceKind,
    pub id: String,
    /// Owning project; `None` only for projects themselves.
    pub project_id: Option<String>,
}

impl RowRef {
    pub fn project(id: &str) -> Self {
        Self {
            kind: ResourceKind::Project,
            id: id.to_string(),
            project_id: None,
        }
    }

    pub fn owned(kind: ResourceKind, project_id: &str, id: &str) -> Self {
        Self {
            kind,
            id: id.to_string(),
            project_id: Some(project_id.to_string()),
        }
    }
}

/// Rows selected by a batch delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSelector {
    /// Exactly these ids (within the parent).
    Ids(Vec<String>),
    /// Every row under the parent.
    All,
}

/// Parent scope of a batch delete: the project, and for photos the album.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchScope {
    pub kind: ResourceKind,
    pub project_id: String,
    pub album_id: Option<String>,
}

/// A row removed by a delete, with the blob keys it referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedRow {
    pub id: String,
    pub keys: Vec<String>,
}

// ── Store trait ─────────────────────────────────────────────────────

/// Async metadata store contract.
pub trait MetadataStore: Send + Sync + 'static {
    /// Cheap liveness query for readiness checks.
    fn ping(&self) -> StoreFuture<'_, ()>;

    // ── Media rows (all kinds) ──────────────────────────────────────

    /// Replace the primary blob key of a row, returning the key it held.
    ///
    /// When `expected_current` is set, the update only applies if the row
    /// still holds that key; otherwise `NotFound` is returned.
    fn swap_media_key(
        &self,
        row: RowRef,
        new_key: String,
        expected_current: Option<String>,
    ) -> StoreFuture<'_, String>;

    /// Delete one row, returning the blob keys it referenced.
    fn delete_media_row(&self, row: RowRef) -> StoreFuture<'_, DeletedRow>;

    /// Delete many rows in one statement, returning what was removed.
    fn delete_media_rows(
        &self,
        scope: BatchScope,
        selector: BatchSelector,
    ) -> StoreFuture<'_, Vec<DeletedRow>>;

    // ── Projects ────────────────────────────────────────────────────

    /// Insert a project together with its root category.
    fn insert_project(&self, project: Project) -> StoreFuture<'_, ()>;

    fn get_project(&self, id: &str) -> StoreFuture<'_, Project>;

    fn list_projects(&self) -> StoreFuture<'_, Vec<Project>>;

    // ── Project membership and services ─────────────────────────────

    /// Grant `user_id` access to a project.  A repeated grant is a unique
    /// violation.
    fn add_member(&self, project_id: &str, user_id: &str) -> StoreFuture<'_, ()>;

    fn remove_member(&self, project_id: &str, user_id: &str) -> StoreFuture<'_, ()>;

    /// Projects `user_id` belongs to, newest first.
    fn list_projects_for_user(&self, user_id: &str) -> StoreFuture<'_, Vec<Project>>;

    /// The service catalog.
    fn list_services(&self) -> StoreFuture<'_, Vec<ServiceInfo>>;

    /// Enable every service in `service_ids` for a project, all or none.
    fn add_project_services(
        &self,
        project_id: &str,
        service_ids: Vec<String>,
    ) -> StoreFuture<'_, ()>;

    fn remove_project_service(&self, project_id: &str, service_id: &str) -> StoreFuture<'_, ()>;

    /// Services enabled for a project, by name.
    fn list_project_services(&self, project_id: &str) -> StoreFuture<'_, Vec<ServiceInfo>>;

    // ── Blogs ───────────────────────────────────────────────────────

    fn insert_blog(&self, blog: Blog) -> StoreFuture<'_, ()>;

    fn get_blog(&self, project_id: &str, id: &str) -> StoreFuture<'_, Blog>;

    /// Up to `page.fetch_limit()` summaries, newest first.  With
    /// `category_id`, only blogs in that category or below it.
    fn list_blogs(
        &self,
        project_id: &str,
        category_id: Option<&str>,
        page: &PageRequest,
    ) -> StoreFuture<'_, Vec<BlogSummary>>;

    fn update_blog_metadata(
        &self,
        project_id: &str,
        id: &str,
        patch: BlogMetadataPatch,
    ) -> StoreFuture<'_, ()>;

    fn update_blog_content(&self, project_id: &str, id: &str, content: String)
        -> StoreFuture<'_, ()>;

    // ── Gallery ─────────────────────────────────────────────────────

    fn insert_album(&self, album: Album) -> StoreFuture<'_, ()>;

    fn list_albums(&self, project_id: &str, page: &PageRequest) -> StoreFuture<'_, Vec<Album>>;

    fn rename_album(&self, project_id: &str, id: &str, name: String) -> StoreFuture<'_, ()>;

    fn insert_photo(&self, photo: Photo) -> StoreFuture<'_, ()>;

    fn list_photos(
        &self,
        project_id: &str,
        album_id: &str,
        page: &PageRequest,
    ) -> StoreFuture<'_, Vec<Photo>>;

    // ── News ────────────────────────────────────────────────────────

    fn insert_news(&self, item: NewsItem) -> StoreFuture<'_, ()>;

    fn list_news(&self, project_id: &str, page: &PageRequest) -> StoreFuture<'_, Vec<NewsItem>>;

    fn update_news(&self, project_id: &str, id: &str, patch: NewsPatch) -> StoreFuture<'_, ()>;

    // ── Documents ───────────────────────────────────────────────────

    fn insert_document_cover(&self, cover: DocumentCover) -> StoreFuture<'_, ()>;

    fn list_document_covers(
        &self,
        project_id: &str,
        page: &PageRequest,
    ) -> StoreFuture<'_, Vec<DocumentCover>>;

    fn rename_document_cover(&self, project_id: &str, id: &str, name: String)
        -> StoreFuture<'_, ()>;

    // ── Categories ──────────────────────────────────────────────────

    fn insert_category(&self, category: CategoryRow) -> StoreFuture<'_, ()>;

    fn rename_category(&self, project_id: &str, id: &str, name: String) -> StoreFuture<'_, ()>;

    fn delete_category(&self, project_id: &str, id: &str) -> StoreFuture<'_, ()>;

    fn list_categories(&self, project_id: &str) -> StoreFuture<'_, Vec<CategoryRow>>;

    /// `id` and every descendant id, via the store's recursive query.
    fn category_closure(&self, project_id: &str, id: &str) -> StoreFuture<'_, Vec<String>>;
}
