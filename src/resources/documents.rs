//! Document covers: named folders whose files share the cover's directory.

use std::sync::Arc;

use crate::errors::MediaError;
use crate::identity::Identity;
use crate::keys::{KeyScope, ResourceKind};
use crate::lifecycle::{Cleanup, LifecycleManager, Outcome};
use crate::metadata::store::{timestamp_now, DocumentCover, RowRef};
use crate::pagination::{Page, PageRequest};

use super::required;

pub struct DocumentService {
    lifecycle: Arc<LifecycleManager>,
}

impl DocumentService {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    /// Create an empty cover.  No blob is written.
    pub async fn create(
        &self,
        identity: &Identity,
        project_id: &str,
        name: &str,
    ) -> Result<DocumentCover, MediaError> {
        identity.authorize_project(project_id)?;
        let cover = DocumentCover {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            author_id: identity.user_id.clone(),
            name: required("name", name)?,
            created_at: timestamp_now(),
        };
        self.lifecycle
            .store_call(
                "insert document cover",
                self.lifecycle.metadata().insert_document_cover(cover.clone()),
            )
            .await?;
        Ok(cover)
    }

    pub async fn list(
        &self,
        identity: &Identity,
        project_id: &str,
        page: PageRequest,
    ) -> Result<Page<DocumentCover>, MediaError> {
        identity.authorize_project(project_id)?;
        let rows = self
            .lifecycle
            .store_call(
                "list document covers",
                self.lifecycle
                    .metadata()
                    .list_document_covers(project_id, &page),
            )
            .await?;
        Ok(Page::from_rows(rows, page.limit))
    }

    pub async fn rename(
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
                "rename document cover",
                self.lifecycle
                    .metadata()
                    .rename_document_cover(project_id, id, name),
            )
            .await
    }

    /// Delete the cover and every document stored under it.
    pub async fn delete(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
    ) -> Result<Outcome<()>, MediaError> {
        identity.authorize_project(project_id)?;
        self.lifecycle
            .delete(
                RowRef::owned(ResourceKind::DocumentCover, project_id, id),
                Cleanup::Prefix(KeyScope::owned(ResourceKind::DocumentCover, project_id, id)),
            )
            .await
    }
}
