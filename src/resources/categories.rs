//! Blog categories: a per-project tree rooted at the default category.

use std::sync::Arc;

use tracing::debug;

use crate::errors::MediaError;
use crate::hierarchy::{self, CategoryNode};
use crate::identity::Identity;
use crate::lifecycle::LifecycleManager;
use crate::metadata::store::{timestamp_now, CategoryRow};

use super::required;

pub struct CategoryService {
    lifecycle: Arc<LifecycleManager>,
}

impl CategoryService {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    /// Add a category below `parent_id`.  Siblings must have distinct names.
    pub async fn create(
        &self,
        identity: &Identity,
        project_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<CategoryRow, MediaError> {
        identity.authorize_project(project_id)?;
        let row = CategoryRow {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            parent_id: Some(required("parent_id", parent_id)?),
            name: required("name", name)?,
            created_at: timestamp_now(),
        };
        self.lifecycle
            .store_call(
                "insert category",
                self.lifecycle.metadata().insert_category(row.clone()),
            )
            .await?;
        debug!("Created category {} under {:?}", row.id, row.parent_id);
        Ok(row)
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
                "rename category",
                self.lifecycle.metadata().rename_category(project_id, id, name),
            )
            .await
    }

    /// Delete a category and its descendants, returning the removed ids.
    /// Refused while any of them is assigned to a blog; the root category
    /// cannot be deleted.
    pub async fn delete(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
    ) -> Result<Vec<String>, MediaError> {
        identity.authorize_project(project_id)?;
        let rows = self
            .lifecycle
            .store_call(
                "list categories",
                self.lifecycle.metadata().list_categories(project_id),
            )
            .await?;
        self.lifecycle
            .store_call(
                "delete category",
                self.lifecycle.metadata().delete_category(project_id, id),
            )
            .await?;
        let removed = hierarchy::descendants(&rows, id);
        debug!("Deleted {} categories under {}", removed.len(), id);
        Ok(removed)
    }

    /// The project's categories as a nested tree.
    pub async fn tree(
        &self,
        identity: &Identity,
        project_id: &str,
    ) -> Result<Vec<CategoryNode>, MediaError> {
        identity.authorize_project(project_id)?;
        let rows = self
            .lifecycle
            .store_call(
                "list categories",
                self.lifecycle.metadata().list_categories(project_id),
            )
            .await?;
        Ok(hierarchy::assemble(&rows))
    }

    /// `id` followed by the ids of every category below it.
    pub async fn subtree(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
    ) -> Result<Vec<String>, MediaError> {
        identity.authorize_project(project_id)?;
        self.lifecycle
            .store_call(
                "category closure",
                self.lifecycle.metadata().category_closure(project_id, id),
            )
            .await
    }
}
