//! Projects: the tenants every other resource belongs to.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::errors::MediaError;
use crate::hierarchy::{self, CategoryNode};
use crate::identity::Identity;
use crate::keys::{random_token, KeyScope, ObjectKey, ResourceKind};
use crate::lifecycle::{Cleanup, LifecycleManager, MediaResource, Outcome};
use crate::media::{self, Upload};
use crate::metadata::store::{
    timestamp_now, MetadataStore, Project, RowRef, ServiceInfo, StoreFuture,
};

use super::{required, sign_all};

/// Length of the token public clients use to read a project's content.
const PUBLIC_TOKEN_LEN: usize = 32;

impl MediaResource for Project {
    const KIND: ResourceKind = ResourceKind::Project;

    fn assign_id(&mut self, id: String) {
        self.id = id;
    }

    fn key_scope(&self) -> KeyScope {
        KeyScope::project(&self.id)
    }

    fn attach_key(&mut self, key: &ObjectKey) {
        self.cover = key.as_str().to_string();
    }

    fn row_ref(&self) -> RowRef {
        RowRef::project(&self.id)
    }

    fn insert(store: &dyn MetadataStore, record: Self) -> StoreFuture<'_, ()> {
        store.insert_project(record)
    }
}

/// What a project's editors need to lay out their workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub project_name: String,
    pub services: Vec<ServiceInfo>,
    pub categories: Vec<CategoryNode>,
}

pub struct ProjectService {
    lifecycle: Arc<LifecycleManager>,
}

impl ProjectService {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    /// Create a project with its cover and default category.
    pub async fn create(
        &self,
        identity: &Identity,
        name: &str,
        cover: Upload,
    ) -> Result<Outcome<Project>, MediaError> {
        identity.require_admin()?;
        let name = required("name", name)?;
        let payload = media::prepare_blocking(cover, self.lifecycle.media()).await?;
        let draft = Project {
            id: String::new(),
            name,
            cover: String::new(),
            public_token: random_token(PUBLIC_TOKEN_LEN),
            created_at: timestamp_now(),
        };
        self.lifecycle.create(draft, payload).await
    }

    /// One project with its cover signed for direct viewing.
    pub async fn get(&self, identity: &Identity, id: &str) -> Result<Project, MediaError> {
        identity.authorize_project(id)?;
        let mut project = self
            .lifecycle
            .store_call("get project", self.lifecycle.metadata().get_project(id))
            .await?;
        let ttl = self.lifecycle.signing().view_ttl();
        sign_all(&self.lifecycle, std::slice::from_mut(&mut project), ttl).await;
        Ok(project)
    }

    /// Every project, newest first.
    pub async fn list(&self, identity: &Identity) -> Result<Vec<Project>, MediaError> {
        identity.require_admin()?;
        let mut projects = self
            .lifecycle
            .store_call("list projects", self.lifecycle.metadata().list_projects())
            .await?;
        let ttl = self.lifecycle.signing().listing_ttl();
        sign_all(&self.lifecycle, &mut projects, ttl).await;
        Ok(projects)
    }

    pub async fn replace_cover(
        &self,
        identity: &Identity,
        id: &str,
        cover: Upload,
    ) -> Result<Outcome<ObjectKey>, MediaError> {
        identity.authorize_project(id)?;
        let payload = media::prepare_blocking(cover, self.lifecycle.media()).await?;
        self.lifecycle
            .replace_media(RowRef::project(id), KeyScope::project(id), payload)
            .await
    }

    // ── membership ──────────────────────────────────────────────────

    /// Grant `user_id` access to a project.
    pub async fn add_member(
        &self,
        identity: &Identity,
        project_id: &str,
        user_id: &str,
    ) -> Result<(), MediaError> {
        identity.require_admin()?;
        let user_id = required("user_id", user_id)?;
        self.lifecycle
            .store_call(
                "add project member",
                self.lifecycle.metadata().add_member(project_id, &user_id),
            )
            .await?;
        info!("Added {} to project {}", user_id, project_id);
        Ok(())
    }

    pub async fn remove_member(
        &self,
        identity: &Identity,
        project_id: &str,
        user_id: &str,
    ) -> Result<(), MediaError> {
        identity.require_admin()?;
        let user_id = required("user_id", user_id)?;
        self.lifecycle
            .store_call(
                "remove project member",
                self.lifecycle.metadata().remove_member(project_id, &user_id),
            )
            .await?;
        info!("Removed {} from project {}", user_id, project_id);
        Ok(())
    }

    /// Projects `user_id` is a member of, covers signed for listing.
    /// Users may only ask about themselves.
    pub async fn list_for_user(
        &self,
        identity: &Identity,
        user_id: &str,
    ) -> Result<Vec<Project>, MediaError> {
        if identity.user_id != user_id {
            identity.require_admin()?;
        }
        let mut projects = self
            .lifecycle
            .store_call(
                "list member projects",
                self.lifecycle.metadata().list_projects_for_user(user_id),
            )
            .await?;
        let ttl = self.lifecycle.signing().listing_ttl();
        sign_all(&self.lifecycle, &mut projects, ttl).await;
        Ok(projects)
    }

    /// Identity of a regular user, carrying their current memberships.
    pub async fn member_identity(&self, user_id: &str) -> Result<Identity, MediaError> {
        let user_id = required("user_id", user_id)?;
        let projects = self
            .lifecycle
            .store_call(
                "list member projects",
                self.lifecycle.metadata().list_projects_for_user(&user_id),
            )
            .await?;
        Ok(Identity::member(
            user_id,
            projects.into_iter().map(|p| p.id).collect(),
        ))
    }

    // ── services ────────────────────────────────────────────────────

    /// The service catalog.
    pub async fn services(&self, identity: &Identity) -> Result<Vec<ServiceInfo>, MediaError> {
        identity.require_admin()?;
        self.lifecycle
            .store_call("list services", self.lifecycle.metadata().list_services())
            .await
    }

    /// Enable services for a project.  Nothing is enabled if any id is
    /// unknown or already enabled.
    pub async fn enable_services(
        &self,
        identity: &Identity,
        project_id: &str,
        service_ids: Vec<String>,
    ) -> Result<(), MediaError> {
        identity.require_admin()?;
        let service_ids = service_ids
            .into_iter()
            .map(|id| required("services", &id))
            .collect::<Result<Vec<_>, _>>()?;
        if service_ids.is_empty() {
            return Err(MediaError::invalid("services", "at least one service is required"));
        }
        self.lifecycle
            .store_call(
                "add project services",
                self.lifecycle
                    .metadata()
                    .add_project_services(project_id, service_ids),
            )
            .await
    }

    pub async fn disable_service(
        &self,
        identity: &Identity,
        project_id: &str,
        service_id: &str,
    ) -> Result<(), MediaError> {
        identity.require_admin()?;
        self.lifecycle
            .store_call(
                "remove project service",
                self.lifecycle
                    .metadata()
                    .remove_project_service(project_id, service_id),
            )
            .await
    }

    /// Name, enabled services and category tree of a project.
    pub async fn metadata(
        &self,
        identity: &Identity,
        project_id: &str,
    ) -> Result<ProjectMetadata, MediaError> {
        identity.authorize_project(project_id)?;
        let store = self.lifecycle.metadata();
        let (project, services, categories) = tokio::try_join!(
            self.lifecycle
                .store_call("get project", store.get_project(project_id)),
            self.lifecycle
                .store_call("list project services", store.list_project_services(project_id)),
            self.lifecycle
                .store_call("list categories", store.list_categories(project_id)),
        )?;
        Ok(ProjectMetadata {
            project_name: project.name,
            services,
            categories: hierarchy::assemble(&categories),
        })
    }

    /// Delete an empty project and everything under its directory.
    ///
    /// Fails with a foreign key violation while blogs, albums, news or
    /// document covers still reference it.
    pub async fn delete(&self, identity: &Identity, id: &str) -> Result<Outcome<()>, MediaError> {
        identity.require_admin()?;
        self.lifecycle
            .delete(RowRef::project(id), Cleanup::Prefix(KeyScope::project(id)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testing::{fixture, jpeg, png};

    #[tokio::test]
    async fn test_create_project_with_cover_and_token() {
        let f = fixture();
        let service = ProjectService::new(f.lifecycle.clone());
        let project = service
            .create(&f.admin, "  Acme ", png())
            .await
            .unwrap()
            .into_value();

        assert_eq!(project.name, "Acme");
        assert_eq!(project.public_token.len(), PUBLIC_TOKEN_LEN);
        assert!(project.cover.starts_with(&format!("projects/{}/", project.id)));
        assert!(project.cover.ends_with(".png"));

        let fetched = service.get(&f.admin, &project.id).await.unwrap();
        assert!(fetched.cover.starts_with(&format!("memory://{}", project.cover)));

        let categories = f
            .lifecycle
            .metadata()
            .list_categories(&project.id)
            .await
            .unwrap();
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].parent_id, None);
    }

    #[tokio::test]
    async fn test_duplicate_project_name_leaves_no_blob() {
        let f = fixture();
        let service = ProjectService::new(f.lifecycle.clone());
        let first = service.create(&f.admin, "Acme", png()).await.unwrap().into_value();

        let err = service.create(&f.admin, "Acme", jpeg()).await.unwrap_err();
        assert!(matches!(err, MediaError::DuplicateName { .. }));

        f.lifecycle.settle().await;
        assert_eq!(f.storage.inner.keys().await, vec![first.cover]);
    }

    #[tokio::test]
    async fn test_project_user_cannot_create_or_read_other_projects() {
        let f = fixture();
        let service = ProjectService::new(f.lifecycle.clone());
        let project = service.create(&f.admin, "Acme", png()).await.unwrap().into_value();

        let outsider = Identity::project_user("u1", "some-other-project");
        assert!(service.create(&outsider, "Evil", png()).await.is_err());
        let err = service.get(&outsider, &project.id).await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound { .. }));

        let member = Identity::project_user("u2", project.id.clone());
        assert_eq!(service.get(&member, &project.id).await.unwrap().name, "Acme");
    }

    #[tokio::test]
    async fn test_replace_cover_then_delete_removes_all_blobs() {
        let f = fixture();
        let service = ProjectService::new(f.lifecycle.clone());
        let project = service.create(&f.admin, "Acme", png()).await.unwrap().into_value();

        let new_cover = service
            .replace_cover(&f.admin, &project.id, jpeg())
            .await
            .unwrap()
            .into_value();
        f.lifecycle.settle().await;
        assert_eq!(f.storage.inner.keys().await, vec![new_cover.into_string()]);

        let listed = service.list(&f.admin).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].cover.starts_with("memory://"));

        service.delete(&f.admin, &project.id).await.unwrap();
        f.lifecycle.settle().await;
        assert!(f.storage.inner.is_empty().await);
        let err = service.get(&f.admin, &project.id).await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_membership_drives_access() {
        let f = fixture();
        let service = ProjectService::new(f.lifecycle.clone());
        let acme = service.create(&f.admin, "Acme", png()).await.unwrap().into_value();
        let globex = service.create(&f.admin, "Globex", jpeg()).await.unwrap().into_value();

        service.add_member(&f.admin, &acme.id, "u1").await.unwrap();
        let err = service.add_member(&f.admin, &acme.id, "u1").await.unwrap_err();
        assert!(matches!(err, MediaError::DuplicateName { .. }));

        let user = service.member_identity("u1").await.unwrap();
        assert_eq!(user.projects, vec![acme.id.clone()]);
        assert!(service.get(&user, &acme.id).await.is_ok());
        assert!(service.get(&user, &globex.id).await.is_err());
        assert!(service.add_member(&user, &globex.id, "u1").await.is_err());

        let mine = service.list_for_user(&user, "u1").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert!(mine[0].cover.starts_with("memory://"));
        assert!(service.list_for_user(&user, "u2").await.is_err());

        service.remove_member(&f.admin, &acme.id, "u1").await.unwrap();
        assert!(service.member_identity("u1").await.unwrap().projects.is_empty());
        let err = service.remove_member(&f.admin, &acme.id, "u1").await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_service_map_and_metadata() {
        let f = fixture();
        let service = ProjectService::new(f.lifecycle.clone());
        let project = service.create(&f.admin, "Acme", png()).await.unwrap().into_value();
        let catalog = service.services(&f.admin).await.unwrap();
        let news = catalog.iter().find(|s| s.name == "news").unwrap().id.clone();
        let blogs = catalog.iter().find(|s| s.name == "blogs").unwrap().id.clone();

        service
            .enable_services(&f.admin, &project.id, vec![news.clone(), blogs.clone()])
            .await
            .unwrap();
        let err = service
            .enable_services(&f.admin, &project.id, vec![news.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::DuplicateName { .. }));
        let err = service
            .enable_services(&f.admin, &project.id, vec![uuid::Uuid::new_v4().to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::ForeignKeyViolation { ref field } if field == "service_id"));
        let err = service
            .enable_services(&f.admin, &uuid::Uuid::new_v4().to_string(), vec![news.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::ForeignKeyViolation { ref field } if field == "project_id"));
        let err = service
            .enable_services(&f.admin, &project.id, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidInput { ref field, .. } if field == "services"));

        service.disable_service(&f.admin, &project.id, &news).await.unwrap();

        let member = Identity::project_user("u1", project.id.clone());
        let meta = service.metadata(&member, &project.id).await.unwrap();
        assert_eq!(meta.project_name, "Acme");
        assert_eq!(meta.services.len(), 1);
        assert_eq!(meta.services[0].name, "blogs");
        assert_eq!(meta.categories.len(), 1);
        assert_eq!(meta.categories[0].name, "default");

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["projectName"], "Acme");
        assert_eq!(json["services"][0]["serviceName"], "blogs");
    }
}
