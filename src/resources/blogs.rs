//! Blog posts: a cover, categorized metadata, and an HTML body whose
//! inline images live in the post's directory.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::MediaError;
use crate::identity::Identity;
use crate::keys::{KeyScope, ObjectKey, ResourceKind};
use crate::lifecycle::{Attachment, Cleanup, LifecycleManager, MediaResource, Outcome, UploadReport};
use crate::media::{self, Upload};
use crate::metadata::store::{
    timestamp_now, Blog, BlogMetadataPatch, BlogSummary, MetadataStore, RowRef, StoreFuture,
};
use crate::pagination::{Page, PageRequest};

use super::content::{inline_paths, rewrite_sources};
use super::{optional, required, sign_all};

impl MediaResource for Blog {
    const KIND: ResourceKind = ResourceKind::Blog;

    fn assign_id(&mut self, id: String) {
        self.id = id;
    }

    fn key_scope(&self) -> KeyScope {
        KeyScope::owned(ResourceKind::Blog, &self.project_id, &self.id)
    }

    fn attach_key(&mut self, key: &ObjectKey) {
        self.cover = key.as_str().to_string();
    }

    fn row_ref(&self) -> RowRef {
        RowRef::owned(ResourceKind::Blog, &self.project_id, &self.id)
    }

    fn insert(store: &dyn MetadataStore, record: Self) -> StoreFuture<'_, ()> {
        store.insert_blog(record)
    }
}

/// Fields of a new post.
#[derive(Debug, Clone)]
pub struct NewBlog {
    pub title: String,
    pub summary: String,
    pub content: String,
    pub category_id: String,
}

fn scope(project_id: &str, id: &str) -> KeyScope {
    KeyScope::owned(ResourceKind::Blog, project_id, id)
}

pub struct BlogService {
    lifecycle: Arc<LifecycleManager>,
}

impl BlogService {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    pub async fn create(
        &self,
        identity: &Identity,
        project_id: &str,
        blog: NewBlog,
        cover: Upload,
    ) -> Result<Outcome<Blog>, MediaError> {
        identity.authorize_project(project_id)?;
        let title = required("title", &blog.title)?;
        let category_id = required("category_id", &blog.category_id)?;
        let payload = media::prepare_blocking(cover, self.lifecycle.media()).await?;
        let draft = Blog {
            id: String::new(),
            project_id: project_id.to_string(),
            author_id: identity.user_id.clone(),
            title,
            summary: blog.summary.trim().to_string(),
            content: blog.content,
            category_id,
            cover: String::new(),
            created_at: timestamp_now(),
            updated_at: None,
        };
        self.lifecycle.create(draft, payload).await
    }

    /// A post ready for display: the cover and every tagged inline image
    /// carry a signed URL (or the placeholder when signing fails).
    pub async fn get(&self, identity: &Identity, project_id: &str, id: &str) -> Result<Blog, MediaError> {
        identity.authorize_project(project_id)?;
        let mut blog = self
            .lifecycle
            .store_call("get blog", self.lifecycle.metadata().get_blog(project_id, id))
            .await?;

        let paths = inline_paths(&blog.content);
        let mut keys = Vec::with_capacity(paths.len() + 1);
        keys.push(blog.cover.clone());
        keys.extend(paths.iter().cloned());
        let ttl = self.lifecycle.signing().view_ttl();
        let mut urls = self.lifecycle.sign_keys(keys, ttl).await.into_iter();

        blog.cover = urls
            .next()
            .unwrap_or_else(|| self.lifecycle.signing().placeholder_url.clone());
        let signed: HashMap<String, String> = paths.into_iter().zip(urls).collect();
        blog.content = rewrite_sources(
            &blog.content,
            &signed,
            &self.lifecycle.signing().placeholder_url,
        );
        Ok(blog)
    }

    /// One page of summaries, optionally limited to a category subtree.
    pub async fn list(
        &self,
        identity: &Identity,
        project_id: &str,
        category_id: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<BlogSummary>, MediaError> {
        identity.authorize_project(project_id)?;
        let rows = self
            .lifecycle
            .store_call(
                "list blogs",
                self.lifecycle
                    .metadata()
                    .list_blogs(project_id, category_id, &page),
            )
            .await?;
        let mut page = Page::from_rows(rows, page.limit);
        let ttl = self.lifecycle.signing().listing_ttl();
        sign_all(&self.lifecycle, &mut page.items, ttl).await;
        Ok(page)
    }

    pub async fn patch_metadata(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
        patch: BlogMetadataPatch,
    ) -> Result<(), MediaError> {
        identity.authorize_project(project_id)?;
        let patch = BlogMetadataPatch {
            title: optional("title", patch.title)?,
            summary: patch.summary.map(|s| s.trim().to_string()),
            category_id: optional("category_id", patch.category_id)?,
        };
        if patch.title.is_none() && patch.summary.is_none() && patch.category_id.is_none() {
            return Err(MediaError::invalid("body", "nothing to update"));
        }
        self.lifecycle
            .store_call(
                "update blog metadata",
                self.lifecycle
                    .metadata()
                    .update_blog_metadata(project_id, id, patch),
            )
            .await
    }

    pub async fn patch_content(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
        content: String,
    ) -> Result<(), MediaError> {
        identity.authorize_project(project_id)?;
        self.lifecycle
            .store_call(
                "update blog content",
                self.lifecycle
                    .metadata()
                    .update_blog_content(project_id, id, content),
            )
            .await
    }

    pub async fn replace_cover(
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
                RowRef::owned(ResourceKind::Blog, project_id, id),
                scope(project_id, id),
                payload,
            )
            .await
    }

    /// Delete the post, its cover and every inline image.
    pub async fn delete(&self, identity: &Identity, project_id: &str, id: &str) -> Result<Outcome<()>, MediaError> {
        identity.authorize_project(project_id)?;
        self.lifecycle
            .delete(
                RowRef::owned(ResourceKind::Blog, project_id, id),
                Cleanup::Prefix(scope(project_id, id)),
            )
            .await
    }

    /// A fresh key for an inline image of this post.
    pub fn inline_destination(&self, project_id: &str, id: &str, extension: &str) -> ObjectKey {
        self.lifecycle
            .keys()
            .generate(&scope(project_id, id), extension)
    }

    /// Upload inline images, best effort.  The post must exist.
    pub async fn attach_media(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
        files: Vec<Attachment>,
    ) -> Result<Outcome<UploadReport>, MediaError> {
        identity.authorize_project(project_id)?;
        self.lifecycle
            .store_call("get blog", self.lifecycle.metadata().get_blog(project_id, id))
            .await?;
        self.lifecycle
            .attach_media(scope(project_id, id), files)
            .await
    }

    /// Remove inline images the body no longer references.
    pub async fn detach_media(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
        paths: Vec<String>,
    ) -> Result<Outcome<Vec<String>>, MediaError> {
        identity.authorize_project(project_id)?;
        self.lifecycle
            .detach_media(scope(project_id, id), paths)
            .await
    }
}
