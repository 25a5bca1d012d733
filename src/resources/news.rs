//! News items: short text with one image each.

use std::sync::Arc;

use crate::errors::MediaError;
use crate::identity::Identity;
use crate::keys::{KeyScope, ObjectKey, ResourceKind};
use crate::lifecycle::{BatchDeleted, Cleanup, LifecycleManager, MediaResource, Outcome};
use crate::media::{self, Upload};
use crate::metadata::store::{
    timestamp_now, BatchScope, BatchSelector, MetadataStore, NewsItem, NewsPatch, RowRef,
    StoreFuture,
};
use crate::pagination::{Page, PageRequest};

use super::{optional, required, sign_all};

impl MediaResource for NewsItem {
    const KIND: ResourceKind = ResourceKind::News;

    fn assign_id(&mut self, id: String) {
        self.id = id;
    }

    fn key_scope(&self) -> KeyScope {
        news_scope(&self.project_id, &self.id)
    }

    fn attach_key(&mut self, key: &ObjectKey) {
        self.image = key.as_str().to_string();
    }

    fn row_ref(&self) -> RowRef {
        RowRef::owned(ResourceKind::News, &self.project_id, &self.id)
    }

    fn insert(store: &dyn MetadataStore, record: Self) -> StoreFuture<'_, ()> {
        store.insert_news(record)
    }
}

fn news_scope(project_id: &str, id: &str) -> KeyScope {
    KeyScope::owned(ResourceKind::News, project_id, id)
}

/// Text fields of a new item.
#[derive(Debug, Clone, Default)]
pub struct NewNews {
    pub title: String,
    pub link: String,
    pub text: String,
}

pub struct NewsService {
    lifecycle: Arc<LifecycleManager>,
}

impl NewsService {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    pub async fn create(
        &self,
        identity: &Identity,
        project_id: &str,
        news: NewNews,
        image: Upload,
    ) -> Result<Outcome<NewsItem>, MediaError> {
        identity.authorize_project(project_id)?;
        let title = required("title", &news.title)?;
        let payload = media::prepare_blocking(image, self.lifecycle.media()).await?;
        let draft = NewsItem {
            id: String::new(),
            project_id: project_id.to_string(),
            title,
            link: news.link.trim().to_string(),
            text: news.text,
            image: String::new(),
            created_at: timestamp_now(),
        };
        self.lifecycle.create(draft, payload).await
    }

    /// One page of items.  Images are signed with the short news TTL.
    pub async fn list(
        &self,
        identity: &Identity,
        project_id: &str,
        page: PageRequest,
    ) -> Result<Page<NewsItem>, MediaError> {
        identity.authorize_project(project_id)?;
        let rows = self
            .lifecycle
            .store_call(
                "list news",
                self.lifecycle.metadata().list_news(project_id, &page),
            )
            .await?;
        let mut page = Page::from_rows(rows, page.limit);
        let ttl = self.lifecycle.signing().news_listing_ttl();
        sign_all(&self.lifecycle, &mut page.items, ttl).await;
        Ok(page)
    }

    pub async fn patch(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
        patch: NewsPatch,
    ) -> Result<(), MediaError> {
        identity.authorize_project(project_id)?;
        let patch = NewsPatch {
            title: optional("title", patch.title)?,
            link: patch.link.map(|l| l.trim().to_string()),
            text: patch.text,
        };
        if patch.title.is_none() && patch.link.is_none() && patch.text.is_none() {
            return Err(MediaError::invalid("body", "nothing to update"));
        }
        self.lifecycle
            .store_call(
                "update news",
                self.lifecycle.metadata().update_news(project_id, id, patch),
            )
            .await
    }

    pub async fn replace_image(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
        image: Upload,
    ) -> Result<Outcome<ObjectKey>, MediaError> {
        identity.authorize_project(project_id)?;
        let payload = media::prepare_blocking(image, self.lifecycle.media()).await?;
        self.lifecycle
            .replace_media(
                RowRef::owned(ResourceKind::News, project_id, id),
                news_scope(project_id, id),
                payload,
            )
            .await
    }

    pub async fn delete(
        &self,
        identity: &Identity,
        project_id: &str,
        id: &str,
    ) -> Result<Outcome<()>, MediaError> {
        identity.authorize_project(project_id)?;
        self.lifecycle
            .delete(
                RowRef::owned(ResourceKind::News, project_id, id),
                Cleanup::Prefix(news_scope(project_id, id)),
            )
            .await
    }

    /// Delete the given items, or every item of the project when `ids` is
    /// empty.
    pub async fn delete_many(
        &self,
        identity: &Identity,
        project_id: &str,
        ids: Vec<String>,
    ) -> Result<Outcome<BatchDeleted>, MediaError> {
        identity.authorize_project(project_id)?;
        let selector = if ids.is_empty() {
            BatchSelector::All
        } else {
            BatchSelector::Ids(ids)
        };
        let scope = BatchScope {
            kind: ResourceKind::News,
            project_id: project_id.to_string(),
            album_id: None,
        };
        self.lifecycle.delete_batch(scope, selector).await
    }
}
