//! Object key naming.
//!
//! Every blob lives under a directory derived from the resource that owns
//! it: `{env}{namespace}/{owner}/{resource}/`.  A key is that directory plus
//! a random 10-character token and the stored format's extension.  Deleting
//! a resource sweeps its whole directory, so two resources must never share
//! a prefix.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;

use crate::config::Environment;

/// Length of the random file-name token.
const TOKEN_LEN: usize = 10;

/// Kinds of resource that own blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Project,
    Blog,
    Album,
    Photo,
    News,
    DocumentCover,
}

impl ResourceKind {
    /// Top-level namespace for this kind's blobs.  Photos live inside
    /// their album's directory.
    pub fn namespace(self) -> &'static str {
        match self {
            ResourceKind::Project => "projects",
            ResourceKind::Blog => "services/blogs",
            ResourceKind::Album | ResourceKind::Photo => "services/gallery",
            ResourceKind::News => "services/news",
            ResourceKind::DocumentCover => "services/documents",
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Project => "project",
            ResourceKind::Blog => "blog",
            ResourceKind::Album => "album",
            ResourceKind::Photo => "photo",
            ResourceKind::News => "news",
            ResourceKind::DocumentCover => "document_cover",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The directory a resource's blobs live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyScope {
    pub kind: ResourceKind,
    /// Owning project (absent for projects themselves).
    pub owner: Option<String>,
    /// Directory id: the resource id, or the album id for photos.
    pub resource: String,
}

impl KeyScope {
    pub fn project(project_id: &str) -> Self {
        Self {
            kind: ResourceKind::Project,
            owner: None,
            resource: project_id.to_string(),
        }
    }

    pub fn owned(kind: ResourceKind, project_id: &str, resource_id: &str) -> Self {
        Self {
            kind,
            owner: Some(project_id.to_string()),
            resource: resource_id.to_string(),
        }
    }
}

/// A fully qualified object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for ObjectKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds object keys and scope prefixes for one environment.
#[derive(Debug, Clone)]
pub struct KeyFactory {
    env_prefix: &'static str,
}

impl KeyFactory {
    pub fn new(environment: Environment) -> Self {
        let env_prefix = match environment {
            Environment::Production => "",
            Environment::Dev => "dev/",
        };
        Self { env_prefix }
    }

    /// Directory prefix for `scope`, always ending in `/`.
    pub fn prefix(&self, scope: &KeyScope) -> String {
        match &scope.owner {
            Some(owner) => format!(
                "{}{}/{}/{}/",
                self.env_prefix,
                scope.kind.namespace(),
                owner,
                scope.resource
            ),
            None => format!(
                "{}{}/{}/",
                self.env_prefix,
                scope.kind.namespace(),
                scope.resource
            ),
        }
    }

    /// Fresh key under `scope` with the given file extension.
    pub fn generate(&self, scope: &KeyScope, extension: &str) -> ObjectKey {
        ObjectKey(format!(
            "{}{}.{}",
            self.prefix(scope),
            random_token(TOKEN_LEN),
            extension
        ))
    }

    /// True when `key` sits under `scope`'s directory.
    pub fn contains(&self, scope: &KeyScope, key: &str) -> bool {
        let prefix = self.prefix(scope);
        key.len() > prefix.len()
            && key.starts_with(&prefix)
            && !key[prefix.len()..].split('/').any(|seg| seg == ".." || seg.is_empty())
    }
}

/// Random alphanumeric token of length `len`.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gallery_key_shape() {
        let keys = KeyFactory::new(Environment::Production);
        let scope = KeyScope::owned(ResourceKind::Album, "proj-1", "album-9");
        let key = keys.generate(&scope, "jpg");
        let rest = key
            .as_str()
            .strip_prefix("services/gallery/proj-1/album-9/")
            .expect("key must start with the album prefix");
        let (token, ext) = rest.split_once('.').unwrap();
        assert_eq!(ext, "jpg");
        assert_eq!(token.len(), 10);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_dev_environment_prefix() {
        let keys = KeyFactory::new(Environment::Dev);
        assert_eq!(
            keys.prefix(&KeyScope::project("p1")),
            "dev/projects/p1/"
        );
        assert_eq!(
            keys.prefix(&KeyScope::owned(ResourceKind::News, "p1", "n1")),
            "dev/services/news/p1/n1/"
        );
    }

    #[test]
    fn test_photo_shares_album_directory() {
        let keys = KeyFactory::new(Environment::Production);
        let album = KeyScope::owned(ResourceKind::Album, "p", "a");
        let photo = KeyScope::owned(ResourceKind::Photo, "p", "a");
        assert_eq!(keys.prefix(&album), keys.prefix(&photo));
    }

    #[test]
    fn test_contains_rejects_escape_and_siblings() {
        let keys = KeyFactory::new(Environment::Production);
        let scope = KeyScope::owned(ResourceKind::Blog, "p", "b1");
        assert!(keys.contains(&scope, "services/blogs/p/b1/abc.png"));
        assert!(!keys.contains(&scope, "services/blogs/p/b10/abc.png"));
        assert!(!keys.contains(&scope, "services/blogs/p/b1/../b2/x.png"));
        assert!(!keys.contains(&scope, "services/blogs/p/b1/"));
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(random_token(10), random_token(10));
    }
}
