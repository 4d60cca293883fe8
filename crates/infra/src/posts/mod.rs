//! Post lookups used to validate submissions before anything is enqueued.
//!
//! Posts themselves are owned by the relational CRUD layer; the pipeline only asks
//! whether one exists.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use postline_core::PostId;

pub mod postgres;

pub use postgres::PostgresPostDirectory;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("post directory unavailable: {0}")]
    Unavailable(String),

    #[error("post directory query failed: {0}")]
    Query(String),
}

#[async_trait]
pub trait PostDirectory: Send + Sync {
    async fn post_exists(&self, post_id: &PostId) -> Result<bool, DirectoryError>;
}

#[async_trait]
impl<D> PostDirectory for Arc<D>
where
    D: PostDirectory + ?Sized,
{
    async fn post_exists(&self, post_id: &PostId) -> Result<bool, DirectoryError> {
        (**self).post_exists(post_id).await
    }
}

/// In-memory post directory for tests/dev.
///
/// `accept_all` turns it into a directory where every well-formed id exists, which is the
/// behaviour of the dev server when no database is configured.
#[derive(Debug, Default)]
pub struct InMemoryPostDirectory {
    posts: RwLock<HashSet<PostId>>,
    accept_all: bool,
}

impl InMemoryPostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_all() -> Self {
        Self {
            posts: RwLock::default(),
            accept_all: true,
        }
    }

    pub fn insert(&self, post_id: PostId) {
        if let Ok(mut posts) = self.posts.write() {
            posts.insert(post_id);
        }
    }
}

#[async_trait]
impl PostDirectory for InMemoryPostDirectory {
    async fn post_exists(&self, post_id: &PostId) -> Result<bool, DirectoryError> {
        if self.accept_all {
            return Ok(true);
        }
        let posts = self
            .posts
            .read()
            .map_err(|_| DirectoryError::Unavailable("post set poisoned".to_string()))?;
        Ok(posts.contains(post_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_directory_knows_inserted_posts() {
        let directory = InMemoryPostDirectory::new();
        let p1 = PostId::parse("p1").unwrap();
        assert!(!directory.post_exists(&p1).await.unwrap());

        directory.insert(p1.clone());
        assert!(directory.post_exists(&p1).await.unwrap());
        assert!(!directory.post_exists(&PostId::parse("p2").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn accept_all_directory_accepts_any_id() {
        let directory: Arc<dyn PostDirectory> = Arc::new(InMemoryPostDirectory::accept_all());
        assert!(directory.post_exists(&PostId::new()).await.unwrap());
    }
}
