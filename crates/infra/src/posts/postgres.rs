//! Postgres-backed post directory.
//!
//! Expects the CRUD layer's `posts` table with a textual or UUID `id` column; the id is
//! compared as text so both layouts work.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use postline_core::PostId;

use super::{DirectoryError, PostDirectory};

#[derive(Debug, Clone)]
pub struct PostgresPostDirectory {
    pool: Arc<PgPool>,
}

impl PostgresPostDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect lazily; the first query opens the connection.
    pub fn connect_lazy(database_url: &str) -> Result<Self, DirectoryError> {
        let pool = PgPool::connect_lazy(database_url).map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }
}

fn map_sqlx_error(op: &str, e: sqlx::Error) -> DirectoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            DirectoryError::Unavailable(format!("{op}: {e}"))
        }
        sqlx::Error::Configuration(_) | sqlx::Error::Tls(_) => {
            DirectoryError::Unavailable(format!("{op}: {e}"))
        }
        other => DirectoryError::Query(format!("{op}: {other}")),
    }
}

#[async_trait]
impl PostDirectory for PostgresPostDirectory {
    #[instrument(skip(self), fields(post_id = %post_id), err)]
    async fn post_exists(&self, post_id: &PostId) -> Result<bool, DirectoryError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM posts WHERE id::text = $1)")
            .bind(post_id.as_str())
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(|e| map_sqlx_error("post_exists", e))
    }
}
