use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use postline_queue::{InMemoryJobQueue, JobQueue};
use postline_infra::{
    AppConfig, Backend, CircuitBreaker, StorageConfig, UploadStatusStore, UploadWorker, WorkerHandle,
    WorkerSettings,
    breaker::BreakerSettings,
    cache::{Cache, InMemoryCache, RedisCache},
    job_queue::RedisStreamsJobQueue,
    lock::{InMemoryLocker, Locker, RedisLocker},
    notifier::DEFAULT_POLL_INTERVAL,
    posts::{InMemoryPostDirectory, PostDirectory, PostgresPostDirectory},
    uploader::{HttpObjectUploader, LocalDirUploader, Uploader},
};

/// Knobs the HTTP handlers read on every request.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub upload_channel: String,
    pub poll_interval: Duration,
    pub max_upload_bytes: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            upload_channel: postline_queue::UPLOADS_CHANNEL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Shared state behind every handler.
pub struct AppServices {
    pub queue: Arc<dyn JobQueue>,
    pub statuses: UploadStatusStore,
    pub posts: Arc<dyn PostDirectory>,
    pub settings: ApiSettings,
}

/// Everything one process needs: the handler state plus the worker, when this process runs one.
pub struct Pipeline {
    pub services: Arc<AppServices>,
    worker: Option<UploadWorker>,
}

impl Pipeline {
    /// Wire the backend `config` selects. Nothing here opens a connection yet.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let (queue, cache, locker): (Arc<dyn JobQueue>, Arc<dyn Cache>, Arc<dyn Locker>) =
            match config.backend {
                Backend::Memory => (
                    Arc::new(InMemoryJobQueue::new()),
                    Arc::new(InMemoryCache::new()),
                    Arc::new(InMemoryLocker::new()),
                ),
                Backend::Redis => {
                    let url = config.redis_url.as_deref().context("REDIS_URL is not set")?;
                    (
                        Arc::new(
                            RedisStreamsJobQueue::new(url, None)
                                .context("redis job queue")?
                                .with_max_len(config.stream_max_len),
                        ),
                        Arc::new(RedisCache::new(url).context("redis status cache")?),
                        Arc::new(RedisLocker::new(url).context("redis locker")?),
                    )
                }
            };

        let posts: Arc<dyn PostDirectory> = match config.database_url.as_deref() {
            Some(url) => Arc::new(PostgresPostDirectory::connect_lazy(url).context("post directory")?),
            None => {
                tracing::warn!("DATABASE_URL not set; every well-formed post id is accepted");
                Arc::new(InMemoryPostDirectory::accept_all())
            }
        };

        let uploader: Arc<dyn Uploader> = match &config.storage {
            StorageConfig::Http { base_url, timeout } => {
                Arc::new(HttpObjectUploader::new(base_url, *timeout).context("object storage")?)
            }
            StorageConfig::LocalDir { root } => Arc::new(LocalDirUploader::new(root)),
        };

        let statuses = UploadStatusStore::new(cache, config.status_ttl);
        let settings = ApiSettings {
            upload_channel: config.upload_channel.clone(),
            poll_interval: config.sse_poll_interval,
            max_upload_bytes: config.max_upload_bytes,
        };

        let worker = config.embedded_worker.then(|| {
            UploadWorker::new(
                queue.clone(),
                statuses.clone(),
                locker.clone(),
                uploader.clone(),
                Arc::new(CircuitBreaker::new(config.breaker.clone())),
                WorkerSettings {
                    channel: config.upload_channel.clone(),
                    dead_letter_channel: config.dead_letter_channel.clone(),
                    lock_ttl: config.lock_ttl,
                    ..WorkerSettings::default()
                },
            )
        });

        Ok(Self {
            services: Arc::new(AppServices {
                queue,
                statuses,
                posts,
                settings,
            }),
            worker,
        })
    }

    /// Fully in-process pipeline (dev/test) with caller-provided storage and posts.
    pub fn in_memory(
        uploader: Arc<dyn Uploader>,
        posts: Arc<dyn PostDirectory>,
        settings: ApiSettings,
        breaker: BreakerSettings,
    ) -> Self {
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        let statuses = UploadStatusStore::new(
            Arc::new(InMemoryCache::new()),
            postline_infra::status_store::DEFAULT_STATUS_TTL,
        );
        let worker = UploadWorker::new(
            queue.clone(),
            statuses.clone(),
            Arc::new(InMemoryLocker::new()),
            uploader,
            Arc::new(CircuitBreaker::new(breaker)),
            WorkerSettings {
                channel: settings.upload_channel.clone(),
                ..WorkerSettings::default()
            },
        );

        Self {
            services: Arc::new(AppServices {
                queue,
                statuses,
                posts,
                settings,
            }),
            worker: Some(worker),
        }
    }

    /// Start the embedded worker thread, if this pipeline has one.
    pub fn spawn_worker(&mut self) -> anyhow::Result<Option<WorkerHandle>> {
        match self.worker.take() {
            Some(worker) => {
                let handle = worker.spawn().context("spawn upload worker")?;
                Ok(Some(handle))
            }
            None => Ok(None),
        }
    }
}
