//! Integration tests for the full upload pipeline.
//!
//! Tests: Queue → UploadWorker → StatusStore → notifier stream
//!
//! Verifies:
//! - A stream watching a job sees exactly `uploading` then `success`
//! - Duplicate deliveries across competing workers upload once
//! - A malformed payload does not stop the worker

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::time::{Duration, Instant};

    use postline_core::{PostId, UploadId, UploadJob, UploadStatus};
    use postline_queue::{InMemoryJobQueue, JobQueue, UPLOADS_CHANNEL};

    use crate::breaker::{BreakerSettings, CircuitBreaker};
    use crate::cache::InMemoryCache;
    use crate::lock::InMemoryLocker;
    use crate::notifier::{StatusFrame, watch};
    use crate::status_store::{DEFAULT_STATUS_TTL, UploadStatusStore};
    use crate::uploader::{UploadError, Uploader};
    use crate::worker::{UploadWorker, WorkerSettings};

    /// Blocks every upload until the test opens the gate.
    struct GatedUploader {
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl Uploader for GatedUploader {
        fn upload(&self, job: &UploadJob) -> Result<Vec<u8>, UploadError> {
            let gate = self.gate.lock().unwrap();
            gate.recv_timeout(Duration::from_secs(5))
                .map_err(|_| UploadError::Transport("gate never opened".to_string()))?;
            Ok(format!("mem://{}", job.file_name()).into_bytes())
        }
    }

    #[derive(Default)]
    struct CountingUploader {
        calls: AtomicU32,
    }

    impl Uploader for CountingUploader {
        fn upload(&self, _job: &UploadJob) -> Result<Vec<u8>, UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            Ok(b"mem://object".to_vec())
        }
    }

    struct Pipeline {
        queue: Arc<InMemoryJobQueue>,
        statuses: UploadStatusStore,
        locker: Arc<InMemoryLocker>,
        breaker: Arc<CircuitBreaker>,
    }

    impl Pipeline {
        fn new() -> Self {
            Self {
                queue: Arc::new(InMemoryJobQueue::new()),
                statuses: UploadStatusStore::new(Arc::new(InMemoryCache::new()), DEFAULT_STATUS_TTL),
                locker: Arc::new(InMemoryLocker::new()),
                breaker: Arc::new(CircuitBreaker::new(BreakerSettings::named("storage"))),
            }
        }

        fn worker(&self, name: &str, uploader: Arc<dyn Uploader>) -> UploadWorker {
            UploadWorker::new(
                self.queue.clone(),
                self.statuses.clone(),
                self.locker.clone(),
                uploader,
                self.breaker.clone(),
                WorkerSettings {
                    name: name.to_string(),
                    ..WorkerSettings::default()
                },
            )
        }
    }

    fn sample_job(upload_id: &str) -> UploadJob {
        UploadJob::new(
            UploadId::parse(upload_id).unwrap(),
            PostId::parse("p1").unwrap(),
            "a.txt",
            "text/plain",
            b"filedata".to_vec(),
        )
        .unwrap()
    }

    async fn wait_for(statuses: &UploadStatusStore, id: &UploadId, status: UploadStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while statuses.get(id).unwrap() != status {
            assert!(Instant::now() < deadline, "status never became {status}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn watcher_sees_uploading_then_success() {
        let pipeline = Pipeline::new();
        let (gate_tx, gate_rx) = mpsc::channel();
        let uploader = Arc::new(GatedUploader {
            gate: Mutex::new(gate_rx),
        });
        let id = UploadId::parse("u1").unwrap();

        pipeline
            .queue
            .publish(UPLOADS_CHANNEL, &sample_job("u1").to_payload().unwrap())
            .unwrap();
        let handle = pipeline.worker("worker-1", uploader).spawn().unwrap();

        wait_for(&pipeline.statuses, &id, UploadStatus::Uploading).await;
        let (mut frames_rx, task) = watch(pipeline.statuses.clone(), id.clone(), Duration::from_millis(10));
        let first = frames_rx.recv().await;
        gate_tx.send(()).unwrap();

        let mut frames = vec![first.unwrap()];
        while let Some(frame) = frames_rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![
                StatusFrame::Status(UploadStatus::Uploading),
                StatusFrame::Status(UploadStatus::Success),
            ]
        );
        task.await.unwrap();
        assert_eq!(
            pipeline.statuses.location(&id).unwrap().as_deref(),
            Some("mem://a.txt")
        );
        assert_eq!(handle.shutdown(), Ok(()));
    }

    #[tokio::test]
    async fn duplicate_deliveries_upload_once() {
        let pipeline = Pipeline::new();
        let uploader = Arc::new(CountingUploader::default());
        let payload = sample_job("u7").to_payload().unwrap();
        for _ in 0..3 {
            pipeline.queue.publish(UPLOADS_CHANNEL, &payload).unwrap();
        }

        let workers: Vec<_> = ["worker-a", "worker-b"]
            .into_iter()
            .map(|name| pipeline.worker(name, uploader.clone()).spawn().unwrap())
            .collect();

        let id = UploadId::parse("u7").unwrap();
        wait_for(&pipeline.statuses, &id, UploadStatus::Success).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.queue.depth(UPLOADS_CHANNEL) > 0 || pipeline.locker.is_held("upload:u7") {
            assert!(Instant::now() < deadline, "queue never drained");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for worker in workers {
            assert_eq!(worker.shutdown(), Ok(()));
        }
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped_and_next_job_processed() {
        let pipeline = Pipeline::new();
        pipeline.queue.publish(UPLOADS_CHANNEL, b"{\"upload_id\":").unwrap();
        pipeline
            .queue
            .publish(UPLOADS_CHANNEL, &sample_job("u2").to_payload().unwrap())
            .unwrap();

        let handle = pipeline
            .worker("worker-1", Arc::new(CountingUploader::default()))
            .spawn()
            .unwrap();

        wait_for(&pipeline.statuses, &UploadId::parse("u2").unwrap(), UploadStatus::Success).await;
        assert!(!handle.is_finished());
        assert_eq!(handle.shutdown(), Ok(()));
    }
}
