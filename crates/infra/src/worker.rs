//! Upload worker: consumes queued jobs and drives their status to a terminal state.
//!
//! Per delivered payload:
//!
//! 1. decode; malformed payloads are logged, optionally dead-lettered, and dropped
//! 2. take `lock:upload:<id>`; a lock held elsewhere means another worker owns the job
//! 3. skip jobs whose status is already terminal (duplicate delivery)
//! 4. write `uploading`
//! 5. upload through the circuit breaker
//! 6. write `success` (plus location) or `failed`
//! 7. release the lock
//!
//! Status writes are best-effort: a failed write is logged and never changes the outcome.
//! Nothing is retried; a failed job stays failed.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};

use postline_core::{UploadId, UploadJob, UploadStatus};
use postline_queue::{JobQueue, QueueError, UPLOADS_CHANNEL};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::lock::{LockAttempt, Locker};
use crate::status_store::UploadStatusStore;
use crate::uploader::{UploadError, Uploader};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Thread name and log label.
    pub name: String,
    pub channel: String,
    /// Where undecodable payloads are forwarded. `None` drops them after logging.
    pub dead_letter_channel: Option<String>,
    /// Upper bound on how long one job may hold its processing lock.
    pub lock_ttl: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: "upload-worker".to_string(),
            channel: UPLOADS_CHANNEL.to_string(),
            dead_letter_channel: None,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another worker holds the job's lock.
    Contended,
    /// The job already reached a terminal status.
    AlreadyTerminal(UploadStatus),
}

/// What happened to one delivered payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Dropped { reason: String },
    Skipped { upload_id: UploadId, reason: SkipReason },
    Succeeded { upload_id: UploadId, location: String },
    Failed { upload_id: UploadId, reason: String },
}

/// Envelope published on the dead-letter channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub channel: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    /// Original payload, base64.
    pub payload: String,
}

impl DeadLetter {
    pub fn original_payload(&self) -> Option<Vec<u8>> {
        STANDARD.decode(self.payload.as_bytes()).ok()
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<Result<(), QueueError>>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) -> Result<(), QueueError> {
        let _ = self.shutdown.send(());
        match self.join.take() {
            Some(join) => join
                .join()
                .unwrap_or_else(|_| Err(QueueError::Closed("worker thread panicked".to_string()))),
            None => Ok(()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

pub struct UploadWorker {
    queue: Arc<dyn JobQueue>,
    statuses: UploadStatusStore,
    locker: Arc<dyn Locker>,
    uploader: Arc<dyn Uploader>,
    breaker: Arc<CircuitBreaker>,
    settings: WorkerSettings,
}

impl core::fmt::Debug for UploadWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UploadWorker")
            .field("settings", &self.settings)
            .field("breaker", &self.breaker.settings().name)
            .finish_non_exhaustive()
    }
}

impl UploadWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        statuses: UploadStatusStore,
        locker: Arc<dyn Locker>,
        uploader: Arc<dyn Uploader>,
        breaker: Arc<CircuitBreaker>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            statuses,
            locker,
            uploader,
            breaker,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Spawn the consume loop on its own named thread.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(self.settings.name.clone())
            .spawn(move || self.run(&shutdown_rx))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    /// Consume until `shutdown` fires or the channel closes.
    pub fn run(&self, shutdown: &mpsc::Receiver<()>) -> Result<(), QueueError> {
        info!(worker = %self.settings.name, channel = %self.settings.channel, "upload worker started");
        let result = self
            .queue
            .consume(&self.settings.channel, shutdown, &mut |payload| {
                let outcome = self.handle_payload(&payload);
                debug!(worker = %self.settings.name, ?outcome, "payload handled");
            });
        info!(worker = %self.settings.name, "upload worker stopped");
        result
    }

    pub fn handle_payload(&self, payload: &[u8]) -> JobOutcome {
        let job = match UploadJob::from_payload(payload) {
            Ok(job) => job,
            Err(e) => {
                let reason = e.to_string();
                error!(worker = %self.settings.name, error = %reason, "dropping malformed job payload");
                self.dead_letter(payload, &reason);
                return JobOutcome::Dropped { reason };
            }
        };

        let span = info_span!(
            "upload_job",
            upload_id = %job.upload_id(),
            post_id = %job.post_id(),
            request_id = job.request_id().unwrap_or("-"),
        );
        let _entered = span.enter();
        self.process(&job)
    }

    fn process(&self, job: &UploadJob) -> JobOutcome {
        let upload_id = job.upload_id().clone();
        let lock_key = format!("upload:{upload_id}");

        let token = match self.locker.acquire(&lock_key, self.settings.lock_ttl) {
            Ok(LockAttempt::Acquired(token)) => token,
            Ok(LockAttempt::Contended) => {
                info!("job is being processed by another worker");
                return JobOutcome::Skipped {
                    upload_id,
                    reason: SkipReason::Contended,
                };
            }
            Err(e) => {
                error!(error = %e, "could not take job lock, marking failed");
                self.write_status(&upload_id, UploadStatus::Failed);
                return JobOutcome::Failed {
                    upload_id,
                    reason: e.to_string(),
                };
            }
        };

        let outcome = self.process_locked(job);

        if let Err(e) = self.locker.release(&lock_key, &token) {
            warn!(error = %e, "failed to release job lock; it will expire");
        }
        outcome
    }

    fn process_locked(&self, job: &UploadJob) -> JobOutcome {
        let upload_id = job.upload_id().clone();

        match self.statuses.get(&upload_id) {
            Ok(current) if current.is_terminal() => {
                info!(status = %current, "duplicate delivery of a finished job");
                return JobOutcome::Skipped {
                    upload_id,
                    reason: SkipReason::AlreadyTerminal(current),
                };
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "status read failed, continuing"),
        }

        self.write_status(&upload_id, UploadStatus::Uploading);

        match self.breaker.call(|| self.uploader.upload(job)) {
            Ok(location) => {
                let location = String::from_utf8_lossy(&location).into_owned();
                // Location first, so a reader that sees `success` also sees where it went.
                if let Err(e) = self.statuses.record_location(&upload_id, &location) {
                    warn!(error = %e, "failed to record upload location");
                }
                self.write_status(&upload_id, UploadStatus::Success);
                info!(%location, bytes = job.file_data().len(), "upload succeeded");
                JobOutcome::Succeeded {
                    upload_id,
                    location,
                }
            }
            Err(e) => {
                let reason = describe_failure(&e);
                error!(error = %reason, "upload failed");
                self.write_status(&upload_id, UploadStatus::Failed);
                JobOutcome::Failed { upload_id, reason }
            }
        }
    }

    fn write_status(&self, id: &UploadId, status: UploadStatus) {
        match self.statuses.transition(id, status) {
            Ok(true) => debug!(upload_id = %id, %status, "status written"),
            Ok(false) => debug!(upload_id = %id, %status, "status write skipped"),
            Err(e) => warn!(upload_id = %id, %status, error = %e, "status write failed"),
        }
    }

    fn dead_letter(&self, payload: &[u8], reason: &str) {
        let Some(dlq) = &self.settings.dead_letter_channel else {
            return;
        };
        let letter = DeadLetter {
            channel: self.settings.channel.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
            payload: STANDARD.encode(payload),
        };
        let encoded = match serde_json::to_vec(&letter) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode dead letter");
                return;
            }
        };
        match self.queue.publish(dlq, &encoded) {
            Ok(()) => warn!(dead_letter_channel = %dlq, "payload sent to dead-letter channel"),
            Err(e) => error!(dead_letter_channel = %dlq, error = %e, "dead-letter publish failed"),
        }
    }
}

fn describe_failure(e: &BreakerError<UploadError>) -> String {
    match e {
        BreakerError::Call(inner) => inner.to_string(),
        rejected => rejected.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerSettings;
    use crate::cache::InMemoryCache;
    use crate::lock::{InMemoryLocker, LockError, LockToken, ReleaseOutcome};
    use crate::status_store::DEFAULT_STATUS_TTL;
    use postline_core::PostId;
    use postline_queue::InMemoryJobQueue;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingUploader {
        calls: AtomicU32,
        fail: bool,
        seen: Mutex<Vec<UploadJob>>,
    }

    impl Uploader for RecordingUploader {
        fn upload(&self, job: &UploadJob) -> Result<Vec<u8>, UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(job.clone());
            if self.fail {
                return Err(UploadError::Rejected {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(format!("mem://{}/{}", job.post_id(), job.file_name()).into_bytes())
        }
    }

    struct BrokenLocker;

    impl Locker for BrokenLocker {
        fn acquire(&self, _key: &str, _ttl: Duration) -> Result<LockAttempt, LockError> {
            Err(LockError::Connection("refused".to_string()))
        }

        fn release(&self, _key: &str, _token: &LockToken) -> Result<ReleaseOutcome, LockError> {
            Err(LockError::Connection("refused".to_string()))
        }
    }

    struct Fixture {
        queue: Arc<InMemoryJobQueue>,
        statuses: UploadStatusStore,
        locker: Arc<InMemoryLocker>,
        uploader: Arc<RecordingUploader>,
        worker: UploadWorker,
    }

    fn fixture(uploader: RecordingUploader, settings: WorkerSettings) -> Fixture {
        let queue = Arc::new(InMemoryJobQueue::new());
        let statuses = UploadStatusStore::new(Arc::new(InMemoryCache::new()), DEFAULT_STATUS_TTL);
        let locker = Arc::new(InMemoryLocker::new());
        let uploader = Arc::new(uploader);
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings {
            failure_threshold: 2,
            ..BreakerSettings::named("storage")
        }));
        let worker = UploadWorker::new(
            queue.clone(),
            statuses.clone(),
            locker.clone(),
            uploader.clone(),
            breaker,
            settings,
        );
        Fixture {
            queue,
            statuses,
            locker,
            uploader,
            worker,
        }
    }

    fn job(id: &str) -> UploadJob {
        UploadJob::new(
            UploadId::parse(id).unwrap(),
            PostId::parse("p1").unwrap(),
            "a.txt",
            "text/plain",
            b"filedata".to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn successful_upload_ends_in_success() {
        let fx = fixture(RecordingUploader::default(), WorkerSettings::default());
        let id = UploadId::parse("u1").unwrap();

        let outcome = fx.worker.handle_payload(&job("u1").to_payload().unwrap());

        assert_eq!(
            outcome,
            JobOutcome::Succeeded {
                upload_id: id.clone(),
                location: "mem://p1/a.txt".to_string()
            }
        );
        assert_eq!(fx.statuses.get(&id).unwrap(), UploadStatus::Success);
        assert_eq!(fx.statuses.location(&id).unwrap().as_deref(), Some("mem://p1/a.txt"));
        assert_eq!(fx.uploader.seen.lock().unwrap()[0].file_data(), b"filedata");
        assert!(!fx.locker.is_held("upload:u1"));
    }

    #[test]
    fn failed_upload_ends_in_failed_without_retry() {
        let fx = fixture(
            RecordingUploader {
                fail: true,
                ..Default::default()
            },
            WorkerSettings::default(),
        );
        let id = UploadId::parse("u1").unwrap();

        let outcome = fx.worker.handle_payload(&job("u1").to_payload().unwrap());

        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        assert_eq!(fx.statuses.get(&id).unwrap(), UploadStatus::Failed);
        assert_eq!(fx.uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_breaker_fails_jobs_without_calling_storage() {
        let fx = fixture(
            RecordingUploader {
                fail: true,
                ..Default::default()
            },
            WorkerSettings::default(),
        );
        for id in ["u1", "u2"] {
            fx.worker.handle_payload(&job(id).to_payload().unwrap());
        }

        let outcome = fx.worker.handle_payload(&job("u3").to_payload().unwrap());

        match outcome {
            JobOutcome::Failed { reason, .. } => assert!(reason.contains("open")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fx.uploader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            fx.statuses.get(&UploadId::parse("u3").unwrap()).unwrap(),
            UploadStatus::Failed
        );
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let fx = fixture(RecordingUploader::default(), WorkerSettings::default());
        let outcome = fx.worker.handle_payload(b"{not json");
        assert!(matches!(outcome, JobOutcome::Dropped { .. }));
        assert_eq!(fx.uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_payload_goes_to_dead_letter_channel_when_configured() {
        let fx = fixture(
            RecordingUploader::default(),
            WorkerSettings {
                dead_letter_channel: Some("uploads:dead".to_string()),
                ..WorkerSettings::default()
            },
        );

        fx.worker.handle_payload(b"garbage");

        let raw = fx
            .queue
            .receive("uploads:dead", Duration::from_millis(10))
            .unwrap()
            .unwrap();
        let letter: DeadLetter = serde_json::from_slice(&raw).unwrap();
        assert_eq!(letter.channel, UPLOADS_CHANNEL);
        assert_eq!(letter.original_payload().unwrap(), b"garbage");
    }

    #[test]
    fn contended_lock_skips_the_job() {
        let fx = fixture(RecordingUploader::default(), WorkerSettings::default());
        let held = fx.locker.acquire("upload:u1", DEFAULT_LOCK_TTL).unwrap();
        assert!(held.token().is_some());

        let outcome = fx.worker.handle_payload(&job("u1").to_payload().unwrap());

        assert_eq!(
            outcome,
            JobOutcome::Skipped {
                upload_id: UploadId::parse("u1").unwrap(),
                reason: SkipReason::Contended
            }
        );
        assert_eq!(fx.uploader.calls.load(Ordering::SeqCst), 0);
        assert!(fx.locker.is_held("upload:u1"));
    }

    #[test]
    fn duplicate_delivery_of_finished_job_is_skipped() {
        let fx = fixture(RecordingUploader::default(), WorkerSettings::default());
        let payload = job("u1").to_payload().unwrap();

        fx.worker.handle_payload(&payload);
        let second = fx.worker.handle_payload(&payload);

        assert!(matches!(
            second,
            JobOutcome::Skipped {
                reason: SkipReason::AlreadyTerminal(UploadStatus::Success),
                ..
            }
        ));
        assert_eq!(fx.uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_store_outage_marks_the_job_failed() {
        let statuses = UploadStatusStore::new(Arc::new(InMemoryCache::new()), DEFAULT_STATUS_TTL);
        let uploader = Arc::new(RecordingUploader::default());
        let worker = UploadWorker::new(
            Arc::new(InMemoryJobQueue::new()),
            statuses.clone(),
            Arc::new(BrokenLocker),
            uploader.clone(),
            Arc::new(CircuitBreaker::new(BreakerSettings::default())),
            WorkerSettings::default(),
        );

        let outcome = worker.handle_payload(&job("u1").to_payload().unwrap());

        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        assert_eq!(
            statuses.get(&UploadId::parse("u1").unwrap()).unwrap(),
            UploadStatus::Failed
        );
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn spawned_worker_keeps_going_after_a_malformed_payload() {
        let fx = fixture(RecordingUploader::default(), WorkerSettings::default());
        fx.queue.publish(UPLOADS_CHANNEL, b"\x00\x01 not a job").unwrap();
        fx.queue
            .publish(UPLOADS_CHANNEL, &job("u2").to_payload().unwrap())
            .unwrap();

        let statuses = fx.statuses.clone();
        let handle = fx.worker.spawn().unwrap();

        let id = UploadId::parse("u2").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while statuses.get(&id).unwrap() != UploadStatus::Success {
            assert!(std::time::Instant::now() < deadline, "job never finished");
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(handle.shutdown(), Ok(()));
    }
}
