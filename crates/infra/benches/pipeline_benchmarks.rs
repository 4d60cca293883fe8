use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use postline_core::{PostId, UploadId, UploadJob};
use postline_infra::breaker::{BreakerSettings, CircuitBreaker};
use postline_infra::cache::InMemoryCache;
use postline_infra::lock::{InMemoryLocker, Locker};
use postline_infra::status_store::{DEFAULT_STATUS_TTL, UploadStatusStore};
use postline_infra::uploader::{UploadError, Uploader};
use postline_infra::worker::{UploadWorker, WorkerSettings};
use postline_queue::InMemoryJobQueue;

/// Storage stand-in that accepts everything instantly.
struct NullUploader;

impl Uploader for NullUploader {
    fn upload(&self, job: &UploadJob) -> Result<Vec<u8>, UploadError> {
        Ok(job.file_name().as_bytes().to_vec())
    }
}

fn job_of_size(bytes: usize) -> UploadJob {
    UploadJob::new(
        UploadId::new(),
        PostId::parse("p1").unwrap(),
        "bench.bin",
        "application/octet-stream",
        vec![0xAB; bytes],
    )
    .unwrap()
}

fn bench_wire_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_wire_codec");
    for size in [1_024usize, 64 * 1_024, 1_024 * 1_024] {
        let job = job_of_size(size);
        let payload = job.to_payload().unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &job, |b, job| {
            b.iter(|| black_box(job.to_payload().unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &payload, |b, payload| {
            b.iter(|| black_box(UploadJob::from_payload(payload).unwrap()))
        });
    }
    group.finish();
}

fn bench_breaker(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(BreakerSettings::named("bench"));
    c.bench_function("breaker_closed_call", |b| {
        b.iter(|| black_box(breaker.call(|| Ok::<_, ()>(vec![1u8]))))
    });
}

fn bench_locker(c: &mut Criterion) {
    let locker = InMemoryLocker::new();
    c.bench_function("in_memory_lock_cycle", |b| {
        b.iter(|| {
            let attempt = locker.acquire("bench", Duration::from_secs(5)).unwrap();
            if let Some(token) = attempt.token() {
                black_box(locker.release("bench", token).unwrap());
            }
        })
    });
}

fn bench_worker(c: &mut Criterion) {
    let worker = UploadWorker::new(
        Arc::new(InMemoryJobQueue::new()),
        UploadStatusStore::new(Arc::new(InMemoryCache::new()), DEFAULT_STATUS_TTL),
        Arc::new(InMemoryLocker::new()),
        Arc::new(NullUploader),
        Arc::new(CircuitBreaker::new(BreakerSettings::named("bench"))),
        WorkerSettings::default(),
    );

    c.bench_function("worker_handle_payload_64k", |b| {
        b.iter_batched(
            || job_of_size(64 * 1_024).to_payload().unwrap(),
            |payload| black_box(worker.handle_payload(&payload)),
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_wire_codec, bench_breaker, bench_locker, bench_worker);
criterion_main!(benches);
