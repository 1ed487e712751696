use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use atelier_infra::worker_pool::{BlockingExecutor, ReplyFraming, WorkerPool, WorkerReply, WorkerRequest};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

/// CPU-bound stand-in for an image transform: reverse rows of a fake bitmap.
fn flip_rows(request: WorkerRequest) -> WorkerReply {
    let mut rows: Vec<&[u8]> = request.input.chunks(256).collect();
    rows.reverse();
    WorkerReply::Ok(rows.concat())
}

fn pool(slots: usize) -> Arc<WorkerPool> {
    Arc::new(
        WorkerPool::builder()
            .slots(slots)
            .script("flip-image", BlockingExecutor::new(flip_rows))
            .build(),
    )
}

fn bench_single_invocation_latency(c: &mut Criterion) {
    let rt = runtime();
    let pool = pool(1);
    let input = vec![7u8; 64 * 1024];

    c.bench_function("worker_pool/single_invocation_64k", |b| {
        b.iter(|| {
            let request = WorkerRequest::new(input.clone());
            let out = rt.block_on(pool.run("flip-image", request)).expect("worker reply");
            black_box(out);
        });
    });
}

fn bench_batch_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("worker_pool_batch_throughput");
    const BATCH: usize = 32;
    group.throughput(Throughput::Elements(BATCH as u64));

    for slots in [1usize, 2, 4, 8] {
        let pool = pool(slots);
        group.bench_with_input(BenchmarkId::from_parameter(slots), &slots, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut handles = Vec::with_capacity(BATCH);
                    for _ in 0..BATCH {
                        let pool = pool.clone();
                        handles.push(tokio::spawn(async move {
                            pool.run("flip-image", WorkerRequest::new(vec![1u8; 16 * 1024])).await
                        }));
                    }
                    for handle in handles {
                        black_box(handle.await.expect("join").expect("worker reply"));
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_reply_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker_reply_decoding");
    let artifact = WorkerReply::Ok(vec![0u8; 256 * 1024]).encode();
    let legacy = vec![0u8; 256 * 1024];

    group.bench_function("tagged", |b| {
        b.iter_batched(
            || artifact.clone(),
            |frame| black_box(WorkerReply::decode(frame, ReplyFraming::Tagged)),
            BatchSize::LargeInput,
        )
    });
    group.bench_function("untagged_sniffing", |b| {
        b.iter_batched(
            || legacy.clone(),
            |frame| black_box(WorkerReply::decode(frame, ReplyFraming::Untagged)),
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_invocation_latency,
    bench_batch_throughput,
    bench_reply_decoding
);
criterion_main!(benches);
