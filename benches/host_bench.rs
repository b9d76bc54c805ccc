use criterion::{black_box, criterion_group, criterion_main, Criterion};
use proc_host::{
    Config, ContextPool, Error, Host, ObjectPool, Orchestrator, ServiceRegistry,
    ShutdownCoordinator, ShutdownReason, StopSignal, StringPool,
};
use std::time::Duration;

async fn idle_task(stop: StopSignal) -> proc_host::Result<()> {
    stop.triggered().await;
    Ok(())
}

fn bench_host_creation(c: &mut Criterion) {
    c.bench_function("host_creation", |b| {
        b.iter(|| {
            let host = Host::builder(Config::default())
                .with_task("bench", idle_task)
                .with_task("bench2", idle_task)
                .with_task("bench3", idle_task)
                .without_signals()
                .without_logging()
                .build()
                .unwrap();
            black_box(host);
        });
    });
}

fn bench_config_building(c: &mut Criterion) {
    c.bench_function("config_building", |b| {
        b.iter(|| {
            let config = Config::builder()
                .name("bench-host")
                .shutdown_timeout(Duration::from_secs(5))
                .unwrap()
                .pool_capacity(64)
                .build()
                .unwrap();
            black_box(config);
        });
    });
}

fn bench_orchestrator_lifecycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("orchestrator_start_stop", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let start = std::time::Instant::now();
                for _ in 0..iters {
                    let mut registry = ServiceRegistry::new();
                    registry.register_task("a", idle_task);
                    registry.register_task("b", idle_task);
                    let orchestrator = Orchestrator::new(registry);
                    orchestrator.start().await.unwrap();
                    orchestrator.stop(Duration::from_secs(1)).await.unwrap();
                    black_box(orchestrator);
                }
                start.elapsed()
            })
        });
    });
}

fn bench_shutdown_initiation(c: &mut Criterion) {
    c.bench_function("shutdown_initiation", |b| {
        b.iter(|| {
            let coordinator = ShutdownCoordinator::new();
            black_box(coordinator.initiate_shutdown(ShutdownReason::Requested));
        });
    });
}

fn bench_pools(c: &mut Criterion) {
    let pool = ObjectPool::with_prewarm(64, 64, || Vec::<u8>::with_capacity(256));
    c.bench_function("object_pool_acquire_release", |b| {
        b.iter(|| {
            let mut buffer = pool.acquire();
            buffer.extend_from_slice(black_box(b"payload"));
            pool.release(buffer);
        });
    });

    let strings = StringPool::new(64, 64, 128);
    c.bench_function("string_pool_get", |b| {
        b.iter(|| {
            let s = strings.get_with_value(black_box("request line"));
            black_box(s.len());
        });
    });

    let contexts = ContextPool::new(64, 64);
    c.bench_function("context_pool_get", |b| {
        b.iter(|| {
            let mut context = contexts.get();
            context.request_id = Some(black_box(1));
            context.features_mut().insert(black_box(7_u32));
        });
    });
}

fn bench_error_creation(c: &mut Criterion) {
    c.bench_function("error_creation", |b| {
        b.iter(|| {
            let err = Error::runtime(black_box("benchmark error"));
            black_box(err);
        });
    });

    c.bench_function("error_aggregate", |b| {
        b.iter(|| {
            let err = Error::aggregate(vec![
                Error::shutdown("a", black_box("failed")),
                Error::timeout("stop services", 100),
            ]);
            black_box(err);
        });
    });
}

criterion_group!(
    benches,
    bench_host_creation,
    bench_config_building,
    bench_orchestrator_lifecycle,
    bench_shutdown_initiation,
    bench_pools,
    bench_error_creation
);
criterion_main!(benches);
