use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bulwark::CacheStore;
use bulwark::CancellationRegistry;
use bulwark::KeyedWindows;
use bulwark::WindowSpec;
use criterion::BenchmarkGroup;
use criterion::Criterion;
use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::measurement::WallTime;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::service_fn;
use tower::util::BoxCloneSyncService;
use tower_bulwark::ApiRequest;
use tower_bulwark::ApiResponse;
use tower_bulwark::Client;
use tower_bulwark::ClientConfig;
use tower_bulwark::RateLimiter;
use tower_bulwark::RetryPolicy;
use tower_bulwark::ServiceBuilderExt;

// --- HELPERS & TYPES ---

type BenchService = BoxCloneSyncService<ApiRequest, ApiResponse, BoxError>;

async fn noop_handler(_req: ApiRequest) -> Result<ApiResponse, BoxError> {
    Ok(ApiResponse::ok("ok"))
}

/// Generic runner for single-call overhead benchmarks
fn bench_overhead(
    group: &mut BenchmarkGroup<WallTime>,
    rt: &tokio::runtime::Runtime,
    id: &str,
    svc: BenchService,
) {
    group.bench_function(id, |b| {
        b.to_async(rt).iter(|| {
            let mut s = svc.clone();
            async move {
                let req = ApiRequest::get("/rooms").no_cache();
                let res = s.ready().await.unwrap().call(req).await;
                black_box(res)
            }
        });
    });
}

/// Generic runner for burst/contention benchmarks
fn bench_burst(
    group: &mut BenchmarkGroup<WallTime>,
    rt: &tokio::runtime::Runtime,
    id: &str,
    svc: BenchService,
    burst_size: usize,
) {
    group.bench_function(id, |b| {
        b.to_async(rt).iter(|| {
            let s = svc.clone();
            async move {
                let mut futures = FuturesUnordered::new();
                for i in 0..burst_size {
                    let mut local_svc = s.clone();
                    futures.push(async move {
                        let req = ApiRequest::get(format!("/rooms/{i}")).no_cache();
                        local_svc.ready().await.unwrap().call(req).await
                    });
                }
                while let Some(res) = futures.next().await {
                    let _ = black_box(res);
                }
            }
        });
    });
}

// --- MAIN BENCHMARK ---

fn bench_all_scenarios(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(8)
        .enable_all()
        .build()
        .unwrap();
    let _guard = rt.enter();

    let burst_size = 1000;
    // Large enough that the window never binds; this measures bookkeeping only.
    let roomy = WindowSpec::new(NonZeroUsize::new(100_000_000).unwrap(), Duration::from_secs(1));

    let mut config = ClientConfig::default();
    config.rate_limit.enabled = true;
    let client = Client::new(config, service_fn(noop_handler)).unwrap();

    let scenarios: Vec<(&str, BenchService)> = vec![
        ("raw", BoxCloneSyncService::new(service_fn(noop_handler))),
        (
            "classify",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .classify_status()
                    .service(service_fn(noop_handler)),
            ),
        ),
        (
            "retry",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .retry_transient(RetryPolicy::default())
                    .classify_status()
                    .service(service_fn(noop_handler)),
            ),
        ),
        (
            "rate_limit",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .keyed_rate_limit(Arc::new(RateLimiter::new(KeyedWindows::new(Some(roomy)))))
                    .service(service_fn(noop_handler)),
            ),
        ),
        (
            "supersede",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .supersede(CancellationRegistry::new())
                    .service(service_fn(noop_handler)),
            ),
        ),
        (
            "cache_bypass",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .read_through_cache(Arc::new(CacheStore::new()), Duration::from_secs(60))
                    .service(service_fn(noop_handler)),
            ),
        ),
        (
            "client",
            BoxCloneSyncService::new(service_fn(move |req: ApiRequest| {
                let client = client.clone();
                async move { client.send(req).await.map_err(BoxError::from) }
            })),
        ),
    ];

    let mut group = c.benchmark_group("Single Request Overhead");
    for (id, svc) in &scenarios {
        bench_overhead(&mut group, &rt, id, svc.clone());
    }
    group.finish();

    let mut group = c.benchmark_group("Burst Contention");
    for (id, svc) in &scenarios {
        bench_burst(&mut group, &rt, id, svc.clone(), burst_size);
    }
    group.finish();
}

criterion_group!(benches, bench_all_scenarios);
criterion_main!(benches);
