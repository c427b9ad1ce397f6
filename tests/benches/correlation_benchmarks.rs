//! # Correlation Benchmarks
//!
//! | Path | Target |
//! |------|--------|
//! | Pending table insert + resolve | < 5µs |
//! | Full round trip through the in-memory broker | < 1ms |

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rpc_gateway::domain::config::PendingBackend;
use rpc_gateway::domain::pending::{LocalPendingTable, PendingTable};
use rpc_gateway::domain::shared_store::{InMemorySharedStore, SharedPendingTable, SharedStore};
use shared_types::CorrelationId;

fn bench_pending_tables(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("pending-table");

    let local = LocalPendingTable::new();
    group.bench_function("local_insert_resolve", |b| {
        b.to_async(&rt).iter(|| async {
            let id = CorrelationId::new();
            let waiter = local.insert(id, Duration::from_secs(30)).expect("insert");
            local.try_resolve(&id, bytes::Bytes::from_static(b"foo bar"));
            black_box(waiter.await.expect("settled").expect("resolved"));
        })
    });

    let store: Arc<dyn SharedStore> = Arc::new(InMemorySharedStore::new());
    let shared = SharedPendingTable::new(store, "bench/correlator-0", Duration::from_secs(1));
    group.bench_function("shared_insert_resolve", |b| {
        b.to_async(&rt).iter(|| async {
            let id = CorrelationId::new();
            let waiter = shared.insert(id, Duration::from_secs(30)).expect("insert");
            shared.try_resolve(&id, bytes::Bytes::from_static(b"foo bar"));
            black_box(waiter.await.expect("settled").expect("resolved"));
        })
    });

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("round-trip");
    group.measurement_time(Duration::from_secs(10));

    for backend in [PendingBackend::Local, PendingBackend::Shared] {
        let node = rt.block_on(async {
            let mut config = relay_node::container::NodeConfig::default();
            config.workers.count = 4;
            config.gateway.correlation.backend = backend;
            relay_node::RelayNode::start(config).await.expect("node")
        });

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("submit", format!("{:?}", backend)),
            &node,
            |b, node| {
                b.to_async(&rt).iter(|| async {
                    black_box(
                        node.pool()
                            .submit("foo", Duration::from_secs(5))
                            .await
                            .expect("reply"),
                    );
                })
            },
        );

        rt.block_on(node.shutdown());
    }

    group.finish();
}

criterion_group!(benches, bench_pending_tables, bench_round_trip);
criterion_main!(benches);
