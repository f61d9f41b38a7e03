use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rask_event_shipper::sender::{BatchOutcome, BatchReport, Outcome, Transport};
use rask_event_shipper::{Capabilities, Event, EventShipper, ShipperConfig};
use std::sync::Arc;

struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send_one(&self, _event: &Event) -> Outcome {
        Ok(())
    }

    async fn send_batch(&self, _events: &[Arc<Event>]) -> BatchOutcome {
        Ok(BatchReport::accepted())
    }
}

fn create_test_event(id: usize) -> Event {
    Event::new(
        "bench.event",
        serde_json::json!({ "id": id, "message": format!("Test event {id}") }),
    )
}

fn start_shipper(rt: &tokio::runtime::Runtime, capacity: usize) -> EventShipper {
    let _guard = rt.enter();
    EventShipper::start(
        ShipperConfig {
            queue_capacity: capacity,
            ..ShipperConfig::default()
        },
        Capabilities::new().transport(Arc::new(NullTransport)),
    )
    .expect("Failed to start shipper for benchmark")
}

fn bench_log_single_producer(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime for benchmark");
    let mut group = c.benchmark_group("log_single_producer");

    for &size in [1000, 10000].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let shipper = start_shipper(&rt, size * 2);
            b.iter(|| {
                for i in 0..size {
                    std::hint::black_box(shipper.log(create_test_event(i)));
                }
            });
            rt.block_on(shipper.shutdown());
        });
    }
    group.finish();
}

fn bench_log_concurrent_producers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime for benchmark");
    let mut group = c.benchmark_group("log_concurrent_producers");
    let per_producer = 2500;

    for &producers in [2, 4, 8].iter() {
        group.throughput(Throughput::Elements((producers * per_producer) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(producers),
            &producers,
            |b, &producers| {
                let shipper = start_shipper(&rt, producers * per_producer * 2);
                b.iter(|| {
                    std::thread::scope(|scope| {
                        for _ in 0..producers {
                            let shipper = shipper.clone();
                            scope.spawn(move || {
                                for i in 0..per_producer {
                                    std::hint::black_box(shipper.log(create_test_event(i)));
                                }
                            });
                        }
                    });
                });
                rt.block_on(shipper.shutdown());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_log_single_producer, bench_log_concurrent_producers);
criterion_main!(benches);
