mod common;

use common::*;
use parking_lot::Mutex;
use rask_event_shipper::reliability::HealthStatus;
use rask_event_shipper::{
    Capabilities, Event, EventContext, EventShipper, Lifecycle, LossReason, ShipperConfig,
    ShipperError,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_start_requires_a_transport() {
    let result = EventShipper::start(test_config(), Capabilities::new());
    assert!(matches!(result, Err(ShipperError::MissingTransport)));
}

#[test]
fn test_start_outside_a_runtime_fails() {
    let result = EventShipper::start(
        test_config(),
        Capabilities::new().transport(Arc::new(ScriptedTransport::succeeding())),
    );
    assert!(matches!(result, Err(ShipperError::NoRuntime)));
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let result = EventShipper::start(
        ShipperConfig {
            queue_capacity: 0,
            ..test_config()
        },
        Capabilities::new().transport(Arc::new(ScriptedTransport::succeeding())),
    );
    assert!(matches!(result, Err(ShipperError::Config(_))));
}

#[tokio::test]
async fn test_start_fails_when_spill_directory_cannot_be_created() {
    let root = tempfile::TempDir::new().unwrap();
    let blocker = root.path().join("occupied");
    std::fs::write(&blocker, b"file").unwrap();

    let result = EventShipper::start(
        with_spillover(test_config(), &blocker.join("spill")),
        Capabilities::new().transport(Arc::new(ScriptedTransport::succeeding())),
    );
    assert!(matches!(result, Err(ShipperError::Spillover(_))));
}

#[tokio::test]
async fn test_events_reach_the_transport_unchanged() {
    let seen: Arc<Mutex<Vec<Event>>> = Arc::default();
    let recorder = Arc::clone(&seen);
    let transport = Arc::new(ScriptedTransport::with_one(move |event, _| {
        recorder.lock().push(event.clone());
        Ok(())
    }));

    let shipper = EventShipper::start(test_config(), Capabilities::new().transport(transport))
        .unwrap();

    let ctx = EventContext::new()
        .with_correlation_id("req-7")
        .with_trace("trace-1", "span-1");
    let original = ctx.child("span-2").event(
        "order.created",
        serde_json::json!({ "order_id": 7, "total": 19.5 }),
    );
    assert!(shipper.log(original.clone()));

    let summary = shipper.shutdown().await;
    assert_eq!(summary.sent, 1);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], original);
    assert_eq!(seen[0].correlation.span_id.as_deref(), Some("span-2"));
}

#[tokio::test]
async fn test_panicking_loss_callback_is_contained() {
    let transport = Arc::new(ScriptedTransport::failing(client_error()));
    let shipper = EventShipper::start(
        test_config(),
        Capabilities::new()
            .transport(transport)
            .on_event_loss(|_, _| panic!("callback bug")),
    )
    .unwrap();

    shipper.log(event("boom"));
    wait_until(Duration::from_secs(2), || shipper.metrics().failed == 1).await;
    assert_eq!(shipper.callback_panics(), 1);

    // Still accepting work after the panic.
    assert!(shipper.log(event("after")));

    let summary = shipper.shutdown().await;
    assert_eq!(summary.failed, 2);
    assert_eq!(shipper.callback_panics(), 2);
    assert!(summary.is_balanced());
}

#[tokio::test]
async fn test_health_reflects_lifecycle_and_circuit() {
    let transport = Arc::new(ScriptedTransport::failing(server_error()));
    let losses = LossLog::default();
    let shipper = EventShipper::start(
        ShipperConfig {
            circuit_breaker_threshold: 1,
            max_retries: 0,
            ..test_config()
        },
        Capabilities::new()
            .transport(transport)
            .on_event_loss(losses.callback()),
    )
    .unwrap();

    let health = shipper.health();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.lifecycle, Lifecycle::Running);
    assert_eq!(health.queue_capacity, 64);

    shipper.log(event("trip"));
    wait_until(Duration::from_secs(2), || losses.len() == 1).await;
    assert_eq!(losses.reasons_for("trip"), vec![LossReason::RetriesExhausted]);

    let health = shipper.health();
    assert!(health.circuit_open);
    assert_eq!(health.status, HealthStatus::Degraded);

    shipper.shutdown().await;
    let health = shipper.health();
    assert_eq!(health.lifecycle, Lifecycle::Stopped);
    assert_eq!(health.status, HealthStatus::Unhealthy);
}

#[cfg(feature = "metrics")]
#[tokio::test]
async fn test_prometheus_export_reports_outcomes() {
    let shipper = EventShipper::start(
        test_config(),
        Capabilities::new().transport(Arc::new(ScriptedTransport::succeeding())),
    )
    .unwrap();

    shipper.log(event("counted"));
    wait_until(Duration::from_secs(2), || shipper.metrics().sent == 1).await;

    let exported = shipper.export_metrics().unwrap();
    assert!(exported.contains("rask_shipper_events_total{outcome=\"sent\"} 1"));
    assert!(exported.contains("rask_shipper_queue_depth 0"));

    shipper.shutdown().await;
}
