mod common;

use common::*;
use rask_event_shipper::reliability::SpillReader;
use rask_event_shipper::{Capabilities, EventShipper, Lifecycle, LossReason, ShipperConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_far_future_retry_is_spilled_at_shutdown() {
    let dir = tempfile::TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::failing(server_error()));
    let losses = LossLog::default();

    let shipper = EventShipper::start(
        with_spillover(
            ShipperConfig {
                base_retry_delay_ms: 3_600_000,
                max_retry_delay_ms: 3_600_000,
                drain_timeout_ms: 100,
                ..test_config()
            },
            dir.path(),
        ),
        Capabilities::new()
            .transport(transport.clone())
            .on_event_loss(losses.callback()),
    )
    .unwrap();

    shipper.log(event("later"));
    wait_until(Duration::from_secs(2), || shipper.metrics().pending_retries == 1).await;

    let summary = within(Duration::from_secs(5), shipper.shutdown()).await;

    assert_eq!(summary.spilled, 1);
    assert_eq!(summary.failed, 0);
    assert!(summary.is_balanced());
    assert_eq!(losses.reasons_for("later"), vec![LossReason::RetryCancelled]);

    let reader = SpillReader::new(dir.path());
    let files = reader.list_files().await.unwrap();
    assert_eq!(files.len(), 1);

    let records = SpillReader::read_records(&files[0]).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event.name, "later");
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].reason, LossReason::RetryCancelled);
}

#[tokio::test]
async fn test_far_future_retry_fails_without_spillover() {
    let transport = Arc::new(ScriptedTransport::failing(server_error()));
    let losses = LossLog::default();

    let shipper = EventShipper::start(
        ShipperConfig {
            base_retry_delay_ms: 3_600_000,
            max_retry_delay_ms: 3_600_000,
            drain_timeout_ms: 100,
            ..test_config()
        },
        Capabilities::new()
            .transport(transport.clone())
            .on_event_loss(losses.callback()),
    )
    .unwrap();

    shipper.log(event("later"));
    wait_until(Duration::from_secs(2), || shipper.metrics().pending_retries == 1).await;

    let summary = within(Duration::from_secs(5), shipper.shutdown()).await;
    assert_eq!(summary.failed, 1);
    assert!(summary.is_balanced());
    assert_eq!(losses.reasons_for("later"), vec![LossReason::RetryCancelled]);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let transport = Arc::new(ScriptedTransport::succeeding());
    let shipper = EventShipper::start(
        test_config(),
        Capabilities::new().transport(transport.clone()),
    )
    .unwrap();

    for i in 0..10 {
        shipper.log(event(&format!("e{i}")));
    }

    let first = shipper.shutdown().await;
    let second = shipper.shutdown().await;

    assert_eq!(first, second);
    assert_eq!(first.sent, 10);
    assert!(first.drained_cleanly);
    assert_eq!(shipper.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_shutdown_callers_share_one_summary() {
    let transport = Arc::new(ScriptedTransport::succeeding());
    let shipper = EventShipper::start(
        test_config(),
        Capabilities::new().transport(transport.clone()),
    )
    .unwrap();

    for i in 0..20 {
        shipper.log(event(&format!("e{i}")));
    }

    let other = shipper.clone();
    let (a, b) = tokio::join!(shipper.shutdown(), other.shutdown());
    assert_eq!(a, b);
    assert_eq!(a.sent, 20);
}

#[tokio::test]
async fn test_log_after_shutdown_is_rejected_and_reported() {
    let transport = Arc::new(ScriptedTransport::succeeding());
    let losses = LossLog::default();
    let shipper = EventShipper::start(
        test_config(),
        Capabilities::new()
            .transport(transport.clone())
            .on_event_loss(losses.callback()),
    )
    .unwrap();

    let summary = shipper.shutdown().await;

    assert!(!shipper.log(event("too-late")));
    assert_eq!(shipper.log_all(vec![event("x"), event("y")]), 0);
    assert_eq!(
        losses.reasons_for("too-late"),
        vec![LossReason::ShutdownInProgress]
    );

    let metrics = shipper.metrics();
    assert_eq!(metrics.rejected, 3);
    assert_eq!(metrics.queued, summary.queued);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_undrained_queue_is_spilled_at_shutdown() {
    let dir = tempfile::TempDir::new().unwrap();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::succeeding().gated(Arc::clone(&gate)));
    let losses = LossLog::default();

    let shipper = EventShipper::start(
        with_spillover(
            ShipperConfig {
                drain_timeout_ms: 50,
                sender_stop_timeout_ms: 50,
                ..test_config()
            },
            dir.path(),
        ),
        Capabilities::new()
            .transport(transport.clone())
            .on_event_loss(losses.callback()),
    )
    .unwrap();

    shipper.log(event("stuck"));
    within(Duration::from_secs(2), transport.entered.notified()).await;
    for i in 0..5 {
        shipper.log(event(&format!("queued{i}")));
    }

    // The worker never gets past the gate, so its send is abandoned and the
    // event it held is spilled with the rest.
    let summary = within(Duration::from_secs(5), shipper.shutdown()).await;

    assert!(!summary.drained_cleanly);
    assert_eq!(summary.spilled, 6);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.sent, 0);
    assert!(summary.is_balanced());
    assert_eq!(losses.reasons_for("stuck"), vec![LossReason::ShutdownDrain]);
    for i in 0..5 {
        assert_eq!(
            losses.reasons_for(&format!("queued{i}")),
            vec![LossReason::ShutdownDrain]
        );
    }

    let records = SpillReader::new(dir.path()).read_all().await.unwrap();
    assert_eq!(records.len(), 6);
    assert!(records.iter().any(|record| record.event.name == "stuck"));
}

#[tokio::test]
async fn test_abandoned_batch_is_reported_item_by_item() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::succeeding().gated(Arc::clone(&gate)));
    let losses = LossLog::default();

    let shipper = EventShipper::start(
        ShipperConfig {
            batch_size: 4,
            drain_timeout_ms: 50,
            sender_stop_timeout_ms: 50,
            ..test_config()
        },
        Capabilities::new()
            .transport(transport.clone())
            .on_event_loss(losses.callback()),
    )
    .unwrap();

    // All three are queued before the worker first runs, so they go out as
    // one batch that never gets past the gate.
    for name in ["a", "b", "c"] {
        assert!(shipper.log(event(name)));
    }
    within(Duration::from_secs(2), transport.entered.notified()).await;
    assert_eq!(transport.batch_calls(), Vec::<usize>::new());

    let summary = within(Duration::from_secs(5), shipper.shutdown()).await;

    assert_eq!(summary.failed, 3);
    assert_eq!(summary.sent, 0);
    assert!(summary.is_balanced());
    for name in ["a", "b", "c"] {
        assert_eq!(losses.reasons_for(name), vec![LossReason::ShutdownDrain]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_accounting_balances_under_mixed_failures() {
    let dir = tempfile::TempDir::new().unwrap();
    let transport = Arc::new(ScriptedTransport::with_one(|_, call| match call % 7 {
        0 => Err(client_error()),
        1 | 4 => Err(server_error()),
        _ => Ok(()),
    }));

    let shipper = EventShipper::start(
        with_spillover(
            ShipperConfig {
                queue_capacity: 16,
                sender_threads: 3,
                max_retries: 2,
                spillover_capacity: 1024,
                ..test_config()
            },
            dir.path(),
        ),
        Capabilities::new().transport(transport.clone()),
    )
    .unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let shipper = shipper.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    shipper.log(event(&format!("p{p}-{i}")));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let summary = within(Duration::from_secs(10), shipper.shutdown()).await;

    assert_eq!(summary.queued, 400);
    assert_eq!(summary.rejected, 0);
    assert!(
        summary.is_balanced(),
        "sent {} + failed {} + spilled {} != queued {}",
        summary.sent,
        summary.failed,
        summary.spilled,
        summary.queued
    );
}
