#![cfg(feature = "test-utils")]

// Broadcaster fan-out semantics: per-transport filtering, exactly-once
// delivery per subscriber, and non-blocking behavior under a full inbox.

mod support;

use std::time::Duration;

use tableflow::export::{
    EventBroadcaster, ExportEvent, ProgressPayload, SUBSCRIBER_INBOX_CAPACITY,
};

use support::tracing_init;

fn progress(transport_id: &str, rows: u64) -> ProgressPayload {
    ProgressPayload {
        transport_id: transport_id.to_string(),
        job_id: "j1".to_string(),
        table: "T1".to_string(),
        rows_processed: rows,
        rows_total: -1,
        rows_per_second: 0.0,
        bytes_written: rows * 10,
        progress_percent: 0.0,
    }
}

#[tokio::test]
async fn fan_out_filters_by_transport_and_delivers_once() {
    tracing_init();

    let broadcaster = EventBroadcaster::new();
    let mut s1 = broadcaster.register("X");
    let mut s2 = broadcaster.register("X");
    let mut s3 = broadcaster.register("Y");

    broadcaster.broadcast_progress(progress("X", 42));

    for sub in [&mut s1, &mut s2] {
        let event = sub.rx.try_recv().expect("X subscriber receives the event");
        match event {
            ExportEvent::Progress(p) => {
                assert_eq!(p.transport_id, "X");
                assert_eq!(p.rows_processed, 42);
            }
            other => panic!("expected progress, got {}", other.kind()),
        }
        // Exactly once: nothing further queued.
        assert!(sub.rx.try_recv().is_err());
    }

    assert!(s3.rx.try_recv().is_err(), "Y subscriber must see nothing");
}

#[tokio::test]
async fn full_inbox_never_blocks_or_starves_siblings() {
    tracing_init();

    let broadcaster = EventBroadcaster::new();
    let mut stuck = broadcaster.register("X");
    let mut healthy = broadcaster.register("X");

    // Fill the stuck subscriber's inbox to capacity.
    for i in 0..SUBSCRIBER_INBOX_CAPACITY as u64 {
        broadcaster.broadcast_progress(progress("X", i));
    }
    // Keep the healthy subscriber drained.
    while healthy.rx.try_recv().is_ok() {}

    // Broadcasting against a full inbox must return promptly and still reach
    // the healthy subscriber.
    let delivered = tokio::time::timeout(Duration::from_millis(250), async {
        broadcaster.broadcast_progress(progress("X", 999));
        healthy.rx.recv().await
    })
    .await
    .expect("broadcast with a full sibling inbox does not block");

    match delivered {
        Some(ExportEvent::Progress(p)) => assert_eq!(p.rows_processed, 999),
        other => panic!("healthy subscriber missed the event: {:?}", other.map(|e| e.kind())),
    }

    // The stuck inbox kept its capacity's worth; the overflow was dropped.
    let mut stuck_count = 0;
    while stuck.rx.try_recv().is_ok() {
        stuck_count += 1;
    }
    assert_eq!(stuck_count, SUBSCRIBER_INBOX_CAPACITY);
}

#[tokio::test]
async fn late_subscribers_miss_earlier_events() {
    tracing_init();

    let broadcaster = EventBroadcaster::new();
    broadcaster.broadcast_progress(progress("X", 1));

    let mut late = broadcaster.register("X");
    assert!(late.rx.try_recv().is_err());

    broadcaster.broadcast_progress(progress("X", 2));
    let event = late.rx.try_recv().expect("live event arrives");
    match event {
        ExportEvent::Progress(p) => assert_eq!(p.rows_processed, 2),
        other => panic!("expected progress, got {}", other.kind()),
    }
}
