#![cfg(feature = "test-utils")]

// End-to-end pipeline behavior against the in-memory doubles: object
// content, chunk ordering, empty tables, and key idempotence.

mod support;

use std::sync::Arc;

use tableflow::export::{EventBroadcaster, ExportEvent, JobStatus};
use tableflow::test_support::{chunk, sample_rows, single_chunk_table, MemoryObjectStore, MockRowSource};
use tokio_util::sync::CancellationToken;

use support::{drain_events, executor, gunzip, plan, tracing_init};

#[tokio::test]
async fn single_small_table_exports_and_reports() {
    tracing_init();

    let source = Arc::new(MockRowSource::new().with_table("T1", single_chunk_table("T1", 3)));
    let store = MemoryObjectStore::new();
    let broadcaster = EventBroadcaster::new();
    let exec = executor(source, Arc::new(store.clone()), broadcaster.clone());

    let mut subscriber = broadcaster.register("acme");
    let result = exec
        .execute(CancellationToken::new(), plan("acme", &["T1"], 1))
        .await
        .expect("single table export succeeds");

    assert_eq!(result.total_rows, 3);
    assert_eq!(result.successful_tables, 1);
    assert_eq!(result.failed_tables, 0);
    assert_eq!(result.table_results.len(), 1);
    assert_eq!(result.table_results[0].object_key, "acme/v001/T1.jsonl.gz");

    // Object content: exactly three well-formed JSON lines.
    let object = store.object("acme/v001/T1.jsonl.gz").expect("object exists");
    assert_eq!(object.len() as u64, result.total_bytes);
    let text = gunzip(&object);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in &lines {
        let parsed: serde_json::Value = serde_json::from_str(line).expect("well-formed JSON line");
        assert!(parsed.is_object());
    }

    // Events: one per-table completed status, then one complete.
    let events = drain_events(&mut subscriber);
    let statuses: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExportEvent::Status(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, JobStatus::Completed);
    assert_eq!(statuses[0].table.as_deref(), Some("T1"));

    let completes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExportEvent::Complete(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].total_rows, 3);
    assert_eq!(completes[0].tables_count, 1);

    // Complete arrives after the per-table status.
    let status_pos = events
        .iter()
        .position(|e| matches!(e, ExportEvent::Status(_)))
        .unwrap();
    let complete_pos = events
        .iter()
        .position(|e| matches!(e, ExportEvent::Complete(_)))
        .unwrap();
    assert!(status_pos < complete_pos);
}

#[tokio::test]
async fn empty_table_produces_empty_object() {
    tracing_init();

    let source = Arc::new(MockRowSource::new().with_table("EMPTY", single_chunk_table("EMPTY", 0)));
    let store = MemoryObjectStore::new();
    let exec = executor(source, Arc::new(store.clone()), EventBroadcaster::new());

    let result = exec
        .execute(CancellationToken::new(), plan("acme", &["EMPTY"], 1))
        .await
        .expect("empty table export succeeds");

    assert_eq!(result.total_rows, 0);
    assert_eq!(result.table_results[0].row_count, 0);
    assert!(result.table_results[0].success());

    let object = store.object("acme/v001/EMPTY.jsonl.gz").expect("object exists");
    assert!(gunzip(&object).is_empty());
}

#[tokio::test]
async fn multi_chunk_table_preserves_row_order() {
    tracing_init();

    // Three chunks of three rows each; ids 1..=9 in chunk order.
    let all_rows = sample_rows(9);
    let chunks = vec![
        chunk("BIG", 1, all_rows[0..3].to_vec(), false, 3),
        chunk("BIG", 2, all_rows[3..6].to_vec(), false, 6),
        chunk("BIG", 3, all_rows[6..9].to_vec(), true, 9),
    ];
    let source = Arc::new(MockRowSource::new().with_table("BIG", chunks));
    let store = MemoryObjectStore::new();
    let exec = executor(source, Arc::new(store.clone()), EventBroadcaster::new());

    let result = exec
        .execute(CancellationToken::new(), plan("acme", &["BIG"], 1))
        .await
        .expect("multi-chunk export succeeds");
    assert_eq!(result.total_rows, 9);

    let text = gunzip(&store.object("acme/v001/BIG.jsonl.gz").unwrap());
    let ids: Vec<i64> = text
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).unwrap()["id"]
                .as_i64()
                .unwrap()
        })
        .collect();
    assert_eq!(ids, (1..=9).collect::<Vec<i64>>());
}

#[tokio::test]
async fn rerun_overwrites_the_same_key() {
    tracing_init();

    let store = MemoryObjectStore::new();

    // First run: 2 rows.
    let source = Arc::new(MockRowSource::new().with_table("T1", single_chunk_table("T1", 2)));
    let exec = executor(source, Arc::new(store.clone()), EventBroadcaster::new());
    exec.execute(CancellationToken::new(), plan("acme", &["T1"], 1))
        .await
        .unwrap();

    // Second run with identical (transport, version, table): 5 rows.
    let source = Arc::new(MockRowSource::new().with_table("T1", single_chunk_table("T1", 5)));
    let exec = executor(source, Arc::new(store.clone()), EventBroadcaster::new());
    exec.execute(CancellationToken::new(), plan("acme", &["T1"], 1))
        .await
        .unwrap();

    assert_eq!(store.keys(), vec!["acme/v001/T1.jsonl.gz".to_string()]);
    let text = gunzip(&store.object("acme/v001/T1.jsonl.gz").unwrap());
    assert_eq!(text.lines().count(), 5);
}
