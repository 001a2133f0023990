#![cfg(feature = "test-utils")]

// Executor semantics: worker bound, partial failure, cancellation, and plan
// validation.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tableflow::config::BufferConfig;
use tableflow::export::{
    EventBroadcaster, ExecuteError, ExportEvent, JobStatus, ParallelExecutor,
};
use tableflow::test_support::{single_chunk_table, MemoryObjectStore, MockRowSource};
use tokio_util::sync::CancellationToken;

use support::{drain_events, executor, plan, settle, tracing_init};

#[tokio::test]
async fn worker_count_caps_concurrent_pipelines() {
    tracing_init();

    let mut source = MockRowSource::new().with_chunk_delay(Duration::from_millis(30));
    for i in 1..=6 {
        let name = format!("T{}", i);
        source = source.with_table(&name, single_chunk_table(&name, 4));
    }
    let source = Arc::new(source);
    let store = MemoryObjectStore::new();
    let exec = executor(source.clone(), Arc::new(store.clone()), EventBroadcaster::new());

    let result = exec
        .execute(
            CancellationToken::new(),
            plan("acme", &["T1", "T2", "T3", "T4", "T5", "T6"], 3),
        )
        .await
        .expect("all six tables export");

    assert_eq!(result.successful_tables, 6);
    assert_eq!(result.failed_tables, 0);
    assert!(
        source.max_active_streams() <= 3,
        "observed {} concurrent pipelines with 3 workers",
        source.max_active_streams()
    );
    assert_eq!(store.keys().len(), 6);
}

#[tokio::test]
async fn failed_table_does_not_sink_its_siblings() {
    tracing_init();

    let source = Arc::new(
        MockRowSource::new()
            .with_table("A", single_chunk_table("A", 3))
            .with_failing_table("FAIL", "simulated scan failure")
            .with_table("B", single_chunk_table("B", 2)),
    );
    let store = MemoryObjectStore::new();
    let broadcaster = EventBroadcaster::new();
    let exec = executor(source, Arc::new(store.clone()), broadcaster.clone());

    let mut subscriber = broadcaster.register("acme");
    let error = exec
        .execute(CancellationToken::new(), plan("acme", &["A", "FAIL", "B"], 2))
        .await
        .expect_err("aggregate error for the failed table");

    let result = match error {
        ExecuteError::TablesFailed { failed, total, result } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 3);
            result
        }
        other => panic!("expected TablesFailed, got {:?}", other),
    };

    assert_eq!(result.successful_tables, 2);
    assert_eq!(result.failed_tables, 1);
    assert_eq!(result.total_rows, 5);

    // Objects for the healthy tables were finalized; no object for FAIL.
    assert!(store.object("acme/v001/A.jsonl.gz").is_some());
    assert!(store.object("acme/v001/B.jsonl.gz").is_some());
    assert!(store.object("acme/v001/FAIL.jsonl.gz").is_none());

    // Exactly one error event, for the failed table.
    let events = drain_events(&mut subscriber);
    let errors: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExportEvent::Error(err) => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].table.as_deref(), Some("FAIL"));
    assert_eq!(errors[0].code, "SOURCE_STREAM_ERROR");

    // Complete still arrives, after everything else.
    assert!(matches!(events.last(), Some(ExportEvent::Complete(_))));
}

#[tokio::test]
async fn upload_failure_is_a_table_level_failure() {
    tracing_init();

    let source = Arc::new(
        MockRowSource::new()
            .with_table("GOOD", single_chunk_table("GOOD", 2))
            .with_table("FAIL", single_chunk_table("FAIL", 2)),
    );
    let store = MemoryObjectStore::failing_finish_for("FAIL");
    let broadcaster = EventBroadcaster::new();
    let exec = executor(source, Arc::new(store.clone()), broadcaster.clone());

    let mut subscriber = broadcaster.register("acme");
    let error = exec
        .execute(CancellationToken::new(), plan("acme", &["GOOD", "FAIL"], 2))
        .await
        .expect_err("upload failure surfaces as aggregate error");

    match error {
        ExecuteError::TablesFailed { failed, result, .. } => {
            assert_eq!(failed, 1);
            assert_eq!(result.successful_tables, 1);
        }
        other => panic!("expected TablesFailed, got {:?}", other),
    }

    let events = drain_events(&mut subscriber);
    let upload_errors: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExportEvent::Error(err) if err.code == "S3_UPLOAD_ERROR" => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(upload_errors.len(), 1);
    assert_eq!(upload_errors[0].table.as_deref(), Some("FAIL"));
}

#[tokio::test]
async fn cancellation_stops_the_job_promptly() {
    tracing_init();

    // Slow tables on one worker: the first may finish, the rest cannot.
    let mut source = MockRowSource::new().with_chunk_delay(Duration::from_millis(40));
    for name in ["T1", "T2", "T3"] {
        source = source.with_table(name, single_chunk_table(name, 3));
    }
    let source = Arc::new(source);
    let broadcaster = EventBroadcaster::new();
    let exec = executor(
        source,
        Arc::new(MemoryObjectStore::new()),
        broadcaster.clone(),
    );

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.cancel();
        });
    }

    let mut subscriber = broadcaster.register("acme");
    let error = tokio::time::timeout(
        Duration::from_secs(2),
        exec.execute(ctx, plan("acme", &["T1", "T2", "T3"], 1)),
    )
    .await
    .expect("execute returns promptly after cancellation")
    .expect_err("cancelled job surfaces an error");

    let result = match error {
        ExecuteError::Cancelled { result } => result,
        other => panic!("expected Cancelled, got {:?}", other),
    };
    assert!(result.successful_tables <= 1);

    settle().await;

    // No table that failed under cancellation got a completed status.
    let successful: Vec<&str> = result
        .table_results
        .iter()
        .filter(|r| r.success())
        .map(|r| r.table_name.as_str())
        .collect();
    for event in drain_events(&mut subscriber) {
        if let ExportEvent::Status(status) = event {
            if status.status == JobStatus::Completed {
                let table = status.table.expect("per-table status names its table");
                assert!(
                    successful.contains(&table.as_str()),
                    "completed status for unfinished table {}",
                    table
                );
            }
        }
    }
}

#[tokio::test]
async fn invalid_plans_are_rejected_before_any_work() {
    tracing_init();

    let broadcaster = EventBroadcaster::new();
    let exec = executor(
        Arc::new(MockRowSource::new()),
        Arc::new(MemoryObjectStore::new()),
        broadcaster.clone(),
    );
    let mut subscriber = broadcaster.register("acme");

    let no_tables = exec
        .execute(CancellationToken::new(), plan("acme", &[], 1))
        .await
        .expect_err("empty table list is invalid");
    assert!(matches!(no_tables, ExecuteError::InvalidPlan(_)));

    let no_transport = exec
        .execute(CancellationToken::new(), plan("", &["T1"], 1))
        .await
        .expect_err("empty transport_id is invalid");
    assert!(matches!(no_transport, ExecuteError::InvalidPlan(_)));

    // Validation failures emit nothing.
    assert!(drain_events(&mut subscriber).is_empty());
}

#[tokio::test]
async fn concurrency_requests_are_clamped() {
    let exec = ParallelExecutor::new(
        Arc::new(MockRowSource::new()),
        Arc::new(MemoryObjectStore::new()),
        EventBroadcaster::new(),
        16,
        BufferConfig::default(),
    );
    assert_eq!(exec.effective_concurrency(0), 4); // default
    assert_eq!(exec.effective_concurrency(-3), 4);
    assert_eq!(exec.effective_concurrency(5), 5);
    assert_eq!(exec.effective_concurrency(100), 16); // global max

    let capped = ParallelExecutor::new(
        Arc::new(MockRowSource::new()),
        Arc::new(MemoryObjectStore::new()),
        EventBroadcaster::new(),
        2,
        BufferConfig::default(),
    );
    assert_eq!(capped.effective_concurrency(8), 2); // executor cap wins
}
