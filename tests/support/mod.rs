#![allow(dead_code)] // not every test binary uses every helper

use std::sync::Arc;
use std::time::Duration;

use tableflow::config::BufferConfig;
use tableflow::export::{EventBroadcaster, ExportEvent, ParallelExecutor, Subscriber};
use tableflow::models::ExecutionPlan;
use tableflow::source::RowSource;
use tableflow::storage::ObjectStore;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false) // Tests: hide target names for cleaner output
        .try_init();
}

/// Build a plan for `tables` with the given worker count.
pub fn plan(transport_id: &str, tables: &[&str], concurrency: i32) -> ExecutionPlan {
    ExecutionPlan {
        transport_id: transport_id.to_string(),
        job_id: format!("job-{}", transport_id),
        job_version: "v001".to_string(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
        owner: "APP".to_string(),
        concurrency,
        buffer_config: Some(BufferConfig::default()),
    }
}

/// Executor wired to the given doubles, with a broadcaster shared by tests.
pub fn executor(
    source: Arc<dyn RowSource>,
    store: Arc<dyn ObjectStore>,
    broadcaster: EventBroadcaster,
) -> ParallelExecutor {
    ParallelExecutor::new(source, store, broadcaster, 16, BufferConfig::default())
}

/// Drain everything currently sitting in a subscriber inbox.
pub fn drain_events(subscriber: &mut Subscriber) -> Vec<ExportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = subscriber.rx.try_recv() {
        events.push(event);
    }
    events
}

/// Gunzip an exported object back into its NDJSON text.
pub fn gunzip(data: &[u8]) -> String {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .expect("exported object is valid gzip");
    out
}

/// Sleep long enough for background tasks to settle in tests.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
