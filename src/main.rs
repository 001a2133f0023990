use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use tableflow::config::Config;
use tableflow::export::{EventBroadcaster, ParallelExecutor};
use tableflow::server::{self, AppState};
use tableflow::source::{PostgresRowSource, RowSource};
use tableflow::storage::{ObjectStore, S3ObjectStore};

#[tokio::main]
async fn main() {
    // Initialize logging with filters to suppress verbose dependency logs
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .parse_lossy(
                    "tableflow=info,sqlx=warn,aws_config=warn,aws_smithy=warn,aws_sdk_s3=warn,hyper=warn",
                ),
        )
        .init();

    let config = Config::load();

    let source: Arc<dyn RowSource> = Arc::new(
        PostgresRowSource::connect(&config.database_url)
            .await
            .expect("Failed to connect to source database"),
    );
    let store: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::new(config.s3_config.clone(), config.buffers.upload_part_size)
            .await
            .expect("Failed to initialize object store"),
    );

    let root_ctx = CancellationToken::new();

    let broadcaster = EventBroadcaster::new();
    {
        let broadcaster = broadcaster.clone();
        let ctx = root_ctx.clone();
        tokio::spawn(async move { broadcaster.run(ctx).await });
    }

    let executor = Arc::new(ParallelExecutor::new(
        source.clone(),
        store,
        broadcaster.clone(),
        config.max_parallelism,
        config.buffers,
    ));

    let state = AppState {
        source,
        broadcaster,
        executor,
        jobs_ctx: root_ctx.clone(),
    };
    let app = server::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind server address");
    info!(addr = %config.bind_addr, "tableflow listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(root_ctx))
        .await
        .expect("Server error");
}

/// Wait for ctrl-c, then cancel every in-flight job and close the
/// broadcaster so SSE clients unwind cleanly.
async fn shutdown_signal(root_ctx: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    root_ctx.cancel();
}
