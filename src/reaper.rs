use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// How often the compactor looks at the append counter.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically sweep stale `booked` records to `missed`.
pub async fn run_reconciler(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let now = engine.now_ms();
        let swept = engine.reconcile(now).await;
        if swept == 0 {
            debug!("reconciler: nothing stale at {now}");
        }
    }
}

/// Compact the WAL once enough appends have piled up since the last time.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
