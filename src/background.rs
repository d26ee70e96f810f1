//! 过期分片暂存目录的后台清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SCRATCH_REAP_INTERVAL_SECS;
use crate::upload::UploadService;

/// `scratch_ttl` 为零时不启动清理。
pub fn spawn_background_tasks(uploads: Arc<UploadService>, scratch_ttl: Duration) {
    if scratch_ttl.is_zero() {
        return;
    }
    info!(ttl_secs = scratch_ttl.as_secs(), "scratch reaper enabled");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SCRATCH_REAP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match uploads.reap_stale(scratch_ttl).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "reaped stale chunk dirs"),
                Err(err) => warn!(error = %err, "scratch cleanup failed"),
            }
        }
    });
}
