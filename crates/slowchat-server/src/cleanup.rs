use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use slowchat_db::Database;

/// Background task that prunes expired sessions.
pub async fn run_session_cleanup(db: Arc<Database>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let db = db.clone();
        let now = chrono::Utc::now().timestamp();
        match tokio::task::spawn_blocking(move || db.prune_expired_sessions(now)).await {
            Ok(Ok(count)) => {
                if count > 0 {
                    info!("Cleanup: pruned {} expired sessions", count);
                }
            }
            Ok(Err(e)) => warn!("Cleanup error: {}", e),
            Err(e) => warn!("Cleanup task failed: {}", e),
        }
    }
}
