use std::sync::Arc;

use chrono::Utc;
use log::error;

use crate::context::OpContext;
use crate::sessions::SessionManager;

/// Spawns the background scheduler that re-evaluates every session at a
/// bounded interval: active/stale/disconnected transitions plus retained-
/// mailbox expiry.
///
/// Sweep errors are logged and retried with capped exponential backoff; they
/// never terminate sessions. The loop itself only stops at shutdown.
pub fn spawn_heartbeat_task(sessions: Arc<SessionManager>, interval_secs: u64) {
    tokio::spawn(async move {
        let ctx = OpContext::background();
        let interval = std::time::Duration::from_secs(interval_secs.max(1));
        let mut backoff_secs = 1u64;

        loop {
            tokio::time::sleep(interval).await;
            match sessions.tick(&ctx, Utc::now()) {
                Ok(()) => {
                    backoff_secs = 1;
                }
                Err(e) => {
                    error!("heartbeat sweep failed: {e} (retrying in {backoff_secs}s)");
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(30);
                }
            }
        }
    });
}
