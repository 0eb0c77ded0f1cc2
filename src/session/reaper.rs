use super::connector::Connector;
use super::pool::CursorPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Background task that periodically evicts idle sessions from a pool.
///
/// The task only holds a weak reference to the pool and exits on its own
/// once the pool is dropped; [`ReaperHandle::stop`] ends it deterministically.
pub struct ReaperHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn spawn<C: Connector>(pool: &Arc<CursorPool<C>>, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let stopped = token.clone();
        let weak = Arc::downgrade(pool);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(pool) = weak.upgrade() else { break };
                let evicted = pool.reap_idle().await;
                if evicted > 0 {
                    info!("Reaper evicted {} idle sessions ({} active)", evicted, pool.session_count());
                }
            }
            debug!("Session reaper stopped");
        });

        debug!("Session reaper started (interval {:?})", interval);
        ReaperHandle { token, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task and wait for it to exit
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            debug!("Session reaper ended abnormally: {}", e);
        }
    }
}
