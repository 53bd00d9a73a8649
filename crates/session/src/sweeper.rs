//! Background expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::SessionStore;

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Periodically remove expired sessions from `store`.
///
/// The first sweep runs one `interval` after spawning. The task exits when
/// `shutdown` is cancelled or [`SweeperHandle::shutdown`] is called.
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> SweeperHandle {
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() fires immediately; skip that tick
        ticker.tick().await;

        info!(interval_secs = interval.as_secs(), "Session sweeper started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = store.sweep_expired().await;
                    debug!(reaped, "Sweep tick");
                }
            }
        }
        info!("Session sweeper stopped");
    });

    SweeperHandle { shutdown, handle }
}
