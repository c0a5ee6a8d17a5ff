//! Periodic housekeeping: heartbeats, idle-connection reaping, and
//! stuck-workflow detection.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::server::api::SharedState;

const TICK: Duration = Duration::from_secs(30);
const STUCK_THRESHOLD_MINUTES: i64 = 30;

/// Spawn the supervisor loop. The server aborts the returned handle on
/// shutdown; nothing in the loop holds resources across ticks.
pub fn spawn_supervisor(state: SharedState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK);
        // The first tick completes immediately; consume it so real work
        // starts one period in.
        interval.tick().await;

        loop {
            interval.tick().await;

            let reaped = state.connections.reap_idle();
            if reaped > 0 {
                info!(reaped, "cleaned up stale connections");
            }

            state.connections.heartbeat();

            match state
                .db
                .call(|db| db.detect_stuck(STUCK_THRESHOLD_MINUTES, None))
                .await
            {
                Ok(count) if count > 0 => info!(count, "detected stuck workflows"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "stuck-workflow scan failed"),
            }
        }
    })
}
