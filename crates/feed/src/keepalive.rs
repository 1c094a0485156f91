//! Periodic staleness sweep over the connection pool.

use crate::connection::{ConnCommand, ConnState};
use crate::service::FeedService;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Probe every open connection that has been idle past the staleness
/// threshold. Runs for the lifetime of the service; aborted at drain.
pub(crate) async fn sweep(service: FeedService) {
    let period = service.config().sweep_interval;
    let threshold = service.config().staleness_threshold.as_millis() as i64;

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let now = chrono::Utc::now().timestamp_millis();
        for (shared, command_tx) in service.connections() {
            if shared.state() != ConnState::Open {
                continue;
            }
            if now - shared.last_liveness() > threshold {
                debug!("[{}] probing stale upstream connection", shared.event_id());
                let _ = command_tx.try_send(ConnCommand::Probe);
            }
        }
    }
}
