//! Fleet clock: a `Tick` on `ntcb/Ticker` every `tickerSecs`.

use chrono::Utc;
use ntcb_core::bus::publish_json;
use ntcb_core::lifecycle::ComponentContext;
use ntcb_core::messages::Tick;
use ntcb_core::topics;
use std::time::Duration;
use tracing::{info, warn};

/// Starts the ticker on the context's worker pool. A zero period disables it.
pub fn spawn_ticker(ctx: &ComponentContext, period: Duration) {
    if period.is_zero() {
        info!("ticker disabled");
        return;
    }
    let publisher = ctx.publisher.clone();
    let publisher_id = ctx.header.publisher_id.clone();
    let cancel = ctx.shutdown.child_token();

    ctx.tasks.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    seq += 1;
                    let tick = Tick { publisher_id: publisher_id.clone(), tick_time: Utc::now(), seq };
                    if let Err(e) = publish_json(publisher.as_ref(), topics::TICKER, &tick).await {
                        warn!("tick {seq} not published: {e}");
                    }
                }
            }
        }
    });
}
