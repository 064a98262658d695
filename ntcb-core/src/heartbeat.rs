//! Heartbeat scheduler: a fresh [`ComponentStat`] on `ntcb/Stat` at every
//! cron fire. Publish failures are logged and the next fire tries again.

use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::{publish_stat, BusError, Publisher};
use crate::header::ComponentHeader;
use crate::messages::ComponentStat;

#[derive(Debug, thiserror::Error)]
#[error("invalid heartbeat cron pattern '{pattern}': {reason}")]
pub struct ScheduleError {
    pub pattern: String,
    pub reason: String,
}

/// Parses a 6-field cron expression (seconds first). A `#` in the seconds
/// field is read as `0`.
pub fn parse_schedule(pattern: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = pattern.trim();
    let normalized = match trimmed.strip_prefix('#') {
        Some(rest) => format!("0{rest}"),
        None => trimmed.to_string(),
    };
    Schedule::from_str(&normalized).map_err(|e| ScheduleError {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Publishes one stat report.
pub async fn beat(publisher: &dyn Publisher, header: &ComponentHeader) -> Result<(), BusError> {
    let stat = ComponentStat::healthy(header);
    publish_stat(publisher, &stat).await
}

/// Runs until `cancel` fires.
pub async fn run_heartbeat(
    publisher: Arc<dyn Publisher>,
    header: Arc<ComponentHeader>,
    schedule: Schedule,
    cancel: CancellationToken,
) {
    info!("heartbeat scheduler started");
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("heartbeat schedule has no upcoming fire, stopping");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("heartbeat scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {
                match beat(publisher.as_ref(), &header).await {
                    Ok(()) => debug!("stat published for snowID {}", header.snow_id),
                    Err(e) => warn!("stat publish failed, will retry next tick: {e}"),
                }
            }
        }
    }
}

pub fn spawn_heartbeat(
    tracker: &TaskTracker,
    publisher: Arc<dyn Publisher>,
    header: Arc<ComponentHeader>,
    schedule: Schedule,
    cancel: CancellationToken,
) {
    tracker.spawn(run_heartbeat(publisher, header, schedule, cancel));
}
