//! Bot jobs.
//!
//! A job is the unit of work a bot runs on `bot_start_job`. It receives the
//! component context, the command's `jobArguments` and a cancellation token
//! that fires on process shutdown.

use async_trait::async_trait;
use ntcb_core::lifecycle::ComponentContext;
use ntcb_core::topics;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Runs to completion. The `Ok` text becomes the JobDone message.
    async fn run(&self, ctx: &ComponentContext, arguments: &str, cancel: CancellationToken) -> Result<String, JobError>;
}

pub const DOLLY_BRAY: &str = "Mie Mie, I am dolly";

/// Sample job: brays on the bot's output topic a few times.
pub struct DollyJob {
    pub brays: u32,
    pub interval: Duration,
}

impl DollyJob {
    pub fn new(brays: u32, interval: Duration) -> Self {
        Self { brays, interval }
    }
}

#[async_trait]
impl Job for DollyJob {
    fn name(&self) -> &str {
        "dolly"
    }

    async fn run(&self, ctx: &ComponentContext, _arguments: &str, cancel: CancellationToken) -> Result<String, JobError> {
        let topic = topics::bot_output(ctx.snow_id());
        for i in 0..self.brays {
            if let Err(e) = ctx.publisher.publish(&topic, DOLLY_BRAY.as_bytes().to_vec(), false).await {
                warn!("bray {i} lost: {e}");
            }
            info!("Dolly braying... {i}");

            if i + 1 < self.brays {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(JobError::Cancelled(format!("stopped after {} bray(s)", i + 1))),
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }
        Ok(format!("dolly brayed {} time(s)", self.brays))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntcb_core::messages::ComponentKind;
    use ntcb_devkit::TestHarness;

    #[tokio::test]
    async fn test_dolly_brays_on_output_topic() {
        let harness = TestHarness::with_snow_id(ComponentKind::Bot, "BotDolly", 7);
        let job = DollyJob::new(3, Duration::from_millis(5));

        let done = job.run(&harness.ctx, "", CancellationToken::new()).await.unwrap();

        assert_eq!(done, "dolly brayed 3 time(s)");
        let brays = harness.bus.find_messages_by_topic("ntcb/Bot/7/Output");
        assert_eq!(brays.len(), 3);
        assert!(brays.iter().all(|m| m.text() == DOLLY_BRAY));
    }

    #[tokio::test]
    async fn test_dolly_stops_when_cancelled() {
        let harness = TestHarness::new(ComponentKind::Bot, "BotDolly");
        let job = DollyJob::new(5, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = job.run(&harness.ctx, "", cancel).await.unwrap_err();

        assert!(matches!(err, JobError::Cancelled(_)));
        assert_eq!(harness.bus.count(&topics::bot_output(harness.snow_id())), 1);
    }
}
