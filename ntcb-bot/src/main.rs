//! NTCB bot - the Dolly sample bot
//!
//! Registers, joins the bus, listens on `ntcb/Bot/{snowID}` for
//! `bot_start_job` and runs the Dolly job. `bot.autoRun` starts a job at
//! boot; `bot.autoShutdown` stops the process after the first job.

mod job;
mod runner;

use anyhow::{Context, Result};
use job::DollyJob;
use ntcb_core::header::ComponentHeader;
use ntcb_core::lifecycle::{exit_code_for, join_fleet, leave_fleet, register_component};
use ntcb_core::{load_config, logging, ComponentKind};
use runner::{command_route, JobRequest, JobRunner};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "bot.yaml";

/// Set by the daemon that launched us.
const BOT_ID_ENV: &str = "NTCB_BOT_ID";
const DAEMON_SNOW_ID_ENV: &str = "NTCB_DAEMON_SNOW_ID";

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[bot] {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run() -> Result<()> {
    let mut cfg = load_config(DEFAULT_CONFIG).await.context("loading configuration")?;
    if let Ok(bot_id) = std::env::var(BOT_ID_ENV) {
        if !bot_id.is_empty() {
            cfg.ntcb.component_id = bot_id;
        }
    }
    cfg.ntcb.default_component_id("BotDolly");
    if let Ok(daemon) = std::env::var(DAEMON_SNOW_ID_ENV) {
        info!("[bot] launched by daemon {daemon}");
    }

    let header = ComponentHeader::build(&cfg).context("building component header")?;
    info!("[bot] {} starting with snowID {}", header.component_id, header.snow_id);

    register_component(&cfg, &header).await.context("registering with the authority")?;

    let job = Arc::new(DollyJob::new(cfg.bot.brays_per_job, Duration::from_millis(cfg.bot.bray_interval_ms)));
    let mut runner_slot = None;
    let fleet = join_fleet(&cfg, header, ComponentKind::Bot, |ctx| {
        let runner = JobRunner::new(ctx.clone(), job, cfg.bot.busy_policy, cfg.bot.auto_shutdown);
        runner_slot = Some(runner.clone());
        vec![command_route(runner)]
    })
    .await
    .context("joining the fleet")?;

    if cfg.bot.auto_run {
        if let Some(runner) = &runner_slot {
            info!("[bot] auto-run enabled, starting job");
            runner.submit(JobRequest::autorun());
        }
    }

    fleet.serve().await;
    leave_fleet(fleet).await;
    Ok(())
}
