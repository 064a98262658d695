//! NTCB daemon - launches bot processes on behalf of operators
//!
//! Registers with the authority, joins the bus and listens on `ntcb/Daemon`
//! for `daemon_start_bot` commands addressed to its own snowID.

mod execution;

use anyhow::{Context, Result};
use execution::dispatch;
use ntcb_core::bus::{Handler, Inbound};
use ntcb_core::header::ComponentHeader;
use ntcb_core::lifecycle::{exit_code_for, join_fleet, leave_fleet, register_component, ComponentContext};
use ntcb_core::messages::DaemonCommand;
use ntcb_core::{load_config, logging, topics, ComponentKind};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "daemon.yaml";

fn command_route(ctx: &ComponentContext) -> Vec<(String, Handler)> {
    let ctx = ctx.clone();
    let on_command: Handler = Arc::new(move |msg: Inbound| match msg.json::<DaemonCommand>() {
        Ok(cmd) => {
            dispatch(&ctx, cmd);
        }
        Err(e) => warn!("undecodable daemon command on {}: {e}", msg.topic),
    });
    vec![(topics::DAEMON.to_string(), on_command)]
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[daemon] {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run() -> Result<()> {
    let mut cfg = load_config(DEFAULT_CONFIG).await.context("loading configuration")?;
    cfg.ntcb.default_component_id("BotDaemon");

    let header = ComponentHeader::build(&cfg).context("building component header")?;
    info!("[daemon] {} starting with snowID {}", header.component_id, header.snow_id);

    register_component(&cfg, &header).await.context("registering with the authority")?;
    let fleet = join_fleet(&cfg, header, ComponentKind::Daemon, command_route)
        .await
        .context("joining the fleet")?;

    fleet.serve().await;
    leave_fleet(fleet).await;
    Ok(())
}
