/**
 * NTCB AUTHORITY - Registration service and fleet registry
 *
 * ROLE: accepts registrations over HTTP, keeps the registry of live
 * components and joins the bus like any other component (Enter, Stat,
 * Log, Exit). Never registers with itself.
 *
 * STARTUP: config -> header -> registry reset (disable all, insert self)
 * -> bind HTTP -> join bus -> monitor + ticker -> serve until signal.
 */

mod http;
mod registry;
mod ticker;

use crate::http::AppState;
use crate::registry::{presence_routes, spawn_registry_monitor, JsonFileStore, Registry, SharedRegistry};
use crate::ticker::spawn_ticker;

use anyhow::{Context, Result};
use ntcb_core::header::ComponentHeader;
use ntcb_core::lifecycle::{exit_code_for, join_fleet, leave_fleet};
use ntcb_core::{load_config, logging, ComponentKind};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "authority.yaml";

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[authority] {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run() -> Result<()> {
    let mut cfg = load_config(DEFAULT_CONFIG).await.context("loading configuration")?;
    cfg.ntcb.default_component_id("AuthServer");
    if cfg.ntcb.access_key.is_empty() {
        warn!("[authority] no access key configured, every registration will be refused");
    }

    let header = ComponentHeader::build(&cfg).context("building component header")?;

    let registry: SharedRegistry = if cfg.authority.registry_file.is_empty() {
        info!("[authority] no registry file configured, keeping the registry in memory");
        Arc::new(Registry::in_memory())
    } else {
        let store = Box::new(JsonFileStore::new(&cfg.authority.registry_file));
        Arc::new(Registry::open(store).await.context("opening registry")?)
    };
    registry.reset_and_insert_self(&header).await.context("resetting registry")?;

    // bound before joining so components never see an Enter without /reg
    let listener = TcpListener::bind(&cfg.authority.listen)
        .await
        .with_context(|| format!("listening on {}", cfg.authority.listen))?;

    let fleet = join_fleet(&cfg, header, ComponentKind::Service, |ctx| presence_routes(registry.clone(), ctx))
        .await
        .context("joining the fleet")?;
    let ctx = fleet.ctx.clone();

    spawn_registry_monitor(registry.clone(), &ctx, Duration::from_secs(cfg.authority.stale_after_secs));
    spawn_ticker(&ctx, Duration::from_secs(cfg.authority.ticker_secs));

    let app = http::build_router(AppState::new(registry, ctx.clone(), fleet.health()));
    let stop = ctx.shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).with_graceful_shutdown(stop.cancelled_owned()).await
    });
    info!("[authority] listening on http://{}", cfg.authority.listen);

    fleet.serve().await;
    ctx.request_shutdown();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("[authority] http server failed: {e}"),
        Err(e) => error!("[authority] http task panicked: {e}"),
    }
    leave_fleet(fleet).await;
    Ok(())
}
