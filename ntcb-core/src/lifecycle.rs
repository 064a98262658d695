//! Component lifecycle: join the fleet, serve, leave.
//!
//! ```text
//!  header ──► register ──► connect bus ──► subscribe ──► Enter + heartbeat
//!                                                            │
//!                          signal / shutdown request ◄───────┘
//!                                    │
//!          cancel workers ──► Log "stopped" ──► Exit ──► disconnect(drain)
//! ```
//!
//! [`ComponentContext`] is the single owned handle passed to every handler,
//! scheduler and worker of a process.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::bus::{announce_enter, announce_exit, publish_log, BusClient, BusError, BusHealth, BusLink, BusOptions, Handler, Publisher};
use crate::config::{ComponentConfig, ConfigError};
use crate::header::{ComponentHeader, PublicHeader};
use cron::Schedule;

use crate::heartbeat::{parse_schedule, spawn_heartbeat, ScheduleError};
use crate::identity::IdentityError;
use crate::messages::{ComponentKind, ComponentLog};
use crate::registration::{self, RegistrationError};
use crate::signals::wait_for_shutdown_signal;

/// Upper bound for in-flight workers to wind down after cancellation.
pub const WORKER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl JoinError {
    /// Process exit code for a failed startup.
    pub fn exit_code(&self) -> u8 {
        match self {
            JoinError::Identity(_) | JoinError::Schedule(_) => 2,
            JoinError::Registration(_) => 3,
            JoinError::Bus(_) => 4,
        }
    }
}

/// Exit code for a fatal error surfacing in a binary, looked up through any
/// `.context(...)` layers. Unclassified failures exit with 1.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(join) = err.downcast_ref::<JoinError>() {
        return join.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some()
        || err.downcast_ref::<IdentityError>().is_some()
        || err.downcast_ref::<ScheduleError>().is_some()
    {
        return 2;
    }
    1
}

#[derive(Clone)]
pub struct ComponentContext {
    pub header: Arc<ComponentHeader>,
    pub kind: ComponentKind,
    pub publisher: Arc<dyn Publisher>,
    /// Root token: cancelling it asks every worker to stop.
    pub shutdown: CancellationToken,
    /// Supervised pool for command work spawned off the delivery loop.
    pub tasks: TaskTracker,
}

impl ComponentContext {
    pub fn new(header: ComponentHeader, kind: ComponentKind, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            header: Arc::new(header),
            kind,
            publisher,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn snow_id(&self) -> i64 {
        self.header.snow_id
    }

    pub fn public_header(&self) -> PublicHeader {
        self.header.public()
    }

    /// Publishes a `ComponentLog` (best effort).
    pub async fn log(&self, category: &str, message: impl Into<String>) {
        let log = ComponentLog::new(&self.header, self.kind, category, message);
        publish_log(self.publisher.as_ref(), &log).await;
    }

    /// Same path a termination signal takes.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// A component that is connected to the bus.
pub struct Fleet {
    pub ctx: ComponentContext,
    link: Arc<dyn BusLink>,
    drain_window: Duration,
}

/// Registers with the authority. Any failure is fatal to the caller.
pub async fn register_component(cfg: &ComponentConfig, header: &ComponentHeader) -> Result<(), JoinError> {
    let resp = registration::register(&cfg.ntcb.auth_server, header, cfg.ntcb.register_timeout()).await?;
    info!("registered with authority: {} ({})", resp.message, resp.code);
    Ok(())
}

/// Connects, subscribes the handlers built by `routes`, announces Enter and
/// starts the heartbeat.
pub async fn join_fleet<F>(
    cfg: &ComponentConfig,
    header: ComponentHeader,
    kind: ComponentKind,
    routes: F,
) -> Result<Fleet, JoinError>
where
    F: FnOnce(&ComponentContext) -> Vec<(String, Handler)>,
{
    let schedule = parse_schedule(&cfg.ntcb.stat_cron_pattern)?;
    let opts = BusOptions::from_config(&header, &cfg.ntcb).map_err(BusError::from)?;
    let bus = BusClient::connect(opts).await?;

    let ctx = ComponentContext::new(header, kind, bus.clone());
    for (filter, handler) in routes(&ctx) {
        bus.subscribe(&filter, handler).await?;
    }

    let fleet = Fleet::new(ctx, bus, cfg.ntcb.drain_window());
    fleet.announce(schedule).await?;
    Ok(fleet)
}

impl Fleet {
    /// Wraps an already connected bus. `ctx.publisher` must publish on `link`.
    pub fn new(ctx: ComponentContext, link: Arc<dyn BusLink>, drain_window: Duration) -> Self {
        Self { ctx, link, drain_window }
    }

    pub fn health(&self) -> BusHealth {
        self.link.health()
    }

    /// Enter + Log "started", then the heartbeat.
    pub async fn announce(&self, schedule: Schedule) -> Result<(), BusError> {
        let ctx = &self.ctx;
        announce_enter(ctx.publisher.as_ref(), &ctx.public_header()).await?;
        ctx.log("lifecycle", format!("{} started", ctx.header.component_id)).await;
        spawn_heartbeat(&ctx.tasks, ctx.publisher.clone(), ctx.header.clone(), schedule, ctx.shutdown.child_token());

        info!("{} (snowID {}) joined the fleet", ctx.header.component_id, ctx.snow_id());
        Ok(())
    }

    /// Blocks until a termination signal arrives or the component asks to
    /// stop itself.
    pub async fn serve(&self) {
        tokio::select! {
            res = wait_for_shutdown_signal() => {
                if let Err(e) = res {
                    error!("signal listener failed: {e}");
                }
                info!("termination signal received");
            }
            _ = self.ctx.shutdown.cancelled() => {
                info!("shutdown requested by component");
            }
        }
    }

    /// Single cooperative shutdown pass.
    pub async fn leave(self) {
        let ctx = &self.ctx;
        ctx.shutdown.cancel();
        ctx.tasks.close();
        if tokio::time::timeout(WORKER_GRACE, ctx.tasks.wait()).await.is_err() {
            warn!("{} worker(s) still running after {WORKER_GRACE:?}", ctx.tasks.len());
        }

        ctx.log("lifecycle", format!("{} stopped", ctx.header.component_id)).await;
        if let Err(e) = announce_exit(ctx.publisher.as_ref(), &ctx.public_header()).await {
            warn!("failed to announce exit: {e}");
        }
        self.link.disconnect(self.drain_window).await;
        info!("{} exited", ctx.header.component_id);
    }
}

pub async fn leave_fleet(fleet: Fleet) {
    fleet.leave().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPublisher;
    use crate::topics;

    #[tokio::test]
    async fn test_context_log_is_tagged() {
        let mut cfg = ComponentConfig::default();
        cfg.ntcb.component_id = "BotDaemon".into();
        cfg.ntcb.access_key = "secret1".into();
        let recorder = Arc::new(RecordingPublisher::default());
        let ctx = ComponentContext::new(ComponentHeader::build(&cfg).unwrap(), ComponentKind::Daemon, recorder.clone());

        ctx.log("lifecycle", "hello").await;

        let logs = recorder.on_topic(topics::LOG);
        assert_eq!(logs.len(), 1);
        let log: ComponentLog = serde_json::from_slice(&logs[0]).unwrap();
        assert_eq!(log.log_type, ComponentKind::Daemon);
        assert_eq!(log.snow_id, ctx.snow_id());
        assert!(!String::from_utf8_lossy(&logs[0]).contains("secret1"));
    }

    #[tokio::test]
    async fn test_request_shutdown_cancels_children() {
        let ctx = ComponentContext::new(
            ComponentHeader::build(&ComponentConfig::default()).unwrap(),
            ComponentKind::Bot,
            Arc::new(RecordingPublisher::default()),
        );
        let child = ctx.shutdown.child_token();
        ctx.request_shutdown();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_exit_codes_through_context() {
        use anyhow::Context;
        let err = Err::<(), _>(JoinError::Bus(BusError::Closed)).context("joining").unwrap_err();
        assert_eq!(exit_code_for(&err), 4);
        let err = Err::<(), _>(IdentityError::InvalidNodeId(2000)).context("building header").unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
        assert_eq!(exit_code_for(&anyhow::anyhow!("bind failed")), 1);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(JoinError::Identity(IdentityError::InvalidNodeId(-1)).exit_code(), 2);
        assert_eq!(JoinError::Bus(BusError::Closed).exit_code(), 4);
        let reg = JoinError::Registration(RegistrationError::AccessDenied("register fail".into()));
        assert_eq!(reg.exit_code(), 3);
    }
}
