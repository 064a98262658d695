//! Command execution for the daemon
//!
//! - Filters broadcast daemon commands down to the ones addressed to us
//! - Launches bot processes off the delivery loop
//! - Reports every launch attempt with a receipt on `ntcb/Daemon/Receipt`

use ntcb_core::bus::publish_json;
use ntcb_core::lifecycle::ComponentContext;
use ntcb_core::messages::{DaemonCommand, DaemonCommandKey, DaemonCommandReceipt};
use ntcb_core::topics;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Environment handed to every launched bot.
pub const BOT_ID_ENV: &str = "NTCB_BOT_ID";
pub const DAEMON_SNOW_ID_ENV: &str = "NTCB_DAEMON_SNOW_ID";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("bad command arguments: {0}")]
    BadArguments(#[from] shell_words::ParseError),
    #[error("empty command string")]
    EmptyCommand,
    #[error("spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Receipt code reported back to the command originator.
    pub fn receipt_code(&self) -> i32 {
        match self {
            SpawnError::BadArguments(_) | SpawnError::EmptyCommand => 400,
            SpawnError::Io(_) => 500,
        }
    }
}

/// What the dispatcher did with one inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Not ours, or a key we do not understand. No receipt.
    Ignored,
    Dispatched,
}

/// Builds the bot process for `cmd` without starting it.
pub fn build_command(cmd: &DaemonCommand, daemon_snow_id: i64) -> Result<Command, SpawnError> {
    let program = cmd.command_string.trim();
    if program.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    let args = shell_words::split(&cmd.command_arguments)?;

    let mut command = Command::new(program);
    command
        .args(&args)
        .env(BOT_ID_ENV, &cmd.bot_id)
        .env(DAEMON_SNOW_ID_ENV, daemon_snow_id.to_string())
        .stdin(Stdio::null())
        // the bot must outlive a daemon restart
        .kill_on_drop(false);
    Ok(command)
}

pub fn spawn_bot(cmd: &DaemonCommand, daemon_snow_id: i64) -> Result<Child, SpawnError> {
    Ok(build_command(cmd, daemon_snow_id)?.spawn()?)
}

/// Routes one decoded command. Work is spawned on the context's worker pool;
/// the delivery loop never blocks on a launch.
pub fn dispatch(ctx: &ComponentContext, cmd: DaemonCommand) -> Dispatch {
    if cmd.daemon_snow_id != ctx.snow_id() {
        debug!("command {} addressed to daemon {}, ignored", cmd.command_id, cmd.daemon_snow_id);
        return Dispatch::Ignored;
    }

    if let DaemonCommandKey::Unknown(key) = &cmd.command_key {
        warn!("unknown daemon command key '{key}' in command {}", cmd.command_id);
        return Dispatch::Ignored;
    }

    let worker = ctx.clone();
    ctx.tasks.spawn(async move { start_bot(worker, cmd).await });
    Dispatch::Dispatched
}

async fn start_bot(ctx: ComponentContext, cmd: DaemonCommand) {
    let snow_id = ctx.snow_id();
    let (child, receipt) = match spawn_bot(&cmd, snow_id) {
        Ok(child) => {
            let pid = child.id().unwrap_or_default();
            info!("bot '{}' started as pid {pid} ({} {})", cmd.bot_id, cmd.command_string, cmd.command_arguments);
            ctx.log("command", format!("bot {} started (pid {pid})", cmd.bot_id)).await;
            (Some(child), DaemonCommandReceipt::new(&cmd.command_id, snow_id, 200, format!("bot started (pid {pid})")))
        }
        Err(e) => {
            error!("failed to start bot '{}' with '{}': {e}", cmd.bot_id, cmd.command_string);
            ctx.log("command", format!("bot {} failed to start: {e}", cmd.bot_id)).await;
            (None, DaemonCommandReceipt::new(&cmd.command_id, snow_id, e.receipt_code(), e.to_string()))
        }
    };

    if let Err(e) = publish_json(ctx.publisher.as_ref(), topics::DAEMON_RECEIPT, &receipt).await {
        warn!("receipt for command {} not delivered: {e}", cmd.command_id);
    }

    if let Some(child) = child {
        wait_for_bot(&ctx, child, &cmd.bot_id).await;
    }
}

/// Reaps the child. Shutdown stops the wait; the bot keeps running.
async fn wait_for_bot(ctx: &ComponentContext, mut child: Child, bot_id: &str) {
    let pid = child.id().unwrap_or_default();
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!("bot '{bot_id}' (pid {pid}) exited with {status}"),
            Err(e) => warn!("lost track of bot '{bot_id}' (pid {pid}): {e}"),
        },
        _ = ctx.shutdown.cancelled() => {
            info!("daemon stopping, leaving bot '{bot_id}' (pid {pid}) running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntcb_core::messages::ComponentKind;
    use ntcb_devkit::TestHarness;
    use std::time::Duration;

    fn command(daemon: i64, key: &str, program: &str, args: &str) -> DaemonCommand {
        serde_json::from_value(serde_json::json!({
            "publisherID": "operator",
            "commandID": "cmd-1",
            "daemonSnowID": daemon,
            "commandKey": key,
            "botID": "BotDolly",
            "commandString": program,
            "commandArguments": args,
        }))
        .unwrap()
    }

    async fn settle(harness: &TestHarness) {
        harness.ctx.tasks.close();
        let _ = tokio::time::timeout(Duration::from_secs(5), harness.ctx.tasks.wait()).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_bot_for_us_sends_success_receipt() {
        let harness = TestHarness::with_snow_id(ComponentKind::Daemon, "BotDaemon", 42);

        let outcome = dispatch(&harness.ctx, command(42, "daemon_start_bot", "true", ""));
        assert_eq!(outcome, Dispatch::Dispatched);
        settle(&harness).await;

        let receipts: Vec<DaemonCommandReceipt> = harness.bus.json_messages(topics::DAEMON_RECEIPT).unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].code, 200);
        assert_eq!(receipts[0].command_id, "cmd-1");
        assert_eq!(receipts[0].snow_id, 42);
        assert!(receipts[0].message.starts_with("bot started (pid "));
    }

    #[tokio::test]
    async fn test_command_for_other_daemon_is_ignored() {
        let harness = TestHarness::with_snow_id(ComponentKind::Daemon, "BotDaemon", 42);

        let outcome = dispatch(&harness.ctx, command(99, "daemon_start_bot", "true", ""));
        assert_eq!(outcome, Dispatch::Ignored);
        settle(&harness).await;

        assert!(harness.bus.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_key_is_ignored() {
        let harness = TestHarness::with_snow_id(ComponentKind::Daemon, "BotDaemon", 42);

        let outcome = dispatch(&harness.ctx, command(42, "daemon_reboot", "true", ""));
        assert_eq!(outcome, Dispatch::Ignored);
        settle(&harness).await;

        assert_eq!(harness.bus.count(topics::DAEMON_RECEIPT), 0);
    }

    #[tokio::test]
    async fn test_missing_binary_reports_spawn_failure() {
        let harness = TestHarness::with_snow_id(ComponentKind::Daemon, "BotDaemon", 42);

        dispatch(&harness.ctx, command(42, "daemon_start_bot", "/nonexistent/ntcb-bot-binary", ""));
        settle(&harness).await;

        let receipt: DaemonCommandReceipt = harness.bus.get_last_json_message(topics::DAEMON_RECEIPT).unwrap().unwrap();
        assert_eq!(receipt.code, 500);
        assert!(receipt.message.starts_with("spawn failed"));
    }

    #[tokio::test]
    async fn test_unbalanced_quotes_are_bad_arguments() {
        let harness = TestHarness::with_snow_id(ComponentKind::Daemon, "BotDaemon", 42);

        dispatch(&harness.ctx, command(42, "daemon_start_bot", "true", "--name 'unterminated"));
        settle(&harness).await;

        let receipt: DaemonCommandReceipt = harness.bus.get_last_json_message(topics::DAEMON_RECEIPT).unwrap().unwrap();
        assert_eq!(receipt.code, 400);
    }

    #[test]
    fn test_build_command_splits_arguments() {
        let cmd = command(42, "daemon_start_bot", "botdolly", r#"--config "my bot.yaml" -v"#);
        let built = build_command(&cmd, 42).unwrap();
        let args: Vec<_> = built.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["--config", "my bot.yaml", "-v"]);

        let env = |name: &str| {
            built
                .as_std()
                .get_envs()
                .find(|(k, _)| *k == name)
                .and_then(|(_, v)| v.map(|v| v.to_string_lossy().into_owned()))
        };
        assert_eq!(env(BOT_ID_ENV).as_deref(), Some("BotDolly"));
        assert_eq!(env(DAEMON_SNOW_ID_ENV).as_deref(), Some("42"));
    }

    #[test]
    fn test_empty_command_string_is_rejected() {
        let cmd = command(42, "daemon_start_bot", "  ", "");
        assert!(matches!(build_command(&cmd, 42), Err(SpawnError::EmptyCommand)));
    }
}
