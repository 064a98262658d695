//! Wire payloads exchanged over the bus.
//!
//! Field names are the interoperability contract with peers written in other
//! languages, hence the explicit `rename`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::header::ComponentHeader;

/// Periodic health report published on `ntcb/Stat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStat {
    #[serde(rename = "componentID")]
    pub component_id: String,
    #[serde(rename = "snowID")]
    pub snow_id: i64,
    #[serde(rename = "statCode")]
    pub stat_code: String,
    #[serde(rename = "statMessage")]
    pub stat_message: String,
    #[serde(rename = "statTime")]
    pub stat_time: DateTime<Utc>,
}

impl ComponentStat {
    pub fn healthy(header: &ComponentHeader) -> Self {
        Self {
            component_id: header.component_id.clone(),
            snow_id: header.snow_id,
            stat_code: "200".into(),
            stat_message: String::new(),
            stat_time: Utc::now(),
        }
    }
}

/// Component category carried in [`ComponentLog::log_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Service,
    Daemon,
    Bot,
}

/// Structured log event published on `ntcb/Log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentLog {
    #[serde(rename = "componentID")]
    pub component_id: String,
    #[serde(rename = "snowID")]
    pub snow_id: i64,
    #[serde(rename = "logTime")]
    pub log_time: DateTime<Utc>,
    pub category: String,
    #[serde(rename = "type")]
    pub log_type: ComponentKind,
    #[serde(rename = "logMessage")]
    pub log_message: String,
}

impl ComponentLog {
    pub fn new(header: &ComponentHeader, kind: ComponentKind, category: &str, message: impl Into<String>) -> Self {
        Self {
            component_id: header.component_id.clone(),
            snow_id: header.snow_id,
            log_time: Utc::now(),
            category: category.to_string(),
            log_type: kind,
            log_message: message.into(),
        }
    }
}

/// Actions a daemon understands. Anything else decodes to `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DaemonCommandKey {
    StartBot,
    Unknown(String),
}

impl From<String> for DaemonCommandKey {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "daemon_start_bot" => Self::StartBot,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<DaemonCommandKey> for String {
    fn from(key: DaemonCommandKey) -> Self {
        match key {
            DaemonCommandKey::StartBot => "daemon_start_bot".into(),
            DaemonCommandKey::Unknown(raw) => raw,
        }
    }
}

/// Actions a bot understands. Anything else decodes to `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BotCommandKey {
    StartJob,
    Unknown(String),
}

impl From<String> for BotCommandKey {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "bot_start_job" => Self::StartJob,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<BotCommandKey> for String {
    fn from(key: BotCommandKey) -> Self {
        match key {
            BotCommandKey::StartJob => "bot_start_job".into(),
            BotCommandKey::Unknown(raw) => raw,
        }
    }
}

/// Instruction for one daemon, broadcast on `ntcb/Daemon`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonCommand {
    #[serde(rename = "publisherID", default)]
    pub publisher_id: String,
    #[serde(rename = "publishTime", default = "Utc::now")]
    pub publish_time: DateTime<Utc>,
    #[serde(rename = "commandID", default)]
    pub command_id: String,
    #[serde(rename = "daemonSnowID")]
    pub daemon_snow_id: i64,
    #[serde(rename = "commandKey")]
    pub command_key: DaemonCommandKey,
    #[serde(rename = "botID", default)]
    pub bot_id: String,
    #[serde(rename = "commandString", default)]
    pub command_string: String,
    #[serde(rename = "commandArguments", default)]
    pub command_arguments: String,
}

/// Instruction for one bot, published on its private topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotCommand {
    #[serde(rename = "publisherID", default)]
    pub publisher_id: String,
    #[serde(rename = "publishTime", default = "Utc::now")]
    pub publish_time: DateTime<Utc>,
    #[serde(rename = "commandID", default)]
    pub command_id: String,
    #[serde(rename = "botSnowID", default)]
    pub bot_snow_id: i64,
    #[serde(rename = "commandKey")]
    pub command_key: BotCommandKey,
    #[serde(rename = "jobArguments", default)]
    pub job_arguments: String,
}

/// Reply correlated to a command by `commandID`.
///
/// Daemon and bot receipts share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReceipt {
    #[serde(rename = "commandID")]
    pub command_id: String,
    #[serde(rename = "snowID", default)]
    pub snow_id: i64,
    #[serde(rename = "publishTime")]
    pub publish_time: DateTime<Utc>,
    pub code: i32,
    pub message: String,
}

pub type DaemonCommandReceipt = CommandReceipt;
pub type BotCommandReceipt = CommandReceipt;

impl CommandReceipt {
    pub fn new(command_id: &str, snow_id: i64, code: i32, message: impl Into<String>) -> Self {
        Self {
            command_id: command_id.to_string(),
            snow_id,
            publish_time: Utc::now(),
            code,
            message: message.into(),
        }
    }
}

/// JobStart / JobDone notice published by a bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotJobNotice {
    #[serde(rename = "componentID")]
    pub component_id: String,
    #[serde(rename = "snowID")]
    pub snow_id: i64,
    #[serde(rename = "commandID")]
    pub command_id: String,
    #[serde(rename = "jobName")]
    pub job_name: String,
    #[serde(rename = "noticeTime")]
    pub notice_time: DateTime<Utc>,
    pub code: i32,
    pub message: String,
}

/// Clock tick broadcast on `ntcb/Ticker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    #[serde(rename = "publisherID")]
    pub publisher_id: String,
    #[serde(rename = "tickTime")]
    pub tick_time: DateTime<Utc>,
    pub seq: u64,
}

/// Operator notice broadcast on `ntcb/Notice`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(rename = "publisherID")]
    pub publisher_id: String,
    #[serde(rename = "publishTime")]
    pub publish_time: DateTime<Utc>,
    #[serde(rename = "noticeID")]
    pub notice_id: String,
    pub title: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_command_decodes() {
        let json = r#"{"daemonSnowID":42,"commandKey":"daemon_start_bot","commandString":"botdolly","commandArguments":""}"#;
        let cmd: DaemonCommand = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.daemon_snow_id, 42);
        assert_eq!(cmd.command_key, DaemonCommandKey::StartBot);
        assert_eq!(cmd.command_string, "botdolly");
        assert!(cmd.command_id.is_empty());
    }

    #[test]
    fn test_unknown_keys_are_preserved() {
        let json = r#"{"daemonSnowID":1,"commandKey":"daemon_reboot"}"#;
        let cmd: DaemonCommand = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.command_key, DaemonCommandKey::Unknown("daemon_reboot".into()));
        let back = serde_json::to_value(&cmd).unwrap();
        assert_eq!(back["commandKey"], "daemon_reboot");

        let bot: BotCommand = serde_json::from_str(r#"{"commandKey":"bot_dance"}"#).unwrap();
        assert_eq!(bot.command_key, BotCommandKey::Unknown("bot_dance".into()));
    }

    #[test]
    fn test_log_type_field() {
        let mut cfg = crate::config::ComponentConfig::default();
        cfg.ntcb.component_id = "BotDaemon".into();
        let header = ComponentHeader::build(&cfg).unwrap();
        let log = ComponentLog::new(&header, ComponentKind::Daemon, "lifecycle", "started");
        let value = serde_json::to_value(&log).unwrap();
        assert_eq!(value["type"], "daemon");
        assert_eq!(value["componentID"], "BotDaemon");
        assert_eq!(value["logMessage"], "started");
    }

    #[test]
    fn test_receipt_fields() {
        let receipt = CommandReceipt::new("c-1", 42, 200, "ok");
        let value = serde_json::to_value(&receipt).unwrap();
        assert_eq!(value["commandID"], "c-1");
        assert_eq!(value["code"], 200);
        assert!(value.get("publishTime").is_some());
    }
}
