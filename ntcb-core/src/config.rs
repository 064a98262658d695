//! Component configuration.
//!
//! Every binary reads one YAML file whose path comes from `NTCB_CONFIG`
//! (falling back to a per-binary default name). A missing file yields the
//! defaults below; a file that exists but does not parse is fatal.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const CONFIG_ENV: &str = "NTCB_CONFIG";
pub const ACCESS_KEY_ENV: &str = "NTCB_ACCESS_KEY";
pub const DEFAULT_STAT_CRON: &str = "0 */10 * * * *";
pub const DEFAULT_COMPONENT_ID: &str = "Component";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid broker address: {0}")]
    Broker(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Operator-assigned node slot (0..=1023) seeding the snowflake id.
    #[serde(rename = "serverID", default)]
    pub server_id: i64,
    #[serde(default)]
    pub ntcb: NtcbConf,
    #[serde(default)]
    pub authority: AuthorityConf,
    #[serde(default)]
    pub bot: BotConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NtcbConf {
    pub component_id: String,
    pub publisher_id: String,
    pub app_version: String,
    pub app_intro: String,
    pub app_author: String,
    pub access_key: String,
    /// Base URL of the Authority, `/reg` is appended.
    pub auth_server: String,
    /// `tcp://host:port`, `mqtt://host:port` or `host:port`.
    pub broker: String,
    pub broker_user: String,
    pub broker_password: String,
    /// Upper bound of the reconnect interval, in seconds.
    pub reconnect_duration: u64,
    pub keep_alive: u64,
    /// Attempts allowed for the very first broker connection.
    pub connect_retries: u32,
    /// Registration request timeout, in seconds.
    pub register_timeout: u64,
    pub drain_window_ms: u64,
    pub stat_cron_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthorityConf {
    pub listen: String,
    pub registry_file: String,
    pub stale_after_secs: u64,
    /// 0 disables the ticker.
    pub ticker_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Answer a `start_job` received while busy with a 409 receipt.
    Reject,
    /// Run it after the current job; the receipt follows its completion.
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotConf {
    pub auto_run: bool,
    pub auto_shutdown: bool,
    pub busy_policy: BusyPolicy,
    pub brays_per_job: u32,
    pub bray_interval_ms: u64,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            ntcb: NtcbConf::default(),
            authority: AuthorityConf::default(),
            bot: BotConf::default(),
        }
    }
}

impl Default for NtcbConf {
    fn default() -> Self {
        Self {
            component_id: DEFAULT_COMPONENT_ID.into(),
            publisher_id: "ntcb".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            app_intro: String::new(),
            app_author: String::new(),
            access_key: String::new(),
            auth_server: "http://127.0.0.1:8000".into(),
            broker: "tcp://127.0.0.1:1883".into(),
            broker_user: String::new(),
            broker_password: String::new(),
            reconnect_duration: 60,
            keep_alive: 15,
            connect_retries: 5,
            register_timeout: 10,
            drain_window_ms: 250,
            stat_cron_pattern: DEFAULT_STAT_CRON.into(),
        }
    }
}

impl Default for AuthorityConf {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".into(),
            registry_file: "./data/registry.json".into(),
            stale_after_secs: 1800,
            ticker_secs: 60,
        }
    }
}

impl Default for BotConf {
    fn default() -> Self {
        Self {
            auto_run: false,
            auto_shutdown: false,
            busy_policy: BusyPolicy::Reject,
            brays_per_job: 3,
            bray_interval_ms: 3000,
        }
    }
}

impl NtcbConf {
    /// Gives the component its role name when the config file left it out.
    pub fn default_component_id(&mut self, role: &str) {
        if self.component_id.is_empty() || self.component_id == DEFAULT_COMPONENT_ID {
            self.component_id = role.to_string();
        }
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout.max(1))
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_duration.max(1))
    }

    /// Splits `broker` into host and port, defaulting the port to 1883.
    pub fn broker_addr(&self) -> Result<(String, u16), ConfigError> {
        parse_broker(&self.broker)
    }
}

pub fn parse_broker(raw: &str) -> Result<(String, u16), ConfigError> {
    let trimmed = raw.trim();
    let rest = trimmed
        .strip_prefix("tcp://")
        .or_else(|| trimmed.strip_prefix("mqtt://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');
    if rest.is_empty() {
        return Err(ConfigError::Broker(raw.to_string()));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::Broker(raw.to_string()))?;
            if host.is_empty() {
                return Err(ConfigError::Broker(raw.to_string()));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), 1883)),
    }
}

/// Loads `.env`, then the YAML file named by `NTCB_CONFIG` or `default_file`.
pub async fn load_config(default_file: &str) -> Result<ComponentConfig, ConfigError> {
    dotenvy::dotenv().ok();
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| default_file.into());
    let mut cfg = load_from_path(&path).await?;
    if let Ok(key) = std::env::var(ACCESS_KEY_ENV) {
        if !key.is_empty() {
            cfg.ntcb.access_key = key;
        }
    }
    Ok(cfg)
}

pub async fn load_from_path(path: &str) -> Result<ComponentConfig, ConfigError> {
    if !Path::new(path).exists() {
        warn!("no {path} found, using default configuration");
        return Ok(ComponentConfig::default());
    }
    let txt = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: path.into(), source })?;
    parse_config(&txt).map_err(|source| ConfigError::Parse { path: path.into(), source })
}

pub fn parse_config(txt: &str) -> Result<ComponentConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(ComponentConfig::default());
    }
    serde_yaml::from_str(txt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r##"
serverID: 2
ntcb:
  componentId: BotDolly
  publisherId: dolly
  accessKey: secret1
  authServer: http://auth:8000
  broker: tcp://broker:1884
  statCronPattern: "# */10 * * * *"
bot:
  autoRun: true
  autoShutdown: true
  busyPolicy: queue
"##;
        let cfg = parse_config(yaml).unwrap();
        assert_eq!(cfg.server_id, 2);
        assert_eq!(cfg.ntcb.component_id, "BotDolly");
        assert_eq!(cfg.ntcb.access_key, "secret1");
        assert_eq!(cfg.ntcb.broker_addr().unwrap(), ("broker".to_string(), 1884));
        assert!(cfg.bot.auto_run && cfg.bot.auto_shutdown);
        assert_eq!(cfg.bot.busy_policy, BusyPolicy::Queue);
        // untouched sections keep their defaults
        assert_eq!(cfg.ntcb.keep_alive, 15);
        assert_eq!(cfg.authority.stale_after_secs, 1800);
    }

    #[test]
    fn test_empty_config_is_default() {
        let cfg = parse_config("  \n").unwrap();
        assert_eq!(cfg.ntcb.stat_cron_pattern, DEFAULT_STAT_CRON);
        assert_eq!(cfg.bot.busy_policy, BusyPolicy::Reject);
    }

    #[test]
    fn test_parse_broker_forms() {
        assert_eq!(parse_broker("tcp://10.0.0.5:1883").unwrap(), ("10.0.0.5".into(), 1883));
        assert_eq!(parse_broker("mqtt://broker").unwrap(), ("broker".into(), 1883));
        assert_eq!(parse_broker("localhost:2883").unwrap(), ("localhost".into(), 2883));
        assert!(parse_broker("tcp://").is_err());
        assert!(parse_broker("host:notaport").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_defaults() {
        let cfg = load_from_path("/definitely/not/here/ntcb.yaml").await.unwrap();
        assert_eq!(cfg.ntcb.connect_retries, 5);
    }

    #[tokio::test]
    async fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "serverID: [not, a, number]").unwrap();
        let err = load_from_path(path.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
