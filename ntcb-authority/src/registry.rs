/**
 * FLEET REGISTRY - Registered components and their liveness
 *
 * ROLE: one row per successful registration, persisted through a pluggable
 * store. Every mutation is serialised behind one async mutex and committed
 * only if the store accepts the new snapshot.
 *
 * LIVENESS: rows stay enabled while their component keeps reporting. A Stat
 * or Enter refreshes `lastSeen`, an Exit disables the row, and the monitor
 * disables rows silent for longer than the configured TTL.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ntcb_core::bus::{Handler, Inbound};
use ntcb_core::header::{ComponentHeader, PublicHeader};
use ntcb_core::lifecycle::ComponentContext;
use ntcb_core::messages::ComponentStat;
use ntcb_core::topics;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(rename = "rowID")]
    pub row_id: u64,
    /// Stored redacted: the registry never holds a real access key.
    #[serde(flatten)]
    pub header: ComponentHeader,
    #[serde(rename = "registeredAt")]
    pub registered_at: DateTime<Utc>,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn is_enabled(&self) -> bool {
        self.header.comp_enabled != 0
    }

    fn disable(&mut self) {
        self.header.comp_enabled = 0;
    }
}

/// Persistence collaborator behind the registry.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load(&self) -> Result<Vec<RegistryEntry>, RegistryError>;
    async fn save(&self, rows: &[RegistryEntry]) -> Result<(), RegistryError>;
}

/// Volatile store, used in tests and when no registry file is configured.
#[derive(Default)]
pub struct MemoryStore {
    rows: parking_lot::Mutex<Vec<RegistryEntry>>,
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn load(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self.rows.lock().clone())
    }

    async fn save(&self, rows: &[RegistryEntry]) -> Result<(), RegistryError> {
        *self.rows.lock() = rows.to_vec();
        Ok(())
    }
}

/// Whole-file JSON store, rewritten on every change.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RegistryStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        if !self.path.exists() {
            info!("no registry file at {:?}, starting fresh", self.path);
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, rows: &[RegistryEntry]) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(rows)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

pub struct Registry {
    rows: Mutex<Vec<RegistryEntry>>,
    store: Box<dyn RegistryStore>,
}

pub type SharedRegistry = Arc<Registry>;

impl Registry {
    pub async fn open(store: Box<dyn RegistryStore>) -> Result<Self, RegistryError> {
        let rows = store.load().await?;
        info!("registry loaded with {} rows", rows.len());
        Ok(Self { rows: Mutex::new(rows), store })
    }

    pub fn in_memory() -> Self {
        Self { rows: Mutex::new(Vec::new()), store: Box::new(MemoryStore::default()) }
    }

    /// Applies `change` to a copy of the rows and commits it only if the
    /// store accepts the result.
    async fn mutate<T>(&self, change: impl FnOnce(&mut Vec<RegistryEntry>) -> T) -> Result<T, RegistryError> {
        let mut rows = self.rows.lock().await;
        let mut next = rows.clone();
        let out = change(&mut next);
        if next != *rows {
            self.store.save(&next).await?;
            *rows = next;
        }
        Ok(out)
    }

    /// Authority startup: disable every enabled row, then insert our own
    /// header as the only live entry. Returns how many rows were disabled.
    pub async fn reset_and_insert_self(&self, own: &ComponentHeader) -> Result<usize, RegistryError> {
        let own = stored_form(own);
        let disabled = self
            .mutate(|rows| {
                let mut disabled = 0;
                for row in rows.iter_mut().filter(|r| r.is_enabled()) {
                    row.disable();
                    disabled += 1;
                }
                push_row(rows, own);
                disabled
            })
            .await?;
        info!("registry reset: {disabled} stale rows disabled");
        Ok(disabled)
    }

    /// Adds an enabled row for `header`. Additive: rows of other
    /// registrations are left untouched.
    pub async fn register(&self, header: &ComponentHeader) -> Result<RegistryEntry, RegistryError> {
        let header = stored_form(header);
        self.mutate(|rows| push_row(rows, header)).await
    }

    pub async fn list(&self, enabled_only: bool) -> Vec<RegistryEntry> {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|r| !enabled_only || r.is_enabled())
            .cloned()
            .collect()
    }

    /// `(total rows, enabled rows)`.
    pub async fn counts(&self) -> (usize, usize) {
        let rows = self.rows.lock().await;
        (rows.len(), rows.iter().filter(|r| r.is_enabled()).count())
    }

    /// Refreshes `lastSeen` of the enabled rows for `snow_id`.
    pub async fn touch(&self, snow_id: i64, at: DateTime<Utc>) -> Result<usize, RegistryError> {
        self.mutate(|rows| {
            let mut touched = 0;
            for row in rows.iter_mut().filter(|r| r.is_enabled() && r.header.snow_id == snow_id) {
                row.last_seen = at;
                touched += 1;
            }
            touched
        })
        .await
    }

    pub async fn disable_snow(&self, snow_id: i64) -> Result<usize, RegistryError> {
        self.mutate(|rows| {
            let mut disabled = 0;
            for row in rows.iter_mut().filter(|r| r.is_enabled() && r.header.snow_id == snow_id) {
                row.disable();
                disabled += 1;
            }
            disabled
        })
        .await
    }

    /// Disables enabled rows whose `lastSeen` is older than `cutoff`.
    pub async fn disable_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, RegistryError> {
        self.mutate(|rows| {
            let mut disabled = 0;
            for row in rows.iter_mut().filter(|r| r.is_enabled() && r.last_seen < cutoff) {
                info!(
                    "disabling stale row {} ({} snowID {}, last seen {})",
                    row.row_id, row.header.component_id, row.header.snow_id, row.last_seen
                );
                row.disable();
                disabled += 1;
            }
            disabled
        })
        .await
    }
}

fn stored_form(header: &ComponentHeader) -> ComponentHeader {
    let mut stored = header.public().into_inner();
    stored.comp_enabled = 1;
    stored
}

fn push_row(rows: &mut Vec<RegistryEntry>, header: ComponentHeader) -> RegistryEntry {
    let now = Utc::now();
    let row_id = rows.iter().map(|r| r.row_id).max().unwrap_or(0) + 1;
    let entry = RegistryEntry { row_id, header, registered_at: now, last_seen: now };
    rows.push(entry.clone());
    entry
}

/// Periodically disables rows silent for longer than `stale_after`.
pub fn spawn_registry_monitor(registry: SharedRegistry, ctx: &ComponentContext, stale_after: Duration) {
    info!("starting registry monitoring (stale after {}s)", stale_after.as_secs());
    let cancel = ctx.shutdown.child_token();
    let Ok(ttl) = chrono::Duration::from_std(stale_after) else {
        warn!("stale_after {stale_after:?} out of range, registry monitoring disabled");
        return;
    };

    ctx.tasks.spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    match registry.disable_stale(Utc::now() - ttl).await {
                        Ok(0) => {}
                        Ok(n) => info!("registry monitor disabled {n} stale rows"),
                        Err(e) => error!("registry monitor failed: {e}"),
                    }
                }
            }
        }
    });
}

/// Handlers keeping row liveness in step with Enter / Stat / Exit traffic.
pub fn presence_routes(registry: SharedRegistry, ctx: &ComponentContext) -> Vec<(String, Handler)> {
    let touch_on_stat: Handler = {
        let registry = registry.clone();
        let tasks = ctx.tasks.clone();
        Arc::new(move |msg: Inbound| match msg.json::<ComponentStat>() {
            Ok(stat) => {
                let registry = registry.clone();
                tasks.spawn(async move {
                    if let Err(e) = registry.touch(stat.snow_id, stat.stat_time).await {
                        error!("failed to record stat of {}: {e}", stat.snow_id);
                    }
                });
            }
            Err(e) => warn!("invalid stat payload: {e}"),
        })
    };

    let touch_on_enter: Handler = {
        let registry = registry.clone();
        let tasks = ctx.tasks.clone();
        Arc::new(move |msg: Inbound| match msg.json::<PublicHeader>() {
            Ok(public) => {
                let registry = registry.clone();
                let snow_id = public.header().snow_id;
                debug!("{} entered (snowID {snow_id})", public.header().component_id);
                tasks.spawn(async move {
                    if let Err(e) = registry.touch(snow_id, Utc::now()).await {
                        error!("failed to record enter of {snow_id}: {e}");
                    }
                });
            }
            Err(e) => warn!("invalid enter payload: {e}"),
        })
    };

    let disable_on_exit: Handler = {
        let tasks = ctx.tasks.clone();
        Arc::new(move |msg: Inbound| match msg.json::<PublicHeader>() {
            Ok(public) => {
                let registry = registry.clone();
                let snow_id = public.header().snow_id;
                info!("{} exited (snowID {snow_id})", public.header().component_id);
                tasks.spawn(async move {
                    if let Err(e) = registry.disable_snow(snow_id).await {
                        error!("failed to disable exited {snow_id}: {e}");
                    }
                });
            }
            Err(e) => warn!("invalid exit payload: {e}"),
        })
    };

    vec![
        (topics::STAT.to_string(), touch_on_stat),
        (topics::ENTER.to_string(), touch_on_enter),
        (topics::EXIT.to_string(), disable_on_exit),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntcb_core::config::ComponentConfig;
    use ntcb_core::messages::ComponentKind;
    use ntcb_devkit::TestHarness;

    fn header(component: &str, node: i64) -> ComponentHeader {
        let mut cfg = ComponentConfig::default();
        cfg.server_id = node;
        cfg.ntcb.component_id = component.into();
        cfg.ntcb.access_key = "secret1".into();
        ComponentHeader::build(&cfg).unwrap()
    }

    #[tokio::test]
    async fn test_register_is_additive_and_redacted() {
        let registry = Registry::in_memory();
        let first = registry.register(&header("BotDolly", 2)).await.unwrap();
        let second = registry.register(&header("BotDolly", 2)).await.unwrap();

        assert_eq!(first.row_id, 1);
        assert_eq!(second.row_id, 2);
        assert_eq!(registry.counts().await, (2, 2));
        for row in registry.list(false).await {
            assert_eq!(row.header.access_key, "hidden");
        }
    }

    #[tokio::test]
    async fn test_reset_disables_all_then_inserts_self() {
        let registry = Registry::in_memory();
        registry.register(&header("BotDolly", 2)).await.unwrap();
        registry.register(&header("BotDaemon", 1)).await.unwrap();

        let own = header("AuthServer", 0);
        let disabled = registry.reset_and_insert_self(&own).await.unwrap();

        assert_eq!(disabled, 2);
        let enabled = registry.list(true).await;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].header.snow_id, own.snow_id);
    }

    #[tokio::test]
    async fn test_liveness_transitions() {
        let registry = Registry::in_memory();
        let bot = header("BotDolly", 2);
        let row = registry.register(&bot).await.unwrap();

        let later = row.last_seen + chrono::Duration::seconds(30);
        assert_eq!(registry.touch(bot.snow_id, later).await.unwrap(), 1);
        assert_eq!(registry.list(true).await[0].last_seen, later);

        // cutoff after lastSeen disables the row
        let cutoff = later + chrono::Duration::seconds(1);
        assert_eq!(registry.disable_stale(cutoff).await.unwrap(), 1);
        assert_eq!(registry.counts().await, (1, 0));

        // disabled rows are no longer touched
        assert_eq!(registry.touch(bot.snow_id, Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exit_disables_matching_rows_only() {
        let registry = Registry::in_memory();
        let bot = header("BotDolly", 2);
        let daemon = header("BotDaemon", 1);
        registry.register(&bot).await.unwrap();
        registry.register(&daemon).await.unwrap();

        assert_eq!(registry.disable_snow(bot.snow_id).await.unwrap(), 1);
        let enabled = registry.list(true).await;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].header.component_id, "BotDaemon");
    }

    #[tokio::test]
    async fn test_json_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.json");
        {
            let registry = Registry::open(Box::new(JsonFileStore::new(&path))).await.unwrap();
            registry.register(&header("BotDolly", 2)).await.unwrap();
        }
        let reopened = Registry::open(Box::new(JsonFileStore::new(&path))).await.unwrap();
        let rows = reopened.list(true).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].header.component_id, "BotDolly");

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"rowID\""));
        assert!(raw.contains("\"compEnabled\": 1"));
        assert!(!raw.contains("secret1"));
    }

    struct FailingStore;

    #[async_trait]
    impl RegistryStore for FailingStore {
        async fn load(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
            Ok(Vec::new())
        }
        async fn save(&self, _rows: &[RegistryEntry]) -> Result<(), RegistryError> {
            Err(RegistryError::Io(std::io::Error::other("disk full")))
        }
    }

    #[tokio::test]
    async fn test_failed_save_leaves_registry_unchanged() {
        let registry = Registry::open(Box::new(FailingStore)).await.unwrap();
        assert!(registry.register(&header("BotDolly", 2)).await.is_err());
        assert_eq!(registry.counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_presence_handlers_follow_exit() {
        let harness = TestHarness::new(ComponentKind::Service, "AuthServer");
        let registry: SharedRegistry = Arc::new(Registry::in_memory());
        let bot = header("BotDolly", 2);
        registry.register(&bot).await.unwrap();

        let routes = presence_routes(registry.clone(), &harness.ctx);
        let exit = routes.iter().find(|(t, _)| t == topics::EXIT).map(|(_, h)| h.clone()).unwrap();
        let payload = serde_json::to_vec(&bot.public()).unwrap();
        exit(Inbound::new(topics::EXIT, payload));

        harness.ctx.tasks.close();
        harness.ctx.tasks.wait().await;
        assert_eq!(registry.counts().await, (1, 0));
    }
}
