//! Bus client: one MQTT session per process.
//!
//! ```text
//!   connect() ──► poll until first ConnAck ──(retries exhausted)──► BrokerUnreachable
//!        │
//!        ▼
//!   delivery loop (spawned) ──► Publish ──► routes ──► handler(Inbound)
//!        │  ConnAck ──► re-issue every subscription
//!        │  error   ──► backoff sleep, retry forever
//!        ▼
//!   disconnect(drain) ──► DISCONNECT queued behind in-flight publishes
//! ```
//!
//! Delivery is at-most-once (QoS 0). Publishes are never buffered locally:
//! if the request queue is full the publish fails immediately.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, NtcbConf};
use crate::header::{ComponentHeader, PublicHeader};
use crate::messages::{ComponentLog, ComponentStat};
use crate::topics;

const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("broker unreachable after {attempts} attempts: {reason}")]
    BrokerUnreachable { attempts: u32, reason: String },
    #[error("bus client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("bus client is closed")]
    Closed,
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Outbound half of the bus, the seam every dispatcher and scheduler uses.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool) -> Result<(), BusError>;
}

/// Session-level half of the bus: what the lifecycle needs besides
/// publishing.
#[async_trait]
pub trait BusLink: Publisher {
    fn health(&self) -> BusHealth;

    async fn disconnect(&self, drain: Duration);
}

/// One message received from the bus.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Inbound {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self { topic: topic.into(), payload: payload.into() }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Called once per matching message, on the delivery loop. Must return
/// quickly: long work belongs on a spawned task.
pub type Handler = Arc<dyn Fn(Inbound) + Send + Sync>;

#[derive(Default)]
struct Routes {
    entries: RwLock<Vec<(String, Handler)>>,
}

impl Routes {
    fn add(&self, filter: &str, handler: Handler) {
        self.entries.write().push((filter.to_string(), handler));
    }

    fn filters(&self) -> Vec<String> {
        self.entries.read().iter().map(|(f, _)| f.clone()).collect()
    }

    fn dispatch(&self, msg: Inbound) {
        let matching: Vec<Handler> = self
            .entries
            .read()
            .iter()
            .filter(|(filter, _)| topics::matches(&msg.topic, filter))
            .map(|(_, handler)| handler.clone())
            .collect();
        if matching.is_empty() {
            debug!("no handler for {}", msg.topic);
        }
        for handler in matching {
            handler(msg.clone());
        }
    }
}

/// Connection state shared with whoever reports health.
#[derive(Clone, Default)]
pub struct BusHealth {
    connected: Arc<AtomicBool>,
    reconnects: Arc<AtomicU32>,
}

impl BusHealth {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.mark_disconnected();
    }
}

/// Exponential retry delay: `first × 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub first: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn next(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.first.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct BusOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub keep_alive: Duration,
    pub connect_retries: u32,
    pub backoff: Backoff,
}

impl BusOptions {
    pub fn from_config(header: &ComponentHeader, cfg: &NtcbConf) -> Result<Self, ConfigError> {
        let (host, port) = cfg.broker_addr()?;
        Ok(Self {
            client_id: header.client_id(),
            host,
            port,
            user: cfg.broker_user.clone(),
            password: cfg.broker_password.clone(),
            keep_alive: Duration::from_secs(cfg.keep_alive.max(5)),
            connect_retries: cfg.connect_retries.max(1),
            backoff: Backoff { first: Duration::from_secs(1), max: cfg.max_reconnect_interval() },
        })
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if !self.user.is_empty() {
            opts.set_credentials(&self.user, &self.password);
        }
        opts
    }
}

pub struct BusClient {
    client: AsyncClient,
    routes: Arc<Routes>,
    health: BusHealth,
    accepting: AtomicBool,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Opens the session. Only the first connection can fail: once a ConnAck
    /// has been seen, losses are retried forever in the background.
    pub async fn connect(opts: BusOptions) -> Result<Arc<Self>, BusError> {
        let (client, mut eventloop) = AsyncClient::new(opts.mqtt_options(), REQUEST_CAPACITY);
        let health = BusHealth::default();

        let mut attempt = 0u32;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => {
                    attempt += 1;
                    warn!(
                        "broker {}:{} connection attempt {attempt}/{} failed: {e}",
                        opts.host, opts.port, opts.connect_retries
                    );
                    if attempt >= opts.connect_retries {
                        return Err(BusError::BrokerUnreachable { attempts: attempt, reason: e.to_string() });
                    }
                    tokio::time::sleep(opts.backoff.next(attempt - 1)).await;
                }
            }
        }
        health.mark_connected();
        info!("connected to broker {}:{} as {}", opts.host, opts.port, opts.client_id);

        let routes = Arc::new(Routes::default());
        let handle = tokio::spawn(delivery_loop(
            eventloop,
            client.clone(),
            routes.clone(),
            health.clone(),
            opts.backoff,
        ));

        Ok(Arc::new(Self {
            client,
            routes,
            health,
            accepting: AtomicBool::new(true),
            delivery: Mutex::new(Some(handle)),
        }))
    }

    /// Registers `handler` for `filter` and subscribes on the broker. The
    /// subscription is re-issued after every reconnect.
    pub async fn subscribe(&self, filter: &str, handler: Handler) -> Result<(), BusError> {
        self.routes.add(filter, handler);
        self.client.subscribe(filter, QoS::AtMostOnce).await?;
        debug!("subscribed to {filter}");
        Ok(())
    }

    pub fn health(&self) -> BusHealth {
        self.health.clone()
    }

    /// Stops accepting publishes, queues a DISCONNECT behind whatever is in
    /// flight and gives the delivery loop `drain` to flush it.
    pub async fn disconnect(&self, drain: Duration) {
        self.accepting.store(false, Ordering::SeqCst);

        match tokio::time::timeout(drain, self.client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("disconnect request failed: {e}"),
            Err(_) => warn!("disconnect request not queued within {drain:?}"),
        }

        let handle = self.delivery.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(drain, &mut handle).await.is_err() {
                warn!("drain window of {drain:?} elapsed, closing bus session");
                handle.abort();
            }
        }
        self.health.mark_disconnected();
        info!("bus session closed");
    }
}

#[async_trait]
impl Publisher for BusClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool) -> Result<(), BusError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.client.try_publish(topic, QoS::AtMostOnce, retained, payload)?;
        Ok(())
    }
}

#[async_trait]
impl BusLink for BusClient {
    fn health(&self) -> BusHealth {
        BusClient::health(self)
    }

    async fn disconnect(&self, drain: Duration) {
        BusClient::disconnect(self, drain).await
    }
}

async fn delivery_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    routes: Arc<Routes>,
    health: BusHealth,
    backoff: Backoff,
) {
    let mut failures = 0u32;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                routes.dispatch(Inbound::new(p.topic.clone(), p.payload.to_vec()));
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                if failures > 0 {
                    info!("reconnected to broker after {failures} failed attempts");
                }
                failures = 0;
                health.mark_connected();
                for filter in routes.filters() {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                        error!("resubscribe to {filter} failed: {e}");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect sent, delivery loop finished");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if failures == 0 {
                    health.increment_reconnects();
                }
                let delay = backoff.next(failures);
                failures = failures.saturating_add(1);
                warn!("bus connection lost ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
    health.mark_disconnected();
}

/// Serialises `value` and publishes it non-retained.
pub async fn publish_json<P, T>(bus: &P, topic: &str, value: &T) -> Result<(), BusError>
where
    P: Publisher + ?Sized,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    bus.publish(topic, payload, false).await
}

pub async fn announce_enter<P: Publisher + ?Sized>(bus: &P, header: &PublicHeader) -> Result<(), BusError> {
    publish_json(bus, topics::ENTER, header).await
}

pub async fn announce_exit<P: Publisher + ?Sized>(bus: &P, header: &PublicHeader) -> Result<(), BusError> {
    publish_json(bus, topics::EXIT, header).await
}

pub async fn publish_stat<P: Publisher + ?Sized>(bus: &P, stat: &ComponentStat) -> Result<(), BusError> {
    publish_json(bus, topics::STAT, stat).await
}

/// Best effort: a failed log publish is only reported locally.
pub async fn publish_log<P: Publisher + ?Sized>(bus: &P, log: &ComponentLog) {
    if let Err(e) = publish_json(bus, topics::LOG, log).await {
        warn!("failed to publish log event '{}': {e}", log.log_message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_backoff_grows_to_cap() {
        let backoff = Backoff { first: Duration::from_secs(1), max: Duration::from_secs(10) };
        assert_eq!(backoff.next(0), Duration::from_secs(1));
        assert_eq!(backoff.next(1), Duration::from_secs(2));
        assert_eq!(backoff.next(3), Duration::from_secs(8));
        assert_eq!(backoff.next(4), Duration::from_secs(10));
        assert_eq!(backoff.next(500), Duration::from_secs(10));
    }

    #[test]
    fn test_routes_dispatch_matching_handlers_only() {
        let routes = Routes::default();
        let daemon_hits = Arc::new(AtomicUsize::new(0));
        let all_hits = Arc::new(AtomicUsize::new(0));

        let d = daemon_hits.clone();
        routes.add(topics::DAEMON, Arc::new(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        }));
        let a = all_hits.clone();
        routes.add("ntcb/#", Arc::new(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        }));

        routes.dispatch(Inbound::new(topics::DAEMON, b"{}".to_vec()));
        routes.dispatch(Inbound::new(topics::DAEMON_RECEIPT, b"{}".to_vec()));
        routes.dispatch(Inbound::new("other/topic", b"{}".to_vec()));

        assert_eq!(daemon_hits.load(Ordering::SeqCst), 1);
        assert_eq!(all_hits.load(Ordering::SeqCst), 2);
        assert_eq!(routes.filters(), vec![topics::DAEMON.to_string(), "ntcb/#".to_string()]);
    }

    #[test]
    fn test_options_from_config() {
        let mut cfg = crate::config::ComponentConfig::default();
        cfg.ntcb.component_id = "BotDaemon".into();
        cfg.ntcb.broker = "tcp://broker.local:1999".into();
        cfg.ntcb.reconnect_duration = 30;
        let header = ComponentHeader::build(&cfg).unwrap();
        let opts = BusOptions::from_config(&header, &cfg.ntcb).unwrap();
        assert_eq!(opts.host, "broker.local");
        assert_eq!(opts.port, 1999);
        assert_eq!(opts.client_id, header.client_id());
        assert_eq!(opts.backoff.max, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_fails_when_broker_unreachable() {
        let opts = BusOptions {
            client_id: "test_127.0.0.1_1".into(),
            host: "127.0.0.1".into(),
            // reserved port, nothing listens there
            port: 1,
            user: String::new(),
            password: String::new(),
            keep_alive: Duration::from_secs(5),
            connect_retries: 2,
            backoff: Backoff { first: Duration::from_millis(10), max: Duration::from_millis(20) },
        };
        match BusClient::connect(opts).await {
            Err(BusError::BrokerUnreachable { attempts, .. }) => assert_eq!(attempts, 2),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect should fail without a broker"),
        }
    }
}
