//! Redis-backed [`Broker`] implementation. Regular commands (`PUBLISH`/`GET`/`SET`/
//! `DEL`) go through a `deadpool`-managed pool of [`redis::aio::MultiplexedConnection`]s,
//! mirroring the teacher's `ChannelPool`/`managed::Manager` pattern over `lapin`.
//! Subscriptions open a dedicated connection each, since a Redis pub/sub connection
//! can't multiplex with regular commands -- matching `spec.md` §5's "each publisher and
//! subscriber owns a broker connection."

use std::collections::HashMap;
use std::ops::DerefMut;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed;
use futures::FutureExt;
use futures::StreamExt;
use tracing::{instrument, warn};

use super::{Broker, BrokerError, Subscription};
use crate::broker_spec::BrokerSpec;
use crate::util::OnError;

/// Default health-check interval, used when `REDIS_HEALTH_INTERVAL` is unset.
const DEFAULT_HEALTH_INTERVAL_S: u64 = 30;

/// Process-wide registry of Redis brokers, keyed by port, so publishers and
/// subscribers that share a [`BrokerSpec`] reuse one connection pool rather than
/// opening a fresh one each.
fn registry() -> &'static Mutex<HashMap<u16, Arc<RedisBroker>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u16, Arc<RedisBroker>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A Redis-backed broker connection, pooled by `broker_spec.port()`.
#[derive(Debug)]
pub struct RedisBroker {
    client: redis::Client,
    pool: managed::Pool<ConnectionManager>,
}

impl RedisBroker {
    /// Connect to (or reuse a pooled connection to) the broker described by
    /// `broker_spec`. Hostname resolution follows `broker_spec.resolved_hostname()`
    /// (`REDIS_HOST`, default `localhost`); health-check cadence follows
    /// `REDIS_HEALTH_INTERVAL` (default 30 s).
    ///
    /// # Errors
    /// Returns [`BrokerError::Connection`] if the client or pool cannot be built.
    #[instrument(skip_all, fields(port = broker_spec.port()))]
    pub async fn connect(broker_spec: &BrokerSpec) -> Result<Arc<Self>, BrokerError> {
        if let Some(existing) = registry()
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(&broker_spec.port())
        {
            return Ok(existing.clone());
        }

        let url = format!(
            "redis://{}:{}/",
            broker_spec.resolved_hostname(),
            broker_spec.port()
        );
        let client = redis::Client::open(url.as_str())
            .map_err(|err| BrokerError::Connection(err.into()))?;
        let pool = managed::Pool::builder(ConnectionManager {
            client: client.clone(),
        })
        .build()
        .map_err(|err| BrokerError::Connection(anyhow::anyhow!(err)))?;

        let broker = Arc::new(Self { client, pool });
        spawn_health_check(Arc::downgrade(&broker), health_interval());

        registry()
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(broker_spec.port(), broker.clone());
        Ok(broker)
    }

    /// Borrow a pooled connection for one regular command.
    async fn conn(&self) -> Result<managed::Object<ConnectionManager>, BrokerError> {
        self.pool
            .get()
            .await
            .map_err(|err| BrokerError::Connection(anyhow::anyhow!(err.to_string())))
            .on_err(|err| warn!("failed to check out redis connection: {err}"))
    }
}

/// `REDIS_HEALTH_INTERVAL`, seconds, default 30.
fn health_interval() -> Duration {
    let secs = std::env::var("REDIS_HEALTH_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_HEALTH_INTERVAL_S);
    Duration::from_secs(secs)
}

/// Periodically pings the pool so dead connections are recycled before a caller trips
/// over them, matching `spec.md`'s `REDIS_HEALTH_INTERVAL` cadence.
fn spawn_health_check(broker: std::sync::Weak<RedisBroker>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(broker) = broker.upgrade() else {
                return;
            };
            if let Err(err) = broker.conn().await {
                warn!("redis health check failed: {err}");
            }
        }
    });
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(conn.deref_mut())
            .await
            .map_err(|err| BrokerError::Operation(err.into()))
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|err| BrokerError::Subscribe(err.into()))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(|err| BrokerError::Subscribe(err.into()))?;
        Ok(Box::new(RedisSubscription { pubsub }))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(conn.deref_mut())
            .await
            .map_err(|err| BrokerError::Operation(err.into()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(conn.deref_mut())
            .await
            .map_err(|err| BrokerError::Operation(err.into()))
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(conn.deref_mut())
            .await
            .map_err(|err| BrokerError::Operation(err.into()))
    }
}

/// One subscriber's dedicated pub/sub connection.
struct RedisSubscription {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn try_recv(&mut self) -> Result<Option<Vec<u8>>, BrokerError> {
        // `on_message` only ever yields data deliveries (redis-rs handles
        // subscribe/unsubscribe acks internally), satisfying the "distinguish data
        // from subscription-meta events" requirement without extra filtering here.
        match self.pubsub.on_message().next().now_or_never() {
            Some(Some(msg)) => Ok(Some(msg.get_payload_bytes().to_vec())),
            Some(None) | None => Ok(None),
        }
    }
}

/// Wraps [`redis::Client`] to implement [`managed::Manager`] over a
/// [`redis::aio::MultiplexedConnection`], mirroring the teacher's `ChannelManager`.
#[derive(Debug, Clone)]
struct ConnectionManager {
    client: redis::Client,
}

#[async_trait]
impl managed::Manager for ConnectionManager {
    type Type = redis::aio::MultiplexedConnection;
    type Error = redis::RedisError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
    ) -> Result<(), managed::RecycleError<Self::Error>> {
        redis::cmd("PING")
            .query_async::<_, ()>(conn)
            .await
            .map_err(managed::RecycleError::Backend)
    }
}
