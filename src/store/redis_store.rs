//! Redis-backed counter store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{RedisResult, Script, Value};
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{ttl_secs, CounterStore, StoreError};
use crate::config::StoreConfig;

/// Increments a counter and arms its expiry in the same round trip, so a
/// crash between the two commands can never leave an immortal counter.
const INCREMENT_WITH_TTL: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// A counter store backed by a single Redis deployment.
///
/// The connection is established lazily on first use and then shared by all
/// callers. `ConnectionManager` multiplexes concurrent commands over one
/// socket and reconnects after a broken pipe, so no further pooling is
/// needed. A failed first connection is not cached; the next call tries
/// again.
pub struct RedisCounterStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    increment_script: Script,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RedisCounterStore {
    /// Create a store for the configured Redis URL without connecting.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            increment_script: Script::new(INCREMENT_WITH_TTL),
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        })
    }

    /// Whether the shared connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let addr = self.client.get_connection_info().addr.to_string();
                debug!(addr = %addr, "Connecting to Redis");

                // Retries belong to the rate limit engine; the manager only
                // gets one attempt per call.
                let manager_config = ConnectionManagerConfig::new()
                    .set_number_of_retries(0)
                    .set_connection_timeout(self.connect_timeout)
                    .set_response_timeout(self.read_timeout);

                let connect =
                    ConnectionManager::new_with_config(self.client.clone(), manager_config);
                match timeout(self.connect_timeout, connect).await {
                    Ok(Ok(manager)) => {
                        info!(addr = %addr, "Redis connection established");
                        Ok(manager)
                    }
                    Ok(Err(e)) => {
                        warn!(addr = %addr, error = %e, "Failed to connect to Redis");
                        Err(StoreError::from(e))
                    }
                    Err(_) => {
                        warn!(addr = %addr, "Timed out connecting to Redis");
                        Err(StoreError::Timeout(self.connect_timeout))
                    }
                }
            })
            .await?;

        Ok(manager.clone())
    }

    /// Run one command against the shared connection, bounded by the write
    /// and read timeouts.
    async fn run<F, Fut>(&self, command: F) -> Result<Value, StoreError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<Value>>,
    {
        let conn = self.connection().await?;
        let bound = self.write_timeout + self.read_timeout;

        match timeout(bound, command(conn)).await {
            Ok(reply) => reply.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(bound)),
        }
    }
}

fn integer_reply(value: Value, command: &str) -> Result<i64, StoreError> {
    match value {
        Value::Int(n) => Ok(n),
        other => Err(StoreError::Conversion(format!(
            "{command} returned {other:?}, expected an integer"
        ))),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_with_ttl(
        &self,
        key: &str,
        ttl_if_first: Duration,
    ) -> Result<i64, StoreError> {
        let secs = ttl_secs(ttl_if_first);
        let reply = self
            .run(|mut conn| async move {
                self.increment_script
                    .key(key)
                    .arg(secs)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        let value = integer_reply(reply, "INCR")?;
        if value < 1 {
            return Err(StoreError::UnexpectedResponse(format!(
                "INCR on {key} returned {value}"
            )));
        }
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let reply = self
            .run(|mut conn| async move {
                redis::cmd("EXISTS").arg(key).query_async(&mut conn).await
            })
            .await?;

        match integer_reply(reply, "EXISTS")? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(StoreError::UnexpectedResponse(format!(
                "EXISTS on {key} returned {n}"
            ))),
        }
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let reply = self
            .run(|mut conn| async move {
                redis::cmd("PTTL").arg(key).query_async(&mut conn).await
            })
            .await?;

        match integer_reply(reply, "PTTL")? {
            -2 => Ok(None),
            -1 => Ok(Some(Duration::ZERO)),
            ms if ms >= 0 => Ok(Some(Duration::from_millis(ms as u64))),
            n => Err(StoreError::UnexpectedResponse(format!(
                "PTTL on {key} returned {n}"
            ))),
        }
    }

    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let secs = ttl_secs(ttl);
        let reply = self
            .run(|mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(1)
                    .arg("EX")
                    .arg(secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        match reply {
            Value::Okay => Ok(()),
            Value::SimpleString(ref s) if s == "OK" => Ok(()),
            other => Err(StoreError::UnexpectedResponse(format!(
                "SET on {key} returned {other:?}"
            ))),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn unreachable_config() -> StoreConfig {
        StoreConfig {
            // Port 1 is reserved and never has a Redis listening on it.
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout_ms: 200,
            read_timeout_ms: 200,
            write_timeout_ms: 200,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = StoreConfig {
            url: "not a url".to_string(),
            ..StoreConfig::default()
        };
        assert!(RedisCounterStore::new(&config).is_err());
    }

    #[test]
    fn test_creation_does_not_connect() {
        let store = RedisCounterStore::new(&unreachable_config()).unwrap();
        assert!(!store.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_store_surfaces_errors() {
        let store = RedisCounterStore::new(&unreachable_config()).unwrap();

        let err = store
            .increment_with_ttl("k", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unavailable(_) | StoreError::Timeout(_)
        ));
        assert!(store.exists("k").await.is_err());
        assert!(store.ping().await.is_err());
        assert!(!store.is_connected());
    }

    #[test]
    fn test_integer_reply() {
        assert_eq!(integer_reply(Value::Int(7), "INCR").unwrap(), 7);
        assert!(matches!(
            integer_reply(Value::Nil, "INCR"),
            Err(StoreError::Conversion(_))
        ));
    }

    fn live_store() -> RedisCounterStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let config = StoreConfig {
            url,
            ..StoreConfig::default()
        };
        RedisCounterStore::new(&config).unwrap()
    }

    fn scratch_key(name: &str) -> String {
        format!("gatekeeper-test:{{{}}}:{}", uuid::Uuid::new_v4(), name)
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn test_live_increment_sets_ttl_once() {
        let store = live_store();
        let key = scratch_key("rps");

        assert_eq!(store.increment_with_ttl(&key, Duration::from_secs(5)).await.unwrap(), 1);
        assert!(store.is_connected());
        let first = store.remaining_ttl(&key).await.unwrap().unwrap();
        assert!(first > Duration::ZERO && first <= Duration::from_secs(5));

        // Later increments neither reset nor extend the expiry.
        assert_eq!(store.increment_with_ttl(&key, Duration::from_secs(100)).await.unwrap(), 2);
        assert_eq!(store.increment_with_ttl(&key, Duration::from_secs(100)).await.unwrap(), 3);
        let later = store.remaining_ttl(&key).await.unwrap().unwrap();
        assert!(later <= Duration::from_secs(5), "ttl refreshed to {:?}", later);
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn test_live_set_overwrites_and_expires() {
        let store = live_store();
        let key = scratch_key("blocked");

        assert!(!store.exists(&key).await.unwrap());
        assert_eq!(store.remaining_ttl(&key).await.unwrap(), None);

        store.increment_with_ttl(&key, Duration::from_secs(60)).await.unwrap();
        store.increment_with_ttl(&key, Duration::from_secs(60)).await.unwrap();
        store.set_with_ttl(&key, Duration::from_secs(1)).await.unwrap();

        let mut conn = store.connection().await.unwrap();
        let value: i64 = redis::cmd("GET").arg(&key).query_async(&mut conn).await.unwrap();
        assert_eq!(value, 1);
        assert!(store.exists(&key).await.unwrap());
        assert!(store.remaining_ttl(&key).await.unwrap().unwrap() <= Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(!store.exists(&key).await.unwrap());
        assert_eq!(store.remaining_ttl(&key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn test_live_ping_and_persistent_key() {
        let store = live_store();
        store.ping().await.unwrap();

        let key = scratch_key("plain");
        let mut conn = store.connection().await.unwrap();
        let _: () = redis::cmd("SET").arg(&key).arg(1).query_async(&mut conn).await.unwrap();
        assert_eq!(store.remaining_ttl(&key).await.unwrap(), Some(Duration::ZERO));
        let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
    }
}
