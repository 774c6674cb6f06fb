use super::lua_scripts::SLIDING_LOG_SCRIPT;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Failure talking to the shared store. Never leaves the limiter.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Shared store did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Shared store is not connected")]
    NotConnected,

    #[error("{0}")]
    Other(String),
}

/// A store that can coordinate sliding-log counts across processes.
///
/// `hit` must perform trim, insert, count and expiry as one atomic step.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Establish (or re-establish) the connection
    async fn connect(&self) -> Result<(), BackendError>;

    /// Record a request at `now_ms` and return how many requests the key has
    /// seen within `[now_ms - window_ms, now_ms]`
    async fn hit(&self, key: &str, window_ms: u64, now_ms: u64) -> Result<u64, BackendError>;

    /// Release the connection
    async fn close(&self);
}

/// Redis-backed sliding-log store
pub struct RedisStore {
    client: redis::Client,
    connection: RwLock<Option<ConnectionManager>>,
    script: Script,
}

impl RedisStore {
    /// Parse the URL. No network traffic happens until [`SharedStore::connect`].
    pub fn new(redis_url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis_url)?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            script: Script::new(SLIDING_LOG_SCRIPT),
        })
    }

    #[cfg(test)]
    async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn connect(&self) -> Result<(), BackendError> {
        let mut connection = ConnectionManager::new(self.client.clone()).await?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut connection)
            .await?;

        *self.connection.write().await = Some(connection);
        info!("Connected to Redis");
        Ok(())
    }

    async fn hit(&self, key: &str, window_ms: u64, now_ms: u64) -> Result<u64, BackendError> {
        let mut connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(BackendError::NotConnected)?;

        let cutoff = format!("({}", now_ms.saturating_sub(window_ms));
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        let count = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(cutoff)
            .arg(member)
            .invoke_async::<_, i64>(&mut connection)
            .await?;

        debug!("Sliding log check for key {}: count={}", key, count);

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn close(&self) {
        if self.connection.write().await.take().is_some() {
            info!("Redis connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            RedisStore::new("not a url"),
            Err(BackendError::Redis(_))
        ));
    }

    #[tokio::test]
    async fn test_hit_before_connect_fails() {
        let store = RedisStore::new("redis://127.0.0.1:6379").unwrap();
        assert!(!store.is_connected().await);

        let result = store.hit("rl:test", 1_000, 1_000).await;
        assert!(matches!(result, Err(BackendError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let store = RedisStore::new("redis://127.0.0.1:1").unwrap();
        let result = tokio::time::timeout(Duration::from_secs(30), store.connect()).await;

        // Either the manager gives up or we do; it never connects
        assert!(!matches!(result, Ok(Ok(()))));
        assert!(!store.is_connected().await);
    }

    // These tests require a running Redis instance
    // They are ignored by default. Run with: cargo test -- --ignored

    async fn connected_store() -> RedisStore {
        let store = RedisStore::new("redis://127.0.0.1:6379").unwrap();
        store.connect().await.expect("Failed to connect to Redis");
        store
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_sliding_log_counts() {
        let store = connected_store().await;
        let key = format!("rl:test:{}", Uuid::new_v4());

        for expected in 1..=3 {
            let count = store.hit(&key, 1_000, 10_000 + expected).await.unwrap();
            assert_eq!(count, expected);
        }

        store.close().await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_sliding_log_drops_stale_entries() {
        let store = connected_store().await;
        let key = format!("rl:test:{}", Uuid::new_v4());

        store.hit(&key, 1_000, 10_000).await.unwrap();
        store.hit(&key, 1_000, 10_500).await.unwrap();

        // 10_000 is now older than the window, 10_500 is not
        let count = store.hit(&key, 1_000, 11_200).await.unwrap();
        assert_eq!(count, 2);

        store.close().await;
        assert!(!store.is_connected().await);
    }
}
