//! Redis test infrastructure.
//!
//! Provides a `TestRedis` helper that creates a Redis container for testing
//! `pipeline-core`'s store client — TTL behavior, connection discipline,
//! and the event-log list commands.

use redis::aio::MultiplexedConnection;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup. The container is
/// automatically stopped and removed when this struct is dropped.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Creates a new test Redis instance using the 8-alpine image.
    pub async fn new() -> Self {
        let redis_image = Redis::default().with_tag("8-alpine");

        let container = redis_image
            .start()
            .await
            .expect("failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client = Client::open(connection_string.clone()).expect("failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("failed to connect to Redis");

        tracing::info!(port = host_port, "test Redis ready (8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.set::<_, _, ()>("test_key", "test_value").await.unwrap();
        let value: String = conn.get("test_key").await.unwrap();
        assert_eq!(value, "test_value");
    }

    #[tokio::test]
    async fn list_operations_for_event_log_semantics() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.lpush::<_, _, ()>("events:job-1", "e1").await.unwrap();
        conn.lpush::<_, _, ()>("events:job-1", "e2").await.unwrap();

        // LPUSH inserts at the head, so the list reads newest-first.
        let events: Vec<String> = conn.lrange("events:job-1", 0, -1).await.unwrap();
        assert_eq!(events, vec!["e2".to_string(), "e1".to_string()]);
    }

    #[tokio::test]
    async fn expiry_applies_ttl() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.set_ex::<_, _, ()>("expiring_key", "value", 1).await.unwrap();
        let exists: bool = conn.exists("expiring_key").await.unwrap();
        assert!(exists);

        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

        let exists: bool = conn.exists("expiring_key").await.unwrap();
        assert!(!exists);
    }
}
