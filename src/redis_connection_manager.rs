use crate::retry::{connect_with_retry, RetryPolicy};
use mobc::{async_trait, Manager};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};

pub struct RedisConnectionManager {
    client: Client,
    retry: RetryPolicy,
}

#[async_trait]
impl Manager for RedisConnectionManager {
    type Connection = MultiplexedConnection;
    type Error = RedisError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        connect_with_retry(&self.client, &self.retry).await
    }

    async fn check(&self, mut conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(conn)
    }
}

impl RedisConnectionManager {
    pub fn initialize_with(redis_url: &str, retry: RetryPolicy) -> Result<Self, RedisError> {
        Ok(RedisConnectionManager {
            client: Client::open(redis_url)?,
            retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_malformed_urls() {
        assert!(RedisConnectionManager::initialize_with("not a url", RetryPolicy::no_retry()).is_err());
        assert!(RedisConnectionManager::initialize_with(
            "redis://127.0.0.1:6379/2",
            RetryPolicy::no_retry()
        )
        .is_ok());
    }
}
