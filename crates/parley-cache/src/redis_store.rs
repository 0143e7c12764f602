use std::time::Duration;

use parley_types::BoxFuture;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use tracing::info;

use crate::{CacheError, CredentialStore};

const TAKE_IF_EQUALS: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

#[derive(Clone)]
pub struct RedisCredentialStore {
    manager: ConnectionManager,
}

impl RedisCredentialStore {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(redis_url).map_err(|err| CacheError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        info!("Credential store connected at {}", redis_url);
        Ok(Self { manager })
    }
}

fn map_err(err: RedisError) -> CacheError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        CacheError::Unavailable(err.to_string())
    } else {
        CacheError::Operation(err.to_string())
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl CredentialStore for RedisCredentialStore {
    fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: () = conn.set_ex(&key, value, ttl_secs(ttl)).await.map_err(map_err)?;
            Ok(())
        })
    }

    fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(reply.is_some())
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = conn.get(&key).await.map_err(map_err)?;
            Ok(value)
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: u64 = conn.del(&key).await.map_err(map_err)?;
            Ok(removed > 0)
        })
    }

    fn take_if_equals(&self, key: &str, expected: &str) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = key.to_string();
        let expected = expected.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: i64 = redis::Script::new(TAKE_IF_EQUALS)
                .key(&key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await
                .map_err(map_err)?;
            Ok(removed == 1)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), CacheError>> {
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(map_err)?;
            if pong == "PONG" {
                Ok(())
            } else {
                Err(CacheError::Operation(format!("unexpected PING reply {pong:?}")))
            }
        })
    }
}
