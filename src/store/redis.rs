use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Script};

use super::CounterStore;
use crate::error::Result;
use crate::rdconfig::RedisConnection;

/// Increments KEYS[1]; the increment that creates it also sets a TTL of ARGV[1] millis.
const INCREMENT_IN_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Counter store backed by INCR / EXPIRE / PTTL on the shared connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: RedisConnection,
    increment_in_window: Script,
}

impl RedisCounterStore {
    pub fn new(conn: RedisConnection) -> Self {
        Self {
            conn,
            increment_in_window: Script::new(INCREMENT_IN_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.manager()?;
        Ok(conn.incr(key, 1i64).await?)
    }

    async fn increment_in_window(&self, key: &str, window: Duration) -> Result<i64> {
        let mut conn = self.conn.manager()?;
        let count: i64 = self
            .increment_in_window
            .key(key)
            .arg(window.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.manager()?;
        conn.pexpire::<_, ()>(key, ttl.as_millis() as i64).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.manager()?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.manager()?;
        conn.pset_ex::<_, _, ()>(key, value, ttl.as_millis() as u64).await?;
        Ok(())
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.manager()?;
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2: missing, -1: no expiry
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }
}
