//! Redis-backed store
//!
//! Conditional writes run as Lua scripts so the compare and the write happen
//! atomically on the server. Every command is wrapped in the configured
//! operation timeout.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use super::{StoreClient, StoreMessage, Subscription};
use crate::error::{Error, Result};

/// SCAN batch size hint
const SCAN_COUNT: usize = 100;

const COMPARE_AND_SET_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end

local ttl = tonumber(ARGV[4])
if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
    redis.call('SET', KEYS[1], ARGV[3])
end
return 1
";

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis. The connection manager reconnects on its own after
    /// the initial connection succeeds.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let conn = timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::StoreUnavailable("Redis connection timed out".to_string()))?
            .map_err(|e| Error::StoreUnavailable(format!("Redis connection failed: {e}")))?;

        Ok(Self {
            client,
            conn,
            op_timeout,
        })
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::StoreUnavailable(format!("Redis {op} timed out")))?
            .map_err(|e| Error::StoreUnavailable(format!("Redis {op} failed: {e}")))
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map_or(0, |ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl.is_some() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        self.bounded("SET", cmd.query_async::<()>(&mut conn)).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = Script::new(COMPARE_AND_SET_SCRIPT);
        let mut invocation = script.key(key);
        invocation
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value)
            .arg(ttl_millis(ttl));

        let written: i32 = self
            .bounded("compare-and-set script", invocation.invoke_async(&mut conn))
            .await?;
        Ok(written == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = Script::new(COMPARE_AND_DELETE_SCRIPT);
        let mut invocation = script.key(key);
        invocation.arg(expected);

        let deleted: i32 = self
            .bounded("compare-and-delete script", invocation.invoke_async(&mut conn))
            .await?;
        Ok(deleted == 1)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.bounded("DEL", redis::cmd("DEL").arg(keys).query_async(&mut conn))
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i32 = self
            .bounded(
                "PEXPIRE",
                redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl_millis(Some(ttl)))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        // SCAN may return a key more than once
        let mut keys = BTreeSet::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn),
                )
                .await?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys.into_iter().collect())
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.bounded(
            "SADD",
            redis::cmd("SADD").arg(key).arg(members).query_async(&mut conn),
        )
        .await
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.bounded(
            "SREM",
            redis::cmd("SREM").arg(key).arg(members).query_async(&mut conn),
        )
        .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.bounded("SMEMBERS", redis::cmd("SMEMBERS").arg(key).query_async(&mut conn))
            .await
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.bounded("SCARD", redis::cmd("SCARD").arg(key).query_async(&mut conn))
            .await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.bounded(
            "PUBLISH",
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async(&mut conn),
        )
        .await
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        let mut pubsub = self
            .bounded("pub/sub connect", self.client.get_async_pubsub())
            .await?;

        self.bounded("SUBSCRIBE", pubsub.subscribe(channels)).await?;
        debug!(channels = ?channels, "Redis subscription established");

        let stream = pubsub.into_on_message().map(|msg| StoreMessage {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(stream.boxed())
    }
}
