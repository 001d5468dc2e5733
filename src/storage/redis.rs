// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis fast-path cache.
//!
//! Plain string keys only:
//! - `<ns>_<tenant>_patient_sequence:<year>` → `"{number}:{suffix}:{count}"`
//! - `<ns>_<tenant>_patient_sequence_lock:<year>` → owner token, `SET NX PX`
//!
//! Compare-and-set and lock release are Lua scripts so they stay atomic
//! across processes.

use std::time::Duration;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::traits::{SequenceCache, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// `KEYS[1]` = key, `ARGV[1]` = expected value ("" = absent), `ARGV[2]` =
/// new value, `ARGV[3]` = TTL in milliseconds.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

/// `KEYS[1]` = lock key, `ARGV[1]` = owner token.
const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

pub struct RedisCache {
    connection: ConnectionManager,
    compare_and_set: Script,
    release_lock: Script,
}

impl RedisCache {
    /// Connect with startup-mode retry.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self {
            connection,
            compare_and_set: Script::new(COMPARE_AND_SET),
            release_lock: Script::new(RELEASE_LOCK),
        })
    }

    /// Clone of the connection manager (cheap, multiplexed)
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

// No retry wrapper on individual calls: a failing cache is handled by
// falling back to SQL, not by waiting on Redis.
#[async_trait]
impl SequenceCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(backend)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl))
            .await
            .map_err(backend)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let swapped: i64 = self
            .compare_and_set
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await.map_err(backend)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .release_lock
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted == 1)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }
}
