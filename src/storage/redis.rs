// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend.
//!
//! Plain Redis strings hold cache entries, Redis sets hold the tag index,
//! and `SCAN ... MATCH` drives the cleanup engine. Every command goes
//! through [`retry`] with [`RetryConfig::query()`] so a brief blip does not
//! surface as a cache miss.
//!
//! Pipelines are sent with `MULTI`-less `pipe()`: one round trip, no
//! atomicity. The cache is advisory, so a half-applied batch is fixed by
//! the next write or the next cleanup run.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client, FromRedisValue};

use super::traits::{KvBackend, MemoryInfo, PipelineOp, PipelineReply, StorageError, TtlStatus};
use crate::resilience::retry::{retry, RetryConfig};

/// `SADD` that only ever raises the set's lifetime. TTL is read before the
/// add: `-2` means the set is new, `-1` means it was made persistent.
const SADD_EXTEND_SCRIPT: &str = r"
local current = redis.call('TTL', KEYS[1])
local added = redis.call('SADD', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
if ttl == 0 then
    redis.call('PERSIST', KEYS[1])
elseif current == -2 or (current >= 0 and current < ttl) then
    redis.call('EXPIRE', KEYS[1], ttl)
end
return added
";

pub struct RedisBackend {
    connection: ConnectionManager,
    retry_config: RetryConfig,
}

impl RedisBackend {
    /// Connect to Redis, failing fast (a few seconds) on bad configuration.
    ///
    /// ```rust,no_run
    /// # use cache_engine::storage::redis::RedisBackend;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let backend = RedisBackend::connect("redis://localhost:6379").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Unavailable(e.to_string()))?;

        Ok(Self {
            connection,
            retry_config: RetryConfig::query(),
        })
    }

    /// Override the per-command retry policy.
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Get a clone of the connection manager
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    fn build_pipeline(ops: &[PipelineOp]) -> redis::Pipeline {
        let mut pipeline = pipe();
        for op in ops {
            match op {
                PipelineOp::Set { key, value, ttl_secs } => {
                    if *ttl_secs > 0 {
                        pipeline.cmd("SETEX").arg(key).arg(*ttl_secs).arg(value.as_slice());
                    } else {
                        pipeline.cmd("SET").arg(key).arg(value.as_slice());
                    }
                }
                PipelineOp::Delete { key } => {
                    pipeline.cmd("DEL").arg(key);
                }
                PipelineOp::Expire { key, ttl_secs } => {
                    pipeline.cmd("EXPIRE").arg(key).arg(*ttl_secs);
                }
                PipelineOp::SetAdd { key, member } => {
                    pipeline.cmd("SADD").arg(key).arg(member);
                }
                PipelineOp::SetAddExtend { key, member, ttl_secs } => {
                    pipeline.cmd("EVAL").arg(SADD_EXTEND_SCRIPT).arg(1).arg(key).arg(member).arg(*ttl_secs);
                }
                PipelineOp::SetRemove { key, member } => {
                    pipeline.cmd("SREM").arg(key).arg(member);
                }
                PipelineOp::Get { key } => {
                    pipeline.cmd("GET").arg(key);
                }
                PipelineOp::Ttl { key } => {
                    pipeline.cmd("TTL").arg(key);
                }
                PipelineOp::MemoryUsage { key } => {
                    pipeline.cmd("MEMORY").arg("USAGE").arg(key);
                }
            }
        }
        pipeline
    }

    fn decode_reply(op: &PipelineOp, value: &redis::Value) -> Result<PipelineReply, StorageError> {
        let protocol = |e: redis::RedisError| StorageError::Protocol {
            command: op.name(),
            detail: e.to_string(),
        };
        Ok(match op {
            PipelineOp::Set { .. } => PipelineReply::Done,
            PipelineOp::Delete { .. }
            | PipelineOp::Expire { .. }
            | PipelineOp::SetAdd { .. }
            | PipelineOp::SetAddExtend { .. }
            | PipelineOp::SetRemove { .. } => {
                PipelineReply::Changed(i64::from_redis_value(value).map_err(protocol)? > 0)
            }
            PipelineOp::Get { .. } => {
                PipelineReply::Value(Option::<Vec<u8>>::from_redis_value(value).map_err(protocol)?)
            }
            PipelineOp::Ttl { .. } => {
                PipelineReply::Ttl(TtlStatus::from_redis(i64::from_redis_value(value).map_err(protocol)?))
            }
            PipelineOp::MemoryUsage { .. } => {
                PipelineReply::Size(Option::<u64>::from_redis_value(value).map_err(protocol)?)
            }
        })
    }

    /// Pull `used_memory` and `maxmemory` out of an `INFO memory` reply.
    fn parse_memory_info(info: &str) -> Option<MemoryInfo> {
        let field = |name: &str| {
            info.lines()
                .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let used_bytes = field("used_memory")?;
        let max_bytes = field("maxmemory")?;
        // maxmemory 0 means "no limit": pressure is meaningless
        (max_bytes > 0).then_some(MemoryInfo { used_bytes, max_bytes })
    }
}

fn backend_err(e: redis::RedisError) -> StorageError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StorageError::Unavailable(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.connection.clone();
        retry("redis_get", &self.retry_config, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            async move {
                let data: Option<Vec<u8>> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(backend_err)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        retry("redis_set", &self.retry_config, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            let value = value.to_vec();
            async move {
                if ttl_secs > 0 {
                    let _: () = conn.set_ex(&key, value, ttl_secs).await?;
                } else {
                    let _: () = conn.set(&key, value).await?;
                }
                Ok(())
            }
        })
        .await
        .map_err(backend_err)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        retry("redis_delete", &self.retry_config, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            async move {
                let removed: i64 = conn.del(&key).await?;
                Ok(removed)
            }
        })
        .await
        .map(|removed| removed > 0)
        .map_err(backend_err)
    }

    async fn scan(&self, pattern: &str, cursor: u64, page_size: usize) -> Result<(Vec<String>, u64), StorageError> {
        let conn = self.connection.clone();
        retry("redis_scan", &self.retry_config, || {
            let mut conn = conn.clone();
            let pattern = pattern.to_string();
            async move {
                let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(page_size)
                    .query_async(&mut conn)
                    .await?;
                Ok((keys, next))
            }
        })
        .await
        .map_err(backend_err)
    }

    async fn ttl(&self, key: &str) -> Result<TtlStatus, StorageError> {
        let conn = self.connection.clone();
        retry("redis_ttl", &self.retry_config, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            async move {
                let raw: i64 = conn.ttl(&key).await?;
                Ok(raw)
            }
        })
        .await
        .map(TtlStatus::from_redis)
        .map_err(backend_err)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        retry("redis_expire", &self.retry_config, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            async move {
                let changed: i64 = cmd("EXPIRE").arg(&key).arg(ttl_secs).query_async(&mut conn).await?;
                Ok(changed > 0)
            }
        })
        .await
        .map_err(backend_err)
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<i64, StorageError> {
        // Not retried: a retried INCR after a lost reply would double count
        let mut conn = self.connection.clone();
        let (count,): (i64,) = pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(count)
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.connection.clone();
        retry("redis_smembers", &self.retry_config, || {
            let mut conn = conn.clone();
            let key = key.to_string();
            async move {
                let members: Vec<String> = conn.smembers(&key).await?;
                Ok(members)
            }
        })
        .await
        .map_err(backend_err)
    }

    async fn pipeline(&self, ops: &[PipelineOp]) -> Result<Vec<PipelineReply>, StorageError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.connection.clone();
        let pipeline = Self::build_pipeline(ops);
        let values: Vec<redis::Value> = retry("redis_pipeline", &self.retry_config, || {
            let mut conn = conn.clone();
            let pipeline = pipeline.clone();
            async move {
                let values: Vec<redis::Value> = pipeline.query_async(&mut conn).await?;
                Ok(values)
            }
        })
        .await
        .map_err(backend_err)?;

        if values.len() != ops.len() {
            return Err(StorageError::Protocol {
                command: "PIPELINE",
                detail: format!("expected {} replies, got {}", ops.len(), values.len()),
            });
        }

        ops.iter()
            .zip(values.iter())
            .map(|(op, value)| Self::decode_reply(op, value))
            .collect()
    }

    async fn memory_info(&self) -> Result<Option<MemoryInfo>, StorageError> {
        let mut conn = self.connection.clone();
        let info: String = cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(Self::parse_memory_info(&info))
    }

    async fn ping(&self) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let pong: String = cmd("PING").query_async(&mut conn).await.map_err(backend_err)?;
        Ok(pong == "PONG")
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
