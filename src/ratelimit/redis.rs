//! Redis-backed counter store shared across server instances.
//!
//! Every check is a single Lua script invocation, so the window rollover,
//! the increment and the limit comparison execute atomically inside Redis
//! no matter how many limiter processes share the same keys.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{info, trace};

use super::counter::{millis_to_datetime, window_millis, CounterOutcome, CounterSnapshot, CounterState};
use super::key::CounterKey;
use super::store::CounterStore;
use crate::config::StoreConfig;
use crate::error::{LimiterError, Result};

/// Weighted fixed-window increment.
///
/// Returns `{rounded_effective_count, window_start_ms, over_limit}`.
const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ws = now - (now % window)

local state = redis.call('HMGET', key, 'ws', 'win', 'cur', 'prev')
local stored_ws = tonumber(state[1])
local stored_win = tonumber(state[2])
local cur = tonumber(state[3]) or 0
local prev = tonumber(state[4]) or 0

if stored_ws ~= nil and stored_win == window and stored_ws > ws then
  -- opened by a caller whose clock runs ahead; count against it
  ws = stored_ws
  now = stored_ws
elseif stored_ws ~= ws or stored_win ~= window then
  if stored_ws ~= nil and stored_win == window and stored_ws + window == ws then
    prev = cur
  else
    prev = 0
  end
  cur = 0
end

cur = cur + 1
local elapsed = (now - ws) / window
local effective = cur + prev * (1 - elapsed)

redis.call('HSET', key, 'ws', ws, 'win', window, 'cur', cur, 'prev', prev)
redis.call('PEXPIRE', key, window * 2)

local over = 0
if effective > limit then
  over = 1
end
return {math.floor(effective + 0.5), ws, over}
"#;

/// Counter store backed by Redis.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
    key_prefix: String,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect using the store section of the service configuration.
    ///
    /// The connection attempt is bounded by `connect_timeout_ms` so an
    /// unreachable server fails startup instead of hanging it.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let timeout = Duration::from_millis(config.connect_timeout_ms);

        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                LimiterError::StoreUnavailable(format!(
                    "connecting to Redis timed out after {:?}",
                    timeout
                ))
            })??;

        info!(key_prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self {
            conn,
            script: Script::new(INCREMENT_SCRIPT),
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn redis_key(&self, key: &CounterKey) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_check(
        &self,
        key: &CounterKey,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterOutcome> {
        let window_ms = window_millis(window)?;
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();

        let (count, window_start_ms, over): (i64, i64, i64) = self
            .script
            .key(&redis_key)
            .arg(limit)
            .arg(window_ms)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %redis_key, count, over_limit = over == 1, "Redis counter incremented");

        Ok(CounterOutcome {
            count: count.max(0) as u64,
            window_start: millis_to_datetime(window_start_ms),
            over_limit: over == 1,
        })
    }

    async fn peek(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<CounterSnapshot>> {
        let window_ms = window_millis(window)?;
        let mut conn = self.conn.clone();

        let fields: (Option<i64>, Option<i64>, Option<u64>, Option<u64>) = conn
            .hget(self.redis_key(key), vec!["ws", "win", "cur", "prev"])
            .await?;

        let snapshot = match fields {
            (Some(ws), Some(win), cur, prev) => {
                let state =
                    CounterState::from_parts(ws, win, cur.unwrap_or(0), prev.unwrap_or(0));
                Some(state.snapshot_at(window_ms, now.timestamp_millis()))
            }
            _ => None,
        };
        Ok(snapshot)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
