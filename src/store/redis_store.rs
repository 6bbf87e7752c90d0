use super::{with_deadline, CounterDrift, PopOutcome, WindowStore};
use crate::config::StoreConfig;
use crate::entry::Entry;
use crate::error::{FloodControlError, Result};
use crate::redis_connection_manager::RedisConnectionManager;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use log::info;
use mobc::{Connection, Pool};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;

// KEYS[3] is the set of users that own a counter key; reconcile walks it
// instead of scanning the keyspace.
const APPEND_AND_INCREMENT: &str = r#"
redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[2])
return redis.call('INCR', KEYS[2])
"#;

const APPEND_IF_BELOW: &str = r#"
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if current >= tonumber(ARGV[2]) then
  return -1
end
redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[3])
return redis.call('INCR', KEYS[2])
"#;

// Returns {status, remaining}: 0 = empty, 1 = head moved, 2 = popped.
const POP_HEAD_IF: &str = r#"
local head = redis.call('LINDEX', KEYS[1], 0)
if not head then
  return {0, 0}
end
if head ~= ARGV[1] then
  return {1, 0}
end
redis.call('LPOP', KEYS[1])
local remaining = redis.call('DECR', KEYS[2])
if remaining <= 0 then
  redis.call('DEL', KEYS[2])
  redis.call('SREM', KEYS[3], ARGV[2])
end
return {2, remaining}
"#;

// Returns a flat list of (user, recorded, actual) triples for every repaired
// counter. Tokens are attributed only in the canonical form `Entry` decodes.
const RECONCILE: &str = r#"
local I64_MAX = '9223372036854775807'
local I64_MIN_ABS = '9223372036854775808'

local function fits(digits, max)
  return #digits < #max or (#digits == #max and digits <= max)
end

local function owner(token)
  local sign, user, ts = string.match(token, '^(%-?)(%d+):(%d+)$')
  if not user then
    return nil
  end
  if (#user > 1 and string.sub(user, 1, 1) == '0') or (sign == '-' and user == '0') then
    return nil
  end
  if #ts > 1 and string.sub(ts, 1, 1) == '0' then
    return nil
  end
  if not fits(user, sign == '-' and I64_MIN_ABS or I64_MAX) or not fits(ts, I64_MAX) then
    return nil
  end
  return sign .. user
end

local actual = {}
for _, token in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  local user = owner(token)
  if user then
    actual[user] = (actual[user] or 0) + 1
  end
end

local prefix = ARGV[1]
local drift = {}
for _, user in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  local key = prefix .. user
  local recorded = tonumber(redis.call('GET', key)) or 0
  local expected = actual[user] or 0
  if recorded ~= expected then
    if expected == 0 then
      redis.call('DEL', key)
    else
      redis.call('SET', key, expected)
    end
    table.insert(drift, user)
    table.insert(drift, tostring(recorded))
    table.insert(drift, tostring(expected))
  end
  if expected == 0 then
    redis.call('SREM', KEYS[2], user)
  end
  actual[user] = nil
end
for user, expected in pairs(actual) do
  redis.call('SET', prefix .. user, expected)
  redis.call('SADD', KEYS[2], user)
  table.insert(drift, user)
  table.insert(drift, '0')
  table.insert(drift, tostring(expected))
end
return drift
"#;

/// Window store backed by a Redis list and per-user integer keys.
///
/// Pair operations run as Lua scripts, so each one is applied atomically
/// by the server. The scripts touch counter keys they do not declare, which
/// ties the store to a single Redis node (or a replicated primary); Redis
/// Cluster is not supported.
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
    queue_key: String,
    counter_prefix: String,
    users_key: String,
    retry: RetryPolicy,
    append_and_increment: Script,
    append_if_below: Script,
    pop_head_if: Script,
    reconcile: Script,
}

impl RedisStore {
    pub fn new(pool: Pool<RedisConnectionManager>, key_prefix: &str, retry: RetryPolicy) -> Self {
        RedisStore {
            pool,
            queue_key: format!("{}:requests", key_prefix),
            counter_prefix: format!("{}:count:", key_prefix),
            users_key: format!("{}:users", key_prefix),
            retry,
            append_and_increment: Script::new(APPEND_AND_INCREMENT),
            append_if_below: Script::new(APPEND_IF_BELOW),
            pop_head_if: Script::new(POP_HEAD_IF),
            reconcile: Script::new(RECONCILE),
        }
    }

    /// Builds the connection pool and verifies the server answers.
    pub async fn connect(config: &StoreConfig, retry: RetryPolicy) -> Result<Self> {
        let redis_url = config.redis_url.as_deref().ok_or_else(|| {
            FloodControlError::InvalidArgument("store.redis_url is not set".into())
        })?;
        let manager = RedisConnectionManager::initialize_with(redis_url, retry.clone())?;
        let pool = Pool::builder()
            .max_open(config.pool_max_open)
            .get_timeout(Some(Duration::from_secs(config.pool_get_timeout_seconds)))
            .build(manager);

        let store = Self::new(pool, &config.key_prefix, retry);
        store.ping().await?;
        info!("Connected to Redis window store at {}", redis_url);
        Ok(store)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await?;
        Ok(())
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    fn counter_key(&self, user_id: i64) -> String {
        format!("{}{}", self.counter_prefix, user_id)
    }

    async fn connection(&self) -> Result<Connection<RedisConnectionManager>> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn queue_append(&self, token: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.rpush::<_, _, i64>(&self.queue_key, token).await?;
        Ok(())
    }

    async fn queue_peek_head(&self) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.lindex(&self.queue_key, 0).await?)
    }

    async fn queue_pop_head(&self) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.lpop(&self.queue_key, None).await?)
    }

    async fn queue_length(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(&self.queue_key).await?)
    }

    async fn queue_snapshot(&self) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.lrange(&self.queue_key, 0, -1).await?)
    }

    async fn counter_get(&self, user_id: i64) -> Result<i64> {
        let mut conn = self.connection().await?;
        let value: Option<i64> = conn.get(self.counter_key(user_id)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn counter_increment(&self, user_id: i64) -> Result<i64> {
        let mut conn = self.connection().await?;
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(self.counter_key(user_id), 1)
            .sadd(&self.users_key, user_id)
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn counter_decrement(&self, user_id: i64) -> Result<i64> {
        let mut conn = self.connection().await?;
        Ok(conn.decr(self.counter_key(user_id), 1).await?)
    }

    async fn counter_set(&self, user_id: i64, value: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if value == 0 {
            pipe.del(self.counter_key(user_id))
                .ignore()
                .srem(&self.users_key, user_id)
                .ignore();
        } else {
            pipe.set(self.counter_key(user_id), value)
                .ignore()
                .sadd(&self.users_key, user_id)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    async fn counter_snapshot(&self) -> Result<HashMap<i64, i64>> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(format!("{}*", self.counter_prefix))
                .await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut counters = HashMap::new();
        for key in keys {
            let user_id = match key[self.counter_prefix.len()..].parse::<i64>() {
                Ok(user_id) => user_id,
                Err(_) => continue,
            };
            let value: Option<i64> = conn.get(&key).await?;
            if let Some(value) = value {
                counters.insert(user_id, value);
            }
        }
        Ok(counters)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }

    async fn append_and_increment(&self, entry: &Entry, timeout: Duration) -> Result<i64> {
        with_deadline(timeout, "append_and_increment", async {
            let mut conn = self.connection().await?;
            Ok::<_, FloodControlError>(self
                .append_and_increment
                .key(&self.queue_key)
                .key(self.counter_key(entry.user_id))
                .key(&self.users_key)
                .arg(entry.encode())
                .arg(entry.user_id)
                .invoke_async(&mut *conn)
                .await?)
        })
        .await
    }

    async fn append_if_below(
        &self,
        entry: &Entry,
        limit: u64,
        timeout: Duration,
    ) -> Result<Option<i64>> {
        let count: i64 = with_deadline(timeout, "append_if_below", async {
            let mut conn = self.connection().await?;
            Ok::<_, FloodControlError>(self
                .append_if_below
                .key(&self.queue_key)
                .key(self.counter_key(entry.user_id))
                .key(&self.users_key)
                .arg(entry.encode())
                .arg(limit)
                .arg(entry.user_id)
                .invoke_async(&mut *conn)
                .await?)
        })
        .await?;
        Ok((count >= 0).then_some(count))
    }

    async fn pop_head_if(&self, token: &str, user_id: i64, timeout: Duration) -> Result<PopOutcome> {
        let (status, remaining): (i64, i64) = with_deadline(timeout, "pop_head_if", async {
            let mut conn = self.connection().await?;
            Ok::<_, FloodControlError>(self
                .pop_head_if
                .key(&self.queue_key)
                .key(self.counter_key(user_id))
                .key(&self.users_key)
                .arg(token)
                .arg(user_id)
                .invoke_async(&mut *conn)
                .await?)
        })
        .await?;
        Ok(match status {
            0 => PopOutcome::Empty,
            1 => PopOutcome::HeadMoved,
            _ => PopOutcome::Popped { remaining },
        })
    }

    async fn reconcile(&self) -> Result<Vec<CounterDrift>> {
        let mut conn = self.connection().await?;
        let flat: Vec<String> = self
            .reconcile
            .key(&self.queue_key)
            .key(&self.users_key)
            .arg(&self.counter_prefix)
            .invoke_async(&mut *conn)
            .await?;

        let parse = |field: &str| {
            field.parse::<i64>().map_err(|e| {
                FloodControlError::StoreUnavailable(format!(
                    "unexpected reconcile reply field {:?}: {}",
                    field, e
                ))
            })
        };
        let mut drift = Vec::with_capacity(flat.len() / 3);
        for triple in flat.chunks_exact(3) {
            drift.push(CounterDrift {
                user_id: parse(&triple[0])?,
                recorded: parse(&triple[1])?,
                actual: parse(&triple[2])?,
            });
        }
        drift.sort_by_key(|d| d.user_id);
        Ok(drift)
    }
}
