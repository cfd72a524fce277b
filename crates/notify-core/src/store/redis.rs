//! Redis backend for [`KvStore`]
//!
//! Commands share one multiplexed connection. Each [`KvStore::subscribe`]
//! call opens its own pub/sub connection so a listener never holds up
//! ordinary commands.
//!
//! Unguarded batches go out as a MULTI/EXEC pipeline. Guarded batches and
//! the existing-only increment run as Lua scripts so the check and the
//! writes are one server-side step.

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Pipeline, Script};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

use super::kv::{Batch, Command, Guard, KvStore, MessageStream};
use crate::error::Result;

/// ARGV: guard count, guards (`absent key` | `zscore key member score`),
/// then each command as its word count followed by its words
const GUARDED_BATCH: &str = r#"
local i = 1
local guards = tonumber(ARGV[i])
i = i + 1
for _ = 1, guards do
  if ARGV[i] == 'absent' then
    if redis.call('EXISTS', ARGV[i + 1]) == 1 then return 0 end
    i = i + 2
  else
    local score = redis.call('ZSCORE', ARGV[i + 1], ARGV[i + 2])
    if not score or tonumber(score) ~= tonumber(ARGV[i + 3]) then return 0 end
    i = i + 4
  end
end
while i <= #ARGV do
  local argc = tonumber(ARGV[i])
  redis.call(unpack(ARGV, i + 1, i + argc))
  i = i + argc + 1
end
return 1
"#;

const HINCRBY_EXISTING: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
end
return false
"#;

/// [`KvStore`] over a Redis server
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to `url` (`redis://host:port/db`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to state store at {}", url);
        Ok(Self { client, conn })
    }

    fn pipeline(commands: Vec<Command>) -> Pipeline {
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for command in commands {
            match command {
                Command::HSet { key, fields } => {
                    if !fields.is_empty() {
                        pipe.hset_multiple(key, &fields).ignore();
                    }
                }
                Command::SetEx { key, value, ttl_secs } => {
                    pipe.set_ex(key, value, ttl_secs).ignore();
                }
                Command::Expire { key, ttl_secs } => {
                    pipe.expire(key, ttl_secs as i64).ignore();
                }
                Command::Del { key } => {
                    pipe.del(key).ignore();
                }
                Command::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                Command::SRem { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                Command::ZAdd { key, score, member } => {
                    pipe.zadd(key, member, score).ignore();
                }
                Command::ZRem { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
            }
        }
        pipe
    }

    fn script_args(guards: Vec<Guard>, commands: Vec<Command>) -> Vec<String> {
        let mut args = vec![guards.len().to_string()];
        for guard in guards {
            match guard {
                Guard::Absent { key } => args.extend(["absent".to_string(), key]),
                Guard::ZScore { key, member, score } => {
                    args.extend(["zscore".to_string(), key, member, score.to_string()])
                }
            }
        }
        for command in commands {
            let words: Vec<String> = match command {
                Command::HSet { key, fields } => {
                    if fields.is_empty() {
                        continue;
                    }
                    let mut words = vec!["HSET".to_string(), key];
                    for (field, value) in fields {
                        words.push(field);
                        words.push(value);
                    }
                    words
                }
                Command::SetEx { key, value, ttl_secs } => {
                    vec!["SET".into(), key, value, "EX".into(), ttl_secs.to_string()]
                }
                Command::Expire { key, ttl_secs } => vec!["EXPIRE".into(), key, ttl_secs.to_string()],
                Command::Del { key } => vec!["DEL".into(), key],
                Command::SAdd { key, member } => vec!["SADD".into(), key, member],
                Command::SRem { key, member } => vec!["SREM".into(), key, member],
                Command::ZAdd { key, score, member } => vec!["ZADD".into(), key, score.to_string(), member],
                Command::ZRem { key, member } => vec!["ZREM".into(), key, member],
            };
            args.push(words.len().to_string());
            args.extend(words);
        }
        args
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn exec(&self, batch: Batch) -> Result<bool> {
        let (guards, commands) = batch.into_parts();
        let mut conn = self.conn.clone();
        if guards.is_empty() {
            if commands.is_empty() {
                return Ok(true);
            }
            let _: () = Self::pipeline(commands).query_async(&mut conn).await?;
            return Ok(true);
        }

        let script = Script::new(GUARDED_BATCH);
        let mut invocation = script.prepare_invoke();
        for arg in Self::script_args(guards, commands) {
            invocation.arg(arg);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = ::redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(fields)
    }

    async fn hincrby_existing(&self, key: &str, field: &str, by: i64) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = Script::new(HINCRBY_EXISTING)
            .key(key)
            .arg(field)
            .arg(by)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = ::redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = ::redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(ttl).ok())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = ::redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        let members: Vec<(String, f64)> = ::redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ::redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!("Listening on store channel {}", channel);

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let channel = channel.clone();
            async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!("Undecodable message on channel {}: {}", channel, e);
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
