//! Key-value store primitives
//!
//! The state store speaks to its backend only through [`KvStore`]: hash,
//! string, set and sorted-set commands with per-key TTL, atomic batches,
//! and a publish/subscribe channel. Implementations exist for an
//! in-process map ([`super::memory::MemoryStore`]) and for Redis
//! (`RedisStore`, behind the `redis` feature).

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;

/// Messages received on a subscribed channel
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A single write inside a [`Batch`]
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    HSet { key: String, fields: Vec<(String, String)> },
    SetEx { key: String, value: String, ttl_secs: u64 },
    Expire { key: String, ttl_secs: u64 },
    Del { key: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, member: String },
}

/// Precondition checked atomically before a [`Batch`] is applied
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// `key` must not exist
    Absent { key: String },
    /// `member` of sorted set `key` must still have `score`
    ZScore { key: String, member: String, score: f64 },
}

/// Writes applied atomically, in order
///
/// A batch with guards is applied only if every guard holds at execution
/// time; otherwise nothing is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    guards: Vec<Guard>,
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only apply the batch while `key` does not exist
    pub fn guard_absent(mut self, key: &str) -> Self {
        self.guards.push(Guard::Absent { key: key.to_string() });
        self
    }

    /// Only apply the batch while `member` of `key` still scores `score`
    pub fn guard_zscore(mut self, key: &str, member: &str, score: f64) -> Self {
        self.guards.push(Guard::ZScore {
            key: key.to_string(),
            member: member.to_string(),
            score,
        });
        self
    }

    /// Write a field map and bound it with a TTL
    pub fn hset_ex(self, key: &str, fields: Vec<(String, String)>, ttl_secs: u64) -> Self {
        self.hset(key, fields).expire(key, ttl_secs)
    }

    pub fn hset(mut self, key: &str, fields: Vec<(String, String)>) -> Self {
        self.commands.push(Command::HSet { key: key.to_string(), fields });
        self
    }

    pub fn set_ex(mut self, key: &str, value: &str, ttl_secs: u64) -> Self {
        self.commands.push(Command::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs,
        });
        self
    }

    pub fn expire(mut self, key: &str, ttl_secs: u64) -> Self {
        self.commands.push(Command::Expire { key: key.to_string(), ttl_secs });
        self
    }

    pub fn del(mut self, key: &str) -> Self {
        self.commands.push(Command::Del { key: key.to_string() });
        self
    }

    pub fn sadd(mut self, key: &str, member: &str) -> Self {
        self.commands.push(Command::SAdd { key: key.to_string(), member: member.to_string() });
        self
    }

    pub fn srem(mut self, key: &str, member: &str) -> Self {
        self.commands.push(Command::SRem { key: key.to_string(), member: member.to_string() });
        self
    }

    pub fn zadd(mut self, key: &str, score: f64, member: &str) -> Self {
        self.commands.push(Command::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        });
        self
    }

    pub fn zrem(mut self, key: &str, member: &str) -> Self {
        self.commands.push(Command::ZRem { key: key.to_string(), member: member.to_string() });
        self
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_parts(self) -> (Vec<Guard>, Vec<Command>) {
        (self.guards, self.commands)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Backend operations used by the state store and event packages
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Apply every command in `batch` as one atomic unit
    ///
    /// Returns `false`, writing nothing, when one of the batch's guards
    /// does not hold.
    async fn exec(&self, batch: Batch) -> Result<bool>;

    /// All fields of a hash; empty when the key is absent or expired
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Atomically add `by` to an integer hash field of an existing hash
    ///
    /// Returns the new value, or `None` without creating anything when the
    /// key is absent or expired.
    async fn hincrby_existing(&self, key: &str, field: &str, by: i64) -> Result<Option<i64>>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining lifetime in seconds; `None` when absent or without TTL
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Members with `min <= score <= max`, lowest score first
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    /// Every member with its score, lowest score first
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>>;

    /// Keys matching a glob pattern (`*`, `?` and `\` escapes)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Publish on a channel, returning the number of receivers
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    /// Subscribe to a channel over a dedicated connection
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;
}
