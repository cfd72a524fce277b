//! In-process key-value store
//!
//! Mirrors the subset of Redis semantics the state store relies on: lazy
//! per-key expiry, collections that vanish when emptied, HSET/SADD keeping
//! an existing TTL, and all-or-nothing batches. Expiry is measured on
//! `tokio::time::Instant` so paused test clocks drive it.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use super::kv::{Batch, Command, Guard, KvStore, MessageStream};
use crate::error::{NotifyError, Result};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    ZSet(HashMap<String, f64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

fn wrong_type(key: &str) -> NotifyError {
    NotifyError::Store(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// In-memory [`KvStore`]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            channels: DashMap::new(),
        }
    }

    /// Run `f` on the live entry for `key`, dropping it first if expired
    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| !e.is_live(now)) {
            data.remove(key);
        }
        f(data.get_mut(key))
    }

    fn apply(
        staged: &mut HashMap<String, Option<Entry>>,
        command: Command,
        now: Instant,
    ) -> Result<()> {
        match command {
            Command::HSet { key, fields } => {
                let slot = staged.entry(key.clone()).or_insert(None);
                let entry = slot.get_or_insert_with(|| Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::Hash(hash) => hash.extend(fields),
                    _ => return Err(wrong_type(&key)),
                }
            }
            Command::SetEx { key, value, ttl_secs } => {
                staged.insert(
                    key,
                    Some(Entry {
                        value: Value::Str(value),
                        expires_at: Some(now + Duration::from_secs(ttl_secs)),
                    }),
                );
            }
            Command::Expire { key, ttl_secs } => {
                if let Some(Some(entry)) = staged.get_mut(&key) {
                    entry.expires_at = Some(now + Duration::from_secs(ttl_secs));
                }
            }
            Command::Del { key } => {
                staged.insert(key, None);
            }
            Command::SAdd { key, member } => {
                let slot = staged.entry(key.clone()).or_insert(None);
                let entry = slot.get_or_insert_with(|| Entry {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::Set(set) => {
                        set.insert(member);
                    }
                    _ => return Err(wrong_type(&key)),
                }
            }
            Command::SRem { key, member } => {
                if let Some(slot) = staged.get_mut(&key) {
                    if let Some(entry) = slot {
                        match &mut entry.value {
                            Value::Set(set) => {
                                set.remove(&member);
                            }
                            _ => return Err(wrong_type(&key)),
                        }
                        if entry.value.is_empty() {
                            *slot = None;
                        }
                    }
                }
            }
            Command::ZAdd { key, score, member } => {
                let slot = staged.entry(key.clone()).or_insert(None);
                let entry = slot.get_or_insert_with(|| Entry {
                    value: Value::ZSet(HashMap::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::ZSet(zset) => {
                        zset.insert(member, score);
                    }
                    _ => return Err(wrong_type(&key)),
                }
            }
            Command::ZRem { key, member } => {
                if let Some(slot) = staged.get_mut(&key) {
                    if let Some(entry) = slot {
                        match &mut entry.value {
                            Value::ZSet(zset) => {
                                zset.remove(&member);
                            }
                            _ => return Err(wrong_type(&key)),
                        }
                        if entry.value.is_empty() {
                            *slot = None;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn sorted_zset(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.with_live(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::ZSet(zset), .. }) => {
                let mut members: Vec<(String, f64)> =
                    zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn command_key(command: &Command) -> &str {
    match command {
        Command::HSet { key, .. }
        | Command::SetEx { key, .. }
        | Command::Expire { key, .. }
        | Command::Del { key }
        | Command::SAdd { key, .. }
        | Command::SRem { key, .. }
        | Command::ZAdd { key, .. }
        | Command::ZRem { key, .. } => key,
    }
}

enum GlobToken {
    Any,
    One,
    Literal(char),
}

fn glob_tokens(pattern: &str) -> Vec<GlobToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' => GlobToken::Any,
            '?' => GlobToken::One,
            // a trailing backslash matches itself
            '\\' => GlobToken::Literal(chars.next().unwrap_or('\\')),
            other => GlobToken::Literal(other),
        });
    }
    tokens
}

/// Glob match supporting `*`, `?` and `\` escapes
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p = glob_tokens(pattern);
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        match p.get(pi) {
            Some(GlobToken::One) => {
                pi += 1;
                ti += 1;
                continue;
            }
            Some(GlobToken::Literal(c)) if *c == t[ti] => {
                pi += 1;
                ti += 1;
                continue;
            }
            Some(GlobToken::Any) => {
                star = Some((pi, ti));
                pi += 1;
                continue;
            }
            _ => {}
        }
        match star {
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }
    p[pi..].iter().all(|token| matches!(token, GlobToken::Any))
}

fn guard_holds(data: &HashMap<String, Entry>, guard: &Guard, now: Instant) -> bool {
    let live = |key: &str| data.get(key).filter(|e| e.is_live(now));
    match guard {
        Guard::Absent { key } => live(key).is_none(),
        Guard::ZScore { key, member, score } => match live(key) {
            Some(Entry { value: Value::ZSet(zset), .. }) => zset.get(member) == Some(score),
            _ => false,
        },
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn exec(&self, batch: Batch) -> Result<bool> {
        let now = Instant::now();
        let mut data = self.data.lock();

        let (guards, commands) = batch.into_parts();
        if !guards.iter().all(|guard| guard_holds(&data, guard, now)) {
            return Ok(false);
        }

        let mut staged: HashMap<String, Option<Entry>> = HashMap::new();
        for command in &commands {
            let key = command_key(command);
            if !staged.contains_key(key) {
                let current = data.get(key).filter(|e| e.is_live(now)).cloned();
                staged.insert(key.to_string(), current);
            }
        }

        for command in commands {
            Self::apply(&mut staged, command, now)?;
        }

        for (key, entry) in staged {
            match entry {
                Some(entry) if !entry.value.is_empty() => {
                    data.insert(key, entry);
                }
                _ => {
                    data.remove(&key);
                }
            }
        }
        Ok(true)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_live(key, |entry| match entry {
            None => Ok(HashMap::new()),
            Some(Entry { value: Value::Hash(hash), .. }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hincrby_existing(&self, key: &str, field: &str, by: i64) -> Result<Option<i64>> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let Some(entry) = data.get_mut(key).filter(|e| e.is_live(now)) else {
            return Ok(None);
        };
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let current = match hash.get(field) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| NotifyError::Store(format!("hash value is not an integer: {}.{}", key, field)))?,
            None => 0,
        };
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(Some(next))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_live(key, |entry| match entry {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.with_live(key, |entry| entry.is_some()))
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let now = Instant::now();
        Ok(self.with_live(key, |entry| {
            entry
                .and_then(|e| e.expires_at)
                .map(|at| (at.saturating_duration_since(now).as_millis() as u64 + 500) / 1000)
        }))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_live(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        Ok(self
            .sorted_zset(key)?
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.sorted_zset(key)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let data = self.data.lock();
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(k, e)| e.is_live(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        match self.channels.get(channel) {
            Some(sender) => Ok(sender.send(message.to_string()).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let channel = channel.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let channel = channel.clone();
            async move {
                match item {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Subscriber on channel {} dropped messages: {}", channel, e);
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
