use crate::{CacheBackend, CacheError, Command, Pipeline, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, Entry>,
}

macro_rules! typed_mut {
    ($store:expr, $key:expr, $variant:ident, $default:expr) => {{
        let entry = $store.live_mut_or_insert($key, || Value::$variant($default));
        match &mut entry.value {
            Value::$variant(inner) => inner,
            _ => return Err(CacheError::WrongType($key.to_string())),
        }
    }};
}

macro_rules! typed_ref {
    ($store:expr, $key:expr, $variant:ident) => {{
        match $store.live($key) {
            None => None,
            Some(Entry {
                value: Value::$variant(inner),
                ..
            }) => Some(inner),
            Some(_) => return Err(CacheError::WrongType($key.to_string())),
        }
    }};
}

impl Store {
    fn purge(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&Entry> {
        self.purge(key);
        self.entries.get(key)
    }

    fn live_mut_or_insert(&mut self, key: &str, init: impl FnOnce() -> Value) -> &mut Entry {
        self.purge(key);
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(init()))
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(typed_ref!(self, key, Str).cloned())
    }

    fn delete(&mut self, keys: &[String]) -> u64 {
        let mut removed = 0;
        for key in keys {
            self.purge(key);
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        self.purge(key);
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    fn hset_many(&mut self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let hash = typed_mut!(self, key, Hash, HashMap::new());
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    fn hdel(&mut self, key: &str, fields: &[String]) -> Result<u64> {
        let Some(hash) = typed_ref!(self, key, Hash) else {
            return Ok(0);
        };
        let present = fields.iter().filter(|f| hash.contains_key(*f)).count() as u64;
        if present == 0 {
            return Ok(0);
        }
        let hash = typed_mut!(self, key, Hash, HashMap::new());
        for field in fields {
            hash.remove(field);
        }
        if hash.is_empty() {
            self.entries.remove(key);
        }
        Ok(present)
    }

    fn rpush(&mut self, key: &str, values: &[String]) -> Result<u64> {
        let list = typed_mut!(self, key, List, VecDeque::new());
        list.extend(values.iter().cloned());
        Ok(list.len() as u64)
    }

    fn zadd(&mut self, key: &str, members: &[(f64, String)]) -> Result<u64> {
        let zset = typed_mut!(self, key, ZSet, HashMap::new());
        let mut added = 0;
        for (score, member) in members {
            if zset.insert(member.clone(), *score).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Set { key, value, ttl } => self.set(&key, &value, ttl),
            Command::Delete { keys } => {
                self.delete(&keys);
            }
            Command::Expire { key, ttl } => {
                self.expire(&key, ttl);
            }
            Command::HSet { key, field, value } => self.hset_many(&key, &[(field, value)])?,
            Command::HMSet { key, fields } => self.hset_many(&key, &fields)?,
            Command::HDel { key, fields } => {
                self.hdel(&key, &fields)?;
            }
            Command::RPush { key, values } => {
                self.rpush(&key, &values)?;
            }
            Command::ZAdd { key, members } => {
                self.zadd(&key, &members)?;
            }
        }
        Ok(())
    }
}

/// Resolves Redis-style inclusive list bounds (negative counts from the end).
fn list_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

/// In-process cache with Redis semantics for the subset of commands the
/// alarm pipeline uses. Expiry is applied lazily on access.
#[derive(Clone, Debug, Default)]
pub struct MemoryCache {
    inner: Arc<Mutex<Store>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, mostly useful in tests.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of `key`, `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut store = self.inner.lock();
        let expires_at = store.live(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.lock().get(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.inner.lock().set(key, value, ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut store = self.inner.lock();
        if store.live(key).is_some() {
            return Ok(false);
        }
        store.set(key, value, Some(ttl));
        Ok(true)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut store = self.inner.lock();
        Ok(keys
            .iter()
            .map(|key| match store.live(key) {
                Some(Entry {
                    value: Value::Str(v),
                    ..
                }) => Some(v.clone()),
                _ => None,
            })
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        Ok(self.inner.lock().delete(keys))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().live(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.inner.lock().expire(key, ttl))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut store = self.inner.lock();
        Ok(typed_ref!(store, key, Hash).and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .hset_many(key, &[(field.to_string(), value.to_string())])
    }

    async fn hmset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.inner.lock().hset_many(key, fields)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        self.inner.lock().hdel(key, fields)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let mut store = self.inner.lock();
        let mut keys: Vec<String> = typed_ref!(store, key, Hash)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut store = self.inner.lock();
        Ok(typed_ref!(store, key, Hash).cloned().unwrap_or_default())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64> {
        self.inner.lock().rpush(key, values)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut store = self.inner.lock();
        if typed_ref!(store, key, List).is_none() {
            return Ok(None);
        }
        let list = typed_mut!(store, key, List, VecDeque::new());
        let popped = list.pop_back();
        if list.is_empty() {
            store.entries.remove(key);
        }
        Ok(popped)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut store = self.inner.lock();
        let Some(list) = typed_ref!(store, key, List) else {
            return Ok(Vec::new());
        };
        Ok(match list_bounds(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut store = self.inner.lock();
        Ok(typed_ref!(store, key, List).map_or(0, |l| l.len() as u64))
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut store = self.inner.lock();
        let Some(len) = typed_ref!(store, key, List).map(|l| l.len()) else {
            return Ok(());
        };
        match list_bounds(len, start, stop) {
            Some((from, to)) => {
                let list = typed_mut!(store, key, List, VecDeque::new());
                list.truncate(to + 1);
                list.drain(..from);
            }
            None => {
                store.entries.remove(key);
            }
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> Result<u64> {
        self.inner.lock().zadd(key, members)
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut store = self.inner.lock();
        let Some(zset) = typed_ref!(store, key, ZSet) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(f64, &String)> = zset
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (*score, member))
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        Ok(hits.into_iter().map(|(_, m)| m.clone()).collect())
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        let mut store = self.inner.lock();
        let set = typed_mut!(store, key, Set, HashSet::new());
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count() as u64)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut store = self.inner.lock();
        Ok(typed_ref!(store, key, Set).is_some_and(|s| s.contains(member)))
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<()> {
        let mut store = self.inner.lock();
        for command in pipeline.into_commands() {
            store.apply(command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn string_ttl_expires() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn set_nx_only_writes_once() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(10);
        assert!(cache.set_nx("lock", "a", ttl).await.unwrap());
        assert!(!cache.set_nx("lock", "b", ttl).await.unwrap());
        assert_eq!(cache.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn hash_commands() {
        let cache = MemoryCache::new();
        cache
            .hmset(
                "h",
                &[("a".into(), "1".into()), ("b".into(), "2".into())],
            )
            .await
            .unwrap();
        cache.hset("h", "c", "3").await.unwrap();
        assert_eq!(cache.hkeys("h").await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(cache.hget("h", "b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(
            cache.hdel("h", &["a".into(), "zz".into()]).await.unwrap(),
            1
        );
        assert_eq!(cache.hgetall("h").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let cache = MemoryCache::new();
        cache.rpush("l", &["x".into()]).await.unwrap();
        let err = cache.hget("l", "f").await.unwrap_err();
        assert!(matches!(err, CacheError::WrongType(key) if key == "l"));
    }

    #[tokio::test]
    async fn list_range_and_trim() {
        let cache = MemoryCache::new();
        let values: Vec<String> = (1..=5).map(|i| i.to_string()).collect();
        assert_eq!(cache.rpush("l", &values).await.unwrap(), 5);
        assert_eq!(cache.lrange("l", 0, -1).await.unwrap(), values);
        assert_eq!(cache.lrange("l", -2, -1).await.unwrap(), vec!["4", "5"]);
        assert_eq!(cache.lrange("l", 3, 100).await.unwrap(), vec!["4", "5"]);
        cache.ltrim("l", 2, -1).await.unwrap();
        assert_eq!(cache.lrange("l", 0, -1).await.unwrap(), vec!["3", "4", "5"]);
        assert_eq!(cache.rpop("l").await.unwrap().as_deref(), Some("5"));
        assert_eq!(cache.llen("l").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sorted_set_range_by_score() {
        let cache = MemoryCache::new();
        cache
            .zadd(
                "z",
                &[(30.0, "c".into()), (10.0, "a".into()), (20.0, "b".into())],
            )
            .await
            .unwrap();
        assert_eq!(cache.zadd("z", &[(5.0, "a".into())]).await.unwrap(), 0);
        assert_eq!(
            cache.zrangebyscore("z", 0.0, 25.0).await.unwrap(),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn pipeline_applies_in_order() {
        let cache = MemoryCache::new();
        let mut pipe = Pipeline::new();
        pipe.set("a", "1", None)
            .delete(vec!["a".into()])
            .hset("h", "f", "v")
            .expire("h", Duration::from_secs(60))
            .rpush("l", vec!["x".into()]);
        cache.execute(pipe).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.ttl("h").is_some());
        assert_eq!(cache.llen("l").await.unwrap(), 1);
    }
}
