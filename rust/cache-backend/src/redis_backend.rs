use crate::{CacheBackend, CacheError, Command, Pipeline, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Redis-backed cache. Every call carries its own deadline.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisCache {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(conn) => conn?,
            Err(_) => return Err(CacheError::Timeout(timeout)),
        };
        debug!(url = %redact(url), "connected to redis");
        Ok(Self { conn, timeout })
    }

    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(self.timeout)),
        }
    }
}

fn redact(url: &str) -> String {
    match url.rsplit_once('@') {
        Some((_, host)) => format!("redis://***@{host}"),
        None => url.to_string(),
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("EX").arg(ttl_secs(ttl));
        let reply: Option<String> = self.run(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MGET");
        cmd.arg(keys);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs(ttl));
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        let _: i64 = self.run(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn hmset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(fields);
        let _: i64 = self.run(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(fields);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HKEYS");
        cmd.arg(key);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(values);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("RPOP");
        cmd.arg(key);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("LTRIM");
        cmd.arg(key).arg(start).arg(stop);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (score, member) in members {
            cmd.arg(*score).arg(member);
        }
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(min).arg(max);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(members);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SISMEMBER");
        cmd.arg(key).arg(member);
        self.run(cmd.query_async(&mut conn)).await
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<()> {
        if pipeline.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in pipeline.into_commands() {
            match command {
                Command::Set { key, value, ttl } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl {
                        cmd.arg("EX").arg(ttl_secs(ttl));
                    }
                    cmd.ignore();
                }
                Command::Delete { keys } => {
                    pipe.cmd("DEL").arg(keys).ignore();
                }
                Command::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(ttl)).ignore();
                }
                Command::HSet { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
                }
                Command::HMSet { key, fields } => {
                    pipe.cmd("HSET").arg(key).arg(fields).ignore();
                }
                Command::HDel { key, fields } => {
                    pipe.cmd("HDEL").arg(key).arg(fields).ignore();
                }
                Command::RPush { key, values } => {
                    pipe.cmd("RPUSH").arg(key).arg(values).ignore();
                }
                Command::ZAdd { key, members } => {
                    let cmd = pipe.cmd("ZADD").arg(key);
                    for (score, member) in members {
                        cmd.arg(score).arg(member);
                    }
                    cmd.ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        self.run(pipe.query_async(&mut conn)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_hides_credentials() {
        assert_eq!(redact("redis://user:pw@cache:6379/0"), "redis://***@cache:6379/0");
        assert_eq!(redact("redis://cache:6379"), "redis://cache:6379");
    }

    #[test]
    fn ttl_is_at_least_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(90)), 90);
    }
}
