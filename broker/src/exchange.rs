use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::aio::Connection;
use tokio::sync::Mutex;

/// Transport seam to the shared topic exchange. Queues are auto-expiring
/// on the transport side; the broker's registry eviction is independent.
#[async_trait]
pub trait TopicExchange: Send + Sync {
    /// Bind `queue` to `topic`. Idempotent.
    async fn bind(&self, queue: &str, topic: &str) -> Result<()>;
    /// Unbind `queue` from `topic`. Idempotent.
    async fn unbind(&self, queue: &str, topic: &str) -> Result<()>;
    /// Deliver `payload` to every queue currently bound to `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
    /// Non-blockingly take and remove everything queued on `queue`.
    async fn drain(&self, queue: &str) -> Result<Vec<String>>;
}

const PUBLISH_SCRIPT: &str = r#"
    local queues = redis.call('SMEMBERS', KEYS[1])
    for _, q in ipairs(queues) do
        redis.call('RPUSH', 'beacon:queue:' .. q, ARGV[1])
        redis.call('EXPIRE', 'beacon:queue:' .. q, ARGV[2])
    end
    return #queues
    "#;

const DRAIN_SCRIPT: &str = r#"
    local items = redis.call('LRANGE', KEYS[1], 0, -1)
    redis.call('DEL', KEYS[1])
    return items
    "#;

const BIND_SCRIPT: &str = r#"
    redis.call('SADD', KEYS[1], ARGV[1])
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return 1
    "#;

/// Idle connections parked for reuse. A connection parked longer than
/// `keep_for` is dropped rather than handed out; at most `max_idle` are
/// kept.
struct ConnPool<C> {
    idle: Mutex<VecDeque<(C, Instant)>>,
    max_idle: usize,
    keep_for: Duration,
}

impl<C> ConnPool<C> {
    fn new(max_idle: usize, keep_for: Duration) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            max_idle,
            keep_for,
        }
    }

    async fn take(&self) -> Option<C> {
        let mut idle = self.idle.lock().await;
        // newest first; once the newest is stale, so is everything older
        while let Some((conn, parked)) = idle.pop_back() {
            if parked.elapsed() < self.keep_for {
                return Some(conn);
            }
            idle.clear();
        }
        None
    }

    async fn put(&self, conn: C) {
        let mut idle = self.idle.lock().await;
        while let Some((_, parked)) = idle.front() {
            if parked.elapsed() < self.keep_for {
                break;
            }
            idle.pop_front();
        }
        if idle.len() < self.max_idle {
            idle.push_back((conn, Instant::now()));
        }
    }
}

/// Redis-backed exchange: one set of bound queue names per topic, one list
/// per queue. Every touched key carries an expiry of the subscription TTL
/// so abandoned queues reclaim themselves.
pub struct RedisExchange {
    client: redis::Client,
    pool: ConnPool<Connection>,
    ttl_secs: u64,
}

impl RedisExchange {
    pub fn new(addr: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(addr)?;
        Ok(Self {
            client,
            pool: ConnPool::new(16, Duration::from_secs(10)),
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    async fn conn(&self) -> Result<Connection> {
        if let Some(conn) = self.pool.take().await {
            return Ok(conn);
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(1000)) => {
                Err(anyhow!("connection timeout"))
            }
            result = self.client.get_async_connection() => {
                Ok(result?)
            }
        }
    }

    fn topic_key(topic: &str) -> String {
        format!("beacon:topic:{topic}")
    }

    fn queue_key(queue: &str) -> String {
        format!("beacon:queue:{queue}")
    }

    async fn eval<T: redis::FromRedisValue>(
        &self,
        script: &str,
        key: &str,
        args: &[&str],
    ) -> Result<T> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(1).arg(key);
        for arg in args {
            cmd.arg(arg);
        }
        let result = cmd.query_async(&mut conn).await?;
        self.pool.put(conn).await;
        Ok(result)
    }
}

#[async_trait]
impl TopicExchange for RedisExchange {
    async fn bind(&self, queue: &str, topic: &str) -> Result<()> {
        let _: i64 = self
            .eval(
                BIND_SCRIPT,
                &Self::topic_key(topic),
                &[queue, &self.ttl_secs.to_string()],
            )
            .await?;
        Ok(())
    }

    async fn unbind(&self, queue: &str, topic: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("SREM")
            .arg(Self::topic_key(topic))
            .arg(queue)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("DEL")
            .arg(Self::queue_key(queue))
            .query_async(&mut conn)
            .await?;
        self.pool.put(conn).await;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let _: i64 = self
            .eval(
                PUBLISH_SCRIPT,
                &Self::topic_key(topic),
                &[payload, &self.ttl_secs.to_string()],
            )
            .await?;
        Ok(())
    }

    async fn drain(&self, queue: &str) -> Result<Vec<String>> {
        self.eval(DRAIN_SCRIPT, &Self::queue_key(queue), &[]).await
    }
}

#[derive(Default)]
struct MemoryInner {
    bindings: HashMap<String, HashSet<String>>,
    queues: HashMap<String, VecDeque<String>>,
}

/// In-process exchange with the same semantics, for tests and single-node
/// deployments without a transport.
#[derive(Default)]
pub struct MemoryExchange {
    inner: Mutex<MemoryInner>,
}

impl MemoryExchange {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopicExchange for MemoryExchange {
    async fn bind(&self, queue: &str, topic: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .bindings
            .entry(topic.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn unbind(&self, queue: &str, topic: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(queues) = inner.bindings.get_mut(topic) {
            queues.remove(queue);
        }
        inner.queues.remove(queue);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let queues = inner.bindings.get(topic).cloned().unwrap_or_default();
        for queue in queues {
            inner
                .queues
                .entry(queue)
                .or_default()
                .push_back(payload.to_string());
        }
        Ok(())
    }

    async fn drain(&self, queue: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .queues
            .remove(queue)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_hands_back_fresh_connections_once() {
        let pool = ConnPool::new(4, Duration::from_secs(10));
        pool.put(7u32).await;
        assert_eq!(pool.take().await, Some(7));
        assert_eq!(pool.take().await, None);
    }

    #[tokio::test]
    async fn pool_drops_stale_connections() {
        let pool = ConnPool::new(4, Duration::from_millis(20));
        pool.put(1u32).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.take().await, None);
    }

    #[tokio::test]
    async fn pool_caps_the_number_of_idle_connections() {
        let pool = ConnPool::new(2, Duration::from_secs(10));
        for conn in 0..5u32 {
            pool.put(conn).await;
        }
        assert!(pool.take().await.is_some());
        assert!(pool.take().await.is_some());
        assert_eq!(pool.take().await, None);
    }
}
