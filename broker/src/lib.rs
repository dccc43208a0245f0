//! Ephemeral pub/sub for external pollers. Subscriptions are TTL-bounded
//! registry entries bound to auto-expiring queues on a shared topic
//! exchange; they are a separate surface from persisted channels and make
//! no delivery guarantee across process restarts.

pub mod exchange;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_db::error::{ApiError, ApiResult};
use beacon_db::models::Command;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::exchange::TopicExchange;

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub instance_id: String,
    pub user_id: String,
    pub topics: HashSet<String>,
    pub next_sequence: i64,
    pub last_access: Instant,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Subscription>,
    by_instance: HashMap<String, String>,
    // activity order for the sweep: oldest touch first; entries may be
    // stale, the sweep re-checks actual last access
    touched: VecDeque<(Instant, String)>,
}

pub struct SubscriptionBroker {
    exchange: Arc<dyn TopicExchange>,
    ttl: Duration,
    registry: RwLock<Registry>,
    disabled: AtomicBool,
}

fn queue_name(instance_id: &str, topic: &str) -> String {
    format!("{instance_id}.{topic}")
}

impl SubscriptionBroker {
    pub fn new(
        exchange: Arc<dyn TopicExchange>,
        ttl: Duration,
    ) -> Arc<SubscriptionBroker> {
        Arc::new(SubscriptionBroker {
            exchange,
            ttl,
            registry: RwLock::new(Registry::default()),
            disabled: AtomicBool::new(false),
        })
    }

    /// Fixed-delay eviction sweep; a single task, so runs never overlap.
    pub fn start_eviction(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                broker.sweep().await;
            }
        })
    }

    /// Register (or refresh) the caller's subscription. The same device
    /// instance gets back the logically same subscription, topic bindings
    /// intact, under a fresh ephemeral id.
    pub async fn subscribe(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> ApiResult<String> {
        let mut registry = self.registry.write().await;
        let now = Instant::now();
        let id = beacon_utils::rand_string(32);

        if let Some(old_id) = registry.by_instance.get(instance_id).cloned() {
            if let Some(existing) = registry.by_id.get(&old_id) {
                if existing.user_id != user_id {
                    return Err(ApiError::AccessDenied);
                }
            }
            if let Some(mut sub) = registry.by_id.remove(&old_id) {
                sub.id = id.clone();
                sub.last_access = now;
                registry.by_id.insert(id.clone(), sub);
                registry
                    .by_instance
                    .insert(instance_id.to_string(), id.clone());
                registry.touched.push_back((now, id.clone()));
                return Ok(id);
            }
        }

        let sub = Subscription {
            id: id.clone(),
            instance_id: instance_id.to_string(),
            user_id: user_id.to_string(),
            topics: HashSet::new(),
            next_sequence: 1,
            last_access: now,
        };
        registry.by_id.insert(id.clone(), sub);
        registry
            .by_instance
            .insert(instance_id.to_string(), id.clone());
        registry.touched.push_back((now, id.clone()));
        Ok(id)
    }

    /// Bind a topic. Adding an already-bound topic only refreshes the
    /// transport binding.
    pub async fn add_topic(
        &self,
        subscription_id: &str,
        user_id: &str,
        topic: &str,
    ) -> ApiResult<()> {
        let mut registry = self.registry.write().await;
        let sub = self.owned(&mut registry, subscription_id, user_id)?;
        let queue = queue_name(&sub.instance_id, topic);
        sub.topics.insert(topic.to_string());
        sub.last_access = Instant::now();
        drop(registry);
        // transport failures here are logged, not surfaced: the queue will
        // be (re)bound on the next refresh and its expiry reclaims leftovers
        if let Err(e) = self.exchange.bind(&queue, topic).await {
            warn!("exchange bind of {queue} failed: {e:#}");
        }
        Ok(())
    }

    pub async fn remove_topic(
        &self,
        subscription_id: &str,
        user_id: &str,
        topic: &str,
    ) -> ApiResult<()> {
        let mut registry = self.registry.write().await;
        let sub = self.owned(&mut registry, subscription_id, user_id)?;
        let queue = queue_name(&sub.instance_id, topic);
        sub.topics.remove(topic);
        sub.last_access = Instant::now();
        drop(registry);
        if let Err(e) = self.exchange.unbind(&queue, topic).await {
            warn!("exchange unbind of {queue} failed: {e:#}");
        }
        Ok(())
    }

    /// Drain every bound queue without blocking and stamp each drained
    /// message with a subscription-local sequence. A message that fails to
    /// decode is dropped alone; the rest of the batch survives.
    pub async fn poll(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> ApiResult<Vec<Command>> {
        let mut registry = self.registry.write().await;
        let sub = self.owned(&mut registry, subscription_id, user_id)?.clone();
        if sub.last_access.elapsed() >= self.ttl {
            registry.by_id.remove(subscription_id);
            registry.by_instance.remove(&sub.instance_id);
            return Err(ApiError::NotFound("subscription"));
        }
        drop(registry);

        let mut drained = Vec::new();
        for topic in &sub.topics {
            let queue = queue_name(&sub.instance_id, topic);
            match self.exchange.drain(&queue).await {
                Ok(messages) => drained.extend(messages),
                Err(e) => warn!("draining {queue} failed: {e:#}"),
            }
        }

        let mut registry = self.registry.write().await;
        let now = Instant::now();
        let sub = self.owned(&mut registry, subscription_id, user_id)?;
        let mut commands = Vec::new();
        for message in drained {
            match serde_json::from_str::<Command>(&message) {
                Ok(mut command) => {
                    command.sequence = sub.next_sequence;
                    sub.next_sequence += 1;
                    commands.push(command);
                }
                Err(e) => {
                    warn!("dropping malformed broker message: {e}");
                }
            }
        }
        sub.last_access = now;
        let id = sub.id.clone();
        registry.touched.push_back((now, id));
        Ok(commands)
    }

    /// Publish one copy of the command per target topic. The first publish
    /// failure disables the broker for the rest of the process's life;
    /// callers are never failed by it.
    pub async fn publish(&self, topics: &[String], command: &Command) {
        if self.disabled.load(Ordering::Relaxed) {
            warn!("broker disabled, dropping publish of {}", command.method);
            return;
        }
        let payload = match serde_json::to_string(command) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("cannot encode command for publish: {e}");
                return;
            }
        };
        for topic in topics {
            if let Err(e) = self.exchange.publish(topic, &payload).await {
                error!("publish to {topic} failed, disabling broker: {e:#}");
                self.disabled.store(true, Ordering::Relaxed);
                return;
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Walk the activity queue oldest-first and evict subscriptions idle
    /// past the TTL. The transport reclaims their queues by expiry on its
    /// own.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut registry = self.registry.write().await;
        while let Some((touched, _)) = registry.touched.front() {
            if now.duration_since(*touched) < self.ttl {
                break;
            }
            let (_, id) = registry.touched.pop_front().unwrap();
            let idle = registry
                .by_id
                .get(&id)
                .map(|s| s.last_access.elapsed() >= self.ttl)
                .unwrap_or(false);
            if idle {
                if let Some(sub) = registry.by_id.remove(&id) {
                    registry.by_instance.remove(&sub.instance_id);
                    info!("evicted idle subscription {id}");
                }
            }
        }
    }

    pub async fn get(&self, subscription_id: &str) -> Option<Subscription> {
        self.registry
            .read()
            .await
            .by_id
            .get(subscription_id)
            .cloned()
    }

    fn owned<'a>(
        &self,
        registry: &'a mut Registry,
        subscription_id: &str,
        user_id: &str,
    ) -> ApiResult<&'a mut Subscription> {
        let sub = registry
            .by_id
            .get_mut(subscription_id)
            .ok_or(ApiError::NotFound("subscription"))?;
        if sub.user_id != user_id {
            return Err(ApiError::AccessDenied);
        }
        Ok(sub)
    }
}
