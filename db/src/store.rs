use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use itertools::Itertools;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::models::{
    Call, CallForward, CallForwardState, CallState, Channel, Command, User,
};

/// Hands out one async mutex per entity id. The in-process analogue of a
/// row lock: holders serialize on the entity without blocking unrelated
/// entities.
#[derive(Default)]
pub struct LockRegistry {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn remove(&self, key: &str) {
        self.locks.lock().unwrap().remove(key);
    }
}

/// A channel's stored commands. Sequenced commands are keyed by sequence;
/// sequence-0 markers live apart because acknowledgement never deletes
/// them.
#[derive(Default, Debug, Clone)]
pub struct CommandLog {
    pub queued: BTreeMap<i64, Command>,
    pub markers: Vec<Command>,
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    channels: HashMap<String, Channel>,
    user_channels: HashMap<String, Vec<String>>,
    commands: HashMap<String, CommandLog>,
    calls: HashMap<String, Call>,
    forwards: HashMap<String, CallForward>,
}

/// Id-indexed entity tables. Individual accessors are atomic; multi-step
/// mutations of one entity take the entity's lock from the registry first.
#[derive(Default)]
pub struct Store {
    tables: RwLock<Tables>,
    locks: LockRegistry,
}

impl Store {
    pub fn new() -> Arc<Store> {
        Arc::new(Store::default())
    }

    pub async fn lock_channel(&self, id: &str) -> OwnedMutexGuard<()> {
        self.locks.get(&format!("channel:{id}")).lock_owned().await
    }

    pub async fn lock_call(&self, id: &str) -> OwnedMutexGuard<()> {
        self.locks.get(&format!("call:{id}")).lock_owned().await
    }

    pub async fn lock_forward(&self, id: &str) -> OwnedMutexGuard<()> {
        self.locks.get(&format!("fwd:{id}")).lock_owned().await
    }

    pub async fn create_user(&self, name: &str) -> User {
        let user = User::new(name);
        let mut tables = self.tables.write().await;
        tables.users.insert(user.id.clone(), user.clone());
        user
    }

    pub async fn get_user(&self, id: &str) -> Option<User> {
        self.tables.read().await.users.get(id).cloned()
    }

    pub async fn insert_channel(&self, channel: Channel) {
        let mut tables = self.tables.write().await;
        tables
            .user_channels
            .entry(channel.user_id.clone())
            .or_default()
            .push(channel.id.clone());
        tables
            .commands
            .insert(channel.id.clone(), CommandLog::default());
        tables.channels.insert(channel.id.clone(), channel);
    }

    pub async fn get_channel(&self, id: &str) -> Option<Channel> {
        self.tables.read().await.channels.get(id).cloned()
    }

    pub async fn update_channel(&self, channel: Channel) {
        let mut tables = self.tables.write().await;
        tables.channels.insert(channel.id.clone(), channel);
    }

    pub async fn remove_channel(&self, id: &str) -> Option<Channel> {
        let mut tables = self.tables.write().await;
        let channel = tables.channels.remove(id)?;
        tables.commands.remove(id);
        if let Some(ids) = tables.user_channels.get_mut(&channel.user_id) {
            ids.retain(|c| c != id);
        }
        Some(channel)
    }

    pub async fn channels_of_user(&self, user_id: &str) -> Vec<Channel> {
        let tables = self.tables.read().await;
        tables
            .user_channels
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.channels.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn channel_by_instance(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> Option<Channel> {
        self.channels_of_user(user_id)
            .await
            .into_iter()
            .find(|c| c.instance_id == instance_id)
    }

    /// Store a command. A sequence-0 marker replaces any existing marker of
    /// the same method.
    pub async fn push_command(&self, command: Command) {
        let mut tables = self.tables.write().await;
        let log = tables
            .commands
            .entry(command.channel_id.clone())
            .or_default();
        if command.sequence == 0 {
            log.markers.retain(|m| m.method != command.method);
            log.markers.push(command);
        } else {
            log.queued.insert(command.sequence, command);
        }
    }

    /// Acknowledgement cleanup: drop every sequenced command with
    /// `0 < seq <= upto`. Markers are untouched.
    pub async fn remove_acked(&self, channel_id: &str, upto: i64) {
        let mut tables = self.tables.write().await;
        if let Some(log) = tables.commands.get_mut(channel_id) {
            log.queued = log.queued.split_off(&(upto + 1));
        }
    }

    /// All markers plus every sequenced command with `seq > last`, in
    /// sequence order.
    pub async fn commands_after(
        &self,
        channel_id: &str,
        last: i64,
    ) -> Vec<Command> {
        let tables = self.tables.read().await;
        let Some(log) = tables.commands.get(channel_id) else {
            return Vec::new();
        };
        log.markers
            .iter()
            .chain(log.queued.range(last + 1..).map(|(_, c)| c))
            .cloned()
            .sorted_by_key(|c| c.sequence)
            .collect()
    }

    /// Consolidation: remove sequenced commands of `method` that no poll
    /// has returned yet (sequence above `delivered`). Returns how many were
    /// dropped.
    pub async fn remove_undelivered(
        &self,
        channel_id: &str,
        method: &crate::message::CommandMethod,
        delivered: i64,
    ) -> usize {
        let mut tables = self.tables.write().await;
        let Some(log) = tables.commands.get_mut(channel_id) else {
            return 0;
        };
        let stale: Vec<i64> = log
            .queued
            .range(delivered + 1..)
            .filter(|(_, c)| &c.method == method)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &stale {
            log.queued.remove(seq);
        }
        stale.len()
    }

    pub async fn insert_call(&self, call: Call) {
        let mut tables = self.tables.write().await;
        tables.calls.insert(call.id.clone(), call);
    }

    pub async fn get_call(&self, id: &str) -> Option<Call> {
        self.tables.read().await.calls.get(id).cloned()
    }

    pub async fn update_call(&self, call: Call) {
        let mut tables = self.tables.write().await;
        tables.calls.insert(call.id.clone(), call);
    }

    /// Confirmed calls the user participates in, oldest first by creation
    /// order of the scan (map order is unspecified, so callers needing a
    /// deterministic scan sort by call id).
    pub async fn confirmed_calls_of_user(&self, user_id: &str) -> Vec<Call> {
        let tables = self.tables.read().await;
        tables
            .calls
            .values()
            .filter(|c| {
                c.state == CallState::Confirmed
                    && (c.from_user == user_id || c.to_user == user_id)
            })
            .cloned()
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect()
    }

    /// Reclaim terminal records: drop Terminated calls and forwards along
    /// with their lock-registry entries. Terminal records are never mutated
    /// again, so nothing can race the removal.
    pub async fn purge_terminated(&self) -> usize {
        let mut tables = self.tables.write().await;
        let calls: Vec<String> = tables
            .calls
            .values()
            .filter(|c| c.state == CallState::Terminated)
            .map(|c| c.id.clone())
            .collect();
        for id in &calls {
            tables.calls.remove(id);
            self.locks.remove(&format!("call:{id}"));
        }
        let forwards: Vec<String> = tables
            .forwards
            .values()
            .filter(|f| f.state == CallForwardState::Terminated)
            .map(|f| f.id.clone())
            .collect();
        for id in &forwards {
            tables.forwards.remove(id);
            self.locks.remove(&format!("fwd:{id}"));
        }
        calls.len() + forwards.len()
    }

    pub async fn insert_forward(&self, fwd: CallForward) {
        let mut tables = self.tables.write().await;
        tables.forwards.insert(fwd.id.clone(), fwd);
    }

    pub async fn get_forward(&self, id: &str) -> Option<CallForward> {
        self.tables.read().await.forwards.get(id).cloned()
    }

    pub async fn update_forward(&self, fwd: CallForward) {
        let mut tables = self.tables.write().await;
        tables.forwards.insert(fwd.id.clone(), fwd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CommandMethod;

    #[tokio::test]
    async fn channel_index_follows_membership() {
        let store = Store::new();
        let user = store.create_user("alice").await;
        let channel = Channel::new(&user.id, "device-1");
        store.insert_channel(channel.clone()).await;
        assert_eq!(store.channels_of_user(&user.id).await.len(), 1);
        assert!(store
            .channel_by_instance(&user.id, "device-1")
            .await
            .is_some());

        store.remove_channel(&channel.id).await;
        assert!(store.channels_of_user(&user.id).await.is_empty());
        assert!(store.get_channel(&channel.id).await.is_none());
    }

    #[tokio::test]
    async fn ack_cleanup_spares_markers() {
        let store = Store::new();
        let channel = Channel::new("u", "d");
        store.insert_channel(channel.clone()).await;
        for seq in 1..=5 {
            store
                .push_command(Command::new(
                    &channel.id,
                    seq,
                    CommandMethod::Message,
                    serde_json::json!({}),
                ))
                .await;
        }
        store
            .push_command(Command::new(
                &channel.id,
                0,
                CommandMethod::Resync,
                serde_json::json!({}),
            ))
            .await;

        store.remove_acked(&channel.id, 3).await;
        let rest = store.commands_after(&channel.id, 3).await;
        let sequences: Vec<i64> = rest.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 4, 5]);
    }

    #[tokio::test]
    async fn purge_reclaims_only_terminal_records() {
        let store = Store::new();
        let mut done = Call::new("a", "ch-a", "b");
        done.state = CallState::Terminated;
        store.insert_call(done.clone()).await;
        let live = Call::new("a", "ch-a", "c");
        store.insert_call(live.clone()).await;

        assert_eq!(store.purge_terminated().await, 1);
        assert!(store.get_call(&done.id).await.is_none());
        assert!(store.get_call(&live.id).await.is_some());
    }

    #[tokio::test]
    async fn marker_of_same_method_is_replaced() {
        let store = Store::new();
        let channel = Channel::new("u", "d");
        store.insert_channel(channel.clone()).await;
        store
            .push_command(Command::new(
                &channel.id,
                0,
                CommandMethod::Resync,
                serde_json::json!({"gen": 1}),
            ))
            .await;
        store
            .push_command(Command::new(
                &channel.id,
                0,
                CommandMethod::Resync,
                serde_json::json!({"gen": 2}),
            ))
            .await;

        let all = store.commands_after(&channel.id, 0).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].params["gen"], 2);
    }
}
