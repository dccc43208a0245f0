use std::sync::Arc;

use beacon_db::error::{ApiError, ApiResult};
use beacon_db::message::CommandMethod;
use beacon_db::models::{Channel, Command};
use beacon_db::store::Store;
use serde_json::json;
use tracing::{info, warn};

use crate::notify::Notifier;

pub struct ChannelQueue {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
}

impl ChannelQueue {
    pub fn new(store: Arc<Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// A re-registering instance replaces its previous channel and gets a
    /// sequence-0 resync marker on the fresh queue.
    pub async fn register(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> ApiResult<Channel> {
        self.store
            .get_user(user_id)
            .await
            .ok_or(ApiError::NotFound("user"))?;

        let replaced =
            if let Some(old) = self.store.channel_by_instance(user_id, instance_id).await
            {
                let _guard = self.store.lock_channel(&old.id).await;
                self.store.remove_channel(&old.id).await;
                info!("channel {} replaced by re-registration", old.id);
                true
            } else {
                false
            };

        let channel = Channel::new(user_id, instance_id);
        self.store.insert_channel(channel.clone()).await;
        if replaced {
            self.enqueue_marker(&channel.id, CommandMethod::Resync, json!({}))
                .await?;
        }
        Ok(channel)
    }

    pub async fn deregister(&self, channel_id: &str) -> ApiResult<()> {
        let _guard = self.store.lock_channel(channel_id).await;
        self.store
            .remove_channel(channel_id)
            .await
            .ok_or(ApiError::NotFound("channel"))?;
        Ok(())
    }

    pub async fn enqueue(
        &self,
        channel_id: &str,
        method: CommandMethod,
        params: serde_json::Value,
    ) -> ApiResult<Command> {
        let channel;
        let command;
        {
            let _guard = self.store.lock_channel(channel_id).await;
            let mut ch = self
                .store
                .get_channel(channel_id)
                .await
                .ok_or(ApiError::NotFound("channel"))?;
            if !ch.enabled {
                return Err(ApiError::NotFound("channel"));
            }

            if method.consolidates() {
                let dropped = self
                    .store
                    .remove_undelivered(
                        channel_id,
                        &method,
                        ch.last_sequence_delivered,
                    )
                    .await;
                if dropped > 0 {
                    info!(
                        "consolidated {dropped} undelivered {method} on channel {channel_id}",
                    );
                }
            }

            let sequence = ch.last_sequence_issued;
            ch.last_sequence_issued += 1;
            ch.badge += 1;
            let cmd =
                Command::new(channel_id, sequence, method.clone(), params);
            self.store.push_command(cmd.clone()).await;
            self.store.update_channel(ch.clone()).await;
            channel = ch;
            command = cmd;
        }
        self.notifier
            .send(&channel, &command.method.to_string(), channel.badge);
        Ok(command)
    }

    /// Sequence-0 always-deliver marker; survives acknowledgement, a new
    /// one replaces an older marker of the same method.
    pub async fn enqueue_marker(
        &self,
        channel_id: &str,
        method: CommandMethod,
        params: serde_json::Value,
    ) -> ApiResult<Command> {
        let channel;
        let command;
        {
            let _guard = self.store.lock_channel(channel_id).await;
            let mut ch = self
                .store
                .get_channel(channel_id)
                .await
                .ok_or(ApiError::NotFound("channel"))?;
            ch.badge += 1;
            let cmd = Command::new(channel_id, 0, method, params);
            self.store.push_command(cmd.clone()).await;
            self.store.update_channel(ch.clone()).await;
            channel = ch;
            command = cmd;
        }
        self.notifier
            .send(&channel, &command.method.to_string(), channel.badge);
        Ok(command)
    }

    pub async fn enqueue_user(
        &self,
        user_id: &str,
        method: CommandMethod,
        params: serde_json::Value,
    ) -> ApiResult<Vec<Command>> {
        self.store
            .get_user(user_id)
            .await
            .ok_or(ApiError::NotFound("user"))?;
        let mut commands = Vec::new();
        for channel in self.store.channels_of_user(user_id).await {
            if !channel.enabled {
                continue;
            }
            match self
                .enqueue(&channel.id, method.clone(), params.clone())
                .await
            {
                Ok(command) => commands.push(command),
                Err(e) => {
                    warn!("fan-out to channel {} failed: {e}", channel.id)
                }
            }
        }
        Ok(commands)
    }

    /// `last_seq` acknowledges everything at or below it; the response is
    /// every remaining command above it plus all sequence-0 markers.
    pub async fn poll(
        &self,
        channel_id: &str,
        last_seq: i64,
    ) -> ApiResult<Vec<Command>> {
        let _guard = self.store.lock_channel(channel_id).await;
        let mut ch = self
            .store
            .get_channel(channel_id)
            .await
            .ok_or(ApiError::NotFound("channel"))?;

        self.store.remove_acked(channel_id, last_seq).await;
        ch.last_sequence_exec = last_seq;
        ch.badge = 0;

        let commands = self.store.commands_after(channel_id, last_seq).await;
        if let Some(max) = commands.iter().map(|c| c.sequence).max() {
            if max > ch.last_sequence_delivered {
                ch.last_sequence_delivered = max;
            }
        }
        self.store.update_channel(ch).await;
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;
    use std::sync::Mutex;

    /// Records every push so tests can assert on fire-and-forget behavior.
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, String, i64)>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl Notifier for RecordingNotifier {
        fn send(&self, channel: &Channel, message: &str, badge: i64) {
            self.sent.lock().unwrap().push((
                channel.id.clone(),
                message.to_string(),
                badge,
            ));
        }
    }

    async fn queue_with_channel() -> (ChannelQueue, Channel) {
        let store = Store::new();
        let user = store.create_user("alice").await;
        let queue = ChannelQueue::new(store, Arc::new(NullNotifier));
        let channel = queue.register(&user.id, "device-1").await.unwrap();
        (queue, channel)
    }

    #[tokio::test]
    async fn sequences_are_contiguous_and_monotonic() {
        let (queue, channel) = queue_with_channel().await;
        for expected in 1..=4 {
            let cmd = queue
                .enqueue(&channel.id, CommandMethod::Message, json!({}))
                .await
                .unwrap();
            assert_eq!(cmd.sequence, expected);
        }
    }

    #[tokio::test]
    async fn poll_acknowledges_and_returns_suffix() {
        // scenario: commands at sequence 1..5, poll with 3
        let (queue, channel) = queue_with_channel().await;
        for _ in 0..5 {
            queue
                .enqueue(&channel.id, CommandMethod::Message, json!({}))
                .await
                .unwrap();
        }

        let returned = queue.poll(&channel.id, 3).await.unwrap();
        let sequences: Vec<i64> =
            returned.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![4, 5]);

        let ch = queue.store.get_channel(&channel.id).await.unwrap();
        assert_eq!(ch.last_sequence_exec, 3);
        assert_eq!(ch.badge, 0);

        // acknowledged commands are gone for good
        let again = queue.poll(&channel.id, 0).await.unwrap();
        let sequences: Vec<i64> = again.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![4, 5]);
    }

    #[tokio::test]
    async fn repeated_poll_is_idempotent_before_ack() {
        let (queue, channel) = queue_with_channel().await;
        for _ in 0..3 {
            queue
                .enqueue(&channel.id, CommandMethod::Message, json!({}))
                .await
                .unwrap();
        }
        let first = queue.poll(&channel.id, 1).await.unwrap();
        let second = queue.poll(&channel.id, 1).await.unwrap();
        assert_eq!(
            first.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            second.iter().map(|c| c.sequence).collect::<Vec<_>>(),
        );
    }

    #[tokio::test]
    async fn markers_survive_acknowledgement() {
        let (queue, channel) = queue_with_channel().await;
        queue
            .enqueue_marker(&channel.id, CommandMethod::Resync, json!({}))
            .await
            .unwrap();
        queue
            .enqueue(&channel.id, CommandMethod::Message, json!({}))
            .await
            .unwrap();

        let returned = queue.poll(&channel.id, 1).await.unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].sequence, 0);
        assert_eq!(returned[0].method, CommandMethod::Resync);

        // still there on the next poll
        let returned = queue.poll(&channel.id, 1).await.unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].sequence, 0);
    }

    #[tokio::test]
    async fn undelivered_bootstrap_commands_consolidate() {
        let (queue, channel) = queue_with_channel().await;
        queue
            .enqueue(&channel.id, CommandMethod::SyncContacts, json!({}))
            .await
            .unwrap();
        queue
            .enqueue(&channel.id, CommandMethod::SyncContacts, json!({}))
            .await
            .unwrap();

        let returned = queue.poll(&channel.id, 0).await.unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].sequence, 2);
    }

    #[tokio::test]
    async fn delivered_commands_are_exempt_from_consolidation() {
        let (queue, channel) = queue_with_channel().await;
        queue
            .enqueue(&channel.id, CommandMethod::SyncContacts, json!({}))
            .await
            .unwrap();
        // delivered but not acknowledged
        queue.poll(&channel.id, 0).await.unwrap();

        queue
            .enqueue(&channel.id, CommandMethod::SyncContacts, json!({}))
            .await
            .unwrap();
        let returned = queue.poll(&channel.id, 0).await.unwrap();
        let sequences: Vec<i64> =
            returned.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn reregistration_replaces_channel_and_plants_marker() {
        let store = Store::new();
        let user = store.create_user("alice").await;
        let queue = ChannelQueue::new(store.clone(), Arc::new(NullNotifier));

        let first = queue.register(&user.id, "device-1").await.unwrap();
        queue
            .enqueue(&first.id, CommandMethod::Message, json!({}))
            .await
            .unwrap();

        let second = queue.register(&user.id, "device-1").await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(store.get_channel(&first.id).await.is_none());

        let returned = queue.poll(&second.id, 0).await.unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].method, CommandMethod::Resync);
        assert_eq!(returned[0].sequence, 0);
    }

    #[tokio::test]
    async fn enqueue_notifies_with_badge_count() {
        let store = Store::new();
        let user = store.create_user("alice").await;
        let notifier = RecordingNotifier::new();
        let queue = ChannelQueue::new(store, notifier.clone());
        let channel = queue.register(&user.id, "device-1").await.unwrap();

        queue
            .enqueue(&channel.id, CommandMethod::Message, json!({}))
            .await
            .unwrap();
        queue
            .enqueue(&channel.id, CommandMethod::Message, json!({}))
            .await
            .unwrap();

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (channel.id.clone(), "message".to_string(), 1));
        assert_eq!(sent[1], (channel.id.clone(), "message".to_string(), 2));
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let store = Store::new();
        let queue = ChannelQueue::new(store, Arc::new(NullNotifier));
        assert_eq!(
            queue.poll("missing", 0).await,
            Err(ApiError::NotFound("channel"))
        );
        assert_eq!(
            queue
                .enqueue("missing", CommandMethod::Message, json!({}))
                .await
                .err(),
            Some(ApiError::NotFound("channel"))
        );
    }
}
