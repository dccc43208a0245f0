use std::sync::Arc;

use beacon_db::error::{ApiError, ApiResult};
use beacon_db::message::CommandMethod;
use beacon_db::models::{Call, CallState, Channel};
use beacon_db::store::Store;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::channel::ChannelQueue;

/// Call state machine: Ringing -> Confirmed -> Terminated, never backwards
/// and never revived. Every transition validates under the call's
/// exclusive lock, so of two racing requests the loser sees the already
/// updated state and fails deterministically.
pub struct CallSignaling {
    store: Arc<Store>,
    queue: Arc<ChannelQueue>,
}

impl CallSignaling {
    pub fn new(store: Arc<Store>, queue: Arc<ChannelQueue>) -> Self {
        Self { store, queue }
    }

    /// Start ringing: the dial command fans out to every channel the
    /// callee currently has registered.
    pub async fn dial(
        &self,
        invoker_channel: &str,
        callee_user: &str,
    ) -> ApiResult<Call> {
        let invoker = self
            .store
            .get_channel(invoker_channel)
            .await
            .ok_or(ApiError::NotFound("channel"))?;
        let callee = self
            .store
            .get_user(callee_user)
            .await
            .ok_or(ApiError::NotFound("user"))?;

        let call = Call::new(&invoker.user_id, &invoker.id, &callee.id);
        self.store.insert_call(call.clone()).await;
        info!("call {} ringing {}", call.id, callee.id);

        self.queue
            .enqueue_user(
                &callee.id,
                CommandMethod::Dial,
                json!({"call": call.id, "from_user": call.from_user}),
            )
            .await?;
        Ok(call)
    }

    /// Bind the accepting channel and cancel ringing everywhere else.
    pub async fn accept(
        &self,
        call_id: &str,
        receiver_channel: &str,
    ) -> ApiResult<Call> {
        let _guard = self.store.lock_call(call_id).await;
        let mut call = self
            .store
            .get_call(call_id)
            .await
            .ok_or(ApiError::NotFound("call"))?;
        if call.state != CallState::Ringing {
            return Err(ApiError::CallAlreadyAccepted);
        }
        let receiver = self
            .store
            .get_channel(receiver_channel)
            .await
            .ok_or(ApiError::NotFound("channel"))?;
        if receiver.user_id != call.to_user {
            return Err(ApiError::InvalidData(
                "channel does not belong to the callee".to_string(),
            ));
        }

        call.state = CallState::Confirmed;
        call.to_channel = Some(receiver.id.clone());
        call.accepted_at = Some(Utc::now());
        self.store.update_call(call.clone()).await;
        info!("call {} confirmed on channel {}", call.id, receiver.id);

        let params = json!({"call": call.id});
        self.send(&receiver.id, CommandMethod::Accept, &params).await;
        self.send(&call.from_channel, CommandMethod::Accept, &params)
            .await;
        for channel in self.other_channels(&call.to_user, &receiver.id).await {
            self.send(&channel.id, CommandMethod::Terminate, &params)
                .await;
        }
        Ok(call)
    }

    /// Valid from Ringing or Confirmed; terminating an already terminated
    /// call is an idempotent no-op. Informs the counterpart channels that
    /// have not already seen the outcome.
    pub async fn terminate(
        &self,
        call_id: &str,
        by_channel: &str,
    ) -> ApiResult<Call> {
        let _guard = self.store.lock_call(call_id).await;
        let mut call = self
            .store
            .get_call(call_id)
            .await
            .ok_or(ApiError::NotFound("call"))?;
        if call.state == CallState::Terminated {
            return Ok(call);
        }

        let was_ringing = call.state == CallState::Ringing;
        if let Some(accepted_at) = call.accepted_at {
            call.duration = Some((Utc::now() - accepted_at).num_seconds());
        }
        call.state = CallState::Terminated;
        self.store.update_call(call.clone()).await;
        info!(
            "call {} terminated by channel {by_channel}, duration {:?}",
            call.id, call.duration
        );

        let params = json!({"call": call.id});
        let mut targets: Vec<String> = Vec::new();
        if was_ringing {
            // ringing stops on every callee channel; the invoker learns of
            // a callee-side hangup
            for channel in self.other_channels(&call.to_user, by_channel).await
            {
                targets.push(channel.id);
            }
            if call.from_channel != by_channel {
                targets.push(call.from_channel.clone());
            }
        } else {
            for id in [Some(call.from_channel.clone()), call.to_channel.clone()]
                .into_iter()
                .flatten()
            {
                if id != by_channel {
                    targets.push(id);
                }
            }
        }
        for id in targets {
            self.send(&id, CommandMethod::Terminate, &params).await;
        }
        Ok(call)
    }

    /// Forward transient mute flags to the other party's bound channel.
    /// Only meaningful once the call is confirmed.
    pub async fn mute(
        &self,
        call_id: &str,
        by_channel: &str,
        video_off: bool,
        sound_off: bool,
    ) -> ApiResult<()> {
        let _guard = self.store.lock_call(call_id).await;
        let call = self
            .store
            .get_call(call_id)
            .await
            .ok_or(ApiError::NotFound("call"))?;
        if call.state != CallState::Confirmed {
            return Err(ApiError::CallNotAccepted);
        }
        let to_channel = call.to_channel.as_deref().ok_or_else(|| {
            ApiError::InvalidData("confirmed call has no bound channel".into())
        })?;
        let target = if by_channel == call.from_channel {
            to_channel
        } else if by_channel == to_channel {
            &call.from_channel
        } else {
            return Err(ApiError::InvalidData(
                "channel is not part of the call".to_string(),
            ));
        };
        self.send(
            target,
            CommandMethod::Mute,
            &json!({
                "call": call.id,
                "video_off": video_off,
                "sound_off": sound_off,
            }),
        )
        .await;
        Ok(())
    }

    async fn other_channels(
        &self,
        user_id: &str,
        except: &str,
    ) -> Vec<Channel> {
        self.store
            .channels_of_user(user_id)
            .await
            .into_iter()
            .filter(|c| c.enabled && c.id != except)
            .collect()
    }

    /// Signal fan-outs are best effort: a channel that vanished mid-flight
    /// must not fail the transition that already happened.
    async fn send(
        &self,
        channel_id: &str,
        method: CommandMethod,
        params: &serde_json::Value,
    ) {
        if let Err(e) =
            self.queue.enqueue(channel_id, method, params.clone()).await
        {
            warn!("signal to channel {channel_id} failed: {e}");
        }
    }
}
