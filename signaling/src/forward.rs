use std::sync::Arc;

use beacon_db::error::{ApiError, ApiResult};
use beacon_db::message::CommandMethod;
use beacon_db::models::{CallForward, CallForwardState, CallState};
use beacon_db::store::Store;
use serde_json::json;
use tracing::{info, warn};

use crate::channel::ChannelQueue;

/// Operator-mediated transfer joining two confirmed calls.
/// Setup -> Ack -> Established -> Terminated, strictly forward.
pub struct CallForwarding {
    store: Arc<Store>,
    queue: Arc<ChannelQueue>,
}

impl CallForwarding {
    pub fn new(store: Arc<Store>, queue: Arc<ChannelQueue>) -> Self {
        Self { store, queue }
    }

    /// Resolves the legs from the dispatcher's confirmed calls; when
    /// several match the same counterpart, the last match in scan order
    /// wins.
    pub async fn setup(
        &self,
        dispatcher_channel: &str,
        from_user: &str,
        to_user: &str,
    ) -> ApiResult<CallForward> {
        let dispatcher = self
            .store
            .get_channel(dispatcher_channel)
            .await
            .ok_or(ApiError::NotFound("channel"))?;

        let mut caller_leg = None;
        let mut callee_leg = None;
        for call in self
            .store
            .confirmed_calls_of_user(&dispatcher.user_id)
            .await
        {
            debug_assert_eq!(call.state, CallState::Confirmed);
            let (peer_user, peer_channel) =
                if call.from_user == dispatcher.user_id {
                    (call.to_user.clone(), call.to_channel.clone())
                } else {
                    (call.from_user.clone(), Some(call.from_channel.clone()))
                };
            let Some(peer_channel) = peer_channel else {
                continue;
            };
            if peer_user == from_user {
                caller_leg = Some((call.id.clone(), peer_channel.clone()));
            }
            if peer_user == to_user {
                callee_leg = Some((call.id.clone(), peer_channel));
            }
        }

        let (caller_call, caller_channel) = caller_leg.ok_or_else(|| {
            ApiError::InvalidData(format!(
                "no confirmed call between dispatcher and {from_user}"
            ))
        })?;
        let (callee_call, callee_channel) = callee_leg.ok_or_else(|| {
            ApiError::InvalidData(format!(
                "no confirmed call between dispatcher and {to_user}"
            ))
        })?;

        // both legs now belong to the transfer
        for call_id in [&caller_call, &callee_call] {
            let _guard = self.store.lock_call(call_id).await;
            if let Some(mut call) = self.store.get_call(call_id).await {
                call.forward = true;
                self.store.update_call(call).await;
            }
        }

        let fwd = CallForward {
            id: beacon_utils::uuid(),
            state: CallForwardState::Setup,
            dispatcher_user: dispatcher.user_id.clone(),
            dispatcher_channel: dispatcher.id.clone(),
            caller_user: from_user.to_string(),
            caller_channel,
            callee_user: to_user.to_string(),
            callee_channel,
            failed: false,
        };
        self.store.insert_forward(fwd.clone()).await;
        info!("call forward {} set up by {}", fwd.id, dispatcher.id);
        self.propagate(&fwd, CommandMethod::CallFwdSetup).await;
        Ok(fwd)
    }

    pub async fn ack(
        &self,
        fwd_id: &str,
        callee_channel: &str,
    ) -> ApiResult<CallForward> {
        let _guard = self.store.lock_forward(fwd_id).await;
        let mut fwd = self
            .store
            .get_forward(fwd_id)
            .await
            .ok_or(ApiError::NotFound("call forward"))?;
        if fwd.callee_channel != callee_channel {
            return Err(ApiError::InvalidData(
                "callee channel mismatch".to_string(),
            ));
        }
        if fwd.state != CallForwardState::Setup {
            return Err(ApiError::CallFwdAlreadyAck);
        }
        fwd.state = CallForwardState::Ack;
        self.store.update_forward(fwd.clone()).await;
        self.propagate(&fwd, CommandMethod::CallFwdAck).await;
        Ok(fwd)
    }

    pub async fn establish(
        &self,
        fwd_id: &str,
        callee_channel: &str,
    ) -> ApiResult<CallForward> {
        let _guard = self.store.lock_forward(fwd_id).await;
        let mut fwd = self
            .store
            .get_forward(fwd_id)
            .await
            .ok_or(ApiError::NotFound("call forward"))?;
        if fwd.callee_channel != callee_channel {
            return Err(ApiError::InvalidData(
                "callee channel mismatch".to_string(),
            ));
        }
        match fwd.state {
            CallForwardState::Ack => {}
            CallForwardState::Setup => {
                return Err(ApiError::CallFwdAlreadyAck)
            }
            _ => return Err(ApiError::CallFwdAlreadyEstablished),
        }
        fwd.state = CallForwardState::Established;
        self.store.update_forward(fwd.clone()).await;
        info!("call forward {} established", fwd.id);
        self.propagate(&fwd, CommandMethod::CallFwdEstablished).await;
        Ok(fwd)
    }

    /// Terminating twice is an idempotent no-op.
    pub async fn terminate(
        &self,
        fwd_id: &str,
        failed: bool,
    ) -> ApiResult<CallForward> {
        let _guard = self.store.lock_forward(fwd_id).await;
        let mut fwd = self
            .store
            .get_forward(fwd_id)
            .await
            .ok_or(ApiError::NotFound("call forward"))?;
        if fwd.state == CallForwardState::Terminated {
            return Ok(fwd);
        }
        fwd.state = CallForwardState::Terminated;
        fwd.failed = failed;
        self.store.update_forward(fwd.clone()).await;
        info!("call forward {} terminated, failed={failed}", fwd.id);
        self.propagate(&fwd, CommandMethod::CallFwdTerminated).await;
        Ok(fwd)
    }

    // only the dispatcher channel and the two offered channels, never the
    // users' other devices
    async fn propagate(&self, fwd: &CallForward, method: CommandMethod) {
        let params = json!({
            "fwd": fwd.id,
            "state": fwd.state,
            "from_user": fwd.caller_user,
            "to_user": fwd.callee_user,
            "failed": fwd.failed,
        });
        for channel in [
            &fwd.dispatcher_channel,
            &fwd.caller_channel,
            &fwd.callee_channel,
        ] {
            if let Err(e) =
                self.queue.enqueue(channel, method.clone(), params.clone()).await
            {
                warn!("call forward signal to channel {channel} failed: {e}");
            }
        }
    }
}
