use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use beacon_db::error::{ApiError, ApiResult};
use beacon_db::message::{
    CallRequest, CommandMethod, DialRequest, FwdRequest, FwdSetupRequest,
    FwdTerminateRequest, MuteRequest, SendMessageRequest,
};
use beacon_db::models::Channel;
use beacon_db::store::Store;
use serde_json::{json, Value};
use strum_macros::{Display, EnumString};
use tracing::debug;

use crate::call::CallSignaling;
use crate::channel::ChannelQueue;
use crate::forward::CallForwarding;

/// Inbound API methods a client may submit on its channel. Distinct from
/// `CommandMethod`: these are requests, the latter are the signals fanned
/// out in response.
#[derive(Display, EnumString, Debug, Clone, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum ApiMethod {
    Dial,
    Accept,
    Terminate,
    Mute,
    CallFwdSetup,
    CallFwdAck,
    CallFwdEstablish,
    CallFwdTerminate,
    SendMessage,
    SyncContacts,
}

/// Absorbs replayed submissions. A client that retries a submit reuses its
/// own sequence number; within the TTL the duplicate is dropped instead of
/// executed twice.
pub struct ReplayGuard {
    ttl: Duration,
    seen: StdMutex<HashMap<(String, i64), Instant>>,
}

impl ReplayGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: StdMutex::new(HashMap::new()),
        }
    }

    /// True exactly once per (channel, sequence) within the TTL.
    pub fn fresh(&self, channel_id: &str, sequence: i64) -> bool {
        let mut seen = self.seen.lock().unwrap();
        let now = Instant::now();
        seen.retain(|_, stamp| now.duration_since(*stamp) < self.ttl);
        match seen.entry((channel_id.to_string(), sequence)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }
}

/// Per-method authorization hook. The default deployment allows every
/// authenticated channel; installations layer tenancy rules on top.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, caller: &Channel, method: &ApiMethod) -> bool;
}

pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _caller: &Channel, _method: &ApiMethod) -> bool {
        true
    }
}

/// Routes inbound envelopes to the call, forward, and messaging
/// operations. Every execution is attributed to the submitting channel.
pub struct Dispatcher {
    store: Arc<Store>,
    queue: Arc<ChannelQueue>,
    calls: Arc<CallSignaling>,
    forwards: Arc<CallForwarding>,
    policy: Arc<dyn AccessPolicy>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<ChannelQueue>,
        calls: Arc<CallSignaling>,
        forwards: Arc<CallForwarding>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        Self {
            store,
            queue,
            calls,
            forwards,
            policy,
        }
    }

    pub async fn execute(
        &self,
        method: &str,
        params: Value,
        caller_channel: &str,
    ) -> ApiResult<Value> {
        let method = ApiMethod::from_str(method).map_err(|_| {
            ApiError::InvalidData(format!("unknown method {method}"))
        })?;
        let caller = self
            .store
            .get_channel(caller_channel)
            .await
            .ok_or(ApiError::NotFound("channel"))?;
        if !self.policy.allows(&caller, &method) {
            return Err(ApiError::AccessDenied);
        }
        debug!("channel {} executes {method}", caller.id);

        match method {
            ApiMethod::Dial => {
                let req: DialRequest = parse(params)?;
                let call = self.calls.dial(&caller.id, &req.user).await?;
                Ok(json!({ "call": call.id }))
            }
            ApiMethod::Accept => {
                let req: CallRequest = parse(params)?;
                let call = self.calls.accept(&req.call, &caller.id).await?;
                Ok(json!({ "call": call.id, "state": call.state }))
            }
            ApiMethod::Terminate => {
                let req: CallRequest = parse(params)?;
                let call =
                    self.calls.terminate(&req.call, &caller.id).await?;
                Ok(json!({
                    "call": call.id,
                    "state": call.state,
                    "duration": call.duration,
                }))
            }
            ApiMethod::Mute => {
                let req: MuteRequest = parse(params)?;
                self.calls
                    .mute(&req.call, &caller.id, req.video_off, req.sound_off)
                    .await?;
                Ok(json!({}))
            }
            ApiMethod::CallFwdSetup => {
                let req: FwdSetupRequest = parse(params)?;
                let fwd = self
                    .forwards
                    .setup(&caller.id, &req.from_user, &req.to_user)
                    .await?;
                Ok(json!({ "fwd": fwd.id, "state": fwd.state }))
            }
            ApiMethod::CallFwdAck => {
                let req: FwdRequest = parse(params)?;
                let fwd = self.forwards.ack(&req.fwd, &caller.id).await?;
                Ok(json!({ "fwd": fwd.id, "state": fwd.state }))
            }
            ApiMethod::CallFwdEstablish => {
                let req: FwdRequest = parse(params)?;
                let fwd =
                    self.forwards.establish(&req.fwd, &caller.id).await?;
                Ok(json!({ "fwd": fwd.id, "state": fwd.state }))
            }
            ApiMethod::CallFwdTerminate => {
                let req: FwdTerminateRequest = parse(params)?;
                let fwd = self
                    .forwards
                    .terminate(&req.fwd, req.failed)
                    .await?;
                Ok(json!({ "fwd": fwd.id, "state": fwd.state }))
            }
            ApiMethod::SendMessage => {
                let req: SendMessageRequest = parse(params)?;
                let commands = self
                    .queue
                    .enqueue_user(
                        &req.user,
                        CommandMethod::Message,
                        json!({ "from_user": caller.user_id, "body": req.body }),
                    )
                    .await?;
                Ok(json!({ "delivered": commands.len() }))
            }
            ApiMethod::SyncContacts => {
                // bootstrap refresh for all of the caller's own devices
                let commands = self
                    .queue
                    .enqueue_user(
                        &caller.user_id,
                        CommandMethod::SyncContacts,
                        json!({}),
                    )
                    .await?;
                Ok(json!({ "delivered": commands.len() }))
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> ApiResult<T> {
    serde_json::from_value(params)
        .map_err(|e| ApiError::InvalidData(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;

    struct DenyForwards;

    impl AccessPolicy for DenyForwards {
        fn allows(&self, _caller: &Channel, method: &ApiMethod) -> bool {
            !matches!(
                method,
                ApiMethod::CallFwdSetup
                    | ApiMethod::CallFwdAck
                    | ApiMethod::CallFwdEstablish
                    | ApiMethod::CallFwdTerminate
            )
        }
    }

    async fn dispatcher_with(
        policy: Arc<dyn AccessPolicy>,
    ) -> (Arc<Store>, Arc<ChannelQueue>, Dispatcher) {
        let store = Store::new();
        let queue = Arc::new(ChannelQueue::new(
            store.clone(),
            Arc::new(NullNotifier),
        ));
        let calls =
            Arc::new(CallSignaling::new(store.clone(), queue.clone()));
        let forwards =
            Arc::new(CallForwarding::new(store.clone(), queue.clone()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            calls,
            forwards,
            policy,
        );
        (store, queue, dispatcher)
    }

    #[test]
    fn replay_guard_absorbs_duplicates_within_ttl() {
        let guard = ReplayGuard::new(Duration::from_millis(30));
        assert!(guard.fresh("chan", 7));
        assert!(!guard.fresh("chan", 7));
        // different channel or sequence is not a replay
        assert!(guard.fresh("chan", 8));
        assert!(guard.fresh("other", 7));

        std::thread::sleep(Duration::from_millis(40));
        assert!(guard.fresh("chan", 7));
    }

    #[tokio::test]
    async fn unknown_method_is_invalid_data() {
        let (store, queue, dispatcher) =
            dispatcher_with(Arc::new(AllowAll)).await;
        let user = store.create_user("alice").await;
        let channel = queue.register(&user.id, "dev").await.unwrap();

        let err = dispatcher
            .execute("reboot_universe", json!({}), &channel.id)
            .await
            .err();
        assert!(matches!(err, Some(ApiError::InvalidData(_))));
    }

    #[tokio::test]
    async fn unknown_caller_channel_is_not_found() {
        let (_store, _queue, dispatcher) =
            dispatcher_with(Arc::new(AllowAll)).await;
        assert_eq!(
            dispatcher.execute("dial", json!({}), "missing").await.err(),
            Some(ApiError::NotFound("channel"))
        );
    }

    #[tokio::test]
    async fn policy_denial_maps_to_access_denied() {
        let (store, queue, dispatcher) =
            dispatcher_with(Arc::new(DenyForwards)).await;
        let user = store.create_user("operator").await;
        let channel = queue.register(&user.id, "dev").await.unwrap();

        let err = dispatcher
            .execute(
                "call_fwd_setup",
                json!({ "from_user": "a", "to_user": "b" }),
                &channel.id,
            )
            .await
            .err();
        assert_eq!(err, Some(ApiError::AccessDenied));

        // non-forward methods still pass the policy
        let bob = store.create_user("bob").await;
        queue.register(&bob.id, "bob-dev").await.unwrap();
        let result = dispatcher
            .execute("dial", json!({ "user": bob.id }), &channel.id)
            .await
            .unwrap();
        assert!(result["call"].is_string());
    }

    #[tokio::test]
    async fn dial_routes_to_call_signaling() {
        let (store, queue, dispatcher) =
            dispatcher_with(Arc::new(AllowAll)).await;
        let alice = store.create_user("alice").await;
        let bob = store.create_user("bob").await;
        let from = queue.register(&alice.id, "a-dev").await.unwrap();
        let to = queue.register(&bob.id, "b-dev").await.unwrap();

        let result = dispatcher
            .execute("dial", json!({ "user": bob.id }), &from.id)
            .await
            .unwrap();
        assert!(result["call"].is_string());

        let ringing = queue.poll(&to.id, 0).await.unwrap();
        assert_eq!(ringing.len(), 1);
        assert_eq!(ringing[0].method, CommandMethod::Dial);
    }

    #[tokio::test]
    async fn malformed_params_are_invalid_data() {
        let (store, queue, dispatcher) =
            dispatcher_with(Arc::new(AllowAll)).await;
        let user = store.create_user("alice").await;
        let channel = queue.register(&user.id, "dev").await.unwrap();

        let err = dispatcher
            .execute("dial", json!({ "no_user_field": true }), &channel.id)
            .await
            .err();
        assert!(matches!(err, Some(ApiError::InvalidData(_))));
    }

    #[tokio::test]
    async fn send_message_fans_out_to_target_user() {
        let (store, queue, dispatcher) =
            dispatcher_with(Arc::new(AllowAll)).await;
        let alice = store.create_user("alice").await;
        let bob = store.create_user("bob").await;
        let from = queue.register(&alice.id, "a-dev").await.unwrap();
        let b1 = queue.register(&bob.id, "b-phone").await.unwrap();
        let b2 = queue.register(&bob.id, "b-tablet").await.unwrap();

        let result = dispatcher
            .execute(
                "send_message",
                json!({ "user": bob.id, "body": { "text": "hi" } }),
                &from.id,
            )
            .await
            .unwrap();
        assert_eq!(result["delivered"], 2);

        for channel in [&b1, &b2] {
            let commands = queue.poll(&channel.id, 0).await.unwrap();
            assert_eq!(commands.len(), 1);
            assert_eq!(commands[0].method, CommandMethod::Message);
            assert_eq!(commands[0].params["from_user"], alice.id);
            assert_eq!(commands[0].params["body"]["text"], "hi");
        }
    }

    #[tokio::test]
    async fn sync_contacts_targets_the_callers_own_devices() {
        let (store, queue, dispatcher) =
            dispatcher_with(Arc::new(AllowAll)).await;
        let alice = store.create_user("alice").await;
        let a1 = queue.register(&alice.id, "a-phone").await.unwrap();
        let a2 = queue.register(&alice.id, "a-tablet").await.unwrap();

        dispatcher
            .execute("sync_contacts", json!({}), &a1.id)
            .await
            .unwrap();

        for channel in [&a1, &a2] {
            let commands = queue.poll(&channel.id, 0).await.unwrap();
            assert_eq!(commands.len(), 1);
            assert_eq!(commands[0].method, CommandMethod::SyncContacts);
        }
    }
}
