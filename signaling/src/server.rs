use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use beacon_broker::exchange::{MemoryExchange, RedisExchange, TopicExchange};
use beacon_broker::SubscriptionBroker;
use beacon_db::error::ApiError;
use beacon_db::message::{Envelope, PollItem};
use beacon_db::models::Command;
use beacon_db::store::Store;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::call::CallSignaling;
use crate::channel::ChannelQueue;
use crate::dispatch::{AllowAll, Dispatcher, ReplayGuard};
use crate::forward::CallForwarding;
use crate::notify::{Notifier, NullNotifier, PushGateway};

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub listen_addr: Option<String>,
    pub redis: Option<String>,
    pub subscription_ttl_ms: Option<u64>,
    pub eviction_interval_ms: Option<u64>,
    pub stale_command_ttl_ms: Option<u64>,
    pub push_gateway: Option<String>,
}

impl Config {
    pub fn new() -> Result<Config> {
        let path = std::env::var("BEACON_CONF")
            .unwrap_or_else(|_| "/etc/beacon/beacon.conf".to_string());
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

pub struct SignalingService {
    store: Arc<Store>,
    queue: Arc<ChannelQueue>,
    dispatcher: Dispatcher,
    replay: ReplayGuard,
    broker: Arc<SubscriptionBroker>,
    listen_addr: String,
    eviction_interval: Duration,
}

/// ApiError as an HTTP response: status from the error class, body with
/// the rendered message.
struct HttpError(ApiError);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ApiError::NotFound(_) => axum::http::StatusCode::NOT_FOUND,
            ApiError::InvalidData(_) => axum::http::StatusCode::BAD_REQUEST,
            ApiError::AccessDenied => axum::http::StatusCode::FORBIDDEN,
            ApiError::CallAlreadyAccepted
            | ApiError::CallNotAccepted
            | ApiError::CallFwdAlreadyAck
            | ApiError::CallFwdAlreadyEstablished => {
                axum::http::StatusCode::CONFLICT
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<ApiError> for HttpError {
    fn from(e: ApiError) -> Self {
        HttpError(e)
    }
}

#[derive(Deserialize)]
struct CreateUserBody {
    name: String,
}

#[derive(Deserialize)]
struct RegisterBody {
    instance_id: String,
}

#[derive(Deserialize)]
struct PollQuery {
    #[serde(default)]
    last_sequence: i64,
}

#[derive(Deserialize)]
struct SubscribeBody {
    user: String,
    instance_id: String,
}

#[derive(Deserialize)]
struct UserQuery {
    user: String,
}

#[derive(Deserialize)]
struct PublishBody {
    topics: Vec<String>,
    command: Command,
}

impl SignalingService {
    pub fn new(config: Config) -> Result<Arc<SignalingService>, Error> {
        let subscription_ttl = Duration::from_millis(
            config.subscription_ttl_ms.unwrap_or(300_000),
        );
        let eviction_interval = Duration::from_millis(
            config.eviction_interval_ms.unwrap_or(30_000),
        );

        let exchange: Arc<dyn TopicExchange> = match &config.redis {
            Some(addr) => {
                Arc::new(RedisExchange::new(addr, subscription_ttl)?)
            }
            None => Arc::new(MemoryExchange::new()),
        };
        let broker = SubscriptionBroker::new(exchange, subscription_ttl);

        let notifier: Arc<dyn Notifier> = match &config.push_gateway {
            Some(url) => Arc::new(PushGateway::new(url.clone())),
            None => Arc::new(NullNotifier),
        };

        let store = Store::new();
        let queue = Arc::new(ChannelQueue::new(store.clone(), notifier));
        let calls =
            Arc::new(CallSignaling::new(store.clone(), queue.clone()));
        let forwards =
            Arc::new(CallForwarding::new(store.clone(), queue.clone()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            calls,
            forwards,
            Arc::new(AllowAll),
        );

        let replay = ReplayGuard::new(Duration::from_millis(
            config.stale_command_ttl_ms.unwrap_or(60_000),
        ));

        Ok(Arc::new(SignalingService {
            store,
            queue,
            dispatcher,
            replay,
            broker,
            listen_addr: config
                .listen_addr
                .unwrap_or_else(|| "0.0.0.0:8130".to_string()),
            eviction_interval,
        }))
    }

    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        info!("signaling server on {}", self.listen_addr);
        self.broker.start_eviction(self.eviction_interval);

        let store = self.store.clone();
        let every = self.eviction_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let purged = store.purge_terminated().await;
                if purged > 0 {
                    info!("purged {purged} terminated call records");
                }
            }
        });

        async fn health_check() -> &'static str {
            "ok"
        }

        async fn create_user(
            State(service): State<Arc<SignalingService>>,
            Json(body): Json<CreateUserBody>,
        ) -> Json<Value> {
            let user = service.store.create_user(&body.name).await;
            Json(json!({ "user": user.id }))
        }

        async fn register_channel(
            State(service): State<Arc<SignalingService>>,
            Path(user): Path<String>,
            Json(body): Json<RegisterBody>,
        ) -> Result<Json<Value>, HttpError> {
            let channel =
                service.queue.register(&user, &body.instance_id).await?;
            Ok(Json(json!({ "channel": channel.id })))
        }

        async fn deregister_channel(
            State(service): State<Arc<SignalingService>>,
            Path(channel): Path<String>,
        ) -> Result<Json<Value>, HttpError> {
            service.queue.deregister(&channel).await?;
            Ok(Json(json!({})))
        }

        async fn poll_channel(
            State(service): State<Arc<SignalingService>>,
            Path(channel): Path<String>,
            Query(query): Query<PollQuery>,
        ) -> Result<Json<Vec<PollItem>>, HttpError> {
            let commands =
                service.queue.poll(&channel, query.last_sequence).await?;
            Ok(Json(commands.iter().map(PollItem::from).collect()))
        }

        async fn execute_command(
            State(service): State<Arc<SignalingService>>,
            Path(channel): Path<String>,
            Json(envelope): Json<Envelope>,
        ) -> Result<Json<Value>, HttpError> {
            if let Some(sequence) = envelope.sequence_number {
                if !service.replay.fresh(&channel, sequence) {
                    return Ok(Json(json!({ "duplicate": true })));
                }
            }
            let result = service
                .dispatcher
                .execute(&envelope.method, envelope.params, &channel)
                .await?;
            Ok(Json(result))
        }

        async fn subscribe(
            State(service): State<Arc<SignalingService>>,
            Json(body): Json<SubscribeBody>,
        ) -> Result<Json<Value>, HttpError> {
            let id = service
                .broker
                .subscribe(&body.user, &body.instance_id)
                .await?;
            Ok(Json(json!({ "subscription": id })))
        }

        async fn add_topic(
            State(service): State<Arc<SignalingService>>,
            Path((id, topic)): Path<(String, String)>,
            Query(query): Query<UserQuery>,
        ) -> Result<Json<Value>, HttpError> {
            service.broker.add_topic(&id, &query.user, &topic).await?;
            Ok(Json(json!({})))
        }

        async fn remove_topic(
            State(service): State<Arc<SignalingService>>,
            Path((id, topic)): Path<(String, String)>,
            Query(query): Query<UserQuery>,
        ) -> Result<Json<Value>, HttpError> {
            service.broker.remove_topic(&id, &query.user, &topic).await?;
            Ok(Json(json!({})))
        }

        async fn poll_subscription(
            State(service): State<Arc<SignalingService>>,
            Path(id): Path<String>,
            Query(query): Query<UserQuery>,
        ) -> Result<Json<Vec<PollItem>>, HttpError> {
            let commands = service.broker.poll(&id, &query.user).await?;
            Ok(Json(commands.iter().map(PollItem::from).collect()))
        }

        async fn publish(
            State(service): State<Arc<SignalingService>>,
            Json(body): Json<PublishBody>,
        ) -> Json<Value> {
            let broker = service.broker.clone();
            tokio::spawn(async move {
                broker.publish(&body.topics, &body.command).await;
            });
            Json(json!({}))
        }

        let app = axum::Router::new()
            .route("/health-check", axum::routing::get(health_check))
            .route("/internal/users", axum::routing::post(create_user))
            .route(
                "/v1/users/:user/channels",
                axum::routing::post(register_channel),
            )
            .route(
                "/v1/channels/:channel",
                axum::routing::delete(deregister_channel),
            )
            .route(
                "/v1/channels/:channel/poll",
                axum::routing::get(poll_channel),
            )
            .route(
                "/v1/channels/:channel/commands",
                axum::routing::post(execute_command),
            )
            .route("/v1/subscriptions", axum::routing::post(subscribe))
            .route(
                "/v1/subscriptions/:id/topics/:topic",
                axum::routing::put(add_topic),
            )
            .route(
                "/v1/subscriptions/:id/topics/:topic",
                axum::routing::delete(remove_topic),
            )
            .route(
                "/v1/subscriptions/:id/poll",
                axum::routing::get(poll_subscription),
            )
            .route("/v1/publish", axum::routing::post(publish))
            .with_state(self.clone());

        axum::Server::bind(&SocketAddr::from_str(&self.listen_addr)?)
            .serve(app.into_make_service())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:9999"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.as_deref(), Some("127.0.0.1:9999"));
        assert!(config.redis.is_none());
        assert!(config.subscription_ttl_ms.is_none());
        assert!(config.push_gateway.is_none());
    }

    #[test]
    fn error_statuses_match_error_classes() {
        let not_found =
            HttpError(ApiError::NotFound("channel")).into_response();
        assert_eq!(not_found.status(), axum::http::StatusCode::NOT_FOUND);

        let conflict =
            HttpError(ApiError::CallAlreadyAccepted).into_response();
        assert_eq!(conflict.status(), axum::http::StatusCode::CONFLICT);

        let denied = HttpError(ApiError::AccessDenied).into_response();
        assert_eq!(denied.status(), axum::http::StatusCode::FORBIDDEN);

        let invalid =
            HttpError(ApiError::InvalidData("bad".to_string())).into_response();
        assert_eq!(invalid.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
