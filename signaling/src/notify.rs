use beacon_db::models::Channel;
use beacon_task::THREAD_POOL;
use serde_json::json;
use tracing::warn;

/// Push-notification collaborator. Implementations must never block the
/// caller and must swallow their own failures.
pub trait Notifier: Send + Sync {
    fn send(&self, channel: &Channel, message: &str, badge: i64);
}

/// HTTP push gateway. Requests run on the background pool; a failed
/// notification is logged and forgotten.
pub struct PushGateway {
    url: String,
    client: reqwest::blocking::Client,
}

impl PushGateway {
    pub fn new(url: String) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { url, client }
    }
}

impl Notifier for PushGateway {
    fn send(&self, channel: &Channel, message: &str, badge: i64) {
        let client = self.client.clone();
        let url = self.url.clone();
        let channel_id = channel.id.clone();
        let body = json!({
            "channel": channel.id,
            "user": channel.user_id,
            "message": message,
            "badge": badge,
        });
        THREAD_POOL.spawn(move || {
            if let Err(e) = client.post(&url).json(&body).send() {
                warn!("push notification to channel {channel_id} failed: {e}");
            }
        });
    }
}

/// No-op notifier for deployments without a push gateway.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&self, _channel: &Channel, _message: &str, _badge: i64) {}
}
