use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

/// State transitions worth telling an operator about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Enabled,
    Disabled,
    Restarting { reason: String },
    Error { message: String },
}

/// Delivery of lifecycle events must never affect the node itself, so the
/// trait has no error channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: LifecycleEvent);
}

pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _event: LifecycleEvent) {}
}

/// POSTs each event as JSON to an operator-configured webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    node_name: String,
}

impl WebhookNotifier {
    pub fn new(url: String, node_name: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent(crate::user_agent())
                .build()
                .unwrap_or_default(),
            url,
            node_name,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: LifecycleEvent) {
        let payload = serde_json::json!({
            "node": self.node_name,
            "at": chrono::Utc::now().to_rfc3339(),
            "detail": event,
        });
        if let Err(e) = self.http.post(&self.url).json(&payload).send().await {
            warn!("webhook delivery failed: {e}");
        }
    }
}
