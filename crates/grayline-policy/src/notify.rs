//! Alert notification channels.

use std::time::Duration;

use grayline_health::BoxFuture;
use grayline_state::{DeploymentId, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Payload sent when a rule's breach becomes sustained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub app: String,
    pub rule: String,
    pub severity: String,
    pub deployment_id: Option<DeploymentId>,
    /// How long the breach had lasted when it fired.
    pub breach_secs: u64,
    pub value: Option<f64>,
    pub threshold: f64,
    pub description: Option<String>,
    /// Nodes of the active deployment that have left `pending`.
    pub nodes: Vec<NodeId>,
    /// Whether an automatic rollback moved at least one node.
    pub auto_rollback: bool,
    /// What the automatic rollback did, or why it did not happen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_note: Option<String>,
    pub fired_at: u64,
}

impl AlertNotification {
    pub fn summary(&self) -> String {
        let deployment = self.deployment_id.as_deref().unwrap_or("none");
        let mut text = format!(
            "[{}] {} breached on {} for {}s (deployment {deployment})",
            self.severity, self.rule, self.app, self.breach_secs
        );
        if let Some(description) = &self.description {
            text.push_str(": ");
            text.push_str(description);
        }
        if let Some(note) = &self.rollback_note {
            text.push_str(" [");
            text.push_str(note);
            text.push(']');
        }
        text
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid notifier configuration: {0}")]
    Config(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("webhook returned status {0}")]
    Status(u16),

    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
}

pub trait Notifier: Send + Sync {
    fn notify<'a>(
        &'a self,
        channel: &'a str,
        alert: &'a AlertNotification,
    ) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(
        &'a self,
        channel: &'a str,
        alert: &'a AlertNotification,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            warn!(
                %channel,
                app = %alert.app,
                rule = %alert.rule,
                deployment = ?alert.deployment_id,
                nodes = ?alert.nodes,
                "{}",
                alert.summary()
            );
            Ok(())
        })
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    channel: &'a str,
    text: String,
    #[serde(flatten)]
    alert: &'a AlertNotification,
}

/// POSTs notifications as JSON to a plain-HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    /// `host:port` to connect to.
    authority: String,
    /// Path and query of the endpoint.
    target: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let url = url::Url::parse(endpoint).map_err(|e| NotifyError::Config(e.to_string()))?;
        if url.scheme() != "http" {
            return Err(NotifyError::Config(format!(
                "unsupported scheme {:?}, only http is supported",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| NotifyError::Config(format!("{endpoint} has no host")))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let target = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        Ok(Self {
            authority: format!("{host}:{port}"),
            target,
            timeout,
        })
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), NotifyError> {
        let stream = tokio::net::TcpStream::connect(&self.authority)
            .await
            .map_err(|e| NotifyError::Delivery(format!("connect {}: {e}", self.authority)))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&self.target)
            .header("host", &self.authority)
            .header("content-type", "application/json")
            .header("user-agent", "grayline-policy/0.1")
            .body(http_body_util::Full::new(bytes::Bytes::from(body)))
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(resp.status().as_u16()))
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify<'a>(
        &'a self,
        channel: &'a str,
        alert: &'a AlertNotification,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&WebhookBody {
                channel,
                text: alert.summary(),
                alert,
            })
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

            tokio::time::timeout(self.timeout, self.post(body))
                .await
                .map_err(|_| NotifyError::Timeout(self.timeout))?
        })
    }
}
