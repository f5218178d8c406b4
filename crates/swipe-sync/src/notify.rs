//! Operator notifications. Delivery is best effort: a failed notification is
//! logged and never fails the transfer.

use async_trait::async_trait;
use serde_json::json;
use swipe_storage::{build_client, HttpClientConfig};
use tracing::{error, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        error!(message, "transfer notification");
    }
}

/// Posts `{"text": ...}` to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>, http: &HttpClientConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(http)?,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) {
        let sent = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        if let Err(err) = sent {
            warn!(error = %err.without_url(), "failed to deliver slack notification");
        }
    }
}

/// `err` followed by each of its sources, separated by `: `.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
