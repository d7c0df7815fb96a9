//! Webhook notification channel
//!
//! Posts alerts as JSON:
//!
//! ```json
//! {
//!   "id": "alert-uuid",
//!   "severity": "warning",
//!   "source": "health",
//!   "message": "Memory usage at 82.0%",
//!   "condition": "memory:warning",
//!   "content": "⚠️ [WARNING] health: Memory usage at 82.0%",
//!   "created_at": "2024-01-01T12:00:00Z"
//! }
//! ```
//!
//! `content` carries the one-line summary so chat webhooks that only read
//! that field still show something useful.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Alert, Notifier, NotifyError};

/// Webhook channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL endpoint
    pub url: String,
    /// Optional authentication token (sent as Bearer token)
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Maximum retry attempts on failure
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    2
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            timeout_secs: default_timeout(),
            max_retries: default_retries(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let parsed = url::Url::parse(&self.url).map_err(|e| format!("invalid webhook URL: {e}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err("Webhook URL must use http or https".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// HTTP POST alert channel
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, NotifyError> {
        config.validate().map_err(NotifyError::InvalidConfig)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotifyError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn build_payload(alert: &Alert) -> serde_json::Value {
        serde_json::json!({
            "id": alert.id,
            "severity": alert.severity.as_str(),
            "source": alert.source,
            "message": alert.message,
            "condition": alert.condition,
            "content": alert.summary(),
            "created_at": alert.created_at.to_rfc3339(),
        })
    }

    async fn post_once(&self, payload: &serde_json::Value) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.config.url).json(payload);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        let payload = Self::build_payload(alert);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // 1s, 2s, 4s, ...
                let delay = Duration::from_secs(2_u64.pow(attempt - 1));
                tracing::debug!(
                    attempt = attempt + 1,
                    max_attempts = self.config.max_retries + 1,
                    "Retrying webhook delivery"
                );
                tokio::time::sleep(delay).await;
            }

            match self.post_once(&payload).await {
                Ok(()) => return Ok(()),
                // 4xx other than 429 will not get better by retrying
                Err(NotifyError::Rejected { status, body })
                    if (400..500).contains(&status) && status != 429 =>
                {
                    return Err(NotifyError::Rejected { status, body });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| NotifyError::Network("no attempt made".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::AlertSeverity;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_config_validation() {
        assert!(WebhookConfig::new("https://hooks.example.com/x").validate().is_ok());
        assert!(WebhookConfig::new("ftp://hooks.example.com").validate().is_err());
        assert!(WebhookConfig::new("not a url").validate().is_err());
    }

    #[tokio::test]
    async fn test_posts_alert_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alerts"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            WebhookConfig::new(format!("{}/alerts", server.uri())).with_auth_token("s3cret"),
        )
        .unwrap();

        let alert = Alert::new(AlertSeverity::Warning, "cpu high").with_source("health");
        notifier.send(&alert).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["severity"], "warning");
        assert_eq!(body["source"], "health");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad"))
            .expect(1)
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(WebhookConfig::new(server.uri()).with_max_retries(3)).unwrap();
        let err = notifier
            .send(&Alert::new(AlertSeverity::Info, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { status: 400, .. }));
    }
}
