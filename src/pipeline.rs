//! Fetch / translate / publish boundary
//!
//! The orchestrator only sees the narrow [`Pipeline`] trait. The messaging
//! source client, the translator and the target platform live behind it.
//! [`HttpPipeline`] is the stock adapter: it talks to a companion service
//! over two HTTP endpoints.
//!
//! | Call | Request | Response |
//! |------|---------|----------|
//! | fetch | `GET {fetch_url}/{source}` | `404` = nothing, else [`ContentBatch`] |
//! | publish | `POST {publish_url}` with [`PublishRequest`] | `{"published": bool}` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::scheduler::rotation::SourceId;

/// One publishable message from a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Source-unique id; what the blacklist records
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

/// Candidate messages fetched from one source, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBatch {
    pub source: String,
    pub items: Vec<ContentItem>,
}

/// Body of a publish call
#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest<'a> {
    pub source: &'a str,
    pub item: &'a ContentItem,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    published: bool,
}

/// Pipeline failures
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Connection, DNS, timeout
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Body could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Adapter misconfigured
    #[error("invalid pipeline configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Upstream { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidResponse(_) | Self::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// External content pipeline
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Latest candidate content of `source`; `None` when there is nothing
    async fn fetch_candidate_content(
        &self,
        source: &SourceId,
    ) -> Result<Option<ContentBatch>, PipelineError>;

    /// Translate and publish one item; true when something was published
    async fn translate_and_publish(
        &self,
        source: &SourceId,
        item: &ContentItem,
    ) -> Result<bool, PipelineError>;
}

/// Shared pipeline handle
pub type SharedPipeline = Arc<dyn Pipeline>;

// ============================================================================
// HTTP adapter
// ============================================================================

/// Endpoints of the companion service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPipelineConfig {
    /// Base URL; the source id is appended as a path segment
    pub fetch_url: String,
    pub publish_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl HttpPipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [("fetch_url", &self.fetch_url), ("publish_url", &self.publish_url)] {
            let parsed = url::Url::parse(value).map_err(|e| format!("{field}: {e}"))?;
            if parsed.cannot_be_a_base() {
                return Err(format!("{field} must be an absolute http(s) URL"));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".into());
        }
        Ok(())
    }
}

/// [`Pipeline`] over HTTP
pub struct HttpPipeline {
    config: HttpPipelineConfig,
    fetch_base: url::Url,
    client: Client,
}

impl HttpPipeline {
    pub fn new(config: HttpPipelineConfig) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        let fetch_base = url::Url::parse(&config.fetch_url)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(format!("newsrelay/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            fetch_base,
            client,
        })
    }

    fn fetch_url_for(&self, source: &SourceId) -> Result<url::Url, PipelineError> {
        let mut url = self.fetch_base.clone();
        url.path_segments_mut()
            .map_err(|_| PipelineError::Config("fetch_url cannot be a base".into()))?
            .pop_if_empty()
            .push(source.as_str());
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn upstream_error(response: reqwest::Response) -> PipelineError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    PipelineError::Upstream { status, body }
}

#[async_trait]
impl Pipeline for HttpPipeline {
    async fn fetch_candidate_content(
        &self,
        source: &SourceId,
    ) -> Result<Option<ContentBatch>, PipelineError> {
        let url = self.fetch_url_for(source)?;
        let response = self.authorize(self.client.get(url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let batch: ContentBatch = response.json().await?;
                tracing::debug!(source = %source, items = batch.items.len(), "Fetched candidate content");
                if batch.items.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(batch))
                }
            }
            _ => Err(upstream_error(response).await),
        }
    }

    async fn translate_and_publish(
        &self,
        source: &SourceId,
        item: &ContentItem,
    ) -> Result<bool, PipelineError> {
        let body = PublishRequest {
            source: source.as_str(),
            item,
        };
        let response = self
            .authorize(self.client.post(&self.config.publish_url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        let parsed: PublishResponse = response.json().await?;
        Ok(parsed.published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(server: &MockServer) -> HttpPipeline {
        HttpPipeline::new(HttpPipelineConfig {
            fetch_url: format!("{}/sources/", server.uri()),
            publish_url: format!("{}/publish", server.uri()),
            auth_token: None,
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    fn source(s: &str) -> SourceId {
        SourceId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sources/worldnews"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "source": "worldnews",
                "items": [{"id": "m1", "text": "hello"}]
            })))
            .mount(&server)
            .await;

        let batch = pipeline(&server)
            .fetch_candidate_content(&source("worldnews"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.items[0].id, "m1");
        assert!(batch.items[0].media_urls.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = pipeline(&server)
            .fetch_candidate_content(&source("quiet"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_fetch_server_error_is_recoverable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let err = pipeline(&server)
            .fetch_candidate_content(&source("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Upstream { status: 503, .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_publish_reads_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/publish"))
            .and(body_partial_json(serde_json::json!({"source": "worldnews"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"published": true})),
            )
            .mount(&server)
            .await;

        let item = ContentItem {
            id: "m1".into(),
            text: "hola".into(),
            media_urls: vec![],
            posted_at: None,
        };
        let published = pipeline(&server)
            .translate_and_publish(&source("worldnews"), &item)
            .await
            .unwrap();
        assert!(published);
    }

    #[test]
    fn test_config_rejects_relative_url() {
        let config = HttpPipelineConfig {
            fetch_url: "sources".into(),
            publish_url: "http://localhost/publish".into(),
            auth_token: None,
            request_timeout_secs: 5,
        };
        assert!(config.validate().is_err());
    }
}
