// Client for the analysis + comment generation service.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::traits::CommentGenerator;

/// Output of one analysis call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentSuggestions {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// `false` when the service declines to suggest for this media.
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

#[derive(Serialize)]
struct AnalysisRequest<'a> {
    media_base64: String,
    content_type: Option<&'a str>,
    context: &'a Value,
}

pub struct HttpAnalysisClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalysisClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build analysis HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CommentGenerator for HttpAnalysisClient {
    async fn generate(
        &self,
        media: &[u8],
        content_type: Option<&str>,
        context: &Value,
    ) -> Result<CommentSuggestions> {
        let body = AnalysisRequest {
            media_base64: STANDARD.encode(media),
            content_type,
            context,
        };

        let resp = self
            .client
            .post(format!("{}/analyze/story", self.endpoint))
            .json(&body)
            .send()
            .await
            .context("Analysis request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            anyhow::bail!("Analysis service returned {status}: {message}");
        }

        let suggestions: CommentSuggestions = resp
            .json()
            .await
            .context("Analysis response was not valid JSON")?;
        debug!(
            count = suggestions.suggestions.len(),
            ready = suggestions.ready,
            "Received comment suggestions"
        );
        Ok(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default_to_ready_and_empty() {
        let parsed: CommentSuggestions = serde_json::from_str(r#"{"suggestions": ["nice"]}"#).unwrap();
        assert!(parsed.ready);
        assert_eq!(parsed.suggestions, vec!["nice"]);
        assert!(parsed.topics.is_empty());
    }

    #[test]
    fn explicit_not_ready_is_kept() {
        let parsed: CommentSuggestions =
            serde_json::from_str(r#"{"ready": false, "description": "blank frame"}"#).unwrap();
        assert!(!parsed.ready);
        assert_eq!(parsed.description.as_deref(), Some("blank frame"));
    }
}
