//! HTTP recognizer adapter
//!
//! POSTs the base64-encoded crop to a recognition service and parses
//! `{"candidates": [{"text": "...", "confidence": 0.9}, ...]}` back.

use crate::domain::evidence::TextCandidate;
use crate::domain::types::ImageRef;
use crate::services::recognition_pool::Recognizer;
use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
struct RecognizeRequest<'a> {
    image_ref: &'a str,
    image_b64: String,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    candidates: Vec<CandidateDto>,
}

#[derive(Deserialize)]
struct CandidateDto {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: f64,
}

pub struct HttpRecognizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRecognizer {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build recognizer HTTP client")?;
        Ok(Self { client, endpoint: endpoint.to_string() })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Parse a recognizer response body
pub fn parse_candidates(body: &[u8]) -> anyhow::Result<Vec<TextCandidate>> {
    let response: RecognizeResponse =
        serde_json::from_slice(body).context("Invalid recognizer response")?;
    Ok(response
        .candidates
        .into_iter()
        .map(|c| TextCandidate::new(c.text, c.confidence))
        .collect())
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn recognize(&self, image: &ImageRef) -> anyhow::Result<Vec<TextCandidate>> {
        let bytes = tokio::fs::read(image.as_str())
            .await
            .with_context(|| format!("Failed to read image {}", image))?;
        let request = RecognizeRequest { image_ref: image.as_str(), image_b64: STANDARD.encode(bytes) };
        let body = serde_json::to_vec(&request)?;

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .context("Recognizer request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("Recognizer returned status {}", status.as_u16());
        }
        let body = response.bytes().await.context("Failed to read recognizer response")?;
        let candidates = parse_candidates(&body)?;
        debug!(image = %image, candidates = %candidates.len(), "recognizer_responded");
        Ok(candidates)
    }
}
