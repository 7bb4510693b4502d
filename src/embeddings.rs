//! Text embeddings from an OpenAI-compatible API, and similarity ranking.
use anyhow::{bail, Context as _, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::EmbeddingsConfig;

#[derive(Clone, Debug)]
pub struct Embedder {
    client: reqwest::Client,
    config: EmbeddingsConfig,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl Embedder {
    pub fn new(client: reqwest::Client, config: EmbeddingsConfig) -> Self {
        Self { client, config }
    }

    pub fn batch_size(&self) -> i64 {
        self.config.batch_size
    }

    /// Embed a single piece of text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        debug!("requesting embedding from {url}");

        let res = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "input": text,
            }))
            .send()
            .await
            .context("failed to send embeddings request")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("error from embeddings API ({status}): {body}");
        }

        let body: EmbeddingResponse = res
            .json()
            .await
            .context("failed to decode embeddings response")?;

        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .context("embeddings response contained no vectors")
    }
}

/// Cosine similarity of two vectors. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut na, mut nb) = (0.0_f32, 0.0_f32, 0.0_f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }

    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}
