//! Concrete embedding providers (spec §4.5). `build_provider` is the only entry
//! point the rest of the crate should call; the three variants share one trait
//! object so the pipeline and query engine never branch on provider kind.

use std::time::Duration;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingProviderKind, EmbeddingProviderSettings, EMBEDDING_INPUT_MAX_CHARS};
use crate::errors::{DocsError, Result};
use crate::fingerprint::provider_config_fingerprint;

use super::batch;

pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn model(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn config_fingerprint(&self) -> &str;
    fn batch_size(&self) -> Option<usize>;
    fn batch_api_threshold(&self) -> Option<usize>;

    /// Blocking call. Callers on an async runtime must wrap this in
    /// `tokio::task::spawn_blocking`.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub fn build_provider(settings: &EmbeddingProviderSettings) -> Result<Box<dyn EmbeddingProvider>> {
    let config_fingerprint = provider_config_fingerprint(
        provider_name(settings.provider),
        &settings.model,
        settings.dimensions,
        settings.base_url.as_deref(),
    );
    match settings.provider {
        EmbeddingProviderKind::None => Ok(Box::new(NoneProvider {
            dimensions: settings.dimensions,
            config_fingerprint,
        })),
        EmbeddingProviderKind::Hash => Ok(Box::new(HashProvider {
            dimensions: settings.dimensions.max(1),
            config_fingerprint,
        })),
        EmbeddingProviderKind::Openai => {
            let api_key = settings
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .ok_or_else(|| DocsError::Config {
                    field: "embedding.api_key".to_string(),
                    message: "OpenAI provider requires an API key (flag or OPENAI_API_KEY)".to_string(),
                })?;
            Ok(Box::new(OpenAiProvider {
                model: settings.model.clone(),
                dimensions: settings.dimensions,
                base_url: settings
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key,
                concurrency: settings.concurrency_clamped(),
                max_retries: settings.max_retries,
                retry_base_delay_ms: settings.retry_base_delay_ms,
                retry_max_delay_ms: settings.retry_max_delay_ms,
                batch_size: settings.batch_size,
                batch_api_threshold: settings.batch_api_threshold,
                config_fingerprint,
            }))
        }
    }
}

fn provider_name(kind: EmbeddingProviderKind) -> &'static str {
    match kind {
        EmbeddingProviderKind::None => "none",
        EmbeddingProviderKind::Hash => "hash",
        EmbeddingProviderKind::Openai => "openai",
    }
}

/// Empty vectors; indexing proceeds without vector search (spec §4.5).
struct NoneProvider {
    dimensions: usize,
    config_fingerprint: String,
}

impl EmbeddingProvider for NoneProvider {
    fn name(&self) -> &'static str {
        "none"
    }
    fn model(&self) -> &str {
        "none"
    }
    fn dimensions(&self) -> usize {
        self.dimensions
    }
    fn config_fingerprint(&self) -> &str {
        &self.config_fingerprint
    }
    fn batch_size(&self) -> Option<usize> {
        None
    }
    fn batch_api_threshold(&self) -> Option<usize> {
        None
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![Vec::new(); texts.len()])
    }
}

/// Deterministic per-dimension hash fold, L2-normalized; used for tests and
/// offline indexing where no network access is available.
struct HashProvider {
    dimensions: usize,
    config_fingerprint: String,
}

impl EmbeddingProvider for HashProvider {
    fn name(&self) -> &'static str {
        "hash"
    }
    fn model(&self) -> &str {
        "hash"
    }
    fn dimensions(&self) -> usize {
        self.dimensions
    }
    fn config_fingerprint(&self) -> &str {
        &self.config_fingerprint
    }
    fn batch_size(&self) -> Option<usize> {
        None
    }
    fn batch_api_threshold(&self) -> Option<usize> {
        None
    }
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dimensions)).collect())
    }
}

fn hash_embed(text: &str, dimensions: usize) -> Vec<f32> {
    use sha2::{Digest, Sha256};
    let mut vector = vec![0f32; dimensions];
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        let dim = i % dimensions;
        let mut hasher = Sha256::new();
        hasher.update([b]);
        hasher.update((i as u64).to_le_bytes());
        let digest = hasher.finalize();
        let signed = (digest[0] as i32 - 128) as f32;
        vector[dim] += signed;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    vector
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    index: usize,
}

pub struct OpenAiProvider {
    model: String,
    dimensions: usize,
    base_url: String,
    api_key: String,
    concurrency: usize,
    max_retries: u32,
    retry_base_delay_ms: u64,
    retry_max_delay_ms: u64,
    batch_size: Option<usize>,
    batch_api_threshold: usize,
    config_fingerprint: String,
}

impl EmbeddingProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }
    fn model(&self) -> &str {
        &self.model
    }
    fn dimensions(&self) -> usize {
        self.dimensions
    }
    fn config_fingerprint(&self) -> &str {
        &self.config_fingerprint
    }
    fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }
    fn batch_api_threshold(&self) -> Option<usize> {
        Some(self.batch_api_threshold)
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let truncated: Vec<String> = texts.iter().map(|t| truncate_input(t)).collect();

        if truncated.len() >= self.batch_api_threshold {
            return batch::run(self, &truncated);
        }

        let batch_size = self.batch_size.unwrap_or(truncated.len().max(1));
        let batches: Vec<&[String]> = truncated.chunks(batch_size).collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency.max(1))
            .build()
            .map_err(|e| DocsError::EmbeddingFatal(e.to_string()))?;

        let results: Vec<Result<Vec<Vec<f32>>>> =
            pool.install(|| batches.par_iter().map(|batch| self.embed_one_batch(batch)).collect());

        let mut out = Vec::with_capacity(truncated.len());
        for r in results {
            out.extend(r?);
        }
        Ok(out)
    }
}

impl OpenAiProvider {
    fn embed_one_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        loop {
            let request = EmbeddingsRequest {
                model: &self.model,
                input: batch,
                dimensions: self.dimensions,
            };
            let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
            let response = ureq::post(&url)
                .set("Authorization", &format!("Bearer {}", self.api_key))
                .send_json(&request);

            match response {
                Ok(resp) => {
                    let parsed: EmbeddingsResponse = resp
                        .into_json()
                        .map_err(|e| DocsError::EmbeddingFatal(format!("malformed response body: {e}")))?;
                    if parsed.data.len() != batch.len() {
                        return Err(DocsError::EmbeddingFatal(format!(
                            "response length {} does not match request length {}",
                            parsed.data.len(),
                            batch.len()
                        )));
                    }
                    let mut ordered: Vec<Option<Vec<f32>>> = vec![None; batch.len()];
                    for datum in parsed.data {
                        if datum.index < ordered.len() {
                            ordered[datum.index] = Some(datum.embedding);
                        }
                    }
                    let vectors: Vec<Vec<f32>> = ordered
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| {
                            v.ok_or_else(|| {
                                DocsError::EmbeddingFatal(format!("missing embedding at index {i}"))
                            })
                        })
                        .collect::<Result<_>>()?;
                    return Ok(vectors);
                }
                Err(ureq::Error::Status(status, resp)) if is_retryable_status(status) => {
                    if attempt >= self.max_retries {
                        return Err(DocsError::EmbeddingTransient {
                            attempts: attempt,
                            message: format!("HTTP {status}"),
                        });
                    }
                    let retry_after = resp
                        .header("Retry-After")
                        .and_then(|h| h.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let backoff = backoff_delay(attempt, self.retry_base_delay_ms, self.retry_max_delay_ms);
                    std::thread::sleep(retry_after.unwrap_or(backoff));
                    attempt += 1;
                }
                Err(ureq::Error::Status(status, _)) => {
                    return Err(DocsError::EmbeddingFatal(format!("HTTP {status}")));
                }
                Err(ureq::Error::Transport(t)) => {
                    if attempt >= self.max_retries {
                        return Err(DocsError::EmbeddingTransient {
                            attempts: attempt,
                            message: t.to_string(),
                        });
                    }
                    let backoff = backoff_delay(attempt, self.retry_base_delay_ms, self.retry_max_delay_ms);
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
            }
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }
    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }
    pub(crate) fn model_name(&self) -> &str {
        &self.model
    }
    pub(crate) fn dims(&self) -> usize {
        self.dimensions
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = (exp / 5).max(1);
    let jittered = exp + (fastrand_jitter(attempt) % jitter.max(1));
    Duration::from_millis(jittered.min(max_ms))
}

/// A tiny deterministic PRNG stand-in: we avoid pulling in a `rand` dependency the
/// teacher's stack doesn't already carry, at the cost of weaker jitter entropy.
fn fastrand_jitter(attempt: u32) -> u64 {
    let mut x = (attempt as u64).wrapping_mul(2654435761).wrapping_add(0x9E3779B97F4A7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x
}

/// Hard-truncates oversized embedding inputs (spec §4.5), logging a warning.
fn truncate_input(text: &str) -> String {
    if text.chars().count() <= EMBEDDING_INPUT_MAX_CHARS {
        return text.to_string();
    }
    eprintln!(
        "[docs-mcp-search] WARN: embedding input truncated from {} to {} chars",
        text.chars().count(),
        EMBEDDING_INPUT_MAX_CHARS
    );
    text.chars().take(EMBEDDING_INPUT_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_provider_is_deterministic_and_normalized() {
        let a = hash_embed("hello world", 16);
        let b = hash_embed("hello world", 16);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3 || norm == 0.0);
    }

    #[test]
    fn truncate_input_respects_ceiling() {
        let long = "a".repeat(EMBEDDING_INPUT_MAX_CHARS + 500);
        let truncated = truncate_input(&long);
        assert_eq!(truncated.chars().count(), EMBEDDING_INPUT_MAX_CHARS);
    }

    #[test]
    fn retryable_status_matches_429_and_5xx() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
    }
}
