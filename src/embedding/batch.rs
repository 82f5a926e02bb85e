//! Asynchronous batch-job workflow for the `openai` provider (spec §4.5).
//!
//! This is a blocking state machine (`Uploading → Polling → Downloading → Done`)
//! driven with `std::thread::sleep`; callers on an async runtime wrap the
//! triggering `embed()` call in `tokio::task::spawn_blocking`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{DocsError, Result};

use super::provider::OpenAiProvider;

const POLL_INTERVALS_SECS: [u64; 6] = [10, 10, 10, 30, 30, 60];
const CEILING: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Serialize)]
struct JsonlRow<'a> {
    custom_id: String,
    method: &'static str,
    url: &'static str,
    body: JsonlBody<'a>,
}

#[derive(Serialize)]
struct JsonlBody<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct BatchListResponse {
    data: Vec<BatchObject>,
}

#[derive(Deserialize, Clone)]
struct BatchObject {
    id: String,
    status: String,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
    output_file_id: Option<String>,
    request_counts: Option<RequestCounts>,
}

#[derive(Deserialize, Clone)]
struct RequestCounts {
    completed: usize,
    total: usize,
}

#[derive(Deserialize)]
struct FileUploadResponse {
    id: String,
}

#[derive(Deserialize)]
struct BatchResultRow {
    custom_id: String,
    response: Option<BatchResultResponse>,
}

#[derive(Deserialize)]
struct BatchResultResponse {
    body: BatchResultBody,
}

#[derive(Deserialize)]
struct BatchResultBody {
    data: Vec<BatchResultDatum>,
}

#[derive(Deserialize)]
struct BatchResultDatum {
    embedding: Vec<f32>,
}

fn build_jsonl(provider: &OpenAiProvider, texts: &[String]) -> String {
    let mut out = String::new();
    for (i, text) in texts.iter().enumerate() {
        let row = JsonlRow {
            custom_id: format!("req-{i}"),
            method: "POST",
            url: "/v1/embeddings",
            body: JsonlBody {
                model: provider.model_name(),
                input: text,
                dimensions: provider.dims(),
            },
        };
        out.push_str(&serde_json::to_string(&row).unwrap_or_default());
        out.push('\n');
    }
    out
}

fn content_sha(jsonl: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(jsonl.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn auth_header(provider: &OpenAiProvider) -> String {
    format!("Bearer {}", provider.api_key())
}

fn find_resumable_batch(provider: &OpenAiProvider, content_sha: &str) -> Result<Option<BatchObject>> {
    let url = format!("{}/batches?limit=100", provider.base_url());
    let response = ureq::get(&url)
        .set("Authorization", &auth_header(provider))
        .call()
        .map_err(|e| DocsError::EmbeddingFatal(format!("failed to list batches: {e}")))?;
    let parsed: BatchListResponse = response
        .into_json()
        .map_err(|e| DocsError::EmbeddingFatal(format!("malformed batch list: {e}")))?;

    for batch in parsed.data {
        if matches!(batch.status.as_str(), "failed" | "expired" | "cancelled") {
            continue;
        }
        let matches = batch
            .metadata
            .as_ref()
            .and_then(|m| m.get("content_sha"))
            .and_then(|v| v.as_str())
            == Some(content_sha);
        if matches {
            return Ok(Some(batch));
        }
    }
    Ok(None)
}

fn upload_file(provider: &OpenAiProvider, jsonl: &str) -> Result<String> {
    let url = format!("{}/files", provider.base_url());
    let response = ureq::post(&url)
        .set("Authorization", &auth_header(provider))
        .set("Content-Type", "application/jsonl")
        .query("purpose", "batch")
        .send_string(jsonl)
        .map_err(|e| DocsError::EmbeddingFatal(format!("file upload failed: {e}")))?;
    let parsed: FileUploadResponse = response
        .into_json()
        .map_err(|e| DocsError::EmbeddingFatal(format!("malformed file upload response: {e}")))?;
    Ok(parsed.id)
}

fn create_batch(provider: &OpenAiProvider, input_file_id: &str, content_sha: &str, batch_name: &str) -> Result<BatchObject> {
    let url = format!("{}/batches", provider.base_url());
    let body = serde_json::json!({
        "input_file_id": input_file_id,
        "endpoint": "/v1/embeddings",
        "completion_window": "24h",
        "metadata": { "batch_name": batch_name, "content_sha": content_sha },
    });
    let response = ureq::post(&url)
        .set("Authorization", &auth_header(provider))
        .send_json(body)
        .map_err(|e| DocsError::EmbeddingFatal(format!("batch create failed: {e}")))?;
    response
        .into_json()
        .map_err(|e| DocsError::EmbeddingFatal(format!("malformed batch create response: {e}")))
}

fn fetch_batch(provider: &OpenAiProvider, id: &str) -> Result<BatchObject> {
    let url = format!("{}/batches/{id}", provider.base_url());
    let response = ureq::get(&url)
        .set("Authorization", &auth_header(provider))
        .call()
        .map_err(|e| DocsError::EmbeddingFatal(format!("batch poll failed: {e}")))?;
    response
        .into_json()
        .map_err(|e| DocsError::EmbeddingFatal(format!("malformed batch poll response: {e}")))
}

fn download_results(provider: &OpenAiProvider, file_id: &str) -> Result<String> {
    let url = format!("{}/files/{file_id}/content", provider.base_url());
    let response = ureq::get(&url)
        .set("Authorization", &auth_header(provider))
        .call()
        .map_err(|e| DocsError::EmbeddingFatal(format!("results download failed: {e}")))?;
    response
        .into_string()
        .map_err(|e| DocsError::EmbeddingFatal(format!("malformed results body: {e}")))
}

/// Runs (or resumes) a batch embedding job for `texts`, returning vectors in the
/// original request order.
pub fn run(provider: &OpenAiProvider, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let jsonl = build_jsonl(provider, texts);
    let sha = content_sha(&jsonl);
    let batch_name = format!("docs-mcp-search-{}", &sha[..12]);

    let mut batch = match find_resumable_batch(provider, &sha)? {
        Some(existing) => existing,
        None => {
            let file_id = upload_file(provider, &jsonl)?;
            create_batch(provider, &file_id, &sha, &batch_name)?
        }
    };

    let start = Instant::now();
    let mut poll_idx = 0usize;
    loop {
        if matches!(batch.status.as_str(), "completed") {
            break;
        }
        if matches!(batch.status.as_str(), "failed" | "expired" | "cancelled") {
            return Err(DocsError::EmbeddingFatal(format!(
                "embedding batch job ended in status '{}'",
                batch.status
            )));
        }
        if start.elapsed() > CEILING {
            return Err(DocsError::EmbeddingTransient {
                attempts: 0,
                message: "embedding batch job exceeded the 2-hour polling ceiling".to_string(),
            });
        }

        if let Some(counts) = &batch.request_counts {
            let percent = if counts.total > 0 {
                (counts.completed as f64 / counts.total as f64) * 100.0
            } else {
                0.0
            };
            eprintln!(
                "[docs-mcp-search] batch {}: {}/{} ({:.1}%)",
                batch.id, counts.completed, counts.total, percent
            );
        }

        let interval = POLL_INTERVALS_SECS[poll_idx.min(POLL_INTERVALS_SECS.len() - 1)];
        std::thread::sleep(Duration::from_secs(interval));
        poll_idx += 1;
        batch = fetch_batch(provider, &batch.id)?;
    }

    let output_file_id = batch
        .output_file_id
        .ok_or_else(|| DocsError::EmbeddingFatal("completed batch has no output file".to_string()))?;
    let raw = download_results(provider, &output_file_id)?;

    let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let row: BatchResultRow = serde_json::from_str(line)
            .map_err(|e| DocsError::EmbeddingFatal(format!("malformed result row: {e}")))?;
        let Some(idx) = row.custom_id.strip_prefix("req-").and_then(|s| s.parse::<usize>().ok()) else {
            continue;
        };
        if idx >= vectors.len() {
            continue;
        }
        if let Some(response) = row.response {
            if let Some(datum) = response.body.data.into_iter().next() {
                vectors[idx] = Some(datum.embedding);
            }
        }
    }

    vectors
        .into_iter()
        .enumerate()
        .map(|(i, v)| v.ok_or_else(|| DocsError::EmbeddingFatal(format!("no result for request {i}"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_sha_is_stable() {
        let a = content_sha("line one\nline two\n");
        let b = content_sha("line one\nline two\n");
        assert_eq!(a, b);
    }

    #[test]
    fn poll_intervals_escalate_then_repeat() {
        assert_eq!(POLL_INTERVALS_SECS[0], 10);
        assert_eq!(POLL_INTERVALS_SECS[3], 30);
        assert_eq!(POLL_INTERVALS_SECS[5], 60);
    }
}
