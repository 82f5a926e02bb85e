//! Deterministic fingerprints (spec §4.3).
//!
//! Both fingerprints are pure functions of their documented inputs: no wall-clock,
//! no chunk_id, no filesystem metadata. Stability here is what makes chunk reuse
//! (§4.4) and embedding cache hits (§4.6) sound.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::ChunkingStrategy;
use crate::types::Chunk;

fn hex_sha256(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    format!("{:x}", hasher.finalize())
}

/// `H(markdown ‖ 0 ‖ JSON(strategy) ‖ 0 ‖ JSON(metadata, keys sorted))`
pub fn chunking_fingerprint(
    markdown: &str,
    strategy: &ChunkingStrategy,
    metadata: &BTreeMap<String, String>,
) -> String {
    // BTreeMap already serializes with sorted keys.
    let strategy_json = serde_json::to_string(strategy).unwrap_or_default();
    let metadata_json = serde_json::to_string(metadata).unwrap_or_default();
    hex_sha256(&[
        markdown.as_bytes(),
        &[0u8],
        strategy_json.as_bytes(),
        &[0u8],
        metadata_json.as_bytes(),
    ])
}

/// `"Context: " ‖ (breadcrumb or filepath) ‖ "\n\nContent:\n" ‖ content_text`
pub fn embedding_input(chunk: &Chunk) -> String {
    chunk.embedding_input()
}

/// `H(format_version ‖ 0 ‖ config_fingerprint ‖ 0 ‖ embedding_input)`
///
/// Deliberately excludes `chunk_id` so structurally identical chunks in different
/// files share a vector under matching provider config.
pub fn embedding_fingerprint(format_version: &str, config_fingerprint: &str, input: &str) -> String {
    hex_sha256(&[
        format_version.as_bytes(),
        &[0u8],
        config_fingerprint.as_bytes(),
        &[0u8],
        input.as_bytes(),
    ])
}

/// `H(sorted(provider, model, dimensions, baseUrl))` (spec §3 `EmbeddingConfig`).
pub fn provider_config_fingerprint(
    provider: &str,
    model: &str,
    dimensions: usize,
    base_url: Option<&str>,
) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("provider", provider.to_string());
    fields.insert("model", model.to_string());
    fields.insert("dimensions", dimensions.to_string());
    fields.insert("baseUrl", base_url.unwrap_or("").to_string());
    let json = serde_json::to_string(&fields).unwrap_or_default();
    hex_sha256(&[json.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkBy;

    #[test]
    fn chunking_fingerprint_is_pure() {
        let strategy = ChunkingStrategy {
            chunk_by: ChunkBy::H2,
            max_chunk_size: None,
            min_chunk_size: None,
        };
        let metadata = BTreeMap::new();
        let a = chunking_fingerprint("# Title\nbody", &strategy, &metadata);
        let b = chunking_fingerprint("# Title\nbody", &strategy, &metadata);
        assert_eq!(a, b);

        let c = chunking_fingerprint("# Title\nbody2", &strategy, &metadata);
        assert_ne!(a, c);
    }

    #[test]
    fn embedding_fingerprint_excludes_chunk_id() {
        let chunk_a = Chunk {
            chunk_id: "a.md#section".to_string(),
            filepath: "a.md".to_string(),
            heading: "Section".to_string(),
            heading_level: 2,
            content: "# Section\nhello".to_string(),
            content_text: "hello".to_string(),
            breadcrumb: "a.md > Section".to_string(),
            chunk_index: 0,
            metadata: BTreeMap::new(),
        };
        let chunk_b = Chunk {
            chunk_id: "b.md#section".to_string(),
            filepath: "b.md".to_string(),
            breadcrumb: "a.md > Section".to_string(),
            ..chunk_a.clone()
        };

        let fp_a = embedding_fingerprint("1", "cfg", &embedding_input(&chunk_a));
        let fp_b = embedding_fingerprint("1", "cfg", &embedding_input(&chunk_b));
        assert_eq!(fp_a, fp_b, "identical breadcrumb+content_text must share a fingerprint");
    }

    #[test]
    fn metadata_key_order_does_not_affect_fingerprint() {
        let strategy = ChunkingStrategy::default();
        let mut m1 = BTreeMap::new();
        m1.insert("b".to_string(), "2".to_string());
        m1.insert("a".to_string(), "1".to_string());
        let mut m2 = BTreeMap::new();
        m2.insert("a".to_string(), "1".to_string());
        m2.insert("b".to_string(), "2".to_string());
        assert_eq!(
            chunking_fingerprint("x", &strategy, &m1),
            chunking_fingerprint("x", &strategy, &m2)
        );
    }
}
