//! Embedding provider abstraction (spec §4.5): a closed sum type `none | hash | openai`
//! sharing one capability surface, plus the incremental-embed partitioning glue that
//! the pipeline driver runs against an `EmbeddingCache` (see `embedding::cache`).

pub mod batch;
pub mod cache;
pub mod provider;

pub use cache::CacheEntries;
pub use provider::{build_provider, EmbeddingProvider};

use std::collections::BTreeMap;

use crate::config::EmbeddingProviderSettings;
use crate::errors::Result;
use crate::fingerprint::{embedding_fingerprint, embedding_input};
use crate::types::Chunk;

pub struct IncrementalEmbedStats {
    pub total: usize,
    pub hits: usize,
    pub misses: usize,
}

pub struct IncrementalEmbedResult {
    pub vectors_by_chunk_id: BTreeMap<String, Vec<f32>>,
    pub updated_cache: cache::CacheEntries,
    pub stats: IncrementalEmbedStats,
}

/// Embeds only the chunks whose fingerprint is missing from `cache`, reusing
/// everything else (spec §4.6 "Incremental embed").
pub fn embed_incremental(
    chunks: &[Chunk],
    provider: &dyn EmbeddingProvider,
    settings: &EmbeddingProviderSettings,
    previous: Option<&cache::CacheEntries>,
    mut on_progress: impl FnMut(usize, usize),
) -> Result<IncrementalEmbedResult> {
    let format_version = crate::config::EMBEDDING_FORMAT_VERSION;
    let config_fingerprint = provider.config_fingerprint();

    let fingerprints: Vec<String> = chunks
        .iter()
        .map(|c| embedding_fingerprint(format_version, config_fingerprint, &embedding_input(c)))
        .collect();

    let mut vectors_by_chunk_id = BTreeMap::new();
    let mut miss_indices = Vec::new();
    let mut hits = 0usize;

    for (idx, fp) in fingerprints.iter().enumerate() {
        match previous.and_then(|p| p.entries.get(fp)) {
            Some(vector) => {
                vectors_by_chunk_id.insert(chunks[idx].chunk_id.clone(), vector.clone());
                hits += 1;
            }
            None => miss_indices.push(idx),
        }
    }

    let misses = miss_indices.len();
    if !miss_indices.is_empty() {
        let miss_texts: Vec<String> = miss_indices
            .iter()
            .map(|&i| embedding_input(&chunks[i]))
            .collect();

        let embedded = if misses >= settings.batch_api_threshold {
            provider.embed(&miss_texts)?
        } else if let Some(batch_size) = settings.batch_size {
            let mut all = Vec::with_capacity(misses);
            for (done, sub_batch) in miss_texts.chunks(batch_size.max(1)).enumerate() {
                let mut vectors = provider.embed(sub_batch)?;
                all.append(&mut vectors);
                on_progress((done + 1) * batch_size.min(misses), misses);
            }
            all
        } else {
            provider.embed(&miss_texts)?
        };

        for (offset, &idx) in miss_indices.iter().enumerate() {
            vectors_by_chunk_id.insert(chunks[idx].chunk_id.clone(), embedded[offset].clone());
        }
    }

    let mut updated_entries = BTreeMap::new();
    for (idx, fp) in fingerprints.iter().enumerate() {
        if let Some(vector) = vectors_by_chunk_id.get(&chunks[idx].chunk_id) {
            updated_entries.insert(fp.clone(), vector.clone());
        }
    }

    Ok(IncrementalEmbedResult {
        vectors_by_chunk_id,
        updated_cache: cache::CacheEntries {
            entries: updated_entries,
        },
        stats: IncrementalEmbedStats {
            total: chunks.len(),
            hits,
            misses,
        },
    })
}
