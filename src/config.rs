use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default `max_chunk_size` (characters) when a strategy omits it (spec §3).
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 20_000;

/// Format version baked into every embedding fingerprint (spec §4.3). Bump whenever the
/// embedding-input template (`Context: ...\n\nContent:\n...`) changes shape.
pub const EMBEDDING_FORMAT_VERSION: &str = "1";

/// Hard truncation ceiling for embedding provider inputs (spec §4.5).
pub const EMBEDDING_INPUT_MAX_CHARS: usize = 24_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkBy {
    H1,
    H2,
    H3,
    File,
}

impl ChunkBy {
    pub fn heading_level(self) -> Option<u8> {
        match self {
            ChunkBy::H1 => Some(1),
            ChunkBy::H2 => Some(2),
            ChunkBy::H3 => Some(3),
            ChunkBy::File => None,
        }
    }
}

impl Default for ChunkBy {
    fn default() -> Self {
        ChunkBy::H2
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkingStrategy {
    pub chunk_by: ChunkBy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_chunk_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_chunk_size: Option<usize>,
}

impl ChunkingStrategy {
    pub fn max(&self) -> usize {
        self.max_chunk_size.unwrap_or(DEFAULT_MAX_CHUNK_SIZE)
    }

    pub fn min(&self) -> Option<usize> {
        self.min_chunk_size
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_chunk_size {
            if max == 0 {
                return Err("strategy.max_chunk_size must be positive".to_string());
            }
        }
        if let Some(min) = self.min_chunk_size {
            if min == 0 {
                return Err("strategy.min_chunk_size must be positive".to_string());
            }
            if min >= self.max() {
                return Err("strategy.min_chunk_size must be less than max_chunk_size".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    None,
    Hash,
    Openai,
}

impl Default for EmbeddingProviderKind {
    fn default() -> Self {
        EmbeddingProviderKind::None
    }
}

/// Settings for the configured embedding provider (spec §3 `EmbeddingConfig`, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingProviderSettings {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub dimensions: usize,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub batch_size: Option<usize>,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub batch_api_threshold: usize,
}

impl Default for EmbeddingProviderSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::None,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            base_url: None,
            api_key: None,
            batch_size: Some(256),
            concurrency: 4,
            max_retries: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            batch_api_threshold: 2_500,
        }
    }
}

impl EmbeddingProviderSettings {
    pub fn concurrency_clamped(&self) -> usize {
        self.concurrency.clamp(1, 32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub out_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub chunking: ChunkingStrategy,
    pub embedding: EmbeddingProviderSettings,
    pub corpus_description: Option<String>,
    pub tool_description_search: Option<String>,
    pub tool_description_get_doc: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from(".docs-mcp-out"),
            cache_dir: PathBuf::from(".embedding-cache"),
            chunking: ChunkingStrategy::default(),
            embedding: EmbeddingProviderSettings::default(),
            corpus_description: None,
            tool_description_search: None,
            tool_description_get_doc: None,
        }
    }
}

pub fn load_config(docs_dir: &Path) -> Config {
    let path = docs_dir.join(".docs-mcp.config.json");
    let Ok(text) = std::fs::read_to_string(path) else {
        return Config::default();
    };
    serde_json::from_str::<Config>(&text).unwrap_or_else(|_| Config::default())
}

/// Rebuilds provider settings for query-time embedding from the published corpus
/// metadata's `EmbeddingConfig` (spec §6 "the query embedder must match the build
/// embedder's provider/model/dimensions exactly"). The API key isn't persisted in
/// `metadata.json`, so it's re-read from `OPENAI_API_KEY` at query time.
pub fn build_embedding_settings_for_query(cfg: &crate::types::EmbeddingConfig) -> EmbeddingProviderSettings {
    let provider = match cfg.provider.as_str() {
        "openai" => EmbeddingProviderKind::Openai,
        "hash" => EmbeddingProviderKind::Hash,
        _ => EmbeddingProviderKind::None,
    };
    EmbeddingProviderSettings {
        provider,
        model: cfg.model.clone(),
        dimensions: cfg.dimensions,
        api_key: std::env::var("OPENAI_API_KEY").ok(),
        ..EmbeddingProviderSettings::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_chunk_size_is_20000() {
        let s = ChunkingStrategy::default();
        assert_eq!(s.max(), 20_000);
    }

    #[test]
    fn min_must_be_less_than_max() {
        let s = ChunkingStrategy {
            chunk_by: ChunkBy::H2,
            max_chunk_size: Some(100),
            min_chunk_size: Some(100),
        };
        assert!(s.validate().is_err());
    }
}
