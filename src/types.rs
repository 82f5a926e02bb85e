//! Shared data model (spec §3): `Chunk`, `Manifest`, taxonomy, corpus metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ChunkingStrategy;

/// A stable, immutable unit of retrieval produced by the chunker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub filepath: String,
    pub heading: String,
    pub heading_level: u8,
    pub content: String,
    pub content_text: String,
    pub breadcrumb: String,
    pub chunk_index: usize,
    pub metadata: BTreeMap<String, String>,
}

impl Chunk {
    /// The text actually sent to the embedding provider (spec §4.3).
    pub fn embedding_input(&self) -> String {
        let context = if self.breadcrumb.is_empty() {
            self.filepath.as_str()
        } else {
            self.breadcrumb.as_str()
        };
        format!("Context: {context}\n\nContent:\n{}", self.content_text)
    }
}

/// An override rule within a manifest (spec §3/§4.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestOverride {
    pub pattern: String,
    #[serde(default)]
    pub strategy: Option<ChunkingStrategy>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxonomyProperty {
    #[serde(default)]
    pub mcp_resource: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxonomyDimension {
    #[serde(default)]
    pub vector_collapse: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, TaxonomyProperty>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Per-directory configuration file (`.docs-mcp.json`, spec §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_manifest_version")]
    pub version: String,
    #[serde(default)]
    pub strategy: Option<ChunkingStrategy>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub taxonomy: BTreeMap<String, TaxonomyDimension>,
    #[serde(default)]
    pub overrides: Vec<ManifestOverride>,
    #[serde(default)]
    pub instructions: Option<String>,
}

fn default_manifest_version() -> String {
    "1".to_string()
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: default_manifest_version(),
            strategy: None,
            metadata: BTreeMap::new(),
            taxonomy: BTreeMap::new(),
            overrides: Vec::new(),
            instructions: None,
        }
    }
}

/// Result of resolving a manifest + overrides + in-file hints for one file (spec §4.1).
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub strategy: ChunkingStrategy,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub config_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusStats {
    pub total_chunks: usize,
    pub total_files: usize,
    pub indexed_at: String,
    pub source_commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyMetadata {
    pub description: Option<String>,
    pub values: Vec<String>,
    #[serde(default)]
    pub vector_collapse: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, TaxonomyProperty>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSidecarInfo {
    pub engine: String,
    pub table: String,
    pub path: String,
}

/// Sidecar `metadata.json` written alongside the index directory (spec §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusMetadata {
    pub metadata_version: String,
    pub corpus_description: Option<String>,
    pub taxonomy: BTreeMap<String, TaxonomyMetadata>,
    pub stats: CorpusStats,
    pub embedding: Option<EmbeddingConfig>,
    pub tool_descriptions: Option<BTreeMap<String, String>>,
    pub instructions: Option<String>,
    pub index: IndexSidecarInfo,
}

impl CorpusMetadata {
    /// Recovers the `TaxonomyDimension` shape the query engine needs (filter/collapse
    /// flags) from the flattened `TaxonomyMetadata` written at build time.
    pub fn taxonomy_dimensions(&self) -> BTreeMap<String, TaxonomyDimension> {
        self.taxonomy
            .iter()
            .map(|(key, meta)| {
                (
                    key.clone(),
                    TaxonomyDimension {
                        vector_collapse: meta.vector_collapse,
                        properties: meta.properties.clone(),
                        description: meta.description.clone(),
                    },
                )
            })
            .collect()
    }
}
