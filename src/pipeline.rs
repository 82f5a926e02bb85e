//! Build pipeline driver (spec §2 "Pipeline", §4.4 canary, §5 resource ownership):
//! wires manifest resolution, chunking, fingerprinting, previous-index chunk reuse,
//! incremental embedding, and the atomic index publish into one `run_build` call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use ignore::WalkBuilder;

use crate::chunker::build_chunks;
use crate::config::{ChunkingStrategy, EmbeddingProviderSettings};
use crate::embedding::{self, build_provider};
use crate::errors::{DocsError, Result};
use crate::fingerprint::chunking_fingerprint;
use crate::index::builder::{build_index, BuildIndexRequest};
use crate::index::previous::load_previous_index;
use crate::manifest::{self, NearestManifest};
use crate::types::{
    Chunk, CorpusMetadata, CorpusStats, EmbeddingConfig, IndexSidecarInfo, Manifest, TaxonomyDimension,
    TaxonomyMetadata,
};

const MANIFEST_FILENAME: &str = ".docs-mcp.json";
const CANARY_SAMPLE_SIZE: usize = 10;

pub struct BuildRequest {
    pub docs_dir: PathBuf,
    pub out_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub chunking_defaults: ChunkingStrategy,
    pub embedding_settings: EmbeddingProviderSettings,
    pub corpus_description: Option<String>,
    pub tool_description_search: Option<String>,
    pub tool_description_get_doc: Option<String>,
    pub rebuild_cache: bool,
}

pub struct BuildSummary {
    pub total_files: usize,
    pub total_chunks: usize,
    pub embed_hits: usize,
    pub embed_misses: usize,
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(Duration::from_millis(80));
    bar.set_message(message.to_string());
    bar
}

fn posix_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Collects every `.docs-mcp.json` under `docs_dir`, keyed by the directory that
/// contains it (spec §4.1 "nearest ancestor manifest").
fn discover_manifests(docs_dir: &Path) -> Result<HashMap<PathBuf, Manifest>> {
    let mut manifests = HashMap::new();
    for entry in WalkBuilder::new(docs_dir).hidden(false).build() {
        let Ok(entry) = entry else { continue };
        if entry.file_name() != MANIFEST_FILENAME {
            continue;
        }
        let path = entry.path();
        let text = std::fs::read_to_string(path).map_err(|e| DocsError::Config {
            field: path.display().to_string(),
            message: e.to_string(),
        })?;
        let manifest: Manifest = serde_json::from_str(&text).map_err(|e| DocsError::Config {
            field: path.display().to_string(),
            message: e.to_string(),
        })?;
        let dir = path.parent().unwrap_or(docs_dir).to_path_buf();
        manifests.insert(dir, manifest);
    }
    Ok(manifests)
}

fn nearest_manifest<'a>(
    file_dir: &Path,
    manifests: &'a HashMap<PathBuf, Manifest>,
    docs_dir: &Path,
) -> Option<(&'a Manifest, &'a Path)> {
    let mut current = Some(file_dir);
    while let Some(dir) = current {
        if let Some((key, manifest)) = manifests.get_key_value(dir) {
            return Some((manifest, key.as_path()));
        }
        if dir == docs_dir {
            break;
        }
        current = dir.parent();
    }
    None
}

fn discover_markdown_files(docs_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkBuilder::new(docs_dir).hidden(false).build() {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("md") {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    files
}

struct ResolvedFile {
    relative_path: String,
    markdown: String,
    strategy: ChunkingStrategy,
    metadata: BTreeMap<String, String>,
    fingerprint: String,
}

fn resolve_files(
    docs_dir: &Path,
    files: &[PathBuf],
    manifests: &HashMap<PathBuf, Manifest>,
    defaults: &ChunkingStrategy,
    taxonomy: &mut BTreeMap<String, TaxonomyDimension>,
) -> Result<Vec<ResolvedFile>> {
    let mut out = Vec::with_capacity(files.len());
    for path in files {
        let markdown = std::fs::read_to_string(path).map_err(|e| DocsError::Config {
            field: path.display().to_string(),
            message: e.to_string(),
        })?;
        let relative_path = posix_relative(path, docs_dir);
        let nearest = nearest_manifest(path.parent().unwrap_or(docs_dir), manifests, docs_dir);

        if let Some((manifest, _)) = &nearest {
            manifest::merge_taxonomy(taxonomy, &manifest.taxonomy);
        }

        let nm = nearest.map(|(manifest, base_dir)| NearestManifest { manifest, base_dir });
        let resolved = manifest::resolve_config(Path::new(&relative_path), &markdown, nm, defaults)?;
        let fingerprint = chunking_fingerprint(&markdown, &resolved.strategy, &resolved.metadata);

        out.push(ResolvedFile {
            relative_path,
            markdown,
            strategy: resolved.strategy,
            metadata: resolved.metadata,
            fingerprint,
        });
    }
    Ok(out)
}

/// Runs the canary (spec §4.4): re-chunks up to ten fingerprint-matching files and
/// compares them to the stored chunks by structural JSON equality. Returns `false`
/// (and warns) if any mismatch is found, meaning the whole cache must be discarded.
async fn run_canary(
    resolved: &[ResolvedFile],
    previous: &crate::index::previous::PreviousIndex,
    chunked_cache: &mut HashMap<String, Vec<Chunk>>,
) -> Result<bool> {
    let mut checked = 0usize;
    for file in resolved {
        if checked >= CANARY_SAMPLE_SIZE {
            break;
        }
        let Some(prev_fp) = previous.fingerprints.get(&file.relative_path) else {
            continue;
        };
        if prev_fp != &file.fingerprint {
            continue;
        }
        checked += 1;

        let fresh = build_chunks(&file.relative_path, &file.markdown, &file.strategy, &file.metadata)?;
        let stored = previous.get_chunks(&file.relative_path).await?;

        let fresh_json = serde_json::to_string(&fresh).unwrap_or_default();
        let stored_json = serde_json::to_string(&stored).unwrap_or_default();
        if fresh_json != stored_json {
            eprintln!(
                "[docs-mcp-search] WARN: canary mismatch on '{}', discarding previous-index chunk cache",
                file.relative_path
            );
            return Ok(false);
        }
        chunked_cache.insert(file.relative_path.clone(), fresh);
    }
    Ok(true)
}

/// Runs the full build pipeline and atomically publishes the new index (spec §2, §4.7).
pub async fn run_build(req: BuildRequest) -> Result<BuildSummary> {
    let manifest_spinner = spinner("resolving manifests...");
    let manifests = discover_manifests(&req.docs_dir)?;
    let files = discover_markdown_files(&req.docs_dir);
    let mut taxonomy: BTreeMap<String, TaxonomyDimension> = BTreeMap::new();
    let resolved = resolve_files(&req.docs_dir, &files, &manifests, &req.chunking_defaults, &mut taxonomy)?;
    manifest_spinner.finish_with_message(format!("resolved {} files", resolved.len()));

    let db_path = req.out_dir.join(".lancedb");
    let previous = if req.rebuild_cache {
        None
    } else {
        load_previous_index(&db_path).await
    };

    let mut chunked_cache: HashMap<String, Vec<Chunk>> = HashMap::new();
    let reuse_enabled = match &previous {
        Some(prev) => run_canary(&resolved, prev, &mut chunked_cache).await?,
        None => false,
    };

    let chunk_spinner = spinner("chunking...");
    let mut all_chunks: Vec<Chunk> = Vec::new();
    let mut file_fingerprints: BTreeMap<String, String> = BTreeMap::new();
    for file in &resolved {
        file_fingerprints.insert(file.relative_path.clone(), file.fingerprint.clone());

        let reused = reuse_enabled
            .then(|| previous.as_ref())
            .flatten()
            .and_then(|prev| prev.fingerprints.get(&file.relative_path))
            .filter(|prev_fp| **prev_fp == file.fingerprint);

        let chunks = if reused.is_some() {
            if let Some(cached) = chunked_cache.remove(&file.relative_path) {
                cached
            } else {
                previous.as_ref().unwrap().get_chunks(&file.relative_path).await?
            }
        } else {
            build_chunks(&file.relative_path, &file.markdown, &file.strategy, &file.metadata)?
        };
        all_chunks.extend(chunks);
    }
    chunk_spinner.finish_with_message(format!("produced {} chunks", all_chunks.len()));

    if let Some(prev) = previous {
        prev.close();
    }

    let provider = build_provider(&req.embedding_settings)?;
    let format_version = crate::config::EMBEDDING_FORMAT_VERSION;
    let config_fingerprint = provider.config_fingerprint().to_string();

    let previous_cache = if req.rebuild_cache {
        None
    } else {
        embedding::cache::load(&req.cache_dir, format_version, &config_fingerprint)
    };

    let embed_spinner = spinner("embedding (0/0)...");
    let embed_result = embedding::embed_incremental(
        &all_chunks,
        provider.as_ref(),
        &req.embedding_settings,
        previous_cache.as_ref(),
        |done, total| embed_spinner.set_message(format!("embedding ({done}/{total})...")),
    )?;
    embed_spinner.finish_with_message(format!(
        "embedded: {} hits, {} misses",
        embed_result.stats.hits, embed_result.stats.misses
    ));

    if let Err(e) = embedding::cache::save(&req.cache_dir, &embed_result.updated_cache, format_version, &config_fingerprint)
    {
        eprintln!("[docs-mcp-search] WARN: failed to persist embedding cache (non-fatal): {e}");
    }

    let metadata_keys: Vec<String> = taxonomy.keys().cloned().collect();

    let index_spinner = spinner("building index...");
    let build_request = BuildIndexRequest {
        db_path: &db_path,
        chunks: &all_chunks,
        metadata_keys: &metadata_keys,
        vectors_by_chunk_id: Some(&embed_result.vectors_by_chunk_id),
        file_fingerprints: Some(&file_fingerprints),
    };
    build_index(build_request, |stage| index_spinner.set_message(format!("index: {stage}"))).await?;
    index_spinner.finish_with_message("index published");

    std::fs::create_dir_all(&req.out_dir).map_err(|e| DocsError::IndexBuild {
        stage: "sidecar write".to_string(),
        message: e.to_string(),
    })?;
    std::fs::write(
        req.out_dir.join("chunks.json"),
        serde_json::to_vec_pretty(&all_chunks).unwrap_or_default(),
    )
    .map_err(|e| DocsError::IndexBuild {
        stage: "sidecar write".to_string(),
        message: e.to_string(),
    })?;

    let taxonomy_metadata = taxonomy_metadata_for(&taxonomy, &all_chunks);
    let corpus_metadata = CorpusMetadata {
        metadata_version: "1".to_string(),
        corpus_description: req.corpus_description,
        taxonomy: taxonomy_metadata,
        stats: CorpusStats {
            total_chunks: all_chunks.len(),
            total_files: resolved.len(),
            indexed_at: now_rfc3339(),
            source_commit: None,
        },
        embedding: Some(EmbeddingConfig {
            provider: provider.name().to_string(),
            model: provider.model().to_string(),
            dimensions: provider.dimensions(),
            config_fingerprint,
        }),
        tool_descriptions: build_tool_descriptions(req.tool_description_search, req.tool_description_get_doc),
        instructions: manifests.values().find_map(|m| m.instructions.clone()),
        index: IndexSidecarInfo {
            engine: "lancedb".to_string(),
            table: "chunks".to_string(),
            path: ".lancedb".to_string(),
        },
    };
    std::fs::write(
        req.out_dir.join("metadata.json"),
        serde_json::to_vec_pretty(&corpus_metadata).unwrap_or_default(),
    )
    .map_err(|e| DocsError::IndexBuild {
        stage: "sidecar write".to_string(),
        message: e.to_string(),
    })?;

    Ok(BuildSummary {
        total_files: resolved.len(),
        total_chunks: all_chunks.len(),
        embed_hits: embed_result.stats.hits,
        embed_misses: embed_result.stats.misses,
    })
}

fn taxonomy_metadata_for(
    taxonomy: &BTreeMap<String, TaxonomyDimension>,
    chunks: &[Chunk],
) -> BTreeMap<String, TaxonomyMetadata> {
    taxonomy
        .iter()
        .map(|(key, dim)| {
            let mut values: BTreeSet<String> = BTreeSet::new();
            for chunk in chunks {
                if let Some(v) = chunk.metadata.get(key) {
                    if !v.is_empty() {
                        values.insert(v.clone());
                    }
                }
            }
            (
                key.clone(),
                TaxonomyMetadata {
                    description: dim.description.clone(),
                    values: values.into_iter().collect(),
                    vector_collapse: dim.vector_collapse,
                    properties: dim.properties.clone(),
                },
            )
        })
        .collect()
}

fn build_tool_descriptions(
    search: Option<String>,
    get_doc: Option<String>,
) -> Option<BTreeMap<String, String>> {
    if search.is_none() && get_doc.is_none() {
        return None;
    }
    let mut map = BTreeMap::new();
    if let Some(s) = search {
        map.insert("search_docs".to_string(), s);
    }
    if let Some(g) = get_doc {
        map.insert("get_doc".to_string(), g);
    }
    Some(map)
}

/// A minimal RFC3339 UTC timestamp without pulling in a wall-clock-dependent
/// dependency beyond `std::time`.
fn now_rfc3339() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let mut z = days as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    z -= era * 146_097;
    let doe = z as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m_cal = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m_cal <= 2 { y + 1 } else { y };

    format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z", y, m_cal, d, h, m, s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn discover_manifests_keys_by_containing_directory() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("guides");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join(MANIFEST_FILENAME), r#"{"version":"1"}"#).unwrap();

        let manifests = discover_manifests(dir.path()).unwrap();
        assert_eq!(manifests.len(), 1);
        assert!(manifests.contains_key(&sub));
    }

    #[test]
    fn nearest_manifest_walks_up_ancestors() {
        let mut manifests = HashMap::new();
        let root = PathBuf::from("/docs");
        manifests.insert(root.clone(), Manifest::default());

        let found = nearest_manifest(Path::new("/docs/api/v1"), &manifests, &root);
        assert!(found.is_some());
    }

    #[test]
    fn discover_markdown_files_is_sorted_and_md_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.md"), "# B").unwrap();
        std::fs::write(dir.path().join("a.md"), "# A").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = discover_markdown_files(dir.path());
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.md".to_string(), "b.md".to_string()]);
    }

    #[test]
    fn now_rfc3339_has_expected_shape() {
        let ts = now_rfc3339();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
    }
}
