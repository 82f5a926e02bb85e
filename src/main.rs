use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docs_mcp_search::config::{ChunkBy, ChunkingStrategy, EmbeddingProviderKind, EmbeddingProviderSettings};
use docs_mcp_search::pipeline::{run_build, BuildRequest};
use docs_mcp_search::server::run_stdio_server;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "docs-mcp-search")]
#[command(version)]
#[command(about = "Hybrid full-text/phrase/vector search index builder and query engine for Markdown documentation corpora")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a docs directory's manifests without building an index.
    Validate {
        #[arg(long, value_name = "PATH")]
        docs_dir: PathBuf,
    },
    /// Build (or rebuild) the search index for a docs directory.
    Build {
        #[arg(long, value_name = "PATH")]
        docs_dir: PathBuf,
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_enum, default_value = "none")]
        embedding_provider: EmbeddingProviderArg,
        #[arg(long)]
        embedding_model: Option<String>,
        #[arg(long)]
        embedding_dimensions: Option<usize>,
        #[arg(long)]
        embedding_api_key: Option<String>,
        #[arg(long)]
        embedding_base_url: Option<String>,
        #[arg(long)]
        embedding_batch_size: Option<usize>,
        #[arg(long)]
        embedding_concurrency: Option<usize>,
        #[arg(long)]
        embedding_max_retries: Option<u32>,
        #[arg(long)]
        rebuild_cache: bool,
        #[arg(long, value_name = "PATH")]
        cache_dir: Option<PathBuf>,
        #[arg(long)]
        tool_description_search: Option<String>,
        #[arg(long)]
        tool_description_get_doc: Option<String>,
    },
    /// Synthesize a baseline `.docs-mcp.json` manifest from heading heuristics.
    Fix {
        #[arg(long, value_name = "PATH")]
        docs_dir: PathBuf,
    },
    /// Start the MCP stdio server, serving `search_docs`/`get_doc` over a built index.
    Mcp {
        #[arg(long, value_name = "PATH")]
        out_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmbeddingProviderArg {
    None,
    Hash,
    Openai,
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar.set_message(message.to_string());
    bar
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Validate { docs_dir } => validate(&docs_dir),
        Command::Build {
            docs_dir,
            out,
            description,
            embedding_provider,
            embedding_model,
            embedding_dimensions,
            embedding_api_key,
            embedding_base_url,
            embedding_batch_size,
            embedding_concurrency,
            embedding_max_retries,
            rebuild_cache,
            cache_dir,
            tool_description_search,
            tool_description_get_doc,
        } => build(
            docs_dir,
            out,
            description,
            embedding_provider,
            embedding_model,
            embedding_dimensions,
            embedding_api_key,
            embedding_base_url,
            embedding_batch_size,
            embedding_concurrency,
            embedding_max_retries,
            rebuild_cache,
            cache_dir,
            tool_description_search,
            tool_description_get_doc,
        ),
        Command::Fix { docs_dir } => fix(&docs_dir),
        Command::Mcp { out_dir } => run_stdio_server(out_dir).map_err(anyhow::Error::from),
    }
}

fn validate(docs_dir: &Path) -> Result<()> {
    let spin = spinner("validating manifests...");
    let mut warnings = Vec::new();
    let mut manifest_count = 0usize;
    let mut markdown_count = 0usize;

    for entry in ignore::WalkBuilder::new(docs_dir).hidden(false).build() {
        let entry = entry.context("walking docs directory")?;
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some(".docs-mcp.json") {
            manifest_count += 1;
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            if let Err(e) = serde_json::from_str::<docs_mcp_search::types::Manifest>(&text) {
                anyhow::bail!("invalid manifest {}: {e}", path.display());
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            markdown_count += 1;
            let dir_has_manifest = path
                .parent()
                .map(|p| p.join(".docs-mcp.json").exists())
                .unwrap_or(false);
            if !dir_has_manifest {
                warnings.push(format!("no manifest found for directory of {}", path.display()));
            }
        }
    }

    spin.finish_with_message(format!(
        "validated {markdown_count} markdown files, {manifest_count} manifests, {} warnings",
        warnings.len()
    ));
    for w in &warnings {
        eprintln!("[docs-mcp-search] WARN: {w}");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build(
    docs_dir: PathBuf,
    out: PathBuf,
    description: Option<String>,
    embedding_provider: EmbeddingProviderArg,
    embedding_model: Option<String>,
    embedding_dimensions: Option<usize>,
    embedding_api_key: Option<String>,
    embedding_base_url: Option<String>,
    embedding_batch_size: Option<usize>,
    embedding_concurrency: Option<usize>,
    embedding_max_retries: Option<u32>,
    rebuild_cache: bool,
    cache_dir: Option<PathBuf>,
    tool_description_search: Option<String>,
    tool_description_get_doc: Option<String>,
) -> Result<()> {
    let provider = match embedding_provider {
        EmbeddingProviderArg::None => EmbeddingProviderKind::None,
        EmbeddingProviderArg::Hash => EmbeddingProviderKind::Hash,
        EmbeddingProviderArg::Openai => EmbeddingProviderKind::Openai,
    };
    let api_key = embedding_api_key.or_else(|| std::env::var("OPENAI_API_KEY").ok());

    let mut embedding_settings = EmbeddingProviderSettings {
        provider,
        api_key,
        base_url: embedding_base_url,
        ..EmbeddingProviderSettings::default()
    };
    if let Some(model) = embedding_model {
        embedding_settings.model = model;
    }
    if let Some(dims) = embedding_dimensions {
        embedding_settings.dimensions = dims;
    }
    if let Some(batch_size) = embedding_batch_size {
        embedding_settings.batch_size = Some(batch_size);
    }
    if let Some(concurrency) = embedding_concurrency {
        embedding_settings.concurrency = concurrency;
    }
    if let Some(max_retries) = embedding_max_retries {
        embedding_settings.max_retries = max_retries;
    }

    let req = BuildRequest {
        docs_dir,
        out_dir: out,
        cache_dir: cache_dir.unwrap_or_else(|| PathBuf::from(".embedding-cache")),
        chunking_defaults: ChunkingStrategy::default(),
        embedding_settings,
        corpus_description: description,
        tool_description_search,
        tool_description_get_doc,
        rebuild_cache,
    };

    let rt = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let summary = rt.block_on(run_build(req)).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    eprintln!(
        "[docs-mcp-search] built {} chunks from {} files ({} embedding hits, {} misses)",
        summary.total_chunks, summary.total_files, summary.embed_hits, summary.embed_misses
    );
    Ok(())
}

struct HeadingCounts {
    h1: usize,
    h2: usize,
    h3: usize,
}

/// Strips fenced code blocks (```...```) before counting headings, so code comments
/// beginning with `#` never skew the heuristic.
fn strip_fenced_code(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut in_fence = false;
    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn count_headings(markdown: &str) -> HeadingCounts {
    let stripped = strip_fenced_code(markdown);
    let mut counts = HeadingCounts { h1: 0, h2: 0, h3: 0 };
    for line in stripped.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix('#') {
            if let Some(rest) = rest.strip_prefix('#') {
                if let Some(rest) = rest.strip_prefix('#') {
                    if rest.starts_with(' ') || rest.is_empty() {
                        counts.h3 += 1;
                        continue;
                    }
                } else if rest.starts_with(' ') || rest.is_empty() {
                    counts.h2 += 1;
                    continue;
                }
            } else if rest.starts_with(' ') || rest.is_empty() {
                counts.h1 += 1;
                continue;
            }
        }
    }
    counts
}

/// Per-file `chunk_by` heuristic (spec §6 "fix" synthesis rules).
fn chunk_by_for(counts: &HeadingCounts) -> ChunkBy {
    if counts.h3 >= 6 && counts.h3 >= 2 * counts.h2 {
        ChunkBy::H3
    } else if counts.h2 >= 2 {
        ChunkBy::H2
    } else if counts.h1 >= 2 {
        ChunkBy::H1
    } else if counts.h3 >= 2 {
        ChunkBy::H3
    } else {
        ChunkBy::File
    }
}

fn fix(docs_dir: &Path) -> Result<()> {
    let spin = spinner("scanning headings...");
    let mut per_file: BTreeMap<String, ChunkBy> = BTreeMap::new();

    for entry in ignore::WalkBuilder::new(docs_dir).hidden(false).build() {
        let entry = entry.context("walking docs directory")?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let markdown = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let relative = path
            .strip_prefix(docs_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        per_file.insert(relative, chunk_by_for(&count_headings(&markdown)));
    }
    spin.finish_with_message(format!("scanned {} files", per_file.len()));

    let mut tally: BTreeMap<ChunkBy, usize> = BTreeMap::new();
    for chunk_by in per_file.values() {
        *tally.entry(*chunk_by).or_insert(0) += 1;
    }
    // Tie-break order h2 > h1 > h3 > file: earlier entries win ties, so only replace
    // the running winner on a strictly greater count.
    let priority = [ChunkBy::H2, ChunkBy::H1, ChunkBy::H3, ChunkBy::File];
    let mut default_chunk_by = ChunkBy::H2;
    let mut best_count = 0usize;
    for chunk_by in priority {
        let count = tally.get(&chunk_by).copied().unwrap_or(0);
        if count > best_count {
            best_count = count;
            default_chunk_by = chunk_by;
        }
    }

    let mut overrides = Vec::new();
    for (path, chunk_by) in &per_file {
        if *chunk_by != default_chunk_by {
            overrides.push(docs_mcp_search::types::ManifestOverride {
                pattern: path.clone(),
                strategy: Some(ChunkingStrategy {
                    chunk_by: *chunk_by,
                    max_chunk_size: None,
                    min_chunk_size: None,
                }),
                metadata: BTreeMap::new(),
            });
        }
    }

    let manifest = docs_mcp_search::types::Manifest {
        version: "1".to_string(),
        strategy: Some(ChunkingStrategy {
            chunk_by: default_chunk_by,
            max_chunk_size: None,
            min_chunk_size: None,
        }),
        metadata: BTreeMap::new(),
        taxonomy: BTreeMap::new(),
        overrides,
        instructions: None,
    };

    let manifest_path = docs_dir.join(".docs-mcp.json");
    std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    eprintln!("[docs-mcp-search] wrote {}", manifest_path.display());
    Ok(())
}
