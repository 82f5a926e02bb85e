// NOTE: LanceDB Rust APIs have shifted across minor versions; this module is
// written against the workspace's resolved `lancedb` crate (see index/builder.rs).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use arrow_array::{Array, StringArray};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingProvider;
use crate::errors::{DocsError, Result};
use crate::types::TaxonomyDimension;

use super::cursor;
use super::fusion::{self, CollapseCandidate, RrfWeights};
use super::snippet;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub cursor: Option<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    pub rrf_weights: Option<RrfWeightsRequest>,
    pub taxonomy_keys: Option<Vec<String>>,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RrfWeightsRequest {
    #[serde(rename = "match")]
    pub match_weight: Option<f64>,
    pub phrase: Option<f64>,
    pub vector: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub chunk_id: String,
    pub heading: String,
    pub breadcrumb: String,
    pub snippet: String,
    pub filepath: String,
    pub metadata: BTreeMap<String, String>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHint {
    pub message: String,
    pub suggested_filters: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub hits: Vec<Hit>,
    pub next_cursor: Option<String>,
    pub hint: Option<SearchHint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetDocRequest {
    pub chunk_id: String,
    #[serde(default)]
    pub context: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetDocResult {
    pub text: String,
}

struct Row {
    chunk_id: String,
    filepath: String,
    heading: String,
    breadcrumb: String,
    content_text: String,
    chunk_index: usize,
    metadata: BTreeMap<String, String>,
}

/// A read-only handle over one published index (spec §5 "Resource ownership").
/// Shared across concurrent search requests; opened once, closed on teardown.
pub struct QueryEngine {
    table: lancedb::Table,
    taxonomy: BTreeMap<String, TaxonomyDimension>,
    query_embedder: Option<Box<dyn EmbeddingProvider>>,
    vector_search_degraded_warned: Mutex<bool>,
}

impl QueryEngine {
    pub async fn open(
        db_path: &Path,
        taxonomy: BTreeMap<String, TaxonomyDimension>,
        query_embedder: Option<Box<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let db = lancedb::connect(db_path.to_string_lossy().as_ref())
            .execute()
            .await
            .map_err(|e| DocsError::Query(e.to_string()))?;
        let table = db
            .open_table("chunks")
            .execute()
            .await
            .map_err(|e| DocsError::Query(e.to_string()))?;
        Ok(Self {
            table,
            taxonomy,
            query_embedder,
            vector_search_degraded_warned: Mutex::new(false),
        })
    }

    fn warn_vector_degraded_once(&self, reason: &str) {
        let mut warned = self.vector_search_degraded_warned.lock().unwrap();
        if !*warned {
            eprintln!("[docs-mcp-search] WARN: vector search degraded to lexical-only: {reason}");
            *warned = true;
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResult> {
        if request.query.trim().is_empty() {
            return Err(DocsError::Query("query must be non-empty".to_string()));
        }
        let limit = request.limit.clamp(1, 50);

        let offset = match &request.cursor {
            Some(c) => cursor::decode(c, &request.query, &request.filters)?.0,
            None => 0,
        };

        let weights = RrfWeights {
            w_match: request
                .rrf_weights
                .as_ref()
                .and_then(|w| w.match_weight)
                .unwrap_or(1.0),
            w_phrase: request.rrf_weights.as_ref().and_then(|w| w.phrase).unwrap_or(1.25),
            w_vector: request.rrf_weights.as_ref().and_then(|w| w.vector).unwrap_or(1.0),
        };

        let predicate = build_predicate(&request.filters, &self.taxonomy);
        let fetch_limit = (offset + limit + 200).clamp(limit * 5, 5000);

        let (match_ranks, match_rows) = self.run_match_query(&request.query, &predicate, fetch_limit).await?;
        let (phrase_ranks, phrase_rows) = self.run_phrase_query(&request.query, &predicate, fetch_limit).await?;
        let (vector_ranks, vector_rows) = self.run_vector_query(&request.query, &predicate, fetch_limit).await;

        let mut rows: HashMap<String, Row> = HashMap::new();
        for row in match_rows.into_iter().chain(phrase_rows).chain(vector_rows) {
            rows.entry(row.chunk_id.clone()).or_insert(row);
        }

        let fused = fusion::fuse(&match_ranks, &phrase_ranks, &vector_ranks, weights);

        let candidates: HashMap<String, CollapseCandidate<'_>> = rows
            .values()
            .map(|r| {
                (
                    r.chunk_id.clone(),
                    CollapseCandidate {
                        chunk_id: &r.chunk_id,
                        filepath: &r.filepath,
                        heading: &r.heading,
                        metadata: &r.metadata,
                    },
                )
            })
            .collect();
        let deduped = fusion::collapse_variants(&fused, &candidates, &self.taxonomy, &request.filters);

        if deduped.is_empty() {
            let hint = self.empty_result_hint(&request.filters).await.ok();
            return Ok(SearchResult {
                hits: Vec::new(),
                next_cursor: None,
                hint,
            });
        }

        let page: Vec<&(String, f64)> = deduped.iter().skip(offset).take(limit).collect();
        let has_more = offset + page.len() < deduped.len();

        let hits: Vec<Hit> = page
            .into_iter()
            .filter_map(|(chunk_id, score)| {
                rows.get(chunk_id).map(|row| Hit {
                    chunk_id: row.chunk_id.clone(),
                    heading: row.heading.clone(),
                    breadcrumb: row.breadcrumb.clone(),
                    snippet: snippet::render(&row.content_text, &request.query),
                    filepath: row.filepath.clone(),
                    metadata: row.metadata.clone(),
                    score: *score,
                })
            })
            .collect();

        let next_cursor = if has_more {
            Some(cursor::encode(offset + limit, limit, &request.query, &request.filters))
        } else {
            None
        };

        Ok(SearchResult {
            hits,
            next_cursor,
            hint: None,
        })
    }

    pub async fn get_doc(&self, request: GetDocRequest) -> Result<GetDocResult> {
        validate_chunk_id(&request.chunk_id)?;
        let context = request.context.unwrap_or(0);
        if !(context == -1 || (0..=5).contains(&context)) {
            return Err(DocsError::Query("context must be -1 or in 0..=5".to_string()));
        }

        let target = self.fetch_row(&request.chunk_id).await?;
        let all = self.fetch_file_chunks(&target.filepath).await?;
        let total = all.len();

        let selected: Vec<&Row> = if context == -1 {
            all.iter().collect()
        } else {
            let k = context as usize;
            let lo = target.chunk_index.saturating_sub(k);
            let hi = (target.chunk_index + k).min(total.saturating_sub(1));
            all.iter().filter(|r| r.chunk_index >= lo && r.chunk_index <= hi).collect()
        };

        let blocks: Vec<String> = selected
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let label = if row.chunk_id == target.chunk_id {
                    "Target".to_string()
                } else {
                    let delta = row.chunk_index as i64 - target.chunk_index as i64;
                    format!("Context: {}{}", if delta > 0 { "+" } else { "" }, delta)
                };
                format!(
                    "--- Chunk: {} (Chunk {} of {}) ({}) ---\n{}",
                    row.chunk_id,
                    i + 1,
                    selected.len(),
                    label,
                    row.content_text
                )
            })
            .collect();

        Ok(GetDocResult {
            text: blocks.join("\n\n"),
        })
    }

    async fn fetch_row(&self, chunk_id: &str) -> Result<Row> {
        let escaped = chunk_id.replace('\'', "''");
        let mut stream = self
            .table
            .query()
            .only_if(format!("chunk_id = '{escaped}'"))
            .limit(1)
            .execute()
            .await
            .map_err(|e| DocsError::Query(e.to_string()))?;
        while let Some(batch) = stream.try_next().await.map_err(|e| DocsError::Query(e.to_string()))? {
            let rows = decode_rows(&batch);
            if let Some(row) = rows.into_iter().next() {
                return Ok(row);
            }
        }
        Err(DocsError::ChunkNotFound(chunk_id.to_string()))
    }

    async fn fetch_file_chunks(&self, filepath: &str) -> Result<Vec<Row>> {
        let escaped = filepath.replace('\'', "''");
        let mut stream = self
            .table
            .query()
            .only_if(format!("filepath = '{escaped}'"))
            .execute()
            .await
            .map_err(|e| DocsError::Query(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(|e| DocsError::Query(e.to_string()))? {
            out.extend(decode_rows(&batch));
        }
        out.sort_by_key(|r| r.chunk_index);
        Ok(out)
    }

    async fn run_match_query(
        &self,
        query: &str,
        predicate: &Option<String>,
        fetch_limit: usize,
    ) -> Result<(Vec<String>, Vec<Row>)> {
        let mut q = self
            .table
            .query()
            .full_text_search(lancedb::query::FullTextSearchQuery::new(query.to_string()).columns(vec![
                "heading".to_string(),
                "content_text".to_string(),
            ]))
            .limit(fetch_limit);
        if let Some(p) = predicate {
            q = q.only_if(p.clone());
        }
        let mut stream = q.execute().await.map_err(|e| DocsError::Query(e.to_string()))?;
        let mut rows = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(|e| DocsError::Query(e.to_string()))? {
            rows.extend(decode_rows(&batch));
        }
        let ranks = rows.iter().map(|r| r.chunk_id.clone()).collect();
        Ok((ranks, rows))
    }

    async fn run_phrase_query(
        &self,
        query: &str,
        predicate: &Option<String>,
        fetch_limit: usize,
    ) -> Result<(Vec<String>, Vec<Row>)> {
        let slop = 0u32;
        let mut q = self
            .table
            .query()
            .full_text_search(
                lancedb::query::FullTextSearchQuery::new(format!("\"{query}\""))
                    .columns(vec!["content_text".to_string()])
                    .phrase_slop(slop),
            )
            .limit(fetch_limit);
        if let Some(p) = predicate {
            q = q.only_if(p.clone());
        }
        let mut stream = q.execute().await.map_err(|e| DocsError::Query(e.to_string()))?;
        let mut rows = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(|e| DocsError::Query(e.to_string()))? {
            rows.extend(decode_rows(&batch));
        }
        let ranks = rows.iter().map(|r| r.chunk_id.clone()).collect();
        Ok((ranks, rows))
    }

    async fn run_vector_query(
        &self,
        query: &str,
        predicate: &Option<String>,
        fetch_limit: usize,
    ) -> (Vec<String>, Vec<Row>) {
        let Some(provider) = &self.query_embedder else {
            return (Vec::new(), Vec::new());
        };
        let embedded = match provider.embed(&[query.to_string()]) {
            Ok(v) if !v.is_empty() && !v[0].is_empty() => v.into_iter().next().unwrap(),
            Ok(_) => {
                self.warn_vector_degraded_once("query-time provider returned an empty vector");
                return (Vec::new(), Vec::new());
            }
            Err(e) => {
                self.warn_vector_degraded_once(&e.to_string());
                return (Vec::new(), Vec::new());
            }
        };

        let mut q = match self.table.vector_search(embedded) {
            Ok(q) => q.limit(fetch_limit),
            Err(e) => {
                self.warn_vector_degraded_once(&e.to_string());
                return (Vec::new(), Vec::new());
            }
        };
        if let Some(p) = predicate {
            q = q.only_if(p.clone());
        }
        let stream = match q.execute().await {
            Ok(s) => s,
            Err(e) => {
                self.warn_vector_degraded_once(&e.to_string());
                return (Vec::new(), Vec::new());
            }
        };
        let mut stream = stream;
        let mut rows = Vec::new();
        while let Ok(Some(batch)) = stream.try_next().await {
            rows.extend(decode_rows(&batch));
        }
        let ranks = rows.iter().map(|r| r.chunk_id.clone()).collect();
        (ranks, rows)
    }

    async fn empty_result_hint(&self, filters: &BTreeMap<String, String>) -> Result<SearchHint> {
        let mut stream = self
            .table
            .query()
            .limit(100)
            .execute()
            .await
            .map_err(|e| DocsError::Query(e.to_string()))?;

        let mut observed: HashMap<String, HashSet<String>> = HashMap::new();
        while let Some(batch) = stream.try_next().await.map_err(|e| DocsError::Query(e.to_string()))? {
            for row in decode_rows(&batch) {
                for (key, active_value) in filters {
                    if let Some(value) = row.metadata.get(key) {
                        if !value.is_empty() && value != active_value {
                            observed.entry(key.clone()).or_default().insert(value.clone());
                        }
                    }
                }
            }
        }

        let suggested_filters: BTreeMap<String, Vec<String>> = observed
            .into_iter()
            .map(|(k, v)| {
                let mut values: Vec<String> = v.into_iter().collect();
                values.sort();
                (k, values)
            })
            .collect();

        Ok(SearchHint {
            message: "No results matched your filters; try relaxing them.".to_string(),
            suggested_filters,
        })
    }
}

/// `non-whitespace`, no spaces, one optional `#fragment` (spec §4.8.2).
fn validate_chunk_id(chunk_id: &str) -> Result<()> {
    if chunk_id.is_empty() || chunk_id.chars().any(char::is_whitespace) {
        return Err(DocsError::InvalidChunkId(chunk_id.to_string()));
    }
    if chunk_id.matches('#').count() > 1 {
        return Err(DocsError::InvalidChunkId(chunk_id.to_string()));
    }
    Ok(())
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\0', "").replace('\'', "''")
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Builds the filter predicate, applying the scope/language taxonomy special case
/// (spec §4.8.1 "Filter rewriting").
fn build_predicate(filters: &BTreeMap<String, String>, taxonomy: &BTreeMap<String, TaxonomyDimension>) -> Option<String> {
    if filters.is_empty() {
        return None;
    }

    let scope_indexed = taxonomy.contains_key("scope");
    let language_indexed = taxonomy.contains_key("language");
    let language = filters.get("language");
    let scope_set = filters.contains_key("scope");

    if scope_indexed && language_indexed && language.is_some() && !scope_set {
        let lang = escape_literal(language.unwrap());
        let mut clause = format!(
            "((tax_scope = 'sdk-specific' AND tax_language = '{lang}') OR tax_scope = 'global-guide' OR \
             (tax_scope NOT IN ('sdk-specific', 'global-guide') AND (tax_language = '' OR tax_language = '{lang}')))"
        );
        let rest: Vec<String> = filters
            .iter()
            .filter(|(k, _)| k.as_str() != "language")
            .map(|(k, v)| format!("{} = '{}'", quote_ident(&taxonomy_column(k)), escape_literal(v)))
            .collect();
        if !rest.is_empty() {
            clause = format!("{clause} AND {}", rest.join(" AND "));
        }
        return Some(clause);
    }

    let clauses: Vec<String> = filters
        .iter()
        .map(|(k, v)| format!("{} = '{}'", quote_ident(&taxonomy_column(k)), escape_literal(v)))
        .collect();
    Some(clauses.join(" AND "))
}

fn taxonomy_column(key: &str) -> String {
    format!("tax_{key}")
}

fn decode_rows(batch: &arrow_array::RecordBatch) -> Vec<Row> {
    let col = |name: &str| -> Option<&StringArray> {
        let idx = batch.schema().index_of(name).ok()?;
        batch.column(idx).as_any().downcast_ref::<StringArray>()
    };
    let Some(chunk_ids) = col("chunk_id") else { return Vec::new() };
    let Some(filepaths) = col("filepath") else { return Vec::new() };
    let Some(headings) = col("heading") else { return Vec::new() };
    let Some(breadcrumbs) = col("breadcrumb") else { return Vec::new() };
    let Some(content_texts) = col("content_text") else { return Vec::new() };
    let Some(metadata_jsons) = col("metadata_json") else { return Vec::new() };
    let chunk_index_idx = batch.schema().index_of("chunk_index").ok();

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let chunk_index = chunk_index_idx
            .and_then(|idx| {
                batch
                    .column(idx)
                    .as_any()
                    .downcast_ref::<arrow_array::UInt32Array>()
                    .map(|a| a.value(i) as usize)
            })
            .unwrap_or(0);
        let metadata: BTreeMap<String, String> =
            serde_json::from_str(metadata_jsons.value(i)).unwrap_or_default();
        out.push(Row {
            chunk_id: chunk_ids.value(i).to_string(),
            filepath: filepaths.value(i).to_string(),
            heading: headings.value(i).to_string(),
            breadcrumb: breadcrumbs.value(i).to_string(),
            content_text: content_texts.value(i).to_string(),
            chunk_index,
            metadata,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_chunk_id_rejects_whitespace() {
        assert!(validate_chunk_id("a.md #heading").is_err());
    }

    #[test]
    fn validate_chunk_id_accepts_one_fragment() {
        assert!(validate_chunk_id("a.md#heading").is_ok());
    }

    #[test]
    fn validate_chunk_id_rejects_two_fragments() {
        assert!(validate_chunk_id("a.md#one#two").is_err());
    }

    #[test]
    fn predicate_applies_scope_language_special_case() {
        let mut taxonomy = BTreeMap::new();
        taxonomy.insert("scope".to_string(), TaxonomyDimension::default());
        taxonomy.insert("language".to_string(), TaxonomyDimension::default());
        let mut filters = BTreeMap::new();
        filters.insert("language".to_string(), "python".to_string());
        let predicate = build_predicate(&filters, &taxonomy).unwrap();
        assert!(predicate.contains("sdk-specific"));
        assert!(predicate.contains("global-guide"));
    }

    #[test]
    fn predicate_is_plain_equality_without_special_case() {
        let taxonomy = BTreeMap::new();
        let mut filters = BTreeMap::new();
        filters.insert("language".to_string(), "python".to_string());
        let predicate = build_predicate(&filters, &taxonomy).unwrap();
        assert_eq!(predicate, "`tax_language` = 'python'");
    }
}
