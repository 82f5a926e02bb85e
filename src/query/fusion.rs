//! Reciprocal rank fusion and variant-axis deduplication (spec §4.8.1 "Fusion",
//! "Deduplication (variant collapse)").

use std::collections::{BTreeMap, HashMap};

use crate::types::TaxonomyDimension;

const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy)]
pub struct RrfWeights {
    pub w_match: f64,
    pub w_phrase: f64,
    pub w_vector: f64,
}

impl Default for RrfWeights {
    fn default() -> Self {
        Self {
            w_match: 1.0,
            w_phrase: 1.25,
            w_vector: 1.0,
        }
    }
}

/// `score = Σᵢ wᵢ / (60 + rankᵢ)`, treating an absent rank as contributing 0.
/// Sorted by score descending, ties broken lexicographically by `chunk_id`,
/// scores rounded to six decimal places.
pub fn fuse(
    match_ranks: &[String],
    phrase_ranks: &[String],
    vector_ranks: &[String],
    weights: RrfWeights,
) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();

    let mut contribute = |ranks: &[String], weight: f64| {
        for (rank, chunk_id) in ranks.iter().enumerate() {
            let entry = scores.entry(chunk_id.clone()).or_insert(0.0);
            *entry += weight / (RRF_K + rank as f64);
        }
    };
    contribute(match_ranks, weights.w_match);
    contribute(phrase_ranks, weights.w_phrase);
    contribute(vector_ranks, weights.w_vector);

    let mut out: Vec<(String, f64)> = scores
        .into_iter()
        .map(|(id, score)| (id, (score * 1_000_000.0).round() / 1_000_000.0))
        .collect();
    out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
    out
}

/// A minimal view of a fused hit needed to compute its variant-collapse key.
pub struct CollapseCandidate<'a> {
    pub chunk_id: &'a str,
    pub filepath: &'a str,
    pub heading: &'a str,
    pub metadata: &'a BTreeMap<String, String>,
}

fn part_number(chunk_id: &str) -> Option<u32> {
    chunk_id.rsplit_once("-part-").and_then(|(_, n)| n.parse().ok())
}

/// Returns the collapse key for `candidate`, or `None` if it's not collapsible
/// (spec §4.8.1 "Deduplication"): a chunk is collapsible only when *every*
/// taxonomy key flagged `vector_collapse=true` and not pinned by `filters`
/// has its metadata value present as a path segment in `filepath`. Rows
/// missing any one of the required values are left unique, not collapsed.
fn collapse_key(
    candidate: &CollapseCandidate<'_>,
    taxonomy: &BTreeMap<String, TaxonomyDimension>,
    filters: &BTreeMap<String, String>,
) -> Option<String> {
    let segments: Vec<&str> = candidate.filepath.split('/').collect();

    let mut applicable_keys: Vec<&str> = Vec::new();
    for (key, dim) in taxonomy {
        if dim.vector_collapse && !filters.contains_key(key.as_str()) {
            applicable_keys.push(key.as_str());
        }
    }
    if applicable_keys.is_empty() {
        return None;
    }

    let mut normalized_path = candidate.filepath.to_string();
    for key in &applicable_keys {
        let Some(value) = candidate.metadata.get(*key) else {
            return None;
        };
        if value.is_empty() || !segments.contains(&value.as_str()) {
            return None;
        }
        if let Some(pos) = normalized_path.find(value.as_str()) {
            normalized_path.replace_range(pos..pos + value.len(), "*");
        }
    }

    let mut key = format!("{normalized_path}:{}", candidate.heading);
    if let Some(part) = part_number(candidate.chunk_id) {
        key.push_str(&format!(":{part}"));
    }
    Some(key)
}

/// Deduplicates `ranked` (already sorted by score descending) keeping the
/// highest-scoring representative per collapse key; rows left unique pass through.
pub fn collapse_variants<'a>(
    ranked: &[(String, f64)],
    candidates: &HashMap<String, CollapseCandidate<'a>>,
    taxonomy: &BTreeMap<String, TaxonomyDimension>,
    filters: &BTreeMap<String, String>,
) -> Vec<(String, f64)> {
    let mut seen_keys: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(ranked.len());

    for (chunk_id, score) in ranked {
        let Some(candidate) = candidates.get(chunk_id) else {
            out.push((chunk_id.clone(), *score));
            continue;
        };
        match collapse_key(candidate, taxonomy, filters) {
            Some(key) => {
                if seen_keys.insert(key) {
                    out.push((chunk_id.clone(), *score));
                }
            }
            None => out.push((chunk_id.clone(), *score)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fusion_is_monotone_in_rank() {
        // A beats B in every list it appears in, and appears in strictly more.
        let match_ranks = vec!["a".to_string(), "b".to_string()];
        let phrase_ranks = vec!["a".to_string()];
        let vector_ranks: Vec<String> = vec![];
        let fused = fuse(&match_ranks, &phrase_ranks, &vector_ranks, RrfWeights::default());
        let score = |id: &str| fused.iter().find(|(c, _)| c == id).map(|(_, s)| *s).unwrap_or(0.0);
        assert!(score("a") >= score("b"));
    }

    #[test]
    fn ties_break_lexicographically() {
        let ranks = vec!["b".to_string(), "a".to_string()];
        let fused = fuse(&ranks, &[], &[], RrfWeights::default());
        // both get the same per-list score only if ranks equal, so test symmetric single-list case
        assert_eq!(fused[0].0, "b");
    }

    #[test]
    fn collapse_keeps_one_per_variant_when_unfiltered() {
        let mut taxonomy = BTreeMap::new();
        taxonomy.insert(
            "language".to_string(),
            TaxonomyDimension {
                vector_collapse: true,
                properties: BTreeMap::new(),
                description: None,
            },
        );

        let mut py_meta = BTreeMap::new();
        py_meta.insert("language".to_string(), "python".to_string());
        let mut ts_meta = BTreeMap::new();
        ts_meta.insert("language".to_string(), "typescript".to_string());

        let mut candidates = HashMap::new();
        candidates.insert(
            "a".to_string(),
            CollapseCandidate {
                chunk_id: "a",
                filepath: "sdk/python/readme.md",
                heading: "Installation",
                metadata: &py_meta,
            },
        );
        candidates.insert(
            "b".to_string(),
            CollapseCandidate {
                chunk_id: "b",
                filepath: "sdk/typescript/readme.md",
                heading: "Installation",
                metadata: &ts_meta,
            },
        );

        let ranked = vec![("a".to_string(), 1.0), ("b".to_string(), 0.9)];
        let filters = BTreeMap::new();
        let collapsed = collapse_variants(&ranked, &candidates, &taxonomy, &filters);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].0, "a");
    }

    #[test]
    fn collapse_disabled_when_axis_is_filtered() {
        let mut taxonomy = BTreeMap::new();
        taxonomy.insert(
            "language".to_string(),
            TaxonomyDimension {
                vector_collapse: true,
                properties: BTreeMap::new(),
                description: None,
            },
        );
        let mut py_meta = BTreeMap::new();
        py_meta.insert("language".to_string(), "python".to_string());
        let mut candidates = HashMap::new();
        candidates.insert(
            "a".to_string(),
            CollapseCandidate {
                chunk_id: "a",
                filepath: "sdk/python/readme.md",
                heading: "Installation",
                metadata: &py_meta,
            },
        );
        let ranked = vec![("a".to_string(), 1.0)];
        let mut filters = BTreeMap::new();
        filters.insert("language".to_string(), "python".to_string());
        let collapsed = collapse_variants(&ranked, &candidates, &taxonomy, &filters);
        assert_eq!(collapsed.len(), 1, "filtered axis leaves candidates unique, not dropped");
    }

    #[test]
    fn collapse_requires_every_applicable_axis_to_match_not_just_any() {
        let mut taxonomy = BTreeMap::new();
        taxonomy.insert(
            "language".to_string(),
            TaxonomyDimension {
                vector_collapse: true,
                properties: BTreeMap::new(),
                description: None,
            },
        );
        taxonomy.insert(
            "version".to_string(),
            TaxonomyDimension {
                vector_collapse: true,
                properties: BTreeMap::new(),
                description: None,
            },
        );

        // "a" encodes both axes in its filepath; "b" only encodes `language`, so it
        // must stay unique even though it satisfies one of the two collapsible axes.
        let mut a_meta = BTreeMap::new();
        a_meta.insert("language".to_string(), "python".to_string());
        a_meta.insert("version".to_string(), "v2".to_string());
        let mut b_meta = BTreeMap::new();
        b_meta.insert("language".to_string(), "python".to_string());
        b_meta.insert("version".to_string(), "v2".to_string());

        let mut candidates = HashMap::new();
        candidates.insert(
            "a".to_string(),
            CollapseCandidate {
                chunk_id: "a",
                filepath: "sdk/python/v2/readme.md",
                heading: "Installation",
                metadata: &a_meta,
            },
        );
        candidates.insert(
            "b".to_string(),
            CollapseCandidate {
                chunk_id: "b",
                filepath: "sdk/python/readme.md",
                heading: "Installation",
                metadata: &b_meta,
            },
        );

        let ranked = vec![("a".to_string(), 1.0), ("b".to_string(), 0.9)];
        let filters = BTreeMap::new();
        let collapsed = collapse_variants(&ranked, &candidates, &taxonomy, &filters);
        let ids: Vec<&str> = collapsed.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["a", "b"],
            "b is missing `version` in its filepath, so it must be left unique rather than collapsed with a"
        );
    }
}
