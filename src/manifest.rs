//! Manifest resolution (spec §4.1): merges defaults, manifest root strategy/metadata,
//! matching overrides, an HTML chunking hint, and frontmatter into one `ResolvedConfig`.

use glob::Pattern;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::config::{ChunkBy, ChunkingStrategy};
use crate::errors::{DocsError, Result};
use crate::types::{Manifest, ResolvedConfig, TaxonomyDimension};

fn hint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<!--\s*mcp_chunking_hint:\s*(\{.*?\})\s*-->").expect("valid hint regex")
    })
}

/// A manifest located alongside its matched files, plus the directory overrides are
/// relative to.
pub struct NearestManifest<'a> {
    pub manifest: &'a Manifest,
    pub base_dir: &'a Path,
}

/// Resolve the effective chunking strategy and metadata for one file (spec §4.1 a–e).
pub fn resolve_config(
    relative_file_path: &Path,
    markdown: &str,
    nearest_manifest: Option<NearestManifest<'_>>,
    defaults: &ChunkingStrategy,
) -> Result<ResolvedConfig> {
    let mut strategy = defaults.clone();
    let mut metadata: BTreeMap<String, String> = BTreeMap::new();

    if let Some(nm) = &nearest_manifest {
        if let Some(s) = &nm.manifest.strategy {
            strategy = s.clone();
        }
        for (k, v) in &nm.manifest.metadata {
            metadata.insert(k.clone(), v.clone());
        }

        let rel = relative_to(relative_file_path, nm.base_dir);
        for rule in &nm.manifest.overrides {
            let pattern = Pattern::new(&rule.pattern).map_err(|e| DocsError::Config {
                field: format!("overrides[pattern={}]", rule.pattern),
                message: e.to_string(),
            })?;
            if pattern.matches_path(&rel) {
                for (k, v) in &rule.metadata {
                    metadata.insert(k.clone(), v.clone());
                }
                if let Some(s) = &rule.strategy {
                    strategy = s.clone();
                }
            }
        }
    }

    if let Some(chunk_by) = parse_html_hint(markdown) {
        strategy.chunk_by = chunk_by;
    }

    if let Some(front) = parse_frontmatter(markdown)? {
        if let Some(chunk_by) = front.chunk_by {
            strategy.chunk_by = chunk_by;
        }
        for (k, v) in front.metadata {
            metadata.insert(k, v);
        }
    }

    strategy
        .validate()
        .map_err(|message| DocsError::Config {
            field: relative_file_path.display().to_string(),
            message,
        })?;

    Ok(ResolvedConfig { strategy, metadata })
}

fn relative_to(path: &Path, base: &Path) -> std::path::PathBuf {
    path.strip_prefix(base).unwrap_or(path).to_path_buf()
}

/// Malformed hints are silently ignored per spec §4.1.
fn parse_html_hint(markdown: &str) -> Option<ChunkBy> {
    let caps = hint_re().captures(markdown)?;
    let json = caps.get(1)?.as_str();
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let chunk_by = value.get("chunk_by")?.as_str()?;
    serde_json::from_value(serde_json::Value::String(chunk_by.to_string())).ok()
}

struct FrontmatterOverride {
    chunk_by: Option<ChunkBy>,
    metadata: BTreeMap<String, String>,
}

/// Parses `---\n...yaml-ish-json...\n---` frontmatter. We only recognize JSON-object
/// frontmatter (`mcp_strategy`/`mcp_chunking_hint`/`metadata`/`mcp_metadata` keys);
/// anything else present is left untouched. Malformed frontmatter is a fatal error.
fn parse_frontmatter(markdown: &str) -> Result<Option<FrontmatterOverride>> {
    let Some(body) = markdown.strip_prefix("---\n") else {
        return Ok(None);
    };
    let Some(end) = body.find("\n---") else {
        return Ok(None);
    };
    let raw = &body[..end];

    let value: serde_json::Value = serde_json_like_yaml(raw).ok_or_else(|| DocsError::Config {
        field: "frontmatter".to_string(),
        message: "malformed frontmatter block".to_string(),
    })?;

    let mut chunk_by = None;
    if let Some(hint) = value.get("mcp_chunking_hint").or_else(|| value.get("mcp_strategy")) {
        let raw_chunk_by = if hint.is_object() {
            hint.get("chunk_by").and_then(|v| v.as_str())
        } else {
            hint.as_str()
        };
        if let Some(s) = raw_chunk_by {
            chunk_by = Some(
                serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(
                    |_| DocsError::Config {
                        field: "frontmatter.mcp_chunking_hint".to_string(),
                        message: format!("unknown chunk_by value '{s}'"),
                    },
                )?,
            );
        }
    }

    let mut metadata = BTreeMap::new();
    for key in ["metadata", "mcp_metadata"] {
        if let Some(obj) = value.get(key).and_then(|v| v.as_object()) {
            for (k, v) in obj {
                if let Some(s) = v.as_str() {
                    metadata.insert(k.clone(), s.to_string());
                } else {
                    return Err(DocsError::Config {
                        field: format!("frontmatter.{key}.{k}"),
                        message: "metadata values must be strings".to_string(),
                    });
                }
            }
        }
    }

    Ok(Some(FrontmatterOverride { chunk_by, metadata }))
}

/// Frontmatter in these corpora is authored as a minimal YAML/JSON hybrid. We only
/// need `key: value` lines and inline JSON objects, so a tiny line-based parser into
/// a `serde_json::Value` map is enough; full YAML is out of scope.
fn serde_json_like_yaml(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed).ok();
    }
    let mut map = serde_json::Map::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':')?;
        let key = key.trim().to_string();
        let value = value.trim();
        let parsed = serde_json::from_str::<serde_json::Value>(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.trim_matches('"').to_string()));
        map.insert(key, parsed);
    }
    Some(serde_json::Value::Object(map))
}

/// Union taxonomy blocks across every manifest seen during a build (spec §4.1 taxonomy merge).
/// `vector_collapse` and `properties[value].mcp_resource` are sticky: once true, always true.
pub fn merge_taxonomy(
    accum: &mut BTreeMap<String, TaxonomyDimension>,
    incoming: &BTreeMap<String, TaxonomyDimension>,
) {
    for (key, dim) in incoming {
        let entry = accum.entry(key.clone()).or_insert_with(|| TaxonomyDimension {
            vector_collapse: false,
            properties: BTreeMap::new(),
            description: None,
        });
        entry.vector_collapse = entry.vector_collapse || dim.vector_collapse;
        if entry.description.is_none() {
            entry.description = dim.description.clone();
        }
        for (value, prop) in &dim.properties {
            let existing = entry.properties.entry(value.clone()).or_default();
            existing.mcp_resource = existing.mcp_resource || prop.mcp_resource;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManifestOverride;
    use std::path::PathBuf;

    #[test]
    fn defaults_apply_with_no_manifest() {
        let defaults = ChunkingStrategy::default();
        let resolved = resolve_config(
            Path::new("guide.md"),
            "# Title\nbody",
            None,
            &defaults,
        )
        .unwrap();
        assert_eq!(resolved.strategy.chunk_by, ChunkBy::H2);
        assert!(resolved.metadata.is_empty());
    }

    #[test]
    fn override_glob_wins_metadata_keys() {
        let mut manifest = Manifest::default();
        manifest.metadata.insert("team".to_string(), "docs".to_string());
        manifest.overrides.push(ManifestOverride {
            pattern: "api/**".to_string(),
            strategy: None,
            metadata: {
                let mut m = BTreeMap::new();
                m.insert("team".to_string(), "api-team".to_string());
                m
            },
        });
        let base = PathBuf::from("docs");
        let nm = NearestManifest {
            manifest: &manifest,
            base_dir: &base,
        };
        let defaults = ChunkingStrategy::default();
        let resolved = resolve_config(
            Path::new("docs/api/auth.md"),
            "# Auth",
            Some(nm),
            &defaults,
        )
        .unwrap();
        assert_eq!(resolved.metadata.get("team"), Some(&"api-team".to_string()));
    }

    #[test]
    fn html_hint_overrides_chunk_by() {
        let defaults = ChunkingStrategy::default();
        let markdown = "<!-- mcp_chunking_hint: {\"chunk_by\":\"h3\"} -->\n# Title\n";
        let resolved = resolve_config(Path::new("a.md"), markdown, None, &defaults).unwrap();
        assert_eq!(resolved.strategy.chunk_by, ChunkBy::H3);
    }

    #[test]
    fn malformed_html_hint_is_ignored() {
        let defaults = ChunkingStrategy::default();
        let markdown = "<!-- mcp_chunking_hint: {not json} -->\n# Title\n";
        let resolved = resolve_config(Path::new("a.md"), markdown, None, &defaults).unwrap();
        assert_eq!(resolved.strategy.chunk_by, ChunkBy::H2);
    }

    #[test]
    fn taxonomy_merge_is_sticky_true() {
        let mut accum = BTreeMap::new();
        let mut first = BTreeMap::new();
        first.insert(
            "scope".to_string(),
            TaxonomyDimension {
                vector_collapse: false,
                properties: BTreeMap::new(),
                description: Some("scope dimension".to_string()),
            },
        );
        merge_taxonomy(&mut accum, &first);

        let mut second = BTreeMap::new();
        second.insert(
            "scope".to_string(),
            TaxonomyDimension {
                vector_collapse: true,
                properties: BTreeMap::new(),
                description: None,
            },
        );
        merge_taxonomy(&mut accum, &second);

        assert!(accum["scope"].vector_collapse, "sticky true must persist");
        assert_eq!(accum["scope"].description.as_deref(), Some("scope dimension"));
    }
}
