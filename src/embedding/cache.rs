//! Embedding cache persistence (spec §4.6): fingerprint-keyed vectors surviving
//! across builds, written with the `live`/`live.tmp`/`live.old` rotate-rename
//! pattern so a crash mid-save never corrupts the previous cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Bumped only on an incompatible on-disk layout change (major version).
const CACHE_VERSION_MAJOR: u32 = 1;

#[derive(Debug, Clone, Default)]
pub struct CacheEntries {
    pub entries: BTreeMap<String, Vec<f32>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    cache_version: u32,
    format_version: String,
    config_fingerprint: String,
}

fn live_dir(base_dir: &Path) -> PathBuf {
    base_dir.join("live")
}
fn tmp_dir(base_dir: &Path) -> PathBuf {
    base_dir.join("live.tmp")
}
fn old_dir(base_dir: &Path) -> PathBuf {
    base_dir.join("live.old")
}

/// Removes any stale `.tmp`/`.old` left by an interrupted `save` before a fresh
/// `load`/`save` cycle begins.
fn clean_stale(base_dir: &Path) {
    let _ = std::fs::remove_dir_all(tmp_dir(base_dir));
    let _ = std::fs::remove_dir_all(old_dir(base_dir));
}

/// Loads the cache if it is structurally valid and matches the current provider
/// config; otherwise logs a warning, deletes the cache directory, and returns
/// `None` (cold build).
pub fn load(base_dir: &Path, format_version: &str, config_fingerprint: &str) -> Option<CacheEntries> {
    clean_stale(base_dir);
    let live = live_dir(base_dir);
    if !live.exists() {
        return None;
    }

    let meta_path = live.join("cache-meta.json");
    let meta: CacheMeta = match std::fs::read_to_string(&meta_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
    {
        Some(m) => m,
        None => {
            eprintln!("[docs-mcp-search] WARN: embedding cache metadata missing or corrupt, discarding");
            let _ = std::fs::remove_dir_all(&live);
            return None;
        }
    };

    if meta.cache_version != CACHE_VERSION_MAJOR {
        eprintln!(
            "[docs-mcp-search] WARN: embedding cache version mismatch ({} != {}), discarding",
            meta.cache_version, CACHE_VERSION_MAJOR
        );
        let _ = std::fs::remove_dir_all(&live);
        return None;
    }
    if meta.format_version != format_version {
        eprintln!("[docs-mcp-search] WARN: embedding format_version changed, discarding cache");
        let _ = std::fs::remove_dir_all(&live);
        return None;
    }
    if meta.config_fingerprint != config_fingerprint {
        eprintln!("[docs-mcp-search] WARN: embedding provider config changed, discarding cache");
        let _ = std::fs::remove_dir_all(&live);
        return None;
    }

    let vectors_path = live.join("vectors.json");
    let entries: BTreeMap<String, Vec<f32>> = match std::fs::read_to_string(&vectors_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
    {
        Some(e) => e,
        None => {
            eprintln!("[docs-mcp-search] WARN: embedding cache vectors corrupt, discarding");
            let _ = std::fs::remove_dir_all(&live);
            return None;
        }
    };

    Some(CacheEntries { entries })
}

/// Atomically replaces `base_dir/live` with `entries` (spec §4.6 "Atomic write").
pub fn save(
    base_dir: &Path,
    entries: &CacheEntries,
    format_version: &str,
    config_fingerprint: &str,
) -> std::io::Result<()> {
    clean_stale(base_dir);
    std::fs::create_dir_all(base_dir)?;

    let tmp = tmp_dir(base_dir);
    std::fs::create_dir_all(&tmp)?;

    let meta = CacheMeta {
        cache_version: CACHE_VERSION_MAJOR,
        format_version: format_version.to_string(),
        config_fingerprint: config_fingerprint.to_string(),
    };
    std::fs::write(tmp.join("cache-meta.json"), serde_json::to_string_pretty(&meta)?)?;
    std::fs::write(tmp.join("vectors.json"), serde_json::to_string(&entries.entries)?)?;

    let live = live_dir(base_dir);
    let old = old_dir(base_dir);
    if live.exists() {
        std::fs::rename(&live, &old)?;
    }
    std::fs::rename(&tmp, &live)?;
    let _ = std::fs::remove_dir_all(&old);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut entries = CacheEntries::default();
        entries.entries.insert("fp1".to_string(), vec![0.1, 0.2, 0.3]);

        save(dir.path(), &entries, "1", "cfg-a").unwrap();
        let loaded = load(dir.path(), "1", "cfg-a").expect("cache should load");
        assert_eq!(loaded.entries.get("fp1"), Some(&vec![0.1, 0.2, 0.3]));
    }

    #[test]
    fn config_fingerprint_mismatch_discards_cache() {
        let dir = TempDir::new().unwrap();
        let entries = CacheEntries::default();
        save(dir.path(), &entries, "1", "cfg-a").unwrap();

        let loaded = load(dir.path(), "1", "cfg-b");
        assert!(loaded.is_none());
        assert!(!live_dir(dir.path()).exists(), "mismatched cache must be deleted");
    }

    #[test]
    fn stale_tmp_dir_is_cleaned_on_load() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp_dir(dir.path())).unwrap();
        assert!(load(dir.path(), "1", "cfg").is_none());
        assert!(!tmp_dir(dir.path()).exists());
    }
}
