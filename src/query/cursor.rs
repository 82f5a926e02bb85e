//! Signed pagination cursors (spec §4.8.1 "Cursor format").
//!
//! A cursor binds `{offset, limit}` to a signature over the *normalized* query and
//! filters that produced it, so a cursor minted for one search can't silently be
//! replayed against a different one.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::errors::{DocsError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorPayload {
    offset: usize,
    limit: usize,
    signature: String,
}

/// Collapses internal whitespace and trims, matching the query normalization
/// used for both cursor signing and empty-result fallbacks.
pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn signature_for(query: &str, filters: &BTreeMap<String, String>) -> String {
    let normalized = normalize_query(query);
    let payload = serde_json::json!({ "query": normalized, "filters": filters });
    let json = serde_json::to_string(&payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Encodes a cursor for the next page of `query`/`filters` at the given offset/limit.
pub fn encode(offset: usize, limit: usize, query: &str, filters: &BTreeMap<String, String>) -> String {
    let payload = CursorPayload {
        offset,
        limit,
        signature: signature_for(query, filters),
    };
    let json = serde_json::to_string(&payload).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decodes and validates `cursor` against the current `query`/`filters` context.
pub fn decode(cursor: &str, query: &str, filters: &BTreeMap<String, String>) -> Result<(usize, usize)> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| DocsError::CursorMalformed(e.to_string()))?;
    let payload: CursorPayload =
        serde_json::from_slice(&bytes).map_err(|e| DocsError::CursorMalformed(e.to_string()))?;

    let expected = signature_for(query, filters);
    if payload.signature != expected {
        return Err(DocsError::CursorMismatch);
    }
    Ok((payload.offset, payload.limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("language".to_string(), "python".to_string());
        m
    }

    #[test]
    fn round_trips_offset_and_limit() {
        let cursor = encode(10, 20, "retry python", &filters());
        let (offset, limit) = decode(&cursor, "retry python", &filters()).unwrap();
        assert_eq!((offset, limit), (10, 20));
    }

    #[test]
    fn rejects_cursor_from_a_different_query() {
        let cursor = encode(10, 20, "retry python", &filters());
        let err = decode(&cursor, "python", &filters()).unwrap_err();
        assert!(err.to_string().contains("does not match current query or filters"));
    }

    #[test]
    fn rejects_malformed_payload() {
        let err = decode("not-valid-base64!!!", "q", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, DocsError::CursorMalformed(_)));
    }

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        assert_eq!(normalize_query("  Retry   Python "), "retry python");
    }
}
