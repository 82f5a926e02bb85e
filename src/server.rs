//! MCP stdio server (spec §6 "External interfaces"): exposes `search_docs` and
//! `get_doc` as JSON-RPC tools over a published index, following the same
//! request/response shape the rest of this tool family uses.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::config::{build_embedding_settings_for_query, load_config};
use crate::embedding::build_provider;
use crate::errors::Result;
use crate::query::{GetDocRequest, QueryEngine, SearchRequest};
use crate::types::CorpusMetadata;

pub struct ServerState {
    engine: QueryEngine,
    corpus: CorpusMetadata,
}

impl ServerState {
    async fn open(out_dir: &Path) -> anyhow::Result<Self> {
        let metadata_path = out_dir.join("metadata.json");
        let corpus: CorpusMetadata = serde_json::from_str(
            &std::fs::read_to_string(&metadata_path)
                .map_err(|e| anyhow::anyhow!("reading {}: {e}", metadata_path.display()))?,
        )?;

        let query_embedder = match &corpus.embedding {
            Some(cfg) if cfg.provider != "none" => {
                let settings = build_embedding_settings_for_query(cfg);
                Some(build_provider(&settings)?)
            }
            _ => None,
        };

        let db_path = out_dir.join(&corpus.index.path);
        let engine = QueryEngine::open(&db_path, corpus.taxonomy_dimensions(), query_embedder).await?;
        Ok(Self { engine, corpus })
    }

    fn tool_list(&self, id: serde_json::Value) -> serde_json::Value {
        let search_description = self
            .corpus
            .tool_descriptions
            .as_ref()
            .and_then(|m| m.get("search_docs"))
            .cloned()
            .unwrap_or_else(|| {
                "Hybrid full-text/phrase/vector search over this documentation corpus.".to_string()
            });
        let get_doc_description = self
            .corpus
            .tool_descriptions
            .as_ref()
            .and_then(|m| m.get("get_doc"))
            .cloned()
            .unwrap_or_else(|| "Fetch the full rendered content of one or more chunks by chunk_id.".to_string());

        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [
                    {
                        "name": "search_docs",
                        "description": search_description,
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "query": { "type": "string" },
                                "limit": { "type": "integer", "default": 10 },
                                "cursor": { "type": "string" },
                                "filters": { "type": "object" },
                                "rrf_weights": {
                                    "type": "object",
                                    "properties": {
                                        "match": { "type": "number" },
                                        "phrase": { "type": "number" },
                                        "vector": { "type": "number" }
                                    }
                                },
                                "taxonomy_keys": { "type": "array", "items": { "type": "string" } }
                            },
                            "required": ["query"]
                        }
                    },
                    {
                        "name": "get_doc",
                        "description": get_doc_description,
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "chunk_id": { "type": "string" },
                                "context": { "type": "integer" }
                            },
                            "required": ["chunk_id"]
                        }
                    }
                ]
            }
        })
    }

    async fn tool_call(&self, id: serde_json::Value, params: &serde_json::Value) -> serde_json::Value {
        let ok = |text: String| {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{ "type": "text", "text": text }], "isError": false }
            })
        };
        let err = |message: String| {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{ "type": "text", "text": message }], "isError": true }
            })
        };

        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        match name {
            "search_docs" => {
                let request: SearchRequest = match serde_json::from_value(args) {
                    Ok(r) => r,
                    Err(e) => return err(format!("invalid search_docs arguments: {e}")),
                };
                match self.engine.search(request).await {
                    Ok(result) => match serde_json::to_string(&result) {
                        Ok(text) => ok(text),
                        Err(e) => err(format!("failed to serialize search result: {e}")),
                    },
                    Err(e) => err(e.to_string()),
                }
            }
            "get_doc" => {
                let request: GetDocRequest = match serde_json::from_value(args) {
                    Ok(r) => r,
                    Err(e) => return err(format!("invalid get_doc arguments: {e}")),
                };
                match self.engine.get_doc(request).await {
                    Ok(result) => ok(result.text),
                    Err(e) => err(e.to_string()),
                }
            }
            _ => err(format!("Tool not found: {name}")),
        }
    }
}

/// Resolves the index output directory: explicit `--out-dir` wins, else the
/// `out_dir` recorded in `.docs-mcp.config.json` under the current directory,
/// else the default `.docs-mcp-out`.
fn resolve_out_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(p) = explicit {
        return p;
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cfg = load_config(&cwd);
    cwd.join(cfg.out_dir)
}

pub fn run_stdio_server(out_dir: Option<PathBuf>) -> Result<()> {
    let out_dir = resolve_out_dir(out_dir);
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    let rt = tokio::runtime::Runtime::new().map_err(|e| {
        crate::errors::DocsError::IndexBuild {
            stage: "server startup".to_string(),
            message: e.to_string(),
        }
    })?;
    let state = rt
        .block_on(ServerState::open(&out_dir))
        .map_err(|e| crate::errors::DocsError::Query(format!("failed to open index at {}: {e}", out_dir.display())))?;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }

        let msg: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        // JSON-RPC notifications have no "id" field — don't respond.
        if msg.get("id").is_none() {
            continue;
        }

        let id = msg.get("id").cloned().unwrap_or(json!(null));
        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

        let reply = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": msg.get("params").and_then(|p| p.get("protocolVersion")).cloned().unwrap_or(json!("2024-11-05")),
                    "capabilities": { "tools": { "listChanged": true } },
                    "serverInfo": { "name": "docs-mcp-search", "version": env!("CARGO_PKG_VERSION") }
                }
            }),
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "tools/list" => state.tool_list(id),
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or(json!({}));
                rt.block_on(state.tool_call(id, &params))
            }
            "resources/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": [] } }),
            "prompts/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": [] } }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }),
        };

        writeln!(stdout, "{}", reply).map_err(|e| crate::errors::DocsError::Query(e.to_string()))?;
        stdout.flush().map_err(|e| crate::errors::DocsError::Query(e.to_string()))?;
    }

    Ok(())
}
