use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

use tempfile::TempDir;

fn write_fixture_corpus(docs_dir: &std::path::Path) {
    std::fs::create_dir_all(docs_dir.join("guides")).unwrap();
    std::fs::write(
        docs_dir.join("guides/retries.md"),
        "# Retry policy\n\n## Exponential backoff\n\nClients should retry transient errors with exponential backoff and jitter.\n\n## Circuit breaking\n\nAfter repeated failures, stop retrying and surface the error.\n",
    )
    .unwrap();
    std::fs::write(
        docs_dir.join("guides/auth.md"),
        "# Authentication\n\n## API keys\n\nPass the API key in the Authorization header.\n",
    )
    .unwrap();
}

#[test]
fn build_then_serve_search_docs_and_get_doc() {
    let bin = env!("CARGO_BIN_EXE_docs-mcp-search");
    let workdir = TempDir::new().expect("tempdir");
    let docs_dir = workdir.path().join("docs");
    let out_dir = workdir.path().join("out");
    write_fixture_corpus(&docs_dir);

    let build_status = Command::new(bin)
        .arg("build")
        .arg("--docs-dir")
        .arg(&docs_dir)
        .arg("--out")
        .arg(&out_dir)
        .arg("--embedding-provider")
        .arg("hash")
        .status()
        .expect("spawn build");
    assert!(build_status.success(), "build subcommand should succeed");
    assert!(out_dir.join("metadata.json").exists());
    assert!(out_dir.join("chunks.json").exists());

    let mut child = Command::new(bin)
        .arg("mcp")
        .arg("--out-dir")
        .arg(&out_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn docs-mcp-search mcp");

    {
        let stdin = child.stdin.as_mut().expect("child stdin");
        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": { "protocolVersion": "2024-11-05" }
            })
        )
        .unwrap();
        writeln!(
            stdin,
            "{}",
            serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" })
        )
        .unwrap();
        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {
                    "name": "search_docs",
                    "arguments": { "query": "exponential backoff", "limit": 5 }
                }
            })
        )
        .unwrap();
    }
    drop(child.stdin.take());

    let stdout = child.stdout.take().expect("child stdout");
    let reader = BufReader::new(stdout);
    let mut replies_by_id: HashMap<i64, serde_json::Value> = HashMap::new();

    for line in reader.lines() {
        let line = line.expect("read stdout line");
        if line.trim().is_empty() {
            continue;
        }
        let v: serde_json::Value = serde_json::from_str(&line).expect("stdout is json");
        if let Some(id) = v.get("id").and_then(|x| x.as_i64()) {
            replies_by_id.insert(id, v);
        }
        if replies_by_id.len() >= 3 {
            break;
        }
    }
    let status = child.wait().expect("wait child");
    assert!(status.success(), "mcp process should exit cleanly");

    let tools_list = replies_by_id.get(&2).expect("tools/list reply");
    let names: Vec<&str> = tools_list
        .get("result")
        .and_then(|r| r.get("tools"))
        .and_then(|t| t.as_array())
        .expect("tools array")
        .iter()
        .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
        .collect();
    assert!(names.contains(&"search_docs"));
    assert!(names.contains(&"get_doc"));

    let search_reply = replies_by_id.get(&3).expect("search_docs reply");
    let result = search_reply.get("result").expect("tools/call result");
    assert_eq!(result.get("isError").and_then(|x| x.as_bool()), Some(false));
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|x| x.get("text"))
        .and_then(|x| x.as_str())
        .expect("search_docs text");
    assert!(text.contains("chunk_id"), "search_docs should return hits with chunk_id");
}
