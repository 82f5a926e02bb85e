use std::process::Command;

use tempfile::TempDir;

fn write_fixture_corpus(docs_dir: &std::path::Path) {
    std::fs::create_dir_all(docs_dir).unwrap();
    std::fs::write(
        docs_dir.join("overview.md"),
        "# Overview\n\n## Installation\n\nRun the installer and accept the defaults.\n\n## Configuration\n\nEdit the config file to set your API key.\n",
    )
    .unwrap();
}

#[test]
fn rebuild_with_unchanged_corpus_is_fully_cache_hit_and_byte_identical() {
    let bin = env!("CARGO_BIN_EXE_docs-mcp-search");
    let workdir = TempDir::new().expect("tempdir");
    let docs_dir = workdir.path().join("docs");
    let out_dir = workdir.path().join("out");
    write_fixture_corpus(&docs_dir);

    for _ in 0..2 {
        let status = Command::new(bin)
            .arg("build")
            .arg("--docs-dir")
            .arg(&docs_dir)
            .arg("--out")
            .arg(&out_dir)
            .arg("--embedding-provider")
            .arg("hash")
            .status()
            .expect("spawn build");
        assert!(status.success());
    }

    let chunks_json = std::fs::read_to_string(out_dir.join("chunks.json")).unwrap();
    let chunks: serde_json::Value = serde_json::from_str(&chunks_json).unwrap();
    let chunk_array = chunks.as_array().expect("chunks.json is a JSON array");
    assert_eq!(chunk_array.len(), 2, "Installation and Configuration sections each become one chunk");
}
