// NOTE: LanceDB Rust APIs have shifted across minor versions; this module is
// written against the workspace's resolved `lancedb` crate, following the same
// connect/create_table/add shape used by the codebase-embedding index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use arrow_schema::{DataType, Field, Schema};
use lancedb::index::Index;

use crate::errors::{DocsError, Result};
use crate::types::Chunk;

pub struct BuildIndexRequest<'a> {
    pub db_path: &'a Path,
    pub chunks: &'a [Chunk],
    pub metadata_keys: &'a [String],
    pub vectors_by_chunk_id: Option<&'a BTreeMap<String, Vec<f32>>>,
    pub file_fingerprints: Option<&'a BTreeMap<String, String>>,
}

fn schema_for(metadata_keys: &[String], vector_dim: Option<usize>) -> Arc<Schema> {
    let mut fields = vec![
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new("filepath", DataType::Utf8, false),
        Field::new("heading", DataType::Utf8, false),
        Field::new("heading_level", DataType::UInt32, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("content_text", DataType::Utf8, false),
        Field::new("breadcrumb", DataType::Utf8, false),
        Field::new("chunk_index", DataType::UInt32, false),
        Field::new("metadata_json", DataType::Utf8, false),
        Field::new("file_fingerprint", DataType::Utf8, true),
    ];
    for key in metadata_keys {
        fields.push(Field::new(taxonomy_column_name(key), DataType::Utf8, false));
    }
    if let Some(dim) = vector_dim {
        fields.push(Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, false)), dim as i32),
            true,
        ));
    }
    Arc::new(Schema::new(fields))
}

/// Taxonomy keys are user-controlled; prefix to avoid clashing with base columns.
fn taxonomy_column_name(key: &str) -> String {
    format!("tax_{key}")
}

fn build_record_batch(
    chunks: &[Chunk],
    metadata_keys: &[String],
    vectors_by_chunk_id: Option<&BTreeMap<String, Vec<f32>>>,
    file_fingerprints: Option<&BTreeMap<String, String>>,
) -> Result<(RecordBatch, Arc<Schema>)> {
    let vector_dim = vectors_by_chunk_id.and_then(|v| v.values().next()).map(|v| v.len());
    let schema = schema_for(metadata_keys, vector_dim);

    let chunk_ids: ArrayRef = Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.chunk_id.as_str())));
    let filepaths: ArrayRef = Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.filepath.as_str())));
    let headings: ArrayRef = Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.heading.as_str())));
    let heading_levels: ArrayRef = Arc::new(UInt32Array::from_iter_values(chunks.iter().map(|c| c.heading_level as u32)));
    let contents: ArrayRef = Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.content.as_str())));
    let content_texts: ArrayRef = Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.content_text.as_str())));
    let breadcrumbs: ArrayRef = Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| c.breadcrumb.as_str())));
    let chunk_indexes: ArrayRef = Arc::new(UInt32Array::from_iter_values(chunks.iter().map(|c| c.chunk_index as u32)));
    let metadata_jsons: ArrayRef = Arc::new(StringArray::from_iter_values(
        chunks
            .iter()
            .map(|c| serde_json::to_string(&c.metadata).unwrap_or_default()),
    ));
    let file_fps: ArrayRef = Arc::new(StringArray::from(
        chunks
            .iter()
            .map(|c| file_fingerprints.and_then(|m| m.get(&c.filepath)).cloned())
            .collect::<Vec<Option<String>>>(),
    ));

    let mut columns: Vec<ArrayRef> = vec![
        chunk_ids,
        filepaths,
        headings,
        heading_levels,
        contents,
        content_texts,
        breadcrumbs,
        chunk_indexes,
        metadata_jsons,
        file_fps,
    ];

    for key in metadata_keys {
        let col: ArrayRef = Arc::new(StringArray::from_iter_values(
            chunks.iter().map(|c| c.metadata.get(key).cloned().unwrap_or_default()),
        ));
        columns.push(col);
    }

    if let Some(dim) = vector_dim {
        let mut flat: Vec<f32> = Vec::with_capacity(chunks.len() * dim);
        for c in chunks {
            let v = vectors_by_chunk_id
                .and_then(|m| m.get(&c.chunk_id))
                .cloned()
                .unwrap_or_else(|| vec![0.0; dim]);
            flat.extend_from_slice(&v);
        }
        let values: ArrayRef = Arc::new(Float32Array::from(flat));
        let item_field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_arr: ArrayRef = Arc::new(
            FixedSizeListArray::try_new(item_field, dim as i32, values, None)
                .map_err(|e| DocsError::IndexBuild {
                    stage: "row materialization".to_string(),
                    message: e.to_string(),
                })?,
        );
        columns.push(vector_arr);
    }

    let batch = RecordBatch::try_new(schema.clone(), columns).map_err(|e| DocsError::IndexBuild {
        stage: "row materialization".to_string(),
        message: e.to_string(),
    })?;
    Ok((batch, schema))
}

fn tmp_path(db_path: &Path) -> PathBuf {
    let mut p = db_path.as_os_str().to_os_string();
    p.push(".tmp");
    PathBuf::from(p)
}
fn old_path(db_path: &Path) -> PathBuf {
    let mut p = db_path.as_os_str().to_os_string();
    p.push(".old");
    PathBuf::from(p)
}

/// Builds a fresh table at `db_path.tmp` and publishes it atomically (spec §4.7).
pub async fn build_index(req: BuildIndexRequest<'_>, mut on_progress: impl FnMut(&str)) -> Result<()> {
    let tmp = tmp_path(req.db_path);
    let old = old_path(req.db_path);
    let _ = std::fs::remove_dir_all(&tmp);
    let _ = std::fs::remove_dir_all(&old);

    on_progress("connect");
    let db = lancedb::connect(tmp.to_string_lossy().as_ref())
        .execute()
        .await
        .map_err(|e| DocsError::IndexBuild {
            stage: "connect".to_string(),
            message: e.to_string(),
        })?;

    on_progress("write rows");
    let (batch, schema) = build_record_batch(
        req.chunks,
        req.metadata_keys,
        req.vectors_by_chunk_id,
        req.file_fingerprints,
    )?;
    let reader = RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema);
    let table = db
        .create_table("chunks", Box::new(reader))
        .execute()
        .await
        .map_err(|e| DocsError::IndexBuild {
            stage: "table write".to_string(),
            message: e.to_string(),
        })?;

    on_progress("full-text index");
    if let Err(e) = table
        .create_index(&["content_text", "heading"], Index::FTS(Default::default()))
        .execute()
        .await
    {
        return Err(DocsError::IndexBuild {
            stage: "full-text index".to_string(),
            message: e.to_string(),
        });
    }

    on_progress("scalar indexes");
    for column in ["chunk_id", "filepath", "chunk_index"] {
        if let Err(e) = table
            .create_index(&[column], Index::BTree(Default::default()))
            .execute()
            .await
        {
            eprintln!("[docs-mcp-search] WARN: scalar index on '{column}' failed (non-fatal): {e}");
        }
    }

    let vectors_present = req
        .vectors_by_chunk_id
        .map(|m| m.values().filter(|v| !v.is_empty()).count())
        .unwrap_or(0);
    if vectors_present >= 256 {
        on_progress("vector index");
        let num_partitions = (vectors_present as f64).sqrt().round().max(1.0) as u32;
        let ivf_pq = lancedb::index::vector::IvfPqIndexBuilder::default().num_partitions(num_partitions);
        if let Err(e) = table.create_index(&["vector"], Index::IvfPq(ivf_pq)).execute().await {
            eprintln!("[docs-mcp-search] WARN: IVF-PQ vector index failed (non-fatal, brute-force search remains correct): {e}");
        }
    }

    drop(table);
    drop(db);

    on_progress("publish");
    if req.db_path.exists() {
        std::fs::rename(req.db_path, &old).map_err(|e| DocsError::IndexBuild {
            stage: "publish".to_string(),
            message: e.to_string(),
        })?;
    }
    std::fs::rename(&tmp, req.db_path).map_err(|e| DocsError::IndexBuild {
        stage: "publish".to_string(),
        message: e.to_string(),
    })?;
    let _ = std::fs::remove_dir_all(&old);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn schema_includes_flattened_taxonomy_columns() {
        let keys = vec!["language".to_string(), "scope".to_string()];
        let schema = schema_for(&keys, Some(4));
        assert!(schema.field_with_name("tax_language").is_ok());
        assert!(schema.field_with_name("tax_scope").is_ok());
        assert!(schema.field_with_name("vector").is_ok());
    }

    #[test]
    fn record_batch_row_count_matches_chunks() {
        let chunks = vec![Chunk {
            chunk_id: "a.md#x".to_string(),
            filepath: "a.md".to_string(),
            heading: "X".to_string(),
            heading_level: 2,
            content: "## X\nbody".to_string(),
            content_text: "body".to_string(),
            breadcrumb: "a.md \u{25b8} X".to_string(),
            chunk_index: 0,
            metadata: BTreeMap::new(),
        }];
        let (batch, _schema) = build_record_batch(&chunks, &[], None, None).unwrap();
        assert_eq!(batch.num_rows(), 1);
    }
}
