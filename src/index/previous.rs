//! Previous-index chunk cache (spec §4.4): lets the pipeline reuse chunks verbatim
//! when a file's chunking fingerprint hasn't changed, instead of re-chunking and
//! re-embedding it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use arrow_array::{Array, StringArray, UInt32Array};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::errors::{DocsError, Result};
use crate::types::Chunk;

pub struct PreviousIndex {
    table: lancedb::Table,
    /// filepath -> chunking fingerprint, read from the `file_fingerprint` column.
    pub fingerprints: HashMap<String, String>,
}

/// Opens the previous `live` index for chunk reuse. Returns `None` when the index
/// doesn't exist yet, or when its schema predates the `file_fingerprint` column
/// (spec §4.4 "Returns nothing if the file_fingerprint column is absent").
pub async fn load_previous_index(db_path: &Path) -> Option<PreviousIndex> {
    if !db_path.exists() {
        return None;
    }
    let db = lancedb::connect(db_path.to_string_lossy().as_ref()).execute().await.ok()?;
    let table = db.open_table("chunks").execute().await.ok()?;

    let schema = table.schema().await.ok()?;
    if schema.field_with_name("file_fingerprint").is_err() {
        return None;
    }

    let mut fingerprints = HashMap::new();
    let mut stream = table
        .query()
        .select(lancedb::query::Select::columns(&["filepath", "file_fingerprint"]))
        .execute()
        .await
        .ok()?;

    while let Ok(Some(batch)) = stream.try_next().await {
        let Some(path_idx) = batch.schema().index_of("filepath").ok() else {
            continue;
        };
        let Some(fp_idx) = batch.schema().index_of("file_fingerprint").ok() else {
            continue;
        };
        let Some(paths) = batch.column(path_idx).as_any().downcast_ref::<StringArray>() else {
            continue;
        };
        let Some(fps) = batch.column(fp_idx).as_any().downcast_ref::<StringArray>() else {
            continue;
        };
        for i in 0..batch.num_rows() {
            if paths.is_valid(i) && fps.is_valid(i) {
                fingerprints.insert(paths.value(i).to_string(), fps.value(i).to_string());
            }
        }
    }

    Some(PreviousIndex { table, fingerprints })
}

impl PreviousIndex {
    /// Chunks previously stored for `filepath`, ordered by `chunk_index`.
    pub async fn get_chunks(&self, filepath: &str) -> Result<Vec<Chunk>> {
        let escaped = filepath.replace('\'', "''");
        let mut stream = self
            .table
            .query()
            .only_if(format!("filepath = '{escaped}'"))
            .execute()
            .await
            .map_err(|e| DocsError::IndexBuild {
                stage: "previous index read".to_string(),
                message: e.to_string(),
            })?;

        let mut rows: Vec<Chunk> = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(|e| DocsError::IndexBuild {
            stage: "previous index read".to_string(),
            message: e.to_string(),
        })? {
            rows.extend(decode_chunks(&batch)?);
        }
        rows.sort_by_key(|c| c.chunk_index);
        Ok(rows)
    }

    /// Closes the previous-index reader. Must happen before the new index swap
    /// (spec §5 "explicitly closed before the new index swap").
    pub fn close(self) {
        drop(self.table);
    }
}

fn decode_chunks(batch: &arrow_array::RecordBatch) -> Result<Vec<Chunk>> {
    let col = |name: &str| -> Result<&StringArray> {
        let idx = batch.schema().index_of(name).map_err(|e| DocsError::IndexBuild {
            stage: "previous index read".to_string(),
            message: format!("missing column '{name}': {e}"),
        })?;
        batch
            .column(idx)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| DocsError::IndexBuild {
                stage: "previous index read".to_string(),
                message: format!("column '{name}' has unexpected type"),
            })
    };

    let chunk_ids = col("chunk_id")?;
    let filepaths = col("filepath")?;
    let headings = col("heading")?;
    let contents = col("content")?;
    let content_texts = col("content_text")?;
    let breadcrumbs = col("breadcrumb")?;
    let metadata_jsons = col("metadata_json")?;

    let heading_level_idx = batch.schema().index_of("heading_level").ok();
    let chunk_index_idx = batch.schema().index_of("chunk_index").ok();

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let heading_level = heading_level_idx
            .and_then(|idx| batch.column(idx).as_any().downcast_ref::<UInt32Array>())
            .map(|a| a.value(i) as u8)
            .unwrap_or(0);
        let chunk_index = chunk_index_idx
            .and_then(|idx| batch.column(idx).as_any().downcast_ref::<UInt32Array>())
            .map(|a| a.value(i) as usize)
            .unwrap_or(0);
        let metadata: BTreeMap<String, String> =
            serde_json::from_str(metadata_jsons.value(i)).unwrap_or_default();

        out.push(Chunk {
            chunk_id: chunk_ids.value(i).to_string(),
            filepath: filepaths.value(i).to_string(),
            heading: headings.value(i).to_string(),
            heading_level,
            content: contents.value(i).to_string(),
            content_text: content_texts.value(i).to_string(),
            breadcrumb: breadcrumbs.value(i).to_string(),
            chunk_index,
            metadata,
        });
    }
    Ok(out)
}
