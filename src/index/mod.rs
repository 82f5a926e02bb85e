//! Tabular search index (spec §4.7): one LanceDB table ("chunks") carrying the
//! base chunk columns, flattened taxonomy columns, and an optional vector column,
//! with full-text, scalar, and IVF-PQ indexes layered on top.

pub mod builder;
pub mod previous;

pub use builder::{build_index, BuildIndexRequest};
pub use previous::{load_previous_index, PreviousIndex};
