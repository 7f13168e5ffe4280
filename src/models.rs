//! Core data models used throughout the retrieval pipeline.
//!
//! These types represent the raw documents, chunks, batches, and retrieval
//! hits that flow from ingestion to scoped query.

use serde_json::{Map, Value};

/// Raw text segment produced by the document loader before splitting.
///
/// Granularity depends on the source format: one per csv/xlsx row, one per
/// markdown/docx block element, one per pdf/txt file. Metadata always
/// carries at least a `source` provenance field.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl RawDocument {
    pub fn new(text: impl Into<String>, source: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), Value::String(source.to_string()));
        Self {
            text: text.into(),
            metadata,
        }
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// A bounded-length slice of one raw document, ready for embedding.
///
/// `chunk_index` is zero-based and contiguous per source file across the
/// whole split sequence, matching the ordinal stored in the relational row.
#[derive(Debug, Clone)]
pub struct SplitChunk {
    pub text: String,
    pub source: String,
    pub chunk_index: i64,
    pub metadata: Map<String, Value>,
}

impl SplitChunk {
    /// Serialized metadata blob persisted alongside the chunk row.
    pub fn metadata_json(&self) -> String {
        serde_json::to_string(&Value::Object(self.metadata.clone()))
            .unwrap_or_else(|_| "{}".to_string())
    }
}

/// Processing status of a knowledge upload batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed(String),
}

impl BatchStatus {
    pub fn as_str(&self) -> String {
        match self {
            BatchStatus::Processing => "processing".to_string(),
            BatchStatus::Completed => "completed".to_string(),
            BatchStatus::Failed(reason) => format!("failed: {}", reason),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => BatchStatus::Processing,
            "completed" => BatchStatus::Completed,
            other => BatchStatus::Failed(
                other
                    .strip_prefix("failed: ")
                    .unwrap_or(other)
                    .to_string(),
            ),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Processing)
    }
}

/// One public-knowledge ingestion operation, polled by status.
#[derive(Debug, Clone)]
pub struct KnowledgeBatch {
    pub id: String,
    pub original_filename: String,
    pub uploader: String,
    pub status: BatchStatus,
    pub created_at: i64,
    pub stored_file_id: Option<String>,
}

/// Raw upload bytes, persisted before any pipeline work and never mutated.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: String,
    pub original_filename: String,
    pub file_type: String,
    pub content: Vec<u8>,
    pub content_length: i64,
    pub uploader: String,
    pub session_id: Option<String>,
    pub created_at: i64,
}

/// Dual-store lifecycle state of a chunk row (two-phase protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorState {
    Pending,
    Committed,
}

impl VectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorState::Pending => "pending",
            VectorState::Committed => "committed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "committed" => VectorState::Committed,
            _ => VectorState::Pending,
        }
    }
}

/// A ranked chunk returned from a scoped query.
///
/// `score` is the cosine distance (ascending — smaller is more similar);
/// it is also merged into `metadata` as `retrieval_score`.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub metadata: Value,
    pub score: f64,
}

/// Outcome of a synchronous conversation-scope ingestion.
#[derive(Debug, Clone)]
pub struct SessionIngest {
    pub chunk_count: usize,
    pub ack_text: String,
    pub stored_file_id: String,
}

/// Repairs applied by a reconciliation sweep.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Vector records deleted because no chunk row references them.
    pub orphan_vectors_removed: usize,
    /// Chunk rows re-embedded and re-upserted because their vector was missing.
    pub chunks_reembedded: usize,
}

/// Keep metadata values inside the serializable scalar-or-container subset.
///
/// `serde_json::Value` already is that subset; nulls are dropped so they
/// never reach a store that cannot represent them.
pub fn sanitize_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    metadata
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Flatten metadata to scalars for the vector index: containers are
/// stringified, scalars pass through, nulls are dropped.
pub fn scalar_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, v) in metadata {
        match v {
            Value::Null => continue,
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                out.insert(k.clone(), v.clone());
            }
            Value::Array(_) | Value::Object(_) => {
                out.insert(k.clone(), Value::String(v.to_string()));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip() {
        for status in [
            BatchStatus::Processing,
            BatchStatus::Completed,
            BatchStatus::Failed("no chunks".to_string()),
        ] {
            assert_eq!(BatchStatus::parse(&status.as_str()), status);
        }
    }

    #[test]
    fn test_failed_status_carries_reason() {
        let status = BatchStatus::parse("failed: embedding error");
        assert_eq!(status, BatchStatus::Failed("embedding error".to_string()));
        assert!(status.is_terminal());
        assert!(!BatchStatus::Processing.is_terminal());
    }

    #[test]
    fn test_scalar_metadata_stringifies_containers() {
        let mut meta = Map::new();
        meta.insert("source".to_string(), json!("a.txt"));
        meta.insert("chunk_index".to_string(), json!(3));
        meta.insert("tags".to_string(), json!(["x", "y"]));
        meta.insert("missing".to_string(), Value::Null);

        let flat = scalar_metadata(&meta);
        assert_eq!(flat.get("source"), Some(&json!("a.txt")));
        assert_eq!(flat.get("chunk_index"), Some(&json!(3)));
        assert_eq!(flat.get("tags"), Some(&json!("[\"x\",\"y\"]")));
        assert!(!flat.contains_key("missing"));
    }

    #[test]
    fn test_sanitize_drops_nulls_only() {
        let mut meta = Map::new();
        meta.insert("keep".to_string(), json!({"nested": true}));
        meta.insert("drop".to_string(), Value::Null);
        let clean = sanitize_metadata(&meta);
        assert!(clean.contains_key("keep"));
        assert!(!clean.contains_key("drop"));
    }
}
