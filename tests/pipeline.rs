//! End-to-end pipeline tests: ingest → scoped query → delete, dual-store
//! consistency, and the maintenance sweeps, against a temporary SQLite
//! database with a deterministic fake embedder.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use ragstore::collab::{AckGenerator, ChatLog, NullAckGenerator, NullChatLog};
use ragstore::config::{
    ChunkingConfig, Config, DbConfig, EmbeddingConfig, IngestConfig, RetrievalConfig,
};
use ragstore::db;
use ragstore::embedding::{Embedder, EmbeddingError};
use ragstore::index::VectorIndex;
use ragstore::loader::FileKind;
use ragstore::models::BatchStatus;
use ragstore::scope::Scope;
use ragstore::service::RetrievalService;
use ragstore::store::KnowledgeStore;

// ============ Test doubles ============

/// Deterministic embedder: identical texts map to identical vectors, so a
/// query for ingested text ranks it first with distance ~0.
struct FakeEmbedder;

fn fake_vector(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    digest[..8].iter().map(|&b| b as f32 / 255.0 + 0.01).collect()
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake"
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| fake_vector(t)).collect())
    }
}

/// Returns one vector too few, violating the one-vector-per-text contract.
struct MismatchEmbedder;

#[async_trait]
impl Embedder for MismatchEmbedder {
    fn model_name(&self) -> &str {
        "mismatch"
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors: Vec<Vec<f32>> = texts.iter().map(|t| fake_vector(t)).collect();
        vectors.pop();
        Ok(vectors)
    }
}

struct EchoAcker;

#[async_trait]
impl AckGenerator for EchoAcker {
    async fn generate(&self, _scope_id: &str, _prompt: &str) -> Result<String> {
        Ok("Received your file, it is now part of this conversation.".to_string())
    }
}

#[derive(Default)]
struct RecordingChatLog {
    messages: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl ChatLog for RecordingChatLog {
    async fn save(&self, scope_id: &str, role: &str, text: &str) -> Result<()> {
        self.messages.lock().unwrap().push((
            scope_id.to_string(),
            role.to_string(),
            text.to_string(),
        ));
        Ok(())
    }
}

// ============ Harness ============

fn test_config(dir: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: dir.path().join("ragstore.sqlite"),
        },
        chunking: ChunkingConfig::default(),
        embedding: EmbeddingConfig::default(),
        retrieval: RetrievalConfig::default(),
        ingest: IngestConfig {
            workers: 2,
            queue_depth: 8,
            stalled_after_secs: 3600,
        },
    }
}

async fn open_service(dir: &TempDir) -> RetrievalService {
    RetrievalService::open(
        test_config(dir),
        Arc::new(FakeEmbedder),
        Arc::new(NullChatLog),
        Arc::new(NullAckGenerator),
    )
    .await
    .unwrap()
}

/// Direct handles onto the same database for assertions.
async fn open_backdoor(dir: &TempDir) -> (KnowledgeStore, VectorIndex, sqlx::SqlitePool) {
    let pool = db::connect(&test_config(dir)).await.unwrap();
    (
        KnowledgeStore::new(pool.clone()),
        VectorIndex::new(pool.clone()),
        pool,
    )
}

async fn wait_for_terminal(service: &RetrievalService, batch_id: &str) -> BatchStatus {
    for _ in 0..400 {
        if let Some(status) = service.batch_status(batch_id).await.unwrap() {
            if status.is_terminal() {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("batch {} never reached a terminal status", batch_id);
}

// ============ Ingestion & query round-trips ============

#[tokio::test]
async fn test_public_round_trip_ranks_ingested_chunk_first() {
    let dir = TempDir::new().unwrap();
    let service = open_service(&dir).await;

    let content = "the quick brown fox jumps over the lazy dog";
    let batch_id = service
        .ingest_public(content.as_bytes(), "fox.txt", FileKind::PlainText, "alice")
        .await
        .unwrap();

    assert_eq!(
        wait_for_terminal(&service, &batch_id).await,
        BatchStatus::Completed
    );

    let hits = service.query(content, &Scope::Public, Some(3)).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, content);
    assert!(hits[0].score < 1e-6, "identical text should be distance ~0");
    assert_eq!(
        hits[0].metadata.get("source").and_then(|v| v.as_str()),
        Some("fox.txt")
    );
    assert!(hits[0].metadata.get("retrieval_score").is_some());

    service.close().await;
}

#[tokio::test]
async fn test_scope_isolation_between_sessions_and_public() {
    let dir = TempDir::new().unwrap();
    let service = open_service(&dir).await;

    let content = "orbital mechanics notes for the mission";
    let result = service
        .ingest_session(content.as_bytes(), "notes.txt", FileKind::PlainText, "s1", "bob")
        .await
        .unwrap();
    assert_eq!(result.chunk_count, 1);

    // Visible in its own session scope.
    let own = service
        .query(content, &Scope::Session("s1".to_string()), None)
        .await;
    assert_eq!(own.len(), 1);

    // Invisible to another session and to the public scope.
    let other = service
        .query(content, &Scope::Session("s2".to_string()), None)
        .await;
    assert!(other.is_empty());
    let public = service.query(content, &Scope::Public, None).await;
    assert!(public.is_empty());

    service.close().await;
}

#[tokio::test]
async fn test_csv_end_to_end_contiguous_indices() {
    let dir = TempDir::new().unwrap();
    let service = open_service(&dir).await;
    let (store, _, _pool) = open_backdoor(&dir).await;

    let csv = "name,role\nada,engineer\ngrace,admiral\nalan,logician\n";
    let batch_id = service
        .ingest_public(csv.as_bytes(), "people.csv", FileKind::DelimitedText, "carol")
        .await
        .unwrap();

    assert_eq!(
        wait_for_terminal(&service, &batch_id).await,
        BatchStatus::Completed
    );

    let chunks = store.chunks_by_batch(&batch_id).await.unwrap();
    assert_eq!(chunks.len(), 3, "one chunk per csv data row");
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64);
        assert_eq!(chunk.source, "people.csv");
    }
    assert!(chunks[0].content.contains("name: ada"));

    service.close().await;
}

#[tokio::test]
async fn test_zero_chunk_file_fails_batch_without_rows() {
    let dir = TempDir::new().unwrap();
    let service = open_service(&dir).await;
    let (store, index, _pool) = open_backdoor(&dir).await;

    let batch_id = service
        .ingest_public(b"   \n ", "empty.txt", FileKind::PlainText, "dave")
        .await
        .unwrap();

    assert_eq!(
        wait_for_terminal(&service, &batch_id).await,
        BatchStatus::Failed("no chunks".to_string())
    );
    assert_eq!(store.count_chunks_by_batch(&batch_id).await.unwrap(), 0);
    assert_eq!(index.count().await.unwrap(), 0);

    // The raw upload is still kept.
    let batch = store.get_batch(&batch_id).await.unwrap().unwrap();
    let stored_file_id = batch.stored_file_id.unwrap();
    assert!(store.get_stored_file(&stored_file_id).await.unwrap().is_some());

    service.close().await;
}

// ============ Abort & compensation ============

#[tokio::test]
async fn test_embedding_count_mismatch_aborts_without_partial_commit() {
    let dir = TempDir::new().unwrap();
    let service = RetrievalService::open(
        test_config(&dir),
        Arc::new(MismatchEmbedder),
        Arc::new(NullChatLog),
        Arc::new(NullAckGenerator),
    )
    .await
    .unwrap();
    let (store, index, _pool) = open_backdoor(&dir).await;

    let content = "first line\n\nsecond line\n\nthird line";
    let err = service
        .ingest_session(content.as_bytes(), "doc.txt", FileKind::PlainText, "s1", "erin")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("session ingestion failed"));

    // No partial state in either store.
    assert_eq!(store.count_chunks_by_session("s1").await.unwrap(), 0);
    assert_eq!(index.count().await.unwrap(), 0);

    service.close().await;
}

// ============ Deletion ============

#[tokio::test]
async fn test_delete_batch_empties_both_stores() {
    let dir = TempDir::new().unwrap();
    let service = open_service(&dir).await;
    let (store, index, _pool) = open_backdoor(&dir).await;

    let csv = "city,country\noslo,norway\nlima,peru\n";
    let batch_id = service
        .ingest_public(csv.as_bytes(), "cities.csv", FileKind::DelimitedText, "frank")
        .await
        .unwrap();
    assert_eq!(
        wait_for_terminal(&service, &batch_id).await,
        BatchStatus::Completed
    );

    let chunk_ids = store.chunk_ids_by_batch(&batch_id).await.unwrap();
    assert_eq!(chunk_ids.len(), 2);

    let removed = service.delete_batch(&batch_id).await.unwrap();
    assert_eq!(removed, 2);

    assert_eq!(store.count_chunks_by_batch(&batch_id).await.unwrap(), 0);
    for id in &chunk_ids {
        assert!(!index.contains(id).await.unwrap());
    }
    assert!(store.get_batch(&batch_id).await.unwrap().is_none());

    service.close().await;
}

#[tokio::test]
async fn test_delete_scope_cascades_chunks_and_files() {
    let dir = TempDir::new().unwrap();
    let service = open_service(&dir).await;
    let (store, index, _pool) = open_backdoor(&dir).await;

    let content = "session private payload";
    service
        .ingest_session(content.as_bytes(), "payload.txt", FileKind::PlainText, "s7", "gina")
        .await
        .unwrap();
    assert_eq!(store.count_chunks_by_session("s7").await.unwrap(), 1);

    let removed = service.delete_scope("s7").await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.count_chunks_by_session("s7").await.unwrap(), 0);
    assert_eq!(index.count().await.unwrap(), 0);
    assert!(store
        .stored_file_ids_by_session("s7")
        .await
        .unwrap()
        .is_empty());

    service.close().await;
}

// ============ Idempotent upsert ============

#[tokio::test]
async fn test_reupsert_replaces_instead_of_duplicating() {
    let dir = TempDir::new().unwrap();
    // Schema comes from opening the service once.
    let service = open_service(&dir).await;
    let (_, index, _pool) = open_backdoor(&dir).await;

    let id = vec!["chunk-1".to_string()];
    let old = vec!["old text".to_string()];
    let new = vec!["new text".to_string()];
    let metadatas = vec![serde_json::Map::new()];

    index
        .upsert(&id, &old, &[fake_vector("old text")], &metadatas, &Scope::Public)
        .await
        .unwrap();
    index
        .upsert(&id, &new, &[fake_vector("new text")], &metadatas, &Scope::Public)
        .await
        .unwrap();

    let hits = index
        .query(&fake_vector("new text"), 10, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1, "one record per id after re-upsert");
    assert_eq!(hits[0].id, "chunk-1");
    assert_eq!(hits[0].text, "new text");

    service.close().await;
}

// ============ Acknowledgment step ============

#[tokio::test]
async fn test_session_ack_is_generated_and_persisted() {
    let dir = TempDir::new().unwrap();
    let chat_log = Arc::new(RecordingChatLog::default());
    let service = RetrievalService::open(
        test_config(&dir),
        Arc::new(FakeEmbedder),
        chat_log.clone(),
        Arc::new(EchoAcker),
    )
    .await
    .unwrap();

    let result = service
        .ingest_session(b"hello context", "hello.txt", FileKind::PlainText, "s3", "hana")
        .await
        .unwrap();

    assert_eq!(result.chunk_count, 1);
    assert!(result.ack_text.contains("Received your file"));

    let messages = chat_log.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "s3");
    assert_eq!(messages[0].1, "assistant");

    service.close().await;
}

#[tokio::test]
async fn test_ack_failure_does_not_roll_back_ingestion() {
    let dir = TempDir::new().unwrap();
    let service = open_service(&dir).await; // NullAckGenerator always fails
    let (store, _, _pool) = open_backdoor(&dir).await;

    let result = service
        .ingest_session(b"important facts", "facts.txt", FileKind::PlainText, "s4", "ivan")
        .await
        .unwrap();

    assert_eq!(result.chunk_count, 1);
    assert_eq!(result.ack_text, "[no acknowledgment was generated]");
    assert_eq!(store.count_chunks_by_session("s4").await.unwrap(), 1);

    service.close().await;
}

// ============ Maintenance sweeps ============

#[tokio::test]
async fn test_reconcile_repairs_drift_in_both_directions() {
    let dir = TempDir::new().unwrap();
    let service = open_service(&dir).await;
    let (store, index, _pool) = open_backdoor(&dir).await;

    // Drift 1: a vector record nothing references.
    index
        .upsert(
            &["ghost".to_string()],
            &["ghost text".to_string()],
            &[fake_vector("ghost text")],
            &[serde_json::Map::new()],
            &Scope::Public,
        )
        .await
        .unwrap();

    // Drift 2: chunk rows whose vectors never landed.
    let owner = ragstore::scope::ChunkOwner::try_from_links(None, Some("s5".to_string())).unwrap();
    store
        .insert_chunks(&[ragstore::store::NewChunk {
            id: "lost-vector".to_string(),
            owner,
            source: "lost.txt".to_string(),
            chunk_index: 0,
            content: "content without a vector".to_string(),
            metadata_json: "{\"source\":\"lost.txt\"}".to_string(),
            uploader: None,
        }])
        .await
        .unwrap();

    let report = service.reconcile().await.unwrap();
    assert_eq!(report.orphan_vectors_removed, 1);
    assert_eq!(report.chunks_reembedded, 1);

    assert!(!index.contains("ghost").await.unwrap());
    assert!(index.contains("lost-vector").await.unwrap());
    let row = store.get_chunk("lost-vector").await.unwrap().unwrap();
    assert_eq!(row.vector_state, ragstore::models::VectorState::Committed);

    // The repaired chunk is now retrievable in its scope.
    let hits = service
        .query(
            "content without a vector",
            &Scope::Session("s5".to_string()),
            None,
        )
        .await;
    assert_eq!(hits.len(), 1);

    service.close().await;
}

#[tokio::test]
async fn test_recover_stalled_reenqueues_from_stored_file() {
    let dir = TempDir::new().unwrap();
    let service = open_service(&dir).await;
    let (store, _, pool) = open_backdoor(&dir).await;

    // Simulate a crash: stored file + batch stuck in processing, no chunks.
    let stored = store
        .create_stored_file("stuck.txt", "txt", b"recovered content", "judy", None)
        .await
        .unwrap();
    let batch = store
        .create_batch("stuck.txt", "judy", Some(&stored.id))
        .await
        .unwrap();
    sqlx::query("UPDATE knowledge_batches SET created_at = created_at - 7200 WHERE id = ?")
        .bind(&batch.id)
        .execute(&pool)
        .await
        .unwrap();

    let requeued = service.recover_stalled().await.unwrap();
    assert_eq!(requeued, 1);

    assert_eq!(
        wait_for_terminal(&service, &batch.id).await,
        BatchStatus::Completed
    );
    assert_eq!(store.count_chunks_by_batch(&batch.id).await.unwrap(), 1);

    service.close().await;
}
