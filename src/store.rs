//! Relational rows: knowledge batches, chunk metadata, stored files.
//!
//! The vector index holds the embeddings; these tables hold everything the
//! rest of the system needs to account for them — batch status for polling,
//! chunk rows keyed by the same ids as the vector records, and the raw
//! upload bytes that make crash recovery possible.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{BatchStatus, KnowledgeBatch, StoredFile, VectorState};
use crate::scope::ChunkOwner;

/// A chunk row ready for insertion. The owner enum makes an invalid
/// batch/session link combination unrepresentable.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub id: String,
    pub owner: ChunkOwner,
    pub source: String,
    pub chunk_index: i64,
    pub content: String,
    pub metadata_json: String,
    pub uploader: Option<String>,
}

/// A chunk row as stored.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: String,
    pub owner: ChunkOwner,
    pub source: String,
    pub chunk_index: i64,
    pub content: String,
    pub metadata_json: String,
    pub vector_state: VectorState,
    pub uploader: Option<String>,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct KnowledgeStore {
    pool: SqlitePool,
}

impl KnowledgeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ============ Stored files ============

    /// Persist raw upload bytes. Done first in every ingestion so the
    /// user's upload is never silently lost.
    pub async fn create_stored_file(
        &self,
        original_filename: &str,
        file_type: &str,
        content: &[u8],
        uploader: &str,
        session_id: Option<&str>,
    ) -> Result<StoredFile> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO stored_files
                (id, original_filename, file_type, content, content_length, uploader, session_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(original_filename)
        .bind(file_type)
        .bind(content)
        .bind(content.len() as i64)
        .bind(uploader)
        .bind(session_id)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(StoredFile {
            id,
            original_filename: original_filename.to_string(),
            file_type: file_type.to_string(),
            content: content.to_vec(),
            content_length: content.len() as i64,
            uploader: uploader.to_string(),
            session_id: session_id.map(|s| s.to_string()),
            created_at,
        })
    }

    pub async fn get_stored_file(&self, id: &str) -> Result<Option<StoredFile>> {
        let row = sqlx::query(
            "SELECT id, original_filename, file_type, content, content_length, uploader, session_id, created_at FROM stored_files WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StoredFile {
            id: row.get("id"),
            original_filename: row.get("original_filename"),
            file_type: row.get("file_type"),
            content: row.get("content"),
            content_length: row.get("content_length"),
            uploader: row.get("uploader"),
            session_id: row.get("session_id"),
            created_at: row.get("created_at"),
        }))
    }

    pub async fn delete_stored_file(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM stored_files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn stored_file_ids_by_session(&self, session_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM stored_files WHERE session_id = ?")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // ============ Knowledge batches ============

    pub async fn create_batch(
        &self,
        original_filename: &str,
        uploader: &str,
        stored_file_id: Option<&str>,
    ) -> Result<KnowledgeBatch> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp();
        let status = BatchStatus::Processing;

        sqlx::query(
            r#"
            INSERT INTO knowledge_batches (id, original_filename, uploader, status, created_at, stored_file_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(original_filename)
        .bind(uploader)
        .bind(status.as_str())
        .bind(created_at)
        .bind(stored_file_id)
        .execute(&self.pool)
        .await?;

        Ok(KnowledgeBatch {
            id,
            original_filename: original_filename.to_string(),
            uploader: uploader.to_string(),
            status,
            created_at,
            stored_file_id: stored_file_id.map(|s| s.to_string()),
        })
    }

    pub async fn get_batch(&self, id: &str) -> Result<Option<KnowledgeBatch>> {
        let row = sqlx::query(
            "SELECT id, original_filename, uploader, status, created_at, stored_file_id FROM knowledge_batches WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_batch))
    }

    pub async fn list_batches(&self, limit: i64, offset: i64) -> Result<Vec<KnowledgeBatch>> {
        let rows = sqlx::query(
            "SELECT id, original_filename, uploader, status, created_at, stored_file_id FROM knowledge_batches ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_batch).collect())
    }

    pub async fn update_batch_status(&self, id: &str, status: &BatchStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE knowledge_batches SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_batch_row(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM knowledge_batches WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Batches still `processing` that were created before `cutoff` —
    /// the detectable stuck state left by a crash mid-pipeline.
    pub async fn stalled_batches(&self, cutoff: i64) -> Result<Vec<KnowledgeBatch>> {
        let rows = sqlx::query(
            "SELECT id, original_filename, uploader, status, created_at, stored_file_id FROM knowledge_batches WHERE status = 'processing' AND created_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_batch).collect())
    }

    // ============ Chunks ============

    /// Insert chunk rows in one transaction, `vector_state = pending`
    /// (phase 1 of the dual-store protocol).
    pub async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let created_at = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            let (batch_id, session_id) = chunk.owner.links();
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, batch_id, session_id, source, chunk_index, content, metadata_json, vector_state, uploader, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(batch_id)
            .bind(session_id)
            .bind(&chunk.source)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.metadata_json)
            .bind(&chunk.uploader)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Phase 3: flip rows to `committed` once their vectors are durable.
    pub async fn mark_chunks_committed(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE chunks SET vector_state = 'committed' WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn chunk_ids_by_batch(&self, batch_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM chunks WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    pub async fn chunk_ids_by_session(&self, session_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM chunks WHERE session_id = ?")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    pub async fn chunks_by_batch(&self, batch_id: &str) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            "SELECT id, batch_id, session_id, source, chunk_index, content, metadata_json, vector_state, uploader, created_at FROM chunks WHERE batch_id = ? ORDER BY chunk_index ASC",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_chunk).collect()
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRow>> {
        let row = sqlx::query(
            "SELECT id, batch_id, session_id, source, chunk_index, content, metadata_json, vector_state, uploader, created_at FROM chunks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_chunk).transpose()
    }

    pub async fn delete_chunks_by_ids(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut deleted = 0u64;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let result = sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    pub async fn count_chunks_by_batch(&self, batch_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_chunks_by_session(&self, session_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Chunk rows whose vector record is missing (drift: pending leftovers
    /// from a crash, or vectors lost from the index).
    pub async fn chunks_missing_vectors(&self) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.batch_id, c.session_id, c.source, c.chunk_index, c.content,
                   c.metadata_json, c.vector_state, c.uploader, c.created_at
            FROM chunks c
            LEFT JOIN vector_records vr ON vr.id = c.id
            WHERE vr.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_chunk).collect()
    }
}

fn row_to_batch(row: SqliteRow) -> KnowledgeBatch {
    let status: String = row.get("status");
    KnowledgeBatch {
        id: row.get("id"),
        original_filename: row.get("original_filename"),
        uploader: row.get("uploader"),
        status: BatchStatus::parse(&status),
        created_at: row.get("created_at"),
        stored_file_id: row.get("stored_file_id"),
    }
}

fn row_to_chunk(row: SqliteRow) -> Result<ChunkRow> {
    let id: String = row.get("id");
    let owner = ChunkOwner::try_from_links(row.get("batch_id"), row.get("session_id"))
        .with_context(|| format!("chunk {} violates link exclusivity", id))?;
    let vector_state: String = row.get("vector_state");

    Ok(ChunkRow {
        id,
        owner,
        source: row.get("source"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        metadata_json: row.get("metadata_json"),
        vector_state: VectorState::parse(&vector_state),
        uploader: row.get("uploader"),
        created_at: row.get("created_at"),
    })
}
