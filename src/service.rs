//! Ingestion orchestration and the retrieval surface.
//!
//! [`RetrievalService`] is the explicitly constructed service object the
//! web layer talks to: it owns the database pool, the vector index, the
//! embedding client, and the background worker pool, and exposes
//! `ingest_public` / `ingest_session` / `query` / `delete_batch` /
//! `delete_scope` plus the reconciliation and crash-recovery sweeps.
//!
//! Dual-store writes follow a two-phase protocol: chunk rows land first
//! with `vector_state = pending`, vectors are upserted second, and only
//! then are the rows marked `committed`. A failure in between compensates
//! by removing this ingestion's rows and vectors; drift that survives a
//! crash is repaired by [`RetrievalService::reconcile`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chunker::split_documents;
use crate::collab::{AckGenerator, ChatLog};
use crate::config::{ChunkingConfig, Config};
use crate::db;
use crate::embedding::{Embedder, EmbeddingError};
use crate::index::VectorIndex;
use crate::jobs::{IngestJob, JobQueue, JobRunner};
use crate::loader::{load_documents, FileKind};
use crate::migrate;
use crate::models::{
    scalar_metadata, BatchStatus, KnowledgeBatch, ReconcileReport, RetrievedChunk, SessionIngest,
    SplitChunk,
};
use crate::scope::{ChunkOwner, Scope};
use crate::store::{KnowledgeStore, NewChunk};

/// Failure categories of one ingestion run; the category string becomes
/// the batch's `failed: <category>` status.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no chunks produced from document")]
    NoChunks,
    #[error("embedding failed: {0}")]
    Embedding(EmbeddingError),
    #[error("vector index error: {0}")]
    Index(anyhow::Error),
    #[error("database error: {0}")]
    Store(anyhow::Error),
}

impl IngestError {
    pub fn category(&self) -> &'static str {
        match self {
            IngestError::NoChunks => "no chunks",
            IngestError::Embedding(_) => "embedding error",
            IngestError::Index(_) => "index error",
            IngestError::Store(_) => "db error",
        }
    }
}

struct PipelineOutput {
    chunk_ids: Vec<String>,
    chunks: Vec<SplitChunk>,
}

/// The ingestion pipeline shared by foreground (session) and background
/// (public) paths. Also the worker pool's job runner.
struct PipelineCore {
    store: KnowledgeStore,
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    embed_batch_size: usize,
}

impl PipelineCore {
    /// Run loader → splitter → embed → index → relational commit for one
    /// file under one owner. On failure after chunk rows exist, both
    /// stores are compensated before the error is returned.
    async fn run_pipeline(
        &self,
        owner: ChunkOwner,
        bytes: Vec<u8>,
        filename: String,
        kind: FileKind,
        uploader: String,
    ) -> Result<PipelineOutput, IngestError> {
        // CPU-bound extraction and splitting stays off the async executor.
        let chunking = self.chunking.clone();
        let chunks = tokio::task::spawn_blocking(move || {
            let docs = load_documents(&bytes, &filename, kind);
            split_documents(&docs, &chunking)
        })
        .await
        .map_err(|e| IngestError::Store(anyhow::anyhow!("split task failed: {}", e)))?;

        if chunks.is_empty() {
            return Err(IngestError::NoChunks);
        }

        let chunk_ids: Vec<String> = chunks.iter().map(|_| Uuid::new_v4().to_string()).collect();

        // Phase 1: relational rows, pending.
        let rows: Vec<NewChunk> = chunks
            .iter()
            .zip(chunk_ids.iter())
            .map(|(chunk, id)| NewChunk {
                id: id.clone(),
                owner: owner.clone(),
                source: chunk.source.clone(),
                chunk_index: chunk.chunk_index,
                content: chunk.text.clone(),
                metadata_json: chunk.metadata_json(),
                uploader: Some(uploader.clone()),
            })
            .collect();
        self.store
            .insert_chunks(&rows)
            .await
            .map_err(IngestError::Store)?;

        // Phase 2: embed and upsert, then mark committed.
        match self.embed_and_index(&chunks, &chunk_ids, &owner.scope()).await {
            Ok(()) => Ok(PipelineOutput { chunk_ids, chunks }),
            Err(e) => {
                self.compensate(&chunk_ids).await;
                Err(e)
            }
        }
    }

    async fn embed_and_index(
        &self,
        chunks: &[SplitChunk],
        chunk_ids: &[String],
        scope: &Scope,
    ) -> Result<(), IngestError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.embed_batch_size.max(1)) {
            let batch_vectors = self
                .embedder
                .embed_many(batch)
                .await
                .map_err(IngestError::Embedding)?;
            vectors.extend(batch_vectors);
        }
        // One vector per chunk or nothing reaches the index.
        if vectors.len() != texts.len() {
            return Err(IngestError::Embedding(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: vectors.len(),
            }));
        }

        let metadatas: Vec<Map<String, Value>> = chunks
            .iter()
            .map(|c| scalar_metadata(&c.metadata))
            .collect();
        self.index
            .upsert(chunk_ids, &texts, &vectors, &metadatas, scope)
            .await
            .map_err(IngestError::Index)?;

        self.store
            .mark_chunks_committed(chunk_ids)
            .await
            .map_err(IngestError::Store)?;

        Ok(())
    }

    /// Remove this ingestion's rows and vectors after a mid-pipeline
    /// failure. Best-effort: leftovers are caught by the reconcile sweep.
    async fn compensate(&self, chunk_ids: &[String]) {
        if let Err(e) = self.store.delete_chunks_by_ids(chunk_ids).await {
            warn!(error = %e, "failed to remove chunk rows during compensation");
        }
        if let Err(e) = self.index.delete(chunk_ids).await {
            warn!(error = %e, "failed to remove vector records during compensation");
        }
    }
}

#[async_trait]
impl JobRunner for PipelineCore {
    async fn run(&self, job: IngestJob) {
        let stored = match self.store.get_stored_file(&job.stored_file_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                error!(batch_id = %job.batch_id, "stored file missing for queued batch");
                self.finish_batch(&job.batch_id, BatchStatus::Failed("missing stored file".into()))
                    .await;
                return;
            }
            Err(e) => {
                error!(batch_id = %job.batch_id, error = %e, "could not read stored file");
                self.finish_batch(&job.batch_id, BatchStatus::Failed("db error".into()))
                    .await;
                return;
            }
        };

        let result = self
            .run_pipeline(
                ChunkOwner::Batch(job.batch_id.clone()),
                stored.content,
                job.filename.clone(),
                job.kind,
                job.uploader.clone(),
            )
            .await;

        match result {
            Ok(output) => {
                info!(batch_id = %job.batch_id, chunks = output.chunk_ids.len(), "ingestion completed");
                self.finish_batch(&job.batch_id, BatchStatus::Completed).await;
            }
            Err(e) => {
                warn!(batch_id = %job.batch_id, error = %e, "ingestion failed");
                self.finish_batch(&job.batch_id, BatchStatus::Failed(e.category().into()))
                    .await;
            }
        }
    }
}

impl PipelineCore {
    /// If the status update itself fails, the batch stays `processing` — a
    /// detectable stuck state picked up by `recover_stalled`.
    async fn finish_batch(&self, batch_id: &str, status: BatchStatus) {
        if let Err(e) = self.store.update_batch_status(batch_id, &status).await {
            error!(batch_id, error = %e, "failed to update batch status, leaving it in processing");
        }
    }
}

pub struct RetrievalService {
    config: Config,
    pool: SqlitePool,
    core: Arc<PipelineCore>,
    queue: JobQueue,
    chat_log: Arc<dyn ChatLog>,
    acker: Arc<dyn AckGenerator>,
}

impl RetrievalService {
    /// Construct the service: connect the pool, ensure the schema, and
    /// start the background workers. Built once at process start and
    /// passed to the transport layer — no global clients.
    pub async fn open(
        config: Config,
        embedder: Arc<dyn Embedder>,
        chat_log: Arc<dyn ChatLog>,
        acker: Arc<dyn AckGenerator>,
    ) -> Result<Self> {
        crate::config::validate(&config)?;

        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;

        let core = Arc::new(PipelineCore {
            store: KnowledgeStore::new(pool.clone()),
            index: VectorIndex::new(pool.clone()),
            embedder,
            chunking: config.chunking.clone(),
            embed_batch_size: config.embedding.batch_size,
        });

        let queue = JobQueue::start(
            config.ingest.workers,
            config.ingest.queue_depth,
            core.clone(),
        );

        Ok(Self {
            config,
            pool,
            core,
            queue,
            chat_log,
            acker,
        })
    }

    /// Drain in-flight jobs and release the pool.
    pub async fn close(self) {
        self.queue.shutdown().await;
        self.pool.close().await;
    }

    fn store(&self) -> &KnowledgeStore {
        &self.core.store
    }

    fn index(&self) -> &VectorIndex {
        &self.core.index
    }

    // ============ Ingestion ============

    /// Ingest a file into the shared public knowledge base. Returns the
    /// batch id immediately; progress is polled via [`Self::batch_status`].
    ///
    /// The raw bytes are persisted before the batch record is created; if
    /// batch creation fails, the stored file is left behind rather than
    /// wrapped in a distributed transaction (accepted orphan risk).
    pub async fn ingest_public(
        &self,
        bytes: &[u8],
        filename: &str,
        kind: FileKind,
        uploader: &str,
    ) -> Result<String> {
        let stored = self
            .store()
            .create_stored_file(filename, kind.tag(), bytes, uploader, None)
            .await
            .context("failed to persist uploaded file")?;

        let batch = self
            .store()
            .create_batch(filename, uploader, Some(&stored.id))
            .await
            .context("failed to create knowledge batch record")?;

        let job = IngestJob {
            batch_id: batch.id.clone(),
            stored_file_id: stored.id,
            filename: filename.to_string(),
            kind,
            uploader: uploader.to_string(),
        };

        if let Err(e) = self.queue.enqueue(job) {
            self.store()
                .update_batch_status(&batch.id, &BatchStatus::Failed("queue full".into()))
                .await
                .ok();
            return Err(e);
        }

        info!(batch_id = %batch.id, file = filename, "public ingestion accepted");
        Ok(batch.id)
    }

    /// Ingest a file as private context for one conversation, synchronously
    /// within the request, then generate and persist an assistant
    /// acknowledgment (best-effort — its failure never rolls back the
    /// completed ingestion).
    pub async fn ingest_session(
        &self,
        bytes: &[u8],
        filename: &str,
        kind: FileKind,
        session_id: &str,
        uploader: &str,
    ) -> Result<SessionIngest> {
        let stored = self
            .store()
            .create_stored_file(filename, kind.tag(), bytes, uploader, Some(session_id))
            .await
            .context("failed to persist uploaded file")?;

        let output = match self
            .core
            .run_pipeline(
                ChunkOwner::Session(session_id.to_string()),
                bytes.to_vec(),
                filename.to_string(),
                kind,
                uploader.to_string(),
            )
            .await
        {
            Ok(output) => output,
            Err(IngestError::NoChunks) => {
                // The upload itself is kept even when nothing usable came out.
                warn!(session_id, file = filename, "no chunks extracted from session file");
                return Ok(SessionIngest {
                    chunk_count: 0,
                    ack_text: "I received the file, but could not extract any text content from it."
                        .to_string(),
                    stored_file_id: stored.id,
                });
            }
            Err(e) => return Err(anyhow::Error::new(e).context("session ingestion failed")),
        };

        let ack_text = self
            .acknowledge(session_id, uploader, filename, &output)
            .await;

        Ok(SessionIngest {
            chunk_count: output.chunk_ids.len(),
            ack_text,
            stored_file_id: stored.id,
        })
    }

    async fn acknowledge(
        &self,
        session_id: &str,
        uploader: &str,
        filename: &str,
        output: &PipelineOutput,
    ) -> String {
        let preview: String = output
            .chunks
            .first()
            .map(|c| c.text.chars().take(500).collect())
            .unwrap_or_default();
        let prompt = format!(
            "The user '{}' just uploaded a file named '{}' to this conversation. \
             It has been processed into {} chunks and added to the conversation's context. \
             Provide a brief acknowledgment that you received this file context. \
             A short preview:\n{}...",
            uploader,
            filename,
            output.chunk_ids.len(),
            preview
        );

        match self.acker.generate(session_id, &prompt).await {
            Ok(ack) => {
                if let Err(e) = self.chat_log.save(session_id, "assistant", &ack).await {
                    warn!(session_id, error = %e, "failed to persist acknowledgment message");
                }
                ack
            }
            Err(e) => {
                warn!(session_id, error = %e, "acknowledgment generation failed, using placeholder");
                "[no acknowledgment was generated]".to_string()
            }
        }
    }

    // ============ Query ============

    /// Scoped similarity query. Retrieval is advisory context for the
    /// downstream generation step, so failures log and return an empty
    /// list instead of propagating.
    pub async fn query(&self, text: &str, scope: &Scope, k: Option<usize>) -> Vec<RetrievedChunk> {
        let k = k.unwrap_or(self.config.retrieval.k);
        if text.trim().is_empty() {
            return Vec::new();
        }

        let vector = match self.core.embedder.embed_one(text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed, returning no results");
                return Vec::new();
            }
        };

        match self.index().query(&vector, k, Some(scope)).await {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| RetrievedChunk {
                    id: hit.id,
                    text: hit.text,
                    metadata: hit.metadata,
                    score: hit.distance,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "vector query failed, returning no results");
                Vec::new()
            }
        }
    }

    // ============ Deletion ============

    /// Delete a knowledge batch: its vector records (best-effort), its
    /// chunk rows, its stored file, and the batch record. Returns the
    /// number of relational chunk rows removed.
    pub async fn delete_batch(&self, batch_id: &str) -> Result<u64> {
        let batch = self
            .store()
            .get_batch(batch_id)
            .await?
            .with_context(|| format!("knowledge batch not found: {}", batch_id))?;

        let chunk_ids = self.store().chunk_ids_by_batch(batch_id).await?;
        self.delete_vectors_best_effort(&chunk_ids).await;

        let removed = self.store().delete_chunks_by_ids(&chunk_ids).await?;

        if let Some(stored_file_id) = &batch.stored_file_id {
            if !self.store().delete_stored_file(stored_file_id).await? {
                warn!(batch_id, stored_file_id, "stored file already gone");
            }
        }
        self.store().delete_batch_row(batch_id).await?;

        info!(batch_id, removed, "knowledge batch deleted");
        Ok(removed)
    }

    /// Delete everything a conversation scope owns: chunk rows, vector
    /// records, and session-linked stored files. Called by the chat
    /// subsystem when the conversation is destroyed.
    pub async fn delete_scope(&self, session_id: &str) -> Result<u64> {
        let chunk_ids = self.store().chunk_ids_by_session(session_id).await?;
        self.delete_vectors_best_effort(&chunk_ids).await;

        let removed = self.store().delete_chunks_by_ids(&chunk_ids).await?;

        for stored_file_id in self.store().stored_file_ids_by_session(session_id).await? {
            self.store().delete_stored_file(&stored_file_id).await?;
        }

        info!(session_id, removed, "conversation scope deleted");
        Ok(removed)
    }

    /// A non-error vector deletion means "attempted for N ids", not
    /// confirmed removal; a failed one must not block relational cleanup.
    async fn delete_vectors_best_effort(&self, chunk_ids: &[String]) {
        if chunk_ids.is_empty() {
            return;
        }
        match self.index().delete(chunk_ids).await {
            Ok(submitted) => info!(submitted, "vector deletions submitted"),
            Err(e) => error!(error = %e, "vector deletion failed, continuing with relational cleanup"),
        }
    }

    // ============ Status & listing ============

    pub async fn batch_status(&self, batch_id: &str) -> Result<Option<BatchStatus>> {
        Ok(self.store().get_batch(batch_id).await?.map(|b| b.status))
    }

    pub async fn list_batches(&self, limit: i64, offset: i64) -> Result<Vec<KnowledgeBatch>> {
        self.store().list_batches(limit, offset).await
    }

    // ============ Maintenance sweeps ============

    /// Detect and repair dual-store drift: vector records with no chunk
    /// row are removed; chunk rows with no vector record are re-embedded,
    /// re-upserted, and marked committed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let orphans = self.index().orphan_ids().await?;
        if !orphans.is_empty() {
            self.index().delete(&orphans).await?;
            report.orphan_vectors_removed = orphans.len();
        }

        let missing = self.store().chunks_missing_vectors().await?;
        let mut by_scope: HashMap<String, (Scope, Vec<crate::store::ChunkRow>)> = HashMap::new();
        for row in missing {
            let scope = row.owner.scope();
            by_scope
                .entry(scope.tag())
                .or_insert_with(|| (scope, Vec::new()))
                .1
                .push(row);
        }

        for (_, (scope, rows)) in by_scope {
            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let texts: Vec<String> = rows.iter().map(|r| r.content.clone()).collect();
            let metadatas: Vec<Map<String, Value>> = rows
                .iter()
                .map(|r| {
                    serde_json::from_str::<Value>(&r.metadata_json)
                        .ok()
                        .and_then(|v| v.as_object().cloned())
                        .map(|m| scalar_metadata(&m))
                        .unwrap_or_default()
                })
                .collect();

            let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
            for batch in texts.chunks(self.config.embedding.batch_size.max(1)) {
                vectors.extend(self.core.embedder.embed_many(batch).await?);
            }
            if vectors.len() != texts.len() {
                bail!(
                    "reconcile embedding count mismatch: expected {}, got {}",
                    texts.len(),
                    vectors.len()
                );
            }

            self.index()
                .upsert(&ids, &texts, &vectors, &metadatas, &scope)
                .await?;
            self.store().mark_chunks_committed(&ids).await?;
            report.chunks_reembedded += ids.len();
        }

        info!(
            orphans = report.orphan_vectors_removed,
            reembedded = report.chunks_reembedded,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    /// Re-enqueue batches stuck in `processing` longer than the configured
    /// threshold, re-running the pipeline from their stored file bytes.
    /// Returns the number re-enqueued.
    pub async fn recover_stalled(&self) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - self.config.ingest.stalled_after_secs as i64;
        let stalled = self.store().stalled_batches(cutoff).await?;

        let mut requeued = 0;
        for batch in stalled {
            let Some(stored_file_id) = batch.stored_file_id.clone() else {
                self.store()
                    .update_batch_status(
                        &batch.id,
                        &BatchStatus::Failed("missing stored file".into()),
                    )
                    .await?;
                continue;
            };
            let Some(stored) = self.store().get_stored_file(&stored_file_id).await? else {
                self.store()
                    .update_batch_status(
                        &batch.id,
                        &BatchStatus::Failed("missing stored file".into()),
                    )
                    .await?;
                continue;
            };

            let kind = match FileKind::from_tag(&stored.file_type) {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(batch_id = %batch.id, error = %e, "stalled batch has unknown file type");
                    self.store()
                        .update_batch_status(
                            &batch.id,
                            &BatchStatus::Failed("unsupported format".into()),
                        )
                        .await?;
                    continue;
                }
            };

            let job = IngestJob {
                batch_id: batch.id.clone(),
                stored_file_id,
                filename: batch.original_filename.clone(),
                kind,
                uploader: batch.uploader.clone(),
            };
            if let Err(e) = self.queue.enqueue(job) {
                warn!(error = %e, "queue full during stall recovery, stopping early");
                break;
            }
            info!(batch_id = %batch.id, "stalled batch re-enqueued");
            requeued += 1;
        }

        Ok(requeued)
    }
}

/// Render ranked chunks into the context string handed to the downstream
/// generation step.
pub fn format_context(query: &str, scope: &Scope, chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return match scope {
            Scope::Public => {
                "I couldn't find any relevant documents in the shared knowledge base for that query."
                    .to_string()
            }
            Scope::Session(id) => format!(
                "I couldn't find any relevant documents among the files uploaded in this conversation ({}).",
                id
            ),
        };
    }

    let blocks = chunks
        .iter()
        .map(|chunk| {
            let source = chunk
                .metadata
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            format!(
                "Source: {}, relevance score: {:.4}\nContent: {}",
                source, chunk.score, chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    match scope {
        Scope::Public => format!(
            "Based on the query '{}', here are the relevant excerpts from the shared knowledge base:\n\n{}",
            query, blocks
        ),
        Scope::Session(id) => format!(
            "Based on the query '{}', here are the relevant excerpts from files uploaded earlier in this conversation ({}):\n\n{}",
            query, id, blocks
        ),
    }
}
