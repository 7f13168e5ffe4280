//! Persistent vector index.
//!
//! A single physical collection (`vector_records`) shared by all scopes,
//! keyed by caller-supplied chunk ids. Supports idempotent upsert,
//! similarity query with an optional scope filter, and best-effort
//! delete-by-id. Embeddings are BLOB-encoded f32 vectors scored by cosine
//! distance in process.

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use crate::scope::Scope;

/// A record returned from a similarity query, nearest first.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub text: String,
    pub scope_tag: String,
    /// Record metadata with `retrieval_score` (the cosine distance) merged in.
    pub metadata: Value,
    pub distance: f64,
}

#[derive(Clone)]
pub struct VectorIndex {
    pool: SqlitePool,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert-or-replace a batch of records under one scope tag.
    ///
    /// All slices must be equal length. The whole batch succeeds or the
    /// call errors; upsert is idempotent by id (last writer wins), so
    /// callers retry safely.
    pub async fn upsert(
        &self,
        ids: &[String],
        texts: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[Map<String, Value>],
        scope: &Scope,
    ) -> Result<()> {
        if ids.len() != texts.len() || ids.len() != vectors.len() || ids.len() != metadatas.len() {
            bail!(
                "upsert length mismatch: {} ids, {} texts, {} vectors, {} metadatas",
                ids.len(),
                texts.len(),
                vectors.len(),
                metadatas.len()
            );
        }
        if ids.is_empty() {
            return Ok(());
        }

        let tag = scope.tag();
        let mut tx = self.pool.begin().await?;

        for i in 0..ids.len() {
            let metadata_json = serde_json::to_string(&Value::Object(metadatas[i].clone()))
                .unwrap_or_else(|_| "{}".to_string());
            sqlx::query(
                r#"
                INSERT INTO vector_records (id, content, scope, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    scope = excluded.scope,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&ids[i])
            .bind(&texts[i])
            .bind(&tag)
            .bind(&metadata_json)
            .bind(vec_to_blob(&vectors[i]))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = ids.len(), scope = %tag, "upserted vector records");
        Ok(())
    }

    /// Return up to `k` nearest records by cosine distance (ascending),
    /// optionally narrowed to one scope. With no filter, every record in
    /// the collection is a candidate regardless of scope tag.
    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&Scope>,
    ) -> Result<Vec<VectorHit>> {
        let rows = match filter {
            Some(scope) => {
                sqlx::query(
                    "SELECT id, content, scope, metadata_json, embedding FROM vector_records WHERE scope = ?",
                )
                .bind(scope.tag())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT id, content, scope, metadata_json, embedding FROM vector_records")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut hits: Vec<VectorHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let candidate = blob_to_vec(&blob);
                let distance = cosine_distance(vector, &candidate) as f64;

                let metadata_json: String = row.get("metadata_json");
                let mut metadata: Value =
                    serde_json::from_str(&metadata_json).unwrap_or_else(|_| Value::Object(Map::new()));
                if let Some(obj) = metadata.as_object_mut() {
                    obj.insert(
                        "retrieval_score".to_string(),
                        serde_json::json!(distance),
                    );
                }

                VectorHit {
                    id: row.get("id"),
                    text: row.get("content"),
                    scope_tag: row.get("scope"),
                    metadata,
                    distance,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);

        Ok(hits)
    }

    /// Delete records by id. Best-effort: returns the number of ids
    /// submitted for deletion, not a confirmed-deleted count.
    pub async fn delete(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM vector_records WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(count = ids.len(), "submitted vector deletions");
        Ok(ids.len())
    }

    /// Ids of vector records with no corresponding chunk row (drift).
    pub async fn orphan_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT vr.id FROM vector_records vr
            LEFT JOIN chunks c ON c.id = vr.id
            WHERE c.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    pub async fn contains(&self, id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_records WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
