use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Knowledge upload batches (public ingestion operations)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_batches (
            id TEXT PRIMARY KEY,
            original_filename TEXT NOT NULL,
            uploader TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'processing',
            created_at INTEGER NOT NULL,
            stored_file_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunk rows. Exactly one of batch_id / session_id is set; the CHECK
    // backs up the in-code exclusivity enforcement.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            batch_id TEXT REFERENCES knowledge_batches(id) ON DELETE CASCADE,
            session_id TEXT,
            source TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            vector_state TEXT NOT NULL DEFAULT 'pending',
            uploader TEXT,
            created_at INTEGER NOT NULL,
            CHECK ((batch_id IS NULL) <> (session_id IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Raw upload bytes. session_id NULL = public knowledge file.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stored_files (
            id TEXT PRIMARY KEY,
            original_filename TEXT NOT NULL,
            file_type TEXT NOT NULL,
            content BLOB NOT NULL,
            content_length INTEGER NOT NULL,
            uploader TEXT NOT NULL,
            session_id TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The vector index's physical collection, shared by all scopes.
    // Embeddings are little-endian f32 BLOBs; scope is an explicit tag.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_records (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            scope TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_batch_id ON chunks(batch_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_session_id ON chunks(session_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_vector_state ON chunks(vector_state)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_batches_created_at ON knowledge_batches(created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_stored_files_session ON stored_files(session_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vector_records_scope ON vector_records(scope)")
        .execute(pool)
        .await?;

    Ok(())
}
