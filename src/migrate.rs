//! Vector database schema.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `collections` | one row per collection with its serialized schema |
//! | `vectors` | one row per record: UUIDv5 native key, caller id, dense BLOB, sparse JSON, scalar fields JSON |
//!
//! Every statement is idempotent, so migrations run on every open.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            schema_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            collection TEXT NOT NULL,
            native_id TEXT NOT NULL,
            original_id TEXT NOT NULL,
            vector BLOB,
            sparse_json TEXT,
            fields_json TEXT NOT NULL DEFAULT '{}',
            seq INTEGER NOT NULL,
            PRIMARY KEY (collection, native_id),
            FOREIGN KEY (collection) REFERENCES collections(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_seq ON vectors(collection, seq)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vectors_uri ON vectors(collection, json_extract(fields_json, '$.uri'))",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vectors_parent ON vectors(collection, json_extract(fields_json, '$.parent_uri'))",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("v.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('collections', 'vectors')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 2);
    }
}
