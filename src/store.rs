// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Image store — the durable upload queue.
//!
//! One SQLite table, `images`, records every capture and its upload state.
//! The database is the single serialization point for the queue: all
//! mutations go through this handle, which holds a one-connection pool so
//! writes are serialized without sharing a writer across threads. WAL mode
//! keeps the file crash-safe across power loss.
//!
//! A row exists if and only if the backing JPEG exists; the pair is the
//! unit of cleanup.

use std::path::Path;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;

/// `last_error` is kept short; failure strings are truncated to this.
const LAST_ERROR_MAX: usize = 200;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS images (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source      TEXT    NOT NULL,
    filename    TEXT    NOT NULL UNIQUE,
    path        TEXT    NOT NULL,
    captured_at INTEGER NOT NULL,
    size_bytes  INTEGER NOT NULL DEFAULT 0,
    uploaded    INTEGER NOT NULL DEFAULT 0,
    attempts    INTEGER NOT NULL DEFAULT 0,
    abandoned   INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT
);
CREATE INDEX IF NOT EXISTS idx_images_queue ON images (uploaded, abandoned, id);
CREATE INDEX IF NOT EXISTS idx_images_captured_at ON images (captured_at);
";

/// One row of the `images` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ImageRecord {
    pub id: i64,
    pub source: String,
    pub filename: String,
    pub path: String,
    pub captured_at: i64,
    pub size_bytes: i64,
    pub uploaded: bool,
    pub attempts: i64,
    pub abandoned: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueCounts {
    pub total: i64,
    pub pending: i64,
    pub uploaded: i64,
    pub abandoned: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SourceCount {
    pub source: String,
    pub total: i64,
    pub uploaded: i64,
}

pub struct ImageStore {
    pool: SqlitePool,
}

impl ImageStore {
    /// Open (creating if needed) the database at `path` and ensure the
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(ImageStore { pool })
    }

    /// Insert the row for a freshly written JPEG. This is the authoritative
    /// "capture happened" event.
    pub async fn insert(
        &self,
        source: &str,
        filename: &str,
        path: &str,
        captured_at: i64,
        size_bytes: i64,
    ) -> Result<ImageRecord> {
        let result = sqlx::query(
            "INSERT INTO images (source, filename, path, captured_at, size_bytes) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source)
        .bind(filename)
        .bind(path)
        .bind(captured_at)
        .bind(size_bytes)
        .execute(&self.pool)
        .await?;

        Ok(ImageRecord {
            id: result.last_insert_rowid(),
            source: source.to_string(),
            filename: filename.to_string(),
            path: path.to_string(),
            captured_at,
            size_bytes,
            uploaded: false,
            attempts: 0,
            abandoned: false,
            last_error: None,
        })
    }

    /// Next batch of deliverable rows, oldest first.
    pub async fn pending(&self, limit: i64) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query_as::<_, ImageRecord>(
            "SELECT * FROM images WHERE uploaded = 0 AND abandoned = 0 ORDER BY id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Record a successful delivery. The winning attempt counts too, and a
    /// stale failure reason is cleared.
    pub async fn mark_uploaded(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE images SET uploaded = 1, attempts = attempts + 1, last_error = NULL \
             WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed delivery attempt.
    pub async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        let short: String = error.chars().take(LAST_ERROR_MAX).collect();
        sqlx::query("UPDATE images SET attempts = attempts + 1, last_error = ? WHERE id = ?")
            .bind(short)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop an item from the queue permanently (oversize, backing file
    /// missing). The row stays for the listing API until retention removes
    /// it.
    pub async fn abandon(&self, id: i64, reason: &str) -> Result<()> {
        let short: String = reason.chars().take(LAST_ERROR_MAX).collect();
        sqlx::query("UPDATE images SET abandoned = 1, last_error = ? WHERE id = ?")
            .bind(short)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn by_filename(&self, filename: &str) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRecord>("SELECT * FROM images WHERE filename = ?")
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Newest-first page of captures, optionally filtered by source.
    pub async fn list(
        &self,
        source: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ImageRecord>> {
        let rows = match source {
            Some(source) => {
                sqlx::query_as::<_, ImageRecord>(
                    "SELECT * FROM images WHERE source = ? ORDER BY id DESC LIMIT ? OFFSET ?",
                )
                .bind(source)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ImageRecord>(
                    "SELECT * FROM images ORDER BY id DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn count(&self, source: Option<&str>) -> Result<i64> {
        let count = match source {
            Some(source) => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM images WHERE source = ?")
                    .bind(source)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM images")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    /// Captures with `from <= captured_at < to`, oldest first.
    pub async fn list_between(
        &self,
        from: i64,
        to: i64,
        source: Option<&str>,
    ) -> Result<Vec<ImageRecord>> {
        let rows = match source {
            Some(source) => {
                sqlx::query_as::<_, ImageRecord>(
                    "SELECT * FROM images WHERE captured_at >= ? AND captured_at < ? \
                     AND source = ? ORDER BY captured_at ASC",
                )
                .bind(from)
                .bind(to)
                .bind(source)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ImageRecord>(
                    "SELECT * FROM images WHERE captured_at >= ? AND captured_at < ? \
                     ORDER BY captured_at ASC",
                )
                .bind(from)
                .bind(to)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Rows past the retention horizon, oldest first.
    pub async fn older_than(&self, threshold: i64) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query_as::<_, ImageRecord>(
            "SELECT * FROM images WHERE captured_at < ? ORDER BY captured_at ASC",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let (total, uploaded, abandoned, pending) = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            "SELECT COUNT(*), \
                    COALESCE(SUM(uploaded), 0), \
                    COALESCE(SUM(abandoned), 0), \
                    COALESCE(SUM(CASE WHEN uploaded = 0 AND abandoned = 0 THEN 1 ELSE 0 END), 0) \
             FROM images",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueCounts {
            total,
            pending,
            uploaded,
            abandoned,
        })
    }

    pub async fn source_counts(&self) -> Result<Vec<SourceCount>> {
        let rows = sqlx::query_as::<_, SourceCount>(
            "SELECT source, COUNT(*) AS total, COALESCE(SUM(uploaded), 0) AS uploaded \
             FROM images GROUP BY source ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
