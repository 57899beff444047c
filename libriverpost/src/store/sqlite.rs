//! SQLite-backed store shared by all service processes

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::Store;
use crate::error::{Result, StoreError};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the store file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::IoError)?;
        }

        // Forward slashes work for SQLite URLs on every platform
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(StoreError::SqlxError)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(StoreError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(StoreError::MigrationError)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_hash WHERE key = ? AND field = ?",
        )
        .bind(key)
        .bind(field)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_hash (key, field, value) VALUES (?, ?, ?)
            ON CONFLICT(key, field) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_hash WHERE key = ? AND field = ?")
            .bind(key)
            .bind(field)
            .execute(&self.pool)
            .await
            .map_err(StoreError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT field, value FROM kv_hash WHERE key = ?",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(rows.into_iter().collect())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let value = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO kv_hash (key, field, value) VALUES (?, ?, ?)
            ON CONFLICT(key, field) DO UPDATE SET
                value = CAST(CAST(kv_hash.value AS INTEGER) + CAST(excluded.value AS INTEGER) AS TEXT)
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(field)
        .bind(delta.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;

        value.parse().map_err(|_| {
            StoreError::Corrupt {
                key: format!("{}/{}", key, field),
                reason: format!("not an integer: {}", value),
            }
            .into()
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_zset (key, member, score) VALUES (?, ?, ?)
            ON CONFLICT(key, member) DO UPDATE SET score = excluded.score
            "#,
        )
        .bind(key)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_zset WHERE key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await
            .map_err(StoreError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: i64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, i64)>> {
        // LIMIT -1 means no limit in SQLite
        let limit = limit.map_or(-1, |l| l as i64);
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT member, score FROM kv_zset
            WHERE key = ? AND score <= ?
            ORDER BY score, member
            LIMIT ?
            "#,
        )
        .bind(key)
        .bind(max)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(rows)
    }

    async fn zfirst(&self, key: &str) -> Result<Option<(String, i64)>> {
        let row = sqlx::query_as::<_, (String, i64)>(
            "SELECT member, score FROM kv_zset WHERE key = ? ORDER BY score, member LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(row)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        let score = sqlx::query_scalar::<_, i64>(
            "SELECT score FROM kv_zset WHERE key = ? AND member = ?",
        )
        .bind(key)
        .bind(member)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(score)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM kv_zset WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::SqlxError)?;
        Ok(count as usize)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO kv_set (key, member) VALUES (?, ?)")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await
            .map_err(StoreError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_set WHERE key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await
            .map_err(StoreError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn spop(&self, key: &str) -> Result<Option<String>> {
        let member = sqlx::query_scalar::<_, String>(
            r#"
            DELETE FROM kv_set
            WHERE key = ? AND member = (
                SELECT member FROM kv_set WHERE key = ? ORDER BY member LIMIT 1
            )
            RETURNING member
            "#,
        )
        .bind(key)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(member)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let members = sqlx::query_scalar::<_, String>(
            "SELECT member FROM kv_set WHERE key = ? ORDER BY member",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(members)
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM kv_set WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::SqlxError)?;
        Ok(count as usize)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        sqlx::query(
            r#"
            INSERT INTO kv_list (key, seq, value)
            SELECT ?, COALESCE(MAX(seq), 0) + 1, ? FROM kv_list WHERE key = ?
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        self.llen(key).await
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        sqlx::query(
            r#"
            INSERT INTO kv_list (key, seq, value)
            SELECT ?, COALESCE(MIN(seq), 1) - 1, ? FROM kv_list WHERE key = ?
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        self.llen(key).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            r#"
            DELETE FROM kv_list
            WHERE key = ? AND seq = (SELECT MIN(seq) FROM kv_list WHERE key = ?)
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM kv_list WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::SqlxError)?;
        Ok(count as usize)
    }

    async fn lrange(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let values = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_list WHERE key = ? ORDER BY seq LIMIT ?",
        )
        .bind(key)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(values)
    }

    async fn ltrim(&self, key: &str, keep: usize) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM kv_list
            WHERE key = ? AND seq NOT IN (
                SELECT seq FROM kv_list WHERE key = ? ORDER BY seq LIMIT ?
            )
            "#,
        )
        .bind(key)
        .bind(key)
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        for table in ["kv_hash", "kv_zset", "kv_set", "kv_list"] {
            sqlx::query(&format!("DELETE FROM {} WHERE key = ?", table))
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(StoreError::SqlxError)?;
        }
        Ok(())
    }
}
