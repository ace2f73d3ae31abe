use super::{PersistenceSink, RawRow};
use crate::error::PersistenceError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;

// Three binds per row keeps each statement well under SQLite's variable limit.
const MAX_ROWS_PER_STATEMENT: usize = 2_000;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredRow {
    pub timestamp: String,
    pub data: String,
    pub user_name: String,
}

#[derive(Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    /// Open (or create) the database file and make sure the recorder tables exist.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self, PersistenceError> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| PersistenceError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        ensure_schema(&pool).await?;
        tracing::info!(path = %path.display(), "database initialized");
        Ok(Self { pool })
    }

    pub async fn count(&self) -> Result<i64, PersistenceError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM brainwaves_raw")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Newest rows first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<StoredRow>, PersistenceError> {
        let rows = sqlx::query_as::<_, StoredRow>(
            r#"
            SELECT timestamp, data, user_name
            FROM brainwaves_raw
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS brainwaves_raw (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT,
            data TEXT,
            user_name TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_timestamp ON brainwaves_raw (timestamp)")
        .execute(pool)
        .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregated_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            start_timestamp TEXT,
            end_timestamp TEXT,
            avg_values TEXT,
            record_count INTEGER,
            info TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl PersistenceSink for SqliteSink {
    async fn write_batch(&self, rows: &[RawRow]) -> Result<usize, PersistenceError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for chunk in rows.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO brainwaves_raw (timestamp, data, user_name) ");
            builder.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.timestamp.clone())
                    .push_bind(row.data.clone())
                    .push_bind(row.user_name.to_string());
            });
            let result = builder.build().execute(&mut *tx).await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn close(&self) -> Result<(), PersistenceError> {
        self.pool.close().await;
        tracing::debug!("database pool closed");
        Ok(())
    }
}
