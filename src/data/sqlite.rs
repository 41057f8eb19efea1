//! SQLite resource store
//!
//! Resources are stored as JSON text in a single `resources` table.
//! The prefix and string-valued properties of a predicate are matched in
//! SQL (`inbox`, `outbox` and the token hash are indexed); the full
//! predicate is then applied to the decoded documents.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;

use super::store::{Predicate, ResourceStore, resource_id};
use crate::error::AppError;

/// Resource store backed by a SQLite connection pool
#[derive(Clone)]
pub struct SqliteResourceStore {
    pool: Pool<Sqlite>,
}

impl SqliteResourceStore {
    /// Connect to the database, creating the file if needed
    ///
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Store(e.to_string()))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Store(format!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Resource store connected and migrated");

        Ok(Self { pool })
    }

    /// JSON path literal for `key`, when it can be inlined into SQL
    fn json_path(key: &str) -> Option<String> {
        key.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '@'))
            .then(|| format!("$.\"{}\"", key))
    }

    fn decode(uri: &str, body: &str) -> Result<Value, AppError> {
        serde_json::from_str(body)
            .map_err(|e| AppError::Store(format!("Corrupt resource {}: {}", uri, e)))
    }
}

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    async fn get(&self, uri: &str) -> Result<Option<Value>, AppError> {
        let row = sqlx::query("SELECT body FROM resources WHERE uri = ?1")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let body: String = row.get("body");
            Self::decode(uri, &body)
        })
        .transpose()
    }

    async fn put(&self, resource: Value) -> Result<(), AppError> {
        let uri = resource_id(&resource)?;
        let body = serde_json::to_string(&resource)?;

        sqlx::query(
            r#"
            INSERT INTO resources (uri, body, updated_at)
            VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT(uri) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&uri)
        .bind(&body)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, uri: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM resources WHERE uri = ?1")
            .bind(uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_stored(&self, uri: &str) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT 1 FROM resources WHERE uri = ?1")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn query(&self, predicate: &Predicate) -> Result<Vec<Value>, AppError> {
        let prefix = predicate.prefix.as_deref().unwrap_or("");
        let mut sql =
            String::from("SELECT uri, body FROM resources WHERE substr(uri, 1, length(?1)) = ?1");
        let mut values = Vec::new();
        for (key, value) in &predicate.properties {
            if let (Some(path), Some(value)) = (Self::json_path(key), value.as_str()) {
                values.push(value);
                sql.push_str(&format!(" AND json_extract(body, '{}') = ?{}", path, values.len() + 1));
            }
        }
        sql.push_str(" ORDER BY uri");

        let mut query = sqlx::query(&sql).bind(prefix);
        for value in values {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut matched = Vec::new();
        for row in rows {
            let uri: String = row.get("uri");
            let body: String = row.get("body");
            let resource = Self::decode(&uri, &body)?;
            if predicate.matches(&resource) {
                matched.push(resource);
            }
        }
        Ok(matched)
    }
}
