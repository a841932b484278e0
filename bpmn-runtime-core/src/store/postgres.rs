//! Postgres entity store. All SQL is runtime-checked (`sqlx::query`, not
//! `sqlx::query!`) so builds need no database.
//!
//! ```sql
//! CREATE TABLE bpmn_entities (
//!     kind    TEXT   NOT NULL,
//!     key     TEXT   NOT NULL,
//!     version BIGINT NOT NULL,
//!     body    JSONB  NOT NULL,
//!     PRIMARY KEY (kind, key)
//! );
//! ```

use super::{EntityStore, Precondition, StoreResult, StoreTransaction, StoredEntity};
use crate::error::{EntityKind, StoreError};
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};

pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bpmn_entities (
                kind    TEXT   NOT NULL,
                key     TEXT   NOT NULL,
                version BIGINT NOT NULL,
                body    JSONB  NOT NULL,
                PRIMARY KEY (kind, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(anyhow!(e))
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn find(&mut self, kind: EntityKind, key: &str) -> StoreResult<Option<StoredEntity>> {
        let row = sqlx::query(
            r#"
            SELECT version, body FROM bpmn_entities
            WHERE kind = $1 AND key = $2
            FOR UPDATE
            "#,
        )
        .bind(kind.as_str())
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(backend)?;
        row.map(|r| {
            let version: i64 = r.try_get("version").map_err(backend)?;
            let body: Value = r.try_get("body").map_err(backend)?;
            Ok(StoredEntity {
                body,
                version: version as u64,
            })
        })
        .transpose()
    }

    async fn save(
        &mut self,
        kind: EntityKind,
        key: &str,
        body: Value,
        precondition: Precondition,
    ) -> StoreResult<()> {
        let result = match precondition {
            Precondition::Any => sqlx::query(
                r#"
                INSERT INTO bpmn_entities (kind, key, version, body)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (kind, key)
                DO UPDATE SET body = EXCLUDED.body, version = bpmn_entities.version + 1
                "#,
            )
            .bind(kind.as_str())
            .bind(key)
            .bind(&body)
            .execute(&mut *self.tx)
            .await,
            Precondition::Absent => sqlx::query(
                r#"
                INSERT INTO bpmn_entities (kind, key, version, body)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (kind, key) DO NOTHING
                "#,
            )
            .bind(kind.as_str())
            .bind(key)
            .bind(&body)
            .execute(&mut *self.tx)
            .await,
            Precondition::Version(expected) => sqlx::query(
                r#"
                UPDATE bpmn_entities
                SET body = $3, version = version + 1
                WHERE kind = $1 AND key = $2 AND version = $4
                "#,
            )
            .bind(kind.as_str())
            .bind(key)
            .bind(&body)
            .bind(expected as i64)
            .execute(&mut *self.tx)
            .await,
        }
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                kind,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&mut self, kind: EntityKind, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM bpmn_entities WHERE kind = $1 AND key = $2")
            .bind(kind.as_str())
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn scan(&mut self, kind: EntityKind) -> StoreResult<Vec<(String, StoredEntity)>> {
        let rows = sqlx::query(
            r#"
            SELECT key, version, body FROM bpmn_entities
            WHERE kind = $1
            ORDER BY key
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend)?;
        rows.into_iter()
            .map(|r| {
                let key: String = r.try_get("key").map_err(backend)?;
                let version: i64 = r.try_get("version").map_err(backend)?;
                let body: Value = r.try_get("body").map_err(backend)?;
                Ok((
                    key,
                    StoredEntity {
                        body,
                        version: version as u64,
                    },
                ))
            })
            .collect()
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(|e| {
            let serialization_failure = matches!(
                &e,
                sqlx::Error::Database(db) if db.code().as_deref() == Some("40001")
            );
            if serialization_failure {
                StoreError::Conflict {
                    kind: EntityKind::ProcessInstance,
                    key: "serialization failure".to_string(),
                }
            } else {
                backend(e)
            }
        })
    }
}
