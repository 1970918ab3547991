//! PostgreSQL metadata provider
//!
//! Reads columns, primary keys and foreign keys from `information_schema`
//! and row estimates from `pg_class`.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{MetadataError, MetadataProvider, MetadataRow, MetadataSnapshot};
use crate::catalog::ColumnKey;

pub struct PostgresMetadataProvider {
    pool: PgPool,
    schema: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ColumnRecord {
    table_name: String,
    column_name: String,
    data_type: String,
    is_nullable: bool,
    is_primary_key: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ForeignKeyRecord {
    table_name: String,
    column_name: String,
    foreign_table_name: String,
    foreign_column_name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct RowEstimate {
    table_name: String,
    estimate: i64,
}

impl PostgresMetadataProvider {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub async fn connect(
        database_url: &str,
        schema: impl Into<String>,
    ) -> std::result::Result<Self, MetadataError> {
        let pool = PgPool::connect(database_url).await.map_err(map_sqlx_error)?;
        Ok(Self::new(pool, schema))
    }

    async fn load_columns(&self) -> std::result::Result<Vec<ColumnRecord>, MetadataError> {
        sqlx::query_as::<_, ColumnRecord>(
            r#"
            SELECT c.table_name::text AS table_name,
                   c.column_name::text AS column_name,
                   c.data_type::text AS data_type,
                   (c.is_nullable = 'YES') AS is_nullable,
                   EXISTS (
                       SELECT 1
                       FROM information_schema.table_constraints tc
                       JOIN information_schema.key_column_usage kcu
                         ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                       WHERE tc.constraint_type = 'PRIMARY KEY'
                         AND tc.table_schema = c.table_schema
                         AND kcu.table_name = c.table_name
                         AND kcu.column_name = c.column_name
                   ) AS is_primary_key
            FROM information_schema.columns c
            JOIN information_schema.tables t
              ON t.table_schema = c.table_schema AND t.table_name = c.table_name
            WHERE c.table_schema = $1 AND t.table_type = 'BASE TABLE'
            ORDER BY c.table_name, c.ordinal_position
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn load_foreign_keys(&self) -> std::result::Result<Vec<ForeignKeyRecord>, MetadataError> {
        sqlx::query_as::<_, ForeignKeyRecord>(
            r#"
            SELECT kcu.table_name::text AS table_name,
                   kcu.column_name::text AS column_name,
                   ccu.table_name::text AS foreign_table_name,
                   ccu.column_name::text AS foreign_column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.constraint_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1
            ORDER BY kcu.table_name, kcu.column_name
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn load_row_estimates(&self) -> std::result::Result<Vec<RowEstimate>, MetadataError> {
        sqlx::query_as::<_, RowEstimate>(
            r#"
            SELECT c.relname::text AS table_name,
                   GREATEST(c.reltuples, 0)::bigint AS estimate
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relkind = 'r'
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl MetadataProvider for PostgresMetadataProvider {
    fn source_id(&self) -> String {
        format!("postgres:{}", self.schema)
    }

    async fn fetch(&self) -> std::result::Result<MetadataSnapshot, MetadataError> {
        info!("Reading metadata for schema '{}'", self.schema);
        let columns = self.load_columns().await?;
        if columns.is_empty() {
            return Err(MetadataError::Malformed(format!(
                "schema '{}' has no readable tables",
                self.schema
            )));
        }

        let mut fk_index: BTreeMap<(String, String), Vec<ColumnKey>> = BTreeMap::new();
        for fk in self.load_foreign_keys().await? {
            fk_index
                .entry((fk.table_name, fk.column_name))
                .or_default()
                .push(ColumnKey::new(fk.foreign_table_name, fk.foreign_column_name));
        }

        // Estimates are optional; a missing pg_class grant only lowers confidence.
        let row_counts = match self.load_row_estimates().await {
            Ok(estimates) => estimates
                .into_iter()
                .map(|e| (e.table_name, e.estimate.max(0) as u64))
                .collect(),
            Err(e) => {
                debug!("Row estimates unavailable: {}", e);
                BTreeMap::new()
            }
        };

        let rows = columns
            .into_iter()
            .map(|c| {
                let refs = fk_index
                    .remove(&(c.table_name.clone(), c.column_name.clone()))
                    .unwrap_or_default();
                MetadataRow {
                    table: c.table_name,
                    column: c.column_name,
                    data_type: c.data_type,
                    nullable: c.is_nullable,
                    is_primary_key: c.is_primary_key,
                    foreign_key_refs: refs,
                }
            })
            .collect();

        Ok(MetadataSnapshot { rows, row_counts })
    }
}

fn map_sqlx_error(err: sqlx::Error) -> MetadataError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("42501") => {
            MetadataError::AccessDenied(db.message().to_string())
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("28P01") => {
            MetadataError::AccessDenied(db.message().to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_) => MetadataError::Unreachable(err.to_string()),
        _ => MetadataError::Malformed(err.to_string()),
    }
}
