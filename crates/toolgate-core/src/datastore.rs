//! The single persistence seam every store in this crate is written against.
//!
//! Spec §1 treats "the relational datastore" as an external collaborator
//! reachable only through `query(sql, params) -> rows`. `Datastore` is that
//! contract; `PgDatastore` is the concrete `sqlx::PgPool`-backed
//! implementation. Stores never reach for `sqlx::PgPool` directly — only
//! through this trait, so that a test double can stand in for it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::GatewayError;

/// A bound parameter. Covers every scalar the stores in this crate need to
/// pass through `query`; schema/migration concerns are out of scope (§1) but
/// the parameter shapes themselves are dictated by the entities in §3.
#[derive(Debug, Clone)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Uuid(Uuid),
    Json(Value),
    Timestamp(DateTime<Utc>),
    Null,
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        SqlParam::Text(v.to_string())
    }
}
impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        SqlParam::Text(v)
    }
}
impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::Int(v)
    }
}
impl From<Uuid> for SqlParam {
    fn from(v: Uuid) -> Self {
        SqlParam::Uuid(v)
    }
}
impl From<Value> for SqlParam {
    fn from(v: Value) -> Self {
        SqlParam::Json(v)
    }
}
impl From<DateTime<Utc>> for SqlParam {
    fn from(v: DateTime<Utc>) -> Self {
        SqlParam::Timestamp(v)
    }
}

/// One returned row, addressable by column name, already detached from the
/// driver's connection lifetime.
pub struct DataRow(sqlx::postgres::PgRow);

impl DataRow {
    pub fn try_get<T>(&self, column: &str) -> Result<T, GatewayError>
    where
        for<'a> T: sqlx::Decode<'a, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        self.0
            .try_get(column)
            .map_err(|e| GatewayError::Internal(format!("column {column}: {e}")))
    }
}

#[async_trait::async_trait]
pub trait Datastore: Send + Sync {
    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<DataRow>, GatewayError>;

    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, GatewayError>;
}

/// `sqlx`-backed datastore. Table DDL and migrations are out of scope
/// (spec §1); this type only ever issues the SQL strings the stores hand it.
#[derive(Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub async fn connect(database_url: &str) -> Result<Self, GatewayError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to connect datastore: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn bind<'q>(
        sql: &'q str,
        params: &[SqlParam],
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = match param.clone() {
                SqlParam::Text(v) => query.bind(v),
                SqlParam::Int(v) => query.bind(v),
                SqlParam::Float(v) => query.bind(v),
                SqlParam::Bool(v) => query.bind(v),
                SqlParam::Uuid(v) => query.bind(v),
                SqlParam::Json(v) => query.bind(v),
                SqlParam::Timestamp(v) => query.bind(v),
                SqlParam::Null => query.bind(Option::<String>::None),
            };
        }
        query
    }
}

#[async_trait::async_trait]
impl Datastore for PgDatastore {
    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<DataRow>, GatewayError> {
        let rows = Self::bind(sql, params)
            .fetch_all(&self.pool)
            .await
            .map_err(GatewayError::from)?;
        Ok(rows.into_iter().map(DataRow).collect())
    }

    async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, GatewayError> {
        let result = Self::bind(sql, params)
            .execute(&self.pool)
            .await
            .map_err(GatewayError::from)?;
        Ok(result.rows_affected())
    }
}
