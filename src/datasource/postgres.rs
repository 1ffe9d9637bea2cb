//! PostgreSQL datasource backed by a bounded sqlx pool.
//!
//! Logical database ids are PostgreSQL schemas inside the physical
//! database: each query runs with `search_path` set to its logical db.

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};

use super::{ConnectionSettings, Datasource, ErrorCategory, QueryResult};

/// PostgreSQL datasource serving one logical database.
pub struct PostgresDatasource {
    name: String,
    database: String,
    pool: PgPool,
    statement_timeout: Duration,
}

impl PostgresDatasource {
    /// Build the datasource with a lazily-connected pool.
    ///
    /// The pool opens connections on first use, so construction succeeds
    /// even when the database is down; `ping` reports actual reachability.
    pub fn new(
        name: &str,
        database: &str,
        settings: &ConnectionSettings,
    ) -> anyhow::Result<Self> {
        if !is_valid_ident(database) {
            anyhow::bail!("invalid logical database id '{database}'");
        }

        let port: u16 = settings
            .port
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid port '{}' for datasource '{name}'", settings.port))?;

        let url = format!(
            "postgres://{}:{}@{}:{}/{}",
            settings.user, settings.password, settings.host, port, settings.database
        );

        let pool = PgPoolOptions::new()
            .min_connections(settings.min_pool_size)
            .max_connections(settings.max_pool_size)
            .acquire_timeout(Duration::from_secs(settings.connect_timeout))
            .connect_lazy(&url)?;

        tracing::info!(
            datasource = %name,
            database = %database,
            pool_min = settings.min_pool_size,
            pool_max = settings.max_pool_size,
            "Created PostgreSQL pool"
        );

        Ok(Self {
            name: name.to_string(),
            database: database.to_string(),
            pool,
            statement_timeout: Duration::from_secs(settings.statement_timeout),
        })
    }

    async fn run_query(&self, sql: &str) -> Result<(Vec<PgRow>, u64), sqlx::Error> {
        let start = Instant::now();
        let mut conn = self.pool.acquire().await?;

        // The logical db is a schema; scope name resolution to it.
        let set_path = format!("SET search_path TO \"{}\", public", self.database);
        sqlx::query(&set_path).execute(&mut *conn).await?;

        let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;
        Ok((rows, start.elapsed().as_millis() as u64))
    }
}

#[async_trait::async_trait]
impl Datasource for PostgresDatasource {
    fn name(&self) -> &str {
        &self.name
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn execute(&self, sql: &str) -> QueryResult {
        let start = Instant::now();

        let outcome = tokio::time::timeout(self.statement_timeout, self.run_query(sql)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok((rows, query_ms))) => {
                let columns: Vec<String> = rows
                    .first()
                    .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
                    .unwrap_or_default();
                let data: Vec<serde_json::Map<String, Value>> =
                    rows.iter().map(row_to_json).collect();
                QueryResult::ok(data, columns, query_ms)
            }
            Ok(Err(e)) => {
                let (message, category) = categorize_sqlx_error(&e);
                tracing::error!(datasource = %self.name, error = %message, "Query execution failed");
                QueryResult::fail(message, category, elapsed_ms)
            }
            Err(_) => QueryResult::fail(
                format!(
                    "query timed out after {}s",
                    self.statement_timeout.as_secs()
                ),
                Some(ErrorCategory::Connection),
                elapsed_ms,
            ),
        }
    }

    async fn ping(&self) -> bool {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(datasource = %self.name, error = %e, "Ping failed");
                false
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!(datasource = %self.name, "Closed PostgreSQL pool");
    }
}

/// Map a sqlx error to a message and, where structurally certain, a category.
///
/// Errors reported by the database itself stay uncategorized; the
/// error-analysis model classifies them.
fn categorize_sqlx_error(e: &sqlx::Error) -> (String, Option<ErrorCategory>) {
    match e {
        sqlx::Error::PoolTimedOut => (
            "connection pool exhausted; no connection became available".to_string(),
            Some(ErrorCategory::Connection),
        ),
        sqlx::Error::PoolClosed => (
            "connection pool is closed".to_string(),
            Some(ErrorCategory::Connection),
        ),
        sqlx::Error::Io(io) => (
            format!("database connection failed: {io}"),
            Some(ErrorCategory::Connection),
        ),
        sqlx::Error::Tls(tls) => (
            format!("database TLS failure: {tls}"),
            Some(ErrorCategory::Connection),
        ),
        sqlx::Error::Database(db) => (format!("PostgreSQL error: {}", db.message()), None),
        other => (format!("query failed: {other}"), None),
    }
}

/// Decode a row into a JSON object keyed by column name, in column order.
fn row_to_json(row: &PgRow) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();

    for column in row.columns() {
        let name = column.name();
        let type_name = column.type_info().name();

        let value: Option<Value> = match type_name {
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(name)
                .ok()
                .flatten()
                .map(|u| json!(u.to_string())),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(name)
                .ok()
                .flatten()
                .map(|s| json!(s)),
            "INT2" => row
                .try_get::<Option<i16>, _>(name)
                .ok()
                .flatten()
                .map(|i| json!(i)),
            "INT4" => row
                .try_get::<Option<i32>, _>(name)
                .ok()
                .flatten()
                .map(|i| json!(i)),
            "INT8" => row
                .try_get::<Option<i64>, _>(name)
                .ok()
                .flatten()
                .map(|i| json!(i)),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(name)
                .ok()
                .flatten()
                .map(|f| json!(f)),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(name)
                .ok()
                .flatten()
                .map(|f| json!(f)),
            "NUMERIC" => row
                .try_get::<Option<rust_decimal::Decimal>, _>(name)
                .ok()
                .flatten()
                .map(|d| json!(d.to_string())),
            "BOOL" => row
                .try_get::<Option<bool>, _>(name)
                .ok()
                .flatten()
                .map(|b| json!(b)),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(name).ok().flatten(),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name)
                .ok()
                .flatten()
                .map(|dt| json!(dt.to_rfc3339())),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(name)
                .ok()
                .flatten()
                .map(|dt| json!(dt.to_string())),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(name)
                .ok()
                .flatten()
                .map(|d| json!(d.to_string())),
            _ => row
                .try_get::<Option<String>, _>(name)
                .ok()
                .flatten()
                .map(|s| json!(s)),
        };

        map.insert(name.to_string(), value.unwrap_or(Value::Null));
    }

    map
}

/// Schema identifiers come from the catalog, but quote-safety still holds.
fn is_valid_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
