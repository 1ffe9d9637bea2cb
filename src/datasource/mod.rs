//! Datasource abstraction and routing.
//!
//! A [`Datasource`] is the execution surface for exactly one logical
//! database id. The [`DatasourceManager`] owns the id-to-datasource mapping
//! and enforces the isolation invariant: the mapping is a bijection, so any
//! plan step that names two ids resolving to different datasources is
//! statically rejected. It also refuses SQL that is not a pure read.

pub mod postgres;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Failure category for a query execution.
///
/// Most SQL errors are left uncategorized here; the error-analysis model
/// classifies them. The manager only sets a category where it is
/// structurally certain (rejected writes, connectivity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Malformed SQL.
    Syntax,
    /// Wrong table or column name.
    Schema,
    /// Access denied or non-read statement.
    Permission,
    /// Database unreachable, timeout, or pool exhaustion.
    Connection,
    /// Type mismatch or null handling.
    Data,
    /// Unclassified.
    Other,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Schema => write!(f, "schema"),
            Self::Permission => write!(f, "permission"),
            Self::Connection => write!(f, "connection"),
            Self::Data => write!(f, "data"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Result of a SQL query execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Whether the query succeeded.
    pub success: bool,
    /// Result rows, column order preserved within each row object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    /// Column names in result order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    /// Number of rows returned.
    pub row_count: usize,
    /// Error text if the query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error category, when structurally known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    /// Wall-clock execution time in milliseconds.
    pub elapsed_ms: u64,
}

impl QueryResult {
    /// Successful result with rows.
    #[must_use]
    pub fn ok(
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
        columns: Vec<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            success: true,
            row_count: rows.len(),
            rows: Some(rows),
            columns: Some(columns),
            error: None,
            category: None,
            elapsed_ms,
        }
    }

    /// Failed result.
    #[must_use]
    pub fn fail(
        error: impl Into<String>,
        category: Option<ErrorCategory>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            success: false,
            rows: None,
            columns: None,
            row_count: 0,
            error: Some(error.into()),
            category,
            elapsed_ms,
        }
    }
}

/// Execution surface for one logical database.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Datasource name from the catalog (e.g., `core_banking`).
    fn name(&self) -> &str;

    /// The single logical database id this datasource serves.
    fn database(&self) -> &str;

    /// Execute a read-only SQL statement.
    async fn execute(&self, sql: &str) -> QueryResult;

    /// Check connectivity.
    async fn ping(&self) -> bool;

    /// Release connections.
    async fn close(&self);
}

/// Scope validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// No databases named.
    #[error("no databases specified")]
    Empty,
    /// A db id missing from the datasource mapping.
    #[error("database '{0}' not found in any datasource")]
    UnknownDatabase(String),
    /// The ids resolve to more than one datasource.
    #[error("cannot query across datasources; databases span: {}", .0.join(", "))]
    SpansDatasources(Vec<String>),
}

/// Catalog entry surfaced via the data-sources API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceInfo {
    /// Logical database id.
    pub id: String,
    /// Human name.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// The datasource serving this id.
    pub datasource: String,
}

/// Declarative datasource catalog (`datasources.yaml`).
#[derive(Debug, Deserialize)]
struct DatasourcesFile {
    datasources: HashMap<String, DatasourceDecl>,
}

/// One datasource declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceDecl {
    /// Engine type; only `postgresql` is currently supported.
    #[serde(rename = "type")]
    pub kind: String,
    /// Disabled datasources are skipped at load.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Connection parameters, with `${ENV_VAR:default}` interpolation.
    pub connection: ConnectionSettings,
}

fn default_enabled() -> bool {
    true
}

/// Connection parameters for a relational datasource.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_min_pool")]
    pub min_pool_size: u32,
    #[serde(default = "default_max_pool")]
    pub max_pool_size: u32,
    /// Pool acquire timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Per-statement timeout in seconds.
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> String {
    "5432".to_string()
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_min_pool() -> u32 {
    2
}

fn default_max_pool() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_statement_timeout() -> u64 {
    30
}

impl ConnectionSettings {
    /// Resolve `${ENV_VAR:default}` placeholders in string-valued fields.
    fn resolve_env(mut self) -> Self {
        for field in [
            &mut self.host,
            &mut self.port,
            &mut self.database,
            &mut self.user,
            &mut self.password,
        ] {
            *field = interpolate_env(field);
        }
        self
    }
}

/// Resolve a `${ENV_VAR:default}` placeholder; plain values pass through.
fn interpolate_env(value: &str) -> String {
    let Some(spec) = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return value.to_string();
    };

    match spec.split_once(':') {
        Some((var, default)) => std::env::var(var).unwrap_or_else(|_| default.to_string()),
        None => std::env::var(spec).unwrap_or_default(),
    }
}

/// Summary file (`data_schemas/summary.yaml`) mapping db ids to datasources.
#[derive(Debug, Deserialize)]
struct SummaryFile {
    data_sources: Vec<DataSourceInfo>,
}

/// Routes queries to datasources and enforces the isolation policy.
pub struct DatasourceManager {
    sources: HashMap<String, Arc<dyn Datasource>>,
    db_to_source: HashMap<String, String>,
    infos: Vec<DataSourceInfo>,
}

impl std::fmt::Debug for DatasourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasourceManager")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("databases", &self.db_to_source.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DatasourceManager {
    /// Load datasources from the declarative catalog files.
    pub fn load(datasources_path: &Path, summary_path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(datasources_path)
            .with_context(|| format!("reading {}", datasources_path.display()))?;
        let decls: DatasourcesFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", datasources_path.display()))?;

        let text = std::fs::read_to_string(summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        let summary: SummaryFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", summary_path.display()))?;

        let mut sources: Vec<Arc<dyn Datasource>> = Vec::new();

        for info in &summary.data_sources {
            let Some(decl) = decls.datasources.get(&info.datasource) else {
                anyhow::bail!(
                    "database '{}' references unknown datasource '{}'",
                    info.id,
                    info.datasource
                );
            };
            if !decl.enabled {
                tracing::info!(datasource = %info.datasource, database = %info.id, "Skipping disabled datasource");
                continue;
            }
            match decl.kind.to_lowercase().as_str() {
                "postgresql" => {
                    let settings = decl.connection.clone().resolve_env();
                    let source =
                        postgres::PostgresDatasource::new(&info.datasource, &info.id, &settings)?;
                    tracing::info!(datasource = %info.datasource, database = %info.id, "Registered PostgreSQL datasource");
                    sources.push(Arc::new(source));
                }
                other => {
                    anyhow::bail!(
                        "unknown datasource type '{other}' for '{}'",
                        info.datasource
                    );
                }
            }
        }

        Self::from_parts(sources, summary.data_sources)
    }

    /// Build a manager from constructed datasources, enforcing the
    /// one-database-per-datasource bijection.
    pub fn from_parts(
        sources: Vec<Arc<dyn Datasource>>,
        infos: Vec<DataSourceInfo>,
    ) -> anyhow::Result<Self> {
        let mut by_name: HashMap<String, Arc<dyn Datasource>> = HashMap::new();
        let mut db_to_source: HashMap<String, String> = HashMap::new();
        let mut source_to_db: HashMap<String, String> = HashMap::new();

        for source in sources {
            let name = source.name().to_string();
            let db_id = source.database().to_string();

            if let Some(existing) = source_to_db.get(&name) {
                anyhow::bail!(
                    "datasource '{name}' serves both '{existing}' and '{db_id}'; \
                     each datasource must expose exactly one database"
                );
            }
            if db_to_source.contains_key(&db_id) {
                anyhow::bail!("database '{db_id}' is mapped to more than one datasource");
            }

            source_to_db.insert(name.clone(), db_id.clone());
            db_to_source.insert(db_id, name.clone());
            by_name.insert(name, source);
        }

        Ok(Self {
            sources: by_name,
            db_to_source,
            infos,
        })
    }

    /// Database ids with a registered datasource.
    #[must_use]
    pub fn databases(&self) -> Vec<String> {
        let mut dbs: Vec<String> = self.db_to_source.keys().cloned().collect();
        dbs.sort();
        dbs
    }

    /// Catalog entries for the data-sources API.
    #[must_use]
    pub fn list_sources(&self) -> &[DataSourceInfo] {
        &self.infos
    }

    /// Validate that all ids resolve to a single datasource.
    ///
    /// Returns the datasource name on success. With the bijection in place
    /// this fails for any list naming two distinct ids, which is what makes
    /// single-step cross-database JOINs statically impossible.
    pub fn validate_scope(&self, db_ids: &[String]) -> Result<String, ScopeError> {
        if db_ids.is_empty() {
            return Err(ScopeError::Empty);
        }

        let mut seen: Vec<String> = Vec::new();
        for db_id in db_ids {
            let source = self
                .db_to_source
                .get(db_id)
                .ok_or_else(|| ScopeError::UnknownDatabase(db_id.clone()))?;
            if !seen.contains(source) {
                seen.push(source.clone());
            }
        }

        if seen.len() > 1 {
            return Err(ScopeError::SpansDatasources(seen));
        }
        Ok(seen.remove(0))
    }

    /// Execute SQL against the datasource serving `db_id`.
    ///
    /// Statements that are not pure reads are refused with a `permission`
    /// category before touching any pool.
    pub async fn execute(&self, sql: &str, db_id: &str) -> QueryResult {
        if !is_read_only(sql) {
            return QueryResult::fail(
                "only read-only statements (SELECT, WITH) are allowed",
                Some(ErrorCategory::Permission),
                0,
            );
        }

        let Some(source_name) = self.db_to_source.get(db_id) else {
            return QueryResult::fail(
                format!("no datasource found for database '{db_id}'"),
                None,
                0,
            );
        };
        // Mapping and registry are built together; the entry exists.
        let source = &self.sources[source_name];

        source.execute(sql).await
    }

    /// Ping every datasource, logging per-source status.
    pub async fn connect_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for (name, source) in &self.sources {
            let ok = source.ping().await;
            if ok {
                tracing::info!(datasource = %name, "Datasource reachable");
            } else {
                tracing::error!(datasource = %name, "Datasource unreachable");
            }
            results.insert(name.clone(), ok);
        }
        results
    }

    /// Close every datasource's pool.
    pub async fn close_all(&self) {
        for source in self.sources.values() {
            source.close().await;
        }
    }
}

/// Whether the statement's first keyword (after whitespace and comments)
/// is a read verb.
fn is_read_only(sql: &str) -> bool {
    let stripped = strip_leading_comments(sql);
    let first_word = stripped
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    // Trailing parenthesis as in "WITH(..." or "SELECT(1)"
    let verb = first_word
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("");
    matches!(verb, "SELECT" | "WITH")
}

/// Skip leading whitespace, `--` line comments, and `/* */` block comments.
fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            return rest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSource {
        name: String,
        db: String,
    }

    impl StubSource {
        fn new(name: &str, db: &str) -> Arc<dyn Datasource> {
            Arc::new(Self {
                name: name.to_string(),
                db: db.to_string(),
            })
        }
    }

    #[async_trait]
    impl Datasource for StubSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn database(&self) -> &str {
            &self.db
        }

        async fn execute(&self, _sql: &str) -> QueryResult {
            QueryResult::ok(Vec::new(), Vec::new(), 1)
        }

        async fn ping(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    fn manager() -> DatasourceManager {
        DatasourceManager::from_parts(
            vec![
                StubSource::new("core_banking", "customer_db"),
                StubSource::new("accounts_store", "accounts_db"),
            ],
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_read_only_guard_accepts_selects() {
        assert!(is_read_only("SELECT 1"));
        assert!(is_read_only("  select * from customers"));
        assert!(is_read_only("WITH t AS (SELECT 1) SELECT * FROM t"));
        assert!(is_read_only("-- count them\nSELECT COUNT(*) FROM customers"));
        assert!(is_read_only("/* note */ SELECT 1"));
        assert!(is_read_only("SELECT(1)"));
    }

    #[test]
    fn test_read_only_guard_rejects_writes() {
        assert!(!is_read_only("INSERT INTO t VALUES (1)"));
        assert!(!is_read_only("UPDATE t SET x = 1"));
        assert!(!is_read_only("DELETE FROM t"));
        assert!(!is_read_only("DROP TABLE t"));
        assert!(!is_read_only("TRUNCATE t"));
        assert!(!is_read_only(""));
        assert!(!is_read_only("-- only a comment"));
    }

    #[test]
    fn test_scope_single_datasource_ok() {
        let manager = manager();
        let source = manager
            .validate_scope(&["customer_db".to_string()])
            .unwrap();
        assert_eq!(source, "core_banking");
    }

    #[test]
    fn test_scope_spanning_datasources_fails() {
        let manager = manager();
        let err = manager
            .validate_scope(&["customer_db".to_string(), "accounts_db".to_string()])
            .unwrap_err();
        assert!(matches!(err, ScopeError::SpansDatasources(_)));
        assert!(err.to_string().contains("span"));
    }

    #[test]
    fn test_scope_unknown_database_fails() {
        let manager = manager();
        let err = manager.validate_scope(&["ghost_db".to_string()]).unwrap_err();
        assert!(matches!(err, ScopeError::UnknownDatabase(_)));
    }

    #[test]
    fn test_scope_empty_fails() {
        let manager = manager();
        assert!(matches!(
            manager.validate_scope(&[]).unwrap_err(),
            ScopeError::Empty
        ));
    }

    #[test]
    fn test_bijection_rejects_datasource_with_two_databases() {
        let result = DatasourceManager::from_parts(
            vec![
                StubSource::new("shared", "customer_db"),
                StubSource::new("shared", "accounts_db"),
            ],
            Vec::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_execute_rejects_non_read_sql() {
        let manager = manager();
        let result = manager.execute("DELETE FROM customers", "customer_db").await;
        assert!(!result.success);
        assert_eq!(result.category, Some(ErrorCategory::Permission));
    }

    #[tokio::test]
    async fn test_execute_unknown_database_fails() {
        let manager = manager();
        let result = manager.execute("SELECT 1", "ghost_db").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("ghost_db"));
    }

    #[test]
    fn test_env_interpolation() {
        std::env::set_var("TABULA_TEST_HOST", "db.internal");
        assert_eq!(interpolate_env("${TABULA_TEST_HOST:localhost}"), "db.internal");
        assert_eq!(interpolate_env("${TABULA_TEST_MISSING:fallback}"), "fallback");
        assert_eq!(interpolate_env("plain-value"), "plain-value");
        std::env::remove_var("TABULA_TEST_HOST");
    }
}
