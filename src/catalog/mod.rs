//! Schema catalog for the logical databases.
//!
//! Per-database schema descriptors are loaded once from YAML files under
//! `knowledge/data_schemas/` and are immutable afterwards. The catalog
//! renders schema excerpts in two prompt modes: a condensed `planning` view
//! for the planner and a full `generation` view for SQL generation.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// How much schema detail a prompt needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Tables, descriptions, leading columns; foreign keys summarized.
    Planning,
    /// Full table/column listings with nullability and FK targets.
    Generation,
}

/// Columns shown per table in planning mode.
const PLANNING_COLUMN_LIMIT: usize = 8;

/// A column definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// SQL type as written in the descriptor (e.g., `varchar(100)`).
    #[serde(rename = "type")]
    pub sql_type: String,
    /// Whether the column is nullable.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Symbolic FK reference: `table.column` within the same database or
    /// `db.table.column` across databases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
}

fn default_nullable() -> bool {
    true
}

/// A table definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Ordered column list.
    pub columns: Vec<ColumnDef>,
}

/// The schema of one logical database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Logical database id (e.g., `customer_db`).
    pub database: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Ordered table list.
    pub tables: Vec<TableDef>,
}

/// Immutable catalog of database schemas.
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    schemas: HashMap<String, SchemaDefinition>,
    // Stable ordering for list_databases and prompt rendering.
    order: Vec<String>,
}

impl SchemaCatalog {
    /// Load every `*.yaml` descriptor under `dir`, skipping `summary.yaml`.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let mut definitions = Vec::new();

        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("reading schema directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().map(|ext| ext == "yaml" || ext == "yml") == Some(true)
                    && path.file_stem().map(|stem| stem != "summary") == Some(true)
            })
            .collect();
        paths.sort();

        for path in paths {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading schema file {}", path.display()))?;
            let definition: SchemaDefinition = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing schema file {}", path.display()))?;
            tracing::info!(database = %definition.database, path = %path.display(), "Loaded schema");
            definitions.push(definition);
        }

        Self::from_definitions(definitions)
    }

    /// Build a catalog from already-parsed definitions.
    pub fn from_definitions(definitions: Vec<SchemaDefinition>) -> anyhow::Result<Self> {
        let mut schemas = HashMap::new();
        let mut order = Vec::new();

        for definition in definitions {
            let db_id = definition.database.clone();
            if schemas.insert(db_id.clone(), definition).is_some() {
                anyhow::bail!("duplicate schema definition for database '{db_id}'");
            }
            order.push(db_id);
        }

        Ok(Self { schemas, order })
    }

    /// All known database ids, in load order.
    #[must_use]
    pub fn list_databases(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Whether the catalog knows this database id.
    #[must_use]
    pub fn contains(&self, db_id: &str) -> bool {
        self.schemas.contains_key(db_id)
    }

    /// Schema for one database.
    #[must_use]
    pub fn schema_for(&self, db_id: &str) -> Option<&SchemaDefinition> {
        self.schemas.get(db_id)
    }

    /// Whether `table` exists in `db_id`'s schema.
    #[must_use]
    pub fn table_exists(&self, db_id: &str, table: &str) -> bool {
        self.schemas
            .get(db_id)
            .map(|schema| schema.tables.iter().any(|t| t.name == table))
            .unwrap_or(false)
    }

    /// Render schema excerpts for the given databases.
    ///
    /// Unknown ids render a placeholder section rather than failing; the
    /// caller validates ids before anything reaches execution.
    #[must_use]
    pub fn format_for_prompt(&self, db_ids: &[String], mode: PromptMode) -> String {
        let mut out = String::new();

        for db_id in db_ids {
            let Some(schema) = self.schemas.get(db_id) else {
                let _ = writeln!(out, "### {db_id}\n(schema information not available)\n");
                continue;
            };

            let _ = writeln!(out, "### {db_id}");
            if !schema.description.is_empty() {
                let _ = writeln!(out, "{}", schema.description);
            }

            for table in &schema.tables {
                match mode {
                    PromptMode::Planning => Self::format_table_planning(&mut out, db_id, table),
                    PromptMode::Generation => Self::format_table_generation(&mut out, db_id, table),
                }
            }
            let _ = writeln!(out);
        }

        out
    }

    fn format_table_planning(out: &mut String, db_id: &str, table: &TableDef) {
        let _ = writeln!(out, "\n**Table: {db_id}.{}**", table.name);
        if !table.description.is_empty() {
            let _ = writeln!(out, "{}", table.description);
        }

        let shown = table.columns.iter().take(PLANNING_COLUMN_LIMIT);
        let names: Vec<String> = shown
            .map(|col| format!("{} ({})", col.name, col.sql_type))
            .collect();
        let _ = writeln!(out, "Columns: {}", names.join(", "));
        if table.columns.len() > PLANNING_COLUMN_LIMIT {
            let _ = writeln!(
                out,
                "... and {} more columns",
                table.columns.len() - PLANNING_COLUMN_LIMIT
            );
        }

        let fks: Vec<String> = table
            .columns
            .iter()
            .filter_map(|col| {
                col.foreign_key
                    .as_ref()
                    .map(|target| format!("{} -> {target}", col.name))
            })
            .collect();
        if !fks.is_empty() {
            let _ = writeln!(out, "Foreign keys: {}", fks.join("; "));
        }
    }

    fn format_table_generation(out: &mut String, db_id: &str, table: &TableDef) {
        let _ = writeln!(out, "\n**Table: {db_id}.{}**", table.name);
        if !table.description.is_empty() {
            let _ = writeln!(out, "Description: {}", table.description);
        }
        let _ = writeln!(out, "Columns:");

        for col in &table.columns {
            let nullable = if col.nullable { "NULL" } else { "NOT NULL" };
            let _ = writeln!(
                out,
                "  - {} ({}, {}): {}",
                col.name, col.sql_type, nullable, col.description
            );
            if let Some(target) = &col.foreign_key {
                let _ = writeln!(out, "    FK -> {target}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_catalog() -> SchemaCatalog {
        let yaml = r#"
database: customer_db
description: Customer master data
tables:
  - name: customers
    description: One row per customer
    columns:
      - name: id
        type: integer
        nullable: false
        description: Primary key
      - name: full_name
        type: varchar(200)
        nullable: false
        description: Legal name
      - name: segment
        type: varchar(30)
        description: Retail or corporate
  - name: addresses
    description: Customer addresses
    columns:
      - name: customer_id
        type: integer
        nullable: false
        description: Owning customer
        foreign_key: customers.id
      - name: city
        type: varchar(100)
        description: City
"#;
        let definition: SchemaDefinition = serde_yaml::from_str(yaml).unwrap();
        SchemaCatalog::from_definitions(vec![definition]).unwrap()
    }

    #[test]
    fn test_lookup_and_table_existence() {
        let catalog = sample_catalog();
        assert_eq!(catalog.list_databases(), vec!["customer_db".to_string()]);
        assert!(catalog.contains("customer_db"));
        assert!(catalog.table_exists("customer_db", "customers"));
        assert!(!catalog.table_exists("customer_db", "orders"));
        assert!(!catalog.table_exists("unknown_db", "customers"));
    }

    #[test]
    fn test_duplicate_database_is_rejected() {
        let definition: SchemaDefinition = serde_yaml::from_str(
            "database: a\ntables: []\n",
        )
        .unwrap();
        let result = SchemaCatalog::from_definitions(vec![definition.clone(), definition]);
        assert!(result.is_err());
    }

    #[test]
    fn test_planning_mode_summarizes_foreign_keys() {
        let catalog = sample_catalog();
        let text =
            catalog.format_for_prompt(&["customer_db".to_string()], PromptMode::Planning);
        assert!(text.contains("### customer_db"));
        assert!(text.contains("Columns: id (integer), full_name (varchar(200))"));
        assert!(text.contains("customer_id -> customers.id"));
        // Planning mode omits nullability
        assert!(!text.contains("NOT NULL"));
    }

    #[test]
    fn test_generation_mode_lists_nullability_and_fk_targets() {
        let catalog = sample_catalog();
        let text =
            catalog.format_for_prompt(&["customer_db".to_string()], PromptMode::Generation);
        assert!(text.contains("id (integer, NOT NULL)"));
        assert!(text.contains("segment (varchar(30), NULL)"));
        assert!(text.contains("FK -> customers.id"));
    }

    #[test]
    fn test_unknown_database_renders_placeholder() {
        let catalog = sample_catalog();
        let text = catalog.format_for_prompt(&["ghost_db".to_string()], PromptMode::Planning);
        assert!(text.contains("ghost_db"));
        assert!(text.contains("not available"));
    }
}
