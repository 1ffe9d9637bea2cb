//! Structural validation of query plans.
//!
//! A plan is linted before any SQL is generated: step numbering, database
//! ids, table names, dependency ordering, and per-step datasource scope are
//! all checked here. A violation resolves the turn as `plan_error` and
//! never reaches the executor.

use crate::catalog::SchemaCatalog;
use crate::datasource::DatasourceManager;
use crate::llm::schemas::QueryPlan;

/// A structural plan violation.
#[derive(Debug, thiserror::Error)]
pub enum PlanLintError {
    /// The plan has no steps.
    #[error("plan contains no steps")]
    NoSteps,
    /// Step numbers are not contiguous 1..N.
    #[error("step numbers are not contiguous starting at 1 (found {0} at position {1})")]
    NonContiguousSteps(u32, usize),
    /// A step names no databases.
    #[error("step {0} names no databases")]
    NoDatabases(u32),
    /// A step references a db id missing from the catalog.
    #[error("step {step} references unknown database '{database}'")]
    UnknownDatabase {
        /// The offending step.
        step: u32,
        /// The unknown id.
        database: String,
    },
    /// A step references a table not present in any of its databases.
    #[error("step {step} references table '{table}' not found in its databases")]
    UnknownTable {
        /// The offending step.
        step: u32,
        /// The unknown table.
        table: String,
    },
    /// A dependency does not reference a strictly lower step number.
    #[error("step {step} depends on step {dependency}, which is not strictly earlier")]
    InvalidDependency {
        /// The offending step.
        step: u32,
        /// The invalid dependency.
        dependency: u32,
    },
    /// A step's databases resolve to more than one datasource.
    #[error("step {step}: {source}")]
    ScopeViolation {
        /// The offending step.
        step: u32,
        /// The underlying scope error.
        source: crate::datasource::ScopeError,
    },
}

/// Lint a plan against the catalog and datasource mapping.
pub fn validate_plan(
    plan: &QueryPlan,
    catalog: &SchemaCatalog,
    datasources: &DatasourceManager,
) -> Result<(), PlanLintError> {
    if plan.steps.is_empty() {
        return Err(PlanLintError::NoSteps);
    }

    for (index, step) in plan.steps.iter().enumerate() {
        let expected = (index + 1) as u32;
        if step.step_number != expected {
            return Err(PlanLintError::NonContiguousSteps(step.step_number, index));
        }

        if step.databases.is_empty() {
            return Err(PlanLintError::NoDatabases(step.step_number));
        }

        for db_id in &step.databases {
            if !catalog.contains(db_id) {
                return Err(PlanLintError::UnknownDatabase {
                    step: step.step_number,
                    database: db_id.clone(),
                });
            }
        }

        for table in &step.tables {
            let found = step
                .databases
                .iter()
                .any(|db_id| catalog.table_exists(db_id, table));
            if !found {
                return Err(PlanLintError::UnknownTable {
                    step: step.step_number,
                    table: table.clone(),
                });
            }
        }

        for &dependency in &step.depends_on_steps {
            if dependency == 0 || dependency >= step.step_number {
                return Err(PlanLintError::InvalidDependency {
                    step: step.step_number,
                    dependency,
                });
            }
        }

        datasources
            .validate_scope(&step.databases)
            .map_err(|source| PlanLintError::ScopeViolation {
                step: step.step_number,
                source,
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SchemaDefinition;
    use crate::datasource::{DataSourceInfo, Datasource, QueryResult};
    use crate::llm::schemas::{PlanStep, StepOperation};
    use std::sync::Arc;

    struct StubSource {
        name: String,
        db: String,
    }

    #[async_trait::async_trait]
    impl Datasource for StubSource {
        fn name(&self) -> &str {
            &self.name
        }
        fn database(&self) -> &str {
            &self.db
        }
        async fn execute(&self, _sql: &str) -> QueryResult {
            QueryResult::ok(Vec::new(), Vec::new(), 0)
        }
        async fn ping(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    fn catalog() -> SchemaCatalog {
        let customer: SchemaDefinition = serde_yaml::from_str(
            r#"
database: customer_db
tables:
  - name: customers
    columns:
      - name: id
        type: integer
"#,
        )
        .unwrap();
        let accounts: SchemaDefinition = serde_yaml::from_str(
            r#"
database: accounts_db
tables:
  - name: accounts
    columns:
      - name: customer_id
        type: integer
"#,
        )
        .unwrap();
        SchemaCatalog::from_definitions(vec![customer, accounts]).unwrap()
    }

    fn datasources() -> DatasourceManager {
        let sources: Vec<Arc<dyn Datasource>> = vec![
            Arc::new(StubSource {
                name: "core_banking".into(),
                db: "customer_db".into(),
            }),
            Arc::new(StubSource {
                name: "accounts_store".into(),
                db: "accounts_db".into(),
            }),
        ];
        DatasourceManager::from_parts(sources, Vec::<DataSourceInfo>::new()).unwrap()
    }

    fn step(number: u32, databases: &[&str], tables: &[&str]) -> PlanStep {
        PlanStep {
            step_number: number,
            description: format!("step {number}"),
            databases: databases.iter().map(|s| s.to_string()).collect(),
            tables: tables.iter().map(|s| s.to_string()).collect(),
            operation: StepOperation::Lookup,
            depends_on_steps: Vec::new(),
        }
    }

    fn plan(steps: Vec<PlanStep>) -> QueryPlan {
        QueryPlan {
            summary: "test".into(),
            language: "en".into(),
            steps,
            needs_clarification: false,
            clarification_questions: Vec::new(),
        }
    }

    #[test]
    fn test_valid_two_step_plan_passes() {
        let mut second = step(2, &["customer_db"], &["customers"]);
        second.depends_on_steps = vec![1];
        let plan = plan(vec![step(1, &["accounts_db"], &["accounts"]), second]);
        assert!(validate_plan(&plan, &catalog(), &datasources()).is_ok());
    }

    #[test]
    fn test_empty_plan_fails() {
        let plan = plan(Vec::new());
        assert!(matches!(
            validate_plan(&plan, &catalog(), &datasources()),
            Err(PlanLintError::NoSteps)
        ));
    }

    #[test]
    fn test_non_contiguous_numbering_fails() {
        let plan = plan(vec![
            step(1, &["customer_db"], &["customers"]),
            step(3, &["customer_db"], &["customers"]),
        ]);
        assert!(matches!(
            validate_plan(&plan, &catalog(), &datasources()),
            Err(PlanLintError::NonContiguousSteps(3, 1))
        ));
    }

    #[test]
    fn test_unknown_database_fails() {
        let plan = plan(vec![step(1, &["ghost_db"], &[])]);
        assert!(matches!(
            validate_plan(&plan, &catalog(), &datasources()),
            Err(PlanLintError::UnknownDatabase { .. })
        ));
    }

    #[test]
    fn test_table_must_exist_in_a_step_database() {
        let plan = plan(vec![step(1, &["customer_db"], &["accounts"])]);
        assert!(matches!(
            validate_plan(&plan, &catalog(), &datasources()),
            Err(PlanLintError::UnknownTable { .. })
        ));
    }

    #[test]
    fn test_dependency_must_be_strictly_earlier() {
        let mut first = step(1, &["customer_db"], &["customers"]);
        first.depends_on_steps = vec![1];
        let plan = plan(vec![first]);
        assert!(matches!(
            validate_plan(&plan, &catalog(), &datasources()),
            Err(PlanLintError::InvalidDependency { .. })
        ));
    }

    #[test]
    fn test_step_spanning_datasources_fails() {
        let plan = plan(vec![step(
            1,
            &["customer_db", "accounts_db"],
            &["customers", "accounts"],
        )]);
        assert!(matches!(
            validate_plan(&plan, &catalog(), &datasources()),
            Err(PlanLintError::ScopeViolation { .. })
        ));
    }
}
