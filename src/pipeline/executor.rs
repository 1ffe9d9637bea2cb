//! Agentic execution of plan steps.
//!
//! Each step runs a generate → execute → analyze → retry loop under a fixed
//! attempt budget. SQL failures stay inside the loop; only the immediately
//! preceding failed attempt is forwarded to the error analyzer, which keeps
//! analysis prompts bounded regardless of how many retries a step burns.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::catalog::{PromptMode, SchemaCatalog};
use crate::datasource::DatasourceManager;
use crate::llm::schemas::{ErrorAnalysisResult, PlanStep, QueryPlan, SqlGenerationResult};
use crate::llm::LlmClient;
use crate::prompts::PromptRegistry;

use super::{run_stage_call, PipelineError, StepResult, TurnRecorder};

/// Attempts allowed per step, generation included.
pub const MAX_RETRY: u32 = 5;

/// Sample rows shown when summarizing a prior tabular result.
const SAMPLE_ROWS: usize = 3;

/// Executes query plan steps with model-guided error recovery.
pub struct StepExecutor {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptRegistry>,
    catalog: Arc<SchemaCatalog>,
    datasources: Arc<DatasourceManager>,
}

impl StepExecutor {
    /// Create an executor over the shared components.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptRegistry>,
        catalog: Arc<SchemaCatalog>,
        datasources: Arc<DatasourceManager>,
    ) -> Self {
        Self {
            llm,
            prompts,
            catalog,
            datasources,
        }
    }

    /// Execute all plan steps in order, stopping at the first failure.
    pub async fn execute_plan(
        &self,
        question: &str,
        plan: &QueryPlan,
        recorder: &TurnRecorder,
    ) -> Result<Vec<StepResult>, PipelineError> {
        let mut results: Vec<StepResult> = Vec::new();

        for step in &plan.steps {
            tracing::info!(
                step = step.step_number,
                total = plan.steps.len(),
                "Executing plan step"
            );

            let result = self
                .execute_step(question, step, &results, recorder)
                .await?;
            let failed = !result.success;
            results.push(result);

            if failed {
                tracing::error!(step = step.step_number, "Step failed, stopping execution");
                break;
            }
        }

        Ok(results)
    }

    /// Run one step through the retry loop.
    async fn execute_step(
        &self,
        question: &str,
        step: &PlanStep,
        prior: &[StepResult],
        recorder: &TurnRecorder,
    ) -> Result<StepResult, PipelineError> {
        let generation = self.generate_sql(question, step, prior, recorder).await?;
        let mut current_sql = generation.sql;
        let mut database = generation.database;

        // (sql, error) of the most recent analyzed failure
        let mut last_attempt: Option<(String, String)> = None;

        for attempt in 1..=MAX_RETRY {
            let query = self.datasources.execute(&current_sql, &database).await;

            if query.success {
                tracing::info!(step = step.step_number, attempt, "Step executed successfully");
                return Ok(shape_result(step.step_number, current_sql, query, attempt));
            }

            let error_text = query
                .error
                .unwrap_or_else(|| "query failed without an error message".to_string());
            tracing::warn!(
                step = step.step_number,
                attempt,
                error = %error_text,
                "Step attempt failed"
            );

            if attempt == MAX_RETRY {
                return Ok(StepResult {
                    step_number: step.step_number,
                    success: false,
                    sql: Some(current_sql),
                    result_value: None,
                    result_data: None,
                    error: Some(format!(
                        "failed after {MAX_RETRY} attempts; last error: {error_text}"
                    )),
                    attempts: MAX_RETRY,
                });
            }

            let analysis = self
                .analyze_error(
                    question,
                    step,
                    &current_sql,
                    &error_text,
                    attempt,
                    last_attempt.as_ref(),
                    recorder,
                )
                .await?;

            if !analysis.is_recoverable {
                return Ok(StepResult {
                    step_number: step.step_number,
                    success: false,
                    sql: Some(current_sql),
                    result_value: None,
                    result_data: None,
                    error: Some(format!(
                        "non-recoverable ({}): {}",
                        analysis.category, analysis.reasoning
                    )),
                    attempts: attempt,
                });
            }

            let Some(suggested) = analysis.suggested_sql else {
                // Recoverable without a correction cannot make progress.
                return Ok(StepResult {
                    step_number: step.step_number,
                    success: false,
                    sql: Some(current_sql),
                    result_value: None,
                    result_data: None,
                    error: Some(format!(
                        "error analysis provided no corrected SQL: {}",
                        analysis.reasoning
                    )),
                    attempts: attempt,
                });
            };

            last_attempt = Some((current_sql, error_text));
            current_sql = suggested;
            if let Some(target) = analysis.target_database {
                database = target;
            }
        }

        Ok(StepResult {
            step_number: step.step_number,
            success: false,
            sql: Some(current_sql),
            result_value: None,
            result_data: None,
            error: Some("maximum retry attempts exceeded".to_string()),
            attempts: MAX_RETRY,
        })
    }

    async fn generate_sql(
        &self,
        question: &str,
        step: &PlanStep,
        prior: &[StepResult],
        recorder: &TurnRecorder,
    ) -> Result<SqlGenerationResult, PipelineError> {
        let template = self.prompts.get("generate_sql")?;

        let schemas = self
            .catalog
            .format_for_prompt(&step.databases, PromptMode::Generation);
        let previous = format_prior_results(select_prior_results(prior, step));

        let step_number = step.step_number.to_string();
        let databases = step.databases.join(", ");
        let tables = step.tables.join(", ");
        let operation = step.operation.to_string();

        run_stage_call::<SqlGenerationResult>(
            self.llm.as_ref(),
            template,
            &[("database_schemas", &schemas)],
            &[
                ("original_question", question),
                ("step_number", &step_number),
                ("step_description", &step.description),
                ("step_databases", &databases),
                ("step_tables", &tables),
                ("step_operation", &operation),
                ("previous_results", &previous),
                ("database_schemas", &schemas),
            ],
            SqlGenerationResult::tool_spec(),
            "sql_generation",
            Some(step.step_number),
            None,
            recorder,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn analyze_error(
        &self,
        question: &str,
        step: &PlanStep,
        failed_sql: &str,
        error_message: &str,
        attempt: u32,
        last_attempt: Option<&(String, String)>,
        recorder: &TurnRecorder,
    ) -> Result<ErrorAnalysisResult, PipelineError> {
        let template = self.prompts.get("analyze_error")?;

        let schemas = self
            .catalog
            .format_for_prompt(&step.databases, PromptMode::Generation);
        let previous_attempt = format_last_attempt(last_attempt);

        let step_number = step.step_number.to_string();
        let attempt_number = attempt.to_string();

        run_stage_call::<ErrorAnalysisResult>(
            self.llm.as_ref(),
            template,
            &[("database_schemas", &schemas)],
            &[
                ("original_question", question),
                ("step_number", &step_number),
                ("step_description", &step.description),
                ("failed_sql", failed_sql),
                ("error_message", error_message),
                ("attempt_number", &attempt_number),
                ("previous_attempt", &previous_attempt),
            ],
            ErrorAnalysisResult::tool_spec(),
            "error_analysis",
            Some(step.step_number),
            Some(attempt),
            recorder,
        )
        .await
    }
}

/// Results visible to a step: its declared dependencies, or everything so
/// far when it declares none.
fn select_prior_results<'a>(prior: &'a [StepResult], step: &PlanStep) -> Vec<&'a StepResult> {
    if step.depends_on_steps.is_empty() {
        prior.iter().collect()
    } else {
        prior
            .iter()
            .filter(|r| step.depends_on_steps.contains(&r.step_number))
            .collect()
    }
}

/// Compact rendering of prior step results for the generation prompt.
///
/// Scalars are shown inline; tables as a short sample plus row count. The
/// generator decides whether to re-query or lift literal keys from these.
fn format_prior_results(results: Vec<&StepResult>) -> String {
    if results.is_empty() {
        return "No previous results available.".to_string();
    }

    let mut out = String::from("Previous step results:");
    for result in results {
        let _ = write!(out, "\n\nStep {}:", result.step_number);
        let _ = write!(out, "\nSuccess: {}", result.success);

        if result.success {
            if let Some(value) = &result.result_value {
                let _ = write!(out, "\nResult: {value}");
            } else if let Some(rows) = &result.result_data {
                let _ = write!(out, "\nRows returned: {}", rows.len());
                if !rows.is_empty() {
                    let _ = write!(out, "\nSample data:");
                    for (i, row) in rows.iter().take(SAMPLE_ROWS).enumerate() {
                        let rendered = serde_json::to_string(row).unwrap_or_default();
                        let _ = write!(out, "\n  Row {}: {rendered}", i + 1);
                    }
                    if rows.len() > SAMPLE_ROWS {
                        let _ = write!(out, "\n  ... and {} more rows", rows.len() - SAMPLE_ROWS);
                    }
                }
            }
        } else if let Some(error) = &result.error {
            let _ = write!(out, "\nError: {error}");
        }
    }

    out
}

/// The immediately preceding attempt for the analyzer, or a first-attempt
/// marker.
fn format_last_attempt(last: Option<&(String, String)>) -> String {
    match last {
        Some((sql, error)) => {
            format!("Previous SQL:\n{sql}\n\nPrevious error:\n{error}")
        }
        None => "This is the first attempt.".to_string(),
    }
}

/// Decide the result shape: a 1x1 result set is stored as a scalar string,
/// anything else as rows.
fn shape_result(
    step_number: u32,
    sql: String,
    query: crate::datasource::QueryResult,
    attempts: u32,
) -> StepResult {
    let rows = query.rows.unwrap_or_default();

    let (result_value, result_data) = if rows.len() == 1 && rows[0].len() == 1 {
        let value = rows[0]
            .values()
            .next()
            .map(display_value)
            .unwrap_or_default();
        (Some(value), None)
    } else if rows.is_empty() {
        (None, None)
    } else {
        (None, Some(rows))
    };

    StepResult {
        step_number,
        success: true,
        sql: Some(sql),
        result_value,
        result_data,
        error: None,
        attempts,
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
