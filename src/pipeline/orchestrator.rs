//! Five-stage turn orchestration.
//!
//! One call to [`Orchestrator::process_turn`] drives validate → decide →
//! plan → execute → summarize for a single user question and always
//! resolves to exactly one [`TurnOutcome`]. Semantic refusals (rejection,
//! clarification) are outcomes, not errors; only provider-transport
//! failures and the turn deadline abort the pipeline.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::{PromptMode, SchemaCatalog};
use crate::config::AppConfig;
use crate::datasource::DatasourceManager;
use crate::llm::schemas::{
    ClarificationQuestion, DecisionAction, DecisionResult, QueryPlan, SummaryResult,
    ValidationResult,
};
use crate::llm::LlmClient;
use crate::prompts::PromptRegistry;
use crate::store::{Message, SessionStore};

use super::executor::StepExecutor;
use super::lint::validate_plan;
use super::{run_stage_call, PipelineError, StepResult, TurnOutcome, TurnRecorder};

/// Fallback when the validator rejects without a suggested response.
const DEFAULT_REJECTION: &str =
    "I can only help with questions about the data in the connected databases. \
     Your question appears to be outside this scope.";

/// Rows rendered per step in the summary prompt.
const SUMMARY_ROW_LIMIT: usize = 10;

/// Everything a turn produced, for the transport layer to store and return.
#[derive(Debug)]
pub struct TurnReport {
    /// The single semantic outcome.
    pub outcome: TurnOutcome,
    /// The accepted plan, when one was made.
    pub plan: Option<QueryPlan>,
    /// Step results, when execution ran.
    pub step_results: Vec<StepResult>,
    /// Per-LLM-call records.
    pub stages: Vec<super::StageTrace>,
    /// Whole-turn wall clock in milliseconds.
    pub pipeline_time_ms: u64,
}

/// Drives the question pipeline for single user turns.
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptRegistry>,
    catalog: Arc<SchemaCatalog>,
    datasources: Arc<DatasourceManager>,
    store: Arc<dyn SessionStore>,
    executor: StepExecutor,
    history_window: usize,
    turn_deadline: Duration,
    debug: bool,
}

impl Orchestrator {
    /// Wire the orchestrator over the shared components.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptRegistry>,
        catalog: Arc<SchemaCatalog>,
        datasources: Arc<DatasourceManager>,
        store: Arc<dyn SessionStore>,
        config: &AppConfig,
    ) -> Self {
        let executor = StepExecutor::new(
            llm.clone(),
            prompts.clone(),
            catalog.clone(),
            datasources.clone(),
        );

        Self {
            llm,
            prompts,
            catalog,
            datasources,
            store,
            executor,
            history_window: config.server.history_window,
            turn_deadline: Duration::from_secs(config.server.turn_deadline_secs),
            debug: config.llm.debug,
        }
    }

    /// Process one user turn.
    ///
    /// `history` is the thread's messages before this question was added;
    /// only the most recent window is passed to the prompt stages.
    pub async fn process_turn(
        &self,
        thread_id: &str,
        question: &str,
        history: &[Message],
    ) -> Result<TurnReport, PipelineError> {
        let started = Instant::now();
        let deadline = started + self.turn_deadline;
        let recorder = TurnRecorder::new(self.store.clone(), thread_id, self.debug);

        let sources_text = format_data_sources(&self.datasources, &self.catalog);
        let history_text = self.format_history(history);

        // Stage 1: validate
        let validation = self
            .validate_question(question, &sources_text, &history_text, &recorder)
            .await?;

        if !validation.is_relevant {
            let message = validation
                .suggested_response
                .clone()
                .unwrap_or_else(|| DEFAULT_REJECTION.to_string());
            return Ok(self.finish(TurnOutcome::Rejected { message }, None, Vec::new(), recorder, started));
        }

        // The validator must only name cataloged ids; anything else is a
        // validator fault and the turn is rejected.
        if let Some(unknown) = validation
            .relevant_databases
            .iter()
            .find(|db| !self.catalog.contains(db))
        {
            tracing::error!(
                database = %unknown,
                "Validator returned a database id not present in the catalog"
            );
            return Ok(self.finish(
                TurnOutcome::Rejected {
                    message: DEFAULT_REJECTION.to_string(),
                },
                None,
                Vec::new(),
                recorder,
                started,
            ));
        }

        // Record used databases before any further stage so usage is
        // observable even if the turn fails later. Never aborts the turn.
        if !validation.relevant_databases.is_empty() {
            if let Err(e) = self
                .store
                .add_used_databases(thread_id, &validation.relevant_databases)
                .await
            {
                tracing::warn!(thread_id, error = %e, "Failed to record used databases");
            }
        }

        self.check_deadline(deadline)?;

        // Stage 2: decide
        let decision = self
            .decide_action(question, &validation, &sources_text, &history_text, &recorder)
            .await?;

        match decision.action {
            DecisionAction::AnswerDirectly => {
                let message = decision
                    .message
                    .unwrap_or_else(|| "Hello! Ask me anything about your data.".to_string());
                return Ok(self.finish(TurnOutcome::AnswerDirect { message }, None, Vec::new(), recorder, started));
            }
            DecisionAction::AskClarification => {
                let message = decision
                    .message
                    .unwrap_or_else(|| "Could you clarify your question?".to_string());
                return Ok(self.finish(TurnOutcome::Clarification { message }, None, Vec::new(), recorder, started));
            }
            DecisionAction::Reject => {
                let message = decision
                    .message
                    .unwrap_or_else(|| DEFAULT_REJECTION.to_string());
                return Ok(self.finish(TurnOutcome::Rejected { message }, None, Vec::new(), recorder, started));
            }
            DecisionAction::CreatePlan => {}
        }

        self.check_deadline(deadline)?;

        // Stage 3: plan
        let plan = self
            .create_plan(question, &validation, &history_text, &recorder)
            .await?;

        if plan.needs_clarification {
            let message = format_clarification_questions(&plan.clarification_questions);
            return Ok(self.finish(
                TurnOutcome::Clarification { message },
                Some(plan),
                Vec::new(),
                recorder,
                started,
            ));
        }

        if let Err(e) = validate_plan(&plan, &self.catalog, &self.datasources) {
            tracing::error!(error = %e, "Plan failed structural validation");
            return Ok(self.finish(
                TurnOutcome::PlanError {
                    message: "I could not build a valid query plan for your question. \
                              Please try rephrasing it."
                        .to_string(),
                },
                Some(plan),
                Vec::new(),
                recorder,
                started,
            ));
        }

        // The accepted plan's databases count as used even where the
        // validator missed one.
        let plan_dbs: Vec<String> = plan
            .steps
            .iter()
            .flat_map(|s| s.databases.iter().cloned())
            .collect();
        if let Err(e) = self.store.add_used_databases(thread_id, &plan_dbs).await {
            tracing::warn!(thread_id, error = %e, "Failed to record used databases");
        }

        self.check_deadline(deadline)?;

        // Stage 4: execute
        let results = self
            .executor
            .execute_plan(question, &plan, &recorder)
            .await?;

        if let Some(failed) = results.iter().find(|r| !r.success) {
            let outcome = TurnOutcome::ExecutionError {
                message: "I wasn't able to retrieve the data needed to answer \
                          your question."
                    .to_string(),
                step_number: failed.step_number,
                error: failed
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            };
            return Ok(self.finish(outcome, Some(plan), results, recorder, started));
        }

        self.check_deadline(deadline)?;

        // Stage 5: summarize
        let summary = self
            .write_summary(question, &validation.language, &plan, &results, &recorder)
            .await?;

        let sources = sanitize_sources(&summary, &plan, &results);
        let outcome = TurnOutcome::Answer {
            message: summary.answer,
            confidence: summary.confidence,
            sources,
        };
        Ok(self.finish(outcome, Some(plan), results, recorder, started))
    }

    fn finish(
        &self,
        outcome: TurnOutcome,
        plan: Option<QueryPlan>,
        step_results: Vec<StepResult>,
        recorder: TurnRecorder,
        started: Instant,
    ) -> TurnReport {
        TurnReport {
            outcome,
            plan,
            step_results,
            stages: recorder.into_stages(),
            pipeline_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn check_deadline(&self, deadline: Instant) -> Result<(), PipelineError> {
        if Instant::now() >= deadline {
            tracing::error!("Turn deadline exceeded; not entering further stages");
            return Err(PipelineError::DeadlineExceeded);
        }
        Ok(())
    }

    fn format_history(&self, history: &[Message]) -> String {
        if history.is_empty() {
            return "No previous conversation.".to_string();
        }

        let window = self.history_window * 2;
        let start = history.len().saturating_sub(window);
        let mut out = String::new();
        for message in &history[start..] {
            let _ = writeln!(
                out,
                "{}: {}",
                message.sender.to_string().to_uppercase(),
                message.content
            );
        }
        out.trim_end().to_string()
    }

    async fn validate_question(
        &self,
        question: &str,
        sources_text: &str,
        history_text: &str,
        recorder: &TurnRecorder,
    ) -> Result<ValidationResult, PipelineError> {
        let template = self.prompts.get("validate_question")?;
        run_stage_call::<ValidationResult>(
            self.llm.as_ref(),
            template,
            &[],
            &[
                ("question", question),
                ("data_sources", sources_text),
                ("conversation_history", history_text),
            ],
            ValidationResult::tool_spec(),
            "validation",
            None,
            None,
            recorder,
        )
        .await
    }

    async fn decide_action(
        &self,
        question: &str,
        validation: &ValidationResult,
        sources_text: &str,
        history_text: &str,
        recorder: &TurnRecorder,
    ) -> Result<DecisionResult, PipelineError> {
        let template = self.prompts.get("decide_action")?;
        let is_relevant = validation.is_relevant.to_string();
        let relevant_databases = validation.relevant_databases.join(", ");

        run_stage_call::<DecisionResult>(
            self.llm.as_ref(),
            template,
            &[],
            &[
                ("question", question),
                ("is_relevant", &is_relevant),
                ("relevant_databases", &relevant_databases),
                ("validation_reasoning", &validation.reasoning),
                ("language", &validation.language),
                ("data_sources", sources_text),
                ("conversation_history", history_text),
            ],
            DecisionResult::tool_spec(),
            "decision",
            None,
            None,
            recorder,
        )
        .await
    }

    async fn create_plan(
        &self,
        question: &str,
        validation: &ValidationResult,
        history_text: &str,
        recorder: &TurnRecorder,
    ) -> Result<QueryPlan, PipelineError> {
        let template = self.prompts.get("create_plan")?;
        let relevant_databases = validation.relevant_databases.join(", ");
        let schemas = self
            .catalog
            .format_for_prompt(&validation.relevant_databases, PromptMode::Planning);

        run_stage_call::<QueryPlan>(
            self.llm.as_ref(),
            template,
            &[],
            &[
                ("question", question),
                ("relevant_databases", &relevant_databases),
                ("database_schemas", &schemas),
                ("language", &validation.language),
                ("conversation_history", history_text),
            ],
            QueryPlan::tool_spec(),
            "planning",
            None,
            None,
            recorder,
        )
        .await
    }

    async fn write_summary(
        &self,
        question: &str,
        language: &str,
        plan: &QueryPlan,
        results: &[StepResult],
        recorder: &TurnRecorder,
    ) -> Result<SummaryResult, PipelineError> {
        let template = self.prompts.get("write_summary")?;
        let execution_results = format_execution_results(plan, results);

        run_stage_call::<SummaryResult>(
            self.llm.as_ref(),
            template,
            &[],
            &[
                ("original_question", question),
                ("language", language),
                ("plan_summary", &plan.summary),
                ("execution_results", &execution_results),
            ],
            SummaryResult::tool_spec(),
            "summary",
            None,
            None,
            recorder,
        )
        .await
    }
}

/// Data-source listing for prompts: `- Name (id): description`.
fn format_data_sources(datasources: &DatasourceManager, catalog: &SchemaCatalog) -> String {
    let infos = datasources.list_sources();
    if infos.is_empty() {
        // Fall back to the schema catalog when no summary entries exist.
        return catalog
            .list_databases()
            .iter()
            .map(|db| format!("- {db}"))
            .collect::<Vec<_>>()
            .join("\n");
    }

    infos
        .iter()
        .map(|info| format!("- {} ({}): {}", info.name, info.id, info.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Numbered clarification list for the user.
fn format_clarification_questions(questions: &[ClarificationQuestion]) -> String {
    let mut lines = vec!["I need some clarification to answer your question:".to_string()];
    for (i, q) in questions.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, q.question));
    }
    lines.join("\n")
}

/// Render execution results for the summary prompt: scalars inline, tables
/// as markdown capped at [`SUMMARY_ROW_LIMIT`] rows.
fn format_execution_results(plan: &QueryPlan, results: &[StepResult]) -> String {
    let mut out = String::new();

    for result in results {
        let step = plan
            .steps
            .iter()
            .find(|s| s.step_number == result.step_number);

        let _ = write!(out, "\n**Step {}**", result.step_number);
        if let Some(step) = step {
            let _ = write!(out, "\nDescription: {}", step.description);
        }
        let _ = write!(
            out,
            "\nStatus: {}",
            if result.success { "success" } else { "failed" }
        );

        if result.success {
            if let Some(value) = &result.result_value {
                let _ = write!(out, "\nResult: {value}");
            } else if let Some(rows) = &result.result_data {
                let _ = write!(out, "\nRows returned: {}", rows.len());
                if let Some(first) = rows.first() {
                    let columns: Vec<&str> = first.keys().map(String::as_str).collect();
                    let _ = write!(out, "\n| {} |", columns.join(" | "));
                    let _ = write!(out, "\n|{}|", vec!["---"; columns.len()].join("|"));
                    for row in rows.iter().take(SUMMARY_ROW_LIMIT) {
                        let cells: Vec<String> = columns
                            .iter()
                            .map(|c| {
                                row.get(*c)
                                    .map(|v| match v {
                                        serde_json::Value::String(s) => s.clone(),
                                        other => other.to_string(),
                                    })
                                    .unwrap_or_default()
                            })
                            .collect();
                        let _ = write!(out, "\n| {} |", cells.join(" | "));
                    }
                    if rows.len() > SUMMARY_ROW_LIMIT {
                        let _ =
                            write!(out, "\n... and {} more rows", rows.len() - SUMMARY_ROW_LIMIT);
                    }
                }
            }
            if let Some(sql) = &result.sql {
                let _ = write!(out, "\nSQL executed: ```sql\n{sql}\n```");
            }
        } else if let Some(error) = &result.error {
            let _ = write!(out, "\nError: {error}");
        }
        let _ = writeln!(out);
    }

    out
}

/// Keep only reported sources that executed steps actually read; fall back
/// to the executed set when the model reports none.
fn sanitize_sources(summary: &SummaryResult, plan: &QueryPlan, results: &[StepResult]) -> Vec<String> {
    let mut executed: Vec<String> = Vec::new();
    for result in results {
        if let Some(step) = plan.steps.iter().find(|s| s.step_number == result.step_number) {
            for db in &step.databases {
                if !executed.contains(db) {
                    executed.push(db.clone());
                }
            }
        }
    }
    executed.sort();

    let mut sources: Vec<String> = summary
        .data_sources_used
        .iter()
        .filter(|db| executed.contains(db))
        .cloned()
        .collect();
    sources.sort();
    sources.dedup();

    if sources.is_empty() {
        executed
    } else {
        sources
    }
}
