//! The five-stage question pipeline.
//!
//! The [`orchestrator`] drives validate → decide → plan → execute →
//! summarize for one user turn; the [`executor`] runs individual plan steps
//! through the agentic generate/run/analyze loop; [`lint`] structurally
//! validates plans before any SQL is generated.

pub mod executor;
pub mod lint;
pub mod orchestrator;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::llm::schemas::Confidence;
use crate::llm::{call_structured, CallUsage, LlmClient, LlmError, StructuredRequest, ToolSpec};
use crate::prompts::PromptTemplate;
use crate::store::SessionStore;

/// Hard failures that abort the turn without a semantic outcome.
///
/// These map to a transport-level error; no server message is stored.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// An LLM call failed outright.
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),
    /// The turn's overall deadline expired between stages.
    #[error("turn deadline exceeded")]
    DeadlineExceeded,
    /// A misconfigured component surfaced mid-turn.
    #[error("internal pipeline error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// The semantic result of one completed turn. Exactly one per turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The question is out of scope.
    Rejected {
        /// User-visible reason.
        message: String,
    },
    /// The pipeline needs more information from the user.
    Clarification {
        /// Question(s) back to the user.
        message: String,
    },
    /// Answered without touching a database (greeting, meta).
    AnswerDirect {
        /// Answer text.
        message: String,
    },
    /// A plan was executed and summarized.
    Answer {
        /// Answer text, in the user's language.
        message: String,
        /// Summarizer's self-reported reliability.
        confidence: Confidence,
        /// Database ids the answer is derived from.
        sources: Vec<String>,
    },
    /// Planning failed structurally.
    PlanError {
        /// User-visible reason.
        message: String,
    },
    /// A step exhausted its retries or hit a non-recoverable error.
    ExecutionError {
        /// User-visible message.
        message: String,
        /// The failing step.
        step_number: u32,
        /// Categorized error text.
        error: String,
    },
}

impl TurnOutcome {
    /// The user-visible message for this outcome.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Rejected { message }
            | Self::Clarification { message }
            | Self::AnswerDirect { message }
            | Self::Answer { message, .. }
            | Self::PlanError { message }
            | Self::ExecutionError { message, .. } => message,
        }
    }
}

/// Result of executing one plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// The step this result belongs to.
    pub step_number: u32,
    /// Whether the step produced data.
    pub success: bool,
    /// Final SQL (or the last attempted statement on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// Scalar result, when the query returned a single value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_value: Option<String>,
    /// Tabular result, column order preserved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    /// Error text on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts consumed (1..=MAX_RETRY).
    pub attempts: u32,
}

/// One LLM call's debug record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTrace {
    /// Pipeline stage name.
    pub stage: String,
    /// Step number, for executor calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    /// Attempt number, for error-analysis calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Model tier.
    pub tier: String,
    /// Concrete model id, when the provider reported it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Prompt tokens.
    pub input_tokens: u32,
    /// Completion tokens.
    pub output_tokens: u32,
    /// Call wall-clock in milliseconds.
    pub elapsed_ms: u64,
    /// Full system prompt (debug flag only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Full rendered user prompt (debug flag only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
    /// Structured response (debug flag only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

/// Per-turn accounting: token usage into the session store after every
/// successful LLM call, plus the stage trace list for message metadata.
pub struct TurnRecorder {
    store: Arc<dyn SessionStore>,
    thread_id: String,
    debug: bool,
    stages: Mutex<Vec<StageTrace>>,
}

impl TurnRecorder {
    /// Create a recorder for one turn.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, thread_id: &str, debug: bool) -> Self {
        Self {
            store,
            thread_id: thread_id.to_string(),
            debug,
            stages: Mutex::new(Vec::new()),
        }
    }

    /// Whether full prompts/responses are being traced.
    #[must_use]
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Record one successful LLM call.
    ///
    /// A failed token-usage write is logged and swallowed; accounting must
    /// never abort the pipeline.
    pub async fn record(
        &self,
        stage: &str,
        step: Option<u32>,
        attempt: Option<u32>,
        tier: &str,
        usage: &CallUsage,
        exchange: Option<(String, String, serde_json::Value)>,
    ) {
        if let Err(e) = self
            .store
            .add_token_usage(
                &self.thread_id,
                u64::from(usage.input_tokens),
                u64::from(usage.output_tokens),
            )
            .await
        {
            tracing::warn!(thread_id = %self.thread_id, error = %e, "Failed to record token usage");
        }

        let (system_prompt, user_prompt, response) = match (self.debug, exchange) {
            (true, Some((system, user, response))) => (Some(system), Some(user), Some(response)),
            _ => (None, None, None),
        };

        self.stages.lock().push(StageTrace {
            stage: stage.to_string(),
            step,
            attempt,
            tier: tier.to_string(),
            model: usage.model.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            elapsed_ms: usage.elapsed_ms,
            system_prompt,
            user_prompt,
            response,
        });
    }

    /// Take the accumulated stage traces.
    #[must_use]
    pub fn into_stages(self) -> Vec<StageTrace> {
        self.stages.into_inner()
    }
}

/// Render a template, run a structured LLM call, and record it.
pub(crate) async fn run_stage_call<T>(
    llm: &dyn LlmClient,
    template: &PromptTemplate,
    system_vars: &[(&str, &str)],
    user_vars: &[(&str, &str)],
    tool: ToolSpec,
    stage: &'static str,
    step: Option<u32>,
    attempt: Option<u32>,
    recorder: &TurnRecorder,
) -> Result<T, PipelineError>
where
    T: DeserializeOwned + Serialize,
{
    let system_prompt = template.render_system_prompt(system_vars);
    let user_prompt = template.render_user_prompt(user_vars);

    let request = StructuredRequest {
        tier: template.model,
        temperature: template.temperature,
        system_prompt: system_prompt.clone(),
        user_prompt: user_prompt.clone(),
        tool,
    };

    let (value, usage) = call_structured::<T>(llm, request).await?;

    let exchange = recorder.debug().then(|| {
        (
            system_prompt,
            user_prompt,
            serde_json::to_value(&value).unwrap_or_default(),
        )
    });
    recorder
        .record(
            stage,
            step,
            attempt,
            &template.model.to_string(),
            &usage,
            exchange,
        )
        .await;

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_recorder_accumulates_usage_and_traces() {
        let store = Arc::new(MemoryStore::new());
        let thread = store.create_thread("t").await;
        let recorder = TurnRecorder::new(store.clone(), &thread.id, false);

        let usage = CallUsage {
            input_tokens: 100,
            output_tokens: 20,
            elapsed_ms: 5,
            model: Some("model-x".into()),
        };
        recorder
            .record("validation", None, None, "weak", &usage, None)
            .await;
        recorder
            .record("decision", None, None, "planning", &usage, None)
            .await;

        let totals = store.get_token_usage(&thread.id).await.unwrap();
        assert_eq!(totals.input_tokens, 200);
        assert_eq!(totals.call_count, 2);

        let stages = recorder.into_stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].stage, "validation");
        assert!(stages[0].system_prompt.is_none());
    }

    #[tokio::test]
    async fn test_recorder_survives_unknown_thread() {
        let store = Arc::new(MemoryStore::new());
        let recorder = TurnRecorder::new(store, "missing", false);
        recorder
            .record("validation", None, None, "weak", &CallUsage::default(), None)
            .await;
        assert_eq!(recorder.into_stages().len(), 1);
    }

    #[tokio::test]
    async fn test_debug_recorder_keeps_prompts() {
        let store = Arc::new(MemoryStore::new());
        let thread = store.create_thread("t").await;
        let recorder = TurnRecorder::new(store, &thread.id, true);

        recorder
            .record(
                "planning",
                None,
                None,
                "planning",
                &CallUsage::default(),
                Some((
                    "system".to_string(),
                    "user".to_string(),
                    serde_json::json!({"summary": "plan"}),
                )),
            )
            .await;

        let stages = recorder.into_stages();
        assert_eq!(stages[0].system_prompt.as_deref(), Some("system"));
        assert_eq!(stages[0].response.as_ref().unwrap()["summary"], "plan");
    }

    #[test]
    fn test_outcome_serializes_with_type_tag() {
        let outcome = TurnOutcome::Answer {
            message: "We have 42 customers.".into(),
            confidence: Confidence::High,
            sources: vec!["customer_db".into()],
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["confidence"], "high");

        let outcome = TurnOutcome::ExecutionError {
            message: "failed".into(),
            step_number: 2,
            error: "non-recoverable (connection): unreachable".into(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["type"], "execution_error");
        assert_eq!(value["step_number"], 2);
    }
}
