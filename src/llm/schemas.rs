//! Structured response types for the pipeline stages.
//!
//! Each stage declares its response shape as a tool the model is forced to
//! call; the schemas here are the tool inputs. Shapes are deliberately
//! flat so that a reasoning model fills them reliably.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::ToolSpec;
use crate::datasource::ErrorCategory;

/// Result of question validation against the data-source catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the question can be answered from the catalog.
    pub is_relevant: bool,
    /// Why the question is or is not relevant.
    pub reasoning: String,
    /// BCP-47-ish language tag of the question (e.g., `en`, `de`).
    #[serde(default = "default_language")]
    pub language: String,
    /// Suggested user-facing response when not relevant.
    #[serde(default)]
    pub suggested_response: Option<String>,
    /// Catalog db ids relevant to the question.
    #[serde(default)]
    pub relevant_databases: Vec<String>,
}

fn default_language() -> String {
    "en".to_string()
}

impl ValidationResult {
    /// Tool declaration for the validation stage.
    #[must_use]
    pub fn tool_spec() -> ToolSpec {
        ToolSpec {
            name: "provide_validation_result".to_string(),
            description: "Report whether the question is answerable from the data sources"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "is_relevant": {
                        "type": "boolean",
                        "description": "Whether the question is relevant to the available data sources"
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "Explanation of why the question is or isn't relevant"
                    },
                    "language": {
                        "type": "string",
                        "description": "Language tag of the user's question, e.g. 'en' or 'de'"
                    },
                    "suggested_response": {
                        "type": "string",
                        "description": "Suggested response if the question is not relevant"
                    },
                    "relevant_databases": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Database ids (from the listed catalog) relevant to the question"
                    }
                },
                "required": ["is_relevant", "reasoning", "language"]
            }),
        }
    }
}

/// The decider's verdict on how to handle the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    /// Answer without touching any database (greetings, meta questions).
    AnswerDirectly,
    /// Ask the user for missing detail.
    AskClarification,
    /// Build and execute a query plan.
    CreatePlan,
    /// Refuse the question.
    Reject,
}

/// Decision on what action to take next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResult {
    /// The chosen action.
    pub action: DecisionAction,
    /// Why this action was chosen.
    pub reasoning: String,
    /// User-facing message for terminal actions.
    #[serde(default)]
    pub message: Option<String>,
}

impl DecisionResult {
    /// Tool declaration for the decide stage.
    #[must_use]
    pub fn tool_spec() -> ToolSpec {
        ToolSpec {
            name: "provide_decision".to_string(),
            description: "Choose how to handle the user's question".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["answer_directly", "ask_clarification", "create_plan", "reject"],
                        "description": "The action to take"
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "Why this action was chosen"
                    },
                    "message": {
                        "type": "string",
                        "description": "Message to the user, required for answer_directly, ask_clarification, and reject"
                    }
                },
                "required": ["action", "reasoning"]
            }),
        }
    }
}

/// Kind of work one plan step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOperation {
    /// Fetch rows by key or predicate.
    Lookup,
    /// GROUP BY / COUNT / SUM style work.
    Aggregation,
    /// Join tables within one database.
    Join,
    /// Narrow a prior result set.
    Filter,
    /// Order a result set.
    Sort,
    /// Anything else.
    Other,
}

impl std::fmt::Display for StepOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lookup => write!(f, "lookup"),
            Self::Aggregation => write!(f, "aggregation"),
            Self::Join => write!(f, "join"),
            Self::Filter => write!(f, "filter"),
            Self::Sort => write!(f, "sort"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// One step of a query plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Sequential step number starting at 1.
    pub step_number: u32,
    /// What this step does.
    pub description: String,
    /// Database ids this step reads. All must live in one datasource.
    pub databases: Vec<String>,
    /// Tables this step touches.
    pub tables: Vec<String>,
    /// Kind of operation.
    pub operation: StepOperation,
    /// Step numbers this step consumes results from; all strictly lower.
    #[serde(default)]
    pub depends_on_steps: Vec<u32>,
}

/// A clarification question for the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    /// The question to ask.
    pub question: String,
    /// Why this clarification is needed.
    pub reason: String,
}

/// Complete plan to answer the user's question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    /// High-level summary of the approach.
    pub summary: String,
    /// Language tag of the user's question.
    #[serde(default = "default_language")]
    pub language: String,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    /// Whether the planner needs more information first.
    #[serde(default)]
    pub needs_clarification: bool,
    /// Questions to ask when clarification is needed.
    #[serde(default)]
    pub clarification_questions: Vec<ClarificationQuestion>,
}

impl QueryPlan {
    /// Tool declaration for the planning stage.
    #[must_use]
    pub fn tool_spec() -> ToolSpec {
        ToolSpec {
            name: "provide_query_plan".to_string(),
            description: "Provide the step-by-step plan to answer the question".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "summary": {
                        "type": "string",
                        "description": "High-level summary of how the question will be answered"
                    },
                    "language": {
                        "type": "string",
                        "description": "Language tag of the user's question"
                    },
                    "steps": {
                        "type": "array",
                        "description": "Ordered execution steps, numbered from 1",
                        "items": {
                            "type": "object",
                            "properties": {
                                "step_number": {
                                    "type": "integer",
                                    "description": "Sequential step number starting from 1"
                                },
                                "description": {
                                    "type": "string",
                                    "description": "What this step does"
                                },
                                "databases": {
                                    "type": "array",
                                    "items": {"type": "string"},
                                    "description": "Database ids (never table names) this step reads; must all belong to one datasource"
                                },
                                "tables": {
                                    "type": "array",
                                    "items": {"type": "string"},
                                    "description": "Table names this step touches"
                                },
                                "operation": {
                                    "type": "string",
                                    "enum": ["lookup", "aggregation", "join", "filter", "sort", "other"],
                                    "description": "Kind of operation"
                                },
                                "depends_on_steps": {
                                    "type": "array",
                                    "items": {"type": "integer"},
                                    "description": "Earlier step numbers whose results this step consumes"
                                }
                            },
                            "required": ["step_number", "description", "databases", "tables", "operation"]
                        }
                    },
                    "needs_clarification": {
                        "type": "boolean",
                        "description": "Whether the user must clarify before a plan can be made"
                    },
                    "clarification_questions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "question": {"type": "string"},
                                "reason": {"type": "string"}
                            },
                            "required": ["question", "reason"]
                        }
                    }
                },
                "required": ["summary", "language", "steps"]
            }),
        }
    }
}

/// Generated SQL for one plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlGenerationResult {
    /// The SQL statement; must be a pure read.
    pub sql: String,
    /// Target database id to run it against.
    pub database: String,
    /// Short explanation of the query.
    #[serde(default)]
    pub explanation: Option<String>,
}

impl SqlGenerationResult {
    /// Tool declaration for SQL generation.
    #[must_use]
    pub fn tool_spec() -> ToolSpec {
        ToolSpec {
            name: "provide_sql".to_string(),
            description: "Provide the SQL statement for this step".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "A single read-only SQL statement (SELECT or WITH)"
                    },
                    "database": {
                        "type": "string",
                        "description": "Database id to execute against"
                    },
                    "explanation": {
                        "type": "string",
                        "description": "One-sentence explanation of the query"
                    }
                },
                "required": ["sql", "database"]
            }),
        }
    }
}

/// Diagnosis of a failed SQL attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnalysisResult {
    /// Failure category.
    pub category: ErrorCategory,
    /// Whether a corrected statement is worth trying.
    pub is_recoverable: bool,
    /// Diagnosis reasoning.
    pub reasoning: String,
    /// Corrected SQL to try next, when recoverable.
    #[serde(default)]
    pub suggested_sql: Option<String>,
    /// Corrected target database, when the original was wrong.
    #[serde(default)]
    pub target_database: Option<String>,
}

impl ErrorAnalysisResult {
    /// Tool declaration for error analysis.
    #[must_use]
    pub fn tool_spec() -> ToolSpec {
        ToolSpec {
            name: "provide_error_analysis".to_string(),
            description: "Diagnose the failed SQL and suggest a correction".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "category": {
                        "type": "string",
                        "enum": ["syntax", "schema", "permission", "connection", "data", "other"],
                        "description": "Failure category"
                    },
                    "is_recoverable": {
                        "type": "boolean",
                        "description": "Whether a corrected statement could succeed. permission and connection failures are not recoverable"
                    },
                    "reasoning": {
                        "type": "string",
                        "description": "What went wrong"
                    },
                    "suggested_sql": {
                        "type": "string",
                        "description": "Corrected SQL to try next; required when recoverable"
                    },
                    "target_database": {
                        "type": "string",
                        "description": "Corrected database id, only if the original target was wrong"
                    }
                },
                "required": ["category", "is_recoverable", "reasoning"]
            }),
        }
    }
}

/// Summarizer's self-reported answer reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Final natural-language answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    /// Answer text, in the user's language.
    pub answer: String,
    /// Self-reported confidence.
    pub confidence: Confidence,
    /// Database ids the answer is derived from.
    #[serde(default)]
    pub data_sources_used: Vec<String>,
}

impl SummaryResult {
    /// Tool declaration for the summary stage.
    #[must_use]
    pub fn tool_spec() -> ToolSpec {
        ToolSpec {
            name: "provide_summary".to_string(),
            description: "Provide the final answer for the user".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "answer": {
                        "type": "string",
                        "description": "Final answer, written in the same language as the question"
                    },
                    "confidence": {
                        "type": "string",
                        "enum": ["high", "medium", "low"],
                        "description": "How reliable the answer is given the execution results"
                    },
                    "data_sources_used": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Database ids the answer is derived from"
                    }
                },
                "required": ["answer", "confidence"]
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_result_deserializes_from_tool_input() {
        let input = json!({
            "is_relevant": true,
            "reasoning": "asks about customer counts",
            "language": "en",
            "relevant_databases": ["customer_db"]
        });
        let result: ValidationResult = serde_json::from_value(input).unwrap();
        assert!(result.is_relevant);
        assert_eq!(result.relevant_databases, vec!["customer_db"]);
        assert!(result.suggested_response.is_none());
    }

    #[test]
    fn test_decision_action_uses_snake_case() {
        let result: DecisionResult = serde_json::from_value(json!({
            "action": "ask_clarification",
            "reasoning": "ambiguous time range",
            "message": "Which year do you mean?"
        }))
        .unwrap();
        assert_eq!(result.action, DecisionAction::AskClarification);
    }

    #[test]
    fn test_plan_step_defaults_dependencies_to_empty() {
        let step: PlanStep = serde_json::from_value(json!({
            "step_number": 1,
            "description": "count customers",
            "databases": ["customer_db"],
            "tables": ["customers"],
            "operation": "aggregation"
        }))
        .unwrap();
        assert!(step.depends_on_steps.is_empty());
        assert_eq!(step.operation, StepOperation::Aggregation);
    }

    #[test]
    fn test_error_analysis_categories_match_datasource_enum() {
        let analysis: ErrorAnalysisResult = serde_json::from_value(json!({
            "category": "schema",
            "is_recoverable": true,
            "reasoning": "table name misspelled",
            "suggested_sql": "SELECT COUNT(*) FROM policies"
        }))
        .unwrap();
        assert_eq!(analysis.category, ErrorCategory::Schema);
        assert!(analysis.is_recoverable);
    }

    #[test]
    fn test_tool_specs_declare_required_fields() {
        let spec = QueryPlan::tool_spec();
        let required = spec.input_schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "steps"));

        let spec = SummaryResult::tool_spec();
        let required = spec.input_schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "confidence"));
    }
}
