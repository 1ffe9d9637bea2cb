//! Prompt template registry.
//!
//! Each pipeline stage has a named YAML template under `knowledge/prompts/`
//! declaring the model tier, temperature, system prompt, and user prompt.
//! Templates use `${var}` placeholders; rendering substitutes known
//! variables and leaves unknown ones intact.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Abstract model capability class, resolved to a concrete model id by
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheap/fast model for validation.
    Weak,
    /// Mid-reasoning model for decide/plan/summarize.
    Planning,
    /// SQL-focused model for generation and error analysis.
    Developer,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weak => write!(f, "weak"),
            Self::Planning => write!(f, "planning"),
            Self::Developer => write!(f, "developer"),
        }
    }
}

/// A loaded prompt template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Template name (matches the file stem).
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Model tier this stage runs on.
    #[serde(default = "default_tier")]
    pub model: ModelTier,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// System prompt; may itself contain `${var}` placeholders.
    #[serde(default)]
    pub system_prompt: String,
    /// User prompt template.
    pub user_prompt: String,
    /// Declared structured-output schema name (documentation; the binding
    /// is typed in code).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<String>,
}

fn default_tier() -> ModelTier {
    ModelTier::Planning
}

fn default_temperature() -> f32 {
    1.0
}

impl PromptTemplate {
    /// Render the user prompt with the given variables.
    #[must_use]
    pub fn render_user_prompt(&self, vars: &[(&str, &str)]) -> String {
        render(&self.user_prompt, vars)
    }

    /// Render the system prompt with the given variables.
    #[must_use]
    pub fn render_system_prompt(&self, vars: &[(&str, &str)]) -> String {
        render(&self.system_prompt, vars)
    }
}

/// Substitute `${var}` placeholders. Unknown variables are left as-is.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("${{{name}}}"), value);
    }
    out
}

/// The six stage templates every deployment must provide.
pub const REQUIRED_TEMPLATES: [&str; 6] = [
    "validate_question",
    "decide_action",
    "create_plan",
    "generate_sql",
    "analyze_error",
    "write_summary",
];

/// Registry of named prompt templates, loaded once at startup.
#[derive(Debug, Default)]
pub struct PromptRegistry {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptRegistry {
    /// Load all required templates from `dir`, failing fast on any missing
    /// or malformed file.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let mut templates = HashMap::new();

        for name in REQUIRED_TEMPLATES {
            let path = dir.join(format!("{name}.yaml"));
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading prompt template {}", path.display()))?;
            let template: PromptTemplate = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing prompt template {}", path.display()))?;
            if template.name != name {
                anyhow::bail!(
                    "prompt template {} declares name '{}', expected '{name}'",
                    path.display(),
                    template.name
                );
            }
            templates.insert(name.to_string(), template);
        }

        tracing::info!(count = templates.len(), dir = %dir.display(), "Loaded prompt templates");
        Ok(Self { templates })
    }

    /// Build a registry from already-parsed templates (tests).
    #[must_use]
    pub fn from_templates(templates: Vec<PromptTemplate>) -> Self {
        Self {
            templates: templates
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
        }
    }

    /// Fetch a template by name.
    pub fn get(&self, name: &str) -> anyhow::Result<&PromptTemplate> {
        self.templates
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("prompt template '{name}' not loaded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_known_variables() {
        let template = PromptTemplate {
            name: "t".into(),
            description: String::new(),
            model: ModelTier::Weak,
            temperature: 0.2,
            system_prompt: "Schemas:\n${database_schemas}".into(),
            user_prompt: "Question: ${question}\nSources:\n${data_sources}".into(),
            structured_output: None,
        };

        let rendered = template.render_user_prompt(&[
            ("question", "How many customers?"),
            ("data_sources", "- customer_db"),
        ]);
        assert!(rendered.contains("Question: How many customers?"));
        assert!(rendered.contains("- customer_db"));

        let system = template.render_system_prompt(&[("database_schemas", "### customer_db")]);
        assert!(system.contains("### customer_db"));
    }

    #[test]
    fn test_unknown_variables_are_left_intact() {
        let rendered = render("Value: ${present} and ${absent}", &[("present", "x")]);
        assert_eq!(rendered, "Value: x and ${absent}");
    }

    #[test]
    fn test_parses_template_yaml() {
        let yaml = r#"
name: validate_question
description: Check relevance
model: weak
temperature: 0.1
system_prompt: |
  You validate questions.
user_prompt: |
  Question: ${question}
structured_output: validation_result
"#;
        let template: PromptTemplate = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(template.name, "validate_question");
        assert_eq!(template.model, ModelTier::Weak);
        assert!((template.temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(template.structured_output.as_deref(), Some("validation_result"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = PromptRegistry::from_templates(vec![PromptTemplate {
            name: "decide_action".into(),
            description: String::new(),
            model: ModelTier::Planning,
            temperature: 1.0,
            system_prompt: String::new(),
            user_prompt: "${question}".into(),
            structured_output: None,
        }]);

        assert!(registry.get("decide_action").is_ok());
        assert!(registry.get("missing").is_err());
    }
}
