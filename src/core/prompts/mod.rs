//! Prompt rendering. Templates are addressed by name: `<role>` for an agent's
//! system prompt and `question_<role>` for the human turn that seeds it.

mod defaults;

use anyhow::{Context, Result};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

use crate::core::agent::AgentRole;
use crate::core::error::ChainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptType {
    /// System prompt of a role; also the single prompt of simple-call roles
    /// (reflector, tool call fixer, summarizer).
    Agent(AgentRole),
    Question(AgentRole),
    TaskTitle,
}

impl PromptType {
    pub fn name(&self) -> String {
        match self {
            PromptType::Agent(role) => role.as_str().to_string(),
            PromptType::Question(role) => format!("question_{}", role.as_str()),
            PromptType::TaskTitle => "task_title".to_string(),
        }
    }
}

pub trait Prompter: Send + Sync {
    fn render(&self, prompt: PromptType, params: &Value) -> Result<String>;
}

pub struct TemplatePrompter {
    env: Environment<'static>,
}

impl TemplatePrompter {
    /// An empty prompter. Every render fails until templates are added.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        Self { env }
    }

    pub fn with_defaults() -> Result<Self> {
        let mut prompter = Self::new();
        for (name, source) in defaults::templates() {
            prompter.add_template(name, source)?;
        }
        Ok(prompter)
    }

    pub fn add_template(&mut self, name: impl Into<String>, source: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.env
            .add_template_owned(name.clone(), source.into())
            .with_context(|| format!("Invalid template '{}'", name))?;
        Ok(())
    }

    /// Loads every `*.tmpl` file in `dir`, named after the file stem.
    /// Existing templates with the same name are replaced.
    pub async fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read prompt dir {}", dir.display()))?;

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("tmpl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = tokio::fs::read_to_string(&path).await?;
            debug!("Loading prompt template {}", stem);
            self.add_template(stem.to_string(), source)?;
            loaded += 1;
        }
        info!("Loaded {} prompt templates from {}", loaded, dir.display());
        Ok(loaded)
    }
}

impl Default for TemplatePrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for TemplatePrompter {
    fn render(&self, prompt: PromptType, params: &Value) -> Result<String> {
        let name = prompt.name();
        let template = match self.env.get_template(&name) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::TemplateNotFound => {
                return Err(ChainError::TemplateNotFound(name).into());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to load template '{}'", name)),
        };
        let rendered = template
            .render(params)
            .with_context(|| format!("Failed to render template '{}'", name))?;
        Ok(rendered.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_names_follow_role_names() {
        assert_eq!(PromptType::Agent(AgentRole::Primary).name(), "primary_agent");
        assert_eq!(
            PromptType::Question(AgentRole::Installer).name(),
            "question_installer"
        );
        assert_eq!(PromptType::Agent(AgentRole::ToolCallFixer).name(), "tool_call_fixer");
    }

    #[test]
    fn every_role_prompt_has_a_default() {
        let prompter = TemplatePrompter::with_defaults().unwrap();
        for role in [
            AgentRole::Primary,
            AgentRole::Assistant,
            AgentRole::Pentester,
            AgentRole::Coder,
            AgentRole::Installer,
            AgentRole::Memorist,
            AgentRole::Searcher,
            AgentRole::Adviser,
            AgentRole::Enricher,
            AgentRole::Reporter,
            AgentRole::Generator,
            AgentRole::Refiner,
        ] {
            prompter
                .render(PromptType::Agent(role), &json!({}))
                .unwrap_or_else(|e| panic!("{role}: {e:#}"));
            prompter
                .render(PromptType::Question(role), &json!({}))
                .unwrap_or_else(|e| panic!("question {role}: {e:#}"));
        }
        let reflector = prompter
            .render(
                PromptType::Agent(AgentRole::Reflector),
                &json!({"message": "I think we are done", "barrier_tools": ["done", "ask_user"]}),
            )
            .unwrap();
        assert!(reflector.contains("done, ask_user"));
        for role in [AgentRole::ToolCallFixer, AgentRole::Summarizer] {
            prompter.render(PromptType::Agent(role), &json!({})).unwrap();
        }
        prompter
            .render(PromptType::TaskTitle, &json!({"input": "scan the host"}))
            .unwrap();
    }

    #[test]
    fn renders_params() {
        let prompter = TemplatePrompter::with_defaults().unwrap();
        let out = prompter
            .render(
                PromptType::Agent(AgentRole::Coder),
                &json!({
                    "barrier": "code_result",
                    "task": {"title": "Scan", "input": "scan 10.0.0.1"},
                    "completed_subtasks": [{"title": "recon", "result": "port 22 open"}]
                }),
            )
            .unwrap();
        assert!(out.contains("`code_result`"));
        assert!(out.contains("scan 10.0.0.1"));
        assert!(out.contains("- recon: port 22 open"));
    }

    #[test]
    fn missing_template_is_a_distinct_error() {
        let prompter = TemplatePrompter::new();
        let err = prompter
            .render(PromptType::Agent(AgentRole::Coder), &json!({}))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChainError>(),
            Some(ChainError::TemplateNotFound(name)) if name == "coder"
        ));
    }

    #[tokio::test]
    async fn templates_from_dir_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("coder.tmpl"), "custom coder for {{ barrier }}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut prompter = TemplatePrompter::with_defaults().unwrap();
        assert_eq!(prompter.load_dir(dir.path()).await.unwrap(), 1);
        let out = prompter
            .render(PromptType::Agent(AgentRole::Coder), &json!({"barrier": "code_result"}))
            .unwrap();
        assert_eq!(out, "custom coder for code_result");
    }
}
