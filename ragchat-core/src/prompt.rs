//! Prompt assembly.
//!
//! The final prompt is built from a fixed sequence of sections: the system
//! prompt, the dialogue rules, the document block (only when documents were
//! found), the conversation history (only when there is any) and the new
//! user turn. Every section except the system prompt comes from a named
//! template in an injected [`PromptTemplates`] set.
//!
//! Templates use `{{name}}` placeholders. A required placeholder without a
//! value fails the build; undeclared placeholders and unused values are
//! reported as [`PromptWarning`]s.

use crate::documents::DocumentContext;
use crate::error::PromptError;
use crate::types::ConversationContext;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use tracing::warn;

pub const DIALOGUE_RULES_TEMPLATE: &str = "chat.dialogue_rules";
pub const DOCUMENTS_TEMPLATE: &str = "chat.documents";
pub const HISTORY_TEMPLATE: &str = "chat.history";
pub const USER_TURN_TEMPLATE: &str = "chat.user_turn";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// A non-fatal template diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptWarning {
    /// The template body references a placeholder it does not declare.
    UndeclaredPlaceholder {
        template: String,
        placeholder: String,
    },
    /// A value was supplied that the template never references.
    UnusedValue { template: String, key: String },
}

impl std::fmt::Display for PromptWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromptWarning::UndeclaredPlaceholder {
                template,
                placeholder,
            } => write!(
                f,
                "template '{template}' uses undeclared placeholder '{placeholder}'"
            ),
            PromptWarning::UnusedValue { template, key } => {
                write!(f, "template '{template}' does not use supplied value '{key}'")
            }
        }
    }
}

/// One named template with its declared placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub name: String,
    pub body: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            required: Vec::new(),
            optional: Vec::new(),
        }
    }

    pub fn require(mut self, placeholder: impl Into<String>) -> Self {
        self.required.push(placeholder.into());
        self
    }

    pub fn optional(mut self, placeholder: impl Into<String>) -> Self {
        self.optional.push(placeholder.into());
        self
    }

    /// Placeholders referenced by the body, in order of first use.
    pub fn placeholders(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for cap in PLACEHOLDER.captures_iter(&self.body) {
            let name = cap[1].to_string();
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        seen
    }

    fn declares(&self, placeholder: &str) -> bool {
        self.required.iter().any(|p| p == placeholder)
            || self.optional.iter().any(|p| p == placeholder)
    }

    /// Substitute `values` into the body.
    pub fn render(
        &self,
        values: &HashMap<&str, String>,
    ) -> Result<(String, Vec<PromptWarning>), PromptError> {
        if let Some(missing) = self
            .required
            .iter()
            .find(|p| !values.contains_key(p.as_str()))
        {
            return Err(PromptError::MissingPlaceholder {
                template: self.name.clone(),
                placeholder: missing.clone(),
            });
        }

        let mut warnings = Vec::new();
        let referenced = self.placeholders();
        for placeholder in &referenced {
            if !self.declares(placeholder) {
                warnings.push(PromptWarning::UndeclaredPlaceholder {
                    template: self.name.clone(),
                    placeholder: placeholder.clone(),
                });
            }
        }
        // Sorted so warnings are deterministic.
        let supplied: BTreeMap<_, _> = values.iter().collect();
        for key in supplied.keys() {
            if !referenced.iter().any(|p| p == *key) {
                warnings.push(PromptWarning::UnusedValue {
                    template: self.name.clone(),
                    key: key.to_string(),
                });
            }
        }

        let text = PLACEHOLDER
            .replace_all(&self.body, |cap: &regex::Captures<'_>| {
                let name = &cap[1];
                if self.declares(name) {
                    values.get(name).cloned().unwrap_or_default()
                } else {
                    String::new()
                }
            })
            .into_owned();
        Ok((text, warnings))
    }
}

/// An explicitly constructed set of templates.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplates {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptTemplates {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in chat templates.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.register(PromptTemplate::new(
            DIALOGUE_RULES_TEMPLATE,
            "Follow these rules:\n\
             - Answer the user's latest message directly.\n\
             - Stay consistent with the conversation so far.\n\
             - When reference documents are provided, ground your answer in them and say \
             when they do not contain the answer.",
        ));
        set.register(
            PromptTemplate::new(DOCUMENTS_TEMPLATE, "Reference documents:\n{{document_context}}")
                .require("document_context"),
        );
        set.register(
            PromptTemplate::new(HISTORY_TEMPLATE, "Conversation so far:\n{{history}}")
                .require("history"),
        );
        set.register(
            PromptTemplate::new(USER_TURN_TEMPLATE, "User: {{user_message}}\nAssistant:")
                .require("user_message"),
        );
        set
    }

    /// Add or replace a template.
    pub fn register(&mut self, template: PromptTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Result<&PromptTemplate, PromptError> {
        self.templates
            .get(name)
            .ok_or_else(|| PromptError::UnknownTemplate {
                name: name.to_string(),
            })
    }

    pub fn render(
        &self,
        name: &str,
        values: &HashMap<&str, String>,
    ) -> Result<(String, Vec<PromptWarning>), PromptError> {
        self.get(name)?.render(values)
    }
}

/// The text sent to the model plus any template diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub text: String,
    pub warnings: Vec<PromptWarning>,
}

/// Builds the final prompt from context, documents and the new turn.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    templates: Arc<PromptTemplates>,
}

impl PromptAssembler {
    pub fn new(templates: Arc<PromptTemplates>) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &PromptTemplates {
        &self.templates
    }

    pub fn build(
        &self,
        context: &ConversationContext,
        documents: &DocumentContext,
        user_text: &str,
    ) -> Result<AssembledPrompt, PromptError> {
        let mut sections = Vec::with_capacity(5);
        let mut warnings = Vec::new();

        let system = context.system_prompt.trim();
        if !system.is_empty() {
            sections.push(system.to_string());
        }

        let mut render = |name: &str, values: HashMap<&str, String>| -> Result<(), PromptError> {
            let (text, mut w) = self.templates.render(name, &values)?;
            warnings.append(&mut w);
            let text = text.trim();
            if !text.is_empty() {
                sections.push(text.to_string());
            }
            Ok(())
        };

        render(DIALOGUE_RULES_TEMPLATE, HashMap::new())?;

        if !documents.block().trim().is_empty() {
            render(
                DOCUMENTS_TEMPLATE,
                HashMap::from([("document_context", documents.block().to_string())]),
            )?;
        }

        if !context.messages.is_empty() {
            let history = context
                .messages
                .iter()
                .map(|m| format!("{}: {}", m.role.label(), m.content.trim()))
                .collect::<Vec<_>>()
                .join("\n");
            render(HISTORY_TEMPLATE, HashMap::from([("history", history)]))?;
        }

        render(
            USER_TURN_TEMPLATE,
            HashMap::from([("user_message", user_text.trim().to_string())]),
        )?;

        for warning in &warnings {
            warn!(%warning, "Prompt template diagnostic");
        }
        Ok(AssembledPrompt {
            text: sections.join("\n\n"),
            warnings,
        })
    }
}
