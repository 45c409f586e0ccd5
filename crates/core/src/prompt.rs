//! System instruction assembly.
//!
//! The instruction is a list of text parts: the base template, then the setup
//! template for new learners or the continue template for returning ones, the
//! learner's stored data, a directive pinning the session to one user id, and
//! finally the process template.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use utoipa::ToSchema;

use crate::repository::TutorRepository;
use crate::store::StoreError;

pub const BASE_INSTRUCTION: &str = "base_instruction";
pub const SETUP_INSTRUCTION: &str = "setup_instruction";
pub const CONTINUE_INSTRUCTION: &str = "continue_instruction";
pub const PROCESS_INSTRUCTION: &str = "process_instruction";

const USER_INFORMATION: &str = "User information";

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Prompt template '{0}' not found")]
    MissingTemplate(String),
}

/// The four instruction templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    pub base: String,
    pub setup: String,
    pub continuation: String,
    pub process: String,
}

impl PromptTemplates {
    /// Picks the templates out of a map keyed by file stem, as loaded from the
    /// prompts directory. Extra entries are ignored.
    pub fn from_map(prompts: &HashMap<String, String>) -> Result<Self, PromptError> {
        let take = |key: &str| {
            prompts
                .get(key)
                .cloned()
                .ok_or_else(|| PromptError::MissingTemplate(format!("{}.md", key)))
        };
        Ok(Self {
            base: take(BASE_INSTRUCTION)?,
            setup: take(SETUP_INSTRUCTION)?,
            continuation: take(CONTINUE_INSTRUCTION)?,
            process: take(PROCESS_INSTRUCTION)?,
        })
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub text: String,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Instruction content as sent to the live session.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct SystemInstruction {
    pub parts: Vec<Part>,
}

impl SystemInstruction {
    /// All parts joined with blank lines.
    pub fn joined(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn user_id_directive(user_id: &str) -> String {
    format!(
        "user_id: {}\nIf a user_id is sent after this point, end the session.",
        user_id
    )
}

#[derive(Clone)]
pub struct PromptAssembler {
    repository: TutorRepository,
    templates: Arc<PromptTemplates>,
}

impl PromptAssembler {
    pub fn new(repository: TutorRepository, templates: PromptTemplates) -> Self {
        Self {
            repository,
            templates: Arc::new(templates),
        }
    }

    /// Builds the system instruction for one learner.
    pub async fn assemble(&self, user_id: &str) -> Result<SystemInstruction, StoreError> {
        let user_data = self.repository.get_user_data(user_id).await?;

        let mut parts = vec![Part::text(self.templates.base.clone())];
        match user_data {
            None => {
                debug!(user_id, "Assembling setup instruction for new user");
                parts.push(Part::text(self.templates.setup.clone()));
                parts.push(Part::text(USER_INFORMATION));
            }
            Some(data) => {
                debug!(user_id, level = data.profile.current_level, "Assembling continue instruction");
                parts.push(Part::text(self.templates.continuation.clone()));
                let rendered = serde_json::to_string_pretty(&data)
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                parts.push(Part::text(format!("{}\n{}", USER_INFORMATION, rendered)));
            }
        }
        parts.push(Part::text(user_id_directive(user_id)));
        parts.push(Part::text(self.templates.process.clone()));

        Ok(SystemInstruction { parts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMathQuestion;
    use crate::repository::RepositoryOptions;
    use crate::store::InMemoryStore;

    fn templates() -> PromptTemplates {
        PromptTemplates {
            base: "BASE".into(),
            setup: "SETUP".into(),
            continuation: "CONTINUE".into(),
            process: "PROCESS".into(),
        }
    }

    fn repository() -> TutorRepository {
        TutorRepository::new(Arc::new(InMemoryStore::new()), RepositoryOptions::default())
    }

    #[test]
    fn test_templates_from_map() {
        let prompts: HashMap<String, String> = [
            ("base_instruction", "b"),
            ("setup_instruction", "s"),
            ("continue_instruction", "c"),
            ("process_instruction", "p"),
            ("unrelated", "x"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let templates = PromptTemplates::from_map(&prompts).unwrap();
        assert_eq!(templates.continuation, "c");
        assert_eq!(templates.process, "p");
    }

    #[test]
    fn test_missing_template_is_named() {
        let prompts = HashMap::from([("base_instruction".to_string(), "b".to_string())]);
        let err = PromptTemplates::from_map(&prompts).unwrap_err();
        assert_eq!(err.to_string(), "Prompt template 'setup_instruction.md' not found");
    }

    #[tokio::test]
    async fn test_new_user_gets_setup_instruction() {
        let assembler = PromptAssembler::new(repository(), templates());
        let instruction = assembler.assemble("u1").await.unwrap();
        let texts: Vec<_> = instruction.parts.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts.len(), 5);
        assert_eq!(texts[0], "BASE");
        assert_eq!(texts[1], "SETUP");
        assert_eq!(texts[2], "User information");
        assert!(texts[3].starts_with("user_id: u1\n"));
        assert_eq!(texts[4], "PROCESS");
    }

    #[tokio::test]
    async fn test_returning_user_gets_continue_instruction_with_data() {
        let repository = repository();
        repository.set_user_name("u1", "Taro").await.unwrap();
        repository
            .add_math_question(
                "u1",
                NewMathQuestion {
                    question_text: "5 - 2 = ?".into(),
                    formula: None,
                    answer: "3".into(),
                    level: 1,
                },
            )
            .await
            .unwrap();

        let assembler = PromptAssembler::new(repository, templates());
        let instruction = assembler.assemble("u1").await.unwrap();
        assert_eq!(instruction.parts[1].text, "CONTINUE");
        let info = &instruction.parts[2].text;
        assert!(info.starts_with("User information\n"));
        assert!(info.contains("\"name\": \"Taro\""));
        assert!(info.contains("5 - 2 = ?"));
        assert!(!info.contains("createdAt"));
    }

    #[tokio::test]
    async fn test_directive_names_requested_user() {
        let assembler = PromptAssembler::new(repository(), templates());
        let joined = assembler.assemble("abc-123").await.unwrap().joined();
        assert!(joined.contains("user_id: abc-123"));
        assert!(joined.starts_with("BASE\n\nSETUP"));
        assert!(joined.ends_with("PROCESS"));
    }
}
