//! Tutor Tool Service
//!
//! The functions the conversational model may call during a lesson, served
//! through MCP. Argument structs carry the parameter descriptions, so the
//! declarations handed to the live session are generated from this file.
//!
//! Outcomes:
//! - success: JSON text content
//! - rejected arguments: an error result the model can read and correct
//! - store or queue failures: an internal MCP error

use rmcp::{
    ErrorData, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;

use crate::models::{AnswerOutcome, NewMathQuestion};
use crate::repository::TutorRepository;
use crate::retrieval::{Retriever, format_docs};
use crate::store::{StoreError, auto_id, check_document_id};
use crate::writer::{BackgroundWriter, WriterError};

pub const RETRIEVE_DOCS: &str = "retrieve_docs";

/// Schema keys the live API rejects in function declarations.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "title", "definitions", "$defs"];

// --- Data Structures for Tools ---

#[derive(Deserialize, JsonSchema, Debug)]
pub struct UserArgs {
    /// Identifier of the learner.
    pub user_id: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct SetUserNameArgs {
    /// Identifier of the learner.
    pub user_id: String,
    /// The name the learner wants to be called.
    pub name: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct AddMathQuestionArgs {
    /// Identifier of the learner.
    pub user_id: String,
    /// The question as it was asked, e.g. "What is 3 + 4?".
    pub question_text: String,
    /// Optional formula form of the question, e.g. "3 + 4".
    #[serde(default)]
    pub formula: Option<String>,
    /// The expected answer.
    pub answer: String,
    /// Difficulty level of the question, starting at 1.
    pub level: u32,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct QuestionResultArgs {
    /// Identifier of the learner.
    pub user_id: String,
    /// Identifier of the question that was answered.
    pub question_id: String,
    /// Whether the learner's answer was correct.
    pub is_correct: bool,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct QuestionArgs {
    /// Identifier of the learner.
    pub user_id: String,
    /// Identifier of the question.
    pub question_id: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct RetrieveDocsArgs {
    /// Search query about MLOps, the generative AI lifecycle or production deployment.
    pub query: String,
}

/// A tool as the live session expects it in `functionDeclarations`.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments.
    #[schema(value_type = Object)]
    pub parameters: Value,
}

fn validate_key(field: &str, value: &str) -> Result<(), String> {
    check_document_id(value).map_err(|reason| format!("{} {}", field, reason))
}

fn rejected(tool: &str, message: String) -> CallToolResult {
    info!(tool, %message, "Tool arguments rejected");
    CallToolResult::error(vec![Content::text(message)])
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, ErrorData> {
    let text = serde_json::to_string(value)
        .map_err(|e| ErrorData::internal_error(format!("Failed to serialize result: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn store_failure(tool: &str, e: StoreError) -> ErrorData {
    error!(tool, error = %e, "Tool failed");
    ErrorData::internal_error(format!("{} failed: {}", tool, e), None)
}

fn queue_failure(tool: &str, e: WriterError) -> ErrorData {
    error!(tool, error = %e, "Could not queue write");
    ErrorData::internal_error(format!("{} failed: {}", tool, e), None)
}

/// Removes keys the live API does not accept, at every nesting level.
fn strip_schema(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in UNSUPPORTED_SCHEMA_KEYS {
                map.remove(*key);
            }
            map.values_mut().for_each(strip_schema);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_schema),
        _ => {}
    }
}

// --- Service and Handler Implementation ---

/// MCP tool server over the tutor repository.
///
/// With a writer attached, question authoring and result recording are queued
/// instead of awaited. Without a retriever, `retrieve_docs` is not declared.
pub struct TutorService {
    repository: TutorRepository,
    writer: Option<BackgroundWriter>,
    retriever: Option<Arc<Retriever>>,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for TutorService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some("Learner profile and practice question tools for a math tutor.".into()),
            ..Default::default()
        }
    }
}

#[tool_router]
impl TutorService {
    pub fn new(
        repository: TutorRepository,
        writer: Option<BackgroundWriter>,
        retriever: Option<Arc<Retriever>>,
    ) -> Self {
        Self {
            repository,
            writer,
            retriever,
            tool_router: Self::tool_router(),
        }
    }

    /// Function declarations for every tool this instance can serve.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tool_router
            .list_all()
            .into_iter()
            .filter(|tool| self.retriever.is_some() || tool.name != RETRIEVE_DOCS)
            .map(|tool| {
                let mut parameters = Value::Object((*tool.input_schema).clone());
                strip_schema(&mut parameters);
                FunctionDeclaration {
                    name: tool.name.to_string(),
                    description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
                    parameters,
                }
            })
            .collect()
    }

    #[tool(
        description = "Get the learner's name and current learning level. Unknown learners are reported as 'guest' at level 1."
    )]
    pub async fn get_user_level(
        &self,
        args: Parameters<UserArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        info!(args = ?args.0, "Executing tool 'get_user_level'");
        if let Err(message) = validate_key("user_id", &args.0.user_id) {
            return Ok(rejected("get_user_level", message));
        }
        let profile = self
            .repository
            .get_user_level(&args.0.user_id)
            .await
            .map_err(|e| store_failure("get_user_level", e))?;
        json_result(&profile)
    }

    #[tool(
        description = "Set the name the learner wants to be called. Creates the learner if needed and starts them at level 1."
    )]
    pub async fn set_user_name(
        &self,
        args: Parameters<SetUserNameArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        info!(args = ?args.0, "Executing tool 'set_user_name'");
        if let Err(message) = validate_key("user_id", &args.0.user_id) {
            return Ok(rejected("set_user_name", message));
        }
        let name = args.0.name.trim();
        if name.is_empty() {
            return Ok(rejected("set_user_name", "name must not be empty".to_string()));
        }
        let profile = self
            .repository
            .set_user_name(&args.0.user_id, name)
            .await
            .map_err(|e| store_failure("set_user_name", e))?;
        json_result(&profile)
    }

    #[tool(
        description = "Save a new practice question asked to the learner. Returns the stored question with its generated id."
    )]
    pub async fn add_math_question(
        &self,
        args: Parameters<AddMathQuestionArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        info!(args = ?args.0, "Executing tool 'add_math_question'");
        let AddMathQuestionArgs {
            user_id,
            question_text,
            formula,
            answer,
            level,
        } = args.0;
        if let Err(message) = validate_key("user_id", &user_id) {
            return Ok(rejected("add_math_question", message));
        }
        if question_text.trim().is_empty() {
            return Ok(rejected("add_math_question", "question_text must not be empty".to_string()));
        }
        if level == 0 {
            return Ok(rejected("add_math_question", "level must be at least 1".to_string()));
        }
        let question = NewMathQuestion {
            question_text,
            formula: formula.filter(|f| !f.trim().is_empty()),
            answer,
            level,
        };

        let Some(writer) = &self.writer else {
            let stored = self
                .repository
                .add_math_question(&user_id, question)
                .await
                .map_err(|e| store_failure("add_math_question", e))?;
            return json_result(&stored);
        };

        let question_id = auto_id();
        let repository = self.repository.clone();
        let (uid, qid) = (user_id.clone(), question_id.clone());
        writer
            .submit(format!("add_math_question {}/{}", user_id, question_id), async move {
                let stored = repository.insert_math_question(&uid, &qid, question).await?;
                Ok(json!({ "id": stored.id }))
            })
            .await
            .map_err(|e| queue_failure("add_math_question", e))?;
        json_result(&json!({ "id": question_id, "status": "queued" }))
    }

    #[tool(
        description = "Record whether the learner answered a question correctly. Increments the question's correct or wrong count."
    )]
    pub async fn upsert_math_question_result(
        &self,
        args: Parameters<QuestionResultArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        info!(args = ?args.0, "Executing tool 'upsert_math_question_result'");
        let QuestionResultArgs {
            user_id,
            question_id,
            is_correct,
        } = args.0;
        for (field, value) in [("user_id", &user_id), ("question_id", &question_id)] {
            if let Err(message) = validate_key(field, value) {
                return Ok(rejected("upsert_math_question_result", message));
            }
        }
        let outcome = AnswerOutcome::from(is_correct);

        let Some(writer) = &self.writer else {
            let stats = self
                .repository
                .upsert_math_question_result(&user_id, &question_id, outcome)
                .await
                .map_err(|e| store_failure("upsert_math_question_result", e))?;
            return json_result(&stats);
        };

        let repository = self.repository.clone();
        let (uid, qid) = (user_id.clone(), question_id.clone());
        writer
            .submit(
                format!("upsert_math_question_result {}/{}", user_id, question_id),
                async move {
                    let stats = repository
                        .upsert_math_question_result(&uid, &qid, outcome)
                        .await?;
                    Ok(json!({
                        "correctCount": stats.correct_count,
                        "wrongCount": stats.wrong_count,
                    }))
                },
            )
            .await
            .map_err(|e| queue_failure("upsert_math_question_result", e))?;
        json_result(&json!({ "questionId": question_id, "status": "queued" }))
    }

    #[tool(
        description = "Get how many times the learner answered a question correctly and wrongly. Unknown questions report zero counts."
    )]
    pub async fn get_math_question_stats(
        &self,
        args: Parameters<QuestionArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        info!(args = ?args.0, "Executing tool 'get_math_question_stats'");
        for (field, value) in [("user_id", &args.0.user_id), ("question_id", &args.0.question_id)] {
            if let Err(message) = validate_key(field, value) {
                return Ok(rejected("get_math_question_stats", message));
            }
        }
        let stats = self
            .repository
            .get_math_question_stats(&args.0.user_id, &args.0.question_id)
            .await
            .map_err(|e| store_failure("get_math_question_stats", e))?;
        json_result(&stats)
    }

    #[tool(description = "Move the learner up to the next level once they are ready.")]
    pub async fn increment_user_level(
        &self,
        args: Parameters<UserArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        info!(args = ?args.0, "Executing tool 'increment_user_level'");
        if let Err(message) = validate_key("user_id", &args.0.user_id) {
            return Ok(rejected("increment_user_level", message));
        }
        let profile = self
            .repository
            .increment_user_level(&args.0.user_id)
            .await
            .map_err(|e| store_failure("increment_user_level", e))?;
        json_result(&profile)
    }

    #[tool(
        description = "Retrieve pre-formatted documents about MLOps, the generative AI lifecycle and production deployment best practices."
    )]
    pub async fn retrieve_docs(
        &self,
        args: Parameters<RetrieveDocsArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        info!(args = ?args.0, "Executing tool 'retrieve_docs'");
        let Some(retriever) = &self.retriever else {
            return Ok(rejected(RETRIEVE_DOCS, "Document retrieval is not configured".to_string()));
        };
        let docs = retriever.retrieve(&args.0.query).await.map_err(|e| {
            error!(tool = RETRIEVE_DOCS, error = %e, "Tool failed");
            ErrorData::internal_error(format!("{} failed: {}", RETRIEVE_DOCS, e), None)
        })?;
        json_result(&json!({ "output": format_docs(&docs) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserProfile;
    use crate::repository::RepositoryOptions;
    use crate::retrieval::MockEmbedder;
    use crate::store::{
        Document, DocumentPath, DocumentStore, DocumentWrite, FieldQuery, InMemoryStore,
        ReadTransaction, SetMode,
    };
    use async_trait::async_trait;
    use rmcp::model::ErrorCode;

    struct UnavailableStore;

    fn unavailable() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }

    #[async_trait]
    impl DocumentStore for UnavailableStore {
        fn name(&self) -> &str {
            "unavailable"
        }

        async fn get(&self, _path: &DocumentPath) -> Result<Option<Document>, StoreError> {
            Err(unavailable())
        }

        async fn set(
            &self,
            _path: &DocumentPath,
            _write: DocumentWrite,
            _mode: SetMode,
        ) -> Result<(), StoreError> {
            Err(unavailable())
        }

        async fn create(&self, _path: &DocumentPath, _write: DocumentWrite) -> Result<(), StoreError> {
            Err(unavailable())
        }

        async fn query(&self, _query: &FieldQuery) -> Result<Vec<Document>, StoreError> {
            Err(unavailable())
        }

        async fn begin_read_only(&self) -> Result<Box<dyn ReadTransaction>, StoreError> {
            Err(unavailable())
        }
    }

    fn service(store: &InMemoryStore, writer: Option<BackgroundWriter>) -> TutorService {
        let repository = TutorRepository::new(Arc::new(store.clone()), RepositoryOptions::default());
        TutorService::new(repository, writer, None)
    }

    fn text_of(result: &CallToolResult) -> String {
        let wire = serde_json::to_value(result).unwrap();
        assert_eq!(wire["content"][0]["type"], json!("text"));
        wire["content"][0]["text"].as_str().unwrap().to_string()
    }

    fn json_of(result: &CallToolResult) -> Value {
        serde_json::from_str(&text_of(result)).unwrap()
    }

    fn user(id: &str) -> Parameters<UserArgs> {
        Parameters(UserArgs {
            user_id: id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_store_failures_are_internal_errors() {
        let repository = TutorRepository::new(Arc::new(UnavailableStore), RepositoryOptions::default());
        let service = TutorService::new(repository, None, None);

        let err = service.get_user_level(user("u1")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
        assert!(err.message.contains("connection refused"));

        let err = service
            .upsert_math_question_result(Parameters(QuestionResultArgs {
                user_id: "u1".to_string(),
                question_id: "q1".to_string(),
                is_correct: true,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_reserved_ids_are_rejected() {
        let service = service(&InMemoryStore::new(), None);
        for id in [".", "..", "__name__"] {
            let result = service.get_user_level(user(id)).await.unwrap();
            assert_eq!(result.is_error, Some(true), "{} was accepted", id);
        }
    }

    #[test]
    fn test_strip_schema_is_recursive() {
        let mut schema = json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "title": "Args",
            "type": "object",
            "properties": { "a": { "title": "A", "type": "string" } }
        });
        strip_schema(&mut schema);
        assert_eq!(
            schema,
            json!({ "type": "object", "properties": { "a": { "type": "string" } } })
        );
    }

    #[test]
    fn test_declarations_without_retriever() {
        let service = service(&InMemoryStore::new(), None);
        let mut names: Vec<_> = service.declarations().into_iter().map(|d| d.name).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "add_math_question",
                "get_math_question_stats",
                "get_user_level",
                "increment_user_level",
                "set_user_name",
                "upsert_math_question_result",
            ]
        );
    }

    #[test]
    fn test_declarations_with_retriever() {
        let repository = TutorRepository::new(Arc::new(InMemoryStore::new()), RepositoryOptions::default());
        let retriever = Arc::new(Retriever::new(Arc::new(MockEmbedder::new())));
        let service = TutorService::new(repository, None, Some(retriever));

        let declarations = service.declarations();
        assert_eq!(declarations.len(), 7);
        let retrieve = declarations.iter().find(|d| d.name == RETRIEVE_DOCS).unwrap();
        assert!(!retrieve.description.is_empty());
        assert_eq!(retrieve.parameters["properties"]["query"]["type"], json!("string"));
        assert!(retrieve.parameters.get("$schema").is_none());
    }

    #[test]
    fn test_declaration_parameters_come_from_args() {
        let service = service(&InMemoryStore::new(), None);
        let declaration = service
            .declarations()
            .into_iter()
            .find(|d| d.name == "upsert_math_question_result")
            .unwrap();
        let properties = declaration.parameters["properties"].as_object().unwrap();
        assert!(properties.contains_key("user_id"));
        assert!(properties.contains_key("question_id"));
        assert_eq!(properties["is_correct"]["type"], json!("boolean"));
        assert!(declaration.parameters.get("title").is_none());
    }

    #[tokio::test]
    async fn test_get_user_level_for_unknown_user() {
        let service = service(&InMemoryStore::new(), None);
        let result = service.get_user_level(user("nobody")).await.unwrap();
        assert_ne!(result.is_error, Some(true));
        let profile: UserProfile = serde_json::from_value(json_of(&result)).unwrap();
        assert_eq!(profile, UserProfile::guest());
    }

    #[tokio::test]
    async fn test_set_name_then_increment() {
        let service = service(&InMemoryStore::new(), None);
        service
            .set_user_name(Parameters(SetUserNameArgs {
                user_id: "u1".into(),
                name: " Taro ".into(),
            }))
            .await
            .unwrap();
        let result = service.increment_user_level(user("u1")).await.unwrap();
        assert_eq!(json_of(&result), json!({ "name": "Taro", "current_level": 2 }));
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_rejected() {
        let store = InMemoryStore::new();
        let service = service(&store, None);

        let result = service.get_user_level(user("")).await.unwrap();
        assert_eq!(result.is_error, Some(true));
        assert!(text_of(&result).contains("user_id"));

        let result = service
            .add_math_question(Parameters(AddMathQuestionArgs {
                user_id: "u1".into(),
                question_text: "1 + 1".into(),
                formula: None,
                answer: "2".into(),
                level: 0,
            }))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));

        let result = service
            .get_math_question_stats(Parameters(QuestionArgs {
                user_id: "u1".into(),
                question_id: "../escape".into(),
            }))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_question_and_record_results() {
        let service = service(&InMemoryStore::new(), None);
        let result = service
            .add_math_question(Parameters(AddMathQuestionArgs {
                user_id: "u1".into(),
                question_text: "3 + 4 = ?".into(),
                formula: Some("3 + 4".into()),
                answer: "7".into(),
                level: 1,
            }))
            .await
            .unwrap();
        let added = json_of(&result);
        let question_id = added["id"].as_str().unwrap().to_string();
        assert_eq!(added["correctCount"], json!(0));

        for is_correct in [true, false, true] {
            service
                .upsert_math_question_result(Parameters(QuestionResultArgs {
                    user_id: "u1".into(),
                    question_id: question_id.clone(),
                    is_correct,
                }))
                .await
                .unwrap();
        }
        let result = service
            .get_math_question_stats(Parameters(QuestionArgs {
                user_id: "u1".into(),
                question_id: question_id.clone(),
            }))
            .await
            .unwrap();
        assert_eq!(
            json_of(&result),
            json!({ "questionId": question_id, "correctCount": 2, "wrongCount": 1 })
        );
    }

    #[tokio::test]
    async fn test_background_writes_are_queued() {
        let store = InMemoryStore::new();
        let (writer, _handle) = BackgroundWriter::spawn(8);
        let service = service(&store, Some(writer.clone()));

        let result = service
            .add_math_question(Parameters(AddMathQuestionArgs {
                user_id: "u1".into(),
                question_text: "2 x 3 = ?".into(),
                formula: None,
                answer: "6".into(),
                level: 1,
            }))
            .await
            .unwrap();
        let queued = json_of(&result);
        assert_eq!(queued["status"], json!("queued"));
        let question_id = queued["id"].as_str().unwrap().to_string();

        let result = service
            .upsert_math_question_result(Parameters(QuestionResultArgs {
                user_id: "u1".into(),
                question_id: question_id.clone(),
                is_correct: false,
            }))
            .await
            .unwrap();
        assert_eq!(json_of(&result)["status"], json!("queued"));

        writer.flush().await.unwrap();
        let path = crate::store::CollectionPath::root("users")
            .doc("u1")
            .collection("questions")
            .doc(question_id.as_str());
        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.get("questionText"), Some(&json!("2 x 3 = ?")));
        assert_eq!(doc.get("wrongCount"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_retrieve_docs_without_retriever() {
        let service = service(&InMemoryStore::new(), None);
        let result = service
            .retrieve_docs(Parameters(RetrieveDocsArgs {
                query: "deploy".into(),
            }))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn test_retrieve_docs_formats_context() {
        let mut embedder = MockEmbedder::new();
        embedder.expect_embed().returning(|texts, _| Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect()));
        let retriever = Arc::new(Retriever::new(Arc::new(embedder)));
        retriever.ingest_text("https://example.com", "Operate models in production.").await.unwrap();

        let repository = TutorRepository::new(Arc::new(InMemoryStore::new()), RepositoryOptions::default());
        let service = TutorService::new(repository, None, Some(retriever));
        let result = service
            .retrieve_docs(Parameters(RetrieveDocsArgs {
                query: "production".into(),
            }))
            .await
            .unwrap();
        let output = json_of(&result)["output"].as_str().unwrap().to_string();
        assert!(output.starts_with("## Context provided:"));
        assert!(output.contains("<Document 0>\nOperate models in production.\n</Document 0>"));
    }
}
