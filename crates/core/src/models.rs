//! Learner and practice-question records.
//!
//! Persisted layout:
//! - `users/{user_id}`: `name`, `current_level`
//! - `users/{user_id}/questions/{question_id}`: `questionText`, `formula`,
//!   `answer`, `level`, `correctCount`, `wrongCount`, `createdAt`, `updatedAt`

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::store::Document;

pub const USERS: &str = "users";
pub const QUESTIONS: &str = "questions";

pub const GUEST_NAME: &str = "guest";
pub const INITIAL_LEVEL: u32 = 1;

/// Stored field names.
pub mod fields {
    pub const NAME: &str = "name";
    pub const CURRENT_LEVEL: &str = "current_level";
    pub const QUESTION_TEXT: &str = "questionText";
    pub const FORMULA: &str = "formula";
    pub const ANSWER: &str = "answer";
    pub const LEVEL: &str = "level";
    pub const CORRECT_COUNT: &str = "correctCount";
    pub const WRONG_COUNT: &str = "wrongCount";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
}

fn read_str(doc: &Document, field: &str) -> Option<String> {
    doc.get(field).and_then(Value::as_str).map(str::to_string)
}

fn read_u64(doc: &Document, field: &str) -> Option<u64> {
    doc.get(field).and_then(Value::as_u64)
}

fn read_level(doc: &Document, field: &str) -> u32 {
    read_u64(doc, field)
        .and_then(|level| u32::try_from(level).ok())
        .filter(|level| *level >= INITIAL_LEVEL)
        .unwrap_or(INITIAL_LEVEL)
}

/// A learner's profile.
#[derive(Serialize, Deserialize, JsonSchema, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub name: String,
    pub current_level: u32,
}

impl UserProfile {
    /// The profile reported for users that have no record yet.
    pub fn guest() -> Self {
        Self {
            name: GUEST_NAME.to_string(),
            current_level: INITIAL_LEVEL,
        }
    }

    /// Reads a profile, falling back to guest values for missing fields.
    pub fn from_document(doc: &Document) -> Self {
        Self {
            name: read_str(doc, fields::NAME).unwrap_or_else(|| GUEST_NAME.to_string()),
            current_level: read_level(doc, fields::CURRENT_LEVEL),
        }
    }
}

impl Default for UserProfile {
    fn default() -> Self {
        Self::guest()
    }
}

/// A practice question with its running tally. Timestamps are not exposed.
#[derive(Serialize, Deserialize, JsonSchema, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MathQuestion {
    pub id: String,
    pub question_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    pub answer: String,
    pub level: u32,
    pub correct_count: u64,
    pub wrong_count: u64,
}

impl MathQuestion {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            question_text: read_str(doc, fields::QUESTION_TEXT).unwrap_or_default(),
            formula: read_str(doc, fields::FORMULA),
            answer: read_str(doc, fields::ANSWER).unwrap_or_default(),
            level: read_level(doc, fields::LEVEL),
            correct_count: read_u64(doc, fields::CORRECT_COUNT).unwrap_or(0),
            wrong_count: read_u64(doc, fields::WRONG_COUNT).unwrap_or(0),
        }
    }
}

/// The authored part of a question: the only place text, answer and level are set.
#[derive(Serialize, Deserialize, JsonSchema, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMathQuestion {
    pub question_text: String,
    #[serde(default)]
    pub formula: Option<String>,
    pub answer: String,
    pub level: u32,
}

/// Outcome of one attempt at a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Correct,
    Wrong,
}

impl AnswerOutcome {
    /// The counter field this outcome increments.
    pub fn counter_field(self) -> &'static str {
        match self {
            AnswerOutcome::Correct => fields::CORRECT_COUNT,
            AnswerOutcome::Wrong => fields::WRONG_COUNT,
        }
    }
}

impl From<bool> for AnswerOutcome {
    fn from(is_correct: bool) -> Self {
        if is_correct {
            AnswerOutcome::Correct
        } else {
            AnswerOutcome::Wrong
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStats {
    pub question_id: String,
    pub correct_count: u64,
    pub wrong_count: u64,
}

impl QuestionStats {
    /// The shape reported for a question that does not exist.
    pub fn zeroed(question_id: impl Into<String>) -> Self {
        Self {
            question_id: question_id.into(),
            correct_count: 0,
            wrong_count: 0,
        }
    }
}

/// Everything the prompt needs about a returning learner.
#[derive(Serialize, Deserialize, JsonSchema, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    #[serde(flatten)]
    pub profile: UserProfile,
    /// Questions at the current level and the one below it.
    pub questions: Vec<MathQuestion>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, fields: Value) -> Document {
        Document {
            id: id.to_string(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            create_time: None,
            update_time: None,
        }
    }

    #[test]
    fn test_guest_profile() {
        let guest = UserProfile::guest();
        assert_eq!(guest.name, "guest");
        assert_eq!(guest.current_level, 1);
        assert_eq!(UserProfile::default(), guest);
    }

    #[test]
    fn test_profile_from_partial_document() {
        let profile = UserProfile::from_document(&doc("u1", json!({ "current_level": 4 })));
        assert_eq!(profile.name, "guest");
        assert_eq!(profile.current_level, 4);

        // Non-positive levels fall back to the initial level.
        let profile = UserProfile::from_document(&doc("u1", json!({ "name": "Taro", "current_level": 0 })));
        assert_eq!(profile.name, "Taro");
        assert_eq!(profile.current_level, 1);
    }

    #[test]
    fn test_question_from_document_strips_timestamps() {
        let question = MathQuestion::from_document(&doc(
            "q1",
            json!({
                "questionText": "3 + 4 = ?",
                "formula": "3 + 4",
                "answer": "7",
                "level": 2,
                "correctCount": 3,
                "wrongCount": 1,
                "createdAt": "2024-01-15T10:30:00Z",
                "updatedAt": "2024-01-15T10:30:00Z"
            }),
        ));
        let json = serde_json::to_value(&question).unwrap();
        assert_eq!(
            json,
            json!({
                "id": "q1",
                "questionText": "3 + 4 = ?",
                "formula": "3 + 4",
                "answer": "7",
                "level": 2,
                "correctCount": 3,
                "wrongCount": 1
            })
        );
    }

    #[test]
    fn test_answer_outcome() {
        assert_eq!(AnswerOutcome::from(true), AnswerOutcome::Correct);
        assert_eq!(AnswerOutcome::from(false).counter_field(), "wrongCount");
        assert_eq!(AnswerOutcome::Correct.counter_field(), "correctCount");
    }

    #[test]
    fn test_user_data_serialization_is_flat() {
        let data = UserData {
            profile: UserProfile {
                name: "Taro".to_string(),
                current_level: 2,
            },
            questions: vec![],
        };
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({ "name": "Taro", "current_level": 2, "questions": [] })
        );
    }

    #[test]
    fn test_zeroed_stats() {
        assert_eq!(
            serde_json::to_value(QuestionStats::zeroed("missing")).unwrap(),
            json!({ "questionId": "missing", "correctCount": 0, "wrongCount": 0 })
        );
    }
}
