//! Tutor Data Access
//!
//! Point reads and writes of learner profiles and practice questions against
//! an injected `DocumentStore`. Absent records are reported with guest or
//! zeroed defaults; store failures propagate unchanged to the caller.

use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{
    AnswerOutcome, INITIAL_LEVEL, MathQuestion, NewMathQuestion, QUESTIONS, QuestionStats, USERS,
    UserData, UserProfile, fields,
};
use crate::store::{
    CollectionPath, DocumentPath, DocumentStore, DocumentWrite, FieldQuery, ReadTransaction,
    SetMode, StoreError, auto_id,
};

/// Behaviour switches for the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// `set_user_name` puts the learner back to level 1, even when they already
    /// had progress.
    pub reset_level_on_rename: bool,
    /// Maximum number of questions fetched per level by `get_user_data`.
    /// Queries are unordered, so this caps the count without picking the newest.
    pub questions_per_level: u32,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            reset_level_on_rename: true,
            questions_per_level: 5,
        }
    }
}

#[derive(Clone)]
pub struct TutorRepository {
    store: Arc<dyn DocumentStore>,
    options: RepositoryOptions,
}

fn user_path(user_id: &str) -> DocumentPath {
    CollectionPath::root(USERS).doc(user_id)
}

fn questions_path(user_id: &str) -> CollectionPath {
    user_path(user_id).collection(QUESTIONS)
}

/// The current level and the one below it, clamped at the initial level.
fn review_levels(current_level: u32) -> Vec<u32> {
    let previous = current_level.saturating_sub(1).max(INITIAL_LEVEL);
    if previous == current_level {
        vec![current_level]
    } else {
        vec![current_level, previous]
    }
}

impl TutorRepository {
    pub fn new(store: Arc<dyn DocumentStore>, options: RepositoryOptions) -> Self {
        Self { store, options }
    }

    /// Loads the profile and recent-level questions of a learner.
    ///
    /// Returns `None` when the learner has no record. The profile read and the
    /// level-filtered queries run in one read-only transaction, so the level
    /// used for filtering is the one returned.
    pub async fn get_user_data(&self, user_id: &str) -> Result<Option<UserData>, StoreError> {
        let mut tx = self.store.begin_read_only().await?;
        let result = self.read_user_data(tx.as_mut(), user_id).await;
        let finished = tx.finish().await;
        let data = result?;
        finished?;
        Ok(data)
    }

    async fn read_user_data(
        &self,
        tx: &mut dyn ReadTransaction,
        user_id: &str,
    ) -> Result<Option<UserData>, StoreError> {
        let Some(user_doc) = tx.get(&user_path(user_id)).await? else {
            debug!(user_id, "No user record found");
            return Ok(None);
        };
        let profile = UserProfile::from_document(&user_doc);

        let mut questions = Vec::new();
        for level in review_levels(profile.current_level) {
            let query = FieldQuery::eq(questions_path(user_id), fields::LEVEL, level)
                .limit(self.options.questions_per_level);
            let docs = tx.query(&query).await?;
            questions.extend(docs.iter().map(MathQuestion::from_document));
        }

        Ok(Some(UserData { profile, questions }))
    }

    /// The learner's profile, or the guest profile if there is no record.
    pub async fn get_user_level(&self, user_id: &str) -> Result<UserProfile, StoreError> {
        Ok(self
            .store
            .get(&user_path(user_id))
            .await?
            .map(|doc| UserProfile::from_document(&doc))
            .unwrap_or_else(UserProfile::guest))
    }

    /// Sets the display name, creating the learner if needed.
    ///
    /// With `reset_level_on_rename` (the default) the level is written back to 1
    /// on every call.
    pub async fn set_user_name(&self, user_id: &str, name: &str) -> Result<UserProfile, StoreError> {
        let path = user_path(user_id);
        let mut write = DocumentWrite::new().field(fields::NAME, name);

        let current_level = if self.options.reset_level_on_rename {
            write = write.field(fields::CURRENT_LEVEL, INITIAL_LEVEL);
            INITIAL_LEVEL
        } else {
            match self.store.get(&path).await? {
                Some(doc) => UserProfile::from_document(&doc).current_level,
                None => {
                    write = write.field(fields::CURRENT_LEVEL, INITIAL_LEVEL);
                    INITIAL_LEVEL
                }
            }
        };

        self.store.set(&path, write, SetMode::Merge).await?;
        info!(user_id, name, current_level, "User name set");
        Ok(UserProfile {
            name: name.to_string(),
            current_level,
        })
    }

    /// Raises the learner's level by one.
    ///
    /// An absent learner counts as level 1 and is created at level 2. This is a
    /// read followed by a write; concurrent increments of the same learner can
    /// collapse into one.
    pub async fn increment_user_level(&self, user_id: &str) -> Result<UserProfile, StoreError> {
        let path = user_path(user_id);
        let profile = self
            .store
            .get(&path)
            .await?
            .map(|doc| UserProfile::from_document(&doc))
            .unwrap_or_else(UserProfile::guest);
        let next_level = profile.current_level.saturating_add(1);

        self.store
            .set(
                &path,
                DocumentWrite::new().field(fields::CURRENT_LEVEL, next_level),
                SetMode::Merge,
            )
            .await?;
        info!(user_id, level = next_level, "User level incremented");
        Ok(UserProfile {
            name: profile.name,
            current_level: next_level,
        })
    }

    /// Stores a newly authored question under a generated id.
    ///
    /// Never deduplicates: identical arguments produce distinct records.
    pub async fn add_math_question(
        &self,
        user_id: &str,
        question: NewMathQuestion,
    ) -> Result<MathQuestion, StoreError> {
        let question_id = auto_id();
        self.insert_math_question(user_id, &question_id, question)
            .await
    }

    /// Stores a newly authored question under a caller-chosen id.
    pub async fn insert_math_question(
        &self,
        user_id: &str,
        question_id: &str,
        question: NewMathQuestion,
    ) -> Result<MathQuestion, StoreError> {
        let level = question.level.max(INITIAL_LEVEL);
        let mut write = DocumentWrite::new()
            .field(fields::QUESTION_TEXT, question.question_text.clone())
            .field(fields::ANSWER, question.answer.clone())
            .field(fields::LEVEL, level)
            .field(fields::CORRECT_COUNT, 0)
            .field(fields::WRONG_COUNT, 0)
            .server_timestamp(fields::CREATED_AT)
            .server_timestamp(fields::UPDATED_AT);
        if let Some(formula) = &question.formula {
            write = write.field(fields::FORMULA, formula.clone());
        }

        self.store
            .create(&questions_path(user_id).doc(question_id), write)
            .await?;
        info!(user_id, question_id, level, "Math question added");

        Ok(MathQuestion {
            id: question_id.to_string(),
            question_text: question.question_text,
            formula: question.formula,
            answer: question.answer,
            level,
            correct_count: 0,
            wrong_count: 0,
        })
    }

    /// Records one attempt at a question.
    ///
    /// Exactly one of the two counters goes up by one. An unseen id is created
    /// with an empty body at the learner's current level and the single tally.
    /// Question text, answer, formula and level are never changed here.
    pub async fn upsert_math_question_result(
        &self,
        user_id: &str,
        question_id: &str,
        outcome: AnswerOutcome,
    ) -> Result<QuestionStats, StoreError> {
        let path = questions_path(user_id).doc(question_id);

        let existing = match self.store.get(&path).await? {
            Some(doc) => Some(MathQuestion::from_document(&doc)),
            None => match self.create_from_result(user_id, &path, outcome).await {
                Ok(stats) => return Ok(stats),
                // Created by someone else in the meantime; count on top of theirs.
                Err(StoreError::AlreadyExists(_)) => self
                    .store
                    .get(&path)
                    .await?
                    .map(|doc| MathQuestion::from_document(&doc)),
                Err(e) => return Err(e),
            },
        };

        self.store
            .set(
                &path,
                DocumentWrite::new()
                    .increment(outcome.counter_field(), 1)
                    .server_timestamp(fields::UPDATED_AT),
                SetMode::Merge,
            )
            .await?;

        let mut stats = existing
            .map(|q| QuestionStats {
                question_id: question_id.to_string(),
                correct_count: q.correct_count,
                wrong_count: q.wrong_count,
            })
            .unwrap_or_else(|| QuestionStats::zeroed(question_id));
        match outcome {
            AnswerOutcome::Correct => stats.correct_count += 1,
            AnswerOutcome::Wrong => stats.wrong_count += 1,
        }
        info!(user_id, question_id, ?outcome, "Question result recorded");
        Ok(stats)
    }

    async fn create_from_result(
        &self,
        user_id: &str,
        path: &DocumentPath,
        outcome: AnswerOutcome,
    ) -> Result<QuestionStats, StoreError> {
        let level = self.get_user_level(user_id).await?.current_level;
        let (correct_count, wrong_count) = match outcome {
            AnswerOutcome::Correct => (1u64, 0u64),
            AnswerOutcome::Wrong => (0, 1),
        };
        let write = DocumentWrite::new()
            .field(fields::QUESTION_TEXT, "")
            .field(fields::ANSWER, "")
            .field(fields::LEVEL, level)
            .field(fields::CORRECT_COUNT, correct_count)
            .field(fields::WRONG_COUNT, wrong_count)
            .server_timestamp(fields::CREATED_AT)
            .server_timestamp(fields::UPDATED_AT);
        self.store.create(path, write).await?;
        info!(user_id, question_id = path.id(), ?outcome, "Question created from result");

        Ok(QuestionStats {
            question_id: path.id().to_string(),
            correct_count,
            wrong_count,
        })
    }

    /// The tally of a question, or zeroes if it does not exist.
    pub async fn get_math_question_stats(
        &self,
        user_id: &str,
        question_id: &str,
    ) -> Result<QuestionStats, StoreError> {
        let stats = match self
            .store
            .get(&questions_path(user_id).doc(question_id))
            .await?
        {
            Some(doc) => {
                let question = MathQuestion::from_document(&doc);
                QuestionStats {
                    question_id: question.id,
                    correct_count: question.correct_count,
                    wrong_count: question.wrong_count,
                }
            }
            None => QuestionStats::zeroed(question_id),
        };
        Ok(stats)
    }
}
