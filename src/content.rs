use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{ContentConfig, ContentSourceType};
use crate::error::ContentError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// One civics quiz item. `correct_answer` is always an element of `options`;
/// the bank rejects anything else at load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CivicsQuestion {
    pub id: String,
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub difficulty: Difficulty,
    pub topic_id: String,
}

#[derive(Debug, Deserialize)]
struct QuestionFile {
    questions: Vec<CivicsQuestion>,
}

fn parse_question_data(content: &str) -> Result<Vec<CivicsQuestion>, ContentError> {
    let data: QuestionFile = serde_json::from_str(content)
        .map_err(|e| ContentError::Parse(format!("Failed to parse JSON: {}", e)))?;

    for question in &data.questions {
        if question.options.len() < 2 {
            return Err(ContentError::InvalidQuestion {
                question_id: question.id.clone(),
                reason: "fewer than two answer options".to_string(),
            });
        }
        if !question.options.contains(&question.correct_answer) {
            return Err(ContentError::InvalidQuestion {
                question_id: question.id.clone(),
                reason: "correct answer is not among the options".to_string(),
            });
        }
    }

    Ok(data.questions)
}

#[tracing::instrument(skip(config), fields(
    content.source_type = ?config.source_type,
    content.file_path = ?config.file_path,
    content.http_url = ?config.http_url
))]
async fn load_raw_content(config: &ContentConfig) -> Result<String, ContentError> {
    match config.source_type {
        ContentSourceType::File => {
            let file_path = config.file_path.as_ref().ok_or_else(|| {
                ContentError::Config("File path required for file source".to_string())
            })?;
            tracing::debug!(file.path = %file_path, "Loading questions from file");
            tokio::fs::read_to_string(file_path)
                .await
                .map_err(|e| ContentError::FileRead {
                    path: file_path.clone(),
                    source: e,
                })
        }
        ContentSourceType::Http => {
            let url = config.http_url.as_ref().ok_or_else(|| {
                ContentError::Config("HTTP URL required for http source".to_string())
            })?;
            tracing::debug!(http.url = %url, "Fetching questions from URL");
            let response = reqwest::get(url).await.map_err(|e| ContentError::HttpFetch {
                url: url.clone(),
                source: e,
            })?;
            response.text().await.map_err(|e| ContentError::HttpFetch {
                url: url.clone(),
                source: e,
            })
        }
    }
}

/// Cached question bank shared by all game sessions. Refreshable at runtime
/// without disturbing sessions that already drew their question sets.
pub struct QuestionBank {
    questions: RwLock<Arc<Vec<CivicsQuestion>>>,
    content_config: ContentConfig,
}

impl QuestionBank {
    #[tracing::instrument(skip(config))]
    pub async fn new(config: ContentConfig) -> Result<Self, ContentError> {
        let raw = load_raw_content(&config).await?;
        let questions = parse_question_data(&raw)?;
        tracing::info!(
            questions.count = questions.len(),
            "QuestionBank initialized"
        );
        Ok(Self {
            questions: RwLock::new(Arc::new(questions)),
            content_config: config,
        })
    }

    /// Builds a bank directly from already-validated questions. Used by
    /// session tests; production loading goes through `new`.
    pub fn from_questions(questions: Vec<CivicsQuestion>) -> Self {
        Self {
            questions: RwLock::new(Arc::new(questions)),
            content_config: ContentConfig {
                source_type: ContentSourceType::File,
                file_path: None,
                http_url: None,
            },
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), ContentError> {
        let raw = load_raw_content(&self.content_config).await?;
        let new_questions = parse_question_data(&raw)?;
        let mut guard = self.questions.write().await;
        *guard = Arc::new(new_questions);
        tracing::info!(questions.count = guard.len(), "Refreshed question bank");
        Ok(())
    }

    pub async fn all(&self) -> Arc<Vec<CivicsQuestion>> {
        self.questions.read().await.clone()
    }

    /// Random sample of `count` distinct questions.
    pub async fn draw(&self, count: usize) -> Result<Vec<CivicsQuestion>, ContentError> {
        let questions = self.questions.read().await;
        if questions.len() < count {
            return Err(ContentError::NotEnoughQuestions {
                wanted: count,
                available: questions.len(),
            });
        }
        let drawn = questions
            .choose_multiple(&mut thread_rng(), count)
            .cloned()
            .collect();
        Ok(drawn)
    }
}

/// Seam the session engine loads its question set through. Failure here is
/// fatal to `start_game` and propagated to the caller.
#[async_trait::async_trait]
pub trait QuestionSource: Send + Sync {
    async fn load_questions(&self, count: usize) -> Result<Vec<CivicsQuestion>, ContentError>;
}

pub struct BankQuestionSource {
    bank: Arc<QuestionBank>,
}

impl BankQuestionSource {
    pub fn new(bank: Arc<QuestionBank>) -> Self {
        Self { bank }
    }
}

#[async_trait::async_trait]
impl QuestionSource for BankQuestionSource {
    async fn load_questions(&self, count: usize) -> Result<Vec<CivicsQuestion>, ContentError> {
        self.bank.draw(count).await
    }
}

#[cfg(test)]
pub(crate) fn sample_question(id: &str, correct: &str, wrong: &str) -> CivicsQuestion {
    CivicsQuestion {
        id: id.to_string(),
        question: format!("Question {}", id),
        options: vec![correct.to_string(), wrong.to_string()],
        correct_answer: correct.to_string(),
        explanation: None,
        difficulty: Difficulty::Medium,
        topic_id: "constitution".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_question_data() {
        let raw = r#"{
            "questions": [{
                "id": "q1",
                "question": "What are the three branches of government?",
                "options": [
                    "Executive, Legislative, Judicial",
                    "Federal, State, Local"
                ],
                "correct_answer": "Executive, Legislative, Judicial",
                "explanation": "Separation of powers.",
                "difficulty": "easy",
                "topic_id": "government_structure"
            }]
        }"#;
        let questions = parse_question_data(raw).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].difficulty, Difficulty::Easy);
    }

    #[test]
    fn rejects_correct_answer_outside_options() {
        let raw = r#"{
            "questions": [{
                "id": "q1",
                "question": "Pick one",
                "options": ["A", "B"],
                "correct_answer": "C",
                "difficulty": "easy",
                "topic_id": "t"
            }]
        }"#;
        assert!(matches!(
            parse_question_data(raw),
            Err(ContentError::InvalidQuestion { .. })
        ));
    }

    #[tokio::test]
    async fn draw_returns_distinct_questions() {
        let bank = QuestionBank::from_questions(vec![
            sample_question("q1", "A", "B"),
            sample_question("q2", "C", "D"),
            sample_question("q3", "E", "F"),
        ]);
        let drawn = bank.draw(3).await.unwrap();
        let ids: std::collections::HashSet<_> = drawn.iter().map(|q| q.id.clone()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn draw_fails_when_bank_is_too_small() {
        let bank = QuestionBank::from_questions(vec![sample_question("q1", "A", "B")]);
        assert!(matches!(
            bank.draw(5).await,
            Err(ContentError::NotEnoughQuestions { .. })
        ));
    }
}
