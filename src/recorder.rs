use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// One answered question, shipped to the external progress/mastery service.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionResponse {
    pub user_id: Uuid,
    pub game_id: Uuid,
    pub question_id: String,
    pub answer: String,
    pub is_correct: bool,
    pub time_spent: u32,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Recorder endpoint rejected response: {0}")]
    Rejected(reqwest::StatusCode),
}

/// Recording failures are logged and never interrupt game flow; the score
/// has already been applied locally by the time this runs.
#[async_trait::async_trait]
pub trait ResponseRecorder: Send + Sync {
    async fn record_response(&self, response: QuestionResponse) -> Result<(), RecorderError>;
}

pub struct HttpResponseRecorder {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpResponseRecorder {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait::async_trait]
impl ResponseRecorder for HttpResponseRecorder {
    async fn record_response(&self, response: QuestionResponse) -> Result<(), RecorderError> {
        let http_response = self
            .client
            .post(&self.endpoint)
            .json(&response)
            .send()
            .await?;
        let status = http_response.status();
        if !status.is_success() {
            return Err(RecorderError::Rejected(status));
        }
        Ok(())
    }
}

/// Used when no recorder endpoint is configured.
pub struct NoopRecorder;

#[async_trait::async_trait]
impl ResponseRecorder for NoopRecorder {
    async fn record_response(&self, response: QuestionResponse) -> Result<(), RecorderError> {
        tracing::trace!(
            user.id = %response.user_id,
            question.id = %response.question_id,
            "Response recording disabled, dropping"
        );
        Ok(())
    }
}
