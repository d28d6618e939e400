use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Load(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("Content configuration error: {0}")]
    Config(String),
    #[error("Failed to read question file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to fetch question data from '{url}': {source}")]
    HttpFetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to parse question data: {0}")]
    Parse(String),
    #[error("Invalid question '{question_id}': {reason}")]
    InvalidQuestion { question_id: String, reason: String },
    #[error("Not enough questions available: wanted {wanted}, have {available}")]
    NotEnoughQuestions { wanted: usize, available: usize },
}

/// Errors produced by one game-session replica.
#[derive(Debug, Error)]
pub enum GameError {
    /// A caller-visible precondition failed (e.g. starting without enough
    /// ready players). Surfaced to the user, never swallowed.
    #[error("Precondition failed: {0}")]
    Precondition(String),
    #[error("Question loading failed: {0}")]
    QuestionLoad(#[from] ContentError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Session is shut down")]
    SessionClosed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Channel '{0}' not found")]
    ChannelNotFound(String),
    #[error("Channel hub unavailable: {0}")]
    HubUnavailable(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Content error: {0}")]
    Content(#[from] ContentError),
    #[error("Game session error: {0}")]
    Game(#[from] GameError),
    #[error("Web server/handler error: {0}")]
    Web(#[from] crate::web::WebError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
