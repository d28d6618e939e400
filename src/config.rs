use crate::error::{ConfigError, Result as AppResult};
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ContentSourceType {
    File,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    pub source_type: ContentSourceType,
    pub file_path: Option<String>,
    pub http_url: Option<String>,
}

/// Defaults applied to newly created game sessions. Individual games may
/// override the player/question knobs at creation time; the throttle and
/// start delay are service-wide.
#[derive(Debug, Clone, Deserialize)]
pub struct GameDefaults {
    #[serde(default = "default_min_players")]
    pub min_players: usize,
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    #[serde(default = "default_question_count")]
    pub question_count: usize,
    #[serde(default = "default_time_per_question")]
    pub time_per_question_secs: u32,
    #[serde(default = "default_start_delay")]
    pub start_delay_secs: u64,
    #[serde(default = "default_throttle_interval")]
    pub broadcast_throttle_ms: u64,
}

impl Default for GameDefaults {
    fn default() -> Self {
        Self {
            min_players: default_min_players(),
            max_players: default_max_players(),
            question_count: default_question_count(),
            time_per_question_secs: default_time_per_question(),
            start_delay_secs: default_start_delay(),
            broadcast_throttle_ms: default_throttle_interval(),
        }
    }
}

fn default_min_players() -> usize {
    2
}
fn default_max_players() -> usize {
    8
}
fn default_question_count() -> usize {
    10
}
fn default_time_per_question() -> u32 {
    30
}
fn default_start_delay() -> u64 {
    3
}
fn default_throttle_interval() -> u64 {
    100
}

/// Optional endpoint for the external progress/mastery recorder. When absent
/// responses are not persisted anywhere (NoopRecorder).
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    pub server: ServerConfig,
    pub content: ContentConfig,
    #[serde(default)]
    pub game: GameDefaults,
    pub recorder: Option<RecorderConfig>,
}

pub fn load_settings() -> AppResult<AppSettings> {
    let builder = Config::builder()
        .add_source(
            Environment::with_prefix("CIVICSYNC")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .try_parsing(true),
        )
        .add_source(File::with_name("config").required(false));

    let settings = builder
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: AppSettings = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    validate_settings(&settings)?;
    Ok(settings)
}

fn validate_settings(settings: &AppSettings) -> Result<(), ConfigError> {
    if settings.game.min_players == 0 {
        return Err(ConfigError::InvalidValue(
            "game.min_players must be at least 1".to_string(),
        ));
    }
    if settings.game.max_players < settings.game.min_players {
        return Err(ConfigError::InvalidValue(format!(
            "game.max_players ({}) is below game.min_players ({})",
            settings.game.max_players, settings.game.min_players
        )));
    }
    if settings.game.question_count == 0 {
        return Err(ConfigError::InvalidValue(
            "game.question_count must be at least 1".to_string(),
        ));
    }
    match settings.content.source_type {
        ContentSourceType::File if settings.content.file_path.is_none() => Err(
            ConfigError::InvalidValue("content.file_path required for file source".to_string()),
        ),
        ContentSourceType::Http if settings.content.http_url.is_none() => Err(
            ConfigError::InvalidValue("content.http_url required for http source".to_string()),
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> AppSettings {
        AppSettings {
            server: ServerConfig {
                port: 8080,
                cors_origins: vec![],
            },
            content: ContentConfig {
                source_type: ContentSourceType::File,
                file_path: Some("questions.json".to_string()),
                http_url: None,
            },
            game: GameDefaults::default(),
            recorder: None,
        }
    }

    #[test]
    fn default_game_settings_are_consistent() {
        let settings = base_settings();
        assert!(validate_settings(&settings).is_ok());
        assert!(settings.game.min_players <= settings.game.max_players);
    }

    #[test]
    fn rejects_max_players_below_min() {
        let mut settings = base_settings();
        settings.game.max_players = 1;
        settings.game.min_players = 4;
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn rejects_file_source_without_path() {
        let mut settings = base_settings();
        settings.content.file_path = None;
        assert!(validate_settings(&settings).is_err());
    }
}
