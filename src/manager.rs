use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::GameDefaults;
use crate::content::{BankQuestionSource, QuestionBank, QuestionSource};
use crate::recorder::ResponseRecorder;
use crate::session::engine::{SessionConfig, spawn_session};
use crate::session::state::{GameMode, GameSettings, Player};
use crate::session::SessionActorHandle;
use crate::transport::{ChannelHubHandle, channel_name};

#[derive(Debug, Serialize, Clone)]
pub struct GameDetails {
    pub game_id: Uuid,
    pub host_id: Uuid,
    pub channel: String,
    pub settings: GameSettings,
}

/// Per-game overrides accepted at creation; anything absent falls back to
/// the configured defaults.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct GameSettingsOverrides {
    pub min_players: Option<usize>,
    pub max_players: Option<usize>,
    pub question_count: Option<usize>,
    pub time_per_question: Option<u32>,
    pub mode: Option<GameMode>,
}

#[derive(Debug)]
pub enum GameManagerMessage {
    CreateGame {
        host_name: String,
        overrides: GameSettingsOverrides,
        respond_to: oneshot::Sender<Result<GameDetails, String>>,
    },
    GetSession {
        game_id: Uuid,
        respond_to: oneshot::Sender<Option<SessionActorHandle>>,
    },
    RemoveGame {
        game_id: Uuid,
    },
}

/// Creates game channels and runs the hosted host replica for each game.
/// The creating user drives their replica over HTTP; remote players bring
/// their own replicas through the websocket relay.
pub struct GameManagerActor {
    receiver: mpsc::Receiver<GameManagerMessage>,
    sessions: HashMap<Uuid, SessionActorHandle>,
    hub: ChannelHubHandle,
    question_bank: Arc<QuestionBank>,
    recorder: Arc<dyn ResponseRecorder>,
    defaults: GameDefaults,
}

impl GameManagerActor {
    fn new(
        receiver: mpsc::Receiver<GameManagerMessage>,
        hub: ChannelHubHandle,
        question_bank: Arc<QuestionBank>,
        recorder: Arc<dyn ResponseRecorder>,
        defaults: GameDefaults,
    ) -> Self {
        Self {
            receiver,
            sessions: HashMap::new(),
            hub,
            question_bank,
            recorder,
            defaults,
        }
    }

    fn resolve_settings(&self, overrides: &GameSettingsOverrides) -> Result<GameSettings, String> {
        let settings = GameSettings {
            min_players: overrides.min_players.unwrap_or(self.defaults.min_players),
            max_players: overrides.max_players.unwrap_or(self.defaults.max_players),
            question_count: overrides
                .question_count
                .unwrap_or(self.defaults.question_count),
            time_per_question: overrides
                .time_per_question
                .unwrap_or(self.defaults.time_per_question_secs),
            difficulty: None,
            mode: overrides.mode.unwrap_or_default(),
        };
        if settings.min_players == 0 || settings.question_count == 0 {
            return Err("min_players and question_count must be at least 1".to_string());
        }
        if settings.max_players < settings.min_players {
            return Err(format!(
                "max_players ({}) is below min_players ({})",
                settings.max_players, settings.min_players
            ));
        }
        Ok(settings)
    }

    #[tracing::instrument(skip(self, msg), fields(
        msg_type = %std::any::type_name_of_val(&msg)
    ))]
    async fn handle_message(&mut self, msg: GameManagerMessage) {
        match msg {
            GameManagerMessage::CreateGame {
                host_name,
                overrides,
                respond_to,
            } => {
                let game_id = Uuid::new_v4();
                let host_id = Uuid::new_v4();

                tracing::info!(
                    game.id = %game_id,
                    host.name = %host_name,
                    "Received CreateGame request"
                );

                let settings = match self.resolve_settings(&overrides) {
                    Ok(settings) => settings,
                    Err(reason) => {
                        tracing::warn!(game.id = %game_id, reason = %reason, "Rejected game settings");
                        let _ = respond_to.send(Err(reason));
                        return;
                    }
                };

                let channel = match self.hub.get_or_create_channel(game_id).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        tracing::error!(game.id = %game_id, error = %e, "Failed to create channel");
                        let _ = respond_to.send(Err(e.to_string()));
                        return;
                    }
                };

                let question_source: Arc<dyn QuestionSource> =
                    Arc::new(BankQuestionSource::new(Arc::clone(&self.question_bank)));

                let session = spawn_session(SessionConfig {
                    game_id,
                    local_player: Player::new(host_id, host_name, true),
                    is_host: true,
                    settings: settings.clone(),
                    transport: Arc::new(channel),
                    question_source,
                    recorder: Arc::clone(&self.recorder),
                    throttle_interval: Duration::from_millis(self.defaults.broadcast_throttle_ms),
                    start_delay: Duration::from_secs(self.defaults.start_delay_secs),
                })
                .await;

                self.sessions.insert(game_id, session);

                tracing::info!(
                    game.id = %game_id,
                    host.id = %host_id,
                    "Created game successfully"
                );

                let _ = respond_to.send(Ok(GameDetails {
                    game_id,
                    host_id,
                    channel: channel_name(game_id),
                    settings,
                }));
            }
            GameManagerMessage::GetSession {
                game_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.sessions.get(&game_id).cloned());
            }
            GameManagerMessage::RemoveGame { game_id } => {
                if let Some(session) = self.sessions.remove(&game_id) {
                    tracing::info!(game.id = %game_id, "Removing game");
                    session.cleanup().await;
                    self.hub.remove_channel(game_id).await;
                } else {
                    tracing::warn!(game.id = %game_id, "Remove requested for unknown game");
                }
            }
        }
    }
}

#[tracing::instrument(skip(actor))]
pub async fn run_game_manager_actor(mut actor: GameManagerActor) {
    tracing::info!("GameManager actor started");
    while let Some(msg) = actor.receiver.recv().await {
        actor.handle_message(msg).await;
    }
    tracing::info!("GameManager actor stopped");
}

#[derive(Clone, Debug)]
pub struct GameManagerHandle {
    sender: mpsc::Sender<GameManagerMessage>,
}

impl GameManagerHandle {
    pub fn spawn(
        buffer_size: usize,
        hub: ChannelHubHandle,
        question_bank: Arc<QuestionBank>,
        recorder: Arc<dyn ResponseRecorder>,
        defaults: GameDefaults,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let actor = GameManagerActor::new(receiver, hub, question_bank, recorder, defaults);
        tokio::spawn(run_game_manager_actor(actor));
        Self { sender }
    }

    pub async fn create_game(
        &self,
        host_name: String,
        overrides: GameSettingsOverrides,
    ) -> Result<GameDetails, String> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(GameManagerMessage::CreateGame {
                host_name,
                overrides,
                respond_to,
            })
            .await
            .map_err(|e| format!("Failed to send CreateGame: {}", e))?;
        rx.await
            .map_err(|e| format!("GameManager no response: {}", e))?
    }

    pub async fn get_session(&self, game_id: Uuid) -> Option<SessionActorHandle> {
        let (respond_to, rx) = oneshot::channel();
        if self
            .sender
            .send(GameManagerMessage::GetSession {
                game_id,
                respond_to,
            })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn remove_game(&self, game_id: Uuid) -> Result<(), String> {
        self.sender
            .send(GameManagerMessage::RemoveGame { game_id })
            .await
            .map_err(|e| format!("Failed to send RemoveGame: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::sample_question;
    use crate::recorder::NoopRecorder;

    fn manager_with_bank() -> GameManagerHandle {
        let bank = Arc::new(QuestionBank::from_questions(vec![
            sample_question("q1", "A", "B"),
            sample_question("q2", "C", "D"),
            sample_question("q3", "E", "F"),
        ]));
        let hub = ChannelHubHandle::spawn(16, 64);
        GameManagerHandle::spawn(
            16,
            hub,
            bank,
            Arc::new(NoopRecorder),
            GameDefaults {
                question_count: 3,
                start_delay_secs: 0,
                broadcast_throttle_ms: 10,
                ..GameDefaults::default()
            },
        )
    }

    #[tokio::test]
    async fn create_game_spawns_a_hosted_replica() {
        let manager = manager_with_bank();
        let details = manager
            .create_game("host".to_string(), GameSettingsOverrides::default())
            .await
            .unwrap();

        assert_eq!(details.channel, format!("game_{}", details.game_id));

        let session = manager.get_session(details.game_id).await.unwrap();
        let state = session.state().await.unwrap();
        assert_eq!(state.players.len(), 1);
        assert!(state.is_host(details.host_id));
    }

    #[tokio::test]
    async fn invalid_overrides_are_rejected() {
        let manager = manager_with_bank();
        let result = manager
            .create_game(
                "host".to_string(),
                GameSettingsOverrides {
                    min_players: Some(5),
                    max_players: Some(2),
                    ..GameSettingsOverrides::default()
                },
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn removed_games_are_unreachable() {
        let manager = manager_with_bank();
        let details = manager
            .create_game("host".to_string(), GameSettingsOverrides::default())
            .await
            .unwrap();
        manager.remove_game(details.game_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.get_session(details.game_id).await.is_none());
    }
}
