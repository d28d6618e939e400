use chrono::Utc;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::content::QuestionSource;
use crate::error::GameError;
use crate::recorder::{QuestionResponse, ResponseRecorder};
use crate::session::broadcast::ThrottledBroadcaster;
use crate::session::merge::{self, MergeContext};
use crate::session::messages::{AnswerPayload, PlayerAction, SessionPatch, WireMessage};
use crate::session::presence;
use crate::session::state::{GameSession, GameSettings, Player, PlayerAnswer, SessionStatus};
use crate::transport::{ChannelEvent, PresenceRecord, PresenceStatus, RealtimeTransport};

/// Observer invoked with a fresh snapshot after every state change. Panics
/// are caught and logged; one misbehaving observer never affects the others
/// or the session itself.
pub type StateListener = Box<dyn Fn(&GameSession) + Send + Sync>;

pub struct SessionConfig {
    pub game_id: Uuid,
    pub local_player: Player,
    pub is_host: bool,
    pub settings: GameSettings,
    pub transport: Arc<dyn RealtimeTransport>,
    pub question_source: Arc<dyn QuestionSource>,
    pub recorder: Arc<dyn ResponseRecorder>,
    pub throttle_interval: Duration,
    pub start_delay: Duration,
}

enum SessionCommand {
    StartGame {
        respond_to: oneshot::Sender<Result<(), GameError>>,
    },
    NextQuestion {
        respond_to: oneshot::Sender<Result<(), GameError>>,
    },
    SubmitAnswer {
        answer: String,
        respond_to: oneshot::Sender<Result<Option<PlayerAnswer>, GameError>>,
    },
    SetReady {
        is_ready: bool,
    },
    ClaimHost,
    Cancel {
        respond_to: oneshot::Sender<Result<(), GameError>>,
    },
    GetState {
        respond_to: oneshot::Sender<GameSession>,
    },
    AddListener {
        listener: StateListener,
    },
    Cleanup {
        respond_to: oneshot::Sender<()>,
    },
    // Internal.
    AnnounceJoin,
    Inbound(ChannelEvent),
    BeginPlay,
}

struct SessionActor {
    receiver: mpsc::Receiver<SessionCommand>,
    self_sender: mpsc::Sender<SessionCommand>,
    session: GameSession,
    local_player_id: Uuid,
    merge_ctx: MergeContext,
    transport: Arc<dyn RealtimeTransport>,
    broadcaster: Arc<ThrottledBroadcaster>,
    question_source: Arc<dyn QuestionSource>,
    recorder: Arc<dyn ResponseRecorder>,
    listeners: Vec<StateListener>,
    start_delay: Duration,
    cleaned_up: bool,
    pump_task: Option<tokio::task::JoinHandle<()>>,
}

impl SessionActor {
    fn notify_listeners(&self) {
        if self.listeners.is_empty() {
            return;
        }
        let snapshot = self.session.snapshot();
        for (index, listener) in self.listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                tracing::error!(
                    game.id = %self.session.game_id,
                    listener.index = index,
                    "State listener panicked; continuing with remaining listeners"
                );
            }
        }
    }

    fn presence_record(&self) -> PresenceRecord {
        PresenceRecord {
            user_id: self.local_player_id,
            status: PresenceStatus::Online,
            last_seen: Utc::now(),
            current_question: (self.session.status == SessionStatus::InProgress)
                .then_some(self.session.current_question_index),
        }
    }

    async fn publish_presence(&self) {
        if let Err(e) = self.broadcaster.update_presence(self.presence_record()).await {
            tracing::warn!(
                game.id = %self.session.game_id,
                error = %e,
                "Failed to publish presence"
            );
        }
    }

    async fn broadcast_patch(&self, patch: SessionPatch) {
        if let Err(e) = self.broadcaster.broadcast_game_update(patch).await {
            tracing::warn!(
                game.id = %self.session.game_id,
                error = %e,
                "Failed to broadcast game update"
            );
        }
    }

    async fn broadcast_action(&self, action: PlayerAction) {
        if let Err(e) = self.broadcaster.broadcast_player_action(action).await {
            tracing::warn!(
                game.id = %self.session.game_id,
                error = %e,
                "Failed to broadcast player action"
            );
        }
    }

    async fn handle_start_game(&mut self) -> Result<(), GameError> {
        if !self.session.is_host(self.local_player_id) {
            return Err(GameError::Precondition(
                "only the host can start the game".to_string(),
            ));
        }
        if !self.session.can_start_game() {
            let reason = if self.session.status != SessionStatus::Waiting {
                "the game has already started".to_string()
            } else if self.session.players.len() < self.session.settings.min_players {
                format!(
                    "not enough players: {} of {} required",
                    self.session.players.len(),
                    self.session.settings.min_players
                )
            } else {
                "all players must be ready".to_string()
            };
            return Err(GameError::Precondition(reason));
        }

        // Question load failure is fatal to start_game and propagated.
        let questions = self
            .question_source
            .load_questions(self.session.settings.question_count)
            .await?;

        tracing::info!(
            game.id = %self.session.game_id,
            questions.count = questions.len(),
            "Starting game"
        );

        self.session.current_question = questions.first().cloned();
        self.session.questions = questions;
        self.session.current_question_index = 0;
        self.session.time_remaining = self.session.settings.time_per_question;
        self.session.answers.clear();
        self.session.status = SessionStatus::Starting;

        self.broadcast_patch(self.session.full_patch()).await;
        self.publish_presence().await;
        self.notify_listeners();

        let self_sender = self.self_sender.clone();
        let delay = self.start_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = self_sender.send(SessionCommand::BeginPlay).await;
        });

        Ok(())
    }

    async fn handle_begin_play(&mut self) {
        if self.session.status != SessionStatus::Starting {
            return;
        }
        self.session.status = SessionStatus::InProgress;
        tracing::info!(game.id = %self.session.game_id, "Game in progress");
        self.broadcast_patch(SessionPatch {
            status: Some(SessionStatus::InProgress),
            ..SessionPatch::default()
        })
        .await;
        self.publish_presence().await;
        self.notify_listeners();
    }

    /// Host-only. Advances to the next question or completes the session.
    /// Calling as a non-host changes nothing and sends nothing.
    async fn handle_next_question(&mut self) -> Result<(), GameError> {
        if !self.session.is_host(self.local_player_id) {
            tracing::debug!(
                game.id = %self.session.game_id,
                "next_question ignored: local player is not the host"
            );
            return Ok(());
        }
        if self.session.status != SessionStatus::InProgress {
            return Ok(());
        }

        let next_index = self.session.current_question_index + 1;
        if next_index >= self.session.questions.len() {
            self.session.status = SessionStatus::Completed;
            tracing::info!(game.id = %self.session.game_id, "Game completed");
            self.broadcast_patch(SessionPatch {
                status: Some(SessionStatus::Completed),
                ..SessionPatch::default()
            })
            .await;
        } else {
            self.session.current_question_index = next_index;
            self.session.current_question = self.session.questions.get(next_index).cloned();
            self.session.time_remaining = self.session.settings.time_per_question;
            self.session.answers.clear();
            self.broadcast_patch(SessionPatch {
                current_question_index: Some(next_index),
                current_question: self.session.current_question.clone(),
                time_remaining: Some(self.session.time_remaining),
                answers: Some(Vec::new()),
                ..SessionPatch::default()
            })
            .await;
        }
        self.publish_presence().await;
        self.notify_listeners();
        Ok(())
    }

    async fn handle_submit_answer(
        &mut self,
        answer: String,
    ) -> Result<Option<PlayerAnswer>, GameError> {
        if self.session.status != SessionStatus::InProgress {
            tracing::debug!(
                game.id = %self.session.game_id,
                status = ?self.session.status,
                "submit_answer ignored: game not in progress"
            );
            return Ok(None);
        }
        let Some(question) = self.session.current_question.clone() else {
            return Ok(None);
        };
        if self
            .session
            .answers
            .iter()
            .any(|a| a.player_id == self.local_player_id)
        {
            return Ok(None);
        }

        let is_correct = answer == question.correct_answer;
        let time_spent = self
            .session
            .settings
            .time_per_question
            .saturating_sub(self.session.time_remaining);
        let answered_at = Utc::now();

        let player_answer = PlayerAnswer {
            player_id: self.local_player_id,
            question_id: question.id.clone(),
            answer: answer.clone(),
            time_spent,
            is_correct,
            timestamp: answered_at,
        };
        self.session.answers.push(player_answer.clone());

        // Optimistic local score for immediate UI feedback; remote replicas
        // apply the same increment when the action arrives.
        if is_correct
            && let Some(player) = self.session.player_mut(self.local_player_id)
        {
            player.score += 1;
        }

        let response = QuestionResponse {
            user_id: self.local_player_id,
            game_id: self.session.game_id,
            question_id: question.id.clone(),
            answer: answer.clone(),
            is_correct,
            time_spent,
            answered_at,
        };
        let recorder = Arc::clone(&self.recorder);
        tokio::spawn(async move {
            if let Err(e) = recorder.record_response(response).await {
                tracing::warn!(
                    error = %e,
                    "Failed to record question response; game flow unaffected"
                );
            }
        });

        self.broadcast_action(PlayerAction::Answer(AnswerPayload {
            question_id: question.id,
            answer,
            time_spent,
            is_correct,
            answered_at,
        }))
        .await;

        self.notify_listeners();
        Ok(Some(player_answer))
    }

    async fn handle_set_ready(&mut self, is_ready: bool) {
        if let Some(player) = self.session.player_mut(self.local_player_id) {
            player.is_ready = is_ready;
        }
        self.broadcast_action(PlayerAction::Ready { is_ready }).await;
        self.notify_listeners();
    }

    async fn handle_claim_host(&mut self) {
        let term = self.session.host_term + 1;
        self.session.assign_host(term, self.local_player_id);
        self.broadcast_action(PlayerAction::ClaimHost { term }).await;
        self.notify_listeners();
    }

    async fn handle_cancel(&mut self) -> Result<(), GameError> {
        if self.session.status.is_terminal() {
            return Ok(());
        }
        self.session.status = SessionStatus::Cancelled;
        tracing::info!(game.id = %self.session.game_id, "Game cancelled");
        self.broadcast_patch(SessionPatch {
            status: Some(SessionStatus::Cancelled),
            ..SessionPatch::default()
        })
        .await;
        self.notify_listeners();
        Ok(())
    }

    async fn handle_inbound(&mut self, event: ChannelEvent) {
        let changed = match event {
            ChannelEvent::Broadcast(message) => {
                let was_join = matches!(
                    &message,
                    WireMessage::PlayerAction(envelope)
                        if matches!(envelope.action, PlayerAction::Join { .. })
                );
                let changed =
                    merge::apply_wire_message(&mut self.session, &mut self.merge_ctx, message);
                // The host answers each accepted join with a full snapshot so
                // the newcomer's replica converges immediately.
                if changed && was_join && self.session.is_host(self.local_player_id) {
                    self.broadcast_patch(self.session.full_patch()).await;
                }
                changed
            }
            ChannelEvent::PresenceSync(map) => presence::apply_presence_sync(&mut self.session, &map),
            ChannelEvent::PresenceJoin(record) => {
                presence::apply_presence_join(&mut self.session, &record)
            }
            ChannelEvent::PresenceLeave { user_id, last_seen } => {
                presence::apply_presence_leave(&mut self.session, user_id, last_seen)
            }
        };
        if changed {
            self.notify_listeners();
        }
    }

    /// One-second countdown while the game is running. Only the host's
    /// replica drives the clock; everyone else receives it as patches.
    async fn handle_tick(&mut self) {
        if self.session.status != SessionStatus::InProgress
            || !self.session.is_host(self.local_player_id)
        {
            return;
        }
        self.session.time_remaining = self.session.time_remaining.saturating_sub(1);
        if self.session.time_remaining == 0 {
            if let Err(e) = self.handle_next_question().await {
                tracing::warn!(
                    game.id = %self.session.game_id,
                    error = %e,
                    "Auto-advance on timeout failed"
                );
            }
            return;
        }
        self.broadcast_patch(SessionPatch {
            time_remaining: Some(self.session.time_remaining),
            ..SessionPatch::default()
        })
        .await;
        self.notify_listeners();
    }

    async fn handle_cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        tracing::info!(game.id = %self.session.game_id, "Session cleanup");
        if let Err(e) = self.transport.untrack(self.local_player_id).await {
            tracing::warn!(
                game.id = %self.session.game_id,
                error = %e,
                "Failed to untrack presence during cleanup"
            );
        }
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        self.listeners.clear();
    }

    /// Returns true when the actor should shut down.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::StartGame { respond_to } => {
                let result = self.handle_start_game().await;
                let _ = respond_to.send(result);
            }
            SessionCommand::NextQuestion { respond_to } => {
                let result = self.handle_next_question().await;
                let _ = respond_to.send(result);
            }
            SessionCommand::SubmitAnswer { answer, respond_to } => {
                let result = self.handle_submit_answer(answer).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::SetReady { is_ready } => {
                self.handle_set_ready(is_ready).await;
            }
            SessionCommand::ClaimHost => {
                self.handle_claim_host().await;
            }
            SessionCommand::Cancel { respond_to } => {
                let result = self.handle_cancel().await;
                let _ = respond_to.send(result);
            }
            SessionCommand::GetState { respond_to } => {
                let _ = respond_to.send(self.session.snapshot());
            }
            SessionCommand::AddListener { listener } => {
                self.listeners.push(listener);
            }
            SessionCommand::Cleanup { respond_to } => {
                self.handle_cleanup().await;
                let _ = respond_to.send(());
                return true;
            }
            SessionCommand::AnnounceJoin => {
                let name = self
                    .session
                    .player(self.local_player_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                self.broadcast_action(PlayerAction::Join { name }).await;
            }
            SessionCommand::Inbound(event) => {
                self.handle_inbound(event).await;
            }
            SessionCommand::BeginPlay => {
                self.handle_begin_play().await;
            }
        }
        false
    }
}

#[tracing::instrument(skip(actor), fields(
    game.id = %actor.session.game_id,
    player.id = %actor.local_player_id
))]
async fn run_session_actor(mut actor: SessionActor) {
    tracing::info!("Session actor started");

    // Initial presence publish plus a sync of whoever is already there.
    actor.publish_presence().await;
    match actor.transport.presence_state().await {
        Ok(map) => {
            if presence::apply_presence_sync(&mut actor.session, &map) {
                actor.notify_listeners();
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read initial presence state");
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // First tick resolves immediately.

    loop {
        tokio::select! {
            maybe_command = actor.receiver.recv() => {
                match maybe_command {
                    Some(command) => {
                        if actor.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        tracing::info!("Session command channel closed");
                        actor.handle_cleanup().await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                actor.handle_tick().await;
            }
        }
    }

    tracing::info!("Session actor stopped");
}

#[derive(Clone, Debug)]
pub struct SessionActorHandle {
    sender: mpsc::Sender<SessionCommand>,
    pub game_id: Uuid,
    pub player_id: Uuid,
}

/// Spawns one replica of a game session on top of the given transport. The
/// replica immediately subscribes, publishes presence, and (for guests)
/// announces itself with a join action.
pub async fn spawn_session(config: SessionConfig) -> SessionActorHandle {
    let SessionConfig {
        game_id,
        local_player,
        is_host,
        settings,
        transport,
        question_source,
        recorder,
        throttle_interval,
        start_delay,
    } = config;

    let local_player_id = local_player.id;
    let session = if is_host {
        GameSession::new(game_id, local_player, settings)
    } else {
        GameSession::new_guest(game_id, local_player, settings)
    };

    let broadcaster = ThrottledBroadcaster::new(
        Arc::clone(&transport),
        local_player_id,
        throttle_interval,
    );

    let (sender, receiver) = mpsc::channel(64);

    // Pump transport events into the actor's mailbox.
    let mut events = transport.subscribe();
    let pump_sender = sender.clone();
    let pump_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if pump_sender.send(SessionCommand::Inbound(event)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    // At-least-once with no ordering guarantee: consumers
                    // already treat every patch as potentially stale.
                    tracing::warn!(skipped, "Transport receiver lagged, events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let actor = SessionActor {
        receiver,
        self_sender: sender.clone(),
        merge_ctx: MergeContext::new(local_player_id),
        session,
        local_player_id,
        transport,
        broadcaster,
        question_source,
        recorder,
        listeners: Vec::new(),
        start_delay,
        cleaned_up: false,
        pump_task: Some(pump_task),
    };

    let handle = SessionActorHandle {
        sender,
        game_id,
        player_id: local_player_id,
    };

    tokio::spawn(run_session_actor(actor));

    if !is_host {
        // Announce ourselves so existing replicas add us and the host
        // replies with a full snapshot.
        let _ = handle.sender.send(SessionCommand::AnnounceJoin).await;
    }

    handle
}

impl SessionActorHandle {
    async fn request<T>(
        &self,
        make_command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, GameError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(make_command(respond_to))
            .await
            .map_err(|_| GameError::SessionClosed)?;
        rx.await.map_err(|_| GameError::SessionClosed)
    }

    pub async fn start_game(&self) -> Result<(), GameError> {
        self.request(|respond_to| SessionCommand::StartGame { respond_to })
            .await?
    }

    pub async fn next_question(&self) -> Result<(), GameError> {
        self.request(|respond_to| SessionCommand::NextQuestion { respond_to })
            .await?
    }

    pub async fn submit_answer(&self, answer: String) -> Result<Option<PlayerAnswer>, GameError> {
        self.request(|respond_to| SessionCommand::SubmitAnswer { answer, respond_to })
            .await?
    }

    pub async fn set_ready(&self, is_ready: bool) -> Result<(), GameError> {
        self.sender
            .send(SessionCommand::SetReady { is_ready })
            .await
            .map_err(|_| GameError::SessionClosed)
    }

    pub async fn claim_host(&self) -> Result<(), GameError> {
        self.sender
            .send(SessionCommand::ClaimHost)
            .await
            .map_err(|_| GameError::SessionClosed)
    }

    pub async fn cancel(&self) -> Result<(), GameError> {
        self.request(|respond_to| SessionCommand::Cancel { respond_to })
            .await?
    }

    pub async fn state(&self) -> Result<GameSession, GameError> {
        self.request(|respond_to| SessionCommand::GetState { respond_to })
            .await
    }

    pub async fn on_state_change(&self, listener: StateListener) -> Result<(), GameError> {
        self.sender
            .send(SessionCommand::AddListener { listener })
            .await
            .map_err(|_| GameError::SessionClosed)
    }

    /// Idempotent teardown: unsubscribes, untracks presence and stops the
    /// actor. Safe to call on an already-cleaned session.
    pub async fn cleanup(&self) {
        let (respond_to, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Cleanup { respond_to })
            .await
            .is_err()
        {
            // Actor already gone: nothing left to clean.
            return;
        }
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{CivicsQuestion, sample_question};
    use crate::error::ContentError;
    use crate::recorder::{NoopRecorder, RecorderError};
    use crate::session::state::GameMode;
    use crate::transport::ChannelHubHandle;
    use std::sync::Mutex;

    struct FixedQuestions(Vec<CivicsQuestion>);

    #[async_trait::async_trait]
    impl QuestionSource for FixedQuestions {
        async fn load_questions(
            &self,
            count: usize,
        ) -> Result<Vec<CivicsQuestion>, ContentError> {
            if self.0.len() < count {
                return Err(ContentError::NotEnoughQuestions {
                    wanted: count,
                    available: self.0.len(),
                });
            }
            Ok(self.0[..count].to_vec())
        }
    }

    struct FailingRecorder;

    #[async_trait::async_trait]
    impl ResponseRecorder for FailingRecorder {
        async fn record_response(
            &self,
            _response: QuestionResponse,
        ) -> Result<(), RecorderError> {
            Err(RecorderError::Rejected(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }

    fn test_settings() -> GameSettings {
        GameSettings {
            min_players: 2,
            max_players: 8,
            question_count: 2,
            time_per_question: 30,
            difficulty: None,
            mode: GameMode::Classic,
        }
    }

    fn branches_question() -> CivicsQuestion {
        CivicsQuestion {
            id: "q-branches".to_string(),
            question: "What are the three branches of government?".to_string(),
            options: vec![
                "Executive, Legislative, Judicial".to_string(),
                "Federal, State, Local".to_string(),
            ],
            correct_answer: "Executive, Legislative, Judicial".to_string(),
            explanation: None,
            difficulty: crate::content::Difficulty::Easy,
            topic_id: "government_structure".to_string(),
        }
    }

    async fn spawn_pair(
        recorder: Arc<dyn ResponseRecorder>,
    ) -> (SessionActorHandle, SessionActorHandle) {
        let hub = ChannelHubHandle::spawn(16, 64);
        let game_id = Uuid::new_v4();
        let channel = hub.get_or_create_channel(game_id).await.unwrap();
        let source: Arc<dyn QuestionSource> = Arc::new(FixedQuestions(vec![
            branches_question(),
            sample_question("q2", "1787", "1776"),
        ]));

        let host = spawn_session(SessionConfig {
            game_id,
            local_player: Player::new(Uuid::new_v4(), "host", true),
            is_host: true,
            settings: test_settings(),
            transport: Arc::new(channel.clone()),
            question_source: Arc::clone(&source),
            recorder: Arc::clone(&recorder),
            throttle_interval: Duration::from_millis(10),
            start_delay: Duration::from_millis(30),
        })
        .await;

        let guest = spawn_session(SessionConfig {
            game_id,
            local_player: Player::new(Uuid::new_v4(), "guest", false),
            is_host: false,
            settings: test_settings(),
            transport: Arc::new(channel),
            question_source: source,
            recorder,
            throttle_interval: Duration::from_millis(10),
            start_delay: Duration::from_millis(30),
        })
        .await;

        // Let the join announcement and the host's snapshot reply propagate.
        tokio::time::sleep(Duration::from_millis(100)).await;
        (host, guest)
    }

    #[tokio::test]
    async fn guest_join_converges_on_both_replicas() {
        let (host, guest) = spawn_pair(Arc::new(NoopRecorder)).await;

        let host_view = host.state().await.unwrap();
        assert_eq!(host_view.players.len(), 2);

        let guest_view = guest.state().await.unwrap();
        assert_eq!(guest_view.players.len(), 2);
        assert_eq!(guest_view.host_id, host.player_id);
        assert!(!guest_view.is_host(guest.player_id));
    }

    #[tokio::test]
    async fn start_game_fails_without_ready_players() {
        let (host, _guest) = spawn_pair(Arc::new(NoopRecorder)).await;

        let result = host.start_game().await;
        assert!(matches!(result, Err(GameError::Precondition(_))));
        assert_eq!(host.state().await.unwrap().status, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn full_round_trip_from_ready_to_completed() {
        let (host, guest) = spawn_pair(Arc::new(NoopRecorder)).await;

        guest.set_ready(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(host.state().await.unwrap().can_start_game());

        host.start_game().await.unwrap();
        assert_eq!(host.state().await.unwrap().status, SessionStatus::Starting);

        // After the fixed delay the host flips to in_progress and the guest
        // follows via the broadcast patch.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let host_view = host.state().await.unwrap();
        assert_eq!(host_view.status, SessionStatus::InProgress);
        assert_eq!(host_view.current_question_index, 0);
        assert!(
            host_view.current_question_index < host_view.questions.len(),
            "index must stay within the question list while in progress"
        );
        let guest_view = guest.state().await.unwrap();
        assert_eq!(guest_view.status, SessionStatus::InProgress);
        assert_eq!(guest_view.questions.len(), 2);

        // Guest answers the civics question correctly.
        let answer = guest
            .submit_answer("Executive, Legislative, Judicial".to_string())
            .await
            .unwrap()
            .expect("answer should be accepted while in progress");
        assert!(answer.is_correct);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let host_view = host.state().await.unwrap();
        assert_eq!(host_view.player(guest.player_id).unwrap().score, 1);
        assert_eq!(host_view.answers.len(), 1);

        // Advance past both questions.
        host.next_question().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let host_view = host.state().await.unwrap();
        assert_eq!(host_view.current_question_index, 1);
        assert!(host_view.answers.is_empty());
        assert_eq!(
            host_view.time_remaining,
            host_view.settings.time_per_question
        );

        host.next_question().await.unwrap();
        let completed = host.state().await.unwrap();
        assert_eq!(completed.status, SessionStatus::Completed);

        // Completed is terminal: further calls change nothing.
        host.next_question().await.unwrap();
        let after = host.state().await.unwrap();
        assert_eq!(after.status, SessionStatus::Completed);
        assert_eq!(
            after.current_question_index,
            completed.current_question_index
        );
    }

    #[tokio::test]
    async fn non_host_next_question_is_a_silent_no_op() {
        let (host, guest) = spawn_pair(Arc::new(NoopRecorder)).await;

        let before = host.state().await.unwrap();
        guest.next_question().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let after = host.state().await.unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.current_question_index, before.current_question_index);
    }

    #[tokio::test]
    async fn submit_answer_is_ignored_outside_in_progress() {
        let (_host, guest) = spawn_pair(Arc::new(NoopRecorder)).await;
        let outcome = guest.submit_answer("anything".to_string()).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn second_answer_for_same_question_is_ignored() {
        let (host, guest) = spawn_pair(Arc::new(NoopRecorder)).await;
        guest.set_ready(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.start_game().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = guest
            .submit_answer("Executive, Legislative, Judicial".to_string())
            .await
            .unwrap();
        assert!(first.is_some());
        let second = guest
            .submit_answer("Federal, State, Local".to_string())
            .await
            .unwrap();
        assert!(second.is_none());

        let guest_view = guest.state().await.unwrap();
        assert_eq!(guest_view.answers.len(), 1);
        assert_eq!(guest_view.player(guest.player_id).unwrap().score, 1);
    }

    #[tokio::test]
    async fn recorder_failure_never_blocks_game_flow() {
        let (host, guest) = spawn_pair(Arc::new(FailingRecorder)).await;
        guest.set_ready(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.start_game().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let answer = guest
            .submit_answer("Executive, Legislative, Judicial".to_string())
            .await
            .unwrap()
            .expect("recording failure must not reject the answer");
        assert!(answer.is_correct);

        // Local optimistic score applied despite the failed recording.
        let guest_view = guest.state().await.unwrap();
        assert_eq!(guest_view.player(guest.player_id).unwrap().score, 1);
    }

    #[tokio::test]
    async fn cancel_is_terminal_from_any_state() {
        let (host, guest) = spawn_pair(Arc::new(NoopRecorder)).await;

        host.cancel().await.unwrap();
        assert_eq!(host.state().await.unwrap().status, SessionStatus::Cancelled);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            guest.state().await.unwrap().status,
            SessionStatus::Cancelled
        );

        // Idempotent, and starting afterwards is impossible.
        host.cancel().await.unwrap();
        assert!(host.start_game().await.is_err());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let (host, _guest) = spawn_pair(Arc::new(NoopRecorder)).await;
        host.cleanup().await;
        host.cleanup().await;
        assert!(matches!(host.state().await, Err(GameError::SessionClosed)));
    }

    #[tokio::test]
    async fn panicking_listener_does_not_starve_siblings() {
        let (host, guest) = spawn_pair(Arc::new(NoopRecorder)).await;

        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_clone = Arc::clone(&observed);

        host.on_state_change(Box::new(|_| panic!("listener bug")))
            .await
            .unwrap();
        host.on_state_change(Box::new(move |session| {
            observed_clone.lock().unwrap().push(session.players.len());
        }))
        .await
        .unwrap();

        guest.set_ready(true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!observed.lock().unwrap().is_empty());
        // The session itself is unharmed.
        assert_eq!(host.state().await.unwrap().players.len(), 2);
    }

    #[tokio::test]
    async fn presence_reflects_guest_cleanup() {
        let (host, guest) = spawn_pair(Arc::new(NoopRecorder)).await;

        let host_view = host.state().await.unwrap();
        assert!(host_view.player(guest.player_id).unwrap().is_online);

        guest.cleanup().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let host_view = host.state().await.unwrap();
        assert!(!host_view.player(guest.player_id).unwrap().is_online);
    }
}
