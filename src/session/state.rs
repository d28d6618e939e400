use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::{CivicsQuestion, Difficulty};
use crate::session::messages::SessionPatch;

/// Forward-only lifecycle, except `Cancelled` which is terminal from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Starting,
    InProgress,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    #[default]
    Classic,
    SpeedRound,
    Elimination,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Player {
    pub id: Uuid,
    pub name: String,
    pub is_host: bool,
    pub is_ready: bool,
    pub score: u32,
    pub is_online: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Player {
    pub fn new(id: Uuid, name: impl Into<String>, is_host: bool) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            is_host,
            is_ready: false,
            score: 0,
            is_online: true,
            joined_at: now,
            last_seen: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerAnswer {
    pub player_id: Uuid,
    pub question_id: String,
    pub answer: String,
    pub time_spent: u32,
    pub is_correct: bool,
    pub timestamp: DateTime<Utc>,
}

/// Immutable once the session is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameSettings {
    pub min_players: usize,
    pub max_players: usize,
    pub question_count: usize,
    pub time_per_question: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub mode: GameMode,
}

/// Canonical local copy of one game session. Each client process owns
/// exactly one replica per game; replicas converge through the merge rules
/// in `merge`, not through shared memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSession {
    pub game_id: Uuid,
    pub status: SessionStatus,
    pub players: Vec<Player>,
    pub questions: Vec<CivicsQuestion>,
    pub current_question_index: usize,
    pub current_question: Option<CivicsQuestion>,
    pub time_remaining: u32,
    pub answers: Vec<PlayerAnswer>,
    pub settings: GameSettings,
    /// Host lease term. Conflicting host claims resolve to the highest
    /// `(host_term, host_id)` pair.
    pub host_term: u64,
    pub host_id: Uuid,
}

impl GameSession {
    pub fn new(game_id: Uuid, host: Player, settings: GameSettings) -> Self {
        let mut host = host;
        host.is_host = true;
        let host_id = host.id;
        Self {
            game_id,
            status: SessionStatus::Waiting,
            players: vec![host],
            questions: Vec::new(),
            current_question_index: 0,
            current_question: None,
            time_remaining: settings.time_per_question,
            answers: Vec::new(),
            settings,
            host_term: 1,
            host_id,
        }
    }

    /// Replica for a joining (non-host) player. The host and any earlier
    /// players are learned from the channel: the join announcement triggers
    /// a full-state patch from the host replica.
    pub fn new_guest(game_id: Uuid, local: Player, settings: GameSettings) -> Self {
        let mut local = local;
        local.is_host = false;
        Self {
            game_id,
            status: SessionStatus::Waiting,
            players: vec![local],
            questions: Vec::new(),
            current_question_index: 0,
            current_question: None,
            time_remaining: settings.time_per_question,
            answers: Vec::new(),
            settings,
            host_term: 0,
            host_id: Uuid::nil(),
        }
    }

    /// Detached copy for observers. Callers must not rely on reference
    /// identity across calls.
    pub fn snapshot(&self) -> GameSession {
        self.clone()
    }

    pub fn player(&self, player_id: Uuid) -> Option<&Player> {
        self.players.iter().find(|p| p.id == player_id)
    }

    pub fn player_mut(&mut self, player_id: Uuid) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == player_id)
    }

    pub fn is_host(&self, player_id: Uuid) -> bool {
        self.player(player_id).is_some_and(|p| p.is_host)
    }

    /// True iff the session is still waiting, enough players have joined and
    /// every non-host player has readied up.
    pub fn can_start_game(&self) -> bool {
        self.status == SessionStatus::Waiting
            && self.players.len() >= self.settings.min_players
            && self.players.iter().all(|p| p.is_ready || p.is_host)
    }

    /// Shallow merge of a partial-session patch. Host reassignment flows
    /// through here when the patch carries a newer term.
    pub fn apply_patch(&mut self, patch: SessionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(index) = patch.current_question_index {
            self.current_question_index = index;
        }
        if let Some(question) = patch.current_question {
            self.current_question = Some(question);
        }
        if let Some(time_remaining) = patch.time_remaining {
            self.time_remaining = time_remaining;
        }
        if let Some(questions) = patch.questions {
            self.questions = questions;
        }
        if let Some(players) = patch.players {
            self.players = players;
        }
        if let Some(answers) = patch.answers {
            self.answers = answers;
        }
        if let (Some(term), Some(host_id)) = (patch.host_term, patch.host_id) {
            self.assign_host(term, host_id);
        }
    }

    /// Accepts a host claim when `(term, claimant)` beats the current lease.
    /// Returns whether the host changed.
    pub fn assign_host(&mut self, term: u64, host_id: Uuid) -> bool {
        let beats_current =
            term > self.host_term || (term == self.host_term && host_id < self.host_id);
        if !beats_current && host_id != self.host_id {
            return false;
        }
        self.host_term = self.host_term.max(term);
        self.host_id = host_id;
        for player in &mut self.players {
            player.is_host = player.id == host_id;
        }
        true
    }

    /// Full-state patch, used when a replica broadcasts its entire view
    /// (e.g. on a status transition).
    pub fn full_patch(&self) -> SessionPatch {
        SessionPatch {
            status: Some(self.status),
            current_question_index: Some(self.current_question_index),
            current_question: self.current_question.clone(),
            time_remaining: Some(self.time_remaining),
            questions: Some(self.questions.clone()),
            players: Some(self.players.clone()),
            answers: Some(self.answers.clone()),
            host_term: Some(self.host_term),
            host_id: Some(self.host_id),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn settings(min_players: usize) -> GameSettings {
        GameSettings {
            min_players,
            max_players: 8,
            question_count: 3,
            time_per_question: 30,
            difficulty: None,
            mode: GameMode::Classic,
        }
    }

    pub fn session_with_players(host_ready: bool, others: &[(Uuid, bool)]) -> GameSession {
        let host_id = Uuid::new_v4();
        let mut host = Player::new(host_id, "host", true);
        host.is_ready = host_ready;
        let mut session = GameSession::new(Uuid::new_v4(), host, settings(2));
        for (id, ready) in others {
            let mut player = Player::new(*id, format!("player-{}", id), false);
            player.is_ready = *ready;
            session.players.push(player);
        }
        session
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn two_ready_players_one_host_can_start() {
        // min_players = 2, host + one ready guest.
        let session = session_with_players(true, &[(Uuid::new_v4(), true)]);
        assert!(session.can_start_game());
    }

    #[test]
    fn unready_guest_blocks_start() {
        let session = session_with_players(true, &[(Uuid::new_v4(), false)]);
        assert!(!session.can_start_game());
    }

    #[test]
    fn host_readiness_is_not_required() {
        let session = session_with_players(false, &[(Uuid::new_v4(), true)]);
        assert!(session.can_start_game());
    }

    #[test]
    fn too_few_players_blocks_start() {
        let session = session_with_players(true, &[]);
        assert!(!session.can_start_game());
    }

    #[test]
    fn cannot_start_once_in_progress() {
        let mut session = session_with_players(true, &[(Uuid::new_v4(), true)]);
        session.status = SessionStatus::InProgress;
        assert!(!session.can_start_game());
    }

    #[test]
    fn patch_merges_only_present_fields() {
        let mut session = session_with_players(true, &[(Uuid::new_v4(), true)]);
        let players_before = session.players.clone();
        session.apply_patch(SessionPatch {
            time_remaining: Some(5),
            ..SessionPatch::default()
        });
        assert_eq!(session.time_remaining, 5);
        assert_eq!(session.players, players_before);
        assert_eq!(session.status, SessionStatus::Waiting);
    }

    #[test]
    fn higher_term_wins_host_lease() {
        let guest_id = Uuid::new_v4();
        let mut session = session_with_players(true, &[(guest_id, true)]);
        let old_host = session.host_id;

        assert!(session.assign_host(2, guest_id));
        assert_eq!(session.host_id, guest_id);
        assert!(session.is_host(guest_id));
        assert!(!session.is_host(old_host));

        // A stale claim from the old host does not take the lease back.
        assert!(!session.assign_host(1, old_host));
        assert_eq!(session.host_id, guest_id);
    }

    #[test]
    fn equal_term_ties_break_on_lower_id() {
        let guest_id = Uuid::new_v4();
        let mut session = session_with_players(true, &[(guest_id, true)]);
        let host_id = session.host_id;
        let expected = host_id.min(guest_id);

        session.assign_host(1, guest_id);
        assert_eq!(session.host_id, expected);
    }

    #[test]
    fn snapshot_is_detached_from_the_store() {
        let mut session = session_with_players(true, &[(Uuid::new_v4(), true)]);
        let snapshot = session.snapshot();
        session.time_remaining = 1;
        assert_ne!(snapshot.time_remaining, session.time_remaining);
    }
}
