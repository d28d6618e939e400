use std::collections::HashMap;
use uuid::Uuid;

use crate::session::messages::{ActionEnvelope, GameUpdate, PlayerAction, WireMessage};
use crate::session::state::{GameSession, Player, PlayerAnswer};

/// Per-replica inbound filter state: the local identity (echo suppression)
/// and the highest sequence number seen per remote sender (stale-message
/// rejection).
#[derive(Debug)]
pub struct MergeContext {
    local_player_id: Uuid,
    last_seen_seq: HashMap<Uuid, u64>,
}

impl MergeContext {
    pub fn new(local_player_id: Uuid) -> Self {
        Self {
            local_player_id,
            last_seen_seq: HashMap::new(),
        }
    }

    /// Self-originated echoes are never applied; per sender, sequence
    /// numbers must strictly increase.
    fn admit(&mut self, sender: Uuid, seq: u64) -> bool {
        if sender == self.local_player_id {
            tracing::trace!(sender = %sender, "Dropping self-originated message");
            return false;
        }
        let last = self.last_seen_seq.entry(sender).or_insert(0);
        if seq <= *last {
            tracing::debug!(
                sender = %sender,
                seq.received = seq,
                seq.last = *last,
                "Dropping stale message"
            );
            return false;
        }
        *last = seq;
        true
    }
}

/// Applies one inbound channel message to the local replica. Returns whether
/// the session changed.
pub fn apply_wire_message(
    session: &mut GameSession,
    ctx: &mut MergeContext,
    message: WireMessage,
) -> bool {
    match message {
        WireMessage::GameUpdate(update) => apply_game_update(session, ctx, update),
        WireMessage::PlayerAction(envelope) => apply_player_action(session, ctx, envelope),
    }
}

fn apply_game_update(session: &mut GameSession, ctx: &mut MergeContext, update: GameUpdate) -> bool {
    if !ctx.admit(update.player_id, update.seq) {
        return false;
    }
    session.apply_patch(update.patch);
    true
}

fn apply_player_action(
    session: &mut GameSession,
    ctx: &mut MergeContext,
    envelope: ActionEnvelope,
) -> bool {
    if !ctx.admit(envelope.player_id, envelope.seq) {
        return false;
    }
    let actor = envelope.player_id;
    match envelope.action {
        PlayerAction::Join { name } => {
            if session.player(actor).is_some() {
                return false;
            }
            if session.players.len() >= session.settings.max_players {
                tracing::warn!(
                    game.id = %session.game_id,
                    player.id = %actor,
                    "Join rejected: session is full"
                );
                return false;
            }
            session.players.push(Player::new(actor, name, false));
            true
        }
        PlayerAction::Leave => {
            let before = session.players.len();
            session.players.retain(|p| p.id != actor);
            session.players.len() != before
        }
        PlayerAction::Ready { is_ready } => match session.player_mut(actor) {
            Some(player) => {
                player.is_ready = is_ready;
                true
            }
            None => false,
        },
        PlayerAction::Answer(payload) => {
            // `answers` only ever holds the current question, so one entry
            // per player id is the strongest dedupe we need.
            let duplicate = session.answers.iter().any(|a| a.player_id == actor);
            if duplicate {
                tracing::debug!(
                    game.id = %session.game_id,
                    player.id = %actor,
                    "Duplicate answer dropped"
                );
                return false;
            }
            session.answers.push(PlayerAnswer {
                player_id: actor,
                question_id: payload.question_id,
                answer: payload.answer,
                time_spent: payload.time_spent,
                is_correct: payload.is_correct,
                timestamp: payload.answered_at,
            });
            if payload.is_correct
                && let Some(player) = session.player_mut(actor)
            {
                player.score += 1;
            }
            true
        }
        PlayerAction::ClaimHost { term } => session.assign_host(term, actor),
    }
}
