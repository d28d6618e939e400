use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::session::state::GameSession;
use crate::transport::PresenceRecord;

/// Full presence sync: every known player's `is_online` becomes membership
/// in the presence map; `last_seen` is taken from the payload when present
/// and left alone otherwise. Returns whether anything changed.
pub fn apply_presence_sync(
    session: &mut GameSession,
    presence: &HashMap<Uuid, PresenceRecord>,
) -> bool {
    let mut changed = false;
    for player in &mut session.players {
        let record = presence.get(&player.id);
        let online = record.is_some();
        if player.is_online != online {
            player.is_online = online;
            changed = true;
        }
        if let Some(record) = record
            && player.last_seen != record.last_seen
        {
            player.last_seen = record.last_seen;
            changed = true;
        }
    }
    changed
}

/// Incremental join: only the affected player is touched.
pub fn apply_presence_join(session: &mut GameSession, record: &PresenceRecord) -> bool {
    match session.player_mut(record.user_id) {
        Some(player) => {
            player.is_online = true;
            player.last_seen = record.last_seen;
            true
        }
        None => {
            tracing::trace!(
                game.id = %session.game_id,
                user.id = %record.user_id,
                "Presence join for unknown player"
            );
            false
        }
    }
}

/// Incremental leave: only the affected player is touched.
pub fn apply_presence_leave(
    session: &mut GameSession,
    user_id: Uuid,
    last_seen: DateTime<Utc>,
) -> bool {
    match session.player_mut(user_id) {
        Some(player) => {
            player.is_online = false;
            player.last_seen = last_seen;
            true
        }
        None => false,
    }
}
