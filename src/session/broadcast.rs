use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::TransportError;
use crate::session::messages::{ActionEnvelope, GameUpdate, PlayerAction, SessionPatch, WireMessage};
use crate::transport::{PresenceRecord, RealtimeTransport};

struct ThrottleInner {
    next_allowed: Instant,
    pending: Option<SessionPatch>,
    flush_scheduled: bool,
}

/// Outbound publisher for one replica. Game updates are rate limited to one
/// per interval; a call landing inside the window replaces any pending patch
/// and is flushed once at the trailing edge instead of being dropped.
/// Player actions bypass the throttle entirely.
pub struct ThrottledBroadcaster {
    transport: Arc<dyn RealtimeTransport>,
    local_player_id: Uuid,
    interval: Duration,
    seq: AtomicU64,
    inner: Arc<Mutex<ThrottleInner>>,
}

impl ThrottledBroadcaster {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        local_player_id: Uuid,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            local_player_id,
            interval,
            seq: AtomicU64::new(0),
            inner: Arc::new(Mutex::new(ThrottleInner {
                next_allowed: Instant::now(),
                pending: None,
                flush_scheduled: false,
            })),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn stamp_update(&self, patch: SessionPatch) -> WireMessage {
        WireMessage::GameUpdate(GameUpdate {
            patch,
            player_id: self.local_player_id,
            seq: self.next_seq(),
            timestamp: Utc::now(),
        })
    }

    /// Throttled path. Returns immediately in every case; a coalesced patch
    /// is flushed by a background task at the end of the current window.
    pub async fn broadcast_game_update(
        self: &Arc<Self>,
        patch: SessionPatch,
    ) -> Result<(), TransportError> {
        let send_now = {
            // Poisoning only means a panic mid-decision; the state stays usable.
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if now >= inner.next_allowed && !inner.flush_scheduled {
                inner.next_allowed = now + self.interval;
                true
            } else {
                inner.pending = Some(patch.clone());
                if !inner.flush_scheduled {
                    inner.flush_scheduled = true;
                    self.schedule_flush(inner.next_allowed);
                }
                false
            }
        };

        if send_now {
            let message = self.stamp_update(patch);
            self.transport.broadcast(message).await?;
        }
        Ok(())
    }

    fn schedule_flush(self: &Arc<Self>, deadline: Instant) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let patch = {
                let mut inner = this.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.flush_scheduled = false;
                inner.next_allowed = Instant::now() + this.interval;
                inner.pending.take()
            };
            if let Some(patch) = patch {
                let message = this.stamp_update(patch);
                if let Err(e) = this.transport.broadcast(message).await {
                    tracing::warn!(
                        channel = %this.transport.channel_name(),
                        error = %e,
                        "Deferred game update flush failed"
                    );
                }
            }
        });
    }

    /// Immediate path for discrete, must-not-drop events.
    pub async fn broadcast_player_action(
        &self,
        action: PlayerAction,
    ) -> Result<(), TransportError> {
        let message = WireMessage::PlayerAction(ActionEnvelope {
            action,
            player_id: self.local_player_id,
            seq: self.next_seq(),
            timestamp: Utc::now(),
        });
        self.transport.broadcast(message).await
    }

    /// Presence publishing, independent of both broadcast paths.
    pub async fn update_presence(&self, record: PresenceRecord) -> Result<(), TransportError> {
        self.transport.track(record).await
    }
}
