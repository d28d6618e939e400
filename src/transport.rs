use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::error::TransportError;
use crate::session::messages::WireMessage;

/// Presence entry published via `track` and read back from the channel's
/// presence map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_question: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
}

/// Everything a channel subscriber can observe. Broadcast delivery is
/// at-least-once with no ordering guarantee across event kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ChannelEvent {
    Broadcast(WireMessage),
    PresenceSync(HashMap<Uuid, PresenceRecord>),
    PresenceJoin(PresenceRecord),
    PresenceLeave {
        user_id: Uuid,
        last_seen: DateTime<Utc>,
    },
}

/// The seam the session engine talks through. Production code uses a
/// `ChannelHandle` backed by the in-process hub; tests may substitute their
/// own implementation.
#[async_trait::async_trait]
pub trait RealtimeTransport: Send + Sync + 'static {
    fn channel_name(&self) -> String;
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
    async fn broadcast(&self, message: WireMessage) -> Result<(), TransportError>;
    async fn track(&self, record: PresenceRecord) -> Result<(), TransportError>;
    async fn untrack(&self, user_id: Uuid) -> Result<(), TransportError>;
    async fn presence_state(&self) -> Result<HashMap<Uuid, PresenceRecord>, TransportError>;
}

#[derive(Debug)]
enum HubMessage {
    GetOrCreateChannel {
        game_id: Uuid,
        respond_to: oneshot::Sender<ChannelHandle>,
    },
    GetChannel {
        game_id: Uuid,
        respond_to: oneshot::Sender<Option<ChannelHandle>>,
    },
    RemoveChannel {
        game_id: Uuid,
    },
    Track {
        game_id: Uuid,
        record: PresenceRecord,
        respond_to: oneshot::Sender<Result<(), TransportError>>,
    },
    Untrack {
        game_id: Uuid,
        user_id: Uuid,
        respond_to: oneshot::Sender<Result<(), TransportError>>,
    },
    PresenceState {
        game_id: Uuid,
        respond_to: oneshot::Sender<Result<HashMap<Uuid, PresenceRecord>, TransportError>>,
    },
}

struct ChannelState {
    events: broadcast::Sender<ChannelEvent>,
    presence: HashMap<Uuid, PresenceRecord>,
}

/// Owns every game channel. One channel per game id, named `game_{id}` by
/// convention; fan-out through a tokio broadcast sender, presence mutations
/// serialized through this actor.
pub struct ChannelHubActor {
    receiver: mpsc::Receiver<HubMessage>,
    self_sender: mpsc::Sender<HubMessage>,
    channels: HashMap<Uuid, ChannelState>,
    event_capacity: usize,
}

impl ChannelHubActor {
    fn new(
        receiver: mpsc::Receiver<HubMessage>,
        self_sender: mpsc::Sender<HubMessage>,
        event_capacity: usize,
    ) -> Self {
        Self {
            receiver,
            self_sender,
            channels: HashMap::new(),
            event_capacity,
        }
    }

    #[tracing::instrument(skip(self, msg), fields(
        msg_type = %std::any::type_name_of_val(&msg)
    ))]
    fn handle_message(&mut self, msg: HubMessage) {
        match msg {
            HubMessage::GetOrCreateChannel {
                game_id,
                respond_to,
            } => {
                let capacity = self.event_capacity;
                let state = self.channels.entry(game_id).or_insert_with(|| {
                    tracing::info!(game.id = %game_id, "Creating game channel");
                    let (events, _) = broadcast::channel(capacity);
                    ChannelState {
                        events,
                        presence: HashMap::new(),
                    }
                });
                let _ = respond_to.send(ChannelHandle {
                    game_id,
                    events: state.events.clone(),
                    hub: self.self_sender.clone(),
                });
            }
            HubMessage::GetChannel {
                game_id,
                respond_to,
            } => {
                let handle = self.channels.get(&game_id).map(|state| ChannelHandle {
                    game_id,
                    events: state.events.clone(),
                    hub: self.self_sender.clone(),
                });
                let _ = respond_to.send(handle);
            }
            HubMessage::RemoveChannel { game_id } => {
                if self.channels.remove(&game_id).is_some() {
                    tracing::info!(game.id = %game_id, "Removed game channel");
                } else {
                    tracing::warn!(game.id = %game_id, "Remove requested for unknown channel");
                }
            }
            HubMessage::Track {
                game_id,
                record,
                respond_to,
            } => {
                let result = match self.channels.get_mut(&game_id) {
                    Some(state) => {
                        let is_new = !state.presence.contains_key(&record.user_id);
                        state.presence.insert(record.user_id, record.clone());
                        let event = if is_new {
                            ChannelEvent::PresenceJoin(record)
                        } else {
                            ChannelEvent::PresenceSync(state.presence.clone())
                        };
                        // A send error only means nobody is subscribed yet.
                        let _ = state.events.send(event);
                        Ok(())
                    }
                    None => Err(TransportError::ChannelNotFound(channel_name(game_id))),
                };
                let _ = respond_to.send(result);
            }
            HubMessage::Untrack {
                game_id,
                user_id,
                respond_to,
            } => {
                let result = match self.channels.get_mut(&game_id) {
                    Some(state) => {
                        if let Some(record) = state.presence.remove(&user_id) {
                            let _ = state.events.send(ChannelEvent::PresenceLeave {
                                user_id,
                                last_seen: record.last_seen,
                            });
                        }
                        Ok(())
                    }
                    None => Err(TransportError::ChannelNotFound(channel_name(game_id))),
                };
                let _ = respond_to.send(result);
            }
            HubMessage::PresenceState {
                game_id,
                respond_to,
            } => {
                let result = self
                    .channels
                    .get(&game_id)
                    .map(|state| state.presence.clone())
                    .ok_or_else(|| TransportError::ChannelNotFound(channel_name(game_id)));
                let _ = respond_to.send(result);
            }
        }
    }
}

pub fn channel_name(game_id: Uuid) -> String {
    format!("game_{}", game_id)
}

#[tracing::instrument(skip(actor))]
async fn run_channel_hub_actor(mut actor: ChannelHubActor) {
    tracing::info!("ChannelHub actor started");
    while let Some(msg) = actor.receiver.recv().await {
        actor.handle_message(msg);
    }
    tracing::info!("ChannelHub actor stopped");
}

#[derive(Clone, Debug)]
pub struct ChannelHubHandle {
    sender: mpsc::Sender<HubMessage>,
}

impl ChannelHubHandle {
    pub fn spawn(buffer_size: usize, event_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let actor = ChannelHubActor::new(receiver, sender.clone(), event_capacity);
        tokio::spawn(run_channel_hub_actor(actor));
        Self { sender }
    }

    pub async fn get_or_create_channel(
        &self,
        game_id: Uuid,
    ) -> Result<ChannelHandle, TransportError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::GetOrCreateChannel {
                game_id,
                respond_to,
            })
            .await
            .map_err(|e| TransportError::HubUnavailable(e.to_string()))?;
        rx.await
            .map_err(|e| TransportError::HubUnavailable(e.to_string()))
    }

    pub async fn get_channel(&self, game_id: Uuid) -> Option<ChannelHandle> {
        let (respond_to, rx) = oneshot::channel();
        if self
            .sender
            .send(HubMessage::GetChannel {
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

    pub async fn remove_channel(&self, game_id: Uuid) {
        if self
            .sender
            .send(HubMessage::RemoveChannel { game_id })
            .await
            .is_err()
        {
            tracing::error!(game.id = %game_id, "Failed to send RemoveChannel");
        }
    }
}

/// One subscription point onto a game channel.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    game_id: Uuid,
    events: broadcast::Sender<ChannelEvent>,
    hub: mpsc::Sender<HubMessage>,
}

impl ChannelHandle {
    pub fn game_id(&self) -> Uuid {
        self.game_id
    }

    async fn request<T>(
        &self,
        make_msg: impl FnOnce(oneshot::Sender<Result<T, TransportError>>) -> HubMessage,
    ) -> Result<T, TransportError> {
        let (respond_to, rx) = oneshot::channel();
        self.hub
            .send(make_msg(respond_to))
            .await
            .map_err(|e| TransportError::HubUnavailable(e.to_string()))?;
        rx.await
            .map_err(|e| TransportError::HubUnavailable(e.to_string()))?
    }
}

#[async_trait::async_trait]
impl RealtimeTransport for ChannelHandle {
    fn channel_name(&self) -> String {
        channel_name(self.game_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn broadcast(&self, message: WireMessage) -> Result<(), TransportError> {
        // No subscribers is not an error; the message is simply unobserved.
        let _ = self.events.send(ChannelEvent::Broadcast(message));
        Ok(())
    }

    async fn track(&self, record: PresenceRecord) -> Result<(), TransportError> {
        let game_id = self.game_id;
        self.request(move |respond_to| HubMessage::Track {
            game_id,
            record,
            respond_to,
        })
        .await
    }

    async fn untrack(&self, user_id: Uuid) -> Result<(), TransportError> {
        let game_id = self.game_id;
        self.request(move |respond_to| HubMessage::Untrack {
            game_id,
            user_id,
            respond_to,
        })
        .await
    }

    async fn presence_state(&self) -> Result<HashMap<Uuid, PresenceRecord>, TransportError> {
        let game_id = self.game_id;
        self.request(move |respond_to| HubMessage::PresenceState {
            game_id,
            respond_to,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::messages::{GameUpdate, SessionPatch};

    fn update_from(player_id: Uuid, seq: u64) -> WireMessage {
        WireMessage::GameUpdate(GameUpdate {
            patch: SessionPatch::default(),
            player_id,
            seq,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let hub = ChannelHubHandle::spawn(8, 16);
        let game_id = Uuid::new_v4();
        let channel = hub.get_or_create_channel(game_id).await.unwrap();

        let mut rx_a = channel.subscribe();
        let mut rx_b = channel.subscribe();

        let sender = Uuid::new_v4();
        channel.broadcast(update_from(sender, 1)).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                ChannelEvent::Broadcast(msg) => assert_eq!(msg.sender(), sender),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn track_emits_join_then_updates_emit_sync() {
        let hub = ChannelHubHandle::spawn(8, 16);
        let game_id = Uuid::new_v4();
        let channel = hub.get_or_create_channel(game_id).await.unwrap();
        let mut rx = channel.subscribe();

        let user_id = Uuid::new_v4();
        let record = PresenceRecord {
            user_id,
            status: PresenceStatus::Online,
            last_seen: Utc::now(),
            current_question: None,
        };
        channel.track(record.clone()).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::PresenceJoin(r) if r.user_id == user_id
        ));

        channel.track(record).await.unwrap();
        match rx.recv().await.unwrap() {
            ChannelEvent::PresenceSync(map) => assert!(map.contains_key(&user_id)),
            other => panic!("unexpected event: {:?}", other),
        }

        let state = channel.presence_state().await.unwrap();
        assert_eq!(state.len(), 1);
    }

    #[tokio::test]
    async fn untrack_emits_leave_and_clears_state() {
        let hub = ChannelHubHandle::spawn(8, 16);
        let game_id = Uuid::new_v4();
        let channel = hub.get_or_create_channel(game_id).await.unwrap();

        let user_id = Uuid::new_v4();
        channel
            .track(PresenceRecord {
                user_id,
                status: PresenceStatus::Online,
                last_seen: Utc::now(),
                current_question: None,
            })
            .await
            .unwrap();

        let mut rx = channel.subscribe();
        channel.untrack(user_id).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::PresenceLeave { user_id: id, .. } if id == user_id
        ));
        assert!(channel.presence_state().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removed_channel_rejects_presence_ops() {
        let hub = ChannelHubHandle::spawn(8, 16);
        let game_id = Uuid::new_v4();
        let channel = hub.get_or_create_channel(game_id).await.unwrap();
        hub.remove_channel(game_id).await;

        let result = channel
            .track(PresenceRecord {
                user_id: Uuid::new_v4(),
                status: PresenceStatus::Online,
                last_seen: Utc::now(),
                current_question: None,
            })
            .await;
        assert!(matches!(result, Err(TransportError::ChannelNotFound(_))));
    }
}
