use axum::extract::{
    State,
    ws::{self, WebSocket, WebSocketUpgrade},
};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::session::messages::{ClientHello, SystemMessage, client_hello_from_text, wire_message_from_text};
use crate::state::AppState;
use crate::transport::{ChannelEvent, ChannelHandle, PresenceRecord, PresenceStatus, RealtimeTransport};

pub async fn ws_handler(
    ws_upgrade: WebSocketUpgrade,
    State(app_state): State<AppState>,
) -> impl IntoResponse {
    tracing::info!("WebSocket: Connection attempt to /ws endpoint");
    ws_upgrade.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn send_system_error(
    ws_sender: &mut (impl SinkExt<ws::Message> + Unpin),
    message: String,
) {
    let error_response = SystemMessage::SystemError { message };
    if let Ok(ws_msg) = error_response.to_ws_text() {
        let _ = ws_sender.send(ws_msg).await;
    }
}

/// Bridges one remote replica onto a game channel. The first frame must be
/// `ConnectToGame`; after that the socket carries raw channel traffic in both
/// directions (the replica logic itself lives on the client).
pub async fn handle_socket(socket: WebSocket, app_state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let channel: ChannelHandle;
    let player_id: Uuid;

    match ws_receiver.next().await {
        Some(Ok(ws::Message::Text(text_msg))) => {
            tracing::debug!("WS: Received initial message: {}", text_msg);
            match client_hello_from_text(&text_msg) {
                Ok(ClientHello::ConnectToGame {
                    game_id,
                    player_id: received_player_id,
                    name,
                }) => {
                    player_id = received_player_id;
                    tracing::info!(
                        player.id = %player_id,
                        player.name = %name,
                        game.id = %game_id,
                        "WebSocket: Player connecting to game channel"
                    );
                    match app_state.hub.get_channel(game_id).await {
                        Some(handle) => {
                            channel = handle;
                        }
                        None => {
                            tracing::warn!(
                                game.id = %game_id,
                                player.id = %player_id,
                                "WebSocket: Game not found. Closing."
                            );
                            send_system_error(
                                &mut ws_sender,
                                format!("Game {} not found.", game_id),
                            )
                            .await;
                            let _ = ws_sender.close().await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "WebSocket: Failed to deserialize initial message: {}. Raw: '{}'. Closing.",
                        e,
                        text_msg
                    );
                    send_system_error(
                        &mut ws_sender,
                        format!("Invalid initial connection message format: {}", e),
                    )
                    .await;
                    let _ = ws_sender.close().await;
                    return;
                }
            }
        }
        Some(Ok(other_type_msg)) => {
            tracing::warn!(
                "WS: Client sent non-text initial message: {:?}. Closing.",
                other_type_msg
            );
            send_system_error(
                &mut ws_sender,
                "Initial message must be a text JSON message (ConnectToGame).".to_string(),
            )
            .await;
            let _ = ws_sender.close().await;
            return;
        }
        Some(Err(e)) => {
            tracing::warn!("WS: Error receiving initial message: {}. Closing.", e);
            let _ = ws_sender.close().await;
            return;
        }
        None => {
            tracing::info!("WS: Client disconnected before sending initial message. Closing.");
            return;
        }
    }

    let mut channel_events = channel.subscribe();

    // Register presence and hand the newcomer the current presence map so it
    // does not have to wait for the next join/leave to learn who is here.
    if let Err(e) = channel
        .track(PresenceRecord {
            user_id: player_id,
            status: PresenceStatus::Online,
            last_seen: Utc::now(),
            current_question: None,
        })
        .await
    {
        tracing::warn!(player.id = %player_id, error = %e, "Presence track failed");
    }
    match channel.presence_state().await {
        Ok(presence) => {
            if let Ok(json) = serde_json::to_string(&ChannelEvent::PresenceSync(presence)) {
                let _ = ws_sender.send(ws::Message::Text(json.into())).await;
            }
        }
        Err(e) => {
            tracing::warn!(player.id = %player_id, error = %e, "Presence state fetch failed");
        }
    }

    // Out-of-band replies (parse errors) from the receive loop share the
    // socket with channel fan-out.
    let (reply_tx, mut reply_rx) = mpsc::channel::<ws::Message>(32);

    let channel_name = channel.channel_name();
    let send_channel_name = channel_name.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = channel_events.recv() => match event {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to serialize channel event");
                                continue;
                            }
                        };
                        if ws_sender.send(ws::Message::Text(json.into())).await.is_err() {
                            tracing::info!(
                                player.id = %player_id,
                                channel = %send_channel_name,
                                "WS send error, client likely disconnected."
                            );
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            player.id = %player_id,
                            skipped,
                            "Slow websocket client lagged behind channel"
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(msg) => {
                        if ws_sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(
            player.id = %player_id,
            channel = %send_channel_name,
            "Send task terminating."
        );
        let _ = ws_sender.close().await;
    });

    let recv_channel = channel.clone();
    let recv_channel_name = channel_name.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(msg)) => match msg {
                    ws::Message::Text(text_msg) => {
                        match wire_message_from_text(&text_msg) {
                            Ok(wire_msg) if wire_msg.sender() != player_id => {
                                tracing::warn!(
                                    player.id = %player_id,
                                    claimed = %wire_msg.sender(),
                                    "Rejected message with mismatched sender id"
                                );
                                let error_response = SystemMessage::SystemError {
                                    message: "Message sender must match the connected player."
                                        .to_string(),
                                };
                                if let Ok(ws_msg) = error_response.to_ws_text() {
                                    let _ = reply_tx.send(ws_msg).await;
                                }
                            }
                            Ok(wire_msg) => {
                                if let Err(e) = recv_channel.broadcast(wire_msg).await {
                                    tracing::error!(
                                        player.id = %player_id,
                                        channel = %recv_channel_name,
                                        error = %e,
                                        "Failed to relay message to channel"
                                    );
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    player.id = %player_id,
                                    error = %e,
                                    "Failed to parse inbound message"
                                );
                                let error_response = SystemMessage::SystemError {
                                    message: format!("Invalid message format: {}", e),
                                };
                                if let Ok(ws_msg) = error_response.to_ws_text() {
                                    let _ = reply_tx.send(ws_msg).await;
                                }
                            }
                        }
                    }
                    ws::Message::Binary(_) => {
                        tracing::debug!(
                            player.id = %player_id,
                            "Received binary message (ignored)"
                        );
                    }
                    ws::Message::Ping(_) | ws::Message::Pong(_) => {}
                    ws::Message::Close(_) => {
                        tracing::info!(
                            player.id = %player_id,
                            channel = %recv_channel_name,
                            "WebSocket closed by client."
                        );
                        break;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(
                        player.id = %player_id,
                        error = %e,
                        "WebSocket error (recv)"
                    );
                    break;
                }
                None => break,
            }
        }
        tracing::debug!(
            player.id = %player_id,
            channel = %recv_channel_name,
            "Receive task terminating."
        );
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    // Presence leave fans out to the remaining replicas.
    if let Err(e) = channel.untrack(player_id).await {
        tracing::debug!(player.id = %player_id, error = %e, "Presence untrack failed");
    }
    tracing::info!(
        player.id = %player_id,
        channel = %channel_name,
        "WebSocket: Player fully disconnected"
    );
}
