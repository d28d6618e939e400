use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::error::{Result as WebResult, WebError};
use crate::manager::{GameDetails, GameSettingsOverrides};
use crate::session::engine::SessionActorHandle;
use crate::session::GameSession;
use crate::state::AppState;

#[derive(Deserialize, Debug, Default)]
pub struct CreateGameRequest {
    pub host_name: Option<String>,
    #[serde(flatten)]
    pub overrides: GameSettingsOverrides,
}

pub async fn create_game_handler(
    State(app_state): State<AppState>,
    Json(payload): Json<CreateGameRequest>,
) -> WebResult<Json<GameDetails>> {
    tracing::info!("HTTP: Received create_game request: {:?}", payload);

    let host_name = payload.host_name.unwrap_or_else(|| "Host".to_string());
    let details = app_state
        .game_manager
        .create_game(host_name, payload.overrides)
        .await
        .map_err(|e| {
            tracing::warn!("Failed to create game: {}", e);
            WebError::BadRequest(e)
        })?;

    Ok(Json(details))
}

async fn session_or_404(app_state: &AppState, game_id: Uuid) -> WebResult<SessionActorHandle> {
    app_state
        .game_manager
        .get_session(game_id)
        .await
        .ok_or(WebError::GameNotFound(game_id))
}

pub async fn start_game_handler(
    State(app_state): State<AppState>,
    Path(game_id): Path<Uuid>,
) -> WebResult<StatusCode> {
    tracing::info!(game.id = %game_id, "HTTP: Received start_game request");
    let session = session_or_404(&app_state, game_id).await?;
    session
        .start_game()
        .await
        .map_err(WebError::from_game_error)?;
    Ok(StatusCode::OK)
}

pub async fn next_question_handler(
    State(app_state): State<AppState>,
    Path(game_id): Path<Uuid>,
) -> WebResult<StatusCode> {
    tracing::info!(game.id = %game_id, "HTTP: Received next_question request");
    let session = session_or_404(&app_state, game_id).await?;
    session
        .next_question()
        .await
        .map_err(WebError::from_game_error)?;
    Ok(StatusCode::OK)
}

pub async fn game_state_handler(
    State(app_state): State<AppState>,
    Path(game_id): Path<Uuid>,
) -> WebResult<Json<GameSession>> {
    let session = session_or_404(&app_state, game_id).await?;
    let state = session.state().await.map_err(WebError::from_game_error)?;
    Ok(Json(state))
}

pub async fn cancel_game_handler(
    State(app_state): State<AppState>,
    Path(game_id): Path<Uuid>,
) -> WebResult<StatusCode> {
    tracing::info!(game.id = %game_id, "HTTP: Received cancel_game request");
    let session = session_or_404(&app_state, game_id).await?;
    session.cancel().await.map_err(WebError::from_game_error)?;
    Ok(StatusCode::OK)
}

/// Reloads the question bank from its configured source. Sessions that have
/// already drawn their questions are unaffected.
pub async fn refresh_questions_handler(
    State(app_state): State<AppState>,
) -> WebResult<StatusCode> {
    tracing::info!("HTTP: Received refresh_questions request");
    app_state.question_bank.refresh().await.map_err(|e| {
        tracing::error!("Failed to refresh questions: {}", e);
        WebError::InternalServerError(format!("Failed to refresh questions: {}", e))
    })?;
    Ok(StatusCode::OK)
}

pub async fn delete_game_handler(
    State(app_state): State<AppState>,
    Path(game_id): Path<Uuid>,
) -> WebResult<StatusCode> {
    tracing::info!(game.id = %game_id, "HTTP: Received delete_game request");
    // Best effort: the hosted replica broadcasts Cancelled before teardown.
    if let Some(session) = app_state.game_manager.get_session(game_id).await {
        if let Err(e) = session.cancel().await {
            tracing::debug!(game.id = %game_id, error = %e, "Cancel before delete failed");
        }
    }
    app_state
        .game_manager
        .remove_game(game_id)
        .await
        .map_err(WebError::InternalServerError)?;
    Ok(StatusCode::NO_CONTENT)
}
