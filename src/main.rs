use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod content;
mod error;
mod manager;
mod recorder;
mod session;
mod state;
mod transport;
mod web;

use crate::config::load_settings;
use crate::content::QuestionBank;
use crate::error::Result as AppResult;
use crate::manager::GameManagerHandle;
use crate::recorder::{HttpResponseRecorder, NoopRecorder, ResponseRecorder};
use crate::state::AppState;
use crate::transport::ChannelHubHandle;
use crate::web::run_server;

#[tokio::main]
async fn main() -> AppResult<()> {
    // Setup tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=debug", env!("CARGO_PKG_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load Configuration
    let app_settings = load_settings()?;
    tracing::info!("Configuration loaded: {:?}", app_settings);

    // Load the civics question bank up front so a bad source fails fast.
    let question_bank = Arc::new(QuestionBank::new(app_settings.content.clone()).await?);
    tracing::info!(
        questions.count = question_bank.all().await.len(),
        "Question bank initialized"
    );

    let recorder: Arc<dyn ResponseRecorder> = match &app_settings.recorder {
        Some(recorder_config) => {
            tracing::info!(endpoint = %recorder_config.endpoint, "Response recorder configured");
            Arc::new(HttpResponseRecorder::new(recorder_config.endpoint.clone()))
        }
        None => {
            tracing::info!("No recorder endpoint configured, responses are not persisted");
            Arc::new(NoopRecorder)
        }
    };

    // Initialize the channel hub and the game manager on top of it.
    let hub = ChannelHubHandle::spawn(32, 256);
    let game_manager = GameManagerHandle::spawn(
        32,
        hub.clone(),
        Arc::clone(&question_bank),
        recorder,
        app_settings.game.clone(),
    );

    let app_state = AppState {
        game_manager,
        hub,
        question_bank,
    };

    run_server(app_state, app_settings.server).await?;

    Ok(())
}
