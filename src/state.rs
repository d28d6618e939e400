use std::sync::Arc;

use crate::content::QuestionBank;
use crate::manager::GameManagerHandle;
use crate::transport::ChannelHubHandle;

#[derive(Clone)]
pub struct AppState {
    pub game_manager: GameManagerHandle,
    pub hub: ChannelHubHandle,
    pub question_bank: Arc<QuestionBank>,
}
