pub mod broadcast;
pub mod engine;
pub mod merge;
pub mod messages;
pub mod presence;
pub mod state;

pub use engine::{SessionActorHandle, spawn_session};
pub use messages::{ActionEnvelope, GameUpdate, PlayerAction, SessionPatch, WireMessage};
pub use state::{GameSession, GameSettings, Player, PlayerAnswer, SessionStatus};
