//! Game simulation modules

pub mod combat;
pub mod r#match;
pub mod physics;
pub mod pickup;
pub mod presence;
pub mod snapshot;
pub mod terrain;
pub mod turn;

pub use r#match::{CreatureState, GameMatch, MatchHandle, MatchRegistry};

use crate::ws::protocol::ClientMsg;
use uuid::Uuid;

/// Player input received from WebSocket
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub session_id: Uuid,
    pub msg: ClientMsg,
    pub received_at: u64,
}
