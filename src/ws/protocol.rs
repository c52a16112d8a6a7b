//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::terrain::TerrainPoint;

/// Weapons that can be found in crates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaponKind {
    /// Thrown, bounces before exploding
    Grenade,
    /// Direct-fire rocket
    Bazooka,
    /// Dropped at the creature's feet
    Dynamite,
}

impl WeaponKind {
    pub const ALL: [WeaponKind; 3] = [WeaponKind::Grenade, WeaponKind::Bazooka, WeaponKind::Dynamite];
}

/// Why a creature left the island
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EliminationCause {
    /// Hit points reached zero
    Damage,
    /// Sank below the waterline
    Drowned,
    /// Owner was removed from the match
    Removed,
}

/// One entry of a reported explosion hit list
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DamageHit {
    /// Creature id
    pub id: Uuid,
    /// Raw damage, clamped server-side
    pub dmg: f32,
}

/// Explosion centre used to push creatures around
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Blast {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub force: f32,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Join the match with an optional display name
    Join {
        #[serde(default)]
        name: Option<String>,
    },

    /// Held direction keys (last value wins)
    Input { left: bool, right: bool },

    /// One jump of the active creature
    Jump,

    /// Give up the rest of the turn
    EndTurn,

    /// Claim the crate for a session
    PickupCrate { crate_id: Uuid, by_session_id: Uuid },

    /// Use up the held weapon
    ConsumeWeapon,

    /// Explosion results computed by the active client
    ApplyDamage {
        hits: Vec<DamageHit>,
        #[serde(default)]
        blast: Option<Blast>,
    },

    /// Claim a disconnected session's roster
    Takeover { target_session_id: Uuid },

    /// Leave the match (also sent implicitly on disconnect)
    Leave,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome { session_id: Uuid, server_time: u64 },

    /// A session joined; carries everything needed to draw the island
    MatchJoined {
        match_id: Uuid,
        session_id: Uuid,
        terrain: Vec<TerrainPoint>,
        waterline: f32,
        players: Vec<PlayerInfo>,
    },

    /// Kinematic snapshot (sent at regular intervals)
    Snapshot {
        /// Server tick number
        tick: u64,
        objects: Vec<ObjectSnapshot>,
        /// Events that occurred since last snapshot
        events: Vec<GameEvent>,
    },

    /// Replicated match state
    State(MatchView),

    /// Match has ended
    MatchOver { winner: Option<Uuid> },

    /// Request rejected
    Error {
        session_id: Uuid,
        code: String,
        message: String,
    },

    /// Pong response
    Pong {
        session_id: Uuid,
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    /// Session a message is addressed to. None means every session.
    pub fn recipient(&self) -> Option<Uuid> {
        match self {
            ServerMsg::Welcome { session_id, .. }
            | ServerMsg::Error { session_id, .. }
            | ServerMsg::Pong { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }
}

/// Player info for join notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub session_id: Uuid,
    pub name: String,
    pub color: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Creature,
    Crate,
}

/// Position and velocity of one simulated body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub id: Uuid,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
}

/// Full replicated state of a match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchView {
    pub tick: u64,
    pub creatures: Vec<CreatureView>,
    #[serde(rename = "crate")]
    pub supply_crate: Option<CrateView>,
    pub active_player: Option<Uuid>,
    pub active_creature: Option<Uuid>,
    pub winner: Option<Uuid>,
    pub match_over: bool,
    /// Milliseconds left in the current turn
    pub turn_remaining_ms: u64,
    pub waterline: f32,
    pub join_order: Vec<Uuid>,
    pub players: Vec<PlayerView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatureView {
    pub id: Uuid,
    pub owner: Uuid,
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub color: u32,
    pub hp: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrateView {
    pub id: Uuid,
    pub x: f32,
    pub y: f32,
    pub weapon: WeaponKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerView {
    pub session_id: Uuid,
    pub name: String,
    pub color: u32,
    pub weapon: Option<WeaponKind>,
    /// Unix millis when the grace window ends, absent while connected
    pub disconnected_until: Option<u64>,
    pub creature_count: usize,
}

/// Game events (turns, eliminations, pickups, etc.)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GameEvent {
    TurnStarted {
        player_id: Uuid,
        creature_id: Uuid,
        deadline: u64,
    },

    CreatureEliminated {
        creature_id: Uuid,
        owner_id: Uuid,
        cause: EliminationCause,
    },

    CrateSpawned {
        crate_id: Uuid,
        weapon: WeaponKind,
        x: f32,
        y: f32,
    },

    CratePickedUp {
        crate_id: Uuid,
        session_id: Uuid,
        weapon: WeaponKind,
    },

    WeaponConsumed {
        session_id: Uuid,
        weapon: WeaponKind,
    },

    PlayerDisconnected {
        session_id: Uuid,
        until: u64,
    },

    /// Grace expired or the player left for good
    PlayerRemoved { session_id: Uuid },

    PlayerTakenOver { claimant_id: Uuid, target_id: Uuid },

    MatchOver { winner: Option<Uuid> },
}
