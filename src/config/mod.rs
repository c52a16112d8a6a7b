//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::game::terrain::TerrainConfig;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated, empty = any)
    pub client_origin: String,
    /// Per-match game rules
    pub game: GameConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_default(),
            game: GameConfig::from_env()?,
        })
    }
}

/// Rules and tuning shared by every match on this server
#[derive(Clone, Debug)]
pub struct GameConfig {
    /// Length of a normal turn
    pub turn_duration_ms: u64,
    /// Remaining turn time after a weapon is used
    pub retreat_window_ms: u64,
    /// How long a disconnected player is kept around
    pub disconnect_grace_ms: u64,
    pub creatures_per_player: usize,
    pub max_players_per_match: usize,
    /// Physics ticks between kinematic snapshots
    pub snapshot_interval_ticks: u32,
    pub terrain: TerrainConfig,
    pub physics: PhysicsConfig,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            turn_duration_ms: 30_000,
            retreat_window_ms: 5_000,
            disconnect_grace_ms: 5 * 60 * 1000,
            creatures_per_player: 3,
            max_players_per_match: 8,
            snapshot_interval_ticks: 2,
            terrain: TerrainConfig::default(),
            physics: PhysicsConfig::default(),
        }
    }
}

impl GameConfig {
    /// Defaults overridden by whichever variables are set
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut game = Self::default();

        game.turn_duration_ms = env_or("TURN_DURATION_MS", game.turn_duration_ms)?;
        game.retreat_window_ms = env_or("RETREAT_WINDOW_MS", game.retreat_window_ms)?;
        game.disconnect_grace_ms = env_or("DISCONNECT_GRACE_MS", game.disconnect_grace_ms)?;
        game.creatures_per_player = env_or("CREATURES_PER_PLAYER", game.creatures_per_player)?;
        game.max_players_per_match =
            env_or("MAX_PLAYERS_PER_MATCH", game.max_players_per_match)?;
        game.snapshot_interval_ticks =
            env_or("SNAPSHOT_INTERVAL_TICKS", game.snapshot_interval_ticks)?.max(1);

        game.terrain.half_span = env_or("TERRAIN_HALF_SPAN", game.terrain.half_span)?;
        game.terrain.waterline = env_or("TERRAIN_WATERLINE", game.terrain.waterline)?;
        game.terrain.segments = env_or("TERRAIN_SEGMENTS", game.terrain.segments)?;
        game.terrain.random_phase = env_or("TERRAIN_RANDOM_PHASE", game.terrain.random_phase)?;

        game.physics.gravity = env_or("PHYSICS_GRAVITY", game.physics.gravity)?;
        game.physics.max_substeps = env_or("PHYSICS_MAX_SUBSTEPS", game.physics.max_substeps)?;

        if game.creatures_per_player == 0 {
            return Err(ConfigError::Invalid("CREATURES_PER_PLAYER"));
        }
        if game.max_players_per_match < 2 {
            return Err(ConfigError::Invalid("MAX_PLAYERS_PER_MATCH"));
        }

        Ok(game)
    }
}

/// Physics world tuning. Units are pixels and seconds, y grows downward.
#[derive(Clone, Debug)]
pub struct PhysicsConfig {
    pub gravity: f32,
    /// Continuous horizontal force while a direction key is held
    pub move_force: f32,
    /// Upward velocity change applied by one jump
    pub jump_speed: f32,
    pub creature_radius: f32,
    pub crate_half_size: f32,
    /// Extra distance at which a creature still picks up a crate
    pub pickup_slack: f32,
    /// Depth below the waterline at which a creature drowns
    pub drown_margin: f32,
    /// Height above dry land a crate must clear to count as dry
    pub dry_land_margin: f32,
    /// Crates are dropped from this y so they fall onto the island
    pub crate_spawn_y: f32,
    pub terrain_thickness: f32,
    pub max_substep_secs: f32,
    pub max_substeps: u32,
    pub max_blast_force: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: 980.0,
            move_force: 900.0,
            jump_speed: 420.0,
            creature_radius: 18.0,
            crate_half_size: 12.0,
            pickup_slack: 6.0,
            drown_margin: 40.0,
            dry_land_margin: 10.0,
            crate_spawn_y: -600.0,
            terrain_thickness: 40.0,
            max_substep_secs: 1.0 / 60.0,
            max_substeps: 8,
            max_blast_force: 1_200.0,
        }
    }
}

fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
