//! Matchmaking service - places sessions into running matches

use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::GameConfig;
use crate::game::terrain::TerrainError;
use crate::game::{GameMatch, MatchHandle, MatchRegistry};

/// Matchmaking service
pub struct MatchmakingService {
    registry: Arc<MatchRegistry>,
    config: Arc<GameConfig>,
    /// Serializes assignment so two sessions never both spawn a match
    lock: Mutex<()>,
}

impl MatchmakingService {
    pub fn new(registry: Arc<MatchRegistry>, config: GameConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            lock: Mutex::new(()),
        }
    }

    /// Pick a running match with a free slot, or start a new one.
    ///
    /// The returned slot is reserved immediately and released by the match
    /// once it has processed the session's join.
    pub fn assign(&self) -> Result<MatchHandle, TerrainError> {
        let _guard = self.lock.lock();

        let handle = match self
            .registry
            .find_available_match(self.config.max_players_per_match)
        {
            Some(handle) => handle,
            None => self.create_match()?,
        };
        handle.reserve();

        Ok(handle)
    }

    /// Create and spawn a new match
    fn create_match(&self) -> Result<MatchHandle, TerrainError> {
        let match_id = Uuid::new_v4();
        let seed = rand::random::<u64>();

        let (game_match, handle) = GameMatch::new(match_id, seed, (*self.config).clone())?;

        // Register match
        self.registry.insert(handle.clone());

        info!(
            match_id = %match_id,
            active_matches = self.registry.active_matches(),
            "Created new match"
        );

        // Spawn match task
        let registry = self.registry.clone();
        tokio::spawn(async move {
            game_match.run().await;

            // Cleanup after match ends
            registry.remove(&match_id);
            info!(match_id = %match_id, "Match removed from registry");
        });

        Ok(handle)
    }
}
