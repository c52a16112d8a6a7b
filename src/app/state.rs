//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::MatchRegistry;
use crate::matchmaking::MatchmakingService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub matchmaking: Arc<MatchmakingService>,
    pub match_registry: Arc<MatchRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // Initialize match registry
        let match_registry = Arc::new(MatchRegistry::new());

        // Initialize matchmaking service (Arc for sharing across cloned AppState)
        let matchmaking = Arc::new(MatchmakingService::new(
            match_registry.clone(),
            config.game.clone(),
        ));

        Self {
            config,
            matchmaking,
            match_registry,
        }
    }
}
