//! Match assignment

pub mod service;

pub use service::MatchmakingService;
