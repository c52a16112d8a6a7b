//! Damage, drowning and blast validation

use uuid::Uuid;

use crate::ws::protocol::{Blast, EliminationCause};

/// Starting hit points of every creature
pub const STARTING_HEALTH: f32 = 100.0;

/// Upper bound for a single reported hit
pub const MAX_HIT_DAMAGE: f32 = 200.0;

/// Combat rules for reported explosions and the waterline
pub struct CombatSystem;

impl CombatSystem {
    /// Bound client-reported damage to [0, MAX_HIT_DAMAGE]
    pub fn clamp_damage(raw: f32) -> f32 {
        if raw.is_finite() {
            raw.clamp(0.0, MAX_HIT_DAMAGE)
        } else {
            0.0
        }
    }

    /// Apply damage to health, returns (new_health, is_dead)
    pub fn apply_damage(current_health: f32, damage: f32) -> (f32, bool) {
        let new_health = (current_health - damage).max(0.0);
        (new_health, new_health <= 0.0)
    }

    /// A creature drowns once its centre sinks past the waterline plus margin
    pub fn is_drowned(y: f32, waterline: f32, margin: f32) -> bool {
        y > waterline + margin
    }

    /// Validate a reported blast, capping its force. Non-finite or
    /// non-positive blasts are dropped.
    pub fn sanitize_blast(blast: &Blast, max_force: f32) -> Option<Blast> {
        let finite = [blast.x, blast.y, blast.radius, blast.force]
            .iter()
            .all(|v| v.is_finite());
        if !finite || blast.radius <= 0.0 || blast.force <= 0.0 {
            return None;
        }

        Some(Blast {
            force: blast.force.min(max_force),
            ..*blast
        })
    }
}

/// A creature that has to be taken off the island
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Elimination {
    pub creature_id: Uuid,
    pub cause: EliminationCause,
}
