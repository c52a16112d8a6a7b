//! Weapon crates

use rand::Rng;
use uuid::Uuid;

use crate::ws::protocol::{CrateView, WeaponKind};

use super::terrain::Terrain;

/// The single weapon crate on the island
#[derive(Debug, Clone)]
pub struct SupplyCrate {
    pub id: Uuid,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub weapon: WeaponKind,
}

impl SupplyCrate {
    /// Roll a new crate above a dry spot of the island. Falls back to any
    /// surface sample when nothing is dry.
    pub fn roll<R: Rng>(terrain: &Terrain, dry_margin: f32, spawn_y: f32, rng: &mut R) -> Self {
        let point = terrain.random_dry_point(dry_margin, rng);
        let weapon = WeaponKind::ALL[rng.gen_range(0..WeaponKind::ALL.len())];

        Self {
            id: Uuid::new_v4(),
            x: point.x,
            y: spawn_y,
            vx: 0.0,
            vy: 0.0,
            weapon,
        }
    }

    /// Whether a creature at (x, y) is close enough to grab the crate
    pub fn within_reach(&self, x: f32, y: f32, reach: f32) -> bool {
        let dx = self.x - x;
        let dy = self.y - y;
        dx * dx + dy * dy <= reach * reach
    }

    pub fn view(&self) -> CrateView {
        CrateView {
            id: self.id,
            x: self.x,
            y: self.y,
            weapon: self.weapon,
        }
    }
}
