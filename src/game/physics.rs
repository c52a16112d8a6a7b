//! Rigid-body world backed by rapier2d
//!
//! Holds one dynamic body per creature and per crate plus a chain of fixed
//! rectangles for the island surface. Bodies are addressed by game id through
//! an index owned here; nothing is attached to rapier's own user data.

use std::collections::HashMap;

use rapier2d::prelude::*;
use uuid::Uuid;

use crate::config::PhysicsConfig;

use super::terrain::Terrain;

const CREATURE_RESTITUTION: f32 = 0.9;
const CREATURE_FRICTION: f32 = 0.05;
const CREATURE_DENSITY: f32 = 0.001;

const CRATE_RESTITUTION: f32 = 0.1;
const CRATE_FRICTION: f32 = 0.8;
const CRATE_DENSITY: f32 = 0.002;

const TERRAIN_RESTITUTION: f32 = 0.3;
const TERRAIN_FRICTION: f32 = 0.6;

/// What a dynamic body stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyKind {
    Creature,
    Crate,
}

/// Position and velocity of a body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kinematics {
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
}

#[derive(Debug, Clone, Copy)]
struct BodyEntry {
    kind: BodyKind,
    handle: RigidBodyHandle,
    mass: f32,
}

/// The authoritative physics simulation of one match
pub struct PhysicsWorld {
    pipeline: PhysicsPipeline,
    gravity: Vector<Real>,
    integration_params: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
    /// Game id -> rapier body
    bodies: HashMap<Uuid, BodyEntry>,
    /// Rapier body -> game id
    body_ids: HashMap<RigidBodyHandle, Uuid>,
    terrain_segments: usize,
    max_substep: f32,
    max_substeps: u32,
}

impl PhysicsWorld {
    /// Create a world with the island surface already in place
    pub fn new(config: &PhysicsConfig, terrain: &Terrain) -> Self {
        let mut integration_params = IntegrationParameters::default();
        // Pixel units: scale rapier's length tolerances accordingly
        integration_params.length_unit = 50.0;

        let mut world = Self {
            pipeline: PhysicsPipeline::new(),
            gravity: vector![0.0, config.gravity],
            integration_params,
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            bodies: HashMap::new(),
            body_ids: HashMap::new(),
            terrain_segments: 0,
            max_substep: config.max_substep_secs.max(1e-4),
            max_substeps: config.max_substeps.max(1),
        };

        world.build_terrain(terrain, config.terrain_thickness);
        world
    }

    /// One fixed rectangle per surface segment, rotated along the segment and
    /// pushed half its thickness along the downward normal so the top face
    /// lies on the sampled surface.
    fn build_terrain(&mut self, terrain: &Terrain, thickness: f32) {
        let half_thickness = thickness / 2.0;

        for (a, b) in terrain.segments() {
            let dx = b.x - a.x;
            let dy = b.y - a.y;
            let length = (dx * dx + dy * dy).sqrt();
            if length <= f32::EPSILON {
                continue;
            }

            let (tx, ty) = (dx / length, dy / length);
            // Rotating the tangent by +90° points down in y-down coordinates
            let (nx, ny) = (-ty, tx);
            let cx = (a.x + b.x) / 2.0 + nx * half_thickness;
            let cy = (a.y + b.y) / 2.0 + ny * half_thickness;

            let body = RigidBodyBuilder::fixed()
                .translation(vector![cx, cy])
                .rotation(dy.atan2(dx))
                .build();
            let handle = self.rigid_body_set.insert(body);

            // Slight overlap hides seams between neighbouring segments
            let collider = ColliderBuilder::cuboid(length / 2.0 + 1.0, half_thickness)
                .restitution(TERRAIN_RESTITUTION)
                .friction(TERRAIN_FRICTION)
                .build();
            self.collider_set
                .insert_with_parent(collider, handle, &mut self.rigid_body_set);
            self.terrain_segments += 1;
        }
    }

    /// Add a creature body. No-op if the id is already registered.
    pub fn add_creature(&mut self, id: Uuid, x: f32, y: f32, radius: f32) {
        if self.bodies.contains_key(&id) {
            return;
        }

        let body = RigidBodyBuilder::dynamic()
            .translation(vector![x, y])
            .lock_rotations()
            .ccd_enabled(true)
            .build();
        let collider = ColliderBuilder::ball(radius)
            .restitution(CREATURE_RESTITUTION)
            .friction(CREATURE_FRICTION)
            .density(CREATURE_DENSITY)
            .build();

        let mass = CREATURE_DENSITY * std::f32::consts::PI * radius * radius;
        self.insert(id, BodyKind::Creature, body, collider, mass);
    }

    /// Add a crate body. No-op if the id is already registered.
    pub fn add_crate(&mut self, id: Uuid, x: f32, y: f32, half_size: f32) {
        if self.bodies.contains_key(&id) {
            return;
        }

        let body = RigidBodyBuilder::dynamic()
            .translation(vector![x, y])
            .ccd_enabled(true)
            .build();
        let collider = ColliderBuilder::cuboid(half_size, half_size)
            .restitution(CRATE_RESTITUTION)
            .friction(CRATE_FRICTION)
            .density(CRATE_DENSITY)
            .build();

        let mass = CRATE_DENSITY * 4.0 * half_size * half_size;
        self.insert(id, BodyKind::Crate, body, collider, mass);
    }

    fn insert(&mut self, id: Uuid, kind: BodyKind, body: RigidBody, collider: Collider, mass: f32) {
        let handle = self.rigid_body_set.insert(body);
        self.collider_set
            .insert_with_parent(collider, handle, &mut self.rigid_body_set);
        self.bodies.insert(id, BodyEntry { kind, handle, mass });
        self.body_ids.insert(handle, id);
    }

    /// Remove a body and its index entries. Returns false if it was not present.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let Some(entry) = self.bodies.remove(&id) else {
            return false;
        };
        self.body_ids.remove(&entry.handle);
        self.rigid_body_set.remove(
            entry.handle,
            &mut self.island_manager,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            true,
        );
        true
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.bodies.contains_key(&id)
    }

    /// Number of dynamic bodies (creatures and crates)
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn terrain_segment_count(&self) -> usize {
        self.terrain_segments
    }

    /// Drop every continuous force so only this tick's inputs apply
    pub fn clear_forces(&mut self) {
        for handle in self.body_ids.keys() {
            if let Some(body) = self.rigid_body_set.get_mut(*handle) {
                body.reset_forces(false);
            }
        }
    }

    /// Add a continuous force for the rest of the tick
    pub fn apply_force(&mut self, id: Uuid, fx: f32, fy: f32) {
        if let Some(body) = self.body_mut(id) {
            body.add_force(vector![fx, fy], true);
        }
    }

    /// Instantaneous velocity change, independent of the body's mass
    pub fn apply_velocity_change(&mut self, id: Uuid, dvx: f32, dvy: f32) {
        let Some(mass) = self.bodies.get(&id).map(|entry| entry.mass) else {
            return;
        };
        if let Some(body) = self.body_mut(id) {
            body.apply_impulse(vector![dvx * mass, dvy * mass], true);
        }
    }

    /// Push creatures away from a blast centre, falling off linearly to zero at
    /// `radius`. Returns the creatures that were pushed.
    pub fn apply_blast(&mut self, cx: f32, cy: f32, radius: f32, strength: f32) -> Vec<Uuid> {
        if radius <= 0.0 || strength <= 0.0 {
            return Vec::new();
        }

        let creatures: Vec<Uuid> = self
            .bodies
            .iter()
            .filter(|(_, entry)| entry.kind == BodyKind::Creature)
            .map(|(id, _)| *id)
            .collect();

        let mut pushed = Vec::new();
        for id in creatures {
            let Some(k) = self.kinematics(id) else {
                continue;
            };
            let (dx, dy) = (k.x - cx, k.y - cy);
            let dist = (dx * dx + dy * dy).sqrt();
            if dist > radius {
                continue;
            }

            let falloff = 1.0 - dist / radius;
            // Straight up when sitting on the blast centre
            let (nx, ny) = if dist < 1e-3 { (0.0, -1.0) } else { (dx / dist, dy / dist) };
            self.apply_velocity_change(id, nx * strength * falloff, ny * strength * falloff);
            pushed.push(id);
        }
        pushed
    }

    /// Advance the simulation by `elapsed` seconds, split into sub-steps no
    /// longer than the configured maximum. Sub-steps are capped; time beyond
    /// the cap is dropped. Returns the number of sub-steps taken.
    pub fn step(&mut self, elapsed: f32) -> u32 {
        if !elapsed.is_finite() || elapsed <= 0.0 {
            return 0;
        }

        let needed = (elapsed / self.max_substep).ceil() as u32;
        let substeps = needed.clamp(1, self.max_substeps);
        self.integration_params.dt = (elapsed / substeps as f32).min(self.max_substep);

        for _ in 0..substeps {
            self.pipeline.step(
                &self.gravity,
                &self.integration_params,
                &mut self.island_manager,
                &mut self.broad_phase,
                &mut self.narrow_phase,
                &mut self.rigid_body_set,
                &mut self.collider_set,
                &mut self.impulse_joint_set,
                &mut self.multibody_joint_set,
                &mut self.ccd_solver,
                None,
                &(),
                &(),
            );
        }

        substeps
    }

    pub fn kinematics(&self, id: Uuid) -> Option<Kinematics> {
        let entry = self.bodies.get(&id)?;
        let body = self.rigid_body_set.get(entry.handle)?;
        let pos = body.translation();
        let vel = body.linvel();
        Some(Kinematics {
            x: pos.x,
            y: pos.y,
            vx: vel.x,
            vy: vel.y,
        })
    }

    /// Move a body, keeping its velocity
    #[cfg(test)]
    pub fn set_position(&mut self, id: Uuid, x: f32, y: f32) {
        if let Some(body) = self.body_mut(id) {
            body.set_translation(vector![x, y], true);
        }
    }

    fn body_mut(&mut self, id: Uuid) -> Option<&mut RigidBody> {
        let handle = self.bodies.get(&id)?.handle;
        self.rigid_body_set.get_mut(handle)
    }
}
