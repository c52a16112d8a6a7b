//! Match state and authoritative tick loop

use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::util::time::{unix_millis, Timer, SIMULATION_TPS, TICK_DURATION_MICROS};
use crate::ws::protocol::{
    Blast, ClientMsg, CreatureView, DamageHit, EliminationCause, GameEvent, MatchView, ServerMsg,
};

use super::combat::{CombatSystem, Elimination, STARTING_HEALTH};
use super::physics::PhysicsWorld;
use super::pickup::SupplyCrate;
use super::presence::Presence;
use super::snapshot::SnapshotBuilder;
use super::terrain::{Terrain, TerrainError, TerrainPoint};
use super::turn::{TurnChange, TurnScheduler};
use super::PlayerInput;

/// Creatures spawn on land at least this far above the waterline when possible
const SPAWN_DRY_MARGIN: f32 = 100.0;
/// Steepest neighbouring segment a creature may spawn on; below the
/// creature/terrain friction so it stays put
const SPAWN_MAX_SLOPE: f32 = 0.2;
/// Creatures start resting just above the surface
const SPAWN_LIFT: f32 = 0.5;
/// Horizontal gap kept between a new creature or crate and existing creatures
const SPAWN_GAP: f32 = 4.0;
/// Rerolls allowed to keep a crate from dropping onto a creature
const CRATE_PLACEMENT_TRIES: usize = 8;

/// Replicated creature state, mirrored from the physics world every tick
#[derive(Debug, Clone)]
pub struct CreatureState {
    pub id: Uuid,
    pub owner: Uuid,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub radius: f32,
    pub color: u32,
    pub hp: f32,
}

impl CreatureState {
    pub fn view(&self) -> CreatureView {
        CreatureView {
            id: self.id,
            owner: self.owner,
            x: self.x,
            y: self.y,
            radius: self.radius,
            color: self.color,
            hp: self.hp,
        }
    }
}

/// Inputs of the active player, drained every tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ControlState {
    left: bool,
    right: bool,
    jump_queued: bool,
}

/// Everything one match owns. Mutated only by its own tick loop.
pub struct MatchState {
    pub id: Uuid,
    pub seed: u64,
    pub tick: u64,
    config: GameConfig,
    terrain: Terrain,
    physics: PhysicsWorld,
    presence: Presence,
    turns: TurnScheduler,
    creatures: HashMap<Uuid, CreatureState>,
    supply_crate: Option<SupplyCrate>,
    controls: ControlState,
    rng: ChaCha8Rng,
    /// Events since the last snapshot
    events: Vec<GameEvent>,
    /// Replicated state changed since last checked
    dirty: bool,
}

impl MatchState {
    pub fn new(id: Uuid, seed: u64, config: GameConfig) -> Result<Self, TerrainError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let terrain = Terrain::generate(&config.terrain, &mut rng)?;
        let physics = PhysicsWorld::new(&config.physics, &terrain);

        debug!(
            match_id = %id,
            terrain_segments = physics.terrain_segment_count(),
            "Island generated"
        );

        Ok(Self {
            id,
            seed,
            tick: 0,
            presence: Presence::new(config.disconnect_grace_ms),
            turns: TurnScheduler::new(config.turn_duration_ms, config.retreat_window_ms),
            terrain,
            physics,
            creatures: HashMap::new(),
            supply_crate: None,
            controls: ControlState::default(),
            rng,
            events: Vec::new(),
            dirty: true,
            config,
        })
    }

    pub fn player_count(&self) -> usize {
        self.presence.len()
    }

    pub fn is_over(&self) -> bool {
        self.turns.is_over()
    }

    pub fn has_session(&self, session_id: Uuid) -> bool {
        self.presence.contains(session_id)
    }

    pub fn winner(&self) -> Option<Uuid> {
        self.turns.winner()
    }

    pub fn supply_crate(&self) -> Option<&SupplyCrate> {
        self.supply_crate.as_ref()
    }

    /// Living creatures in join order, then creation order
    pub fn creatures_in_order(&self) -> impl Iterator<Item = &CreatureState> + '_ {
        self.presence
            .iter()
            .flat_map(|p| p.creatures.iter())
            .filter_map(move |id| self.creatures.get(id))
    }

    pub fn take_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Route one client message. Returns a message to broadcast right away.
    pub fn handle_message(&mut self, session_id: Uuid, msg: ClientMsg, now: u64) -> Option<ServerMsg> {
        match msg {
            ClientMsg::Join { name } => return self.handle_join(session_id, name, now),
            ClientMsg::Input { left, right } => self.handle_input(session_id, left, right),
            ClientMsg::Jump => self.handle_jump(session_id),
            ClientMsg::EndTurn => self.handle_end_turn(session_id, now),
            ClientMsg::PickupCrate {
                crate_id,
                by_session_id,
            } => self.handle_pickup(session_id, crate_id, by_session_id),
            ClientMsg::ConsumeWeapon => self.handle_consume_weapon(session_id, now),
            ClientMsg::ApplyDamage { hits, blast } => {
                self.handle_apply_damage(session_id, &hits, blast, now)
            }
            ClientMsg::Takeover { target_session_id } => {
                self.handle_takeover(session_id, target_session_id, now)
            }
            ClientMsg::Leave => self.handle_leave(session_id, now),
            ClientMsg::Ping { t } => return Some(ServerMsg::Pong { session_id, t }),
        }
        None
    }

    /// Handle player join request
    fn handle_join(&mut self, session_id: Uuid, name: Option<String>, now: u64) -> Option<ServerMsg> {
        if self.presence.contains(session_id) {
            debug!(session_id = %session_id, "Session already in match");
            return None;
        }
        if self.turns.is_over() {
            return Some(ServerMsg::Error {
                session_id,
                code: "match_over".to_string(),
                message: "Match has ended".to_string(),
            });
        }
        if self.presence.len() >= self.config.max_players_per_match {
            return Some(ServerMsg::Error {
                session_id,
                code: "match_full".to_string(),
                message: "Match is full".to_string(),
            });
        }

        let color = self.presence.join(session_id, name)?.color;

        let radius = self.config.physics.creature_radius;
        let mut roster = Vec::with_capacity(self.config.creatures_per_player);
        for _ in 0..self.config.creatures_per_player {
            let point = self.pick_spawn_point(radius);
            let id = Uuid::new_v4();
            let y = point.y - radius - SPAWN_LIFT;

            self.physics.add_creature(id, point.x, y, radius);
            self.creatures.insert(
                id,
                CreatureState {
                    id,
                    owner: session_id,
                    x: point.x,
                    y,
                    vx: 0.0,
                    vy: 0.0,
                    radius,
                    color,
                    hp: STARTING_HEALTH,
                },
            );
            roster.push(id);
        }
        if let Some(record) = self.presence.get_mut(session_id) {
            record.creatures = roster;
        }

        self.turns.note_owners(&self.presence);
        if let Some(change) = self.turns.start_if_idle(&self.presence, now) {
            self.apply_turn_change(change);
        }
        self.dirty = true;

        info!(
            match_id = %self.id,
            session_id = %session_id,
            player_count = self.presence.len(),
            "Player joined match"
        );

        Some(ServerMsg::MatchJoined {
            match_id: self.id,
            session_id,
            terrain: self.terrain.points().to_vec(),
            waterline: self.terrain.waterline(),
            players: self.presence.iter().map(|p| p.info()).collect(),
        })
    }

    /// A gentle dry sample clear of other creatures, falling back to any
    /// gentle sample, then to any dry one
    fn pick_spawn_point(&mut self, radius: f32) -> TerrainPoint {
        let candidates = self.terrain.spawn_points(SPAWN_DRY_MARGIN, SPAWN_MAX_SLOPE);
        let free: Vec<TerrainPoint> = candidates
            .iter()
            .copied()
            .filter(|p| self.is_clear_of_creatures(p.x, 2.0 * radius))
            .collect();

        let pool = if free.is_empty() { candidates } else { free };
        if pool.is_empty() {
            return self.terrain.random_dry_point(SPAWN_DRY_MARGIN, &mut self.rng);
        }
        pool[self.rng.gen_range(0..pool.len())]
    }

    fn is_clear_of_creatures(&self, x: f32, span: f32) -> bool {
        self.creatures
            .values()
            .all(|c| (c.x - x).abs() >= span + SPAWN_GAP)
    }

    fn handle_input(&mut self, session_id: Uuid, left: bool, right: bool) {
        if !self.turns.is_active_session(session_id) {
            debug!(session_id = %session_id, "Ignoring input from inactive session");
            return;
        }
        self.controls.left = left;
        self.controls.right = right;
    }

    fn handle_jump(&mut self, session_id: Uuid) {
        if !self.turns.is_active_session(session_id) {
            debug!(session_id = %session_id, "Ignoring jump from inactive session");
            return;
        }
        self.controls.jump_queued = true;
    }

    fn handle_end_turn(&mut self, session_id: Uuid, now: u64) {
        if !self.turns.is_active_session(session_id) {
            debug!(session_id = %session_id, "Ignoring end turn from inactive session");
            return;
        }
        debug!(match_id = %self.id, session_id = %session_id, "Turn ended early");
        self.advance_turn(now);
    }

    /// A pickup claim is honoured only for the live crate and only when one of
    /// the claimed session's creatures is within reach of it.
    fn handle_pickup(&mut self, sender: Uuid, crate_id: Uuid, by_session_id: Uuid) {
        if !self.presence.contains(sender) {
            return;
        }
        let Some(supply) = &self.supply_crate else {
            return;
        };
        if supply.id != crate_id {
            debug!(crate_id = %crate_id, "Ignoring pickup of stale crate");
            return;
        }
        let Some(player) = self.presence.get(by_session_id) else {
            return;
        };

        let reach = self.pickup_reach();
        let in_reach = player
            .creatures
            .iter()
            .filter_map(|id| self.creatures.get(id))
            .any(|c| supply.within_reach(c.x, c.y, reach));
        if !in_reach {
            debug!(session_id = %by_session_id, "Ignoring pickup out of reach");
            return;
        }

        self.pick_up_crate(by_session_id);
    }

    fn handle_consume_weapon(&mut self, session_id: Uuid, now: u64) {
        if !self.turns.is_active_session(session_id) {
            return;
        }
        let Some(weapon) = self
            .presence
            .get_mut(session_id)
            .and_then(|p| p.weapon.take())
        else {
            debug!(session_id = %session_id, "Ignoring weapon use with empty slot");
            return;
        };

        self.turns.start_retreat(now);
        self.events.push(GameEvent::WeaponConsumed { session_id, weapon });
        self.dirty = true;
    }

    fn handle_apply_damage(&mut self, session_id: Uuid, hits: &[DamageHit], blast: Option<Blast>, now: u64) {
        if !self.turns.is_active_session(session_id) {
            debug!(session_id = %session_id, "Ignoring damage report from inactive session");
            return;
        }

        if let Some(blast) = blast.and_then(|b| CombatSystem::sanitize_blast(&b, self.config.physics.max_blast_force)) {
            self.physics
                .apply_blast(blast.x, blast.y, blast.radius, blast.force);
        }

        let mut eliminated: Vec<Elimination> = Vec::new();
        for hit in hits {
            let Some(creature) = self.creatures.get_mut(&hit.id) else {
                continue;
            };
            let damage = CombatSystem::clamp_damage(hit.dmg);
            let (hp, dead) = CombatSystem::apply_damage(creature.hp, damage);
            creature.hp = hp;
            self.dirty = true;

            if dead && !eliminated.iter().any(|e| e.creature_id == hit.id) {
                eliminated.push(Elimination {
                    creature_id: hit.id,
                    cause: EliminationCause::Damage,
                });
            }
        }

        self.eliminate(eliminated, now);
    }

    fn handle_takeover(&mut self, claimant: Uuid, target: Uuid, now: u64) {
        let outcome = match self.presence.takeover(claimant, target, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(match_id = %self.id, error = %e, "Takeover rejected");
                return;
            }
        };

        let lost_active = self.turns.is_active_session(claimant)
            && self
                .turns
                .active_creature()
                .is_some_and(|id| outcome.discarded.contains(&id));

        for id in &outcome.discarded {
            self.remove_creature(*id, EliminationCause::Removed);
        }
        for id in &outcome.inherited {
            if let Some(creature) = self.creatures.get_mut(id) {
                creature.owner = claimant;
            }
        }
        self.turns.transfer(target, claimant, &self.presence);

        self.events.push(GameEvent::PlayerTakenOver {
            claimant_id: claimant,
            target_id: target,
        });
        self.dirty = true;

        info!(
            match_id = %self.id,
            claimant = %claimant,
            target = %target,
            creatures = outcome.inherited.len(),
            "Session taken over"
        );

        if lost_active {
            self.advance_turn(now);
        } else {
            self.resolve_winner();
        }
    }

    /// Handle player leave: keep everything for the grace window, unless
    /// that leaves a two-owner endgame, which is decided on the spot
    fn handle_leave(&mut self, session_id: Uuid, now: u64) {
        if !self.presence.contains(session_id) {
            return;
        }
        if self.turns.is_over() {
            self.presence.remove(session_id);
            self.dirty = true;
            return;
        }

        let Some(until) = self.presence.mark_disconnected(session_id, now) else {
            return;
        };
        self.events.push(GameEvent::PlayerDisconnected { session_id, until });
        self.dirty = true;

        info!(
            match_id = %self.id,
            session_id = %session_id,
            grace_until = until,
            "Player disconnected"
        );

        self.resolve_winner();
        if self.turns.is_active_session(session_id) {
            self.advance_turn(now);
        }
    }

    /// Run a single simulation tick: presence, input, physics, mirroring,
    /// pickups, drowning, then the turn clock.
    pub fn tick(&mut self, now: u64, elapsed: f32) {
        self.tick += 1;
        if self.turns.is_over() {
            return;
        }

        for session_id in self.presence.expired(now) {
            self.remove_player(session_id, now);
        }

        if let Some(active) = self.turns.active_player() {
            if !self.presence.is_eligible(active) {
                self.advance_turn(now);
            }
        }
        if let Some(change) = self.turns.start_if_idle(&self.presence, now) {
            self.apply_turn_change(change);
        }

        self.apply_controls();
        self.physics.step(elapsed);
        self.mirror_bodies();

        self.collect_crate_by_touch();
        self.check_drowning(now);

        if self.turns.is_expired(now) {
            debug!(match_id = %self.id, "Turn timed out");
            self.advance_turn(now);
        }
    }

    fn apply_controls(&mut self) {
        self.physics.clear_forces();
        let Some(creature_id) = self.turns.active_creature() else {
            return;
        };

        let direction = match (self.controls.left, self.controls.right) {
            (true, false) => -1.0,
            (false, true) => 1.0,
            _ => 0.0,
        };
        if direction != 0.0 {
            self.physics
                .apply_force(creature_id, direction * self.config.physics.move_force, 0.0);
        }

        if std::mem::take(&mut self.controls.jump_queued) {
            self.physics
                .apply_velocity_change(creature_id, 0.0, -self.config.physics.jump_speed);
        }
    }

    /// Copy body kinematics into the replicated state
    fn mirror_bodies(&mut self) {
        for creature in self.creatures.values_mut() {
            if let Some(k) = self.physics.kinematics(creature.id) {
                creature.x = k.x;
                creature.y = k.y;
                creature.vx = k.vx;
                creature.vy = k.vy;
            }
        }
        if let Some(supply) = self.supply_crate.as_mut() {
            if let Some(k) = self.physics.kinematics(supply.id) {
                supply.x = k.x;
                supply.y = k.y;
                supply.vx = k.vx;
                supply.vy = k.vy;
            }
        }
    }

    fn pickup_reach(&self) -> f32 {
        let physics = &self.config.physics;
        physics.creature_radius + physics.crate_half_size + physics.pickup_slack
    }

    /// The active creature picks up the crate by touching it. A crate that
    /// sinks is gone.
    fn collect_crate_by_touch(&mut self) {
        let Some(supply) = &self.supply_crate else {
            return;
        };

        let physics = &self.config.physics;
        if CombatSystem::is_drowned(supply.y, self.terrain.waterline(), physics.drown_margin) {
            let id = supply.id;
            self.physics.remove(id);
            self.supply_crate = None;
            self.dirty = true;
            debug!(match_id = %self.id, crate_id = %id, "Crate sank");
            return;
        }

        let (Some(player_id), Some(creature_id)) =
            (self.turns.active_player(), self.turns.active_creature())
        else {
            return;
        };
        let touching = self
            .creatures
            .get(&creature_id)
            .is_some_and(|c| supply.within_reach(c.x, c.y, self.pickup_reach()));
        if touching {
            self.pick_up_crate(player_id);
        }
    }

    fn pick_up_crate(&mut self, session_id: Uuid) {
        let Some(supply) = self.supply_crate.take() else {
            return;
        };
        self.physics.remove(supply.id);
        if let Some(player) = self.presence.get_mut(session_id) {
            // Single slot: a new weapon replaces the old one
            player.weapon = Some(supply.weapon);
        }

        self.events.push(GameEvent::CratePickedUp {
            crate_id: supply.id,
            session_id,
            weapon: supply.weapon,
        });
        self.dirty = true;

        info!(
            match_id = %self.id,
            session_id = %session_id,
            weapon = ?supply.weapon,
            "Crate picked up"
        );
    }

    /// Replace whatever crate exists with a fresh one dropped over dry land
    fn respawn_crate(&mut self) {
        if let Some(old) = self.supply_crate.take() {
            self.physics.remove(old.id);
        }

        let physics = &self.config.physics;
        let span = physics.creature_radius + physics.crate_half_size;
        let mut supply = SupplyCrate::roll(
            &self.terrain,
            physics.dry_land_margin,
            physics.crate_spawn_y,
            &mut self.rng,
        );
        for _ in 0..CRATE_PLACEMENT_TRIES {
            if self.is_clear_of_creatures(supply.x, span) {
                break;
            }
            supply = SupplyCrate::roll(
                &self.terrain,
                physics.dry_land_margin,
                physics.crate_spawn_y,
                &mut self.rng,
            );
        }
        self.physics
            .add_crate(supply.id, supply.x, supply.y, physics.crate_half_size);

        self.events.push(GameEvent::CrateSpawned {
            crate_id: supply.id,
            weapon: supply.weapon,
            x: supply.x,
            y: supply.y,
        });
        debug!(
            match_id = %self.id,
            crate_id = %supply.id,
            bodies = self.physics.body_count(),
            "Crate dropped"
        );
        self.supply_crate = Some(supply);
    }

    fn check_drowning(&mut self, now: u64) {
        let waterline = self.terrain.waterline();
        let margin = self.config.physics.drown_margin;

        let drowned: Vec<Elimination> = self
            .creatures_in_order()
            .filter(|c| CombatSystem::is_drowned(c.y, waterline, margin))
            .map(|c| Elimination {
                creature_id: c.id,
                cause: EliminationCause::Drowned,
            })
            .collect();

        self.eliminate(drowned, now);
    }

    /// Take creatures off the island. Losing the active creature ends the
    /// turn; otherwise only the win condition is re-checked.
    fn eliminate(&mut self, eliminations: Vec<Elimination>, now: u64) {
        if eliminations.is_empty() {
            return;
        }

        let active = self.turns.active_creature();
        let mut lost_active = false;
        for elimination in eliminations {
            if self.remove_creature(elimination.creature_id, elimination.cause)
                && active == Some(elimination.creature_id)
            {
                lost_active = true;
            }
        }

        if lost_active {
            self.advance_turn(now);
        } else {
            self.resolve_winner();
        }
    }

    /// Remove a creature from state, physics and its owner. Returns false if
    /// it was already gone.
    fn remove_creature(&mut self, creature_id: Uuid, cause: EliminationCause) -> bool {
        let Some(creature) = self.creatures.remove(&creature_id) else {
            return false;
        };
        self.physics.remove(creature_id);
        self.presence.remove_creature(creature.owner, creature_id);

        self.events.push(GameEvent::CreatureEliminated {
            creature_id,
            owner_id: creature.owner,
            cause,
        });
        self.dirty = true;

        info!(
            match_id = %self.id,
            creature_id = %creature_id,
            owner = %creature.owner,
            cause = ?cause,
            "Creature eliminated"
        );
        true
    }

    /// Remove a player whose grace window ran out, together with its creatures
    fn remove_player(&mut self, session_id: Uuid, now: u64) {
        let was_active = self.turns.is_active_session(session_id);
        let Some(record) = self.presence.remove(session_id) else {
            return;
        };

        for creature_id in record.creatures {
            self.remove_creature(creature_id, EliminationCause::Removed);
        }
        self.turns.forget(session_id);
        self.events.push(GameEvent::PlayerRemoved { session_id });
        self.dirty = true;

        info!(
            match_id = %self.id,
            session_id = %session_id,
            empty = self.presence.is_empty(),
            "Player removed after grace window"
        );

        if was_active {
            self.advance_turn(now);
        } else {
            self.resolve_winner();
        }
    }

    fn advance_turn(&mut self, now: u64) {
        if self.turns.is_over() {
            return;
        }
        let change = self.turns.advance(&self.presence, now);
        self.apply_turn_change(change);
    }

    fn resolve_winner(&mut self) {
        if let Some(change) = self.turns.check_winner(&self.presence) {
            self.apply_turn_change(change);
        }
    }

    fn apply_turn_change(&mut self, change: TurnChange) {
        self.controls = ControlState::default();
        self.dirty = true;

        match change {
            TurnChange::Started {
                player_id,
                creature_id,
                deadline,
            } => {
                self.events.push(GameEvent::TurnStarted {
                    player_id,
                    creature_id,
                    deadline,
                });
                self.respawn_crate();
                debug!(
                    match_id = %self.id,
                    player_id = %player_id,
                    creature_id = %creature_id,
                    "Turn started"
                );
            }
            TurnChange::Idle => {
                debug!(match_id = %self.id, "No eligible player, waiting");
            }
            TurnChange::MatchOver { winner } => {
                self.events.push(GameEvent::MatchOver { winner });
                info!(match_id = %self.id, winner = ?winner, "Match over");
            }
        }
    }

    /// Replicated state as sent to clients
    pub fn view(&self, now: u64) -> MatchView {
        MatchView {
            tick: self.tick,
            creatures: self.creatures_in_order().map(|c| c.view()).collect(),
            supply_crate: self.supply_crate.as_ref().map(|c| c.view()),
            active_player: self.turns.active_player(),
            active_creature: self.turns.active_creature(),
            winner: self.turns.winner(),
            match_over: self.turns.is_over(),
            turn_remaining_ms: self.turns.remaining_ms(now),
            waterline: self.terrain.waterline(),
            join_order: self.presence.join_order().to_vec(),
            players: self.presence.iter().map(|p| p.view()).collect(),
        }
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<PlayerInput>,
    pub snapshot_tx: broadcast::Sender<ServerMsg>,
    pub player_count: Arc<AtomicUsize>,
    /// Sessions assigned here whose join has not been processed yet
    pub reserved: Arc<AtomicUsize>,
    /// Cleared once the match is over
    pub accepting: Arc<AtomicBool>,
}

impl MatchHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    /// Hold a slot for a session about to join
    pub fn reserve(&self) {
        self.reserved.fetch_add(1, Ordering::Relaxed);
    }

    /// Players plus pending reservations
    pub fn occupancy(&self) -> usize {
        self.player_count() + self.reserved.load(Ordering::Relaxed)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().player_count())
            .sum()
    }

    /// Find a running match with available slots
    pub fn find_available_match(&self, max_players: usize) -> Option<MatchHandle> {
        self.matches
            .iter()
            .find(|entry| entry.value().is_accepting() && entry.value().occupancy() < max_players)
            .map(|entry| entry.value().clone())
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative game match
pub struct GameMatch {
    state: MatchState,
    input_rx: mpsc::Receiver<PlayerInput>,
    snapshot_tx: broadcast::Sender<ServerMsg>,
    snapshot_builder: SnapshotBuilder,
    player_count: Arc<AtomicUsize>,
    reserved: Arc<AtomicUsize>,
    accepting: Arc<AtomicBool>,
}

impl GameMatch {
    /// Create a new match
    pub fn new(id: Uuid, seed: u64, config: GameConfig) -> Result<(Self, MatchHandle), TerrainError> {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (snapshot_tx, _) = broadcast::channel(64);
        let player_count = Arc::new(AtomicUsize::new(0));
        let reserved = Arc::new(AtomicUsize::new(0));
        let accepting = Arc::new(AtomicBool::new(true));

        let handle = MatchHandle {
            id,
            input_tx,
            snapshot_tx: snapshot_tx.clone(),
            player_count: player_count.clone(),
            reserved: reserved.clone(),
            accepting: accepting.clone(),
        };

        // Full state at least once a second
        let snapshot_builder = SnapshotBuilder::new(config.snapshot_interval_ticks, SIMULATION_TPS);
        let game_match = Self {
            state: MatchState::new(id, seed, config)?,
            input_rx,
            snapshot_tx,
            snapshot_builder,
            player_count,
            reserved,
            accepting,
        };

        Ok((game_match, handle))
    }

    /// Run the authoritative tick loop
    pub async fn run(mut self) {
        info!(match_id = %self.state.id, seed = self.state.seed, "Match started");

        let mut tick_interval = interval(Duration::from_micros(TICK_DURATION_MICROS));
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut timer = Timer::new();
        let mut had_players = false;

        loop {
            tick_interval.tick().await;
            let now = unix_millis();

            // Drain input queue
            self.process_inputs(now);

            // Run simulation tick over the real elapsed time
            self.state.tick(now, timer.lap());

            self.publish(now);

            let players = self.state.player_count();
            self.player_count.store(players, Ordering::Relaxed);
            had_players |= players > 0;

            if self.state.is_over() {
                info!(match_id = %self.state.id, "Match ended");
                break;
            }
            if had_players && players == 0 {
                info!(match_id = %self.state.id, "All players left, ending match");
                break;
            }
        }

        self.accepting.store(false, Ordering::Relaxed);

        // Flush the final events and state before the result
        let now = unix_millis();
        let events = self.state.take_events();
        let snapshot = self.snapshot_builder.build(
            self.state.tick,
            self.state.creatures_in_order(),
            self.state.supply_crate(),
            events,
        );
        let _ = self.snapshot_tx.send(snapshot);
        let _ = self
            .snapshot_tx
            .send(self.snapshot_builder.build_state(self.state.view(now)));
        let _ = self.snapshot_tx.send(ServerMsg::MatchOver {
            winner: self.state.winner(),
        });
    }

    /// Process all pending inputs from players
    fn process_inputs(&mut self, now: u64) {
        while let Ok(input) = self.input_rx.try_recv() {
            let joining = matches!(input.msg, ClientMsg::Join { .. })
                && !self.state.has_session(input.session_id);
            // Actions are timed from when the socket received them
            let at = input.received_at.min(now);

            let reply = self.state.handle_message(input.session_id, input.msg, at);
            if joining {
                // Accepted or rejected, the slot is no longer pending
                let _ = self
                    .reserved
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            }

            if let Some(reply) = reply {
                if matches!(reply, ServerMsg::MatchJoined { .. }) {
                    // Newcomers get the full state right away
                    self.snapshot_builder.force_next();
                }
                let _ = self.snapshot_tx.send(reply);
            }
        }
    }

    /// Broadcast a snapshot, plus the replicated state when due
    fn publish(&mut self, now: u64) {
        if self.state.take_dirty() {
            self.snapshot_builder.mark_dirty();
        }
        if !self.snapshot_builder.should_send() {
            return;
        }

        let events = self.state.take_events();
        let snapshot = self.snapshot_builder.build(
            self.state.tick,
            self.state.creatures_in_order(),
            self.state.supply_crate(),
            events,
        );
        let _ = self.snapshot_tx.send(snapshot);

        if self.snapshot_builder.take_state_due() {
            let _ = self
                .snapshot_tx
                .send(self.snapshot_builder.build_state(self.state.view(now)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::WeaponKind;

    const TURN: u64 = 30_000;

    fn new_match() -> MatchState {
        MatchState::new(Uuid::new_v4(), 42, GameConfig::default()).unwrap()
    }

    fn join(m: &mut MatchState, now: u64) -> Uuid {
        let id = Uuid::new_v4();
        let reply = m.handle_message(id, ClientMsg::Join { name: None }, now);
        assert!(matches!(reply, Some(ServerMsg::MatchJoined { .. })));
        id
    }

    fn roster(m: &MatchState, player: Uuid) -> Vec<Uuid> {
        m.presence.get(player).unwrap().creatures.clone()
    }

    fn kill(m: &mut MatchState, by: Uuid, creatures: &[Uuid], now: u64) {
        let hits = creatures
            .iter()
            .map(|id| DamageHit { id: *id, dmg: 500.0 })
            .collect();
        m.handle_message(by, ClientMsg::ApplyDamage { hits, blast: None }, now);
    }

    /// Park every creature on the flat middle of the island
    fn gather_at_centre(m: &mut MatchState) {
        let ids: Vec<Uuid> = m.creatures_in_order().map(|c| c.id).collect();
        for (i, id) in ids.into_iter().enumerate() {
            let x = -120.0 + 40.0 * i as f32;
            let y = m.terrain.height_at(x) - m.config.physics.creature_radius - 1.0;
            m.physics.set_position(id, x, y);
        }
        m.mirror_bodies();
    }

    #[test]
    fn join_builds_roster_and_first_turn() {
        let mut m = new_match();
        let p1 = join(&mut m, 1_000);

        let creatures = roster(&m, p1);
        assert_eq!(creatures.len(), GameConfig::default().creatures_per_player);
        assert!(creatures.iter().all(|id| m.physics.contains(*id)));
        assert_eq!(m.turns.active_player(), Some(p1));
        assert_eq!(m.turns.active_creature(), Some(creatures[0]));
        assert_eq!(m.turns.remaining_ms(1_000), TURN);
        assert!(m.supply_crate().is_some());
    }

    #[test]
    fn end_turn_hands_over_with_fresh_deadline() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 100);
        assert_eq!(m.turns.active_player(), Some(p1));

        m.handle_message(p1, ClientMsg::EndTurn, 2_000);
        assert_eq!(m.turns.active_player(), Some(p2));
        assert_eq!(m.turns.remaining_ms(2_000), TURN);
        assert_eq!(m.turns.active_creature(), Some(roster(&m, p2)[0]));
    }

    #[test]
    fn rotation_returns_to_first_player() {
        let mut m = new_match();
        let players: Vec<Uuid> = (0..3).map(|i| join(&mut m, i)).collect();

        let mut now = 10;
        for expected in players.iter().cycle().skip(1).take(3) {
            let active = m.turns.active_player().unwrap();
            m.handle_message(active, ClientMsg::EndTurn, now);
            assert_eq!(m.turns.active_player(), Some(*expected));
            now += 10;
        }
        assert_eq!(m.turns.active_player(), Some(players[0]));
    }

    #[test]
    fn inactive_session_actions_are_ignored() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        let target = roster(&m, p1)[0];

        m.handle_message(p2, ClientMsg::Input { left: true, right: false }, 10);
        m.handle_message(p2, ClientMsg::Jump, 10);
        m.handle_message(p2, ClientMsg::EndTurn, 10);
        m.handle_message(p2, ClientMsg::ConsumeWeapon, 10);
        kill(&mut m, p2, &[target], 10);

        assert_eq!(m.controls, ControlState::default());
        assert_eq!(m.turns.active_player(), Some(p1));
        assert_eq!(m.turns.remaining_ms(10), TURN - 10);
        assert_eq!(m.creatures[&target].hp, STARTING_HEALTH);
    }

    #[test]
    fn active_inputs_are_latched_and_jump_consumed_once() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        join(&mut m, 0);
        gather_at_centre(&mut m);
        for i in 1..=20 {
            m.tick(i * 50, 0.05);
        }

        m.handle_message(p1, ClientMsg::Input { left: false, right: true }, 1_000);
        m.handle_message(p1, ClientMsg::Jump, 1_000);
        m.handle_message(p1, ClientMsg::Jump, 1_000);
        assert!(m.controls.jump_queued);

        m.tick(1_050, 0.05);
        let creature = m.turns.active_creature().unwrap();
        assert!(m.creatures[&creature].vy < 0.0);
        assert!(!m.controls.jump_queued);
        assert!(m.controls.right);
    }

    #[test]
    fn weapon_use_leaves_only_retreat_window() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        join(&mut m, 0);
        m.presence.get_mut(p1).unwrap().weapon = Some(WeaponKind::Grenade);

        m.handle_message(p1, ClientMsg::ConsumeWeapon, 10_000);
        assert_eq!(m.turns.remaining_ms(10_000), 5_000);
        assert_eq!(m.presence.get(p1).unwrap().weapon, None);
        assert!(m.take_events().contains(&GameEvent::WeaponConsumed {
            session_id: p1,
            weapon: WeaponKind::Grenade
        }));
    }

    #[test]
    fn weapon_use_with_empty_slot_is_ignored() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        join(&mut m, 0);

        m.handle_message(p1, ClientMsg::ConsumeWeapon, 10_000);
        assert_eq!(m.turns.remaining_ms(10_000), TURN - 10_000);
    }

    #[test]
    fn killing_active_creature_advances_turn() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        let active = m.turns.active_creature().unwrap();

        kill(&mut m, p1, &[active], 500);
        assert!(!m.creatures.contains_key(&active));
        assert!(!m.physics.contains(active));
        assert_eq!(roster(&m, p1).len(), 2);
        assert_eq!(m.turns.active_player(), Some(p2));
        assert!(!m.is_over());
    }

    #[test]
    fn damage_is_clamped_per_hit() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        let target = roster(&m, p2)[0];
        m.creatures.get_mut(&target).unwrap().hp = 250.0;

        kill(&mut m, p1, &[target], 10);
        assert_eq!(m.creatures[&target].hp, 50.0);

        let heal = vec![DamageHit { id: target, dmg: -80.0 }];
        m.handle_message(p1, ClientMsg::ApplyDamage { hits: heal, blast: None }, 20);
        assert_eq!(m.creatures[&target].hp, 50.0);
    }

    #[test]
    fn wiping_out_an_opponent_ends_match() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);

        let victims = roster(&m, p2);
        kill(&mut m, p1, &victims, 100);
        assert!(m.is_over());
        assert_eq!(m.winner(), Some(p1));
        assert!(m.take_events().contains(&GameEvent::MatchOver { winner: Some(p1) }));

        // Terminal: no more turns
        m.handle_message(p1, ClientMsg::EndTurn, 200);
        assert!(m.is_over());
        assert_eq!(m.turns.active_player(), None);
    }

    #[test]
    fn drowning_active_creature_advances_in_same_tick() {
        let mut m = new_match();
        let _p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        gather_at_centre(&mut m);

        let active = m.turns.active_creature().unwrap();
        let deep = m.terrain.waterline() + 500.0;
        m.physics.set_position(active, 0.0, deep);

        m.tick(50, 0.05);
        assert!(!m.creatures.contains_key(&active));
        assert_eq!(m.turns.active_player(), Some(p2));
        assert!(m.take_events().iter().any(|e| matches!(
            e,
            GameEvent::CreatureEliminated { creature_id, cause: EliminationCause::Drowned, .. }
                if *creature_id == active
        )));
    }

    #[test]
    fn turn_times_out() {
        let mut m = new_match();
        let _p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        gather_at_centre(&mut m);

        m.tick(TURN - 1, 0.05);
        assert_ne!(m.turns.active_player(), Some(p2));
        m.tick(TURN, 0.05);
        assert_eq!(m.turns.active_player(), Some(p2));
        assert_eq!(m.turns.remaining_ms(TURN), TURN);
    }

    #[test]
    fn only_one_crate_exists_and_each_turn_replaces_it() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        let first = m.supply_crate().unwrap().id;

        m.handle_message(p1, ClientMsg::EndTurn, 10);
        let second = m.supply_crate().unwrap().id;
        assert_ne!(first, second);
        assert!(!m.physics.contains(first));
        assert!(m.physics.contains(second));
        assert_eq!(m.physics.body_count(), m.creatures.len() + 1);

        m.handle_message(p2, ClientMsg::EndTurn, 20);
        assert_eq!(m.physics.body_count(), m.creatures.len() + 1);
    }

    #[test]
    fn pickup_claims_need_reach_and_replace_weapon() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        m.presence.get_mut(p2).unwrap().weapon = Some(WeaponKind::Dynamite);

        let supply = m.supply_crate().unwrap().clone();
        m.handle_message(p1, ClientMsg::PickupCrate { crate_id: supply.id, by_session_id: p2 }, 10);
        assert!(m.supply_crate().is_some());

        let creature = roster(&m, p2)[1];
        m.creatures.get_mut(&creature).unwrap().x = supply.x;
        m.creatures.get_mut(&creature).unwrap().y = supply.y + 20.0;

        m.handle_message(p1, ClientMsg::PickupCrate { crate_id: Uuid::new_v4(), by_session_id: p2 }, 10);
        assert!(m.supply_crate().is_some());

        m.handle_message(p1, ClientMsg::PickupCrate { crate_id: supply.id, by_session_id: p2 }, 10);
        assert!(m.supply_crate().is_none());
        assert!(!m.physics.contains(supply.id));
        assert_eq!(m.presence.get(p2).unwrap().weapon, Some(supply.weapon));
    }

    #[test]
    fn active_creature_picks_up_crate_by_touch() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        join(&mut m, 0);

        let supply = m.supply_crate().unwrap().clone();
        let active = m.turns.active_creature().unwrap();
        m.physics.set_position(active, supply.x, supply.y + 33.0);

        m.tick(50, 0.05);
        assert!(m.supply_crate().is_none());
        assert_eq!(m.presence.get(p1).unwrap().weapon, Some(supply.weapon));
    }

    #[test]
    fn leaver_keeps_creatures_and_is_skipped() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        let p3 = join(&mut m, 0);

        m.handle_message(p2, ClientMsg::Leave, 100);
        assert_eq!(roster(&m, p2).len(), 3);
        assert!(roster(&m, p2).iter().all(|id| m.physics.contains(*id)));

        m.handle_message(p1, ClientMsg::EndTurn, 200);
        assert_eq!(m.turns.active_player(), Some(p3));
        assert!(!m.is_over());
    }

    #[test]
    fn active_leaver_forces_advance_and_expires_after_grace() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        join(&mut m, 0);
        gather_at_centre(&mut m);
        let grace = GameConfig::default().disconnect_grace_ms;
        let p1_creatures = roster(&m, p1);

        m.handle_message(p1, ClientMsg::Leave, 1_000);
        assert_eq!(m.turns.active_player(), Some(p2));

        m.tick(1_000 + grace - 1, 0.05);
        assert!(m.presence.contains(p1));

        m.tick(1_000 + grace, 0.05);
        assert!(!m.presence.contains(p1));
        assert!(!m.presence.join_order().contains(&p1));
        assert!(p1_creatures.iter().all(|id| !m.physics.contains(*id)));
        assert!(p1_creatures.iter().all(|id| !m.creatures.contains_key(id)));
    }

    #[test]
    fn expiry_of_active_player_advances_turn() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        join(&mut m, 0);
        gather_at_centre(&mut m);

        // Disconnected while active but still scheduled
        m.presence.mark_disconnected(p1, 0);
        assert_eq!(m.turns.active_player(), Some(p1));
        m.tick(50, 0.05);
        assert_eq!(m.turns.active_player(), Some(p2));
    }

    #[test]
    fn two_player_endgame_leave_awards_opponent() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);

        m.handle_message(p2, ClientMsg::Leave, 100);
        assert!(m.is_over());
        assert_eq!(m.winner(), Some(p1));
        assert!(m.take_events().iter().any(|e| matches!(
            e,
            GameEvent::PlayerDisconnected { session_id, .. } if *session_id == p2
        )));
    }

    #[test]
    fn wiping_out_the_last_connected_rival_ends_match() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        let p3 = join(&mut m, 0);

        m.handle_message(p3, ClientMsg::Leave, 100);
        assert!(!m.is_over());

        let victims = roster(&m, p2);
        kill(&mut m, p1, &victims, 200);
        assert!(m.is_over());
        assert_eq!(m.winner(), Some(p1));
    }

    #[test]
    fn fresh_matches_keep_every_creature_dry_while_idle() {
        for seed in 0..10 {
            let mut m = MatchState::new(Uuid::new_v4(), seed, GameConfig::default()).unwrap();
            join(&mut m, 0);
            join(&mut m, 0);
            m.take_events();

            for i in 1..=60u64 {
                m.tick(i * 50, 0.05);
            }

            assert_eq!(m.creatures.len(), 6, "seed {}", seed);
            assert!(
                !m.take_events()
                    .iter()
                    .any(|e| matches!(e, GameEvent::CreatureEliminated { .. })),
                "seed {}",
                seed
            );
        }
    }

    #[test]
    fn sinking_crate_is_removed() {
        let mut m = new_match();
        join(&mut m, 0);
        join(&mut m, 0);
        gather_at_centre(&mut m);

        let supply = m.supply_crate().unwrap().clone();
        let deep = m.terrain.waterline() + 500.0;
        m.physics.set_position(supply.id, supply.x, deep);

        m.tick(50, 0.05);
        assert!(m.supply_crate().is_none());
        assert!(!m.physics.contains(supply.id));
        assert_eq!(m.physics.body_count(), m.creatures.len());
    }

    #[test]
    fn takeover_inherits_roster_and_rotation_slot() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        let p3 = join(&mut m, 0);
        let p2_creatures = roster(&m, p2);

        m.handle_message(p2, ClientMsg::Leave, 100);
        let p4 = join(&mut m, 200);
        let p4_own = roster(&m, p4);

        m.handle_message(p4, ClientMsg::Takeover { target_session_id: p2 }, 300);
        assert_eq!(m.presence.join_order(), &[p1, p4, p3]);
        assert_eq!(roster(&m, p4), p2_creatures);
        assert!(p2_creatures.iter().all(|id| m.creatures[id].owner == p4));
        assert!(p4_own.iter().all(|id| !m.physics.contains(*id)));
        assert!(!m.presence.contains(p2));

        m.handle_message(p1, ClientMsg::EndTurn, 400);
        assert_eq!(m.turns.active_player(), Some(p4));
    }

    #[test]
    fn takeover_of_connected_or_self_is_ignored() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);

        m.handle_message(p2, ClientMsg::Takeover { target_session_id: p1 }, 10);
        m.handle_message(p2, ClientMsg::Takeover { target_session_id: p2 }, 10);
        assert_eq!(m.presence.join_order(), &[p1, p2]);
        assert_eq!(roster(&m, p1).len(), 3);
    }

    #[test]
    fn view_reports_turn_and_players() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let p2 = join(&mut m, 0);
        let p3 = join(&mut m, 0);
        m.handle_message(p2, ClientMsg::Leave, 0);

        let view = m.view(1_000);
        assert_eq!(view.active_player, Some(p1));
        assert_eq!(view.turn_remaining_ms, TURN - 1_000);
        assert_eq!(view.creatures.len(), 9);
        assert!(view.supply_crate.is_some());
        assert_eq!(view.join_order, vec![p1, p2, p3]);
        assert!(view.players[1].disconnected_until.is_some());
    }

    #[test]
    fn ping_gets_pong_and_unknown_senders_change_nothing() {
        let mut m = new_match();
        let p1 = join(&mut m, 0);
        let stranger = Uuid::new_v4();

        let reply = m.handle_message(stranger, ClientMsg::Ping { t: 7 }, 0);
        assert!(matches!(reply, Some(ServerMsg::Pong { t: 7, .. })));

        m.handle_message(stranger, ClientMsg::Leave, 0);
        m.handle_message(stranger, ClientMsg::EndTurn, 0);
        assert_eq!(m.turns.active_player(), Some(p1));
    }

    #[test]
    fn registry_finds_only_accepting_matches_with_room() {
        let registry = MatchRegistry::new();
        let (_game, handle) = GameMatch::new(Uuid::new_v4(), 1, GameConfig::default()).unwrap();
        registry.insert(handle.clone());

        assert!(registry.find_available_match(2).is_some());
        handle.player_count.store(2, Ordering::Relaxed);
        assert!(registry.find_available_match(2).is_none());
        assert_eq!(registry.total_players(), 2);

        // Pending reservations take a slot too
        handle.player_count.store(1, Ordering::Relaxed);
        handle.reserve();
        assert_eq!(handle.occupancy(), 2);
        assert!(registry.find_available_match(2).is_none());
        handle.reserved.store(0, Ordering::Relaxed);

        handle.player_count.store(0, Ordering::Relaxed);
        handle.accepting.store(false, Ordering::Relaxed);
        assert!(registry.find_available_match(2).is_none());

        registry.remove(&handle.id);
        assert_eq!(registry.active_matches(), 0);
    }

    #[test]
    fn queued_join_releases_reservation_and_is_timed_on_receipt() {
        let (mut game, handle) = GameMatch::new(Uuid::new_v4(), 3, GameConfig::default()).unwrap();
        let session_id = Uuid::new_v4();
        let join = |received_at| PlayerInput {
            session_id,
            msg: ClientMsg::Join { name: None },
            received_at,
        };

        handle.reserve();
        handle.input_tx.try_send(join(1_000)).unwrap();
        game.process_inputs(5_000);

        assert_eq!(handle.reserved.load(Ordering::Relaxed), 0);
        assert_eq!(game.state.turns.active_player(), Some(session_id));
        assert_eq!(game.state.turns.remaining_ms(5_000), TURN - 4_000);

        // A repeated join from a known session holds no slot
        handle.reserve();
        handle.input_tx.try_send(join(6_000)).unwrap();
        game.process_inputs(6_000);
        assert_eq!(handle.reserved.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn running_match_answers_join_and_streams_snapshots() {
        let (game, handle) = GameMatch::new(Uuid::new_v4(), 9, GameConfig::default()).unwrap();
        let mut rx = handle.snapshot_tx.subscribe();
        let task = tokio::spawn(game.run());

        let session_id = Uuid::new_v4();
        handle
            .input_tx
            .send(PlayerInput {
                session_id,
                msg: ClientMsg::Join {
                    name: Some("Ada".into()),
                },
                received_at: unix_millis(),
            })
            .await
            .unwrap();

        let joined = tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(2), rx.recv()).await);
        match joined.unwrap() {
            ServerMsg::MatchJoined { session_id: id, players, .. } => {
                assert_eq!(id, session_id);
                assert_eq!(players[0].name, "Ada");
            }
            other => panic!("unexpected message {:?}", other),
        }

        let next = tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(2), rx.recv()).await);
        assert!(matches!(next.unwrap(), ServerMsg::Snapshot { .. }));

        task.abort();
    }
}
