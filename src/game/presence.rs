//! Player bookkeeping: join order, rosters, disconnect grace and takeover

use std::collections::HashMap;

use uuid::Uuid;

use crate::ws::protocol::{PlayerInfo, PlayerView, WeaponKind};

/// Creature colours handed out by join order
pub const COLOR_PALETTE: [u32; 8] = [
    0xe6194b, 0x3cb44b, 0xffe119, 0x4363d8, 0xf58231, 0x911eb4, 0x46f0f0, 0xf032e6,
];

/// One session taking part in a match
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub session_id: Uuid,
    pub name: String,
    pub color: u32,
    /// Living creatures, in creation order
    pub creatures: Vec<Uuid>,
    /// Single weapon slot
    pub weapon: Option<WeaponKind>,
    /// Set while the session is disconnected
    pub disconnected_until: Option<u64>,
}

impl PlayerRecord {
    pub fn is_connected(&self) -> bool {
        self.disconnected_until.is_none()
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            session_id: self.session_id,
            name: self.name.clone(),
            color: self.color,
        }
    }

    pub fn view(&self) -> PlayerView {
        PlayerView {
            session_id: self.session_id,
            name: self.name.clone(),
            color: self.color,
            weapon: self.weapon,
            disconnected_until: self.disconnected_until,
            creature_count: self.creatures.len(),
        }
    }
}

/// Result of a successful takeover
#[derive(Debug, Clone, PartialEq)]
pub struct Takeover {
    /// Claimant's own creatures, now orphaned
    pub discarded: Vec<Uuid>,
    /// Target's creatures, now owned by the claimant
    pub inherited: Vec<Uuid>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PresenceError {
    #[error("unknown session {0}")]
    UnknownSession(Uuid),

    #[error("session {0} cannot take over itself")]
    SelfTakeover(Uuid),

    #[error("session {0} is not connected")]
    ClaimantDisconnected(Uuid),

    #[error("session {0} is not within a disconnect grace window")]
    NotInGrace(Uuid),
}

/// All players of one match
#[derive(Debug)]
pub struct Presence {
    players: HashMap<Uuid, PlayerRecord>,
    join_order: Vec<Uuid>,
    joins: usize,
    grace_ms: u64,
}

impl Presence {
    pub fn new(grace_ms: u64) -> Self {
        Self {
            players: HashMap::new(),
            join_order: Vec::new(),
            joins: 0,
            grace_ms,
        }
    }

    /// Add a player at the end of the rotation. Returns None if the session
    /// is already present.
    pub fn join(&mut self, session_id: Uuid, name: Option<String>) -> Option<&mut PlayerRecord> {
        if self.players.contains_key(&session_id) {
            return None;
        }

        let color = COLOR_PALETTE[self.joins % COLOR_PALETTE.len()];
        self.joins += 1;
        let name = name
            .map(|n| n.trim().chars().take(24).collect::<String>())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Player {}", self.joins));

        self.join_order.push(session_id);
        Some(self.players.entry(session_id).or_insert(PlayerRecord {
            session_id,
            name,
            color,
            creatures: Vec::new(),
            weapon: None,
            disconnected_until: None,
        }))
    }

    pub fn get(&self, session_id: Uuid) -> Option<&PlayerRecord> {
        self.players.get(&session_id)
    }

    pub fn get_mut(&mut self, session_id: Uuid) -> Option<&mut PlayerRecord> {
        self.players.get_mut(&session_id)
    }

    pub fn contains(&self, session_id: Uuid) -> bool {
        self.players.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn join_order(&self) -> &[Uuid] {
        &self.join_order
    }

    /// Players in join order
    pub fn iter(&self) -> impl Iterator<Item = &PlayerRecord> + '_ {
        self.join_order.iter().filter_map(|id| self.players.get(id))
    }

    /// May take a turn: connected and still owns a creature
    pub fn is_eligible(&self, session_id: Uuid) -> bool {
        self.players
            .get(&session_id)
            .map(|p| p.is_connected() && !p.creatures.is_empty())
            .unwrap_or(false)
    }

    /// Players owning at least one living creature, connected or not
    pub fn living_owners(&self) -> Vec<Uuid> {
        self.iter()
            .filter(|p| !p.creatures.is_empty())
            .map(|p| p.session_id)
            .collect()
    }

    /// Start the grace window. Returns its end, or None when the session is
    /// unknown or already disconnected.
    pub fn mark_disconnected(&mut self, session_id: Uuid, now: u64) -> Option<u64> {
        let player = self.players.get_mut(&session_id)?;
        if !player.is_connected() {
            return None;
        }
        let until = now + self.grace_ms;
        player.disconnected_until = Some(until);
        Some(until)
    }

    /// Players whose grace window has run out
    pub fn expired(&self, now: u64) -> Vec<Uuid> {
        self.iter()
            .filter(|p| p.disconnected_until.is_some_and(|until| now >= until))
            .map(|p| p.session_id)
            .collect()
    }

    /// Drop a player and its rotation slot
    pub fn remove(&mut self, session_id: Uuid) -> Option<PlayerRecord> {
        let record = self.players.remove(&session_id)?;
        self.join_order.retain(|id| *id != session_id);
        Some(record)
    }

    /// Forget a dead creature. Returns true if the owner had it.
    pub fn remove_creature(&mut self, owner: Uuid, creature_id: Uuid) -> bool {
        let Some(player) = self.players.get_mut(&owner) else {
            return false;
        };
        let before = player.creatures.len();
        player.creatures.retain(|id| *id != creature_id);
        player.creatures.len() != before
    }

    /// Hand a disconnected player's roster and rotation slot to a connected
    /// claimant. The claimant's own roster is discarded and its old slot
    /// removed; the target's record is purged.
    pub fn takeover(&mut self, claimant: Uuid, target: Uuid, now: u64) -> Result<Takeover, PresenceError> {
        if claimant == target {
            return Err(PresenceError::SelfTakeover(claimant));
        }
        let claimant_record = self
            .players
            .get(&claimant)
            .ok_or(PresenceError::UnknownSession(claimant))?;
        if !claimant_record.is_connected() {
            return Err(PresenceError::ClaimantDisconnected(claimant));
        }
        let target_record = self
            .players
            .get(&target)
            .ok_or(PresenceError::UnknownSession(target))?;
        if !target_record.disconnected_until.is_some_and(|until| now < until) {
            return Err(PresenceError::NotInGrace(target));
        }

        let Some(target_record) = self.players.remove(&target) else {
            return Err(PresenceError::UnknownSession(target));
        };
        let Some(claimant_record) = self.players.get_mut(&claimant) else {
            return Err(PresenceError::UnknownSession(claimant));
        };

        let discarded = std::mem::replace(&mut claimant_record.creatures, target_record.creatures.clone());
        if claimant_record.weapon.is_none() {
            claimant_record.weapon = target_record.weapon;
        }

        self.join_order.retain(|id| *id != claimant);
        if let Some(slot) = self.join_order.iter_mut().find(|id| **id == target) {
            *slot = claimant;
        }

        Ok(Takeover {
            discarded,
            inherited: target_record.creatures,
        })
    }
}
