//! Snapshot building and cadence

use crate::ws::protocol::{GameEvent, MatchView, ObjectKind, ObjectSnapshot, ServerMsg};

use super::pickup::SupplyCrate;
use super::CreatureState;

/// Decides when to broadcast and builds the outgoing messages.
///
/// Kinematic snapshots go out every `snapshot_interval` ticks. The replicated
/// state rides along on a snapshot tick whenever it changed, and at least
/// every `state_interval` ticks regardless.
pub struct SnapshotBuilder {
    ticks_since_snapshot: u32,
    snapshot_interval: u32,
    ticks_since_state: u32,
    state_interval: u32,
    state_dirty: bool,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32, state_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
            ticks_since_state: 0,
            state_interval: state_interval.max(1),
            state_dirty: true,
        }
    }

    /// Check if it's time to send a snapshot (call once per tick)
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        self.ticks_since_state += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used for important events)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
        self.state_dirty = true;
    }

    pub fn mark_dirty(&mut self) {
        self.state_dirty = true;
    }

    /// Whether the replicated state should accompany this snapshot
    pub fn take_state_due(&mut self) -> bool {
        if self.state_dirty || self.ticks_since_state >= self.state_interval {
            self.state_dirty = false;
            self.ticks_since_state = 0;
            true
        } else {
            false
        }
    }

    /// Build a kinematic snapshot of every simulated body
    pub fn build<'a>(
        &self,
        tick: u64,
        creatures: impl Iterator<Item = &'a CreatureState>,
        supply_crate: Option<&SupplyCrate>,
        events: Vec<GameEvent>,
    ) -> ServerMsg {
        let mut objects: Vec<ObjectSnapshot> = creatures
            .map(|c| ObjectSnapshot {
                id: c.id,
                x: c.x,
                y: c.y,
                vx: c.vx,
                vy: c.vy,
                kind: ObjectKind::Creature,
            })
            .collect();

        if let Some(c) = supply_crate {
            objects.push(ObjectSnapshot {
                id: c.id,
                x: c.x,
                y: c.y,
                vx: c.vx,
                vy: c.vy,
                kind: ObjectKind::Crate,
            });
        }

        ServerMsg::Snapshot {
            tick,
            objects,
            events,
        }
    }

    pub fn build_state(&self, view: MatchView) -> ServerMsg {
        ServerMsg::State(view)
    }
}
