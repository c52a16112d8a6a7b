//! Turn rotation state machine
//!
//! Rotation is round-robin over join order, skipping players that are
//! disconnected or have no creatures left. Each player also rotates through
//! its own creatures, resuming after the one that was active last time.

use std::collections::HashMap;

use uuid::Uuid;

use super::presence::Presence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    NoActivePlayer,
    PlayerActive {
        player_id: Uuid,
        creature_id: Uuid,
        /// Unix millis
        deadline: u64,
    },
    MatchOver {
        winner: Option<Uuid>,
    },
}

/// Outcome of a scheduler transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnChange {
    Started {
        player_id: Uuid,
        creature_id: Uuid,
        deadline: u64,
    },
    /// Nobody can play right now
    Idle,
    MatchOver {
        winner: Option<Uuid>,
    },
}

#[derive(Debug)]
pub struct TurnScheduler {
    phase: TurnPhase,
    turn_duration_ms: u64,
    retreat_window_ms: u64,
    /// Join-order slot of the most recently activated player
    cursor: usize,
    /// Per player: last active creature and its roster index at the time
    last_creature: HashMap<Uuid, (Uuid, usize)>,
    /// Set once two owners had living creatures at the same time
    contested: bool,
}

impl TurnScheduler {
    pub fn new(turn_duration_ms: u64, retreat_window_ms: u64) -> Self {
        Self {
            phase: TurnPhase::NoActivePlayer,
            turn_duration_ms,
            retreat_window_ms,
            cursor: 0,
            last_creature: HashMap::new(),
            contested: false,
        }
    }

    pub fn is_over(&self) -> bool {
        matches!(self.phase, TurnPhase::MatchOver { .. })
    }

    pub fn is_contested(&self) -> bool {
        self.contested
    }

    pub fn active_player(&self) -> Option<Uuid> {
        match self.phase {
            TurnPhase::PlayerActive { player_id, .. } => Some(player_id),
            _ => None,
        }
    }

    pub fn active_creature(&self) -> Option<Uuid> {
        match self.phase {
            TurnPhase::PlayerActive { creature_id, .. } => Some(creature_id),
            _ => None,
        }
    }

    pub fn winner(&self) -> Option<Uuid> {
        match self.phase {
            TurnPhase::MatchOver { winner } => winner,
            _ => None,
        }
    }

    /// Whether a session may perform turn-scoped actions
    pub fn is_active_session(&self, session_id: Uuid) -> bool {
        self.active_player() == Some(session_id)
    }

    pub fn remaining_ms(&self, now: u64) -> u64 {
        match self.phase {
            TurnPhase::PlayerActive { deadline, .. } => deadline.saturating_sub(now),
            _ => 0,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.phase, TurnPhase::PlayerActive { deadline, .. } if now >= deadline)
    }

    /// Arm the win condition once two owners are on the island together
    pub fn note_owners(&mut self, presence: &Presence) {
        if !self.contested && presence.living_owners().len() >= 2 {
            self.contested = true;
        }
    }

    /// End the match if at most one owner with living creatures remains, or
    /// if two remain and one of them is away. A two-owner endgame gets no
    /// grace window.
    pub fn check_winner(&mut self, presence: &Presence) -> Option<TurnChange> {
        if self.is_over() || !self.contested {
            return None;
        }

        let owners = presence.living_owners();
        if owners.len() <= 1 {
            return Some(self.end_match(owners.first().copied()));
        }
        if owners.len() == 2 {
            let connected: Vec<Uuid> = owners
                .iter()
                .copied()
                .filter(|id| presence.get(*id).is_some_and(|p| p.is_connected()))
                .collect();
            if let [winner] = connected.as_slice() {
                return Some(self.end_match(Some(*winner)));
            }
        }
        None
    }

    /// Terminal transition
    pub fn end_match(&mut self, winner: Option<Uuid>) -> TurnChange {
        if let TurnPhase::MatchOver { winner } = self.phase {
            return TurnChange::MatchOver { winner };
        }
        self.phase = TurnPhase::MatchOver { winner };
        TurnChange::MatchOver { winner }
    }

    /// Activate someone if nobody is active
    pub fn start_if_idle(&mut self, presence: &Presence, now: u64) -> Option<TurnChange> {
        if self.phase != TurnPhase::NoActivePlayer {
            return None;
        }
        match self.advance(presence, now) {
            TurnChange::Idle => None,
            change => Some(change),
        }
    }

    /// Hand the turn to the next eligible player, or end the match
    pub fn advance(&mut self, presence: &Presence, now: u64) -> TurnChange {
        if let TurnPhase::MatchOver { winner } = self.phase {
            return TurnChange::MatchOver { winner };
        }

        self.note_owners(presence);
        if let Some(over) = self.check_winner(presence) {
            return over;
        }

        let order = presence.join_order();
        let n = order.len();
        let start = match self.active_player() {
            Some(current) => order
                .iter()
                .position(|id| *id == current)
                .map(|idx| idx + 1)
                .unwrap_or(self.cursor),
            // The removed player's successor has slid into its slot
            None => self.cursor,
        };

        for offset in 0..n {
            let idx = (start + offset) % n;
            let player_id = order[idx];
            if presence.is_eligible(player_id) {
                return self.activate(player_id, idx, presence, now);
            }
        }

        if self.contested {
            self.end_match(None)
        } else {
            self.phase = TurnPhase::NoActivePlayer;
            TurnChange::Idle
        }
    }

    fn activate(&mut self, player_id: Uuid, slot: usize, presence: &Presence, now: u64) -> TurnChange {
        let Some(creatures) = presence.get(player_id).map(|p| p.creatures.as_slice()) else {
            self.phase = TurnPhase::NoActivePlayer;
            return TurnChange::Idle;
        };
        if creatures.is_empty() {
            self.phase = TurnPhase::NoActivePlayer;
            return TurnChange::Idle;
        }

        let idx = match self.last_creature.get(&player_id) {
            None => 0,
            Some((last, last_idx)) => match creatures.iter().position(|c| c == last) {
                Some(i) => (i + 1) % creatures.len(),
                // The last creature died: whoever followed it now sits at its index
                None => last_idx % creatures.len(),
            },
        };
        let creature_id = creatures[idx];
        self.last_creature.insert(player_id, (creature_id, idx));
        self.cursor = slot;

        let deadline = now + self.turn_duration_ms;
        self.phase = TurnPhase::PlayerActive {
            player_id,
            creature_id,
            deadline,
        };
        TurnChange::Started {
            player_id,
            creature_id,
            deadline,
        }
    }

    /// After a weapon is used only the retreat window remains, measured from now
    pub fn start_retreat(&mut self, now: u64) -> bool {
        if let TurnPhase::PlayerActive { deadline, .. } = &mut self.phase {
            *deadline = now + self.retreat_window_ms;
            true
        } else {
            false
        }
    }

    /// Move scheduling bookkeeping from a taken-over session to its claimant
    pub fn transfer(&mut self, from: Uuid, to: Uuid, presence: &Presence) {
        if let Some(entry) = self.last_creature.remove(&from) {
            self.last_creature.insert(to, entry);
        }
        if let TurnPhase::PlayerActive { player_id, .. } = &mut self.phase {
            if *player_id == from {
                *player_id = to;
            }
        }
        if let Some(current) = self.active_player() {
            if let Some(idx) = presence.join_order().iter().position(|id| *id == current) {
                self.cursor = idx;
            }
        }
    }

    /// Drop bookkeeping for a removed player
    pub fn forget(&mut self, player_id: Uuid) {
        self.last_creature.remove(&player_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TURN: u64 = 30_000;
    const RETREAT: u64 = 5_000;

    struct Table {
        presence: Presence,
        players: Vec<Uuid>,
        creatures: HashMap<Uuid, Vec<Uuid>>,
    }

    fn table(players: usize, creatures_each: usize) -> Table {
        let mut presence = Presence::new(300_000);
        let mut ids = Vec::new();
        let mut creatures = HashMap::new();
        for _ in 0..players {
            let id = Uuid::new_v4();
            let roster: Vec<Uuid> = (0..creatures_each).map(|_| Uuid::new_v4()).collect();
            presence.join(id, None).unwrap().creatures = roster.clone();
            creatures.insert(id, roster);
            ids.push(id);
        }
        Table {
            presence,
            players: ids,
            creatures,
        }
    }

    fn started_player(change: TurnChange) -> Uuid {
        match change {
            TurnChange::Started { player_id, .. } => player_id,
            other => panic!("expected a started turn, got {:?}", other),
        }
    }

    #[test]
    fn first_join_activates_with_full_turn() {
        let t = table(1, 3);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        let change = turns.start_if_idle(&t.presence, 1_000).unwrap();

        assert_eq!(
            change,
            TurnChange::Started {
                player_id: t.players[0],
                creature_id: t.creatures[&t.players[0]][0],
                deadline: 1_000 + TURN,
            }
        );
        assert!(turns.start_if_idle(&t.presence, 2_000).is_none());
        assert!(!turns.is_contested());
    }

    #[test]
    fn lone_player_keeps_the_turn() {
        let t = table(1, 2);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);
        assert_eq!(started_player(turns.advance(&t.presence, 10)), t.players[0]);
        assert!(!turns.is_over());
    }

    #[test]
    fn rotation_closes_after_n_advances() {
        let t = table(4, 1);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);
        let first = turns.active_player().unwrap();

        let mut seen = vec![first];
        for step in 1..=4 {
            seen.push(started_player(turns.advance(&t.presence, step)));
        }
        assert_eq!(seen[..4], t.players[..]);
        assert_eq!(seen[4], first);
    }

    #[test]
    fn creatures_rotate_within_a_player() {
        let t = table(2, 3);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);

        let p1 = t.players[0];
        let mut picked = vec![turns.active_creature().unwrap()];
        for step in 0..6 {
            turns.advance(&t.presence, step);
            if turns.active_player() == Some(p1) {
                picked.push(turns.active_creature().unwrap());
            }
        }

        let roster = &t.creatures[&p1];
        assert_eq!(picked, vec![roster[0], roster[1], roster[2], roster[0]]);
    }

    #[test]
    fn dead_creature_is_skipped_without_repeating() {
        let mut t = table(2, 3);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);
        let p1 = t.players[0];
        let roster = t.creatures[&p1].clone();

        // P1 plays A, then B dies while P2 is up
        turns.advance(&t.presence, 1);
        turns.advance(&t.presence, 2);
        assert_eq!(turns.active_creature(), Some(roster[1]));
        turns.advance(&t.presence, 3);
        t.presence.remove_creature(p1, roster[1]);

        turns.advance(&t.presence, 4);
        assert_eq!(turns.active_creature(), Some(roster[2]));
    }

    #[test]
    fn disconnected_and_empty_players_are_skipped() {
        let mut t = table(4, 1);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);

        t.presence.mark_disconnected(t.players[1], 0);
        assert_eq!(started_player(turns.advance(&t.presence, 1)), t.players[2]);

        let creature = t.creatures[&t.players[0]][0];
        t.presence.remove_creature(t.players[0], creature);
        assert_eq!(started_player(turns.advance(&t.presence, 2)), t.players[3]);
        assert_eq!(started_player(turns.advance(&t.presence, 3)), t.players[2]);
    }

    #[test]
    fn removed_active_player_hands_turn_to_successor() {
        let mut t = table(3, 1);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);
        turns.advance(&t.presence, 1);
        assert_eq!(turns.active_player(), Some(t.players[1]));

        t.presence.remove(t.players[1]);
        turns.forget(t.players[1]);
        assert_eq!(started_player(turns.advance(&t.presence, 2)), t.players[2]);
    }

    #[test]
    fn last_owner_standing_wins() {
        let mut t = table(2, 1);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);
        assert!(turns.is_contested());

        let loser = t.players[1];
        t.presence.remove_creature(loser, t.creatures[&loser][0]);
        assert_eq!(
            turns.check_winner(&t.presence),
            Some(TurnChange::MatchOver {
                winner: Some(t.players[0])
            })
        );
        assert_eq!(turns.winner(), Some(t.players[0]));
        assert!(turns.start_if_idle(&t.presence, 10).is_none());
        assert_eq!(
            turns.advance(&t.presence, 10),
            TurnChange::MatchOver {
                winner: Some(t.players[0])
            }
        );
    }

    #[test]
    fn two_owner_endgame_goes_to_the_connected_owner() {
        let mut t = table(3, 1);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);

        // Left while three owners were still alive
        t.presence.mark_disconnected(t.players[2], 0);
        assert!(turns.check_winner(&t.presence).is_none());

        let loser = t.players[1];
        t.presence.remove_creature(loser, t.creatures[&loser][0]);
        assert_eq!(
            turns.check_winner(&t.presence),
            Some(TurnChange::MatchOver {
                winner: Some(t.players[0])
            })
        );
    }

    #[test]
    fn mutual_elimination_is_a_draw() {
        let mut t = table(2, 1);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);
        for p in &t.players {
            t.presence.remove_creature(*p, t.creatures[p][0]);
        }
        assert_eq!(
            turns.advance(&t.presence, 5),
            TurnChange::MatchOver { winner: None }
        );
    }

    #[test]
    fn nobody_eligible_ends_contested_match() {
        let mut t = table(3, 1);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);
        for p in &t.players {
            t.presence.mark_disconnected(*p, 0);
        }
        assert_eq!(
            turns.advance(&t.presence, 1),
            TurnChange::MatchOver { winner: None }
        );
    }

    #[test]
    fn retreat_overrides_remaining_time() {
        let t = table(2, 1);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);

        assert_eq!(turns.remaining_ms(10_000), 20_000);
        assert!(turns.start_retreat(10_000));
        assert_eq!(turns.remaining_ms(10_000), RETREAT);
        assert!(!turns.is_expired(14_999));
        assert!(turns.is_expired(15_000));
    }

    #[test]
    fn transfer_moves_active_turn_to_claimant() {
        let mut t = table(3, 1);
        let mut turns = TurnScheduler::new(TURN, RETREAT);
        turns.start_if_idle(&t.presence, 0);
        let (target, claimant) = (t.players[0], t.players[2]);

        t.presence.mark_disconnected(target, 0);
        t.presence.takeover(claimant, target, 1).unwrap();
        turns.transfer(target, claimant, &t.presence);

        assert_eq!(turns.active_player(), Some(claimant));
        assert_eq!(started_player(turns.advance(&t.presence, 2)), t.players[1]);
        assert_eq!(started_player(turns.advance(&t.presence, 3)), claimant);
    }
}
