//! Whole-game state: per-player balances plus exactly one active phase.
//!
//! Values of these types are snapshots. Transitions build a new `World` from
//! an old one; nothing here is mutated after it is published.

use crate::lmsr_core::{self, MarketMaker};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ts_rs::TS;

pub type PlayerName = String;

/// Unix time in seconds.
pub type Unixtime = i64;

/// Per-player amounts (dollars, IOUs or winnings).
pub type Ledger = BTreeMap<PlayerName, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct World {
    pub balances: Ledger,
    pub phase: Phase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "camelCase")]
#[ts(export)]
pub enum Phase {
    Lobby(Lobby),
    Round(Round),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Lobby {
    /// Net profit or loss per player for the round that just ended.
    /// `None` only before the first round.
    pub last_round_winnings: Option<Ledger>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Round {
    pub question: String,
    #[ts(type = "number")]
    pub starts_at_unixtime: Unixtime,
    #[ts(type = "number")]
    pub ends_at_unixtime: Unixtime,
    /// Balances as they stood when the round was created.
    pub player_starting_balances: Ledger,
    pub ious_held: Ledger,
    pub lmsr: MarketMaker,
}

/// Discriminant of `Phase`, used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Lobby,
    Round,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseKind::Lobby => f.write_str("lobby"),
            PhaseKind::Round => f.write_str("round"),
        }
    }
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Lobby(_) => PhaseKind::Lobby,
            Phase::Round(_) => PhaseKind::Round,
        }
    }
}

impl Round {
    /// Current implied probability of the round's question.
    pub fn probability(&self) -> f64 {
        lmsr_core::probability_of(&self.lmsr)
    }
}

impl World {
    /// Process-start world: every player holds `starting_balance`, no round
    /// has been played yet.
    pub fn new<I, S>(players: I, starting_balance: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PlayerName>,
    {
        Self {
            balances: players
                .into_iter()
                .map(|p| (p.into(), starting_balance))
                .collect(),
            phase: Phase::Lobby(Lobby::default()),
        }
    }

    pub fn round(&self) -> Option<&Round> {
        match &self.phase {
            Phase::Round(round) => Some(round),
            Phase::Lobby(_) => None,
        }
    }

    pub fn lobby(&self) -> Option<&Lobby> {
        match &self.phase {
            Phase::Lobby(lobby) => Some(lobby),
            Phase::Round(_) => None,
        }
    }

    pub fn balance(&self, player: &str) -> Option<f64> {
        self.balances.get(player).copied()
    }

    /// IOUs held by `player` in the current round; zero in the lobby.
    pub fn ious(&self, player: &str) -> f64 {
        self.round()
            .and_then(|round| round.ious_held.get(player).copied())
            .unwrap_or(0.0)
    }

    /// Cash plus contingent claims summed over all players.
    pub fn total_wealth(&self) -> f64 {
        let ious: f64 = self
            .round()
            .map(|round| round.ious_held.values().sum())
            .unwrap_or(0.0);
        self.balances.values().sum::<f64>() + ious
    }
}

/// An empty world in the lobby. Used as the placeholder while a session
/// hands its current world to a transition.
impl Default for World {
    fn default() -> Self {
        Self {
            balances: Ledger::new(),
            phase: Phase::Lobby(Lobby::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_world_starts_in_first_lobby() {
        let world = World::new(["Alice", "Bob"], 10.0);
        assert_eq!(world.balance("Alice"), Some(10.0));
        assert_eq!(world.balance("Bob"), Some(10.0));
        assert_eq!(world.phase.kind(), PhaseKind::Lobby);
        assert_eq!(world.lobby().unwrap().last_round_winnings, None);
        assert_eq!(world.ious("Alice"), 0.0);
        assert_eq!(world.total_wealth(), 20.0);
    }

    #[test]
    fn phase_serializes_with_kind_tag() {
        let world = World::new(["Alice"], 10.0);
        let json = serde_json::to_value(&world).unwrap();
        assert_eq!(json["phase"]["kind"], "lobby");
        assert_eq!(json["phase"]["lastRoundWinnings"], serde_json::Value::Null);
        assert_eq!(json["balances"]["Alice"], 10.0);

        let back: World = serde_json::from_value(json).unwrap();
        assert_eq!(back, world);
    }
}
