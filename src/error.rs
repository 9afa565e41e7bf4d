//! Error kinds for the core transitions.

use crate::world::{PhaseKind, PlayerName, World};
use thiserror::Error;

/// A transition was called with inputs it is not defined for. These are
/// programming errors on the caller's side and must not be retried blindly.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Precondition {
    #[error("expected {expected} phase, world is in {actual}")]
    WrongPhase {
        expected: PhaseKind,
        actual: PhaseKind,
    },

    #[error("unknown player '{0}'")]
    UnknownPlayer(PlayerName),

    #[error("target probability {0} is outside (0, 1)")]
    ProbabilityOutOfRange(f64),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GameError {
    #[error("precondition violated: {0}")]
    PreconditionViolation(#[from] Precondition),

    /// The trade would leave `player` with negative cash or a negative
    /// cash + IOU position. `dollars`/`ious` are the balances it would have
    /// produced.
    #[error("insufficient funds for {player}: trade would leave ${dollars:.2} and {ious:.2} IOUs")]
    InsufficientFunds {
        player: PlayerName,
        dollars: f64,
        ious: f64,
    },
}

impl GameError {
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, GameError::InsufficientFunds { .. })
    }

    pub fn is_precondition_violation(&self) -> bool {
        matches!(self, GameError::PreconditionViolation(_))
    }
}

/// A refused transition. `world` is the input, moved back to the caller
/// exactly as it was passed in.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Rejected {
    pub world: World,
    pub error: GameError,
}

impl Rejected {
    pub fn new(world: World, error: impl Into<GameError>) -> Self {
        Self {
            world,
            error: error.into(),
        }
    }

    pub fn into_parts(self) -> (World, GameError) {
        (self.world, self.error)
    }
}

/// Outcome of applying one transition to a `World`.
pub type Transition = std::result::Result<World, Rejected>;
