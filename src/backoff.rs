//! Caller-side retry policy for trades refused with `InsufficientFunds`.
//!
//! A player asking for more than they can afford is pulled back toward the
//! current market price until the trade fits. The core never does this on
//! its own; it only guarantees that a refused quote changes nothing.

use crate::error::{GameError, Precondition};
use crate::transitions::quote_trade;
use crate::world::{PhaseKind, World};

/// Below this distance from the current price a move is not worth sending.
pub const MIN_PROBABILITY_STEP: f64 = 1e-5;

/// Weight kept on the previous candidate at each back-off step.
const BACKOFF_WEIGHT: f64 = 5.0;

/// Closest probability to `target` that `actor` can afford right now,
/// approached from the current market price.
///
/// Returns `Ok(None)` when no affordable move larger than
/// `MIN_PROBABILITY_STEP` exists. Precondition violations are returned as-is.
pub fn affordable_probability(
    world: &World,
    actor: &str,
    target: f64,
) -> Result<Option<f64>, GameError> {
    let current = match world.round() {
        Some(round) => round.probability(),
        None => {
            return Err(Precondition::WrongPhase {
                expected: PhaseKind::Round,
                actual: PhaseKind::Lobby,
            }
            .into())
        }
    };

    let mut candidate = target;
    while (candidate - current).abs() > MIN_PROBABILITY_STEP {
        match quote_trade(world, actor, candidate) {
            Ok(_) => return Ok(Some(candidate)),
            Err(GameError::InsufficientFunds { .. }) => {
                candidate = (BACKOFF_WEIGHT * candidate + current) / (BACKOFF_WEIGHT + 1.0);
            }
            Err(other) => return Err(other),
        }
    }

    Ok(None)
}
