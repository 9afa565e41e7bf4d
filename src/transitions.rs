//! Phase transitions over `World`: Lobby -> Round -> Lobby -> ...
//!
//! Every transition consumes the previous world and returns the next one.
//! A refused transition returns the input untouched inside `Rejected`.

use crate::config::MarketConfig;
use crate::error::{GameError, Precondition, Rejected, Transition};
use crate::lmsr_core::{self, MarketMaker, Wealth};
use crate::world::{Ledger, Lobby, Phase, PhaseKind, Round, Unixtime, World};

/// Result of pricing a `set_probability` call for one player, before it is
/// applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeQuote {
    pub lmsr: MarketMaker,
    pub cost: Wealth,
    /// Actor's cash after the trade.
    pub dollars: f64,
    /// Actor's IOU holding after the trade.
    pub ious: f64,
}

/// Open a round from the lobby. Every player in `balances` gets a zero IOU
/// position and their current balance is frozen as the round's baseline.
pub fn start_round(world: World, market: &MarketConfig, now: Unixtime) -> Transition {
    let World { balances, phase } = world;
    if let Phase::Round(_) = phase {
        return Err(Rejected::new(
            World { balances, phase },
            wrong_phase(PhaseKind::Lobby, PhaseKind::Round),
        ));
    }

    let round = Round {
        question: market.question.clone(),
        starts_at_unixtime: now,
        ends_at_unixtime: round_end(now, market.round_duration_secs),
        player_starting_balances: balances.clone(),
        ious_held: balances.keys().map(|p| (p.clone(), 0.0)).collect(),
        lmsr: MarketMaker::new(market.inertia),
    };

    Ok(World {
        balances,
        phase: Phase::Round(round),
    })
}

/// `now + duration_secs`, saturating at the end of representable time.
fn round_end(now: Unixtime, duration_secs: u64) -> Unixtime {
    Unixtime::try_from(duration_secs)
        .ok()
        .and_then(|duration| now.checked_add(duration))
        .unwrap_or(Unixtime::MAX)
}

/// Move the round's market to `target_probability` on behalf of `actor`.
///
/// The trade's cash and IOU effect lands on the actor only. It is refused
/// with `InsufficientFunds` if it would leave the actor with negative cash or
/// a negative cash + IOU position.
pub fn set_probability(world: World, actor: &str, target_probability: f64) -> Transition {
    let World {
        mut balances,
        phase,
    } = world;
    let mut round = match phase {
        Phase::Round(round) => round,
        lobby @ Phase::Lobby(_) => {
            return Err(Rejected::new(
                World {
                    balances,
                    phase: lobby,
                },
                wrong_phase(PhaseKind::Round, PhaseKind::Lobby),
            ))
        }
    };

    let quote = match price_trade(&balances, &round, actor, target_probability) {
        Ok(quote) => quote,
        Err(error) => {
            return Err(Rejected::new(
                World {
                    balances,
                    phase: Phase::Round(round),
                },
                error,
            ))
        }
    };

    balances.insert(actor.to_owned(), quote.dollars);
    round.ious_held.insert(actor.to_owned(), quote.ious);
    round.lmsr = quote.lmsr;

    Ok(World {
        balances,
        phase: Phase::Round(round),
    })
}

/// Close the round. With `outcome_is_true` every IOU pays one dollar;
/// otherwise claims expire worthless. The lobby records each player's net
/// result against the round's starting snapshot.
pub fn end_round(world: World, outcome_is_true: bool) -> Transition {
    let World { balances, phase } = world;
    let round = match phase {
        Phase::Round(round) => round,
        lobby @ Phase::Lobby(_) => {
            return Err(Rejected::new(
                World {
                    balances,
                    phase: lobby,
                },
                wrong_phase(PhaseKind::Round, PhaseKind::Lobby),
            ))
        }
    };

    let balances: Ledger = if outcome_is_true {
        balances
            .into_iter()
            .map(|(player, dollars)| {
                let ious = round.ious_held.get(&player).copied().unwrap_or(0.0);
                (player, dollars + ious)
            })
            .collect()
    } else {
        balances
    };

    let winnings: Ledger = balances
        .iter()
        .map(|(player, &dollars)| {
            let start = round
                .player_starting_balances
                .get(player)
                .copied()
                .unwrap_or(0.0);
            (player.clone(), dollars - start)
        })
        .collect();

    Ok(World {
        balances,
        phase: Phase::Lobby(Lobby {
            last_round_winnings: Some(winnings),
        }),
    })
}

/// Price a `set_probability` call without applying it.
pub fn quote_trade(
    world: &World,
    actor: &str,
    target_probability: f64,
) -> Result<TradeQuote, GameError> {
    match &world.phase {
        Phase::Round(round) => price_trade(&world.balances, round, actor, target_probability),
        Phase::Lobby(_) => Err(wrong_phase(PhaseKind::Round, PhaseKind::Lobby)),
    }
}

fn price_trade(
    balances: &Ledger,
    round: &Round,
    actor: &str,
    target_probability: f64,
) -> Result<TradeQuote, GameError> {
    // Written so that NaN fails too.
    if !(target_probability > 0.0 && target_probability < 1.0) {
        return Err(Precondition::ProbabilityOutOfRange(target_probability).into());
    }
    let dollars_before = balances
        .get(actor)
        .copied()
        .ok_or_else(|| Precondition::UnknownPlayer(actor.to_owned()))?;
    let ious_before = round.ious_held.get(actor).copied().unwrap_or(0.0);

    let (lmsr, cost) = lmsr_core::price_to(&round.lmsr, target_probability);
    let dollars = dollars_before + cost.dollars;
    let ious = ious_before + cost.ious;

    // Negated comparisons so a NaN result is refused as well.
    if !(dollars >= 0.0) || !(dollars + ious >= 0.0) {
        return Err(GameError::InsufficientFunds {
            player: actor.to_owned(),
            dollars,
            ious,
        });
    }

    Ok(TradeQuote {
        lmsr,
        cost,
        dollars,
        ious,
    })
}

fn wrong_phase(expected: PhaseKind, actual: PhaseKind) -> GameError {
    Precondition::WrongPhase { expected, actual }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NOW: Unixtime = 1_700_000_000;

    fn market() -> MarketConfig {
        MarketConfig {
            inertia: 100.0,
            ..MarketConfig::default()
        }
    }

    fn lobby(balances: &[(&str, f64)]) -> World {
        World {
            balances: balances.iter().map(|(p, b)| (p.to_string(), *b)).collect(),
            phase: Phase::Lobby(Lobby::default()),
        }
    }

    fn round_world(balances: &[(&str, f64)]) -> World {
        start_round(lobby(balances), &market(), NOW).unwrap()
    }

    fn expect_rejection(result: Transition) -> (World, GameError) {
        match result {
            Ok(world) => panic!("transition unexpectedly accepted: {world:?}"),
            Err(rejected) => rejected.into_parts(),
        }
    }

    #[test]
    fn start_round_snapshots_balances_and_zeroes_market() {
        let world = round_world(&[("Alice", 100.0), ("Bob", 100.0)]);
        let round = world.round().unwrap();

        assert_eq!(round.question, MarketConfig::default().question);
        assert_eq!(round.starts_at_unixtime, NOW);
        assert_eq!(round.ends_at_unixtime, NOW + 10);
        assert_eq!(round.lmsr.shares_issued, 0.0);
        assert_eq!(round.lmsr.inertia, 100.0);
        assert_eq!(round.probability(), 0.5);
        assert_eq!(round.ious_held, Ledger::from([("Alice".into(), 0.0), ("Bob".into(), 0.0)]));
        assert_eq!(round.player_starting_balances, world.balances);
    }

    #[test]
    fn unvalidated_durations_never_end_before_the_start() {
        for duration_secs in [i64::MAX as u64, u64::MAX] {
            let unchecked = MarketConfig {
                round_duration_secs: duration_secs,
                ..market()
            };
            let world = start_round(lobby(&[("Alice", 10.0)]), &unchecked, NOW).unwrap();
            let round = world.round().unwrap();
            assert_eq!(round.starts_at_unixtime, NOW);
            assert_eq!(round.ends_at_unixtime, Unixtime::MAX, "{duration_secs}");
        }
    }

    #[test]
    fn start_round_refuses_a_running_round() {
        let world = round_world(&[("Alice", 100.0)]);
        let (back, error) = expect_rejection(start_round(world.clone(), &market(), NOW + 5));
        assert_eq!(back, world);
        assert_eq!(
            error,
            GameError::PreconditionViolation(Precondition::WrongPhase {
                expected: PhaseKind::Lobby,
                actual: PhaseKind::Round,
            })
        );
    }

    #[test]
    fn trade_applies_cost_to_actor_only() {
        let world = round_world(&[("Alice", 100.0), ("Bob", 100.0)]);
        let world = set_probability(world, "Alice", 0.7).unwrap();
        let round = world.round().unwrap();

        let shares = (0.7f64 / 0.3).ln();
        let dollars = 100.0 + 100.0 * ((1.0 + shares.exp()).ln() - 2f64.ln());
        let ious = 100.0 * (0.0 - shares);

        assert!((round.lmsr.shares_issued - shares).abs() < 1e-12);
        assert!((round.probability() - 0.7).abs() < 1e-12);
        assert!((world.balances["Alice"] - dollars).abs() < 1e-9);
        assert!((round.ious_held["Alice"] - ious).abs() < 1e-9);
        assert_eq!(world.balances["Bob"], 100.0);
        assert_eq!(round.ious_held["Bob"], 0.0);
        assert_eq!(round.player_starting_balances["Alice"], 100.0);
    }

    #[test]
    fn over_extended_trade_is_refused_without_change() {
        let world = round_world(&[("Alice", 1.0), ("Bob", 100.0)]);
        let (back, error) = expect_rejection(set_probability(world.clone(), "Alice", 0.999));
        assert!(error.is_insufficient_funds(), "{error}");
        assert_eq!(back, world);
        assert_eq!(back.balances["Alice"], 1.0);
        assert_eq!(back.ious("Alice"), 0.0);
    }

    #[test]
    fn set_probability_preconditions() {
        let world = round_world(&[("Alice", 100.0)]);

        let (back, error) = expect_rejection(set_probability(world.clone(), "Mallory", 0.6));
        assert_eq!(back, world);
        assert_eq!(
            error,
            GameError::from(Precondition::UnknownPlayer("Mallory".into()))
        );

        for p in [0.0, 1.0, -0.1, 1.5, f64::NAN] {
            let (back, error) = expect_rejection(set_probability(world.clone(), "Alice", p));
            assert_eq!(back, world);
            assert!(error.is_precondition_violation(), "p={p}: {error}");
        }

        let (back, error) = expect_rejection(set_probability(lobby(&[("Alice", 1.0)]), "Alice", 0.6));
        assert_eq!(back, lobby(&[("Alice", 1.0)]));
        assert!(error.is_precondition_violation());
    }

    #[test]
    fn true_outcome_pays_ious_and_records_winnings() {
        let world = round_world(&[("Alice", 100.0), ("Bob", 100.0)]);
        let world = set_probability(world, "Alice", 0.7).unwrap();
        let world = set_probability(world, "Bob", 0.4).unwrap();
        let before = world.clone();

        let after = end_round(world, true).unwrap();
        let winnings = after.lobby().unwrap().last_round_winnings.clone().unwrap();

        for player in ["Alice", "Bob"] {
            let expected = before.balances[player] + before.ious(player);
            assert!((after.balances[player] - expected).abs() < 1e-12);
            assert!((winnings[player] - (after.balances[player] - 100.0)).abs() < 1e-12);
        }
        assert!((after.total_wealth() - before.total_wealth()).abs() < 1e-9);
    }

    #[test]
    fn false_outcome_keeps_cash_and_records_winnings() {
        let world = round_world(&[("Alice", 100.0), ("Bob", 50.0)]);
        let world = set_probability(world, "Bob", 0.2).unwrap();
        let before = world.clone();

        let after = end_round(world, false).unwrap();
        let winnings = after.lobby().unwrap().last_round_winnings.clone().unwrap();

        assert_eq!(after.balances, before.balances);
        assert_eq!(winnings["Alice"], 0.0);
        assert_eq!(winnings["Bob"], before.balances["Bob"] - 50.0);
    }

    #[test]
    fn end_round_refuses_the_lobby() {
        let world = lobby(&[("Alice", 100.0)]);
        let (back, error) = expect_rejection(end_round(world.clone(), true));
        assert_eq!(back, world);
        assert!(error.is_precondition_violation());
    }

    #[test]
    fn quote_matches_applied_trade() {
        let world = round_world(&[("Alice", 100.0)]);
        let quote = quote_trade(&world, "Alice", 0.35).unwrap();
        let next = set_probability(world, "Alice", 0.35).unwrap();
        assert_eq!(next.balances["Alice"], quote.dollars);
        assert_eq!(next.ious("Alice"), quote.ious);
        assert_eq!(next.round().unwrap().lmsr, quote.lmsr);
    }

    proptest! {
        #[test]
        fn trades_never_break_solvency(
            balance in 0.0f64..500.0,
            targets in prop::collection::vec(0.0001f64..0.9999, 1..20),
        ) {
            let mut world = round_world(&[("Alice", balance), ("Bob", 100.0)]);
            for target in targets {
                world = match set_probability(world, "Alice", target) {
                    Ok(next) => next,
                    Err(rejected) => {
                        prop_assert!(rejected.error.is_insufficient_funds());
                        rejected.world
                    }
                };
                let dollars = world.balances["Alice"];
                prop_assert!(dollars >= 0.0);
                prop_assert!(dollars + world.ious("Alice") >= 0.0);
                prop_assert_eq!(world.balances["Bob"], 100.0);
            }
        }
    }
}
