//! src/lmsr_core.rs
//! Single-contract LMSR market maker: price is the logistic function of net
//! shares issued, and the cost of a move is the integral of that curve.
//!
//! All transcendental math goes through the stable helpers below so that
//! targets close to 0 or 1 stay finite.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use ts_rs::TS;

/// Market maker state for one round.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MarketMaker {
    /// Liquidity parameter; constant for the lifetime of a round.
    pub inertia: f64,
    /// Signed net share count.
    pub shares_issued: f64,
}

impl fmt::Debug for MarketMaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketMaker")
            .field("inertia", &self.inertia)
            .field("shares_issued", &self.shares_issued)
            .field("p", &probability_of(self))
            .finish()
    }
}

impl MarketMaker {
    /// Fresh market at p = 0.5.
    pub fn new(inertia: f64) -> Self {
        assert!(
            inertia.is_finite() && inertia > 0.0,
            "inertia must be positive and finite"
        );
        Self {
            inertia,
            shares_issued: 0.0,
        }
    }

    /// Convenience accessor.
    pub fn probability(&self) -> f64 {
        probability_of(self)
    }

    pub fn price_to(&self, target_probability: f64) -> (MarketMaker, Wealth) {
        price_to(self, target_probability)
    }
}

/// A trade's effect on one player's cash and IOU balances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Wealth {
    pub dollars: f64,
    pub ious: f64,
}

impl Add for Wealth {
    type Output = Wealth;

    fn add(self, rhs: Wealth) -> Wealth {
        Wealth {
            dollars: self.dollars + rhs.dollars,
            ious: self.ious + rhs.ious,
        }
    }
}

/// Largest f64 below 1.0.
const BELOW_ONE: f64 = 1.0 - f64::EPSILON / 2.0;

/// Smallest positive f64 (subnormal).
const ABOVE_ZERO: f64 = 5e-324;

/// Implied probability of the contract resolving true.
///
/// `sigmoid` saturates to exactly 0 or 1 once |shares| passes ~745 (lower)
/// or ~37 (upper). Only those saturated values are pinned to the nearest
/// representable value inside the open interval; subnormal results pass
/// through unchanged.
#[inline]
pub fn probability_of(state: &MarketMaker) -> f64 {
    sigmoid(state.shares_issued).clamp(ABOVE_ZERO, BELOW_ONE)
}

/// Move the market to `target_probability`, returning the new state and the
/// cost of the move. `target_probability` must lie strictly inside (0, 1);
/// solvency is the caller's concern.
///
/// The cost depends only on the start and end share counts, so any sequence
/// of moves between the same two points costs the same in total.
pub fn price_to(state: &MarketMaker, target_probability: f64) -> (MarketMaker, Wealth) {
    debug_assert!(
        target_probability > 0.0 && target_probability < 1.0,
        "target probability must be in (0, 1), got {target_probability}"
    );

    let new_shares = logit(target_probability);
    let cost = Wealth {
        dollars: state.inertia * (softplus(new_shares) - softplus(state.shares_issued)),
        ious: state.inertia * (state.shares_issued - new_shares),
    };

    (
        MarketMaker {
            shares_issued: new_shares,
            ..*state
        },
        cost,
    )
}

// -----------------------
// Numerically stable math
// -----------------------

/// Logistic function, `e^x / (1 + e^x)`, without overflow for large |x|.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + e^x)`, the antiderivative of `sigmoid`.
#[inline]
pub fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Inverse of `sigmoid`: `ln(p / (1 - p))`.
#[inline]
pub fn logit(p: f64) -> f64 {
    p.ln() - (-p).ln_1p()
}

// -----------------------
// Tests
// -----------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const INERTIA: f64 = 100.0;

    fn market_at(p: f64) -> MarketMaker {
        MarketMaker::new(INERTIA).price_to(p).0
    }

    proptest! {
        #[test]
        fn probability_stays_inside_unit_interval(shares in -1.0e6f64..1.0e6) {
            let m = MarketMaker { inertia: INERTIA, shares_issued: shares };
            let p = probability_of(&m);
            prop_assert!(p > 0.0 && p < 1.0, "p={} for shares={}", p, shares);
        }

        #[test]
        fn price_to_round_trips(p in 0.0001f64..0.9999) {
            let (next, _) = price_to(&MarketMaker::new(INERTIA), p);
            prop_assert!((probability_of(&next) - p).abs() < 1e-12);
        }

        #[test]
        fn cost_is_path_independent(
            p0 in 0.001f64..0.999,
            p1 in 0.001f64..0.999,
            p2 in 0.001f64..0.999,
        ) {
            let start = market_at(p0);
            let (mid, first) = price_to(&start, p1);
            let (_, second) = price_to(&mid, p2);
            let (_, direct) = price_to(&start, p2);
            let stepped = first + second;

            prop_assert!((stepped.dollars - direct.dollars).abs() < 1e-9,
                "dollars: stepped={} direct={}", stepped.dollars, direct.dollars);
            prop_assert!((stepped.ious - direct.ious).abs() < 1e-9,
                "ious: stepped={} direct={}", stepped.ious, direct.ious);
        }

        #[test]
        fn moving_back_refunds_exactly(p0 in 0.01f64..0.99, p1 in 0.01f64..0.99) {
            let start = market_at(p0);
            let (moved, there) = price_to(&start, p1);
            let (_, back) = price_to(&moved, p0);
            let net = there + back;
            prop_assert!(net.dollars.abs() < 1e-9 && net.ious.abs() < 1e-9);
        }
    }

    #[test]
    fn fresh_market_is_even_odds() {
        let m = MarketMaker::new(INERTIA);
        assert_eq!(m.shares_issued, 0.0);
        assert_eq!(m.probability(), 0.5);
    }

    #[test]
    fn pricing_matches_closed_form() {
        let start = MarketMaker::new(INERTIA);
        let (next, cost) = start.price_to(0.7);

        let shares = (0.7f64 / 0.3).ln();
        let dollars = INERTIA * ((1.0 + shares.exp()).ln() - 2f64.ln());
        let ious = INERTIA * (0.0 - shares);

        assert!((next.shares_issued - shares).abs() < 1e-12);
        assert!((cost.dollars - dollars).abs() < 1e-9, "dollars={}", cost.dollars);
        assert!((cost.ious - ious).abs() < 1e-9, "ious={}", cost.ious);
        assert_eq!(next.inertia, INERTIA);
    }

    #[test]
    fn extreme_targets_stay_finite() {
        let start = MarketMaker::new(INERTIA);
        for p in [1e-300, 1e-15, 0.5, 1.0 - 1e-15, f64::EPSILON] {
            let (next, cost) = start.price_to(p);
            assert!(next.shares_issued.is_finite(), "p={p}");
            assert!(cost.dollars.is_finite() && cost.ious.is_finite(), "p={p}");
        }
    }

    #[test]
    fn subnormal_probabilities_are_not_rounded_up() {
        let deep = MarketMaker { inertia: INERTIA, shares_issued: -720.0 };
        let p = probability_of(&deep);
        assert_eq!(p, sigmoid(-720.0));
        assert!(p > 0.0 && p < f64::MIN_POSITIVE, "p={p:e}");

        let saturated = MarketMaker { inertia: INERTIA, shares_issued: -1.0e6 };
        assert_eq!(probability_of(&saturated), ABOVE_ZERO);
    }

    #[test]
    fn softplus_agrees_with_naive_form_in_range() {
        for x in [-30.0, -1.5, 0.0, 0.25, 3.0, 30.0] {
            let naive = (1.0f64 + f64::exp(x)).ln();
            assert!((softplus(x) - naive).abs() < 1e-12, "x={x}");
        }
        assert!(softplus(1000.0).is_finite());
        assert!((softplus(1000.0) - 1000.0).abs() < 1e-12);
    }
}
