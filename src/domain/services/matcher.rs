//! Position Matcher
//!
//! Pure pairing and classification of broker-reported positions against
//! internally-expected positions. Matching is first-match-wins over the
//! not-yet-consumed expected set, so for a fixed input ordering the result
//! is deterministic; one account's pass must never be parallelized.
//!
//! All price tolerances are expressed in pips and scaled by the instrument
//! class, so "2 pips" means 0.0002 on EURUSD but 0.20 on XAUUSD.

use crate::domain::entities::position::ExpectedPosition;
use crate::domain::entities::records::{DivergenceReason, OutcomeKind};
use crate::domain::entities::snapshot::BrokerPosition;

/// Coarse instrument grouping that fixes the pip size for tolerance math.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentClass {
    /// FX majors/crosses quoted to 4-5 decimals.
    Fx,
    /// Spot metals (XAU, XAG) quoted to 2 decimals.
    Metal,
    /// Equity indices quoted in whole points.
    Index,
    /// Crypto CFDs, wide ticks.
    Crypto,
}

impl InstrumentClass {
    /// Infer the class from the symbol name. Unknown symbols fall back to
    /// FX sizing, the tightest tolerance.
    pub fn from_symbol(symbol: &str) -> Self {
        let upper = symbol.to_ascii_uppercase();
        if upper.starts_with("XAU") || upper.starts_with("XAG") {
            InstrumentClass::Metal
        } else if upper.starts_with("BTC") || upper.starts_with("ETH") {
            InstrumentClass::Crypto
        } else if upper.starts_with("US") || upper.starts_with("GER") || upper.starts_with("NAS") {
            InstrumentClass::Index
        } else {
            InstrumentClass::Fx
        }
    }

    /// Smallest quoted increment used to bound acceptable slippage.
    pub fn pip_size(&self) -> f64 {
        match self {
            InstrumentClass::Fx => 0.0001,
            InstrumentClass::Metal => 0.10,
            InstrumentClass::Index => 1.0,
            InstrumentClass::Crypto => 1.0,
        }
    }
}

/// Matching and divergence tolerances.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Relative volume tolerance for pairing eligibility, percent.
    pub volume_tolerance_percent: f64,
    /// Relative volume difference beyond which a pair is a divergence, percent.
    pub divergence_volume_tolerance_percent: f64,
    /// Entry-price pairing tolerance, in pips.
    pub entry_price_tolerance_pips: f64,
    /// Entry slippage beyond which a pair is a divergence, in pips.
    pub divergence_price_tolerance_pips: f64,
    /// TP/SL drift beyond which a pair is a divergence, in pips.
    pub stop_level_tolerance_pips: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            volume_tolerance_percent: 5.0,
            divergence_volume_tolerance_percent: 10.0,
            entry_price_tolerance_pips: 2.0,
            divergence_price_tolerance_pips: 5.0,
            stop_level_tolerance_pips: 10.0,
        }
    }
}

/// One pairing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchVerdict {
    pub outcome: OutcomeKind,
    pub divergence_reason: Option<DivergenceReason>,
    /// Absolute entry-price difference, present for paired outcomes.
    pub slippage: Option<f64>,
}

/// Pure matcher. Holds only tolerances, no connections and no state.
#[derive(Debug, Clone, Default)]
pub struct PositionMatcher {
    config: MatcherConfig,
}

impl PositionMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Find the first not-yet-consumed expected position eligible to pair
    /// with `broker`. `consumed[i]` marks expected positions claimed by an
    /// earlier pairing in the same pass. Returns the index into `expected`.
    pub fn find_match(
        &self,
        broker: &BrokerPosition,
        expected: &[ExpectedPosition],
        consumed: &[bool],
    ) -> Option<usize> {
        let price_tolerance = self.config.entry_price_tolerance_pips
            * InstrumentClass::from_symbol(&broker.symbol).pip_size();

        expected.iter().enumerate().position(|(i, exp)| {
            !consumed[i]
                && exp.is_open()
                && exp.symbol.eq_ignore_ascii_case(&broker.symbol)
                && exp.side == broker.side
                && relative_diff_percent(broker.volume, exp.volume)
                    <= self.config.volume_tolerance_percent
                && (broker.entry_price - exp.entry_price).abs() <= price_tolerance
        })
    }

    /// Classify an eligible pair as clean or diverged.
    pub fn classify(&self, broker: &BrokerPosition, expected: &ExpectedPosition) -> MatchVerdict {
        let pip = InstrumentClass::from_symbol(&broker.symbol).pip_size();
        let slippage = (broker.entry_price - expected.entry_price).abs();

        let reason = if slippage > self.config.divergence_price_tolerance_pips * pip {
            Some(DivergenceReason::EntrySlippage)
        } else if relative_diff_percent(broker.volume, expected.volume)
            > self.config.divergence_volume_tolerance_percent
        {
            Some(DivergenceReason::VolumeMismatch)
        } else if self.stop_levels_drifted(broker, expected, pip) {
            Some(DivergenceReason::StopLevelDrift)
        } else {
            None
        };

        MatchVerdict {
            outcome: if reason.is_some() {
                OutcomeKind::Divergence
            } else {
                OutcomeKind::Matched
            },
            divergence_reason: reason,
            slippage: Some(slippage),
        }
    }

    /// TP/SL comparison only applies when both sides specify a value.
    fn stop_levels_drifted(
        &self,
        broker: &BrokerPosition,
        expected: &ExpectedPosition,
        pip: f64,
    ) -> bool {
        let bound = self.config.stop_level_tolerance_pips * pip;
        let drifted = |a: Option<f64>, b: Option<f64>| match (a, b) {
            (Some(x), Some(y)) => (x - y).abs() > bound,
            _ => false,
        };
        drifted(broker.take_profit, expected.take_profit)
            || drifted(broker.stop_loss, expected.stop_loss)
    }
}

/// Volume difference relative to the expected volume, percent. An expected
/// volume of zero only pairs with an exactly-zero broker volume.
fn relative_diff_percent(broker_volume: f64, expected_volume: f64) -> f64 {
    if expected_volume == 0.0 {
        if broker_volume == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (broker_volume - expected_volume).abs() / expected_volume.abs() * 100.0
    }
}
