//! Spread-driven open / add / close decisions.
//!
//! Pure: reads quotes and the current group, returns what to do. Execution
//! and bookkeeping happen in the engine.

use crate::config::StrategyConfig;
use crate::feed::PriceQuote;
use crate::strategy::group::{Direction, HedgeGroup};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    None,
    Open { direction: Direction, spread: Decimal },
    Add { direction: Direction, spread: Decimal },
    CloseAll { spread: Decimal },
}

/// `midB - midA`.
pub fn spread(a: &PriceQuote, b: &PriceQuote) -> Decimal {
    b.mid() - a.mid()
}

#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    config: StrategyConfig,
}

impl SignalEvaluator {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Entry threshold for the next leg of a group already holding `legs`.
    pub fn add_threshold(&self, legs: usize) -> Decimal {
        self.config.open_threshold + self.config.add_step * Decimal::from(legs)
    }

    /// True when a close is still justified at `spread`, allowing the
    /// configured buffer for movement between legs.
    pub fn close_still_valid(&self, spread: Decimal) -> bool {
        spread.abs() <= self.config.close_threshold + self.config.close_recheck_buffer
    }

    /// Invalid or missing quotes always yield [`Signal::None`].
    pub fn evaluate(
        &self,
        group: &HedgeGroup,
        quote_a: Option<&PriceQuote>,
        quote_b: Option<&PriceQuote>,
    ) -> Signal {
        let (Some(a), Some(b)) = (quote_a, quote_b) else {
            return Signal::None;
        };
        if !a.valid || !b.valid {
            return Signal::None;
        }

        let spread = spread(a, b);
        let magnitude = spread.abs();

        let Some(held) = group.direction() else {
            if magnitude > self.config.open_threshold {
                if let Some(direction) = Direction::from_spread(spread) {
                    return Signal::Open { direction, spread };
                }
            }
            return Signal::None;
        };

        if magnitude <= self.config.close_threshold {
            return Signal::CloseAll { spread };
        }

        // A flipped sign never adds to the held direction.
        if Direction::from_spread(spread) != Some(held) {
            return Signal::None;
        }

        let legs = group.legs().len();
        let fits = group.has_capacity(
            self.config.unit_amount,
            self.config.max_legs,
            self.config.max_size,
        );
        if fits && magnitude >= self.add_threshold(legs) {
            return Signal::Add {
                direction: held,
                spread,
            };
        }

        Signal::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::group::tests::leg;
    use rust_decimal_macros::dec;
    use tokio::time::Instant;

    fn quote(mid: Decimal) -> PriceQuote {
        PriceQuote {
            bid: mid - dec!(0.01),
            ask: mid + dec!(0.01),
            last_price: mid,
            updated_at: Instant::now(),
            valid: true,
        }
    }

    fn evaluator() -> SignalEvaluator {
        SignalEvaluator::new(StrategyConfig {
            open_threshold: dec!(0.1),
            close_threshold: dec!(0.03),
            add_step: dec!(0.05),
            max_legs: 3,
            max_size: dec!(0.03),
            unit_amount: dec!(0.01),
            ..StrategyConfig::default()
        })
    }

    fn evaluate(group: &HedgeGroup, mid_a: Decimal, mid_b: Decimal) -> Signal {
        evaluator().evaluate(group, Some(&quote(mid_a)), Some(&quote(mid_b)))
    }

    fn holding(legs: usize) -> HedgeGroup {
        let trades = (0..legs)
            .map(|i| leg(&format!("t{i}"), Direction::LongAShortB, dec!(0.01)))
            .collect();
        HedgeGroup::from_open_trades(trades).unwrap()
    }

    #[test]
    fn test_open_on_wide_spread() {
        let signal = evaluate(&HedgeGroup::new(), dec!(100), dec!(100.15));
        assert_eq!(
            signal,
            Signal::Open {
                direction: Direction::LongAShortB,
                spread: dec!(0.15)
            }
        );

        let signal = evaluate(&HedgeGroup::new(), dec!(100.15), dec!(100));
        assert!(matches!(signal, Signal::Open { direction: Direction::ShortALongB, .. }));
    }

    #[test]
    fn test_no_action_when_threshold_not_exceeded_or_feed_invalid() {
        let group = HedgeGroup::new();
        assert_eq!(evaluate(&group, dec!(100), dec!(100.1)), Signal::None);

        let mut stale = quote(dec!(100));
        stale.valid = false;
        assert_eq!(
            evaluator().evaluate(&group, Some(&stale), Some(&quote(dec!(100.5)))),
            Signal::None
        );
        assert_eq!(evaluator().evaluate(&group, None, Some(&quote(dec!(100.5)))), Signal::None);
    }

    #[test]
    fn test_close_when_spread_collapses() {
        let signal = evaluate(&holding(2), dec!(100), dec!(100.02));
        assert_eq!(signal, Signal::CloseAll { spread: dec!(0.02) });

        // Collapse through zero still closes.
        let signal = evaluate(&holding(1), dec!(100.02), dec!(100));
        assert!(matches!(signal, Signal::CloseAll { .. }));
    }

    #[test]
    fn test_add_threshold_widens_per_leg() {
        let evaluator = evaluator();
        assert_eq!(evaluator.add_threshold(1), dec!(0.15));

        let a = quote(dec!(100));
        let group = holding(1);
        assert_eq!(evaluator.evaluate(&group, Some(&a), Some(&quote(dec!(100.14)))), Signal::None);
        assert_eq!(
            evaluator.evaluate(&group, Some(&a), Some(&quote(dec!(100.15)))),
            Signal::Add {
                direction: Direction::LongAShortB,
                spread: dec!(0.15)
            }
        );

        // Size cap reached.
        assert_eq!(evaluate(&holding(3), dec!(100), dec!(101)), Signal::None);
    }

    #[test]
    fn test_flipped_spread_never_adds() {
        let signal = evaluate(&holding(1), dec!(100.5), dec!(100));
        assert_eq!(signal, Signal::None);
    }

    #[test]
    fn test_close_recheck() {
        let evaluator = evaluator();
        // close 0.03 + default buffer
        let limit = dec!(0.03) + evaluator.config().close_recheck_buffer;
        assert!(evaluator.close_still_valid(limit));
        assert!(!evaluator.close_still_valid(limit + dec!(0.01)));
        assert!(evaluator.close_still_valid(-limit));
    }
}
