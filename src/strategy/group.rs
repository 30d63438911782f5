//! The hedge group: the single unit of cross-venue exposure.

use crate::exchange::{OrderSide, Venue};
use crate::utils::weighted_average;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Orientation of a hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Buy on venue A, sell on venue B. Taken when B trades rich.
    LongAShortB,
    /// Sell on venue A, buy on venue B.
    ShortALongB,
}

impl Direction {
    /// Direction implied by `spread = midB - midA`. Zero has no direction.
    pub fn from_spread(spread: Decimal) -> Option<Direction> {
        if spread > Decimal::ZERO {
            Some(Direction::LongAShortB)
        } else if spread < Decimal::ZERO {
            Some(Direction::ShortALongB)
        } else {
            None
        }
    }

    /// Opening side on `venue`.
    pub fn side(&self, venue: Venue) -> OrderSide {
        match (self, venue) {
            (Direction::LongAShortB, Venue::A) | (Direction::ShortALongB, Venue::B) => {
                OrderSide::Buy
            }
            (Direction::LongAShortB, Venue::B) | (Direction::ShortALongB, Venue::A) => {
                OrderSide::Sell
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::LongAShortB => "buy_a_sell_b",
            Direction::ShortALongB => "sell_a_buy_b",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "buy_a_sell_b" => Ok(Direction::LongAShortB),
            "sell_a_buy_b" => Ok(Direction::ShortALongB),
            other => bail!("unknown hedge direction: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// One add-on fill: both legs of a successful race.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HedgePosition {
    pub trade_id: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub entry_price_a: Decimal,
    pub entry_price_b: Decimal,
    pub order_id_a: String,
    pub order_id_b: String,
    pub opened_at: DateTime<Utc>,
    pub spread_at_open: Decimal,
    pub status: PositionStatus,
}

impl HedgePosition {
    pub fn side(&self, venue: Venue) -> OrderSide {
        self.direction.side(venue)
    }

    pub fn entry_price(&self, venue: Venue) -> Decimal {
        match venue {
            Venue::A => self.entry_price_a,
            Venue::B => self.entry_price_b,
        }
    }
}

/// Aggregate of every open leg. `direction` is `None` exactly when there are
/// no legs.
#[derive(Debug, Clone, Default)]
pub struct HedgeGroup {
    direction: Option<Direction>,
    legs: Vec<HedgePosition>,
    first_open_time: Option<DateTime<Utc>>,
}

impl HedgeGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the group from the ledger's open trades after a restart.
    pub fn from_open_trades(trades: Vec<HedgePosition>) -> Result<Self> {
        let mut group = Self::new();
        for trade in trades {
            group.push(trade)?;
        }
        Ok(group)
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn legs(&self) -> &[HedgePosition] {
        &self.legs
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }

    pub fn total_amount(&self) -> Decimal {
        self.legs.iter().map(|leg| leg.amount).sum()
    }

    pub fn first_open_time(&self) -> Option<DateTime<Utc>> {
        self.first_open_time
    }

    /// Amount-weighted entry price on `venue`.
    pub fn average_entry(&self, venue: Venue) -> Decimal {
        let values: Vec<(Decimal, Decimal)> = self
            .legs
            .iter()
            .map(|leg| (leg.entry_price(venue), leg.amount))
            .collect();
        weighted_average(&values)
    }

    /// True when one more leg of `unit` fits under both caps.
    pub fn has_capacity(&self, unit: Decimal, max_legs: usize, max_size: Decimal) -> bool {
        self.legs.len() < max_legs && self.total_amount() + unit <= max_size
    }

    /// Adds a filled leg. A leg in the opposite direction is refused.
    pub fn push(&mut self, leg: HedgePosition) -> Result<()> {
        if let Some(direction) = self.direction {
            if direction != leg.direction {
                bail!(
                    "leg {} is {} but group holds {}",
                    leg.trade_id,
                    leg.direction,
                    direction
                );
            }
        }

        if self.first_open_time.is_none() {
            self.first_open_time = Some(leg.opened_at);
        }
        self.direction = Some(leg.direction);
        self.legs.push(leg);
        Ok(())
    }

    /// Removes a closed leg. The group resets once the last leg is gone.
    pub fn remove(&mut self, trade_id: &str) -> Option<HedgePosition> {
        let index = self.legs.iter().position(|leg| leg.trade_id == trade_id)?;
        let leg = self.legs.remove(index);

        if self.legs.is_empty() {
            self.direction = None;
            self.first_open_time = None;
        }
        Some(leg)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn leg(id: &str, direction: Direction, amount: Decimal) -> HedgePosition {
        HedgePosition {
            trade_id: id.to_string(),
            direction,
            amount,
            entry_price_a: dec!(100),
            entry_price_b: dec!(100.15),
            order_id_a: format!("{id}-a"),
            order_id_b: format!("{id}-b"),
            opened_at: Utc::now(),
            spread_at_open: dec!(0.15),
            status: PositionStatus::Open,
        }
    }

    #[test]
    fn test_direction_from_spread() {
        assert_eq!(
            Direction::from_spread(dec!(0.15)),
            Some(Direction::LongAShortB)
        );
        assert_eq!(
            Direction::from_spread(dec!(-0.15)),
            Some(Direction::ShortALongB)
        );
        assert_eq!(Direction::from_spread(Decimal::ZERO), None);

        assert_eq!(Direction::LongAShortB.side(Venue::A), OrderSide::Buy);
        assert_eq!(Direction::LongAShortB.side(Venue::B), OrderSide::Sell);
        assert_eq!(
            "sell_a_buy_b".parse::<Direction>().unwrap(),
            Direction::ShortALongB
        );
    }

    #[test]
    fn test_direction_tracks_legs() {
        let mut group = HedgeGroup::new();
        assert!(group.direction().is_none() && group.is_empty());

        group.push(leg("t1", Direction::LongAShortB, dec!(0.01))).unwrap();
        group.push(leg("t2", Direction::LongAShortB, dec!(0.01))).unwrap();
        assert_eq!(group.direction(), Some(Direction::LongAShortB));
        assert_eq!(group.total_amount(), dec!(0.02));

        group.remove("t1");
        assert!(group.direction().is_some());

        group.remove("t2");
        assert!(group.direction().is_none());
        assert!(group.is_empty());
        assert!(group.first_open_time().is_none());
        assert!(group.remove("t2").is_none());
    }

    #[test]
    fn test_opposite_leg_is_refused() {
        let mut group = HedgeGroup::new();
        group.push(leg("t1", Direction::LongAShortB, dec!(0.01))).unwrap();

        assert!(group.push(leg("t2", Direction::ShortALongB, dec!(0.01))).is_err());
        assert_eq!(group.legs().len(), 1);

        let mixed = vec![
            leg("t1", Direction::LongAShortB, dec!(0.01)),
            leg("t2", Direction::ShortALongB, dec!(0.01)),
        ];
        assert!(HedgeGroup::from_open_trades(mixed).is_err());
    }

    #[test]
    fn test_capacity_and_average_entry() {
        let mut group = HedgeGroup::new();
        let mut first = leg("t1", Direction::LongAShortB, dec!(0.02));
        first.entry_price_a = dec!(100);
        let mut second = leg("t2", Direction::LongAShortB, dec!(0.01));
        second.entry_price_a = dec!(103);
        group.push(first).unwrap();

        assert!(group.has_capacity(dec!(0.01), 2, dec!(0.03)));
        assert!(!group.has_capacity(dec!(0.02), 2, dec!(0.03)));
        assert!(!group.has_capacity(dec!(0.01), 1, dec!(0.03)));

        group.push(second).unwrap();
        assert_eq!(group.average_entry(Venue::A), dec!(101));
    }
}
