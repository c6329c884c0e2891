//! Transaction cost model.
//!
//! Every fill pays a commission proportional to its notional (default 0.1%),
//! optionally floored/capped per leg, and may be filled at a price moved
//! against the trader by a fixed number of basis points.
//!
//! | Leg   | Fill price               | Cost                         |
//! |-------|--------------------------|------------------------------|
//! | Buy   | price × (1 + bps/10000)  | rate × quantity × fill price |
//! | Sell  | price × (1 − bps/10000)  | rate × quantity × fill price |

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

use super::trade::Side;

const BPS_DIVISOR: i64 = 10_000;

/// Price and cost of one simulated fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub cost: Decimal,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Configurable cost model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Commission as a fraction of notional, charged on every leg.
    pub commission_rate: Decimal,
    /// Adverse fill adjustment in basis points.
    #[serde(default)]
    pub slippage_bps: Decimal,
    /// Minimum commission per leg.
    #[serde(default)]
    pub min_cost: Decimal,
    /// Maximum commission per leg (0 = unlimited).
    #[serde(default)]
    pub max_cost: Decimal,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            commission_rate: Decimal::new(1, 3), // 0.1%
            slippage_bps: Decimal::ZERO,
            min_cost: Decimal::ZERO,
            max_cost: Decimal::ZERO,
        }
    }
}

impl CostModel {
    pub fn new(commission_rate: Decimal) -> Self {
        Self {
            commission_rate,
            ..Default::default()
        }
    }

    /// Frictionless model.
    pub fn zero() -> Self {
        Self::new(Decimal::ZERO)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.commission_rate < Decimal::ZERO || self.commission_rate >= Decimal::ONE {
            return Err(EngineError::config(format!(
                "commission_rate must be in [0, 1), got {}",
                self.commission_rate
            )));
        }
        if self.slippage_bps < Decimal::ZERO || self.slippage_bps >= Decimal::from(BPS_DIVISOR) {
            return Err(EngineError::config(format!(
                "slippage_bps must be in [0, 10000), got {}",
                self.slippage_bps
            )));
        }
        if self.min_cost < Decimal::ZERO || self.max_cost < Decimal::ZERO {
            return Err(EngineError::config("min_cost and max_cost must be non-negative"));
        }
        if self.max_cost > Decimal::ZERO && self.max_cost < self.min_cost {
            return Err(EngineError::config("max_cost is below min_cost"));
        }
        Ok(())
    }

    /// Price actually obtained when trading `side` at `price`.
    pub fn fill_price(&self, side: Side, price: Decimal) -> Decimal {
        let adj = self.slippage_bps / Decimal::from(BPS_DIVISOR);
        match side {
            Side::Buy => price * (Decimal::ONE + adj),
            Side::Sell => price * (Decimal::ONE - adj),
        }
    }

    /// Commission for one leg of the given notional.
    pub fn leg_cost(&self, notional: Decimal) -> Decimal {
        let mut cost = notional.abs() * self.commission_rate;
        if cost < self.min_cost {
            cost = self.min_cost;
        }
        if self.max_cost > Decimal::ZERO && cost > self.max_cost {
            cost = self.max_cost;
        }
        cost
    }

    /// Full fill for trading `quantity` at the quoted `price`.
    pub fn fill(&self, side: Side, quantity: Decimal, price: Decimal) -> Fill {
        let fill_price = self.fill_price(side, price);
        Fill {
            side,
            quantity,
            price: fill_price,
            cost: self.leg_cost(quantity * fill_price),
        }
    }

    /// Largest quantity whose notional plus commission fits in `budget`.
    pub fn affordable_quantity(&self, side: Side, budget: Decimal, price: Decimal) -> Decimal {
        let fill_price = self.fill_price(side, price);
        if budget <= Decimal::ZERO || fill_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        budget / (fill_price * (Decimal::ONE + self.commission_rate))
    }

    /// Entry plus exit commission for a position of the given notional.
    pub fn round_trip(&self, notional: Decimal) -> Decimal {
        self.leg_cost(notional) * Decimal::from(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_cost() {
        let model = CostModel::default();
        assert_eq!(model.commission_rate, dec!(0.001));
        assert_eq!(model.leg_cost(dec!(10_000)), dec!(10));
        assert_eq!(model.round_trip(dec!(10_000)), dec!(20));
    }

    #[test]
    fn test_min_and_max_cost() {
        let model = CostModel {
            min_cost: dec!(1),
            max_cost: dec!(5),
            ..CostModel::default()
        };
        assert_eq!(model.leg_cost(dec!(100)), dec!(1));
        assert_eq!(model.leg_cost(dec!(100_000)), dec!(5));
    }

    #[test]
    fn test_slippage_moves_fill_against_trader() {
        let model = CostModel {
            slippage_bps: dec!(10),
            ..CostModel::zero()
        };
        assert_eq!(model.fill_price(Side::Buy, dec!(100)), dec!(100.1));
        assert_eq!(model.fill_price(Side::Sell, dec!(100)), dec!(99.9));
    }

    #[test]
    fn test_affordable_quantity_spends_budget() {
        let model = CostModel::default();
        let qty = model.affordable_quantity(Side::Buy, dec!(100_100), dec!(100));
        let fill = model.fill(Side::Buy, qty, dec!(100));
        assert_eq!(qty, dec!(1000));
        assert_eq!(fill.notional() + fill.cost, dec!(100_100));
    }

    #[test]
    fn test_validate() {
        assert!(CostModel::default().validate().is_ok());
        assert!(CostModel::new(dec!(-0.01)).validate().is_err());
        assert!(CostModel::new(dec!(1)).validate().is_err());
    }
}
