//! Positions and the append-only trade ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::Timestamp;

/// Direction of a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Portfolio state for a single instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionState {
    #[default]
    Flat,
    Long,
    Short,
}

/// Whether a trade opened or closed a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    Open,
    Close,
}

/// What caused a trade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TradeTrigger {
    /// A combined signal that cleared the confidence gate.
    Signal { confidence: f64 },
    /// Forced flatten at the end of a test window.
    WindowEnd,
}

/// An open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub state: PositionState,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_timestamp: Timestamp,
    pub entry_cost: Decimal,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.state == PositionState::Long
    }

    /// Side of the fill that closes this position.
    pub fn exit_side(&self) -> Side {
        if self.is_long() {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// Signed cash flow from closing at `fill_price` (before commission).
    pub fn exit_proceeds(&self, fill_price: Decimal) -> Decimal {
        let value = self.quantity * fill_price;
        if self.is_long() {
            value
        } else {
            -value
        }
    }

    /// Gross P&L if closed at `fill_price`, excluding commissions.
    pub fn gross_pnl(&self, fill_price: Decimal) -> Decimal {
        let diff = fill_price - self.entry_price;
        if self.is_long() {
            self.quantity * diff
        } else {
            -self.quantity * diff
        }
    }
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub timestamp: Timestamp,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub cost: Decimal,
    pub kind: TradeKind,
    /// Net P&L of the round trip (both commissions included); closing trades only.
    pub realized_pnl: Option<Decimal>,
    pub trigger: TradeTrigger,
}

impl Trade {
    pub fn is_close(&self) -> bool {
        self.kind == TradeKind::Close
    }

    /// Check if a closing trade was profitable.
    pub fn is_winner(&self) -> bool {
        self.realized_pnl.map(|p| p > Decimal::ZERO).unwrap_or(false)
    }

    pub fn pnl(&self) -> Decimal {
        self.realized_pnl.unwrap_or(Decimal::ZERO)
    }

    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }

    /// Confidence of the signal that caused this trade, if any.
    pub fn signal_confidence(&self) -> Option<f64> {
        match self.trigger {
            TradeTrigger::Signal { confidence } => Some(confidence),
            TradeTrigger::WindowEnd => None,
        }
    }
}
