//! Execution simulation.
//!
//! - Portfolio state machine (Flat / Long / Short) with confidence gating
//! - Transaction costs on every leg, with optional slippage
//! - Append-only trade ledger and per-period equity curve

pub mod costs;
pub mod engine;
pub mod trade;

pub use costs::{CostModel, Fill};
pub use engine::{EquityCurve, EquityPoint, ExecutionConfig, ExecutionSimulator, SimulationResult};
pub use trade::{Position, PositionState, Side, Trade, TradeKind, TradeTrigger};
