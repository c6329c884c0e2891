//! Execution simulator.
//!
//! Consumes one combined signal per period for a single instrument and runs
//! the portfolio state machine:
//! 1. Validate alignment (instrument, timestamp order, price)
//! 2. Gate the signal on confidence
//! 3. Close and/or open a position as the action requires
//! 4. Mark equity at liquidation value and record the period

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::{Action, CombinedSignal, Record, Timestamp};
use crate::error::{EngineError, EngineResult};

use super::costs::CostModel;
use super::trade::{Position, PositionState, Side, Trade, TradeKind, TradeTrigger};

/// Configuration for the execution simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Starting equity.
    pub initial_equity: Decimal,

    /// Minimum confidence for a signal to act (below it the signal is Hold).
    pub confidence_threshold: f64,

    /// Transaction cost model.
    #[serde(default)]
    pub costs: CostModel,

    /// Fraction of equity committed to a new position.
    #[serde(default = "default_one")]
    pub allocation: Decimal,

    /// Multiplier on the allocation (1 = cash account).
    #[serde(default = "default_one")]
    pub leverage: Decimal,

    /// Whether Sell may open a short position.
    #[serde(default = "default_true")]
    pub allow_short: bool,
}

fn default_one() -> Decimal {
    Decimal::ONE
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            initial_equity: Decimal::from(100_000),
            confidence_threshold: 0.65,
            costs: CostModel::default(),
            allocation: Decimal::ONE,
            leverage: Decimal::ONE,
            allow_short: true,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.initial_equity <= Decimal::ZERO {
            return Err(EngineError::config(format!(
                "initial_equity must be positive, got {}",
                self.initial_equity
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(EngineError::config(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.allocation <= Decimal::ZERO || self.allocation > Decimal::ONE {
            return Err(EngineError::config(format!(
                "allocation must be in (0, 1], got {}",
                self.allocation
            )));
        }
        if self.leverage < Decimal::ONE {
            return Err(EngineError::config(format!(
                "leverage must be at least 1, got {}",
                self.leverage
            )));
        }
        self.costs.validate()
    }
}

/// Per-period equity snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: Timestamp,
    /// Liquidation value: cash plus net exit proceeds of the open position.
    pub equity: Decimal,
    pub cash: Decimal,
    pub position_value: Decimal,
    pub state: PositionState,
}

/// Initial equity plus one point per simulated period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityCurve {
    initial_equity: Decimal,
    points: Vec<EquityPoint>,
}

impl EquityCurve {
    pub fn new(initial_equity: Decimal) -> Self {
        Self {
            initial_equity,
            points: Vec::new(),
        }
    }

    pub fn initial_equity(&self) -> Decimal {
        self.initial_equity
    }

    pub fn points(&self) -> &[EquityPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.points.last().map(|p| p.timestamp)
    }

    pub fn final_equity(&self) -> Decimal {
        self.points
            .last()
            .map(|p| p.equity)
            .unwrap_or(self.initial_equity)
    }

    /// Append a point; timestamps must be strictly increasing.
    pub fn push(&mut self, point: EquityPoint) -> EngineResult<()> {
        if let Some(last) = self.last_timestamp() {
            if point.timestamp <= last {
                return Err(EngineError::alignment(format!(
                    "equity point at {} does not follow {}",
                    point.timestamp, last
                )));
            }
        }
        self.points.push(point);
        Ok(())
    }

    /// Append every point of a later curve.
    pub fn extend_from(&mut self, other: &EquityCurve) -> EngineResult<()> {
        for point in &other.points {
            self.push(point.clone())?;
        }
        Ok(())
    }

    /// Equity values as f64, starting with the initial equity.
    pub fn values(&self) -> Vec<f64> {
        std::iter::once(self.initial_equity)
            .chain(self.points.iter().map(|p| p.equity))
            .map(|e| f64::try_from(e).unwrap_or(0.0))
            .collect()
    }

    fn replace_last(&mut self, point: EquityPoint) {
        if let Some(last) = self.points.last_mut() {
            *last = point;
        }
    }
}

/// Result of a completed simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub instrument: String,
    pub trades: Vec<Trade>,
    pub equity_curve: EquityCurve,
    pub final_state: PositionState,
    pub open_position: Option<Position>,
    /// Non-Hold signals suppressed by the confidence gate.
    pub gated_signals: usize,
    pub total_cost: Decimal,
}

impl SimulationResult {
    pub fn final_equity(&self) -> Decimal {
        self.equity_curve.final_equity()
    }

    pub fn closing_trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter().filter(|t| t.is_close())
    }

    pub fn total_return_pct(&self) -> f64 {
        let initial: f64 = self.equity_curve.initial_equity().try_into().unwrap_or(1.0);
        let final_eq: f64 = self.final_equity().try_into().unwrap_or(1.0);
        (final_eq - initial) / initial * 100.0
    }

    /// Generate summary string.
    pub fn summary(&self) -> String {
        format!(
            "Simulation {} ({} periods)\n\
             ----------------------------------------\n\
             Final Equity: ${:.2}\n\
             Total Return: {:.2}%\n\
             Trades: {} ({} closed)\n\
             Gated Signals: {}\n\
             Total Cost: ${:.2}\n\
             Final State: {:?}",
            self.instrument,
            self.equity_curve.len(),
            self.final_equity(),
            self.total_return_pct(),
            self.trades.len(),
            self.closing_trades().count(),
            self.gated_signals,
            self.total_cost,
            self.final_state,
        )
    }
}

/// Single-instrument portfolio simulator.
#[derive(Debug, Clone)]
pub struct ExecutionSimulator {
    config: ExecutionConfig,
    instrument: String,
    cash: Decimal,
    position: Option<Position>,
    trades: Vec<Trade>,
    equity_curve: EquityCurve,
    last_timestamp: Option<Timestamp>,
    gated_signals: usize,
    total_cost: Decimal,
}

impl ExecutionSimulator {
    pub fn new(config: ExecutionConfig, instrument: &str) -> EngineResult<Self> {
        config.validate()?;
        let equity = config.initial_equity;
        Ok(Self {
            config,
            instrument: instrument.to_string(),
            cash: equity,
            position: None,
            trades: Vec::new(),
            equity_curve: EquityCurve::new(equity),
            last_timestamp: None,
            gated_signals: 0,
            total_cost: Decimal::ZERO,
        })
    }

    /// Start from a carried-over equity instead of the configured one.
    pub fn with_initial_equity(
        config: ExecutionConfig,
        instrument: &str,
        equity: Decimal,
    ) -> EngineResult<Self> {
        Self::new(
            ExecutionConfig {
                initial_equity: equity,
                ..config
            },
            instrument,
        )
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn state(&self) -> PositionState {
        self.position
            .as_ref()
            .map(|p| p.state)
            .unwrap_or(PositionState::Flat)
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &EquityCurve {
        &self.equity_curve
    }

    pub fn gated_signals(&self) -> usize {
        self.gated_signals
    }

    /// Process one period.
    pub fn step(&mut self, signal: &CombinedSignal, price: Decimal) -> EngineResult<()> {
        self.check_signal(signal, price)?;

        let timestamp = signal.timestamp;
        let trigger = TradeTrigger::Signal {
            confidence: signal.confidence,
        };

        match self.gate(signal) {
            Action::Buy => self.go_long(timestamp, price, trigger),
            Action::Sell => self.go_short(timestamp, price, trigger),
            Action::Hold => {}
        }

        self.last_timestamp = Some(timestamp);
        let point = self.mark(timestamp, price);
        self.equity_curve.push(point)
    }

    /// Process a window of signals aligned one-to-one with its records.
    pub fn run(&mut self, signals: &[CombinedSignal], records: &[Record]) -> EngineResult<()> {
        if signals.len() != records.len() {
            return Err(EngineError::alignment(format!(
                "{}: {} signals for {} price records",
                self.instrument,
                signals.len(),
                records.len()
            )));
        }

        for (signal, record) in signals.iter().zip(records) {
            if signal.timestamp != record.timestamp {
                return Err(EngineError::alignment(format!(
                    "{}: signal at {} paired with price at {}",
                    self.instrument, signal.timestamp, record.timestamp
                )));
            }
            self.step(signal, record.price)?;
        }

        Ok(())
    }

    /// Flatten any open position at `price` (window end).
    ///
    /// If `timestamp` is the last simulated period, that period's equity point
    /// is restated; otherwise a new point is appended.
    pub fn close_out(
        &mut self,
        timestamp: Timestamp,
        price: Decimal,
    ) -> EngineResult<Option<Trade>> {
        if price <= Decimal::ZERO {
            return Err(EngineError::alignment(format!(
                "{}: non-positive close-out price {} at {}",
                self.instrument, price, timestamp
            )));
        }
        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                return Err(EngineError::alignment(format!(
                    "{}: close-out at {} precedes last period {}",
                    self.instrument, timestamp, last
                )));
            }
        }

        let trade = self.close_position(timestamp, price, TradeTrigger::WindowEnd);
        if trade.is_some() {
            let point = self.mark(timestamp, price);
            if self.last_timestamp == Some(timestamp) {
                self.equity_curve.replace_last(point);
            } else {
                self.equity_curve.push(point)?;
                self.last_timestamp = Some(timestamp);
            }
        }

        Ok(trade)
    }

    /// Consume the simulator and hand back its ledger and curve.
    pub fn finish(self) -> SimulationResult {
        SimulationResult {
            final_state: self.state(),
            instrument: self.instrument,
            trades: self.trades,
            equity_curve: self.equity_curve,
            open_position: self.position,
            gated_signals: self.gated_signals,
            total_cost: self.total_cost,
        }
    }

    fn check_signal(&self, signal: &CombinedSignal, price: Decimal) -> EngineResult<()> {
        if signal.instrument != self.instrument {
            return Err(EngineError::alignment(format!(
                "signal for {} sent to simulator for {}",
                signal.instrument, self.instrument
            )));
        }
        if let Some(last) = self.last_timestamp {
            if signal.timestamp <= last {
                return Err(EngineError::alignment(format!(
                    "{}: signal at {} does not follow {}",
                    self.instrument, signal.timestamp, last
                )));
            }
        }
        if price <= Decimal::ZERO {
            return Err(EngineError::alignment(format!(
                "{}: non-positive price {} at {}",
                self.instrument, price, signal.timestamp
            )));
        }
        Ok(())
    }

    fn gate(&mut self, signal: &CombinedSignal) -> Action {
        if signal.action == Action::Hold {
            return Action::Hold;
        }
        // NaN confidence never clears the gate.
        if signal.confidence >= self.config.confidence_threshold {
            signal.action
        } else {
            self.gated_signals += 1;
            Action::Hold
        }
    }

    fn go_long(&mut self, timestamp: Timestamp, price: Decimal, trigger: TradeTrigger) {
        match self.state() {
            PositionState::Long => {}
            PositionState::Short => {
                self.close_position(timestamp, price, trigger);
                self.open_position(PositionState::Long, timestamp, price, trigger);
            }
            PositionState::Flat => {
                self.open_position(PositionState::Long, timestamp, price, trigger);
            }
        }
    }

    fn go_short(&mut self, timestamp: Timestamp, price: Decimal, trigger: TradeTrigger) {
        match self.state() {
            PositionState::Short => {}
            PositionState::Long => {
                self.close_position(timestamp, price, trigger);
                if self.config.allow_short {
                    self.open_position(PositionState::Short, timestamp, price, trigger);
                }
            }
            PositionState::Flat => {
                if self.config.allow_short {
                    self.open_position(PositionState::Short, timestamp, price, trigger);
                }
            }
        }
    }

    fn open_position(
        &mut self,
        state: PositionState,
        timestamp: Timestamp,
        price: Decimal,
        trigger: TradeTrigger,
    ) {
        let side = if state == PositionState::Long {
            Side::Buy
        } else {
            Side::Sell
        };

        // Only called while flat, so cash is the whole equity.
        let budget = self.cash * self.config.allocation * self.config.leverage;
        let quantity = self.config.costs.affordable_quantity(side, budget, price);
        if quantity <= Decimal::ZERO {
            warn!(
                instrument = %self.instrument,
                %timestamp,
                cash = %self.cash,
                "No equity available to open position"
            );
            return;
        }

        let fill = self.config.costs.fill(side, quantity, price);
        match side {
            Side::Buy => self.cash -= fill.notional() + fill.cost,
            Side::Sell => self.cash += fill.notional() - fill.cost,
        }
        self.total_cost += fill.cost;

        debug!(
            instrument = %self.instrument,
            %timestamp,
            ?side,
            quantity = %fill.quantity,
            price = %fill.price,
            cost = %fill.cost,
            "Opened position"
        );

        self.position = Some(Position {
            instrument: self.instrument.clone(),
            state,
            quantity,
            entry_price: fill.price,
            entry_timestamp: timestamp,
            entry_cost: fill.cost,
        });
        self.trades.push(Trade {
            timestamp,
            instrument: self.instrument.clone(),
            side,
            quantity,
            price: fill.price,
            cost: fill.cost,
            kind: TradeKind::Open,
            realized_pnl: None,
            trigger,
        });
    }

    fn close_position(
        &mut self,
        timestamp: Timestamp,
        price: Decimal,
        trigger: TradeTrigger,
    ) -> Option<Trade> {
        let position = self.position.take()?;
        let fill = self
            .config
            .costs
            .fill(position.exit_side(), position.quantity, price);

        // Same expression as the liquidation mark, so closing is equity-neutral.
        self.cash += position.exit_proceeds(fill.price) - fill.cost;
        self.total_cost += fill.cost;

        let realized = position.gross_pnl(fill.price) - position.entry_cost - fill.cost;

        debug!(
            instrument = %self.instrument,
            %timestamp,
            side = ?fill.side,
            quantity = %fill.quantity,
            price = %fill.price,
            pnl = %realized,
            "Closed position"
        );

        let trade = Trade {
            timestamp,
            instrument: self.instrument.clone(),
            side: fill.side,
            quantity: fill.quantity,
            price: fill.price,
            cost: fill.cost,
            kind: TradeKind::Close,
            realized_pnl: Some(realized),
            trigger,
        };
        self.trades.push(trade.clone());
        Some(trade)
    }

    fn position_value(&self, price: Decimal) -> Decimal {
        match &self.position {
            None => Decimal::ZERO,
            Some(position) => {
                let fill = self
                    .config
                    .costs
                    .fill(position.exit_side(), position.quantity, price);
                position.exit_proceeds(fill.price) - fill.cost
            }
        }
    }

    fn mark(&self, timestamp: Timestamp, price: Decimal) -> EquityPoint {
        let position_value = self.position_value(price);
        EquityPoint {
            timestamp,
            equity: self.cash + position_value,
            cash: self.cash,
            position_value,
            state: self.state(),
        }
    }
}
