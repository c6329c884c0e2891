//! Walk-forward orchestration.
//!
//! Drives split generation, external training and scoring, signal combination,
//! execution and metrics across every window, and stitches the out-of-sample
//! windows into one record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backtest::{EquityCurve, ExecutionConfig, ExecutionSimulator, Position, Trade};
use crate::data::{Record, TimeSeries, Timestamp};
use crate::ensemble::{CombinerConfig, ModelTrainer, SignalCombiner};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{MetricsCalculator, MetricsConfig, PerformanceMetrics};

use super::splits::{Split, SplitConfig, WalkForwardSplits};

/// Retry and window-boundary behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retries after the first failed external call.
    pub max_retries: u32,
    /// Base backoff; doubles on each retry.
    pub backoff_ms: u64,
    /// Close any open position on the last period of each test window.
    pub flatten_at_window_end: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 100,
            flatten_at_window_end: true,
        }
    }
}

/// Results from one completed test window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowResult {
    pub split: Split,
    pub trades: Vec<Trade>,
    /// Starts at the equity carried in from the previous window.
    pub equity_curve: EquityCurve,
    pub metrics: PerformanceMetrics,
    pub gated_signals: usize,
    pub total_cost: Decimal,
}

/// A window that could not be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowFailure {
    pub split_num: usize,
    pub test_start: Timestamp,
    pub test_end: Timestamp,
    pub kind: String,
    pub message: String,
}

impl WindowFailure {
    fn new(split: &Split, err: &EngineError) -> Self {
        Self {
            split_num: split.split_num,
            test_start: split.test.start,
            test_end: split.test.end,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Concatenated out-of-sample record for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardRecord {
    pub instrument: String,
    pub policy: String,
    pub expected_windows: usize,
    pub windows: Vec<WindowResult>,
    pub failures: Vec<WindowFailure>,
    pub equity_curve: EquityCurve,
    pub trades: Vec<Trade>,
    /// Position still open after the last window (only without flattening).
    pub open_position: Option<Position>,
    /// Metrics over the concatenated curve; `None` when no window completed.
    pub aggregate: Option<PerformanceMetrics>,
    /// At least one window failed.
    pub partial: bool,
    /// The run stopped early on request.
    pub cancelled: bool,
}

impl WalkForwardRecord {
    /// Average Sharpe ratio across completed windows.
    pub fn avg_window_sharpe(&self) -> f64 {
        if self.windows.is_empty() {
            return 0.0;
        }
        self.windows
            .iter()
            .map(|w| w.metrics.sharpe_ratio)
            .sum::<f64>()
            / self.windows.len() as f64
    }

    pub fn closing_trades(&self) -> usize {
        self.trades.iter().filter(|t| t.is_close()).count()
    }

    pub fn total_cost(&self) -> Decimal {
        self.trades.iter().map(|t| t.cost).sum()
    }

    /// Get summary string.
    pub fn summary(&self) -> String {
        let (ret, sharpe, dd) = self
            .aggregate
            .as_ref()
            .map(|m| (m.total_return, m.sharpe_ratio, m.max_drawdown))
            .unwrap_or((0.0, 0.0, 0.0));

        format!(
            "Walk-Forward Results for {}: {}/{} windows ({} failed{})\n\
             Policy: {}\n\
             Total Return: {:.2}%\n\
             Sharpe Ratio: {:.2}\n\
             Max Drawdown: {:.2}%\n\
             Trades: {}",
            self.instrument,
            self.windows.len(),
            self.expected_windows,
            self.failures.len(),
            if self.cancelled { ", cancelled" } else { "" },
            self.policy,
            ret * 100.0,
            sharpe,
            dd * 100.0,
            self.trades.len(),
        )
    }

    /// Warnings a reviewer should look at before trusting the record.
    pub fn red_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();

        if let Some(m) = &self.aggregate {
            if m.sharpe_ratio > 3.0 {
                flags.push(format!(
                    "- CRITICAL: Out-of-sample Sharpe ({:.2}) unrealistically high (>3.0). Check for leakage or optimistic costs.",
                    m.sharpe_ratio
                ));
            }
            if m.total_return <= 0.0 {
                flags.push(format!(
                    "- WARNING: Total return after costs is {:.2}%. No economic edge demonstrated.",
                    m.total_return * 100.0
                ));
            }
            if m.win_rate > 0.9 {
                flags.push(format!(
                    "- WARNING: Win rate ({:.1}%) suspiciously high.",
                    m.win_rate * 100.0
                ));
            }
            if m.max_drawdown > 0.2 {
                flags.push(format!(
                    "- WARNING: Max drawdown ({:.1}%) exceeds 20%.",
                    m.max_drawdown * 100.0
                ));
            }
        }

        let closing = self.closing_trades();
        if !self.windows.is_empty() && closing < self.windows.len() * 5 {
            flags.push(format!(
                "- WARNING: Low trade count ({} round trips). Results may not be statistically significant.",
                closing
            ));
        }

        let losing = self
            .windows
            .iter()
            .filter(|w| w.metrics.total_return < 0.0)
            .count();
        if !self.windows.is_empty() && losing * 2 > self.windows.len() {
            flags.push(format!(
                "- WARNING: {} of {} windows lost money.",
                losing,
                self.windows.len()
            ));
        }

        if self.partial {
            flags.push(format!(
                "- WARNING: {} window(s) failed; the record is partial.",
                self.failures.len()
            ));
        }
        if self.cancelled {
            flags.push(format!(
                "- INFO: Run cancelled after {} of {} windows.",
                self.windows.len() + self.failures.len(),
                self.expected_windows
            ));
        }

        flags
    }

    /// Human-readable report: per-window table, aggregate figures and red flags.
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str(&format!("=== WALK-FORWARD REPORT: {} ===\n\n", self.instrument));
        report.push_str(&format!("Policy: {}\n", self.policy));
        report.push_str(&format!(
            "Windows: {} completed, {} failed, {} expected\n\n",
            self.windows.len(),
            self.failures.len(),
            self.expected_windows
        ));

        report.push_str("## PER-WINDOW PERFORMANCE\n\n");
        report.push_str("| Window | Test Start | Test End   | Return  | Sharpe | Max DD | Trades | Gated |\n");
        report.push_str("|--------|------------|------------|---------|--------|--------|--------|-------|\n");
        for w in &self.windows {
            report.push_str(&format!(
                "| {:>6} | {} | {} | {:>6.2}% | {:>6.2} | {:>5.2}% | {:>6} | {:>5} |\n",
                w.split.split_num,
                w.split.test.start.format("%Y-%m-%d"),
                w.split.test.end.format("%Y-%m-%d"),
                w.metrics.total_return * 100.0,
                w.metrics.sharpe_ratio,
                w.metrics.max_drawdown * 100.0,
                w.metrics.trade_count,
                w.gated_signals,
            ));
        }
        report.push('\n');

        if !self.failures.is_empty() {
            report.push_str("## FAILED WINDOWS\n\n");
            for f in &self.failures {
                report.push_str(&format!(
                    "Window {} ({} to {}): [{}] {}\n",
                    f.split_num,
                    f.test_start.format("%Y-%m-%d"),
                    f.test_end.format("%Y-%m-%d"),
                    f.kind,
                    f.message
                ));
            }
            report.push('\n');
        }

        report.push_str("## AGGREGATE OUT-OF-SAMPLE\n\n");
        match &self.aggregate {
            Some(m) => {
                report.push_str(&m.summary());
                report.push('\n');
                report.push_str(&format!("Avg Window Sharpe: {:.2}\n", self.avg_window_sharpe()));
                report.push_str(&format!("Total Costs: {:.2}\n", self.total_cost()));
                report.push_str(&format!(
                    "Final Equity: {:.2}\n\n",
                    self.equity_curve.final_equity()
                ));
            }
            None => report.push_str("No completed windows.\n\n"),
        }

        report.push_str("## RED FLAGS & WARNINGS\n\n");
        let flags = self.red_flags();
        if flags.is_empty() {
            report.push_str("No major red flags detected.\n");
        } else {
            for flag in &flags {
                report.push_str(flag);
                report.push('\n');
            }
        }

        report
    }
}

/// One instrument to evaluate in [`WalkForwardOrchestrator::run_many`].
pub struct InstrumentJob<'a> {
    pub series: &'a TimeSeries,
    pub trainer: &'a dyn ModelTrainer,
}

/// Walk-forward orchestrator.
#[derive(Debug, Clone, Default)]
pub struct WalkForwardOrchestrator {
    split_config: SplitConfig,
    combiner_config: CombinerConfig,
    execution_config: ExecutionConfig,
    metrics_config: MetricsConfig,
    config: OrchestratorConfig,
}

impl WalkForwardOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set split configuration.
    pub fn with_split_config(mut self, config: SplitConfig) -> Self {
        self.split_config = config;
        self
    }

    /// Set combination policy.
    pub fn with_combiner_config(mut self, config: CombinerConfig) -> Self {
        self.combiner_config = config;
        self
    }

    /// Set execution and cost configuration.
    pub fn with_execution_config(mut self, config: ExecutionConfig) -> Self {
        self.execution_config = config;
        self
    }

    pub fn with_metrics_config(mut self, config: MetricsConfig) -> Self {
        self.metrics_config = config;
        self
    }

    /// Set retry and flattening behaviour.
    pub fn with_orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn split_config(&self) -> &SplitConfig {
        &self.split_config
    }

    /// Check every component configuration before any work starts.
    pub fn validate(&self) -> EngineResult<()> {
        self.split_config.validate()?;
        if self.split_config.step < self.split_config.test_len {
            return Err(EngineError::config(format!(
                "step ({}) shorter than test_len ({}) would evaluate periods twice",
                self.split_config.step, self.split_config.test_len
            )));
        }
        self.combiner_config.validate()?;
        self.execution_config.validate()?;
        self.metrics_config.validate()?;
        Ok(())
    }

    /// Evaluate one instrument across every split.
    ///
    /// Configuration errors are returned before any window runs. Window
    /// failures are recorded and the run continues. Setting `cancel` stops
    /// the run at the next window boundary.
    pub fn run(
        &self,
        series: &TimeSeries,
        trainer: &dyn ModelTrainer,
        cancel: &AtomicBool,
    ) -> EngineResult<WalkForwardRecord> {
        self.validate()?;
        let splits = WalkForwardSplits::new(self.split_config.clone(), &series.timestamps())?;
        let expected = splits.expected_splits();

        info!(
            "Generated {} walk-forward windows for {} ({} periods, policy {})",
            expected,
            series.instrument,
            series.len(),
            self.combiner_config.policy.name()
        );

        let mut simulator = ExecutionSimulator::new(self.execution_config.clone(), &series.instrument)?;
        let mut windows = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = false;

        for split in &splits {
            if cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }

            info!(
                "Processing window {}/{}: train {} to {}, test {} to {}",
                split.split_num,
                expected,
                split.train.start,
                split.train.end,
                split.test.start,
                split.test.end
            );

            let mut window_sim = simulator.clone();
            match self.run_window(series, trainer, &split, &mut window_sim) {
                Ok(window) => {
                    if cancel.load(Ordering::SeqCst) {
                        cancelled = true;
                        break;
                    }
                    info!(
                        "  Window {}/{} complete: return {:.2}%, Sharpe {:.2}, {} trades",
                        split.split_num,
                        expected,
                        window.metrics.total_return * 100.0,
                        window.metrics.sharpe_ratio,
                        window.trades.len()
                    );
                    simulator = window_sim;
                    windows.push(window);
                }
                Err(err) => {
                    warn!(
                        "  Window {}/{} failed for {}: {}",
                        split.split_num, expected, series.instrument, err
                    );
                    failures.push(WindowFailure::new(&split, &err));
                }
            }
        }

        if cancelled {
            info!(
                "Run for {} cancelled after {} windows",
                series.instrument,
                windows.len() + failures.len()
            );
        }

        let result = simulator.finish();
        let aggregate = if windows.is_empty() {
            None
        } else {
            Some(MetricsCalculator::calculate(
                &result.equity_curve,
                &result.trades,
                &self.metrics_config,
            )?)
        };

        Ok(WalkForwardRecord {
            instrument: series.instrument.clone(),
            policy: self.combiner_config.policy.name().to_string(),
            expected_windows: expected,
            partial: !failures.is_empty(),
            windows,
            failures,
            equity_curve: result.equity_curve,
            trades: result.trades,
            open_position: result.open_position,
            aggregate,
            cancelled,
        })
    }

    /// Evaluate independent instruments in parallel.
    ///
    /// Results come back in job order; `on_done` fires as each finishes.
    pub fn run_many<F>(
        &self,
        jobs: &[InstrumentJob<'_>],
        cancel: &AtomicBool,
        on_done: F,
    ) -> Vec<EngineResult<WalkForwardRecord>>
    where
        F: Fn(&str) + Sync,
    {
        jobs.par_iter()
            .map(|job| {
                let result = self.run(job.series, job.trainer, cancel);
                on_done(&job.series.instrument);
                result
            })
            .collect()
    }

    fn run_window(
        &self,
        series: &TimeSeries,
        trainer: &dyn ModelTrainer,
        split: &Split,
        simulator: &mut ExecutionSimulator,
    ) -> EngineResult<WindowResult> {
        let records = series.records();
        let train = &records[split.train.range.clone()];

        let ensemble = self.with_retry("train", || {
            trainer.train(&series.instrument, &series.feature_names, train)
        })?;
        if ensemble.models.is_empty() {
            return Err(EngineError::insufficient("trained models", 1, 0));
        }
        let combiner = SignalCombiner::new(self.combiner_config.build(&ensemble)?);

        let trade_offset = simulator.trades().len();
        let point_offset = simulator.equity_curve().len();
        let gated_before = simulator.gated_signals();
        let start_equity = simulator.equity_curve().final_equity();

        // Models see history up to the period being scored; that period's
        // forward return stays hidden until after it is simulated.
        let mut history: Vec<Record> = records[..split.test.range.start].to_vec();
        for record in &records[split.test.range.clone()] {
            let mut current = record.clone();
            let realized = current.realized_return.take();
            history.push(current);

            let predictions = ensemble
                .models
                .iter()
                .map(|model| {
                    self.with_retry(model.id(), || model.predict(&series.instrument, &history))
                })
                .collect::<EngineResult<Vec<_>>>()?;

            let signal = combiner.combine(&predictions)?;
            if signal.timestamp != record.timestamp {
                return Err(EngineError::alignment(format!(
                    "{}: predictions for {} returned while scoring {}",
                    series.instrument, signal.timestamp, record.timestamp
                )));
            }
            simulator.step(&signal, record.price)?;

            if let Some(last) = history.last_mut() {
                last.realized_return = realized;
            }
        }

        if self.config.flatten_at_window_end {
            if let Some(last) = records[split.test.range.clone()].last() {
                simulator.close_out(last.timestamp, last.price)?;
            }
        }

        let mut equity_curve = EquityCurve::new(start_equity);
        for point in &simulator.equity_curve().points()[point_offset..] {
            equity_curve.push(point.clone())?;
        }
        let trades = simulator.trades()[trade_offset..].to_vec();
        let metrics = MetricsCalculator::calculate(&equity_curve, &trades, &self.metrics_config)?;

        Ok(WindowResult {
            split: split.clone(),
            total_cost: trades.iter().map(|t| t.cost).sum(),
            trades,
            equity_curve,
            metrics,
            gated_signals: simulator.gated_signals() - gated_before,
        })
    }

    /// Call an external collaborator, retrying `External` failures with
    /// exponential backoff. Other error kinds are returned immediately.
    fn with_retry<T>(
        &self,
        what: &str,
        mut call: impl FnMut() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut attempt: u32 = 0;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(EngineError::External(msg)) if attempt < self.config.max_retries => {
                    let delay = self.config.backoff_ms.saturating_mul(1u64 << attempt.min(16));
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {} ms",
                        what,
                        attempt + 1,
                        self.config.max_retries + 1,
                        msg,
                        delay
                    );
                    if delay > 0 {
                        thread::sleep(Duration::from_millis(delay));
                    }
                    attempt += 1;
                }
                Err(EngineError::External(msg)) => {
                    return Err(EngineError::External(format!(
                        "{} failed after {} attempts: {}",
                        what,
                        attempt + 1,
                        msg
                    )))
                }
                Err(other) => return Err(other),
            }
        }
    }
}
