//! Performance metrics calculator.
//!
//! Reduces an equity curve and trade ledger to the headline statistics.
//! Pure: the same inputs always give the same record.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::backtest::{EquityCurve, Trade};
use crate::error::{EngineError, EngineResult};

/// Settings for return annualization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Annual risk-free rate (e.g., 0.02 = 2%).
    #[serde(default)]
    pub risk_free_rate: f64,
    /// Periods per year used to annualize (252 for daily bars).
    pub periods_per_year: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            periods_per_year: 252.0,
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.periods_per_year.is_nan() || self.periods_per_year <= 0.0 {
            return Err(EngineError::config(format!(
                "periods_per_year must be positive, got {}",
                self.periods_per_year
            )));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(EngineError::config("risk_free_rate must be finite"));
        }
        Ok(())
    }
}

/// Headline performance statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Final equity / initial equity - 1.
    pub total_return: f64,
    /// Annualized Sharpe ratio of per-period returns.
    pub sharpe_ratio: f64,
    /// Largest peak-to-trough decline as a fraction of the peak.
    pub max_drawdown: f64,
    /// Fraction of closing trades with positive realized P&L.
    pub win_rate: f64,
    /// Gross profit / gross loss over closing trades. Infinite when every
    /// closing trade won; written as `"inf"` since JSON has no infinity.
    #[serde(with = "non_finite")]
    pub profit_factor: f64,
    /// Ledger length (opening and closing trades).
    pub trade_count: usize,
}

impl PerformanceMetrics {
    /// Generate a summary report.
    pub fn summary(&self) -> String {
        format!(
            "Performance Summary\n\
             ====================\n\
             Total Return: {:.2}%\n\
             Sharpe Ratio: {:.2}\n\
             Max Drawdown: {:.2}%\n\
             Win Rate: {:.1}%\n\
             Profit Factor: {:.2}\n\
             Trades: {}",
            self.total_return * 100.0,
            self.sharpe_ratio,
            self.max_drawdown * 100.0,
            self.win_rate * 100.0,
            self.profit_factor,
            self.trade_count,
        )
    }
}

/// Serde for ratios that may be infinite: finite values stay numbers,
/// others become the strings `"inf"`, `"-inf"` or `"nan"`.
mod non_finite {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if *value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                "nan" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid ratio: {}", other))),
            },
        }
    }
}

/// Metrics calculator.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate all metrics from an equity curve and its ledger.
    pub fn calculate(
        curve: &EquityCurve,
        trades: &[Trade],
        config: &MetricsConfig,
    ) -> EngineResult<PerformanceMetrics> {
        config.validate()?;

        // One point per period; the starting equity is not a period.
        if curve.len() < 2 {
            return Err(EngineError::insufficient("equity curve", 2, curve.len()));
        }

        let values = curve.values();

        let initial = values[0];
        let final_eq = values[values.len() - 1];
        let total_return = if initial > 0.0 {
            final_eq / initial - 1.0
        } else {
            0.0
        };

        let returns = Self::period_returns(&values);
        let sharpe_ratio = Self::sharpe_ratio(&returns, config);
        let max_drawdown = Self::max_drawdown(&values);

        let closing: Vec<&Trade> = trades.iter().filter(|t| t.is_close()).collect();
        let win_rate = if closing.is_empty() {
            0.0
        } else {
            closing.iter().filter(|t| t.is_winner()).count() as f64 / closing.len() as f64
        };

        let gross_profit: Decimal = closing
            .iter()
            .map(|t| t.pnl())
            .filter(|p| *p > Decimal::ZERO)
            .sum();
        let gross_loss: Decimal = closing
            .iter()
            .map(|t| t.pnl())
            .filter(|p| *p < Decimal::ZERO)
            .sum();

        Ok(PerformanceMetrics {
            total_return,
            sharpe_ratio,
            max_drawdown,
            win_rate,
            profit_factor: Self::profit_factor(gross_profit, gross_loss),
            trade_count: trades.len(),
        })
    }

    /// Simple per-period returns between consecutive equity values.
    pub fn period_returns(values: &[f64]) -> Vec<f64> {
        values
            .windows(2)
            .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
            .collect()
    }

    /// Annualized Sharpe ratio using the population standard deviation.
    fn sharpe_ratio(returns: &[f64], config: &MetricsConfig) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }

        let rf = config.risk_free_rate / config.periods_per_year;
        let excess: Vec<f64> = returns.iter().map(|r| r - rf).collect();
        let mean = excess.iter().mean();
        let std_dev = excess.iter().population_std_dev();

        if std_dev == 0.0 || !std_dev.is_finite() {
            return 0.0;
        }

        mean / std_dev * config.periods_per_year.sqrt()
    }

    /// Largest decline from a running peak, as a fraction of that peak.
    fn max_drawdown(values: &[f64]) -> f64 {
        let mut peak = f64::MIN;
        let mut max_dd = 0.0_f64;

        for &value in values {
            if value > peak {
                peak = value;
            } else if peak > 0.0 {
                max_dd = max_dd.max((peak - value) / peak);
            }
        }

        max_dd
    }

    /// Profit factor; `gross_loss` is negative or zero.
    fn profit_factor(gross_profit: Decimal, gross_loss: Decimal) -> f64 {
        let loss: f64 = gross_loss.abs().try_into().unwrap_or(0.0);
        let profit: f64 = gross_profit.try_into().unwrap_or(0.0);
        if loss == 0.0 {
            return if profit > 0.0 { f64::INFINITY } else { 0.0 };
        }
        profit / loss
    }
}
