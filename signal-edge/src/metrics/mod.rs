//! Performance metrics module.
//!
//! Provides the headline performance calculations:
//! - Total return, Sharpe ratio
//! - Maximum drawdown
//! - Win rate, profit factor

pub mod calculator;

pub use calculator::{MetricsCalculator, MetricsConfig, PerformanceMetrics};
