//! Walk-forward validation, cost-aware execution simulation, ensemble signal
//! combination and drift monitoring for ML trading signals.

pub mod backtest;
pub mod config;
pub mod data;
pub mod drift;
pub mod ensemble;
pub mod error;
pub mod metrics;
pub mod walkforward;

// Re-export commonly used types
pub use backtest::{CostModel, EquityCurve, ExecutionConfig, ExecutionSimulator, Position, Trade};
pub use config::{ConfigError, EngineConfig};
pub use data::{Action, ClassLabel, CombinedSignal, DataLoader, Prediction, Record, TimeSeries};
pub use drift::{DriftConfig, DriftMonitor, DriftRegistry, DriftStatus};
pub use ensemble::{CombinationPolicy, ModelTrainer, ScoringModel, SignalCombiner};
pub use error::{EngineError, EngineResult};
pub use metrics::{MetricsCalculator, PerformanceMetrics};
pub use walkforward::{SplitConfig, WalkForwardOrchestrator, WalkForwardRecord, WalkForwardSplits};
