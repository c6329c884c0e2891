//! Walk-forward validation module.
//!
//! Rolling (or anchored) train/test splits over a time index, and the
//! orchestrator that trains, scores, combines and simulates each window:
//! - Train: fit models on the train window only
//! - Test: score and trade the following out-of-sample window
//! - Roll: advance by `step` periods

pub mod orchestrator;
pub mod splits;

pub use orchestrator::{
    InstrumentJob, OrchestratorConfig, WalkForwardOrchestrator, WalkForwardRecord,
    WindowFailure, WindowResult,
};
pub use splits::{Split, SplitConfig, SplitIter, WalkForwardSplits, Window, WindowMode};
