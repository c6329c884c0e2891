//! Drift detection and retrain triggering.
//!
//! Watches a live stream of (features, prediction, outcome) tuples per
//! instrument and decides when the models need retraining.

pub mod detectors;
pub mod monitor;

pub use detectors::{ks_two_sample, welch_t_test, DriftTest, RingBuffer};
pub use monitor::{
    Baseline, DriftConfig, DriftMonitor, DriftRegistry, DriftReport, DriftState, DriftStatus,
    DriftTrigger, FeatureDiagnostic,
};
