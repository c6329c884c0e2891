//! Data types and dataset loading.

pub mod loader;
pub mod types;

pub use loader::{DataLoader, InstrumentData, LoaderError, ModelSpec, Observation};
pub use types::{
    Action, ClassLabel, CombinedSignal, Prediction, Record, TimeSeries, Timestamp,
};
