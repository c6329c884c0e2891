//! Dataset loader for JSON files produced by the external pipeline.
//!
//! A dataset file holds, per instrument, the feature names, the period
//! records (price, features, realized forward return) and the predictions
//! emitted by each externally trained model:
//!
//! ```json
//! {
//!   "instruments": [{
//!     "instrument": "SPY",
//!     "feature_names": ["rsi_14", "vol_20"],
//!     "models": [{"id": "gbm", "kind": "tree_ensemble"}],
//!     "records": [{"timestamp": "2024-01-02T00:00:00Z", "price": "472.65",
//!                  "features": [55.1, 0.12], "realized_return": 0.004}],
//!     "predictions": [{"timestamp": "2024-01-02T00:00:00Z", "model_id": "gbm",
//!                      "label": "up", "probability": 0.71}]
//!   }]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ensemble::ModelKind;
use crate::error::EngineError;

use super::types::{ClassLabel, Prediction, Record, TimeSeries, Timestamp};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data: {0}")]
    InvalidData(#[from] EngineError),
}

/// Declared model in a dataset file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    #[serde(default)]
    pub kind: ModelKind,
}

/// A prediction row as stored on disk (instrument implied by the parent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRow {
    pub timestamp: Timestamp,
    pub model_id: String,
    pub label: ClassLabel,
    pub probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawInstrument {
    instrument: String,
    #[serde(default)]
    feature_names: Vec<String>,
    #[serde(default)]
    models: Vec<ModelSpec>,
    records: Vec<Record>,
    #[serde(default)]
    predictions: Vec<PredictionRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDataset {
    instruments: Vec<RawInstrument>,
}

/// Validated data for one instrument.
#[derive(Debug, Clone)]
pub struct InstrumentData {
    pub series: TimeSeries,
    pub models: Vec<ModelSpec>,
    pub predictions: Vec<Prediction>,
}

/// One (features, prediction, realized outcome) tuple fed to the drift monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub instrument: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub features: Vec<f64>,
    pub predicted: ClassLabel,
    pub realized_return: f64,
}

/// Reads dataset and observation files from disk.
pub struct DataLoader {
    path: PathBuf,
}

impl DataLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read(&self) -> Result<String, LoaderError> {
        if !self.path.exists() {
            return Err(LoaderError::FileNotFound(self.path.clone()));
        }
        Ok(fs::read_to_string(&self.path)?)
    }

    /// Load and validate every instrument in a dataset file.
    pub fn load_dataset(&self) -> Result<Vec<InstrumentData>, LoaderError> {
        let raw: RawDataset = serde_json::from_str(&self.read()?)?;
        raw.instruments.into_iter().map(Self::validate).collect()
    }

    /// Load a drift replay stream, in file order.
    pub fn load_observations(&self) -> Result<Vec<Observation>, LoaderError> {
        Ok(serde_json::from_str(&self.read()?)?)
    }

    fn validate(raw: RawInstrument) -> Result<InstrumentData, LoaderError> {
        let series = TimeSeries::new(&raw.instrument, raw.feature_names, raw.records)?;

        let mut models = raw.models;
        // Models referenced only by predictions default to tree ensembles.
        for row in &raw.predictions {
            if !models.iter().any(|m| m.id == row.model_id) {
                models.push(ModelSpec {
                    id: row.model_id.clone(),
                    kind: ModelKind::default(),
                });
            }
        }

        let predictions = raw
            .predictions
            .into_iter()
            .map(|row| {
                if !(0.0..=1.0).contains(&row.probability) {
                    return Err(EngineError::alignment(format!(
                        "{}: probability {} out of range for model {} at {}",
                        raw.instrument, row.probability, row.model_id, row.timestamp
                    )));
                }
                Ok(Prediction::new(
                    row.timestamp,
                    &raw.instrument,
                    &row.model_id,
                    row.label,
                    row.probability,
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(InstrumentData {
            series,
            models,
            predictions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "instruments": [{
            "instrument": "SPY",
            "feature_names": ["rsi"],
            "records": [
                {"timestamp": "2024-01-02T00:00:00Z", "price": "100.0", "features": [50.0], "realized_return": 0.01},
                {"timestamp": "2024-01-03T00:00:00Z", "price": "101.0", "features": [55.0]}
            ],
            "predictions": [
                {"timestamp": "2024-01-02T00:00:00Z", "model_id": "gbm", "label": "up", "probability": 0.7}
            ]
        }]
    }"#;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("signal_edge_{}_{}", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_dataset() {
        let path = write_temp("dataset.json", SAMPLE);
        let data = DataLoader::new(&path).load_dataset().unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(data.len(), 1);
        assert_eq!(data[0].series.len(), 2);
        assert_eq!(data[0].models.len(), 1);
        assert_eq!(data[0].models[0].kind, ModelKind::TreeEnsemble);
        assert_eq!(data[0].predictions[0].instrument, "SPY");
    }

    #[test]
    fn test_rejects_bad_probability() {
        let path = write_temp("bad.json", &SAMPLE.replace("0.7", "1.7"));
        let result = DataLoader::new(&path).load_dataset();
        fs::remove_file(&path).ok();
        assert!(matches!(result, Err(LoaderError::InvalidData(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = DataLoader::new("/nonexistent/dataset.json").load_dataset();
        assert!(matches!(result, Err(LoaderError::FileNotFound(_))));
    }

    #[test]
    fn test_load_observations() {
        let path = write_temp(
            "observations.json",
            r#"[
                {"instrument": "SPY", "timestamp": "2024-01-02T00:00:00Z",
                 "features": [0.5, 1.0], "predicted": "up", "realized_return": 0.004},
                {"instrument": "SPY", "timestamp": "2024-01-03T00:00:00Z",
                 "predicted": "down", "realized_return": 0.002}
            ]"#,
        );
        let observations = DataLoader::new(&path).load_observations().unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].predicted, ClassLabel::Up);
        assert!(observations[1].features.is_empty());
    }
}
