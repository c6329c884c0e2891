//! Model capability seams.
//!
//! Model training and inference live outside the core. The core only sees
//! them through these traits: a trainer that fits on a train window and hands
//! back scoring models, and an optional meta-model for stacking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::{ClassLabel, ModelSpec, Prediction, Record, Timestamp};
use crate::error::{EngineError, EngineResult};

/// Family of a scoring model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    TreeEnsemble,
    SequenceModel,
    MetaModel,
}

/// A trained model that scores one period at a time.
pub trait ScoringModel: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ModelKind;

    /// Predict for the last record in `history`.
    ///
    /// `history` never extends past the period being scored.
    fn predict(&self, instrument: &str, history: &[Record]) -> EngineResult<Prediction>;
}

/// Meta-model used by the stacking policy.
pub trait MetaModel: Send + Sync {
    /// Probability of an upward move given per-model up-probabilities,
    /// ordered by model id.
    fn predict_proba(&self, features: &[f64]) -> f64;

    /// Number of features the model was fitted on, when fixed.
    fn width(&self) -> Option<usize> {
        None
    }
}

/// Output of a training run on one train window.
pub struct TrainedEnsemble {
    pub models: Vec<Box<dyn ScoringModel>>,
    pub meta_model: Option<Arc<dyn MetaModel>>,
    /// Historical directional accuracy per model id, measured on the train window.
    pub accuracy: BTreeMap<String, f64>,
}

/// Fits models on a train window.
pub trait ModelTrainer: Send + Sync {
    /// `train` contains only the train window's records.
    fn train(
        &self,
        instrument: &str,
        feature_names: &[String],
        train: &[Record],
    ) -> EngineResult<TrainedEnsemble>;
}

/// Logistic meta-model over per-model up-probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearMetaModel {
    pub coefficients: Vec<f64>,
    #[serde(default)]
    pub intercept: f64,
}

impl LinearMetaModel {
    pub fn new(coefficients: Vec<f64>, intercept: f64) -> Self {
        Self {
            coefficients,
            intercept,
        }
    }
}

impl MetaModel for LinearMetaModel {
    fn predict_proba(&self, features: &[f64]) -> f64 {
        let z = self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>();
        1.0 / (1.0 + (-z).exp())
    }

    fn width(&self) -> Option<usize> {
        Some(self.coefficients.len())
    }
}

type PredictionBook = HashMap<String, BTreeMap<Timestamp, Prediction>>;

/// Replays predictions produced by an external pipeline.
pub struct ReplayModel {
    id: String,
    kind: ModelKind,
    book: Arc<PredictionBook>,
}

impl ScoringModel for ReplayModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn predict(&self, instrument: &str, history: &[Record]) -> EngineResult<Prediction> {
        let current = history
            .last()
            .ok_or_else(|| EngineError::insufficient("scoring history", 1, 0))?;

        self.book
            .get(&self.id)
            .and_then(|by_ts| by_ts.get(&current.timestamp))
            .filter(|p| p.instrument == instrument)
            .cloned()
            .ok_or_else(|| {
                EngineError::alignment(format!(
                    "{}: no prediction from model {} at {}",
                    instrument, self.id, current.timestamp
                ))
            })
    }
}

/// Trainer that hands out [`ReplayModel`]s and measures their accuracy on
/// the train window.
pub struct ReplayTrainer {
    models: Vec<ModelSpec>,
    book: Arc<PredictionBook>,
    meta_model: Option<Arc<dyn MetaModel>>,
    flat_band: f64,
}

impl ReplayTrainer {
    pub fn new(models: Vec<ModelSpec>, predictions: Vec<Prediction>) -> Self {
        let mut book: PredictionBook = HashMap::new();
        for prediction in predictions {
            book.entry(prediction.model_id.clone())
                .or_default()
                .insert(prediction.timestamp, prediction);
        }

        Self {
            models,
            book: Arc::new(book),
            meta_model: None,
            flat_band: 0.0,
        }
    }

    pub fn with_meta_model(mut self, meta_model: Arc<dyn MetaModel>) -> Self {
        self.meta_model = Some(meta_model);
        self
    }

    pub fn with_flat_band(mut self, flat_band: f64) -> Self {
        self.flat_band = flat_band;
        self
    }

    fn accuracy(&self, model_id: &str, train: &[Record]) -> Option<f64> {
        let by_ts = self.book.get(model_id)?;
        let (hits, total) = train
            .iter()
            .filter_map(|r| Some((by_ts.get(&r.timestamp)?, r.realized_return?)))
            .fold((0usize, 0usize), |(hits, total), (p, realized)| {
                let hit = p.label == ClassLabel::of_return(realized, self.flat_band);
                (hits + hit as usize, total + 1)
            });

        (total > 0).then(|| hits as f64 / total as f64)
    }
}

impl ModelTrainer for ReplayTrainer {
    fn train(
        &self,
        instrument: &str,
        _feature_names: &[String],
        train: &[Record],
    ) -> EngineResult<TrainedEnsemble> {
        if self.models.is_empty() {
            return Err(EngineError::config(format!(
                "{}: no models declared for replay",
                instrument
            )));
        }

        let mut accuracy = BTreeMap::new();
        let mut models: Vec<Box<dyn ScoringModel>> = Vec::with_capacity(self.models.len());

        for spec in &self.models {
            if let Some(acc) = self.accuracy(&spec.id, train) {
                accuracy.insert(spec.id.clone(), acc);
            }
            models.push(Box::new(ReplayModel {
                id: spec.id.clone(),
                kind: spec.kind,
                book: Arc::clone(&self.book),
            }));
        }

        Ok(TrainedEnsemble {
            models,
            meta_model: self.meta_model.clone(),
            accuracy,
        })
    }
}
