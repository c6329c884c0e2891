//! Ensemble layer: model capability seams and the signal combiner.

pub mod combiner;
pub mod models;

pub use combiner::{BlendWeights, CombinationPolicy, CombinerConfig, PolicyKind, SignalCombiner};
pub use models::{
    LinearMetaModel, MetaModel, ModelKind, ModelTrainer, ReplayModel, ReplayTrainer,
    ScoringModel, TrainedEnsemble,
};
