//! Ensemble signal combiner.
//!
//! Reduces a set of per-model predictions for one (timestamp, instrument)
//! to a single [`CombinedSignal`]. Predictions are put in a canonical order
//! before any arithmetic, so every policy gives bit-identical output for any
//! permutation of its input.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::{Action, ClassLabel, CombinedSignal, Prediction};
use crate::error::{EngineError, EngineResult};

use super::models::{LinearMetaModel, MetaModel, TrainedEnsemble};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Caller-supplied blending weights keyed by model id.
///
/// Construction checks the weights are finite, non-negative and sum to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendWeights(BTreeMap<String, f64>);

impl BlendWeights {
    pub fn new(weights: BTreeMap<String, f64>) -> EngineResult<Self> {
        if weights.is_empty() {
            return Err(EngineError::config("blending weights are empty"));
        }
        if let Some((id, w)) = weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(EngineError::config(format!(
                "blending weight for {} is invalid: {}",
                id, w
            )));
        }
        let total: f64 = weights.values().sum();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::config(format!(
                "blending weights must sum to 1, got {:.6}",
                total
            )));
        }
        Ok(Self(weights))
    }

    pub fn get(&self, model_id: &str) -> f64 {
        self.0.get(model_id).copied().unwrap_or(0.0)
    }
}

/// How predictions are reconciled.
#[derive(Clone)]
pub enum CombinationPolicy {
    /// Majority label.
    Voting,
    /// Weighted mean of up-probabilities; equal weights when `None`.
    Blending(Option<BlendWeights>),
    /// Meta-model over up-probabilities ordered by model id.
    Stacking(Arc<dyn MetaModel>),
    /// Mean of up-probabilities weighted by historical accuracy priors.
    BayesianAveraging(BTreeMap<String, f64>),
}

impl CombinationPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Voting => "voting",
            Self::Blending(_) => "blending",
            Self::Stacking(_) => "stacking",
            Self::BayesianAveraging(_) => "bayesian_averaging",
        }
    }
}

impl fmt::Debug for CombinationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voting => write!(f, "Voting"),
            Self::Blending(w) => f.debug_tuple("Blending").field(w).finish(),
            Self::Stacking(_) => write!(f, "Stacking(<meta-model>)"),
            Self::BayesianAveraging(p) => f.debug_tuple("BayesianAveraging").field(p).finish(),
        }
    }
}

/// Stateless combiner; safe to share across threads.
#[derive(Debug, Clone)]
pub struct SignalCombiner {
    policy: CombinationPolicy,
}

impl SignalCombiner {
    pub fn new(policy: CombinationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CombinationPolicy {
        &self.policy
    }

    /// Combine predictions sharing one (timestamp, instrument).
    pub fn combine(&self, predictions: &[Prediction]) -> EngineResult<CombinedSignal> {
        let ordered = canonical_order(predictions)?;
        let first = ordered[0];

        let (action, confidence) = match &self.policy {
            CombinationPolicy::Voting => vote(&ordered),
            CombinationPolicy::Blending(weights) => weighted(&ordered, |p| match weights {
                Some(w) => w.get(&p.model_id),
                None => 1.0,
            }),
            CombinationPolicy::Stacking(meta) => {
                check_meta_width(meta.as_ref(), ordered.len())?;
                let features: Vec<f64> = ordered.iter().map(|p| p.up_probability()).collect();
                let q = meta.predict_proba(&features);
                decide(if q.is_finite() { q.clamp(0.0, 1.0) } else { 0.5 })
            }
            CombinationPolicy::BayesianAveraging(priors) => {
                let usable: Vec<f64> = priors
                    .values()
                    .copied()
                    .filter(|w| w.is_finite() && *w >= 0.0)
                    .collect();
                let fallback = if usable.is_empty() {
                    1.0
                } else {
                    usable.iter().sum::<f64>() / usable.len() as f64
                };
                weighted(&ordered, |p| {
                    priors
                        .get(&p.model_id)
                        .copied()
                        .filter(|w| w.is_finite() && *w >= 0.0)
                        .unwrap_or(fallback)
                })
            }
        };

        let mut confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if ordered.len() == 1 {
            confidence = confidence.min(first.probability);
        }

        Ok(CombinedSignal::new(
            first.timestamp,
            &first.instrument,
            action,
            confidence,
        ))
    }
}

/// Policy selection as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Voting,
    Blending,
    Stacking,
    BayesianAveraging,
}

impl PolicyKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Voting => "voting",
            Self::Blending => "blending",
            Self::Stacking => "stacking",
            Self::BayesianAveraging => "bayesian_averaging",
        }
    }
}

/// Serializable combiner settings, resolved into a [`CombinationPolicy`]
/// once per walk-forward window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinerConfig {
    #[serde(default)]
    pub policy: PolicyKind,
    /// Blending weights by model id (equal weights when absent).
    #[serde(default)]
    pub weights: Option<BTreeMap<String, f64>>,
    /// Stacking meta-model used when the trainer does not supply one.
    #[serde(default)]
    pub meta_model: Option<LinearMetaModel>,
}

impl CombinerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if let Some(weights) = &self.weights {
            BlendWeights::new(weights.clone())?;
        }
        if let Some(meta) = &self.meta_model {
            if meta.coefficients.iter().any(|c| !c.is_finite()) || !meta.intercept.is_finite() {
                return Err(EngineError::config("meta-model coefficients must be finite"));
            }
        }
        Ok(())
    }

    /// Resolve the policy for one window's trained ensemble.
    ///
    /// Bayesian averaging takes its priors from the ensemble's train-window
    /// accuracy; stacking prefers the ensemble's own meta-model.
    pub fn build(&self, ensemble: &TrainedEnsemble) -> EngineResult<CombinationPolicy> {
        match self.policy {
            PolicyKind::Voting => Ok(CombinationPolicy::Voting),
            PolicyKind::Blending => {
                let weights = self.weights.clone().map(BlendWeights::new).transpose()?;
                Ok(CombinationPolicy::Blending(weights))
            }
            PolicyKind::Stacking => {
                let meta: Arc<dyn MetaModel> = match (&ensemble.meta_model, &self.meta_model) {
                    (Some(meta), _) => Arc::clone(meta),
                    (None, Some(linear)) => Arc::new(linear.clone()),
                    (None, None) => {
                        return Err(EngineError::config(
                            "stacking policy requires a meta-model",
                        ))
                    }
                };
                check_meta_width(meta.as_ref(), ensemble.models.len())?;
                Ok(CombinationPolicy::Stacking(meta))
            }
            PolicyKind::BayesianAveraging => {
                Ok(CombinationPolicy::BayesianAveraging(ensemble.accuracy.clone()))
            }
        }
    }
}

/// The meta-model reads one feature per model, so its fitted width must
/// match the number of models exactly.
fn check_meta_width(meta: &dyn MetaModel, models: usize) -> EngineResult<()> {
    match meta.width() {
        Some(width) if width != models => Err(EngineError::config(format!(
            "stacking meta-model expects {} model features, got {}",
            width, models
        ))),
        _ => Ok(()),
    }
}

/// Validate the set and sort it by (model id, label, probability).
fn canonical_order(predictions: &[Prediction]) -> EngineResult<Vec<&Prediction>> {
    let first = predictions
        .first()
        .ok_or_else(|| EngineError::insufficient("prediction set", 1, 0))?;

    for p in predictions {
        if p.timestamp != first.timestamp || p.instrument != first.instrument {
            return Err(EngineError::alignment(format!(
                "prediction set mixes ({}, {}) with ({}, {})",
                first.instrument, first.timestamp, p.instrument, p.timestamp
            )));
        }
        if !(0.0..=1.0).contains(&p.probability) {
            return Err(EngineError::alignment(format!(
                "model {} probability {} outside [0, 1] at {}",
                p.model_id, p.probability, p.timestamp
            )));
        }
    }

    let mut ordered: Vec<&Prediction> = predictions.iter().collect();
    ordered.sort_by(|a, b| {
        a.model_id
            .cmp(&b.model_id)
            .then(a.label.cmp(&b.label))
            .then(a.probability.total_cmp(&b.probability))
    });
    Ok(ordered)
}

fn vote(ordered: &[&Prediction]) -> (Action, f64) {
    let mut tallies: BTreeMap<ClassLabel, (usize, f64)> = BTreeMap::new();
    for p in ordered {
        let entry = tallies.entry(p.label).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += p.probability;
    }

    let mean = |(count, sum): &(usize, f64)| sum / *count as f64;
    let (label, tally) = tallies
        .iter()
        .max_by(|(la, ta), (lb, tb)| {
            ta.0.cmp(&tb.0)
                .then(mean(*ta).total_cmp(&mean(*tb)))
                // Earlier labels win full ties.
                .then(lb.cmp(la))
        })
        .map(|(l, t)| (*l, *t))
        .unwrap_or((ClassLabel::Flat, (0, 0.0)));

    let agreement = tally.0 as f64 / ordered.len() as f64;
    (label.action(), agreement * mean(&tally))
}

fn weighted(ordered: &[&Prediction], weight_of: impl Fn(&Prediction) -> f64) -> (Action, f64) {
    let mut weights: Vec<f64> = ordered
        .iter()
        .map(|p| weight_of(*p))
        .map(|w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
        .collect();
    let mut total: f64 = weights.iter().sum();
    if total <= 0.0 {
        weights = vec![1.0; ordered.len()];
        total = ordered.len() as f64;
    }

    let q = ordered
        .iter()
        .zip(&weights)
        .map(|(p, w)| w * p.up_probability())
        .sum::<f64>()
        / total;
    decide(q)
}

/// Map an up-probability to an action via the 0.5 boundary.
fn decide(q: f64) -> (Action, f64) {
    let action = if q > 0.5 {
        Action::Buy
    } else if q < 0.5 {
        Action::Sell
    } else {
        Action::Hold
    };
    (action, q.max(1.0 - q))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Record, Timestamp};
    use crate::ensemble::{ModelKind, ScoringModel};
    use chrono::{TimeZone, Utc};

    fn ts() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap()
    }

    fn pred(model: &str, label: ClassLabel, p: f64) -> Prediction {
        Prediction::new(ts(), "ETH", model, label, p)
    }

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_voting_majority() {
        let combiner = SignalCombiner::new(CombinationPolicy::Voting);
        let signal = combiner
            .combine(&[
                pred("a", ClassLabel::Up, 0.8),
                pred("b", ClassLabel::Up, 0.6),
                pred("c", ClassLabel::Down, 0.9),
            ])
            .unwrap();

        assert_eq!(signal.action, Action::Buy);
        // 2/3 agree, mean probability 0.7
        assert!((signal.confidence - 2.0 / 3.0 * 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_voting_tie_broken_by_mean_probability() {
        let combiner = SignalCombiner::new(CombinationPolicy::Voting);
        let signal = combiner
            .combine(&[
                pred("a", ClassLabel::Up, 0.6),
                pred("b", ClassLabel::Down, 0.9),
            ])
            .unwrap();
        assert_eq!(signal.action, Action::Sell);
        assert!((signal.confidence - 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_voting_order_independent() {
        let combiner = SignalCombiner::new(CombinationPolicy::Voting);
        let mut preds = vec![
            pred("m1", ClassLabel::Up, 0.71),
            pred("m2", ClassLabel::Down, 0.64),
            pred("m3", ClassLabel::Up, 0.93),
            pred("m4", ClassLabel::Flat, 0.55),
            pred("m5", ClassLabel::Up, 0.51),
            pred("m6", ClassLabel::Down, 0.88),
        ];
        let expected = combiner.combine(&preds).unwrap();

        for rotation in 0..preds.len() {
            preds.rotate_left(1);
            let got = combiner.combine(&preds).unwrap();
            assert_eq!(got, expected, "rotation {}", rotation);
            assert_eq!(got.confidence.to_bits(), expected.confidence.to_bits());
        }
        preds.reverse();
        assert_eq!(combiner.combine(&preds).unwrap(), expected);
    }

    #[test]
    fn test_blending_equal_weights() {
        let combiner = SignalCombiner::new(CombinationPolicy::Blending(None));
        let signal = combiner
            .combine(&[
                pred("a", ClassLabel::Up, 0.8),
                pred("b", ClassLabel::Down, 0.6),
            ])
            .unwrap();
        // up-probabilities 0.8 and 0.4 -> 0.6
        assert_eq!(signal.action, Action::Buy);
        assert!((signal.confidence - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_blending_custom_weights() {
        let w = BlendWeights::new(weights(&[("a", 0.25), ("b", 0.75)])).unwrap();
        let combiner = SignalCombiner::new(CombinationPolicy::Blending(Some(w)));
        let signal = combiner
            .combine(&[
                pred("a", ClassLabel::Up, 0.875),
                pred("b", ClassLabel::Down, 0.625),
            ])
            .unwrap();
        // 0.25 * 0.875 + 0.75 * 0.375 = 0.5
        assert_eq!(signal.action, Action::Hold);
        assert!((signal.confidence - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_blend_weights_must_sum_to_one() {
        let result = BlendWeights::new(weights(&[("a", 0.5), ("b", 0.6)]));
        assert!(matches!(result, Err(EngineError::Configuration(_))));

        let result = BlendWeights::new(weights(&[("a", 1.5), ("b", -0.5)]));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_stacking_uses_model_id_order() {
        // Weight only the first model in id order ("a").
        let meta = LinearMetaModel::new(vec![10.0, 0.0], -5.0);
        let combiner = SignalCombiner::new(CombinationPolicy::Stacking(Arc::new(meta)));

        let signal = combiner
            .combine(&[
                pred("b", ClassLabel::Up, 0.9),
                pred("a", ClassLabel::Down, 0.9),
            ])
            .unwrap();
        // a's up-probability 0.1 -> z = -4
        assert_eq!(signal.action, Action::Sell);
        assert!(signal.confidence > 0.98);
    }

    #[test]
    fn test_stacking_rejects_width_mismatch() {
        // Fitted on one model; the other two would be silently ignored.
        let meta = LinearMetaModel::new(vec![10.0], -5.0);
        let combiner = SignalCombiner::new(CombinationPolicy::Stacking(Arc::new(meta)));

        let result = combiner.combine(&[
            pred("a", ClassLabel::Up, 0.9),
            pred("b", ClassLabel::Down, 0.99),
            pred("c", ClassLabel::Down, 0.99),
        ]);
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_bayesian_normalizes_priors() {
        let priors = weights(&[("a", 0.9), ("b", 0.3)]);
        let combiner = SignalCombiner::new(CombinationPolicy::BayesianAveraging(priors));
        let signal = combiner
            .combine(&[
                pred("a", ClassLabel::Up, 0.7),
                pred("b", ClassLabel::Down, 0.9),
            ])
            .unwrap();
        // (0.9 * 0.7 + 0.3 * 0.1) / 1.2 = 0.55
        assert_eq!(signal.action, Action::Buy);
        assert!((signal.confidence - 0.55).abs() < 1e-12);
    }

    #[test]
    fn test_bayesian_without_priors_is_equal_weight() {
        let combiner = SignalCombiner::new(CombinationPolicy::BayesianAveraging(BTreeMap::new()));
        let signal = combiner
            .combine(&[
                pred("a", ClassLabel::Up, 0.8),
                pred("b", ClassLabel::Up, 0.6),
            ])
            .unwrap();
        assert!((signal.confidence - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_single_prediction_caps_confidence() {
        for policy in [
            CombinationPolicy::Voting,
            CombinationPolicy::Blending(None),
            CombinationPolicy::BayesianAveraging(weights(&[("a", 0.6)])),
            CombinationPolicy::Stacking(Arc::new(LinearMetaModel::new(vec![20.0], -10.0))),
        ] {
            let combiner = SignalCombiner::new(policy);
            let signal = combiner.combine(&[pred("a", ClassLabel::Up, 0.7)]).unwrap();
            assert_eq!(signal.action, Action::Buy);
            assert!(signal.confidence <= 0.7);
        }
    }

    #[test]
    fn test_rejects_malformed_sets() {
        let combiner = SignalCombiner::new(CombinationPolicy::Voting);
        assert!(matches!(
            combiner.combine(&[]),
            Err(EngineError::InsufficientData { .. })
        ));

        let mut other = pred("b", ClassLabel::Up, 0.6);
        other.instrument = "BTC".to_string();
        assert!(matches!(
            combiner.combine(&[pred("a", ClassLabel::Up, 0.6), other]),
            Err(EngineError::Alignment(_))
        ));

        assert!(matches!(
            combiner.combine(&[pred("a", ClassLabel::Up, f64::NAN)]),
            Err(EngineError::Alignment(_))
        ));
    }

    struct Unscored(&'static str);

    impl ScoringModel for Unscored {
        fn id(&self) -> &str {
            self.0
        }

        fn kind(&self) -> ModelKind {
            ModelKind::TreeEnsemble
        }

        fn predict(&self, _instrument: &str, _history: &[Record]) -> EngineResult<Prediction> {
            Err(EngineError::External(format!("{} is not scored here", self.0)))
        }
    }

    fn ensemble(meta: Option<Arc<dyn MetaModel>>) -> TrainedEnsemble {
        TrainedEnsemble {
            models: vec![Box::new(Unscored("a")), Box::new(Unscored("b"))],
            meta_model: meta,
            accuracy: weights(&[("a", 0.6), ("b", 0.7)]),
        }
    }

    #[test]
    fn test_config_builds_policies() {
        let config = CombinerConfig {
            policy: PolicyKind::BayesianAveraging,
            ..Default::default()
        };
        match config.build(&ensemble(None)).unwrap() {
            CombinationPolicy::BayesianAveraging(priors) => assert_eq!(priors.len(), 2),
            other => panic!("unexpected policy {:?}", other),
        }

        let config = CombinerConfig {
            policy: PolicyKind::Blending,
            weights: Some(weights(&[("a", 0.25), ("b", 0.75)])),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.build(&ensemble(None)).unwrap().name(), "blending");
    }

    #[test]
    fn test_config_stacking_needs_meta_model() {
        let config = CombinerConfig {
            policy: PolicyKind::Stacking,
            ..Default::default()
        };
        assert!(matches!(
            config.build(&ensemble(None)),
            Err(EngineError::Configuration(_))
        ));

        let from_trainer: Arc<dyn MetaModel> =
            Arc::new(LinearMetaModel::new(vec![1.0, 1.0], 0.0));
        assert!(config.build(&ensemble(Some(from_trainer))).is_ok());

        let with_linear = CombinerConfig {
            meta_model: Some(LinearMetaModel::new(vec![1.0, 1.0], -1.0)),
            ..config.clone()
        };
        assert!(with_linear.build(&ensemble(None)).is_ok());

        // Two models in the ensemble, three coefficients in the meta-model.
        let too_wide = CombinerConfig {
            meta_model: Some(LinearMetaModel::new(vec![1.0, 1.0, 1.0], -1.0)),
            ..config
        };
        assert!(matches!(
            too_wide.build(&ensemble(None)),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_rejects_bad_weights() {
        let config = CombinerConfig {
            policy: PolicyKind::Blending,
            weights: Some(weights(&[("a", 0.5), ("b", 0.6)])),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(config.build(&ensemble(None)).is_err());
    }
}
