//! Drift monitor and retrain-trigger state machine.
//!
//! Two detectors feed one status per instrument:
//! - distributional drift: recent feature values vs the training reference
//! - concept drift: rolling directional accuracy of the live predictions
//!
//! | From             | Condition                                   | To               |
//! |------------------|---------------------------------------------|------------------|
//! | Healthy          | either detector flags                       | Degraded         |
//! | Degraded         | same detector flagged `debounce` times      | RetrainTriggered |
//! | any but terminal | accuracy below `emergency_floor`            | RetrainTriggered |
//! | Degraded         | both detectors clear                        | Healthy          |
//! | RetrainTriggered | `acknowledge_retrain` only                  | Healthy          |

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data::{ClassLabel, Observation, Timestamp};
use crate::error::{EngineError, EngineResult};

use super::detectors::{DriftTest, RingBuffer};

/// Configuration for drift detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Recent feature values compared against the reference.
    pub window_features: usize,
    /// Outcomes in the rolling accuracy window.
    pub window_outcomes: usize,
    /// A feature is flagged when its p-value falls below this.
    pub significance: f64,
    /// Instrument-level feature drift when the flagged fraction exceeds this.
    #[serde(default)]
    pub max_flagged_fraction: f64,
    /// Concept drift when rolling accuracy falls below this.
    pub accuracy_floor: f64,
    /// Immediate retrain when rolling accuracy falls below this.
    pub emergency_floor: f64,
    /// Consecutive flagged evaluations before a retrain is triggered.
    pub debounce: usize,
    /// Returns within ±flat_band count as Flat outcomes.
    #[serde(default)]
    pub flat_band: f64,
    #[serde(default)]
    pub test: DriftTest,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window_features: 30,
            window_outcomes: 30,
            significance: 0.05,
            max_flagged_fraction: 0.0,
            accuracy_floor: 0.55,
            emergency_floor: 0.45,
            debounce: 3,
            flat_band: 0.0,
            test: DriftTest::KolmogorovSmirnov,
        }
    }
}

impl DriftConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.window_features == 0 || self.window_outcomes == 0 {
            return Err(EngineError::config("drift windows must be positive"));
        }
        if !(self.significance > 0.0 && self.significance < 1.0) {
            return Err(EngineError::config(format!(
                "significance must be in (0, 1), got {}",
                self.significance
            )));
        }
        if !(0.0..1.0).contains(&self.max_flagged_fraction) {
            return Err(EngineError::config(format!(
                "max_flagged_fraction must be in [0, 1), got {}",
                self.max_flagged_fraction
            )));
        }
        let unit = 0.0..=1.0;
        if !unit.contains(&self.accuracy_floor) || !unit.contains(&self.emergency_floor) {
            return Err(EngineError::config("accuracy floors must be in [0, 1]"));
        }
        if self.emergency_floor > self.accuracy_floor {
            return Err(EngineError::config(format!(
                "emergency_floor ({}) above accuracy_floor ({})",
                self.emergency_floor, self.accuracy_floor
            )));
        }
        if self.debounce == 0 {
            return Err(EngineError::config("debounce must be at least 1"));
        }
        if self.flat_band.is_nan() || self.flat_band < 0.0 {
            return Err(EngineError::config("flat_band must be non-negative"));
        }
        Ok(())
    }
}

/// Monitor status for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    #[default]
    Healthy,
    Degraded,
    RetrainTriggered,
}

/// Diagnostic behind a non-healthy status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "detector")]
pub enum DriftTrigger {
    FeatureDrift { feature: String, p_value: f64 },
    ConceptDrift { accuracy: f64 },
    SevereConceptDrift { accuracy: f64 },
}

impl std::fmt::Display for DriftTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FeatureDrift { feature, p_value } => {
                write!(f, "feature drift on {} (p={:.4})", feature, p_value)
            }
            Self::ConceptDrift { accuracy } => {
                write!(f, "rolling accuracy {:.3}", accuracy)
            }
            Self::SevereConceptDrift { accuracy } => {
                write!(f, "rolling accuracy {:.3} below emergency floor", accuracy)
            }
        }
    }
}

/// Per-feature test result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDiagnostic {
    pub feature: String,
    pub p_value: f64,
}

/// Reference distributions captured from a training window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub feature_names: Vec<String>,
    /// One column of reference values per feature.
    pub reference: Vec<Vec<f64>>,
}

impl Baseline {
    pub fn new(feature_names: Vec<String>, reference: Vec<Vec<f64>>) -> EngineResult<Self> {
        if feature_names.len() != reference.len() {
            return Err(EngineError::alignment(format!(
                "{} feature names for {} reference columns",
                feature_names.len(),
                reference.len()
            )));
        }
        Ok(Self {
            feature_names,
            reference,
        })
    }

    /// Reference built from the feature vectors of past observations.
    pub fn from_observations(
        feature_names: Vec<String>,
        observations: &[Observation],
    ) -> EngineResult<Self> {
        let width = feature_names.len();
        let mut reference = vec![Vec::with_capacity(observations.len()); width];
        for obs in observations {
            if obs.features.len() != width {
                return Err(EngineError::alignment(format!(
                    "{}: observation at {} has {} features, expected {}",
                    obs.instrument,
                    obs.timestamp,
                    obs.features.len(),
                    width
                )));
            }
            for (column, value) in reference.iter_mut().zip(&obs.features) {
                column.push(*value);
            }
        }
        Ok(Self {
            feature_names,
            reference,
        })
    }

    pub fn width(&self) -> usize {
        self.feature_names.len()
    }
}

/// Explicit per-instrument monitor context.
#[derive(Debug, Clone)]
pub struct DriftState {
    instrument: String,
    status: DriftStatus,
    trigger: Option<DriftTrigger>,
    baseline: Option<Baseline>,
    features: Vec<RingBuffer<f64>>,
    outcomes: RingBuffer<bool>,
    feature_streak: usize,
    concept_streak: usize,
    last_retrain: Option<Timestamp>,
    last_timestamp: Option<Timestamp>,
    observations: usize,
}

impl DriftState {
    pub fn new(instrument: &str, config: &DriftConfig) -> Self {
        Self {
            instrument: instrument.to_string(),
            status: DriftStatus::Healthy,
            trigger: None,
            baseline: None,
            features: Vec::new(),
            outcomes: RingBuffer::new(config.window_outcomes),
            feature_streak: 0,
            concept_streak: 0,
            last_retrain: None,
            last_timestamp: None,
            observations: 0,
        }
    }

    pub fn with_baseline(mut self, baseline: Baseline) -> Self {
        self.baseline = Some(baseline);
        self
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn status(&self) -> DriftStatus {
        self.status
    }

    pub fn trigger(&self) -> Option<&DriftTrigger> {
        self.trigger.as_ref()
    }

    pub fn baseline(&self) -> Option<&Baseline> {
        self.baseline.as_ref()
    }

    pub fn last_retrain(&self) -> Option<Timestamp> {
        self.last_retrain
    }

    /// Observations since creation or the last acknowledged retrain.
    pub fn observations(&self) -> usize {
        self.observations
    }

    /// Rolling accuracy, once the outcome window is full.
    pub fn rolling_accuracy(&self) -> Option<f64> {
        if !self.outcomes.is_full() {
            return None;
        }
        let hits = self.outcomes.iter().filter(|hit| **hit).count();
        Some(hits as f64 / self.outcomes.len() as f64)
    }

    fn feature_name(&self, idx: usize) -> String {
        self.baseline
            .as_ref()
            .and_then(|b| b.feature_names.get(idx).cloned())
            .unwrap_or_else(|| format!("feature_{}", idx))
    }

    fn clear(&mut self) {
        self.features.clear();
        self.outcomes.clear();
        self.feature_streak = 0;
        self.concept_streak = 0;
        self.trigger = None;
        self.observations = 0;
    }
}

/// Result of one monitor update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub instrument: String,
    pub timestamp: Timestamp,
    pub status: DriftStatus,
    pub previous_status: DriftStatus,
    pub trigger: Option<DriftTrigger>,
    pub rolling_accuracy: Option<f64>,
    /// Features whose test rejected at the configured significance.
    pub flagged_features: Vec<FeatureDiagnostic>,
}

impl DriftReport {
    pub fn transitioned(&self) -> bool {
        self.status != self.previous_status
    }

    pub fn retrain_required(&self) -> bool {
        self.status == DriftStatus::RetrainTriggered
    }
}

/// Outcome of evaluating both detectors on the current buffers.
struct Evaluation {
    rolling_accuracy: Option<f64>,
    flagged_features: Vec<FeatureDiagnostic>,
    feature_drift: bool,
    concept_drift: bool,
    emergency: bool,
}

/// Stateless evaluator; all mutable context lives in [`DriftState`].
#[derive(Debug, Clone)]
pub struct DriftMonitor {
    config: DriftConfig,
}

impl DriftMonitor {
    pub fn new(config: DriftConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn new_state(&self, instrument: &str) -> DriftState {
        DriftState::new(instrument, &self.config)
    }

    /// Whether a prediction matched its realized outcome.
    pub fn is_correct(&self, predicted: ClassLabel, realized_return: f64) -> bool {
        predicted == ClassLabel::of_return(realized_return, self.config.flat_band)
    }

    /// Ingest one observation and re-evaluate the status.
    pub fn update(&self, state: &mut DriftState, obs: &Observation) -> EngineResult<DriftReport> {
        self.ingest(state, obs)?;

        let eval = self.evaluate(state);
        let previous_status = state.status;

        state.feature_streak = if eval.feature_drift { state.feature_streak + 1 } else { 0 };
        state.concept_streak = if eval.concept_drift { state.concept_streak + 1 } else { 0 };

        let next = if previous_status == DriftStatus::RetrainTriggered {
            DriftStatus::RetrainTriggered
        } else if eval.emergency {
            DriftStatus::RetrainTriggered
        } else if !eval.feature_drift && !eval.concept_drift {
            DriftStatus::Healthy
        } else if previous_status == DriftStatus::Degraded
            && (state.feature_streak >= self.config.debounce
                || state.concept_streak >= self.config.debounce)
        {
            // Only a Degraded instrument escalates on a streak; from Healthy
            // the first flag always lands in Degraded.
            DriftStatus::RetrainTriggered
        } else {
            DriftStatus::Degraded
        };

        // The terminal status keeps the diagnostic that caused it.
        if previous_status != DriftStatus::RetrainTriggered {
            state.trigger = match next {
                DriftStatus::Healthy => None,
                _ => Self::diagnose(&eval, state.feature_streak, state.concept_streak),
            };
        }
        state.status = next;

        if next != previous_status {
            let reason = state
                .trigger
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_default();
            match next {
                DriftStatus::Healthy => info!(
                    instrument = %state.instrument,
                    timestamp = %obs.timestamp,
                    "Drift cleared, status {:?} -> Healthy",
                    previous_status
                ),
                _ => warn!(
                    instrument = %state.instrument,
                    timestamp = %obs.timestamp,
                    "Drift status {:?} -> {:?}: {}",
                    previous_status,
                    next,
                    reason
                ),
            }
        }

        Ok(DriftReport {
            instrument: state.instrument.clone(),
            timestamp: obs.timestamp,
            status: next,
            previous_status,
            trigger: state.trigger.clone(),
            rolling_accuracy: eval.rolling_accuracy,
            flagged_features: eval.flagged_features,
        })
    }

    /// Reset after a completed retrain: install the refreshed baseline and
    /// clear buffers and counters. Returns the status that was cleared.
    pub fn acknowledge_retrain(
        &self,
        state: &mut DriftState,
        baseline: Option<Baseline>,
        timestamp: Timestamp,
    ) -> DriftStatus {
        let previous = state.status;
        if baseline.is_some() {
            state.baseline = baseline;
        }
        state.clear();
        state.status = DriftStatus::Healthy;
        state.last_retrain = Some(timestamp);

        info!(
            instrument = %state.instrument,
            %timestamp,
            "Retrain acknowledged, status {:?} -> Healthy",
            previous
        );
        previous
    }

    fn ingest(&self, state: &mut DriftState, obs: &Observation) -> EngineResult<()> {
        if obs.instrument != state.instrument {
            return Err(EngineError::alignment(format!(
                "observation for {} sent to drift state for {}",
                obs.instrument, state.instrument
            )));
        }
        if let Some(last) = state.last_timestamp {
            if obs.timestamp <= last {
                return Err(EngineError::alignment(format!(
                    "{}: observation at {} does not follow {}",
                    state.instrument, obs.timestamp, last
                )));
            }
        }

        let expected_width = match &state.baseline {
            Some(baseline) => Some(baseline.width()),
            None if !state.features.is_empty() => Some(state.features.len()),
            None => None,
        };
        if let Some(width) = expected_width {
            if obs.features.len() != width {
                return Err(EngineError::alignment(format!(
                    "{}: observation at {} has {} features, expected {}",
                    state.instrument,
                    obs.timestamp,
                    obs.features.len(),
                    width
                )));
            }
        }
        if state.features.len() != obs.features.len() {
            state.features = (0..obs.features.len())
                .map(|_| RingBuffer::new(self.config.window_features))
                .collect();
        }

        for (buffer, value) in state.features.iter_mut().zip(&obs.features) {
            buffer.push(*value);
        }
        state
            .outcomes
            .push(self.is_correct(obs.predicted, obs.realized_return));
        state.last_timestamp = Some(obs.timestamp);
        state.observations += 1;
        Ok(())
    }

    fn evaluate(&self, state: &DriftState) -> Evaluation {
        let rolling_accuracy = state.rolling_accuracy();
        let concept_drift = rolling_accuracy
            .map(|acc| acc < self.config.accuracy_floor)
            .unwrap_or(false);
        let emergency = rolling_accuracy
            .map(|acc| acc < self.config.emergency_floor)
            .unwrap_or(false);

        let mut flagged_features = Vec::new();
        let mut tested = 0usize;
        if let Some(baseline) = &state.baseline {
            for (idx, buffer) in state.features.iter().enumerate() {
                let reference = match baseline.reference.get(idx) {
                    Some(column) if buffer.is_full() && !column.is_empty() => column,
                    _ => continue,
                };
                tested += 1;
                let p_value = self.config.test.p_value(&buffer.to_vec(), reference);
                if p_value < self.config.significance {
                    flagged_features.push(FeatureDiagnostic {
                        feature: state.feature_name(idx),
                        p_value,
                    });
                }
            }
        }

        let feature_drift = tested > 0
            && flagged_features.len() as f64 / tested as f64 > self.config.max_flagged_fraction;

        Evaluation {
            rolling_accuracy,
            flagged_features,
            feature_drift,
            concept_drift,
            emergency,
        }
    }

    /// Diagnostic of the detector that has been flagging longest; concept
    /// drift wins a tie. The emergency floor always reports itself.
    fn diagnose(
        eval: &Evaluation,
        feature_streak: usize,
        concept_streak: usize,
    ) -> Option<DriftTrigger> {
        if eval.emergency {
            return eval
                .rolling_accuracy
                .map(|accuracy| DriftTrigger::SevereConceptDrift { accuracy });
        }
        let concept = eval
            .rolling_accuracy
            .filter(|_| eval.concept_drift)
            .map(|accuracy| DriftTrigger::ConceptDrift { accuracy });
        let feature = eval
            .flagged_features
            .iter()
            .filter(|_| eval.feature_drift)
            .min_by(|a, b| a.p_value.total_cmp(&b.p_value))
            .map(|d| DriftTrigger::FeatureDrift {
                feature: d.feature.clone(),
                p_value: d.p_value,
            });
        match (concept, feature) {
            (Some(concept), Some(feature)) => {
                if feature_streak > concept_streak {
                    Some(feature)
                } else {
                    Some(concept)
                }
            }
            (concept, feature) => concept.or(feature),
        }
    }
}

/// Lazily created drift states keyed by instrument.
#[derive(Debug, Clone)]
pub struct DriftRegistry {
    monitor: DriftMonitor,
    states: HashMap<String, DriftState>,
}

impl DriftRegistry {
    pub fn new(config: DriftConfig) -> EngineResult<Self> {
        Ok(Self {
            monitor: DriftMonitor::new(config)?,
            states: HashMap::new(),
        })
    }

    pub fn monitor(&self) -> &DriftMonitor {
        &self.monitor
    }

    /// Install a reference for an instrument, creating its state if needed.
    pub fn set_baseline(&mut self, instrument: &str, baseline: Baseline) {
        let state = self.state_mut(instrument);
        state.baseline = Some(baseline);
    }

    pub fn update(&mut self, obs: &Observation) -> EngineResult<DriftReport> {
        let monitor = &self.monitor;
        let state = self
            .states
            .entry(obs.instrument.clone())
            .or_insert_with(|| monitor.new_state(&obs.instrument));
        monitor.update(state, obs)
    }

    pub fn acknowledge_retrain(
        &mut self,
        instrument: &str,
        baseline: Option<Baseline>,
        timestamp: Timestamp,
    ) -> EngineResult<DriftStatus> {
        let state = self.states.get_mut(instrument).ok_or_else(|| {
            EngineError::alignment(format!("no drift state for {}", instrument))
        })?;
        Ok(self.monitor.acknowledge_retrain(state, baseline, timestamp))
    }

    pub fn state(&self, instrument: &str) -> Option<&DriftState> {
        self.states.get(instrument)
    }

    /// Current status of every tracked instrument, sorted by name.
    pub fn statuses(&self) -> BTreeMap<String, DriftStatus> {
        self.states
            .iter()
            .map(|(k, s)| (k.clone(), s.status()))
            .collect()
    }

    fn state_mut(&mut self, instrument: &str) -> &mut DriftState {
        let monitor = &self.monitor;
        self.states
            .entry(instrument.to_string())
            .or_insert_with(|| monitor.new_state(instrument))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn ts(i: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::hours(i)
    }

    fn obs(i: i64, correct: bool, features: Vec<f64>) -> Observation {
        Observation {
            instrument: "ETH".to_string(),
            timestamp: ts(i),
            features,
            predicted: ClassLabel::Up,
            realized_return: if correct { 0.01 } else { -0.01 },
        }
    }

    #[test]
    fn test_default_config() {
        let config = DriftConfig::default();
        assert_eq!(config.window_features, 30);
        assert_eq!(config.window_outcomes, 30);
        assert_eq!(config.debounce, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let bad = DriftConfig {
            emergency_floor: 0.6,
            ..Default::default()
        };
        assert!(DriftMonitor::new(bad).is_err());
        let bad = DriftConfig {
            debounce: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_fifty_percent_accuracy_triggers_retrain() {
        let monitor = DriftMonitor::new(DriftConfig::default()).unwrap();
        let mut state = monitor.new_state("ETH");

        let mut statuses = Vec::new();
        for i in 0..40 {
            let report = monitor.update(&mut state, &obs(i, i % 2 == 0, vec![])).unwrap();
            statuses.push(report.status);
        }

        assert!(statuses[..29].iter().all(|s| *s == DriftStatus::Healthy));
        assert_eq!(statuses[29], DriftStatus::Degraded);
        assert_eq!(statuses[30], DriftStatus::Degraded);
        assert_eq!(statuses[31], DriftStatus::RetrainTriggered);
        assert!(statuses[31..].iter().all(|s| *s == DriftStatus::RetrainTriggered));
        assert_eq!(state.trigger(), Some(&DriftTrigger::ConceptDrift { accuracy: 0.5 }));

        // Good predictions do not clear the terminal status.
        for i in 40..80 {
            let report = monitor.update(&mut state, &obs(i, true, vec![])).unwrap();
            assert_eq!(report.status, DriftStatus::RetrainTriggered);
        }

        let cleared = monitor.acknowledge_retrain(&mut state, None, ts(80));
        assert_eq!(cleared, DriftStatus::RetrainTriggered);
        assert_eq!(state.status(), DriftStatus::Healthy);
        assert_eq!(state.last_retrain(), Some(ts(80)));
        assert_eq!(state.rolling_accuracy(), None);
        assert_eq!(state.observations(), 0);
    }

    #[test]
    fn test_emergency_floor_is_immediate() {
        let monitor = DriftMonitor::new(DriftConfig::default()).unwrap();
        let mut state = monitor.new_state("ETH");

        let mut last = None;
        for i in 0..30 {
            last = Some(monitor.update(&mut state, &obs(i, i % 3 == 0, vec![])).unwrap());
        }
        let report = last.unwrap();
        assert_eq!(report.previous_status, DriftStatus::Healthy);
        assert_eq!(report.status, DriftStatus::RetrainTriggered);
        assert!(matches!(
            report.trigger,
            Some(DriftTrigger::SevereConceptDrift { .. })
        ));
    }

    #[test]
    fn test_persistent_concept_drift_debounces() {
        let monitor = DriftMonitor::new(DriftConfig::default()).unwrap();
        let mut state = monitor.new_state("ETH");

        // 16 correct of 30 → 0.533, below the 0.55 floor.
        for i in 0..30 {
            monitor.update(&mut state, &obs(i, i < 16, vec![])).unwrap();
        }
        assert_eq!(state.status(), DriftStatus::Degraded);

        // Each new hit evicts an old hit, so accuracy stays at 16/30.
        let report = monitor.update(&mut state, &obs(30, true, vec![])).unwrap();
        assert_eq!(report.status, DriftStatus::Degraded);
        let report = monitor.update(&mut state, &obs(31, true, vec![])).unwrap();
        assert_eq!(report.status, DriftStatus::RetrainTriggered);
    }

    #[test]
    fn test_single_debounce_still_passes_through_degraded() {
        let config = DriftConfig {
            window_outcomes: 4,
            debounce: 1,
            ..Default::default()
        };
        let monitor = DriftMonitor::new(config).unwrap();
        let mut state = monitor.new_state("ETH");

        let statuses: Vec<DriftStatus> = (0..6)
            .map(|i| monitor.update(&mut state, &obs(i, i % 2 == 0, vec![])).unwrap().status)
            .collect();

        assert_eq!(
            statuses,
            vec![
                DriftStatus::Healthy,
                DriftStatus::Healthy,
                DriftStatus::Healthy,
                DriftStatus::Degraded,
                DriftStatus::RetrainTriggered,
                DriftStatus::RetrainTriggered,
            ]
        );
    }

    #[test]
    fn test_retrain_names_the_detector_that_debounced() {
        // The feature window fills two periods before the outcome window.
        let config = DriftConfig {
            window_features: 6,
            window_outcomes: 8,
            ..Default::default()
        };
        let monitor = DriftMonitor::new(config).unwrap();
        let reference: Vec<f64> = (0..60).map(|i| (i % 10) as f64).collect();
        let baseline = Baseline::new(vec!["vol".to_string()], vec![reference]).unwrap();
        let mut state = monitor.new_state("ETH").with_baseline(baseline);

        let reports: Vec<DriftReport> = (0..8)
            .map(|i| {
                let features = vec![100.0 + i as f64];
                monitor.update(&mut state, &obs(i, i % 2 == 0, features)).unwrap()
            })
            .collect();

        assert_eq!(reports[5].status, DriftStatus::Degraded);
        assert_eq!(reports[6].status, DriftStatus::Degraded);

        // Concept drift flags for the first time on the escalating update,
        // but the feature streak is what reached the debounce.
        let last = &reports[7];
        assert_eq!(last.rolling_accuracy, Some(0.5));
        assert_eq!(last.status, DriftStatus::RetrainTriggered);
        assert!(matches!(
            &last.trigger,
            Some(DriftTrigger::FeatureDrift { feature, .. }) if feature == "vol"
        ));
    }

    #[test]
    fn test_refreshed_baseline_stops_feature_drift_refiring() {
        let config = DriftConfig {
            window_features: 6,
            window_outcomes: 6,
            ..Default::default()
        };
        let monitor = DriftMonitor::new(config).unwrap();
        let reference: Vec<f64> = (0..60).map(|i| (i % 10) as f64).collect();
        let baseline = Baseline::new(vec!["vol".to_string()], vec![reference]).unwrap();
        let mut state = monitor.new_state("ETH").with_baseline(baseline);
        let shifted = |i: i64| obs(i, true, vec![100.0 + (i % 2) as f64]);

        let recent: Vec<Observation> = (0..8).map(shifted).collect();
        for o in &recent {
            monitor.update(&mut state, o).unwrap();
        }
        assert_eq!(state.status(), DriftStatus::RetrainTriggered);

        let mut stale = state.clone();
        monitor.acknowledge_retrain(&mut stale, None, ts(8));
        let refreshed = Baseline::from_observations(vec!["vol".into()], &recent[2..]).unwrap();
        monitor.acknowledge_retrain(&mut state, Some(refreshed), ts(8));

        for i in 9..15 {
            monitor.update(&mut stale, &shifted(i)).unwrap();
            monitor.update(&mut state, &shifted(i)).unwrap();
        }
        // The old reference flags again as soon as the window refills.
        assert_eq!(stale.status(), DriftStatus::Degraded);
        assert_eq!(state.status(), DriftStatus::Healthy);
    }

    #[test]
    fn test_degraded_back_to_healthy() {
        let config = DriftConfig {
            window_outcomes: 10,
            debounce: 5,
            ..Default::default()
        };
        let monitor = DriftMonitor::new(config).unwrap();
        let mut state = monitor.new_state("ETH");

        // Five misses then five hits: accuracy 0.5 at the tenth observation.
        for i in 0..10 {
            monitor.update(&mut state, &obs(i, i >= 5, vec![])).unwrap();
        }
        assert_eq!(state.status(), DriftStatus::Degraded);

        // Each hit evicts a miss: 0.6 clears the floor.
        let report = monitor.update(&mut state, &obs(10, true, vec![])).unwrap();
        assert_eq!(report.previous_status, DriftStatus::Degraded);
        assert_eq!(report.status, DriftStatus::Healthy);
        assert!(report.trigger.is_none());
        assert!(report.transitioned());
    }

    #[test]
    fn test_feature_drift_detection() {
        let monitor = DriftMonitor::new(DriftConfig::default()).unwrap();
        let reference: Vec<f64> = (0..60).map(|i| (i % 10) as f64).collect();
        let names = vec!["momentum".to_string(), "volume".to_string()];
        let baseline = Baseline::new(names, vec![reference.clone(), reference]).unwrap();
        let mut state = monitor.new_state("ETH").with_baseline(baseline);

        let mut reports = Vec::new();
        for i in 0..30 {
            // "volume" shifts far outside the reference range.
            let features = vec![(i % 10) as f64, 100.0 + i as f64];
            reports.push(monitor.update(&mut state, &obs(i, true, features)).unwrap());
        }

        assert!(reports[..29].iter().all(|r| r.status == DriftStatus::Healthy));
        let last = &reports[29];
        assert_eq!(last.status, DriftStatus::Degraded);
        assert_eq!(last.flagged_features.len(), 1);
        assert_eq!(last.flagged_features[0].feature, "volume");
        assert!(matches!(
            &last.trigger,
            Some(DriftTrigger::FeatureDrift { feature, .. }) if feature == "volume"
        ));
    }

    #[test]
    fn test_flagged_fraction_threshold() {
        let config = DriftConfig {
            max_flagged_fraction: 0.5,
            ..Default::default()
        };
        let monitor = DriftMonitor::new(config).unwrap();
        let reference: Vec<f64> = (0..60).map(|i| (i % 10) as f64).collect();
        let names = vec!["a".to_string(), "b".to_string()];
        let baseline = Baseline::new(names, vec![reference.clone(), reference]).unwrap();
        let mut state = monitor.new_state("ETH").with_baseline(baseline);

        let mut last = None;
        for i in 0..30 {
            let features = vec![(i % 10) as f64, 100.0 + i as f64];
            last = Some(monitor.update(&mut state, &obs(i, true, features)).unwrap());
        }

        // One of two features flagged is not more than half.
        let last = last.unwrap();
        assert_eq!(last.flagged_features.len(), 1);
        assert_eq!(last.status, DriftStatus::Healthy);
    }

    #[test]
    fn test_feature_width_mismatch() {
        let monitor = DriftMonitor::new(DriftConfig::default()).unwrap();
        let mut state = monitor.new_state("ETH");
        monitor.update(&mut state, &obs(0, true, vec![1.0, 2.0])).unwrap();
        let result = monitor.update(&mut state, &obs(1, true, vec![1.0]));
        assert!(matches!(result, Err(EngineError::Alignment(_))));
    }

    #[test]
    fn test_out_of_order_observation() {
        let monitor = DriftMonitor::new(DriftConfig::default()).unwrap();
        let mut state = monitor.new_state("ETH");
        monitor.update(&mut state, &obs(5, true, vec![])).unwrap();
        assert!(monitor.update(&mut state, &obs(5, true, vec![])).is_err());
    }

    #[test]
    fn test_registry_keeps_instruments_independent() {
        let mut registry = DriftRegistry::new(DriftConfig::default()).unwrap();
        for i in 0..35 {
            registry.update(&obs(i, i % 2 == 0, vec![])).unwrap();
            let btc = Observation {
                instrument: "BTC".to_string(),
                ..obs(i, true, vec![])
            };
            registry.update(&btc).unwrap();
        }

        let statuses = registry.statuses();
        assert_eq!(statuses["ETH"], DriftStatus::RetrainTriggered);
        assert_eq!(statuses["BTC"], DriftStatus::Healthy);

        let cleared = registry.acknowledge_retrain("ETH", None, ts(40)).unwrap();
        assert_eq!(cleared, DriftStatus::RetrainTriggered);
        assert_eq!(registry.state("ETH").unwrap().status(), DriftStatus::Healthy);
        assert!(registry.acknowledge_retrain("SOL", None, ts(40)).is_err());
    }

    #[test]
    fn test_baseline_from_observations() {
        let rows = vec![obs(0, true, vec![1.0, 2.0]), obs(1, true, vec![3.0, 4.0])];
        let baseline = Baseline::from_observations(vec!["a".into(), "b".into()], &rows).unwrap();
        assert_eq!(baseline.reference, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        assert!(Baseline::from_observations(vec!["a".into()], &rows).is_err());
    }
}
