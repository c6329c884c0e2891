//! Core data types for signal validation.
//!
//! These types are the contract between the external pipeline (prices,
//! features, trained models) and the validation core.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Timestamp used throughout the engine.
pub type Timestamp = DateTime<Utc>;

/// Directional class predicted by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassLabel {
    // Declaration order is the voting tie-break precedence (first wins).
    Flat,
    Down,
    Up,
}

impl FromStr for ClassLabel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" | "u" | "1" => Ok(Self::Up),
            "down" | "d" | "-1" => Ok(Self::Down),
            "flat" | "f" | "0" => Ok(Self::Flat),
            other => Err(EngineError::config(format!("unknown class label: {}", other))),
        }
    }
}

impl ClassLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Flat => "flat",
        }
    }

    /// Trading action implied by this label.
    pub fn action(&self) -> Action {
        match self {
            Self::Up => Action::Buy,
            Self::Down => Action::Sell,
            Self::Flat => Action::Hold,
        }
    }

    /// Probability of an upward move implied by predicting this label
    /// with probability `p`.
    pub fn up_probability(&self, p: f64) -> f64 {
        match self {
            Self::Up => p,
            Self::Down => 1.0 - p,
            Self::Flat => 0.5,
        }
    }

    /// Label of a realized return, given a symmetric flat band.
    pub fn of_return(realized: f64, flat_band: f64) -> Self {
        if realized > flat_band {
            Self::Up
        } else if realized < -flat_band {
            Self::Down
        } else {
            Self::Flat
        }
    }
}

/// Trading decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

/// A single model's output for one (timestamp, instrument).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub timestamp: Timestamp,
    pub instrument: String,
    pub model_id: String,
    pub label: ClassLabel,
    /// Probability the model assigns to `label`, in [0, 1].
    pub probability: f64,
}

impl Prediction {
    pub fn new(
        timestamp: Timestamp,
        instrument: &str,
        model_id: &str,
        label: ClassLabel,
        probability: f64,
    ) -> Self {
        Self {
            timestamp,
            instrument: instrument.to_string(),
            model_id: model_id.to_string(),
            label,
            probability,
        }
    }

    pub fn up_probability(&self) -> f64 {
        self.label.up_probability(self.probability)
    }
}

/// Ensemble decision for one (timestamp, instrument).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSignal {
    pub timestamp: Timestamp,
    pub instrument: String,
    pub action: Action,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

impl CombinedSignal {
    pub fn new(timestamp: Timestamp, instrument: &str, action: Action, confidence: f64) -> Self {
        Self {
            timestamp,
            instrument: instrument.to_string(),
            action,
            confidence,
        }
    }
}

/// One period of market data for an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: Timestamp,
    /// Execution price for the period.
    pub price: Decimal,
    /// Engineered features, ordered as the series' `feature_names`.
    #[serde(default)]
    pub features: Vec<f64>,
    /// Forward return realized after this period, once known.
    ///
    /// This is a label: it looks one period ahead, so a purge gap of at least
    /// the label horizon keeps train labels out of the test window.
    #[serde(default)]
    pub realized_return: Option<f64>,
}

/// Time-indexed records for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    pub instrument: String,
    pub feature_names: Vec<String>,
    records: Vec<Record>,
}

impl TimeSeries {
    /// Build a series, checking strict timestamp ordering and feature widths.
    pub fn new(
        instrument: &str,
        feature_names: Vec<String>,
        records: Vec<Record>,
    ) -> EngineResult<Self> {
        for pair in records.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(EngineError::alignment(format!(
                    "{}: timestamps not strictly increasing at {} -> {}",
                    instrument, pair[0].timestamp, pair[1].timestamp
                )));
            }
        }
        if let Some(bad) = records
            .iter()
            .find(|r| r.features.len() != feature_names.len())
        {
            return Err(EngineError::alignment(format!(
                "{}: record at {} has {} features, expected {}",
                instrument,
                bad.timestamp,
                bad.features.len(),
                feature_names.len()
            )));
        }
        if let Some(bad) = records.iter().find(|r| r.price <= Decimal::ZERO) {
            return Err(EngineError::alignment(format!(
                "{}: non-positive price at {}",
                instrument, bad.timestamp
            )));
        }

        Ok(Self {
            instrument: instrument.to_string(),
            feature_names,
            records,
        })
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.records.iter().map(|r| r.timestamp).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn ts(day: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day)
    }

    fn record(day: i64) -> Record {
        Record {
            timestamp: ts(day),
            price: dec!(100),
            features: vec![0.0],
            realized_return: None,
        }
    }

    #[test]
    fn test_label_parsing() {
        assert_eq!("UP".parse::<ClassLabel>(), Ok(ClassLabel::Up));
        assert_eq!("-1".parse::<ClassLabel>(), Ok(ClassLabel::Down));
        assert_eq!(ClassLabel::from_str("flat"), Ok(ClassLabel::Flat));
        assert!(matches!(
            "sideways".parse::<ClassLabel>(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_up_probability() {
        assert_eq!(ClassLabel::Up.up_probability(0.8), 0.8);
        assert!((ClassLabel::Down.up_probability(0.8) - 0.2).abs() < 1e-12);
        assert_eq!(ClassLabel::Flat.up_probability(0.9), 0.5);
    }

    #[test]
    fn test_label_of_return() {
        assert_eq!(ClassLabel::of_return(0.01, 0.0), ClassLabel::Up);
        assert_eq!(ClassLabel::of_return(-0.01, 0.0), ClassLabel::Down);
        assert_eq!(ClassLabel::of_return(0.001, 0.002), ClassLabel::Flat);
    }

    #[test]
    fn test_series_rejects_unordered() {
        let result = TimeSeries::new("SPY", vec!["f".into()], vec![record(1), record(1)]);
        assert!(matches!(result, Err(EngineError::Alignment(_))));
    }

    #[test]
    fn test_series_rejects_feature_width() {
        let mut bad = record(2);
        bad.features.push(1.0);
        let result = TimeSeries::new("SPY", vec!["f".into()], vec![record(1), bad]);
        assert!(matches!(result, Err(EngineError::Alignment(_))));
    }
}
