//! Per-fit records, diagnostic notes and aggregated metrics.

use serde::{Deserialize, Deserializer, Serialize};

use crate::candidate::Candidate;

/// Pipeline stage that produced a note or a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preprocessing,
    Model,
    Prediction,
    Metric,
    Extract,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Preprocessing => "preprocessing",
            Self::Model => "model",
            Self::Prediction => "prediction",
            Self::Metric => "metric",
            Self::Extract => "extract",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning => f.write_str("warning"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// A diagnostic captured while fitting one (resample, candidate) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
}

impl Note {
    pub fn warning(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

/// Whether larger or smaller values of a metric are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Maximize
    }
}

impl Direction {
    /// `true` when `candidate` is strictly better than `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }

    /// Map a value onto a "larger is better" scale.
    pub fn orient(&self, value: f64) -> f64 {
        match self {
            Self::Maximize => value,
            Self::Minimize => -value,
        }
    }
}

/// One metric estimate for one fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub metric: String,
    pub estimator: String,
    /// `NaN` when the metric could not be computed.
    #[serde(deserialize_with = "estimate_or_nan")]
    pub estimate: f64,
}

/// One validation-set prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Row index into the base dataset.
    pub row: usize,
    pub truth: f64,
    #[serde(deserialize_with = "estimate_or_nan")]
    pub estimate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FitStatus {
    Succeeded,
    Failed { stage: Stage },
}

/// Outcome of evaluating one candidate on one resample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    pub resample_id: String,
    /// Position of the resample in the supplied order.
    pub resample_index: usize,
    /// Position of the candidate in its candidate set.
    pub candidate_index: usize,
    pub candidate: Candidate,
    pub config: String,
    pub iteration: usize,
    pub status: FitStatus,
    pub metrics: Vec<MetricRow>,
    pub predictions: Option<Vec<Prediction>>,
    pub extract: Option<serde_json::Value>,
    pub notes: Vec<Note>,
}

impl FitRecord {
    pub fn succeeded(&self) -> bool {
        self.status == FitStatus::Succeeded
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self.status {
            FitStatus::Failed { stage } => Some(stage),
            FitStatus::Succeeded => None,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Note> {
        self.notes.iter().filter(|n| n.severity == Severity::Error)
    }
}

/// JSON writes non-finite numbers as `null`; read them back as `NaN`.
pub fn estimate_or_nan<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Summary of one metric for one candidate across resamples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetric {
    pub candidate: Candidate,
    pub config: String,
    pub iteration: usize,
    pub metric: String,
    pub estimator: String,
    /// `None` when no resample produced a finite value.
    pub mean: Option<f64>,
    /// `None` when fewer than two resamples contributed.
    pub std_err: Option<f64>,
    /// Number of resamples contributing a finite value.
    pub n: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_orientation() {
        assert!(Direction::Maximize.improves(2.0, 1.0));
        assert!(Direction::Minimize.improves(1.0, 2.0));
        assert!(!Direction::Minimize.improves(2.0, 2.0));
        assert_eq!(Direction::Minimize.orient(3.0), -3.0);
    }

    #[test]
    fn status_serialization() {
        let failed = FitStatus::Failed {
            stage: Stage::Preprocessing,
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert_eq!(json, r#"{"status":"failed","stage":"preprocessing"}"#);
        let ok = serde_json::to_string(&FitStatus::Succeeded).unwrap();
        assert_eq!(ok, r#"{"status":"succeeded"}"#);
    }

    #[test]
    fn missing_estimate_reads_back_as_nan() {
        let row = MetricRow {
            metric: "rmse".into(),
            estimator: "standard".into(),
            estimate: f64::NAN,
        };
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains(r#""estimate":null"#));
        let back: MetricRow = serde_json::from_str(&json).unwrap();
        assert!(back.estimate.is_nan());
    }

    #[test]
    fn note_display_fields() {
        let note = Note::error(Stage::Model, "singular matrix");
        assert_eq!(note.stage.to_string(), "model");
        assert_eq!(note.severity.to_string(), "error");
    }
}
