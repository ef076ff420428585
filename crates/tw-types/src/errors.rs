use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Stage;

/// Main error type for Tunewise
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Fit error: {0}")]
    Fit(#[from] FitError),

    #[error("Surrogate optimization failed: {message}")]
    SurrogateOptimization { message: String },

    #[error("Metric not found: {metric}")]
    MetricNotFound { metric: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Failure of a single fit. Recoverable: the engine turns these into notes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("preprocessing failed: {message}")]
    Preprocessing { message: String },

    #[error("model fit failed: {message}")]
    ModelFit { message: String },

    #[error("prediction failed: {message}")]
    Prediction { message: String },

    #[error("metric {metric} failed: {message}")]
    MetricComputation { metric: String, message: String },

    #[error("{stage} timed out after {elapsed_ms} ms (limit {limit_ms} ms)")]
    Timeout {
        stage: Stage,
        elapsed_ms: u128,
        limit_ms: u128,
    },

    #[error("{stage} panicked: {message}")]
    Panicked { stage: Stage, message: String },
}

impl FitError {
    pub fn preprocessing(message: impl Into<String>) -> Self {
        Self::Preprocessing {
            message: message.into(),
        }
    }

    pub fn model_fit(message: impl Into<String>) -> Self {
        Self::ModelFit {
            message: message.into(),
        }
    }

    pub fn prediction(message: impl Into<String>) -> Self {
        Self::Prediction {
            message: message.into(),
        }
    }

    pub fn metric(metric: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MetricComputation {
            metric: metric.into(),
            message: message.into(),
        }
    }
}

/// Run-level warnings returned next to the records. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunWarning {
    #[error("All models failed: {fits} fits, {}", describe_stage(.stage))]
    AllCandidatesFailed { stage: Option<Stage>, fits: usize },
}

fn describe_stage(stage: &Option<Stage>) -> String {
    match stage {
        Some(stage) => format!("every failure at the {stage} stage"),
        None => "failures at mixed stages".to_string(),
    }
}

/// Result type alias for Tunewise operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config(format!($($arg)*))
    };
}
