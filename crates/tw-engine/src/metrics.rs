//! Performance metrics.
//!
//! The engine only needs the [`Metric`] interface. [`Rmse`], [`Mae`] and
//! [`Rsq`] are provided for regression workflows.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tw_types::{Direction, FitError};

/// A performance metric computed from truth and estimate columns.
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    /// Estimator type reported with every row (e.g. "standard", "macro").
    fn estimator(&self) -> &str {
        "standard"
    }

    fn direction(&self) -> Direction;

    fn compute(&self, truth: &[f64], estimate: &[f64]) -> Result<f64, FitError>;
}

/// Static description of a metric, carried by results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricInfo {
    pub name: String,
    pub estimator: String,
    pub direction: Direction,
}

/// Ordered collection of metrics evaluated on every fit.
#[derive(Clone, Default)]
pub struct MetricSet {
    metrics: Vec<Arc<dyn Metric>>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: impl Metric + 'static) -> Self {
        self.metrics.push(Arc::new(metric));
        self
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Metric>> {
        self.metrics.iter()
    }

    pub fn info(&self) -> Vec<MetricInfo> {
        self.metrics
            .iter()
            .map(|m| MetricInfo {
                name: m.name().to_string(),
                estimator: m.estimator().to_string(),
                direction: m.direction(),
            })
            .collect()
    }
}

impl std::fmt::Debug for MetricSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.metrics.iter().map(|m| m.name()))
            .finish()
    }
}

fn check_lengths(metric: &str, truth: &[f64], estimate: &[f64]) -> Result<(), FitError> {
    if truth.len() != estimate.len() {
        return Err(FitError::metric(
            metric,
            format!("{} truth values but {} estimates", truth.len(), estimate.len()),
        ));
    }
    if truth.is_empty() {
        return Err(FitError::metric(metric, "no observations"));
    }
    Ok(())
}

/// Root mean squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rmse;

impl Metric for Rmse {
    fn name(&self) -> &str {
        "rmse"
    }

    fn direction(&self) -> Direction {
        Direction::Minimize
    }

    fn compute(&self, truth: &[f64], estimate: &[f64]) -> Result<f64, FitError> {
        check_lengths(self.name(), truth, estimate)?;
        let mse = truth
            .iter()
            .zip(estimate)
            .map(|(t, e)| (t - e).powi(2))
            .sum::<f64>()
            / truth.len() as f64;
        Ok(mse.sqrt())
    }
}

/// Mean absolute error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mae;

impl Metric for Mae {
    fn name(&self) -> &str {
        "mae"
    }

    fn direction(&self) -> Direction {
        Direction::Minimize
    }

    fn compute(&self, truth: &[f64], estimate: &[f64]) -> Result<f64, FitError> {
        check_lengths(self.name(), truth, estimate)?;
        Ok(truth.iter().zip(estimate).map(|(t, e)| (t - e).abs()).sum::<f64>() / truth.len() as f64)
    }
}

/// Squared Pearson correlation between truth and estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rsq;

impl Metric for Rsq {
    fn name(&self) -> &str {
        "rsq"
    }

    fn direction(&self) -> Direction {
        Direction::Maximize
    }

    fn compute(&self, truth: &[f64], estimate: &[f64]) -> Result<f64, FitError> {
        check_lengths(self.name(), truth, estimate)?;
        let n = truth.len() as f64;
        let mean_t = truth.iter().sum::<f64>() / n;
        let mean_e = estimate.iter().sum::<f64>() / n;
        let (mut cov, mut var_t, mut var_e) = (0.0, 0.0, 0.0);
        for (t, e) in truth.iter().zip(estimate) {
            cov += (t - mean_t) * (e - mean_e);
            var_t += (t - mean_t).powi(2);
            var_e += (e - mean_e).powi(2);
        }
        if var_t == 0.0 || var_e == 0.0 {
            return Err(FitError::metric(
                self.name(),
                "a correlation computation is required, but one column has zero variance",
            ));
        }
        Ok(cov * cov / (var_t * var_e))
    }
}
