//! Acquisition functions. Everything here is "larger is better": callers
//! negate minimized metrics before fitting the surrogate.

use serde::{Deserialize, Serialize};

/// Scoring rule balancing predicted performance against uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Acquisition {
    ExpectedImprovement { trade_off: f64 },
    ProbabilityOfImprovement { trade_off: f64 },
    ConfidenceBound { kappa: f64 },
}

impl Default for Acquisition {
    fn default() -> Self {
        Self::ExpectedImprovement { trade_off: 0.0 }
    }
}

impl Acquisition {
    /// Score a point with posterior `mean` and `std` against the incumbent
    /// `best`.
    pub fn score(&self, mean: f64, std: f64, best: f64) -> f64 {
        match *self {
            Self::ExpectedImprovement { trade_off } => {
                expected_improvement(mean, std, best + trade_off)
            }
            Self::ProbabilityOfImprovement { trade_off } => {
                let gap = mean - best - trade_off;
                if std < 1e-12 {
                    if gap > 0.0 {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    norm_cdf(gap / std)
                }
            }
            Self::ConfidenceBound { kappa } => mean + kappa * std,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExpectedImprovement { .. } => "expected_improvement",
            Self::ProbabilityOfImprovement { .. } => "probability_of_improvement",
            Self::ConfidenceBound { .. } => "confidence_bound",
        }
    }
}

/// `EI(x) = (mean - best) Φ(z) + std φ(z)` with `z = (mean - best) / std`.
pub fn expected_improvement(mean: f64, std: f64, best: f64) -> f64 {
    if std < 1e-12 {
        return (mean - best).max(0.0);
    }
    let z = (mean - best) / std;
    ((mean - best) * norm_cdf(z) + std * norm_pdf(z)).max(0.0)
}

/// Standard normal PDF.
pub fn norm_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal CDF (Hart rational approximation).
pub fn norm_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }

    let abs_x = x.abs();
    let t = 1.0 / (1.0 + 0.231_641_9 * abs_x);
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let cdf = 1.0 - norm_pdf(abs_x) * poly;

    if x >= 0.0 {
        cdf
    } else {
        1.0 - cdf
    }
}
