//! Gaussian-process surrogate over the unit cube.

use nalgebra::{linalg::Cholesky, DMatrix, DVector, Dyn};

use tw_types::{TuneError, TuneResult};

/// Precomputed √5 constant.
const SQRT_5: f64 = 2.236_067_977_499_79;

/// Observation noise added to the kernel diagonal.
pub const DEFAULT_NOISE_VAR: f64 = 1e-6;

/// Jitter multipliers tried when the kernel matrix is numerically singular.
const JITTER_STEPS: [f64; 4] = [1.0, 10.0, 100.0, 1000.0];

/// Matérn 5/2 kernel with ARD lengthscales.
///
/// `k(x1, x2) = σ² (1 + √5 r + 5/3 r²) exp(-√5 r)`
/// where `r = sqrt(Σ ((x1_i - x2_i) / l_i)²)`
fn matern52(x1: &[f64], x2: &[f64], lengthscales: &[f64], signal_var: f64) -> f64 {
    let r_sq: f64 = x1
        .iter()
        .zip(x2)
        .zip(lengthscales)
        .map(|((a, b), l)| ((a - b) / l).powi(2))
        .sum();
    let r = r_sq.sqrt();
    let sqrt5_r = SQRT_5 * r;
    signal_var * (1.0 + sqrt5_r + 5.0 / 3.0 * r_sq) * (-sqrt5_r).exp()
}

/// A fitted GP ready for predictions. Targets are standardized internally;
/// predictions come back on the original scale.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    cholesky: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
    x_train: Vec<Vec<f64>>,
    lengthscales: Vec<f64>,
    signal_var: f64,
    y_mean: f64,
    y_std: f64,
}

impl GaussianProcess {
    /// Fit to `x` (rows in [0, 1]^d) and targets `y`.
    pub fn fit(x: &[Vec<f64>], y: &[f64], noise_var: f64) -> TuneResult<Self> {
        let n = y.len();
        if n == 0 || x.len() != n {
            return Err(surrogate_error(format!(
                "cannot fit a surrogate to {} points and {} targets",
                x.len(),
                n
            )));
        }
        let d = x[0].len();
        if x.iter().any(|row| row.len() != d) {
            return Err(surrogate_error("training points have inconsistent dimensions"));
        }
        if y.iter().any(|v| !v.is_finite()) || x.iter().flatten().any(|v| !v.is_finite()) {
            return Err(surrogate_error("training data contains non-finite values"));
        }

        let y_mean = y.iter().sum::<f64>() / n as f64;
        let y_var = if n > 1 {
            y.iter().map(|v| (v - y_mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            1.0
        };
        let y_std = y_var.sqrt().max(1e-10);
        let y_standardized = DVector::from_iterator(n, y.iter().map(|v| (v - y_mean) / y_std));

        // per-dimension spread of the inputs, floored
        let lengthscales: Vec<f64> = (0..d)
            .map(|j| {
                let mean = x.iter().map(|row| row[j]).sum::<f64>() / n as f64;
                let var = x.iter().map(|row| (row[j] - mean).powi(2)).sum::<f64>() / n as f64;
                var.sqrt().max(0.01)
            })
            .collect();
        let signal_var = 1.0;

        let cholesky = JITTER_STEPS
            .iter()
            .find_map(|step| {
                let k = DMatrix::from_fn(n, n, |i, j| {
                    let k = matern52(&x[i], &x[j], &lengthscales, signal_var);
                    if i == j {
                        k + noise_var * step
                    } else {
                        k
                    }
                });
                Cholesky::new(k)
            })
            .ok_or_else(|| surrogate_error("kernel matrix is not positive definite"))?;
        let alpha = cholesky.solve(&y_standardized);

        Ok(Self {
            cholesky,
            alpha,
            x_train: x.to_vec(),
            lengthscales,
            signal_var,
            y_mean,
            y_std,
        })
    }

    pub fn dims(&self) -> usize {
        self.lengthscales.len()
    }

    /// Posterior mean and standard deviation at `x`.
    pub fn predict(&self, x: &[f64]) -> (f64, f64) {
        let k_star = DVector::from_fn(self.x_train.len(), |i, _| {
            matern52(x, &self.x_train[i], &self.lengthscales, self.signal_var)
        });
        let mean = k_star.dot(&self.alpha);
        let v = self.cholesky.solve(&k_star);
        let var = (self.signal_var - k_star.dot(&v)).max(0.0);
        (mean * self.y_std + self.y_mean, var.sqrt() * self.y_std)
    }
}

fn surrogate_error(message: impl Into<String>) -> TuneError {
    TuneError::SurrogateOptimization {
        message: message.into(),
    }
}
