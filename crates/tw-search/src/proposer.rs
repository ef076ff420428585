//! Candidate proposal strategies for sequential search.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

use tw_types::{Candidate, CandidateSet, TuneError, TuneResult};

use crate::acquisition::Acquisition;
use crate::space::SearchSpace;
use crate::surrogate::{GaussianProcess, DEFAULT_NOISE_VAR};

/// Maximum number of observations used to fit the surrogate. Caps the
/// Cholesky cost; the most recent observations are kept.
pub const MAX_TRAIN_POINTS: usize = 100;

pub const DEFAULT_N_CANDIDATES: usize = 1000;

/// Observed performance of one candidate, oriented so that larger is better.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub candidate: Candidate,
    pub value: f64,
}

/// What a proposer knows about the run so far.
#[derive(Debug, Clone, Copy)]
pub struct History<'a> {
    pub observations: &'a [Observation],
    /// Every candidate evaluated so far, successful or not.
    pub evaluated: &'a CandidateSet,
}

/// How the next candidates should be chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalMode {
    /// Maximize the acquisition function.
    Acquisition,
    /// Pick the point the surrogate is least sure about.
    MaxUncertainty,
}

/// Pluggable proposal strategy.
pub trait Proposer: Send + Sync {
    /// Propose up to `budget` candidates not in `history.evaluated`.
    fn propose(
        &self,
        history: &History<'_>,
        space: &SearchSpace,
        budget: usize,
        mode: ProposalMode,
        rng: &mut dyn RngCore,
    ) -> TuneResult<Vec<Candidate>>;

    fn name(&self) -> &str;
}

/// Gaussian-process surrogate with acquisition maximized over random points
/// of the unit cube.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianProcessProposer {
    pub acquisition: Acquisition,
    /// Random points scored per proposal round.
    pub n_candidates: usize,
    pub noise_variance: f64,
}

impl Default for GaussianProcessProposer {
    fn default() -> Self {
        Self {
            acquisition: Acquisition::default(),
            n_candidates: DEFAULT_N_CANDIDATES,
            noise_variance: DEFAULT_NOISE_VAR,
        }
    }
}

impl GaussianProcessProposer {
    pub fn new(acquisition: Acquisition) -> Self {
        Self {
            acquisition,
            ..Self::default()
        }
    }

    pub fn with_n_candidates(mut self, n: usize) -> Self {
        self.n_candidates = n;
        self
    }

    pub fn with_noise_variance(mut self, v: f64) -> Self {
        self.noise_variance = v;
        self
    }
}

impl Proposer for GaussianProcessProposer {
    fn propose(
        &self,
        history: &History<'_>,
        space: &SearchSpace,
        budget: usize,
        mode: ProposalMode,
        rng: &mut dyn RngCore,
    ) -> TuneResult<Vec<Candidate>> {
        let (x, y): (Vec<Vec<f64>>, Vec<f64>) = history
            .observations
            .iter()
            .filter(|o| o.value.is_finite())
            .filter_map(|o| space.encode(&o.candidate).map(|point| (point, o.value)))
            .unzip();
        if x.is_empty() {
            return Err(TuneError::SurrogateOptimization {
                message: "no finite observations inside the search space to fit the surrogate"
                    .to_string(),
            });
        }
        let skip = x.len().saturating_sub(MAX_TRAIN_POINTS);
        let gp = GaussianProcess::fit(&x[skip..], &y[skip..], self.noise_variance)?;
        let best = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let dims = space.dims();
        let mut scored: Vec<(f64, Vec<f64>)> = (0..self.n_candidates)
            .map(|_| {
                let point: Vec<f64> = (0..dims).map(|_| rng.gen_range(0.0..=1.0)).collect();
                let (mean, std) = gp.predict(&point);
                let score = match mode {
                    ProposalMode::Acquisition => self.acquisition.score(mean, std, best),
                    ProposalMode::MaxUncertainty => std,
                };
                (if score.is_finite() { score } else { f64::NEG_INFINITY }, point)
            })
            .collect();
        // stable: ties keep the first-sampled point
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut chosen: Vec<Candidate> = Vec::with_capacity(budget);
        let mut seen: HashSet<Candidate> = HashSet::new();
        for (score, point) in scored {
            if chosen.len() >= budget {
                break;
            }
            let candidate = space.decode(&point);
            if history.evaluated.contains(&candidate) || !seen.insert(candidate.clone()) {
                continue;
            }
            debug!(score, candidate = %candidate, mode = ?mode, "proposed candidate");
            chosen.push(candidate);
        }

        if chosen.is_empty() {
            return Err(TuneError::SurrogateOptimization {
                message: format!(
                    "none of the {} sampled points decode to an unevaluated candidate",
                    self.n_candidates
                ),
            });
        }
        Ok(chosen)
    }

    fn name(&self) -> &str {
        self.acquisition.name()
    }
}
