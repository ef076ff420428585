//! Sequential search controller.
//!
//! Evaluates an initial batch, then alternates between asking a [`Proposer`]
//! for new candidates and evaluating them, until the iteration budget, the
//! no-improvement limit or the time limit is reached. The run is a small state
//! machine whose phase can be observed between calls to
//! [`SequentialSearch::step`].

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

use tw_engine::{aggregate, run_subset, ControlGrid, MetricInfo, ModelBackend, Preprocessor, RunOutput, TuneResults, Workflow};
use tw_types::{
    config_error, validation_error, AggregatedMetric, Candidate, CandidateSet, Dataset, FitRecord,
    Resample, RunWarning, TuneError, TuneResult,
};

use crate::acquisition::Acquisition;
use crate::proposer::{GaussianProcessProposer, History, Observation, ProposalMode, Proposer, DEFAULT_N_CANDIDATES};
use crate::space::SearchSpace;
use crate::status::{IterationBest, SearchStatus};

/// Where the first batch of candidates comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initial {
    /// Draw this many distinct candidates from the search space.
    Random(usize),
    /// Evaluate exactly these candidates.
    Candidates(Vec<Candidate>),
}

impl Default for Initial {
    fn default() -> Self {
        Self::Random(5)
    }
}

/// Options controlling a sequential search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSearch {
    /// Options for every evaluation round.
    pub control: ControlGrid,
    pub initial: Initial,
    /// Maximum number of proposal rounds after the initial batch.
    pub iter: usize,
    /// Stop after this many consecutive rounds without a better candidate.
    pub no_improve: usize,
    /// After this many rounds without improvement (and every multiple of it),
    /// propose the most uncertain point instead of the acquisition maximizer.
    pub uncertain: Option<usize>,
    pub time_limit_ms: Option<u64>,
    pub seed: u64,
    /// Metric to optimize; the workflow's first metric when unset.
    pub metric: Option<String>,
    pub acquisition: Acquisition,
    /// Random points scored per proposal round.
    pub n_candidates: usize,
    /// Candidates proposed per round.
    pub batch_size: usize,
}

impl Default for ControlSearch {
    fn default() -> Self {
        Self {
            control: ControlGrid::default(),
            initial: Initial::default(),
            iter: 10,
            no_improve: 10,
            uncertain: None,
            time_limit_ms: None,
            seed: 1,
            metric: None,
            acquisition: Acquisition::default(),
            n_candidates: DEFAULT_N_CANDIDATES,
            batch_size: 1,
        }
    }
}

impl ControlSearch {
    /// Load from a JSON document; absent fields take their defaults.
    pub fn from_json_str(json: &str) -> TuneResult<Self> {
        let control: Self = serde_json::from_str(json)?;
        control.validate()?;
        Ok(control)
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.no_improve == 0 {
            return Err(config_error!("no_improve must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(config_error!("batch_size must be at least 1"));
        }
        if self.n_candidates == 0 {
            return Err(config_error!("n_candidates must be at least 1"));
        }
        if self.uncertain == Some(0) {
            return Err(config_error!("uncertain must be at least 1 when set"));
        }
        match &self.initial {
            Initial::Random(0) => Err(config_error!("the initial batch needs at least one candidate")),
            Initial::Candidates(c) if c.is_empty() => {
                Err(config_error!("the initial batch needs at least one candidate"))
            }
            _ => Ok(()),
        }
    }

    pub fn with_control(mut self, control: ControlGrid) -> Self {
        self.control = control;
        self
    }

    pub fn with_initial(mut self, initial: Initial) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_iter(mut self, iter: usize) -> Self {
        self.iter = iter;
        self
    }

    pub fn with_no_improve(mut self, no_improve: usize) -> Self {
        self.no_improve = no_improve;
        self
    }

    pub fn with_uncertain(mut self, uncertain: usize) -> Self {
        self.uncertain = Some(uncertain);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_ms = Some(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    pub fn with_acquisition(mut self, acquisition: Acquisition) -> Self {
        self.acquisition = acquisition;
        self
    }

    pub fn with_n_candidates(mut self, n: usize) -> Self {
        self.n_candidates = n;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPhase {
    Initializing,
    Proposing,
    Evaluating,
    Aggregating,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IterationBudget,
    NoImprovement,
    TimeLimit,
}

/// Cumulative history of a search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    /// One row per (iteration, resample).
    pub results: TuneResults,
    pub summary: Vec<AggregatedMetric>,
    pub best_by_iteration: Vec<IterationBest>,
    /// `None` when the run ended in an error.
    pub stop_reason: Option<StopReason>,
    pub target: MetricInfo,
    pub status: SearchStatus,
}

impl SearchResults {
    pub fn best(&self) -> Option<&IterationBest> {
        self.best_by_iteration.last()
    }

    /// Last completed iteration.
    pub fn iterations(&self) -> usize {
        self.best_by_iteration.last().map_or(0, |b| b.iteration)
    }

    pub fn records(&self) -> &[FitRecord] {
        self.results.records()
    }

    pub fn to_json(&self) -> TuneResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Error, Debug)]
pub enum SearchError {
    /// The surrogate could not be fitted or optimized. `history` holds
    /// everything evaluated up to and including `iteration`.
    #[error("surrogate optimization failed after iteration {iteration}: {source}")]
    Surrogate {
        iteration: usize,
        source: TuneError,
        history: Box<SearchResults>,
    },

    #[error(transparent)]
    Tune(#[from] TuneError),
}

impl SearchError {
    pub fn history(&self) -> Option<&SearchResults> {
        match self {
            Self::Surrogate { history, .. } => Some(history),
            Self::Tune(_) => None,
        }
    }
}

/// A sequential (Bayesian) search over `space`.
pub struct SequentialSearch<'a, P, M, Q = GaussianProcessProposer>
where
    P: Preprocessor,
    M: ModelBackend,
    Q: Proposer,
{
    data: &'a Dataset,
    resamples: &'a [Resample],
    workflow: &'a Workflow<P, M>,
    space: SearchSpace,
    proposer: Q,
    control: ControlSearch,
    target: MetricInfo,
    phase: SearchPhase,
    iteration: usize,
    pending: Vec<usize>,
    candidates: CandidateSet,
    records: Vec<FitRecord>,
    warnings: Vec<RunWarning>,
    summary: Vec<AggregatedMetric>,
    best_by_iteration: Vec<IterationBest>,
    since_improvement: usize,
    stop_reason: Option<StopReason>,
    status: SearchStatus,
    rng: ChaCha8Rng,
    started: Instant,
}

impl<'a, P, M> SequentialSearch<'a, P, M, GaussianProcessProposer>
where
    P: Preprocessor,
    M: ModelBackend,
{
    /// Search with the Gaussian-process proposer configured by `control`.
    pub fn new(
        data: &'a Dataset,
        resamples: &'a [Resample],
        workflow: &'a Workflow<P, M>,
        space: SearchSpace,
        control: ControlSearch,
    ) -> TuneResult<Self> {
        let proposer =
            GaussianProcessProposer::new(control.acquisition).with_n_candidates(control.n_candidates);
        Self::with_proposer(data, resamples, workflow, space, proposer, control)
    }
}

impl<'a, P, M, Q> SequentialSearch<'a, P, M, Q>
where
    P: Preprocessor,
    M: ModelBackend,
    Q: Proposer,
{
    pub fn with_proposer(
        data: &'a Dataset,
        resamples: &'a [Resample],
        workflow: &'a Workflow<P, M>,
        space: SearchSpace,
        proposer: Q,
        control: ControlSearch,
    ) -> TuneResult<Self> {
        control.validate()?;
        space.validate()?;
        let metrics = workflow.metrics.info();
        let target = match control.metric.as_deref() {
            Some(name) => metrics.iter().find(|m| m.name == name).cloned().ok_or_else(|| {
                TuneError::MetricNotFound {
                    metric: name.to_string(),
                }
            })?,
            None => metrics
                .first()
                .cloned()
                .ok_or_else(|| validation_error!("the workflow has no metrics"))?,
        };

        Ok(Self {
            data,
            resamples,
            workflow,
            space,
            proposer,
            status: SearchStatus::new(target.name.clone(), target.direction),
            rng: ChaCha8Rng::seed_from_u64(control.seed),
            control,
            target,
            phase: SearchPhase::Initializing,
            iteration: 0,
            pending: Vec::new(),
            candidates: CandidateSet::new(),
            records: Vec::new(),
            warnings: Vec::new(),
            summary: Vec::new(),
            best_by_iteration: Vec::new(),
            since_improvement: 0,
            stop_reason: None,
            started: Instant::now(),
        })
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn candidates(&self) -> &CandidateSet {
        &self.candidates
    }

    /// Advance by one phase and return the new phase.
    pub fn step(&mut self) -> Result<SearchPhase, SearchError> {
        match self.phase {
            SearchPhase::Initializing => self.initialize()?,
            SearchPhase::Evaluating => self.evaluate()?,
            SearchPhase::Aggregating => self.aggregate_iteration()?,
            SearchPhase::Proposing => self.propose()?,
            SearchPhase::Stopped => {}
        }
        Ok(self.phase)
    }

    /// Run to completion.
    pub fn run(mut self) -> Result<SearchResults, SearchError> {
        while self.phase != SearchPhase::Stopped {
            self.step()?;
        }
        Ok(self.into_results())
    }

    fn initialize(&mut self) -> Result<(), SearchError> {
        self.status.mark_running();
        self.started = Instant::now();
        let initial = match &self.control.initial {
            Initial::Candidates(candidates) => candidates.clone(),
            Initial::Random(n) => self.space.sample_unique(*n, &mut self.rng)?,
        };
        self.candidates = CandidateSet::from_grid(initial);
        self.pending = (0..self.candidates.len()).collect();
        info!(
            candidates = self.candidates.len(),
            metric = %self.target.name,
            iter = self.control.iter,
            no_improve = self.control.no_improve,
            "starting sequential search"
        );
        self.phase = SearchPhase::Evaluating;
        Ok(())
    }

    fn evaluate(&mut self) -> Result<(), SearchError> {
        debug!(iteration = self.iteration, candidates = self.pending.len(), "evaluating");
        let RunOutput { records, warnings } = run_subset(
            self.data,
            self.resamples,
            &self.candidates,
            &self.pending,
            self.workflow,
            &self.control.control,
        )?;
        self.status.record_fits(&records);
        self.records.extend(records);
        self.warnings.extend(warnings);
        self.pending.clear();
        self.phase = SearchPhase::Aggregating;
        Ok(())
    }

    fn aggregate_iteration(&mut self) -> Result<(), SearchError> {
        self.summary = aggregate(&self.records);
        let best = self.current_best();

        if self.iteration == 0 && best.is_none() {
            let source = TuneError::SurrogateOptimization {
                message: format!(
                    "the initial batch produced no finite {} estimates",
                    self.target.name
                ),
            };
            return Err(self.fail(source));
        }

        let improved = best.map_or(false, |b| self.status.update_best(&b));
        if let Some(current) = self.status.best.clone() {
            self.best_by_iteration.push(IterationBest {
                iteration: self.iteration,
                improved,
                ..current
            });
        }
        if self.iteration > 0 {
            self.since_improvement = if improved { 0 } else { self.since_improvement + 1 };
        }
        self.status.iterations_completed = self.iteration;

        info!(
            iteration = self.iteration,
            best = ?self.status.best.as_ref().map(|b| b.mean),
            improved,
            since_improvement = self.since_improvement,
            "iteration complete"
        );

        let reason = if self.iteration >= self.control.iter {
            Some(StopReason::IterationBudget)
        } else if self.since_improvement >= self.control.no_improve {
            Some(StopReason::NoImprovement)
        } else if self
            .control
            .time_limit()
            .map_or(false, |limit| self.started.elapsed() >= limit)
        {
            Some(StopReason::TimeLimit)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                info!(iteration = self.iteration, reason = ?reason, "sequential search stopped");
                self.stop_reason = Some(reason);
                self.status.mark_completed();
                self.phase = SearchPhase::Stopped;
            }
            None => self.phase = SearchPhase::Proposing,
        }
        Ok(())
    }

    fn propose(&mut self) -> Result<(), SearchError> {
        let next = self.iteration + 1;
        let observations: Vec<Observation> = self
            .summary
            .iter()
            .filter(|m| m.metric == self.target.name && m.estimator == self.target.estimator)
            .filter_map(|m| {
                m.mean.filter(|v| v.is_finite()).map(|mean| Observation {
                    candidate: m.candidate.clone(),
                    value: self.target.direction.orient(mean),
                })
            })
            .collect();

        let mode = match self.control.uncertain {
            Some(every) if self.since_improvement > 0 && self.since_improvement % every == 0 => {
                ProposalMode::MaxUncertainty
            }
            _ => ProposalMode::Acquisition,
        };
        let history = History {
            observations: &observations,
            evaluated: &self.candidates,
        };
        let proposed = self.proposer.propose(
            &history,
            &self.space,
            self.control.batch_size,
            mode,
            &mut self.rng,
        );

        let proposed = match proposed {
            Ok(proposed) => proposed,
            Err(source) => return Err(self.fail(source)),
        };
        let positions = self.candidates.push_iteration(next, proposed);
        if positions.is_empty() {
            let source = TuneError::SurrogateOptimization {
                message: format!("{} proposed no new candidates", self.proposer.name()),
            };
            return Err(self.fail(source));
        }

        debug!(iteration = next, mode = ?mode, proposed = positions.len(), "proposed candidates");
        self.iteration = next;
        self.pending = positions;
        self.phase = SearchPhase::Evaluating;
        Ok(())
    }

    /// Best finite mean of the target metric; ties keep creation order.
    fn current_best(&self) -> Option<IterationBest> {
        let mut best: Option<&AggregatedMetric> = None;
        for row in &self.summary {
            if row.metric != self.target.name || row.estimator != self.target.estimator {
                continue;
            }
            let Some(mean) = row.mean.filter(|v| v.is_finite()) else {
                continue;
            };
            let better = match best.and_then(|b| b.mean) {
                None => true,
                Some(incumbent) => self.target.direction.improves(mean, incumbent),
            };
            if better {
                best = Some(row);
            }
        }
        best.and_then(|row| {
            row.mean.map(|mean| IterationBest {
                iteration: self.iteration,
                config: row.config.clone(),
                candidate: row.candidate.clone(),
                mean,
                improved: false,
            })
        })
    }

    fn fail(&mut self, source: TuneError) -> SearchError {
        error!(iteration = self.iteration, error = %source, "sequential search failed");
        self.status.mark_failed(source.to_string());
        self.phase = SearchPhase::Stopped;
        SearchError::Surrogate {
            iteration: self.iteration,
            source,
            history: Box::new(self.snapshot()),
        }
    }

    fn tune_results(&self, records: Vec<FitRecord>, warnings: Vec<RunWarning>) -> TuneResults {
        TuneResults::from_run(
            self.resamples,
            RunOutput { records, warnings },
            self.workflow.metrics.info(),
            self.control.control.save_pred,
            self.workflow.extract.is_some(),
            true,
        )
    }

    fn snapshot(&self) -> SearchResults {
        SearchResults {
            results: self.tune_results(self.records.clone(), self.warnings.clone()),
            summary: self.summary.clone(),
            best_by_iteration: self.best_by_iteration.clone(),
            stop_reason: self.stop_reason,
            target: self.target.clone(),
            status: self.status.clone(),
        }
    }

    fn into_results(mut self) -> SearchResults {
        let records = std::mem::take(&mut self.records);
        let warnings = std::mem::take(&mut self.warnings);
        SearchResults {
            results: self.tune_results(records, warnings),
            summary: self.summary,
            best_by_iteration: self.best_by_iteration,
            stop_reason: self.stop_reason,
            target: self.target,
            status: self.status,
        }
    }
}

/// Run a sequential search with the default Gaussian-process proposer.
pub fn tune_bayes<P, M>(
    data: &Dataset,
    resamples: &[Resample],
    workflow: &Workflow<P, M>,
    space: SearchSpace,
    control: ControlSearch,
) -> Result<SearchResults, SearchError>
where
    P: Preprocessor,
    M: ModelBackend,
{
    SequentialSearch::new(data, resamples, workflow, space, control)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_json() {
        let control = ControlSearch::default();
        assert_eq!(control.iter, 10);
        assert_eq!(control.no_improve, 10);
        assert_eq!(control.initial, Initial::Random(5));

        let control = ControlSearch::from_json_str(
            r#"{
                "iter": 30,
                "no_improve": 20,
                "initial": {"random": 8},
                "metric": "rmse",
                "acquisition": {"type": "confidence_bound", "kappa": 0.1},
                "control": {"save_pred": true}
            }"#,
        )
        .unwrap();
        assert_eq!(control.iter, 30);
        assert_eq!(control.initial, Initial::Random(8));
        assert_eq!(control.metric.as_deref(), Some("rmse"));
        assert!(control.control.save_pred);
        assert_eq!(control.batch_size, 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            ControlSearch::from_json_str(r#"{"no_improve": 0}"#),
            Err(TuneError::Config(_))
        ));
        assert!(ControlSearch::from_json_str(r#"{"initial": {"random": 0}}"#).is_err());
        assert!(matches!(
            ControlSearch::from_json_str("{not json"),
            Err(TuneError::Serialization(_))
        ));
        assert!(ControlSearch::default().with_uncertain(0).validate().is_err());
    }

    #[test]
    fn builders() {
        let control = ControlSearch::default()
            .with_iter(3)
            .with_no_improve(2)
            .with_seed(9)
            .with_batch_size(2)
            .with_time_limit(Duration::from_secs(1));
        assert_eq!(control.iter, 3);
        assert_eq!(control.batch_size, 2);
        assert_eq!(control.time_limit(), Some(Duration::from_secs(1)));

        let forever = ControlSearch::default().with_time_limit(Duration::MAX);
        assert_eq!(forever.time_limit_ms, Some(u64::MAX));
    }
}
