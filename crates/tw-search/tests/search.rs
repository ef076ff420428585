use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;

use tw_engine::{Diagnostics, MetricSet, ModelBackend, Rmse, Workflow};
use tw_search::{
    tune_bayes, ControlSearch, GaussianProcessProposer, History, Initial, ProposalMode, Proposer,
    SearchError, SearchPhase, SearchSpace, SearchState, SequentialSearch, StopReason,
};
use tw_types::{
    Candidate, Dataset, FitError, ParamMap, Processed, Resample, TuneError, TuneResult,
};

/// Ignores its parameter: every candidate scores the same.
struct Flat;

impl ModelBackend for Flat {
    type Fitted = f64;

    fn fit(&self, train: &Processed, _params: &ParamMap, _d: &mut Diagnostics) -> Result<f64, FitError> {
        Ok(train.outcome.iter().sum::<f64>() / train.len() as f64)
    }

    fn predict(&self, mean: &f64, data: &Processed, _d: &mut Diagnostics) -> Result<Vec<f64>, FitError> {
        Ok(vec![*mean; data.len()])
    }
}

/// Predictions are off by exactly `|x - 3|`, so rmse is `|x - 3|`.
#[derive(Default)]
struct Shifted {
    fits: Arc<Mutex<usize>>,
}

impl ModelBackend for Shifted {
    type Fitted = f64;

    fn fit(&self, _train: &Processed, params: &ParamMap, _d: &mut Diagnostics) -> Result<f64, FitError> {
        *self.fits.lock() += 1;
        params
            .get("x")
            .and_then(|v| v.as_f64())
            .map(|x| (x - 3.0).abs())
            .ok_or_else(|| FitError::model_fit("x is required"))
    }

    fn predict(&self, offset: &f64, data: &Processed, _d: &mut Diagnostics) -> Result<Vec<f64>, FitError> {
        Ok(data.outcome.iter().map(|y| y + offset).collect())
    }
}

struct Broken;

impl ModelBackend for Broken {
    type Fitted = ();

    fn fit(&self, _train: &Processed, _params: &ParamMap, _d: &mut Diagnostics) -> Result<(), FitError> {
        Err(FitError::model_fit("singular design matrix"))
    }

    fn predict(&self, _fitted: &(), _data: &Processed, _d: &mut Diagnostics) -> Result<Vec<f64>, FitError> {
        Ok(Vec::new())
    }
}

/// Delegates to the Gaussian-process proposer and remembers every mode.
struct Recording {
    inner: GaussianProcessProposer,
    modes: Arc<Mutex<Vec<ProposalMode>>>,
}

impl Proposer for Recording {
    fn propose(
        &self,
        history: &History<'_>,
        space: &SearchSpace,
        budget: usize,
        mode: ProposalMode,
        rng: &mut dyn RngCore,
    ) -> TuneResult<Vec<Candidate>> {
        self.modes.lock().push(mode);
        self.inner.propose(history, space, budget, mode, rng)
    }

    fn name(&self) -> &str {
        "recording"
    }
}

fn data() -> Dataset {
    Dataset::new(
        vec!["z".into()],
        (0..12).map(|i| vec![i as f64]).collect(),
        (0..12).map(|i| (i % 4) as f64).collect(),
    )
    .unwrap()
}

fn resamples() -> Vec<Resample> {
    vec![
        Resample::new("Fold1", (0..6).collect(), (6..12).collect()),
        Resample::new("Fold2", (6..12).collect(), (0..6).collect()),
    ]
}

fn space() -> SearchSpace {
    SearchSpace::new().add_float("x", 0.0, 10.0)
}

fn initial(xs: &[f64]) -> Initial {
    Initial::Candidates(xs.iter().map(|&x| Candidate::default().with_model("x", x)).collect())
}

#[test]
fn no_improvement_stops_at_the_limit() {
    let (data, resamples) = (data(), resamples());
    let workflow = Workflow::model_only(Flat, MetricSet::new().with(Rmse));
    let control = ControlSearch::default()
        .with_initial(Initial::Random(3))
        .with_iter(30)
        .with_no_improve(20)
        .with_n_candidates(200)
        .with_seed(17);

    let results = tune_bayes(&data, &resamples, &workflow, space(), control).unwrap();

    assert_eq!(results.stop_reason, Some(StopReason::NoImprovement));
    assert_eq!(results.iterations(), 20);
    assert_eq!(results.best_by_iteration.len(), 21);
    assert!(results.best_by_iteration[1..].iter().all(|b| !b.improved));
    assert_eq!(results.records().iter().map(|r| r.iteration).max(), Some(20));
    assert_eq!(results.results.rows.len(), 21 * resamples.len());
    assert_eq!(results.status.state, SearchState::Completed);
}

#[test]
fn iteration_budget_is_never_exceeded() {
    let (data, resamples) = (data(), resamples());
    let workflow = Workflow::model_only(Shifted::default(), MetricSet::new().with(Rmse));
    let control = ControlSearch::default()
        .with_initial(initial(&[0.0, 9.0]))
        .with_iter(4)
        .with_no_improve(10)
        .with_n_candidates(200);

    let results = tune_bayes(&data, &resamples, &workflow, space(), control).unwrap();

    assert_eq!(results.stop_reason, Some(StopReason::IterationBudget));
    assert_eq!(results.iterations(), 4);
    assert!(results.records().iter().all(|r| r.iteration <= 4));
    let labels: Vec<&str> = results.summary.iter().map(|m| m.config.as_str()).collect();
    assert_eq!(labels[2..], ["Iter1", "Iter2", "Iter3", "Iter4"]);
}

#[test]
fn best_is_monotone() {
    let (data, resamples) = (data(), resamples());
    let workflow = Workflow::model_only(Shifted::default(), MetricSet::new().with(Rmse));
    let control = ControlSearch::default()
        .with_initial(initial(&[0.5, 9.5, 6.0]))
        .with_iter(8)
        .with_no_improve(8)
        .with_n_candidates(300)
        .with_seed(3);

    let results = tune_bayes(&data, &resamples, &workflow, space(), control).unwrap();

    let means: Vec<f64> = results.best_by_iteration.iter().map(|b| b.mean).collect();
    assert!(means.windows(2).all(|w| w[1] <= w[0]), "best went backwards: {means:?}");
    let best = results.best().unwrap();
    assert!(best.mean <= 3.0);
    assert_eq!(results.status.best.as_ref().map(|b| b.mean), Some(best.mean));
}

#[test]
fn every_candidate_is_fitted_once_per_resample() {
    let (data, resamples) = (data(), resamples());
    let fits = Arc::new(Mutex::new(0));
    let workflow = Workflow::model_only(
        Shifted { fits: fits.clone() },
        MetricSet::new().with(Rmse),
    );
    let control = ControlSearch::default()
        .with_initial(initial(&[1.0, 8.0]))
        .with_iter(3)
        .with_batch_size(2)
        .with_n_candidates(200);

    let results = tune_bayes(&data, &resamples, &workflow, space(), control).unwrap();

    let candidates = results.summary.len();
    assert_eq!(candidates, 2 + 3 * 2);
    assert_eq!(*fits.lock(), candidates * resamples.len());
    assert!(results.summary.iter().any(|m| m.config == "Iter1_1"));
    assert!(results.summary.iter().any(|m| m.config == "Iter3_2"));
}

#[test]
fn phases_are_observable() {
    let (data, resamples) = (data(), resamples());
    let workflow = Workflow::model_only(Shifted::default(), MetricSet::new().with(Rmse));
    let control = ControlSearch::default()
        .with_initial(initial(&[1.0, 8.0]))
        .with_iter(1)
        .with_n_candidates(100);
    let mut search = SequentialSearch::new(&data, &resamples, &workflow, space(), control).unwrap();

    assert_eq!(search.phase(), SearchPhase::Initializing);
    let mut phases = Vec::new();
    while search.phase() != SearchPhase::Stopped {
        phases.push(search.step().unwrap());
    }
    assert_eq!(
        phases,
        vec![
            SearchPhase::Evaluating,
            SearchPhase::Aggregating,
            SearchPhase::Proposing,
            SearchPhase::Evaluating,
            SearchPhase::Aggregating,
            SearchPhase::Stopped,
        ]
    );
    assert_eq!(search.iteration(), 1);
    assert_eq!(search.candidates().len(), 3);

    let results = search.run().unwrap();
    assert_eq!(results.stop_reason, Some(StopReason::IterationBudget));
}

#[test]
fn exhausted_space_fails_with_history() {
    let (data, resamples) = (data(), resamples());
    let workflow = Workflow::model_only(Shifted::default(), MetricSet::new().with(Rmse));
    let space = SearchSpace::new().add_int("x", 0, 2);
    let control = ControlSearch::default()
        .with_initial(Initial::Candidates(
            (0..=2i64).map(|x| Candidate::default().with_model("x", x)).collect(),
        ))
        .with_n_candidates(50);

    let err = tune_bayes(&data, &resamples, &workflow, space, control).unwrap_err();
    match &err {
        SearchError::Surrogate {
            iteration,
            source,
            history,
        } => {
            assert_eq!(*iteration, 0);
            assert!(matches!(source, TuneError::SurrogateOptimization { .. }));
            assert_eq!(history.results.rows.len(), resamples.len());
            assert_eq!(history.summary.len(), 3);
            assert_eq!(history.stop_reason, None);
            assert_eq!(history.status.state, SearchState::Failed);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.history().is_some());
}

#[test]
fn initial_batch_without_estimates_is_fatal() {
    let (data, resamples) = (data(), resamples());
    let workflow = Workflow::model_only(Broken, MetricSet::new().with(Rmse));
    let control = ControlSearch::default().with_initial(Initial::Random(2));

    let err = tune_bayes(&data, &resamples, &workflow, space(), control).unwrap_err();
    let history = err.history().expect("partial history");
    assert_eq!(history.records().len(), 4);
    assert_eq!(history.results.warnings.len(), 1);
    assert!(err.to_string().contains("no finite rmse"));
}

#[test]
fn unknown_metric_is_rejected() {
    let (data, resamples) = (data(), resamples());
    let workflow = Workflow::model_only(Flat, MetricSet::new().with(Rmse));
    let control = ControlSearch::default().with_metric("roc_auc");
    let err = tune_bayes(&data, &resamples, &workflow, space(), control).unwrap_err();
    assert!(matches!(
        err,
        SearchError::Tune(TuneError::MetricNotFound { .. })
    ));
}

#[test]
fn stalled_runs_switch_to_uncertainty_sampling() {
    let (data, resamples) = (data(), resamples());
    let workflow = Workflow::model_only(Flat, MetricSet::new().with(Rmse));
    let modes = Arc::new(Mutex::new(Vec::new()));
    let proposer = Recording {
        inner: GaussianProcessProposer::default().with_n_candidates(100),
        modes: modes.clone(),
    };
    let control = ControlSearch::default()
        .with_initial(initial(&[2.0, 7.0]))
        .with_iter(10)
        .with_no_improve(5)
        .with_uncertain(2);

    let results = SequentialSearch::with_proposer(&data, &resamples, &workflow, space(), proposer, control)
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(results.stop_reason, Some(StopReason::NoImprovement));
    use ProposalMode::{Acquisition as A, MaxUncertainty as U};
    assert_eq!(*modes.lock(), vec![A, A, U, A, U]);
}
