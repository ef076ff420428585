//! Execution loop: the (resample × candidate) cross product.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use tracing::{info, warn};

use tw_types::{validation_error, CandidateSet, Dataset, FitRecord, Resample, RunWarning, Stage, TuneResult};

use crate::backend::{ModelBackend, Preprocessor, Workflow};
use crate::control::{ControlGrid, ParallelOver};
use crate::fit::{evaluate_group, ResampleRef};
use crate::results::TuneResults;

/// Records from one run plus any run-level warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    /// One record per (resample, candidate), in canonical order.
    pub records: Vec<FitRecord>,
    pub warnings: Vec<RunWarning>,
}

/// Evaluate every candidate in the set on every resample.
pub fn run<P, M>(
    data: &Dataset,
    resamples: &[Resample],
    candidates: &CandidateSet,
    workflow: &Workflow<P, M>,
    control: &ControlGrid,
) -> TuneResult<RunOutput>
where
    P: Preprocessor,
    M: ModelBackend,
{
    let positions: Vec<usize> = (0..candidates.len()).collect();
    run_subset(data, resamples, candidates, &positions, workflow, control)
}

/// Evaluate the candidates at `positions` on every resample.
///
/// Records come back sorted by resample order, then by the order of
/// `positions`, whatever the parallel schedule was. Individual fit failures
/// never produce an `Err`: only invalid inputs do, before anything is fitted.
pub fn run_subset<P, M>(
    data: &Dataset,
    resamples: &[Resample],
    candidates: &CandidateSet,
    positions: &[usize],
    workflow: &Workflow<P, M>,
    control: &ControlGrid,
) -> TuneResult<RunOutput>
where
    P: Preprocessor,
    M: ModelBackend,
{
    validate_inputs(data, resamples, candidates, positions, workflow)?;

    let groups = candidates.preprocessing_groups(positions.iter().copied());
    info!(
        resamples = resamples.len(),
        candidates = positions.len(),
        groups = groups.len(),
        parallel_over = ?control.parallel_over,
        "starting evaluation"
    );

    let refs: Vec<ResampleRef<'_>> = resamples
        .iter()
        .enumerate()
        .map(|(index, resample)| ResampleRef { index, resample })
        .collect();

    let mut records: Vec<FitRecord> = match control.parallel_over {
        ParallelOver::Sequential => refs
            .iter()
            .flat_map(|&r| {
                groups
                    .iter()
                    .flat_map(move |g| evaluate_group(data, r, g, candidates, workflow, control))
            })
            .collect(),
        ParallelOver::Resamples => refs
            .par_iter()
            .flat_map_iter(|&r| {
                groups
                    .iter()
                    .flat_map(move |g| evaluate_group(data, r, g, candidates, workflow, control))
            })
            .collect(),
        ParallelOver::ResamplesAndGroups => {
            let jobs: Vec<_> = refs
                .iter()
                .flat_map(|&r| groups.iter().map(move |g| (r, g)))
                .collect();
            jobs.par_iter()
                .flat_map_iter(|&(r, g)| evaluate_group(data, r, g, candidates, workflow, control))
                .collect()
        }
    };

    let rank: HashMap<usize, usize> = positions
        .iter()
        .enumerate()
        .map(|(rank, &position)| (position, rank))
        .collect();
    records.sort_by_key(|r| (r.resample_index, rank.get(&r.candidate_index).copied()));

    let warnings = run_warnings(&records);
    let succeeded = records.iter().filter(|r| r.succeeded()).count();
    info!(
        fits = records.len(),
        succeeded,
        failed = records.len() - succeeded,
        "evaluation finished"
    );

    Ok(RunOutput { records, warnings })
}

/// Run a grid and assemble the result table.
pub fn tune_grid<P, M>(
    data: &Dataset,
    resamples: &[Resample],
    candidates: &CandidateSet,
    workflow: &Workflow<P, M>,
    control: &ControlGrid,
) -> TuneResult<TuneResults>
where
    P: Preprocessor,
    M: ModelBackend,
{
    let output = run(data, resamples, candidates, workflow, control)?;
    Ok(TuneResults::from_run(
        resamples,
        output,
        workflow.metrics.info(),
        control.save_pred,
        workflow.extract.is_some(),
        false,
    ))
}

fn validate_inputs<P, M>(
    data: &Dataset,
    resamples: &[Resample],
    candidates: &CandidateSet,
    positions: &[usize],
    workflow: &Workflow<P, M>,
) -> TuneResult<()>
where
    P: Preprocessor,
    M: ModelBackend,
{
    if resamples.is_empty() {
        return Err(validation_error!("no resamples supplied"));
    }
    if positions.is_empty() {
        return Err(validation_error!("no candidates to evaluate"));
    }
    if let Some(&bad) = positions.iter().find(|&&p| p >= candidates.len()) {
        return Err(validation_error!(
            "candidate position {} is outside a set of {}",
            bad,
            candidates.len()
        ));
    }
    if workflow.metrics.is_empty() {
        return Err(validation_error!("the workflow has no metrics"));
    }
    let mut ids = HashSet::new();
    for resample in resamples {
        if !ids.insert(resample.id.as_str()) {
            return Err(validation_error!("duplicate resample id {}", resample.id));
        }
        resample.validate(data.n_rows())?;
    }
    Ok(())
}

/// Raise `AllCandidatesFailed` when no fit in the run succeeded.
fn run_warnings(records: &[FitRecord]) -> Vec<RunWarning> {
    if records.is_empty() || records.iter().any(|r| r.succeeded()) {
        return Vec::new();
    }

    let mut stages = records.iter().filter_map(|r| r.failed_stage());
    let first: Option<Stage> = stages.next();
    let stage = first.filter(|s| stages.all(|other| other == *s));

    let warning = RunWarning::AllCandidatesFailed {
        stage,
        fits: records.len(),
    };
    warn!("{warning}");
    vec![warning]
}
