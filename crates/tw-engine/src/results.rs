//! Result table and collectors.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use tw_types::{
    estimate_or_nan, AggregatedMetric, Candidate, FitRecord, ParamMap, Resample, RunWarning,
    Severity, Stage, TuneError, TuneResult,
};

use crate::aggregate::aggregate;
use crate::execution::RunOutput;
use crate::metrics::MetricInfo;

/// One metric estimate of one candidate inside a resample row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMetric {
    pub config: String,
    pub params: ParamMap,
    pub metric: String,
    pub estimator: String,
    #[serde(deserialize_with = "estimate_or_nan")]
    pub estimate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEntry {
    pub config: String,
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionEntry {
    pub config: String,
    pub params: ParamMap,
    pub row: usize,
    pub truth: f64,
    #[serde(deserialize_with = "estimate_or_nan")]
    pub estimate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractEntry {
    pub config: String,
    pub params: ParamMap,
    pub value: serde_json::Value,
}

/// One row of the result table: everything produced on one resample (and, in
/// sequential mode, one iteration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampleResult {
    pub id: String,
    /// Search iteration; `None` for grid runs.
    pub iteration: Option<usize>,
    pub metrics: Vec<CandidateMetric>,
    pub notes: Vec<NoteEntry>,
    /// `Some` whenever predictions were requested, even if nothing succeeded.
    pub predictions: Option<Vec<PredictionEntry>>,
    /// `Some` whenever an extract function was supplied.
    pub extracts: Option<Vec<ExtractEntry>>,
}

/// A note flattened with its resample and candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRow {
    pub resample_id: String,
    pub iteration: usize,
    pub config: String,
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
}

/// Distinct note with the number of fits that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSummary {
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
    pub count: usize,
}

/// Unsummarized metric row (one per resample).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampleMetric {
    pub resample_id: String,
    pub iteration: usize,
    pub config: String,
    pub candidate: Candidate,
    pub metric: String,
    pub estimator: String,
    #[serde(deserialize_with = "estimate_or_nan")]
    pub estimate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub resample_id: String,
    pub iteration: usize,
    pub config: String,
    pub params: ParamMap,
    pub row: usize,
    pub truth: f64,
    #[serde(deserialize_with = "estimate_or_nan")]
    pub estimate: f64,
}

/// Output of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneResults {
    pub rows: Vec<ResampleResult>,
    pub metrics: Vec<MetricInfo>,
    pub warnings: Vec<RunWarning>,
    /// Per-fit records the collectors are computed from.
    records: Vec<FitRecord>,
}

impl TuneResults {
    /// Assemble the table. Grid runs get one row per resample; sequential runs
    /// one row per (iteration, resample).
    pub fn from_run(
        resamples: &[Resample],
        output: RunOutput,
        metrics: Vec<MetricInfo>,
        save_pred: bool,
        has_extract: bool,
        sequential: bool,
    ) -> Self {
        let RunOutput { records, warnings } = output;

        let mut iterations: Vec<usize> = if sequential {
            records.iter().map(|r| r.iteration).collect()
        } else {
            Vec::new()
        };
        iterations.sort_unstable();
        iterations.dedup();
        let iteration_keys: Vec<Option<usize>> = if sequential {
            iterations.into_iter().map(Some).collect()
        } else {
            vec![None]
        };

        let mut rows: Vec<ResampleResult> = Vec::new();
        let mut slot: HashMap<(Option<usize>, usize), usize> = HashMap::new();
        for iteration in &iteration_keys {
            for (index, resample) in resamples.iter().enumerate() {
                slot.insert((*iteration, index), rows.len());
                rows.push(ResampleResult {
                    id: resample.id.clone(),
                    iteration: *iteration,
                    metrics: Vec::new(),
                    notes: Vec::new(),
                    predictions: save_pred.then(Vec::new),
                    extracts: has_extract.then(Vec::new),
                });
            }
        }

        for record in &records {
            let key = (sequential.then_some(record.iteration), record.resample_index);
            let Some(&i) = slot.get(&key) else { continue };
            let row = &mut rows[i];
            let params = record.candidate.values();

            row.metrics.extend(record.metrics.iter().map(|m| CandidateMetric {
                config: record.config.clone(),
                params: params.clone(),
                metric: m.metric.clone(),
                estimator: m.estimator.clone(),
                estimate: m.estimate,
            }));
            row.notes.extend(record.notes.iter().map(|n| NoteEntry {
                config: record.config.clone(),
                stage: n.stage,
                severity: n.severity,
                message: n.message.clone(),
            }));
            if let (Some(out), Some(predictions)) = (row.predictions.as_mut(), &record.predictions) {
                out.extend(predictions.iter().map(|p| PredictionEntry {
                    config: record.config.clone(),
                    params: params.clone(),
                    row: p.row,
                    truth: p.truth,
                    estimate: p.estimate,
                }));
            }
            if let (Some(out), Some(value)) = (row.extracts.as_mut(), &record.extract) {
                out.push(ExtractEntry {
                    config: record.config.clone(),
                    params,
                    value: value.clone(),
                });
            }
        }

        Self {
            rows,
            metrics,
            warnings,
            records,
        }
    }

    pub fn records(&self) -> &[FitRecord] {
        &self.records
    }

    /// Summarized metrics (mean, standard error, count per candidate/metric).
    pub fn collect_metrics(&self) -> Vec<AggregatedMetric> {
        aggregate(&self.records)
    }

    /// Per-resample metric rows, without summarizing.
    pub fn collect_resample_metrics(&self) -> Vec<ResampleMetric> {
        self.records
            .iter()
            .flat_map(|r| {
                r.metrics.iter().map(move |m| ResampleMetric {
                    resample_id: r.resample_id.clone(),
                    iteration: r.iteration,
                    config: r.config.clone(),
                    candidate: r.candidate.clone(),
                    metric: m.metric.clone(),
                    estimator: m.estimator.clone(),
                    estimate: m.estimate,
                })
            })
            .collect()
    }

    pub fn collect_notes(&self) -> Vec<NoteRow> {
        self.records
            .iter()
            .flat_map(|r| {
                r.notes.iter().map(move |n| NoteRow {
                    resample_id: r.resample_id.clone(),
                    iteration: r.iteration,
                    config: r.config.clone(),
                    stage: n.stage,
                    severity: n.severity,
                    message: n.message.clone(),
                })
            })
            .collect()
    }

    /// Distinct notes in order of first appearance, with occurrence counts.
    pub fn note_summary(&self) -> Vec<NoteSummary> {
        let mut summary: Vec<NoteSummary> = Vec::new();
        let mut index: HashMap<(Stage, Severity, &str), usize> = HashMap::new();
        for note in self.records.iter().flat_map(|r| r.notes.iter()) {
            match index.get(&(note.stage, note.severity, note.message.as_str())) {
                Some(&i) => summary[i].count += 1,
                None => {
                    index.insert((note.stage, note.severity, note.message.as_str()), summary.len());
                    summary.push(NoteSummary {
                        stage: note.stage,
                        severity: note.severity,
                        message: note.message.clone(),
                        count: 1,
                    });
                }
            }
        }
        summary
    }

    pub fn collect_predictions(&self) -> Vec<PredictionRow> {
        self.records
            .iter()
            .filter_map(|r| r.predictions.as_ref().map(|p| (r, p)))
            .flat_map(|(r, predictions)| {
                let params = r.candidate.values();
                predictions.iter().map(move |p| PredictionRow {
                    resample_id: r.resample_id.clone(),
                    iteration: r.iteration,
                    config: r.config.clone(),
                    params: params.clone(),
                    row: p.row,
                    truth: p.truth,
                    estimate: p.estimate,
                })
            })
            .collect()
    }

    pub fn metric_info(&self, metric: &str) -> TuneResult<&MetricInfo> {
        self.metrics
            .iter()
            .find(|m| m.name == metric)
            .ok_or_else(|| TuneError::MetricNotFound {
                metric: metric.to_string(),
            })
    }

    /// Top `n` candidates for `metric`, best first. Ties keep candidate
    /// creation order; candidates with no finite estimate are left out.
    pub fn show_best(&self, metric: &str, n: usize) -> TuneResult<Vec<AggregatedMetric>> {
        let info = self.metric_info(metric)?;
        let mut rows: Vec<AggregatedMetric> = self
            .collect_metrics()
            .into_iter()
            .filter(|m| m.metric == metric && m.mean.is_some())
            .collect();
        rows.sort_by(|a, b| compare_means(info, a, b));
        rows.truncate(n);
        Ok(rows)
    }

    pub fn select_best(&self, metric: &str) -> TuneResult<Candidate> {
        self.show_best(metric, 1)?
            .into_iter()
            .next()
            .map(|m| m.candidate)
            .ok_or_else(|| TuneError::Validation(format!("no finite estimates of {metric}")))
    }

    /// Simplest candidate whose mean is within one standard error of the
    /// best. `simpler` orders candidates from simplest to most complex.
    pub fn select_by_one_std_err<F>(&self, metric: &str, mut simpler: F) -> TuneResult<Candidate>
    where
        F: FnMut(&Candidate, &Candidate) -> Ordering,
    {
        let info = self.metric_info(metric)?.clone();
        let mut rows = self.show_best(metric, usize::MAX)?;
        let best = rows
            .first()
            .cloned()
            .ok_or_else(|| TuneError::Validation(format!("no finite estimates of {metric}")))?;
        let best_mean = best.mean.unwrap_or(f64::NAN);
        let bound = best.std_err.unwrap_or(0.0);

        rows.retain(|m| {
            let mean = m.mean.unwrap_or(f64::NAN);
            match info.direction {
                tw_types::Direction::Maximize => mean >= best_mean - bound,
                tw_types::Direction::Minimize => mean <= best_mean + bound,
            }
        });
        rows.sort_by(|a, b| simpler(&a.candidate, &b.candidate));
        Ok(rows.into_iter().next().map(|m| m.candidate).unwrap_or(best.candidate))
    }

    pub fn to_json(&self) -> TuneResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn compare_means(info: &MetricInfo, a: &AggregatedMetric, b: &AggregatedMetric) -> Ordering {
    let a = info.direction.orient(a.mean.unwrap_or(f64::NAN));
    let b = info.direction.orient(b.mean.unwrap_or(f64::NAN));
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}
