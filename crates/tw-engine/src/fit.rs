//! Fit-eval unit.
//!
//! Evaluates the candidates of one preprocessing group on one resample:
//! preprocessing is fitted once for the group, then every member goes through
//! model fit, prediction, metrics and the optional extract. Every failure is
//! captured as a note on the record; nothing escapes this module as an error
//! or a panic.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tw_types::{
    CandidateEntry, CandidateSet, Dataset, FitError, FitRecord, FitStatus, MetricRow, Note,
    ParamMap, Prediction, PreprocessingGroup, Processed, Resample, Stage,
};

use crate::backend::{Diagnostics, ModelBackend, Preprocessor, Workflow};
use crate::control::ControlGrid;

/// A resample together with its position in the run.
#[derive(Debug, Clone, Copy)]
pub struct ResampleRef<'a> {
    pub index: usize,
    pub resample: &'a Resample,
}

/// Preprocessing fitted on the training rows and applied to both views.
struct Prepared<F> {
    fitted: F,
    train: Processed,
    validation: Processed,
    /// Warnings raised while preprocessing; copied to every member's record.
    notes: Vec<Note>,
}

/// Evaluate a single candidate on a single resample.
pub fn evaluate<P, M>(
    data: &Dataset,
    resample: ResampleRef<'_>,
    position: usize,
    entry: &CandidateEntry,
    workflow: &Workflow<P, M>,
    control: &ControlGrid,
) -> FitRecord
where
    P: Preprocessor,
    M: ModelBackend,
{
    match prepare(data, resample, &entry.candidate.preprocessing, workflow, control) {
        Ok(prepared) => evaluate_member(data, resample, position, entry, &prepared, workflow, control),
        Err(notes) => preprocessing_failure(resample, position, entry, notes),
    }
}

/// Evaluate every member of a preprocessing group on one resample.
///
/// Preprocessing is fitted exactly once. When it fails, every member gets a
/// failed record carrying the same notes and no model is fitted.
pub fn evaluate_group<P, M>(
    data: &Dataset,
    resample: ResampleRef<'_>,
    group: &PreprocessingGroup,
    candidates: &CandidateSet,
    workflow: &Workflow<P, M>,
    control: &ControlGrid,
) -> Vec<FitRecord>
where
    P: Preprocessor,
    M: ModelBackend,
{
    let members: Vec<(usize, &CandidateEntry)> = group
        .members
        .iter()
        .filter_map(|&p| candidates.get(p).map(|e| (p, e)))
        .collect();

    debug!(
        resample = %resample.resample.id,
        members = members.len(),
        "evaluating preprocessing group"
    );

    match prepare(data, resample, &group.preprocessing, workflow, control) {
        Ok(prepared) => members
            .into_iter()
            .map(|(position, entry)| {
                evaluate_member(data, resample, position, entry, &prepared, workflow, control)
            })
            .collect(),
        Err(notes) => members
            .into_iter()
            .map(|(position, entry)| preprocessing_failure(resample, position, entry, notes.clone()))
            .collect(),
    }
}

fn prepare<P, M>(
    data: &Dataset,
    resample: ResampleRef<'_>,
    params: &ParamMap,
    workflow: &Workflow<P, M>,
    control: &ControlGrid,
) -> Result<Prepared<P::Fitted>, Vec<Note>>
where
    P: Preprocessor,
    M: ModelBackend,
{
    let train_view = data.view(&resample.resample.train);
    let validation_view = data.view(&resample.resample.validation);
    let mut diagnostics = Diagnostics::new(Stage::Preprocessing);

    let outcome = guarded(Stage::Preprocessing, control.fit_timeout(), || {
        let fitted = workflow.preprocessor.fit(&train_view, params, &mut diagnostics)?;
        let train = workflow.preprocessor.bake(&fitted, &train_view, &mut diagnostics)?;
        let validation = workflow
            .preprocessor
            .bake(&fitted, &validation_view, &mut diagnostics)?;
        Ok((fitted, train, validation))
    });

    let mut notes = diagnostics.take();
    match outcome {
        Ok((fitted, train, validation)) => Ok(Prepared {
            fitted,
            train,
            validation,
            notes,
        }),
        Err(e) => {
            warn!(
                resample = %resample.resample.id,
                error = %e,
                "preprocessing failed; skipping every model in the group"
            );
            notes.push(Note::error(Stage::Preprocessing, e.to_string()));
            Err(notes)
        }
    }
}

fn evaluate_member<P, M>(
    data: &Dataset,
    resample: ResampleRef<'_>,
    position: usize,
    entry: &CandidateEntry,
    prepared: &Prepared<P::Fitted>,
    workflow: &Workflow<P, M>,
    control: &ControlGrid,
) -> FitRecord
where
    P: Preprocessor,
    M: ModelBackend,
{
    let mut record = blank_record(resample, position, entry);
    record.notes = prepared.notes.clone();
    let limit = control.fit_timeout();
    let mut diagnostics = Diagnostics::new(Stage::Model);

    let fitted = guarded(Stage::Model, limit, || {
        workflow
            .model
            .fit(&prepared.train, &entry.candidate.model, &mut diagnostics)
    });
    record.notes.extend(diagnostics.take());
    let fitted = match fitted {
        Ok(fitted) => fitted,
        Err(e) => return fail(record, Stage::Model, e),
    };

    diagnostics.set_stage(Stage::Prediction);
    let estimates = guarded(Stage::Prediction, limit, || {
        let estimates = workflow
            .model
            .predict(&fitted, &prepared.validation, &mut diagnostics)?;
        if estimates.len() != prepared.validation.len() {
            return Err(FitError::prediction(format!(
                "backend returned {} predictions for {} validation rows",
                estimates.len(),
                prepared.validation.len()
            )));
        }
        Ok(estimates)
    });
    record.notes.extend(diagnostics.take());
    let estimates = match estimates {
        Ok(estimates) => estimates,
        Err(e) => return fail(record, Stage::Prediction, e),
    };

    let truth: Vec<f64> = prepared
        .validation
        .rows
        .iter()
        .map(|&row| data.outcome[row])
        .collect();

    let mut failed_metrics = 0;
    for metric in workflow.metrics.iter() {
        let estimate = match guarded(Stage::Metric, limit, || metric.compute(&truth, &estimates)) {
            Ok(value) => value,
            Err(e) => {
                failed_metrics += 1;
                record.notes.push(Note::error(Stage::Metric, e.to_string()));
                f64::NAN
            }
        };
        record.metrics.push(MetricRow {
            metric: metric.name().to_string(),
            estimator: metric.estimator().to_string(),
            estimate,
        });
    }
    if failed_metrics > 0 && failed_metrics == workflow.metrics.len() {
        record.status = FitStatus::Failed {
            stage: Stage::Metric,
        };
    }

    if control.save_pred {
        record.predictions = Some(
            prepared
                .validation
                .rows
                .iter()
                .zip(truth.iter().zip(&estimates))
                .map(|(&row, (&truth, &estimate))| Prediction {
                    row,
                    truth,
                    estimate,
                })
                .collect(),
        );
    }

    if let Some(extract) = &workflow.extract {
        let values = entry.candidate.values();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            extract(&prepared.fitted, &fitted, &values)
        }));
        match outcome {
            Ok(Ok(value)) => record.extract = Some(value),
            Ok(Err(e)) => record
                .notes
                .push(Note::warning(Stage::Extract, format!("extract failed: {e:#}"))),
            Err(payload) => record.notes.push(Note::warning(
                Stage::Extract,
                format!("extract panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }

    if control.verbose {
        info!(resample = %resample.resample.id, config = %entry.config, "fit complete");
    } else {
        debug!(resample = %resample.resample.id, config = %entry.config, "fit complete");
    }

    record
}

fn blank_record(resample: ResampleRef<'_>, position: usize, entry: &CandidateEntry) -> FitRecord {
    FitRecord {
        resample_id: resample.resample.id.clone(),
        resample_index: resample.index,
        candidate_index: position,
        candidate: entry.candidate.clone(),
        config: entry.config.clone(),
        iteration: entry.iteration,
        status: FitStatus::Succeeded,
        metrics: Vec::new(),
        predictions: None,
        extract: None,
        notes: Vec::new(),
    }
}

fn preprocessing_failure(
    resample: ResampleRef<'_>,
    position: usize,
    entry: &CandidateEntry,
    notes: Vec<Note>,
) -> FitRecord {
    let mut record = blank_record(resample, position, entry);
    record.status = FitStatus::Failed {
        stage: Stage::Preprocessing,
    };
    record.notes = notes;
    record
}

fn fail(mut record: FitRecord, stage: Stage, error: FitError) -> FitRecord {
    warn!(
        resample = %record.resample_id,
        config = %record.config,
        stage = %stage,
        error = %error,
        "fit failed"
    );
    record.status = FitStatus::Failed { stage };
    record.notes.push(Note::error(stage, error.to_string()));
    record
}

/// Run one stage with panic capture and the optional wall-clock limit.
fn guarded<T>(
    stage: Stage,
    limit: Option<Duration>,
    body: impl FnOnce() -> Result<T, FitError>,
) -> Result<T, FitError> {
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        Err(FitError::Panicked {
            stage,
            message: panic_message(payload.as_ref()),
        })
    });

    match limit {
        Some(limit) if started.elapsed() > limit => Err(FitError::Timeout {
            stage,
            elapsed_ms: started.elapsed().as_millis(),
            limit_ms: limit.as_millis(),
        }),
        _ => outcome,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::IdentityPreprocessor;
    use crate::metrics::{MetricSet, Rmse, Rsq};
    use tw_types::{Candidate, ParameterValue, Severity};

    /// Predicts `slope * x`; fails when `slope` is negative, warns when zero.
    struct Scaled;

    impl ModelBackend for Scaled {
        type Fitted = f64;

        fn fit(
            &self,
            _train: &Processed,
            params: &ParamMap,
            diagnostics: &mut Diagnostics,
        ) -> Result<f64, FitError> {
            let slope = params.get("slope").and_then(|v| v.as_f64()).unwrap_or(1.0);
            if slope < 0.0 {
                return Err(FitError::model_fit("negative slope"));
            }
            if slope == 0.0 {
                diagnostics.warn("slope of zero gives a constant model");
            }
            Ok(slope)
        }

        fn predict(
            &self,
            fitted: &f64,
            data: &Processed,
            _diagnostics: &mut Diagnostics,
        ) -> Result<Vec<f64>, FitError> {
            if *fitted > 100.0 {
                panic!("slope overflow");
            }
            Ok(data.features.iter().map(|row| row[0] * fitted).collect())
        }
    }

    fn setup() -> (Dataset, Resample) {
        let data = Dataset::new(
            vec!["x".into()],
            (0..6).map(|i| vec![i as f64]).collect(),
            (0..6).map(|i| 2.0 * i as f64).collect(),
        )
        .unwrap();
        let resample = Resample::new("Fold1", vec![0, 1, 2], vec![3, 4, 5]);
        (data, resample)
    }

    fn entry(slope: f64) -> CandidateEntry {
        CandidateEntry {
            candidate: Candidate::default().with_model("slope", slope),
            config: "Preprocessor1_Model1".into(),
            iteration: 0,
        }
    }

    /// `Scaled` that counts model fits.
    #[derive(Default)]
    struct Counted {
        fits: std::sync::Arc<parking_lot::Mutex<usize>>,
    }

    impl ModelBackend for Counted {
        type Fitted = f64;

        fn fit(&self, train: &Processed, params: &ParamMap, d: &mut Diagnostics) -> Result<f64, FitError> {
            *self.fits.lock() += 1;
            Scaled.fit(train, params, d)
        }

        fn predict(&self, fitted: &f64, data: &Processed, d: &mut Diagnostics) -> Result<Vec<f64>, FitError> {
            Scaled.predict(fitted, data, d)
        }
    }

    #[test]
    fn successful_fit_records_every_metric() {
        let (data, resample) = setup();
        let workflow = Workflow::model_only(Scaled, MetricSet::new().with(Rmse).with(Rsq));
        let control = ControlGrid::default().with_save_pred(true);
        let r = ResampleRef {
            index: 0,
            resample: &resample,
        };

        let record = evaluate(&data, r, 0, &entry(2.0), &workflow, &control);
        assert!(record.succeeded());
        assert_eq!(record.metrics.len(), 2);
        assert_eq!(record.metrics[0].estimate, 0.0);
        let predictions = record.predictions.unwrap();
        assert_eq!(predictions.len(), 3);
        assert_eq!(predictions[0].row, 3);
        assert_eq!(predictions[0].truth, 6.0);
    }

    #[test]
    fn model_failure_is_captured() {
        let (data, resample) = setup();
        let workflow = Workflow::model_only(Scaled, MetricSet::new().with(Rmse));
        let r = ResampleRef {
            index: 0,
            resample: &resample,
        };

        let record = evaluate(&data, r, 0, &entry(-1.0), &workflow, &ControlGrid::default());
        assert_eq!(record.failed_stage(), Some(Stage::Model));
        assert!(record.metrics.is_empty());
        assert_eq!(record.notes.len(), 1);
        assert_eq!(record.notes[0].severity, Severity::Error);
    }

    #[test]
    fn panic_in_predict_becomes_a_note() {
        let (data, resample) = setup();
        let workflow = Workflow::model_only(Scaled, MetricSet::new().with(Rmse));
        let r = ResampleRef {
            index: 0,
            resample: &resample,
        };

        let record = evaluate(&data, r, 0, &entry(500.0), &workflow, &ControlGrid::default());
        assert_eq!(record.failed_stage(), Some(Stage::Prediction));
        assert!(record.notes[0].message.contains("slope overflow"));
    }

    #[test]
    fn warnings_do_not_stop_the_pipeline() {
        let (data, resample) = setup();
        let workflow = Workflow::model_only(Scaled, MetricSet::new().with(Rmse).with(Rsq));
        let r = ResampleRef {
            index: 0,
            resample: &resample,
        };

        let record = evaluate(&data, r, 0, &entry(0.0), &workflow, &ControlGrid::default());
        // rsq fails on a constant prediction but rmse still succeeds
        assert!(record.succeeded());
        assert_eq!(record.metrics.len(), 2);
        assert!(record.metrics[1].estimate.is_nan());
        assert_eq!(record.notes[0].severity, Severity::Warning);
        assert_eq!(record.notes[0].stage, Stage::Model);
        assert_eq!(record.notes[1].stage, Stage::Metric);
    }

    #[test]
    fn extract_failure_is_a_warning() {
        let (data, resample) = setup();
        let workflow = Workflow::model_only(Scaled, MetricSet::new().with(Rmse))
            .with_extract(|_, slope: &f64, _| {
                if *slope > 1.0 {
                    anyhow::bail!("too steep to export")
                }
                Ok(serde_json::json!({ "slope": slope }))
            });
        let r = ResampleRef {
            index: 0,
            resample: &resample,
        };

        let ok = evaluate(&data, r, 0, &entry(1.0), &workflow, &ControlGrid::default());
        assert_eq!(ok.extract, Some(serde_json::json!({ "slope": 1.0 })));

        let warned = evaluate(&data, r, 0, &entry(2.0), &workflow, &ControlGrid::default());
        assert!(warned.succeeded());
        assert!(warned.extract.is_none());
        assert_eq!(warned.notes[0].stage, Stage::Extract);
        assert_eq!(warned.notes[0].severity, Severity::Warning);
    }

    #[test]
    fn preprocessing_failure_is_shared_by_the_group() {
        let (data, resample) = setup();
        let model = Counted::default();
        let fits = model.fits.clone();
        let workflow = Workflow::new(IdentityPreprocessor, model, MetricSet::new().with(Rmse));
        let grid = CandidateSet::from_grid(vec![
            Candidate::default()
                .with_preprocessing("degree", ParameterValue::Int(2))
                .with_model("slope", 1.0),
            Candidate::default()
                .with_preprocessing("degree", ParameterValue::Int(2))
                .with_model("slope", 2.0),
        ]);
        let groups = grid.preprocessing_groups(0..grid.len());
        assert_eq!(groups.len(), 1);

        let r = ResampleRef {
            index: 0,
            resample: &resample,
        };
        let records = evaluate_group(&data, r, &groups[0], &grid, &workflow, &ControlGrid::default());
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.failed_stage(), Some(Stage::Preprocessing));
            assert_eq!(record.notes, records[0].notes);
        }
        assert_eq!(*fits.lock(), 0);
    }

    #[test]
    fn slow_stage_times_out() {
        let outcome: Result<(), FitError> = guarded(Stage::Model, Some(Duration::from_millis(1)), || {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        });
        assert!(matches!(
            outcome,
            Err(FitError::Timeout {
                stage: Stage::Model,
                ..
            })
        ));
    }
}
