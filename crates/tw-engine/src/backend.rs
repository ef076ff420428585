//! Backend capability interfaces.
//!
//! The engine drives preprocessing and model fitting only through the
//! [`Preprocessor`] and [`ModelBackend`] traits; it never looks inside the
//! fitted artifacts. A [`Workflow`] bundles one of each with the metric set and
//! an optional extract function.

use std::sync::Arc;

use tw_types::{DataView, FitError, Note, ParamMap, Processed, Stage};

use crate::metrics::MetricSet;

/// Sink for non-fatal diagnostics raised by a backend while it works.
///
/// Anything pushed here becomes a `severity=warning` note on the fit record
/// of the stage that was running. Fatal conditions are signalled by
/// returning an error instead.
#[derive(Debug)]
pub struct Diagnostics {
    stage: Stage,
    notes: Vec<Note>,
}

impl Diagnostics {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            notes: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.notes.push(Note::warning(self.stage, message));
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub(crate) fn take(&mut self) -> Vec<Note> {
        std::mem::take(&mut self.notes)
    }
}

/// Preprocessing capability: learn a transformation on training rows, then
/// apply it to any rows.
pub trait Preprocessor: Send + Sync {
    type Fitted: Send + Sync;

    fn fit(
        &self,
        train: &DataView<'_>,
        params: &ParamMap,
        diagnostics: &mut Diagnostics,
    ) -> Result<Self::Fitted, FitError>;

    fn bake(
        &self,
        fitted: &Self::Fitted,
        data: &DataView<'_>,
        diagnostics: &mut Diagnostics,
    ) -> Result<Processed, FitError>;
}

/// Model capability: fit on preprocessed training data, predict on
/// preprocessed validation data.
pub trait ModelBackend: Send + Sync {
    type Fitted: Send + Sync;

    fn fit(
        &self,
        train: &Processed,
        params: &ParamMap,
        diagnostics: &mut Diagnostics,
    ) -> Result<Self::Fitted, FitError>;

    fn predict(
        &self,
        fitted: &Self::Fitted,
        data: &Processed,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<f64>, FitError>;
}

/// Passes rows through unchanged. Accepts no parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPreprocessor;

impl Preprocessor for IdentityPreprocessor {
    type Fitted = ();

    fn fit(
        &self,
        _train: &DataView<'_>,
        params: &ParamMap,
        _diagnostics: &mut Diagnostics,
    ) -> Result<(), FitError> {
        match params.keys().next() {
            Some(name) => Err(FitError::preprocessing(format!(
                "identity preprocessor has no parameter '{name}'"
            ))),
            None => Ok(()),
        }
    }

    fn bake(
        &self,
        _fitted: &(),
        data: &DataView<'_>,
        _diagnostics: &mut Diagnostics,
    ) -> Result<Processed, FitError> {
        Ok(Processed::from_view(data))
    }
}

/// User function capturing a derived artifact from each successful fit. It
/// receives the fitted preprocessor, the fitted model and the candidate's
/// parameter values.
pub type ExtractFn<PF, MF> =
    Arc<dyn Fn(&PF, &MF, &ParamMap) -> anyhow::Result<serde_json::Value> + Send + Sync>;

/// Everything needed to fit and score one candidate.
pub struct Workflow<P: Preprocessor, M: ModelBackend> {
    pub preprocessor: P,
    pub model: M,
    pub metrics: MetricSet,
    pub extract: Option<ExtractFn<P::Fitted, M::Fitted>>,
}

impl<P: Preprocessor, M: ModelBackend> Workflow<P, M> {
    pub fn new(preprocessor: P, model: M, metrics: MetricSet) -> Self {
        Self {
            preprocessor,
            model,
            metrics,
            extract: None,
        }
    }

    pub fn with_extract<F>(mut self, extract: F) -> Self
    where
        F: Fn(&P::Fitted, &M::Fitted, &ParamMap) -> anyhow::Result<serde_json::Value>
            + Send
            + Sync
            + 'static,
    {
        self.extract = Some(Arc::new(extract));
        self
    }
}

impl<M: ModelBackend> Workflow<IdentityPreprocessor, M> {
    /// Model-only workflow: no preprocessing parameters.
    pub fn model_only(model: M, metrics: MetricSet) -> Self {
        Self::new(IdentityPreprocessor, model, metrics)
    }
}
