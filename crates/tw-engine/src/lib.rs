//! Tunewise evaluation engine.
//!
//! Fits every candidate on every resample with per-fit fault isolation,
//! groups candidates that share preprocessing, and summarizes the metric
//! estimates per candidate.

pub mod aggregate;
pub mod backend;
pub mod control;
pub mod execution;
pub mod fit;
pub mod metrics;
pub mod results;

pub use aggregate::{aggregate, mean_and_std_err, regroup};
pub use backend::{Diagnostics, ExtractFn, IdentityPreprocessor, ModelBackend, Preprocessor, Workflow};
pub use control::{ControlGrid, ParallelOver};
pub use execution::{run, run_subset, tune_grid, RunOutput};
pub use fit::{evaluate, evaluate_group, ResampleRef};
pub use metrics::{Mae, Metric, MetricInfo, MetricSet, Rmse, Rsq};
pub use results::{
    CandidateMetric, ExtractEntry, NoteEntry, NoteRow, NoteSummary, PredictionEntry, PredictionRow,
    ResampleMetric, ResampleResult, TuneResults,
};
