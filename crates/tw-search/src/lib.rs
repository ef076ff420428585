//! # tw-search
//!
//! Sequential (Bayesian) hyperparameter search for Tunewise.
//!
//! Provides search space definitions, a Gaussian-process surrogate,
//! acquisition functions, pluggable proposal strategies and the controller
//! that drives the evaluation engine round by round.

pub mod acquisition;
pub mod controller;
pub mod proposer;
pub mod space;
pub mod status;
pub mod surrogate;

pub use acquisition::{expected_improvement, norm_cdf, norm_pdf, Acquisition};
pub use controller::{
    tune_bayes, ControlSearch, Initial, SearchError, SearchPhase, SearchResults, SequentialSearch,
    StopReason,
};
pub use proposer::{GaussianProcessProposer, History, Observation, ProposalMode, Proposer};
pub use space::{ParameterDef, ParameterKind, Role, SearchSpace};
pub use status::{IterationBest, SearchId, SearchState, SearchStatus};
pub use surrogate::GaussianProcess;
